//! The document planner.
//!
//! A document is compiled once into a [`Plan`]: precomputed selection trees,
//! argument builders, stable field keys, variable masks, dependency sets,
//! and a stable identity. Plans are value-typed and side-effect free; two
//! plans compiled from the same document are structurally equal and share
//! the same id.

pub(crate) mod args;
pub(crate) mod compile;
pub(crate) mod keys;

use std::sync::Arc;

use indexmap::IndexMap;
use indexmap::IndexSet;
use serde_json::Value;

pub use args::ArgSpec;
pub use args::Variables;
pub use compile::compile;
pub use compile::PlanOptions;

use crate::config::ConnectionMode;
use crate::graph::ROOT_ID;

/// FNV-1a, 32-bit. Stable across processes, cheap, and good enough for a
/// selection-shape fingerprint.
pub(crate) fn fnv1a_32(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in bytes {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum OperationKind {
    #[strum(to_string = "query")]
    Query,
    #[strum(to_string = "mutation")]
    Mutation,
    #[strum(to_string = "subscription")]
    Subscription,
}

impl OperationKind {
    pub fn root_typename(&self) -> &'static str {
        match self {
            Self::Query => "Query",
            Self::Mutation => "Mutation",
            Self::Subscription => "Subscription",
        }
    }
}

/// Which variables participate in a key: all of them, or everything minus
/// the paging window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum MaskMode {
    #[strum(to_string = "strict")]
    Strict,
    #[strum(to_string = "canonical")]
    Canonical,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct VarMask {
    /// Every declared variable, in declared order.
    pub strict: Vec<String>,
    /// Declared variables minus the window arguments, in declared order.
    pub canonical: Vec<String>,
}

impl VarMask {
    pub fn names(&self, mode: MaskMode) -> &[String] {
        match mode {
            MaskMode::Strict => &self.strict,
            MaskMode::Canonical => &self.canonical,
        }
    }
}

/// How one write classifies against a connection: the anchor page, a page
/// after a cursor, or a page before one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageHint {
    Leader,
    After(String),
    Before(String),
}

impl PageHint {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            Self::Leader => "leader",
            Self::After(_) => "after",
            Self::Before(_) => "before",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlanField {
    pub response_key: String,
    pub field_name: String,
    pub selection: Vec<Arc<PlanField>>,
    /// Response key to index into `selection`.
    pub selection_map: IndexMap<String, usize>,
    /// Declared arguments, in declared order.
    pub arguments: Vec<(String, ArgSpec)>,
    pub expected_arg_names: Vec<String>,
    pub is_connection: bool,
    pub connection_key: Option<String>,
    /// Explicit identity filters. `None` means every non-window argument.
    pub connection_filters: Option<Vec<String>>,
    pub connection_mode: ConnectionMode,
    /// The nearest enclosing fragment type condition, when it narrows.
    pub type_condition: Option<String>,
    /// Declared argument names that are paging windows.
    pub page_args: Vec<String>,
    pub sel_id: u32,
}

impl PlanField {
    pub fn build_args(&self, vars: &Variables) -> Variables {
        args::evaluate_args(&self.arguments, vars)
    }

    pub fn stringify_args(&self, vars: &Variables) -> String {
        args::stable_object_json(&self.build_args(vars))
    }

    pub fn field_key(&self, vars: &Variables) -> String {
        keys::field_key(&self.field_name, &self.stringify_args(vars))
    }

    /// The field key with window arguments elided; used by canonical-mode
    /// dependency keys.
    pub fn field_key_masked(
        &self,
        vars: &Variables,
        mode: MaskMode,
        window_args: &IndexSet<String>,
    ) -> String {
        match mode {
            MaskMode::Strict => self.field_key(vars),
            MaskMode::Canonical => {
                let mut built = self.build_args(vars);
                built.retain(|name, _| !window_args.contains(name));
                keys::field_key(&self.field_name, &args::stable_object_json(&built))
            }
        }
    }

    pub fn sub_field(&self, response_key: &str) -> Option<&Arc<PlanField>> {
        self.selection_map
            .get(response_key)
            .map(|index| &self.selection[*index])
    }

    pub fn sub_field_by_name(&self, field_name: &str) -> Option<&Arc<PlanField>> {
        self.selection.iter().find(|f| f.field_name == field_name)
    }

    /// The arguments that identify the canonical connection this field
    /// belongs to: the declared filters, or every non-window argument.
    pub fn identity_args(&self, vars: &Variables, window_args: &IndexSet<String>) -> Variables {
        let mut built = self.build_args(vars);
        match &self.connection_filters {
            Some(filters) => built.retain(|name, _| filters.iter().any(|f| f == name)),
            None => built.retain(|name, _| !window_args.contains(name)),
        }
        built
    }

    pub fn canonical_key(
        &self,
        parent_id: &str,
        vars: &Variables,
        window_args: &IndexSet<String>,
    ) -> String {
        let key = self.connection_key.as_deref().unwrap_or(&self.field_name);
        keys::canonical_key(parent_id, key, &self.identity_args(vars, window_args))
    }

    /// Classifies a fetch by its paging cursors. A null or absent cursor
    /// means the page anchors the connection.
    pub fn page_hint(&self, vars: &Variables) -> PageHint {
        let built = self.build_args(vars);
        if let Some(Value::String(cursor)) = built.get("after") {
            return PageHint::After(cursor.clone());
        }
        if let Some(Value::String(cursor)) = built.get("before") {
            return PageHint::Before(cursor.clone());
        }
        PageHint::Leader
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Plan {
    pub operation: OperationKind,
    pub root_typename: String,
    pub root: Vec<Arc<PlanField>>,
    /// Canonical printed text, for the transport.
    pub network_query: String,
    /// 32-bit stable fingerprint over the selection shape.
    pub id: u32,
    pub var_mask: VarMask,
    pub window_args: IndexSet<String>,
    /// Human-readable shape, for debugging and structural equality.
    pub selection_fingerprint: String,
}

impl Plan {
    /// Stable JSON over the masked variables. Key order of the input does
    /// not matter.
    pub fn vars_key(&self, mode: MaskMode, vars: &Variables) -> String {
        let mut masked = serde_json::Map::new();
        for name in self.var_mask.names(mode) {
            if let Some(value) = vars.get(name) {
                masked.insert(name.clone(), value.clone());
            }
        }
        args::stable_object_json(&masked)
    }

    /// `"<id>|<mode>|<varsKey>"` — the identity of one call.
    pub fn signature(&self, mode: MaskMode, vars: &Variables) -> String {
        format!("{}|{}|{}", self.id, mode, self.vars_key(mode, vars))
    }

    /// The statically known dependency keys of a call: the root field keys
    /// plus the canonical key of every root connection field. Record ids
    /// touched by an actual read extend this set at watch time.
    pub fn dependencies(&self, mode: MaskMode, vars: &Variables) -> IndexSet<String> {
        let mut deps = IndexSet::new();
        for field in &self.root {
            deps.insert(keys::root_field_dep(&field.field_key_masked(
                vars,
                mode,
                &self.window_args,
            )));
            if field.is_connection {
                deps.insert(field.canonical_key(ROOT_ID, vars, &self.window_args));
            }
        }
        deps
    }
}
