//! Document to plan.
//!
//! The walk is schema-free: documents are parsed at the AST level and field
//! types are never resolved. Connection detection therefore leans on three
//! signals: the `@connection` directive, the configuration map, and the
//! `edges` + `pageInfo` selection shape.

use std::sync::Arc;

use apollo_compiler::ast;
use indexmap::IndexMap;
use indexmap::IndexSet;
use itertools::Itertools;
use serde_json::Number;
use serde_json::Value;

use crate::config::ConnectionMode;
use crate::config::ConnectionSpec;
use crate::error::CacheError;
use crate::plan::args::stable_json;
use crate::plan::args::ArgSpec;
use crate::plan::fnv1a_32;
use crate::plan::OperationKind;
use crate::plan::Plan;
use crate::plan::PlanField;
use crate::plan::VarMask;

#[derive(Clone, Default)]
pub struct PlanOptions {
    /// Parent typename to field name to connection spec.
    pub connections: IndexMap<String, IndexMap<String, ConnectionSpec>>,
    pub window_args: IndexSet<String>,
    /// Compile the named fragment instead of an operation.
    pub fragment_name: Option<String>,
    /// Select a specific operation from a multi-operation document.
    pub operation_name: Option<String>,
}

pub fn compile(source: &str, options: &PlanOptions) -> Result<Plan, CacheError> {
    let document = ast::Document::parse(source.to_owned(), "operation.graphql")
        .map_err(|invalid| CacheError::plan(invalid.errors.to_string()))?;

    let mut fragments: IndexMap<&str, &ast::FragmentDefinition> = IndexMap::new();
    for definition in &document.definitions {
        if let ast::Definition::FragmentDefinition(fragment) = definition {
            fragments.insert(fragment.name.as_str(), fragment);
        }
    }

    let mut compiler = Compiler {
        options,
        fragments,
        next_sel_id: 0,
    };

    let (operation, root_typename, drafts, variables) = match &options.fragment_name {
        Some(name) => {
            // An empty name selects the document's sole fragment.
            let fragment = if name.is_empty() {
                compiler
                    .fragments
                    .values()
                    .copied()
                    .exactly_one()
                    .map_err(|_| {
                        CacheError::plan("fragment name required unless the document has exactly one fragment")
                    })?
            } else {
                compiler
                    .fragments
                    .get(name.as_str())
                    .copied()
                    .ok_or_else(|| CacheError::plan(format!("unknown fragment {name:?}")))?
            };
            let typename = fragment.type_condition.as_str().to_owned();
            let mut drafts = IndexMap::new();
            compiler.walk(&fragment.selection_set, Some(&typename), None, &mut drafts)?;
            (OperationKind::Query, typename, drafts, Vec::new())
        }
        None => {
            let operation = select_operation(&document, options.operation_name.as_deref())?;
            let kind = match operation.operation_type {
                ast::OperationType::Query => OperationKind::Query,
                ast::OperationType::Mutation => OperationKind::Mutation,
                ast::OperationType::Subscription => OperationKind::Subscription,
            };
            let typename = kind.root_typename().to_owned();
            let mut drafts = IndexMap::new();
            compiler.walk(&operation.selection_set, Some(&typename), None, &mut drafts)?;
            let variables = operation
                .variables
                .iter()
                .map(|v| v.name.as_str().to_owned())
                .collect();
            (kind, typename, drafts, variables)
        }
    };

    let root: Vec<Arc<PlanField>> = drafts
        .into_values()
        .map(|draft| compiler.freeze(draft))
        .collect();

    let mut fingerprint = String::new();
    fingerprint.push_str(&operation.to_string());
    write_fingerprint(&root, &mut fingerprint);

    let strict: Vec<String> = variables;
    let canonical = strict
        .iter()
        .filter(|name| !options.window_args.contains(name.as_str()))
        .cloned()
        .collect();

    Ok(Plan {
        operation,
        root_typename,
        id: fnv1a_32(fingerprint.as_bytes()),
        root,
        network_query: document.to_string(),
        var_mask: VarMask { strict, canonical },
        window_args: options.window_args.clone(),
        selection_fingerprint: fingerprint,
    })
}

fn select_operation<'a>(
    document: &'a ast::Document,
    name: Option<&str>,
) -> Result<&'a ast::OperationDefinition, CacheError> {
    let mut operations = document.definitions.iter().filter_map(|def| match def {
        ast::Definition::OperationDefinition(op) => Some(&**op),
        _ => None,
    });
    match name {
        Some(name) => operations
            .find(|op| op.name.as_ref().map(|n| n.as_str()) == Some(name))
            .ok_or_else(|| CacheError::plan(format!("no operation named {name:?}"))),
        None => operations
            .next()
            .ok_or_else(|| CacheError::plan("document contains no operation")),
    }
}

/// The mutable pieces of one field before merging and freezing.
struct FieldDraft {
    response_key: String,
    field_name: String,
    arguments: Vec<(String, ArgSpec)>,
    directive: Option<DirectiveConnection>,
    config: Option<ConnectionSpec>,
    type_condition: Option<String>,
    children: IndexMap<String, FieldDraft>,
}

struct DirectiveConnection {
    key: Option<String>,
    filters: Option<Vec<String>>,
}

struct Compiler<'a> {
    options: &'a PlanOptions,
    fragments: IndexMap<&'a str, &'a ast::FragmentDefinition>,
    next_sel_id: u32,
}

impl Compiler<'_> {
    /// Depth-first walk of one selection set. Fragment spreads and inline
    /// fragments are flattened; their fields carry the nearest narrowing
    /// type condition. Duplicate response keys merge their subselections.
    fn walk(
        &mut self,
        selections: &[ast::Selection],
        parent_type: Option<&str>,
        condition: Option<&str>,
        out: &mut IndexMap<String, FieldDraft>,
    ) -> Result<(), CacheError> {
        for selection in selections {
            match selection {
                ast::Selection::Field(field) => {
                    let response_key = field
                        .alias
                        .as_ref()
                        .unwrap_or(&field.name)
                        .as_str()
                        .to_owned();
                    let mut children = IndexMap::new();
                    // A field boundary resets the typename context: without
                    // a schema the child type is unknown until a fragment
                    // condition names it.
                    self.walk(&field.selection_set, None, None, &mut children)?;

                    let draft = FieldDraft {
                        response_key: response_key.clone(),
                        field_name: field.name.as_str().to_owned(),
                        arguments: field
                            .arguments
                            .iter()
                            .map(|arg| {
                                (arg.name.as_str().to_owned(), arg_spec(&arg.value))
                            })
                            .collect(),
                        directive: connection_directive(field),
                        config: parent_type.and_then(|parent| {
                            self.options
                                .connections
                                .get(parent)
                                .and_then(|fields| fields.get(field.name.as_str()))
                                .cloned()
                        }),
                        type_condition: condition.map(str::to_owned),
                        children,
                    };
                    merge_draft(out, draft);
                }
                ast::Selection::FragmentSpread(spread) => {
                    let fragment = self
                        .fragments
                        .get(spread.fragment_name.as_str())
                        .copied()
                        .ok_or_else(|| {
                            CacheError::plan(format!(
                                "fragment spread {:?} without declared fragment",
                                spread.fragment_name.as_str()
                            ))
                        })?;
                    let narrowed = narrow_condition(parent_type, Some(fragment.type_condition.as_str()));
                    self.walk(
                        &fragment.selection_set,
                        Some(fragment.type_condition.as_str()),
                        narrowed.or(condition),
                        out,
                    )?;
                }
                ast::Selection::InlineFragment(inline) => {
                    let inline_type = inline.type_condition.as_ref().map(|t| t.as_str());
                    let narrowed = narrow_condition(parent_type, inline_type);
                    self.walk(
                        &inline.selection_set,
                        inline_type.or(parent_type),
                        narrowed.or(condition),
                        out,
                    )?;
                }
            }
        }
        Ok(())
    }

    fn freeze(&mut self, draft: FieldDraft) -> Arc<PlanField> {
        let sel_id = self.next_sel_id;
        self.next_sel_id += 1;

        let selection: Vec<Arc<PlanField>> = draft
            .children
            .into_values()
            .map(|child| self.freeze(child))
            .collect();
        let selection_map: IndexMap<String, usize> = selection
            .iter()
            .enumerate()
            .map(|(index, field)| (field.response_key.clone(), index))
            .collect();

        let has_edges = selection.iter().any(|f| f.field_name == "edges");
        let has_page_info = selection.iter().any(|f| f.field_name == "pageInfo");
        let is_connection =
            draft.directive.is_some() || draft.config.is_some() || (has_edges && has_page_info);

        let expected_arg_names: Vec<String> =
            draft.arguments.iter().map(|(name, _)| name.clone()).collect();
        let page_args: Vec<String> = expected_arg_names
            .iter()
            .filter(|name| self.options.window_args.contains(name.as_str()))
            .cloned()
            .collect();

        let (connection_key, directive_filters) = match draft.directive {
            Some(directive) => (directive.key, directive.filters),
            None => (None, None),
        };
        let connection_mode = draft
            .config
            .as_ref()
            .map(|spec| spec.mode)
            .unwrap_or(ConnectionMode::Infinite);
        let connection_filters = directive_filters.or_else(|| {
            draft
                .config
                .as_ref()
                .filter(|spec| !spec.filters.is_empty())
                .map(|spec| spec.filters.clone())
        });

        Arc::new(PlanField {
            response_key: draft.response_key,
            field_name: draft.field_name,
            selection,
            selection_map,
            arguments: draft.arguments,
            expected_arg_names,
            is_connection,
            connection_key,
            connection_filters,
            connection_mode,
            type_condition: draft.type_condition,
            page_args,
            sel_id,
        })
    }
}

/// A condition only narrows when it differs from the statically known
/// parent type; `... on Query` at the root adds nothing.
fn narrow_condition<'a>(
    parent_type: Option<&str>,
    condition: Option<&'a str>,
) -> Option<&'a str> {
    match (parent_type, condition) {
        (Some(parent), Some(condition)) if parent == condition => None,
        (_, condition) => condition,
    }
}

fn merge_draft(out: &mut IndexMap<String, FieldDraft>, draft: FieldDraft) {
    match out.get_mut(&draft.response_key) {
        Some(existing) => {
            for (key, child) in draft.children {
                match existing.children.get_mut(&key) {
                    Some(_) => merge_draft(&mut existing.children, child),
                    None => {
                        existing.children.insert(key, child);
                    }
                }
            }
            if existing.directive.is_none() {
                existing.directive = draft.directive;
            }
            if existing.config.is_none() {
                existing.config = draft.config;
            }
            // A merged duplicate seen outside any fragment clears the
            // narrowing condition.
            if draft.type_condition.is_none() {
                existing.type_condition = None;
            }
        }
        None => {
            out.insert(draft.response_key.clone(), draft);
        }
    }
}

fn connection_directive(field: &ast::Field) -> Option<DirectiveConnection> {
    let directive = field.directives.get("connection")?;
    let mut key = None;
    let mut filters = None;
    for argument in &directive.arguments {
        match argument.name.as_str() {
            "key" => {
                if let ast::Value::String(value) = &*argument.value {
                    key = Some(value.clone());
                }
            }
            "filters" => {
                if let ast::Value::List(items) = &*argument.value {
                    filters = Some(
                        items
                            .iter()
                            .filter_map(|item| match &**item {
                                ast::Value::String(value) => Some(value.clone()),
                                _ => None,
                            })
                            .collect(),
                    );
                }
            }
            _ => {}
        }
    }
    Some(DirectiveConnection { key, filters })
}

fn arg_spec(value: &ast::Value) -> ArgSpec {
    match value {
        ast::Value::Variable(name) => ArgSpec::Var(name.as_str().to_owned()),
        ast::Value::Null => ArgSpec::Const(Value::Null),
        ast::Value::Boolean(value) => ArgSpec::Const(Value::Bool(*value)),
        ast::Value::Enum(name) => ArgSpec::Const(Value::String(name.as_str().to_owned())),
        ast::Value::String(value) => ArgSpec::Const(Value::String(value.clone())),
        ast::Value::Int(value) => {
            let number = value
                .try_to_i32()
                .ok()
                .map(Number::from)
                .or_else(|| value.try_to_f64().ok().and_then(Number::from_f64));
            ArgSpec::Const(number.map(Value::Number).unwrap_or(Value::Null))
        }
        ast::Value::Float(value) => {
            let number = value.try_to_f64().ok().and_then(Number::from_f64);
            ArgSpec::Const(number.map(Value::Number).unwrap_or(Value::Null))
        }
        ast::Value::List(items) => {
            ArgSpec::Array(items.iter().map(|item| arg_spec(item)).collect())
        }
        ast::Value::Object(fields) => ArgSpec::Object(
            fields
                .iter()
                .map(|(name, value)| (name.as_str().to_owned(), arg_spec(value)))
                .collect(),
        ),
    }
}

/// A compact, deterministic description of the selection shape. The plan id
/// is the 32-bit hash of this text.
fn write_fingerprint(fields: &[Arc<PlanField>], out: &mut String) {
    out.push('{');
    for (i, field) in fields.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        out.push_str(&field.response_key);
        if field.response_key != field.field_name {
            out.push(':');
            out.push_str(&field.field_name);
        }
        if !field.arguments.is_empty() {
            out.push('(');
            for (j, (name, spec)) in field.arguments.iter().enumerate() {
                if j > 0 {
                    out.push(',');
                }
                out.push_str(name);
                out.push(':');
                describe_arg(spec, out);
            }
            out.push(')');
        }
        if let Some(condition) = &field.type_condition {
            out.push_str("/on:");
            out.push_str(condition);
        }
        if field.is_connection {
            out.push_str("/conn:");
            out.push_str(field.connection_key.as_deref().unwrap_or(&field.field_name));
            out.push(':');
            out.push_str(&field.connection_mode.to_string());
        }
        if !field.selection.is_empty() {
            write_fingerprint(&field.selection, out);
        }
    }
    out.push('}');
}

fn describe_arg(spec: &ArgSpec, out: &mut String) {
    match spec {
        ArgSpec::Var(name) => {
            out.push('$');
            out.push_str(name);
        }
        ArgSpec::Const(value) => out.push_str(&stable_json(value)),
        ArgSpec::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                describe_arg(item, out);
            }
            out.push(']');
        }
        ArgSpec::Object(entries) => {
            out.push('{');
            for (i, (name, value)) in entries.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(name);
                out.push(':');
                describe_arg(value, out);
            }
            out.push('}');
        }
    }
}
