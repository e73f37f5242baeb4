//! Key construction for the graph.
//!
//! Three key families address the normalized state: field keys on a record,
//! concrete page keys for as-fetched connection pages, and canonical
//! connection keys that exclude pagination arguments.

use serde_json::Value;

use crate::graph::ROOT_ID;
use crate::plan::args::stable_object_json;
use crate::plan::args::Variables;

/// `fieldName` when the arguments stringify to nothing, otherwise
/// `fieldName(<stable args>)`.
pub fn field_key(field_name: &str, args_json: &str) -> String {
    if args_json.is_empty() || args_json == "{}" {
        field_name.to_owned()
    } else {
        format!("{field_name}({args_json})")
    }
}

/// `""` for the root, `"<parentId>."` otherwise.
pub fn parent_scope(parent_id: &str) -> String {
    if parent_id == ROOT_ID {
        String::new()
    } else {
        format!("{parent_id}.")
    }
}

/// The as-fetched page record id: `"@." + scope + fieldKey`.
pub fn page_key(parent_id: &str, field_key: &str) -> String {
    format!("@.{}{}", parent_scope(parent_id), field_key)
}

/// The canonical connection record id:
/// `"@connection." + scope + key + "(" + stable identity + ")"`.
pub fn canonical_key(parent_id: &str, connection_key: &str, identity: &Variables) -> String {
    format!(
        "@connection.{}{}({})",
        parent_scope(parent_id),
        connection_key,
        stable_object_json(identity)
    )
}

/// Where an infinite connection keeps its page bookkeeping.
pub fn meta_key(canonical: &str) -> String {
    format!("{canonical}::meta")
}

pub fn page_info_key(parent: &str) -> String {
    format!("{parent}.pageInfo")
}

pub fn edge_key(parent: &str, index: usize) -> String {
    format!("{parent}.edges.{index}")
}

/// The dependency key emitted when a field on the root record changes. For
/// connection fields this is also the concrete page record id.
pub fn root_field_dep(field_key: &str) -> String {
    format!("@.{field_key}")
}

/// An overlay-only edge id minted by an optimistic add. Distinct from any id
/// the normalizer produces.
pub fn optimistic_edge_key(canonical: &str, tx: u64, index: usize) -> String {
    format!("{canonical}.edges.@opt.{tx}.{index}")
}
