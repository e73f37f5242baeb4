//! Payload to graph.
//!
//! One traversal of the server payload, driven by the plan: entities are
//! upserted as flat snapshots with identifiable children swapped for
//! references, and connection pages are materialized at concrete page keys
//! before the canonical engine folds them in.

use std::sync::Arc;

use indexmap::IndexMap;
use indexmap::IndexSet;
use serde_json::Map as JsonMap;
use serde_json::Value;
use tracing::trace;

use crate::cache::CacheState;
use crate::connection;
use crate::connection::ConnectionWrite;
use crate::connection::PageOrigin;
use crate::error::CacheError;
use crate::graph::record::RecordPatch;
use crate::graph::record::RecordValue;
use crate::graph::ROOT_ID;
use crate::plan::keys;
use crate::plan::OperationKind;
use crate::plan::Plan;
use crate::plan::PlanField;
use crate::plan::Variables;

/// Writes a payload into the graph and returns the dependency keys the
/// write touched.
pub(crate) fn write_document(
    state: &mut CacheState,
    plan: &Plan,
    variables: &Variables,
    data: &JsonMap<String, Value>,
) -> Result<IndexSet<String>, CacheError> {
    let mut ctx = WriteContext {
        plan,
        variables,
        changed: IndexSet::new(),
    };
    // Mutation and subscription payloads update the graph but never rewire
    // the query root.
    let patch_root = plan.operation == OperationKind::Query;
    write_selection(state, &mut ctx, ROOT_ID, &plan.root, data, patch_root)?;
    trace!(
        operation = %plan.operation,
        changed = ctx.changed.len(),
        "normalized document"
    );
    Ok(ctx.changed)
}

/// Writes fragment data rooted at an explicit record id.
pub(crate) fn write_fragment(
    state: &mut CacheState,
    plan: &Plan,
    variables: &Variables,
    id: &str,
    data: &JsonMap<String, Value>,
) -> Result<IndexSet<String>, CacheError> {
    let mut ctx = WriteContext {
        plan,
        variables,
        changed: IndexSet::new(),
    };
    write_selection(state, &mut ctx, id, &plan.root, data, true)?;
    Ok(ctx.changed)
}

struct WriteContext<'a> {
    plan: &'a Plan,
    variables: &'a Variables,
    changed: IndexSet<String>,
}

fn write_selection(
    state: &mut CacheState,
    ctx: &mut WriteContext<'_>,
    parent_id: &str,
    fields: &[Arc<PlanField>],
    data: &JsonMap<String, Value>,
    patch_parent: bool,
) -> Result<(), CacheError> {
    let mut patch = RecordPatch::new();
    for field in fields {
        let Some(value) = data.get(&field.response_key) else {
            continue;
        };
        if field.is_connection {
            if let Some(page) = value.as_object() {
                let page_key = write_connection_page(state, ctx, parent_id, field, page)?;
                if patch_parent && ctx.plan.operation == OperationKind::Query {
                    patch.insert(
                        field.field_key(ctx.variables),
                        Some(RecordValue::Ref(page_key)),
                    );
                }
                continue;
            }
        }
        let written = write_value(state, ctx, field, value)?;
        patch.insert(field.field_key(ctx.variables), Some(written));
    }

    if patch_parent && !patch.is_empty() {
        if parent_id == ROOT_ID {
            // Per-field dependency keys for the root record, since watchers
            // subscribe to root field keys rather than the root itself.
            for (field_key, value) in &patch {
                let existing = state.store.get_record(ROOT_ID).and_then(|r| r.get(field_key));
                if existing != value.as_ref() {
                    ctx.changed.insert(keys::root_field_dep(field_key));
                }
            }
        }
        let (target, changed) = state.store.put_record(parent_id, patch)?;
        if changed {
            ctx.changed.insert(target);
        }
    }
    Ok(())
}

fn write_value(
    state: &mut CacheState,
    ctx: &mut WriteContext<'_>,
    field: &PlanField,
    value: &Value,
) -> Result<RecordValue, CacheError> {
    match value {
        Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_) => {
            Ok(RecordValue::Scalar(value.clone()))
        }
        Value::Array(items) => {
            let written = items
                .iter()
                .map(|item| write_value(state, ctx, field, item))
                .collect::<Result<Vec<_>, _>>()?;
            if !written.is_empty() && written.iter().all(|v| matches!(v, RecordValue::Ref(_))) {
                let ids = written
                    .into_iter()
                    .map(|v| match v {
                        RecordValue::Ref(id) => id,
                        _ => unreachable!(),
                    })
                    .collect();
                Ok(RecordValue::RefList(ids))
            } else {
                Ok(RecordValue::Array(written))
            }
        }
        Value::Object(object) => match state.store.identify(object) {
            Some(entity_id) => {
                let target = write_entity(state, ctx, &entity_id, field, object)?;
                Ok(RecordValue::Ref(target))
            }
            None => Ok(RecordValue::Object(embed_object(state, ctx, field, object)?)),
        },
    }
}

fn write_entity(
    state: &mut CacheState,
    ctx: &mut WriteContext<'_>,
    entity_id: &str,
    field: &PlanField,
    object: &JsonMap<String, Value>,
) -> Result<String, CacheError> {
    let mut patch = RecordPatch::new();
    if let Some(Value::String(typename)) = object.get("__typename") {
        patch.insert(
            "__typename".to_owned(),
            Some(RecordValue::string(typename.clone())),
        );
    }
    for sub in &field.selection {
        let Some(value) = object.get(&sub.response_key) else {
            continue;
        };
        if sub.is_connection {
            if let Some(page) = value.as_object() {
                let page_key = write_connection_page(state, ctx, entity_id, sub, page)?;
                if ctx.plan.operation == OperationKind::Query {
                    patch.insert(
                        sub.field_key(ctx.variables),
                        Some(RecordValue::Ref(page_key)),
                    );
                }
                continue;
            }
        }
        let written = write_value(state, ctx, sub, value)?;
        patch.insert(sub.field_key(ctx.variables), Some(written));
    }
    let (target, changed) = state.store.put_record(entity_id, patch)?;
    if changed {
        ctx.changed.insert(target.clone());
    }
    Ok(target)
}

/// Unidentifiable objects are embedded in place. Planned subfields recurse;
/// an empty selection means an opaque JSON blob copied structurally.
fn embed_object(
    state: &mut CacheState,
    ctx: &mut WriteContext<'_>,
    field: &PlanField,
    object: &JsonMap<String, Value>,
) -> Result<IndexMap<String, RecordValue>, CacheError> {
    let mut fields = IndexMap::new();
    if field.selection.is_empty() {
        for (key, value) in object {
            fields.insert(key.clone(), raw_value(value));
        }
        return Ok(fields);
    }
    if let Some(Value::String(typename)) = object.get("__typename") {
        fields.insert(
            "__typename".to_owned(),
            RecordValue::string(typename.clone()),
        );
    }
    for sub in &field.selection {
        let Some(value) = object.get(&sub.response_key) else {
            continue;
        };
        fields.insert(sub.field_key(ctx.variables), write_value(state, ctx, sub, value)?);
    }
    Ok(fields)
}

/// Structural copy with no reference detection, for opaque scalars.
fn raw_value(value: &Value) -> RecordValue {
    match value {
        Value::Object(map) => RecordValue::Object(
            map.iter()
                .map(|(key, value)| (key.clone(), raw_value(value)))
                .collect(),
        ),
        Value::Array(items) => RecordValue::Array(items.iter().map(raw_value).collect()),
        scalar => RecordValue::Scalar(scalar.clone()),
    }
}

/// Materializes one incoming page at its concrete page key: edge
/// sub-records, a pageInfo sub-record, and the page record itself, then
/// hands the page to the canonical engine.
fn write_connection_page(
    state: &mut CacheState,
    ctx: &mut WriteContext<'_>,
    parent_id: &str,
    field: &PlanField,
    page: &JsonMap<String, Value>,
) -> Result<String, CacheError> {
    let field_key = field.field_key(ctx.variables);
    let page_key = keys::page_key(parent_id, &field_key);

    // Edges. A null list is an empty one.
    let mut edge_ids = Vec::new();
    let edges_field = field.sub_field_by_name("edges");
    if let Some(edges_field) = edges_field {
        let edges = match page.get(&edges_field.response_key) {
            Some(Value::Array(items)) => items.as_slice(),
            _ => &[],
        };
        for (index, edge) in edges.iter().enumerate() {
            let Some(edge_object) = edge.as_object() else {
                continue;
            };
            let edge_id = keys::edge_key(&page_key, index);
            let mut patch = RecordPatch::new();
            for sub in &edges_field.selection {
                let Some(value) = edge_object.get(&sub.response_key) else {
                    continue;
                };
                patch.insert(
                    sub.field_key(ctx.variables),
                    Some(write_value(state, ctx, sub, value)?),
                );
            }
            let (target, changed) = state.store.put_record(&edge_id, patch)?;
            if changed {
                ctx.changed.insert(target);
            }
            edge_ids.push(edge_id);
        }
    }

    // The page's own pageInfo sub-record, even when the payload omits it.
    let page_info_id = keys::page_info_key(&page_key);
    let mut page_info_patch = RecordPatch::new();
    if let Some(info_field) = field.sub_field_by_name("pageInfo") {
        if let Some(info) = page.get(&info_field.response_key).and_then(Value::as_object) {
            if let Some(Value::String(typename)) = info.get("__typename") {
                page_info_patch.insert(
                    "__typename".to_owned(),
                    Some(RecordValue::string(typename.clone())),
                );
            }
            for sub in &info_field.selection {
                let Some(value) = info.get(&sub.response_key) else {
                    continue;
                };
                page_info_patch.insert(
                    sub.field_key(ctx.variables),
                    Some(write_value(state, ctx, sub, value)?),
                );
            }
        }
    }
    let (target, changed) = state.store.put_record(&page_info_id, page_info_patch)?;
    if changed {
        ctx.changed.insert(target);
    }

    // The page record: always an edges list and a pageInfo link, plus any
    // extra fields the selection carried (totalCount, aggregations, ...).
    let mut patch = RecordPatch::new();
    patch.insert("edges".to_owned(), Some(RecordValue::RefList(edge_ids)));
    patch.insert(
        "pageInfo".to_owned(),
        Some(RecordValue::Ref(page_info_id)),
    );
    if let Some(Value::String(typename)) = page.get("__typename") {
        patch.insert(
            "__typename".to_owned(),
            Some(RecordValue::string(typename.clone())),
        );
    }
    for sub in &field.selection {
        if sub.field_name == "edges" || sub.field_name == "pageInfo" || sub.field_name == "__typename"
        {
            continue;
        }
        let Some(value) = page.get(&sub.response_key) else {
            continue;
        };
        patch.insert(
            sub.field_key(ctx.variables),
            Some(write_value(state, ctx, sub, value)?),
        );
    }
    let (target, changed) = state.store.put_record(&page_key, patch)?;
    if changed {
        ctx.changed.insert(target);
    }

    connection::update_connection(
        state,
        ConnectionWrite {
            field,
            parent_id,
            variables: ctx.variables,
            page_key: &page_key,
            window_args: &ctx.plan.window_args,
        },
        PageOrigin::Network,
        &mut ctx.changed,
    )?;

    Ok(page_key)
}
