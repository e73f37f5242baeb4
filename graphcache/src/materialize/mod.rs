//! Graph to result tree.
//!
//! Reads compose the base graph with the optimistic overlay lazily, prefer
//! canonical connection records over concrete pages, and record every
//! record id they touch. That dependency index is what watchers and live
//! results subscribe with; there is no proxy magic.

pub(crate) mod live;

use std::sync::Arc;

use indexmap::IndexMap;
use indexmap::IndexSet;
use serde_json::Map as JsonMap;
use serde_json::Value;

use crate::cache::CacheState;
use crate::graph::record::RecordValue;
use crate::graph::ROOT_ID;
use crate::plan::keys;
use crate::plan::Plan;
use crate::plan::PlanField;
use crate::plan::Variables;

pub(crate) struct ReadOutput {
    /// `None` when any required link or connection page is absent.
    pub data: Option<Value>,
    /// Every record id the read touched, present or not.
    pub deps: IndexSet<String>,
}

pub(crate) fn read(state: &CacheState, plan: &Plan, variables: &Variables) -> ReadOutput {
    let mut ctx = ReadContext {
        state,
        variables,
        window_args: &plan.window_args,
        deps: IndexSet::new(),
    };
    let data = read_root(&mut ctx, plan);
    ReadOutput {
        data: data.map(Value::Object),
        deps: ctx.deps,
    }
}

pub(crate) fn has(state: &CacheState, plan: &Plan, variables: &Variables) -> bool {
    read(state, plan, variables).data.is_some()
}

/// Reads a fragment plan rooted at an explicit record id.
pub(crate) fn read_fragment(state: &CacheState, plan: &Plan, id: &str) -> Option<Value> {
    let variables = Variables::new();
    let mut ctx = ReadContext {
        state,
        variables: &variables,
        window_args: &plan.window_args,
        deps: IndexSet::new(),
    };
    read_record(&mut ctx, id, &plan.root).map(Value::Object)
}

struct ReadContext<'a> {
    state: &'a CacheState,
    variables: &'a Variables,
    window_args: &'a IndexSet<String>,
    deps: IndexSet<String>,
}

impl ReadContext<'_> {
    /// Overlay first, base second. `Some(None)` is an overlay tombstone.
    fn effective_field(&self, id: &str, field_key: &str) -> Option<RecordValue> {
        if let Some(slot) = self.state.optimistic.overlay_field(id, field_key) {
            return slot.clone();
        }
        self.state
            .store
            .get_record(id)
            .and_then(|record| record.get(field_key))
            .cloned()
    }

    fn record_exists(&self, id: &str) -> bool {
        self.state.optimistic.overlay_record(id).is_some()
            || self.state.store.get_record(id).is_some()
    }

    fn typename_of(&self, id: &str) -> Option<String> {
        self.effective_field(id, "__typename")
            .as_ref()
            .and_then(RecordValue::as_str)
            .map(str::to_owned)
    }

    fn condition_matches(&self, condition: &str, typename: Option<&str>) -> bool {
        let Some(typename) = typename else {
            return false;
        };
        if condition == typename {
            return true;
        }
        self.state
            .store
            .interface_members(condition)
            .is_some_and(|members| members.iter().any(|member| member == typename))
    }
}

fn read_root(ctx: &mut ReadContext<'_>, plan: &Plan) -> Option<JsonMap<String, Value>> {
    let mut out = JsonMap::new();
    for field in &plan.root {
        ctx.deps
            .insert(keys::root_field_dep(&field.field_key(ctx.variables)));
        let value = if field.is_connection {
            read_connection(ctx, field, ROOT_ID)?
        } else {
            let stored = ctx.effective_field(ROOT_ID, &field.field_key(ctx.variables))?;
            resolve_value(ctx, field, &stored)?
        };
        out.insert(field.response_key.clone(), value);
    }
    Some(out)
}

fn resolve_value(
    ctx: &mut ReadContext<'_>,
    field: &PlanField,
    value: &RecordValue,
) -> Option<Value> {
    match value {
        RecordValue::Scalar(scalar) => Some(scalar.clone()),
        RecordValue::Ref(id) => {
            read_record(ctx, id, &field.selection).map(Value::Object)
        }
        RecordValue::RefList(ids) => {
            let mut items = Vec::with_capacity(ids.len());
            for id in ids {
                items.push(Value::Object(read_record(ctx, id, &field.selection)?));
            }
            Some(Value::Array(items))
        }
        RecordValue::Array(values) => {
            let mut items = Vec::with_capacity(values.len());
            for value in values {
                items.push(resolve_value(ctx, field, value)?);
            }
            Some(Value::Array(items))
        }
        RecordValue::Object(fields) => read_embedded(ctx, field, fields).map(Value::Object),
    }
}

fn read_record(
    ctx: &mut ReadContext<'_>,
    id: &str,
    selection: &[Arc<PlanField>],
) -> Option<JsonMap<String, Value>> {
    let resolved = ctx.state.store.resolve_id(id).into_owned();
    ctx.deps.insert(resolved.clone());
    if !ctx.record_exists(&resolved) {
        return None;
    }
    let typename = ctx.typename_of(&resolved);

    let mut out = JsonMap::new();
    for field in selection {
        if let Some(condition) = &field.type_condition {
            if !ctx.condition_matches(condition, typename.as_deref()) {
                continue;
            }
        }
        if field.field_name == "__typename" {
            let value = typename
                .as_ref()
                .map(|t| Value::String(t.clone()))
                .unwrap_or(Value::Null);
            out.insert(field.response_key.clone(), value);
            continue;
        }
        let value = if field.is_connection {
            read_connection(ctx, field, &resolved)?
        } else {
            let stored = ctx.effective_field(&resolved, &field.field_key(ctx.variables))?;
            resolve_value(ctx, field, &stored)?
        };
        out.insert(field.response_key.clone(), value);
    }
    Some(out)
}

fn read_embedded(
    ctx: &mut ReadContext<'_>,
    field: &PlanField,
    fields: &IndexMap<String, RecordValue>,
) -> Option<JsonMap<String, Value>> {
    if field.selection.is_empty() {
        // An opaque blob: hand it back structurally.
        let mut out = JsonMap::new();
        for (key, value) in fields {
            out.insert(key.clone(), value.to_json());
        }
        return Some(out);
    }
    let typename = fields
        .get("__typename")
        .and_then(RecordValue::as_str)
        .map(str::to_owned);
    let mut out = JsonMap::new();
    for sub in &field.selection {
        if let Some(condition) = &sub.type_condition {
            if !ctx.condition_matches(condition, typename.as_deref()) {
                continue;
            }
        }
        if sub.field_name == "__typename" {
            out.insert(
                sub.response_key.clone(),
                typename
                    .as_ref()
                    .map(|t| Value::String(t.clone()))
                    .unwrap_or(Value::Null),
            );
            continue;
        }
        let stored = fields.get(&sub.field_key(ctx.variables))?;
        out.insert(sub.response_key.clone(), resolve_value(ctx, sub, stored)?);
    }
    Some(out)
}

/// Connection reads prefer the canonical record; a write-only page that
/// never reached the canonical layer is served from its concrete key.
fn read_connection(
    ctx: &mut ReadContext<'_>,
    field: &PlanField,
    parent_id: &str,
) -> Option<Value> {
    let canonical = field.canonical_key(parent_id, ctx.variables, ctx.window_args);
    ctx.deps.insert(canonical.clone());

    let record_id = if ctx.record_exists(&canonical) {
        canonical
    } else {
        let field_key = field.field_key(ctx.variables);
        let stored = ctx.effective_field(parent_id, &field_key);
        if stored.as_ref().is_some_and(RecordValue::is_null) {
            return Some(Value::Null);
        }
        let page_key = stored
            .as_ref()
            .and_then(RecordValue::as_ref_id)
            .map(str::to_owned)
            .unwrap_or_else(|| keys::page_key(parent_id, &field_key));
        ctx.deps.insert(page_key.clone());
        if !ctx.record_exists(&page_key) {
            return None;
        }
        page_key
    };

    let mut out = JsonMap::new();
    for sub in &field.selection {
        if sub.field_name == "__typename" {
            let typename = ctx.typename_of(&record_id);
            out.insert(
                sub.response_key.clone(),
                typename.map(Value::String).unwrap_or(Value::Null),
            );
            continue;
        }
        let stored = ctx.effective_field(&record_id, &sub.field_key(ctx.variables))?;
        out.insert(sub.response_key.clone(), resolve_value(ctx, sub, &stored)?);
    }
    Some(Value::Object(out))
}

/// Resolves one record to plain JSON, following references. Cycles break by
/// emitting the reference marker instead of recursing.
pub(crate) fn materialize_record(state: &CacheState, id: &str) -> Option<(Value, IndexSet<String>)> {
    let mut deps = IndexSet::new();
    let mut visiting = Vec::new();
    let value = materialize_record_inner(state, id, &mut deps, &mut visiting)?;
    Some((value, deps))
}

fn materialize_record_inner(
    state: &CacheState,
    id: &str,
    deps: &mut IndexSet<String>,
    visiting: &mut Vec<String>,
) -> Option<Value> {
    let resolved = state.store.resolve_id(id).into_owned();
    deps.insert(resolved.clone());

    let base = state.store.get_record(&resolved);
    let overlay = state.optimistic.overlay_record(&resolved);
    if base.is_none() && overlay.is_none() {
        return None;
    }

    visiting.push(resolved.clone());
    let mut out = JsonMap::new();
    if let Some(base) = base {
        for (key, value) in base.iter() {
            if state.optimistic.overlay_field(&resolved, key).is_some() {
                continue;
            }
            out.insert(key.clone(), materialize_value(state, value, deps, visiting));
        }
    }
    if let Some(overlay) = state.optimistic.overlay_record(&resolved) {
        for (key, slot) in overlay {
            match slot {
                Some(value) => {
                    out.insert(key.clone(), materialize_value(state, value, deps, visiting));
                }
                None => {
                    out.remove(key);
                }
            }
        }
    }
    visiting.pop();
    Some(Value::Object(out))
}

fn materialize_value(
    state: &CacheState,
    value: &RecordValue,
    deps: &mut IndexSet<String>,
    visiting: &mut Vec<String>,
) -> Value {
    match value {
        RecordValue::Scalar(scalar) => scalar.clone(),
        RecordValue::Ref(id) => {
            if visiting.iter().any(|v| v == id) {
                return value.to_json();
            }
            materialize_record_inner(state, id, deps, visiting).unwrap_or(Value::Null)
        }
        RecordValue::RefList(ids) => Value::Array(
            ids.iter()
                .map(|id| {
                    if visiting.iter().any(|v| v == id) {
                        RecordValue::Ref(id.clone()).to_json()
                    } else {
                        materialize_record_inner(state, id, deps, visiting).unwrap_or(Value::Null)
                    }
                })
                .collect(),
        ),
        RecordValue::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| materialize_value(state, item, deps, visiting))
                .collect(),
        ),
        RecordValue::Object(fields) => {
            let mut out = JsonMap::new();
            for (key, value) in fields {
                out.insert(key.clone(), materialize_value(state, value, deps, visiting));
            }
            Value::Object(out)
        }
    }
}
