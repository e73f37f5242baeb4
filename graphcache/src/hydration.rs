//! SSR de/hydration.
//!
//! The serialized form is deliberately dumb: the record map as pairs, with
//! reference markers inline. `hydrate` clears and restores the graph, then
//! keeps `is_hydrating()` true for a window so initial cache-first reads do
//! not race redundant network fetches.

use std::time::Duration;
use std::time::Instant;

use indexmap::IndexSet;
use serde_json::json;
use serde_json::Value;
use tracing::debug;

use crate::cache::CacheState;
use crate::error::CacheError;
use crate::graph::record::Record;
use crate::graph::record::RecordPatch;

#[derive(Debug, Default)]
pub(crate) struct HydrationState {
    deadline: Option<Instant>,
}

impl HydrationState {
    pub(crate) fn begin(&mut self, timeout: Duration) {
        self.deadline = Some(Instant::now() + timeout);
    }

    pub(crate) fn is_hydrating(&self) -> bool {
        self.deadline.is_some_and(|deadline| Instant::now() < deadline)
    }
}

/// Serializes the full record map: `{"records": [[id, snapshot], ...]}`.
pub(crate) fn dehydrate(state: &CacheState) -> Value {
    let records: Vec<Value> = state
        .store
        .records()
        .map(|(id, record)| json!([id, record.to_json()]))
        .collect();
    json!({ "records": records })
}

/// Clears the graph and restores it from a dehydrated snapshot. Returns
/// every restored record id; the caller dispatches the global reset.
pub(crate) fn hydrate(
    state: &mut CacheState,
    snapshot: &Value,
    timeout: Duration,
) -> Result<IndexSet<String>, CacheError> {
    let records = snapshot
        .get("records")
        .and_then(Value::as_array)
        .ok_or_else(|| CacheError::internal("malformed hydration snapshot"))?;

    state.store.clear();
    let mut changed = IndexSet::new();
    for entry in records {
        let (Some(id), Some(snapshot)) = (
            entry.get(0).and_then(Value::as_str),
            entry.get(1),
        ) else {
            return Err(CacheError::internal("malformed hydration record"));
        };
        let record = Record::from_json(snapshot)
            .ok_or_else(|| CacheError::internal("malformed hydration record"))?;
        let mut patch = RecordPatch::new();
        for (key, value) in record.iter() {
            patch.insert(key.clone(), Some(value.clone()));
        }
        state.store.put_record(id, patch)?;
        changed.insert(id.to_owned());
    }

    state.hydration.begin(timeout);
    debug!(records = changed.len(), "cache hydrated");
    Ok(changed)
}
