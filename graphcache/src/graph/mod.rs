//! The normalized graph: a flat mapping from record id to record snapshot.
//!
//! Record ids come in a handful of shapes: the fixed root `"@"`, entity ids
//! (`"Post:1"`), scoped sub-ids (`"@.posts({...}).pageInfo"`), field keys on
//! the root, and canonical connection ids (`"@connection.posts({})"`). The
//! store does not interpret most of them; it only gives entity ids identity
//! semantics (typename checks, interface aliasing).

pub(crate) mod record;

use std::collections::HashMap;

use indexmap::IndexMap;
use indexmap::IndexSet;
use serde_json::Map as JsonMap;
use serde_json::Value;
use tracing::trace;

use crate::config::KeyFn;
use crate::error::CacheError;
pub use record::Record;
pub use record::RecordPatch;
pub use record::RecordValue;

/// The fixed id of the query root record.
pub const ROOT_ID: &str = "@";

/// Splits an entity id into typename and key. Only plain `"<Typename>:<key>"`
/// ids count: the typename part must look like a GraphQL name and the key
/// must not be a scoped sub-id.
pub(crate) fn split_entity_id(id: &str) -> Option<(&str, &str)> {
    let (typename, key) = id.split_once(':')?;
    if typename.is_empty() || key.is_empty() {
        return None;
    }
    let mut chars = typename.chars();
    let first = chars.next()?;
    if !(first.is_ascii_alphabetic() || first == '_') {
        return None;
    }
    if !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return None;
    }
    // Scoped sub-ids ("Post:1.pageInfo") are not entities.
    if key.contains('.') || key.contains('(') {
        return None;
    }
    Some((typename, key))
}

pub(crate) fn validate_record_id(id: &str) -> Result<(), CacheError> {
    if id.is_empty() {
        return Err(CacheError::invalid_record_id("empty record id"));
    }
    if id.starts_with(':') || id.ends_with(':') {
        return Err(CacheError::invalid_record_id(format!(
            "misplaced separator in {id:?}"
        )));
    }
    if id.starts_with('.') || id.ends_with('.') {
        return Err(CacheError::invalid_record_id(format!(
            "misplaced separator in {id:?}"
        )));
    }
    Ok(())
}

/// A registered watcher: the dependency keys that invalidate it. The
/// callback lives with the pipeline so that it can be invoked outside the
/// cache lock.
#[derive(Debug, Default)]
struct WatcherEntry {
    deps: IndexSet<String>,
}

#[derive(Default)]
pub(crate) struct GraphStore {
    records: IndexMap<String, Record>,
    keys: HashMap<String, KeyFn>,
    interfaces: IndexMap<String, Vec<String>>,
    watchers: IndexMap<u64, WatcherEntry>,
    next_watcher: u64,
}

impl GraphStore {
    pub(crate) fn new(
        keys: HashMap<String, KeyFn>,
        interfaces: IndexMap<String, Vec<String>>,
    ) -> Self {
        Self {
            keys,
            interfaces,
            ..Default::default()
        }
    }

    /// Resolves the identity of a payload object: the configured key
    /// function for its typename first, the `id` field second. Objects
    /// without a usable identity are embedded into their parent.
    pub(crate) fn identify(&self, object: &JsonMap<String, Value>) -> Option<String> {
        let typename = object.get("__typename")?.as_str()?;
        let key = match self.keys.get(typename) {
            Some(key_fn) => key_fn(object)?,
            None => match object.get("id")? {
                Value::String(s) => s.clone(),
                Value::Number(n) => n.to_string(),
                _ => return None,
            },
        };
        if key.is_empty() {
            return None;
        }
        Some(format!("{typename}:{key}"))
    }

    /// Routes an entity id to its concrete form. Ids built against an
    /// interface typename are lookup aliases: writes against them land on
    /// the concrete record once the payload names it, and reads resolve to
    /// the first existing concrete member in declared order.
    pub(crate) fn resolve_id<'a>(&self, id: &'a str) -> std::borrow::Cow<'a, str> {
        if self.records.contains_key(id) {
            return std::borrow::Cow::Borrowed(id);
        }
        if let Some((typename, key)) = split_entity_id(id) {
            if let Some(concretes) = self.interfaces.get(typename) {
                for concrete in concretes {
                    let candidate = format!("{concrete}:{key}");
                    if self.records.contains_key(&candidate) {
                        return std::borrow::Cow::Owned(candidate);
                    }
                }
            }
        }
        std::borrow::Cow::Borrowed(id)
    }

    pub(crate) fn interface_members(&self, interface: &str) -> Option<&Vec<String>> {
        self.interfaces.get(interface)
    }

    pub(crate) fn get_record(&self, id: &str) -> Option<&Record> {
        match self.records.get(id) {
            Some(record) => Some(record),
            None => {
                let resolved = self.resolve_id(id);
                match resolved {
                    std::borrow::Cow::Borrowed(_) => None,
                    std::borrow::Cow::Owned(concrete) => self.records.get(&concrete),
                }
            }
        }
    }

    /// Merges a partial snapshot over the record, creating it on first
    /// write. Returns the id the write actually landed on (interface ids
    /// route to their concrete member) and whether anything changed.
    pub(crate) fn put_record(
        &mut self,
        id: &str,
        patch: RecordPatch,
    ) -> Result<(String, bool), CacheError> {
        validate_record_id(id)?;

        let mut target = id.to_owned();
        if let Some((typename, key)) = split_entity_id(id) {
            let incoming = patch
                .get("__typename")
                .and_then(|v| v.as_ref())
                .and_then(RecordValue::as_str);
            if let Some(incoming) = incoming {
                if incoming != typename {
                    if self.interfaces.contains_key(typename) {
                        target = format!("{incoming}:{key}");
                    } else {
                        return Err(CacheError::TypeMismatch {
                            id: id.to_owned(),
                            expected: typename.to_owned(),
                            actual: incoming.to_owned(),
                        });
                    }
                }
            }
        }

        let record = self.records.entry(target.clone()).or_default();
        let changed = record.apply(patch);
        Ok((target, changed))
    }

    pub(crate) fn remove_record(&mut self, id: &str) -> bool {
        self.records.shift_remove(id).is_some()
    }

    pub(crate) fn keys(&self) -> impl Iterator<Item = &String> {
        self.records.keys()
    }

    pub(crate) fn records(&self) -> impl Iterator<Item = (&String, &Record)> {
        self.records.iter()
    }

    pub(crate) fn watcher_ids(&self) -> Vec<u64> {
        self.watchers.keys().copied().collect()
    }

    /// Empties all records. The caller is expected to dispatch the returned
    /// global reset to every watcher.
    pub(crate) fn clear(&mut self) -> Vec<u64> {
        self.records.clear();
        trace!("graph store cleared");
        self.watchers.keys().copied().collect()
    }

    // Watcher registry. Entries hold dependency keys only; callbacks stay
    // with the pipeline so dispatch happens outside the cache lock.

    pub(crate) fn subscribe(&mut self, deps: IndexSet<String>) -> u64 {
        let id = self.next_watcher;
        self.next_watcher += 1;
        self.watchers.insert(id, WatcherEntry { deps });
        id
    }

    pub(crate) fn unsubscribe(&mut self, watcher: u64) -> bool {
        self.watchers.shift_remove(&watcher).is_some()
    }

    pub(crate) fn update_watcher_deps(&mut self, watcher: u64, deps: IndexSet<String>) {
        if let Some(entry) = self.watchers.get_mut(&watcher) {
            entry.deps = deps;
        }
    }

    /// Watchers whose dependency set intersects the changed keys, each at
    /// most once per write burst, in subscription order.
    pub(crate) fn due_watchers(&self, changed: &IndexSet<String>) -> Vec<u64> {
        if changed.is_empty() {
            return Vec::new();
        }
        self.watchers
            .iter()
            .filter(|(_, entry)| entry.deps.iter().any(|dep| changed.contains(dep)))
            .map(|(id, _)| *id)
            .collect()
    }
}
