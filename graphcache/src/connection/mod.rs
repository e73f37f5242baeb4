//! The canonical connection engine.
//!
//! Per-page fetches land at concrete page keys; this module folds them into
//! one canonical view per connection identity. Infinite mode merges pages
//! with splice-at-cursor semantics: an anchor edge is located by cursor and
//! everything at or past it (forward) or at or before it (backward) is
//! replaced by the incoming slice, so the canonical list never retains
//! edges from pages that became unreachable. Page mode replaces the view
//! wholesale on every fetch.

use indexmap::IndexMap;
use indexmap::IndexSet;
use tracing::trace;

use crate::cache::CacheState;
use crate::config::ConnectionMode;
use crate::error::CacheError;
use crate::graph::record::Record;
use crate::graph::record::RecordPatch;
use crate::graph::record::RecordValue;
use crate::graph::GraphStore;
use crate::plan::keys;
use crate::plan::PageHint;
use crate::plan::PlanField;
use crate::plan::Variables;

/// One page write, as seen by the engine.
pub(crate) struct ConnectionWrite<'a> {
    pub field: &'a PlanField,
    pub parent_id: &'a str,
    pub variables: &'a Variables,
    pub page_key: &'a str,
    pub window_args: &'a IndexSet<String>,
}

/// Where a page came from; recorded in meta for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PageOrigin {
    Network,
    Cache,
}

impl PageOrigin {
    fn as_str(self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Cache => "cache",
        }
    }
}

/// Folds a freshly normalized page into its canonical connection.
pub(crate) fn update_connection(
    state: &mut CacheState,
    write: ConnectionWrite<'_>,
    origin: PageOrigin,
    changed: &mut IndexSet<String>,
) -> Result<(), CacheError> {
    let canonical = write
        .field
        .canonical_key(write.parent_id, write.variables, write.window_args);
    let hint = write.field.page_hint(write.variables);
    trace!(
        canonical = %canonical,
        page = %write.page_key,
        hint = hint.as_str(),
        origin = origin.as_str(),
        "canonical merge"
    );

    match write.field.connection_mode {
        ConnectionMode::Page => replace_page_mode(state, &canonical, write.page_key, changed)?,
        ConnectionMode::Infinite => {
            merge_infinite(state, &canonical, write.page_key, &hint, origin, changed)?
        }
    }

    // Overlays re-apply deterministically on the new base.
    let overlay_changed = {
        let CacheState {
            store, optimistic, ..
        } = state;
        optimistic.replay(store)
    };
    changed.extend(overlay_changed);
    Ok(())
}

/// Same as [`update_connection`], for pages replayed out of the cache. The
/// splice rules are position-stable given consistent cursors, so replay
/// order does not matter.
pub(crate) fn merge_from_cache(
    state: &mut CacheState,
    write: ConnectionWrite<'_>,
    changed: &mut IndexSet<String>,
) -> Result<(), CacheError> {
    update_connection(state, write, PageOrigin::Cache, changed)
}

struct PageSnapshot {
    edges: Vec<String>,
    info: Record,
    extras: Vec<(String, RecordValue)>,
    /// Boundary cursors, falling back to the first/last edge when pageInfo
    /// does not carry them.
    start_cursor: Option<String>,
    end_cursor: Option<String>,
}

fn snapshot_page(store: &GraphStore, page_key: &str) -> PageSnapshot {
    let page = store.get_record(page_key).cloned().unwrap_or_default();
    let edges: Vec<String> = page
        .get("edges")
        .and_then(RecordValue::as_ref_list)
        .map(<[String]>::to_vec)
        .unwrap_or_default();
    let info = page
        .get("pageInfo")
        .and_then(RecordValue::as_ref_id)
        .and_then(|id| store.get_record(id))
        .cloned()
        .unwrap_or_default();
    let extras = page
        .iter()
        .filter(|(key, _)| *key != "edges" && *key != "pageInfo")
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();

    let info_cursor = |name: &str| {
        info.get(name)
            .and_then(RecordValue::as_str)
            .map(str::to_owned)
    };
    let start_cursor =
        info_cursor("startCursor").or_else(|| edges.first().and_then(|id| edge_cursor(store, id)));
    let end_cursor =
        info_cursor("endCursor").or_else(|| edges.last().and_then(|id| edge_cursor(store, id)));

    PageSnapshot {
        edges,
        info,
        extras,
        start_cursor,
        end_cursor,
    }
}

fn edge_cursor(store: &GraphStore, edge_id: &str) -> Option<String> {
    store
        .get_record(edge_id)?
        .get("cursor")
        .and_then(RecordValue::as_str)
        .map(str::to_owned)
}

/// Page mode: the canonical record IS the incoming page. History is
/// discarded between fetches and no meta is kept.
fn replace_page_mode(
    state: &mut CacheState,
    canonical: &str,
    page_key: &str,
    changed: &mut IndexSet<String>,
) -> Result<(), CacheError> {
    let page = snapshot_page(&state.store, page_key);
    let info_id = keys::page_info_key(canonical);

    let mut info_patch = full_replace_patch(&state.store, &info_id, page.info.clone());
    if let Some(start) = &page.start_cursor {
        info_patch.insert(
            "startCursor".to_owned(),
            Some(RecordValue::string(start.clone())),
        );
    }
    if let Some(end) = &page.end_cursor {
        info_patch.insert(
            "endCursor".to_owned(),
            Some(RecordValue::string(end.clone())),
        );
    }
    put_changed(state, &info_id, info_patch, changed)?;

    let mut record = Record::new();
    record.insert("edges", RecordValue::RefList(page.edges));
    record.insert("pageInfo", RecordValue::Ref(info_id));
    for (key, value) in page.extras {
        record.insert(key, value);
    }
    let patch = full_replace_patch(&state.store, canonical, record);
    put_changed(state, canonical, patch, changed)?;
    Ok(())
}

/// A patch that leaves the record exactly equal to `next`: stale fields are
/// removed rather than merged over.
fn full_replace_patch(store: &GraphStore, id: &str, next: Record) -> RecordPatch {
    let mut patch = RecordPatch::new();
    if let Some(existing) = store.get_record(id) {
        for key in existing.field_keys() {
            if next.get(key).is_none() {
                patch.insert(key.clone(), None);
            }
        }
    }
    for (key, value) in next.iter() {
        patch.insert(key.clone(), Some(value.clone()));
    }
    patch
}

fn put_changed(
    state: &mut CacheState,
    id: &str,
    patch: RecordPatch,
    changed: &mut IndexSet<String>,
) -> Result<bool, CacheError> {
    let (target, did_change) = state.store.put_record(id, patch)?;
    if did_change {
        changed.insert(target);
    }
    Ok(did_change)
}

fn merge_infinite(
    state: &mut CacheState,
    canonical: &str,
    page_key: &str,
    hint: &PageHint,
    origin: PageOrigin,
    changed: &mut IndexSet<String>,
) -> Result<(), CacheError> {
    let page = snapshot_page(&state.store, page_key);
    let info_id = keys::page_info_key(canonical);
    let current: Vec<String> = state
        .store
        .get_record(canonical)
        .and_then(|record| record.get("edges"))
        .and_then(RecordValue::as_ref_list)
        .map(<[String]>::to_vec)
        .unwrap_or_default();

    let mut info_patch = RecordPatch::new();
    let new_edges = match hint {
        PageHint::Leader => {
            // A cursorless fetch anchors the connection: pages, hints and
            // origins reset to the single leader.
            write_meta(state, canonical, page_key, hint, origin, true, changed)?;

            for (key, value) in page.info.iter() {
                info_patch.insert(key.clone(), Some(value.clone()));
            }
            info_patch.insert(
                "startCursor".to_owned(),
                Some(cursor_value(page.start_cursor.as_deref())),
            );
            info_patch.insert(
                "endCursor".to_owned(),
                Some(cursor_value(page.end_cursor.as_deref())),
            );
            page.edges.clone()
        }
        PageHint::After(cursor) => {
            write_meta(state, canonical, page_key, hint, origin, false, changed)?;

            // Splice immediately after the anchor; everything at or beyond
            // that position belongs to pages no longer reachable.
            let splice = find_cursor(&state.store, &current, cursor)
                .map(|index| index + 1)
                .unwrap_or(current.len());
            let mut merged: Vec<String> = current[..splice].to_vec();
            merged.extend(page.edges.iter().cloned());

            info_patch.insert(
                "endCursor".to_owned(),
                Some(cursor_value(page.end_cursor.as_deref())),
            );
            if let Some(has_next) = page.info.get("hasNextPage") {
                info_patch.insert("hasNextPage".to_owned(), Some(has_next.clone()));
            }
            merged
        }
        PageHint::Before(cursor) => {
            write_meta(state, canonical, page_key, hint, origin, false, changed)?;

            // Keep the anchor and everything after it; prepend the slice.
            let kept: Vec<String> = match find_cursor(&state.store, &current, cursor) {
                Some(index) => current[index..].to_vec(),
                None => current.clone(),
            };
            let mut merged = page.edges.clone();
            merged.extend(kept);

            info_patch.insert(
                "startCursor".to_owned(),
                Some(cursor_value(page.start_cursor.as_deref())),
            );
            if let Some(has_previous) = page.info.get("hasPreviousPage") {
                info_patch.insert("hasPreviousPage".to_owned(), Some(has_previous.clone()));
            }
            merged
        }
    };

    put_changed(state, &info_id, info_patch, changed)?;

    let mut patch = RecordPatch::new();
    patch.insert("edges".to_owned(), Some(RecordValue::RefList(new_edges)));
    patch.insert(
        "pageInfo".to_owned(),
        Some(RecordValue::Ref(info_id)),
    );
    // Extra connection fields survive pagination; an incoming value
    // overwrites, an absent one is preserved.
    for (key, value) in page.extras {
        patch.insert(key, Some(value));
    }
    put_changed(state, canonical, patch, changed)?;
    Ok(())
}

fn cursor_value(cursor: Option<&str>) -> RecordValue {
    match cursor {
        Some(cursor) => RecordValue::string(cursor),
        None => RecordValue::null(),
    }
}

/// First occurrence anchors the splice when a cursor repeats.
fn find_cursor(store: &GraphStore, edges: &[String], cursor: &str) -> Option<usize> {
    edges
        .iter()
        .position(|edge| edge_cursor(store, edge).as_deref() == Some(cursor))
}

/// Connection bookkeeping at `<canonical>::meta`: the ordered page list,
/// the leader, and per-page hints and origins.
#[derive(Debug, Default, Clone, PartialEq)]
pub(crate) struct ConnectionMeta {
    pub pages: Vec<String>,
    pub leader: Option<String>,
    pub hints: IndexMap<String, String>,
    pub origin: IndexMap<String, String>,
}

impl ConnectionMeta {
    pub(crate) fn load(store: &GraphStore, canonical: &str) -> Self {
        let Some(record) = store.get_record(&keys::meta_key(canonical)) else {
            return Self::default();
        };
        let string_map = |value: Option<&RecordValue>| -> IndexMap<String, String> {
            match value {
                Some(RecordValue::Object(fields)) => fields
                    .iter()
                    .filter_map(|(key, value)| {
                        value.as_str().map(|v| (key.clone(), v.to_owned()))
                    })
                    .collect(),
                _ => IndexMap::new(),
            }
        };
        Self {
            pages: record
                .get("pages")
                .and_then(RecordValue::as_ref_list)
                .map(<[String]>::to_vec)
                .unwrap_or_default(),
            leader: record
                .get("leader")
                .and_then(RecordValue::as_ref_id)
                .map(str::to_owned),
            hints: string_map(record.get("hints")),
            origin: string_map(record.get("origin")),
        }
    }
}

fn write_meta(
    state: &mut CacheState,
    canonical: &str,
    page_key: &str,
    hint: &PageHint,
    origin: PageOrigin,
    reset: bool,
    changed: &mut IndexSet<String>,
) -> Result<(), CacheError> {
    let meta_id = keys::meta_key(canonical);
    let mut meta = if reset {
        // Field-level merge would keep stale hint entries around, so a
        // reset drops the record first.
        if state.store.get_record(&meta_id).is_some() {
            let mut wipe = RecordPatch::new();
            for key in ["pages", "leader", "hints", "origin"] {
                wipe.insert(key.to_owned(), None);
            }
            state.store.put_record(&meta_id, wipe)?;
        }
        ConnectionMeta::default()
    } else {
        ConnectionMeta::load(&state.store, canonical)
    };

    if !meta.pages.iter().any(|page| page == page_key) {
        meta.pages.push(page_key.to_owned());
    }
    if reset {
        meta.leader = Some(page_key.to_owned());
    }
    meta.hints
        .insert(page_key.to_owned(), hint.as_str().to_owned());
    meta.origin
        .insert(page_key.to_owned(), origin.as_str().to_owned());

    let mut patch = RecordPatch::new();
    patch.insert(
        "pages".to_owned(),
        Some(RecordValue::RefList(meta.pages.clone())),
    );
    if let Some(leader) = &meta.leader {
        patch.insert("leader".to_owned(), Some(RecordValue::Ref(leader.clone())));
    }
    patch.insert(
        "hints".to_owned(),
        Some(RecordValue::Object(
            meta.hints
                .iter()
                .map(|(key, value)| (key.clone(), RecordValue::string(value.clone())))
                .collect(),
        )),
    );
    patch.insert(
        "origin".to_owned(),
        Some(RecordValue::Object(
            meta.origin
                .iter()
                .map(|(key, value)| (key.clone(), RecordValue::string(value.clone())))
                .collect(),
        )),
    );
    put_changed(state, &meta_id, patch, changed)?;
    Ok(())
}
