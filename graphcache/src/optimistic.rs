//! Optimistic overlays.
//!
//! Transactions record structured mutations; they never touch base records.
//! The visible state is base plus overlay, composed at read time. Whenever
//! the base moves underneath (a normalized write, a canonical merge), the
//! whole log replays in commit order onto the new base, so overlays
//! re-apply deterministically.

use indexmap::IndexMap;
use indexmap::IndexSet;
use serde_json::Map as JsonMap;
use serde_json::Value;
use tracing::trace;

use crate::graph::record::RecordValue;
use crate::graph::GraphStore;
use crate::graph::ROOT_ID;
use crate::plan::keys;

/// Where an optimistic node lands in the canonical edge list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddPosition {
    Start,
    End,
    BeforeCursor(String),
    AfterCursor(String),
}

/// Addresses one canonical connection from a transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionTarget {
    pub parent: String,
    pub key: String,
    pub filters: JsonMap<String, Value>,
}

impl ConnectionTarget {
    /// A root connection with no identity filters.
    pub fn root(key: impl Into<String>) -> Self {
        Self {
            parent: ROOT_ID.to_owned(),
            key: key.into(),
            filters: JsonMap::new(),
        }
    }

    pub fn on(parent: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            parent: parent.into(),
            key: key.into(),
            filters: JsonMap::new(),
        }
    }

    pub fn with_filters(mut self, filters: JsonMap<String, Value>) -> Self {
        self.filters = filters;
        self
    }

    pub(crate) fn canonical_id(&self) -> String {
        keys::canonical_key(&self.parent, &self.key, &self.filters)
    }
}

#[derive(Debug, Clone)]
pub(crate) enum OptimisticOp {
    WriteFragment {
        id: String,
        data: JsonMap<String, Value>,
    },
    AddNode {
        target: ConnectionTarget,
        node: JsonMap<String, Value>,
        position: AddPosition,
    },
    RemoveNode {
        target: ConnectionTarget,
        node: JsonMap<String, Value>,
    },
}

/// The transactional surface handed to `modify_optimistic` closures.
/// Mutations apply in declaration order within the transaction.
#[derive(Default)]
pub struct OptimisticTxn {
    pub(crate) ops: Vec<OptimisticOp>,
}

impl OptimisticTxn {
    pub fn connection(&mut self, target: ConnectionTarget) -> ConnectionEditor<'_> {
        ConnectionEditor {
            target,
            ops: &mut self.ops,
        }
    }

    /// Overlays a partial snapshot on a record without touching the base.
    pub fn write_fragment(&mut self, id: impl Into<String>, data: Value) {
        if let Value::Object(data) = data {
            self.ops.push(OptimisticOp::WriteFragment {
                id: id.into(),
                data,
            });
        }
    }
}

pub struct ConnectionEditor<'a> {
    target: ConnectionTarget,
    ops: &'a mut Vec<OptimisticOp>,
}

impl ConnectionEditor<'_> {
    pub fn add_node(&mut self, node: Value, position: AddPosition) {
        if let Value::Object(node) = node {
            self.ops.push(OptimisticOp::AddNode {
                target: self.target.clone(),
                node,
                position,
            });
        }
    }

    /// Filters the node out of the canonical edge list by identity.
    pub fn remove_node(&mut self, node: Value) {
        if let Value::Object(node) = node {
            self.ops.push(OptimisticOp::RemoveNode {
                target: self.target.clone(),
                node,
            });
        }
    }
}

struct Transaction {
    id: u64,
    ops: Vec<OptimisticOp>,
}

/// One overlaid record: a field map where `None` is a tombstone.
pub(crate) type OverlayRecord = IndexMap<String, Option<RecordValue>>;

#[derive(Default)]
pub(crate) struct OptimisticLayer {
    transactions: Vec<Transaction>,
    next_tx: u64,
    overlay: IndexMap<String, OverlayRecord>,
}

impl OptimisticLayer {
    pub(crate) fn begin(&mut self, ops: Vec<OptimisticOp>) -> u64 {
        let id = self.next_tx;
        self.next_tx += 1;
        self.transactions.push(Transaction { id, ops });
        id
    }

    /// Drops a transaction; both commit and revert end here, the difference
    /// being whether the server's truth already landed in the base.
    pub(crate) fn remove(&mut self, tx: u64) -> bool {
        let before = self.transactions.len();
        self.transactions.retain(|t| t.id != tx);
        self.transactions.len() < before
    }

    pub(crate) fn overlay_record(&self, id: &str) -> Option<&OverlayRecord> {
        self.overlay.get(id)
    }

    pub(crate) fn overlay_field(&self, id: &str, field: &str) -> Option<&Option<RecordValue>> {
        self.overlay.get(id)?.get(field)
    }

    /// Rebuilds the overlay from the transaction log against the current
    /// base. Returns the record ids whose overlaid view changed.
    pub(crate) fn replay(&mut self, store: &GraphStore) -> IndexSet<String> {
        let mut fresh: IndexMap<String, OverlayRecord> = IndexMap::new();

        for transaction in &self.transactions {
            for (index, op) in transaction.ops.iter().enumerate() {
                match op {
                    OptimisticOp::WriteFragment { id, data } => {
                        let resolved = store.resolve_id(id).into_owned();
                        let entry = fresh.entry(resolved).or_default();
                        for (key, value) in data {
                            entry.insert(key.clone(), Some(RecordValue::from_json(value)));
                        }
                    }
                    OptimisticOp::AddNode {
                        target,
                        node,
                        position,
                    } => {
                        let Some(node_id) = store.identify(node) else {
                            trace!("optimistic add of unidentifiable node skipped");
                            continue;
                        };
                        let node_entry = fresh.entry(node_id.clone()).or_default();
                        for (key, value) in node {
                            node_entry.insert(key.clone(), Some(RecordValue::from_json(value)));
                        }

                        let canonical = target.canonical_id();
                        let edge_id =
                            keys::optimistic_edge_key(&canonical, transaction.id, index);
                        let mut edge = OverlayRecord::new();
                        // A server cursor does not exist yet.
                        edge.insert("cursor".to_owned(), Some(RecordValue::null()));
                        edge.insert("node".to_owned(), Some(RecordValue::Ref(node_id)));
                        fresh.insert(edge_id.clone(), edge);

                        let mut edges = working_edges(&fresh, store, &canonical);
                        let at = match position {
                            AddPosition::Start => 0,
                            AddPosition::End => edges.len(),
                            AddPosition::BeforeCursor(cursor) => {
                                cursor_index(&fresh, store, &edges, cursor).unwrap_or(0)
                            }
                            AddPosition::AfterCursor(cursor) => {
                                cursor_index(&fresh, store, &edges, cursor)
                                    .map(|i| i + 1)
                                    .unwrap_or(edges.len())
                            }
                        };
                        edges.insert(at, edge_id);
                        fresh
                            .entry(canonical)
                            .or_default()
                            .insert("edges".to_owned(), Some(RecordValue::RefList(edges)));
                    }
                    OptimisticOp::RemoveNode { target, node } => {
                        let Some(node_id) = store.identify(node) else {
                            continue;
                        };
                        let canonical = target.canonical_id();
                        let edges = working_edges(&fresh, store, &canonical);
                        let kept: Vec<String> = edges
                            .into_iter()
                            .filter(|edge| {
                                edge_node_id(&fresh, store, edge).as_deref()
                                    != Some(node_id.as_str())
                            })
                            .collect();
                        fresh
                            .entry(canonical)
                            .or_default()
                            .insert("edges".to_owned(), Some(RecordValue::RefList(kept)));
                    }
                }
            }
        }

        let mut touched: IndexSet<String> = IndexSet::new();
        for id in self.overlay.keys() {
            if fresh.get(id) != self.overlay.get(id) {
                touched.insert(id.clone());
            }
        }
        for id in fresh.keys() {
            if self.overlay.get(id) != fresh.get(id) {
                touched.insert(id.clone());
            }
        }
        self.overlay = fresh;
        touched
    }
}

/// The edge list a transaction op sees: whatever the replay built so far,
/// else the canonical base.
fn working_edges(
    fresh: &IndexMap<String, OverlayRecord>,
    store: &GraphStore,
    canonical: &str,
) -> Vec<String> {
    if let Some(Some(RecordValue::RefList(edges))) =
        fresh.get(canonical).and_then(|record| record.get("edges"))
    {
        return edges.clone();
    }
    store
        .get_record(canonical)
        .and_then(|record| record.get("edges"))
        .and_then(RecordValue::as_ref_list)
        .map(<[String]>::to_vec)
        .unwrap_or_default()
}

fn edge_field(
    fresh: &IndexMap<String, OverlayRecord>,
    store: &GraphStore,
    edge_id: &str,
    field: &str,
) -> Option<RecordValue> {
    if let Some(record) = fresh.get(edge_id) {
        if let Some(slot) = record.get(field) {
            return slot.clone();
        }
    }
    store
        .get_record(edge_id)
        .and_then(|record| record.get(field))
        .cloned()
}

fn edge_node_id(
    fresh: &IndexMap<String, OverlayRecord>,
    store: &GraphStore,
    edge_id: &str,
) -> Option<String> {
    edge_field(fresh, store, edge_id, "node")
        .as_ref()
        .and_then(RecordValue::as_ref_id)
        .map(str::to_owned)
}

fn cursor_index(
    fresh: &IndexMap<String, OverlayRecord>,
    store: &GraphStore,
    edges: &[String],
    cursor: &str,
) -> Option<usize> {
    edges.iter().position(|edge| {
        edge_field(fresh, store, edge, "cursor")
            .as_ref()
            .and_then(RecordValue::as_str)
            == Some(cursor)
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use serde_json::json;

    use super::*;
    use crate::graph::record::RecordPatch;

    fn store() -> GraphStore {
        GraphStore::new(HashMap::new(), IndexMap::new())
    }

    fn seed_connection(store: &mut GraphStore, canonical: &str, nodes: &[&str]) {
        let mut edge_ids = Vec::new();
        for (index, node) in nodes.iter().enumerate() {
            let node_id = format!("Post:{node}");
            let mut node_patch = RecordPatch::new();
            node_patch.insert(
                "__typename".to_owned(),
                Some(RecordValue::string("Post")),
            );
            node_patch.insert("id".to_owned(), Some(RecordValue::string(*node)));
            store.put_record(&node_id, node_patch).unwrap();

            let edge_id = format!("{canonical}.edges.{index}");
            let mut edge_patch = RecordPatch::new();
            edge_patch.insert(
                "cursor".to_owned(),
                Some(RecordValue::string(format!("c{node}"))),
            );
            edge_patch.insert("node".to_owned(), Some(RecordValue::Ref(node_id)));
            store.put_record(&edge_id, edge_patch).unwrap();
            edge_ids.push(edge_id);
        }
        let mut patch = RecordPatch::new();
        patch.insert("edges".to_owned(), Some(RecordValue::RefList(edge_ids)));
        store.put_record(canonical, patch).unwrap();
    }

    fn overlay_edges(layer: &OptimisticLayer, canonical: &str) -> Vec<String> {
        match layer.overlay_field(canonical, "edges") {
            Some(Some(RecordValue::RefList(edges))) => edges.clone(),
            _ => Vec::new(),
        }
    }

    #[test]
    fn write_fragment_overlays_fields_with_tombstone_support() {
        let store = store();
        let mut layer = OptimisticLayer::default();
        let data = json!({ "title": "Draft" }).as_object().cloned().unwrap();
        layer.begin(vec![OptimisticOp::WriteFragment {
            id: "Post:1".to_owned(),
            data,
        }]);
        let touched = layer.replay(&store);

        assert!(touched.contains("Post:1"));
        assert_eq!(
            layer.overlay_field("Post:1", "title"),
            Some(&Some(RecordValue::string("Draft")))
        );
    }

    #[test]
    fn removing_a_transaction_clears_its_overlay() {
        let store = store();
        let mut layer = OptimisticLayer::default();
        let data = json!({ "title": "Draft" }).as_object().cloned().unwrap();
        let tx = layer.begin(vec![OptimisticOp::WriteFragment {
            id: "Post:1".to_owned(),
            data,
        }]);
        layer.replay(&store);

        assert!(layer.remove(tx));
        let touched = layer.replay(&store);
        assert!(touched.contains("Post:1"));
        assert!(layer.overlay_record("Post:1").is_none());
    }

    #[test]
    fn add_and_remove_compose_over_the_base_list() {
        let mut store = store();
        let target = ConnectionTarget::root("posts");
        let canonical = target.canonical_id();
        seed_connection(&mut store, &canonical, &["1", "2", "3"]);

        let mut layer = OptimisticLayer::default();
        let node = |id: &str| {
            json!({ "__typename": "Post", "id": id })
                .as_object()
                .cloned()
                .unwrap()
        };
        layer.begin(vec![
            OptimisticOp::RemoveNode {
                target: target.clone(),
                node: node("2"),
            },
            OptimisticOp::AddNode {
                target: target.clone(),
                node: node("9"),
                position: AddPosition::Start,
            },
        ]);
        layer.replay(&store);

        let edges = overlay_edges(&layer, &canonical);
        assert_eq!(edges.len(), 3);
        assert!(edges[0].contains(".edges.@opt."));
        assert!(edges[1].ends_with(".edges.0"));
        assert!(edges[2].ends_with(".edges.2"));
    }

    #[test]
    fn replay_is_idempotent_on_a_stable_base() {
        let mut store = store();
        let target = ConnectionTarget::root("posts");
        let canonical = target.canonical_id();
        seed_connection(&mut store, &canonical, &["1"]);

        let mut layer = OptimisticLayer::default();
        let node = json!({ "__typename": "Post", "id": "9" })
            .as_object()
            .cloned()
            .unwrap();
        layer.begin(vec![OptimisticOp::AddNode {
            target,
            node,
            position: AddPosition::End,
        }]);

        let first = layer.replay(&store);
        assert!(!first.is_empty());
        let second = layer.replay(&store);
        assert!(second.is_empty(), "{second:?}");
    }
}
