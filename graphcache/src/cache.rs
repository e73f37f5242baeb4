//! The owning cache structure.
//!
//! All subsystems operate on borrowed views of one [`CacheState`], which
//! lives behind a single coarse-grained lock: canonical updates span many
//! records, so per-record locking is not sound. Lock acquisitions are short
//! and never held across awaits; callbacks always run with the lock
//! released.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::Hash;
use std::hash::Hasher;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;
use indexmap::IndexSet;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::trace;

use crate::config::CacheOptions;
use crate::config::ConnectionSpec;
use crate::connection;
use crate::connection::ConnectionWrite;
use crate::error::CacheError;
use crate::graph::GraphStore;
use crate::graph::ROOT_ID;
use crate::hydration;
use crate::hydration::HydrationState;
use crate::materialize;
use crate::materialize::live::LiveResult;
use crate::normalize;
use crate::optimistic::OptimisticLayer;
use crate::optimistic::OptimisticTxn;
use crate::pipeline;
use crate::pipeline::InflightEntry;
use crate::pipeline::WatchEntry;
use crate::plan::compile;
use crate::plan::keys;
use crate::plan::Plan;
use crate::plan::PlanOptions;
use crate::plan::Variables;
use crate::transport::Transport;

/// Everything mutable, behind the one lock.
pub(crate) struct CacheState {
    pub(crate) store: GraphStore,
    pub(crate) optimistic: OptimisticLayer,
    pub(crate) hydration: HydrationState,
}

pub(crate) struct CacheShared {
    pub(crate) state: Mutex<CacheState>,
    pub(crate) plans: Mutex<HashMap<u64, Arc<Plan>>>,
    pub(crate) connections: IndexMap<String, IndexMap<String, ConnectionSpec>>,
    pub(crate) window_args: IndexSet<String>,
    pub(crate) hydration_timeout: Duration,
    pub(crate) transport: Option<Arc<dyn Transport>>,
    pub(crate) watch: Mutex<IndexMap<u64, WatchEntry>>,
    pub(crate) inflight: Mutex<HashMap<String, InflightEntry>>,
    /// Bumped by `clear` and `hydrate`; fetches that started under an older
    /// epoch are superseded and their content is discarded.
    pub(crate) epoch: AtomicU64,
}

impl CacheShared {
    pub(crate) fn current_epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    pub(crate) fn bump_epoch(&self) {
        self.epoch.fetch_add(1, Ordering::AcqRel);
    }

    /// Compiles or reuses the plan for a document. Plans are cached by a
    /// 64-bit hash of the source and the selected root.
    pub(crate) fn plan_for(
        &self,
        source: &str,
        fragment_name: Option<&str>,
    ) -> Result<Arc<Plan>, CacheError> {
        let mut hasher = DefaultHasher::new();
        source.hash(&mut hasher);
        fragment_name.hash(&mut hasher);
        let key = hasher.finish();

        if let Some(plan) = self.plans.lock().get(&key) {
            trace!(plan = plan.id, "plan cache hit");
            return Ok(plan.clone());
        }
        let options = PlanOptions {
            connections: self.connections.clone(),
            window_args: self.window_args.clone(),
            fragment_name: fragment_name.map(str::to_owned),
            operation_name: None,
        };
        let plan = Arc::new(compile(source, &options)?);
        trace!(plan = plan.id, "plan compiled");
        self.plans.lock().insert(key, plan.clone());
        Ok(plan)
    }

    /// Runs a write under the lock and returns the watchers due for the
    /// burst. The caller dispatches them with the lock released.
    pub(crate) fn write_with<F>(&self, f: F) -> Result<Vec<u64>, CacheError>
    where
        F: FnOnce(&mut CacheState) -> Result<IndexSet<String>, CacheError>,
    {
        let mut state = self.state.lock();
        let changed = f(&mut state)?;
        Ok(state.store.due_watchers(&changed))
    }
}

/// A normalized GraphQL client cache: answers from the local graph when it
/// can, fetches through the transport when it cannot, and keeps the two in
/// sync.
#[derive(Clone)]
pub struct GraphCache {
    pub(crate) shared: Arc<CacheShared>,
}

impl GraphCache {
    pub fn new(options: CacheOptions) -> Self {
        let window_args = options.resolved_window_args();
        let hydration_timeout = options.resolved_hydration_timeout();
        let store = GraphStore::new(options.keys, options.interfaces);
        Self {
            shared: Arc::new(CacheShared {
                state: Mutex::new(CacheState {
                    store,
                    optimistic: OptimisticLayer::default(),
                    hydration: HydrationState::default(),
                }),
                plans: Mutex::new(HashMap::new()),
                connections: options.connections,
                window_args,
                hydration_timeout,
                transport: options.transport,
                watch: Mutex::new(IndexMap::new()),
                inflight: Mutex::new(HashMap::new()),
                epoch: AtomicU64::new(0),
            }),
        }
    }

    /// The compiled plan for a document, from the per-document cache.
    pub fn plan(&self, source: &str) -> Result<Arc<Plan>, CacheError> {
        self.shared.plan_for(source, None)
    }

    /// Identity resolution for one payload object.
    pub fn identify(&self, object: &Value) -> Option<String> {
        let object = object.as_object()?;
        self.shared.state.lock().store.identify(object)
    }

    /// Reads a query from the graph. `None` when any required link or page
    /// is missing.
    pub fn read_query(
        &self,
        source: &str,
        variables: Variables,
    ) -> Result<Option<Value>, CacheError> {
        let plan = self.shared.plan_for(source, None)?;
        let state = self.shared.state.lock();
        Ok(materialize::read(&state, &plan, &variables).data)
    }

    /// Whether the graph can answer the query completely.
    pub fn has(&self, source: &str, variables: Variables) -> Result<bool, CacheError> {
        let plan = self.shared.plan_for(source, None)?;
        let state = self.shared.state.lock();
        Ok(materialize::has(&state, &plan, &variables))
    }

    /// Writes a query payload into the graph and notifies watchers.
    pub fn write_query(
        &self,
        source: &str,
        variables: Variables,
        data: Value,
    ) -> Result<(), CacheError> {
        let plan = self.shared.plan_for(source, None)?;
        let data = data
            .as_object()
            .cloned()
            .ok_or_else(|| CacheError::internal("write_query payload must be an object"))?;
        let due = self
            .shared
            .write_with(|state| normalize::write_document(state, &plan, &variables, &data))?;
        pipeline::dispatch_watchers(&self.shared, due);
        Ok(())
    }

    /// Reads a fragment rooted at a record id. The fragment is picked by
    /// name, or the document's only fragment when `None`.
    pub fn read_fragment(
        &self,
        id: &str,
        source: &str,
        fragment_name: Option<&str>,
    ) -> Result<Option<Value>, CacheError> {
        let plan = self
            .shared
            .plan_for(source, fragment_name.or(Some("")))?;
        let state = self.shared.state.lock();
        Ok(materialize::read_fragment(&state, &plan, id))
    }

    pub fn write_fragment(
        &self,
        id: &str,
        source: &str,
        fragment_name: Option<&str>,
        data: Value,
    ) -> Result<(), CacheError> {
        let plan = self
            .shared
            .plan_for(source, fragment_name.or(Some("")))?;
        let data = data
            .as_object()
            .cloned()
            .ok_or_else(|| CacheError::internal("write_fragment payload must be an object"))?;
        let id = id.to_owned();
        let due = self.shared.write_with(|state| {
            normalize::write_fragment(state, &plan, &Variables::new(), &id, &data)
        })?;
        pipeline::dispatch_watchers(&self.shared, due);
        Ok(())
    }

    /// Begins an optimistic transaction. The closure records structured
    /// mutations; the returned handle commits or reverts them.
    pub fn modify_optimistic(&self, f: impl FnOnce(&mut OptimisticTxn)) -> OptimisticHandle {
        let mut txn = OptimisticTxn::default();
        f(&mut txn);

        let (tx, due) = {
            let mut state = self.shared.state.lock();
            let tx = state.optimistic.begin(txn.ops);
            let CacheState {
                store, optimistic, ..
            } = &mut *state;
            let changed = optimistic.replay(store);
            (tx, state.store.due_watchers(&changed))
        };
        pipeline::dispatch_watchers(&self.shared, due);
        OptimisticHandle {
            shared: self.shared.clone(),
            tx,
        }
    }

    /// Replays already-cached concrete pages of a query's root connections
    /// through the canonical engine. Useful after partial restores where
    /// pages survived but canonical views did not; replay order does not
    /// affect the outcome.
    pub fn prewarm(&self, source: &str, variables: Variables) -> Result<(), CacheError> {
        let plan = self.shared.plan_for(source, None)?;
        let due = self.shared.write_with(|state| {
            let mut changed = IndexSet::new();
            for field in &plan.root {
                if !field.is_connection {
                    continue;
                }
                let field_key = field.field_key(&variables);
                let page_key = keys::page_key(ROOT_ID, &field_key);
                if state.store.get_record(&page_key).is_none() {
                    continue;
                }
                connection::merge_from_cache(
                    state,
                    ConnectionWrite {
                        field,
                        parent_id: ROOT_ID,
                        variables: &variables,
                        page_key: &page_key,
                        window_args: &plan.window_args,
                    },
                    &mut changed,
                )?;
            }
            Ok(changed)
        })?;
        pipeline::dispatch_watchers(&self.shared, due);
        Ok(())
    }

    /// Removes one record. Watchers depending on it re-materialize.
    pub fn evict(&self, id: &str) -> bool {
        let (existed, due) = {
            let mut state = self.shared.state.lock();
            let existed = state.store.remove_record(id);
            let mut changed = IndexSet::new();
            changed.insert(id.to_owned());
            (existed, state.store.due_watchers(&changed))
        };
        pipeline::dispatch_watchers(&self.shared, due);
        existed
    }

    /// Empties the graph and notifies a global reset.
    pub fn clear(&self) {
        self.shared.bump_epoch();
        let due = {
            let mut state = self.shared.state.lock();
            state.store.clear()
        };
        pipeline::dispatch_watchers(&self.shared, due);
    }

    /// Every record id currently in the graph.
    pub fn record_keys(&self) -> Vec<String> {
        self.shared.state.lock().store.keys().cloned().collect()
    }

    /// The base (non-overlaid) snapshot of one record, as JSON.
    pub fn record(&self, id: &str) -> Option<Value> {
        self.shared
            .state
            .lock()
            .store
            .get_record(id)
            .map(|record| record.to_json())
    }

    /// A live projection of a query: the materialized tree plus the record
    /// ids it depends on. Call [`refresh`](Self::refresh) when any of them
    /// change.
    pub fn materialize(
        &self,
        source: &str,
        variables: Variables,
    ) -> Result<LiveResult, CacheError> {
        let plan = self.shared.plan_for(source, None)?;
        let state = self.shared.state.lock();
        Ok(LiveResult::build(&state, plan, variables))
    }

    /// Rebuilds a live result against current state; true when the visible
    /// data changed.
    pub fn refresh(&self, live: &mut LiveResult) -> bool {
        let state = self.shared.state.lock();
        live.refresh_with(&state)
    }

    /// Resolves one record to plain JSON, overlay included, following
    /// references.
    pub fn materialize_record(&self, id: &str) -> Option<Value> {
        let state = self.shared.state.lock();
        materialize::materialize_record(&state, id).map(|(value, _)| value)
    }

    /// Serializes the graph for SSR transfer.
    pub fn dehydrate(&self) -> Value {
        let state = self.shared.state.lock();
        hydration::dehydrate(&state)
    }

    /// Clears and restores the graph from a dehydrated snapshot, then
    /// suppresses redundant fetches for the configured hydration window.
    pub fn hydrate(&self, snapshot: &Value) -> Result<(), CacheError> {
        self.hydrate_with_timeout(snapshot, self.shared.hydration_timeout)
    }

    /// [`hydrate`](Self::hydrate) with an explicit suppression window.
    pub fn hydrate_with_timeout(
        &self,
        snapshot: &Value,
        timeout: Duration,
    ) -> Result<(), CacheError> {
        self.shared.bump_epoch();
        let due = {
            let mut state = self.shared.state.lock();
            hydration::hydrate(&mut state, snapshot, timeout)?;
            // A restore is a global reset: every watcher re-materializes.
            state.store.watcher_ids()
        };
        pipeline::dispatch_watchers(&self.shared, due);
        Ok(())
    }

    pub fn is_hydrating(&self) -> bool {
        self.shared.state.lock().hydration.is_hydrating()
    }
}

/// Commit and revert both drop the transaction and replay the rest of the
/// log; the difference is whether the server's truth already landed in the
/// base by then.
pub struct OptimisticHandle {
    shared: Arc<CacheShared>,
    tx: u64,
}

impl OptimisticHandle {
    pub fn commit(self) {
        self.finish();
    }

    pub fn revert(self) {
        self.finish();
    }

    fn finish(self) {
        let due = {
            let mut state = self.shared.state.lock();
            state.optimistic.remove(self.tx);
            let CacheState {
                store, optimistic, ..
            } = &mut *state;
            let changed = optimistic.replay(store);
            state.store.due_watchers(&changed)
        };
        pipeline::dispatch_watchers(&self.shared, due);
    }
}

const _: () = {
    const fn assert_thread_safe<T: Sync + Send>() {}

    assert_thread_safe::<GraphCache>();
};
