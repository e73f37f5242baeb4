//! The operation pipeline.
//!
//! Queries execute under four cache policies; concurrent executions with
//! the same strict signature share one network round trip; every normalized
//! write fans out to watchers whose dependency keys it touched, once per
//! burst, FIFO per watcher.

use std::collections::HashMap;
use std::sync::Arc;

use futures::stream::BoxStream;
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::debug;
use tracing::trace;

use crate::cache::CacheShared;
use crate::cache::CacheState;
use crate::cache::GraphCache;
use crate::error::CacheError;
use crate::materialize;
use crate::normalize;
use crate::optimistic::OptimisticTxn;
use crate::plan::MaskMode;
use crate::plan::Plan;
use crate::plan::Variables;
use crate::transport::TransportRequest;
use crate::transport::TransportResponse;

pub type DataCallback = Arc<dyn Fn(&Value) + Send + Sync>;
/// Receives the cached tree and whether a network fetch will follow.
pub type CacheDataCallback = Arc<dyn Fn(&Value, bool) + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(&CacheError) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, strum_macros::Display)]
pub enum CachePolicy {
    /// Resolve from the cache or fail with `CacheMiss`; never touches the
    /// transport.
    #[strum(to_string = "cache-only")]
    CacheOnly,
    /// Resolve from the cache when complete, fetch otherwise.
    #[default]
    #[strum(to_string = "cache-first")]
    CacheFirst,
    /// Always fetch; the cache is written but not consulted.
    #[strum(to_string = "network-only")]
    NetworkOnly,
    /// Serve the cached tree immediately when present, then fetch and
    /// deliver the network result as well.
    #[strum(to_string = "cache-and-network")]
    CacheAndNetwork,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
    Cache,
    Network,
}

#[derive(Debug, Clone)]
pub struct QueryResponse {
    pub data: Value,
    pub source: ResponseSource,
}

pub struct QueryRequest {
    pub query: String,
    pub variables: Variables,
    pub policy: CachePolicy,
    pub on_cache_data: Option<CacheDataCallback>,
    pub on_network_data: Option<DataCallback>,
    pub on_error: Option<ErrorCallback>,
}

impl QueryRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            variables: Variables::new(),
            policy: CachePolicy::default(),
            on_cache_data: None,
            on_network_data: None,
            on_error: None,
        }
    }

    pub fn variables(mut self, variables: Variables) -> Self {
        self.variables = variables;
        self
    }

    pub fn policy(mut self, policy: CachePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn on_cache_data(mut self, f: impl Fn(&Value, bool) + Send + Sync + 'static) -> Self {
        self.on_cache_data = Some(Arc::new(f));
        self
    }

    pub fn on_network_data(mut self, f: impl Fn(&Value) + Send + Sync + 'static) -> Self {
        self.on_network_data = Some(Arc::new(f));
        self
    }

    pub fn on_error(mut self, f: impl Fn(&CacheError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }
}

pub struct MutationRequest {
    pub query: String,
    pub variables: Variables,
    pub(crate) optimistic: Option<Box<dyn FnOnce(&mut OptimisticTxn) + Send>>,
    pub on_complete: Option<DataCallback>,
    pub on_error: Option<ErrorCallback>,
}

impl MutationRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            variables: Variables::new(),
            optimistic: None,
            on_complete: None,
            on_error: None,
        }
    }

    pub fn variables(mut self, variables: Variables) -> Self {
        self.variables = variables;
        self
    }

    /// Records optimistic mutations that hold until the server answers.
    pub fn optimistic(mut self, f: impl FnOnce(&mut OptimisticTxn) + Send + 'static) -> Self {
        self.optimistic = Some(Box::new(f));
        self
    }

    pub fn on_complete(mut self, f: impl Fn(&Value) + Send + Sync + 'static) -> Self {
        self.on_complete = Some(Arc::new(f));
        self
    }

    pub fn on_error(mut self, f: impl Fn(&CacheError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }
}

pub struct SubscriptionRequest {
    pub query: String,
    pub variables: Variables,
}

impl SubscriptionRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            variables: Variables::new(),
        }
    }

    pub fn variables(mut self, variables: Variables) -> Self {
        self.variables = variables;
        self
    }
}

pub struct WatchRequest {
    pub query: String,
    pub variables: Variables,
    pub on_data: DataCallback,
    pub on_error: Option<ErrorCallback>,
    /// Deliver the current cached tree synchronously on subscribe.
    pub immediate: bool,
}

impl WatchRequest {
    pub fn new(query: impl Into<String>, on_data: impl Fn(&Value) + Send + Sync + 'static) -> Self {
        Self {
            query: query.into(),
            variables: Variables::new(),
            on_data: Arc::new(on_data),
            on_error: None,
            immediate: true,
        }
    }

    pub fn variables(mut self, variables: Variables) -> Self {
        self.variables = variables;
        self
    }

    pub fn immediate(mut self, immediate: bool) -> Self {
        self.immediate = immediate;
        self
    }

    pub fn on_error(mut self, f: impl Fn(&CacheError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }
}

pub(crate) struct WatchEntry {
    pub(crate) plan: Arc<Plan>,
    pub(crate) variables: Variables,
    pub(crate) on_data: DataCallback,
    pub(crate) on_error: Option<ErrorCallback>,
    pub(crate) delivered: bool,
}

/// One shared fetch: the waiters riding it and the task driving it.
#[derive(Default)]
pub(crate) struct InflightEntry {
    waiters: Vec<(u64, oneshot::Sender<Result<Value, CacheError>>)>,
    next_waiter: u64,
    abort: Option<tokio::task::AbortHandle>,
}

impl InflightEntry {
    fn add_waiter(&mut self) -> (u64, oneshot::Receiver<Result<Value, CacheError>>) {
        let id = self.next_waiter;
        self.next_waiter += 1;
        let (tx, rx) = oneshot::channel();
        self.waiters.push((id, tx));
        (id, rx)
    }
}

/// Removes this caller from the inflight set when its future is dropped;
/// the shared transport call is aborted once the last caller is gone.
struct WaiterGuard {
    shared: Arc<CacheShared>,
    signature: String,
    waiter: u64,
    armed: bool,
}

impl WaiterGuard {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for WaiterGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut inflight = self.shared.inflight.lock();
        if let Some(entry) = inflight.get_mut(&self.signature) {
            entry.waiters.retain(|(id, _)| *id != self.waiter);
            if entry.waiters.is_empty() {
                if let Some(abort) = &entry.abort {
                    abort.abort();
                }
                inflight.remove(&self.signature);
            }
        }
    }
}

impl GraphCache {
    /// Executes a query under its cache policy. The returned future is
    /// cancellable: dropping it removes this caller from the inflight set
    /// without cancelling a transport call other callers share.
    pub async fn execute_query(&self, request: QueryRequest) -> Result<QueryResponse, CacheError> {
        let result = self.execute_query_inner(&request).await;
        if let Err(error) = &result {
            if !error.is_recoverable() {
                if let Some(on_error) = &request.on_error {
                    on_error(error);
                }
            }
        }
        result
    }

    async fn execute_query_inner(
        &self,
        request: &QueryRequest,
    ) -> Result<QueryResponse, CacheError> {
        let plan = self.shared.plan_for(&request.query, None)?;
        let signature = plan.signature(MaskMode::Strict, &request.variables);

        let cached = || {
            let state = self.shared.state.lock();
            materialize::read(&state, &plan, &request.variables).data
        };

        match request.policy {
            CachePolicy::CacheOnly => match cached() {
                Some(data) => {
                    trace!(signature = %signature, "cache-only hit");
                    Ok(QueryResponse {
                        data,
                        source: ResponseSource::Cache,
                    })
                }
                None => Err(CacheError::CacheMiss { signature }),
            },
            CachePolicy::CacheFirst => {
                if let Some(data) = cached() {
                    trace!(signature = %signature, "cache-first hit");
                    if let Some(on_cache_data) = &request.on_cache_data {
                        on_cache_data(&data, false);
                    }
                    return Ok(QueryResponse {
                        data,
                        source: ResponseSource::Cache,
                    });
                }
                trace!(signature = %signature, "cache-first miss, fetching");
                let data = self
                    .fetch_shared(plan.clone(), request.variables.clone(), signature)
                    .await?;
                Ok(QueryResponse {
                    data,
                    source: ResponseSource::Network,
                })
            }
            CachePolicy::NetworkOnly => {
                let data = self
                    .fetch_shared(plan.clone(), request.variables.clone(), signature)
                    .await?;
                Ok(QueryResponse {
                    data,
                    source: ResponseSource::Network,
                })
            }
            CachePolicy::CacheAndNetwork => {
                if let Some(data) = cached() {
                    let hydrating = self.shared.state.lock().hydration.is_hydrating();
                    if hydrating {
                        // The graph was just restored; the network leg would
                        // be redundant.
                        if let Some(on_cache_data) = &request.on_cache_data {
                            on_cache_data(&data, false);
                        }
                        return Ok(QueryResponse {
                            data,
                            source: ResponseSource::Cache,
                        });
                    }
                    if let Some(on_cache_data) = &request.on_cache_data {
                        on_cache_data(&data, true);
                    }
                }
                let data = self
                    .fetch_shared(plan.clone(), request.variables.clone(), signature)
                    .await?;
                if let Some(on_network_data) = &request.on_network_data {
                    on_network_data(&data);
                }
                Ok(QueryResponse {
                    data,
                    source: ResponseSource::Network,
                })
            }
        }
    }

    /// Executes a mutation, applying and then resolving any optimistic
    /// transaction around the network round trip. Mutations are never
    /// de-duplicated.
    pub async fn execute_mutation(&self, request: MutationRequest) -> Result<Value, CacheError> {
        let MutationRequest {
            query,
            variables,
            optimistic,
            on_complete,
            on_error,
        } = request;
        let plan = match self.shared.plan_for(&query, None) {
            Ok(plan) => plan,
            Err(error) => {
                if let Some(on_error) = &on_error {
                    on_error(&error);
                }
                return Err(error);
            }
        };

        let tx = optimistic.map(|f| {
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
            dispatch_watchers(&self.shared, due);
            tx
        });

        let outcome = self.fetch_once(&plan, &variables).await.and_then(|data| {
            let object = data
                .as_object()
                .cloned()
                .ok_or_else(|| CacheError::internal("mutation payload must be an object"))?;
            let due = self.shared.write_with(|state| {
                if let Some(tx) = tx {
                    state.optimistic.remove(tx);
                }
                let mut changed = normalize::write_document(state, &plan, &variables, &object)?;
                let CacheState {
                    store, optimistic, ..
                } = &mut *state;
                changed.extend(optimistic.replay(store));
                Ok(changed)
            })?;
            dispatch_watchers(&self.shared, due);
            Ok(data)
        });

        match outcome {
            Ok(data) => {
                if let Some(on_complete) = &on_complete {
                    on_complete(&data);
                }
                Ok(data)
            }
            Err(error) => {
                // Roll the overlay back before surfacing.
                if let Some(tx) = tx {
                    let due = {
                        let mut state = self.shared.state.lock();
                        state.optimistic.remove(tx);
                        let CacheState {
                            store, optimistic, ..
                        } = &mut *state;
                        let changed = optimistic.replay(store);
                        state.store.due_watchers(&changed)
                    };
                    dispatch_watchers(&self.shared, due);
                }
                if !error.is_recoverable() {
                    if let Some(on_error) = &on_error {
                        on_error(&error);
                    }
                }
                Err(error)
            }
        }
    }

    /// Opens a subscription stream. Each event is normalized into the graph
    /// before it is yielded.
    pub fn execute_subscription(
        &self,
        request: SubscriptionRequest,
    ) -> Result<BoxStream<'static, Result<Value, CacheError>>, CacheError> {
        let plan = self.shared.plan_for(&request.query, None)?;
        let transport = self
            .shared
            .transport
            .clone()
            .ok_or_else(|| CacheError::Transport {
                message: "no transport configured".to_owned(),
            })?;
        let stream = transport.websocket(TransportRequest::new(
            plan.network_query.clone(),
            request.variables.clone(),
        ));
        let shared = self.shared.clone();
        let variables = request.variables;
        let mapped = stream.map(move |response| {
            let data = check_response(response)?;
            if let Some(object) = data.as_object() {
                let due = shared
                    .write_with(|state| normalize::write_document(state, &plan, &variables, object))?;
                dispatch_watchers(&shared, due);
            }
            Ok(data)
        });
        Ok(Box::pin(mapped))
    }

    /// Registers a watcher over a query. Its callback fires once per write
    /// burst that touches the watcher's dependency keys.
    pub fn watch_query(&self, request: WatchRequest) -> Result<WatchHandle, CacheError> {
        let plan = self.shared.plan_for(&request.query, None)?;
        let (watcher, initial) = {
            let mut state = self.shared.state.lock();
            let output = materialize::read(&state, &plan, &request.variables);
            let mut deps = plan.dependencies(MaskMode::Canonical, &request.variables);
            deps.extend(output.deps.iter().cloned());
            (state.store.subscribe(deps), output.data)
        };
        self.shared.watch.lock().insert(
            watcher,
            WatchEntry {
                plan,
                variables: request.variables,
                on_data: request.on_data.clone(),
                on_error: request.on_error,
                delivered: false,
            },
        );
        if request.immediate {
            if let Some(data) = &initial {
                if let Some(entry) = self.shared.watch.lock().get_mut(&watcher) {
                    entry.delivered = true;
                }
                (request.on_data)(data);
            }
        }
        Ok(WatchHandle {
            shared: self.shared.clone(),
            watcher,
        })
    }

    /// One de-duplicated network round trip. Callers with the same strict
    /// signature share the same transport call and normalization.
    async fn fetch_shared(
        &self,
        plan: Arc<Plan>,
        variables: Variables,
        signature: String,
    ) -> Result<Value, CacheError> {
        if self.shared.transport.is_none() {
            return Err(CacheError::Transport {
                message: "no transport configured".to_owned(),
            });
        }

        let (waiter, receiver, spawned) = {
            let mut inflight = self.shared.inflight.lock();
            match inflight.get_mut(&signature) {
                Some(entry) => {
                    trace!(signature = %signature, "joining inflight fetch");
                    let (waiter, receiver) = entry.add_waiter();
                    (waiter, receiver, false)
                }
                None => {
                    let mut entry = InflightEntry::default();
                    let (waiter, receiver) = entry.add_waiter();
                    inflight.insert(signature.clone(), entry);
                    (waiter, receiver, true)
                }
            }
        };

        if spawned {
            let shared = self.shared.clone();
            let task_signature = signature.clone();
            let handle = tokio::spawn(async move {
                run_fetch(shared, plan, variables, task_signature).await;
            });
            // The task may already have finished and removed the entry.
            if let Some(entry) = self.shared.inflight.lock().get_mut(&signature) {
                entry.abort = Some(handle.abort_handle());
            }
        }

        let guard = WaiterGuard {
            shared: self.shared.clone(),
            signature,
            waiter,
            armed: true,
        };
        let outcome = receiver.await;
        guard.disarm();
        outcome.unwrap_or_else(|_| Err(CacheError::internal("inflight fetch dropped")))
    }

    /// A plain transport round trip with error routing, no dedup, no cache
    /// write.
    async fn fetch_once(&self, plan: &Plan, variables: &Variables) -> Result<Value, CacheError> {
        let transport = self
            .shared
            .transport
            .clone()
            .ok_or_else(|| CacheError::Transport {
                message: "no transport configured".to_owned(),
            })?;
        let response = transport
            .http(TransportRequest::new(
                plan.network_query.clone(),
                variables.clone(),
            ))
            .await;
        check_response(response)
    }
}

fn check_response(response: TransportResponse) -> Result<Value, CacheError> {
    if let Some(message) = response.error {
        return Err(CacheError::Transport { message });
    }
    if !response.errors.is_empty() {
        return Err(CacheError::Combined {
            errors: response.errors,
        });
    }
    response.data.ok_or_else(|| CacheError::Transport {
        message: "transport returned no data".to_owned(),
    })
}

/// The shared fetch task: one transport call, one normalization, one
/// resolution broadcast to every waiter.
async fn run_fetch(
    shared: Arc<CacheShared>,
    plan: Arc<Plan>,
    variables: Variables,
    signature: String,
) {
    let epoch = shared.current_epoch();
    let response = match &shared.transport {
        Some(transport) => {
            transport
                .http(TransportRequest::new(
                    plan.network_query.clone(),
                    variables.clone(),
                ))
                .await
        }
        None => TransportResponse::error("no transport configured"),
    };

    let outcome = ingest_response(&shared, &plan, &variables, &signature, epoch, response);

    let waiters = shared
        .inflight
        .lock()
        .remove(&signature)
        .map(|entry| entry.waiters)
        .unwrap_or_default();
    for (_, waiter) in waiters {
        let _ = waiter.send(outcome.clone());
    }
}

fn ingest_response(
    shared: &Arc<CacheShared>,
    plan: &Plan,
    variables: &Variables,
    signature: &str,
    epoch: u64,
    response: TransportResponse,
) -> Result<Value, CacheError> {
    let data = check_response(response)?;
    let Some(object) = data.as_object() else {
        return Err(CacheError::Transport {
            message: "transport data is not an object".to_owned(),
        });
    };

    if shared.current_epoch() != epoch {
        // Superseded while in flight; the content is discarded and callers
        // recover from whatever local state the superseding write left.
        debug!(signature = %signature, error = %CacheError::StaleResponse, "discarding response");
        let state = shared.state.lock();
        return match materialize::read(&state, plan, variables).data {
            Some(value) => Ok(value),
            None => Err(CacheError::CacheMiss {
                signature: signature.to_owned(),
            }),
        };
    }

    let due = shared.write_with(|state| normalize::write_document(state, plan, variables, object))?;
    dispatch_watchers(shared, due);
    Ok(data)
}

/// Re-materializes each due watcher and delivers the fresh tree. Runs with
/// the cache lock released; deliveries are FIFO per watcher because bursts
/// are processed sequentially.
pub(crate) fn dispatch_watchers(shared: &Arc<CacheShared>, due: Vec<u64>) {
    for watcher in due {
        let entry = {
            let watch = shared.watch.lock();
            watch.get(&watcher).map(|entry| {
                (
                    entry.plan.clone(),
                    entry.variables.clone(),
                    entry.on_data.clone(),
                    entry.on_error.clone(),
                    entry.delivered,
                )
            })
        };
        let Some((plan, variables, on_data, on_error, delivered)) = entry else {
            continue;
        };

        let output = {
            let mut state = shared.state.lock();
            let output = materialize::read(&state, &plan, &variables);
            let mut deps = plan.dependencies(MaskMode::Canonical, &variables);
            deps.extend(output.deps.iter().cloned());
            state.store.update_watcher_deps(watcher, deps);
            output
        };

        match output.data {
            Some(data) => {
                if let Some(entry) = shared.watch.lock().get_mut(&watcher) {
                    entry.delivered = true;
                }
                on_data(&data);
            }
            None => {
                // The result became incomplete (eviction, reset). Fire and
                // forget; the watcher stays subscribed.
                if delivered {
                    if let Some(on_error) = on_error {
                        on_error(&CacheError::CacheMiss {
                            signature: plan.signature(MaskMode::Strict, &variables),
                        });
                    }
                }
            }
        }
    }
}

/// A live watch registration. Unsubscribing is immediate and idempotent;
/// dropping the handle does not unsubscribe.
pub struct WatchHandle {
    shared: Arc<CacheShared>,
    watcher: u64,
}

impl WatchHandle {
    /// Merges new variables into the watch and re-delivers from the cache.
    pub fn update(&self, partial: Variables) {
        let entry = {
            let mut watch = self.shared.watch.lock();
            let Some(entry) = watch.get_mut(&self.watcher) else {
                return;
            };
            for (name, value) in partial {
                entry.variables.insert(name, value);
            }
            (
                entry.plan.clone(),
                entry.variables.clone(),
                entry.on_data.clone(),
            )
        };
        let (plan, variables, on_data) = entry;

        let output = {
            let mut state = self.shared.state.lock();
            let output = materialize::read(&state, &plan, &variables);
            let mut deps = plan.dependencies(MaskMode::Canonical, &variables);
            deps.extend(output.deps.iter().cloned());
            state.store.update_watcher_deps(self.watcher, deps);
            output
        };
        if let Some(data) = output.data {
            if let Some(entry) = self.shared.watch.lock().get_mut(&self.watcher) {
                entry.delivered = true;
            }
            on_data(&data);
        }
    }

    pub fn unsubscribe(&self) {
        self.shared.watch.lock().shift_remove(&self.watcher);
        self.shared.state.lock().store.unsubscribe(self.watcher);
    }
}
