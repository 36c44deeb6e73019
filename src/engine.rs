//! The request merge engine.
//!
//! Wraps an underlying [`Transport`] and coalesces concurrent identical
//! requests: at most one underlying call per distinct dedup key, at most
//! `concurrency_limit` underlying calls in flight overall, FIFO promotion
//! of requests parked behind an exhausted budget.
//!
//! All shared state (dedup table, budget, pending queue) lives behind one
//! mutex so every read-modify-write sequence is serialized. The lock is
//! only ever held for non-blocking sections; callers suspend on their own
//! oneshot receiver, never on the lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::budget::ConcurrencyBudget;
use crate::config::EngineConfig;
use crate::error::{CallResult, ConfigError, MergeError};
use crate::key::{DedupKey, KeyPolicy};
use crate::queue::{PendingQueue, QueuedCall};
use crate::telemetry;
use crate::transport::{HttpRequest, HttpResponse, Transport, TransportError};

type Waiter = (u64, oneshot::Sender<CallResult>);

/// One dispatched call with a dedup key. Holds every caller waiting on the
/// shared result; removed when the call completes or the last waiter leaves.
struct InFlightEntry {
    /// Notification order is insertion order.
    waiters: Vec<Waiter>,
    cancel: CancellationToken,
    dispatched_at: Instant,
    /// Ties completions to this dispatch. A cancelled call's late
    /// completion must not touch a newer entry under the same key.
    generation: u64,
}

/// A dispatched call that bypassed merging (no dedup key). Exactly one
/// waiter, tracked so a dropped caller can still cancel it.
struct UnkeyedEntry {
    tx: oneshot::Sender<CallResult>,
    cancel: CancellationToken,
    dispatched_at: Instant,
}

/// Which dispatched call a completion belongs to.
#[derive(Clone, Copy)]
enum DispatchId {
    Keyed(DedupKey, u64),
    Unkeyed(u64),
}

struct EngineState {
    in_flight: HashMap<DedupKey, InFlightEntry>,
    unkeyed: HashMap<u64, UnkeyedEntry>,
    pending: PendingQueue,
    budget: ConcurrencyBudget,
}

#[derive(Default)]
struct StatsInner {
    total: AtomicU64,
    merged: AtomicU64,
    dispatched: AtomicU64,
    queued: AtomicU64,
}

struct EngineInner {
    transport: Arc<dyn Transport>,
    policy: KeyPolicy,
    state: Mutex<EngineState>,
    next_waiter_id: AtomicU64,
    next_dispatch: AtomicU64,
    stats: StatsInner,
}

/// Point-in-time engine counters.
#[derive(Debug, Clone, Default)]
pub struct EngineStats {
    /// Requests received by [`MergeEngine::execute`].
    pub total_requests: u64,
    /// Requests that attached to an existing in-flight call.
    pub merged_requests: u64,
    /// Underlying calls dispatched.
    pub dispatched_calls: u64,
    /// Requests that were parked in the pending queue at least once.
    pub queued_requests: u64,
    /// Currently dispatched underlying calls.
    pub in_flight: usize,
    /// Currently parked requests.
    pub queue_depth: usize,
}

impl EngineStats {
    /// Fraction of requests served without a dedicated underlying call.
    pub fn merge_ratio(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.merged_requests as f64 / self.total_requests as f64
        }
    }
}

/// Request-merging wrapper around an underlying transport.
///
/// Cheap to clone; all clones share one dedup table and budget.
#[derive(Clone)]
pub struct MergeEngine {
    inner: Arc<EngineInner>,
}

impl MergeEngine {
    /// Create an engine from a full configuration.
    pub fn new(transport: Arc<dyn Transport>, config: EngineConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(EngineInner {
                transport,
                policy: config.key_policy,
                state: Mutex::new(EngineState {
                    in_flight: HashMap::new(),
                    unkeyed: HashMap::new(),
                    pending: PendingQueue::new(config.max_pending),
                    budget: ConcurrencyBudget::new(config.concurrency_limit),
                }),
                next_waiter_id: AtomicU64::new(1),
                next_dispatch: AtomicU64::new(1),
                stats: StatsInner::default(),
            }),
        })
    }

    /// Shorthand: wrap `transport` with the given concurrency limit and
    /// default settings otherwise.
    pub fn with_limit(
        transport: Arc<dyn Transport>,
        concurrency_limit: usize,
    ) -> Result<Self, ConfigError> {
        Self::new(transport, EngineConfig { concurrency_limit, ..EngineConfig::default() })
    }

    /// Issue a request through the merge layer.
    ///
    /// Identical concurrent requests share one underlying call and all
    /// receive the same result, success or failure. Dropping the returned
    /// future detaches this caller only; the shared call is cancelled when
    /// its last waiter detaches.
    pub async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, MergeError> {
        let key = self.inner.policy.key_for(&request);
        let waiter_id = self.inner.next_waiter_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();

        self.inner.submit(waiter_id, key, request, tx)?;

        let mut guard = WaiterGuard {
            inner: Arc::clone(&self.inner),
            waiter_id,
            key,
            armed: true,
        };
        let outcome = rx.await;
        guard.disarm();
        match outcome {
            Ok(result) => result,
            // Sender dropped without delivering: engine state was torn
            // down mid-flight.
            Err(_) => Err(MergeError::Cancelled),
        }
    }

    /// Snapshot of engine counters and gauges.
    pub fn stats(&self) -> EngineStats {
        let state = self.inner.state.lock();
        EngineStats {
            total_requests: self.inner.stats.total.load(Ordering::Relaxed),
            merged_requests: self.inner.stats.merged.load(Ordering::Relaxed),
            dispatched_calls: self.inner.stats.dispatched.load(Ordering::Relaxed),
            queued_requests: self.inner.stats.queued.load(Ordering::Relaxed),
            in_flight: state.in_flight.len() + state.unkeyed.len(),
            queue_depth: state.pending.len(),
        }
    }

    /// Configured concurrency limit.
    pub fn concurrency_limit(&self) -> usize {
        self.inner.state.lock().budget.limit()
    }
}

impl std::fmt::Debug for MergeEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("MergeEngine")
            .field("concurrency_limit", &state.budget.limit())
            .field("in_flight", &state.in_flight.len())
            .field("queue_depth", &state.pending.len())
            .finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl Transport for MergeEngine {
    /// Engines stack: a `MergeEngine` can itself serve as the underlying
    /// transport of another wrapper.
    async fn call(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        self.execute(request).await.map_err(TransportError::from)
    }
}

impl EngineInner {
    /// Route a request: attach, dispatch, or park. Never blocks.
    fn submit(
        self: &Arc<Self>,
        waiter_id: u64,
        key: Option<DedupKey>,
        request: HttpRequest,
        tx: oneshot::Sender<CallResult>,
    ) -> Result<(), MergeError> {
        let mut state = self.state.lock();
        self.stats.total.fetch_add(1, Ordering::Relaxed);
        telemetry::record_request();

        if let Some(k) = key {
            if let Some(entry) = state.in_flight.get_mut(&k) {
                entry.waiters.push((waiter_id, tx));
                self.stats.merged.fetch_add(1, Ordering::Relaxed);
                telemetry::record_merged();
                tracing::debug!(key = %k, waiters = entry.waiters.len(), "merged into in-flight call");
                return Ok(());
            }
        }

        if state.budget.try_acquire() {
            match key {
                Some(k) => self.dispatch_keyed_locked(&mut state, k, request, (waiter_id, tx)),
                None => self.dispatch_unkeyed_locked(&mut state, waiter_id, request, tx),
            }
            return Ok(());
        }

        let depth = state
            .pending
            .push(QueuedCall { waiter_id, key, request, tx, enqueued_at: Instant::now() })
            .map_err(|full| MergeError::QueueFull { current: full.current, max: full.max })?;
        self.stats.queued.fetch_add(1, Ordering::Relaxed);
        telemetry::record_queue_depth(depth);
        tracing::debug!(depth, "budget exhausted, request parked");
        Ok(())
    }

    /// Caller holds the lock and has already acquired budget.
    fn dispatch_keyed_locked(
        self: &Arc<Self>,
        state: &mut EngineState,
        key: DedupKey,
        request: HttpRequest,
        waiter: Waiter,
    ) {
        let cancel = CancellationToken::new();
        let generation = self.next_dispatch.fetch_add(1, Ordering::Relaxed);
        state.in_flight.insert(
            key,
            InFlightEntry {
                waiters: vec![waiter],
                cancel: cancel.clone(),
                dispatched_at: Instant::now(),
                generation,
            },
        );
        self.stats.dispatched.fetch_add(1, Ordering::Relaxed);
        telemetry::record_dispatch();
        tracing::debug!(
            key = %key,
            dispatched = state.budget.dispatched(),
            "dispatching underlying call"
        );
        self.spawn_call(DispatchId::Keyed(key, generation), request, cancel);
    }

    /// Caller holds the lock and has already acquired budget.
    fn dispatch_unkeyed_locked(
        self: &Arc<Self>,
        state: &mut EngineState,
        waiter_id: u64,
        request: HttpRequest,
        tx: oneshot::Sender<CallResult>,
    ) {
        let cancel = CancellationToken::new();
        state.unkeyed.insert(
            waiter_id,
            UnkeyedEntry { tx, cancel: cancel.clone(), dispatched_at: Instant::now() },
        );
        self.stats.dispatched.fetch_add(1, Ordering::Relaxed);
        telemetry::record_dispatch();
        tracing::debug!(
            dispatched = state.budget.dispatched(),
            "dispatching unmerged underlying call"
        );
        self.spawn_call(DispatchId::Unkeyed(waiter_id), request, cancel);
    }

    fn spawn_call(self: &Arc<Self>, id: DispatchId, request: HttpRequest, cancel: CancellationToken) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let outcome = tokio::select! {
                biased;
                () = cancel.cancelled() => None,
                result = inner.transport.call(request) => Some(result),
            };
            inner.complete(id, outcome);
        });
    }

    /// Underlying call finished (or was cancelled): fan out, release
    /// budget, promote parked requests.
    fn complete(self: &Arc<Self>, id: DispatchId, outcome: Option<Result<HttpResponse, TransportError>>) {
        let mut state = self.state.lock();
        state.budget.release();

        match id {
            DispatchId::Keyed(key, generation) => {
                // The entry is gone already if the last waiter detached
                // and triggered the cancellation. A mismatched generation
                // means a fresh dispatch replaced the entry after that;
                // it belongs to a different call and stays untouched.
                let current = state
                    .in_flight
                    .get(&key)
                    .is_some_and(|entry| entry.generation == generation);
                if current {
                    if let Some(entry) = state.in_flight.remove(&key) {
                        if let Some(result) = outcome {
                            fan_out(key, entry, result);
                        }
                    }
                }
            }
            DispatchId::Unkeyed(waiter_id) => {
                if let Some(entry) = state.unkeyed.remove(&waiter_id) {
                    if let Some(result) = outcome {
                        let result = result.map_err(MergeError::Transport);
                        telemetry::record_call(entry.dispatched_at.elapsed(), result.is_ok());
                        let _ = entry.tx.send(result);
                    }
                }
            }
        }

        self.promote_locked(&mut state);
        telemetry::record_queue_depth(state.pending.len());
    }

    /// Drain the pending queue into freed budget, strict FIFO. A promoted
    /// request whose key meanwhile became in-flight attaches instead of
    /// dispatching and consumes no budget, so the head is inspected before
    /// capacity is checked: attachment proceeds even with the budget
    /// exhausted.
    fn promote_locked(self: &Arc<Self>, state: &mut EngineState) {
        loop {
            let Some(next_key) = state.pending.peek().map(|call| call.key) else { break };
            let attaches = next_key.is_some_and(|k| state.in_flight.contains_key(&k));
            if !attaches && !state.budget.has_capacity() {
                break;
            }

            let Some(call) = state.pending.pop() else { break };
            tracing::debug!(
                waited_ms = call.enqueued_at.elapsed().as_millis() as u64,
                "promoting parked request"
            );
            telemetry::record_queue_wait(call.enqueued_at.elapsed());

            if let Some(k) = call.key {
                if let Some(entry) = state.in_flight.get_mut(&k) {
                    entry.waiters.push((call.waiter_id, call.tx));
                    self.stats.merged.fetch_add(1, Ordering::Relaxed);
                    telemetry::record_merged();
                    continue;
                }
            }

            let acquired = state.budget.try_acquire();
            debug_assert!(acquired, "capacity checked before pop");
            match call.key {
                Some(k) => {
                    self.dispatch_keyed_locked(state, k, call.request, (call.waiter_id, call.tx));
                }
                None => {
                    self.dispatch_unkeyed_locked(state, call.waiter_id, call.request, call.tx);
                }
            }
        }
    }

    /// A caller gave up before its result arrived. Detach it wherever it
    /// currently lives; cancel the underlying call only when it has no
    /// waiters left.
    fn detach_waiter(self: &Arc<Self>, waiter_id: u64, key: Option<DedupKey>) {
        let mut state = self.state.lock();

        if state.pending.remove(waiter_id).is_some() {
            telemetry::record_queue_depth(state.pending.len());
            tracing::debug!("parked caller detached");
            return;
        }

        if let Some(k) = key {
            let abandoned = match state.in_flight.get_mut(&k) {
                Some(entry) => {
                    let before = entry.waiters.len();
                    entry.waiters.retain(|(id, _)| *id != waiter_id);
                    // The waiter-id check matters: a fresh entry for the
                    // same key must not be cancelled by a stale detach.
                    entry.waiters.len() < before && entry.waiters.is_empty()
                }
                None => false,
            };
            if abandoned {
                if let Some(entry) = state.in_flight.remove(&k) {
                    tracing::debug!(key = %k, "last waiter detached, cancelling call");
                    entry.cancel.cancel();
                }
            }
            return;
        }

        if let Some(entry) = state.unkeyed.remove(&waiter_id) {
            tracing::debug!("unmerged caller detached, cancelling call");
            entry.cancel.cancel();
        }
    }
}

fn fan_out(key: DedupKey, entry: InFlightEntry, result: Result<HttpResponse, TransportError>) {
    let result: CallResult = result.map_err(MergeError::Transport);
    telemetry::record_call(entry.dispatched_at.elapsed(), result.is_ok());
    tracing::debug!(
        key = %key,
        waiters = entry.waiters.len(),
        ok = result.is_ok(),
        "call completed, notifying waiters"
    );
    // Insertion order; a send error just means that waiter is gone.
    for (_, tx) in entry.waiters {
        let _ = tx.send(result.clone());
    }
}

/// Undoes a caller's registration if its `execute` future is dropped
/// before the result arrives.
struct WaiterGuard {
    inner: Arc<EngineInner>,
    waiter_id: u64,
    key: Option<DedupKey>,
    armed: bool,
}

impl WaiterGuard {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for WaiterGuard {
    fn drop(&mut self) {
        if self.armed {
            self.inner.detach_waiter(self.waiter_id, self.key);
        }
    }
}
