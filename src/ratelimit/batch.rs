//! Per-owner delta batching.
//!
//! Async-mode admissions accumulate here instead of blocking the request
//! path. A background flusher drains the queues on a fixed interval, or
//! early when an owner's batch reaches the byte cap, aggregates deltas per
//! counter, and pushes them to their origin nodes. Queues are bounded; on
//! overflow the oldest deltas are dropped (never the newest) and the loss is
//! counted.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::warn;

use crate::cluster::membership::Membership;
use crate::cluster::rpc::PeerClient;
use crate::cluster::rpc::PushCounterRequest;
use crate::cluster::types::NodeId;
use crate::counter::CounterMap;
use crate::counter::sequence_key;
use crate::ratelimit::breaker::CircuitBreaker;
use crate::ratelimit::types::CoordinatorStats;
use crate::time::TimeProvider;

/// One locally admitted cost awaiting convergence to its origin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delta {
    /// Origin node that owns the counter.
    pub owner: NodeId,
    /// Namespace the counter belongs to.
    pub namespace_id: String,
    /// Counter identifier (post edge-sharding).
    pub identifier: String,
    /// Admitted cost.
    pub delta: u64,
    /// Window the cost was admitted in.
    pub window_start_ms: u64,
    /// Limit parameter of the counter sequence.
    pub limit: u64,
    /// Duration parameter of the counter sequence.
    pub duration_ms: u64,
}

impl Delta {
    /// Rough wire-size estimate for the byte-cap trigger.
    fn size_estimate(&self) -> usize {
        self.namespace_id.len() + self.identifier.len() + 64
    }
}

#[derive(Default)]
struct OwnerQueue {
    deltas: VecDeque<Delta>,
    bytes: usize,
}

struct BatchInner {
    queues: Mutex<HashMap<NodeId, OwnerQueue>>,
    capacity: usize,
    max_bytes: usize,
    kick: Notify,
    stats: Arc<CoordinatorStats>,
}

/// Handle used by the hot path to enqueue deltas. Cheap to clone.
#[derive(Clone)]
pub struct BatchQueue {
    inner: Arc<BatchInner>,
}

impl BatchQueue {
    /// Enqueue a delta. Never blocks; overflow drops the oldest entry.
    pub fn push(&self, delta: Delta) {
        let kick = {
            let mut queues = self.inner.queues.lock();
            let queue = queues.entry(delta.owner.clone()).or_default();
            if queue.deltas.len() >= self.inner.capacity {
                if let Some(oldest) = queue.deltas.pop_front() {
                    queue.bytes = queue.bytes.saturating_sub(oldest.size_estimate());
                    self.inner.stats.deltas_dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
            queue.bytes += delta.size_estimate();
            queue.deltas.push_back(delta);
            queue.bytes >= self.inner.max_bytes
        };
        if kick {
            self.inner.kick.notify_one();
        }
    }

    /// Number of queued deltas across all owners.
    pub fn len(&self) -> usize {
        self.inner.queues.lock().values().map(|q| q.deltas.len()).sum()
    }

    /// Whether no delta is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Aggregation key: one `PushCounter` per distinct counter window.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct AggregateKey {
    namespace_id: String,
    identifier: String,
    window_start_ms: u64,
    limit: u64,
    duration_ms: u64,
}

/// Background flusher that drives deltas to their origins.
pub struct BatchFlusher {
    queue: BatchQueue,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Everything a flush round needs.
struct FlushContext {
    membership: Arc<Membership>,
    client: Arc<PeerClient>,
    counters: Arc<CounterMap>,
    breaker: Arc<CircuitBreaker>,
    stats: Arc<CoordinatorStats>,
    time: Arc<dyn TimeProvider>,
}

impl BatchFlusher {
    /// Start the flusher.
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        capacity: usize,
        max_bytes: usize,
        flush_interval_ms: u64,
        membership: Arc<Membership>,
        client: Arc<PeerClient>,
        counters: Arc<CounterMap>,
        breaker: Arc<CircuitBreaker>,
        stats: Arc<CoordinatorStats>,
        time: Arc<dyn TimeProvider>,
    ) -> Self {
        let inner = Arc::new(BatchInner {
            queues: Mutex::new(HashMap::new()),
            capacity,
            max_bytes,
            kick: Notify::new(),
            stats: stats.clone(),
        });
        let queue = BatchQueue { inner: inner.clone() };
        let context = FlushContext {
            membership,
            client,
            counters,
            breaker,
            stats,
            time,
        };

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(flush_interval_ms));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        // Final drain so graceful shutdown loses nothing.
                        Self::flush(&inner, &context).await;
                        return;
                    }
                    _ = ticker.tick() => Self::flush(&inner, &context).await,
                    _ = inner.kick.notified() => Self::flush(&inner, &context).await,
                }
            }
        });

        Self {
            queue,
            shutdown_tx,
            task,
        }
    }

    /// Hot-path handle for enqueueing.
    pub fn queue(&self) -> BatchQueue {
        self.queue.clone()
    }

    /// Drain once more and stop.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.task.await;
    }

    async fn flush(inner: &Arc<BatchInner>, context: &FlushContext) {
        let drained: HashMap<NodeId, OwnerQueue> = {
            let mut queues = inner.queues.lock();
            std::mem::take(&mut *queues)
        };
        if drained.is_empty() {
            return;
        }

        let pushes = drained.into_iter().map(|(owner, queue)| async move {
            Self::flush_owner(context, owner, queue.deltas).await;
        });
        join_all(pushes).await;
        context.stats.flushes.fetch_add(1, Ordering::Relaxed);
    }

    async fn flush_owner(context: &FlushContext, owner: NodeId, deltas: VecDeque<Delta>) {
        let mut aggregates: HashMap<AggregateKey, u64> = HashMap::new();
        for delta in deltas {
            *aggregates
                .entry(AggregateKey {
                    namespace_id: delta.namespace_id,
                    identifier: delta.identifier,
                    window_start_ms: delta.window_start_ms,
                    limit: delta.limit,
                    duration_ms: delta.duration_ms,
                })
                .or_default() += delta.delta;
        }

        let now_ms = context.time.now_unix_ms();
        let Some(member) = context.membership.member(&owner) else {
            // Owner left the cluster; these deltas cannot converge.
            context
                .stats
                .origin_push_failures
                .fetch_add(aggregates.len() as u64, Ordering::Relaxed);
            context.client.forget(&owner);
            debug!(owner = %owner, "dropping deltas for departed owner");
            return;
        };
        if !context.breaker.allow(&owner, now_ms) {
            context
                .stats
                .origin_push_failures
                .fetch_add(aggregates.len() as u64, Ordering::Relaxed);
            return;
        }

        for (key, delta) in aggregates {
            let request = PushCounterRequest {
                request_id: uuid::Uuid::new_v4().to_string(),
                namespace_id: key.namespace_id.clone(),
                identifier: key.identifier.clone(),
                delta,
                window_start_ms: key.window_start_ms,
                limit: key.limit,
                duration_ms: key.duration_ms,
            };
            match context.client.push_counter(&member, request).await {
                Ok(response) => {
                    context.breaker.record_success(&owner, context.time.now_unix_ms());
                    let counter_key = sequence_key(&key.namespace_id, &key.identifier, key.limit, key.duration_ms);
                    context.counters.converge(
                        &counter_key,
                        context.time.now_unix_ms(),
                        key.duration_ms,
                        key.window_start_ms,
                        response.current,
                    );
                }
                Err(err) => {
                    context.breaker.record_failure(&owner, context.time.now_unix_ms());
                    context.stats.origin_push_failures.fetch_add(1, Ordering::Relaxed);
                    warn!(owner = %owner, error = %err, "push counter failed");
                }
            }
        }
    }
}
