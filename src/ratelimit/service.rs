//! The limiter coordinator: composes counters, cache-backed policy
//! resolution, and the cluster fabric into the `limit` operation.
//!
//! Per call: resolve the effective policy, snapshot the ring once, locate
//! the counter's owner, take the local sliding-window decision, then either
//! respond immediately and converge asynchronously (`async_mode`) or consult
//! the owner synchronously. The ring snapshot is never retargeted mid-call;
//! membership churn affects only subsequent calls.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use async_trait::async_trait;
use tracing::debug;
use tracing::warn;

use crate::cluster::error::ClusterError;
use crate::cluster::membership::Membership;
use crate::cluster::rpc::BroadcastExceededRequest;
use crate::cluster::rpc::DedupeWindow;
use crate::cluster::rpc::PeerClient;
use crate::cluster::rpc::PushCounterRequest;
use crate::cluster::rpc::PushCounterResponse;
use crate::cluster::rpc::RpcHandler;
use crate::cluster::types::NodeId;
use crate::constants::RPC_DEDUPE_WINDOW_FACTOR;
use crate::counter::CounterMap;
use crate::counter::WindowDecision;
use crate::counter::sequence_key;
use crate::counter::window_start;
use crate::overrides::resolver::OverrideResolver;
use crate::overrides::types::EffectivePolicy;
use crate::overrides::types::LimitDefaults;
use crate::overrides::types::Sharding;
use crate::ratelimit::batch::BatchQueue;
use crate::ratelimit::batch::Delta;
use crate::ratelimit::breaker::CircuitBreaker;
use crate::ratelimit::types::CoordinatorStats;
use crate::ratelimit::types::RatelimitError;
use crate::ratelimit::types::RatelimitRequest;
use crate::ratelimit::types::RatelimitResponse;
use crate::time::TimeProvider;

/// The orchestrator on the hot path.
pub struct RatelimitService {
    membership: Arc<Membership>,
    counters: Arc<CounterMap>,
    resolver: Arc<OverrideResolver>,
    client: Arc<PeerClient>,
    batch: BatchQueue,
    breaker: Arc<CircuitBreaker>,
    dedupe: DedupeWindow,
    stats: Arc<CoordinatorStats>,
    time: Arc<dyn TimeProvider>,
    edge_tag: String,
}

impl RatelimitService {
    /// Wire the coordinator together.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        membership: Arc<Membership>,
        counters: Arc<CounterMap>,
        resolver: Arc<OverrideResolver>,
        client: Arc<PeerClient>,
        batch: BatchQueue,
        breaker: Arc<CircuitBreaker>,
        stats: Arc<CoordinatorStats>,
        time: Arc<dyn TimeProvider>,
        edge_tag: String,
    ) -> Self {
        Self {
            membership,
            counters,
            resolver,
            client,
            batch,
            breaker,
            dedupe: DedupeWindow::new(),
            stats,
            time,
            edge_tag,
        }
    }

    /// Observability snapshot.
    pub fn stats(&self) -> &CoordinatorStats {
        &self.stats
    }

    /// The counter table (shared with the janitor).
    pub fn counters(&self) -> &Arc<CounterMap> {
        &self.counters
    }

    /// Decide one limit call under a caller-propagated deadline.
    ///
    /// Work beyond the deadline is abandoned, but any local counter
    /// increment already committed stays committed.
    pub async fn limit_with_deadline(
        &self,
        request: &RatelimitRequest,
        can_create_namespace: bool,
        deadline: std::time::Duration,
    ) -> Result<RatelimitResponse, RatelimitError> {
        match tokio::time::timeout(deadline, self.limit(request, can_create_namespace)).await {
            Ok(result) => result,
            Err(_) => Err(RatelimitError::DeadlineExceeded {
                deadline_ms: deadline.as_millis() as u64,
            }),
        }
    }

    /// Decide one limit call.
    pub async fn limit(
        &self,
        request: &RatelimitRequest,
        can_create_namespace: bool,
    ) -> Result<RatelimitResponse, RatelimitError> {
        let resolved = self
            .resolver
            .resolve(
                &request.workspace_id,
                &request.namespace,
                &request.identifier,
                LimitDefaults {
                    limit: request.limit,
                    duration_ms: request.duration_ms,
                    async_mode: request.async_mode,
                },
                can_create_namespace,
            )
            .await?;
        let policy = resolved.policy;
        let namespace_id = resolved.namespace.id;

        let identifier = self.effective_identifier(&policy, &request.identifier);
        let key = sequence_key(&namespace_id, &identifier, policy.limit, policy.duration_ms);
        let now_ms = self.time.now_unix_ms();

        // One ring snapshot per call; never retargeted mid-call.
        let ring = self.membership.ring();
        let owner = ring
            .owner(&format!("{namespace_id}:{identifier}"))
            .cloned()
            .unwrap_or_else(|| self.membership.local_node_id().clone());
        let is_owner = owner == *self.membership.local_node_id();

        // Peek: never mutates, never errors, regardless of mode or owner.
        if request.cost == 0 {
            let decision = self.counters.apply(&key, now_ms, policy.limit, policy.duration_ms, 0);
            return Ok(Self::respond(&policy, decision));
        }

        let decision = self
            .counters
            .apply(&key, now_ms, policy.limit, policy.duration_ms, request.cost);

        if is_owner || policy.async_mode {
            if !is_owner && decision.passed {
                self.batch.push(Delta {
                    owner,
                    namespace_id,
                    identifier: identifier.clone(),
                    delta: request.cost,
                    window_start_ms: window_start(now_ms, policy.duration_ms),
                    limit: policy.limit,
                    duration_ms: policy.duration_ms,
                });
            }
            return Ok(Self::respond(&policy, decision));
        }

        // Sync path: the owner's decision is the answer. A local deny is
        // final (the owner could only be stricter); an admitted cost is
        // pushed synchronously.
        if !decision.passed {
            return Ok(Self::respond(&policy, decision));
        }
        self.sync_consult(
            owner,
            &namespace_id,
            &identifier,
            &key,
            &policy,
            request.cost,
            now_ms,
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn sync_consult(
        &self,
        owner: NodeId,
        namespace_id: &str,
        identifier: &str,
        key: &str,
        policy: &EffectivePolicy,
        cost: u64,
        now_ms: u64,
    ) -> Result<RatelimitResponse, RatelimitError> {
        if !self.breaker.allow(&owner, now_ms) {
            // Open breaker: the shadow counter is authoritative for now.
            self.stats.breaker_short_circuits.fetch_add(1, Ordering::Relaxed);
            let decision = self.counters.apply(key, now_ms, policy.limit, policy.duration_ms, 0);
            return Ok(Self::respond_with_success(policy, decision, true));
        }

        let Some(member) = self.membership.member(&owner) else {
            return Err(RatelimitError::OriginUnavailable {
                owner,
                reason: "owner not in member table".to_string(),
            });
        };

        let request = PushCounterRequest {
            request_id: uuid::Uuid::new_v4().to_string(),
            namespace_id: namespace_id.to_string(),
            identifier: identifier.to_string(),
            delta: cost,
            window_start_ms: window_start(now_ms, policy.duration_ms),
            limit: policy.limit,
            duration_ms: policy.duration_ms,
        };

        match self.client.push_counter(&member, request).await {
            Ok(response) => {
                self.breaker.record_success(&owner, self.time.now_unix_ms());
                let after_ms = self.time.now_unix_ms();
                self.counters.converge(
                    key,
                    after_ms,
                    policy.duration_ms,
                    window_start(now_ms, policy.duration_ms),
                    response.current,
                );
                // Remaining from the converged shadow so interpolation still
                // applies.
                let peek = self.counters.apply(key, after_ms, policy.limit, policy.duration_ms, 0);
                Ok(RatelimitResponse {
                    success: response.passed,
                    limit: policy.limit,
                    remaining: if response.passed { peek.remaining } else { 0 },
                    reset_at_ms: response.reset_at_ms,
                    override_id: policy.override_id.clone(),
                })
            }
            Err(err) => {
                self.breaker.record_failure(&owner, self.time.now_unix_ms());
                self.stats.origin_push_failures.fetch_add(1, Ordering::Relaxed);
                Err(RatelimitError::OriginUnavailable {
                    owner,
                    reason: err.to_string(),
                })
            }
        }
    }

    fn effective_identifier(&self, policy: &EffectivePolicy, identifier: &str) -> String {
        match policy.sharding {
            Some(Sharding::Edge) if !self.edge_tag.is_empty() => format!("{}:{identifier}", self.edge_tag),
            _ => identifier.to_string(),
        }
    }

    fn respond(policy: &EffectivePolicy, decision: WindowDecision) -> RatelimitResponse {
        Self::respond_with_success(policy, decision, decision.passed)
    }

    fn respond_with_success(policy: &EffectivePolicy, decision: WindowDecision, success: bool) -> RatelimitResponse {
        RatelimitResponse {
            success,
            limit: policy.limit,
            remaining: decision.remaining,
            reset_at_ms: decision.reset_at_ms,
            override_id: policy.override_id.clone(),
        }
    }

    /// Fan an exceeded notification out to every alive peer.
    fn spawn_exceeded_broadcast(&self, request: BroadcastExceededRequest) {
        let peers = self.membership.alive_peers();
        if peers.is_empty() {
            return;
        }
        let client = self.client.clone();
        let stats = self.stats.clone();
        tokio::spawn(async move {
            for peer in peers {
                match client.broadcast_exceeded(&peer, request.clone()).await {
                    Ok(()) => {
                        stats.broadcasts_sent.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(err) => {
                        warn!(peer = %peer.node_id, error = %err, "exceeded broadcast failed");
                    }
                }
            }
        });
    }
}

#[async_trait]
impl RpcHandler for RatelimitService {
    /// Owner side of a delta push. Idempotent under retries: replays within
    /// the dedupe window return the remembered response without touching the
    /// authoritative count.
    async fn push_counter(&self, request: PushCounterRequest) -> Result<PushCounterResponse, ClusterError> {
        let now_ms = self.time.now_unix_ms();
        if let Some(replayed) = self.dedupe.get(&request.request_id, now_ms) {
            debug!(request_id = %request.request_id, "deduplicated replayed push");
            return Ok(replayed);
        }

        let key = sequence_key(&request.namespace_id, &request.identifier, request.limit, request.duration_ms);
        let outcome = self.counters.apply_delta(
            &key,
            now_ms,
            request.limit,
            request.duration_ms,
            request.window_start_ms,
            request.delta,
        );
        let response = PushCounterResponse {
            current: outcome.current,
            passed: outcome.passed,
            reset_at_ms: outcome.reset_at_ms,
        };
        self.dedupe.insert(
            request.request_id,
            response,
            now_ms + request.duration_ms.saturating_mul(RPC_DEDUPE_WINDOW_FACTOR),
            now_ms,
        );

        if outcome.crossed {
            debug!(identifier = %request.identifier, "authoritative count crossed limit, broadcasting");
            self.spawn_exceeded_broadcast(BroadcastExceededRequest {
                namespace_id: request.namespace_id,
                identifier: request.identifier,
                window_start_ms: request.window_start_ms,
                reset_at_ms: outcome.reset_at_ms,
                limit: request.limit,
                duration_ms: request.duration_ms,
            });
        }

        Ok(response)
    }

    /// Recipient side of the owner's exceeded fan-out: pin the local counter
    /// to deny until the window resets. Out-of-order arrivals are safe; the
    /// pin keeps the farthest reset.
    async fn broadcast_exceeded(&self, request: BroadcastExceededRequest) -> Result<(), ClusterError> {
        let key = sequence_key(&request.namespace_id, &request.identifier, request.limit, request.duration_ms);
        let now_ms = self.time.now_unix_ms();
        self.counters.pin_exceeded(&key, now_ms, request.duration_ms, request.reset_at_ms);
        self.stats.exceeded_pins.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
