//! Internal-comm service: cluster bootstrap and maintenance requests.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tracing::{debug, info, warn};

use lockstep_barrier::{BarrierObserver, BarrierService, ReleaseData};
use lockstep_core::protocol::barriers;
use lockstep_core::{
    ClusterHostingInfo, ClusterRequest, ClusterResponse, CommResult, NodeDropReason, NodeHostingInfo, NodeId,
    RecoveryState, RequestHandler, ResponsePayload,
};

use crate::sync::{ClusterSyncService, node_caller};

/// Receiver for failure reports raised by the node layer.
pub trait NodeEvents: Send + Sync {
    /// A peer or a barrier timeout reported `node_id` as failed.
    ///
    /// Called from request handlers and barrier threads; implementations
    /// must hand the work off instead of blocking.
    fn node_failure_reported(&self, node_id: &NodeId, reason: NodeDropReason);

    /// A generic barrier hosted here was torn down.
    fn barrier_released(&self, _barrier_id: &str) {}
}

/// Late-bound slot for the `NodeEvents` sink.
#[derive(Default)]
pub struct NodeEventsSlot {
    sink: RwLock<Option<Arc<dyn NodeEvents>>>,
}

impl NodeEventsSlot {
    pub fn set(&self, sink: Arc<dyn NodeEvents>) {
        *self.sink.write().expect("events sink lock") = Some(sink);
    }

    pub fn report(&self, node_id: &NodeId, reason: NodeDropReason) {
        let sink = self.sink.read().expect("events sink lock").clone();
        match sink {
            Some(sink) => sink.node_failure_reported(node_id, reason),
            None => warn!(%node_id, ?reason, "failure reported with no handler registered"),
        }
    }

    pub fn barrier_released(&self, barrier_id: &str) {
        let sink = self.sink.read().expect("events sink lock").clone();
        if let Some(sink) = sink {
            sink.barrier_released(barrier_id);
        }
    }
}

// ── Barrier hooks ──────────────────────────────────────────────────

/// Aggregates every node's hosting info on the bootstrap barrier.
pub(crate) struct GatherObserver {
    pub(crate) started: Arc<AtomicBool>,
}

impl BarrierObserver for GatherObserver {
    fn on_pre_release(&self, _barrier_id: &str, _generation: u64, data: &mut ReleaseData) {
        let mut cluster = ClusterHostingInfo::default();
        for (caller, bytes) in &data.requests {
            match serde_json::from_slice::<NodeHostingInfo>(bytes) {
                Ok(info) => {
                    cluster.nodes.insert(info.node_id.clone(), info);
                }
                Err(e) => warn!(%caller, error = %e, "discarding malformed hosting info"),
            }
        }

        match serde_json::to_vec(&cluster) {
            Ok(bytes) => data.respond_all(&bytes),
            Err(e) => warn!(error = %e, "failed to encode hosting info"),
        }
        self.started.store(true, Ordering::SeqCst);
        info!(nodes = cluster.nodes.len(), "cluster hosting info gathered");
    }
}

/// Barrier services whose counters recovery may fast-forward.
#[derive(Clone)]
pub(crate) struct ProgressTargets {
    pub(crate) cluster_sync: Arc<ClusterSyncService>,
    pub(crate) render_sync: Arc<BarrierService>,
    pub(crate) generic: Arc<BarrierService>,
}

impl ProgressTargets {
    /// Fast-forward every barrier named in `progress`.
    pub(crate) fn apply(&self, progress: &BTreeMap<String, u64>) {
        for (key, &generation) in progress {
            match key.as_str() {
                barriers::GAME_START | barriers::FRAME_END => {
                    self.cluster_sync.barriers().set_released_through(key, generation);
                }
                barriers::FRAME_START => {
                    let before = self
                        .cluster_sync
                        .barriers()
                        .barrier(key)
                        .map(|b| b.released_through())
                        .unwrap_or(0);
                    self.cluster_sync.barriers().set_released_through(key, generation);
                    if generation > before {
                        self.cluster_sync.refresh_snapshot(generation);
                    }
                }
                barriers::RENDER_PRESENT => {
                    self.render_sync.set_released_through(key, generation);
                }
                other => match other.strip_prefix(barriers::GENERIC_PREFIX) {
                    Some(barrier_id) => {
                        self.generic.set_released_through(barrier_id, generation);
                    }
                    None => debug!(key = other, "ignoring unknown progress key"),
                },
            }
        }
    }
}

/// Merges recovery states on the newly elected primary.
pub(crate) struct RecoveryObserver {
    pub(crate) local: NodeId,
    pub(crate) targets: ProgressTargets,
}

impl BarrierObserver for RecoveryObserver {
    fn on_pre_release(&self, barrier_id: &str, _generation: u64, data: &mut ReleaseData) {
        let mut merged = RecoveryState::new(self.local.clone());
        for (caller, bytes) in &data.requests {
            match serde_json::from_slice::<RecoveryState>(bytes) {
                Ok(state) => merged.merge(&state),
                Err(e) => warn!(%barrier_id, %caller, error = %e, "discarding malformed recovery state"),
            }
        }

        self.targets.apply(&merged.sync_progress);

        match serde_json::to_vec(&merged) {
            Ok(bytes) => data.respond_all(&bytes),
            Err(e) => warn!(%barrier_id, error = %e, "failed to encode recovery state"),
        }
        info!(
            %barrier_id,
            participants = data.requests.len(),
            barriers = merged.sync_progress.len(),
            cached = merged.cache.len(),
            "recovery state merged"
        );
    }
}

// ── Handler ────────────────────────────────────────────────────────

/// Serves the internal-comm protocol group.
pub struct InternalCommHandler {
    barriers: Arc<BarrierService>,
    started: Arc<AtomicBool>,
    events: Arc<NodeEventsSlot>,
    recovery_wait: Duration,
}

impl InternalCommHandler {
    pub fn new(
        barriers: Arc<BarrierService>,
        started: Arc<AtomicBool>,
        events: Arc<NodeEventsSlot>,
        recovery_wait: Duration,
    ) -> Self {
        Self {
            barriers,
            started,
            events,
            recovery_wait,
        }
    }

    fn gather(&self, from: &NodeId, info: NodeHostingInfo) -> ClusterResponse {
        if self.started.load(Ordering::SeqCst) || !self.barriers.is_available(barriers::GATHER_HOSTING_INFO) {
            debug!(%from, "hosting info requested outside bootstrap");
            return ClusterResponse::status(CommResult::NotAllowed);
        }

        let request = match serde_json::to_vec(&info) {
            Ok(bytes) => bytes,
            Err(_) => return ClusterResponse::status(CommResult::InternalError),
        };
        match self
            .barriers
            .sync(barriers::GATHER_HOSTING_INFO, &node_caller(from), Some(1), request)
        {
            Ok(bytes) => match serde_json::from_slice::<ClusterHostingInfo>(&bytes) {
                Ok(cluster) => ClusterResponse::ok(ResponsePayload::HostingInfo(cluster)),
                Err(_) => ClusterResponse::status(CommResult::InternalError),
            },
            Err(e) => {
                warn!(%from, error = %e, "hosting info barrier failed");
                ClusterResponse::status(e.comm_result())
            }
        }
    }

    fn negotiate(&self, from: &NodeId, failed: NodeId, state: RecoveryState) -> ClusterResponse {
        let barrier_id = barriers::recovery(&failed);

        if !self.barriers.is_available(&barrier_id) {
            // The peer noticed the failure first.
            debug!(%from, %failed, "recovery requested before local failure handling");
            self.events.report(&failed, NodeDropReason::PrimaryFailed);
            if !self.barriers.wait_until_created(&barrier_id, Some(self.recovery_wait)) {
                warn!(%from, %failed, "recovery barrier never appeared");
                return ClusterResponse::status(CommResult::InternalError);
            }
        }

        let request = match serde_json::to_vec(&state) {
            Ok(bytes) => bytes,
            Err(_) => return ClusterResponse::status(CommResult::InternalError),
        };
        match self.barriers.sync(&barrier_id, &node_caller(from), Some(1), request) {
            Ok(bytes) => match serde_json::from_slice::<RecoveryState>(&bytes) {
                Ok(merged) => ClusterResponse::ok(ResponsePayload::Recovery(merged)),
                Err(_) => ClusterResponse::status(CommResult::InternalError),
            },
            Err(e) => {
                warn!(%from, %failed, error = %e, "recovery barrier failed");
                ClusterResponse::status(e.comm_result())
            }
        }
    }
}

impl RequestHandler for InternalCommHandler {
    fn handle(&self, from: &NodeId, request: ClusterRequest) -> ClusterResponse {
        match request {
            ClusterRequest::GatherServicesHostingInfo { info } => self.gather(from, info),
            ClusterRequest::PostFailureNegotiate { failed_node, state } => self.negotiate(from, failed_node, state),
            ClusterRequest::RequestNodeDrop { node_id, reason } => {
                info!(%from, %node_id, ?reason, "node drop requested");
                self.events.report(&node_id, reason);
                ClusterResponse::ack()
            }
            other => {
                warn!(%from, op = other.name(), "unsupported internal request");
                ClusterResponse::status(CommResult::NotAllowed)
            }
        }
    }

    fn shutdown(&self) {
        self.barriers.shutdown();
    }
}
