//! Barrier registry hosted by a node, and its network handler.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use lockstep_core::protocol::{BarrierControlResult, BarrierCreateResult};
use lockstep_core::{ClusterRequest, ClusterResponse, CommResult, NodeId, RequestHandler, ResponsePayload};

use crate::barrier::{Barrier, BarrierCaller, BarrierObserver};
use crate::error::{BarrierError, BarrierResult};

/// A barrier generation that timed out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BarrierTimeout {
    pub barrier_id: String,
    pub generation: u64,
    pub missing: Vec<BarrierCaller>,
}

impl BarrierTimeout {
    /// Nodes that host at least one missing caller.
    pub fn missing_nodes(&self) -> BTreeSet<NodeId> {
        self.missing.iter().map(|c| c.node_id.clone()).collect()
    }
}

/// Called for every timed-out generation of every barrier in a service.
pub type TimeoutCallback = Arc<dyn Fn(&BarrierTimeout) + Send + Sync>;

/// Called with the ID of every barrier torn down by `release_barrier`.
pub type ReleaseCallback = Arc<dyn Fn(&str) + Send + Sync>;

struct TimeoutForwarder {
    callbacks: Arc<RwLock<Vec<TimeoutCallback>>>,
}

impl BarrierObserver for TimeoutForwarder {
    fn on_timeout(&self, barrier_id: &str, generation: u64, missing: &[BarrierCaller]) {
        let event = BarrierTimeout {
            barrier_id: barrier_id.to_string(),
            generation,
            missing: missing.to_vec(),
        };
        let callbacks = self.callbacks.read().expect("callbacks lock").clone();
        for callback in callbacks {
            callback(&event);
        }
    }
}

#[derive(Default)]
struct Registry {
    barriers: HashMap<String, Arc<Barrier>>,
    shut_down: bool,
}

/// Owns every barrier of one logical service on one node.
pub struct BarrierService {
    name: String,
    registry: Mutex<Registry>,
    created: Condvar,
    timeout_callbacks: Arc<RwLock<Vec<TimeoutCallback>>>,
    release_callbacks: RwLock<Vec<ReleaseCallback>>,
}

impl BarrierService {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            registry: Mutex::new(Registry::default()),
            created: Condvar::new(),
            timeout_callbacks: Arc::new(RwLock::new(Vec::new())),
            release_callbacks: RwLock::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register a callback for barrier timeouts. The service itself never
    /// drops the missing nodes.
    pub fn on_timeout(&self, callback: TimeoutCallback) {
        let mut callbacks = self.timeout_callbacks.write().expect("callbacks lock");
        callbacks.push(callback);
    }

    pub fn on_release(&self, callback: ReleaseCallback) {
        let mut callbacks = self.release_callbacks.write().expect("callbacks lock");
        callbacks.push(callback);
    }

    pub fn create_barrier(
        &self,
        barrier_id: &str,
        node_to_callers: &BTreeMap<NodeId, Vec<String>>,
        timeout: Duration,
    ) -> BarrierCreateResult {
        self.create_barrier_with(barrier_id, BarrierCaller::from_node_map(node_to_callers), timeout, Vec::new())
    }

    /// Create a barrier with pre-release or timeout observers attached.
    ///
    /// If a live barrier with this ID exists it is left untouched and the
    /// observers are discarded.
    pub fn create_barrier_with(
        &self,
        barrier_id: &str,
        callers: Vec<BarrierCaller>,
        timeout: Duration,
        observers: Vec<Arc<dyn BarrierObserver>>,
    ) -> BarrierCreateResult {
        let mut registry = self.registry.lock().expect("registry lock");
        if registry.barriers.contains_key(barrier_id) {
            debug!(service = %self.name, %barrier_id, "barrier already exists");
            return BarrierCreateResult::AlreadyExists;
        }

        let barrier = Barrier::new(barrier_id, callers, timeout);
        barrier.add_observer(Arc::new(TimeoutForwarder {
            callbacks: Arc::clone(&self.timeout_callbacks),
        }));
        for observer in observers {
            barrier.add_observer(observer);
        }
        if registry.shut_down {
            barrier.deactivate();
        }

        info!(
            service = %self.name,
            %barrier_id,
            callers = barrier.expected_callers().len(),
            timeout_ms = timeout.as_millis() as u64,
            "barrier created"
        );
        registry.barriers.insert(barrier_id.to_string(), Arc::new(barrier));
        self.created.notify_all();
        BarrierCreateResult::CreatedSuccessfully
    }

    /// Block until `barrier_id` exists. Returns false on timeout or if
    /// the service shuts down first.
    pub fn wait_until_created(&self, barrier_id: &str, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut registry = self.registry.lock().expect("registry lock");
        loop {
            if registry.barriers.contains_key(barrier_id) {
                return true;
            }
            if registry.shut_down {
                return false;
            }
            match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    registry = self
                        .created
                        .wait_timeout(registry, deadline - now)
                        .expect("registry lock")
                        .0;
                }
                None => {
                    registry = self.created.wait(registry).expect("registry lock");
                }
            }
        }
    }

    pub fn is_available(&self, barrier_id: &str) -> bool {
        let registry = self.registry.lock().expect("registry lock");
        registry.barriers.contains_key(barrier_id)
    }

    pub fn barrier(&self, barrier_id: &str) -> Option<Arc<Barrier>> {
        let registry = self.registry.lock().expect("registry lock");
        registry.barriers.get(barrier_id).cloned()
    }

    pub fn barrier_ids(&self) -> Vec<String> {
        let registry = self.registry.lock().expect("registry lock");
        let mut ids: Vec<String> = registry.barriers.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Tear a barrier down. Callers waiting on it unblock with an error.
    pub fn release_barrier(&self, barrier_id: &str) -> BarrierControlResult {
        let removed = {
            let mut registry = self.registry.lock().expect("registry lock");
            registry.barriers.remove(barrier_id)
        };
        match removed {
            Some(barrier) => {
                barrier.deactivate();
                info!(service = %self.name, %barrier_id, "barrier released");
                let callbacks = self.release_callbacks.read().expect("callbacks lock").clone();
                for callback in callbacks {
                    callback(barrier_id);
                }
                BarrierControlResult::Ok
            }
            None => BarrierControlResult::NotFound,
        }
    }

    /// Arrive at a barrier and block until it releases.
    ///
    /// With `generation` set the call is idempotent per generation; without
    /// it the caller joins whatever generation is open.
    pub fn sync(
        &self,
        barrier_id: &str,
        caller: &BarrierCaller,
        generation: Option<u64>,
        request: Vec<u8>,
    ) -> BarrierResult<Vec<u8>> {
        let barrier = self
            .barrier(barrier_id)
            .ok_or_else(|| BarrierError::NotFound(barrier_id.to_string()))?;
        match generation {
            Some(generation) => barrier.sync_generation(caller, generation, request),
            None => barrier.sync(caller, request),
        }
    }

    /// Unregister a dropped node's callers from every barrier.
    pub fn handle_node_drop(&self, node_id: &str) -> usize {
        let barriers: Vec<Arc<Barrier>> = {
            let registry = self.registry.lock().expect("registry lock");
            registry.barriers.values().cloned().collect()
        };
        let removed: usize = barriers.iter().map(|b| b.remove_node_callers(node_id)).sum();
        if removed > 0 {
            info!(service = %self.name, %node_id, removed, "dropped node from barriers");
        }
        removed
    }

    /// Fast-forward a barrier's completed-generation counter.
    pub fn set_released_through(&self, barrier_id: &str, generation: u64) -> bool {
        match self.barrier(barrier_id) {
            Some(barrier) => {
                barrier.set_released_through(generation);
                true
            }
            None => false,
        }
    }

    /// Completed generations per barrier ID.
    pub fn progress(&self) -> BTreeMap<String, u64> {
        let registry = self.registry.lock().expect("registry lock");
        registry
            .barriers
            .iter()
            .map(|(id, b)| (id.clone(), b.released_through()))
            .collect()
    }

    pub fn is_shut_down(&self) -> bool {
        self.registry.lock().expect("registry lock").shut_down
    }

    /// Deactivate every barrier and wake every waiter.
    pub fn shutdown(&self) {
        let barriers: Vec<Arc<Barrier>> = {
            let mut registry = self.registry.lock().expect("registry lock");
            if registry.shut_down {
                return;
            }
            registry.shut_down = true;
            self.created.notify_all();
            registry.barriers.values().cloned().collect()
        };
        for barrier in barriers {
            barrier.deactivate();
        }
        debug!(service = %self.name, "barrier service shut down");
    }
}

impl std::fmt::Debug for BarrierService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BarrierService").field("name", &self.name).finish()
    }
}

// ── Network handler ────────────────────────────────────────────────

/// Serves the generic barrier protocol from a `BarrierService`.
///
/// Generation 0 on the wire means "whatever generation is open". Callers
/// are identified by the requesting node plus the caller ID they send.
pub struct GenericBarrierHandler {
    service: Arc<BarrierService>,
}

impl GenericBarrierHandler {
    pub fn new(service: Arc<BarrierService>) -> Self {
        Self { service }
    }

    fn sync(
        &self,
        from: &NodeId,
        barrier_id: &str,
        caller_id: String,
        generation: u64,
        request: Vec<u8>,
    ) -> ClusterResponse {
        let caller = BarrierCaller::new(from.clone(), caller_id);
        let generation = (generation > 0).then_some(generation);
        match self.service.sync(barrier_id, &caller, generation, request) {
            Ok(data) => ClusterResponse::ok(ResponsePayload::Data(data)),
            Err(e) => {
                warn!(service = %self.service.name(), %barrier_id, %caller, error = %e, "barrier sync failed");
                ClusterResponse::status(e.comm_result())
            }
        }
    }
}

impl RequestHandler for GenericBarrierHandler {
    fn handle(&self, from: &NodeId, request: ClusterRequest) -> ClusterResponse {
        match request {
            ClusterRequest::CreateBarrier {
                barrier_id,
                node_to_callers,
                timeout_ms,
            } => {
                let result =
                    self.service
                        .create_barrier(&barrier_id, &node_to_callers, Duration::from_millis(timeout_ms));
                ClusterResponse::ok(ResponsePayload::BarrierCreated(result))
            }
            ClusterRequest::WaitUntilBarrierIsCreated { barrier_id } => {
                if self.service.wait_until_created(&barrier_id, None) {
                    ClusterResponse::ack()
                } else {
                    ClusterResponse::status(CommResult::InternalError)
                }
            }
            ClusterRequest::IsBarrierAvailable { barrier_id } => {
                ClusterResponse::ok(ResponsePayload::BarrierAvailable(self.service.is_available(&barrier_id)))
            }
            ClusterRequest::ReleaseBarrier { barrier_id } => {
                ClusterResponse::ok(ResponsePayload::BarrierControl(self.service.release_barrier(&barrier_id)))
            }
            ClusterRequest::SyncOnBarrier {
                barrier_id,
                caller_id,
                generation,
            } => self.sync(from, &barrier_id, caller_id, generation, Vec::new()),
            ClusterRequest::SyncOnBarrierWithData {
                barrier_id,
                caller_id,
                generation,
                request,
            } => self.sync(from, &barrier_id, caller_id, generation, request),
            other => {
                warn!(service = %self.service.name(), %from, op = other.name(), "unsupported request");
                ClusterResponse::status(CommResult::NotAllowed)
            }
        }
    }

    fn shutdown(&self) {
        self.service.shutdown();
    }
}
