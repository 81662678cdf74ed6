//! Failover controller — the transaction processor.
//!
//! Wraps every outward protocol call of a node in a transaction:
//!
//! ```text
//! loop:
//!   terminated / exiting?          → fail
//!   read lock, target = primary
//!   attempt(target)
//!     Ok                           → done
//!     Rejected                     → fail, no retry
//!     Comm error                   → unlock, HandleFailure(target), retry
//! ```
//!
//! GET results are cached per frame, SYNC generations are tracked so a
//! lost acknowledgement is never replayed as a new arrival, and MCAST
//! reports each unreachable target without stopping delivery.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::thread;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, error, info, warn};

use lockstep_barrier::ClientSetId;
use lockstep_core::protocol::{BarrierControlResult, BarrierCreateResult, barriers};
use lockstep_core::{
    CallError, CallResult, ClusterEventBinary, ClusterEventJson, EventsData, FailoverSettings, NodeDropReason, NodeId,
    RecoveryState, SyncGroup, TimeData,
};
use lockstep_node::{ClusterNodeController, ClusterOps, NodeEvents};

use crate::cache::DataCache;
use crate::election;
use crate::error::{FatalReason, TransactionError, TransactionResult};
use crate::failures::{Claim, FailureLog};
use crate::recovery_lock::RecoveryLock;
use crate::transaction::{SyncKey, SyncTracker, TransactionKind};

/// Called once when transaction processing terminates.
pub type FatalObserver = Arc<dyn Fn(&FatalReason) + Send + Sync>;

pub struct FailoverController {
    this: Weak<FailoverController>,
    ops: Arc<dyn ClusterOps>,
    settings: Mutex<FailoverSettings>,
    lock: RecoveryLock,
    tracker: SyncTracker,
    cache: DataCache,
    failures: FailureLog,
    terminated: AtomicBool,
    fatal: Mutex<Option<FatalReason>>,
    fatal_observers: RwLock<Vec<FatalObserver>>,
    exit: Arc<AtomicBool>,
}

impl FailoverController {
    pub fn new(ops: Arc<dyn ClusterOps>, settings: FailoverSettings, exit: Arc<AtomicBool>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            ops,
            settings: Mutex::new(settings),
            lock: RecoveryLock::new(),
            tracker: SyncTracker::new(),
            cache: DataCache::new(),
            failures: FailureLog::new(),
            terminated: AtomicBool::new(false),
            fatal: Mutex::new(None),
            fatal_observers: RwLock::new(Vec::new()),
            exit,
        })
    }

    /// Build a controller for `node` and register it as the node's
    /// failure sink.
    pub fn attach(node: &Arc<ClusterNodeController>) -> Arc<Self> {
        let controller = Self::new(
            Arc::clone(node) as Arc<dyn ClusterOps>,
            node.config().failover_settings(),
            node.exit_flag(),
        );
        node.set_event_sink(Arc::clone(&controller) as Arc<dyn NodeEvents>);
        controller
    }

    pub fn on_fatal(&self, observer: FatalObserver) {
        self.fatal_observers.write().expect("fatal observers lock").push(observer);
    }

    pub fn local_id(&self) -> &NodeId {
        self.ops.local_id()
    }

    pub fn primary(&self) -> NodeId {
        self.ops.primary()
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    pub fn fatal_reason(&self) -> Option<FatalReason> {
        self.fatal.lock().expect("fatal lock").clone()
    }

    pub fn settings(&self) -> FailoverSettings {
        self.settings.lock().expect("settings lock").clone()
    }

    /// Failures handled so far.
    pub fn handled_failures(&self) -> Vec<NodeId> {
        self.failures.handled()
    }

    /// Drop every cached GET result.
    pub fn reset_cache(&self) {
        self.cache.reset();
    }

    /// What this node has seen so far, as offered to a new primary.
    pub fn local_state(&self) -> RecoveryState {
        RecoveryState {
            node_id: self.ops.local_id().clone(),
            sync_progress: self.tracker.progress(),
            cache: self.cache.entries(),
        }
    }

    // ── cluster sync ──

    pub fn wait_for_game_start(&self) -> TransactionResult<()> {
        self.sync(SyncKey::frame(barriers::GAME_START), |ops, target, generation| {
            ops.wait_for_game_start(target, generation)
        })
    }

    pub fn wait_for_frame_start(&self) -> TransactionResult<()> {
        self.sync(SyncKey::frame(barriers::FRAME_START), |ops, target, generation| {
            ops.wait_for_frame_start(target, generation)
        })
    }

    pub fn wait_for_frame_end(&self) -> TransactionResult<()> {
        self.sync(SyncKey::frame(barriers::FRAME_END), |ops, target, generation| {
            ops.wait_for_frame_end(target, generation)
        })
    }

    pub fn get_time_data(&self) -> TransactionResult<TimeData> {
        self.get("GetTimeData", |ops, target| ops.get_time_data(target))
    }

    pub fn get_objects_data(&self, group: SyncGroup) -> TransactionResult<HashMap<String, String>> {
        let name = format!("GetObjectsData:{}", group.as_str());
        self.get(&name, |ops, target| ops.get_objects_data(target, group))
    }

    pub fn get_events_data(&self) -> TransactionResult<EventsData> {
        self.get("GetEventsData", |ops, target| ops.get_events_data(target))
    }

    pub fn get_native_input_data(&self) -> TransactionResult<HashMap<String, String>> {
        self.get("GetNativeInputData", |ops, target| ops.get_native_input_data(target))
    }

    // ── render sync ──

    pub fn synchronize_on_barrier(&self) -> TransactionResult<()> {
        self.sync(SyncKey::frame(barriers::RENDER_PRESENT), |ops, target, generation| {
            ops.synchronize_on_barrier(target, generation)
        })
    }

    // ── events ──

    pub fn emit_event_json(&self, event: &ClusterEventJson) -> TransactionResult<()> {
        self.push("EmitClusterEventJson", |ops, target| ops.emit_event_json(target, event))
    }

    pub fn emit_event_binary(&self, event: &ClusterEventBinary) -> TransactionResult<()> {
        self.push("EmitClusterEventBinary", |ops, target| ops.emit_event_binary(target, event))
    }

    // ── generic barrier ──

    pub fn acquire_client_set(&self) -> ClientSetId {
        self.ops.acquire_client_set()
    }

    pub fn release_client_set(&self, set: ClientSetId) -> bool {
        self.ops.release_client_set(set)
    }

    /// Create a barrier on every live node, so it survives a primary
    /// failure.
    pub fn create_barrier(
        &self,
        set: ClientSetId,
        barrier_id: &str,
        node_to_callers: &BTreeMap<NodeId, Vec<String>>,
        timeout: Duration,
    ) -> TransactionResult<BarrierCreateResult> {
        let delivered = self.mcast("CreateBarrier", self.ops.alive_nodes(), |ops, target| {
            ops.create_barrier(set, target, barrier_id, node_to_callers, timeout)
        })?;
        Ok(self.primary_answer(delivered, BarrierCreateResult::CreatedSuccessfully))
    }

    pub fn wait_until_barrier_is_created(&self, set: ClientSetId, barrier_id: &str) -> TransactionResult<()> {
        self.push("WaitUntilBarrierIsCreated", |ops, target| {
            ops.wait_until_barrier_is_created(set, target, barrier_id)
        })
    }

    pub fn is_barrier_available(&self, set: ClientSetId, barrier_id: &str) -> TransactionResult<bool> {
        self.push("IsBarrierAvailable", |ops, target| ops.is_barrier_available(set, target, barrier_id))
    }

    pub fn release_barrier(&self, set: ClientSetId, barrier_id: &str) -> TransactionResult<BarrierControlResult> {
        let delivered = self.mcast("ReleaseBarrier", self.ops.alive_nodes(), |ops, target| {
            ops.release_barrier(set, target, barrier_id)
        })?;
        self.forget_generic_barrier(barrier_id);
        Ok(self.primary_answer(delivered, BarrierControlResult::NotFound))
    }

    fn forget_generic_barrier(&self, barrier_id: &str) {
        let dropped = self.tracker.forget_barrier(&barriers::generic(barrier_id));
        if dropped > 0 {
            debug!(%barrier_id, callers = dropped, "generic barrier generations reset");
        }
    }

    pub fn sync_on_barrier(&self, set: ClientSetId, barrier_id: &str, caller_id: &str) -> TransactionResult<()> {
        self.sync(SyncKey::generic(barrier_id, caller_id), |ops, target, generation| {
            ops.sync_on_barrier(set, target, barrier_id, caller_id, generation)
        })
    }

    /// Synchronize and exchange data. A generation the cluster already
    /// passed while this node was recovering yields empty data.
    pub fn sync_on_barrier_with_data(
        &self,
        set: ClientSetId,
        barrier_id: &str,
        caller_id: &str,
        data: Vec<u8>,
    ) -> TransactionResult<Vec<u8>> {
        self.sync(SyncKey::generic(barrier_id, caller_id), |ops, target, generation| {
            ops.sync_on_barrier_with_data(set, target, barrier_id, caller_id, generation, data.clone())
        })
    }

    // ── failure handling ──

    /// Handle a failure of `node_id`, waiting for a concurrent handling
    /// of the same failure to finish.
    pub fn handle_failure(&self, node_id: &str) {
        self.process_failure(node_id, NodeDropReason::Failed, true);
    }

    /// Stop all transaction processing for good.
    pub fn terminate(&self, reason: FatalReason) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        error!(local = %self.ops.local_id(), %reason, "transaction processing terminated");
        *self.fatal.lock().expect("fatal lock") = Some(reason.clone());

        let observers = self.fatal_observers.read().expect("fatal observers lock").clone();
        for observer in observers {
            observer(&reason);
        }
    }

    fn report_failure(&self, node_id: &str, reason: NodeDropReason) {
        self.process_failure(node_id, reason, false);
    }

    fn process_failure(&self, node_id: &str, reason: NodeDropReason, wait: bool) {
        if self.is_terminated() {
            return;
        }
        if self.failures.claim(node_id, wait) == Claim::Handled {
            debug!(local = %self.ops.local_id(), %node_id, "failure already handled");
            return;
        }

        self.handle_claimed_failure(node_id, reason);
        self.failures.finish(node_id);
    }

    fn handle_claimed_failure(&self, node_id: &str, reason: NodeDropReason) {
        let local = self.ops.local_id().clone();
        warn!(%local, %node_id, ?reason, "handling node failure");

        if let Some(fatal) = self.fatal_for(node_id) {
            self.terminate(fatal);
            return;
        }

        if node_id != self.ops.primary() {
            self.settings.lock().expect("settings lock").remove_candidate(node_id);
            self.ops.drop_node(node_id);
            info!(%local, %node_id, "secondary node dropped");

            let targets = self.peers_except(node_id);
            self.notify_drop(targets, node_id, reason);
            return;
        }

        self.recover_primary(node_id);
    }

    fn fatal_for(&self, node_id: &str) -> Option<FatalReason> {
        let settings = self.settings.lock().expect("settings lock");
        if !settings.enabled {
            Some(FatalReason::FailoverDisabled(node_id.to_string()))
        } else if node_id == self.ops.local_id() {
            Some(FatalReason::LocalNodeFailed(node_id.to_string()))
        } else if settings.is_critical(node_id) {
            Some(FatalReason::CriticalNodeFailed(node_id.to_string()))
        } else {
            None
        }
    }

    /// Elect a new primary and bring every survivor to a common state.
    /// Runs with transactions locked out.
    fn recover_primary(&self, failed: &str) {
        let _guard = self.lock.write();
        let local = self.ops.local_id().clone();
        let mut failed = failed.to_string();

        loop {
            if self.exit.load(Ordering::SeqCst) || self.is_terminated() {
                return;
            }

            self.settings.lock().expect("settings lock").remove_candidate(&failed);
            self.ops.drop_node(&failed);
            let alive = self.ops.alive_nodes();

            let candidate = {
                let settings = self.settings.lock().expect("settings lock");
                election::elect(&settings, &alive)
            };
            let Some(candidate) = candidate else {
                self.terminate(FatalReason::NoCandidate(failed));
                return;
            };
            info!(%local, %failed, %candidate, "promotion candidate elected");

            let targets = self.peers_except(&failed);
            self.notify_drop(targets, &failed, NodeDropReason::PrimaryFailed);

            if candidate == local {
                self.ops.prepare_recovery(&failed, &alive);
            }

            let state = self.local_state();
            match self.ops.post_failure_negotiate(&candidate, &failed, &state) {
                Ok(merged) => {
                    self.tracker.apply(&merged.sync_progress);
                    self.cache.fill(&merged.cache);
                    self.ops.set_primary(&candidate);
                    info!(
                        %local,
                        %failed,
                        primary = %candidate,
                        barriers = merged.sync_progress.len(),
                        cached = merged.cache.len(),
                        "recovery complete"
                    );
                    return;
                }
                Err(e) => {
                    warn!(
                        kind = %TransactionKind::Recovery,
                        %local,
                        %candidate,
                        error = %e,
                        "recovery against candidate failed"
                    );
                    if candidate == local {
                        self.terminate(FatalReason::LocalNodeFailed(local));
                        return;
                    }
                    if let Some(fatal) = self.fatal_for(&candidate) {
                        self.terminate(fatal);
                        return;
                    }
                    self.failures.mark_handled(&candidate);
                    failed = candidate;
                }
            }
        }
    }

    fn peers_except(&self, node_id: &str) -> BTreeSet<NodeId> {
        let local = self.ops.local_id();
        self.ops
            .alive_nodes()
            .into_iter()
            .filter(|n| n != local && n != node_id)
            .collect()
    }

    fn notify_drop(&self, targets: BTreeSet<NodeId>, node_id: &str, reason: NodeDropReason) {
        if targets.is_empty() {
            return;
        }
        if let Err(e) = self.mcast("RequestNodeDrop", targets, |ops, target| {
            ops.request_node_drop(target, node_id, reason)
        }) {
            debug!(%node_id, error = %e, "node drop notification incomplete");
        }
    }

    // ── transaction kinds ──

    fn check_running(&self) -> TransactionResult<()> {
        if self.is_terminated() {
            let reason = self
                .fatal_reason()
                .unwrap_or_else(|| FatalReason::LocalNodeFailed(self.ops.local_id().clone()));
            return Err(TransactionError::Terminated(reason));
        }
        if self.exit.load(Ordering::SeqCst) {
            return Err(TransactionError::Exiting);
        }
        Ok(())
    }

    fn run<T>(
        &self,
        kind: TransactionKind,
        name: &str,
        mut attempt: impl FnMut(&str) -> CallResult<T>,
    ) -> TransactionResult<T> {
        loop {
            self.check_running()?;

            let guard = self.lock.read();
            let target = self.ops.primary();
            match attempt(&target) {
                Ok(value) => return Ok(value),
                Err(CallError::Rejected(result)) => {
                    debug!(%kind, transaction = name, %target, ?result, "transaction rejected");
                    return Err(TransactionError::Rejected(result));
                }
                Err(CallError::Comm(e)) => {
                    drop(guard);
                    warn!(%kind, transaction = name, %target, error = %e, "primary unreachable");
                    self.handle_failure(&target);
                }
            }
        }
    }

    fn get<T: Serialize + DeserializeOwned>(
        &self,
        name: &str,
        fetch: impl Fn(&dyn ClusterOps, &str) -> CallResult<T>,
    ) -> TransactionResult<T> {
        self.check_running()?;

        let generation = self.tracker.issued(&SyncKey::frame(barriers::FRAME_START));
        if let Some(value) = self.cache.get(name, generation) {
            debug!(transaction = name, generation, "served from cache");
            return Ok(value);
        }

        let value = self.run(TransactionKind::Get, name, |target| fetch(self.ops.as_ref(), target))?;
        self.cache.put(name, generation, &value);
        Ok(value)
    }

    fn push<T>(&self, name: &str, send: impl Fn(&dyn ClusterOps, &str) -> CallResult<T>) -> TransactionResult<T> {
        self.run(TransactionKind::Push, name, |target| send(self.ops.as_ref(), target))
    }

    fn sync<T: Default>(
        &self,
        key: SyncKey,
        enter: impl Fn(&dyn ClusterOps, &str, u64) -> CallResult<T>,
    ) -> TransactionResult<T> {
        self.check_running()?;

        let generation = self.tracker.issue(&key);
        let name = key.to_string();
        let value = self.run(TransactionKind::Sync, &name, |target| {
            if self.tracker.is_completed(&key, generation) {
                debug!(barrier = %key, generation, "generation already released cluster-wide");
                return Ok(T::default());
            }
            enter(self.ops.as_ref(), target, generation)
        })?;
        self.tracker.complete(&key, generation);
        Ok(value)
    }

    fn mcast<T>(
        &self,
        name: &str,
        targets: BTreeSet<NodeId>,
        send: impl Fn(&dyn ClusterOps, &str) -> CallResult<T>,
    ) -> TransactionResult<BTreeMap<NodeId, T>> {
        self.check_running()?;

        let mut delivered = BTreeMap::new();
        let mut rejected = None;
        for target in targets {
            if self.is_terminated() {
                return self.check_running().map(|_| delivered);
            }
            match send(self.ops.as_ref(), &target) {
                Ok(value) => {
                    delivered.insert(target, value);
                }
                Err(CallError::Rejected(result)) => {
                    debug!(kind = %TransactionKind::Mcast, transaction = name, %target, ?result, "target rejected");
                    rejected.get_or_insert(result);
                }
                Err(CallError::Comm(e)) => {
                    warn!(kind = %TransactionKind::Mcast, transaction = name, %target, error = %e, "target unreachable");
                    self.report_failure(&target, NodeDropReason::Failed);
                }
            }
        }

        match rejected {
            Some(result) if delivered.is_empty() => Err(TransactionError::Rejected(result)),
            _ => Ok(delivered),
        }
    }

    fn primary_answer<T>(&self, mut delivered: BTreeMap<NodeId, T>, fallback: T) -> T {
        let primary = self.ops.primary();
        match delivered.remove(&primary) {
            Some(answer) => answer,
            None => delivered.into_values().next().unwrap_or(fallback),
        }
    }
}

impl NodeEvents for FailoverController {
    fn node_failure_reported(&self, node_id: &NodeId, reason: NodeDropReason) {
        let Some(this) = self.this.upgrade() else {
            return;
        };
        let node_id = node_id.clone();
        let spawned = thread::Builder::new()
            .name("failover-drop".into())
            .spawn(move || this.report_failure(&node_id, reason));
        if let Err(e) = spawned {
            error!(error = %e, "failed to spawn failure handler");
        }
    }

    fn barrier_released(&self, barrier_id: &str) {
        self.forget_generic_barrier(barrier_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, AtomicUsize};
    use std::time::Instant;

    use lockstep_core::{CommError, CommResult};

    struct MockOps {
        local: NodeId,
        primary: Mutex<NodeId>,
        alive: Mutex<BTreeSet<NodeId>>,
        down: Mutex<BTreeSet<NodeId>>,
        calls: Mutex<Vec<(&'static str, NodeId)>>,
        arrivals: Mutex<BTreeMap<(String, u64), usize>>,
        lose_next_ack: AtomicBool,
        peer_state: Mutex<RecoveryState>,
        prepared: Mutex<Vec<(NodeId, BTreeSet<NodeId>)>>,
        next_set: AtomicU32,
    }

    impl MockOps {
        fn new(local: &str, primary: &str, nodes: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                local: local.to_string(),
                primary: Mutex::new(primary.to_string()),
                alive: Mutex::new(nodes.iter().map(|s| s.to_string()).collect()),
                down: Mutex::new(BTreeSet::new()),
                calls: Mutex::new(Vec::new()),
                arrivals: Mutex::new(BTreeMap::new()),
                lose_next_ack: AtomicBool::new(false),
                peer_state: Mutex::new(RecoveryState::default()),
                prepared: Mutex::new(Vec::new()),
                next_set: AtomicU32::new(1),
            })
        }

        fn kill(&self, node: &str) {
            self.down.lock().unwrap().insert(node.to_string());
        }

        fn calls_to(&self, op: &str) -> Vec<NodeId> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|(name, _)| *name == op)
                .map(|(_, target)| target.clone())
                .collect()
        }

        fn arrivals(&self, barrier: &str, generation: u64) -> usize {
            self.arrivals
                .lock()
                .unwrap()
                .get(&(barrier.to_string(), generation))
                .copied()
                .unwrap_or(0)
        }

        fn call(&self, op: &'static str, target: &str) -> CallResult<()> {
            self.calls.lock().unwrap().push((op, target.to_string()));
            if self.down.lock().unwrap().contains(target) {
                return Err(CommError::disconnected(target).into());
            }
            Ok(())
        }

        fn arrive(&self, barrier: &str, target: &str, generation: u64) -> CallResult<()> {
            self.call("barrier", target)?;
            *self
                .arrivals
                .lock()
                .unwrap()
                .entry((barrier.to_string(), generation))
                .or_default() += 1;
            if self.lose_next_ack.swap(false, Ordering::SeqCst) {
                self.kill(target);
                return Err(CommError::disconnected(target).into());
            }
            Ok(())
        }
    }

    impl ClusterOps for MockOps {
        fn local_id(&self) -> &NodeId {
            &self.local
        }

        fn primary(&self) -> NodeId {
            self.primary.lock().unwrap().clone()
        }

        fn alive_nodes(&self) -> BTreeSet<NodeId> {
            self.alive.lock().unwrap().clone()
        }

        fn wait_for_game_start(&self, target: &str, generation: u64) -> CallResult<()> {
            self.arrive(barriers::GAME_START, target, generation)
        }

        fn wait_for_frame_start(&self, target: &str, generation: u64) -> CallResult<()> {
            self.arrive(barriers::FRAME_START, target, generation)
        }

        fn wait_for_frame_end(&self, target: &str, generation: u64) -> CallResult<()> {
            self.arrive(barriers::FRAME_END, target, generation)
        }

        fn get_time_data(&self, target: &str) -> CallResult<TimeData> {
            self.call("get_time_data", target)?;
            Ok(TimeData {
                delta_time: 0.25,
                game_time: self.calls_to("get_time_data").len() as f64,
                frame_time: None,
            })
        }

        fn get_objects_data(&self, target: &str, _group: SyncGroup) -> CallResult<HashMap<String, String>> {
            self.call("get_objects_data", target)?;
            Ok(HashMap::new())
        }

        fn get_events_data(&self, target: &str) -> CallResult<EventsData> {
            self.call("get_events_data", target)?;
            Ok(EventsData::default())
        }

        fn get_native_input_data(&self, target: &str) -> CallResult<HashMap<String, String>> {
            self.call("get_native_input_data", target)?;
            Ok(HashMap::new())
        }

        fn synchronize_on_barrier(&self, target: &str, generation: u64) -> CallResult<()> {
            self.arrive(barriers::RENDER_PRESENT, target, generation)
        }

        fn emit_event_json(&self, target: &str, _event: &ClusterEventJson) -> CallResult<()> {
            self.call("emit_event_json", target)
        }

        fn emit_event_binary(&self, target: &str, _event: &ClusterEventBinary) -> CallResult<()> {
            self.call("emit_event_binary", target)
        }

        fn acquire_client_set(&self) -> ClientSetId {
            self.next_set.fetch_add(1, Ordering::SeqCst)
        }

        fn release_client_set(&self, _set: ClientSetId) -> bool {
            true
        }

        fn create_barrier(
            &self,
            _set: ClientSetId,
            target: &str,
            _barrier_id: &str,
            _node_to_callers: &BTreeMap<NodeId, Vec<String>>,
            _timeout: Duration,
        ) -> CallResult<BarrierCreateResult> {
            self.call("create_barrier", target)?;
            Ok(BarrierCreateResult::CreatedSuccessfully)
        }

        fn wait_until_barrier_is_created(&self, _set: ClientSetId, target: &str, _barrier_id: &str) -> CallResult<()> {
            self.call("wait_until_barrier_is_created", target)?;
            Err(CallError::Rejected(CommResult::NotAllowed))
        }

        fn is_barrier_available(&self, _set: ClientSetId, target: &str, _barrier_id: &str) -> CallResult<bool> {
            self.call("is_barrier_available", target)?;
            Ok(true)
        }

        fn release_barrier(&self, _set: ClientSetId, target: &str, _barrier_id: &str) -> CallResult<BarrierControlResult> {
            self.call("release_barrier", target)?;
            Ok(BarrierControlResult::Ok)
        }

        fn sync_on_barrier(
            &self,
            _set: ClientSetId,
            target: &str,
            barrier_id: &str,
            caller_id: &str,
            generation: u64,
        ) -> CallResult<()> {
            self.arrive(&format!("{barrier_id}/{caller_id}"), target, generation)
        }

        fn sync_on_barrier_with_data(
            &self,
            _set: ClientSetId,
            target: &str,
            barrier_id: &str,
            caller_id: &str,
            generation: u64,
            data: Vec<u8>,
        ) -> CallResult<Vec<u8>> {
            self.arrive(&format!("{barrier_id}/{caller_id}"), target, generation)?;
            Ok(data)
        }

        fn post_failure_negotiate(&self, target: &str, _failed: &str, state: &RecoveryState) -> CallResult<RecoveryState> {
            self.call("post_failure_negotiate", target)?;
            let mut merged = state.clone();
            merged.merge(&self.peer_state.lock().unwrap());
            Ok(merged)
        }

        fn request_node_drop(&self, target: &str, _node_id: &str, _reason: NodeDropReason) -> CallResult<()> {
            self.call("request_node_drop", target)
        }

        fn drop_node(&self, node_id: &str) {
            self.alive.lock().unwrap().remove(node_id);
        }

        fn set_primary(&self, node_id: &str) {
            *self.primary.lock().unwrap() = node_id.to_string();
        }

        fn prepare_recovery(&self, failed: &str, participants: &BTreeSet<NodeId>) {
            self.prepared
                .lock()
                .unwrap()
                .push((failed.to_string(), participants.clone()));
        }
    }

    fn enabled(backups: &[&str], critical: &[&str]) -> FailoverSettings {
        FailoverSettings {
            enabled: true,
            critical_nodes: critical.iter().map(|s| s.to_string()).collect(),
            backup_candidates: backups.iter().map(|s| s.to_string()).collect(),
            backups_configured: !backups.is_empty(),
        }
    }

    fn controller(ops: &Arc<MockOps>, settings: FailoverSettings) -> Arc<FailoverController> {
        FailoverController::new(ops.clone(), settings, Arc::new(AtomicBool::new(false)))
    }

    fn wait_until(mut check: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !check() {
            assert!(Instant::now() < deadline, "condition not reached");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn get_is_cached_within_a_frame() {
        let ops = MockOps::new("b", "a", &["a", "b", "c"]);
        let failover = controller(&ops, enabled(&[], &[]));

        let first = failover.get_time_data().unwrap();
        let second = failover.get_time_data().unwrap();
        assert_eq!(first, second);
        assert_eq!(ops.calls_to("get_time_data").len(), 1);

        failover.wait_for_frame_start().unwrap();
        let third = failover.get_time_data().unwrap();
        assert_eq!(ops.calls_to("get_time_data").len(), 2);
        assert_ne!(first, third);
    }

    #[test]
    fn lost_acknowledgement_is_not_replayed() {
        let ops = MockOps::new("c", "a", &["a", "b", "c"]);
        ops.peer_state
            .lock()
            .unwrap()
            .sync_progress
            .insert(barriers::FRAME_START.to_string(), 1);
        let failover = controller(&ops, enabled(&["b", "c"], &[]));

        ops.lose_next_ack.store(true, Ordering::SeqCst);
        failover.wait_for_frame_start().unwrap();

        assert_eq!(ops.arrivals(barriers::FRAME_START, 1), 1);
        assert_eq!(failover.primary(), "b");
        assert_eq!(ops.calls_to("post_failure_negotiate"), vec!["b".to_string()]);
        assert_eq!(ops.calls_to("request_node_drop"), vec!["b".to_string()]);
        assert!(ops.prepared.lock().unwrap().is_empty());

        failover.wait_for_frame_start().unwrap();
        assert_eq!(ops.arrivals(barriers::FRAME_START, 2), 1);
        assert_eq!(failover.handled_failures(), vec!["a".to_string()]);
    }

    #[test]
    fn generic_sync_tracks_callers_separately() {
        let ops = MockOps::new("a", "a", &["a", "b"]);
        let failover = controller(&ops, enabled(&[], &[]));
        let set = failover.acquire_client_set();

        failover.sync_on_barrier(set, "phase", "x").unwrap();
        failover.sync_on_barrier(set, "phase", "x").unwrap();
        let echoed = failover.sync_on_barrier_with_data(set, "phase", "y", vec![7]).unwrap();

        assert_eq!(ops.arrivals("phase/x", 2), 1);
        assert_eq!(ops.arrivals("phase/y", 1), 1);
        assert_eq!(echoed, vec![7]);
        assert_eq!(failover.local_state().sync_progress["gb:phase"], 2);
    }

    #[test]
    fn released_generic_barrier_restarts_at_generation_one() {
        let ops = MockOps::new("a", "a", &["a", "b"]);
        let failover = controller(&ops, enabled(&[], &[]));
        let set = failover.acquire_client_set();

        failover.sync_on_barrier(set, "phase", "x").unwrap();
        failover.release_barrier(set, "phase").unwrap();
        assert_eq!(ops.calls_to("release_barrier"), vec!["a", "b"]);
        assert!(!failover.local_state().sync_progress.contains_key("gb:phase"));

        failover.sync_on_barrier(set, "phase", "x").unwrap();
        assert_eq!(ops.arrivals("phase/x", 1), 2);
        assert_eq!(ops.arrivals("phase/x", 2), 0);
    }

    #[test]
    fn release_seen_by_a_peer_resets_its_generations() {
        let ops = MockOps::new("b", "a", &["a", "b"]);
        let failover = controller(&ops, enabled(&[], &[]));
        let set = failover.acquire_client_set();

        failover.sync_on_barrier(set, "phase", "y").unwrap();
        failover.barrier_released("phase");
        failover.sync_on_barrier(set, "phase", "y").unwrap();
        assert_eq!(ops.arrivals("phase/y", 1), 2);
    }

    #[test]
    fn mcast_continues_past_a_dead_target() {
        let ops = MockOps::new("c", "a", &["a", "b", "c", "d"]);
        ops.kill("b");
        let failover = controller(&ops, enabled(&[], &[]));
        let set = failover.acquire_client_set();

        let mut callers = BTreeMap::new();
        callers.insert("c".to_string(), vec!["c".to_string()]);
        let result = failover
            .create_barrier(set, "phase", &callers, Duration::from_secs(1))
            .unwrap();

        assert_eq!(result, BarrierCreateResult::CreatedSuccessfully);
        assert_eq!(ops.calls_to("create_barrier"), vec!["a", "b", "c", "d"]);
        assert!(!ops.alive_nodes().contains("b"));
        assert_eq!(ops.calls_to("request_node_drop"), vec!["a", "d"]);
        assert_eq!(failover.primary(), "a");
        assert!(!failover.is_terminated());
    }

    #[test]
    fn rejections_are_not_retried() {
        let ops = MockOps::new("b", "a", &["a", "b"]);
        let failover = controller(&ops, enabled(&[], &[]));
        let set = failover.acquire_client_set();

        let err = failover.wait_until_barrier_is_created(set, "phase").unwrap_err();
        assert_eq!(err, TransactionError::Rejected(CommResult::NotAllowed));
        assert_eq!(ops.calls_to("wait_until_barrier_is_created").len(), 1);
        assert!(failover.handled_failures().is_empty());
    }

    #[test]
    fn critical_failure_is_fatal() {
        let ops = MockOps::new("a", "a", &["a", "b", "c"]);
        let failover = controller(&ops, enabled(&[], &["b"]));
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        failover.on_fatal(Arc::new(move |_reason: &FatalReason| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        failover.handle_failure("b");
        failover.handle_failure("c");

        assert!(failover.is_terminated());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(
            failover.get_time_data().unwrap_err(),
            TransactionError::Terminated(FatalReason::CriticalNodeFailed("b".into()))
        );
        assert!(ops.calls_to("get_time_data").is_empty());
    }

    #[test]
    fn disabled_failover_is_fatal() {
        let ops = MockOps::new("b", "a", &["a", "b"]);
        ops.kill("a");
        let failover = controller(&ops, FailoverSettings::default());

        assert_eq!(
            failover.get_time_data().unwrap_err(),
            TransactionError::Terminated(FatalReason::FailoverDisabled("a".into()))
        );
    }

    #[test]
    fn failed_candidate_hands_over_to_the_next() {
        let ops = MockOps::new("e", "a", &["a", "b", "c", "d", "e"]);
        ops.kill("a");
        ops.kill("b");
        let failover = controller(&ops, enabled(&["b", "c", "d"], &[]));

        let time = failover.get_time_data().unwrap();
        assert_eq!(time.delta_time, 0.25);

        assert_eq!(failover.primary(), "c");
        assert_eq!(ops.calls_to("post_failure_negotiate"), vec!["b", "c"]);
        assert_eq!(ops.calls_to("get_time_data"), vec!["a", "c"]);
        assert_eq!(ops.alive_nodes(), BTreeSet::from(["c".to_string(), "d".to_string(), "e".to_string()]));
        assert_eq!(failover.settings().backup_candidates, vec!["c", "d"]);
    }

    #[test]
    fn exhausted_candidates_terminate() {
        let ops = MockOps::new("c", "a", &["a", "b", "c"]);
        ops.kill("a");
        ops.kill("b");
        let failover = controller(&ops, enabled(&["b"], &[]));

        assert_eq!(
            failover.wait_for_game_start().unwrap_err(),
            TransactionError::Terminated(FatalReason::NoCandidate("b".into()))
        );
        assert_eq!(failover.fatal_reason(), Some(FatalReason::NoCandidate("b".into())));
    }

    #[test]
    fn local_candidate_hosts_the_recovery_barrier() {
        let ops = MockOps::new("b", "a", &["a", "b", "c"]);
        ops.kill("a");
        let failover = controller(&ops, enabled(&[], &[]));

        failover.emit_event_json(&ClusterEventJson::default()).unwrap();

        assert_eq!(failover.primary(), "b");
        let prepared = ops.prepared.lock().unwrap().clone();
        assert_eq!(prepared, vec![("a".to_string(), BTreeSet::from(["b".to_string(), "c".to_string()]))]);
        assert_eq!(ops.calls_to("post_failure_negotiate"), vec!["b"]);
        assert_eq!(ops.calls_to("emit_event_json"), vec!["a", "b"]);
    }

    #[test]
    fn reported_failures_are_handled_in_the_background() {
        let ops = MockOps::new("a", "a", &["a", "b", "c"]);
        let failover = controller(&ops, enabled(&[], &[]));

        failover.node_failure_reported(&"c".to_string(), NodeDropReason::BarrierTimeout);
        wait_until(|| failover.handled_failures() == vec!["c".to_string()]);

        assert_eq!(ops.alive_nodes(), BTreeSet::from(["a".to_string(), "b".to_string()]));
        assert_eq!(ops.calls_to("request_node_drop"), vec!["b"]);

        failover.node_failure_reported(&"c".to_string(), NodeDropReason::Failed);
        thread::sleep(Duration::from_millis(30));
        assert_eq!(ops.calls_to("request_node_drop").len(), 1);
    }

    #[test]
    fn exit_flag_stops_transactions() {
        let ops = MockOps::new("b", "a", &["a", "b"]);
        let exit = Arc::new(AtomicBool::new(false));
        let failover = FailoverController::new(ops.clone(), enabled(&[], &[]), exit.clone());

        exit.store(true, Ordering::SeqCst);
        assert_eq!(failover.wait_for_frame_end().unwrap_err(), TransactionError::Exiting);
        assert_eq!(failover.synchronize_on_barrier().unwrap_err().comm_result(), CommResult::InternalError);
    }
}
