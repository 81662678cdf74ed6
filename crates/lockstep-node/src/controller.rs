//! Cluster node controller — owns a node's servers and clients.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use lockstep_barrier::{
    BarrierCaller, BarrierClientPool, BarrierClientSet, BarrierService, BarrierTimeout, ClientSetId,
    GenericBarrierHandler, TimeoutCallback,
};
use lockstep_core::config::{PortsConfig, Timeouts};
use lockstep_core::protocol::{BarrierControlResult, BarrierCreateResult, barriers};
use lockstep_core::{
    CallError, CallResult, ClusterConfig, ClusterEventBinary, ClusterEventJson, ClusterHostingInfo, ClusterNode,
    ClusterRequest, ClusterResponse, CommError, CommResult, ConnectionSet, EventsData, Listener, NodeDropReason,
    NodeHostingInfo, NodeId, NodeRole, RecoveryState, RequestHandler, ResponsePayload, ServiceAddress, ServiceKind,
    SyncGroup, TimeData, Transport,
};

use crate::data::ClusterDataSource;
use crate::error::{NodeError, NodeResult};
use crate::internal::{GatherObserver, InternalCommHandler, NodeEvents, NodeEventsSlot, ProgressTargets, RecoveryObserver};
use crate::ops::ClusterOps;
use crate::sync::{ClusterSyncHandler, ClusterSyncService, ExternalEventsHandler, RenderSyncHandler};

// ── External servers ───────────────────────────────────────────────

#[derive(Default)]
struct ExternalState {
    listeners: Vec<Listener>,
    /// Bumped on every start/stop so stale retry loops give up.
    epoch: u64,
}

/// The primary-only event listeners on fixed ports.
struct ExternalServers {
    owner: NodeId,
    host: String,
    ports: PortsConfig,
    transport: Arc<dyn Transport>,
    service: Arc<ClusterSyncService>,
    retry_delay: Duration,
    exiting: Arc<AtomicBool>,
    state: Mutex<ExternalState>,
}

impl ExternalServers {
    fn bind(&self) -> Result<Vec<Listener>, CommError> {
        let mut listeners = Vec::with_capacity(2);
        for (kind, port) in [
            (ServiceKind::EventsJson, self.ports.events_json),
            (ServiceKind::EventsBinary, self.ports.events_binary),
        ] {
            let handler: Arc<dyn RequestHandler> =
                Arc::new(ExternalEventsHandler::new(kind, Arc::clone(&self.service)));
            let listener = self
                .transport
                .listen(&self.owner, &ServiceAddress::new(self.host.clone(), port), handler)?;
            listeners.push(listener);
        }
        Ok(listeners)
    }

    /// Bind now, or keep retrying on a background thread until the ports
    /// free up.
    fn start(self: &Arc<Self>) {
        let epoch = {
            let mut state = self.state.lock().expect("external lock");
            state.epoch += 1;
            if !state.listeners.is_empty() {
                return;
            }
            match self.bind() {
                Ok(listeners) => {
                    state.listeners = listeners;
                    info!(node_id = %self.owner, "external servers started");
                    return;
                }
                Err(e) => {
                    warn!(node_id = %self.owner, error = %e, "external ports busy, retrying in background");
                }
            }
            state.epoch
        };

        let servers = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name("lockstep-promote".into())
            .spawn(move || servers.retry_until_bound(epoch));
        if let Err(e) = spawned {
            warn!(node_id = %self.owner, error = %e, "failed to spawn promotion thread");
        }
    }

    fn retry_until_bound(&self, epoch: u64) {
        let mut attempt = 1u32;
        loop {
            thread::sleep(self.retry_delay);
            attempt += 1;

            if self.exiting.load(Ordering::SeqCst) {
                return;
            }
            let mut state = self.state.lock().expect("external lock");
            if state.epoch != epoch || !state.listeners.is_empty() {
                return;
            }
            match self.bind() {
                Ok(listeners) => {
                    state.listeners = listeners;
                    info!(node_id = %self.owner, attempt, "external servers started");
                    return;
                }
                Err(e) => debug!(node_id = %self.owner, attempt, error = %e, "external ports still busy"),
            }
        }
    }

    fn stop(&self) {
        let mut state = self.state.lock().expect("external lock");
        state.epoch += 1;
        if !state.listeners.is_empty() {
            state.listeners.clear();
            info!(node_id = %self.owner, "external servers stopped");
        }
    }

    fn is_bound(&self) -> bool {
        !self.state.lock().expect("external lock").listeners.is_empty()
    }
}

// ── Controller ─────────────────────────────────────────────────────

/// Per-process owner of every server and client of one cluster node.
pub struct ClusterNodeController {
    config: ClusterConfig,
    local: ClusterNode,
    timeouts: Timeouts,
    transport: Arc<dyn Transport>,
    primary: RwLock<NodeId>,
    alive: RwLock<BTreeSet<NodeId>>,
    hosting: RwLock<ClusterHostingInfo>,
    started: Arc<AtomicBool>,
    exiting: Arc<AtomicBool>,
    events: Arc<NodeEventsSlot>,

    cluster_sync: Arc<ClusterSyncService>,
    render_sync: Arc<BarrierService>,
    generic: Arc<BarrierService>,
    internal: Arc<BarrierService>,

    cluster_sync_clients: ConnectionSet,
    render_sync_clients: ConnectionSet,
    internal_clients: ConnectionSet,
    barrier_clients: BarrierClientPool,

    listeners: Mutex<Vec<Listener>>,
    external: Arc<ExternalServers>,
}

impl ClusterNodeController {
    pub fn new(
        config: ClusterConfig,
        local_id: &str,
        transport: Arc<dyn Transport>,
        source: Arc<dyn ClusterDataSource>,
    ) -> NodeResult<Self> {
        config.validate()?;
        let local = config
            .node(local_id)
            .ok_or_else(|| NodeError::UnknownNode(local_id.to_string()))?;
        let timeouts = config.timeouts()?;
        let retry = config.retry_policy()?;
        let nodes = config.node_ids();
        let exiting = Arc::new(AtomicBool::new(false));
        let events = Arc::new(NodeEventsSlot::default());

        let cluster_sync = Arc::new(ClusterSyncService::new(local.id.clone(), &nodes, &timeouts, source));
        let render_sync = RenderSyncHandler::service(&local.id, &nodes, &timeouts);
        let generic = Arc::new(BarrierService::new(format!("generic_barrier@{}", local.id)));
        let internal = Arc::new(BarrierService::new(format!("internal@{}", local.id)));

        let started = Arc::new(AtomicBool::new(false));
        if local.id == config.cluster.primary {
            internal.create_barrier_with(
                barriers::GATHER_HOSTING_INFO,
                nodes.iter().map(|n| BarrierCaller::new(n.clone(), n.clone())).collect(),
                timeouts.game_start,
                vec![Arc::new(GatherObserver {
                    started: Arc::clone(&started),
                })],
            );
        }

        for service in [cluster_sync.barriers(), &render_sync, &generic, &internal] {
            service.on_timeout(timeout_reporter(local.id.clone(), Arc::clone(&events)));
        }
        {
            let events = Arc::clone(&events);
            generic.on_release(Arc::new(move |barrier_id: &str| events.barrier_released(barrier_id)));
        }

        let internal_clients = ConnectionSet::new(
            ServiceKind::InternalComm,
            local.id.clone(),
            Arc::clone(&transport),
            retry,
        );
        for node_id in &nodes {
            if let Some(address) = config.internal_comm_address(node_id) {
                internal_clients.set_address(node_id, address);
            }
        }

        let external = Arc::new(ExternalServers {
            owner: local.id.clone(),
            host: local.host.clone(),
            ports: config.ports.clone(),
            transport: Arc::clone(&transport),
            service: Arc::clone(&cluster_sync),
            retry_delay: timeouts.promotion_retry_delay,
            exiting: Arc::clone(&exiting),
            state: Mutex::new(ExternalState::default()),
        });

        Ok(Self {
            primary: RwLock::new(config.cluster.primary.clone()),
            alive: RwLock::new(nodes),
            hosting: RwLock::new(ClusterHostingInfo::default()),
            cluster_sync_clients: ConnectionSet::new(
                ServiceKind::ClusterSync,
                local.id.clone(),
                Arc::clone(&transport),
                retry,
            ),
            render_sync_clients: ConnectionSet::new(
                ServiceKind::RenderSync,
                local.id.clone(),
                Arc::clone(&transport),
                retry,
            ),
            barrier_clients: BarrierClientPool::new(local.id.clone(), Arc::clone(&transport), retry),
            internal_clients,
            listeners: Mutex::new(Vec::new()),
            config,
            local,
            timeouts,
            transport,
            started,
            exiting,
            events,
            cluster_sync,
            render_sync,
            generic,
            internal,
            external,
        })
    }

    /// Bind every service, exchange hosting info through the primary and
    /// connect to every peer. Blocks until all configured nodes have
    /// checked in or the bootstrap barrier times out.
    pub fn start(&self) -> NodeResult<ClusterHostingInfo> {
        let info = self.bind_services()?;
        if self.is_primary() {
            self.external.start();
        }

        let primary = self.primary();
        info!(node_id = %self.local.id, %primary, role = %self.role(), "gathering cluster hosting info");
        let cluster = self
            .internal_clients
            .request(&primary, &ClusterRequest::GatherServicesHostingInfo { info })
            .map_err(CallError::from)?
            .extract(|p| match p {
                ResponsePayload::HostingInfo(cluster) => Some(cluster),
                _ => None,
            })?;

        for node_id in self.config.node_ids() {
            if !cluster.nodes.contains_key(&node_id) {
                return Err(NodeError::Bootstrap(format!("no hosting info for node {node_id}")));
            }
        }

        self.apply_hosting_info(&cluster);
        self.connect_peers();
        info!(node_id = %self.local.id, nodes = cluster.nodes.len(), "node started");
        Ok(cluster)
    }

    /// Register the receiver for failure reports.
    pub fn set_event_sink(&self, sink: Arc<dyn NodeEvents>) {
        self.events.set(sink);
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn local_node(&self) -> &ClusterNode {
        &self.local
    }

    pub fn timeouts(&self) -> &Timeouts {
        &self.timeouts
    }

    pub fn role(&self) -> NodeRole {
        if self.is_primary() {
            NodeRole::Primary
        } else {
            NodeRole::Secondary
        }
    }

    pub fn is_primary(&self) -> bool {
        *self.primary.read().expect("primary lock") == self.local.id
    }

    pub fn hosting_info(&self) -> ClusterHostingInfo {
        self.hosting.read().expect("hosting lock").clone()
    }

    pub fn cluster_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn cluster_sync_service(&self) -> &Arc<ClusterSyncService> {
        &self.cluster_sync
    }

    pub fn generic_barriers(&self) -> &Arc<BarrierService> {
        &self.generic
    }

    pub fn external_servers_bound(&self) -> bool {
        self.external.is_bound()
    }

    /// Shared process-exit flag.
    pub fn exit_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.exiting)
    }

    pub fn is_exiting(&self) -> bool {
        self.exiting.load(Ordering::SeqCst)
    }

    /// Close every server and client and wake every blocked caller.
    pub fn shutdown(&self) {
        self.exiting.store(true, Ordering::SeqCst);
        self.external.stop();
        self.listeners.lock().expect("listeners lock").clear();
        for service in [self.cluster_sync.barriers(), &self.render_sync, &self.generic, &self.internal] {
            service.shutdown();
        }
        self.cluster_sync_clients.close_all();
        self.render_sync_clients.close_all();
        self.internal_clients.close_all();
        info!(node_id = %self.local.id, "node shut down");
    }

    fn bind(&self, service: ServiceKind, port: u16, handler: Arc<dyn RequestHandler>) -> NodeResult<Listener> {
        let address = ServiceAddress::new(self.local.host.clone(), port);
        self.transport
            .listen(&self.local.id, &address, handler)
            .map_err(|source| NodeError::Listen {
                service: service.as_str(),
                address,
                source,
            })
    }

    fn bind_services(&self) -> NodeResult<NodeHostingInfo> {
        let cluster_sync = self.bind(
            ServiceKind::ClusterSync,
            0,
            Arc::new(ClusterSyncHandler::new(Arc::clone(&self.cluster_sync))),
        )?;
        let render_sync = self.bind(
            ServiceKind::RenderSync,
            0,
            Arc::new(RenderSyncHandler::new(Arc::clone(&self.render_sync))),
        )?;
        let generic = self.bind(
            ServiceKind::GenericBarrier,
            0,
            Arc::new(GenericBarrierHandler::new(Arc::clone(&self.generic))),
        )?;
        let internal = self.bind(
            ServiceKind::InternalComm,
            self.config.ports.internal_comm,
            Arc::new(InternalCommHandler::new(
                Arc::clone(&self.internal),
                Arc::clone(&self.started),
                Arc::clone(&self.events),
                self.timeouts.game_start,
            )),
        )?;

        let info = NodeHostingInfo {
            node_id: self.local.id.clone(),
            host: self.local.host.clone(),
            cluster_sync_port: cluster_sync.address().port,
            render_sync_port: render_sync.address().port,
            generic_barrier_port: generic.address().port,
        };
        debug!(
            node_id = %self.local.id,
            cluster_sync = info.cluster_sync_port,
            render_sync = info.render_sync_port,
            generic_barrier = info.generic_barrier_port,
            "services bound"
        );

        let mut listeners = self.listeners.lock().expect("listeners lock");
        listeners.extend([cluster_sync, render_sync, generic, internal]);
        Ok(info)
    }

    fn apply_hosting_info(&self, cluster: &ClusterHostingInfo) {
        for (node_id, info) in &cluster.nodes {
            if let Some(address) = info.address(ServiceKind::ClusterSync) {
                self.cluster_sync_clients.set_address(node_id, address);
            }
            if let Some(address) = info.address(ServiceKind::RenderSync) {
                self.render_sync_clients.set_address(node_id, address);
            }
            if let Some(address) = info.address(ServiceKind::GenericBarrier) {
                self.barrier_clients.set_address(node_id, address);
            }
        }
        *self.hosting.write().expect("hosting lock") = cluster.clone();
    }

    fn connect_peers(&self) {
        for set in [&self.cluster_sync_clients, &self.render_sync_clients, &self.internal_clients] {
            if let Err(e) = set.connect_all() {
                warn!(node_id = %self.local.id, service = set.service().as_str(), error = %e, "peer connection failed");
            }
        }
    }

    fn client_set(&self, set: ClientSetId) -> CallResult<Arc<BarrierClientSet>> {
        self.barrier_clients
            .get(set)
            .ok_or(CallError::Rejected(CommResult::NotAllowed))
    }
}

/// Barrier timeouts become failure reports for every missing peer.
fn timeout_reporter(local: NodeId, events: Arc<NodeEventsSlot>) -> TimeoutCallback {
    Arc::new(move |timeout: &BarrierTimeout| {
        for node_id in timeout.missing_nodes() {
            if node_id != local {
                warn!(barrier_id = %timeout.barrier_id, %node_id, "node missed barrier deadline");
                events.report(&node_id, NodeDropReason::BarrierTimeout);
            }
        }
    })
}

fn call(set: &ConnectionSet, target: &str, request: ClusterRequest) -> CallResult<ClusterResponse> {
    Ok(set.request(target, &request)?)
}

impl ClusterOps for ClusterNodeController {
    fn local_id(&self) -> &NodeId {
        &self.local.id
    }

    fn primary(&self) -> NodeId {
        self.primary.read().expect("primary lock").clone()
    }

    fn alive_nodes(&self) -> BTreeSet<NodeId> {
        self.alive.read().expect("alive lock").clone()
    }

    fn wait_for_game_start(&self, target: &str, generation: u64) -> CallResult<()> {
        call(&self.cluster_sync_clients, target, ClusterRequest::WaitForGameStart { generation })?.check()?;
        Ok(())
    }

    fn wait_for_frame_start(&self, target: &str, generation: u64) -> CallResult<()> {
        call(&self.cluster_sync_clients, target, ClusterRequest::WaitForFrameStart { generation })?.check()?;
        Ok(())
    }

    fn wait_for_frame_end(&self, target: &str, generation: u64) -> CallResult<()> {
        call(&self.cluster_sync_clients, target, ClusterRequest::WaitForFrameEnd { generation })?.check()?;
        Ok(())
    }

    fn get_time_data(&self, target: &str) -> CallResult<TimeData> {
        call(&self.cluster_sync_clients, target, ClusterRequest::GetTimeData)?.extract(|p| match p {
            ResponsePayload::TimeData(data) => Some(data),
            _ => None,
        })
    }

    fn get_objects_data(&self, target: &str, group: SyncGroup) -> CallResult<HashMap<String, String>> {
        call(&self.cluster_sync_clients, target, ClusterRequest::GetObjectsData { sync_group: group })?.extract(
            |p| match p {
                ResponsePayload::ObjectsData(objects) => Some(objects),
                _ => None,
            },
        )
    }

    fn get_events_data(&self, target: &str) -> CallResult<EventsData> {
        call(&self.cluster_sync_clients, target, ClusterRequest::GetEventsData)?.extract(|p| match p {
            ResponsePayload::EventsData(events) => Some(events),
            _ => None,
        })
    }

    fn get_native_input_data(&self, target: &str) -> CallResult<HashMap<String, String>> {
        call(&self.cluster_sync_clients, target, ClusterRequest::GetNativeInputData)?.extract(|p| match p {
            ResponsePayload::NativeInput(input) => Some(input),
            _ => None,
        })
    }

    fn synchronize_on_barrier(&self, target: &str, generation: u64) -> CallResult<()> {
        call(&self.render_sync_clients, target, ClusterRequest::SynchronizeOnBarrier { generation })?.check()?;
        Ok(())
    }

    fn emit_event_json(&self, target: &str, event: &ClusterEventJson) -> CallResult<()> {
        call(
            &self.cluster_sync_clients,
            target,
            ClusterRequest::EmitEventJson { event: event.clone() },
        )?
        .check()?;
        Ok(())
    }

    fn emit_event_binary(&self, target: &str, event: &ClusterEventBinary) -> CallResult<()> {
        call(
            &self.cluster_sync_clients,
            target,
            ClusterRequest::EmitEventBinary { event: event.clone() },
        )?
        .check()?;
        Ok(())
    }

    fn acquire_client_set(&self) -> ClientSetId {
        self.barrier_clients.acquire().id()
    }

    fn release_client_set(&self, set: ClientSetId) -> bool {
        self.barrier_clients.release(set)
    }

    fn create_barrier(
        &self,
        set: ClientSetId,
        target: &str,
        barrier_id: &str,
        node_to_callers: &BTreeMap<NodeId, Vec<String>>,
        timeout: Duration,
    ) -> CallResult<BarrierCreateResult> {
        self.client_set(set)?
            .create_barrier(target, barrier_id, node_to_callers, timeout)
    }

    fn wait_until_barrier_is_created(&self, set: ClientSetId, target: &str, barrier_id: &str) -> CallResult<()> {
        self.client_set(set)?.wait_until_barrier_created(target, barrier_id)
    }

    fn is_barrier_available(&self, set: ClientSetId, target: &str, barrier_id: &str) -> CallResult<bool> {
        self.client_set(set)?.is_barrier_available(target, barrier_id)
    }

    fn release_barrier(&self, set: ClientSetId, target: &str, barrier_id: &str) -> CallResult<BarrierControlResult> {
        self.client_set(set)?.release_barrier(target, barrier_id)
    }

    fn sync_on_barrier(
        &self,
        set: ClientSetId,
        target: &str,
        barrier_id: &str,
        caller_id: &str,
        generation: u64,
    ) -> CallResult<()> {
        self.client_set(set)?
            .sync_on_barrier(target, barrier_id, caller_id, generation)
    }

    fn sync_on_barrier_with_data(
        &self,
        set: ClientSetId,
        target: &str,
        barrier_id: &str,
        caller_id: &str,
        generation: u64,
        data: Vec<u8>,
    ) -> CallResult<Vec<u8>> {
        self.client_set(set)?
            .sync_on_barrier_with_data(target, barrier_id, caller_id, generation, data)
    }

    fn post_failure_negotiate(&self, target: &str, failed: &str, state: &RecoveryState) -> CallResult<RecoveryState> {
        let request = ClusterRequest::PostFailureNegotiate {
            failed_node: failed.to_string(),
            state: state.clone(),
        };
        call(&self.internal_clients, target, request)?.extract(|p| match p {
            ResponsePayload::Recovery(merged) => Some(merged),
            _ => None,
        })
    }

    fn request_node_drop(&self, target: &str, node_id: &str, reason: NodeDropReason) -> CallResult<()> {
        let request = ClusterRequest::RequestNodeDrop {
            node_id: node_id.to_string(),
            reason,
        };
        call(&self.internal_clients, target, request)?.check()?;
        Ok(())
    }

    fn drop_node(&self, node_id: &str) {
        let removed = self.alive.write().expect("alive lock").remove(node_id);

        let callers: usize = [self.cluster_sync.barriers(), &self.render_sync, &self.generic, &self.internal]
            .iter()
            .map(|service| service.handle_node_drop(node_id))
            .sum();
        self.cluster_sync_clients.forget(node_id);
        self.render_sync_clients.forget(node_id);
        self.internal_clients.forget(node_id);
        self.barrier_clients.forget_node(node_id);

        if removed {
            info!(local = %self.local.id, %node_id, callers, "node dropped from cluster");
        }
    }

    fn set_primary(&self, node_id: &str) {
        let previous = {
            let mut primary = self.primary.write().expect("primary lock");
            std::mem::replace(&mut *primary, node_id.to_string())
        };
        if previous == node_id {
            return;
        }

        info!(local = %self.local.id, %previous, primary = %node_id, "primary changed");
        if node_id == self.local.id {
            self.external.start();
        } else if previous == self.local.id {
            self.external.stop();
        }
    }

    fn prepare_recovery(&self, failed: &str, participants: &BTreeSet<NodeId>) {
        let barrier_id = barriers::recovery(failed);
        let observer = RecoveryObserver {
            local: self.local.id.clone(),
            targets: ProgressTargets {
                cluster_sync: Arc::clone(&self.cluster_sync),
                render_sync: Arc::clone(&self.render_sync),
                generic: Arc::clone(&self.generic),
            },
        };
        let result = self.internal.create_barrier_with(
            &barrier_id,
            participants
                .iter()
                .map(|n| BarrierCaller::new(n.clone(), n.clone()))
                .collect(),
            self.timeouts.game_start,
            vec![Arc::new(observer)],
        );
        debug!(local = %self.local.id, %barrier_id, participants = participants.len(), ?result, "recovery barrier prepared");
    }
}

#[cfg(test)]
mod tests {
    use lockstep_core::LocalNetwork;

    use super::*;
    use crate::data::NullDataSource;

    const CONFIG: &str = r#"
[cluster]
primary = "a"

[[cluster.nodes]]
id = "a"
host = "10.0.0.1"

[[cluster.nodes]]
id = "b"
host = "10.0.0.2"

[network]
connection_retry_count = 3
connection_retry_delay = "10ms"
promotion_retry_delay = "10ms"
"#;

    fn controller(net: &LocalNetwork, id: &str) -> ClusterNodeController {
        let config = ClusterConfig::from_toml_str(CONFIG).unwrap();
        ClusterNodeController::new(config, id, Arc::new(net.clone()), Arc::new(NullDataSource)).unwrap()
    }

    #[test]
    fn unknown_local_node_is_rejected() {
        let config = ClusterConfig::from_toml_str(CONFIG).unwrap();
        let err = ClusterNodeController::new(config, "z", Arc::new(LocalNetwork::new()), Arc::new(NullDataSource))
            .err()
            .unwrap();
        assert!(matches!(err, NodeError::UnknownNode(_)));
    }

    #[test]
    fn roles_follow_primary() {
        let net = LocalNetwork::new();
        let a = controller(&net, "a");
        let b = controller(&net, "b");
        assert_eq!(a.role(), NodeRole::Primary);
        assert_eq!(b.role(), NodeRole::Secondary);

        b.set_primary("b");
        assert_eq!(b.role(), NodeRole::Primary);
        assert!(b.external_servers_bound());

        b.set_primary("a");
        assert!(!b.external_servers_bound());
    }

    #[test]
    fn promotion_retries_until_ports_free() {
        let net = LocalNetwork::new();
        let b = controller(&net, "b");
        let busy = ServiceAddress::new("10.0.0.2", 41003);
        assert!(net.occupy(&busy));

        b.set_primary("b");
        assert!(!b.external_servers_bound());

        net.vacate(&busy);
        let mut bound = false;
        for _ in 0..100 {
            if b.external_servers_bound() {
                bound = true;
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert!(bound);
        b.shutdown();
    }

    #[test]
    fn drop_node_shrinks_membership() {
        let net = LocalNetwork::new();
        let a = controller(&net, "a");
        a.drop_node("b");
        assert_eq!(a.alive_nodes(), BTreeSet::from(["a".to_string()]));
    }
}
