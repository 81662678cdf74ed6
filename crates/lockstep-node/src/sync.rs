//! Cluster-sync and render-sync services.
//!
//! Every node hosts the frame barriers; only the primary's ever see
//! callers. Caller IDs on frame barriers are node IDs, taken from the
//! transport rather than from the request.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, RwLock};

use tracing::{debug, warn};

use lockstep_barrier::{BarrierCaller, BarrierObserver, BarrierResult, BarrierService, ReleaseData};
use lockstep_core::config::Timeouts;
use lockstep_core::protocol::barriers;
use lockstep_core::{
    ClusterEventBinary, ClusterEventJson, ClusterRequest, ClusterResponse, CommResult, NodeId, RequestHandler,
    ResponsePayload, ServiceKind,
};

use crate::data::{ClusterDataSource, FrameSnapshot};
use crate::events::EventQueue;

/// Generation 0 on the wire joins whatever generation is open.
pub(crate) fn requested_generation(generation: u64) -> Option<u64> {
    (generation > 0).then_some(generation)
}

/// Frame barrier participant for a node.
pub(crate) fn node_caller(node: &str) -> BarrierCaller {
    BarrierCaller::new(node, node)
}

fn node_callers(nodes: &BTreeSet<NodeId>) -> Vec<BarrierCaller> {
    nodes.iter().map(|n| node_caller(n)).collect()
}

struct FrameState {
    source: Arc<dyn ClusterDataSource>,
    pending: Mutex<EventQueue>,
    snapshot: RwLock<FrameSnapshot>,
}

impl FrameState {
    fn capture(&self, generation: u64, take_events: bool) {
        let events = if take_events {
            self.pending.lock().expect("events lock").take()
        } else {
            Default::default()
        };
        let snapshot = FrameSnapshot::capture(self.source.as_ref(), generation, events);
        *self.snapshot.write().expect("snapshot lock") = snapshot;
    }
}

struct FrameStartObserver {
    frame: Arc<FrameState>,
}

impl BarrierObserver for FrameStartObserver {
    fn on_pre_release(&self, _barrier_id: &str, generation: u64, _data: &mut ReleaseData) {
        self.frame.capture(generation, true);
        debug!(generation, "frame snapshot captured");
    }
}

/// Frame barriers plus the data served alongside them.
pub struct ClusterSyncService {
    local: NodeId,
    barriers: Arc<BarrierService>,
    frame: Arc<FrameState>,
}

impl ClusterSyncService {
    pub fn new(
        local: NodeId,
        nodes: &BTreeSet<NodeId>,
        timeouts: &Timeouts,
        source: Arc<dyn ClusterDataSource>,
    ) -> Self {
        let registry = Arc::new(BarrierService::new(format!("cluster_sync@{local}")));
        let frame = Arc::new(FrameState {
            source,
            pending: Mutex::new(EventQueue::new()),
            snapshot: RwLock::new(FrameSnapshot::default()),
        });

        registry.create_barrier_with(barriers::GAME_START, node_callers(nodes), timeouts.game_start, Vec::new());
        registry.create_barrier_with(
            barriers::FRAME_START,
            node_callers(nodes),
            timeouts.frame_start,
            vec![Arc::new(FrameStartObserver {
                frame: Arc::clone(&frame),
            })],
        );
        registry.create_barrier_with(barriers::FRAME_END, node_callers(nodes), timeouts.frame_end, Vec::new());

        Self {
            local,
            barriers: registry,
            frame,
        }
    }

    pub fn barriers(&self) -> &Arc<BarrierService> {
        &self.barriers
    }

    /// Block `caller` on one of the frame barriers.
    pub fn wait(&self, barrier_id: &str, caller: &str, generation: Option<u64>) -> BarrierResult<()> {
        self.barriers
            .sync(barrier_id, &node_caller(caller), generation, Vec::new())?;
        Ok(())
    }

    pub fn snapshot(&self) -> FrameSnapshot {
        self.frame.snapshot.read().expect("snapshot lock").clone()
    }

    /// Re-sample the data source without touching pending events. Used
    /// when a newly promoted primary skips generations it never hosted.
    pub fn refresh_snapshot(&self, generation: u64) {
        self.frame.capture(generation, false);
        debug!(node_id = %self.local, generation, "frame snapshot refreshed");
    }

    pub fn emit_json(&self, event: ClusterEventJson) {
        self.frame.pending.lock().expect("events lock").push_json(event);
    }

    pub fn emit_binary(&self, event: ClusterEventBinary) {
        self.frame.pending.lock().expect("events lock").push_binary(event);
    }

    pub fn pending_events(&self) -> usize {
        self.frame.pending.lock().expect("events lock").len()
    }
}

/// Serves the cluster-sync protocol group.
pub struct ClusterSyncHandler {
    service: Arc<ClusterSyncService>,
}

impl ClusterSyncHandler {
    pub fn new(service: Arc<ClusterSyncService>) -> Self {
        Self { service }
    }

    fn wait(&self, barrier_id: &str, from: &NodeId, generation: u64) -> ClusterResponse {
        match self.service.wait(barrier_id, from, requested_generation(generation)) {
            Ok(()) => ClusterResponse::ack(),
            Err(e) => {
                warn!(%barrier_id, %from, generation, error = %e, "frame barrier failed");
                ClusterResponse::status(e.comm_result())
            }
        }
    }
}

impl RequestHandler for ClusterSyncHandler {
    fn handle(&self, from: &NodeId, request: ClusterRequest) -> ClusterResponse {
        match request {
            ClusterRequest::WaitForGameStart { generation } => self.wait(barriers::GAME_START, from, generation),
            ClusterRequest::WaitForFrameStart { generation } => self.wait(barriers::FRAME_START, from, generation),
            ClusterRequest::WaitForFrameEnd { generation } => self.wait(barriers::FRAME_END, from, generation),
            ClusterRequest::GetTimeData => {
                ClusterResponse::ok(ResponsePayload::TimeData(self.service.snapshot().time_data))
            }
            ClusterRequest::GetObjectsData { sync_group } => {
                ClusterResponse::ok(ResponsePayload::ObjectsData(self.service.snapshot().objects(sync_group)))
            }
            ClusterRequest::GetEventsData => {
                ClusterResponse::ok(ResponsePayload::EventsData(self.service.snapshot().events))
            }
            ClusterRequest::GetNativeInputData => {
                ClusterResponse::ok(ResponsePayload::NativeInput(self.service.snapshot().native_input))
            }
            ClusterRequest::EmitEventJson { event } => {
                self.service.emit_json(event);
                ClusterResponse::ack()
            }
            ClusterRequest::EmitEventBinary { event } => {
                self.service.emit_binary(event);
                ClusterResponse::ack()
            }
            other => {
                warn!(%from, op = other.name(), "unsupported cluster-sync request");
                ClusterResponse::status(CommResult::NotAllowed)
            }
        }
    }

    fn shutdown(&self) {
        self.service.barriers().shutdown();
    }
}

/// Serves the render-sync protocol group.
pub struct RenderSyncHandler {
    barriers: Arc<BarrierService>,
}

impl RenderSyncHandler {
    /// Render-sync service with a render-present barrier over `nodes`.
    pub fn service(local: &str, nodes: &BTreeSet<NodeId>, timeouts: &Timeouts) -> Arc<BarrierService> {
        let registry = Arc::new(BarrierService::new(format!("render_sync@{local}")));
        registry.create_barrier_with(barriers::RENDER_PRESENT, node_callers(nodes), timeouts.render, Vec::new());
        registry
    }

    pub fn new(barriers: Arc<BarrierService>) -> Self {
        Self { barriers }
    }
}

impl RequestHandler for RenderSyncHandler {
    fn handle(&self, from: &NodeId, request: ClusterRequest) -> ClusterResponse {
        match request {
            ClusterRequest::SynchronizeOnBarrier { generation } => {
                match self.barriers.sync(
                    barriers::RENDER_PRESENT,
                    &node_caller(from),
                    requested_generation(generation),
                    Vec::new(),
                ) {
                    Ok(_) => ClusterResponse::ack(),
                    Err(e) => {
                        warn!(%from, generation, error = %e, "render barrier failed");
                        ClusterResponse::status(e.comm_result())
                    }
                }
            }
            other => {
                warn!(%from, op = other.name(), "unsupported render-sync request");
                ClusterResponse::status(CommResult::NotAllowed)
            }
        }
    }

    fn shutdown(&self) {
        self.barriers.shutdown();
    }
}

/// External event intake on the primary's fixed event ports.
pub struct ExternalEventsHandler {
    kind: ServiceKind,
    service: Arc<ClusterSyncService>,
}

impl ExternalEventsHandler {
    pub fn new(kind: ServiceKind, service: Arc<ClusterSyncService>) -> Self {
        Self { kind, service }
    }
}

impl RequestHandler for ExternalEventsHandler {
    fn handle(&self, from: &NodeId, request: ClusterRequest) -> ClusterResponse {
        match (self.kind, request) {
            (ServiceKind::EventsJson, ClusterRequest::EmitEventJson { event }) => {
                self.service.emit_json(event);
                ClusterResponse::ack()
            }
            (ServiceKind::EventsBinary, ClusterRequest::EmitEventBinary { event }) => {
                self.service.emit_binary(event);
                ClusterResponse::ack()
            }
            (kind, other) => {
                warn!(service = kind.as_str(), %from, op = other.name(), "unsupported event request");
                ClusterResponse::status(CommResult::NotAllowed)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::thread;
    use std::time::Duration;

    use lockstep_core::{SyncGroup, TimeData};

    use super::*;

    struct Counter(Mutex<f64>);

    impl ClusterDataSource for Counter {
        fn time_data(&self) -> TimeData {
            let mut t = self.0.lock().unwrap();
            *t += 1.0;
            TimeData {
                delta_time: 1.0,
                game_time: *t,
                frame_time: None,
            }
        }

        fn objects(&self, group: SyncGroup) -> HashMap<String, String> {
            HashMap::from([("g".to_string(), group.as_str().to_string())])
        }
    }

    fn timeouts() -> Timeouts {
        Timeouts {
            game_start: Duration::from_secs(5),
            frame_start: Duration::from_secs(5),
            frame_end: Duration::from_secs(5),
            render: Duration::from_secs(5),
            promotion_retry_delay: Duration::from_millis(10),
        }
    }

    fn nodes(ids: &[&str]) -> BTreeSet<NodeId> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    fn service(ids: &[&str]) -> Arc<ClusterSyncService> {
        Arc::new(ClusterSyncService::new(
            "a".into(),
            &nodes(ids),
            &timeouts(),
            Arc::new(Counter(Mutex::new(0.0))),
        ))
    }

    #[test]
    fn frame_start_snapshots_data_and_events() {
        let service = service(&["a"]);
        let handler = ClusterSyncHandler::new(Arc::clone(&service));

        handler.handle(
            &"a".to_string(),
            ClusterRequest::EmitEventJson {
                event: ClusterEventJson {
                    category: "c".into(),
                    ..Default::default()
                },
            },
        );
        assert_eq!(service.pending_events(), 1);

        let resp = handler.handle(&"a".to_string(), ClusterRequest::WaitForFrameStart { generation: 1 });
        assert_eq!(resp.result, CommResult::Ok);
        assert_eq!(service.pending_events(), 0);

        let snapshot = service.snapshot();
        assert_eq!(snapshot.generation, 1);
        assert_eq!(snapshot.time_data.game_time, 1.0);
        assert_eq!(snapshot.events.json.len(), 1);

        let resp = handler.handle(
            &"a".to_string(),
            ClusterRequest::GetObjectsData {
                sync_group: SyncGroup::Tick,
            },
        );
        assert_eq!(
            resp.payload,
            ResponsePayload::ObjectsData(HashMap::from([("g".to_string(), "tick".to_string())]))
        );
    }

    #[test]
    fn frame_barrier_waits_for_every_node() {
        let service = service(&["a", "b"]);
        let handler = Arc::new(ClusterSyncHandler::new(Arc::clone(&service)));

        let other = {
            let handler = Arc::clone(&handler);
            thread::spawn(move || handler.handle(&"b".to_string(), ClusterRequest::WaitForGameStart { generation: 1 }))
        };
        thread::sleep(Duration::from_millis(20));
        assert!(!other.is_finished());

        let resp = handler.handle(&"a".to_string(), ClusterRequest::WaitForGameStart { generation: 1 });
        assert_eq!(resp.result, CommResult::Ok);
        assert_eq!(other.join().unwrap().result, CommResult::Ok);
    }

    #[test]
    fn unknown_node_is_not_allowed() {
        let service = service(&["a"]);
        let handler = ClusterSyncHandler::new(service);
        let resp = handler.handle(&"z".to_string(), ClusterRequest::WaitForFrameEnd { generation: 1 });
        assert_eq!(resp.result, CommResult::NotAllowed);
    }

    #[test]
    fn render_barrier_uses_transport_identity() {
        let registry = RenderSyncHandler::service("a", &nodes(&["a"]), &timeouts());
        let handler = RenderSyncHandler::new(Arc::clone(&registry));
        let resp = handler.handle(&"a".to_string(), ClusterRequest::SynchronizeOnBarrier { generation: 1 });
        assert_eq!(resp.result, CommResult::Ok);
        assert_eq!(registry.progress()[barriers::RENDER_PRESENT], 1);
    }

    #[test]
    fn external_json_port_rejects_binary_events() {
        let handler = ExternalEventsHandler::new(ServiceKind::EventsJson, service(&["a"]));
        let resp = handler.handle(
            &"client".to_string(),
            ClusterRequest::EmitEventBinary {
                event: ClusterEventBinary::default(),
            },
        );
        assert_eq!(resp.result, CommResult::NotAllowed);
    }
}
