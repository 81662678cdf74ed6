//! Addressed protocol operations used by the failover layer.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;

use lockstep_barrier::ClientSetId;
use lockstep_core::protocol::{BarrierControlResult, BarrierCreateResult};
use lockstep_core::{
    CallResult, ClusterEventBinary, ClusterEventJson, EventsData, NodeDropReason, NodeId, RecoveryState, SyncGroup,
    TimeData,
};

/// Every outward call a node can make, addressed to an explicit target,
/// plus the local membership changes recovery needs.
///
/// Remote operations never retry and never react to failures; that is
/// the failover layer's job. Generic barrier operations go through the
/// client set named by `set`.
pub trait ClusterOps: Send + Sync {
    fn local_id(&self) -> &NodeId;

    /// Node currently acting as primary.
    fn primary(&self) -> NodeId;

    /// Nodes not dropped so far, including this one.
    fn alive_nodes(&self) -> BTreeSet<NodeId>;

    // ── cluster sync ──

    fn wait_for_game_start(&self, target: &str, generation: u64) -> CallResult<()>;

    fn wait_for_frame_start(&self, target: &str, generation: u64) -> CallResult<()>;

    fn wait_for_frame_end(&self, target: &str, generation: u64) -> CallResult<()>;

    fn get_time_data(&self, target: &str) -> CallResult<TimeData>;

    fn get_objects_data(&self, target: &str, group: SyncGroup) -> CallResult<HashMap<String, String>>;

    fn get_events_data(&self, target: &str) -> CallResult<EventsData>;

    fn get_native_input_data(&self, target: &str) -> CallResult<HashMap<String, String>>;

    // ── render sync ──

    fn synchronize_on_barrier(&self, target: &str, generation: u64) -> CallResult<()>;

    // ── events ──

    fn emit_event_json(&self, target: &str, event: &ClusterEventJson) -> CallResult<()>;

    fn emit_event_binary(&self, target: &str, event: &ClusterEventBinary) -> CallResult<()>;

    // ── generic barrier ──

    fn acquire_client_set(&self) -> ClientSetId;

    fn release_client_set(&self, set: ClientSetId) -> bool;

    fn create_barrier(
        &self,
        set: ClientSetId,
        target: &str,
        barrier_id: &str,
        node_to_callers: &BTreeMap<NodeId, Vec<String>>,
        timeout: Duration,
    ) -> CallResult<BarrierCreateResult>;

    fn wait_until_barrier_is_created(&self, set: ClientSetId, target: &str, barrier_id: &str) -> CallResult<()>;

    fn is_barrier_available(&self, set: ClientSetId, target: &str, barrier_id: &str) -> CallResult<bool>;

    fn release_barrier(&self, set: ClientSetId, target: &str, barrier_id: &str) -> CallResult<BarrierControlResult>;

    fn sync_on_barrier(
        &self,
        set: ClientSetId,
        target: &str,
        barrier_id: &str,
        caller_id: &str,
        generation: u64,
    ) -> CallResult<()>;

    fn sync_on_barrier_with_data(
        &self,
        set: ClientSetId,
        target: &str,
        barrier_id: &str,
        caller_id: &str,
        generation: u64,
        data: Vec<u8>,
    ) -> CallResult<Vec<u8>>;

    // ── internal comm ──

    fn post_failure_negotiate(&self, target: &str, failed: &str, state: &RecoveryState) -> CallResult<RecoveryState>;

    fn request_node_drop(&self, target: &str, node_id: &str, reason: NodeDropReason) -> CallResult<()>;

    // ── local membership ──

    /// Forget `node_id`: unregister its barrier callers and drop every
    /// connection to it.
    fn drop_node(&self, node_id: &str);

    /// Record a new primary. Promotes or demotes this node as needed.
    fn set_primary(&self, node_id: &str);

    /// Host the recovery barrier for `failed` with `participants` as its
    /// expected callers.
    fn prepare_recovery(&self, failed: &str, participants: &BTreeSet<NodeId>);
}
