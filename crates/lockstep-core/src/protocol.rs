//! Wire protocol between cluster nodes.
//!
//! One request enum covers every protocol group (cluster-sync,
//! render-sync, events, generic barrier, internal comm). Each response
//! carries a `CommResult` plus an optional payload. Framing and encoding
//! belong to the transport; these types only need to be serde-friendly.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::error::{CallError, CallResult};
use crate::types::*;

/// Well-known barrier keys used by the synchronization protocol.
pub mod barriers {
    pub const GAME_START: &str = "GameStart";
    pub const FRAME_START: &str = "FrameStart";
    pub const FRAME_END: &str = "FrameEnd";
    pub const RENDER_PRESENT: &str = "RenderPresent";
    pub const GATHER_HOSTING_INFO: &str = "GatherServicesHostingInfo";

    /// Prefix for generic barrier progress keys.
    pub const GENERIC_PREFIX: &str = "gb:";

    /// Barrier that gathers recovery state after `failed` went down.
    pub fn recovery(failed: &str) -> String {
        format!("PostFailureNegotiate:{failed}")
    }

    pub fn generic(barrier_id: &str) -> String {
        format!("{GENERIC_PREFIX}{barrier_id}")
    }
}

/// Outcome of a barrier creation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BarrierCreateResult {
    CreatedSuccessfully,
    AlreadyExists,
}

/// Outcome of a barrier control request (release).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BarrierControlResult {
    Ok,
    NotFound,
}

/// Every request a node can send to another node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ClusterRequest {
    // ── cluster sync ──
    WaitForGameStart {
        generation: u64,
    },
    WaitForFrameStart {
        generation: u64,
    },
    WaitForFrameEnd {
        generation: u64,
    },
    GetTimeData,
    GetObjectsData {
        sync_group: SyncGroup,
    },
    GetEventsData,
    GetNativeInputData,

    // ── render sync ──
    SynchronizeOnBarrier {
        generation: u64,
    },

    // ── events ──
    EmitEventJson {
        event: ClusterEventJson,
    },
    EmitEventBinary {
        event: ClusterEventBinary,
    },

    // ── generic barrier ──
    CreateBarrier {
        barrier_id: String,
        node_to_callers: BTreeMap<NodeId, Vec<String>>,
        timeout_ms: u64,
    },
    WaitUntilBarrierIsCreated {
        barrier_id: String,
    },
    IsBarrierAvailable {
        barrier_id: String,
    },
    ReleaseBarrier {
        barrier_id: String,
    },
    SyncOnBarrier {
        barrier_id: String,
        caller_id: String,
        generation: u64,
    },
    SyncOnBarrierWithData {
        barrier_id: String,
        caller_id: String,
        generation: u64,
        request: Vec<u8>,
    },

    // ── internal comm ──
    GatherServicesHostingInfo {
        info: NodeHostingInfo,
    },
    PostFailureNegotiate {
        failed_node: NodeId,
        state: RecoveryState,
    },
    RequestNodeDrop {
        node_id: NodeId,
        reason: NodeDropReason,
    },
}

impl ClusterRequest {
    /// Short operation name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            ClusterRequest::WaitForGameStart { .. } => "wait_for_game_start",
            ClusterRequest::WaitForFrameStart { .. } => "wait_for_frame_start",
            ClusterRequest::WaitForFrameEnd { .. } => "wait_for_frame_end",
            ClusterRequest::GetTimeData => "get_time_data",
            ClusterRequest::GetObjectsData { .. } => "get_objects_data",
            ClusterRequest::GetEventsData => "get_events_data",
            ClusterRequest::GetNativeInputData => "get_native_input_data",
            ClusterRequest::SynchronizeOnBarrier { .. } => "synchronize_on_barrier",
            ClusterRequest::EmitEventJson { .. } => "emit_event_json",
            ClusterRequest::EmitEventBinary { .. } => "emit_event_binary",
            ClusterRequest::CreateBarrier { .. } => "create_barrier",
            ClusterRequest::WaitUntilBarrierIsCreated { .. } => "wait_until_barrier_is_created",
            ClusterRequest::IsBarrierAvailable { .. } => "is_barrier_available",
            ClusterRequest::ReleaseBarrier { .. } => "release_barrier",
            ClusterRequest::SyncOnBarrier { .. } => "sync_on_barrier",
            ClusterRequest::SyncOnBarrierWithData { .. } => "sync_on_barrier_with_data",
            ClusterRequest::GatherServicesHostingInfo { .. } => "gather_services_hosting_info",
            ClusterRequest::PostFailureNegotiate { .. } => "post_failure_negotiate",
            ClusterRequest::RequestNodeDrop { .. } => "request_node_drop",
        }
    }
}

/// Payload attached to a response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ResponsePayload {
    None,
    TimeData(TimeData),
    ObjectsData(HashMap<String, String>),
    EventsData(EventsData),
    NativeInput(HashMap<String, String>),
    BarrierCreated(BarrierCreateResult),
    BarrierAvailable(bool),
    BarrierControl(BarrierControlResult),
    Data(Vec<u8>),
    HostingInfo(ClusterHostingInfo),
    Recovery(RecoveryState),
}

/// A reply to a `ClusterRequest`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterResponse {
    pub result: CommResult,
    pub payload: ResponsePayload,
}

impl ClusterResponse {
    pub fn ok(payload: ResponsePayload) -> Self {
        Self {
            result: CommResult::Ok,
            payload,
        }
    }

    pub fn ack() -> Self {
        Self::ok(ResponsePayload::None)
    }

    pub fn status(result: CommResult) -> Self {
        Self {
            result,
            payload: ResponsePayload::None,
        }
    }

    /// Turn a non-`Ok` result into `CallError::Rejected`.
    pub fn check(self) -> CallResult<ResponsePayload> {
        match self.result {
            CommResult::Ok => Ok(self.payload),
            other => Err(CallError::Rejected(other)),
        }
    }

    /// Extract a typed payload. A payload of the wrong shape is a protocol
    /// violation by the remote and is reported as an internal error.
    pub fn extract<T>(self, pick: impl FnOnce(ResponsePayload) -> Option<T>) -> CallResult<T> {
        let payload = self.check()?;
        pick(payload).ok_or(CallError::Rejected(CommResult::InternalError))
    }
}
