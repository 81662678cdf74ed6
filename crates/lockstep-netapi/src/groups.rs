//! Protocol groups exposed by [`NetApi`].
//!
//! Cluster-sync and render-sync calls carry the caller's [`ThreadRole`]
//! and panic when called from any other thread. Events and generic barriers
//! may be used from anywhere.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use lockstep_barrier::ClientSetId;
use lockstep_core::protocol::{BarrierControlResult, BarrierCreateResult};
use lockstep_core::{ClusterEventBinary, ClusterEventJson, EventsData, NodeId, SyncGroup, ThreadRole, TimeData};

use crate::facade::{NetApi, NetResult, finish};

// ── Cluster sync ───────────────────────────────────────────────────

pub struct ClusterSyncApi<'a> {
    api: &'a NetApi,
}

impl<'a> ClusterSyncApi<'a> {
    pub(crate) fn new(api: &'a NetApi) -> Self {
        Self { api }
    }

    pub fn wait_for_game_start(&self, role: ThreadRole) -> NetResult<()> {
        let controller = self.api.route("WaitForGameStart", role, Some(ThreadRole::Game))?;
        finish("WaitForGameStart", controller.wait_for_game_start())
    }

    pub fn wait_for_frame_start(&self, role: ThreadRole) -> NetResult<()> {
        let controller = self.api.route("WaitForFrameStart", role, Some(ThreadRole::Game))?;
        finish("WaitForFrameStart", controller.wait_for_frame_start())
    }

    pub fn wait_for_frame_end(&self, role: ThreadRole) -> NetResult<()> {
        let controller = self.api.route("WaitForFrameEnd", role, Some(ThreadRole::Game))?;
        finish("WaitForFrameEnd", controller.wait_for_frame_end())
    }

    pub fn get_time_data(&self, role: ThreadRole) -> NetResult<TimeData> {
        let controller = self.api.route("GetTimeData", role, Some(ThreadRole::Game))?;
        finish("GetTimeData", controller.get_time_data())
    }

    pub fn get_objects_data(&self, role: ThreadRole, group: SyncGroup) -> NetResult<HashMap<String, String>> {
        let controller = self.api.route("GetObjectsData", role, Some(ThreadRole::Game))?;
        finish("GetObjectsData", controller.get_objects_data(group))
    }

    pub fn get_events_data(&self, role: ThreadRole) -> NetResult<EventsData> {
        let controller = self.api.route("GetEventsData", role, Some(ThreadRole::Game))?;
        finish("GetEventsData", controller.get_events_data())
    }

    pub fn get_native_input_data(&self, role: ThreadRole) -> NetResult<HashMap<String, String>> {
        let controller = self.api.route("GetNativeInputData", role, Some(ThreadRole::Game))?;
        finish("GetNativeInputData", controller.get_native_input_data())
    }
}

// ── Render sync ────────────────────────────────────────────────────

pub struct RenderSyncApi<'a> {
    api: &'a NetApi,
}

impl<'a> RenderSyncApi<'a> {
    pub(crate) fn new(api: &'a NetApi) -> Self {
        Self { api }
    }

    pub fn synchronize_on_barrier(&self, role: ThreadRole) -> NetResult<()> {
        let controller = self
            .api
            .route("SynchronizeOnBarrier", role, Some(ThreadRole::Rendering))?;
        finish("SynchronizeOnBarrier", controller.synchronize_on_barrier())
    }
}

// ── Events ─────────────────────────────────────────────────────────

pub struct EventsApi<'a> {
    api: &'a NetApi,
}

impl<'a> EventsApi<'a> {
    pub(crate) fn new(api: &'a NetApi) -> Self {
        Self { api }
    }

    pub fn emit_cluster_event_json(&self, event: &ClusterEventJson) -> NetResult<()> {
        let controller = self.api.route("EmitClusterEventJson", ThreadRole::Any, None)?;
        finish("EmitClusterEventJson", controller.emit_event_json(event))
    }

    pub fn emit_cluster_event_binary(&self, event: &ClusterEventBinary) -> NetResult<()> {
        let controller = self.api.route("EmitClusterEventBinary", ThreadRole::Any, None)?;
        finish("EmitClusterEventBinary", controller.emit_event_binary(event))
    }
}

// ── Generic barrier ────────────────────────────────────────────────

/// Generic barriers, addressed through a client set the caller owns.
pub struct GenericBarrierApi<'a> {
    api: &'a NetApi,
}

impl<'a> GenericBarrierApi<'a> {
    pub(crate) fn new(api: &'a NetApi) -> Self {
        Self { api }
    }

    pub fn acquire_client_set(&self) -> NetResult<ClientSetId> {
        let controller = self.api.route("AcquireClientSet", ThreadRole::Any, None)?;
        Ok(controller.acquire_client_set())
    }

    pub fn release_client_set(&self, set: ClientSetId) -> NetResult<bool> {
        let controller = self.api.route("ReleaseClientSet", ThreadRole::Any, None)?;
        Ok(controller.release_client_set(set))
    }

    pub fn create_barrier(
        &self,
        set: ClientSetId,
        barrier_id: &str,
        node_to_callers: &BTreeMap<NodeId, Vec<String>>,
        timeout: Duration,
    ) -> NetResult<BarrierCreateResult> {
        let controller = self.api.route("CreateBarrier", ThreadRole::Any, None)?;
        finish(
            "CreateBarrier",
            controller.create_barrier(set, barrier_id, node_to_callers, timeout),
        )
    }

    pub fn wait_until_barrier_is_created(&self, set: ClientSetId, barrier_id: &str) -> NetResult<()> {
        let controller = self.api.route("WaitUntilBarrierIsCreated", ThreadRole::Any, None)?;
        finish(
            "WaitUntilBarrierIsCreated",
            controller.wait_until_barrier_is_created(set, barrier_id),
        )
    }

    pub fn is_barrier_available(&self, set: ClientSetId, barrier_id: &str) -> NetResult<bool> {
        let controller = self.api.route("IsBarrierAvailable", ThreadRole::Any, None)?;
        finish("IsBarrierAvailable", controller.is_barrier_available(set, barrier_id))
    }

    pub fn release_barrier(&self, set: ClientSetId, barrier_id: &str) -> NetResult<BarrierControlResult> {
        let controller = self.api.route("ReleaseBarrier", ThreadRole::Any, None)?;
        finish("ReleaseBarrier", controller.release_barrier(set, barrier_id))
    }

    pub fn sync_on_barrier(&self, set: ClientSetId, barrier_id: &str, caller_id: &str) -> NetResult<()> {
        let controller = self.api.route("SyncOnBarrier", ThreadRole::Any, None)?;
        finish("SyncOnBarrier", controller.sync_on_barrier(set, barrier_id, caller_id))
    }

    pub fn sync_on_barrier_with_data(
        &self,
        set: ClientSetId,
        barrier_id: &str,
        caller_id: &str,
        data: Vec<u8>,
    ) -> NetResult<Vec<u8>> {
        let controller = self.api.route("SyncOnBarrierWithData", ThreadRole::Any, None)?;
        finish(
            "SyncOnBarrierWithData",
            controller.sync_on_barrier_with_data(set, barrier_id, caller_id, data),
        )
    }
}
