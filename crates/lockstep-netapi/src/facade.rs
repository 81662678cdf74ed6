//! Routing from protocol groups to the active failover controller.

use std::sync::{Arc, RwLock};

use tracing::debug;

use lockstep_core::{CommResult, ThreadRole};
use lockstep_failover::{FailoverController, TransactionResult};
use lockstep_node::ClusterNodeController;

use crate::groups::{ClusterSyncApi, EventsApi, GenericBarrierApi, RenderSyncApi};

/// Outcome of a NetAPI call. The error side is never `CommResult::Ok`.
pub type NetResult<T> = Result<T, CommResult>;

#[derive(Default)]
pub struct NetApi {
    active: RwLock<Option<Arc<FailoverController>>>,
}

impl NetApi {
    /// A facade with no controller bound. Every call fails until
    /// [`NetApi::bind`] is called.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bound(controller: Arc<FailoverController>) -> Self {
        let api = Self::new();
        api.bind(controller);
        api
    }

    /// Create a failover controller for `node` and bind it.
    pub fn attach(node: &Arc<ClusterNodeController>) -> Self {
        Self::bound(FailoverController::attach(node))
    }

    pub fn bind(&self, controller: Arc<FailoverController>) {
        debug!(node_id = %controller.local_id(), "failover controller bound");
        *self.active.write().expect("netapi lock") = Some(controller);
    }

    pub fn unbind(&self) -> Option<Arc<FailoverController>> {
        self.active.write().expect("netapi lock").take()
    }

    pub fn controller(&self) -> Option<Arc<FailoverController>> {
        self.active.read().expect("netapi lock").clone()
    }

    pub fn cluster_sync(&self) -> ClusterSyncApi<'_> {
        ClusterSyncApi::new(self)
    }

    pub fn render_sync(&self) -> RenderSyncApi<'_> {
        RenderSyncApi::new(self)
    }

    pub fn events(&self) -> EventsApi<'_> {
        EventsApi::new(self)
    }

    pub fn generic_barrier(&self) -> GenericBarrierApi<'_> {
        GenericBarrierApi::new(self)
    }

    /// Check thread affinity, then resolve the active controller.
    ///
    /// # Panics
    ///
    /// If `role` is not the role the call is reserved for.
    pub(crate) fn route(
        &self,
        call: &'static str,
        role: ThreadRole,
        required: Option<ThreadRole>,
    ) -> NetResult<Arc<FailoverController>> {
        if let Some(required) = required {
            assert_eq!(role, required, "{call} called from the wrong thread");
        }

        self.controller().ok_or_else(|| {
            debug!(call, "no failover controller bound");
            CommResult::InternalError
        })
    }
}

/// Collapse a transaction outcome into a `NetResult`.
pub(crate) fn finish<T>(call: &'static str, result: TransactionResult<T>) -> NetResult<T> {
    result.map_err(|e| {
        debug!(call, error = %e, "call failed");
        e.comm_result()
    })
}
