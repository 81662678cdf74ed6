//! Client side of the generic barrier protocol.
//!
//! Each consumer acquires its own `BarrierClientSet` from the node's pool
//! so that a blocking sync issued by one consumer never queues behind
//! another consumer's request on a shared connection.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tracing::debug;

use lockstep_core::protocol::{BarrierControlResult, BarrierCreateResult};
use lockstep_core::{
    CallResult, ClusterRequest, ConnectionSet, NodeId, ResponsePayload, RetryPolicy, ServiceAddress, ServiceKind,
    Transport,
};

/// Handle identifying one acquired client set.
pub type ClientSetId = u32;

/// Independent connections to the generic barrier service of every node.
pub struct BarrierClientSet {
    id: ClientSetId,
    connections: ConnectionSet,
}

impl BarrierClientSet {
    fn new(id: ClientSetId, local: NodeId, transport: Arc<dyn Transport>, retry: RetryPolicy) -> Self {
        Self {
            id,
            connections: ConnectionSet::new(ServiceKind::GenericBarrier, local, transport, retry),
        }
    }

    pub fn id(&self) -> ClientSetId {
        self.id
    }

    pub fn create_barrier(
        &self,
        target: &str,
        barrier_id: &str,
        node_to_callers: &BTreeMap<NodeId, Vec<String>>,
        timeout: Duration,
    ) -> CallResult<BarrierCreateResult> {
        let request = ClusterRequest::CreateBarrier {
            barrier_id: barrier_id.to_string(),
            node_to_callers: node_to_callers.clone(),
            timeout_ms: timeout.as_millis() as u64,
        };
        self.connections.request(target, &request)?.extract(|p| match p {
            ResponsePayload::BarrierCreated(result) => Some(result),
            _ => None,
        })
    }

    pub fn wait_until_barrier_created(&self, target: &str, barrier_id: &str) -> CallResult<()> {
        let request = ClusterRequest::WaitUntilBarrierIsCreated {
            barrier_id: barrier_id.to_string(),
        };
        self.connections.request(target, &request)?.check()?;
        Ok(())
    }

    pub fn is_barrier_available(&self, target: &str, barrier_id: &str) -> CallResult<bool> {
        let request = ClusterRequest::IsBarrierAvailable {
            barrier_id: barrier_id.to_string(),
        };
        self.connections.request(target, &request)?.extract(|p| match p {
            ResponsePayload::BarrierAvailable(available) => Some(available),
            _ => None,
        })
    }

    pub fn release_barrier(&self, target: &str, barrier_id: &str) -> CallResult<BarrierControlResult> {
        let request = ClusterRequest::ReleaseBarrier {
            barrier_id: barrier_id.to_string(),
        };
        self.connections.request(target, &request)?.extract(|p| match p {
            ResponsePayload::BarrierControl(result) => Some(result),
            _ => None,
        })
    }

    pub fn sync_on_barrier(&self, target: &str, barrier_id: &str, caller_id: &str, generation: u64) -> CallResult<()> {
        let request = ClusterRequest::SyncOnBarrier {
            barrier_id: barrier_id.to_string(),
            caller_id: caller_id.to_string(),
            generation,
        };
        self.connections.request(target, &request)?.check()?;
        Ok(())
    }

    pub fn sync_on_barrier_with_data(
        &self,
        target: &str,
        barrier_id: &str,
        caller_id: &str,
        generation: u64,
        data: Vec<u8>,
    ) -> CallResult<Vec<u8>> {
        let request = ClusterRequest::SyncOnBarrierWithData {
            barrier_id: barrier_id.to_string(),
            caller_id: caller_id.to_string(),
            generation,
            request: data,
        };
        self.connections.request(target, &request)?.extract(|p| match p {
            ResponsePayload::Data(data) => Some(data),
            _ => None,
        })
    }
}

/// Hands out client sets and keeps their address books in step.
pub struct BarrierClientPool {
    local: NodeId,
    transport: Arc<dyn Transport>,
    retry: RetryPolicy,
    addresses: RwLock<BTreeMap<NodeId, ServiceAddress>>,
    sets: Mutex<HashMap<ClientSetId, Arc<BarrierClientSet>>>,
    next_id: AtomicU32,
}

impl BarrierClientPool {
    pub fn new(local: NodeId, transport: Arc<dyn Transport>, retry: RetryPolicy) -> Self {
        Self {
            local,
            transport,
            retry,
            addresses: RwLock::new(BTreeMap::new()),
            sets: Mutex::new(HashMap::new()),
            next_id: AtomicU32::new(1),
        }
    }

    /// Record where `node_id` hosts its generic barrier service.
    pub fn set_address(&self, node_id: &str, address: ServiceAddress) {
        {
            let mut addresses = self.addresses.write().expect("addresses lock");
            addresses.insert(node_id.to_string(), address.clone());
        }
        let sets = self.sets.lock().expect("sets lock");
        for set in sets.values() {
            set.connections.set_address(node_id, address.clone());
        }
    }

    /// Create a new client set connected (lazily) to every known node.
    pub fn acquire(&self) -> Arc<BarrierClientSet> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let set = BarrierClientSet::new(id, self.local.clone(), Arc::clone(&self.transport), self.retry);
        {
            let addresses = self.addresses.read().expect("addresses lock");
            for (node_id, address) in addresses.iter() {
                set.connections.set_address(node_id, address.clone());
            }
        }
        let set = Arc::new(set);
        let mut sets = self.sets.lock().expect("sets lock");
        sets.insert(id, Arc::clone(&set));
        debug!(node_id = %self.local, client_set = id, "client set acquired");
        set
    }

    pub fn get(&self, id: ClientSetId) -> Option<Arc<BarrierClientSet>> {
        let sets = self.sets.lock().expect("sets lock");
        sets.get(&id).cloned()
    }

    /// Close a client set's connections. Returns false for unknown IDs.
    pub fn release(&self, id: ClientSetId) -> bool {
        let removed = {
            let mut sets = self.sets.lock().expect("sets lock");
            sets.remove(&id)
        };
        match removed {
            Some(set) => {
                set.connections.close_all();
                debug!(node_id = %self.local, client_set = id, "client set released");
                true
            }
            None => false,
        }
    }

    /// Forget a node that left the cluster.
    pub fn forget_node(&self, node_id: &str) {
        {
            let mut addresses = self.addresses.write().expect("addresses lock");
            addresses.remove(node_id);
        }
        let sets = self.sets.lock().expect("sets lock");
        for set in sets.values() {
            set.connections.forget(node_id);
        }
    }

    pub fn active_sets(&self) -> usize {
        self.sets.lock().expect("sets lock").len()
    }
}
