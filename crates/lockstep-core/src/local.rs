//! In-process transport.
//!
//! `LocalNetwork` routes requests between nodes living in the same
//! process. Requests and responses are JSON-encoded on the way through so
//! the wire types get exercised exactly as they would over a socket.
//! Nodes can be killed (every listener they own disappears and in-flight
//! requests to them fail) and ports can be occupied to emulate another
//! process still holding them.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use crate::error::CommError;
use crate::protocol::{ClusterRequest, ClusterResponse};
use crate::transport::{Connection, Listener, RequestHandler, Transport};
use crate::types::{NodeId, ServiceAddress};

/// First port handed out for dynamic bindings.
const DYNAMIC_PORT_BASE: u16 = 49152;

struct Binding {
    id: u64,
    owner: NodeId,
    handler: Arc<dyn RequestHandler>,
}

#[derive(Default)]
struct NetworkState {
    bindings: HashMap<ServiceAddress, Binding>,
    occupied: HashSet<ServiceAddress>,
    down: HashSet<NodeId>,
    next_binding: u64,
    next_port: u16,
}

impl NetworkState {
    fn in_use(&self, address: &ServiceAddress) -> bool {
        self.bindings.contains_key(address) || self.occupied.contains(address)
    }

    fn allocate_port(&mut self, host: &str) -> Option<u16> {
        if self.next_port < DYNAMIC_PORT_BASE {
            self.next_port = DYNAMIC_PORT_BASE;
        }
        for _ in 0..=(u16::MAX - DYNAMIC_PORT_BASE) {
            let port = self.next_port;
            self.next_port = if port == u16::MAX { DYNAMIC_PORT_BASE } else { port + 1 };
            if !self.in_use(&ServiceAddress::new(host, port)) {
                return Some(port);
            }
        }
        None
    }
}

/// Shared in-process network. Cheap to clone.
#[derive(Clone, Default)]
pub struct LocalNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Crash a node: drop every listener it owns, fail requests from and
    /// to it, and tell its handlers to shut down.
    pub fn kill(&self, node_id: &str) {
        let handlers: Vec<Arc<dyn RequestHandler>> = {
            let mut state = self.state.lock().expect("network lock");
            state.down.insert(node_id.to_string());
            let addresses: Vec<ServiceAddress> = state
                .bindings
                .iter()
                .filter(|(_, b)| b.owner == node_id)
                .map(|(a, _)| a.clone())
                .collect();
            addresses
                .iter()
                .filter_map(|a| state.bindings.remove(a))
                .map(|b| b.handler)
                .collect()
        };

        info!(%node_id, listeners = handlers.len(), "node killed");
        for handler in handlers {
            handler.shutdown();
        }
    }

    pub fn is_down(&self, node_id: &str) -> bool {
        let state = self.state.lock().expect("network lock");
        state.down.contains(node_id)
    }

    /// Mark an address as held by something outside the cluster.
    ///
    /// Returns false if it is already bound or occupied.
    pub fn occupy(&self, address: &ServiceAddress) -> bool {
        let mut state = self.state.lock().expect("network lock");
        if state.in_use(address) {
            return false;
        }
        state.occupied.insert(address.clone())
    }

    pub fn vacate(&self, address: &ServiceAddress) {
        let mut state = self.state.lock().expect("network lock");
        state.occupied.remove(address);
    }

    pub fn is_bound(&self, address: &ServiceAddress) -> bool {
        let state = self.state.lock().expect("network lock");
        state.bindings.contains_key(address)
    }

    /// Addresses currently bound by `node_id`.
    pub fn bound_by(&self, node_id: &str) -> Vec<ServiceAddress> {
        let state = self.state.lock().expect("network lock");
        let mut addresses: Vec<ServiceAddress> = state
            .bindings
            .iter()
            .filter(|(_, b)| b.owner == node_id)
            .map(|(a, _)| a.clone())
            .collect();
        addresses.sort();
        addresses
    }
}

impl Transport for LocalNetwork {
    fn listen(
        &self,
        owner: &NodeId,
        address: &ServiceAddress,
        handler: Arc<dyn RequestHandler>,
    ) -> Result<Listener, CommError> {
        let mut state = self.state.lock().expect("network lock");

        if state.down.contains(owner) {
            return Err(CommError::unreachable(owner, "node is down"));
        }

        let bound = if address.port == 0 {
            let port = state
                .allocate_port(&address.host)
                .ok_or_else(|| CommError::AddressInUse {
                    address: address.to_string(),
                })?;
            ServiceAddress::new(address.host.clone(), port)
        } else {
            address.clone()
        };

        if state.in_use(&bound) {
            return Err(CommError::AddressInUse {
                address: bound.to_string(),
            });
        }

        state.next_binding += 1;
        let id = state.next_binding;
        state.bindings.insert(
            bound.clone(),
            Binding {
                id,
                owner: owner.clone(),
                handler,
            },
        );
        debug!(%owner, address = %bound, "listener bound");

        let shared = Arc::clone(&self.state);
        let closing = bound.clone();
        let closer = Box::new(move || {
            let mut state = shared.lock().expect("network lock");
            if state.bindings.get(&closing).map(|b| b.id) == Some(id) {
                state.bindings.remove(&closing);
            }
        });

        Ok(Listener::new(bound, closer))
    }

    fn connect(&self, from: &NodeId, address: &ServiceAddress) -> Result<Arc<dyn Connection>, CommError> {
        let state = self.state.lock().expect("network lock");

        if state.down.contains(from) {
            return Err(CommError::unreachable(address, "local node is down"));
        }

        let binding = state
            .bindings
            .get(address)
            .ok_or_else(|| CommError::unreachable(address, "connection refused"))?;

        Ok(Arc::new(LocalConnection {
            from: from.clone(),
            peer: address.clone(),
            binding_id: binding.id,
            state: Arc::clone(&self.state),
        }))
    }
}

struct LocalConnection {
    from: NodeId,
    peer: ServiceAddress,
    binding_id: u64,
    state: Arc<Mutex<NetworkState>>,
}

impl LocalConnection {
    /// Handler for this connection if both ends are still alive.
    fn live_handler(&self) -> Option<Arc<dyn RequestHandler>> {
        let state = self.state.lock().expect("network lock");
        if state.down.contains(&self.from) {
            return None;
        }
        state
            .bindings
            .get(&self.peer)
            .filter(|b| b.id == self.binding_id && !state.down.contains(&b.owner))
            .map(|b| Arc::clone(&b.handler))
    }
}

impl Connection for LocalConnection {
    fn peer(&self) -> &ServiceAddress {
        &self.peer
    }

    fn request(&self, request: &ClusterRequest) -> Result<ClusterResponse, CommError> {
        let handler = self
            .live_handler()
            .ok_or_else(|| CommError::disconnected(&self.peer))?;

        let request: ClusterRequest = reencode(request)?;
        let response = handler.handle(&self.from, request);

        // The peer may have died while the handler was blocked.
        if self.live_handler().is_none() {
            return Err(CommError::disconnected(&self.peer));
        }

        reencode(&response)
    }
}

/// Push a value through its JSON encoding.
fn reencode<T: Serialize + DeserializeOwned>(value: &T) -> Result<T, CommError> {
    let bytes = serde_json::to_vec(value).map_err(|e| CommError::Codec(e.to_string()))?;
    serde_json::from_slice(&bytes).map_err(|e| CommError::Codec(e.to_string()))
}
