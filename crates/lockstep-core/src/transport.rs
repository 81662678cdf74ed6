//! Transport interface and per-service connection sets.
//!
//! The socket layer is not part of lockstep. Everything above it talks
//! to a `Transport`: servers bind a `RequestHandler` to an address and
//! clients obtain a `Connection` to an address. A `ConnectionSet` keeps
//! one lazily established connection per node for one logical service
//! and drops a connection as soon as a request on it fails.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::CommError;
use crate::protocol::{ClusterRequest, ClusterResponse};
use crate::types::{NodeId, ServiceAddress, ServiceKind};

/// Server side of a service: answers requests from other nodes.
pub trait RequestHandler: Send + Sync {
    fn handle(&self, from: &NodeId, request: ClusterRequest) -> ClusterResponse;

    /// Called when the transport tears the listener down underneath the
    /// handler (process shutdown, simulated crash). Must be idempotent.
    fn shutdown(&self) {}
}

/// Client side of a connection to one service address.
///
/// Requests may be issued concurrently from several threads; the
/// transport is responsible for multiplexing them.
pub trait Connection: Send + Sync {
    fn peer(&self) -> &ServiceAddress;

    fn request(&self, request: &ClusterRequest) -> Result<ClusterResponse, CommError>;
}

/// Abstract request/response channel keyed by service address.
pub trait Transport: Send + Sync {
    /// Bind `handler` to `address`. Port 0 binds a dynamically assigned
    /// port, reported by the returned `Listener`.
    fn listen(
        &self,
        owner: &NodeId,
        address: &ServiceAddress,
        handler: Arc<dyn RequestHandler>,
    ) -> Result<Listener, CommError>;

    fn connect(&self, from: &NodeId, address: &ServiceAddress) -> Result<Arc<dyn Connection>, CommError>;
}

/// A bound server. Dropping it stops accepting requests.
pub struct Listener {
    address: ServiceAddress,
    closer: Option<Box<dyn FnOnce() + Send>>,
}

impl Listener {
    pub fn new(address: ServiceAddress, closer: Box<dyn FnOnce() + Send>) -> Self {
        Self {
            address,
            closer: Some(closer),
        }
    }

    pub fn address(&self) -> &ServiceAddress {
        &self.address
    }

    pub fn close(mut self) {
        if let Some(closer) = self.closer.take() {
            closer();
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Some(closer) = self.closer.take() {
            closer();
        }
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener").field("address", &self.address).finish()
    }
}

/// How hard to try when establishing a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 10,
            delay: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    /// Connect to `address`, retrying up to `attempts` times.
    pub fn connect(
        &self,
        transport: &dyn Transport,
        from: &NodeId,
        address: &ServiceAddress,
    ) -> Result<Arc<dyn Connection>, CommError> {
        let attempts = self.attempts.max(1);
        let mut last_err = None;

        for attempt in 1..=attempts {
            match transport.connect(from, address) {
                Ok(conn) => {
                    debug!(%from, %address, attempt, "connected");
                    return Ok(conn);
                }
                Err(e) => {
                    debug!(%from, %address, attempt, error = %e, "connect attempt failed");
                    last_err = Some(e);
                    if attempt < attempts {
                        std::thread::sleep(self.delay);
                    }
                }
            }
        }

        let err = last_err.unwrap_or_else(|| CommError::unreachable(address, "no attempts made"));
        warn!(%from, %address, attempts, error = %err, "giving up on connection");
        Err(err)
    }
}

/// One lazily connected client per node for a single logical service.
pub struct ConnectionSet {
    service: ServiceKind,
    local: NodeId,
    transport: Arc<dyn Transport>,
    retry: RetryPolicy,
    addresses: RwLock<BTreeMap<NodeId, ServiceAddress>>,
    connections: Mutex<HashMap<NodeId, Arc<dyn Connection>>>,
}

impl ConnectionSet {
    pub fn new(
        service: ServiceKind,
        local: NodeId,
        transport: Arc<dyn Transport>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            service,
            local,
            transport,
            retry,
            addresses: RwLock::new(BTreeMap::new()),
            connections: Mutex::new(HashMap::new()),
        }
    }

    pub fn service(&self) -> ServiceKind {
        self.service
    }

    pub fn set_address(&self, node_id: &str, address: ServiceAddress) {
        let mut addresses = self.addresses.write().expect("addresses lock");
        addresses.insert(node_id.to_string(), address);
    }

    /// Nodes this set knows how to reach.
    pub fn nodes(&self) -> Vec<NodeId> {
        let addresses = self.addresses.read().expect("addresses lock");
        addresses.keys().cloned().collect()
    }

    /// Send a request to `target`, connecting first if needed.
    ///
    /// A failed request drops the cached connection so the next call
    /// reconnects.
    pub fn request(&self, target: &str, request: &ClusterRequest) -> Result<ClusterResponse, CommError> {
        let conn = self.connection(target)?;
        match conn.request(request) {
            Ok(response) => Ok(response),
            Err(e) => {
                debug!(
                    service = self.service.as_str(),
                    %target,
                    op = request.name(),
                    error = %e,
                    "request failed, dropping connection"
                );
                self.disconnect(target);
                Err(e)
            }
        }
    }

    /// Eagerly connect to every known node.
    pub fn connect_all(&self) -> Result<(), CommError> {
        for node_id in self.nodes() {
            self.connection(&node_id)?;
        }
        Ok(())
    }

    pub fn is_connected(&self, node_id: &str) -> bool {
        let connections = self.connections.lock().expect("connections lock");
        connections.contains_key(node_id)
    }

    pub fn disconnect(&self, node_id: &str) {
        let mut connections = self.connections.lock().expect("connections lock");
        connections.remove(node_id);
    }

    /// Drop the connection and the address: the node left the cluster.
    pub fn forget(&self, node_id: &str) {
        self.disconnect(node_id);
        let mut addresses = self.addresses.write().expect("addresses lock");
        addresses.remove(node_id);
    }

    pub fn close_all(&self) {
        let mut connections = self.connections.lock().expect("connections lock");
        connections.clear();
    }

    fn connection(&self, target: &str) -> Result<Arc<dyn Connection>, CommError> {
        {
            let connections = self.connections.lock().expect("connections lock");
            if let Some(conn) = connections.get(target) {
                return Ok(Arc::clone(conn));
            }
        }

        let address = {
            let addresses = self.addresses.read().expect("addresses lock");
            addresses
                .get(target)
                .cloned()
                .ok_or_else(|| CommError::UnknownNode(target.to_string()))?
        };

        // Connect without holding the map lock; retries may sleep.
        let conn = self.retry.connect(self.transport.as_ref(), &self.local, &address)?;

        let mut connections = self.connections.lock().expect("connections lock");
        let conn = connections
            .entry(target.to_string())
            .or_insert(conn);
        Ok(Arc::clone(conn))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::LocalNetwork;
    use crate::protocol::ResponsePayload;

    struct Echo;

    impl RequestHandler for Echo {
        fn handle(&self, from: &NodeId, _request: ClusterRequest) -> ClusterResponse {
            ClusterResponse::ok(ResponsePayload::Data(from.as_bytes().to_vec()))
        }
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            attempts: 2,
            delay: Duration::from_millis(1),
        }
    }

    #[test]
    fn request_connects_lazily() {
        let net = LocalNetwork::new();
        let _listener = net
            .listen(&"b".to_string(), &ServiceAddress::new("10.0.0.2", 7000), Arc::new(Echo))
            .unwrap();

        let set = ConnectionSet::new(
            ServiceKind::ClusterSync,
            "a".to_string(),
            Arc::new(net.clone()),
            fast_retry(),
        );
        set.set_address("b", ServiceAddress::new("10.0.0.2", 7000));
        assert!(!set.is_connected("b"));

        let resp = set.request("b", &ClusterRequest::GetTimeData).unwrap();
        assert_eq!(resp.payload, ResponsePayload::Data(b"a".to_vec()));
        assert!(set.is_connected("b"));
    }

    #[test]
    fn unknown_node_is_reported() {
        let net = LocalNetwork::new();
        let set = ConnectionSet::new(
            ServiceKind::ClusterSync,
            "a".to_string(),
            Arc::new(net),
            fast_retry(),
        );
        let err = set.request("ghost", &ClusterRequest::GetTimeData).unwrap_err();
        assert_eq!(err, CommError::UnknownNode("ghost".into()));
    }

    #[test]
    fn failed_request_drops_connection() {
        let net = LocalNetwork::new();
        let _listener = net
            .listen(&"b".to_string(), &ServiceAddress::new("10.0.0.2", 7000), Arc::new(Echo))
            .unwrap();

        let set = ConnectionSet::new(
            ServiceKind::ClusterSync,
            "a".to_string(),
            Arc::new(net.clone()),
            fast_retry(),
        );
        set.set_address("b", ServiceAddress::new("10.0.0.2", 7000));
        set.connect_all().unwrap();
        assert!(set.is_connected("b"));

        net.kill("b");
        assert!(set.request("b", &ClusterRequest::GetTimeData).is_err());
        assert!(!set.is_connected("b"));
    }

    #[test]
    fn retry_gives_up_after_attempts() {
        let net = LocalNetwork::new();
        let policy = fast_retry();
        let result = policy.connect(&net, &"a".to_string(), &ServiceAddress::new("10.0.0.9", 1));
        assert!(matches!(result, Err(CommError::Unreachable { .. })));
    }
}
