//! Domain types shared by every lockstep crate.
//!
//! All types that cross the wire are plain serde structs; nothing here
//! depends on the transport or on any locking.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};

/// Unique identifier for a node in the cluster.
pub type NodeId = String;

/// Outcome of a protocol call as seen by the application layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommResult {
    Ok,
    InternalError,
    NotAllowed,
}

impl CommResult {
    pub fn is_ok(self) -> bool {
        self == CommResult::Ok
    }
}

/// Thread a protocol call originates from.
///
/// Cluster-sync calls belong to the game thread and render-sync calls to
/// the rendering thread. The token is passed explicitly with every call
/// instead of being derived from the current OS thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ThreadRole {
    Game,
    Rendering,
    Any,
}

/// Role a node currently plays in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeRole {
    Primary,
    Secondary,
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeRole::Primary => f.write_str("primary"),
            NodeRole::Secondary => f.write_str("secondary"),
        }
    }
}

/// Static identity of a cluster node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterNode {
    pub id: NodeId,
    pub host: String,
}

// ── Failover settings ──────────────────────────────────────────────

/// Runtime failover policy.
///
/// Populated once from configuration. At runtime nodes are only ever
/// removed (when they fail or get dropped), never added.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FailoverSettings {
    pub enabled: bool,
    /// Nodes whose failure is fatal for the whole cluster.
    pub critical_nodes: BTreeSet<NodeId>,
    /// Promotion candidates, highest priority first.
    pub backup_candidates: Vec<NodeId>,
    /// Whether the backup list was configured at all. An unconfigured
    /// list lets any surviving node be promoted.
    pub backups_configured: bool,
}

impl FailoverSettings {
    pub fn is_critical(&self, node_id: &str) -> bool {
        self.critical_nodes.contains(node_id)
    }

    /// Remove a failed or dropped node from the candidate list.
    ///
    /// Returns true if the node was a candidate.
    pub fn remove_candidate(&mut self, node_id: &str) -> bool {
        let before = self.backup_candidates.len();
        self.backup_candidates.retain(|n| n != node_id);
        before != self.backup_candidates.len()
    }
}

// ── Frame data ─────────────────────────────────────────────────────

/// A frame number qualified by its frame rate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QualifiedFrameTime {
    pub frame: i64,
    pub sub_frame: f32,
    pub rate_numerator: u32,
    pub rate_denominator: u32,
}

/// Time data replicated from the primary on every frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TimeData {
    pub delta_time: f64,
    pub game_time: f64,
    pub frame_time: Option<QualifiedFrameTime>,
}

/// Tick phase an object snapshot belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SyncGroup {
    PreTick,
    Tick,
    PostTick,
}

impl SyncGroup {
    pub const ALL: [SyncGroup; 3] = [SyncGroup::PreTick, SyncGroup::Tick, SyncGroup::PostTick];

    pub fn as_str(self) -> &'static str {
        match self {
            SyncGroup::PreTick => "pre_tick",
            SyncGroup::Tick => "tick",
            SyncGroup::PostTick => "post_tick",
        }
    }
}

// ── Cluster events ─────────────────────────────────────────────────

/// A JSON cluster event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterEventJson {
    pub category: String,
    pub event_type: String,
    pub name: String,
    pub parameters: HashMap<String, String>,
    pub is_system_event: bool,
    /// A later event with the same category/type/name in the same frame
    /// replaces this one.
    pub should_discard_on_repeat: bool,
}

impl ClusterEventJson {
    pub fn dedup_key(&self) -> String {
        format!("{}/{}/{}", self.category, self.event_type, self.name)
    }
}

/// A binary cluster event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterEventBinary {
    pub event_id: i32,
    pub event_data: Vec<u8>,
    pub is_system_event: bool,
    /// A later event with the same ID in the same frame replaces this one.
    pub should_discard_on_repeat: bool,
}

/// Events released to every node for one frame.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventsData {
    pub json: Vec<ClusterEventJson>,
    pub binary: Vec<ClusterEventBinary>,
}

impl EventsData {
    pub fn is_empty(&self) -> bool {
        self.json.is_empty() && self.binary.is_empty()
    }
}

// ── Services and addressing ────────────────────────────────────────

/// Logical services a node can host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ServiceKind {
    ClusterSync,
    RenderSync,
    GenericBarrier,
    InternalComm,
    EventsJson,
    EventsBinary,
}

impl ServiceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ServiceKind::ClusterSync => "cluster_sync",
            ServiceKind::RenderSync => "render_sync",
            ServiceKind::GenericBarrier => "generic_barrier",
            ServiceKind::InternalComm => "internal_comm",
            ServiceKind::EventsJson => "events_json",
            ServiceKind::EventsBinary => "events_binary",
        }
    }
}

/// Host and port a service listens on. Port 0 asks the transport for a
/// dynamically assigned port.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceAddress {
    pub host: String,
    pub port: u16,
}

impl ServiceAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for ServiceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Where one node's dynamically bound services live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeHostingInfo {
    pub node_id: NodeId,
    pub host: String,
    pub cluster_sync_port: u16,
    pub render_sync_port: u16,
    pub generic_barrier_port: u16,
}

impl NodeHostingInfo {
    /// Address of a dynamically bound service, if the service is one of them.
    pub fn address(&self, service: ServiceKind) -> Option<ServiceAddress> {
        let port = match service {
            ServiceKind::ClusterSync => self.cluster_sync_port,
            ServiceKind::RenderSync => self.render_sync_port,
            ServiceKind::GenericBarrier => self.generic_barrier_port,
            _ => return None,
        };
        Some(ServiceAddress::new(self.host.clone(), port))
    }
}

/// Cluster-wide hosting information gathered by the primary at startup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterHostingInfo {
    pub nodes: BTreeMap<NodeId, NodeHostingInfo>,
}

impl ClusterHostingInfo {
    pub fn address(&self, node_id: &str, service: ServiceKind) -> Option<ServiceAddress> {
        self.nodes.get(node_id).and_then(|n| n.address(service))
    }
}

/// Why a node is being removed from the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeDropReason {
    /// The node stopped responding to requests.
    Failed,
    /// The node missed a barrier deadline.
    BarrierTimeout,
    /// The node was the primary and a new one has been elected.
    PrimaryFailed,
}

// ── Recovery ───────────────────────────────────────────────────────

/// A cached GET result tagged with the generation it belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedEntry {
    pub generation: u64,
    pub data: Vec<u8>,
}

/// What a node has already seen, exchanged with a newly elected primary.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryState {
    pub node_id: NodeId,
    /// Barrier key → last generation this node saw released.
    pub sync_progress: BTreeMap<String, u64>,
    /// GET transaction name → cached result.
    pub cache: BTreeMap<String, CachedEntry>,
}

impl RecoveryState {
    pub fn new(node_id: impl Into<NodeId>) -> Self {
        Self {
            node_id: node_id.into(),
            ..Default::default()
        }
    }

    /// Fold another node's state into this one: the furthest generation
    /// per barrier and the newest cache entry per name win.
    pub fn merge(&mut self, other: &RecoveryState) {
        for (key, &generation) in &other.sync_progress {
            let slot = self.sync_progress.entry(key.clone()).or_insert(0);
            *slot = (*slot).max(generation);
        }

        for (name, entry) in &other.cache {
            match self.cache.get(name) {
                Some(existing) if existing.generation >= entry.generation => {}
                _ => {
                    self.cache.insert(name.clone(), entry.clone());
                }
            }
        }
    }
}
