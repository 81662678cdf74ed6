//! lockstep-node — per-process owner of every server and client of a
//! cluster node.
//!
//! # Architecture
//!
//! ```text
//! ClusterNodeController
//!   ├── servers (every node, so any node can be promoted)
//!   │   ├── ClusterSync    (dynamic port) — frame barriers, frame data, event intake
//!   │   ├── RenderSync     (dynamic port) — render-present barrier
//!   │   ├── GenericBarrier (dynamic port) — application barriers
//!   │   └── InternalComm   (well-known port) — hosting info, recovery, node drop
//!   ├── external servers (primary only, fixed ports)
//!   │   └── EventsJson / EventsBinary — retried in the background after promotion
//!   └── clients
//!       ├── ConnectionSet per service → every other node
//!       └── BarrierClientPool → one client set per barrier consumer
//! ```
//!
//! Startup: every node binds its services, then calls
//! `GatherServicesHostingInfo` on the configured primary. The primary
//! answers once every configured node has called, which tells each node
//! where every other node's dynamic ports are. Nodes then connect to all
//! their peers.
//!
//! The controller never decides on failures itself. Peer reports and
//! barrier timeouts are forwarded to the registered `NodeEvents` sink.

pub mod controller;
pub mod data;
pub mod error;
pub mod events;
pub mod internal;
pub mod ops;
pub mod sync;

pub use controller::ClusterNodeController;
pub use data::{ClusterDataSource, FrameSnapshot, NullDataSource};
pub use error::{NodeError, NodeResult};
pub use events::EventQueue;
pub use internal::{InternalCommHandler, NodeEvents, NodeEventsSlot};
pub use ops::ClusterOps;
pub use sync::{ClusterSyncHandler, ClusterSyncService, ExternalEventsHandler, RenderSyncHandler};
