//! Mesh membership and connection management
//!
//! This crate provides the node side of a managed mesh:
//! - Mesh lifecycle: seed, join through a sponsor, extend by invitation,
//!   leave, evict
//! - A replicated directory of members with Lamport-versioned deltas
//! - Point-to-point connections with keepalive, liveness and drain support
//! - A topology ledger of declared routes between members
//! - Persistence and restart recovery

pub mod api;
pub mod clock;
pub mod config;
pub mod connection;
mod controller;
pub mod directory;
pub mod error;
pub mod flow_control;
pub mod identity;
mod membership;
pub mod metrics;
mod node;
mod service;
pub mod session;
pub mod stores;
pub mod strategy;
pub mod sync;
pub mod topology;
pub mod transport;
pub mod types;
pub mod wire;

#[cfg(test)]
mod tests;

// Re-export commonly used types
pub use api::*;
pub use config::{MeshNodeConfig, ReconnectConfig};
pub use connection::{Connection, ConnectionEvent, ConnectionStatus, Direction};
pub use error::{ErrorCode, MeshError, MeshResult, OpStatus};
pub use node::MeshNode;
pub use strategy::JoinStrategy;
pub use sync::{SyncHandle, SyncState};
pub use topology::{Route, RouteSpec, RouteUpdate};
pub use transport::{MemoryNetwork, MemoryTransport, TcpTransport, Transport};
pub use types::{
    MemberRecord, MeshId, MeshSettings, MeshStatus, MeshView, NodeDescriptor, NodeId, NodeStatus,
};
