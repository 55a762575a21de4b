//! Flat request and result types for every node operation.
//!
//! These are what an outer surface (HTTP gateway, RPC service, CLI) hands to
//! a [`crate::MeshNode`] and gets back. Nothing here depends on a transport;
//! [`Reply`] carries the coarse status a gateway maps onto its own codes.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use http::StatusCode;
use serde::{Deserialize, Serialize};

use crate::{
    error::{MeshError, MeshResult, OpStatus},
    strategy::JoinStrategy,
    sync::{SyncHandle, SyncState},
    topology::{Route, RouteUpdate},
    types::{MeshId, MeshStatus, MeshView, NodeId, NodeStatus},
};

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedMeshRequest {
    pub mesh_name: String,
    #[serde(default)]
    pub mesh_description: String,
    #[serde(default = "default_true")]
    pub allow_join: bool,
    #[serde(default)]
    pub join_key: Option<String>,
}

impl SeedMeshRequest {
    pub fn new(mesh_name: impl Into<String>) -> Self {
        Self {
            mesh_name: mesh_name.into(),
            mesh_description: String::new(),
            allow_join: true,
            join_key: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinMeshRequest {
    pub target_address: String,
    #[serde(default)]
    pub strategy: JoinStrategy,
    /// Overall deadline; the configured join timeout applies when unset.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub join_key: Option<String>,
}

impl JoinMeshRequest {
    pub fn new(target_address: impl Into<String>) -> Self {
        Self {
            target_address: target_address.into(),
            strategy: JoinStrategy::Inherit,
            timeout_ms: None,
            join_key: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtendMeshRequest {
    pub target_address: String,
    #[serde(default)]
    pub strategy: JoinStrategy,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaveMeshRequest {
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvictNodeRequest {
    pub target_node_id: NodeId,
    #[serde(default)]
    pub clean_target: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddConnectionRequest {
    pub target_node_id: NodeId,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DropConnectionRequest {
    pub peer_node_id: NodeId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddMeshRouteRequest {
    pub source_node_id: NodeId,
    pub target_node_id: NodeId,
    #[serde(default)]
    pub bidirectional: bool,
    #[serde(default)]
    pub latency_ms: u32,
    #[serde(default)]
    pub bandwidth_mbps: u64,
    #[serde(default)]
    pub cost: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModifyMeshRouteRequest {
    pub source_node_id: NodeId,
    pub target_node_id: NodeId,
    #[serde(flatten)]
    pub update: RouteUpdate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteMeshRouteRequest {
    pub source_node_id: NodeId,
    pub target_node_id: NodeId,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateMeshPolicyRequest {
    #[serde(default)]
    pub allow_join: Option<bool>,
    /// New join key. Ignored when `clear_join_key` is set.
    #[serde(default)]
    pub join_key: Option<String>,
    #[serde(default)]
    pub clear_join_key: bool,
}

/// One roster entry as shown to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeView {
    pub node_id: NodeId,
    pub node_name: String,
    pub description: String,
    pub platform: String,
    pub version: String,
    pub ip_address: String,
    pub port: u16,
    pub region: Option<String>,
    pub status: NodeStatus,
    pub links: BTreeSet<NodeId>,
    pub is_local: bool,
    /// The local node holds a live connection to this node.
    pub connected: bool,
    pub joined_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeStatusView {
    pub node_id: NodeId,
    pub node_name: String,
    pub status: NodeStatus,
    pub mesh_id: Option<MeshId>,
    pub mesh_status: MeshStatus,
    pub connections: usize,
    pub sync: Option<SyncState>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouteView {
    #[serde(flatten)]
    pub route: Route,
    pub source_name: Option<String>,
    pub source_region: Option<String>,
    pub target_name: Option<String>,
    pub target_region: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TopologyView {
    pub mesh_id: MeshId,
    pub routes: Vec<RouteView>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SeedMeshResult {
    pub node_id: NodeId,
    pub mesh: MeshView,
}

#[derive(Debug, Clone, Serialize)]
pub struct JoinMeshResult {
    pub node_id: NodeId,
    pub sponsor_node_id: NodeId,
    pub strategy: JoinStrategy,
    /// What the sponsor knew at admission. The full roster arrives through
    /// the background sync.
    pub mesh: Option<MeshView>,
    /// Sync state when the join returned.
    pub sync: SyncState,
    #[serde(skip)]
    pub sync_handle: SyncHandle,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExtendMeshResult {
    pub node: NodeView,
    pub strategy: JoinStrategy,
    pub mesh: MeshView,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LeaveMeshResult {
    pub mesh_id: MeshId,
    pub connections_dropped: usize,
    /// The local node was the last member.
    pub mesh_dissolved: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EvictNodeResult {
    pub target_node_id: NodeId,
    pub target_cleaned: bool,
    pub node_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DropConnectionResult {
    pub peer_node_id: NodeId,
    pub dropped: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeleteMeshRouteResult {
    pub source_node_id: NodeId,
    pub target_node_id: NodeId,
}

/// Outcome of one operation in transport-neutral form.
#[derive(Debug, Clone, Serialize)]
pub struct Reply<T> {
    pub status: OpStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<T>,
    #[serde(skip)]
    http: StatusCode,
}

impl<T> Reply<T> {
    /// `created` selects [`OpStatus::Created`] over [`OpStatus::Success`].
    pub fn from_result(result: MeshResult<T>, created: bool) -> Self {
        match result {
            Ok(value) => Self {
                status: if created {
                    OpStatus::Created
                } else {
                    OpStatus::Success
                },
                message: None,
                result: Some(value),
                http: if created {
                    StatusCode::CREATED
                } else {
                    StatusCode::OK
                },
            },
            Err(err) => Self::from_error(&err),
        }
    }

    pub fn from_error(err: &MeshError) -> Self {
        Self {
            status: err.status(),
            message: Some(err.message().to_string()),
            result: None,
            http: err.http_status(),
        }
    }

    pub fn http_status(&self) -> StatusCode {
        self.http
    }
}
