//! Core identifiers and records shared by every mesh component.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub u64);

impl NodeId {
    pub fn random() -> Self {
        // Zero is reserved so a default-initialized id is never mistaken for a real node.
        NodeId(rand::random::<u64>().max(1))
    }

    pub fn to_le_bytes(self) -> [u8; 8] {
        self.0.to_le_bytes()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for NodeId {
    fn from(value: u64) -> Self {
        NodeId(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MeshId(pub Uuid);

impl MeshId {
    pub fn new() -> Self {
        MeshId(Uuid::new_v4())
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl Default for MeshId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MeshId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle position of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Clean,
    Joining,
    Active,
    Leaving,
    Offline,
}

impl NodeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            NodeStatus::Clean => "clean",
            NodeStatus::Joining => "joining",
            NodeStatus::Active => "active",
            NodeStatus::Leaving => "leaving",
            NodeStatus::Offline => "offline",
        }
    }

    /// Whether the node currently belongs to a mesh.
    pub fn is_member(self) -> bool {
        matches!(self, NodeStatus::Active | NodeStatus::Offline)
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mesh-level lifecycle, derived from the roster on every commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeshStatus {
    Unseeded,
    Seeded,
    Growing,
    Active,
}

/// Key/value configuration that join strategies reconcile.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MeshSettings(pub BTreeMap<String, String>);

impl MeshSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.0.insert(key.into(), value.into())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for MeshSettings {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        MeshSettings(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// Ed25519 verifying key bytes, serialized as base64.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey(pub [u8; 32]);

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let encoded = STANDARD.encode(self.0);
        write!(f, "PublicKey({}..)", &encoded[..8])
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&STANDARD.encode(self.0))
    }
}

impl Serialize for PublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(self.0))
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        let bytes = STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)?;
        let key: [u8; 32] = bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("public key must be 32 bytes"))?;
        Ok(PublicKey(key))
    }
}

/// Public view of a node's identity, as carried in rosters and handshakes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDescriptor {
    pub node_id: NodeId,
    pub node_name: String,
    pub description: String,
    pub platform: String,
    pub version: String,
    pub ip_address: String,
    pub port: u16,
    pub region: Option<String>,
    pub public_key: PublicKey,
}

impl NodeDescriptor {
    pub fn address(&self) -> String {
        format!("{}:{}", self.ip_address, self.port)
    }
}

/// One roster entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberRecord {
    pub descriptor: NodeDescriptor,
    pub status: NodeStatus,
    /// Peers this member holds a live connection to.
    #[serde(default)]
    pub links: BTreeSet<NodeId>,
    pub version: u64,
    pub joined_at: DateTime<Utc>,
}

impl MemberRecord {
    pub fn node_id(&self) -> NodeId {
        self.descriptor.node_id
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeshRecord {
    pub mesh_id: MeshId,
    pub mesh_name: String,
    pub mesh_description: String,
    pub allow_join: bool,
    #[serde(default)]
    pub join_key: Option<String>,
    #[serde(default)]
    pub policy_version: u64,
    #[serde(default)]
    pub settings: MeshSettings,
    #[serde(default)]
    pub settings_version: u64,
    pub node_count: usize,
    pub connection_count: usize,
    pub status: MeshStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MeshRecord {
    /// Projection safe to hand to callers: the join key is replaced by a flag.
    pub fn view(&self) -> MeshView {
        MeshView {
            mesh_id: self.mesh_id,
            mesh_name: self.mesh_name.clone(),
            mesh_description: self.mesh_description.clone(),
            allow_join: self.allow_join,
            has_join_key: self.join_key.is_some(),
            settings: self.settings.clone(),
            node_count: self.node_count,
            connection_count: self.connection_count,
            status: self.status,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeshView {
    pub mesh_id: MeshId,
    pub mesh_name: String,
    pub mesh_description: String,
    pub allow_join: bool,
    pub has_join_key: bool,
    pub settings: MeshSettings,
    pub node_count: usize,
    pub connection_count: usize,
    pub status: MeshStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
