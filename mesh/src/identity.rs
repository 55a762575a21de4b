//! Node Identity Store
//!
//! Owns the stable identity of the local node (id, naming, address, signing
//! key), its lifecycle position and its local configuration. The lifecycle
//! position is a [`NodeState`], which cannot represent a clean node attached
//! to a mesh nor a member without one.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::{
    config::MeshNodeConfig,
    error::{MeshError, MeshResult},
    types::{MeshId, MeshSettings, NodeDescriptor, NodeId, NodeStatus, PublicKey},
};

const JOIN_PROOF_DOMAIN: &[u8] = b"meshd/join/v1";
const INVITE_PROOF_DOMAIN: &[u8] = b"meshd/invite/v1";
const HELLO_PROOF_DOMAIN: &[u8] = b"meshd/hello/v1";
const RESET_PROOF_DOMAIN: &[u8] = b"meshd/reset/v1";

/// Lifecycle position of the local node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeState {
    status: NodeStatus,
    mesh_id: Option<MeshId>,
}

impl NodeState {
    pub fn clean() -> Self {
        Self {
            status: NodeStatus::Clean,
            mesh_id: None,
        }
    }

    /// A state attached to `mesh_id`. Passing [`NodeStatus::Clean`] yields the
    /// clean state and discards the mesh.
    pub fn member(status: NodeStatus, mesh_id: MeshId) -> Self {
        match status {
            NodeStatus::Clean => Self::clean(),
            _ => Self {
                status,
                mesh_id: Some(mesh_id),
            },
        }
    }

    pub fn status(&self) -> NodeStatus {
        self.status
    }

    pub fn mesh_id(&self) -> Option<MeshId> {
        self.mesh_id
    }

    /// Same mesh, different status.
    pub fn with_status(self, status: NodeStatus) -> Self {
        match self.mesh_id {
            Some(mesh_id) => Self::member(status, mesh_id),
            None => Self::clean(),
        }
    }

    /// Re-establish the invariant on loaded data and drop transient states.
    fn normalized(self) -> Self {
        match (self.status, self.mesh_id) {
            (NodeStatus::Clean, _) | (_, None) => Self::clean(),
            (NodeStatus::Joining, _) => Self::clean(),
            (NodeStatus::Leaving, Some(mesh_id)) => Self::member(NodeStatus::Active, mesh_id),
            (status, Some(mesh_id)) => Self::member(status, mesh_id),
        }
    }
}

/// On-disk form of the identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityRecord {
    pub node_id: NodeId,
    pub node_name: String,
    pub description: String,
    pub platform: String,
    pub version: String,
    pub ip_address: String,
    pub port: u16,
    pub region: Option<String>,
    pub secret_key: String,
}

#[derive(Debug)]
pub struct IdentityStore {
    descriptor: RwLock<NodeDescriptor>,
    signing_key: SigningKey,
    state: RwLock<NodeState>,
    settings: RwLock<MeshSettings>,
}

impl IdentityStore {
    /// Fresh identity with a random node id and keypair.
    pub fn generate(config: &MeshNodeConfig) -> MeshResult<Self> {
        let secret: [u8; 32] = rand::random();
        let signing_key = SigningKey::from_bytes(&secret);
        let (ip_address, port) = split_host_port(advertised(config))?;
        let descriptor = NodeDescriptor {
            node_id: NodeId::random(),
            node_name: config.node_name.clone(),
            description: config.description.clone(),
            platform: default_platform(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            ip_address,
            port,
            region: config.region.clone(),
            public_key: PublicKey(signing_key.verifying_key().to_bytes()),
        };
        Ok(Self {
            descriptor: RwLock::new(descriptor),
            signing_key,
            state: RwLock::new(NodeState::clean()),
            settings: RwLock::new(config.settings.clone()),
        })
    }

    /// Restore a persisted identity. Naming and addressing follow the current
    /// configuration; id and keys are kept.
    pub fn restore(
        record: IdentityRecord,
        state: NodeState,
        settings: MeshSettings,
        config: &MeshNodeConfig,
    ) -> MeshResult<Self> {
        let secret = STANDARD
            .decode(record.secret_key.as_bytes())
            .map_err(|e| MeshError::Internal(format!("corrupt identity key: {e}")))?;
        let secret: [u8; 32] = secret
            .try_into()
            .map_err(|_| MeshError::Internal("identity key must be 32 bytes".to_string()))?;
        let signing_key = SigningKey::from_bytes(&secret);
        let (ip_address, port) = split_host_port(advertised(config))?;
        let descriptor = NodeDescriptor {
            node_id: record.node_id,
            node_name: config.node_name.clone(),
            description: config.description.clone(),
            platform: record.platform,
            version: env!("CARGO_PKG_VERSION").to_string(),
            ip_address,
            port,
            region: config.region.clone(),
            public_key: PublicKey(signing_key.verifying_key().to_bytes()),
        };
        Ok(Self {
            descriptor: RwLock::new(descriptor),
            signing_key,
            state: RwLock::new(state.normalized()),
            settings: RwLock::new(settings),
        })
    }

    pub fn record(&self) -> IdentityRecord {
        let d = self.descriptor.read();
        IdentityRecord {
            node_id: d.node_id,
            node_name: d.node_name.clone(),
            description: d.description.clone(),
            platform: d.platform.clone(),
            version: d.version.clone(),
            ip_address: d.ip_address.clone(),
            port: d.port,
            region: d.region.clone(),
            secret_key: STANDARD.encode(self.signing_key.to_bytes()),
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.descriptor.read().node_id
    }

    pub fn descriptor(&self) -> NodeDescriptor {
        self.descriptor.read().clone()
    }

    pub fn set_address(&self, ip_address: String, port: u16) {
        let mut d = self.descriptor.write();
        d.ip_address = ip_address;
        d.port = port;
    }

    pub fn state(&self) -> NodeState {
        *self.state.read()
    }

    pub fn status(&self) -> NodeStatus {
        self.state.read().status
    }

    pub fn mesh_id(&self) -> Option<MeshId> {
        self.state.read().mesh_id
    }

    pub fn set_state(&self, state: NodeState) -> NodeState {
        std::mem::replace(&mut *self.state.write(), state)
    }

    /// Change status only if the current one matches `from`.
    pub fn transition(&self, from: NodeStatus, to: NodeStatus) -> bool {
        let mut state = self.state.write();
        if state.status != from {
            return false;
        }
        *state = state.with_status(to);
        true
    }

    pub fn settings(&self) -> MeshSettings {
        self.settings.read().clone()
    }

    pub fn set_settings(&self, settings: MeshSettings) {
        *self.settings.write() = settings;
    }

    pub fn sign(&self, message: &[u8]) -> String {
        STANDARD.encode(self.signing_key.sign(message).to_bytes())
    }
}

/// Check `signature` (base64) over `message` against `public_key`.
pub fn verify_signature(public_key: &PublicKey, message: &[u8], signature: &str) -> MeshResult<()> {
    let key = VerifyingKey::from_bytes(&public_key.0)
        .map_err(|_| MeshError::PermissionDenied("malformed public key".to_string()))?;
    let raw = STANDARD
        .decode(signature.as_bytes())
        .map_err(|_| MeshError::PermissionDenied("malformed signature".to_string()))?;
    let signature = Signature::from_slice(&raw)
        .map_err(|_| MeshError::PermissionDenied("malformed signature".to_string()))?;
    key.verify(message, &signature)
        .map_err(|_| MeshError::PermissionDenied("signature verification failed".to_string()))
}

/// Bytes a joiner signs to prove it owns the key in its descriptor.
pub fn join_proof(mesh_id: MeshId, challenge: &[u8], node_id: NodeId) -> Vec<u8> {
    proof(JOIN_PROOF_DOMAIN, mesh_id, challenge, node_id)
}

/// Bytes an invited node signs when accepting an invitation.
pub fn invite_proof(mesh_id: MeshId, nonce: &[u8], node_id: NodeId) -> Vec<u8> {
    proof(INVITE_PROOF_DOMAIN, mesh_id, nonce, node_id)
}

/// Bytes each side of a `Hello` exchange signs over the other side's
/// challenge. A node outside any mesh signs with an all-zero mesh id.
pub fn hello_proof(mesh_id: Option<MeshId>, challenge: &[u8], node_id: NodeId) -> Vec<u8> {
    let mesh = mesh_id.map(|m| *m.as_bytes()).unwrap_or_default();
    proof_bytes(HELLO_PROOF_DOMAIN, &mesh, challenge, node_id)
}

/// Bytes an evicting member signs to order `target` back to clean.
pub fn reset_proof(mesh_id: MeshId, nonce: &[u8], target: NodeId) -> Vec<u8> {
    proof(RESET_PROOF_DOMAIN, mesh_id, nonce, target)
}

fn proof(domain: &[u8], mesh_id: MeshId, nonce: &[u8], node_id: NodeId) -> Vec<u8> {
    proof_bytes(domain, mesh_id.as_bytes(), nonce, node_id)
}

fn proof_bytes(domain: &[u8], mesh: &[u8; 16], nonce: &[u8], node_id: NodeId) -> Vec<u8> {
    let mut message = Vec::with_capacity(domain.len() + mesh.len() + nonce.len() + 8);
    message.extend_from_slice(domain);
    message.extend_from_slice(mesh);
    message.extend_from_slice(nonce);
    message.extend_from_slice(&node_id.to_le_bytes());
    message
}

/// Fresh random nonce, base64 encoded.
pub fn new_challenge() -> String {
    let nonce: [u8; 32] = rand::random();
    STANDARD.encode(nonce)
}

fn advertised(config: &MeshNodeConfig) -> &str {
    config
        .advertise_addr
        .as_deref()
        .unwrap_or(config.listen_addr.as_str())
}

/// Split `host:port`, accepting bracketed IPv6 hosts.
pub fn split_host_port(addr: &str) -> MeshResult<(String, u16)> {
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| MeshError::InvalidArgument(format!("address '{addr}' has no port")))?;
    let port = port
        .parse::<u16>()
        .map_err(|_| MeshError::InvalidArgument(format!("address '{addr}' has an invalid port")))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(MeshError::InvalidArgument(format!(
            "address '{addr}' has no host"
        )));
    }
    Ok((host.to_string(), port))
}

fn default_platform() -> String {
    format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> IdentityStore {
        IdentityStore::generate(&MeshNodeConfig::new("node-a", "10.0.0.1:7400")).unwrap()
    }

    #[test]
    fn test_state_invariant() {
        let mesh = MeshId::new();
        assert_eq!(NodeState::clean().mesh_id(), None);
        assert_eq!(NodeState::member(NodeStatus::Active, mesh).mesh_id(), Some(mesh));
        let cleaned = NodeState::member(NodeStatus::Clean, mesh);
        assert_eq!(cleaned.status(), NodeStatus::Clean);
        assert_eq!(cleaned.mesh_id(), None);
        assert_eq!(
            NodeState::clean().with_status(NodeStatus::Active),
            NodeState::clean()
        );
    }

    #[test]
    fn test_transient_states_normalize_on_restore() {
        let mesh = MeshId::new();
        assert_eq!(
            NodeState::member(NodeStatus::Joining, mesh).normalized(),
            NodeState::clean()
        );
        assert_eq!(
            NodeState::member(NodeStatus::Leaving, mesh)
                .normalized()
                .status(),
            NodeStatus::Active
        );
    }

    #[test]
    fn test_sign_and_verify() {
        let identity = store();
        let mesh = MeshId::new();
        let message = join_proof(mesh, b"nonce", identity.node_id());
        let signature = identity.sign(&message);
        let key = identity.descriptor().public_key;
        assert!(verify_signature(&key, &message, &signature).is_ok());

        let tampered = join_proof(mesh, b"other", identity.node_id());
        assert!(matches!(
            verify_signature(&key, &tampered, &signature),
            Err(MeshError::PermissionDenied(_))
        ));
    }

    #[test]
    fn test_proofs_do_not_cross_purposes() {
        let identity = store();
        let key = identity.descriptor().public_key;
        let mesh = MeshId::new();
        let target = NodeId(7);
        let reset = identity.sign(&reset_proof(mesh, b"n", target));
        assert!(verify_signature(&key, &reset_proof(mesh, b"n", target), &reset).is_ok());
        assert!(verify_signature(&key, &join_proof(mesh, b"n", target), &reset).is_err());
        assert!(verify_signature(&key, &reset_proof(mesh, b"n", NodeId(8)), &reset).is_err());

        let hello = identity.sign(&hello_proof(Some(mesh), b"c", identity.node_id()));
        assert!(verify_signature(&key, &hello_proof(None, b"c", identity.node_id()), &hello).is_err());
    }

    #[test]
    fn test_record_restores_same_identity() {
        let identity = store();
        let config = MeshNodeConfig::new("renamed", "10.0.0.2:7500");
        let restored = IdentityStore::restore(
            identity.record(),
            NodeState::clean(),
            MeshSettings::default(),
            &config,
        )
        .unwrap();
        assert_eq!(restored.node_id(), identity.node_id());
        assert_eq!(
            restored.descriptor().public_key,
            identity.descriptor().public_key
        );
        assert_eq!(restored.descriptor().node_name, "renamed");
        assert_eq!(restored.descriptor().port, 7500);
    }

    #[test]
    fn test_transition_requires_expected_status() {
        let identity = store();
        identity.set_state(NodeState::member(NodeStatus::Active, MeshId::new()));
        assert!(!identity.transition(NodeStatus::Offline, NodeStatus::Active));
        assert!(identity.transition(NodeStatus::Active, NodeStatus::Offline));
        assert_eq!(identity.status(), NodeStatus::Offline);
    }

    #[test]
    fn test_split_host_port() {
        assert_eq!(
            split_host_port("10.0.0.1:80").unwrap(),
            ("10.0.0.1".to_string(), 80)
        );
        assert_eq!(split_host_port("[::1]:9").unwrap(), ("::1".to_string(), 9));
        assert!(split_host_port("nohost").is_err());
        assert!(split_host_port(":80").is_err());
        assert!(split_host_port("h:99999").is_err());
    }
}
