//! Node configuration.

use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

use crate::types::MeshSettings;

/// Configuration of a single mesh node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MeshNodeConfig {
    pub node_name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub region: Option<String>,
    /// Address the listener binds to (`ip:port`).
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Address other nodes should dial; defaults to the bound listen address.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    pub advertise_addr: Option<String>,
    /// Directory for identity, membership and routes. In-memory when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    /// Local configuration reconciled by join strategies.
    #[serde(default)]
    pub settings: MeshSettings,
    /// Accept `ExtendMesh` invitations while clean.
    #[serde(default = "default_true")]
    pub accept_invites: bool,
    #[serde(default = "default_join_timeout_ms")]
    pub join_timeout_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    #[serde(default = "default_leave_grace_ms")]
    pub leave_grace_ms: u64,
    #[serde(default = "default_keepalive_interval_ms")]
    pub keepalive_interval_ms: u64,
    #[serde(default = "default_liveness_timeout_ms")]
    pub liveness_timeout_ms: u64,
    #[serde(default = "default_failed_retention_secs")]
    pub failed_retention_secs: u64,
    #[serde(default = "default_isolation_timeout_ms")]
    pub isolation_timeout_ms: u64,
    #[serde(default = "default_sync_timeout_ms")]
    pub sync_timeout_ms: u64,
    #[serde(default = "default_handler_lock_timeout_ms")]
    pub handler_lock_timeout_ms: u64,
    #[serde(default = "default_controller_interval_ms")]
    pub controller_interval_ms: u64,
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

/// Background reconnection to members that went offline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconnectConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_reconnect_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_reconnect_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_delay_ms: default_reconnect_base_delay_ms(),
            max_delay_ms: default_reconnect_max_delay_ms(),
        }
    }
}

impl ReconnectConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

fn default_true() -> bool {
    true
}

fn default_listen_addr() -> String {
    "0.0.0.0:7400".to_string()
}

fn default_join_timeout_ms() -> u64 {
    30_000
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_handshake_timeout_ms() -> u64 {
    10_000
}

fn default_leave_grace_ms() -> u64 {
    5_000
}

fn default_keepalive_interval_ms() -> u64 {
    2_000
}

fn default_liveness_timeout_ms() -> u64 {
    6_000
}

fn default_failed_retention_secs() -> u64 {
    300
}

fn default_isolation_timeout_ms() -> u64 {
    30_000
}

fn default_sync_timeout_ms() -> u64 {
    15_000
}

fn default_handler_lock_timeout_ms() -> u64 {
    2_000
}

fn default_controller_interval_ms() -> u64 {
    1_000
}

fn default_max_frame_bytes() -> usize {
    16 * 1024 * 1024
}

fn default_reconnect_base_delay_ms() -> u64 {
    500
}

fn default_reconnect_max_delay_ms() -> u64 {
    30_000
}

impl MeshNodeConfig {
    pub fn new(node_name: impl Into<String>, listen_addr: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
            description: String::new(),
            region: None,
            listen_addr: listen_addr.into(),
            advertise_addr: None,
            data_dir: None,
            settings: MeshSettings::default(),
            accept_invites: true,
            join_timeout_ms: default_join_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            leave_grace_ms: default_leave_grace_ms(),
            keepalive_interval_ms: default_keepalive_interval_ms(),
            liveness_timeout_ms: default_liveness_timeout_ms(),
            failed_retention_secs: default_failed_retention_secs(),
            isolation_timeout_ms: default_isolation_timeout_ms(),
            sync_timeout_ms: default_sync_timeout_ms(),
            handler_lock_timeout_ms: default_handler_lock_timeout_ms(),
            controller_interval_ms: default_controller_interval_ms(),
            max_frame_bytes: default_max_frame_bytes(),
            reconnect: ReconnectConfig::default(),
        }
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn leave_grace(&self) -> Duration {
        Duration::from_millis(self.leave_grace_ms)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }

    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_millis(self.liveness_timeout_ms)
    }

    pub fn failed_retention(&self) -> Duration {
        Duration::from_secs(self.failed_retention_secs)
    }

    pub fn isolation_timeout(&self) -> Duration {
        Duration::from_millis(self.isolation_timeout_ms)
    }

    pub fn sync_timeout(&self) -> Duration {
        Duration::from_millis(self.sync_timeout_ms)
    }

    pub fn handler_lock_timeout(&self) -> Duration {
        Duration::from_millis(self.handler_lock_timeout_ms)
    }

    pub fn controller_interval(&self) -> Duration {
        Duration::from_millis(self.controller_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_fill_missing_fields() {
        let config: MeshNodeConfig =
            serde_json::from_str(r#"{"node_name": "node-a"}"#).unwrap();
        assert_eq!(config.listen_addr, "0.0.0.0:7400");
        assert_eq!(config.join_timeout(), Duration::from_secs(30));
        assert!(config.accept_invites);
        assert!(config.reconnect.enabled);
        assert!(config.data_dir.is_none());
        assert_eq!(config, MeshNodeConfig::new("node-a", "0.0.0.0:7400"));
    }

    #[test]
    fn test_reconnect_override() {
        let config: MeshNodeConfig = serde_json::from_str(
            r#"{"node_name": "n", "reconnect": {"enabled": false, "max_delay_ms": 100}}"#,
        )
        .unwrap();
        assert!(!config.reconnect.enabled);
        assert_eq!(config.reconnect.base_delay(), Duration::from_millis(500));
        assert_eq!(config.reconnect.max_delay(), Duration::from_millis(100));
    }
}
