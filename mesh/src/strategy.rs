//! Join strategies: how a node's local configuration is reconciled with the
//! mesh configuration when it is admitted.

use serde::{Deserialize, Serialize};

use crate::types::MeshSettings;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinStrategy {
    /// The node adopts the mesh configuration.
    #[default]
    Inherit,
    /// Union of both; the mesh wins on conflicting keys.
    Merge,
    /// The mesh adopts the node configuration.
    Overwrite,
}

/// Configuration on both sides after a strategy has been applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub node_settings: MeshSettings,
    pub mesh_settings: MeshSettings,
}

impl Resolution {
    pub fn mesh_changed(&self, before: &MeshSettings) -> bool {
        &self.mesh_settings != before
    }
}

impl JoinStrategy {
    pub fn resolve(self, node: &MeshSettings, mesh: &MeshSettings) -> Resolution {
        match self {
            JoinStrategy::Inherit => inherit(mesh),
            JoinStrategy::Merge => merge(node, mesh),
            JoinStrategy::Overwrite => overwrite(node),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JoinStrategy::Inherit => "inherit",
            JoinStrategy::Merge => "merge",
            JoinStrategy::Overwrite => "overwrite",
        }
    }
}

impl std::str::FromStr for JoinStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "inherit" => Ok(JoinStrategy::Inherit),
            "merge" => Ok(JoinStrategy::Merge),
            "overwrite" => Ok(JoinStrategy::Overwrite),
            other => Err(format!("unknown join strategy '{other}'")),
        }
    }
}

fn inherit(mesh: &MeshSettings) -> Resolution {
    Resolution {
        node_settings: mesh.clone(),
        mesh_settings: mesh.clone(),
    }
}

fn merge(node: &MeshSettings, mesh: &MeshSettings) -> Resolution {
    let mut merged = node.clone();
    merged
        .0
        .extend(mesh.0.iter().map(|(k, v)| (k.clone(), v.clone())));
    Resolution {
        node_settings: merged.clone(),
        mesh_settings: merged,
    }
}

fn overwrite(node: &MeshSettings) -> Resolution {
    Resolution {
        node_settings: node.clone(),
        mesh_settings: node.clone(),
    }
}
