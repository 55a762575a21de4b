//! Daemon configuration: a YAML file overlaid by command-line flags.

use std::path::{Path, PathBuf};

use meshd_mesh::{JoinStrategy, MeshNodeConfig};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::logging::{LogConfig, LogFormat};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// What the daemon does once the node is up.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "action")]
pub enum StartupAction {
    /// Resume whatever membership was persisted.
    #[default]
    Resume,
    Seed {
        mesh_name: String,
        #[serde(default)]
        join_key: Option<String>,
    },
    Join {
        target_address: String,
        #[serde(default)]
        strategy: JoinStrategy,
        #[serde(default)]
        join_key: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DaemonConfig {
    pub node: MeshNodeConfig,
    #[serde(default)]
    pub logging: LogConfig,
    /// Serve Prometheus metrics on this address when set.
    #[serde(default)]
    pub metrics_addr: Option<String>,
    #[serde(default)]
    pub startup: StartupAction,
    /// Leave the mesh (forcefully) on shutdown instead of keeping membership.
    #[serde(default)]
    pub leave_on_shutdown: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            node: MeshNodeConfig::new(default_node_name(), "0.0.0.0:7400"),
            logging: LogConfig::default(),
            metrics_addr: None,
            startup: StartupAction::Resume,
            leave_on_shutdown: false,
        }
    }
}

fn default_node_name() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "meshd".to_string())
}

/// Flag values that take precedence over the file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub name: Option<String>,
    pub listen: Option<String>,
    pub advertise: Option<String>,
    pub region: Option<String>,
    pub data_dir: Option<PathBuf>,
    pub seed: Option<String>,
    pub join: Option<String>,
    pub strategy: Option<JoinStrategy>,
    pub join_key: Option<String>,
    pub log_level: Option<String>,
    pub log_format: Option<LogFormat>,
    pub log_dir: Option<PathBuf>,
    pub metrics_addr: Option<String>,
    pub leave_on_shutdown: bool,
}

impl DaemonConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_yaml(content: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(content)
    }

    /// Start from `path` (or defaults) and apply `overrides`.
    pub fn load(path: Option<&Path>, overrides: Overrides) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply(overrides)?;
        Ok(config)
    }

    pub fn apply(&mut self, o: Overrides) -> Result<(), ConfigError> {
        if let Some(name) = o.name {
            self.node.node_name = name;
        }
        if let Some(listen) = o.listen {
            self.node.listen_addr = listen;
        }
        if o.advertise.is_some() {
            self.node.advertise_addr = o.advertise;
        }
        if o.region.is_some() {
            self.node.region = o.region;
        }
        if o.data_dir.is_some() {
            self.node.data_dir = o.data_dir;
        }
        if let Some(level) = o.log_level {
            self.logging.level = level;
        }
        if let Some(format) = o.log_format {
            self.logging.format = format;
        }
        if o.log_dir.is_some() {
            self.logging.dir = o.log_dir;
        }
        if o.metrics_addr.is_some() {
            self.metrics_addr = o.metrics_addr;
        }
        self.leave_on_shutdown |= o.leave_on_shutdown;

        match (o.seed, o.join) {
            (Some(_), Some(_)) => {
                return Err(ConfigError::Invalid(
                    "--seed and --join are mutually exclusive".to_string(),
                ))
            }
            (Some(mesh_name), None) => {
                self.startup = StartupAction::Seed {
                    mesh_name,
                    join_key: o.join_key,
                };
            }
            (None, Some(target_address)) => {
                self.startup = StartupAction::Join {
                    target_address,
                    strategy: o.strategy.unwrap_or_default(),
                    join_key: o.join_key,
                };
            }
            (None, None) => {}
        }
        self.validate()
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.node.node_name.trim().is_empty() {
            return Err(ConfigError::Invalid("node_name must not be empty".to_string()));
        }
        if self.node.liveness_timeout_ms <= self.node.keepalive_interval_ms {
            return Err(ConfigError::Invalid(
                "liveness_timeout_ms must exceed keepalive_interval_ms".to_string(),
            ));
        }
        if self.node.reconnect.base_delay_ms > self.node.reconnect.max_delay_ms {
            return Err(ConfigError::Invalid(
                "reconnect.base_delay_ms must not exceed reconnect.max_delay_ms".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
node:
  node_name: edge-1
  listen_addr: 10.1.0.5:7400
  region: eu-west
  data_dir: /var/lib/meshd
  settings:
    retention: 7d
  reconnect:
    enabled: false
logging:
  level: debug
  format: json
startup:
  action: join
  target_address: 10.1.0.4:7400
  strategy: merge
"#;

    #[test]
    fn test_yaml_fills_defaults() {
        let config = DaemonConfig::from_yaml(SAMPLE).unwrap();
        assert_eq!(config.node.node_name, "edge-1");
        assert_eq!(config.node.region.as_deref(), Some("eu-west"));
        assert_eq!(config.node.settings.get("retention"), Some("7d"));
        assert!(!config.node.reconnect.enabled);
        assert_eq!(config.node.reconnect.base_delay_ms, 500);
        assert_eq!(config.node.join_timeout_ms, 30_000);
        assert_eq!(config.logging.format, LogFormat::Json);
        assert!(config.logging.ansi_colors);
        assert_eq!(
            config.startup,
            StartupAction::Join {
                target_address: "10.1.0.4:7400".to_string(),
                strategy: JoinStrategy::Merge,
                join_key: None,
            }
        );
    }

    #[test]
    fn test_flags_override_file() {
        let mut config = DaemonConfig::from_yaml(SAMPLE).unwrap();
        config
            .apply(Overrides {
                name: Some("edge-2".to_string()),
                seed: Some("lab".to_string()),
                log_level: Some("warn".to_string()),
                leave_on_shutdown: true,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(config.node.node_name, "edge-2");
        assert_eq!(config.node.listen_addr, "10.1.0.5:7400");
        assert_eq!(config.logging.level, "warn");
        assert!(config.leave_on_shutdown);
        assert!(matches!(config.startup, StartupAction::Seed { ref mesh_name, .. } if mesh_name == "lab"));
    }

    #[test]
    fn test_seed_and_join_conflict() {
        let mut config = DaemonConfig::default();
        let err = config
            .apply(Overrides {
                seed: Some("lab".to_string()),
                join: Some("10.0.0.1:7400".to_string()),
                ..Default::default()
            })
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_missing_file_is_read_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = DaemonConfig::from_file(&dir.path().join("absent.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_inconsistent_timers_are_rejected() {
        let mut config = DaemonConfig::default();
        config.node.liveness_timeout_ms = config.node.keepalive_interval_ms;
        assert!(matches!(
            config.apply(Overrides::default()),
            Err(ConfigError::Invalid(_))
        ));
    }
}
