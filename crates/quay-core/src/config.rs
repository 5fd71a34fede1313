//! quay.toml configuration parser.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level QuayGrid configuration.
///
/// Every section has defaults that are usable in tests; production
/// deployments load a quay.toml via [`QuayConfig::from_file`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuayConfig {
    /// Metadata-store table name for container records.
    pub collection: String,
    /// Name of the edge-router implementation to use.
    pub router: String,
    /// Static node list, used when the segregated scheduler is disabled.
    pub servers: Vec<String>,
    /// Enable the pool/team segregated scheduler.
    pub segregate: bool,
    /// Optional image registry host; images are pushed only when set.
    pub registry: Option<String>,
    /// Namespace prepended to image names (`namespace/app`).
    pub repository_namespace: String,
    /// Read-only git host used to build clone URLs for git deploys.
    pub git_ro_host: Option<String>,
    /// Invoke the registered healer when a node RPC fails.
    pub auto_healing: bool,
    /// Ping nodes on a one-minute interval.
    pub active_monitoring: bool,
    pub cluster: ClusterConfig,
    pub run_cmd: RunCmdConfig,
    pub ssh: SshConfig,
    pub sharedfs: Option<SharedFsConfig>,
    pub iaas: IaasConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Cluster-storage backend: `memory` or `redb`.
    pub storage: String,
    /// Directory holding the embedded databases.
    pub data_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunCmdConfig {
    /// In-container launch binary.
    pub bin: String,
    /// Application port exposed by every container.
    pub port: String,
    /// In-container deploy script run by build containers.
    pub deploy: String,
    /// Directory the application code lives in, exported to containers.
    pub app_dir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SshConfig {
    /// User the shell transport authenticates as.
    pub user: String,
    /// In-container command that installs an authorized key.
    pub add_key_cmd: String,
    pub sshd_path: String,
    /// Port of the legacy per-host shell agent.
    pub agent_port: u16,
}

/// Optional shared filesystem mounted into every container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedFsConfig {
    pub hostdir: String,
    pub mountpoint: String,
    /// Give each app an isolated subdirectory of `hostdir`.
    #[serde(default)]
    pub app_isolation: bool,
    /// Salt mixed into the per-app subdirectory name.
    #[serde(default)]
    pub salt: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IaasConfig {
    /// Machine provider used when a node-add request names none.
    pub default: Option<String>,
    /// Scheme for node addresses built from provisioned machines.
    pub node_protocol: String,
    /// Port for node addresses built from provisioned machines.
    pub node_port: u16,
}

impl Default for QuayConfig {
    fn default() -> Self {
        QuayConfig {
            collection: "containers".to_string(),
            router: "memory".to_string(),
            servers: Vec::new(),
            segregate: false,
            registry: None,
            repository_namespace: "quay".to_string(),
            git_ro_host: None,
            auto_healing: false,
            active_monitoring: false,
            cluster: ClusterConfig::default(),
            run_cmd: RunCmdConfig::default(),
            ssh: SshConfig::default(),
            sharedfs: None,
            iaas: IaasConfig::default(),
        }
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        ClusterConfig {
            storage: "memory".to_string(),
            data_dir: PathBuf::from("/var/lib/quaygrid"),
        }
    }
}

impl Default for RunCmdConfig {
    fn default() -> Self {
        RunCmdConfig {
            bin: "/var/lib/quay/start".to_string(),
            port: "8888".to_string(),
            deploy: "/var/lib/quay/deploy".to_string(),
            app_dir: "/home/application/current".to_string(),
        }
    }
}

impl Default for SshConfig {
    fn default() -> Self {
        SshConfig {
            user: "ubuntu".to_string(),
            add_key_cmd: "/var/lib/quay/add-key".to_string(),
            sshd_path: "/usr/sbin/sshd".to_string(),
            agent_port: 4545,
        }
    }
}

impl Default for IaasConfig {
    fn default() -> Self {
        IaasConfig {
            default: None,
            node_protocol: "http".to_string(),
            node_port: 4243,
        }
    }
}

impl QuayConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Read(path.to_path_buf(), e))?;
        let config: QuayConfig = toml::from_str(&content)?;
        Ok(config)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    Read(PathBuf, #[source] std::io::Error),

    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
}
