//! Configuration loading and types

use std::path::{Path, PathBuf};
use std::time::Duration;

use eyre::{WrapErr, bail};
use exokube_core::node::ROLE_LABEL;
use exokube_core::{Node, NodeRole, NodeSpec, ReconcilerConfig};
use exokube_exec::retry::duration_secs;
use serde::{Deserialize, Serialize};
use tracing_subscriber::{EnvFilter, fmt};

/// Environment variable naming the config file
pub const CONFIG_ENV: &str = "EXOKUBE_CONFIG";

/// Top-level configuration of the exokube driver
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub log: LoggingConfig,
    pub cluster: ClusterManifest,
    #[serde(default)]
    pub reconciler: ReconcilerConfig,
    #[serde(default)]
    pub driver: DriverConfig,
    /// Where node and network state is kept between runs
    #[serde(default)]
    pub state_file: Option<PathBuf>,
}

/// Logging settings, overridden by `RUST_LOG`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// `pretty` or `json`
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl LoggingConfig {
    /// Install the global tracing subscriber
    pub fn init(&self) {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.level));
        match self.format.as_str() {
            "json" => fmt().json().with_env_filter(filter).init(),
            _ => fmt().with_env_filter(filter).with_target(false).init(),
        }
    }
}

/// Limits of the reconcile loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverConfig {
    /// Give up on `up` after this long
    #[serde(default = "default_up_timeout", with = "duration_secs")]
    pub up_timeout: Duration,
    /// Bootstrap failures tolerated per node before `up` gives up
    #[serde(default = "default_max_failures")]
    pub max_failures: u32,
    /// Transient provider or session errors tolerated in a row per node
    #[serde(default = "default_max_transient_errors")]
    pub max_transient_errors: u32,
    /// Wait after a transient error before calling the reconciler again
    #[serde(default = "default_retry_delay", with = "duration_secs")]
    pub retry_delay: Duration,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            up_timeout: default_up_timeout(),
            max_failures: default_max_failures(),
            max_transient_errors: default_max_transient_errors(),
            retry_delay: default_retry_delay(),
        }
    }
}

fn default_up_timeout() -> Duration {
    Duration::from_secs(45 * 60)
}

fn default_max_failures() -> u32 {
    3
}

fn default_max_transient_errors() -> u32 {
    5
}

fn default_retry_delay() -> Duration {
    Duration::from_secs(5)
}

/// Desired cluster
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterManifest {
    pub name: String,
    #[serde(default, rename = "node")]
    pub nodes: Vec<NodeManifest>,
}

/// One desired node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeManifest {
    pub name: String,
    /// Role label value, `master` or `node`
    pub role: String,
    #[serde(flatten)]
    pub spec: NodeSpec,
}

impl NodeManifest {
    /// Fresh node object for this manifest entry
    #[must_use]
    pub fn to_node(&self) -> Node {
        let mut node = Node::new(&self.name, NodeRole::Worker, self.spec.clone());
        node.labels.insert(ROLE_LABEL.to_string(), self.role.clone());
        node
    }
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    /// Returns error if file cannot be read, parsed or validated
    pub fn load(path: &Path) -> eyre::Result<Self> {
        let content = std::fs::read_to_string(path)
            .wrap_err_with(|| format!("reading {}", path.display()))?;
        let config: Config =
            toml::from_str(&content).wrap_err_with(|| format!("parsing {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path`, else from `EXOKUBE_CONFIG`, else from the first
    /// standard location that exists
    ///
    /// # Errors
    /// Returns error if no file is found or the file is invalid
    pub fn load_from(path: Option<&Path>) -> eyre::Result<Self> {
        if let Some(path) = path {
            return Self::load(path);
        }
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            return Self::load(Path::new(&path));
        }

        let candidates = default_paths();
        for path in &candidates {
            if path.exists() {
                return Self::load(path);
            }
        }
        bail!(
            "no config file found, tried {}",
            candidates
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        )
    }

    /// Check role labels and the control-plane count
    ///
    /// # Errors
    /// Returns error on an unknown role, a duplicate node name or a cluster
    /// without exactly one control-plane
    pub fn validate(&self) -> eyre::Result<()> {
        let mut names = std::collections::BTreeSet::new();
        let mut control_planes = 0;
        for node in &self.cluster.nodes {
            match NodeRole::from_label(&node.role) {
                Some(NodeRole::ControlPlane) => control_planes += 1,
                Some(NodeRole::Worker) => {}
                None => bail!(
                    "node {}: role must be \"master\" or \"node\", got {:?}",
                    node.name,
                    node.role
                ),
            }
            if !names.insert(node.name.as_str()) {
                bail!("node {} is declared twice", node.name);
            }
        }
        if control_planes != 1 {
            bail!(
                "cluster {} needs exactly one master node, found {control_planes}",
                self.cluster.name
            );
        }
        Ok(())
    }

    /// State file path, defaulting to the user's data directory
    #[must_use]
    pub fn state_path(&self) -> PathBuf {
        self.state_file.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("exokube")
                .join(format!("{}.json", self.cluster.name))
        })
    }
}

fn default_paths() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from("exokube.toml")];
    if let Some(dir) = dirs::config_dir() {
        paths.push(dir.join("exokube").join("exokube.toml"));
    }
    paths
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANIFEST: &str = r#"
[log]
format = "json"

[cluster]
name = "demo"

[[cluster.node]]
name = "demo-master-0"
role = "master"
zone = "ch-gva-2"
template = "Linux Ubuntu 18.04 LTS 64-bit"
instance_type = "Medium"
disk_gb = 50
ssh_key = "demo-key"
versions = { control_plane = "1.13.1", kubelet = "1.13.1" }

[[cluster.node]]
name = "demo-node-0"
role = "node"
zone = "ch-gva-2"
template = "Linux Ubuntu 18.04 LTS 64-bit"
instance_type = "Small"
disk_gb = 50
versions = { kubelet = "1.13.1" }

[reconciler]
docker_version = "18.09"

[reconciler.requeue]
provisioning = 5
"#;

    #[test]
    fn test_parse_manifest() {
        let config: Config = toml::from_str(MANIFEST).unwrap();
        config.validate().unwrap();

        assert_eq!(config.log.format, "json");
        assert_eq!(config.log.level, "info");
        assert_eq!(config.cluster.nodes.len(), 2);
        assert_eq!(config.reconciler.docker_version, "18.09");
        assert_eq!(config.reconciler.calico_version, "3.4");
        assert_eq!(
            config.reconciler.requeue.provisioning,
            Duration::from_secs(5)
        );
        assert_eq!(config.driver, DriverConfig::default());

        let worker = config.cluster.nodes[1].to_node();
        assert_eq!(worker.role().unwrap(), NodeRole::Worker);
        assert_eq!(worker.spec.instance_type, "Small");
        assert_eq!(config.cluster.nodes[0].to_node().role().unwrap(), NodeRole::ControlPlane);
    }

    #[test]
    fn test_validate_rejects_unknown_role() {
        let mut config: Config = toml::from_str(MANIFEST).unwrap();
        config.cluster.nodes[1].role = "etcd".into();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("etcd"));
    }

    #[test]
    fn test_validate_requires_one_master() {
        let mut config: Config = toml::from_str(MANIFEST).unwrap();
        config.cluster.nodes[1].role = "master".into();
        assert!(config.validate().is_err());

        config.cluster.nodes.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_explicit_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("exokube.toml");
        std::fs::write(&path, MANIFEST).unwrap();

        let config = Config::load_from(Some(&path)).unwrap();
        assert_eq!(config.cluster.name, "demo");
        assert!(config.state_path().ends_with("exokube/demo.json"));
    }
}
