//! Persisted cluster state
//!
//! Plays the role of the object store a controller would run against: node
//! status and cluster network ids survive between runs in one JSON file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use eyre::WrapErr;
use exokube_core::{Cluster, CoreError, Node, NodeDirectory};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

/// Everything written to the state file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterState {
    pub cluster: Cluster,
    #[serde(default)]
    pub nodes: BTreeMap<String, Node>,
}

impl ClusterState {
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            cluster: Cluster::new(name),
            nodes: BTreeMap::new(),
        }
    }
}

/// State file shared by the node tasks of one run
pub struct StateStore {
    path: PathBuf,
    state: Mutex<ClusterState>,
}

impl StateStore {
    /// Open the state file, starting empty when it does not exist
    ///
    /// # Errors
    /// Returns error if the file exists but cannot be read or parsed
    pub fn open(path: &Path, cluster: &str) -> eyre::Result<Self> {
        let state = if path.exists() {
            let content = std::fs::read_to_string(path)
                .wrap_err_with(|| format!("reading {}", path.display()))?;
            serde_json::from_str(&content)
                .wrap_err_with(|| format!("parsing {}", path.display()))?
        } else {
            ClusterState::new(cluster)
        };
        Ok(Self {
            path: path.to_path_buf(),
            state: Mutex::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn snapshot(&self) -> ClusterState {
        self.state.lock().await.clone()
    }

    pub async fn cluster(&self) -> Cluster {
        self.state.lock().await.cluster.clone()
    }

    pub async fn node(&self, name: &str) -> Option<Node> {
        self.state.lock().await.nodes.get(name).cloned()
    }

    /// Record the cluster network state and write the file
    ///
    /// # Errors
    /// Returns error if the file cannot be written
    pub async fn put_cluster(&self, cluster: &Cluster) -> eyre::Result<()> {
        let mut state = self.state.lock().await;
        state.cluster = cluster.clone();
        self.write(&state).await
    }

    /// Record a node and write the file
    ///
    /// # Errors
    /// Returns error if the file cannot be written
    pub async fn put_node(&self, node: &Node) -> eyre::Result<()> {
        let mut state = self.state.lock().await;
        state.nodes.insert(node.name.clone(), node.clone());
        self.write(&state).await
    }

    /// Forget a node and write the file
    ///
    /// # Errors
    /// Returns error if the file cannot be written
    pub async fn remove_node(&self, name: &str) -> eyre::Result<()> {
        let mut state = self.state.lock().await;
        state.nodes.remove(name);
        self.write(&state).await
    }

    /// Delete the state file
    ///
    /// # Errors
    /// Returns error if the file exists and cannot be removed
    pub async fn discard(&self) -> eyre::Result<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).wrap_err_with(|| format!("removing {}", self.path.display())),
        }
    }

    async fn write(&self, state: &ClusterState) -> eyre::Result<()> {
        if let Some(dir) = self.path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        let content = serde_json::to_string_pretty(state)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .wrap_err_with(|| format!("writing {}", self.path.display()))?;
        debug!(path = %self.path.display(), nodes = state.nodes.len(), "state saved");
        Ok(())
    }
}

#[async_trait]
impl NodeDirectory for StateStore {
    async fn list_nodes(&self, cluster: &str) -> Result<Vec<Node>, CoreError> {
        let state = self.state.lock().await;
        if state.cluster.name != cluster {
            return Ok(Vec::new());
        }
        Ok(state.nodes.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use exokube_core::{NodeRole, NodeSpec, Phase, Versions};

    use super::*;

    fn node(name: &str, role: NodeRole) -> Node {
        Node::new(
            name,
            role,
            NodeSpec {
                zone: "ch-gva-2".into(),
                template: "Linux Ubuntu 18.04 LTS 64-bit".into(),
                instance_type: "Medium".into(),
                disk_gb: 50,
                ssh_key: None,
                identity_file: None,
                user: None,
                cloud_init: None,
                ipv6: false,
                versions: Versions::default(),
            },
        )
    }

    #[tokio::test]
    async fn test_state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("demo.json");

        let store = StateStore::open(&path, "demo").unwrap();
        let mut master = node("demo-master-0", NodeRole::ControlPlane);
        master.status.phase = Phase::Ready;
        store.put_node(&master).await.unwrap();
        store.put_node(&node("demo-node-0", NodeRole::Worker)).await.unwrap();
        drop(store);

        let store = StateStore::open(&path, "demo").unwrap();
        assert_eq!(store.node("demo-master-0").await.unwrap().status.phase, Phase::Ready);
        assert_eq!(store.list_nodes("demo").await.unwrap().len(), 2);
        assert!(store.list_nodes("other").await.unwrap().is_empty());

        store.remove_node("demo-node-0").await.unwrap();
        store.discard().await.unwrap();
        assert!(!path.exists());
        store.discard().await.unwrap();
    }

    #[test]
    fn test_missing_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open(&dir.path().join("none.json"), "demo").unwrap();
        assert_eq!(store.path(), dir.path().join("none.json"));
    }
}
