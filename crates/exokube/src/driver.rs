//! Reconcile loop
//!
//! Stands in for the orchestration framework: one task per node calls the
//! reconciler, persists the node after every call and sleeps for as long as
//! the returned action asks. Transient provider and session errors are
//! retried a bounded number of times in a row, anything else ends the task.

use std::sync::Arc;

use exokube_core::node::ROLE_LABEL;
use exokube_core::{
    Action, Cluster, ClusterReconciler, CoreError, Node, NodeReconciler, NodeRole, Phase,
    TeardownReport,
};
use exokube_exec::Connector;
use exokube_provider::ProviderClient;
use eyre::{bail, eyre};
use tokio::task::JoinSet;
use tracing::{info, instrument, warn};

use crate::config::{ClusterManifest, Config, DriverConfig};
use crate::state::{ClusterState, StateStore};

pub struct Driver {
    nodes: Arc<NodeReconciler>,
    network: ClusterReconciler,
    store: Arc<StateStore>,
    limits: DriverConfig,
}

impl Driver {
    pub fn new(
        provider: Arc<dyn ProviderClient>,
        connector: Arc<dyn Connector>,
        store: Arc<StateStore>,
        config: &Config,
    ) -> Self {
        let nodes = NodeReconciler::new(
            provider.clone(),
            connector,
            store.clone(),
            config.reconciler.clone(),
        );
        Self {
            nodes: Arc::new(nodes),
            network: ClusterReconciler::new(provider),
            store,
            limits: config.driver,
        }
    }

    /// Bring every node of the manifest to `ready`
    ///
    /// # Errors
    /// Returns the first fatal reconcile error, or a timeout
    #[instrument(skip(self, manifest), fields(cluster = %manifest.name))]
    pub async fn up(&self, manifest: &ClusterManifest) -> eyre::Result<()> {
        let mut cluster = self.store.cluster().await;
        let network = self.network.reconcile(&mut cluster).await;
        self.store.put_cluster(&cluster).await?;
        network?;

        let mut tasks = JoinSet::new();
        for entry in &manifest.nodes {
            let node = match self.store.node(&entry.name).await {
                Some(mut existing) => {
                    existing.spec = entry.spec.clone();
                    existing
                        .labels
                        .insert(ROLE_LABEL.to_string(), entry.role.clone());
                    existing
                }
                None => entry.to_node(),
            };
            self.store.put_node(&node).await?;

            tasks.spawn(drive_up(
                self.nodes.clone(),
                self.store.clone(),
                cluster.clone(),
                node,
                self.limits,
            ));
        }

        let run = async {
            while let Some(joined) = tasks.join_next().await {
                joined??;
            }
            Ok::<_, eyre::Report>(())
        };
        tokio::time::timeout(self.limits.up_timeout, run)
            .await
            .map_err(|_| eyre!("cluster not ready after {:?}", self.limits.up_timeout))??;

        info!(nodes = manifest.nodes.len(), "cluster ready");
        Ok(())
    }

    /// Destroy every recorded node, then the cluster network
    ///
    /// The state file is removed once nothing is left behind.
    ///
    /// # Errors
    /// Returns the first fatal delete error
    #[instrument(skip(self))]
    pub async fn down(&self) -> eyre::Result<TeardownReport> {
        let ClusterState { mut cluster, nodes } = self.store.snapshot().await;

        let mut tasks = JoinSet::new();
        for node in nodes.into_values() {
            tasks.spawn(drive_down(
                self.nodes.clone(),
                self.store.clone(),
                cluster.clone(),
                node,
                self.limits,
            ));
        }
        while let Some(joined) = tasks.join_next().await {
            joined??;
        }

        let report = self.network.delete(&mut cluster).await;
        self.store.put_cluster(&cluster).await?;
        if report.is_clean() {
            self.store.discard().await?;
        } else {
            warn!(errors = ?report.errors, "network teardown left resources behind");
        }
        Ok(report)
    }

    pub async fn status(&self) -> ClusterState {
        self.store.snapshot().await
    }

    /// Admin kubeconfig of the cluster's control-plane
    ///
    /// # Errors
    /// Returns error if the control-plane is missing or not ready
    pub async fn kubeconfig(&self) -> eyre::Result<String> {
        let state = self.store.snapshot().await;
        let control_plane = state
            .nodes
            .values()
            .find(|n| matches!(n.role(), Ok(NodeRole::ControlPlane)))
            .ok_or_else(|| eyre!("cluster {} has no master node", state.cluster.name))?;
        Ok(self.nodes.kubeconfig(&state.cluster, control_plane).await?)
    }
}

/// Tracks transient errors in a row for one node task
struct Transient {
    seen: u32,
    limits: DriverConfig,
}

impl Transient {
    fn new(limits: DriverConfig) -> Self {
        Self { seen: 0, limits }
    }

    /// Unwrap a reconcile result; `None` means wait and call again
    async fn check(
        &mut self,
        node: &str,
        result: Result<Action, CoreError>,
    ) -> eyre::Result<Option<Action>> {
        match result {
            Ok(action) => {
                self.seen = 0;
                Ok(Some(action))
            }
            Err(e) if e.is_retryable() && self.seen < self.limits.max_transient_errors => {
                self.seen += 1;
                warn!(%node, error = %e, attempt = self.seen, "transient error, retrying");
                tokio::time::sleep(self.limits.retry_delay).await;
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }
}

async fn drive_up(
    reconciler: Arc<NodeReconciler>,
    store: Arc<StateStore>,
    cluster: Cluster,
    mut node: Node,
    limits: DriverConfig,
) -> eyre::Result<()> {
    if node.status.phase == Phase::None
        && node.status.instance_id.is_none()
        && reconciler.exists(&cluster, &node).await?
    {
        bail!(
            "node {}: an instance with this name exists but is not recorded in {}",
            node.name,
            store.path().display()
        );
    }

    let mut failures = 0;
    let mut transient = Transient::new(limits);
    loop {
        let result = reconciler.update(&cluster, &mut node).await;
        store.put_node(&node).await?;
        let Some(action) = transient.check(&node.name, result).await? else {
            continue;
        };

        match node.status.phase {
            Phase::Ready => {
                info!(node = %node.name, "node ready");
                return Ok(());
            }
            Phase::Failure => {
                failures += 1;
                let error = node.status.last_error.as_deref().unwrap_or("unknown error");
                if failures >= limits.max_failures {
                    bail!("node {}: bootstrap failed {failures} times: {error}", node.name);
                }
                warn!(node = %node.name, failures, %error, "bootstrap failed, retrying");
            }
            Phase::Deleting => bail!("node {} is being deleted", node.name),
            Phase::None | Phase::Booting | Phase::Pending => {}
        }

        if let Action::RequeueAfter(delay) = action {
            tokio::time::sleep(delay).await;
        }
    }
}

async fn drive_down(
    reconciler: Arc<NodeReconciler>,
    store: Arc<StateStore>,
    cluster: Cluster,
    mut node: Node,
    limits: DriverConfig,
) -> eyre::Result<()> {
    let mut transient = Transient::new(limits);
    loop {
        let result = reconciler.delete(&cluster, &mut node).await;
        store.put_node(&node).await?;
        let Some(action) = transient.check(&node.name, result).await? else {
            continue;
        };
        match action {
            Action::Done => {
                info!(node = %node.name, "node deleted");
                return store.remove_node(&node.name).await;
            }
            Action::RequeueAfter(delay) => tokio::time::sleep(delay).await,
        }
    }
}
