//! Shared fixtures for the reconciler scenarios

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;

use exokube_core::{
    Action, Cluster, ClusterReconciler, CoreError, Node, NodeDirectory, NodeReconciler, NodeRole,
    NodeSpec, ReconcilerConfig, Versions,
};
use exokube_exec::{
    CommandResult, ConnectionInfo, Connector, Credential, ExecError, RemoteExecutor, RetryNotify,
};
use exokube_provider::InMemoryProvider;

pub const ZONE: &str = "ch-gva-2";
pub const TEMPLATE: &str = "Linux Ubuntu 18.04 LTS 64-bit";
pub const OFFERING: &str = "Medium";
pub const JOIN_TOKEN: &str = "abcdef.0123456789abcdef";

/// Every command run, with the host it ran on
pub type CommandLog = Arc<Mutex<Vec<(String, String)>>>;

/// Connector whose sessions succeed unless a command contains `fail_on`
#[derive(Clone, Default)]
pub struct ScriptedConnector {
    pub log: CommandLog,
    pub fail_on: Option<String>,
    /// Commands containing this never finish
    pub stall_on: Option<String>,
    /// When set, each command waits for a permit
    pub gate: Option<Arc<Semaphore>>,
}

impl ScriptedConnector {
    pub fn failing_on(marker: &str) -> Self {
        Self {
            fail_on: Some(marker.to_string()),
            ..Self::default()
        }
    }

    pub fn stalling_on(marker: &str) -> Self {
        Self {
            stall_on: Some(marker.to_string()),
            ..Self::default()
        }
    }

    pub fn gated() -> (Self, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        let connector = Self {
            gate: Some(gate.clone()),
            ..Self::default()
        };
        (connector, gate)
    }

    pub fn commands(&self) -> Vec<(String, String)> {
        self.log.lock().unwrap().clone()
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn connect(
        &self,
        target: &ConnectionInfo,
        _credential: &Credential,
        _notify: Option<RetryNotify>,
    ) -> Result<Arc<dyn RemoteExecutor>, ExecError> {
        Ok(Arc::new(ScriptedSession {
            host: target.host.clone(),
            connector: self.clone(),
        }))
    }
}

struct ScriptedSession {
    host: String,
    connector: ScriptedConnector,
}

#[async_trait]
impl RemoteExecutor for ScriptedSession {
    async fn run(&self, cmd: &str) -> Result<CommandResult, ExecError> {
        if let Some(gate) = &self.connector.gate {
            gate.acquire().await.unwrap().forget();
        }
        self.connector
            .log
            .lock()
            .unwrap()
            .push((self.host.clone(), cmd.to_string()));

        if self
            .connector
            .stall_on
            .as_deref()
            .is_some_and(|marker| cmd.contains(marker))
        {
            std::future::pending::<()>().await;
        }

        let failed = self
            .connector
            .fail_on
            .as_deref()
            .is_some_and(|marker| cmd.contains(marker));
        let stdout = if cmd.contains("kubeadm token create") {
            format!("{JOIN_TOKEN}\n")
        } else {
            String::new()
        };
        Ok(CommandResult {
            status: i32::from(failed),
            stdout,
            stderr: if failed { "scripted failure".into() } else { String::new() },
            duration: Duration::from_millis(1),
        })
    }

    async fn run_with_timeout(
        &self,
        cmd: &str,
        timeout: Duration,
    ) -> Result<CommandResult, ExecError> {
        tokio::time::timeout(timeout, self.run(cmd))
            .await
            .map_err(|_| ExecError::Timeout { timeout })?
    }

    fn is_connected(&self) -> bool {
        true
    }

    fn executor_type(&self) -> &'static str {
        "scripted"
    }
}

/// Directory over a shared node list
#[derive(Clone, Default)]
pub struct SharedNodes(pub Arc<tokio::sync::Mutex<Vec<Node>>>);

impl SharedNodes {
    pub async fn put(&self, node: &Node) {
        let mut nodes = self.0.lock().await;
        nodes.retain(|n| n.name != node.name);
        nodes.push(node.clone());
    }
}

#[async_trait]
impl NodeDirectory for SharedNodes {
    async fn list_nodes(&self, _cluster: &str) -> Result<Vec<Node>, CoreError> {
        Ok(self.0.lock().await.clone())
    }
}

pub fn node_spec() -> NodeSpec {
    NodeSpec {
        zone: ZONE.into(),
        template: TEMPLATE.into(),
        instance_type: OFFERING.into(),
        disk_gb: 50,
        ssh_key: Some("demo-key".into()),
        identity_file: None,
        user: None,
        cloud_init: None,
        ipv6: false,
        versions: Versions {
            control_plane: "1.13.1".into(),
            kubelet: "1.13.1".into(),
        },
    }
}

pub struct Harness {
    pub provider: Arc<InMemoryProvider>,
    pub connector: ScriptedConnector,
    pub nodes: SharedNodes,
    pub reconciler: NodeReconciler,
    pub cluster: Cluster,
}

impl Harness {
    pub fn new(connector: ScriptedConnector) -> Self {
        let provider = Arc::new(InMemoryProvider::with_catalog(ZONE, TEMPLATE, OFFERING));
        let nodes = SharedNodes::default();
        let reconciler = NodeReconciler::new(
            provider.clone(),
            Arc::new(connector.clone()),
            Arc::new(nodes.clone()),
            ReconcilerConfig::default(),
        );
        Self {
            provider,
            connector,
            nodes,
            reconciler,
            cluster: Cluster::new("demo"),
        }
    }

    /// Harness whose cluster groups already exist
    pub async fn with_network(connector: ScriptedConnector) -> Self {
        let mut harness = Self::new(connector);
        ClusterReconciler::new(harness.provider.clone())
            .reconcile(&mut harness.cluster)
            .await
            .unwrap();
        harness
    }

    pub fn node(&self, name: &str, role: NodeRole) -> Node {
        Node::new(name, role, node_spec())
    }

    /// Call `update` until `done` holds, publishing the node after each call
    pub async fn drive(&self, node: &mut Node, done: impl Fn(&Node) -> bool) {
        for _ in 0..200 {
            let action = self.reconciler.update(&self.cluster, node).await.unwrap();
            self.nodes.put(node).await;
            if done(node) {
                return;
            }
            if let Action::RequeueAfter(_) = action {
                tokio::task::yield_now().await;
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }
        panic!("node {} stuck in {}", node.name, node.status.phase);
    }
}
