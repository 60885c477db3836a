//! Cluster model and cluster network reconciler

use std::collections::HashMap;
use std::sync::Arc;

use exokube_provider::{IngressRule, ProviderClient, SecurityGroup};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::error::CoreError;
use crate::network::{build_rules, ensure_group, ensure_rules};
use crate::node::NodeRole;

/// Security groups of a cluster, `None` until created
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterNetworkState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master_security_group_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_security_group_id: Option<Uuid>,
}

/// A cluster and its network state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cluster {
    pub name: String,
    #[serde(default)]
    pub network: ClusterNetworkState,
}

impl Cluster {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            network: ClusterNetworkState::default(),
        }
    }

    /// Name of the security group owned by `role`
    #[must_use]
    pub fn group_name(&self, role: NodeRole) -> String {
        format!("{}-{}", self.name, role.label())
    }

    #[must_use]
    pub fn security_group_id(&self, role: NodeRole) -> Option<Uuid> {
        match role {
            NodeRole::ControlPlane => self.network.master_security_group_id,
            NodeRole::Worker => self.network.node_security_group_id,
        }
    }

    fn slot(&mut self, role: NodeRole) -> &mut Option<Uuid> {
        match role {
            NodeRole::ControlPlane => &mut self.network.master_security_group_id,
            NodeRole::Worker => &mut self.network.node_security_group_id,
        }
    }
}

/// Outcome of a best-effort network teardown
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TeardownReport {
    pub rules_revoked: usize,
    pub groups_deleted: Vec<Uuid>,
    /// One message per failed call; the teardown carried on past each
    pub errors: Vec<String>,
}

impl TeardownReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Creates and removes the two role security groups of a cluster
pub struct ClusterReconciler {
    provider: Arc<dyn ProviderClient>,
    /// Serializes first-time group creation per cluster
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ClusterReconciler {
    #[must_use]
    pub fn new(provider: Arc<dyn ProviderClient>) -> Self {
        Self {
            provider,
            locks: Mutex::new(HashMap::new()),
        }
    }

    async fn cluster_lock(&self, cluster: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(cluster.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Ensure both groups exist and are populated, recording their ids
    ///
    /// # Errors
    /// Returns the first provider error. Ids recorded before it are kept.
    #[instrument(skip(self, cluster), fields(cluster = %cluster.name))]
    pub async fn reconcile(&self, cluster: &mut Cluster) -> Result<(), CoreError> {
        let lock = self.cluster_lock(&cluster.name).await;
        let _guard = lock.lock().await;

        for role in [NodeRole::ControlPlane, NodeRole::Worker] {
            if cluster.security_group_id(role).is_none() {
                let name = cluster.group_name(role);
                let id = ensure_group(self.provider.as_ref(), &name).await?;
                info!(group = %name, %id, "recorded security group");
                *cluster.slot(role) = Some(id);
            }
        }

        for role in [NodeRole::ControlPlane, NodeRole::Worker] {
            let Some(id) = cluster.security_group_id(role) else {
                continue;
            };
            let rules = build_rules(
                role,
                &cluster.group_name(role),
                &cluster.group_name(role.peer()),
            );
            ensure_rules(self.provider.as_ref(), id, &rules).await?;
        }
        Ok(())
    }

    /// Revoke every rule of both groups, then delete the groups
    ///
    /// Failures are collected in the report and do not stop the remaining
    /// calls. Ids of deleted groups are cleared from the cluster.
    #[instrument(skip(self, cluster), fields(cluster = %cluster.name))]
    pub async fn delete(&self, cluster: &mut Cluster) -> TeardownReport {
        let mut report = TeardownReport::default();

        let mut groups: Vec<(NodeRole, SecurityGroup)> = Vec::new();
        for role in [NodeRole::ControlPlane, NodeRole::Worker] {
            match self.lookup(cluster, role).await {
                Ok(Some(group)) => groups.push((role, group)),
                Ok(None) => *cluster.slot(role) = None,
                Err(e) => report.errors.push(format!("{}: {e}", cluster.group_name(role))),
            }
        }

        let rules: Vec<&IngressRule> = groups
            .iter()
            .flat_map(|(_, g)| g.ingress_rules.iter())
            .collect();
        for rule in rules {
            match self.provider.revoke_ingress(rule.rule_id).await {
                Ok(()) => report.rules_revoked += 1,
                Err(e) => {
                    warn!(rule = %rule.rule_id, error = %e, "failed to revoke rule");
                    report.errors.push(format!("rule {}: {e}", rule.rule_id));
                }
            }
        }

        for (role, group) in &groups {
            match self.provider.delete_security_group(group.id).await {
                Ok(()) => {
                    info!(group = %group.name, "deleted security group");
                    report.groups_deleted.push(group.id);
                    *cluster.slot(*role) = None;
                }
                Err(e) => {
                    warn!(group = %group.name, error = %e, "failed to delete security group");
                    report.errors.push(format!("{}: {e}", group.name));
                }
            }
        }

        report
    }

    /// Group of `role` by recorded id, else by name; `None` if it is gone
    async fn lookup(
        &self,
        cluster: &Cluster,
        role: NodeRole,
    ) -> Result<Option<SecurityGroup>, CoreError> {
        let found = match cluster.security_group_id(role) {
            Some(id) => self.provider.get_security_group_by_id(id).await,
            None => self.provider.get_security_group(&cluster.group_name(role)).await,
        };
        match found {
            Ok(group) => Ok(Some(group)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
