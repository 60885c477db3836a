//! Node lifecycle reconciler
//!
//! Drives one node through `none -> booting -> pending -> ready`. Every call
//! does at most one step of work and tells the caller when to come back.
//! Bootstrapping runs in the background under the [`ProvisionerActor`]; the
//! next `update` of the node applies its outcome.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use exokube_exec::{Connector, RetryNotify};
use exokube_provider::{AsyncResult, DeployRequest, InstanceFilter, JobOutcome, ProviderClient};
use kameo::actor::{ActorRef, Spawn};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::bootstrap::{BootstrapRunner, TemplateContext, environment};
use crate::cluster::Cluster;
use crate::config::ReconcilerConfig;
use crate::error::CoreError;
use crate::job::AsyncJobPoller;
use crate::node::{FALLBACK_USER, Node, NodeRole, Phase};
use crate::provisioner::{
    Cancel, IsInFlight, NodeKey, ProvisionOutcome, ProvisionTask, ProvisionerActor, Start,
    TakeOutcome,
};

/// Where the admin kubeconfig lives on a control-plane node
const ADMIN_KUBECONFIG: &str = "/etc/kubernetes/admin.conf";

/// What the caller should do after a reconcile call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Nothing left to wait for
    Done,
    /// Call again after the given delay
    RequeueAfter(Duration),
}

/// Read access to the other nodes of a cluster
#[async_trait]
pub trait NodeDirectory: Send + Sync {
    async fn list_nodes(&self, cluster: &str) -> Result<Vec<Node>, CoreError>;
}

/// Values available to a node's cloud-init payload
#[derive(Serialize)]
struct CloudInitContext<'a> {
    name: &'a str,
    cluster: &'a str,
    role: &'static str,
}

/// Reconciles node objects against provider instances
pub struct NodeReconciler {
    provider: Arc<dyn ProviderClient>,
    jobs: AsyncJobPoller,
    connector: Arc<dyn Connector>,
    directory: Arc<dyn NodeDirectory>,
    provisioner: ActorRef<ProvisionerActor>,
    config: ReconcilerConfig,
}

impl NodeReconciler {
    /// Build a reconciler and spawn its provisioning actor
    #[must_use]
    pub fn new(
        provider: Arc<dyn ProviderClient>,
        connector: Arc<dyn Connector>,
        directory: Arc<dyn NodeDirectory>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            jobs: AsyncJobPoller::new(provider.clone()),
            provider,
            connector,
            directory,
            provisioner: ProvisionerActor::spawn(()),
            config,
        }
    }

    #[must_use]
    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    /// Deploy the node's instance
    ///
    /// # Errors
    /// Returns lookup and deploy errors, and `InvalidRole` for a bad label
    #[instrument(skip(self, cluster, node), fields(cluster = %cluster.name, node = %node.name))]
    pub async fn create(&self, cluster: &Cluster, node: &mut Node) -> Result<Action, CoreError> {
        let role = node.role()?;
        if node.status.instance_id.is_some() {
            debug!("instance already recorded");
            return Ok(Action::Done);
        }
        if node.status.phase == Phase::Booting && node.status.pending_job.is_some() {
            debug!("deploy job already issued");
            return Ok(Action::RequeueAfter(self.config.requeue.boot_poll));
        }

        let Some(group_id) = cluster.security_group_id(role) else {
            info!(group = %cluster.group_name(role), "security group not created yet");
            return Ok(Action::RequeueAfter(self.config.requeue.prerequisite));
        };

        let zone = self.provider.get_zone(&node.spec.zone).await?;
        let template = self.provider.get_template(&node.spec.template, zone.id).await?;
        let offering = self
            .provider
            .get_service_offering(&node.spec.instance_type)
            .await?;

        node.status.zone_id = Some(zone.id);
        node.status.template_id = Some(template.id);
        node.status.service_offering_id = Some(offering.id);
        node.status.user = Some(
            node.spec
                .user
                .clone()
                .or_else(|| template.username.clone())
                .unwrap_or_else(|| FALLBACK_USER.to_string()),
        );

        let user_data = match &node.spec.cloud_init {
            Some(payload) => Some(render_cloud_init(payload, cluster, node, role)?),
            None => None,
        };

        let request = DeployRequest {
            name: node.name.clone(),
            zone_id: zone.id,
            template_id: template.id,
            service_offering_id: offering.id,
            root_disk_gb: node.spec.disk_gb,
            key_pair: node.spec.ssh_key.clone(),
            security_group_ids: vec![group_id],
            ipv6: node.spec.ipv6,
            user_data,
        };

        match self.jobs.deploy(&request).await? {
            AsyncResult::Done(vm) => {
                node.attach_instance(&vm)?;
                node.status.pending_job = None;
                node.set_phase(Phase::Pending);
                Ok(Action::Done)
            }
            AsyncResult::Pending(job) => {
                node.status.pending_job = Some(job);
                node.set_phase(Phase::Booting);
                Ok(Action::RequeueAfter(self.config.requeue.boot_poll))
            }
        }
    }

    /// Advance the node by one step
    ///
    /// # Errors
    /// Returns provider errors, `ControlPlaneCount` when a worker cannot find
    /// its control-plane, and `InvalidRole` for a bad label
    #[instrument(skip(self, cluster, node), fields(cluster = %cluster.name, node = %node.name, phase = %node.status.phase))]
    pub async fn update(&self, cluster: &Cluster, node: &mut Node) -> Result<Action, CoreError> {
        let role = node.role()?;
        match node.status.phase {
            Phase::None if node.address().is_none() => self.create(cluster, node).await,
            Phase::None => {
                info!("address already known, resuming at provisioning");
                node.set_phase(Phase::Pending);
                self.provision(cluster, node, role).await
            }
            Phase::Booting => self.poll_deploy(cluster, node).await,
            Phase::Pending => self.provision(cluster, node, role).await,
            Phase::Failure => {
                node.set_phase(Phase::Pending);
                self.provision(cluster, node, role).await
            }
            Phase::Ready | Phase::Deleting => Ok(Action::Done),
        }
    }

    async fn poll_deploy(&self, cluster: &Cluster, node: &mut Node) -> Result<Action, CoreError> {
        let Some(job) = node.status.pending_job else {
            warn!("booting without a deploy job, deploying again");
            node.set_phase(Phase::None);
            return self.create(cluster, node).await;
        };

        match self.jobs.poll(job).await? {
            JobOutcome::Pending => Ok(Action::RequeueAfter(self.config.requeue.boot_poll)),
            JobOutcome::Succeeded(vm) => {
                node.attach_instance(&vm)?;
                node.status.pending_job = None;
                node.set_phase(Phase::Pending);
                Ok(Action::Done)
            }
            JobOutcome::Failed(reason) => {
                warn!(%reason, "deploy job failed, deploying again");
                node.status.pending_job = None;
                node.status.last_error = Some(reason);
                node.set_phase(Phase::None);
                self.create(cluster, node).await
            }
        }
    }

    /// Apply a finished provisioning outcome, or start provisioning
    async fn provision(
        &self,
        cluster: &Cluster,
        node: &mut Node,
        role: NodeRole,
    ) -> Result<Action, CoreError> {
        let key = NodeKey::new(&cluster.name, &node.name);
        let taken = self
            .provisioner
            .ask(TakeOutcome { key: key.clone() })
            .await
            .map_err(|e| CoreError::ActorError(e.to_string()))?;

        match taken {
            Some(ProvisionOutcome::Succeeded) => {
                node.status.last_error = None;
                node.set_phase(Phase::Ready);
                return Ok(Action::Done);
            }
            Some(ProvisionOutcome::Failed { step, error }) => {
                warn!(step = ?step, %error, "provisioning failed");
                node.status.last_error = Some(error);
                node.set_phase(Phase::Failure);
                return Ok(Action::RequeueAfter(self.config.requeue.provisioning));
            }
            None => {}
        }

        let in_flight = self
            .provisioner
            .ask(IsInFlight { key: key.clone() })
            .await
            .map_err(|e| CoreError::ActorError(e.to_string()))?;
        if in_flight {
            debug!("provisioning still running");
            return Ok(Action::RequeueAfter(self.config.requeue.provisioning));
        }

        let Some(task) = self.provision_task(cluster, node, role).await? else {
            return Ok(Action::RequeueAfter(self.config.requeue.prerequisite));
        };

        let started = self
            .provisioner
            .ask(Start { key, task })
            .await
            .map_err(|e| CoreError::ActorError(e.to_string()))?;
        if started {
            info!(%role, "provisioning dispatched");
        }
        Ok(Action::RequeueAfter(self.config.requeue.provisioning))
    }

    /// Build the background task for the node, `None` while a worker's
    /// control-plane is not ready
    async fn provision_task(
        &self,
        cluster: &Cluster,
        node: &Node,
        role: NodeRole,
    ) -> Result<Option<ProvisionTask>, CoreError> {
        let target = node.connection_info(self.config.ssh_port)?;
        let mut ctx = TemplateContext {
            address: target.host.clone(),
            kubernetes_version: node.kubernetes_version()?.to_string(),
            docker_version: self.config.docker_version.clone(),
            ..TemplateContext::default()
        };
        let runner = BootstrapRunner::new(self.connector.clone(), target, node.credential()?)
            .with_notify(not_ready_notify(&node.name))
            .with_step_timeout(self.config.step_timeout);

        match role {
            NodeRole::ControlPlane => {
                ctx.calico_version = Some(self.config.calico_version.clone());
                let task: ProvisionTask = Box::pin(async move {
                    ProvisionOutcome::from_result(runner.run(role, &ctx).await)
                });
                Ok(Some(task))
            }
            NodeRole::Worker => {
                let control_plane = self.control_plane(cluster).await?;
                if control_plane.status.phase != Phase::Ready {
                    info!(control_plane = %control_plane.name, "waiting for control-plane");
                    return Ok(None);
                }

                let cp_target = control_plane.connection_info(self.config.ssh_port)?;
                ctx.master_ip = Some(cp_target.host.clone());
                ctx.master_port = Some(self.config.api_port);
                let cp_runner = BootstrapRunner::new(
                    self.connector.clone(),
                    cp_target,
                    control_plane.credential()?,
                )
                .with_notify(not_ready_notify(&control_plane.name))
                .with_step_timeout(self.config.step_timeout);
                let token_cmd = format!(
                    "sudo kubeadm token create --ttl {}",
                    self.config.token_ttl_arg()
                );

                let task: ProvisionTask = Box::pin(async move {
                    let result = async {
                        let token = cp_runner.fetch(&token_cmd).await?;
                        ctx.token = Some(token.trim().to_string());
                        runner.run(role, &ctx).await
                    }
                    .await;
                    ProvisionOutcome::from_result(result)
                });
                Ok(Some(task))
            }
        }
    }

    /// The single control-plane node of the cluster
    async fn control_plane(&self, cluster: &Cluster) -> Result<Node, CoreError> {
        let mut control_planes: Vec<Node> = self
            .directory
            .list_nodes(&cluster.name)
            .await?
            .into_iter()
            .filter(|n| matches!(n.role(), Ok(NodeRole::ControlPlane)))
            .collect();
        match control_planes.len() {
            1 => Ok(control_planes.remove(0)),
            count => Err(CoreError::ControlPlaneCount {
                cluster: cluster.name.clone(),
                count,
            }),
        }
    }

    /// Destroy the node's instance
    ///
    /// Any provisioning task of the node is cancelled first. A deploy job
    /// still in flight is waited for, so the instance it creates is destroyed
    /// too. The call reports `Done` only once the provider has confirmed the
    /// destroy or no instance is left.
    ///
    /// # Errors
    /// Returns provider errors other than "not found", and
    /// `DuplicateInstances` if the name matches several instances. The node
    /// keeps no job after such an error, so the next call issues the destroy
    /// again.
    #[instrument(skip(self, cluster, node), fields(cluster = %cluster.name, node = %node.name, phase = %node.status.phase))]
    pub async fn delete(&self, cluster: &Cluster, node: &mut Node) -> Result<Action, CoreError> {
        let key = NodeKey::new(&cluster.name, &node.name);
        let cancelled = self
            .provisioner
            .ask(Cancel { key })
            .await
            .map_err(|e| CoreError::ActorError(e.to_string()))?;
        if cancelled {
            info!("cancelled provisioning");
        }

        if let Some(job) = node.status.pending_job {
            match (node.status.phase, self.jobs.poll(job).await?) {
                (_, JobOutcome::Pending) => {
                    debug!(%job, "waiting for job before destroying");
                    return Ok(Action::RequeueAfter(self.config.requeue.delete_poll));
                }
                (Phase::Deleting, JobOutcome::Succeeded(_)) => {
                    info!("instance destroyed");
                    node.clear_instance();
                    return Ok(Action::Done);
                }
                (Phase::Deleting, JobOutcome::Failed(reason)) => {
                    warn!(%reason, "destroy job failed, destroying again");
                    node.status.last_error = Some(reason);
                }
                (_, JobOutcome::Succeeded(vm)) => {
                    info!(instance = %vm.id, "deploy finished during delete");
                    node.status.instance_id = Some(vm.id);
                }
                (_, JobOutcome::Failed(reason)) => {
                    info!(%reason, "deploy failed during delete");
                }
            }
            node.status.pending_job = None;
        }

        let id = match node.status.instance_id {
            Some(id) => Some(id),
            None => self.find_instance(node).await?,
        };
        let Some(id) = id else {
            info!("no instance to destroy");
            node.set_phase(Phase::Deleting);
            node.clear_instance();
            return Ok(Action::Done);
        };

        match self.jobs.destroy(id).await {
            Ok(AsyncResult::Done(_)) => {
                node.set_phase(Phase::Deleting);
                node.clear_instance();
                Ok(Action::Done)
            }
            Ok(AsyncResult::Pending(job)) => {
                node.status.instance_id = Some(id);
                node.status.pending_job = Some(job);
                node.set_phase(Phase::Deleting);
                Ok(Action::RequeueAfter(self.config.requeue.delete_poll))
            }
            Err(CoreError::Provider(e)) if e.is_not_found() => {
                info!(instance = %id, "instance already gone");
                node.set_phase(Phase::Deleting);
                node.clear_instance();
                Ok(Action::Done)
            }
            Err(e) => Err(e),
        }
    }

    /// Whether an instance carries the node's name
    ///
    /// # Errors
    /// Returns provider errors and `DuplicateInstances`
    #[instrument(skip(self, _cluster, node), fields(node = %node.name))]
    pub async fn exists(&self, _cluster: &Cluster, node: &Node) -> Result<bool, CoreError> {
        Ok(self.find_instance(node).await?.is_some())
    }

    /// Instance carrying the node's name, if exactly one does
    async fn find_instance(&self, node: &Node) -> Result<Option<Uuid>, CoreError> {
        let instances = self
            .provider
            .list_instances(&InstanceFilter::by_name(&node.name))
            .await?;
        match instances.as_slice() {
            [] => Ok(None),
            [vm] => Ok(Some(vm.id)),
            _ => Err(CoreError::DuplicateInstances {
                node: node.name.clone(),
                count: instances.len(),
            }),
        }
    }

    /// Address of the node
    ///
    /// # Errors
    /// Returns `CoreError::NoAddress` before the instance is attached
    pub fn address(&self, node: &Node) -> Result<IpAddr, CoreError> {
        node.address()
            .ok_or_else(|| CoreError::NoAddress(node.name.clone()))
    }

    /// Admin kubeconfig read from a ready control-plane node
    ///
    /// # Errors
    /// Returns `NotReadyControlPlane` for any other node, else session errors
    #[instrument(skip(self, _cluster, node), fields(node = %node.name))]
    pub async fn kubeconfig(&self, _cluster: &Cluster, node: &Node) -> Result<String, CoreError> {
        if !matches!(node.role(), Ok(NodeRole::ControlPlane)) || node.status.phase != Phase::Ready {
            return Err(CoreError::NotReadyControlPlane {
                node: node.name.clone(),
            });
        }
        let runner = BootstrapRunner::new(
            self.connector.clone(),
            node.connection_info(self.config.ssh_port)?,
            node.credential()?,
        )
        .with_step_timeout(self.config.step_timeout);
        runner.fetch(&format!("sudo cat {ADMIN_KUBECONFIG}")).await
    }
}

fn not_ready_notify(node: &str) -> RetryNotify {
    let node = node.to_string();
    Arc::new(move |err, delay| {
        info!(%node, error = %err, retry_in = ?delay, "instance not ready yet");
    })
}

/// Render the cloud-init payload against the node identity and encode it
fn render_cloud_init(
    payload: &str,
    cluster: &Cluster,
    node: &Node,
    role: NodeRole,
) -> Result<String, CoreError> {
    let ctx = CloudInitContext {
        name: &node.name,
        cluster: &cluster.name,
        role: role.label(),
    };
    let rendered = environment()
        .render_str(payload, ctx)
        .map_err(|e| CoreError::Template {
            step: "cloud-init".to_string(),
            message: e.to_string(),
        })?;
    Ok(STANDARD.encode(rendered))
}
