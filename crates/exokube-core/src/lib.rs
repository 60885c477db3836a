//! exokube-core: Node lifecycle and cluster network reconcilers
//!
//! Drives Kubernetes nodes from nothing to a joined kubelet on provider
//! instances: security groups per role, instance deploy and destroy through
//! async jobs, and a bootstrap script run over SSH in the background.

pub mod bootstrap;
pub mod cluster;
pub mod config;
pub mod error;
pub mod job;
pub mod network;
pub mod node;
pub mod provisioner;
pub mod reconciler;

pub use bootstrap::{BootstrapRunner, BootstrapStep, RenderedStep, TemplateContext, steps_for};
pub use cluster::{Cluster, ClusterNetworkState, ClusterReconciler, TeardownReport};
pub use config::{ReconcilerConfig, RequeueIntervals};
pub use error::CoreError;
pub use job::AsyncJobPoller;
pub use network::build_rules;
pub use node::{Node, NodeRole, NodeSpec, NodeStatus, Phase, Versions};
pub use provisioner::{NodeKey, ProvisionOutcome, ProvisionerActor};
pub use reconciler::{Action, NodeDirectory, NodeReconciler};
