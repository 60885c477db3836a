//! Node data model
//!
//! A node pairs the operator's desired configuration with the status the
//! reconciler observes and persists through its caller.

use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use exokube_exec::{ConnectionInfo, Credential};
use exokube_provider::{JobId, VirtualMachine};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::error::CoreError;

/// Label carrying the node role
pub const ROLE_LABEL: &str = "set";

/// Annotation holding the node address
pub const IP_ANNOTATION: &str = "exoscale-ip-address";

/// Annotation holding the login user
pub const USERNAME_ANNOTATION: &str = "exoscale-username";

/// Annotation holding the generated login password
pub const PASSWORD_ANNOTATION: &str = "exoscale-secret-password";

/// Login used when neither the node settings nor the template name one
pub const FALLBACK_USER: &str = "root";

/// Role of a node in the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeRole {
    ControlPlane,
    Worker,
}

impl NodeRole {
    /// Parse the role label value
    #[must_use]
    pub fn from_label(value: &str) -> Option<Self> {
        match value {
            "master" => Some(NodeRole::ControlPlane),
            "node" => Some(NodeRole::Worker),
            _ => None,
        }
    }

    /// Role label value, also the suffix of the role's security group
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            NodeRole::ControlPlane => "master",
            NodeRole::Worker => "node",
        }
    }

    /// The other role
    #[must_use]
    pub fn peer(self) -> Self {
        match self {
            NodeRole::ControlPlane => NodeRole::Worker,
            NodeRole::Worker => NodeRole::ControlPlane,
        }
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeRole::ControlPlane => write!(f, "control-plane"),
            NodeRole::Worker => write!(f, "worker"),
        }
    }
}

/// Lifecycle phase of a node
///
/// ```text
/// none -> booting -> pending -> ready
///                       |  ^
///                       v  |
///                     failure
/// any  -> deleting
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    #[default]
    None,
    Booting,
    Pending,
    Ready,
    Failure,
    Deleting,
}

impl Phase {
    /// Every phase, in lifecycle order
    pub const ALL: [Phase; 6] = [
        Phase::None,
        Phase::Booting,
        Phase::Pending,
        Phase::Ready,
        Phase::Failure,
        Phase::Deleting,
    ];
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::None => "none",
            Phase::Booting => "booting",
            Phase::Pending => "pending",
            Phase::Ready => "ready",
            Phase::Failure => "failure",
            Phase::Deleting => "deleting",
        };
        f.write_str(name)
    }
}

/// Kubernetes versions requested for the node
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Versions {
    #[serde(default)]
    pub control_plane: String,
    #[serde(default)]
    pub kubelet: String,
}

/// Desired configuration of a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSpec {
    pub zone: String,
    pub template: String,
    /// Service offering name
    pub instance_type: String,
    pub disk_gb: u64,
    /// Provider-side SSH key pair installed on the instance
    #[serde(default)]
    pub ssh_key: Option<String>,
    /// Local private key matching `ssh_key`, used when no password is known
    #[serde(default)]
    pub identity_file: Option<PathBuf>,
    /// Login user, defaults to the template's user
    #[serde(default)]
    pub user: Option<String>,
    /// Plain cloud-init payload
    #[serde(default)]
    pub cloud_init: Option<String>,
    #[serde(default)]
    pub ipv6: bool,
    #[serde(default)]
    pub versions: Versions,
}

/// Observed state of a node
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatus {
    #[serde(default)]
    pub phase: Phase,
    /// When the current phase was entered
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase_since: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<IpAddr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zone_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_offering_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_job: Option<JobId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// A node of a cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    pub spec: NodeSpec,
    #[serde(default)]
    pub status: NodeStatus,
}

impl Node {
    /// New node with the role label set and an empty status
    #[must_use]
    pub fn new(name: impl Into<String>, role: NodeRole, spec: NodeSpec) -> Self {
        let mut labels = BTreeMap::new();
        labels.insert(ROLE_LABEL.to_string(), role.label().to_string());
        Self {
            name: name.into(),
            labels,
            annotations: BTreeMap::new(),
            spec,
            status: NodeStatus::default(),
        }
    }

    /// Role from the role label
    ///
    /// # Errors
    /// Returns `CoreError::InvalidRole` if the label is missing or unknown
    pub fn role(&self) -> Result<NodeRole, CoreError> {
        let value = self.labels.get(ROLE_LABEL);
        value
            .and_then(|v| NodeRole::from_label(v))
            .ok_or_else(|| CoreError::InvalidRole {
                node: self.name.clone(),
                value: value.cloned(),
            })
    }

    /// Set the phase, logging the transition
    pub fn set_phase(&mut self, phase: Phase) {
        if self.status.phase != phase {
            info!(node = %self.name, from = %self.status.phase, to = %phase, "phase transition");
            self.status.phase = phase;
            self.status.phase_since = Some(Utc::now());
        }
    }

    /// Record the instance returned by a completed deploy and attach its
    /// connection metadata
    ///
    /// # Errors
    /// Returns `CoreError::InstanceConflict` if a different instance is
    /// already recorded
    pub fn attach_instance(&mut self, vm: &VirtualMachine) -> Result<(), CoreError> {
        if let Some(recorded) = self.status.instance_id {
            if recorded != vm.id {
                return Err(CoreError::InstanceConflict {
                    node: self.name.clone(),
                    recorded,
                    found: vm.id,
                });
            }
        }

        self.status.instance_id = Some(vm.id);
        self.status.address = vm.ip.or(vm.ip6);
        if vm.password.is_some() {
            self.status.password.clone_from(&vm.password);
        }
        if self.status.user.is_none() {
            self.status.user = Some(self.spec.user.clone().unwrap_or_else(|| FALLBACK_USER.into()));
        }

        if let Some(address) = self.status.address {
            self.annotations
                .insert(IP_ANNOTATION.to_string(), address.to_string());
        }
        if let Some(user) = &self.status.user {
            self.annotations
                .insert(USERNAME_ANNOTATION.to_string(), user.clone());
        }
        if let Some(password) = &self.status.password {
            self.annotations
                .insert(PASSWORD_ANNOTATION.to_string(), password.clone());
        }
        Ok(())
    }

    /// Forget the instance after it has been destroyed
    pub fn clear_instance(&mut self) {
        self.status.instance_id = None;
        self.status.address = None;
        self.status.password = None;
        self.status.pending_job = None;
        for key in [IP_ANNOTATION, PASSWORD_ANNOTATION] {
            self.annotations.remove(key);
        }
    }

    /// Node address from status, else from the address annotation
    #[must_use]
    pub fn address(&self) -> Option<IpAddr> {
        self.status.address.or_else(|| {
            self.annotations
                .get(IP_ANNOTATION)
                .and_then(|ip| ip.parse().ok())
        })
    }

    /// Login user from status, annotation, spec, in that order
    #[must_use]
    pub fn login_user(&self) -> String {
        self.status
            .user
            .clone()
            .or_else(|| self.annotations.get(USERNAME_ANNOTATION).cloned())
            .or_else(|| self.spec.user.clone())
            .unwrap_or_else(|| FALLBACK_USER.to_string())
    }

    /// Credential to log in with: the generated password when there is one,
    /// else the configured identity file
    ///
    /// # Errors
    /// Returns `CoreError::NoCredential` if neither is available
    pub fn credential(&self) -> Result<Credential, CoreError> {
        let password = self
            .status
            .password
            .clone()
            .or_else(|| self.annotations.get(PASSWORD_ANNOTATION).cloned());
        match (password, &self.spec.identity_file) {
            (Some(password), _) => Ok(Credential::Password(password)),
            (None, Some(path)) => Ok(Credential::KeyFile(path.clone())),
            (None, None) => Err(CoreError::NoCredential(self.name.clone())),
        }
    }

    /// SSH target of the node
    ///
    /// # Errors
    /// Returns `CoreError::NoAddress` if no address is known
    pub fn connection_info(&self, port: u16) -> Result<ConnectionInfo, CoreError> {
        let address = self
            .address()
            .ok_or_else(|| CoreError::NoAddress(self.name.clone()))?;
        Ok(ConnectionInfo::new(address.to_string(), self.login_user()).with_port(port))
    }

    /// Kubernetes version to install for the node's role
    ///
    /// # Errors
    /// Returns `CoreError::InvalidRole` if the role label is invalid
    pub fn kubernetes_version(&self) -> Result<&str, CoreError> {
        Ok(match self.role()? {
            NodeRole::ControlPlane => &self.spec.versions.control_plane,
            NodeRole::Worker => &self.spec.versions.kubelet,
        })
    }
}
