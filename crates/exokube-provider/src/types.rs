//! Provider resource types

use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Handle of an asynchronous provider job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Availability zone
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Zone {
    pub id: Uuid,
    pub name: String,
}

/// OS image available in a zone
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Template {
    pub id: Uuid,
    pub name: String,
    pub zone_id: Uuid,
    /// Default login user baked into the image
    pub username: Option<String>,
    /// Whether the provider generates a login password on deploy
    pub password_enabled: bool,
}

/// Machine size
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceOffering {
    pub id: Uuid,
    pub name: String,
    pub cpu: u32,
    pub memory_mb: u64,
}

/// IP protocol of an ingress rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
    /// IP-in-IP encapsulation, carries no ports
    IpIp,
}

impl Protocol {
    /// Protocol name as understood by the API
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Icmp => "icmp",
            Protocol::IpIp => "ipip",
        }
    }

    /// Whether rules of this protocol carry a port range
    #[must_use]
    pub fn has_ports(self) -> bool {
        matches!(self, Protocol::Tcp | Protocol::Udp)
    }

    /// Parse an API protocol name
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Some(Protocol::Tcp),
            "udp" => Some(Protocol::Udp),
            "icmp" => Some(Protocol::Icmp),
            "ipip" => Some(Protocol::IpIp),
            _ => None,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inclusive port range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    #[must_use]
    pub fn single(port: u16) -> Self {
        Self {
            start: port,
            end: port,
        }
    }

    #[must_use]
    pub fn range(start: u16, end: u16) -> Self {
        Self { start, end }
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

/// Where allowed traffic may come from
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleSource {
    /// Open CIDR set
    Cidrs(Vec<String>),
    /// Members of the named security groups
    Groups(Vec<String>),
}

/// Ingress rule to authorize on a security group
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IngressRuleSpec {
    pub protocol: Protocol,
    /// `None` for protocols without ports
    pub ports: Option<PortRange>,
    pub source: RuleSource,
    pub description: String,
}

impl IngressRuleSpec {
    /// Rule open to any IPv4 and IPv6 address
    #[must_use]
    pub fn public(protocol: Protocol, ports: PortRange, description: impl Into<String>) -> Self {
        Self {
            protocol,
            ports: Some(ports),
            source: RuleSource::Cidrs(vec!["0.0.0.0/0".to_string(), "::/0".to_string()]),
            description: description.into(),
        }
    }

    /// Rule restricted to members of the given groups
    #[must_use]
    pub fn from_groups<I, S>(
        protocol: Protocol,
        ports: Option<PortRange>,
        groups: I,
        description: impl Into<String>,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            protocol,
            ports,
            source: RuleSource::Groups(groups.into_iter().map(Into::into).collect()),
            description: description.into(),
        }
    }
}

/// Ingress rule as stored by the provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngressRule {
    pub rule_id: Uuid,
    pub protocol: Protocol,
    pub ports: Option<PortRange>,
    pub cidr: Option<String>,
    pub security_group_name: Option<String>,
}

/// Named set of ingress rules
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityGroup {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub ingress_rules: Vec<IngressRule>,
}

/// Compute instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualMachine {
    pub id: Uuid,
    pub name: String,
    pub state: String,
    /// Address of the default NIC
    pub ip: Option<IpAddr>,
    pub ip6: Option<IpAddr>,
    /// Generated login password, only returned by the deploy job
    pub password: Option<String>,
    pub template_id: Option<Uuid>,
    pub zone_id: Option<Uuid>,
    pub service_offering_id: Option<Uuid>,
}

/// Parameters of an instance deployment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployRequest {
    pub name: String,
    pub zone_id: Uuid,
    pub template_id: Uuid,
    pub service_offering_id: Uuid,
    pub root_disk_gb: u64,
    /// Name of the provider-side SSH key pair
    pub key_pair: Option<String>,
    pub security_group_ids: Vec<Uuid>,
    pub ipv6: bool,
    /// Base64-encoded cloud-init payload
    pub user_data: Option<String>,
}

/// Result of a call that may complete asynchronously
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AsyncResult<T> {
    /// Completed within the call
    Done(T),
    /// Job must be polled later
    Pending(JobId),
}

/// State of a polled job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome<T> {
    Pending,
    Succeeded(T),
    Failed(String),
}

/// Instance listing filter
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstanceFilter {
    pub name: Option<String>,
    pub id: Option<Uuid>,
}

impl InstanceFilter {
    #[must_use]
    pub fn by_name(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            id: None,
        }
    }

    #[must_use]
    pub fn by_id(id: Uuid) -> Self {
        Self {
            name: None,
            id: Some(id),
        }
    }

    /// Whether `vm` passes the filter
    #[must_use]
    pub fn matches(&self, vm: &VirtualMachine) -> bool {
        self.name.as_ref().is_none_or(|n| *n == vm.name) && self.id.is_none_or(|id| id == vm.id)
    }
}
