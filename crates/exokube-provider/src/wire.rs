//! JSON shapes of the compute API responses

use std::net::IpAddr;

use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

use crate::types::{
    IngressRule, PortRange, Protocol, SecurityGroup, ServiceOffering, Template, VirtualMachine,
    Zone,
};

/// Error body, present in place of the payload on failure
#[derive(Debug, Deserialize)]
pub(crate) struct WireError {
    pub errorcode: u16,
    #[serde(default)]
    pub errortext: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ListZones {
    #[serde(default)]
    pub zone: Vec<WireZone>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireZone {
    pub id: Uuid,
    pub name: String,
}

impl From<WireZone> for Zone {
    fn from(w: WireZone) -> Self {
        Zone {
            id: w.id,
            name: w.name,
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct ListTemplates {
    #[serde(default)]
    pub template: Vec<WireTemplate>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireTemplate {
    pub id: Uuid,
    pub name: String,
    pub zoneid: Uuid,
    #[serde(default)]
    pub details: Option<TemplateDetails>,
    #[serde(default)]
    pub passwordenabled: bool,
}

#[derive(Debug, Deserialize)]
pub(crate) struct TemplateDetails {
    #[serde(default)]
    pub username: Option<String>,
}

impl From<WireTemplate> for Template {
    fn from(w: WireTemplate) -> Self {
        Template {
            id: w.id,
            name: w.name,
            zone_id: w.zoneid,
            username: w.details.and_then(|d| d.username),
            password_enabled: w.passwordenabled,
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct ListServiceOfferings {
    #[serde(default)]
    pub serviceoffering: Vec<WireServiceOffering>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireServiceOffering {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub cpunumber: u32,
    #[serde(default)]
    pub memory: u64,
}

impl From<WireServiceOffering> for ServiceOffering {
    fn from(w: WireServiceOffering) -> Self {
        ServiceOffering {
            id: w.id,
            name: w.name,
            cpu: w.cpunumber,
            memory_mb: w.memory,
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct ListSecurityGroups {
    #[serde(default)]
    pub securitygroup: Vec<WireSecurityGroup>,
}

/// Single group payload of create and authorize responses
#[derive(Debug, Deserialize)]
pub(crate) struct SecurityGroupEnvelope {
    pub securitygroup: WireSecurityGroup,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireSecurityGroup {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub ingressrule: Vec<WireIngressRule>,
}

impl From<WireSecurityGroup> for SecurityGroup {
    fn from(w: WireSecurityGroup) -> Self {
        SecurityGroup {
            id: w.id,
            name: w.name,
            ingress_rules: w.ingressrule.into_iter().filter_map(wire_rule).collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireIngressRule {
    pub ruleid: Uuid,
    pub protocol: String,
    #[serde(default)]
    pub startport: Option<u16>,
    #[serde(default)]
    pub endport: Option<u16>,
    #[serde(default)]
    pub cidr: Option<String>,
    #[serde(default)]
    pub securitygroupname: Option<String>,
}

/// Rules with a protocol this client does not model are dropped
fn wire_rule(w: WireIngressRule) -> Option<IngressRule> {
    let protocol = Protocol::parse(&w.protocol)?;
    let ports = match (protocol.has_ports(), w.startport, w.endport) {
        (true, Some(start), Some(end)) => Some(PortRange::range(start, end)),
        (true, Some(start), None) => Some(PortRange::single(start)),
        _ => None,
    };
    Some(IngressRule {
        rule_id: w.ruleid,
        protocol,
        ports,
        cidr: w.cidr.filter(|c| !c.is_empty()),
        security_group_name: w.securitygroupname.filter(|n| !n.is_empty()),
    })
}

#[derive(Debug, Deserialize)]
pub(crate) struct ListVirtualMachines {
    #[serde(default)]
    pub virtualmachine: Vec<WireVirtualMachine>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct VirtualMachineEnvelope {
    pub virtualmachine: WireVirtualMachine,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireVirtualMachine {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub nic: Vec<WireNic>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub templateid: Option<Uuid>,
    #[serde(default)]
    pub zoneid: Option<Uuid>,
    #[serde(default)]
    pub serviceofferingid: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireNic {
    #[serde(default)]
    pub ipaddress: Option<IpAddr>,
    #[serde(default)]
    pub ip6address: Option<IpAddr>,
    #[serde(default)]
    pub isdefault: bool,
}

impl From<WireVirtualMachine> for VirtualMachine {
    fn from(w: WireVirtualMachine) -> Self {
        let nic = w.nic.iter().find(|n| n.isdefault).or_else(|| w.nic.first());
        VirtualMachine {
            id: w.id,
            name: w.name,
            state: w.state,
            ip: nic.and_then(|n| n.ipaddress),
            ip6: nic.and_then(|n| n.ip6address),
            password: w.password.filter(|p| !p.is_empty()),
            template_id: w.templateid,
            zone_id: w.zoneid,
            service_offering_id: w.serviceofferingid,
        }
    }
}

/// Immediate reply of an asynchronous command
#[derive(Debug, Deserialize)]
pub(crate) struct AsyncReply {
    pub jobid: Uuid,
}

/// Reply of `queryAsyncJobResult`
#[derive(Debug, Deserialize)]
pub(crate) struct JobStatus {
    pub jobstatus: u8,
    #[serde(default)]
    pub jobresultcode: i64,
    #[serde(default)]
    pub jobresult: Option<Value>,
}

pub(crate) const JOB_PENDING: u8 = 0;
pub(crate) const JOB_SUCCEEDED: u8 = 1;

impl JobStatus {
    /// Error text of a failed job
    pub fn failure_text(&self) -> String {
        self.jobresult
            .as_ref()
            .and_then(|r| r.get("errortext"))
            .and_then(Value::as_str)
            .map_or_else(
                || format!("job failed with result code {}", self.jobresultcode),
                str::to_string,
            )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vm_uses_default_nic() {
        let wire: WireVirtualMachine = serde_json::from_value(serde_json::json!({
            "id": "9a3c1a3e-5d4e-4a0e-9f0b-0c6f7e1d2a11",
            "name": "master-1",
            "state": "Running",
            "password": "",
            "nic": [
                {"ipaddress": "10.0.0.5", "isdefault": false},
                {"ipaddress": "185.19.28.10", "ip6address": "2a04:c43:e00::1", "isdefault": true}
            ]
        }))
        .unwrap();
        let vm = VirtualMachine::from(wire);
        assert_eq!(vm.ip, Some("185.19.28.10".parse().unwrap()));
        assert!(vm.ip6.is_some());
        assert_eq!(vm.password, None);
    }

    #[test]
    fn test_group_rules_convert() {
        let wire: WireSecurityGroup = serde_json::from_value(serde_json::json!({
            "id": "5c1d2f8e-6a7b-4c3d-8e9f-0a1b2c3d4e5f",
            "name": "demo-master",
            "ingressrule": [
                {"ruleid": "0b1c2d3e-4f50-6172-8394-a5b6c7d8e9f0", "protocol": "tcp",
                 "startport": 6443, "endport": 6443, "cidr": "0.0.0.0/0"},
                {"ruleid": "1b1c2d3e-4f50-6172-8394-a5b6c7d8e9f0", "protocol": "ipip",
                 "securitygroupname": "demo-node"},
                {"ruleid": "2b1c2d3e-4f50-6172-8394-a5b6c7d8e9f0", "protocol": "gre"}
            ]
        }))
        .unwrap();
        let group = SecurityGroup::from(wire);
        assert_eq!(group.ingress_rules.len(), 2);
        assert_eq!(group.ingress_rules[0].ports, Some(PortRange::single(6443)));
        assert_eq!(group.ingress_rules[1].ports, None);
        assert_eq!(
            group.ingress_rules[1].security_group_name.as_deref(),
            Some("demo-node")
        );
    }

    #[test]
    fn test_job_failure_text() {
        let status: JobStatus = serde_json::from_value(serde_json::json!({
            "jobstatus": 2,
            "jobresultcode": 530,
            "jobresult": {"errorcode": 530, "errortext": "Insufficient capacity"}
        }))
        .unwrap();
        assert_eq!(status.failure_text(), "Insufficient capacity");
    }
}
