//! Network policy provisioner
//!
//! Each role owns one security group. The rule set of a group depends only on
//! the role and on the names of the two groups, and a group that already
//! carries rules is never populated again.

use exokube_provider::{IngressRuleSpec, PortRange, ProviderClient, Protocol};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::error::CoreError;
use crate::node::NodeRole;

/// Control-plane API
pub const API_PORT: u16 = 6443;

/// Calico BGP peering
const BGP_PORT: u16 = 179;

/// Ingress rules of the group owned by `role`
///
/// `own` is the name of that group, `peer` the name of the other role's
/// group. Rules scoped to "both groups" reference `[own, peer]`.
#[must_use]
pub fn build_rules(role: NodeRole, own: &str, peer: &str) -> Vec<IngressRuleSpec> {
    let both = [own, peer];

    let mut rules = vec![IngressRuleSpec::public(
        Protocol::Tcp,
        PortRange::single(22),
        "SSH",
    )];

    match role {
        NodeRole::ControlPlane => {
            rules.push(IngressRuleSpec::public(
                Protocol::Tcp,
                PortRange::single(API_PORT),
                "Kubernetes API server",
            ));
            rules.push(IngressRuleSpec::from_groups(
                Protocol::Tcp,
                Some(PortRange::range(2379, 2380)),
                [own],
                "etcd server client API",
            ));
            rules.push(IngressRuleSpec::from_groups(
                Protocol::Tcp,
                Some(PortRange::range(10250, 10252)),
                [own],
                "Kubelet API, kube-scheduler, kube-controller-manager",
            ));
        }
        NodeRole::Worker => {
            rules.push(IngressRuleSpec::from_groups(
                Protocol::Tcp,
                Some(PortRange::single(10250)),
                both,
                "Kubelet API",
            ));
            rules.push(IngressRuleSpec::public(
                Protocol::Tcp,
                PortRange::range(30000, 32767),
                "NodePort Services",
            ));
        }
    }

    rules.push(IngressRuleSpec::from_groups(
        Protocol::Tcp,
        Some(PortRange::single(BGP_PORT)),
        both,
        "Calico BGP",
    ));
    rules.push(IngressRuleSpec::from_groups(
        Protocol::IpIp,
        None,
        both,
        "Calico IPIP",
    ));

    rules
}

/// Identifier of the group named `name`, creating the group if needed
///
/// # Errors
/// Returns any provider error other than "not found"
#[instrument(skip(provider))]
pub async fn ensure_group(provider: &dyn ProviderClient, name: &str) -> Result<Uuid, CoreError> {
    let group = provider.get_or_create_security_group(name).await?;
    debug!(group = %name, id = %group.id, "security group present");
    Ok(group.id)
}

/// Apply `rules` to an empty group, in order
///
/// Returns the number of rules applied, 0 when the group already had rules.
///
/// # Errors
/// Returns the first provider error; rules applied before it stay in place
#[instrument(skip(provider, rules), fields(rules = rules.len()))]
pub async fn ensure_rules(
    provider: &dyn ProviderClient,
    group_id: Uuid,
    rules: &[IngressRuleSpec],
) -> Result<usize, CoreError> {
    let group = provider.get_security_group_by_id(group_id).await?;
    if !group.ingress_rules.is_empty() {
        debug!(
            group = %group.name,
            existing = group.ingress_rules.len(),
            "security group already populated"
        );
        return Ok(0);
    }

    for rule in rules {
        provider.authorize_ingress(group_id, rule).await?;
    }
    info!(group = %group.name, applied = rules.len(), "security group populated");
    Ok(rules.len())
}

#[cfg(test)]
mod tests {
    use exokube_provider::{InMemoryProvider, MockProviderClient, ProviderError, RuleSource};

    use super::*;

    #[test]
    fn test_build_rules_is_pure() {
        for (role, own, peer) in [
            (NodeRole::ControlPlane, "demo-master", "demo-node"),
            (NodeRole::Worker, "demo-node", "demo-master"),
        ] {
            let a = build_rules(role, own, peer);
            let b = build_rules(role, own, peer);
            assert_eq!(a, b, "{role}");
            assert!(!a.is_empty());
        }
    }

    #[test]
    fn test_control_plane_rules() {
        let rules = build_rules(NodeRole::ControlPlane, "demo-master", "demo-node");

        let api = rules
            .iter()
            .find(|r| r.ports == Some(PortRange::single(6443)))
            .unwrap();
        assert!(matches!(&api.source, RuleSource::Cidrs(c) if c.contains(&"0.0.0.0/0".to_string())));

        let etcd = rules
            .iter()
            .find(|r| r.ports == Some(PortRange::range(2379, 2380)))
            .unwrap();
        assert_eq!(etcd.source, RuleSource::Groups(vec!["demo-master".into()]));

        let ipip = rules.iter().find(|r| r.protocol == Protocol::IpIp).unwrap();
        assert_eq!(ipip.ports, None);
        assert_eq!(
            ipip.source,
            RuleSource::Groups(vec!["demo-master".into(), "demo-node".into()])
        );
        assert!(!rules.iter().any(|r| r.ports == Some(PortRange::range(30000, 32767))));
    }

    #[test]
    fn test_worker_rules() {
        let rules = build_rules(NodeRole::Worker, "demo-node", "demo-master");

        assert!(rules.iter().any(|r| r.ports == Some(PortRange::range(30000, 32767))
            && matches!(r.source, RuleSource::Cidrs(_))));
        let kubelet = rules
            .iter()
            .find(|r| r.ports == Some(PortRange::single(10250)))
            .unwrap();
        assert_eq!(
            kubelet.source,
            RuleSource::Groups(vec!["demo-node".into(), "demo-master".into()])
        );
        assert!(!rules.iter().any(|r| r.ports == Some(PortRange::single(6443))));
    }

    #[tokio::test]
    async fn test_ensure_group_twice_creates_once() {
        let provider = InMemoryProvider::new();

        let first = ensure_group(&provider, "demo-master").await.unwrap();
        let second = ensure_group(&provider, "demo-master").await.unwrap();

        assert_eq!(first, second);
        assert_eq!(provider.calls().create_security_group, 1);
    }

    #[tokio::test]
    async fn test_ensure_group_propagates_other_errors() {
        let mut provider = MockProviderClient::new();
        provider
            .expect_get_or_create_security_group()
            .times(1)
            .returning(|_| Err(ProviderError::Http("connection refused".into())));

        let err = ensure_group(&provider, "demo-master").await.unwrap_err();
        assert!(matches!(err, CoreError::Provider(ProviderError::Http(_))));
    }

    #[tokio::test]
    async fn test_ensure_rules_twice_applies_once() {
        let provider = InMemoryProvider::new();
        let master = ensure_group(&provider, "demo-master").await.unwrap();
        ensure_group(&provider, "demo-node").await.unwrap();
        let rules = build_rules(NodeRole::ControlPlane, "demo-master", "demo-node");

        let applied = ensure_rules(&provider, master, &rules).await.unwrap();
        assert_eq!(applied, rules.len());
        let again = ensure_rules(&provider, master, &rules).await.unwrap();
        assert_eq!(again, 0);

        assert_eq!(provider.calls().authorize_ingress, rules.len());
    }
}
