mod common;

use std::time::Duration;

use exokube_core::{Action, NodeRole, Phase};
use exokube_provider::{JobOutcome, ProviderClient};

use common::{Harness, JOIN_TOKEN, ScriptedConnector};

const ONE_SECOND: Action = Action::RequeueAfter(Duration::from_secs(1));
const TWO_SECONDS: Action = Action::RequeueAfter(Duration::from_secs(2));
const TEN_SECONDS: Action = Action::RequeueAfter(Duration::from_secs(10));

#[tokio::test]
async fn test_create_without_group_requeues() {
    let h = Harness::new(ScriptedConnector::default());
    let mut node = h.node("demo-master-0", NodeRole::ControlPlane);

    let action = h.reconciler.create(&h.cluster, &mut node).await.unwrap();

    assert_eq!(action, ONE_SECOND);
    assert_eq!(node.status.phase, Phase::None);
    assert_eq!(h.provider.calls().deploy_instance, 0);
}

#[tokio::test]
async fn test_sync_deploy_attaches_instance() {
    let h = Harness::with_network(ScriptedConnector::default()).await;
    let mut node = h.node("demo-master-0", NodeRole::ControlPlane);

    let action = h.reconciler.create(&h.cluster, &mut node).await.unwrap();

    assert_eq!(action, Action::Done);
    assert_eq!(node.status.phase, Phase::Pending);
    assert!(node.status.instance_id.is_some());
    assert_eq!(node.status.user.as_deref(), Some("ubuntu"));
    assert_eq!(
        node.annotations.get("exoscale-ip-address").map(String::as_str),
        Some("192.0.2.10")
    );
    assert!(node.annotations.contains_key("exoscale-secret-password"));
    assert!(h.reconciler.exists(&h.cluster, &node).await.unwrap());
}

#[tokio::test]
async fn test_booting_with_pending_job_keeps_phase() {
    let h = Harness::with_network(ScriptedConnector::default()).await;
    h.provider.set_async_jobs(5).await;
    let mut node = h.node("demo-master-0", NodeRole::ControlPlane);

    assert_eq!(h.reconciler.create(&h.cluster, &mut node).await.unwrap(), ONE_SECOND);
    assert_eq!(node.status.phase, Phase::Booting);
    let job = node.status.pending_job;
    assert!(job.is_some());

    let action = h.reconciler.update(&h.cluster, &mut node).await.unwrap();
    assert_eq!(action, ONE_SECOND);
    assert_eq!(node.status.phase, Phase::Booting);
    assert_eq!(node.status.pending_job, job);
    assert_eq!(h.provider.calls().deploy_instance, 1);
}

#[tokio::test]
async fn test_failed_deploy_job_deploys_again() {
    let h = Harness::with_network(ScriptedConnector::default()).await;
    h.provider.set_async_jobs(0).await;
    h.provider.fail_next_jobs(1).await;
    let mut node = h.node("demo-master-0", NodeRole::ControlPlane);

    h.reconciler.create(&h.cluster, &mut node).await.unwrap();
    let first_job = node.status.pending_job;

    let action = h.reconciler.update(&h.cluster, &mut node).await.unwrap();
    assert_eq!(action, ONE_SECOND);
    assert_eq!(node.status.phase, Phase::Booting);
    assert_ne!(node.status.pending_job, first_job);
    assert_eq!(h.provider.calls().deploy_instance, 2);
    assert!(node.status.last_error.is_some());
}

#[tokio::test]
async fn test_delete_while_deleting_does_not_reissue() {
    let h = Harness::with_network(ScriptedConnector::default()).await;
    let mut node = h.node("demo-node-0", NodeRole::Worker);
    h.reconciler.create(&h.cluster, &mut node).await.unwrap();
    h.provider.set_async_jobs(3).await;

    assert_eq!(h.reconciler.delete(&h.cluster, &mut node).await.unwrap(), TWO_SECONDS);
    assert_eq!(node.status.phase, Phase::Deleting);
    for _ in 0..3 {
        assert_eq!(h.reconciler.delete(&h.cluster, &mut node).await.unwrap(), TWO_SECONDS);
    }
    assert_eq!(h.provider.calls().destroy_instance, 1);

    assert_eq!(h.reconciler.delete(&h.cluster, &mut node).await.unwrap(), Action::Done);
    assert!(node.status.instance_id.is_none());
    assert!(h.provider.instances().await.is_empty());
    assert!(!h.reconciler.exists(&h.cluster, &node).await.unwrap());
}

#[tokio::test]
async fn test_delete_without_recorded_id_looks_up_by_name() {
    let h = Harness::with_network(ScriptedConnector::default()).await;
    let mut node = h.node("demo-node-0", NodeRole::Worker);
    h.reconciler.create(&h.cluster, &mut node).await.unwrap();
    node.status.instance_id = None;

    assert_eq!(h.reconciler.delete(&h.cluster, &mut node).await.unwrap(), Action::Done);
    assert!(h.provider.instances().await.is_empty());

    let mut stranger = h.node("never-deployed", NodeRole::Worker);
    assert_eq!(h.reconciler.delete(&h.cluster, &mut stranger).await.unwrap(), Action::Done);
    assert_eq!(h.provider.calls().destroy_instance, 1);
}

#[tokio::test]
async fn test_deploy_call_error_leaves_node_retryable() {
    let h = Harness::with_network(ScriptedConnector::default()).await;
    h.provider.fail_next_calls(1).await;
    let mut node = h.node("demo-master-0", NodeRole::ControlPlane);

    let err = h.reconciler.create(&h.cluster, &mut node).await.unwrap_err();
    assert!(err.is_retryable(), "{err}");
    assert_eq!(node.status.phase, Phase::None);
    assert!(node.status.pending_job.is_none());
    assert!(node.status.instance_id.is_none());
    assert!(!h.reconciler.exists(&h.cluster, &node).await.unwrap());

    assert_eq!(h.reconciler.update(&h.cluster, &mut node).await.unwrap(), Action::Done);
    assert_eq!(node.status.phase, Phase::Pending);
    assert_eq!(h.provider.calls().deploy_instance, 2);
    assert_eq!(h.provider.instances().await.len(), 1);
}

#[tokio::test]
async fn test_destroy_call_error_is_not_reported_done() {
    let h = Harness::with_network(ScriptedConnector::default()).await;
    let mut node = h.node("demo-node-0", NodeRole::Worker);
    h.reconciler.create(&h.cluster, &mut node).await.unwrap();
    let id = node.status.instance_id;
    h.provider.fail_next_calls(1).await;

    let err = h.reconciler.delete(&h.cluster, &mut node).await.unwrap_err();
    assert!(err.is_retryable(), "{err}");
    assert_eq!(node.status.phase, Phase::Pending);
    assert!(node.status.pending_job.is_none());
    assert_eq!(node.status.instance_id, id);
    assert_eq!(h.provider.instances().await.len(), 1);

    assert_eq!(h.reconciler.delete(&h.cluster, &mut node).await.unwrap(), Action::Done);
    assert!(h.provider.instances().await.is_empty());
    assert_eq!(h.provider.calls().destroy_instance, 2);
}

#[tokio::test]
async fn test_failed_destroy_job_then_call_error_destroys_again() {
    let h = Harness::with_network(ScriptedConnector::default()).await;
    let mut node = h.node("demo-node-0", NodeRole::Worker);
    h.reconciler.create(&h.cluster, &mut node).await.unwrap();
    h.provider.set_async_jobs(0).await;
    h.provider.fail_next_jobs(1).await;

    assert_eq!(h.reconciler.delete(&h.cluster, &mut node).await.unwrap(), TWO_SECONDS);
    assert_eq!(node.status.phase, Phase::Deleting);

    h.provider.fail_next_calls(1).await;
    assert!(h.reconciler.delete(&h.cluster, &mut node).await.is_err());
    assert_eq!(node.status.phase, Phase::Deleting);
    assert!(node.status.pending_job.is_none());
    assert!(node.status.instance_id.is_some());
    assert!(node.status.last_error.is_some());
    assert_eq!(h.provider.instances().await.len(), 1);

    assert_eq!(h.reconciler.delete(&h.cluster, &mut node).await.unwrap(), TWO_SECONDS);
    assert_eq!(h.reconciler.delete(&h.cluster, &mut node).await.unwrap(), Action::Done);
    assert!(h.provider.instances().await.is_empty());
    assert_eq!(h.provider.calls().destroy_instance, 3);
}

#[tokio::test]
async fn test_delete_while_booting_waits_for_deploy() {
    let h = Harness::with_network(ScriptedConnector::default()).await;
    h.provider.set_async_jobs(2).await;
    let mut node = h.node("demo-node-0", NodeRole::Worker);
    h.reconciler.create(&h.cluster, &mut node).await.unwrap();
    let deploy_job = node.status.pending_job;

    assert_eq!(h.reconciler.delete(&h.cluster, &mut node).await.unwrap(), TWO_SECONDS);
    assert_eq!(node.status.phase, Phase::Booting);
    assert_eq!(node.status.pending_job, deploy_job);
    assert_eq!(h.provider.calls().destroy_instance, 0);

    let mut done = false;
    for _ in 0..10 {
        if h.reconciler.delete(&h.cluster, &mut node).await.unwrap() == Action::Done {
            done = true;
            break;
        }
    }
    assert!(done, "delete never finished: {:?}", node.status);
    assert_eq!(h.provider.calls().destroy_instance, 1);
    assert!(h.provider.instances().await.is_empty());
    assert!(!h.reconciler.exists(&h.cluster, &node).await.unwrap());
}

#[tokio::test]
async fn test_delete_after_failed_deploy_job_has_nothing_to_destroy() {
    let h = Harness::with_network(ScriptedConnector::default()).await;
    h.provider.set_async_jobs(0).await;
    h.provider.fail_next_jobs(1).await;
    let mut node = h.node("demo-node-0", NodeRole::Worker);
    h.reconciler.create(&h.cluster, &mut node).await.unwrap();

    assert_eq!(h.reconciler.delete(&h.cluster, &mut node).await.unwrap(), Action::Done);
    assert_eq!(h.provider.calls().destroy_instance, 0);
    assert!(h.provider.instances().await.is_empty());
}

#[tokio::test]
async fn test_delete_finds_starting_instance_by_name() {
    let h = Harness::with_network(ScriptedConnector::default()).await;
    h.provider.set_async_jobs(0).await;
    let mut node = h.node("demo-node-0", NodeRole::Worker);
    h.reconciler.create(&h.cluster, &mut node).await.unwrap();
    let deploy_job = node.status.pending_job.take().unwrap();
    node.status.phase = Phase::None;

    assert!(h.reconciler.exists(&h.cluster, &node).await.unwrap());
    assert_eq!(h.reconciler.delete(&h.cluster, &mut node).await.unwrap(), TWO_SECONDS);
    assert_eq!(node.status.phase, Phase::Deleting);
    assert_eq!(h.reconciler.delete(&h.cluster, &mut node).await.unwrap(), Action::Done);

    assert!(matches!(
        h.provider.poll_async_job(deploy_job).await.unwrap(),
        JobOutcome::Failed(_)
    ));
    assert!(h.provider.instances().await.is_empty());
}

#[tokio::test]
async fn test_cluster_comes_up() {
    let h = Harness::with_network(ScriptedConnector::default()).await;
    h.provider.set_async_jobs(1).await;

    let mut master = h.node("demo-master-0", NodeRole::ControlPlane);
    h.drive(&mut master, |n| n.status.phase == Phase::Ready).await;
    let master_ip = h.reconciler.address(&master).unwrap().to_string();

    let mut worker = h.node("demo-node-0", NodeRole::Worker);
    h.drive(&mut worker, |n| n.status.phase == Phase::Ready).await;
    let worker_ip = h.reconciler.address(&worker).unwrap().to_string();

    let commands = h.connector.commands();
    assert!(commands.iter().any(|(host, cmd)| host == &master_ip
        && cmd == "sudo kubeadm token create --ttl 20m0s"));
    assert!(commands.iter().any(|(host, cmd)| host == &worker_ip
        && cmd.contains(&format!("--token {JOIN_TOKEN} {master_ip}:6443"))));
    assert_eq!(
        commands.iter().filter(|(host, _)| host == &worker_ip).count(),
        4
    );
    assert!(master.status.last_error.is_none());
}

#[tokio::test]
async fn test_worker_waits_for_control_plane() {
    let h = Harness::with_network(ScriptedConnector::default()).await;

    let mut master = h.node("demo-master-0", NodeRole::ControlPlane);
    h.reconciler.create(&h.cluster, &mut master).await.unwrap();
    h.nodes.put(&master).await;

    let mut worker = h.node("demo-node-0", NodeRole::Worker);
    h.reconciler.create(&h.cluster, &mut worker).await.unwrap();
    let action = h.reconciler.update(&h.cluster, &mut worker).await.unwrap();

    assert_eq!(action, ONE_SECOND);
    assert_eq!(worker.status.phase, Phase::Pending);
    assert!(h.connector.commands().is_empty());
}

#[tokio::test]
async fn test_step_failure_is_recorded_and_retried() {
    let h = Harness::with_network(ScriptedConnector::failing_on("docker-ce=")).await;
    let mut master = h.node("demo-master-0", NodeRole::ControlPlane);

    h.drive(&mut master, |n| n.status.phase == Phase::Failure).await;
    let error = master.status.last_error.clone().unwrap();
    assert!(error.contains("Docker Engine installation"), "{error}");

    let action = h.reconciler.update(&h.cluster, &mut master).await.unwrap();
    assert_eq!(action, TEN_SECONDS);
    assert_eq!(master.status.phase, Phase::Pending);
}

#[tokio::test]
async fn test_in_flight_provisioning_is_not_dispatched_twice() {
    let (connector, gate) = ScriptedConnector::gated();
    let h = Harness::with_network(connector).await;
    let mut master = h.node("demo-master-0", NodeRole::ControlPlane);
    h.reconciler.create(&h.cluster, &mut master).await.unwrap();

    assert_eq!(h.reconciler.update(&h.cluster, &mut master).await.unwrap(), TEN_SECONDS);
    assert_eq!(h.reconciler.update(&h.cluster, &mut master).await.unwrap(), TEN_SECONDS);
    assert_eq!(master.status.phase, Phase::Pending);

    gate.add_permits(64);
    h.drive(&mut master, |n| n.status.phase == Phase::Ready).await;
    assert_eq!(h.connector.commands().len(), 4);
}

#[tokio::test]
async fn test_delete_cancels_provisioning() {
    let (connector, gate) = ScriptedConnector::gated();
    let h = Harness::with_network(connector).await;
    let mut master = h.node("demo-master-0", NodeRole::ControlPlane);
    h.reconciler.create(&h.cluster, &mut master).await.unwrap();
    h.reconciler.update(&h.cluster, &mut master).await.unwrap();

    assert_eq!(h.reconciler.delete(&h.cluster, &mut master).await.unwrap(), Action::Done);

    gate.add_permits(64);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.connector.commands().is_empty());
    assert_eq!(master.status.phase, Phase::Deleting);
    assert_eq!(h.reconciler.update(&h.cluster, &mut master).await.unwrap(), Action::Done);
}

#[tokio::test]
async fn test_kubeconfig_from_ready_control_plane() {
    let h = Harness::with_network(ScriptedConnector::default()).await;
    let mut master = h.node("demo-master-0", NodeRole::ControlPlane);
    h.drive(&mut master, |n| n.status.phase == Phase::Ready).await;

    h.reconciler.kubeconfig(&h.cluster, &master).await.unwrap();
    let commands = h.connector.commands();
    assert_eq!(
        commands.last().map(|(_, cmd)| cmd.as_str()),
        Some("sudo cat /etc/kubernetes/admin.conf")
    );
}

/// Small deterministic generator so failures replay
struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u64 {
        self.0 = self
            .0
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add(1_442_695_040_888_963_407);
        self.0 >> 33
    }
}

#[tokio::test]
async fn test_random_call_sequences_keep_node_consistent() {
    for seed in [1_u64, 7, 42, 1234] {
        let h = Harness::with_network(ScriptedConnector::default()).await;
        h.provider.set_async_jobs(1).await;
        let mut rng = Lcg(seed);
        let mut node = h.node("demo-master-0", NodeRole::ControlPlane);

        for _ in 0..150 {
            let action = match rng.next() % 3 {
                0 => h.reconciler.create(&h.cluster, &mut node).await,
                1 => h.reconciler.update(&h.cluster, &mut node).await,
                _ => h.reconciler.delete(&h.cluster, &mut node).await,
            };
            action.unwrap_or_else(|e| panic!("seed {seed}: {e}"));
            h.nodes.put(&node).await;

            assert!(Phase::ALL.contains(&node.status.phase));
            if matches!(node.status.phase, Phase::Pending | Phase::Ready | Phase::Failure) {
                assert!(node.status.instance_id.is_some(), "seed {seed}: {:?}", node.status);
            }
            let named = h
                .provider
                .instances()
                .await
                .into_iter()
                .filter(|vm| vm.name == node.name)
                .count();
            assert!(named <= 1, "seed {seed}: {named} instances");
            tokio::task::yield_now().await;
        }
    }
}
