//! In-memory provider
//!
//! Keeps a catalog of zones, templates and offerings plus the security groups
//! and instances created through it. Deploy and destroy can complete
//! synchronously or as jobs that stay pending for a configurable number of
//! polls, and jobs can be made to fail, so reconciler scenarios run without a
//! cloud account. An instance is listed in the `Starting` state from the
//! moment its deploy job is issued.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::error::{PARAM_ERROR_CODE, ProviderError};
use crate::traits::ProviderClient;
use crate::types::{
    AsyncResult, DeployRequest, IngressRule, IngressRuleSpec, InstanceFilter, JobId, JobOutcome,
    RuleSource, SecurityGroup, ServiceOffering, Template, VirtualMachine, Zone,
};

#[derive(Debug, Default)]
struct CallCounters {
    create_security_group: AtomicUsize,
    authorize_ingress: AtomicUsize,
    revoke_ingress: AtomicUsize,
    delete_security_group: AtomicUsize,
    deploy_instance: AtomicUsize,
    destroy_instance: AtomicUsize,
    poll_async_job: AtomicUsize,
}

/// Number of mutating calls made so far
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub create_security_group: usize,
    pub authorize_ingress: usize,
    pub revoke_ingress: usize,
    pub delete_security_group: usize,
    pub deploy_instance: usize,
    pub destroy_instance: usize,
    pub poll_async_job: usize,
}

#[derive(Debug, Clone)]
enum JobKind {
    Deploy(VirtualMachine),
    Destroy(VirtualMachine),
}

#[derive(Debug, Clone)]
struct Job {
    kind: JobKind,
    polls_left: u32,
    fail: bool,
}

#[derive(Debug, Default)]
struct State {
    zones: Vec<Zone>,
    templates: Vec<Template>,
    offerings: Vec<ServiceOffering>,
    groups: HashMap<Uuid, SecurityGroup>,
    instances: HashMap<Uuid, VirtualMachine>,
    jobs: HashMap<JobId, Job>,
    next_ip: u8,
    async_jobs: bool,
    job_polls: u32,
    fail_next_jobs: u32,
    fail_next_calls: u32,
    fail_revoke: bool,
    fail_group_delete: bool,
}

/// Provider backed by process memory
#[derive(Debug, Clone)]
pub struct InMemoryProvider {
    state: Arc<Mutex<State>>,
    calls: Arc<CallCounters>,
}

impl Default for InMemoryProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryProvider {
    /// Empty provider whose jobs complete synchronously
    #[must_use]
    pub fn new() -> Self {
        Self::from_state(State::default())
    }

    /// Provider with one zone, one template and one offering
    #[must_use]
    pub fn with_catalog(zone: &str, template: &str, offering: &str) -> Self {
        let zone_id = Uuid::new_v4();
        Self::from_state(State {
            zones: vec![Zone {
                id: zone_id,
                name: zone.to_string(),
            }],
            templates: vec![Template {
                id: Uuid::new_v4(),
                name: template.to_string(),
                zone_id,
                username: Some("ubuntu".to_string()),
                password_enabled: true,
            }],
            offerings: vec![ServiceOffering {
                id: Uuid::new_v4(),
                name: offering.to_string(),
                cpu: 2,
                memory_mb: 4096,
            }],
            ..State::default()
        })
    }

    fn from_state(state: State) -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                next_ip: 10,
                ..state
            })),
            calls: Arc::new(CallCounters::default()),
        }
    }

    /// Make deploy and destroy return pending jobs that complete after
    /// `polls` pending answers
    pub async fn set_async_jobs(&self, polls: u32) {
        let mut state = self.state.lock().await;
        state.async_jobs = true;
        state.job_polls = polls;
    }

    /// Make the next `count` jobs fail
    pub async fn fail_next_jobs(&self, count: u32) {
        self.state.lock().await.fail_next_jobs = count;
    }

    /// Make the next `count` deploy or destroy calls fail before reaching
    /// the API
    pub async fn fail_next_calls(&self, count: u32) {
        self.state.lock().await.fail_next_calls = count;
    }

    pub async fn fail_revoke(&self, fail: bool) {
        self.state.lock().await.fail_revoke = fail;
    }

    pub async fn fail_group_delete(&self, fail: bool) {
        self.state.lock().await.fail_group_delete = fail;
    }

    /// Snapshot of the call counters
    #[must_use]
    pub fn calls(&self) -> CallCounts {
        let c = &self.calls;
        let load = |counter: &AtomicUsize| counter.load(Ordering::SeqCst);
        CallCounts {
            create_security_group: load(&c.create_security_group),
            authorize_ingress: load(&c.authorize_ingress),
            revoke_ingress: load(&c.revoke_ingress),
            delete_security_group: load(&c.delete_security_group),
            deploy_instance: load(&c.deploy_instance),
            destroy_instance: load(&c.destroy_instance),
            poll_async_job: load(&c.poll_async_job),
        }
    }

    /// Snapshot of all instances
    pub async fn instances(&self) -> Vec<VirtualMachine> {
        self.state.lock().await.instances.values().cloned().collect()
    }

    /// Snapshot of all security groups
    pub async fn security_groups(&self) -> Vec<SecurityGroup> {
        self.state.lock().await.groups.values().cloned().collect()
    }

    fn count(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::SeqCst);
    }
}

fn not_found(kind: &'static str, name: impl Into<String>) -> ProviderError {
    ProviderError::NotFound {
        kind,
        name: name.into(),
    }
}

impl State {
    fn take_failure(&mut self) -> bool {
        if self.fail_next_jobs > 0 {
            self.fail_next_jobs -= 1;
            true
        } else {
            false
        }
    }

    fn take_call_failure(&mut self) -> Result<(), ProviderError> {
        if self.fail_next_calls > 0 {
            self.fail_next_calls -= 1;
            return Err(ProviderError::Http("connection reset".to_string()));
        }
        Ok(())
    }

    fn issue(&mut self, kind: JobKind) -> Result<AsyncResult<VirtualMachine>, ProviderError> {
        let fail = self.take_failure();

        if !self.async_jobs {
            if fail {
                return Err(ProviderError::Api {
                    code: 530,
                    message: "job failed".to_string(),
                });
            }
            return Ok(AsyncResult::Done(self.complete(kind)));
        }

        if let JobKind::Deploy(vm) = &kind {
            let mut starting = vm.clone();
            starting.state = "Starting".to_string();
            self.instances.insert(starting.id, starting);
        }

        let job = JobId(Uuid::new_v4());
        self.jobs.insert(
            job,
            Job {
                kind,
                polls_left: self.job_polls,
                fail,
            },
        );
        Ok(AsyncResult::Pending(job))
    }

    fn complete(&mut self, kind: JobKind) -> VirtualMachine {
        match kind {
            JobKind::Deploy(vm) => {
                self.instances.insert(vm.id, vm.clone());
                vm
            }
            JobKind::Destroy(vm) => {
                self.instances.remove(&vm.id);
                vm
            }
        }
    }

    /// Outcome of a job that ran out of pending polls
    fn finish(&mut self, job: Job) -> JobOutcome<VirtualMachine> {
        match job.kind {
            JobKind::Deploy(vm) if job.fail => {
                // failed deploys are expunged
                self.instances.remove(&vm.id);
                JobOutcome::Failed("job failed".to_string())
            }
            JobKind::Deploy(vm) => match self.instances.get_mut(&vm.id) {
                Some(live) => {
                    live.state = "Running".to_string();
                    JobOutcome::Succeeded(live.clone())
                }
                None => JobOutcome::Failed(format!("instance {} destroyed while starting", vm.id)),
            },
            JobKind::Destroy(_) if job.fail => JobOutcome::Failed("job failed".to_string()),
            JobKind::Destroy(vm) => JobOutcome::Succeeded(self.complete(JobKind::Destroy(vm))),
        }
    }
}

#[async_trait]
impl ProviderClient for InMemoryProvider {
    async fn get_zone(&self, name: &str) -> Result<Zone, ProviderError> {
        let state = self.state.lock().await;
        state
            .zones
            .iter()
            .find(|z| z.name == name)
            .cloned()
            .ok_or_else(|| not_found("zone", name))
    }

    async fn get_template(&self, name: &str, zone_id: Uuid) -> Result<Template, ProviderError> {
        let state = self.state.lock().await;
        state
            .templates
            .iter()
            .find(|t| t.name == name && t.zone_id == zone_id)
            .cloned()
            .ok_or_else(|| not_found("template", name))
    }

    async fn get_service_offering(&self, name: &str) -> Result<ServiceOffering, ProviderError> {
        let state = self.state.lock().await;
        state
            .offerings
            .iter()
            .find(|o| o.name == name)
            .cloned()
            .ok_or_else(|| not_found("service offering", name))
    }

    async fn get_security_group(&self, name: &str) -> Result<SecurityGroup, ProviderError> {
        let state = self.state.lock().await;
        state
            .groups
            .values()
            .find(|g| g.name == name)
            .cloned()
            .ok_or_else(|| not_found("security group", name))
    }

    async fn get_security_group_by_id(&self, id: Uuid) -> Result<SecurityGroup, ProviderError> {
        let state = self.state.lock().await;
        state
            .groups
            .get(&id)
            .cloned()
            .ok_or_else(|| not_found("security group", id.to_string()))
    }

    async fn create_security_group(&self, name: &str) -> Result<SecurityGroup, ProviderError> {
        Self::count(&self.calls.create_security_group);
        let mut state = self.state.lock().await;
        if state.groups.values().any(|g| g.name == name) {
            return Err(ProviderError::Api {
                code: 437,
                message: format!("security group {name} already exists"),
            });
        }
        let group = SecurityGroup {
            id: Uuid::new_v4(),
            name: name.to_string(),
            ingress_rules: Vec::new(),
        };
        state.groups.insert(group.id, group.clone());
        debug!(group = %name, id = %group.id, "created security group");
        Ok(group)
    }

    async fn authorize_ingress(
        &self,
        group_id: Uuid,
        rule: &IngressRuleSpec,
    ) -> Result<Vec<IngressRule>, ProviderError> {
        Self::count(&self.calls.authorize_ingress);
        let mut state = self.state.lock().await;

        if let RuleSource::Groups(names) = &rule.source {
            for name in names {
                if !state.groups.values().any(|g| &g.name == name) {
                    return Err(ProviderError::from_api(
                        PARAM_ERROR_CODE,
                        format!("security group {name} does not exist"),
                    ));
                }
            }
        }

        let group = state
            .groups
            .get_mut(&group_id)
            .ok_or_else(|| ProviderError::from_api(PARAM_ERROR_CODE, group_id.to_string()))?;

        let created: Vec<IngressRule> = match &rule.source {
            RuleSource::Cidrs(cidrs) => cidrs
                .iter()
                .map(|cidr| IngressRule {
                    rule_id: Uuid::new_v4(),
                    protocol: rule.protocol,
                    ports: rule.ports,
                    cidr: Some(cidr.clone()),
                    security_group_name: None,
                })
                .collect(),
            RuleSource::Groups(names) => names
                .iter()
                .map(|name| IngressRule {
                    rule_id: Uuid::new_v4(),
                    protocol: rule.protocol,
                    ports: rule.ports,
                    cidr: None,
                    security_group_name: Some(name.clone()),
                })
                .collect(),
        };
        group.ingress_rules.extend(created.iter().cloned());
        Ok(created)
    }

    async fn revoke_ingress(&self, rule_id: Uuid) -> Result<(), ProviderError> {
        Self::count(&self.calls.revoke_ingress);
        let mut state = self.state.lock().await;
        if state.fail_revoke {
            return Err(ProviderError::Http("connection reset".to_string()));
        }
        let before: usize = state.groups.values().map(|g| g.ingress_rules.len()).sum();
        for group in state.groups.values_mut() {
            group.ingress_rules.retain(|r| r.rule_id != rule_id);
        }
        let after: usize = state.groups.values().map(|g| g.ingress_rules.len()).sum();
        if before == after {
            return Err(ProviderError::from_api(PARAM_ERROR_CODE, rule_id.to_string()));
        }
        Ok(())
    }

    async fn delete_security_group(&self, id: Uuid) -> Result<(), ProviderError> {
        Self::count(&self.calls.delete_security_group);
        let mut state = self.state.lock().await;
        if state.fail_group_delete {
            return Err(ProviderError::Http("connection reset".to_string()));
        }
        state
            .groups
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| ProviderError::from_api(PARAM_ERROR_CODE, id.to_string()))
    }

    async fn deploy_instance(
        &self,
        request: &DeployRequest,
    ) -> Result<AsyncResult<VirtualMachine>, ProviderError> {
        Self::count(&self.calls.deploy_instance);
        let mut state = self.state.lock().await;
        state.take_call_failure()?;

        let template = state
            .templates
            .iter()
            .find(|t| t.id == request.template_id)
            .cloned()
            .ok_or_else(|| ProviderError::from_api(PARAM_ERROR_CODE, "unknown template"))?;

        let host = state.next_ip;
        state.next_ip = state.next_ip.wrapping_add(1);

        let vm = VirtualMachine {
            id: Uuid::new_v4(),
            name: request.name.clone(),
            state: "Running".to_string(),
            ip: Some(IpAddr::V4(Ipv4Addr::new(192, 0, 2, host))),
            ip6: None,
            password: template
                .password_enabled
                .then(|| format!("pw-{}", &Uuid::new_v4().simple().to_string()[..8])),
            template_id: Some(request.template_id),
            zone_id: Some(request.zone_id),
            service_offering_id: Some(request.service_offering_id),
        };
        state.issue(JobKind::Deploy(vm))
    }

    async fn destroy_instance(
        &self,
        id: Uuid,
    ) -> Result<AsyncResult<VirtualMachine>, ProviderError> {
        Self::count(&self.calls.destroy_instance);
        let mut state = self.state.lock().await;
        state.take_call_failure()?;
        let vm = state
            .instances
            .get(&id)
            .cloned()
            .ok_or_else(|| ProviderError::from_api(PARAM_ERROR_CODE, id.to_string()))?;
        state.issue(JobKind::Destroy(vm))
    }

    async fn poll_async_job(
        &self,
        job: JobId,
    ) -> Result<JobOutcome<VirtualMachine>, ProviderError> {
        Self::count(&self.calls.poll_async_job);
        let mut state = self.state.lock().await;

        let Some(entry) = state.jobs.get_mut(&job) else {
            return Err(ProviderError::from_api(PARAM_ERROR_CODE, job.to_string()));
        };
        if entry.polls_left > 0 {
            entry.polls_left -= 1;
            return Ok(JobOutcome::Pending);
        }

        let Some(entry) = state.jobs.remove(&job) else {
            return Ok(JobOutcome::Pending);
        };
        Ok(state.finish(entry))
    }

    async fn list_instances(
        &self,
        filter: &InstanceFilter,
    ) -> Result<Vec<VirtualMachine>, ProviderError> {
        let state = self.state.lock().await;
        Ok(state
            .instances
            .values()
            .filter(|vm| filter.matches(vm))
            .cloned()
            .collect())
    }
}
