//! HTTP client for the Exoscale/CloudStack compute API
//!
//! Every call is a signed GET. Responses are wrapped in a
//! `<command>response` object which carries either the payload or an
//! `errorcode`/`errortext` pair. Short jobs (ingress authorize/revoke) are
//! awaited here; instance deploy/destroy jobs are handed back as pending.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::config::ProviderConfig;
use crate::error::ProviderError;
use crate::signing::{canonical_query, encode, sign};
use crate::traits::ProviderClient;
use crate::types::{
    AsyncResult, DeployRequest, IngressRule, IngressRuleSpec, InstanceFilter, JobId, JobOutcome,
    RuleSource, SecurityGroup, ServiceOffering, Template, VirtualMachine, Zone,
};
use crate::wire::{
    AsyncReply, JOB_PENDING, JOB_SUCCEEDED, JobStatus, ListSecurityGroups, ListServiceOfferings,
    ListTemplates, ListVirtualMachines, ListZones, SecurityGroupEnvelope, VirtualMachineEnvelope,
    WireError,
};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const SIGNATURE_TTL_MINUTES: i64 = 10;

/// How long short jobs are awaited inside the client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct JobWait {
    interval: Duration,
    max_polls: u32,
}

impl Default for JobWait {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            max_polls: 60,
        }
    }
}

/// Signed compute API client
pub struct CloudStackClient {
    http: reqwest::Client,
    config: ProviderConfig,
    job_wait: JobWait,
}

impl std::fmt::Debug for CloudStackClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudStackClient")
            .field("config", &self.config)
            .field("job_wait", &self.job_wait)
            .finish_non_exhaustive()
    }
}

impl CloudStackClient {
    /// Create a client for the resolved endpoint
    ///
    /// # Errors
    /// Returns `ProviderError::Http` if the HTTP client cannot be built
    pub fn new(config: ProviderConfig) -> Result<Self, ProviderError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("exokube/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            http,
            config,
            job_wait: JobWait::default(),
        })
    }

    /// Build the signed URL of a command
    fn signed_url(
        &self,
        command: &str,
        params: &[(&str, String)],
        now: DateTime<Utc>,
    ) -> Result<String, ProviderError> {
        let query = signed_query(
            &self.config.api_key,
            &self.config.api_secret,
            command,
            params,
            now,
        )?;
        Ok(format!("{}?{query}", self.config.endpoint.trim_end_matches('/')))
    }

    /// Issue a command and decode its unwrapped payload
    #[instrument(skip(self, params), fields(endpoint = %self.config.endpoint))]
    async fn request<T: DeserializeOwned>(
        &self,
        command: &str,
        params: &[(&str, String)],
    ) -> Result<T, ProviderError> {
        let url = self.signed_url(command, params, Utc::now())?;
        let response = self.http.get(&url).send().await?;
        let status = response.status();
        let body = response.text().await?;
        debug!(command, status = %status, bytes = body.len(), "API response");

        let value: Value = match serde_json::from_str(&body) {
            Ok(v) => v,
            Err(_) if !status.is_success() => {
                return Err(ProviderError::Api {
                    code: status.as_u16(),
                    message: body,
                });
            }
            Err(e) => return Err(e.into()),
        };

        let payload = unwrap_envelope(command, value)?;
        Ok(serde_json::from_value(payload)?)
    }

    async fn request_async(
        &self,
        command: &str,
        params: &[(&str, String)],
    ) -> Result<JobId, ProviderError> {
        let reply: AsyncReply = self.request(command, params).await?;
        Ok(JobId(reply.jobid))
    }

    async fn query_job(&self, job: JobId) -> Result<JobStatus, ProviderError> {
        self.request("queryAsyncJobResult", &[("jobid", job.to_string())])
            .await
    }

    /// Await a short job, returning its result payload
    #[instrument(skip(self))]
    async fn wait_job(&self, job: JobId) -> Result<Value, ProviderError> {
        for poll in 0..self.job_wait.max_polls {
            let status = self.query_job(job).await?;
            match status.jobstatus {
                JOB_PENDING => {
                    debug!(%job, poll, "job still running");
                    tokio::time::sleep(self.job_wait.interval).await;
                }
                JOB_SUCCEEDED => return Ok(status.jobresult.unwrap_or(Value::Null)),
                _ => {
                    return Err(ProviderError::Api {
                        code: u16::try_from(status.jobresultcode).unwrap_or(0),
                        message: status.failure_text(),
                    });
                }
            }
        }
        Err(ProviderError::Api {
            code: 0,
            message: format!(
                "job {job} still running after {} polls",
                self.job_wait.max_polls
            ),
        })
    }
}

/// Query string with authentication, expiry and signature appended
fn signed_query(
    api_key: &str,
    secret: &str,
    command: &str,
    params: &[(&str, String)],
    now: DateTime<Utc>,
) -> Result<String, ProviderError> {
    let expires = now + chrono::Duration::minutes(SIGNATURE_TTL_MINUTES);

    let mut all: BTreeMap<String, String> = params
        .iter()
        .map(|(k, v)| ((*k).to_string(), v.clone()))
        .collect();
    all.insert("command".into(), command.to_string());
    all.insert("apikey".into(), api_key.to_string());
    all.insert("response".into(), "json".into());
    all.insert("signatureversion".into(), "3".into());
    all.insert(
        "expires".into(),
        expires.format("%Y-%m-%dT%H:%M:%S%z").to_string(),
    );

    let query = canonical_query(&all);
    let signature = sign(&query, secret)?;
    Ok(format!("{query}&signature={}", encode(&signature)))
}

/// Strip the `<command>response` wrapper, turning an error body into an error
fn unwrap_envelope(command: &str, mut body: Value) -> Result<Value, ProviderError> {
    let key = format!("{}response", command.to_lowercase());
    let inner = body
        .get_mut(&key)
        .map(Value::take)
        .or_else(|| body.get_mut("errorresponse").map(Value::take))
        .ok_or_else(|| ProviderError::Decode(format!("missing {key} in response")))?;

    if inner.get("errorcode").is_some() {
        let err: WireError = serde_json::from_value(inner)?;
        return Err(ProviderError::from_api(err.errorcode, err.errortext));
    }
    Ok(inner)
}

/// Exactly one item named `name`, by exact comparison
fn exactly_one<T>(
    kind: &'static str,
    name: &str,
    items: Vec<T>,
    name_of: impl Fn(&T) -> &str,
) -> Result<T, ProviderError> {
    let mut matches: Vec<T> = items.into_iter().filter(|i| name_of(i) == name).collect();
    match matches.len() {
        0 => Err(ProviderError::NotFound {
            kind,
            name: name.to_string(),
        }),
        1 => Ok(matches.remove(0)),
        count => Err(ProviderError::Ambiguous {
            kind,
            name: name.to_string(),
            count,
        }),
    }
}

/// Parameters of `authorizeSecurityGroupIngress` for one rule
fn ingress_params(group_id: Uuid, rule: &IngressRuleSpec) -> Vec<(String, String)> {
    let mut params = vec![
        ("securitygroupid".to_string(), group_id.to_string()),
        ("protocol".to_string(), rule.protocol.as_str().to_string()),
        ("description".to_string(), rule.description.clone()),
    ];

    if rule.protocol.has_ports() {
        if let Some(ports) = rule.ports {
            params.push(("startport".into(), ports.start.to_string()));
            params.push(("endport".into(), ports.end.to_string()));
        }
    } else if rule.protocol == crate::types::Protocol::Icmp {
        params.push(("icmptype".into(), "-1".into()));
        params.push(("icmpcode".into(), "-1".into()));
    }

    match &rule.source {
        RuleSource::Cidrs(cidrs) => params.push(("cidrlist".into(), cidrs.join(","))),
        RuleSource::Groups(groups) => {
            for (i, group) in groups.iter().enumerate() {
                params.push((format!("usersecuritygrouplist[{i}].group"), group.clone()));
            }
        }
    }
    params
}

#[async_trait]
impl ProviderClient for CloudStackClient {
    #[instrument(skip(self))]
    async fn get_zone(&self, name: &str) -> Result<Zone, ProviderError> {
        let list: ListZones = self.request("listZones", &[("name", name.to_string())]).await?;
        exactly_one("zone", name, list.zone, |z| z.name.as_str()).map(Into::into)
    }

    #[instrument(skip(self))]
    async fn get_template(&self, name: &str, zone_id: Uuid) -> Result<Template, ProviderError> {
        let list: ListTemplates = self
            .request(
                "listTemplates",
                &[
                    ("templatefilter", "featured".to_string()),
                    ("zoneid", zone_id.to_string()),
                    ("name", name.to_string()),
                ],
            )
            .await?;

        let mut matches: Vec<Template> = list
            .template
            .into_iter()
            .filter(|t| t.name == name)
            .map(Into::into)
            .collect();
        if matches.len() > 1 {
            warn!(template = %name, count = matches.len(), "several templates match, using the first");
        }
        if matches.is_empty() {
            return Err(ProviderError::NotFound {
                kind: "template",
                name: name.to_string(),
            });
        }
        Ok(matches.remove(0))
    }

    #[instrument(skip(self))]
    async fn get_service_offering(&self, name: &str) -> Result<ServiceOffering, ProviderError> {
        let list: ListServiceOfferings = self
            .request("listServiceOfferings", &[("name", name.to_string())])
            .await?;
        exactly_one("service offering", name, list.serviceoffering, |o| o.name.as_str()).map(Into::into)
    }

    #[instrument(skip(self))]
    async fn get_security_group(&self, name: &str) -> Result<SecurityGroup, ProviderError> {
        let list: ListSecurityGroups = self
            .request(
                "listSecurityGroups",
                &[("securitygroupname", name.to_string())],
            )
            .await?;
        exactly_one("security group", name, list.securitygroup, |g| g.name.as_str()).map(Into::into)
    }

    #[instrument(skip(self))]
    async fn get_security_group_by_id(&self, id: Uuid) -> Result<SecurityGroup, ProviderError> {
        let list: ListSecurityGroups = self
            .request("listSecurityGroups", &[("id", id.to_string())])
            .await?;
        list.securitygroup
            .into_iter()
            .find(|g| g.id == id)
            .map(Into::into)
            .ok_or_else(|| ProviderError::NotFound {
                kind: "security group",
                name: id.to_string(),
            })
    }

    #[instrument(skip(self))]
    async fn create_security_group(&self, name: &str) -> Result<SecurityGroup, ProviderError> {
        let envelope: SecurityGroupEnvelope = self
            .request("createSecurityGroup", &[("name", name.to_string())])
            .await?;
        Ok(envelope.securitygroup.into())
    }

    #[instrument(skip(self, rule), fields(protocol = %rule.protocol, description = %rule.description))]
    async fn authorize_ingress(
        &self,
        group_id: Uuid,
        rule: &IngressRuleSpec,
    ) -> Result<Vec<IngressRule>, ProviderError> {
        let owned = ingress_params(group_id, rule);
        let params: Vec<(&str, String)> =
            owned.iter().map(|(k, v)| (k.as_str(), v.clone())).collect();

        let job = self
            .request_async("authorizeSecurityGroupIngress", &params)
            .await?;
        let result = self.wait_job(job).await?;
        let envelope: SecurityGroupEnvelope = serde_json::from_value(result)?;
        let group: SecurityGroup = envelope.securitygroup.into();

        Ok(group
            .ingress_rules
            .into_iter()
            .filter(|r| r.protocol == rule.protocol && r.ports == rule.ports)
            .collect())
    }

    #[instrument(skip(self))]
    async fn revoke_ingress(&self, rule_id: Uuid) -> Result<(), ProviderError> {
        let job = self
            .request_async("revokeSecurityGroupIngress", &[("id", rule_id.to_string())])
            .await?;
        self.wait_job(job).await.map(|_| ())
    }

    #[instrument(skip(self))]
    async fn delete_security_group(&self, id: Uuid) -> Result<(), ProviderError> {
        let _: Value = self
            .request("deleteSecurityGroup", &[("id", id.to_string())])
            .await?;
        Ok(())
    }

    #[instrument(skip(self, request), fields(name = %request.name))]
    async fn deploy_instance(
        &self,
        request: &DeployRequest,
    ) -> Result<AsyncResult<VirtualMachine>, ProviderError> {
        let mut params = vec![
            ("name", request.name.clone()),
            ("displayname", request.name.clone()),
            ("zoneid", request.zone_id.to_string()),
            ("templateid", request.template_id.to_string()),
            ("serviceofferingid", request.service_offering_id.to_string()),
            ("rootdisksize", request.root_disk_gb.to_string()),
        ];
        if let Some(key_pair) = &request.key_pair {
            params.push(("keypair", key_pair.clone()));
        }
        if !request.security_group_ids.is_empty() {
            let ids: Vec<String> = request
                .security_group_ids
                .iter()
                .map(Uuid::to_string)
                .collect();
            params.push(("securitygroupids", ids.join(",")));
        }
        if request.ipv6 {
            params.push(("ip6", "true".to_string()));
        }
        if let Some(user_data) = &request.user_data {
            params.push(("userdata", user_data.clone()));
        }

        let job = self.request_async("deployVirtualMachine", &params).await?;
        debug!(%job, "deploy job issued");
        Ok(AsyncResult::Pending(job))
    }

    #[instrument(skip(self))]
    async fn destroy_instance(
        &self,
        id: Uuid,
    ) -> Result<AsyncResult<VirtualMachine>, ProviderError> {
        let job = self
            .request_async("destroyVirtualMachine", &[("id", id.to_string())])
            .await?;
        debug!(%job, "destroy job issued");
        Ok(AsyncResult::Pending(job))
    }

    #[instrument(skip(self))]
    async fn poll_async_job(
        &self,
        job: JobId,
    ) -> Result<JobOutcome<VirtualMachine>, ProviderError> {
        let status = self.query_job(job).await?;
        match status.jobstatus {
            JOB_PENDING => Ok(JobOutcome::Pending),
            JOB_SUCCEEDED => {
                let result = status.jobresult.unwrap_or(Value::Null);
                let envelope: VirtualMachineEnvelope = serde_json::from_value(result)?;
                Ok(JobOutcome::Succeeded(envelope.virtualmachine.into()))
            }
            _ => Ok(JobOutcome::Failed(status.failure_text())),
        }
    }

    #[instrument(skip(self))]
    async fn list_instances(
        &self,
        filter: &InstanceFilter,
    ) -> Result<Vec<VirtualMachine>, ProviderError> {
        let mut params = Vec::new();
        if let Some(name) = &filter.name {
            params.push(("name", name.clone()));
        }
        if let Some(id) = filter.id {
            params.push(("id", id.to_string()));
        }

        let list: ListVirtualMachines = match self.request("listVirtualMachines", &params).await {
            Ok(list) => list,
            Err(e) if e.is_not_found() => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        Ok(list
            .virtualmachine
            .into_iter()
            .map(VirtualMachine::from)
            .filter(|vm| filter.matches(vm))
            .collect())
    }
}
