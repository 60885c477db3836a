//! Provider client trait

use async_trait::async_trait;
use tracing::info;
use uuid::Uuid;

use crate::error::ProviderError;
use crate::types::{
    AsyncResult, DeployRequest, IngressRule, IngressRuleSpec, InstanceFilter, JobId, JobOutcome,
    SecurityGroup, ServiceOffering, Template, VirtualMachine, Zone,
};

/// Compute API of the cloud provider, one method per resource kind
///
/// Lookups by name fail with an error for which
/// [`ProviderError::is_not_found`] holds when nothing matches.
#[cfg_attr(any(test, feature = "mock"), mockall::automock)]
#[async_trait]
pub trait ProviderClient: Send + Sync {
    async fn get_zone(&self, name: &str) -> Result<Zone, ProviderError>;

    async fn get_template(&self, name: &str, zone_id: Uuid) -> Result<Template, ProviderError>;

    async fn get_service_offering(&self, name: &str) -> Result<ServiceOffering, ProviderError>;

    async fn get_security_group(&self, name: &str) -> Result<SecurityGroup, ProviderError>;

    async fn get_security_group_by_id(&self, id: Uuid) -> Result<SecurityGroup, ProviderError>;

    async fn create_security_group(&self, name: &str) -> Result<SecurityGroup, ProviderError>;

    /// Look a group up by name, creating it when the provider reports it missing
    async fn get_or_create_security_group(
        &self,
        name: &str,
    ) -> Result<SecurityGroup, ProviderError> {
        match self.get_security_group(name).await {
            Ok(group) => Ok(group),
            Err(e) if e.is_not_found() => {
                info!(group = %name, "security group not found, creating it");
                self.create_security_group(name).await
            }
            Err(e) => Err(e),
        }
    }

    /// Authorize one ingress rule, returning the rules the provider created for it
    async fn authorize_ingress(
        &self,
        group_id: Uuid,
        rule: &IngressRuleSpec,
    ) -> Result<Vec<IngressRule>, ProviderError>;

    async fn revoke_ingress(&self, rule_id: Uuid) -> Result<(), ProviderError>;

    async fn delete_security_group(&self, id: Uuid) -> Result<(), ProviderError>;

    async fn deploy_instance(
        &self,
        request: &DeployRequest,
    ) -> Result<AsyncResult<VirtualMachine>, ProviderError>;

    async fn destroy_instance(
        &self,
        id: Uuid,
    ) -> Result<AsyncResult<VirtualMachine>, ProviderError>;

    async fn poll_async_job(&self, job: JobId)
    -> Result<JobOutcome<VirtualMachine>, ProviderError>;

    async fn list_instances(
        &self,
        filter: &InstanceFilter,
    ) -> Result<Vec<VirtualMachine>, ProviderError>;
}
