//! Async job poller
//!
//! Deploy and destroy either complete within the call or hand back a job.
//! The poller never loops: callers poll again on their next pass.

use std::sync::Arc;

use exokube_provider::{
    AsyncResult, DeployRequest, JobId, JobOutcome, ProviderClient, VirtualMachine,
};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::error::CoreError;

/// Issues instance jobs and polls them
#[derive(Clone)]
pub struct AsyncJobPoller {
    provider: Arc<dyn ProviderClient>,
}

impl AsyncJobPoller {
    #[must_use]
    pub fn new(provider: Arc<dyn ProviderClient>) -> Self {
        Self { provider }
    }

    /// Issue an instance deployment
    ///
    /// # Errors
    /// Returns the provider error if the call is rejected
    #[instrument(skip(self, request), fields(name = %request.name))]
    pub async fn deploy(
        &self,
        request: &DeployRequest,
    ) -> Result<AsyncResult<VirtualMachine>, CoreError> {
        let result = self.provider.deploy_instance(request).await?;
        log_issued("deploy", &result);
        Ok(result)
    }

    /// Issue an instance destruction
    ///
    /// # Errors
    /// Returns the provider error if the call is rejected
    #[instrument(skip(self))]
    pub async fn destroy(&self, id: Uuid) -> Result<AsyncResult<VirtualMachine>, CoreError> {
        let result = self.provider.destroy_instance(id).await?;
        log_issued("destroy", &result);
        Ok(result)
    }

    /// Poll a job once
    ///
    /// # Errors
    /// Returns the provider error if the job cannot be queried
    #[instrument(skip(self))]
    pub async fn poll(&self, job: JobId) -> Result<JobOutcome<VirtualMachine>, CoreError> {
        let outcome = self.provider.poll_async_job(job).await?;
        match &outcome {
            JobOutcome::Pending => debug!(%job, "job pending"),
            JobOutcome::Succeeded(vm) => info!(%job, instance = %vm.id, "job succeeded"),
            JobOutcome::Failed(reason) => warn!(%job, %reason, "job failed"),
        }
        Ok(outcome)
    }
}

fn log_issued(operation: &str, result: &AsyncResult<VirtualMachine>) {
    match result {
        AsyncResult::Done(vm) => info!(operation, instance = %vm.id, "completed synchronously"),
        AsyncResult::Pending(job) => info!(operation, %job, "job issued"),
    }
}
