//! Remote executor and connector traits

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::credential::Credential;
use crate::error::ExecError;
use crate::result::{CommandResult, ConnectionInfo};

/// Callback fired before each connection retry
pub type RetryNotify = Arc<dyn Fn(&ExecError, Duration) + Send + Sync>;

/// An established session able to run shell commands
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Run a command and capture its output, whatever its exit status
    async fn run(&self, cmd: &str) -> Result<CommandResult, ExecError>;

    /// Run a command, failing if it does not finish within `timeout`
    async fn run_with_timeout(
        &self,
        cmd: &str,
        timeout: Duration,
    ) -> Result<CommandResult, ExecError>;

    /// Run a command within `timeout` and turn a non-zero exit status into
    /// `ExecError::CommandFailed`
    async fn run_checked(&self, cmd: &str, timeout: Duration) -> Result<CommandResult, ExecError> {
        let result = self.run_with_timeout(cmd, timeout).await?;
        if result.success() {
            Ok(result)
        } else {
            Err(ExecError::CommandFailed {
                status: result.status,
                stderr: result.stderr,
            })
        }
    }

    fn is_connected(&self) -> bool;

    fn executor_type(&self) -> &'static str;
}

/// Opens sessions to nodes
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connect and authenticate, retrying while the node is unreachable
    async fn connect(
        &self,
        target: &ConnectionInfo,
        credential: &Credential,
        notify: Option<RetryNotify>,
    ) -> Result<Arc<dyn RemoteExecutor>, ExecError>;
}
