//! exokube-exec: Remote session client
//!
//! Opens authenticated SSH sessions to freshly deployed nodes, retrying the
//! connection while the instance boots, and runs shell commands on them.

pub mod credential;
pub mod error;
pub mod result;
pub mod retry;
pub mod ssh;
pub mod traits;

pub use credential::{Credential, CredentialError, ResolvedCredential};
pub use error::ExecError;
pub use result::{CommandResult, ConnectionInfo};
pub use retry::{ConnectRetryPolicy, retry_notify};
pub use ssh::{SshConnector, SshExecutor};
pub use traits::{Connector, RemoteExecutor, RetryNotify};
