//! SSH command execution using russh crate

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use russh::keys::PrivateKeyWithHashAlg;
use russh::keys::ssh_key;
use russh::{ChannelMsg, Disconnect, client};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, error, info, instrument};

use crate::credential::{Credential, ResolvedCredential};
use crate::error::ExecError;
use crate::result::{CommandResult, ConnectionInfo};
use crate::retry::{ConnectRetryPolicy, retry_notify};
use crate::traits::{Connector, RemoteExecutor, RetryNotify};

/// Bound on a single TCP connect + handshake attempt
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// SSH client handler for russh
#[derive(Debug)]
struct SshClientHandler;

impl client::Handler for SshClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &ssh_key::PublicKey,
    ) -> Result<bool, Self::Error> {
        // Nodes are created by us moments before the first connection, there
        // is no known host key to compare against.
        Ok(true)
    }
}

/// SSH command executor
///
/// Holds one authenticated session to a node. Commands run on fresh
/// channels of that session.
pub struct SshExecutor {
    /// Connection configuration
    conn_info: ConnectionInfo,
    /// Credential presented to the server
    credential: ResolvedCredential,
    /// SSH session (initialized on connect)
    session: Mutex<Option<client::Handle<SshClientHandler>>>,
}

impl std::fmt::Debug for SshExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshExecutor")
            .field("conn_info", &self.conn_info)
            .field("credential", &self.credential)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

impl SshExecutor {
    /// Create a new SSH executor
    ///
    /// # Errors
    /// Returns `ExecError::CredentialError` if the credential cannot be resolved
    pub fn new(conn_info: ConnectionInfo, credential: &Credential) -> Result<Self, ExecError> {
        let credential = credential
            .resolve()
            .map_err(|e| ExecError::CredentialError(e.to_string()))?;

        Ok(Self {
            conn_info,
            credential,
            session: Mutex::new(None),
        })
    }

    /// Get connection info
    pub fn connection_info(&self) -> &ConnectionInfo {
        &self.conn_info
    }

    /// Connect, retrying according to `policy` while the node is unreachable
    ///
    /// # Errors
    /// Returns `ExecError::RetriesExhausted` once the budget is spent, or the
    /// first non-retryable error
    pub async fn connect_with_retry(
        &self,
        policy: &ConnectRetryPolicy,
        notify: Option<RetryNotify>,
    ) -> Result<(), ExecError> {
        retry_notify(
            policy,
            || self.connect(),
            |err, delay| {
                if let Some(notify) = &notify {
                    notify(err, delay);
                }
            },
        )
        .await
    }

    /// Connect to the remote host (single attempt)
    #[instrument(skip(self), fields(host = %self.conn_info.host))]
    async fn connect(&self) -> Result<(), ExecError> {
        let mut session_lock = self.session.lock().await;

        if session_lock.is_some() {
            return Ok(());
        }

        info!(
            host = %self.conn_info.host,
            port = self.conn_info.port,
            user = %self.conn_info.user,
            "connecting to SSH"
        );

        let config = Arc::new(client::Config::default());

        let connect = client::connect(
            config,
            (&self.conn_info.host[..], self.conn_info.port),
            SshClientHandler,
        );
        let mut session = timeout(CONNECT_TIMEOUT, connect)
            .await
            .map_err(|_| ExecError::Timeout {
                timeout: CONNECT_TIMEOUT,
            })?
            .map_err(|e| ExecError::ConnectionFailed(e.to_string()))?;

        let auth_res = match &self.credential {
            ResolvedCredential::Password(password) => session
                .authenticate_password(&self.conn_info.user, password)
                .await
                .map_err(|e| ExecError::AuthenticationFailed(e.to_string()))?,
            ResolvedCredential::Key(key) => {
                let hash_alg = session
                    .best_supported_rsa_hash()
                    .await
                    .ok()
                    .flatten()
                    .flatten();
                session
                    .authenticate_publickey(
                        &self.conn_info.user,
                        PrivateKeyWithHashAlg::new(key.clone(), hash_alg),
                    )
                    .await
                    .map_err(|e| ExecError::AuthenticationFailed(e.to_string()))?
            }
        };

        if !auth_res.success() {
            return Err(ExecError::AuthenticationFailed(format!(
                "server rejected credentials for {}",
                self.conn_info.user
            )));
        }

        info!(host = %self.conn_info.host, "SSH connected and authenticated");

        *session_lock = Some(session);
        Ok(())
    }

    /// Execute command on remote host
    #[instrument(skip(self, cmd), fields(host = %self.conn_info.host))]
    async fn execute_remote(&self, cmd: &str) -> Result<CommandResult, ExecError> {
        let mut session_lock = self.session.lock().await;

        let session = session_lock.as_mut().ok_or(ExecError::NotConnected)?;

        debug!(command = %cmd, "executing remote command");

        let start = Instant::now();

        let mut channel = session
            .channel_open_session()
            .await
            .map_err(|e| ExecError::IoError(e.to_string()))?;

        channel
            .exec(true, cmd)
            .await
            .map_err(|e| ExecError::IoError(e.to_string()))?;

        let mut status = None;
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();

        // exit-status may arrive after EOF, drain until the channel closes
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { data } => stdout.extend_from_slice(&data),
                ChannelMsg::ExtendedData { data, ext: 1 } => stderr.extend_from_slice(&data),
                ChannelMsg::ExitStatus { exit_status } => {
                    status = Some(exit_status.cast_signed());
                }
                _ => {}
            }
        }

        let duration = start.elapsed();
        let stdout = String::from_utf8_lossy(&stdout).to_string();
        let stderr = String::from_utf8_lossy(&stderr).to_string();

        let Some(status) = status else {
            return Err(ExecError::IoError(format!(
                "channel closed without exit status: {stderr}"
            )));
        };

        debug!(
            status = status,
            duration = ?duration,
            "remote command completed"
        );

        Ok(CommandResult {
            status,
            stdout,
            stderr,
            duration,
        })
    }

    /// Disconnect from remote host
    ///
    /// # Errors
    /// Returns `ExecError::IoError` if disconnection fails
    pub async fn disconnect(&self) -> Result<(), ExecError> {
        let mut session_lock = self.session.lock().await;

        if let Some(session) = session_lock.take() {
            session
                .disconnect(Disconnect::ByApplication, "", "English")
                .await
                .map_err(|e| ExecError::IoError(e.to_string()))?;
            info!(host = %self.conn_info.host, "SSH disconnected");
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    #[instrument(skip(self, cmd), fields(host = %self.conn_info.host))]
    async fn run(&self, cmd: &str) -> Result<CommandResult, ExecError> {
        self.connect().await?;
        self.execute_remote(cmd).await
    }

    #[instrument(skip(self, cmd), fields(host = %self.conn_info.host))]
    async fn run_with_timeout(
        &self,
        cmd: &str,
        timeout_duration: Duration,
    ) -> Result<CommandResult, ExecError> {
        let start = Instant::now();

        // connection time does not count against the command timeout
        self.connect().await?;

        match timeout(timeout_duration, self.execute_remote(cmd)).await {
            Ok(result) => result,
            Err(_) => {
                error!(
                    timeout = ?timeout_duration,
                    elapsed = ?start.elapsed(),
                    "command timed out"
                );
                Err(ExecError::Timeout {
                    timeout: timeout_duration,
                })
            }
        }
    }

    fn is_connected(&self) -> bool {
        // best effort, a busy lock means a command is running on a live session
        self.session
            .try_lock()
            .map(|s| s.is_some())
            .unwrap_or(true)
    }

    fn executor_type(&self) -> &'static str {
        "ssh"
    }
}

/// `Connector` producing SSH sessions
#[derive(Debug, Clone, Default)]
pub struct SshConnector {
    policy: ConnectRetryPolicy,
}

impl SshConnector {
    /// Create a connector with the given retry policy
    #[must_use]
    pub fn new(policy: ConnectRetryPolicy) -> Self {
        Self { policy }
    }

    /// Retry policy applied to every connection
    #[must_use]
    pub fn policy(&self) -> &ConnectRetryPolicy {
        &self.policy
    }
}

#[async_trait]
impl Connector for SshConnector {
    async fn connect(
        &self,
        target: &ConnectionInfo,
        credential: &Credential,
        notify: Option<RetryNotify>,
    ) -> Result<Arc<dyn RemoteExecutor>, ExecError> {
        let executor = SshExecutor::new(target.clone(), credential)?;
        executor.connect_with_retry(&self.policy, notify).await?;
        Ok(Arc::new(executor))
    }
}
