//! Error types for exokube-exec

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur during remote execution
#[derive(Error, Debug, Clone)]
pub enum ExecError {
    /// Failed to connect to remote host
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Connection kept failing until the retry budget ran out
    #[error("unable to connect after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        /// Number of connection attempts made
        attempts: u32,
        /// Error reported by the final attempt
        last_error: String,
    },

    /// Authentication failed
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Command exited with a non-zero status
    #[error("command execution failed: {status} - {stderr}")]
    CommandFailed {
        /// Exit status code
        status: i32,
        /// Stderr output
        stderr: String,
    },

    /// Command timed out
    #[error("command timed out after {timeout:?}")]
    Timeout {
        /// Timeout duration that was exceeded
        timeout: Duration,
    },

    /// Credential could not be resolved or decoded
    #[error("credential error: {0}")]
    CredentialError(String),

    /// Protocol or I/O error while running a command
    #[error("I/O error: {0}")]
    IoError(String),

    /// Connection not established
    #[error("not connected")]
    NotConnected,
}

impl ExecError {
    /// Check if error is retryable
    ///
    /// Authentication failures are retried as well: the SSH daemon of a
    /// booting instance may accept TCP before cloud-init has installed the
    /// login credentials.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ExecError::ConnectionFailed(_)
                | ExecError::AuthenticationFailed(_)
                | ExecError::Timeout { .. }
        )
    }

    /// Captured stderr, if the error carries any
    #[must_use]
    pub fn stderr(&self) -> Option<&str> {
        match self {
            ExecError::CommandFailed { stderr, .. } => Some(stderr),
            _ => None,
        }
    }
}
