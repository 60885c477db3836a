//! Core error types for exokube-core

use exokube_exec::ExecError;
use exokube_provider::ProviderError;
use thiserror::Error;

/// Errors surfaced by the reconcilers
#[derive(Error, Debug)]
pub enum CoreError {
    /// Provider call failed
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    /// Remote session failed
    #[error("remote execution error: {0}")]
    Exec(#[from] ExecError),

    /// Role label missing or not one of the known values
    #[error("node {node}: invalid role label {value:?}")]
    InvalidRole {
        /// Node name
        node: String,
        /// Label value found, if any
        value: Option<String>,
    },

    /// The cluster does not have exactly one control-plane node
    #[error("cluster {cluster}: expected exactly 1 control-plane node, found {count}")]
    ControlPlaneCount {
        /// Cluster name
        cluster: String,
        /// Control-plane nodes found
        count: usize,
    },

    /// More than one instance carries the node's name
    #[error("node {node}: {count} instances share this name")]
    DuplicateInstances {
        /// Node name
        node: String,
        /// Instances found
        count: usize,
    },

    /// The provider returned an instance other than the one already recorded
    #[error("node {node}: instance {found} does not match recorded instance {recorded}")]
    InstanceConflict {
        /// Node name
        node: String,
        /// Instance already recorded in status
        recorded: uuid::Uuid,
        /// Instance returned by the provider
        found: uuid::Uuid,
    },

    /// No address known for the node
    #[error("node {0}: no address")]
    NoAddress(String),

    /// No password or identity file to log in with
    #[error("node {0}: no login credential")]
    NoCredential(String),

    /// Operation needs a ready control-plane node
    #[error("node {node} is not a ready control-plane node")]
    NotReadyControlPlane {
        /// Node name
        node: String,
    },

    /// Bootstrap template could not be rendered
    #[error("step {step:?}: template error: {message}")]
    Template {
        /// Step name
        step: String,
        /// Rendering error
        message: String,
    },

    /// A bootstrap step exited non-zero or could not run
    #[error("step {step:?} failed: {stderr}")]
    StepFailed {
        /// Step name
        step: String,
        /// Captured stderr, or the session error
        stderr: String,
    },

    /// Actor communication error
    #[error("actor communication error: {0}")]
    ActorError(String),
}

impl CoreError {
    /// Name of the bootstrap step this error belongs to, if any
    #[must_use]
    pub fn step(&self) -> Option<&str> {
        match self {
            CoreError::Template { step, .. } | CoreError::StepFailed { step, .. } => Some(step),
            _ => None,
        }
    }

    /// Whether the same call may succeed later without any change to the node
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            CoreError::Provider(e) => e.is_retryable(),
            CoreError::Exec(e) => e.is_retryable(),
            _ => false,
        }
    }
}
