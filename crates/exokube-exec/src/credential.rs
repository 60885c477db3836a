//! Login credentials for remote sessions
//!
//! The caller decides which credential a node is reached with; the session
//! client only resolves and presents it.

use std::env;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use russh::keys::{PrivateKey, decode_secret_key, load_secret_key};
use tracing::debug;

/// Credential supplied by the caller
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    /// Password login (the provider generates one for password-enabled templates)
    Password(String),
    /// Private key read from a file
    KeyFile(PathBuf),
    /// Base64-encoded private key held in an environment variable
    KeyEnv(String),
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::Password(_) => f.write_str("Password(<redacted>)"),
            Credential::KeyFile(path) => f.debug_tuple("KeyFile").field(path).finish(),
            Credential::KeyEnv(var) => f.debug_tuple("KeyEnv").field(var).finish(),
        }
    }
}

impl Credential {
    /// Load the key material behind this credential
    ///
    /// # Errors
    /// Returns `CredentialError` if the key cannot be read or decoded
    pub fn resolve(&self) -> Result<ResolvedCredential, CredentialError> {
        match self {
            Credential::Password(password) => Ok(ResolvedCredential::Password(password.clone())),
            Credential::KeyFile(path) => {
                validate_key_permissions(path)?;
                let key = load_secret_key(path, None)
                    .map_err(|e| CredentialError::InvalidKey(e.to_string()))?;
                debug!(path = %path.display(), "loaded private key");
                Ok(ResolvedCredential::Key(Arc::new(key)))
            }
            Credential::KeyEnv(var_name) => {
                let encoded =
                    env::var(var_name).map_err(|_| CredentialError::EnvNotSet(var_name.clone()))?;
                let pem = base64_decode(&encoded).map_err(|_| CredentialError::InvalidBase64)?;
                let pem = String::from_utf8(pem).map_err(|_| CredentialError::InvalidBase64)?;
                let key = decode_secret_key(&pem, None)
                    .map_err(|e| CredentialError::InvalidKey(e.to_string()))?;
                debug!(var = %var_name, "decoded private key from environment");
                Ok(ResolvedCredential::Key(Arc::new(key)))
            }
        }
    }
}

/// Credential ready to be presented to the SSH server
#[derive(Clone)]
pub enum ResolvedCredential {
    /// Password authentication
    Password(String),
    /// Public key authentication
    Key(Arc<PrivateKey>),
}

impl fmt::Debug for ResolvedCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolvedCredential::Password(_) => f.write_str("Password(<redacted>)"),
            ResolvedCredential::Key(_) => f.write_str("Key(<redacted>)"),
        }
    }
}

/// Credential resolution errors
#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("environment variable {0} not set")]
    EnvNotSet(String),

    #[error("invalid base64 encoding")]
    InvalidBase64,

    #[error("key file permissions too open: {0} (should be 600)")]
    BadPermissions(String),

    #[error("key file not found: {0}")]
    NotFound(String),

    #[error("invalid private key: {0}")]
    InvalidKey(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn base64_decode(input: &str) -> Result<Vec<u8>, base64::DecodeError> {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.decode(input.trim())
}

fn validate_key_permissions(path: &Path) -> Result<(), CredentialError> {
    use std::os::unix::fs::PermissionsExt;

    let metadata = std::fs::metadata(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => CredentialError::NotFound(path.display().to_string()),
        _ => CredentialError::Io(e),
    })?;

    // group and other bits must be clear
    if metadata.permissions().mode() & 0o77 != 0 {
        return Err(CredentialError::BadPermissions(path.display().to_string()));
    }

    Ok(())
}
