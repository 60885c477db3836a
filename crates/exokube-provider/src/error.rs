//! Error types for exokube-provider

use thiserror::Error;

/// CloudStack error code for a parameter that does not resolve
pub const PARAM_ERROR_CODE: u16 = 431;

/// Errors returned by a provider client
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// Lookup matched nothing
    #[error("{kind} {name:?} not found")]
    NotFound {
        /// Resource kind (zone, template, ...)
        kind: &'static str,
        /// Name or identifier that was looked up
        name: String,
    },

    /// The API rejected a parameter, usually an identifier that does not exist
    #[error("invalid parameter ({code}): {message}")]
    InvalidParameter {
        /// API error code
        code: u16,
        /// API error text
        message: String,
    },

    /// Lookup matched more than one resource
    #[error("{kind} {name:?} is ambiguous: {count} matches")]
    Ambiguous {
        /// Resource kind
        kind: &'static str,
        /// Name that was looked up
        name: String,
        /// Number of matches
        count: usize,
    },

    /// Any other API error
    #[error("API error {code}: {message}")]
    Api {
        /// API or HTTP error code
        code: u16,
        /// API error text
        message: String,
    },

    /// Transport level failure
    #[error("HTTP error: {0}")]
    Http(String),

    /// Response body did not have the expected shape
    #[error("failed to decode response: {0}")]
    Decode(String),

    /// Missing or unreadable credentials/endpoint
    #[error("configuration error: {0}")]
    Config(String),
}

impl ProviderError {
    /// Whether the error means "does not exist (yet)" rather than a failure
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            ProviderError::NotFound { .. } | ProviderError::InvalidParameter { .. }
        )
    }

    /// Whether retrying the same call later may succeed
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            ProviderError::Http(_) => true,
            ProviderError::Api { code, .. } => *code >= 500,
            _ => false,
        }
    }

    pub(crate) fn from_api(code: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        if code == PARAM_ERROR_CODE {
            ProviderError::InvalidParameter { code, message }
        } else {
            ProviderError::Api { code, message }
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        ProviderError::Http(e.to_string())
    }
}

impl From<serde_json::Error> for ProviderError {
    fn from(e: serde_json::Error) -> Self {
        ProviderError::Decode(e.to_string())
    }
}
