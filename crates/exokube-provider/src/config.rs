//! Provider endpoint and credential resolution
//!
//! Credentials come from the environment when all three of endpoint, key and
//! secret are set, otherwise from the default account of an `exoscale.toml`
//! file. Resolution happens once at process start; the result is handed to
//! the client constructor.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::{debug, info};

use crate::error::ProviderError;

/// Compute API endpoint used when an account does not name one
pub const DEFAULT_ENDPOINT: &str = "https://api.exoscale.com/compute";

const ENDPOINT_VARS: &[&str] = &[
    "EXOSCALE_ENDPOINT",
    "EXOSCALE_COMPUTE_ENDPOINT",
    "CLOUDSTACK_ENDPOINT",
];

const KEY_VARS: &[&str] = &[
    "EXOSCALE_KEY",
    "EXOSCALE_API_KEY",
    "CLOUDSTACK_KEY",
    "CLOUDSTACK_API_KEY",
];

const SECRET_VARS: &[&str] = &[
    "EXOSCALE_SECRET",
    "EXOSCALE_API_SECRET",
    "EXOSCALE_SECRET_KEY",
    "CLOUDSTACK_SECRET",
    "CLOUDSTACK_SECRET_KEY",
];

const CONFIG_FILE_NAME: &str = "exoscale.toml";

/// Resolved API endpoint and credentials
#[derive(Clone, PartialEq, Eq)]
pub struct ProviderConfig {
    pub endpoint: String,
    pub api_key: String,
    pub api_secret: String,
}

impl fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("endpoint", &self.endpoint)
            .field("api_key", &self.api_key)
            .field("api_secret", &"<redacted>")
            .finish()
    }
}

/// Contents of an `exoscale.toml` account file
#[derive(Debug, Clone, Deserialize)]
pub struct AccountsFile {
    #[serde(default, alias = "defaultAccount", alias = "defaultaccount")]
    pub default_account: String,
    #[serde(default)]
    pub accounts: Vec<Account>,
}

/// One account of an `exoscale.toml` file
#[derive(Debug, Clone, Deserialize)]
pub struct Account {
    pub name: String,
    #[serde(default)]
    pub account: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default, alias = "computeEndpoint", alias = "computeendpoint")]
    pub compute_endpoint: Option<String>,
    pub key: String,
    #[serde(default)]
    pub secret: String,
    #[serde(default, alias = "defaultZone", alias = "defaultzone")]
    pub default_zone: Option<String>,
}

impl ProviderConfig {
    /// Resolve from the process environment, then from the account file
    ///
    /// # Errors
    /// Returns `ProviderError::Config` if neither source yields credentials
    pub fn resolve() -> Result<Self, ProviderError> {
        if let Some(config) = Self::from_env_with(|var| std::env::var(var).ok()) {
            info!(endpoint = %config.endpoint, "using provider credentials from environment");
            return Ok(config);
        }

        for path in search_paths() {
            if path.exists() {
                let config = Self::from_file(&path)?;
                info!(
                    path = %path.display(),
                    endpoint = %config.endpoint,
                    "using provider credentials from account file"
                );
                return Ok(config);
            }
            debug!(path = %path.display(), "no account file");
        }

        Err(ProviderError::Config(format!(
            "no credentials in environment and no {CONFIG_FILE_NAME} found"
        )))
    }

    /// Build from environment-like lookups, `None` unless endpoint, key and
    /// secret are all present
    pub fn from_env_with(lookup: impl Fn(&str) -> Option<String>) -> Option<Self> {
        let first = |vars: &[&str]| {
            vars.iter()
                .find_map(|var| lookup(var).filter(|v| !v.is_empty()))
        };

        Some(Self {
            endpoint: first(ENDPOINT_VARS)?,
            api_key: first(KEY_VARS)?,
            api_secret: first(SECRET_VARS)?,
        })
    }

    /// Read the default account of an account file
    ///
    /// # Errors
    /// Returns `ProviderError::Config` if the file cannot be read or names no
    /// usable default account
    pub fn from_file(path: &Path) -> Result<Self, ProviderError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ProviderError::Config(format!("{}: {e}", path.display())))?;
        let file: AccountsFile = toml::from_str(&content)
            .map_err(|e| ProviderError::Config(format!("{}: {e}", path.display())))?;
        Self::from_accounts(&file)
    }

    /// Pick the default account
    ///
    /// # Errors
    /// Returns `ProviderError::Config` if there are no accounts or the default
    /// one does not exist
    pub fn from_accounts(file: &AccountsFile) -> Result<Self, ProviderError> {
        if file.accounts.is_empty() {
            return Err(ProviderError::Config("no accounts defined".to_string()));
        }
        if file.default_account.is_empty() {
            return Err(ProviderError::Config("default account not defined".to_string()));
        }

        let account = file
            .accounts
            .iter()
            .find(|acc| acc.name == file.default_account)
            .ok_or_else(|| {
                ProviderError::Config(format!(
                    "couldn't find any account with name {:?}",
                    file.default_account
                ))
            })?;

        let endpoint = account
            .compute_endpoint
            .clone()
            .or_else(|| account.endpoint.clone())
            .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string());

        Ok(Self {
            endpoint,
            api_key: account.key.clone(),
            api_secret: account.secret.clone(),
        })
    }
}

/// Locations searched for the account file, most specific first
#[must_use]
pub fn search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();
    let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("/root"));

    match std::env::var_os("XDG_CONFIG_HOME") {
        Some(xdg) => paths.push(PathBuf::from(xdg).join("exoscale")),
        None => paths.push(home.join(".config").join("exoscale")),
    }
    paths.push(home.join(".exoscale"));
    paths.push(home.clone());
    paths.push(PathBuf::from("."));

    paths
        .into_iter()
        .map(|dir| dir.join(CONFIG_FILE_NAME))
        .collect()
}
