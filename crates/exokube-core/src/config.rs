//! Reconciler tunables

use std::time::Duration;

use exokube_exec::ConnectRetryPolicy;
use exokube_exec::retry::duration_secs;
use serde::{Deserialize, Serialize};

/// Docker engine version installed on every node
pub const DEFAULT_DOCKER_VERSION: &str = "18.06";

/// Calico overlay version applied by the control-plane
pub const DEFAULT_CALICO_VERSION: &str = "3.4";

/// Settings shared by the node and cluster reconcilers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcilerConfig {
    #[serde(default = "default_docker_version")]
    pub docker_version: String,
    #[serde(default = "default_calico_version")]
    pub calico_version: String,
    /// Control-plane API port workers join on
    #[serde(default = "default_api_port")]
    pub api_port: u16,
    /// Lifetime of worker join tokens
    #[serde(default = "default_token_ttl", with = "duration_secs")]
    pub token_ttl: Duration,
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,
    /// Longest a single bootstrap command may run
    #[serde(default = "default_step_timeout", with = "duration_secs")]
    pub step_timeout: Duration,
    #[serde(default)]
    pub connect_retry: ConnectRetryPolicy,
    #[serde(default)]
    pub requeue: RequeueIntervals,
}

/// Retry-after hints handed back to the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequeueIntervals {
    /// Waiting for the role's security group or the control-plane
    #[serde(default = "one_second", with = "duration_secs")]
    pub prerequisite: Duration,
    /// Polling a deploy job
    #[serde(default = "one_second", with = "duration_secs")]
    pub boot_poll: Duration,
    /// Polling a destroy job
    #[serde(default = "two_seconds", with = "duration_secs")]
    pub delete_poll: Duration,
    /// Background provisioning in flight
    #[serde(default = "ten_seconds", with = "duration_secs")]
    pub provisioning: Duration,
}

fn default_docker_version() -> String {
    DEFAULT_DOCKER_VERSION.to_string()
}

fn default_calico_version() -> String {
    DEFAULT_CALICO_VERSION.to_string()
}

fn default_api_port() -> u16 {
    6443
}

fn default_token_ttl() -> Duration {
    Duration::from_secs(20 * 60)
}

fn default_ssh_port() -> u16 {
    22
}

fn default_step_timeout() -> Duration {
    Duration::from_secs(20 * 60)
}

fn one_second() -> Duration {
    Duration::from_secs(1)
}

fn two_seconds() -> Duration {
    Duration::from_secs(2)
}

fn ten_seconds() -> Duration {
    Duration::from_secs(10)
}

impl Default for RequeueIntervals {
    fn default() -> Self {
        Self {
            prerequisite: one_second(),
            boot_poll: one_second(),
            delete_poll: two_seconds(),
            provisioning: ten_seconds(),
        }
    }
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            docker_version: default_docker_version(),
            calico_version: default_calico_version(),
            api_port: default_api_port(),
            token_ttl: default_token_ttl(),
            ssh_port: default_ssh_port(),
            step_timeout: default_step_timeout(),
            connect_retry: ConnectRetryPolicy::default(),
            requeue: RequeueIntervals::default(),
        }
    }
}

impl ReconcilerConfig {
    /// `kubeadm` duration string for the join token lifetime, e.g. `20m0s`
    #[must_use]
    pub fn token_ttl_arg(&self) -> String {
        let secs = self.token_ttl.as_secs();
        format!("{}m{}s", secs / 60, secs % 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_document() {
        let config: ReconcilerConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, ReconcilerConfig::default());
        assert_eq!(config.requeue.delete_poll, Duration::from_secs(2));
        assert_eq!(config.connect_retry.max_attempts, 6);
    }

    #[test]
    fn test_partial_override() {
        let config: ReconcilerConfig =
            serde_json::from_str(r#"{"docker_version": "19.03", "step_timeout": 600, "requeue": {"provisioning": 30}}"#)
                .unwrap();
        assert_eq!(config.docker_version, "19.03");
        assert_eq!(config.step_timeout, Duration::from_secs(600));
        assert_eq!(config.requeue.provisioning, Duration::from_secs(30));
        assert_eq!(config.requeue.boot_poll, Duration::from_secs(1));
    }

    #[test]
    fn test_token_ttl_arg() {
        assert_eq!(ReconcilerConfig::default().token_ttl_arg(), "20m0s");
    }
}
