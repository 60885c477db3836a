//! exokube-provider: Compute provider abstraction
//!
//! A strongly typed client trait over the provider's compute API (zones,
//! templates, service offerings, security groups, instances and async jobs),
//! a signed HTTP implementation for the Exoscale/CloudStack API and an
//! in-memory implementation.

pub mod cloudstack;
pub mod config;
pub mod error;
pub mod memory;
pub mod signing;
pub mod traits;
pub mod types;
mod wire;

pub use cloudstack::CloudStackClient;
pub use config::ProviderConfig;
pub use error::ProviderError;
pub use memory::{CallCounts, InMemoryProvider};
#[cfg(any(test, feature = "mock"))]
pub use traits::MockProviderClient;
pub use traits::ProviderClient;
pub use types::{
    AsyncResult, DeployRequest, IngressRule, IngressRuleSpec, InstanceFilter, JobId, JobOutcome,
    PortRange, Protocol, RuleSource, SecurityGroup, ServiceOffering, Template, VirtualMachine,
    Zone,
};
