//! Module contract: a deployable bundle of handlers.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use phaseflow_core::{ChainEntry, Flow};

use super::configuration::ConfigurationContext;

/// Where a module engagement or handler declaration applies.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Scope {
    Global,
    Service(String),
    Operation { service: String, operation: String },
}

impl Scope {
    pub fn service(name: impl Into<String>) -> Self {
        Self::Service(name.into())
    }

    pub fn operation(service: impl Into<String>, operation: impl Into<String>) -> Self {
        Self::Operation {
            service: service.into(),
            operation: operation.into(),
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Global => f.write_str("global"),
            Self::Service(name) => write!(f, "service:{name}"),
            Self::Operation { service, operation } => {
                write!(f, "service:{service}/operation:{operation}")
            }
        }
    }
}

/// A deployable unit that contributes handlers to named phases.
///
/// Modules are registered once, initialized once, and may then be engaged
/// at any number of scopes. Engagement makes the module's handlers part of
/// every chain resolved for that scope and its descendants.
#[async_trait]
pub trait Module: Send + Sync {
    /// Unique module name, used to engage and look up the module.
    fn name(&self) -> &'static str;

    /// Handlers this module contributes to `flow`, in registration order.
    fn handlers(&self, flow: Flow) -> Vec<Arc<ChainEntry>>;

    /// One-time setup or recovery, run before any chain that uses the
    /// module's handlers is resolved. Distinct from engagement.
    async fn init(&self, configuration: &ConfigurationContext) -> anyhow::Result<()>;

    /// Release resources at shutdown.
    async fn shutdown(&self) -> anyhow::Result<()> {
        Ok(())
    }
}
