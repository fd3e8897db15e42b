//! Error taxonomy shared by configuration, resolution, and execution.

use crate::context::ExchangeState;
use crate::phase::Flow;

/// Configuration-time errors.
///
/// Raised while assembling the configuration tree or resolving handler
/// chains. Each variant names the parameter, handler, phase, or node that
/// must be fixed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("parameter '{name}' is locked by '{locked_by}' and cannot be redefined at '{node}'")]
    LockedParameter {
        name: String,
        node: String,
        locked_by: String,
    },
    #[error("handler '{handler}' references phase '{phase}' which is not declared for the {flow} flow")]
    UnknownPhase {
        phase: String,
        handler: String,
        flow: Flow,
    },
    #[error("conflicting order in phase '{phase}': {detail}")]
    PhaseOrderConflict { phase: String, detail: String },
    #[error("handler '{handler}' is contributed more than once to phase '{phase}'")]
    DuplicateHandler { phase: String, handler: String },
    #[error("unknown service: {name}")]
    UnknownService { name: String },
    #[error("unknown operation '{operation}' on service '{service}'")]
    UnknownOperation { service: String, operation: String },
    #[error("node #{index} does not belong to this configuration")]
    UnknownNode { index: usize },
    #[error("unknown module: {name}")]
    UnknownModule { name: String },
    #[error("'{name}' is already deployed")]
    AlreadyDeployed { name: String },
}

/// Failure reported by a handler during normal processing.
///
/// Diverts the exchange to its fault flow rather than aborting the process.
#[derive(Debug, thiserror::Error)]
pub enum HandlerFault {
    #[error("{reason}")]
    Rejected { reason: String },
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl HandlerFault {
    /// Shorthand for a `Rejected` fault.
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::Rejected {
            reason: reason.into(),
        }
    }
}

/// Per-exchange execution errors surfaced by the engine.
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error("cannot {action} exchange {exchange_id} in state {state:?}")]
    InvalidState {
        exchange_id: String,
        state: ExchangeState,
        action: &'static str,
    },
    #[error("unrecoverable fault in handler '{handler}' while processing the fault flow of exchange {exchange_id}: {source}")]
    UnrecoverableFault {
        exchange_id: String,
        handler: String,
        #[source]
        source: HandlerFault,
    },
    #[error("exchange {exchange_id} was cancelled")]
    Cancelled { exchange_id: String },
    #[error("chain resolution failed: {0}")]
    Resolution(#[from] ConfigError),
}
