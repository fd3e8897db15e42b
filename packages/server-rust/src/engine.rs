//! Exchange engine bound to a deployed configuration.
//!
//! The engine walks one exchange at a time on the calling task, resolving
//! chains through the configuration's cache. Position, pause flag, and
//! active flow all live on the `MessageContext`, so any task may resume a
//! paused exchange as long as calls on the same context are serialized.

use std::sync::Arc;

use phaseflow_core::{ExecutionError, HandlerChain, MessageContext, Walker};

use crate::deployment::ConfigurationContext;

pub use phaseflow_core::ExchangeStatus;

/// Drives message contexts through their resolved handler chains.
#[derive(Clone)]
pub struct Engine {
    configuration: Arc<ConfigurationContext>,
}

impl Engine {
    pub fn new(configuration: Arc<ConfigurationContext>) -> Self {
        Self { configuration }
    }

    pub fn configuration(&self) -> &Arc<ConfigurationContext> {
        &self.configuration
    }

    fn walker(&self) -> Walker<'_> {
        Walker::new(self.configuration.as_ref())
    }

    /// Resolves the chain for the context's direction and runs it.
    ///
    /// # Errors
    ///
    /// - `InvalidState` unless the context is `Created`
    /// - `Resolution` if the chain cannot be resolved; the context is `Faulted`
    /// - `UnrecoverableFault` if a handler faults inside the fault flow
    /// - `Cancelled` if cancellation was requested
    pub async fn run(&self, ctx: &mut MessageContext) -> Result<ExchangeStatus, ExecutionError> {
        self.walker().run(ctx).await
    }

    /// Runs an explicitly supplied chain from position 0.
    ///
    /// Faults still divert to the configured fault chain for the context's
    /// service and operation.
    ///
    /// # Errors
    ///
    /// As for [`Engine::run`].
    pub async fn run_chain(
        &self,
        chain: Arc<HandlerChain>,
        ctx: &mut MessageContext,
    ) -> Result<ExchangeStatus, ExecutionError> {
        self.walker().run_chain(chain, ctx).await
    }

    /// Continues a paused exchange at the handler after the one that paused.
    ///
    /// # Errors
    ///
    /// `InvalidState` unless the context is `Paused`; otherwise as for [`Engine::run`].
    pub async fn resume(&self, ctx: &mut MessageContext) -> Result<ExchangeStatus, ExecutionError> {
        self.walker().resume(ctx).await
    }

    /// Cancels an exchange that is not in flight.
    ///
    /// In-flight exchanges are cancelled through `MessageContext::cancel_handle`
    /// and stop at the next handler boundary.
    ///
    /// # Errors
    ///
    /// `InvalidState` unless the context is `Created` or `Paused`.
    pub fn cancel(&self, ctx: &mut MessageContext) -> Result<(), ExecutionError> {
        Walker::cancel(ctx)
    }
}
