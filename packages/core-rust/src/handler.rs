//! Handler metadata and the invocation contract.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::context::MessageContext;
use crate::error::HandlerFault;

/// What a handler asks the engine to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationResponse {
    /// Move on to the next handler.
    Continue,
    /// Suspend the exchange after this handler; it resumes at the next one.
    Pause,
}

/// A unit of message processing.
///
/// Implementations must not keep the `MessageContext` beyond the call.
/// Returning `Err` diverts the exchange to its fault flow.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn invoke(&self, ctx: &mut MessageContext) -> Result<InvocationResponse, HandlerFault>;
}

/// Declared placement of a handler: its phase and ordering constraints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandlerDescription {
    pub name: String,
    pub phase: String,
    #[serde(default)]
    pub before: BTreeSet<String>,
    #[serde(default)]
    pub after: BTreeSet<String>,
    #[serde(default)]
    pub phase_first: bool,
    #[serde(default)]
    pub phase_last: bool,
}

impl HandlerDescription {
    pub fn new(name: impl Into<String>, phase: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            phase: phase.into(),
            before: BTreeSet::new(),
            after: BTreeSet::new(),
            phase_first: false,
            phase_last: false,
        }
    }

    /// This handler must run before `other` when both share a phase.
    #[must_use]
    pub fn before(mut self, other: impl Into<String>) -> Self {
        self.before.insert(other.into());
        self
    }

    /// This handler must run after `other` when both share a phase.
    #[must_use]
    pub fn after(mut self, other: impl Into<String>) -> Self {
        self.after.insert(other.into());
        self
    }

    #[must_use]
    pub fn phase_first(mut self) -> Self {
        self.phase_first = true;
        self
    }

    #[must_use]
    pub fn phase_last(mut self) -> Self {
        self.phase_last = true;
        self
    }
}

/// Handler metadata bound to its implementation.
///
/// The same entry is shared by every chain it is resolved into.
pub struct ChainEntry {
    description: HandlerDescription,
    handler: Arc<dyn Handler>,
}

impl ChainEntry {
    pub fn new(description: HandlerDescription, handler: Arc<dyn Handler>) -> Self {
        Self {
            description,
            handler,
        }
    }

    pub fn name(&self) -> &str {
        &self.description.name
    }

    pub fn description(&self) -> &HandlerDescription {
        &self.description
    }

    pub fn handler(&self) -> &Arc<dyn Handler> {
        &self.handler
    }
}

impl fmt::Debug for ChainEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainEntry")
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

/// Adapts a synchronous closure into a [`Handler`].
pub struct FnHandler<F>(F);

impl<F> FnHandler<F>
where
    F: Fn(&mut MessageContext) -> Result<InvocationResponse, HandlerFault> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F> Handler for FnHandler<F>
where
    F: Fn(&mut MessageContext) -> Result<InvocationResponse, HandlerFault> + Send + Sync,
{
    async fn invoke(&self, ctx: &mut MessageContext) -> Result<InvocationResponse, HandlerFault> {
        (self.0)(ctx)
    }
}
