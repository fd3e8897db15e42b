//! Chain walking with pause/resume and fault diversion.
//!
//! The walker keeps no per-exchange state of its own: the position, pause
//! flag, and active flow all live on the `MessageContext`, so any task may
//! resume a paused exchange as long as calls on the same context are
//! serialized. Handlers receive the context while it is `Running`, which
//! every public entry point here rejects, so a handler cannot restart,
//! resume, or cancel the walk it is part of.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::context::{ExchangeState, MessageContext};
use crate::error::{ConfigError, ExecutionError, HandlerFault};
use crate::handler::{ChainEntry, InvocationResponse};
use crate::phase::Flow;
use crate::resolver::HandlerChain;
use crate::types::Value;

/// How a walk ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeStatus {
    /// The active chain ran to the end. Check `MessageContext::fault` to
    /// tell a normal completion from a handled fault.
    Completed,
    /// A handler paused the exchange; call `resume` to continue.
    Paused,
}

/// Supplies resolved chains for a service operation.
pub trait ChainSource: Send + Sync {
    /// # Errors
    ///
    /// Any `ConfigError` raised while resolving the chain.
    fn chain(&self, service: &str, operation: &str, flow: Flow) -> Result<Arc<HandlerChain>, ConfigError>;
}

/// Drives one message context through its chains.
pub struct Walker<'a> {
    chains: &'a dyn ChainSource,
}

impl<'a> Walker<'a> {
    pub fn new(chains: &'a dyn ChainSource) -> Self {
        Self { chains }
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
        require_state(ctx, ExchangeState::Created, "run")?;
        let chain = match self.chains.chain(ctx.service(), ctx.operation(), ctx.direction()) {
            Ok(chain) => chain,
            Err(err) => {
                ctx.fail(cause("resolution", None, ctx.direction(), &err.to_string()));
                return Err(err.into());
            }
        };
        self.run_chain(chain, ctx).await
    }

    /// Runs an explicitly supplied chain from position 0.
    ///
    /// # Errors
    ///
    /// As for [`Walker::run`].
    pub async fn run_chain(
        &self,
        chain: Arc<HandlerChain>,
        ctx: &mut MessageContext,
    ) -> Result<ExchangeStatus, ExecutionError> {
        require_state(ctx, ExchangeState::Created, "run")?;
        debug!(
            exchange_id = %ctx.exchange_id(),
            service = %ctx.service(),
            operation = %ctx.operation(),
            flow = %chain.flow(),
            handlers = chain.len(),
            "exchange started"
        );
        ctx.begin(chain);
        self.walk(ctx).await
    }

    /// Continues a paused exchange at the handler after the one that paused.
    ///
    /// # Errors
    ///
    /// `InvalidState` unless the context is `Paused`; otherwise as for [`Walker::run`].
    pub async fn resume(&self, ctx: &mut MessageContext) -> Result<ExchangeStatus, ExecutionError> {
        require_state(ctx, ExchangeState::Paused, "resume")?;
        debug!(exchange_id = %ctx.exchange_id(), cursor = ctx.cursor(), "exchange resumed");
        ctx.unpause();
        self.walk(ctx).await
    }

    /// Cancels an exchange that is not in flight.
    ///
    /// # Errors
    ///
    /// `InvalidState` unless the context is `Created` or `Paused`.
    pub fn cancel(ctx: &mut MessageContext) -> Result<(), ExecutionError> {
        match ctx.state() {
            ExchangeState::Created | ExchangeState::Paused => {
                ctx.cancel_handle().cancel();
                ctx.fail(cause("cancelled", None, ctx.active_flow(), "exchange cancelled"));
                warn!(exchange_id = %ctx.exchange_id(), "exchange cancelled");
                Ok(())
            }
            state => Err(ExecutionError::InvalidState {
                exchange_id: ctx.exchange_id().to_string(),
                state,
                action: "cancel",
            }),
        }
    }

    async fn walk(&self, ctx: &mut MessageContext) -> Result<ExchangeStatus, ExecutionError> {
        loop {
            if ctx.is_cancel_requested() {
                ctx.fail(cause("cancelled", None, ctx.active_flow(), "exchange cancelled"));
                warn!(exchange_id = %ctx.exchange_id(), cursor = ctx.cursor(), "exchange cancelled");
                return Err(ExecutionError::Cancelled {
                    exchange_id: ctx.exchange_id().to_string(),
                });
            }

            let Some(entry) = ctx.current_entry() else {
                ctx.complete();
                debug!(
                    exchange_id = %ctx.exchange_id(),
                    flow = %ctx.active_flow(),
                    "exchange completed"
                );
                return Ok(ExchangeStatus::Completed);
            };

            let flow = ctx.active_flow();
            let position = ctx.cursor();
            debug!(
                exchange_id = %ctx.exchange_id(),
                handler = %entry.name(),
                %flow,
                cursor = position,
                "invoking handler"
            );

            let outcome = entry.handler().invoke(ctx).await;
            ctx.move_to(position + 1);
            match outcome {
                Ok(response) => {
                    if response == InvocationResponse::Pause || ctx.is_paused() {
                        ctx.suspend();
                        debug!(
                            exchange_id = %ctx.exchange_id(),
                            handler = %entry.name(),
                            "exchange paused"
                        );
                        return Ok(ExchangeStatus::Paused);
                    }
                }
                Err(fault) => self.on_fault(ctx, &entry, flow, fault)?,
            }
        }
    }

    /// Diverts to the fault flow, or fails the exchange if already in it.
    fn on_fault(
        &self,
        ctx: &mut MessageContext,
        entry: &ChainEntry,
        flow: Flow,
        fault: HandlerFault,
    ) -> Result<(), ExecutionError> {
        let recorded = cause("handler", Some(entry), flow, &fault.to_string());

        if flow.is_fault() {
            ctx.fail(recorded);
            error!(
                exchange_id = %ctx.exchange_id(),
                handler = %entry.name(),
                error = %fault,
                "handler faulted inside the fault flow"
            );
            return Err(ExecutionError::UnrecoverableFault {
                exchange_id: ctx.exchange_id().to_string(),
                handler: entry.name().to_string(),
                source: fault,
            });
        }

        let fault_flow = flow.fault_flow();
        let fault_chain = match self.chains.chain(ctx.service(), ctx.operation(), fault_flow) {
            Ok(chain) => chain,
            Err(err) => {
                ctx.fail(recorded);
                error!(exchange_id = %ctx.exchange_id(), error = %err, "fault chain unavailable");
                return Err(err.into());
            }
        };

        warn!(
            exchange_id = %ctx.exchange_id(),
            handler = %entry.name(),
            error = %fault,
            %fault_flow,
            "handler faulted, diverting to fault flow"
        );
        ctx.divert(fault_chain, recorded);
        Ok(())
    }
}

fn require_state(
    ctx: &MessageContext,
    expected: ExchangeState,
    action: &'static str,
) -> Result<(), ExecutionError> {
    if ctx.state() == expected {
        Ok(())
    } else {
        Err(ExecutionError::InvalidState {
            exchange_id: ctx.exchange_id().to_string(),
            state: ctx.state(),
            action,
        })
    }
}

/// Structured fault record stored under `FAULT_PROPERTY`.
fn cause(kind: &str, entry: Option<&ChainEntry>, flow: Flow, message: &str) -> Value {
    let mut map = BTreeMap::new();
    map.insert("kind".to_string(), Value::from(kind));
    map.insert("flow".to_string(), Value::from(flow.to_string()));
    map.insert("message".to_string(), Value::from(message));
    if let Some(entry) = entry {
        map.insert("handler".to_string(), Value::from(entry.name()));
        map.insert(
            "phase".to_string(),
            Value::from(entry.description().phase.as_str()),
        );
    }
    Value::Map(map)
}
