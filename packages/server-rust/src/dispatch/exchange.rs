//! Innermost dispatch service: hands a context to the engine.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use phaseflow_core::{ExchangeState, ExecutionError, MessageContext};
use tower::Service;

use crate::engine::{Engine, ExchangeStatus};

/// A context returned from dispatch together with how its walk ended.
#[derive(Debug)]
pub struct Exchange {
    pub context: MessageContext,
    pub status: ExchangeStatus,
}

/// Errors surfaced by the dispatch pipeline.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// No permit was free. The context is handed back unchanged.
    #[error("engine overloaded, try again later")]
    Overloaded { context: Box<MessageContext> },
    /// The engine rejected or faulted the exchange. The context is handed
    /// back so the transport can report the recorded fault.
    #[error("exchange failed: {source}")]
    Failed {
        context: Box<MessageContext>,
        #[source]
        source: ExecutionError,
    },
}

pub(crate) type DispatchFuture =
    Pin<Box<dyn Future<Output = Result<Exchange, DispatchError>> + Send>>;

/// Runs new contexts and resumes paused ones.
#[derive(Clone)]
pub struct ExchangeService {
    engine: Engine,
}

impl ExchangeService {
    #[must_use]
    pub fn new(engine: Engine) -> Self {
        Self { engine }
    }
}

impl Service<MessageContext> for ExchangeService {
    type Response = Exchange;
    type Error = DispatchError;
    type Future = DispatchFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, mut context: MessageContext) -> Self::Future {
        let engine = self.engine.clone();
        Box::pin(async move {
            let result = if context.state() == ExchangeState::Paused {
                engine.resume(&mut context).await
            } else {
                engine.run(&mut context).await
            };
            match result {
                Ok(status) => Ok(Exchange { context, status }),
                Err(source) => Err(DispatchError::Failed {
                    context: Box::new(context),
                    source,
                }),
            }
        })
    }
}
