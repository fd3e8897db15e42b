//! Admission control for exchanges.
//!
//! At most `max_concurrent_exchanges` walks run at once. A permit is held
//! only while the engine drives the exchange: a paused exchange gives its
//! permit back and is admitted again when it is resumed. A rejected context
//! is handed back untouched in `DispatchError::Overloaded`.

use std::sync::Arc;
use std::task::{Context, Poll};

use phaseflow_core::{ExchangeState, MessageContext};
use tokio::sync::Semaphore;
use tower::{Layer, Service};
use tracing::warn;

use super::exchange::{DispatchError, DispatchFuture, Exchange};

/// Whether a context starts a walk or continues a paused one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    New,
    Resume,
}

impl Admission {
    fn of(context: &MessageContext) -> Self {
        if context.state() == ExchangeState::Paused {
            Self::Resume
        } else {
            Self::New
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Resume => "resume",
        }
    }
}

/// Tower layer that caps concurrently walking exchanges.
///
/// When all permits are taken, contexts are rejected immediately rather
/// than queued.
#[derive(Debug, Clone)]
pub struct LoadShedLayer {
    permits: Arc<Semaphore>,
}

impl LoadShedLayer {
    #[must_use]
    pub fn new(max_concurrent_exchanges: u32) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_concurrent_exchanges as usize)),
        }
    }

    /// Exchanges that could be admitted right now.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}

impl<S> Layer<S> for LoadShedLayer {
    type Service = LoadShedService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        LoadShedService {
            inner,
            permits: Arc::clone(&self.permits),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoadShedService<S> {
    inner: S,
    permits: Arc<Semaphore>,
}

impl<S> Service<MessageContext> for LoadShedService<S>
where
    S: Service<MessageContext, Response = Exchange, Error = DispatchError> + Send,
    S::Future: Send + 'static,
{
    type Response = Exchange;
    type Error = DispatchError;
    type Future = DispatchFuture;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, context: MessageContext) -> Self::Future {
        let admission = Admission::of(&context);
        let Ok(permit) = Arc::clone(&self.permits).try_acquire_owned() else {
            warn!(
                exchange_id = %context.exchange_id(),
                service = %context.service(),
                operation = %context.operation(),
                admission = admission.as_str(),
                "exchange shed"
            );
            ::metrics::counter!("phaseflow_exchanges_shed_total", "admission" => admission.as_str())
                .increment(1);
            return Box::pin(async move {
                Err(DispatchError::Overloaded {
                    context: Box::new(context),
                })
            });
        };

        let fut = self.inner.call(context);
        Box::pin(async move {
            // Returned as soon as the walk stops, including on pause.
            let result = fut.await;
            drop(permit);
            result
        })
    }
}
