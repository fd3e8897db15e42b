//! Metrics middleware for exchanges.
//!
//! Wraps each dispatch in an `exchange` span and records the outcome as
//! `phaseflow_exchanges_total{outcome}` and
//! `phaseflow_exchange_duration_seconds`. No recorder is installed here;
//! without one the macros are no-ops.

use std::task::{Context, Poll};
use std::time::Instant;

use phaseflow_core::{ExecutionError, MessageContext};
use tower::{Layer, Service};
use tracing::{info_span, Instrument};

use super::exchange::{DispatchError, DispatchFuture, Exchange};
use crate::engine::ExchangeStatus;

#[derive(Debug, Clone)]
pub struct MetricsLayer;

impl<S> Layer<S> for MetricsLayer {
    type Service = MetricsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        MetricsService { inner }
    }
}

/// Service wrapper that records exchange duration and outcome.
#[derive(Debug, Clone)]
pub struct MetricsService<S> {
    inner: S,
}

impl<S> Service<MessageContext> for MetricsService<S>
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
        let span = info_span!(
            "exchange",
            exchange_id = %context.exchange_id(),
            service = %context.service(),
            operation = %context.operation(),
            duration_ms = tracing::field::Empty,
            outcome = tracing::field::Empty,
        );

        let fut = self.inner.call(context);

        Box::pin(
            async move {
                let start = Instant::now();
                let result = fut.await;
                let elapsed = start.elapsed();
                let outcome = outcome_label(&result);

                #[allow(clippy::cast_possible_truncation)]
                let duration_ms = elapsed.as_millis() as u64;
                tracing::Span::current().record("duration_ms", duration_ms);
                tracing::Span::current().record("outcome", outcome);

                ::metrics::counter!("phaseflow_exchanges_total", "outcome" => outcome).increment(1);
                ::metrics::histogram!("phaseflow_exchange_duration_seconds").record(elapsed.as_secs_f64());

                tracing::info!(duration_ms, outcome, "exchange dispatched");
                result
            }
            .instrument(span),
        )
    }
}

fn outcome_label(result: &Result<Exchange, DispatchError>) -> &'static str {
    match result {
        Ok(exchange) if exchange.status == ExchangeStatus::Paused => "paused",
        Ok(exchange) if exchange.context.fault().is_some() => "fault_handled",
        Ok(_) => "completed",
        Err(DispatchError::Overloaded { .. }) => "overloaded",
        Err(DispatchError::Failed { source, .. }) => match source {
            ExecutionError::Cancelled { .. } => "cancelled",
            ExecutionError::InvalidState { .. } => "invalid_state",
            ExecutionError::UnrecoverableFault { .. } => "unrecoverable",
            ExecutionError::Resolution(_) => "resolution_error",
        },
    }
}
