//! Pipeline composition: the dispatch front door transports call into.

use phaseflow_core::MessageContext;
use tower::ServiceBuilder;

use super::exchange::{DispatchError, Exchange, ExchangeService};
use super::load_shed::LoadShedLayer;
use super::metrics::MetricsLayer;
use crate::config::EngineConfig;
use crate::engine::Engine;

/// Wraps an `ExchangeService` with the dispatch layers.
///
/// Layer order (outermost to innermost):
/// 1. `LoadShedLayer` -- reject when overloaded (fail fast before doing any work)
/// 2. `MetricsLayer` -- record timing and outcome
///
/// There is no timeout layer: handlers are never interrupted mid-call.
#[must_use]
pub fn build_exchange_pipeline(
    engine: Engine,
    config: &EngineConfig,
) -> impl tower::Service<MessageContext, Response = Exchange, Error = DispatchError> + Clone {
    ServiceBuilder::new()
        .layer(LoadShedLayer::new(config.max_concurrent_exchanges))
        .layer(MetricsLayer)
        .service(ExchangeService::new(engine))
}
