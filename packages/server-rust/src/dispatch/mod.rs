//! Tower dispatch pipeline in front of the engine.
//!
//! - [`exchange`]: Runs or resumes a context on the engine
//! - [`metrics`]: Exchange timing and outcome via `tracing` spans and `metrics`
//! - [`load_shed`]: Semaphore-based concurrency limiting
//! - [`pipeline`]: Composes all layers into a single service stack

pub mod exchange;
pub mod load_shed;
pub mod metrics;
pub mod pipeline;

pub use exchange::{DispatchError, Exchange, ExchangeService};
pub use load_shed::LoadShedLayer;
pub use metrics::MetricsLayer;
pub use pipeline::build_exchange_pipeline;
