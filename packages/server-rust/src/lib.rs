//! Phaseflow server: module deployment, resolved-chain cache, execution engine,
//! and the tower dispatch pipeline.

pub mod config;
pub mod deployment;
pub mod dispatch;
pub mod engine;
pub mod telemetry;

pub use config::{EngineConfig, LogConfig, LogFormat};
pub use deployment::{
    ConfigurationBuilder, ConfigurationContext, ConfigurationFactory, DeploymentError, Module,
    ModuleRegistry, Scope, TransportDescription, TransportListener, TransportSender,
};
pub use dispatch::{build_exchange_pipeline, DispatchError, Exchange};
pub use engine::{Engine, ExchangeStatus};
pub use telemetry::{init_tracing, TelemetryError};
