use phaseflow_core::PhaseOrder;
use serde::{Deserialize, Serialize};

/// Engine-level configuration.
///
/// Controls the declared phase order, admission limits, and logging.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Unique identifier for this engine instance, attached to log output.
    pub node_id: String,
    /// Maximum number of exchanges dispatched concurrently before load shedding.
    pub max_concurrent_exchanges: u32,
    /// Globally declared phase order for every flow.
    pub phase_order: PhaseOrder,
    /// Logging setup applied by `telemetry::init_tracing`.
    pub log: LogConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            node_id: String::new(),
            max_concurrent_exchanges: 1000,
            phase_order: PhaseOrder::standard(),
            log: LogConfig::default(),
        }
    }
}

/// Output format for log lines.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Default `EnvFilter` directive. `RUST_LOG` takes precedence when set.
    pub filter: String,
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}
