//! Phaseflow core: configuration tree, handler contracts, phase resolution,
//! the per-exchange message context, and the chain walker.

pub mod config_tree;
pub mod context;
pub mod error;
pub mod handler;
pub mod parameter;
pub mod phase;
pub mod resolver;
pub mod types;
pub mod walk;

pub use config_tree::{ConfigNode, ConfigTree, NodeId, NodeKind};
pub use context::{
    CancelHandle, ExchangeState, MessageContext, TransportBinding, FAULT_PROPERTY,
};
pub use error::{ConfigError, ExecutionError, HandlerFault};
pub use handler::{ChainEntry, FnHandler, Handler, HandlerDescription, InvocationResponse};
pub use parameter::{Parameter, ParameterStore};
pub use phase::{Flow, Phase, PhaseOrder};
pub use resolver::{HandlerChain, PhaseResolver};
pub use types::Value;
pub use walk::{ChainSource, ExchangeStatus, Walker};
