//! Flows, declared phase order, and resolved phases.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::handler::ChainEntry;

/// Direction of message travel through the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Flow {
    In,
    Out,
    InFault,
    OutFault,
}

impl Flow {
    pub const ALL: [Flow; 4] = [Flow::In, Flow::Out, Flow::InFault, Flow::OutFault];

    /// The flow an exchange diverts to when a handler faults.
    #[must_use]
    pub fn fault_flow(self) -> Flow {
        match self {
            Self::In | Self::InFault => Self::InFault,
            Self::Out | Self::OutFault => Self::OutFault,
        }
    }

    #[must_use]
    pub fn is_fault(self) -> bool {
        matches!(self, Self::InFault | Self::OutFault)
    }
}

impl fmt::Display for Flow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::In => "in",
            Self::Out => "out",
            Self::InFault => "in-fault",
            Self::OutFault => "out-fault",
        };
        f.write_str(label)
    }
}

/// Globally declared, ordered phase names for each flow.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseOrder {
    #[serde(default)]
    pub in_flow: Vec<String>,
    #[serde(default)]
    pub out_flow: Vec<String>,
    #[serde(default)]
    pub in_fault_flow: Vec<String>,
    #[serde(default)]
    pub out_fault_flow: Vec<String>,
}

impl PhaseOrder {
    /// Conventional phase layout for request/response exchanges.
    #[must_use]
    pub fn standard() -> Self {
        let names = |list: &[&str]| -> Vec<String> { list.iter().map(|s| (*s).to_string()).collect() };
        Self {
            in_flow: names(&["Transport", "Security", "PreDispatch", "Dispatch", "OperationIn"]),
            out_flow: names(&["OperationOut", "PolicyDetermination", "MessageOut", "Security"]),
            in_fault_flow: names(&[
                "Transport",
                "Security",
                "PreDispatch",
                "Dispatch",
                "OperationInFault",
            ]),
            out_fault_flow: names(&[
                "OperationOutFault",
                "PolicyDetermination",
                "MessageOut",
                "Security",
            ]),
        }
    }

    /// Uses the same phase list for every flow. Handy for small deployments and tests.
    #[must_use]
    pub fn uniform<S: AsRef<str>>(phases: &[S]) -> Self {
        let list: Vec<String> = phases.iter().map(|p| p.as_ref().to_string()).collect();
        Self {
            in_flow: list.clone(),
            out_flow: list.clone(),
            in_fault_flow: list.clone(),
            out_fault_flow: list,
        }
    }

    pub fn phases(&self, flow: Flow) -> &[String] {
        match flow {
            Flow::In => &self.in_flow,
            Flow::Out => &self.out_flow,
            Flow::InFault => &self.in_fault_flow,
            Flow::OutFault => &self.out_fault_flow,
        }
    }

    pub fn set_phases(&mut self, flow: Flow, phases: Vec<String>) {
        match flow {
            Flow::In => self.in_flow = phases,
            Flow::Out => self.out_flow = phases,
            Flow::InFault => self.in_fault_flow = phases,
            Flow::OutFault => self.out_fault_flow = phases,
        }
    }

    pub fn contains(&self, flow: Flow, phase: &str) -> bool {
        self.phases(flow).iter().any(|p| p == phase)
    }
}

/// A named, ordered bucket of handlers produced by resolution.
#[derive(Clone)]
pub struct Phase {
    pub name: String,
    pub handlers: Vec<Arc<ChainEntry>>,
}

impl Phase {
    pub fn handler_names(&self) -> Vec<&str> {
        self.handlers.iter().map(|h| h.name()).collect()
    }
}

impl fmt::Debug for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Phase")
            .field("name", &self.name)
            .field("handlers", &self.handler_names())
            .finish()
    }
}
