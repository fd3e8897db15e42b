//! Per-exchange message context.
//!
//! A `MessageContext` is created for every exchange, handed to the engine,
//! and mutated by each handler it passes through. Besides the payload and
//! property bag it records where the exchange is in its resolved chain so
//! a paused walk can resume at the exact next handler.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use uuid::Uuid;

use crate::handler::ChainEntry;
use crate::phase::Flow;
use crate::resolver::HandlerChain;
use crate::types::Value;

/// Reserved property key under which the engine records a fault cause.
pub const FAULT_PROPERTY: &str = "phaseflow.fault";

/// Lifecycle of an exchange.
///
/// State machine: Created -> Running -> {Paused, Completed, Faulted},
/// with Paused -> Running on resume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeState {
    Created,
    Running,
    Paused,
    Completed,
    Faulted,
}

impl ExchangeState {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Faulted)
    }
}

/// Reference to the transport that produced or will carry the message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportBinding {
    pub transport: String,
    pub reply_to: Option<String>,
}

/// Cloneable flag used to cancel an exchange from another task.
///
/// The engine only observes it between handler invocations.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Mutable record of one exchange travelling through a handler chain.
#[derive(Debug)]
pub struct MessageContext {
    exchange_id: String,
    direction: Flow,
    service: String,
    operation: String,
    payload: Option<Bytes>,
    properties: HashMap<String, Value>,
    transport: Option<TransportBinding>,
    state: ExchangeState,
    paused: bool,
    cursor: usize,
    active_flow: Flow,
    chain: Option<Arc<HandlerChain>>,
    cancel: CancelHandle,
}

impl MessageContext {
    /// Creates a context for an exchange addressed to `service`/`operation`.
    ///
    /// `direction` picks the chain the engine starts with: `Flow::In` for
    /// received messages, `Flow::Out` for messages being sent.
    pub fn new(service: impl Into<String>, operation: impl Into<String>, direction: Flow) -> Self {
        Self {
            exchange_id: Uuid::new_v4().to_string(),
            direction,
            service: service.into(),
            operation: operation.into(),
            payload: None,
            properties: HashMap::new(),
            transport: None,
            state: ExchangeState::Created,
            paused: false,
            cursor: 0,
            active_flow: direction,
            chain: None,
            cancel: CancelHandle::default(),
        }
    }

    #[must_use]
    pub fn with_payload(mut self, payload: Bytes) -> Self {
        self.payload = Some(payload);
        self
    }

    #[must_use]
    pub fn with_transport(mut self, binding: TransportBinding) -> Self {
        self.transport = Some(binding);
        self
    }

    pub fn exchange_id(&self) -> &str {
        &self.exchange_id
    }

    pub fn direction(&self) -> Flow {
        self.direction
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    pub fn payload(&self) -> Option<&Bytes> {
        self.payload.as_ref()
    }

    pub fn set_payload(&mut self, payload: Bytes) {
        self.payload = Some(payload);
    }

    pub fn take_payload(&mut self) -> Option<Bytes> {
        self.payload.take()
    }

    pub fn transport(&self) -> Option<&TransportBinding> {
        self.transport.as_ref()
    }

    // -- property bag -------------------------------------------------------

    pub fn property(&self, key: &str) -> Option<&Value> {
        self.properties.get(key)
    }

    pub fn set_property(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.properties.insert(key.into(), value.into());
    }

    pub fn remove_property(&mut self, key: &str) -> Option<Value> {
        self.properties.remove(key)
    }

    pub fn properties(&self) -> &HashMap<String, Value> {
        &self.properties
    }

    /// The fault recorded by the engine, if the exchange diverted to its fault flow.
    pub fn fault(&self) -> Option<&Value> {
        self.properties.get(FAULT_PROPERTY)
    }

    // -- pipeline position --------------------------------------------------

    pub fn state(&self) -> ExchangeState {
        self.state
    }

    /// Asks the engine to suspend after the current handler returns.
    pub fn pause(&mut self) {
        self.paused = true;
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Index of the next handler to run within the active chain.
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// The flow currently being walked; differs from `direction` after a fault.
    pub fn active_flow(&self) -> Flow {
        self.active_flow
    }

    pub fn chain(&self) -> Option<&Arc<HandlerChain>> {
        self.chain.as_ref()
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.cancel.is_cancelled()
    }

    // -- walk transitions ---------------------------------------------------
    //
    // Only `walk::Walker` moves the exchange through its state machine, after
    // validating the current state. Handlers see none of these.

    /// Binds `chain` and enters `Running` at position 0.
    pub(crate) fn begin(&mut self, chain: Arc<HandlerChain>) {
        self.active_flow = chain.flow();
        self.chain = Some(chain);
        self.cursor = 0;
        self.paused = false;
        self.state = ExchangeState::Running;
    }

    /// Clears the pause request and re-enters `Running` at the recorded cursor.
    pub(crate) fn unpause(&mut self) {
        self.paused = false;
        self.state = ExchangeState::Running;
    }

    /// The handler at the cursor, or `None` once the chain is exhausted.
    pub fn current_entry(&self) -> Option<Arc<ChainEntry>> {
        self.chain.as_ref()?.get(self.cursor).cloned()
    }

    pub(crate) fn move_to(&mut self, cursor: usize) {
        self.cursor = cursor;
    }

    pub(crate) fn suspend(&mut self) {
        self.paused = true;
        self.state = ExchangeState::Paused;
    }

    /// Records `cause` and restarts the walk on `fault_chain`.
    pub(crate) fn divert(&mut self, fault_chain: Arc<HandlerChain>, cause: Value) {
        self.properties.insert(FAULT_PROPERTY.to_string(), cause);
        self.begin(fault_chain);
    }

    pub(crate) fn complete(&mut self) {
        self.paused = false;
        self.state = ExchangeState::Completed;
    }

    /// Records `cause` and enters the terminal `Faulted` state.
    pub(crate) fn fail(&mut self, cause: Value) {
        self.properties.insert(FAULT_PROPERTY.to_string(), cause);
        self.paused = false;
        self.state = ExchangeState::Faulted;
    }
}
