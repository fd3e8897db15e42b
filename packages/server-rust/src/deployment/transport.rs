//! Transport descriptions and the listener/sender lifecycle contracts.
//!
//! Transports own a configuration node under the global root, so their
//! parameters inherit global values and respect global locks. Actual I/O is
//! left to implementations; the runtime only initializes them at bootstrap
//! and stops them at shutdown.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use phaseflow_core::NodeId;
use tracing::{info, warn};

use super::configuration::ConfigurationContext;

/// A named transport and the node holding its parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportDescription {
    name: String,
    node: NodeId,
}

impl TransportDescription {
    pub(crate) fn new(name: &str, node: NodeId) -> Self {
        Self {
            name: name.to_string(),
            node,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn node(&self) -> NodeId {
        self.node
    }
}

/// Receives messages and hands them to the dispatch pipeline.
#[async_trait]
pub trait TransportListener: Send + Sync {
    async fn init(
        &self,
        configuration: &ConfigurationContext,
        description: &TransportDescription,
    ) -> anyhow::Result<()>;

    async fn stop(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Carries outbound messages once their out flow has completed.
#[async_trait]
pub trait TransportSender: Send + Sync {
    async fn init(
        &self,
        configuration: &ConfigurationContext,
        description: &TransportDescription,
    ) -> anyhow::Result<()>;

    async fn stop(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

type Listeners = Vec<(TransportDescription, Arc<dyn TransportListener>)>;
type Senders = Vec<(TransportDescription, Arc<dyn TransportSender>)>;

/// Transport listeners and senders in registration order.
#[derive(Default)]
pub struct TransportRegistry {
    listeners: RwLock<Listeners>,
    senders: RwLock<Senders>,
}

impl TransportRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_listener(&self, description: TransportDescription, listener: Arc<dyn TransportListener>) {
        self.listeners.write().push((description, listener));
    }

    pub fn register_sender(&self, description: TransportDescription, sender: Arc<dyn TransportSender>) {
        self.senders.write().push((description, sender));
    }

    pub fn listener_names(&self) -> Vec<String> {
        self.listeners
            .read()
            .iter()
            .map(|(d, _)| d.name.clone())
            .collect()
    }

    pub fn sender_names(&self) -> Vec<String> {
        self.senders
            .read()
            .iter()
            .map(|(d, _)| d.name.clone())
            .collect()
    }

    /// Initializes every listener, then every sender.
    ///
    /// A failing transport is logged and skipped; the rest still start.
    /// Returns how many transports initialized successfully.
    pub async fn init_all(&self, configuration: &ConfigurationContext) -> usize {
        let listeners = self.listeners.read().clone();
        let senders = self.senders.read().clone();
        let mut started = 0;

        for (description, listener) in &listeners {
            match listener.init(configuration, description).await {
                Ok(()) => {
                    info!(transport = %description.name, "transport listener initialized");
                    started += 1;
                }
                Err(err) => {
                    warn!(transport = %description.name, error = %err, "transport listener failed to initialize");
                }
            }
        }
        for (description, sender) in &senders {
            match sender.init(configuration, description).await {
                Ok(()) => {
                    info!(transport = %description.name, "transport sender initialized");
                    started += 1;
                }
                Err(err) => {
                    warn!(transport = %description.name, error = %err, "transport sender failed to initialize");
                }
            }
        }
        started
    }

    /// Stops listeners first so no new exchanges arrive, then senders.
    pub async fn stop_all(&self) {
        let listeners = self.listeners.read().clone();
        let senders = self.senders.read().clone();
        for (description, listener) in listeners.iter().rev() {
            if let Err(err) = listener.stop().await {
                warn!(transport = %description.name, error = %err, "transport listener failed to stop");
            }
        }
        for (description, sender) in senders.iter().rev() {
            if let Err(err) = sender.stop().await {
                warn!(transport = %description.name, error = %err, "transport sender failed to stop");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use phaseflow_core::Parameter;

    use super::*;
    use crate::config::EngineConfig;

    struct CountingListener {
        inits: AtomicU32,
        fail: bool,
    }

    #[async_trait]
    impl TransportListener for CountingListener {
        async fn init(
            &self,
            configuration: &ConfigurationContext,
            description: &TransportDescription,
        ) -> anyhow::Result<()> {
            self.inits.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("port already bound");
            }
            // Transport parameters resolve through the global root.
            anyhow::ensure!(
                configuration.parameter(description.node(), "timeout").is_some(),
                "missing timeout"
            );
            Ok(())
        }
    }

    struct NoopSender;

    #[async_trait]
    impl TransportSender for NoopSender {
        async fn init(
            &self,
            _configuration: &ConfigurationContext,
            _description: &TransportDescription,
        ) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn failing_transport_does_not_stop_the_rest() {
        let configuration = ConfigurationContext::new(EngineConfig::default());
        configuration
            .add_parameter(NodeId::GLOBAL, Parameter::new("timeout", 30_i64))
            .unwrap();

        let http = configuration.add_transport("http").unwrap();
        let tcp = configuration.add_transport("tcp").unwrap();
        let broken = Arc::new(CountingListener {
            inits: AtomicU32::new(0),
            fail: true,
        });
        let healthy = Arc::new(CountingListener {
            inits: AtomicU32::new(0),
            fail: false,
        });
        configuration.register_listener(tcp, broken.clone());
        configuration.register_listener(http.clone(), healthy.clone());
        configuration.register_sender(http, Arc::new(NoopSender));

        let started = configuration.transports().init_all(&configuration).await;

        assert_eq!(started, 2);
        assert_eq!(broken.inits.load(Ordering::SeqCst), 1);
        assert_eq!(healthy.inits.load(Ordering::SeqCst), 1);
        assert_eq!(configuration.transports().listener_names(), vec!["tcp", "http"]);
        assert_eq!(configuration.transports().sender_names(), vec!["http"]);
    }

    #[test]
    fn transport_names_are_unique() {
        let configuration = ConfigurationContext::new(EngineConfig::default());
        configuration.add_transport("http").unwrap();
        assert!(configuration.add_transport("http").is_err());
    }
}
