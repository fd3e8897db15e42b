//! Bootstrap: turns an assembled configuration into a running one.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use super::configuration::{ConfigurationContext, DeploymentError};

/// Produces an assembled configuration: services, operations, modules,
/// engagements, parameters, and transports.
#[async_trait]
pub trait ConfigurationBuilder: Send + Sync {
    async fn build(&self) -> Result<ConfigurationContext, DeploymentError>;
}

/// Brings a built configuration to the ready state.
pub struct ConfigurationFactory;

impl ConfigurationFactory {
    /// Builds the configuration and initializes it.
    ///
    /// # Errors
    ///
    /// Propagates builder errors and the errors of [`Self::init`].
    pub async fn create(builder: &dyn ConfigurationBuilder) -> Result<Arc<ConfigurationContext>, DeploymentError> {
        let configuration = Arc::new(builder.build().await?);
        Self::init(&configuration).await?;
        Ok(configuration)
    }

    /// Initializes every module in registration order, resolves every chain,
    /// then initializes transports.
    ///
    /// Module and resolution failures abort the bootstrap. Transport
    /// failures are logged and skipped.
    ///
    /// # Errors
    ///
    /// Returns `DeploymentError::ModuleInit` or the first resolution error.
    pub async fn init(configuration: &ConfigurationContext) -> Result<(), DeploymentError> {
        configuration.modules().init_all(configuration).await?;
        let chains = configuration.resolve_all()?;
        let transports = configuration.transports().init_all(configuration).await;

        info!(
            node_id = %configuration.config().node_id,
            modules = configuration.modules().names().len(),
            services = configuration.services().len(),
            chains,
            transports,
            "configuration ready"
        );
        Ok(())
    }

    /// Stops transports, then shuts modules down in reverse registration order.
    ///
    /// # Errors
    ///
    /// Returns the first module shutdown failure.
    pub async fn shutdown(configuration: &ConfigurationContext) -> anyhow::Result<()> {
        configuration.transports().stop_all().await;
        configuration.modules().shutdown_all().await?;
        info!("configuration shut down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use phaseflow_core::{
        ChainEntry, ConfigError, Flow, FnHandler, HandlerDescription, InvocationResponse, MessageContext,
        PhaseOrder,
    };

    use super::*;
    use crate::config::EngineConfig;
    use crate::deployment::module::{Module, Scope};

    /// Records whether any chain was cached when `init` ran.
    struct ProbeModule {
        saw_cached_chain: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Module for ProbeModule {
        fn name(&self) -> &'static str {
            "probe"
        }

        fn handlers(&self, _flow: Flow) -> Vec<Arc<ChainEntry>> {
            Vec::new()
        }

        async fn init(&self, configuration: &ConfigurationContext) -> anyhow::Result<()> {
            if configuration.cached_chain_count() > 0 {
                self.saw_cached_chain.store(true, Ordering::SeqCst);
            }
            Ok(())
        }
    }

    struct EchoDeployment {
        saw_cached_chain: Arc<AtomicBool>,
        bad_phase: bool,
    }

    #[async_trait]
    impl ConfigurationBuilder for EchoDeployment {
        async fn build(&self) -> Result<ConfigurationContext, DeploymentError> {
            let mut config = EngineConfig::default();
            config.phase_order = PhaseOrder::uniform(&["Transport", "Dispatch"]);
            let configuration = ConfigurationContext::new(config);
            configuration.add_service("echo")?;
            configuration.add_operation("echo", "ping")?;
            configuration.register_module(ProbeModule {
                saw_cached_chain: Arc::clone(&self.saw_cached_chain),
            })?;
            if self.bad_phase {
                let handler = FnHandler::new(|_: &mut MessageContext| Ok(InvocationResponse::Continue));
                configuration.add_handler(
                    &Scope::Global,
                    Flow::In,
                    Arc::new(ChainEntry::new(HandlerDescription::new("late", "Dispatch"), Arc::new(handler))),
                )?;
                // Dropping Dispatch strands the handler declared above.
                configuration.declare_phases(PhaseOrder::uniform(&["Transport"]))?;
            }
            Ok(configuration)
        }
    }

    #[tokio::test]
    async fn modules_initialize_before_chains_resolve() {
        let saw = Arc::new(AtomicBool::new(false));
        let builder = EchoDeployment {
            saw_cached_chain: Arc::clone(&saw),
            bad_phase: false,
        };

        let configuration = ConfigurationFactory::create(&builder).await.unwrap();

        assert!(!saw.load(Ordering::SeqCst));
        assert!(configuration.modules().is_initialized("probe"));
        assert_eq!(configuration.cached_chain_count(), 4);
        ConfigurationFactory::shutdown(&configuration).await.unwrap();
    }

    #[tokio::test]
    async fn builder_errors_abort_bootstrap() {
        let builder = EchoDeployment {
            saw_cached_chain: Arc::new(AtomicBool::new(false)),
            bad_phase: true,
        };

        let err = ConfigurationFactory::create(&builder).await.err().unwrap();
        assert!(matches!(
            err,
            DeploymentError::Config(ConfigError::UnknownPhase { .. })
        ));
    }
}
