use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use phaseflow_core::{ChainEntry, ConfigError, Flow};
use tokio::sync::OnceCell;
use tracing::info;

use super::configuration::{ConfigurationContext, DeploymentError};
use super::module::Module;

// ---------------------------------------------------------------------------
// RegisteredModule
// ---------------------------------------------------------------------------

/// A module together with its handler contributions and init state.
struct RegisteredModule {
    module: Arc<dyn Module>,
    /// Snapshot of `Module::handlers` per flow, taken at registration.
    contributions: BTreeMap<Flow, Vec<Arc<ChainEntry>>>,
    initialized: OnceCell<()>,
}

// ---------------------------------------------------------------------------
// ModuleRegistry
// ---------------------------------------------------------------------------

/// Registry of deployable modules, keyed by module name.
///
/// Several modules may share a Rust type and differ only in name, so every
/// lookup goes through the name. Modules are initialized at most once per registry, in registration order
/// for `init_all`, and shut down in reverse registration order.
pub struct ModuleRegistry {
    /// Name-based lookup: module name -> registered module.
    by_name: DashMap<&'static str, Arc<RegisteredModule>>,
    /// Registration order for deterministic init/shutdown sequencing.
    init_order: RwLock<Vec<&'static str>>,
}

impl ModuleRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            by_name: DashMap::new(),
            init_order: RwLock::new(Vec::new()),
        }
    }

    /// Register a module. Its handler contributions are captured now.
    ///
    /// Deployment goes through `ConfigurationContext::register_module`, which
    /// also gives the module its parameter node.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::AlreadyDeployed` if a module with the same name
    /// is already registered.
    pub(crate) fn register<T: Module + 'static>(&self, module: T) -> Result<(), ConfigError> {
        let name = module.name();
        if self.by_name.contains_key(name) {
            return Err(ConfigError::AlreadyDeployed {
                name: format!("module:{name}"),
            });
        }

        let contributions = Flow::ALL
            .into_iter()
            .map(|flow| (flow, module.handlers(flow)))
            .collect();
        self.by_name.insert(
            name,
            Arc::new(RegisteredModule {
                module: Arc::new(module),
                contributions,
                initialized: OnceCell::new(),
            }),
        );
        self.init_order.write().push(name);
        Ok(())
    }

    /// Retrieve a module by its name.
    pub fn get_by_name(&self, name: &str) -> Option<Arc<dyn Module>> {
        self.by_name
            .get(name)
            .map(|entry| Arc::clone(&entry.value().module))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    /// Names of every registered module, in registration order.
    pub fn names(&self) -> Vec<&'static str> {
        self.init_order.read().clone()
    }

    /// Handlers the named module contributes to `flow`.
    pub fn contributions(&self, name: &str, flow: Flow) -> Vec<Arc<ChainEntry>> {
        self.by_name
            .get(name)
            .and_then(|entry| entry.value().contributions.get(&flow).cloned())
            .unwrap_or_default()
    }

    /// Returns `true` once the named module's `init` has succeeded.
    pub fn is_initialized(&self, name: &str) -> bool {
        self.by_name
            .get(name)
            .is_some_and(|entry| entry.value().initialized.initialized())
    }

    /// Runs the named module's `init` unless it already succeeded.
    ///
    /// Concurrent callers wait for the same initialization; a failed init
    /// is retried by the next caller.
    ///
    /// # Errors
    ///
    /// Returns `DeploymentError::Config` for an unknown module and
    /// `DeploymentError::ModuleInit` if `init` fails.
    pub async fn ensure_initialized(
        &self,
        name: &str,
        configuration: &ConfigurationContext,
    ) -> Result<(), DeploymentError> {
        let registered = self
            .by_name
            .get(name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| ConfigError::UnknownModule {
                name: name.to_string(),
            })?;

        registered
            .initialized
            .get_or_try_init(|| async {
                registered.module.init(configuration).await?;
                info!(module = name, "module initialized");
                Ok::<(), anyhow::Error>(())
            })
            .await
            .map_err(|source| DeploymentError::ModuleInit {
                module: name.to_string(),
                source,
            })?;
        Ok(())
    }

    /// Initialize all registered modules in registration order.
    ///
    /// # Errors
    ///
    /// Returns the first module initialization failure.
    pub async fn init_all(&self, configuration: &ConfigurationContext) -> Result<(), DeploymentError> {
        let order = self.init_order.read().clone();
        for name in order {
            self.ensure_initialized(name, configuration).await?;
        }
        Ok(())
    }

    /// Shut down all registered modules in reverse registration order.
    ///
    /// # Errors
    ///
    /// Returns an error if any module's `shutdown()` call fails.
    pub async fn shutdown_all(&self) -> anyhow::Result<()> {
        let order = self.init_order.read().clone();
        for name in order.iter().rev() {
            if let Some(module) = self.get_by_name(name) {
                module.shutdown().await?;
            }
        }
        Ok(())
    }
}

impl Default for ModuleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
