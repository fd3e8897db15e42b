//! Shared deployment state: the configuration tree, module engagements,
//! declared handlers, and the resolved-chain cache.
//!
//! Every exchange reads from a `ConfigurationContext`; deployment-time
//! operations (engaging modules, declaring handlers, redeclaring phases)
//! write to it. Writes take the tree's write lock, validate every chain they
//! affect against the tentative state, roll back on error, and invalidate the
//! cached chains of the affected scope before releasing the lock. Chain
//! resolution inserts into the cache while holding the read lock, so a chain
//! resolved against a superseded configuration is never published.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use dashmap::DashMap;
use parking_lot::RwLock;
use phaseflow_core::{
    ChainEntry, ChainSource, ConfigError, ConfigTree, Flow, HandlerChain, NodeId, Parameter,
    PhaseOrder, PhaseResolver,
};
use tracing::{debug, info};

use super::module::{Module, Scope};
use super::registry::ModuleRegistry;
use super::transport::{TransportDescription, TransportListener, TransportRegistry, TransportSender};
use crate::config::EngineConfig;

// ---------------------------------------------------------------------------
// DeploymentError
// ---------------------------------------------------------------------------

/// Errors raised while deploying or bootstrapping a configuration.
#[derive(Debug, thiserror::Error)]
pub enum DeploymentError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("module '{module}' failed to initialize: {source}")]
    ModuleInit {
        module: String,
        #[source]
        source: anyhow::Error,
    },
}

// ---------------------------------------------------------------------------
// Internal state
// ---------------------------------------------------------------------------

/// Cache key for a resolved chain.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ChainKey {
    service: String,
    operation: String,
    flow: Flow,
}

/// Everything guarded by the deployment lock.
#[derive(Default)]
struct Deployment {
    tree: ConfigTree,
    /// Handlers declared directly on a node, per flow, in declaration order.
    declared: HashMap<(NodeId, Flow), Vec<Arc<ChainEntry>>>,
}

// ---------------------------------------------------------------------------
// ConfigurationContext
// ---------------------------------------------------------------------------

/// Runtime view of a deployed configuration.
pub struct ConfigurationContext {
    config: Arc<EngineConfig>,
    deployment: RwLock<Deployment>,
    phase_order: ArcSwap<PhaseOrder>,
    modules: ModuleRegistry,
    transports: TransportRegistry,
    chains: DashMap<ChainKey, Arc<HandlerChain>>,
    /// Bumped on every invalidation.
    generation: AtomicU64,
}

impl ConfigurationContext {
    /// Creates an empty configuration using `config.phase_order`.
    #[must_use]
    pub fn new(config: EngineConfig) -> Self {
        let phase_order = ArcSwap::from_pointee(config.phase_order.clone());
        Self {
            config: Arc::new(config),
            deployment: RwLock::new(Deployment::default()),
            phase_order,
            modules: ModuleRegistry::new(),
            transports: TransportRegistry::new(),
            chains: DashMap::new(),
            generation: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn modules(&self) -> &ModuleRegistry {
        &self.modules
    }

    pub fn transports(&self) -> &TransportRegistry {
        &self.transports
    }

    /// Current declared phase order.
    pub fn phase_order(&self) -> Arc<PhaseOrder> {
        self.phase_order.load_full()
    }

    /// Counter incremented each time cached chains are invalidated.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    // -- tree ---------------------------------------------------------------

    /// Registers a module and gives it a parameter node under the global root.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::AlreadyDeployed` if the name is taken.
    pub fn register_module<T: Module + 'static>(&self, module: T) -> Result<NodeId, ConfigError> {
        let name = module.name();
        let mut deployment = self.deployment.write();
        if self.modules.contains(name) || deployment.tree.module(name).is_some() {
            return Err(ConfigError::AlreadyDeployed {
                name: format!("module:{name}"),
            });
        }
        self.modules.register(module)?;
        deployment.tree.add_module(name)
    }

    /// Deploys a service.
    ///
    /// The new service inherits only global contributions, which are already
    /// known to resolve, so no validation is needed.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::AlreadyDeployed` if the service exists.
    pub fn add_service(&self, name: &str) -> Result<NodeId, ConfigError> {
        let node = self.deployment.write().tree.add_service(name)?;
        info!(service = name, "service deployed");
        Ok(node)
    }

    /// Deploys an operation under an existing service.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::UnknownService` or `ConfigError::AlreadyDeployed`.
    pub fn add_operation(&self, service: &str, operation: &str) -> Result<NodeId, ConfigError> {
        let node = self.deployment.write().tree.add_operation(service, operation)?;
        debug!(service, operation, "operation deployed");
        Ok(node)
    }

    /// Registers a transport node under the global root.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::AlreadyDeployed` if the transport exists.
    pub fn add_transport(&self, name: &str) -> Result<TransportDescription, ConfigError> {
        let node = self.deployment.write().tree.add_transport(name)?;
        Ok(TransportDescription::new(name, node))
    }

    pub fn register_listener(&self, description: TransportDescription, listener: Arc<dyn TransportListener>) {
        self.transports.register_listener(description, listener);
    }

    pub fn register_sender(&self, description: TransportDescription, sender: Arc<dyn TransportSender>) {
        self.transports.register_sender(description, sender);
    }

    /// Node backing `scope`.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::UnknownService` or `ConfigError::UnknownOperation`.
    pub fn node_id(&self, scope: &Scope) -> Result<NodeId, ConfigError> {
        scope_node(&self.deployment.read().tree, scope)
    }

    pub fn module_node(&self, name: &str) -> Option<NodeId> {
        self.deployment.read().tree.module(name)
    }

    pub fn services(&self) -> Vec<String> {
        let deployment = self.deployment.read();
        deployment.tree.services().into_iter().map(str::to_string).collect()
    }

    pub fn operations(&self, service: &str) -> Vec<String> {
        let deployment = self.deployment.read();
        deployment
            .tree
            .operations(service)
            .into_iter()
            .map(str::to_string)
            .collect()
    }

    // -- parameters ---------------------------------------------------------

    /// Adds a parameter to `node`, failing if an ancestor locked the name.
    ///
    /// # Errors
    ///
    /// - `ConfigError::LockedParameter` if an ancestor locked the name
    /// - `ConfigError::UnknownNode` if `node` was not issued by this configuration
    pub fn add_parameter(&self, node: NodeId, param: Parameter) -> Result<(), ConfigError> {
        self.deployment.write().tree.add_parameter(node, param)
    }

    /// Nearest definition of `name`, looking from `node` up to the root.
    pub fn parameter(&self, node: NodeId, name: &str) -> Option<Parameter> {
        self.deployment.read().tree.get_parameter(node, name).cloned()
    }

    pub fn is_locked(&self, node: NodeId, name: &str) -> bool {
        self.deployment.read().tree.is_locked(node, name)
    }

    // -- engagement ---------------------------------------------------------

    /// Engages `module` at `scope`.
    ///
    /// The module is initialized first if it has not been yet. Returns
    /// `Ok(false)` if the module was already engaged at exactly this scope.
    ///
    /// # Errors
    ///
    /// - `ConfigError::UnknownModule` / `UnknownService` / `UnknownOperation`
    /// - `DeploymentError::ModuleInit` if the module's `init` fails
    /// - any resolution error the engagement would introduce; the
    ///   engagement is rolled back in that case
    pub async fn engage(&self, module: &str, scope: &Scope) -> Result<bool, DeploymentError> {
        if !self.modules.contains(module) {
            return Err(ConfigError::UnknownModule {
                name: module.to_string(),
            }
            .into());
        }
        self.node_id(scope)?;
        self.modules.ensure_initialized(module, self).await?;

        let mut deployment = self.deployment.write();
        let node = scope_node(&deployment.tree, scope)?;
        if !deployment.tree.engage_module(node, module)? {
            debug!(module, %scope, "module already engaged");
            return Ok(false);
        }
        if let Err(err) = self.validate(&deployment, &self.phase_order.load(), scope, node) {
            deployment.tree.disengage_module(node, module)?;
            return Err(err.into());
        }
        self.invalidate(scope);
        info!(module, %scope, "module engaged");
        Ok(true)
    }

    /// Removes an engagement. Returns `Ok(false)` if `module` was not engaged at `scope`.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::UnknownService` or `ConfigError::UnknownOperation`.
    pub fn disengage(&self, module: &str, scope: &Scope) -> Result<bool, ConfigError> {
        let mut deployment = self.deployment.write();
        let node = scope_node(&deployment.tree, scope)?;
        if !deployment.tree.disengage_module(node, module)? {
            return Ok(false);
        }
        self.invalidate(scope);
        info!(module, %scope, "module disengaged");
        Ok(true)
    }

    /// Modules engaged at exactly `scope`, in engagement order.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::UnknownService` or `ConfigError::UnknownOperation`.
    pub fn engaged_modules(&self, scope: &Scope) -> Result<Vec<String>, ConfigError> {
        let deployment = self.deployment.read();
        let node = scope_node(&deployment.tree, scope)?;
        Ok(deployment
            .tree
            .node(node)
            .map(|n| n.engaged_modules().to_vec())
            .unwrap_or_default())
    }

    /// Declares a handler directly at `scope` for `flow`.
    ///
    /// # Errors
    ///
    /// Returns a lookup error for an unknown scope, or the resolution error
    /// the handler would introduce; the declaration is rolled back.
    pub fn add_handler(&self, scope: &Scope, flow: Flow, entry: Arc<ChainEntry>) -> Result<(), ConfigError> {
        let mut deployment = self.deployment.write();
        let node = scope_node(&deployment.tree, scope)?;
        let name = entry.name().to_string();
        deployment.declared.entry((node, flow)).or_default().push(entry);

        if let Err(err) = self.validate(&deployment, &self.phase_order.load(), scope, node) {
            if let Some(handlers) = deployment.declared.get_mut(&(node, flow)) {
                handlers.pop();
                if handlers.is_empty() {
                    deployment.declared.remove(&(node, flow));
                }
            }
            return Err(err);
        }
        self.invalidate(scope);
        info!(handler = %name, %flow, %scope, "handler declared");
        Ok(())
    }

    /// Replaces the declared phase order and invalidates every cached chain.
    ///
    /// # Errors
    ///
    /// Returns the first resolution error the new order would cause for any
    /// deployed scope; the previous order stays in effect.
    pub fn declare_phases(&self, order: PhaseOrder) -> Result<(), ConfigError> {
        let deployment = self.deployment.write();
        self.validate(&deployment, &order, &Scope::Global, NodeId::GLOBAL)?;
        self.phase_order.store(Arc::new(order));
        self.invalidate(&Scope::Global);
        info!("phase order redeclared");
        Ok(())
    }

    // -- chains -------------------------------------------------------------

    /// Resolved chain for `(service, operation, flow)`, from cache when possible.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::UnknownService` / `UnknownOperation` for an
    /// undeployed target, or a resolution error.
    pub fn chain(&self, service: &str, operation: &str, flow: Flow) -> Result<Arc<HandlerChain>, ConfigError> {
        let key = ChainKey {
            service: service.to_string(),
            operation: operation.to_string(),
            flow,
        };
        if let Some(chain) = self.chains.get(&key) {
            return Ok(Arc::clone(chain.value()));
        }

        let deployment = self.deployment.read();
        let node = scope_node(&deployment.tree, &Scope::operation(service, operation))?;
        let contributions = self.contributions(&deployment, node, flow);
        let order = self.phase_order.load();
        let chain = Arc::new(PhaseResolver::new(&order).resolve(flow, &contributions)?);
        debug!(service, operation, %flow, handlers = chain.len(), "chain cached");
        // Inserted under the read lock: invalidation cannot run concurrently.
        self.chains.insert(key, Arc::clone(&chain));
        Ok(chain)
    }

    /// The cached chain, without resolving.
    pub fn cached_chain(&self, service: &str, operation: &str, flow: Flow) -> Option<Arc<HandlerChain>> {
        let key = ChainKey {
            service: service.to_string(),
            operation: operation.to_string(),
            flow,
        };
        self.chains.get(&key).map(|chain| Arc::clone(chain.value()))
    }

    /// Number of chains currently cached.
    pub fn cached_chain_count(&self) -> usize {
        self.chains.len()
    }

    /// Resolves every chain for every deployed operation and flow.
    /// Returns the number of chains resolved.
    ///
    /// # Errors
    ///
    /// Returns the first resolution error.
    pub fn resolve_all(&self) -> Result<usize, ConfigError> {
        let targets: Vec<(String, String)> = {
            let deployment = self.deployment.read();
            deployment
                .tree
                .services()
                .into_iter()
                .flat_map(|service| {
                    deployment
                        .tree
                        .operations(service)
                        .into_iter()
                        .map(move |operation| (service.to_string(), operation.to_string()))
                })
                .collect()
        };

        let mut resolved = 0;
        for (service, operation) in &targets {
            for flow in Flow::ALL {
                self.chain(service, operation, flow)?;
                resolved += 1;
            }
        }
        Ok(resolved)
    }

    // -- internals ----------------------------------------------------------

    /// Contributions reaching `node` for `flow`: global first, then service,
    /// then operation. At each level engaged modules come before declared
    /// handlers. A module engaged at several levels contributes once, at the
    /// broadest.
    fn contributions(&self, deployment: &Deployment, node: NodeId, flow: Flow) -> Vec<Arc<ChainEntry>> {
        let mut path: Vec<NodeId> = deployment.tree.ancestry(node).collect();
        path.reverse();

        let mut seen_modules: HashSet<&str> = HashSet::new();
        let mut out = Vec::new();
        for id in path {
            let Some(config_node) = deployment.tree.node(id) else {
                continue;
            };
            for module in config_node.engaged_modules() {
                if seen_modules.insert(module.as_str()) {
                    out.extend(self.modules.contributions(module, flow));
                }
            }
            if let Some(handlers) = deployment.declared.get(&(id, flow)) {
                out.extend(handlers.iter().cloned());
            }
        }
        out
    }

    /// Resolves every chain affected by a change at `scope` against `order`.
    fn validate(
        &self,
        deployment: &Deployment,
        order: &PhaseOrder,
        scope: &Scope,
        node: NodeId,
    ) -> Result<(), ConfigError> {
        let resolver = PhaseResolver::new(order);
        for target in affected_nodes(&deployment.tree, scope, node) {
            for flow in Flow::ALL {
                let contributions = self.contributions(deployment, target, flow);
                resolver.resolve(flow, &contributions)?;
            }
        }
        Ok(())
    }

    /// Drops cached chains at `scope` and below. Callers hold the write lock.
    fn invalidate(&self, scope: &Scope) {
        let before = self.chains.len();
        match scope {
            Scope::Global => self.chains.clear(),
            Scope::Service(name) => self.chains.retain(|key, _| key.service != *name),
            Scope::Operation { service, operation } => self
                .chains
                .retain(|key, _| !(key.service == *service && key.operation == *operation)),
        }
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        debug!(
            %scope,
            dropped = before.saturating_sub(self.chains.len()),
            generation,
            "chain cache invalidated"
        );
    }
}

impl ChainSource for ConfigurationContext {
    fn chain(&self, service: &str, operation: &str, flow: Flow) -> Result<Arc<HandlerChain>, ConfigError> {
        ConfigurationContext::chain(self, service, operation, flow)
    }
}

fn scope_node(tree: &ConfigTree, scope: &Scope) -> Result<NodeId, ConfigError> {
    match scope {
        Scope::Global => Ok(NodeId::GLOBAL),
        Scope::Service(name) => tree
            .service(name)
            .ok_or_else(|| ConfigError::UnknownService { name: name.clone() }),
        Scope::Operation { service, operation } => {
            if tree.service(service).is_none() {
                return Err(ConfigError::UnknownService {
                    name: service.clone(),
                });
            }
            tree.operation(service, operation)
                .ok_or_else(|| ConfigError::UnknownOperation {
                    service: service.clone(),
                    operation: operation.clone(),
                })
        }
    }
}

/// `node` and every service/operation node below it.
fn affected_nodes(tree: &ConfigTree, scope: &Scope, node: NodeId) -> Vec<NodeId> {
    let services: Vec<&str> = match scope {
        Scope::Global => tree.services(),
        Scope::Service(name) => vec![name.as_str()],
        Scope::Operation { .. } => return vec![node],
    };
    let mut nodes = vec![node];
    for service in services {
        if let Some(id) = tree.service(service) {
            if id != node {
                nodes.push(id);
            }
        }
        nodes.extend(
            tree.operations(service)
                .into_iter()
                .filter_map(|operation| tree.operation(service, operation)),
        );
    }
    nodes
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
