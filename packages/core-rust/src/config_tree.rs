//! Hierarchical configuration nodes with parameter inheritance and locking.
//!
//! The tree is an arena: every node is addressed by a [`NodeId`] and holds
//! the id of its parent rather than a live reference. Lookups walk from a
//! node towards the global root and return the nearest definition. Locks
//! only constrain descendants; a child can never alter its ancestors.

use std::collections::HashMap;
use std::fmt;

use crate::error::ConfigError;
use crate::parameter::{Parameter, ParameterStore};

/// Index of a node inside a [`ConfigTree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

impl NodeId {
    /// The global configuration root, present in every tree.
    pub const GLOBAL: NodeId = NodeId(0);
}

/// What a configuration node describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Global,
    Module,
    Service,
    Operation,
    Transport,
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Global => "global",
            Self::Module => "module",
            Self::Service => "service",
            Self::Operation => "operation",
            Self::Transport => "transport",
        };
        f.write_str(label)
    }
}

/// One entity in the configuration hierarchy.
#[derive(Debug, Clone)]
pub struct ConfigNode {
    kind: NodeKind,
    name: String,
    parent: Option<NodeId>,
    parameters: ParameterStore,
    engaged: Vec<String>,
}

impl ConfigNode {
    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    /// Parameters defined directly on this node (not inherited ones).
    pub fn parameters(&self) -> &ParameterStore {
        &self.parameters
    }

    /// Module names engaged at this node, in engagement order.
    pub fn engaged_modules(&self) -> &[String] {
        &self.engaged
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ChildKey {
    parent: NodeId,
    kind: NodeKind,
    name: String,
}

/// Arena-backed configuration tree rooted at the global node.
#[derive(Debug, Clone)]
pub struct ConfigTree {
    nodes: Vec<ConfigNode>,
    children: HashMap<ChildKey, NodeId>,
}

impl ConfigTree {
    /// Creates a tree containing only the global root.
    #[must_use]
    pub fn new() -> Self {
        Self {
            nodes: vec![ConfigNode {
                kind: NodeKind::Global,
                name: "global".to_string(),
                parent: None,
                parameters: ParameterStore::new(),
                engaged: Vec::new(),
            }],
            children: HashMap::new(),
        }
    }

    pub fn node(&self, id: NodeId) -> Option<&ConfigNode> {
        self.nodes.get(id.0)
    }

    /// Registers a module node under the global root.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::AlreadyDeployed` if a module with this name exists.
    pub fn add_module(&mut self, name: &str) -> Result<NodeId, ConfigError> {
        self.attach(NodeId::GLOBAL, NodeKind::Module, name)
    }

    /// Registers a service node under the global root.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::AlreadyDeployed` if a service with this name exists.
    pub fn add_service(&mut self, name: &str) -> Result<NodeId, ConfigError> {
        self.attach(NodeId::GLOBAL, NodeKind::Service, name)
    }

    /// Registers a transport node under the global root.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::AlreadyDeployed` if a transport with this name exists.
    pub fn add_transport(&mut self, name: &str) -> Result<NodeId, ConfigError> {
        self.attach(NodeId::GLOBAL, NodeKind::Transport, name)
    }

    /// Registers an operation node under the named service.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::UnknownService` if the service is not deployed,
    /// or `ConfigError::AlreadyDeployed` if the operation already exists.
    pub fn add_operation(&mut self, service: &str, name: &str) -> Result<NodeId, ConfigError> {
        let service_id = self
            .service(service)
            .ok_or_else(|| ConfigError::UnknownService {
                name: service.to_string(),
            })?;
        self.attach(service_id, NodeKind::Operation, name)
    }

    pub fn module(&self, name: &str) -> Option<NodeId> {
        self.child(NodeId::GLOBAL, NodeKind::Module, name)
    }

    pub fn service(&self, name: &str) -> Option<NodeId> {
        self.child(NodeId::GLOBAL, NodeKind::Service, name)
    }

    pub fn transport(&self, name: &str) -> Option<NodeId> {
        self.child(NodeId::GLOBAL, NodeKind::Transport, name)
    }

    pub fn operation(&self, service: &str, name: &str) -> Option<NodeId> {
        let service_id = self.service(service)?;
        self.child(service_id, NodeKind::Operation, name)
    }

    /// Names of every deployed service, in deployment order.
    pub fn services(&self) -> Vec<&str> {
        self.children_of(NodeId::GLOBAL, NodeKind::Service)
    }

    /// Names of every operation under `service`, in deployment order.
    pub fn operations(&self, service: &str) -> Vec<&str> {
        match self.service(service) {
            Some(id) => self.children_of(id, NodeKind::Operation),
            None => Vec::new(),
        }
    }

    /// Adds or replaces a parameter on `node`.
    ///
    /// The lock check and the insert happen under the same `&mut self`
    /// borrow, so callers sharing the tree behind a write lock get an
    /// atomic check-then-insert.
    ///
    /// # Errors
    ///
    /// - `ConfigError::LockedParameter` if `param.name` is locked on `node`
    ///   or any of its ancestors
    /// - `ConfigError::UnknownNode` if `node` was not issued by this tree
    pub fn add_parameter(&mut self, node: NodeId, param: Parameter) -> Result<(), ConfigError> {
        self.check(node)?;
        if let Some(owner) = self.locking_node(node, &param.name) {
            return Err(ConfigError::LockedParameter {
                name: param.name,
                node: self.path(node),
                locked_by: self.path(owner),
            });
        }
        self.node_mut(node)?.parameters.insert(param);
        Ok(())
    }

    /// Returns the nearest definition of `name`, walking from `node` to the root.
    pub fn get_parameter(&self, node: NodeId, name: &str) -> Option<&Parameter> {
        self.ancestry(node)
            .find_map(|id| self.nodes[id.0].parameters.get(name))
    }

    /// Returns `true` if `node` or any ancestor defines `name` as locked.
    pub fn is_locked(&self, node: NodeId, name: &str) -> bool {
        self.locking_node(node, name).is_some()
    }

    /// Records `module` as engaged at `node`. Returns `false` if it already was.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::UnknownNode` if `node` was not issued by this tree.
    pub fn engage_module(&mut self, node: NodeId, module: &str) -> Result<bool, ConfigError> {
        let engaged = &mut self.node_mut(node)?.engaged;
        if engaged.iter().any(|m| m == module) {
            return Ok(false);
        }
        engaged.push(module.to_string());
        Ok(true)
    }

    /// Removes `module` from `node`'s engagements. Returns `false` if it was not engaged.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::UnknownNode` if `node` was not issued by this tree.
    pub fn disengage_module(&mut self, node: NodeId, module: &str) -> Result<bool, ConfigError> {
        let engaged = &mut self.node_mut(node)?.engaged;
        let before = engaged.len();
        engaged.retain(|m| m != module);
        Ok(engaged.len() != before)
    }

    /// Iterates over `node` and its ancestors, nearest first.
    pub fn ancestry(&self, node: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        std::iter::successors(self.node(node).map(|_| node), move |id| {
            self.nodes[id.0].parent
        })
    }

    /// Human-readable location used in error messages, e.g.
    /// `global/service:echo/operation:ping`.
    pub fn path(&self, node: NodeId) -> String {
        let mut segments: Vec<String> = self
            .ancestry(node)
            .map(|id| {
                let n = &self.nodes[id.0];
                match n.kind {
                    NodeKind::Global => n.name.clone(),
                    kind => format!("{kind}:{}", n.name),
                }
            })
            .collect();
        segments.reverse();
        segments.join("/")
    }

    fn check(&self, node: NodeId) -> Result<(), ConfigError> {
        if node.0 < self.nodes.len() {
            Ok(())
        } else {
            Err(ConfigError::UnknownNode { index: node.0 })
        }
    }

    fn node_mut(&mut self, node: NodeId) -> Result<&mut ConfigNode, ConfigError> {
        self.nodes
            .get_mut(node.0)
            .ok_or(ConfigError::UnknownNode { index: node.0 })
    }

    fn locking_node(&self, node: NodeId, name: &str) -> Option<NodeId> {
        self.ancestry(node)
            .find(|id| self.nodes[id.0].parameters.is_locked(name))
    }

    fn attach(&mut self, parent: NodeId, kind: NodeKind, name: &str) -> Result<NodeId, ConfigError> {
        let key = ChildKey {
            parent,
            kind,
            name: name.to_string(),
        };
        if self.children.contains_key(&key) {
            return Err(ConfigError::AlreadyDeployed {
                name: format!("{}/{kind}:{name}", self.path(parent)),
            });
        }
        let id = NodeId(self.nodes.len());
        self.nodes.push(ConfigNode {
            kind,
            name: name.to_string(),
            parent: Some(parent),
            parameters: ParameterStore::new(),
            engaged: Vec::new(),
        });
        self.children.insert(key, id);
        Ok(id)
    }

    fn child(&self, parent: NodeId, kind: NodeKind, name: &str) -> Option<NodeId> {
        self.children
            .get(&ChildKey {
                parent,
                kind,
                name: name.to_string(),
            })
            .copied()
    }

    fn children_of(&self, parent: NodeId, kind: NodeKind) -> Vec<&str> {
        // Node ids grow monotonically, so arena order is deployment order.
        self.nodes
            .iter()
            .filter(|n| n.parent == Some(parent) && n.kind == kind)
            .map(|n| n.name.as_str())
            .collect()
    }
}

impl Default for ConfigTree {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
