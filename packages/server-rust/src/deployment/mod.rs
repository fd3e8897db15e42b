//! Deployment: modules, the shared configuration, transports, and bootstrap.
//!
//! 1. **Modules** (`module`, `registry`): handler bundles initialized once
//! 2. **Configuration** (`configuration`): tree, engagements, chain cache
//! 3. **Transports** (`transport`): listener/sender descriptions and lifecycle
//! 4. **Bootstrap** (`factory`): module init, chain resolution, transport init

pub mod configuration;
pub mod factory;
pub mod module;
pub mod registry;
pub mod transport;

pub use configuration::{ConfigurationContext, DeploymentError};
pub use factory::{ConfigurationBuilder, ConfigurationFactory};
pub use module::{Module, Scope};
pub use registry::ModuleRegistry;
pub use transport::{TransportDescription, TransportListener, TransportRegistry, TransportSender};
