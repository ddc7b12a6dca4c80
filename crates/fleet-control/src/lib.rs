//! Panel control plane: fleet registry and the node-facing control server
pub mod config;
pub mod registry;
pub mod server;
pub mod session;
pub mod store;
pub mod tracker;

pub use config::{ConfigError, PanelConfigFile};
pub use registry::{health_at, FleetRegistry, RegistryConfig, RegistryError};
pub use server::{ControlServer, ControlServerConfig};
pub use session::{NodeSession, SessionError};
pub use store::{RegistrySnapshot, RegistryStore, StoredNode, REGISTRY_FILE};
pub use tracker::SessionTracker;
