//! Fleet node agent
//!
//! Dials the panel over the mutually-trusted control channel, stores the
//! desired tunnel set it pushes, and reconciles the forwarder processes on
//! this host toward it. Observed state flows back to the panel and is served
//! on a local read-only status API.

pub mod agent;
pub mod config;
pub mod desired;
pub mod reconcile;
pub mod runtime;
pub mod status;
pub mod supervisor;

pub use agent::{AgentConfig, AgentError, ChannelState, NodeAgent};
pub use config::{validate_address, ConfigError, NodeConfigFile};
pub use desired::{DesiredError, DesiredSet, DesiredStore, PushOutcome};
pub use reconcile::{plan, Action, Reconciler, ReconcilerConfig, RetryPolicy, StatusReport};
pub use runtime::run_node;
pub use status::{NodeStatus, StatusState};
pub use supervisor::{Supervisor, SupervisorConfig, SupervisorError};
