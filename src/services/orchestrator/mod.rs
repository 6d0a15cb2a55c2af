//! Orchestrator module
//!
//! - `catalog`: service declarations and dependency ordering
//! - `service`: the start/stop state machine, health poller and metrics
//! - `shutdown`: signal handling for graceful process exit

pub mod catalog;
pub mod service;
pub mod shutdown;
pub mod types;

pub use catalog::{RouteSpec, ServiceFactory, ServiceSpec, resolve_start_order};
pub use service::Orchestrator;
pub use shutdown::{install_shutdown_hook, shutdown_exit_code, wait_for_shutdown_signal};
pub use types::{
    ORCHESTRATOR_SOURCE, OrchestratorConfig, OrchestratorError, OrchestratorHealth,
    OrchestratorMetrics, OrchestratorState,
};
