//! Service registry module
//!
//! The registry is split into logical components:
//! - `types`: entries, configuration and the health-source seam
//! - `service`: registration, discovery and on-demand health checks
//! - `cleanup`: the periodic health ticker and stale-entry eviction

pub mod cleanup;
pub mod service;
pub mod types;

// Re-export public types for easier access
pub use service::ServiceRegistry;
pub use types::{HealthSource, RegistryConfig, RegistryEntry, RegistryError, RegistryStats};
