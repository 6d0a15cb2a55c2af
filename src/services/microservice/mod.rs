//! Microservice base behaviour
//!
//! - `context`: the per-service hooks trait and the runtime context handed to them
//! - `service`: lifecycle, request pipeline and health aggregation
//! - `retry` / `circuit_breaker`: the resilience primitives used by the pipeline
//! - `health`: named probes and their aggregation

pub mod circuit_breaker;
pub mod context;
pub mod health;
pub mod retry;
pub mod service;

pub use circuit_breaker::{CallPermit, CircuitBreaker, CircuitState};
pub use context::{ServiceContext, ServiceHandler};
pub use health::{HealthCheck, HealthProbe, MEMORY_USAGE_THRESHOLD, health_probe, memory_probe};
pub use retry::{RetryOutcome, execute_with_retry};
pub use service::{Microservice, ServiceMetrics};
