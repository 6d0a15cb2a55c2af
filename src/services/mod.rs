pub mod error;
pub mod event;
pub mod gateway;
pub mod microservice;
pub mod orchestrator;
pub mod registry;
pub mod runtime;
pub mod types;

pub use error::{ErrorCode, ServiceError};
pub use event::EventBus;
pub use gateway::ApiGateway;
pub use microservice::{Microservice, ServiceContext, ServiceHandler};
pub use orchestrator::Orchestrator;
pub use registry::ServiceRegistry;
pub use runtime::Runtime;
