pub mod error;
pub mod forwarder;
pub mod metrics;
pub mod middleware;
pub mod route;
pub mod service;

pub use error::GatewayError;
pub use forwarder::{GATEWAY_MARKER, ServiceEndpoint};
pub use metrics::GatewayStats;
pub use middleware::{
    CORS, CorsMiddleware, LOGGING, LoggingMiddleware, Middleware, Next, RATE_LIMIT,
    RateLimitMiddleware,
};
pub use route::{Route, RouteInfo, RouteOptions, RoutePattern};
pub use service::{ApiGateway, GatewayConfig};
