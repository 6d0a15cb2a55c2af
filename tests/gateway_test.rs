use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use procurement_mesh::services::error::ErrorCode;
use procurement_mesh::services::gateway::{
    ApiGateway, CORS, GATEWAY_MARKER, GatewayConfig, Middleware, Next, RATE_LIMIT, RouteOptions,
    ServiceEndpoint,
};
use procurement_mesh::services::registry::ServiceRegistry;
use procurement_mesh::services::types::{
    HEADER_CLIENT_ID, HEADER_GATEWAY, HealthReport, HealthStatus, Method, ServiceDescriptor,
    ServiceRequest, ServiceResponse,
};

/// 回显服务名、路径参数和网关标记
struct EchoEndpoint {
    name: &'static str,
}

#[async_trait]
impl ServiceEndpoint for EchoEndpoint {
    async fn process_request(&self, request: ServiceRequest) -> ServiceResponse {
        ServiceResponse::ok(json!({
            "service": self.name,
            "params": request.params,
            "forwardedBy": request.header(HEADER_GATEWAY),
            "trace": request.header("x-trace"),
        }))
    }
}

/// 在请求头 `x-trace` 上追加自己的名字
struct TraceMiddleware {
    name: &'static str,
    seen: Arc<Mutex<Vec<&'static str>>>,
}

#[async_trait]
impl Middleware for TraceMiddleware {
    fn name(&self) -> &str {
        self.name
    }

    async fn handle(&self, mut request: ServiceRequest, next: Next<'_>) -> ServiceResponse {
        self.seen.lock().unwrap().push(self.name);
        let trace = match request.header("x-trace") {
            Some(existing) => format!("{existing},{}", self.name),
            None => self.name.to_string(),
        };
        request.headers.insert("x-trace".to_string(), trace);
        next.run(request).await
    }
}

/// 处理请求时直接 panic
struct PanickingMiddleware;

#[async_trait]
impl Middleware for PanickingMiddleware {
    fn name(&self) -> &str {
        "panicking"
    }

    async fn handle(&self, _request: ServiceRequest, _next: Next<'_>) -> ServiceResponse {
        panic!("middleware exploded")
    }
}

fn gateway_with(config: GatewayConfig, services: &[&'static str]) -> ApiGateway {
    let registry = ServiceRegistry::default();
    let gateway = ApiGateway::new(registry.clone(), config);
    for &name in services {
        registry.register(ServiceDescriptor::new(name, "1.0.0"));
        gateway.bind_endpoint(name, Arc::new(EchoEndpoint { name }));
    }
    gateway
}

fn get(endpoint: &str) -> ServiceRequest {
    ServiceRequest::new(Method::Get, endpoint)
}

#[tokio::test]
async fn test_first_registered_route_wins() {
    let gateway = gateway_with(GatewayConfig::default(), &["first", "second"]);
    gateway
        .add_route("/api/orders/:id", "first", RouteOptions::default())
        .unwrap();
    gateway
        .add_route("/api/orders/*", "second", RouteOptions::default())
        .unwrap();

    let response = gateway.route(get("/api/orders/42")).await;
    let data = response.data().expect("routed");
    assert_eq!(data["service"], "first");
    assert_eq!(data["params"]["id"], "42");
    assert_eq!(data["forwardedBy"], GATEWAY_MARKER);
    assert!(!response.metadata.request_id.is_empty());

    // 只有通配路由能匹配更深的路径
    let response = gateway.route(get("/api/orders/42/lines/7")).await;
    let data = response.data().expect("routed");
    assert_eq!(data["service"], "second");
    assert_eq!(data["params"]["*"], "42/lines/7");
}

#[tokio::test]
async fn test_route_miss_and_method_mismatch() {
    let gateway = gateway_with(GatewayConfig::default(), &["orders"]);
    gateway
        .add_route(
            "/api/orders/:id",
            "orders",
            RouteOptions::default().methods([Method::Get]),
        )
        .unwrap();

    let missing = gateway.route(get("/api/unknown")).await;
    let err = missing.error().expect("no route");
    assert_eq!(err.code, ErrorCode::RouteNotFound);
    assert_eq!(err.status_code, 404);

    let wrong_method = gateway
        .route(ServiceRequest::new(Method::Delete, "/api/orders/1"))
        .await;
    let err = wrong_method.error().expect("method not allowed");
    assert_eq!(err.code, ErrorCode::MethodNotAllowed);
    assert_eq!(err.status_code, 405);
}

#[tokio::test]
async fn test_unhealthy_or_unbound_service_is_unavailable() {
    let registry = ServiceRegistry::default();
    let gateway = ApiGateway::new(registry.clone(), GatewayConfig::default());
    gateway
        .add_route("/api/vendors/*", "vendor-service", RouteOptions::default())
        .unwrap();

    // 未注册
    let response = gateway.route(get("/api/vendors")).await;
    assert_eq!(response.error().unwrap().code, ErrorCode::ServiceUnavailable);

    // 已注册但不健康
    registry.register(ServiceDescriptor::new("vendor-service", "1.0.0"));
    gateway.bind_endpoint("vendor-service", Arc::new(EchoEndpoint { name: "vendor-service" }));
    registry
        .update_health(
            "vendor-service",
            HealthReport::new(HealthStatus::Unhealthy, Vec::new()),
        )
        .unwrap();
    let response = gateway.route(get("/api/vendors")).await;
    assert_eq!(response.status_code(), 503);
    assert!(response.error().unwrap().retryable);

    // 恢复后可以访问
    registry
        .update_health(
            "vendor-service",
            HealthReport::new(HealthStatus::Healthy, Vec::new()),
        )
        .unwrap();
    assert!(gateway.route(get("/api/vendors")).await.is_success());
}

#[tokio::test(start_paused = true)]
async fn test_rate_limit_rejects_101st_request_until_window_elapses() {
    let gateway = gateway_with(GatewayConfig::default(), &["orders"]);
    gateway
        .add_route(
            "/api/orders/*",
            "orders",
            RouteOptions::default().middleware(RATE_LIMIT),
        )
        .unwrap();

    let request = || get("/api/orders").with_header(HEADER_CLIENT_ID, "client-1");
    for i in 0..100 {
        let response = gateway.route(request()).await;
        assert!(response.is_success(), "request {i} should pass");
    }

    let limited = gateway.route(request()).await;
    let err = limited.error().expect("101st request must be limited");
    assert_eq!(err.code, ErrorCode::RateLimitExceeded);
    assert_eq!(err.status_code, 429);

    // 其他客户端不受影响
    let other = gateway
        .route(get("/api/orders").with_header(HEADER_CLIENT_ID, "client-2"))
        .await;
    assert!(other.is_success());

    tokio::time::advance(Duration::from_secs(61)).await;
    assert!(gateway.route(request()).await.is_success());
}

#[tokio::test]
async fn test_global_middleware_runs_before_route_middleware() {
    let gateway = gateway_with(GatewayConfig::default(), &["orders"]);
    let seen = Arc::new(Mutex::new(Vec::new()));
    for name in ["audit", "auth", "tenant"] {
        gateway
            .middleware(Arc::new(TraceMiddleware {
                name,
                seen: seen.clone(),
            }))
            .unwrap();
    }
    assert!(gateway.add_global_middleware("audit"));
    assert!(!gateway.add_global_middleware("audit"));
    assert!(!gateway.add_global_middleware("missing"));

    gateway
        .add_route(
            "/api/orders/*",
            "orders",
            RouteOptions::default().middleware("tenant").middleware("auth"),
        )
        .unwrap();

    let response = gateway.route(get("/api/orders/1")).await;
    assert_eq!(response.data().unwrap()["trace"], "audit,tenant,auth");
    assert_eq!(*seen.lock().unwrap(), vec!["audit", "tenant", "auth"]);

    assert!(gateway.remove_global_middleware("audit"));
    let response = gateway.route(get("/api/orders/1")).await;
    assert_eq!(response.data().unwrap()["trace"], "tenant,auth");
}

#[tokio::test]
async fn test_middleware_panic_becomes_gateway_error() {
    let gateway = gateway_with(GatewayConfig::default(), &["orders"]);
    gateway.middleware(Arc::new(PanickingMiddleware)).unwrap();
    gateway
        .add_route(
            "/api/orders/*",
            "orders",
            RouteOptions::default().middleware("panicking"),
        )
        .unwrap();
    gateway
        .add_route("/api/vendors/*", "orders", RouteOptions::default())
        .unwrap();

    let response = gateway.route(get("/api/orders/1")).await;
    let err = response.error().expect("pipeline failure");
    assert_eq!(err.code, ErrorCode::GatewayError);
    assert_eq!(response.status_code(), 500);
    assert!(!response.metadata.request_id.is_empty());

    let stats = gateway.stats();
    assert_eq!(stats.total_requests, 1);
    assert_eq!(stats.failed_requests, 1);
    assert_eq!(stats.requests_by_service.get("orders"), Some(&1));

    // 网关在 panic 之后继续正常服务
    assert!(gateway.route(get("/api/vendors/1")).await.is_success());
}

#[tokio::test]
async fn test_cors_annotates_response_headers() {
    let config = GatewayConfig {
        cors_allowed_origins: vec!["https://buyer.example".to_string()],
        ..GatewayConfig::default()
    };
    let gateway = gateway_with(config, &["orders"]);
    gateway
        .add_route("/api/orders/*", "orders", RouteOptions::default().middleware(CORS))
        .unwrap();

    let allowed = gateway
        .route(get("/api/orders").with_header("origin", "https://buyer.example"))
        .await;
    assert_eq!(
        allowed
            .metadata
            .headers
            .get("access-control-allow-origin")
            .map(String::as_str),
        Some("https://buyer.example")
    );

    let denied = gateway
        .route(get("/api/orders").with_header("origin", "https://evil.example"))
        .await;
    assert!(denied.is_success());
    assert!(!denied.metadata.headers.contains_key("access-control-allow-origin"));
}

#[tokio::test]
async fn test_stats_and_health_track_outcomes() {
    let gateway = gateway_with(GatewayConfig::default(), &["orders"]);
    gateway
        .add_route("/api/orders/*", "orders", RouteOptions::default())
        .unwrap();

    for _ in 0..9 {
        assert!(gateway.route(get("/api/orders")).await.is_success());
    }
    assert!(!gateway.route(get("/api/missing")).await.is_success());

    let stats = gateway.stats();
    assert_eq!(stats.total_requests, 10);
    assert_eq!(stats.successful_requests, 9);
    assert_eq!(stats.failed_requests, 1);
    assert!((stats.error_rate - 10.0).abs() < f64::EPSILON);
    assert_eq!(stats.requests_by_service.get("orders"), Some(&9));
    assert_eq!(stats.routes.len(), 1);
    assert_eq!(stats.global_middleware, vec!["logging".to_string()]);

    // 10% 错误率为 degraded（超过 10% 才是 unhealthy）
    assert_eq!(gateway.health_check().status, HealthStatus::Degraded);
    assert!(!gateway.route(get("/api/missing")).await.is_success());
    assert_eq!(gateway.health_check().status, HealthStatus::Unhealthy);

    assert!(gateway.remove_route("/api/orders/*"));
    assert!(gateway.stats().routes.is_empty());
}

#[tokio::test]
async fn test_invalid_patterns_are_rejected() {
    let gateway = gateway_with(GatewayConfig::default(), &[]);
    assert!(gateway.add_route("api/orders", "x", RouteOptions::default()).is_err());
    assert!(gateway.add_route("/api/*/orders", "x", RouteOptions::default()).is_err());
    assert!(gateway.add_route("/api/:/orders", "x", RouteOptions::default()).is_err());
}
