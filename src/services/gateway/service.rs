use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use super::error::GatewayError;
use super::forwarder::{ServiceEndpoint, enrich_request, forward_request};
use super::metrics::{GatewayMetrics, GatewayStats};
use super::middleware::{
    CorsMiddleware, LOGGING, LoggingMiddleware, Middleware, RateLimitMiddleware,
};
use super::route::{Route, RouteOptions, RoutePattern};
use crate::services::error::ServiceError;
use crate::services::registry::ServiceRegistry;
use crate::services::types::{
    CheckResult, CheckStatus, HealthReport, HealthStatus, ServiceRequest, ServiceResponse,
};

/// 网关配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub enabled: bool,
    /// 每个客户端在一个窗口内允许的请求数
    pub rate_limit_max_requests: u32,
    pub rate_limit_window_secs: u64,
    pub cors_allowed_origins: Vec<String>,
    /// 平均响应时间超过该值时视为 degraded（毫秒）
    pub slow_response_threshold_ms: u64,
}

impl GatewayConfig {
    pub fn rate_limit_window(&self) -> Duration {
        Duration::from_secs(self.rate_limit_window_secs)
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            rate_limit_max_requests: 100,
            rate_limit_window_secs: 60,
            cors_allowed_origins: vec!["*".to_string()],
            slow_response_threshold_ms: 2000,
        }
    }
}

/// API 网关：按路由表匹配请求路径，经中间件链分发到目标服务
#[derive(Clone)]
pub struct ApiGateway {
    registry: ServiceRegistry,
    /// 按注册顺序匹配，先匹配者胜出
    routes: Arc<RwLock<Vec<Route>>>,
    /// 可按名称挂载到路由上的中间件
    middleware: Arc<DashMap<String, Arc<dyn Middleware>>>,
    global_middleware: Arc<RwLock<Vec<Arc<dyn Middleware>>>>,
    /// 服务名 -> 请求分发目标
    endpoints: Arc<DashMap<String, Arc<dyn ServiceEndpoint>>>,
    metrics: Arc<Mutex<GatewayMetrics>>,
    config: GatewayConfig,
}

impl fmt::Debug for ApiGateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiGateway")
            .field("routes", &self.read_routes().len())
            .field("middleware", &self.middleware.len())
            .field("endpoints", &self.endpoints.len())
            .field("config", &self.config)
            .finish()
    }
}

impl ApiGateway {
    /// 创建网关，注册内置中间件，并默认挂载全局日志中间件
    pub fn new(registry: ServiceRegistry, config: GatewayConfig) -> Self {
        let gateway = Self {
            registry,
            routes: Arc::new(RwLock::new(Vec::new())),
            middleware: Arc::new(DashMap::new()),
            global_middleware: Arc::new(RwLock::new(Vec::new())),
            endpoints: Arc::new(DashMap::new()),
            metrics: Arc::new(Mutex::new(GatewayMetrics::default())),
            config,
        };

        let logging: Arc<dyn Middleware> = Arc::new(LoggingMiddleware);
        let builtins: [Arc<dyn Middleware>; 3] = [
            logging.clone(),
            Arc::new(RateLimitMiddleware::new(
                gateway.config.rate_limit_max_requests,
                gateway.config.rate_limit_window(),
            )),
            Arc::new(CorsMiddleware::new(gateway.config.cors_allowed_origins.clone())),
        ];
        for middleware in builtins {
            gateway
                .middleware
                .insert(middleware.name().to_string(), middleware);
        }
        gateway.write_global().push(logging);

        gateway
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    // 添加路由
    pub fn add_route(
        &self,
        pattern: &str,
        service_name: &str,
        options: RouteOptions,
    ) -> Result<(), GatewayError> {
        let route = Route {
            pattern: RoutePattern::parse(pattern)?,
            service_name: service_name.to_string(),
            options,
        };
        tracing::info!(
            pattern = %pattern,
            service_name = %service_name,
            methods = ?route.options.methods,
            middleware = ?route.options.middleware,
            "Added gateway route"
        );
        self.write_routes().push(route);
        Ok(())
    }

    /// 删除第一个模式字符串相同的路由
    pub fn remove_route(&self, pattern: &str) -> bool {
        let mut routes = self.write_routes();
        match routes.iter().position(|route| route.pattern.as_str() == pattern) {
            Some(index) => {
                let route = routes.remove(index);
                tracing::info!(
                    pattern = %pattern,
                    service_name = %route.service_name,
                    "Removed gateway route"
                );
                true
            }
            None => false,
        }
    }

    /// 注册具名中间件，可在路由上按名称挂载
    pub fn middleware(&self, middleware: Arc<dyn Middleware>) -> Result<(), GatewayError> {
        let name = middleware.name().to_string();
        if self.middleware.contains_key(&name) {
            return Err(GatewayError::DuplicateMiddleware(name));
        }
        tracing::debug!(middleware = %name, "Registered named middleware");
        self.middleware.insert(name, middleware);
        Ok(())
    }

    /// 将已注册的中间件加入全局链
    pub fn add_global_middleware(&self, name: &str) -> bool {
        let Some(middleware) = self.middleware.get(name).map(|m| m.value().clone()) else {
            tracing::warn!(middleware = %name, "Unknown middleware, not added to global chain");
            return false;
        };
        let mut global = self.write_global();
        if global.iter().any(|m| m.name() == name) {
            return false;
        }
        global.push(middleware);
        true
    }

    pub fn remove_global_middleware(&self, name: &str) -> bool {
        let mut global = self.write_global();
        let before = global.len();
        global.retain(|m| m.name() != name);
        before != global.len()
    }

    /// 绑定服务的请求分发目标
    pub fn bind_endpoint(&self, service_name: &str, endpoint: Arc<dyn ServiceEndpoint>) {
        self.endpoints.insert(service_name.to_string(), endpoint);
    }

    pub fn unbind_endpoint(&self, service_name: &str) -> bool {
        self.endpoints.remove(service_name).is_some()
    }

    /// 路由一个请求，总是返回响应信封
    pub async fn route(&self, request: ServiceRequest) -> ServiceResponse {
        let started = std::time::Instant::now();
        let endpoint_key = format!("{} {}", request.method, request.endpoint);
        let (mut response, service_name) = self.dispatch(request).await;

        let duration = started.elapsed();
        response.metadata.duration = response.metadata.duration.max(duration);
        self.lock_metrics().record(
            service_name.as_deref(),
            endpoint_key,
            duration,
            response.is_success(),
        );
        response
    }

    async fn dispatch(&self, request: ServiceRequest) -> (ServiceResponse, Option<String>) {
        // 1. 查找路由
        let (route, params) = match self.find_route(&request) {
            Ok(found) => found,
            Err(err) => {
                tracing::debug!(
                    method = %request.method,
                    endpoint = %request.endpoint,
                    code = %err.code,
                    "No gateway route matched"
                );
                return (ServiceResponse::fail(err), None);
            }
        };
        let service_name = route.service_name.clone();

        // 2. 通过注册表发现服务
        let endpoint = self
            .registry
            .discover(&service_name)
            .and_then(|_| self.endpoints.get(&service_name).map(|e| e.value().clone()));
        let Some(endpoint) = endpoint else {
            tracing::warn!(service_name = %service_name, "Target service unavailable");
            return (
                ServiceResponse::fail(ServiceError::service_unavailable(&service_name)),
                Some(service_name),
            );
        };

        // 3. 补充请求信息
        let request = enrich_request(request, params);
        let request_id = request.request_id().unwrap_or_default().to_string();

        // 4. 全局中间件在前，路由中间件在后
        let chain = self.build_chain(&route);
        let mut response = forward_request(&chain, endpoint.as_ref(), request).await;
        if response.metadata.request_id.is_empty() {
            response.metadata.request_id = request_id;
        }
        (response, Some(service_name))
    }

    fn find_route(
        &self,
        request: &ServiceRequest,
    ) -> Result<(Route, std::collections::HashMap<String, String>), ServiceError> {
        let routes = self.read_routes();
        let mut pattern_matched = false;
        for route in routes.iter() {
            if let Some(params) = route.pattern.matches(&request.endpoint) {
                if route.allows(request.method) {
                    return Ok((route.clone(), params));
                }
                pattern_matched = true;
            }
        }

        if pattern_matched {
            Err(ServiceError::method_not_allowed(
                request.method.as_str(),
                &request.endpoint,
            ))
        } else {
            Err(ServiceError::route_not_found(&request.endpoint))
        }
    }

    fn build_chain(&self, route: &Route) -> Vec<Arc<dyn Middleware>> {
        let mut chain: Vec<Arc<dyn Middleware>> = self.read_global().clone();
        for name in &route.options.middleware {
            match self.middleware.get(name) {
                Some(middleware) => chain.push(middleware.value().clone()),
                None => tracing::warn!(
                    middleware = %name,
                    pattern = %route.pattern.as_str(),
                    "Route references unknown middleware, skipping"
                ),
            }
        }
        chain
    }

    // 获取统计信息
    pub fn stats(&self) -> GatewayStats {
        let metrics = self.lock_metrics().clone();
        GatewayStats {
            total_requests: metrics.total_requests,
            successful_requests: metrics.successful_requests,
            failed_requests: metrics.failed_requests,
            average_response_time_ms: metrics.average_response_time_ms,
            error_rate: metrics.error_rate(),
            requests_by_service: metrics.requests_by_service,
            requests_by_endpoint: metrics.requests_by_endpoint,
            routes: self.read_routes().iter().map(Route::info).collect(),
            global_middleware: self
                .read_global()
                .iter()
                .map(|m| m.name().to_string())
                .collect(),
        }
    }

    /// 错误率超过 10% 为 unhealthy；超过 5% 或平均耗时过高为 degraded
    pub fn health_check(&self) -> HealthReport {
        let (error_rate, average_ms) = {
            let metrics = self.lock_metrics();
            (metrics.error_rate(), metrics.average_response_time_ms)
        };
        let slow_threshold = self.config.slow_response_threshold_ms as f64;

        let error_status = if error_rate > 10.0 {
            HealthStatus::Unhealthy
        } else if error_rate > 5.0 {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };
        let latency_status = if average_ms > slow_threshold {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        let check = |name: &str, status: HealthStatus, message: String| CheckResult {
            name: name.to_string(),
            status: match status {
                HealthStatus::Healthy => CheckStatus::Pass,
                HealthStatus::Degraded => CheckStatus::Warn,
                HealthStatus::Unhealthy => CheckStatus::Fail,
            },
            duration: Duration::ZERO,
            message: Some(message),
        };

        HealthReport::new(
            error_status.worst(latency_status),
            vec![
                check("error_rate", error_status, format!("{error_rate:.2}% of requests failed")),
                check(
                    "response_time",
                    latency_status,
                    format!("average {average_ms:.1}ms (threshold {slow_threshold}ms)"),
                ),
            ],
        )
    }

    fn read_routes(&self) -> std::sync::RwLockReadGuard<'_, Vec<Route>> {
        self.routes.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_routes(&self) -> std::sync::RwLockWriteGuard<'_, Vec<Route>> {
        self.routes.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn read_global(&self) -> std::sync::RwLockReadGuard<'_, Vec<Arc<dyn Middleware>>> {
        self.global_middleware
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn write_global(&self) -> std::sync::RwLockWriteGuard<'_, Vec<Arc<dyn Middleware>>> {
        self.global_middleware
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_metrics(&self) -> MutexGuard<'_, GatewayMetrics> {
        self.metrics.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
