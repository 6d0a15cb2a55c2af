use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::time::Instant;

use super::forwarder::ServiceEndpoint;
use crate::services::error::ServiceError;
use crate::services::types::{HEADER_CLIENT_ID, ServiceRequest, ServiceResponse};

pub const LOGGING: &str = "logging";
pub const RATE_LIMIT: &str = "rate-limit";
pub const CORS: &str = "cors";

/// 职责链中的一个处理步骤
#[async_trait]
pub trait Middleware: Send + Sync {
    fn name(&self) -> &str;

    async fn handle(&self, request: ServiceRequest, next: Next<'_>) -> ServiceResponse;
}

/// 链中剩余的步骤，最内层分发到目标服务
pub struct Next<'a> {
    chain: &'a [Arc<dyn Middleware>],
    endpoint: &'a dyn ServiceEndpoint,
}

impl<'a> Next<'a> {
    pub fn new(chain: &'a [Arc<dyn Middleware>], endpoint: &'a dyn ServiceEndpoint) -> Self {
        Self { chain, endpoint }
    }

    pub async fn run(self, request: ServiceRequest) -> ServiceResponse {
        match self.chain.split_first() {
            Some((current, rest)) => {
                let next = Next {
                    chain: rest,
                    endpoint: self.endpoint,
                };
                current.handle(request, next).await
            }
            None => self.endpoint.process_request(request).await,
        }
    }
}

/// 记录请求开始与结束
#[derive(Debug, Default)]
pub struct LoggingMiddleware;

#[async_trait]
impl Middleware for LoggingMiddleware {
    fn name(&self) -> &str {
        LOGGING
    }

    async fn handle(&self, request: ServiceRequest, next: Next<'_>) -> ServiceResponse {
        let started = std::time::Instant::now();
        let method = request.method;
        let endpoint = request.endpoint.clone();
        let request_id = request.request_id().unwrap_or_default().to_string();
        tracing::info!(
            request_id = %request_id,
            method = %method,
            endpoint = %endpoint,
            "Gateway request started"
        );

        let response = next.run(request).await;

        let duration_ms = started.elapsed().as_millis() as u64;
        match response.error() {
            None => tracing::info!(
                request_id = %request_id,
                method = %method,
                endpoint = %endpoint,
                duration_ms = duration_ms,
                "Gateway request completed"
            ),
            Some(err) => tracing::warn!(
                request_id = %request_id,
                method = %method,
                endpoint = %endpoint,
                duration_ms = duration_ms,
                code = %err.code,
                status_code = err.status_code,
                "Gateway request failed"
            ),
        }
        response
    }
}

#[derive(Debug, Clone, Copy)]
struct RateWindow {
    count: u32,
    started_at: Instant,
}

/// 按客户端ID的固定窗口限流
#[derive(Debug)]
pub struct RateLimitMiddleware {
    max_requests: u32,
    window: Duration,
    clients: DashMap<String, RateWindow>,
    /// 上次清理过期窗口的时间，每个窗口周期最多清理一次
    last_sweep: Mutex<Instant>,
}

impl RateLimitMiddleware {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            clients: DashMap::new(),
            last_sweep: Mutex::new(Instant::now()),
        }
    }

    /// 当前跟踪的客户端窗口数
    pub fn tracked_clients(&self) -> usize {
        self.clients.len()
    }

    fn sweep_expired(&self, now: Instant) {
        {
            let mut last_sweep = self.last_sweep.lock().unwrap_or_else(PoisonError::into_inner);
            if now.duration_since(*last_sweep) < self.window {
                return;
            }
            *last_sweep = now;
        }
        let before = self.clients.len();
        self.clients
            .retain(|_, window| now.duration_since(window.started_at) < self.window);
        let evicted = before.saturating_sub(self.clients.len());
        if evicted > 0 {
            tracing::debug!(evicted = evicted, "Evicted expired rate limit windows");
        }
    }

    /// 占用一个名额，超出限制时返回 false
    fn try_acquire(&self, client_id: &str) -> bool {
        let now = Instant::now();
        self.sweep_expired(now);
        let mut window = self
            .clients
            .entry(client_id.to_string())
            .or_insert(RateWindow {
                count: 0,
                started_at: now,
            });

        // 窗口到期后重置
        if now.duration_since(window.started_at) >= self.window {
            window.count = 0;
            window.started_at = now;
        }

        if window.count >= self.max_requests {
            return false;
        }
        window.count += 1;
        true
    }
}

#[async_trait]
impl Middleware for RateLimitMiddleware {
    fn name(&self) -> &str {
        RATE_LIMIT
    }

    async fn handle(&self, request: ServiceRequest, next: Next<'_>) -> ServiceResponse {
        let client_id = request
            .header(HEADER_CLIENT_ID)
            .unwrap_or("anonymous")
            .to_string();

        if !self.try_acquire(&client_id) {
            tracing::warn!(
                client_id = %client_id,
                max_requests = self.max_requests,
                window_secs = self.window.as_secs(),
                "Rate limit exceeded"
            );
            let request_id = request.request_id().unwrap_or_default().to_string();
            return ServiceResponse::fail(ServiceError::rate_limited(&client_id))
                .with_request_id(request_id);
        }

        next.run(request).await
    }
}

/// 在响应元数据上标注 CORS 响应头
#[derive(Debug)]
pub struct CorsMiddleware {
    allowed_origins: Vec<String>,
}

impl CorsMiddleware {
    pub fn new(allowed_origins: Vec<String>) -> Self {
        Self { allowed_origins }
    }

    fn allowed_origin(&self, origin: Option<&str>) -> Option<String> {
        if self.allowed_origins.iter().any(|o| o == "*") {
            return Some(origin.unwrap_or("*").to_string());
        }
        origin
            .filter(|origin| self.allowed_origins.iter().any(|o| o == origin))
            .map(str::to_string)
    }
}

#[async_trait]
impl Middleware for CorsMiddleware {
    fn name(&self) -> &str {
        CORS
    }

    async fn handle(&self, request: ServiceRequest, next: Next<'_>) -> ServiceResponse {
        let origin = self.allowed_origin(request.header("origin"));
        let mut response = next.run(request).await;

        if let Some(origin) = origin {
            let headers = &mut response.metadata.headers;
            headers.insert("access-control-allow-origin".to_string(), origin);
            headers.insert(
                "access-control-allow-methods".to_string(),
                "GET, POST, PUT, PATCH, DELETE, OPTIONS".to_string(),
            );
            headers.insert(
                "access-control-allow-headers".to_string(),
                "content-type, authorization, x-request-id, x-client-id".to_string(),
            );
        }
        response
    }
}
