use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use futures::FutureExt;
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use super::circuit_breaker::{CircuitBreaker, CircuitState};
use super::context::{ServiceContext, ServiceHandler};
use super::health::{self, HealthProbe, aggregate, health_probe};
use super::retry::execute_with_retry;
use crate::services::error::ServiceError;
use crate::services::event::{EventError, EventPayload, PublishReport, ServiceEvent};
use crate::services::gateway::ServiceEndpoint;
use crate::services::registry::HealthSource;
use crate::services::runtime::Runtime;
use crate::services::types::{
    CheckResult, CheckStatus, HEADER_REQUEST_ID, HEADER_SERVICE_NAME, HealthReport, HealthStatus,
    ResponseMetadata, ServiceDescriptor, ServiceRequest, ServiceResponse,
};

/// 服务的请求性能统计
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceMetrics {
    pub service: String,
    pub running: bool,
    pub request_count: u64,
    pub error_count: u64,
    pub average_response_time_ms: f64,
    pub last_request_at: Option<SystemTime>,
    pub circuit_state: CircuitState,
    pub uptime: Option<Duration>,
}

#[derive(Debug, Default)]
struct PerformanceSamples {
    request_count: u64,
    error_count: u64,
    average_response_time_ms: f64,
    last_request_at: Option<SystemTime>,
}

/// 服务基类：生命周期、带重试的请求管线、健康汇总和事件发布
pub struct Microservice {
    ctx: ServiceContext,
    handler: Box<dyn ServiceHandler>,
    breaker: CircuitBreaker,
    samples: Mutex<PerformanceSamples>,
    started_at: Mutex<Option<std::time::Instant>>,
    this: Weak<Microservice>,
}

impl std::fmt::Debug for Microservice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Microservice")
            .field("name", &self.ctx.name())
            .field("version", &self.ctx.descriptor().version)
            .field("running", &self.ctx.is_running())
            .field("circuit", &self.breaker.state())
            .finish()
    }
}

impl Microservice {
    /// 创建服务并注册默认健康检查（运行状态、内存）
    pub fn new(
        descriptor: ServiceDescriptor,
        runtime: Runtime,
        handler: impl ServiceHandler,
    ) -> Arc<Self> {
        let memory_limit = runtime.memory_limit_bytes;
        let breaker = CircuitBreaker::new(descriptor.circuit_breaker.clone());
        let service = Arc::new_cyclic(|this| Self {
            ctx: ServiceContext::new(descriptor, runtime),
            handler: Box::new(handler),
            breaker,
            samples: Mutex::new(PerformanceSamples::default()),
            started_at: Mutex::new(None),
            this: this.clone(),
        });

        let weak = service.this.clone();
        service.ctx.add_health_check(
            "running",
            health_probe(move || {
                let weak = weak.clone();
                async move {
                    Ok(weak
                        .upgrade()
                        .is_some_and(|service| service.ctx.is_running()))
                }
            }),
        );
        service
            .ctx
            .add_health_check("memory", health::memory_probe(memory_limit));
        service
    }

    pub fn name(&self) -> &str {
        self.ctx.name()
    }

    pub fn descriptor(&self) -> &ServiceDescriptor {
        self.ctx.descriptor()
    }

    pub fn context(&self) -> &ServiceContext {
        &self.ctx
    }

    pub fn is_running(&self) -> bool {
        self.ctx.is_running()
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.breaker.state()
    }

    /// 初始化、注册到注册表与网关、标记运行并发布 `service.started`
    pub async fn start(&self) -> Result<(), ServiceError> {
        let service_name = self.name().to_string();
        tracing::info!(service_name = %service_name, "Starting service");

        if let Err(err) = self.handler.initialize(&self.ctx).await {
            tracing::error!(service_name = %service_name, error = %err, "Service initialization failed");
            self.ctx.unsubscribe_all();
            return Err(err);
        }

        let runtime = self.ctx.runtime();
        runtime.registry.register(self.descriptor().clone());
        let source: Weak<dyn HealthSource> = self.this.clone();
        if let Err(err) = runtime.registry.register_instance(&service_name, source) {
            tracing::warn!(service_name = %service_name, error = %err, "Failed to attach instance to registry");
        }
        if let Some(this) = self.this.upgrade() {
            let endpoint: Arc<dyn ServiceEndpoint> = this;
            runtime.gateway.bind_endpoint(&service_name, endpoint);
        }

        self.ctx.set_running(true);
        *self.lock_started_at() = Some(std::time::Instant::now());

        let payload = EventPayload::ServiceStarted {
            service: service_name.clone(),
            version: self.descriptor().version.clone(),
        };
        if let Err(err) = runtime
            .event_bus
            .publish(ServiceEvent::system(&service_name, payload))
            .await
        {
            tracing::warn!(service_name = %service_name, error = %err, "Failed to publish service.started");
        }

        tracing::info!(service_name = %service_name, "Service started");
        Ok(())
    }

    /// 标记停止、注销、调用 shutdown 钩子、释放订阅并发布 `service.stopped`
    pub async fn stop(&self) -> Result<(), ServiceError> {
        let service_name = self.name().to_string();
        tracing::info!(service_name = %service_name, "Stopping service");

        self.ctx.set_running(false);
        *self.lock_started_at() = None;
        let runtime = self.ctx.runtime();
        runtime.registry.unregister(&service_name);
        runtime.gateway.unbind_endpoint(&service_name);

        let result = self.handler.shutdown(&self.ctx).await;
        if let Err(err) = &result {
            tracing::error!(service_name = %service_name, error = %err, "Service shutdown hook failed");
        }
        let released = self.ctx.unsubscribe_all();
        if released > 0 {
            tracing::debug!(service_name = %service_name, released = released, "Released event subscriptions");
        }

        let payload = EventPayload::ServiceStopped {
            service: service_name.clone(),
        };
        if let Err(err) = runtime
            .event_bus
            .publish(ServiceEvent::system(&service_name, payload))
            .await
        {
            tracing::warn!(service_name = %service_name, error = %err, "Failed to publish service.stopped");
        }

        tracing::info!(service_name = %service_name, "Service stopped");
        result
    }

    /// 处理请求：补充请求头，经重试执行器调用 handle_request，填充响应元数据
    pub async fn process_request(&self, mut request: ServiceRequest) -> ServiceResponse {
        let started = std::time::Instant::now();
        let service_name = self.name().to_string();
        let request_id = request
            .request_id()
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        request
            .headers
            .insert(HEADER_REQUEST_ID.to_string(), request_id.clone());
        request
            .headers
            .insert(HEADER_SERVICE_NAME.to_string(), service_name.clone());

        let (result, retries) = if let Some(permit) = self.breaker.acquire() {
            let handler = &self.handler;
            let ctx = &self.ctx;
            let request = &request;
            let outcome = execute_with_retry(
                &self.descriptor().retry,
                self.descriptor().timeout,
                move |_| {
                    AssertUnwindSafe(handler.handle_request(ctx, request))
                        .catch_unwind()
                        .map(|result| {
                            result.unwrap_or_else(|_| {
                                Err(ServiceError::internal("request handler panicked"))
                            })
                        })
                },
            )
            .await;

            match &outcome.result {
                Err(err) if err.retryable => permit.failure(),
                _ => permit.success(),
            }
            (outcome.result, outcome.retries)
        } else {
            tracing::warn!(
                service_name = %service_name,
                request_id = %request_id,
                "Circuit open, rejecting request"
            );
            (
                Err(ServiceError::service_unavailable(&service_name)
                    .with_details(serde_json::json!({ "reason": "circuit_open" }))),
                0,
            )
        };

        let duration = started.elapsed();
        if let Err(err) = &result {
            tracing::warn!(
                service_name = %service_name,
                request_id = %request_id,
                code = %err.code,
                retries = retries,
                "Request failed"
            );
        }
        self.record_sample(duration, result.is_ok());

        ServiceResponse {
            result,
            metadata: ResponseMetadata {
                request_id,
                timestamp: SystemTime::now(),
                duration,
                retry_count: retries,
                service: Some(service_name),
                ..ResponseMetadata::default()
            },
        }
    }

    /// 运行所有已注册的检查并汇总，附带熔断器状态
    pub async fn get_health(&self) -> HealthReport {
        let mut report = aggregate(self.ctx.health_checks(), self.descriptor().timeout).await;

        let circuit = self.breaker.state();
        let (status, health) = match circuit {
            CircuitState::Closed => (CheckStatus::Pass, HealthStatus::Healthy),
            CircuitState::HalfOpen => (CheckStatus::Warn, HealthStatus::Healthy),
            CircuitState::Open => (CheckStatus::Fail, HealthStatus::Degraded),
        };
        report.status = report.status.worst(health);
        report.checks.push(CheckResult {
            name: "circuit".to_string(),
            status,
            duration: Duration::ZERO,
            message: (circuit != CircuitState::Closed).then(|| format!("circuit {circuit}")),
        });
        report
    }

    pub fn add_health_check(&self, name: &str, probe: HealthProbe) {
        self.ctx.add_health_check(name, probe);
    }

    pub async fn publish_event(
        &self,
        event_type: &str,
        data: Value,
        correlation_id: Option<String>,
    ) -> Result<PublishReport, EventError> {
        self.ctx.publish_event(event_type, data, correlation_id).await
    }

    pub fn metrics(&self) -> ServiceMetrics {
        let samples = self.lock_samples();
        ServiceMetrics {
            service: self.name().to_string(),
            running: self.is_running(),
            request_count: samples.request_count,
            error_count: samples.error_count,
            average_response_time_ms: samples.average_response_time_ms,
            last_request_at: samples.last_request_at,
            circuit_state: self.breaker.state(),
            uptime: self.lock_started_at().map(|at| at.elapsed()),
        }
    }

    fn record_sample(&self, duration: Duration, success: bool) {
        let mut samples = self.lock_samples();
        samples.request_count += 1;
        if !success {
            samples.error_count += 1;
        }
        let sample = duration.as_secs_f64() * 1000.0;
        let n = samples.request_count as f64;
        samples.average_response_time_ms += (sample - samples.average_response_time_ms) / n;
        samples.last_request_at = Some(SystemTime::now());
    }

    fn lock_samples(&self) -> MutexGuard<'_, PerformanceSamples> {
        self.samples.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_started_at(&self) -> MutexGuard<'_, Option<std::time::Instant>> {
        self.started_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl HealthSource for Microservice {
    async fn probe_health(&self) -> Result<HealthReport, ServiceError> {
        Ok(self.get_health().await)
    }
}

#[async_trait]
impl ServiceEndpoint for Microservice {
    async fn process_request(&self, request: ServiceRequest) -> ServiceResponse {
        Microservice::process_request(self, request).await
    }
}
