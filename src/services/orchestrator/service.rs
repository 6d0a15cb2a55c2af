use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::catalog::{ServiceSpec, resolve_start_order};
use super::types::{
    ORCHESTRATOR_SOURCE, OrchestratorConfig, OrchestratorError, OrchestratorHealth,
    OrchestratorMetrics, OrchestratorState,
};
use crate::domain::{
    DocumentStore, InMemoryStore, PURCHASE_ORDER_SERVICE, PurchaseOrderService, VENDOR_SERVICE,
    VendorService,
};
use crate::services::event::{EventPayload, ServiceEvent};
use crate::services::gateway::{CORS, RATE_LIMIT, RouteOptions};
use crate::services::microservice::Microservice;
use crate::services::runtime::Runtime;
use crate::services::types::{HealthStatus, Method};

type ManagedServices = Arc<Mutex<Vec<Arc<Microservice>>>>;

/// 编排器：按依赖顺序启动服务、注册网关路由、周期轮询健康状态
pub struct Orchestrator {
    runtime: Runtime,
    config: OrchestratorConfig,
    specs: Vec<ServiceSpec>,
    /// 串行化 start/stop
    lifecycle: tokio::sync::Mutex<()>,
    state: Mutex<OrchestratorState>,
    /// 已启动的服务，按启动顺序
    services: ManagedServices,
    /// 本编排器添加的路由模式
    routes: Mutex<Vec<String>>,
    started_at: Mutex<Option<Instant>>,
    task_tracker: TaskTracker,
    poller: Mutex<Option<CancellationToken>>,
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("state", &self.state())
            .field("specs", &self.specs)
            .field("config", &self.config)
            .finish()
    }
}

impl Orchestrator {
    pub fn new(runtime: Runtime, config: OrchestratorConfig) -> Self {
        let runtime = runtime.with_memory_limit(config.memory_limit_bytes);
        Self {
            runtime,
            config,
            specs: Vec::new(),
            lifecycle: tokio::sync::Mutex::new(()),
            state: Mutex::new(OrchestratorState::Stopped),
            services: Arc::new(Mutex::new(Vec::new())),
            routes: Mutex::new(Vec::new()),
            started_at: Mutex::new(None),
            task_tracker: TaskTracker::new(),
            poller: Mutex::new(None),
        }
    }

    /// 供应商服务和采购单服务，共用一个内存存储
    pub fn with_default_services(runtime: Runtime, config: OrchestratorConfig) -> Self {
        Self::with_store(runtime, config, Arc::new(InMemoryStore::new()))
    }

    pub fn with_store(
        runtime: Runtime,
        config: OrchestratorConfig,
        store: Arc<dyn DocumentStore>,
    ) -> Self {
        let vendor_store = store.clone();
        let vendor = ServiceSpec::new(VENDOR_SERVICE, move |runtime| {
            VendorService::create(runtime, vendor_store.clone())
        })
        .route(
            "/api/vendors/*",
            RouteOptions::default().middleware(RATE_LIMIT).middleware(CORS),
        );

        let purchase_order = ServiceSpec::new(PURCHASE_ORDER_SERVICE, move |runtime| {
            PurchaseOrderService::create(runtime, store.clone())
        })
        .depends_on(VENDOR_SERVICE)
        .route(
            "/api/purchase-orders/:id/status",
            RouteOptions::default()
                .methods([Method::Patch])
                .middleware(RATE_LIMIT),
        )
        .route(
            "/api/purchase-orders/*",
            RouteOptions::default()
                .methods([Method::Get, Method::Post, Method::Put, Method::Delete])
                .middleware(RATE_LIMIT)
                .middleware(CORS),
        );

        Self::new(runtime, config)
            .with_service(vendor)
            .with_service(purchase_order)
    }

    pub fn with_service(mut self, spec: ServiceSpec) -> Self {
        self.specs.push(spec);
        self
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn state(&self) -> OrchestratorState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 依赖排序后的启动顺序
    pub fn start_order(&self) -> Result<Vec<String>, OrchestratorError> {
        Ok(resolve_start_order(&self.specs)?
            .into_iter()
            .map(|index| self.specs[index].name.clone())
            .collect())
    }

    /// 正在运行的服务实例
    pub fn service(&self, name: &str) -> Option<Arc<Microservice>> {
        self.lock_services()
            .iter()
            .find(|service| service.name() == name)
            .cloned()
    }

    pub fn services(&self) -> Vec<Arc<Microservice>> {
        self.lock_services().clone()
    }

    /// 启动所有服务；任何一步失败都会先清理已启动的部分再返回错误
    pub async fn start(&self) -> Result<(), OrchestratorError> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.state() == OrchestratorState::Running {
            tracing::debug!("Orchestrator already running");
            return Ok(());
        }

        let order = resolve_start_order(&self.specs)?;
        self.set_state(OrchestratorState::Starting);
        tracing::info!(services = order.len(), "Starting orchestrator");

        for index in order {
            let spec = &self.specs[index];
            if let Err(err) = self.start_service(spec).await {
                tracing::error!(service_name = %spec.name, error = %err, "Startup failed, cleaning up");
                let failed = self.teardown().await;
                if !failed.is_empty() {
                    tracing::warn!(services = ?failed, "Cleanup after failed startup was incomplete");
                }
                self.set_state(OrchestratorState::Stopped);
                return Err(err);
            }
        }

        self.runtime.registry.start_health_checks();
        self.start_health_poller();
        *self.lock_started_at() = Some(Instant::now());
        self.set_state(OrchestratorState::Running);

        let names: Vec<String> = self
            .lock_services()
            .iter()
            .map(|service| service.name().to_string())
            .collect();
        tracing::info!(services = ?names, "Orchestrator started");
        self.publish(EventPayload::OrchestratorStarted { services: names })
            .await;
        Ok(())
    }

    /// 按启动的逆序停止服务，单个服务停止失败不影响其余服务
    pub async fn stop(&self) -> Result<(), OrchestratorError> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.state() != OrchestratorState::Running {
            tracing::debug!(state = %self.state(), "Orchestrator not running, nothing to stop");
            return Ok(());
        }

        self.set_state(OrchestratorState::Stopping);
        tracing::info!("Stopping orchestrator");
        let uptime = self
            .lock_started_at()
            .take()
            .map(|at| at.elapsed())
            .unwrap_or_default();

        let failed = self.teardown().await;
        self.set_state(OrchestratorState::Stopped);
        self.publish(EventPayload::OrchestratorStopped { uptime })
            .await;

        if failed.is_empty() {
            tracing::info!(uptime_secs = uptime.as_secs(), "Orchestrator stopped");
            Ok(())
        } else {
            Err(OrchestratorError::ShutdownIncomplete { failed })
        }
    }

    /// 查询所有受管服务的健康状态
    pub async fn health_check(&self) -> OrchestratorHealth {
        assess(self.services()).await
    }

    pub async fn get_metrics(&self) -> OrchestratorMetrics {
        let services = self.services();
        let health = assess(services.clone()).await;
        let gateway = &self.runtime.gateway;
        OrchestratorMetrics {
            state: self.state(),
            uptime: self.lock_started_at().map(|at| at.elapsed()),
            configured_services: self.specs.len(),
            running_services: services.iter().filter(|s| s.is_running()).count(),
            health,
            services: services.iter().map(|s| s.metrics()).collect(),
            event_bus: self.runtime.event_bus.get_event_stats(),
            subscriptions: self.runtime.event_bus.get_subscription_stats(),
            registry: self.runtime.registry.stats(),
            gateway: gateway.config().enabled.then(|| gateway.stats()),
        }
    }

    async fn start_service(&self, spec: &ServiceSpec) -> Result<(), OrchestratorError> {
        let service = (spec.factory)(self.runtime.clone());
        if service.name() != spec.name {
            tracing::warn!(
                declared = %spec.name,
                actual = %service.name(),
                "Service name differs from its declaration"
            );
        }

        service
            .start()
            .await
            .map_err(|source| OrchestratorError::ServiceStartFailed {
                service: spec.name.clone(),
                source,
            })?;
        self.lock_services().push(service);

        if !self.runtime.gateway.config().enabled {
            return Ok(());
        }
        for route in &spec.routes {
            self.runtime
                .gateway
                .add_route(&route.pattern, &spec.name, route.options.clone())
                .map_err(|source| OrchestratorError::RouteRejected {
                    service: spec.name.clone(),
                    source,
                })?;
            self.lock_routes().push(route.pattern.clone());
        }
        Ok(())
    }

    /// 停止轮询、移除路由并逆序停止服务，返回停止失败的服务名
    async fn teardown(&self) -> Vec<String> {
        self.stop_health_poller().await;
        self.runtime.registry.stop_health_checks().await;

        let routes: Vec<String> = self.lock_routes().drain(..).collect();
        for pattern in routes {
            self.runtime.gateway.remove_route(&pattern);
        }

        let services: Vec<Arc<Microservice>> = self.lock_services().drain(..).collect();
        let mut failed = Vec::new();
        for service in services.iter().rev() {
            if let Err(err) = service.stop().await {
                tracing::error!(
                    service_name = %service.name(),
                    error = %err,
                    "Service failed to stop, continuing shutdown"
                );
                failed.push(service.name().to_string());
            }
        }
        failed
    }

    fn start_health_poller(&self) {
        let mut slot = self.lock_poller();
        if slot.is_some() {
            return;
        }

        let token = CancellationToken::new();
        let cancelled = token.clone();
        let services = self.services.clone();
        let event_bus = self.runtime.event_bus.clone();
        let interval_duration = self.config.health_check_interval();

        self.task_tracker.spawn(async move {
            let mut interval = tokio::time::interval(interval_duration);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    _ = interval.tick() => {
                        let health = assess(snapshot(&services)).await;
                        if health.status != HealthStatus::Healthy {
                            tracing::warn!(
                                status = %health.status,
                                healthy = health.healthy_services,
                                total = health.total_services,
                                "Orchestrator health degraded"
                            );
                        }
                        let payload = EventPayload::OrchestratorHealthCheck {
                            status: health.status,
                            healthy_services: health.healthy_services,
                            total_services: health.total_services,
                        };
                        if let Err(err) = event_bus
                            .publish(ServiceEvent::system(ORCHESTRATOR_SOURCE, payload))
                            .await
                        {
                            tracing::warn!(error = %err, "Failed to publish health check event");
                        }
                    }
                }
            }
            tracing::debug!("Orchestrator health poller stopped");
        });

        tracing::info!(
            interval_secs = interval_duration.as_secs(),
            "Started orchestrator health poller"
        );
        *slot = Some(token);
    }

    async fn stop_health_poller(&self) {
        let token = self.lock_poller().take();
        if let Some(token) = token {
            token.cancel();
            self.task_tracker.close();
            self.task_tracker.wait().await;
            self.task_tracker.reopen();
        }
    }

    async fn publish(&self, payload: EventPayload) {
        if let Err(err) = self
            .runtime
            .event_bus
            .publish(ServiceEvent::system(ORCHESTRATOR_SOURCE, payload))
            .await
        {
            tracing::warn!(error = %err, "Failed to publish orchestrator event");
        }
    }

    fn set_state(&self, state: OrchestratorState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    fn lock_services(&self) -> MutexGuard<'_, Vec<Arc<Microservice>>> {
        self.services.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_routes(&self) -> MutexGuard<'_, Vec<String>> {
        self.routes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_started_at(&self) -> MutexGuard<'_, Option<Instant>> {
        self.started_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_poller(&self) -> MutexGuard<'_, Option<CancellationToken>> {
        self.poller.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn snapshot(services: &ManagedServices) -> Vec<Arc<Microservice>> {
    services
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
}

async fn assess(services: Vec<Arc<Microservice>>) -> OrchestratorHealth {
    let reports = join_all(services.iter().map(|service| async move {
        (service.name().to_string(), service.get_health().await)
    }))
    .await;
    OrchestratorHealth::from_reports(reports.into_iter().collect::<BTreeMap<_, _>>())
}
