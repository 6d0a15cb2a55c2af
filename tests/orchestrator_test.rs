use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

use procurement_mesh::services::error::ServiceError;
use procurement_mesh::services::event::{EventPayload, ServiceEvent};
use procurement_mesh::services::gateway::RouteOptions;
use procurement_mesh::services::microservice::{
    Microservice, ServiceContext, ServiceHandler, health_probe,
};
use procurement_mesh::services::orchestrator::{
    Orchestrator, OrchestratorConfig, OrchestratorError, OrchestratorState, ServiceSpec,
    shutdown_exit_code,
};
use procurement_mesh::services::runtime::Runtime;
use procurement_mesh::services::types::{
    HealthStatus, Method, ServiceDescriptor, ServiceRequest, ServiceResponse,
};

#[derive(Default, Clone, Copy)]
struct StubHandler {
    fail_init: bool,
    fail_shutdown: bool,
}

#[async_trait]
impl ServiceHandler for StubHandler {
    async fn initialize(&self, _ctx: &ServiceContext) -> Result<(), ServiceError> {
        if self.fail_init {
            return Err(ServiceError::internal("initialization failed"));
        }
        Ok(())
    }

    async fn shutdown(&self, _ctx: &ServiceContext) -> Result<(), ServiceError> {
        if self.fail_shutdown {
            return Err(ServiceError::internal("flush failed"));
        }
        Ok(())
    }

    async fn handle_request(
        &self,
        ctx: &ServiceContext,
        request: &ServiceRequest,
    ) -> Result<Value, ServiceError> {
        Ok(json!({ "service": ctx.name(), "params": request.params }))
    }
}

fn stub(name: &'static str, handler: StubHandler) -> ServiceSpec {
    ServiceSpec::new(name, move |runtime| {
        Microservice::new(ServiceDescriptor::new(name, "1.0.0"), runtime, handler)
    })
}

fn sources(events: Vec<Arc<ServiceEvent>>) -> Vec<String> {
    // 历史记录最新在前，翻转为发生顺序
    events.iter().rev().map(|event| event.source.clone()).collect()
}

fn get(endpoint: &str) -> ServiceRequest {
    ServiceRequest::new(Method::Get, endpoint)
}

#[tokio::test]
async fn test_services_start_in_dependency_order_and_stop_in_reverse() {
    let runtime = Runtime::default();
    let orchestrator = Orchestrator::new(runtime.clone(), OrchestratorConfig::default())
        .with_service(stub("billing", StubHandler::default()).depends_on("orders"))
        .with_service(stub("orders", StubHandler::default()).depends_on("vendors"))
        .with_service(stub("vendors", StubHandler::default()));

    assert_eq!(
        orchestrator.start_order().unwrap(),
        vec!["vendors", "orders", "billing"]
    );

    orchestrator.start().await.expect("start");
    assert_eq!(orchestrator.state(), OrchestratorState::Running);
    let started = runtime.event_bus.get_event_history(Some("service.started"), None);
    assert_eq!(sources(started), vec!["vendors", "orders", "billing"]);

    let announced = runtime
        .event_bus
        .get_event_history(Some("orchestrator.started"), None);
    assert_eq!(
        announced[0].payload,
        EventPayload::OrchestratorStarted {
            services: vec!["vendors".into(), "orders".into(), "billing".into()],
        }
    );

    orchestrator.stop().await.expect("stop");
    assert_eq!(orchestrator.state(), OrchestratorState::Stopped);
    let stopped = runtime.event_bus.get_event_history(Some("service.stopped"), None);
    assert_eq!(sources(stopped), vec!["billing", "orders", "vendors"]);
    assert_eq!(
        runtime
            .event_bus
            .get_event_history(Some("orchestrator.stopped"), None)
            .len(),
        1
    );
    assert!(runtime.registry.is_empty());
    assert!(orchestrator.services().is_empty());
}

#[tokio::test]
async fn test_start_and_stop_are_idempotent() {
    let runtime = Runtime::default();
    let orchestrator = Orchestrator::new(runtime.clone(), OrchestratorConfig::default())
        .with_service(stub("vendors", StubHandler::default()));

    // 未启动时停止是空操作
    orchestrator.stop().await.unwrap();
    assert!(runtime.event_bus.get_event_history(None, None).is_empty());

    orchestrator.start().await.unwrap();
    orchestrator.start().await.unwrap();
    assert_eq!(
        runtime
            .event_bus
            .get_event_history(Some("service.started"), None)
            .len(),
        1
    );

    orchestrator.stop().await.unwrap();
    orchestrator.stop().await.unwrap();
    assert_eq!(
        runtime
            .event_bus
            .get_event_history(Some("service.stopped"), None)
            .len(),
        1
    );

    // 停止后可以重新启动
    orchestrator.start().await.unwrap();
    assert_eq!(orchestrator.state(), OrchestratorState::Running);
    assert!(orchestrator.service("vendors").is_some());
    orchestrator.stop().await.unwrap();
}

#[tokio::test]
async fn test_startup_failure_stops_already_started_services() {
    let runtime = Runtime::default();
    let orchestrator = Orchestrator::new(runtime.clone(), OrchestratorConfig::default())
        .with_service(
            stub("vendors", StubHandler::default())
                .route("/api/vendors/*", RouteOptions::default()),
        )
        .with_service(
            stub(
                "orders",
                StubHandler {
                    fail_init: true,
                    ..StubHandler::default()
                },
            )
            .depends_on("vendors"),
        );

    let err = orchestrator.start().await.unwrap_err();
    assert!(matches!(
        err,
        OrchestratorError::ServiceStartFailed { ref service, .. } if service == "orders"
    ));
    assert_eq!(orchestrator.state(), OrchestratorState::Stopped);

    let stopped = runtime.event_bus.get_event_history(Some("service.stopped"), None);
    assert_eq!(sources(stopped), vec!["vendors"]);
    assert!(runtime.registry.is_empty());
    assert!(runtime.gateway.stats().routes.is_empty());
    assert!(runtime
        .event_bus
        .get_event_history(Some("orchestrator.started"), None)
        .is_empty());
}

#[tokio::test]
async fn test_invalid_dependencies_are_rejected_before_any_start() {
    let runtime = Runtime::default();
    let orchestrator = Orchestrator::new(runtime.clone(), OrchestratorConfig::default())
        .with_service(stub("orders", StubHandler::default()).depends_on("ledger"));
    assert!(matches!(
        orchestrator.start().await,
        Err(OrchestratorError::UnknownDependency { .. })
    ));

    let cyclic = Orchestrator::new(runtime.clone(), OrchestratorConfig::default())
        .with_service(stub("a", StubHandler::default()).depends_on("b"))
        .with_service(stub("b", StubHandler::default()).depends_on("a"));
    assert!(matches!(
        cyclic.start().await,
        Err(OrchestratorError::DependencyCycle(_))
    ));

    assert!(runtime.event_bus.get_event_history(None, None).is_empty());
    assert_eq!(cyclic.state(), OrchestratorState::Stopped);
}

#[tokio::test]
async fn test_routes_are_wired_on_start_and_removed_on_stop() {
    let runtime = Runtime::default();
    let orchestrator = Orchestrator::new(runtime.clone(), OrchestratorConfig::default())
        .with_service(
            stub("vendors", StubHandler::default())
                .route("/api/vendors/:id", RouteOptions::default().methods([Method::Get])),
        );

    orchestrator.start().await.unwrap();
    let response: ServiceResponse = runtime.gateway.route(get("/api/vendors/V1")).await;
    let data = response.data().expect("routed");
    assert_eq!(data["service"], "vendors");
    assert_eq!(data["params"]["id"], "V1");

    orchestrator.stop().await.unwrap();
    assert!(runtime.gateway.stats().routes.is_empty());
    let response = runtime.gateway.route(get("/api/vendors/V1")).await;
    assert_eq!(response.status_code(), 404);
}

#[tokio::test]
async fn test_disabled_gateway_skips_routes() {
    let mut gateway = procurement_mesh::services::gateway::GatewayConfig::default();
    gateway.enabled = false;
    let runtime = Runtime::new(Default::default(), Default::default(), gateway);
    let orchestrator = Orchestrator::new(runtime.clone(), OrchestratorConfig::default())
        .with_service(
            stub("vendors", StubHandler::default())
                .route("/api/vendors/*", RouteOptions::default()),
        );

    orchestrator.start().await.unwrap();
    assert!(runtime.gateway.stats().routes.is_empty());
    assert!(orchestrator.get_metrics().await.gateway.is_none());
    orchestrator.stop().await.unwrap();
}

#[tokio::test]
async fn test_health_check_reflects_healthy_ratio() {
    let orchestrator = Orchestrator::new(Runtime::default(), OrchestratorConfig::default())
        .with_service(stub("vendors", StubHandler::default()))
        .with_service(stub("orders", StubHandler::default()));

    // 没有运行的服务时视为健康
    let health = orchestrator.health_check().await;
    assert_eq!(health.total_services, 0);
    assert_eq!(health.status, HealthStatus::Healthy);

    orchestrator.start().await.unwrap();
    let health = orchestrator.health_check().await;
    assert_eq!(health.status, HealthStatus::Healthy);
    assert_eq!(health.healthy_services, 2);

    orchestrator
        .service("orders")
        .unwrap()
        .add_health_check("ledger", health_probe(|| async { Err("ledger offline".into()) }));
    let health = orchestrator.health_check().await;
    assert_eq!(health.status, HealthStatus::Degraded);
    assert_eq!(health.healthy_services, 1);
    assert_eq!(health.services["orders"].status, HealthStatus::Unhealthy);

    orchestrator
        .service("vendors")
        .unwrap()
        .add_health_check("ledger", health_probe(|| async { Ok(false) }));
    let health = orchestrator.health_check().await;
    assert_eq!(health.status, HealthStatus::Unhealthy);
    assert_eq!(health.healthy_services, 0);

    orchestrator.stop().await.unwrap();
}

#[tokio::test]
async fn test_metrics_cover_all_components() {
    let orchestrator = Orchestrator::new(Runtime::default(), OrchestratorConfig::default())
        .with_service(
            stub("vendors", StubHandler::default())
                .route("/api/vendors/*", RouteOptions::default()),
        )
        .with_service(stub("orders", StubHandler::default()).depends_on("vendors"));

    let metrics = orchestrator.get_metrics().await;
    assert_eq!(metrics.state, OrchestratorState::Stopped);
    assert_eq!(metrics.configured_services, 2);
    assert_eq!(metrics.running_services, 0);
    assert!(metrics.uptime.is_none());

    orchestrator.start().await.unwrap();
    assert!(orchestrator
        .runtime()
        .gateway
        .route(get("/api/vendors"))
        .await
        .is_success());

    let metrics = orchestrator.get_metrics().await;
    assert_eq!(metrics.state, OrchestratorState::Running);
    assert_eq!(metrics.running_services, 2);
    assert_eq!(metrics.services.len(), 2);
    assert_eq!(metrics.registry.total_services, 2);
    assert!(metrics.uptime.is_some());
    assert!(metrics.event_bus.events_published >= 3);
    let gateway = metrics.gateway.as_ref().expect("gateway enabled");
    assert_eq!(gateway.total_requests, 1);
    assert_eq!(gateway.routes.len(), 1);

    let vendors = metrics
        .services
        .iter()
        .find(|s| s.service == "vendors")
        .unwrap();
    assert_eq!(vendors.request_count, 1);

    // 指标可序列化为 JSON
    assert!(serde_json::to_value(&metrics).is_ok());
    orchestrator.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_poller_publishes_periodic_health_events() {
    let runtime = Runtime::default();
    let orchestrator = Orchestrator::new(
        runtime.clone(),
        OrchestratorConfig {
            health_check_interval_secs: 30,
            ..OrchestratorConfig::default()
        },
    )
    .with_service(stub("vendors", StubHandler::default()));

    orchestrator.start().await.unwrap();
    tokio::time::sleep(Duration::from_secs(61)).await;

    let checks = runtime
        .event_bus
        .get_event_history(Some("orchestrator.health.check"), None);
    assert_eq!(checks.len(), 2);
    assert_eq!(checks[0].source, "orchestrator");
    assert!(matches!(
        checks[0].payload,
        EventPayload::OrchestratorHealthCheck {
            status: HealthStatus::Healthy,
            healthy_services: 1,
            total_services: 1,
        }
    ));

    orchestrator.stop().await.unwrap();
    tokio::time::sleep(Duration::from_secs(61)).await;
    assert_eq!(
        runtime
            .event_bus
            .get_event_history(Some("orchestrator.health.check"), None)
            .len(),
        2
    );
}

#[tokio::test]
async fn test_failed_shutdown_still_stops_every_service() {
    let runtime = Runtime::default();
    let orchestrator = Orchestrator::new(runtime.clone(), OrchestratorConfig::default())
        .with_service(stub("vendors", StubHandler::default()))
        .with_service(
            stub(
                "orders",
                StubHandler {
                    fail_shutdown: true,
                    ..StubHandler::default()
                },
            )
            .depends_on("vendors"),
        );

    orchestrator.start().await.unwrap();
    assert_eq!(shutdown_exit_code(&orchestrator).await, 1);
    assert_eq!(orchestrator.state(), OrchestratorState::Stopped);

    let stopped = runtime.event_bus.get_event_history(Some("service.stopped"), None);
    assert_eq!(sources(stopped), vec!["orders", "vendors"]);
    assert!(runtime.registry.is_empty());
}

#[tokio::test]
async fn test_clean_shutdown_exits_with_zero() {
    let orchestrator = Orchestrator::new(Runtime::default(), OrchestratorConfig::default())
        .with_service(stub("vendors", StubHandler::default()));
    orchestrator.start().await.unwrap();
    assert_eq!(shutdown_exit_code(&orchestrator).await, 0);
}
