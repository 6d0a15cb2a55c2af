use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;

use procurement_mesh::services::error::ServiceError;
use procurement_mesh::services::registry::{
    HealthSource, RegistryConfig, RegistryError, ServiceRegistry,
};
use procurement_mesh::services::types::{HealthReport, HealthStatus, ServiceDescriptor};

/// 固定返回给定状态的健康探针
struct FixedHealth(HealthStatus);

#[async_trait]
impl HealthSource for FixedHealth {
    async fn probe_health(&self) -> Result<HealthReport, ServiceError> {
        Ok(HealthReport::new(self.0, Vec::new()))
    }
}

/// 永远不返回的健康探针
struct HungHealth;

#[async_trait]
impl HealthSource for HungHealth {
    async fn probe_health(&self) -> Result<HealthReport, ServiceError> {
        std::future::pending().await
    }
}

fn attach(registry: &ServiceRegistry, name: &str, source: &Arc<impl HealthSource + 'static>) {
    let weak: Weak<dyn HealthSource> = Arc::downgrade(source) as Weak<dyn HealthSource>;
    registry
        .register_instance(name, weak)
        .expect("service should be registered");
}

#[tokio::test]
async fn test_discover_follows_register_and_unregister() {
    let registry = ServiceRegistry::default();
    registry.register(ServiceDescriptor::new("vendor-service", "1.0.0"));

    let found = registry.discover("vendor-service").expect("registered service");
    assert_eq!(found.version, "1.0.0");
    assert_eq!(registry.list_services().len(), 1);

    // 重新注册会替换描述
    registry.register(ServiceDescriptor::new("vendor-service", "1.1.0"));
    assert_eq!(registry.discover("vendor-service").unwrap().version, "1.1.0");
    assert_eq!(registry.len(), 1);

    assert!(registry.unregister("vendor-service"));
    assert!(registry.discover("vendor-service").is_none());
    assert!(!registry.unregister("vendor-service"));
    assert!(registry.is_empty());
}

#[tokio::test]
async fn test_unhealthy_services_are_hidden_from_discovery() {
    let registry = ServiceRegistry::default();
    registry.register(ServiceDescriptor::new("a", "1.0.0"));
    registry.register(ServiceDescriptor::new("b", "1.0.0"));

    registry
        .update_health("a", HealthReport::new(HealthStatus::Unhealthy, Vec::new()))
        .unwrap();
    registry
        .update_health("b", HealthReport::new(HealthStatus::Degraded, Vec::new()))
        .unwrap();

    assert!(registry.discover("a").is_none());
    assert!(registry.discover("b").is_some());
    assert!(registry.get_entry("a").is_some());

    let names: Vec<String> = registry.list_services().into_iter().map(|d| d.name).collect();
    assert_eq!(names, vec!["b".to_string()]);

    let stats = registry.stats();
    assert_eq!(stats.total_services, 2);
    assert_eq!(stats.unhealthy_services, 1);
    assert_eq!(stats.degraded_services, 1);

    let err = registry
        .update_health("missing", HealthReport::new(HealthStatus::Healthy, Vec::new()))
        .unwrap_err();
    assert_eq!(err, RegistryError::NotFound("missing".to_string()));
}

#[tokio::test(start_paused = true)]
async fn test_cleanup_removes_services_unhealthy_past_staleness_window() {
    let registry = ServiceRegistry::default();
    registry.register(ServiceDescriptor::new("x", "1.0.0"));
    registry.register(ServiceDescriptor::new("y", "1.0.0"));

    registry
        .update_health("x", HealthReport::new(HealthStatus::Unhealthy, Vec::new()))
        .unwrap();

    // 未超过 5 分钟时不清理
    tokio::time::advance(Duration::from_secs(120)).await;
    assert!(registry.cleanup().is_empty());

    tokio::time::advance(Duration::from_secs(181)).await;
    assert_eq!(registry.cleanup(), vec!["x".to_string()]);
    assert!(registry.discover("x").is_none());
    assert!(registry.get_entry("x").is_none());
    assert!(registry.discover("y").is_some());
}

#[tokio::test(start_paused = true)]
async fn test_recovery_resets_staleness_clock() {
    let registry = ServiceRegistry::default();
    registry.register(ServiceDescriptor::new("x", "1.0.0"));

    registry
        .update_health("x", HealthReport::new(HealthStatus::Unhealthy, Vec::new()))
        .unwrap();
    tokio::time::advance(Duration::from_secs(200)).await;
    registry
        .update_health("x", HealthReport::new(HealthStatus::Healthy, Vec::new()))
        .unwrap();
    registry
        .update_health("x", HealthReport::new(HealthStatus::Unhealthy, Vec::new()))
        .unwrap();
    tokio::time::advance(Duration::from_secs(200)).await;

    assert!(registry.cleanup().is_empty());
    assert!(registry.get_entry("x").is_some());
}

#[tokio::test]
async fn test_health_check_uses_live_instance() {
    let registry = ServiceRegistry::default();
    registry.register(ServiceDescriptor::new("degraded", "1.0.0"));
    registry.register(ServiceDescriptor::new("plain", "1.0.0"));

    let source = Arc::new(FixedHealth(HealthStatus::Degraded));
    attach(&registry, "degraded", &source);

    let report = registry.health_check("degraded").await.unwrap();
    assert_eq!(report.status, HealthStatus::Degraded);
    let entry = registry.get_entry("degraded").unwrap();
    assert!(entry.last_health_check.is_some());
    assert!(entry.has_instance());

    // 没有实例的服务视为健康
    let report = registry.health_check("plain").await.unwrap();
    assert_eq!(report.status, HealthStatus::Healthy);

    assert!(matches!(
        registry.health_check("missing").await,
        Err(RegistryError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_dropped_instance_is_reported_unhealthy() {
    let registry = ServiceRegistry::default();
    registry.register(ServiceDescriptor::new("gone", "1.0.0"));
    let source = Arc::new(FixedHealth(HealthStatus::Healthy));
    attach(&registry, "gone", &source);
    drop(source);

    let report = registry.health_check("gone").await.unwrap();
    assert_eq!(report.status, HealthStatus::Unhealthy);
    assert!(registry.discover("gone").is_none());
}

#[tokio::test(start_paused = true)]
async fn test_hung_probe_times_out_as_unhealthy() {
    let registry = ServiceRegistry::new(RegistryConfig {
        probe_timeout_ms: 500,
        ..RegistryConfig::default()
    });
    registry.register(ServiceDescriptor::new("hung", "1.0.0"));
    let source = Arc::new(HungHealth);
    attach(&registry, "hung", &source);

    let report = registry.health_check("hung").await.unwrap();
    assert_eq!(report.status, HealthStatus::Unhealthy);
    assert!(report.checks[0]
        .message
        .as_deref()
        .unwrap_or_default()
        .contains("timed out"));
}

#[tokio::test(start_paused = true)]
async fn test_periodic_ticker_checks_all_services() {
    let registry = ServiceRegistry::new(RegistryConfig {
        health_check_interval_secs: 10,
        ..RegistryConfig::default()
    });
    registry.register(ServiceDescriptor::new("flaky", "1.0.0"));
    let source = Arc::new(FixedHealth(HealthStatus::Unhealthy));
    attach(&registry, "flaky", &source);

    registry.start_health_checks();
    // 重复启动不会产生第二个任务
    registry.start_health_checks();

    tokio::time::sleep(Duration::from_secs(11)).await;
    let entry = registry.get_entry("flaky").unwrap();
    assert_eq!(entry.health.status, HealthStatus::Unhealthy);
    assert!(registry.discover("flaky").is_none());

    registry.stop_health_checks().await;
}
