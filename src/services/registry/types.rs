use std::fmt;
use std::sync::Weak;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;

use crate::services::error::ServiceError;
use crate::services::types::{HealthReport, HealthStatus, ServiceDescriptor};

/// 注册表配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// 周期健康检查间隔（秒）
    pub health_check_interval_secs: u64,
    /// 持续不健康多久后被清理（秒）
    pub stale_after_secs: u64,
    /// 单个健康探针的超时（毫秒）
    pub probe_timeout_ms: u64,
}

impl RegistryConfig {
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs.max(1))
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            health_check_interval_secs: 30,
            stale_after_secs: 300,
            probe_timeout_ms: 10_000,
        }
    }
}

/// 注册表错误类型
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RegistryError {
    #[error("Service not registered: {0}")]
    NotFound(String),
}

/// 注册表通过它调用存活实例的健康探针，只读不持有
#[async_trait]
pub trait HealthSource: Send + Sync {
    async fn probe_health(&self) -> Result<HealthReport, ServiceError>;
}

// 服务注册信息
#[derive(Clone)]
pub struct RegistryEntry {
    pub descriptor: ServiceDescriptor,
    pub registered_at: SystemTime,
    pub last_health_check: Option<SystemTime>,
    pub health: HealthReport,
    /// 首次被判定为不健康的时间，恢复后清空
    pub(crate) unhealthy_since: Option<Instant>,
    pub(crate) instance: Option<Weak<dyn HealthSource>>,
}

impl RegistryEntry {
    pub(crate) fn new(descriptor: ServiceDescriptor) -> Self {
        Self {
            descriptor,
            registered_at: SystemTime::now(),
            last_health_check: None,
            health: HealthReport::with_message(
                HealthStatus::Healthy,
                "registered",
                "Service registered",
            ),
            unhealthy_since: None,
            instance: None,
        }
    }

    pub fn is_unhealthy(&self) -> bool {
        self.health.status == HealthStatus::Unhealthy
    }

    pub fn has_instance(&self) -> bool {
        self.instance.is_some()
    }

    pub(crate) fn record_health(&mut self, report: HealthReport) {
        if report.status == HealthStatus::Unhealthy {
            self.unhealthy_since.get_or_insert_with(Instant::now);
        } else {
            self.unhealthy_since = None;
        }
        self.last_health_check = Some(report.timestamp);
        self.health = report;
    }
}

impl fmt::Debug for RegistryEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryEntry")
            .field("descriptor", &self.descriptor)
            .field("registered_at", &self.registered_at)
            .field("last_health_check", &self.last_health_check)
            .field("health", &self.health.status)
            .field("unhealthy_since", &self.unhealthy_since)
            .field("has_instance", &self.instance.is_some())
            .finish()
    }
}

/// 注册表统计信息
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RegistryStats {
    pub total_services: usize,
    pub healthy_services: usize,
    pub degraded_services: usize,
    pub unhealthy_services: usize,
    pub services_with_instance: usize,
}
