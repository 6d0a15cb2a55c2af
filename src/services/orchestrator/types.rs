use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::services::error::ServiceError;
use crate::services::event::{EventStats, SubscriptionStats};
use crate::services::gateway::{GatewayError, GatewayStats};
use crate::services::microservice::ServiceMetrics;
use crate::services::registry::RegistryStats;
use crate::services::runtime::DEFAULT_MEMORY_LIMIT_BYTES;
use crate::services::types::{HealthReport, HealthStatus};

/// 编排器发布系统事件时使用的来源名
pub const ORCHESTRATOR_SOURCE: &str = "orchestrator";

/// 编排器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// 健康轮询间隔（秒）
    pub health_check_interval_secs: u64,
    /// 默认内存检查使用的上限
    pub memory_limit_bytes: u64,
}

impl OrchestratorConfig {
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs.max(1))
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            health_check_interval_secs: 30,
            memory_limit_bytes: DEFAULT_MEMORY_LIMIT_BYTES,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestratorState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl fmt::Display for OrchestratorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OrchestratorState::Stopped => "stopped",
            OrchestratorState::Starting => "starting",
            OrchestratorState::Running => "running",
            OrchestratorState::Stopping => "stopping",
        };
        f.write_str(s)
    }
}

/// 编排器错误类型
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Service declared more than once: {0}")]
    DuplicateService(String),
    #[error("Service {service} depends on unknown service {dependency}")]
    UnknownDependency { service: String, dependency: String },
    #[error("Dependency cycle between services: {}", .0.join(", "))]
    DependencyCycle(Vec<String>),
    #[error("Service {service} failed to start: {source}")]
    ServiceStartFailed {
        service: String,
        #[source]
        source: ServiceError,
    },
    #[error("Route for {service} rejected: {source}")]
    RouteRejected {
        service: String,
        #[source]
        source: GatewayError,
    },
    #[error("Services failed to stop cleanly: {}", .failed.join(", "))]
    ShutdownIncomplete { failed: Vec<String> },
}

/// 所有受管服务的健康汇总
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrchestratorHealth {
    pub status: HealthStatus,
    pub healthy_services: usize,
    pub total_services: usize,
    pub services: BTreeMap<String, HealthReport>,
}

impl OrchestratorHealth {
    /// 健康比例低于 50% 为 unhealthy，低于 100% 为 degraded
    pub fn from_reports(services: BTreeMap<String, HealthReport>) -> Self {
        let total_services = services.len();
        let healthy_services = services
            .values()
            .filter(|report| report.status == HealthStatus::Healthy)
            .count();
        let status = if healthy_services * 2 < total_services {
            HealthStatus::Unhealthy
        } else if healthy_services < total_services {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };
        Self {
            status,
            healthy_services,
            total_services,
            services,
        }
    }
}

/// 编排器指标快照
#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorMetrics {
    pub state: OrchestratorState,
    pub uptime: Option<Duration>,
    pub configured_services: usize,
    pub running_services: usize,
    pub health: OrchestratorHealth,
    pub services: Vec<ServiceMetrics>,
    pub event_bus: EventStats,
    pub subscriptions: SubscriptionStats,
    pub registry: RegistryStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway: Option<GatewayStats>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reports(statuses: &[HealthStatus]) -> BTreeMap<String, HealthReport> {
        statuses
            .iter()
            .enumerate()
            .map(|(i, status)| (format!("svc-{i}"), HealthReport::new(*status, Vec::new())))
            .collect()
    }

    #[test]
    fn overall_status_follows_healthy_ratio() {
        use HealthStatus::*;
        assert_eq!(OrchestratorHealth::from_reports(reports(&[Healthy, Healthy])).status, Healthy);
        assert_eq!(OrchestratorHealth::from_reports(reports(&[Healthy, Degraded])).status, Degraded);
        assert_eq!(
            OrchestratorHealth::from_reports(reports(&[Healthy, Unhealthy, Degraded])).status,
            Unhealthy
        );
        assert_eq!(OrchestratorHealth::from_reports(BTreeMap::new()).status, Healthy);
    }
}
