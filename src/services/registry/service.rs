use std::sync::{Arc, Mutex, PoisonError, Weak};

use dashmap::DashMap;
use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::types::{HealthSource, RegistryConfig, RegistryEntry, RegistryError, RegistryStats};
use crate::services::types::{HealthReport, HealthStatus, ServiceDescriptor};

/// 服务注册表：服务名 -> 注册信息
#[derive(Debug, Clone)]
pub struct ServiceRegistry {
    pub(super) entries: Arc<DashMap<String, RegistryEntry>>,
    pub(super) config: RegistryConfig,
    pub(super) task_tracker: TaskTracker,
    pub(super) ticker: Arc<Mutex<Option<CancellationToken>>>,
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new(RegistryConfig::default())
    }
}

impl ServiceRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            config,
            task_tracker: TaskTracker::new(),
            ticker: Arc::new(Mutex::new(None)),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    // 注册或替换服务
    pub fn register(&self, descriptor: ServiceDescriptor) {
        let service_name = descriptor.name.clone();
        tracing::info!(
            service_name = %service_name,
            version = %descriptor.version,
            "Registering service"
        );
        if self
            .entries
            .insert(service_name.clone(), RegistryEntry::new(descriptor))
            .is_some()
        {
            tracing::debug!(service_name = %service_name, "Replaced existing registry entry");
        }
    }

    // 注销服务
    pub fn unregister(&self, service_name: &str) -> bool {
        if self.entries.remove(service_name).is_some() {
            tracing::info!(service_name = %service_name, "Unregistered service");
            true
        } else {
            tracing::warn!(service_name = %service_name, "Unregister requested for unknown service");
            false
        }
    }

    /// 绑定存活实例（在注册之后进行）
    pub fn register_instance(
        &self,
        service_name: &str,
        instance: Weak<dyn HealthSource>,
    ) -> Result<(), RegistryError> {
        let mut entry = self
            .entries
            .get_mut(service_name)
            .ok_or_else(|| RegistryError::NotFound(service_name.to_string()))?;
        entry.instance = Some(instance);
        tracing::debug!(service_name = %service_name, "Attached live instance to registry entry");
        Ok(())
    }

    /// 发现服务：存在且最近一次健康状态不是 unhealthy
    pub fn discover(&self, service_name: &str) -> Option<ServiceDescriptor> {
        self.entries
            .get(service_name)
            .filter(|entry| !entry.is_unhealthy())
            .map(|entry| entry.descriptor.clone())
    }

    // 获取所有可用的服务
    pub fn list_services(&self) -> Vec<ServiceDescriptor> {
        let mut services: Vec<ServiceDescriptor> = self
            .entries
            .iter()
            .filter(|entry| !entry.value().is_unhealthy())
            .map(|entry| entry.value().descriptor.clone())
            .collect();
        services.sort_by(|a, b| a.name.cmp(&b.name));
        services
    }

    // 获取服务注册信息（包括不健康的服务）
    pub fn get_entry(&self, service_name: &str) -> Option<RegistryEntry> {
        self.entries
            .get(service_name)
            .map(|entry| entry.value().clone())
    }

    pub fn service_names(&self) -> Vec<String> {
        self.entries.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 手动更新服务健康状态
    pub fn update_health(
        &self,
        service_name: &str,
        report: HealthReport,
    ) -> Result<(), RegistryError> {
        let mut entry = self
            .entries
            .get_mut(service_name)
            .ok_or_else(|| RegistryError::NotFound(service_name.to_string()))?;
        if entry.health.status != report.status {
            tracing::info!(
                service_name = %service_name,
                old_status = %entry.health.status,
                new_status = %report.status,
                "Updated health status for service"
            );
        }
        entry.record_health(report);
        Ok(())
    }

    /// 对单个服务执行健康检查并保存结果
    pub async fn health_check(&self, service_name: &str) -> Result<HealthReport, RegistryError> {
        // 先取出弱引用，避免跨 await 持有分片锁
        let instance = self
            .entries
            .get(service_name)
            .map(|entry| entry.instance.clone())
            .ok_or_else(|| RegistryError::NotFound(service_name.to_string()))?;

        let report = match instance {
            None => HealthReport::with_message(
                HealthStatus::Healthy,
                "registered",
                "No health probe exposed; registered services are assumed healthy",
            ),
            Some(weak) => match weak.upgrade() {
                None => HealthReport::with_message(
                    HealthStatus::Unhealthy,
                    "instance",
                    "Service instance has been dropped",
                ),
                Some(source) => {
                    match tokio::time::timeout(self.config.probe_timeout(), source.probe_health())
                        .await
                    {
                        Ok(Ok(report)) => report,
                        Ok(Err(err)) => {
                            tracing::warn!(
                                service_name = %service_name,
                                error = %err,
                                "Health probe failed"
                            );
                            HealthReport::with_message(HealthStatus::Unhealthy, "probe", err.message)
                        }
                        Err(_) => {
                            tracing::warn!(
                                service_name = %service_name,
                                timeout_ms = self.config.probe_timeout_ms,
                                "Health probe timed out"
                            );
                            HealthReport::with_message(
                                HealthStatus::Unhealthy,
                                "probe",
                                format!(
                                    "Health probe timed out after {}ms",
                                    self.config.probe_timeout_ms
                                ),
                            )
                        }
                    }
                }
            },
        };

        // 检查期间服务可能已被注销
        self.update_health(service_name, report.clone())?;
        Ok(report)
    }

    /// 并发检查所有服务，单个服务的失败不影响其他服务
    pub async fn check_all(&self) -> Vec<(String, HealthStatus)> {
        let names = self.service_names();
        let checks = names.into_iter().map(|name| async move {
            match self.health_check(&name).await {
                Ok(report) => Some((name, report.status)),
                Err(err) => {
                    tracing::debug!(service_name = %name, error = %err, "Skipped health check");
                    None
                }
            }
        });
        join_all(checks).await.into_iter().flatten().collect()
    }

    // 获取统计信息
    pub fn stats(&self) -> RegistryStats {
        let mut stats = RegistryStats::default();
        for entry in self.entries.iter() {
            stats.total_services += 1;
            match entry.health.status {
                HealthStatus::Healthy => stats.healthy_services += 1,
                HealthStatus::Degraded => stats.degraded_services += 1,
                HealthStatus::Unhealthy => stats.unhealthy_services += 1,
            }
            if entry.has_instance() {
                stats.services_with_instance += 1;
            }
        }
        stats
    }

    pub(super) fn ticker_slot(&self) -> std::sync::MutexGuard<'_, Option<CancellationToken>> {
        self.ticker.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
