use tokio_util::sync::CancellationToken;

use super::service::ServiceRegistry;

impl ServiceRegistry {
    // 启动周期健康检查任务
    pub fn start_health_checks(&self) {
        let mut slot = self.ticker_slot();
        if slot.is_some() {
            tracing::debug!("Registry health ticker already running");
            return;
        }

        let token = CancellationToken::new();
        let cancelled = token.clone();
        let registry = self.clone();
        let interval_duration = self.config.health_check_interval();

        self.task_tracker.spawn(async move {
            let mut interval = tokio::time::interval(interval_duration);
            // 第一次 tick 立即完成，跳过
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = cancelled.cancelled() => break,
                    _ = interval.tick() => {
                        tracing::debug!("Executing registry health check...");
                        registry.check_all().await;
                        registry.cleanup();
                    }
                }
            }
            tracing::debug!("Registry health ticker stopped");
        });

        tracing::info!(
            interval_secs = interval_duration.as_secs(),
            "Started registry health ticker"
        );
        *slot = Some(token);
    }

    // 停止周期健康检查任务
    pub async fn stop_health_checks(&self) {
        let token = self.ticker_slot().take();
        if let Some(token) = token {
            token.cancel();
            self.task_tracker.close();
            self.task_tracker.wait().await;
            self.task_tracker.reopen();
        }
    }

    /// 清理持续不健康超过阈值的服务，返回被移除的服务名
    pub fn cleanup(&self) -> Vec<String> {
        let stale_after = self.config.stale_after();
        let mut to_remove = Vec::new();

        // 收集需要删除的服务
        for entry in self.entries.iter() {
            if let Some(since) = entry.value().unhealthy_since {
                let elapsed = since.elapsed();
                if elapsed > stale_after {
                    tracing::warn!(
                        service_name = %entry.key(),
                        unhealthy_secs = elapsed.as_secs(),
                        stale_after_secs = stale_after.as_secs(),
                        "Service unhealthy past staleness window, removing from registry"
                    );
                    to_remove.push(entry.key().clone());
                }
            }
        }

        if !to_remove.is_empty() {
            tracing::info!(
                expired_count = to_remove.len(),
                "Cleanup check completed, removing stale services..."
            );
        }

        // 删除过期的服务（重新确认状态，避免误删刚恢复的服务）
        to_remove.retain(|service_name| {
            self.entries
                .remove_if(service_name, |_, entry| {
                    entry
                        .unhealthy_since
                        .is_some_and(|since| since.elapsed() > stale_after)
                })
                .is_some()
        });
        to_remove
    }
}
