use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use futures::future::{BoxFuture, join_all};

use crate::services::types::{CheckResult, CheckStatus, HealthReport, HealthStatus};

/// 零参数健康探针：返回是否通过，或以错误表示探针本身失败
pub type HealthProbe = Arc<dyn Fn() -> BoxFuture<'static, Result<bool, String>> + Send + Sync>;

/// 内存使用率超过该比例时检查失败
pub const MEMORY_USAGE_THRESHOLD: f64 = 0.9;

/// 通过时耗时超过该值的检查标记为 warn
const SLOW_CHECK_THRESHOLD: Duration = Duration::from_secs(1);

/// 将异步闭包包装为 [`HealthProbe`]
pub fn health_probe<F, Fut>(f: F) -> HealthProbe
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<bool, String>> + Send + 'static,
{
    Arc::new(move || Box::pin(f()))
}

/// 具名健康检查
#[derive(Clone)]
pub struct HealthCheck {
    pub name: String,
    pub probe: HealthProbe,
}

impl std::fmt::Debug for HealthCheck {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthCheck").field("name", &self.name).finish()
    }
}

/// 单项检查的判定：失败降级为 degraded，探针报错为 unhealthy
fn classify(outcome: &Result<bool, String>) -> (CheckStatus, HealthStatus) {
    match outcome {
        Ok(true) => (CheckStatus::Pass, HealthStatus::Healthy),
        Ok(false) => (CheckStatus::Fail, HealthStatus::Degraded),
        Err(_) => (CheckStatus::Fail, HealthStatus::Unhealthy),
    }
}

async fn run_check(check: HealthCheck, timeout: Duration) -> (CheckResult, HealthStatus) {
    let started = Instant::now();
    let outcome = match tokio::time::timeout(
        timeout,
        AssertUnwindSafe((check.probe)()).catch_unwind(),
    )
    .await
    {
        Ok(Ok(result)) => result,
        Ok(Err(_)) => Err("health probe panicked".to_string()),
        Err(_) => Err(format!("health probe timed out after {}ms", timeout.as_millis())),
    };
    let duration = started.elapsed();

    let (mut status, health) = classify(&outcome);
    if status == CheckStatus::Pass && duration > SLOW_CHECK_THRESHOLD {
        status = CheckStatus::Warn;
    }
    let message = match outcome {
        Ok(true) => None,
        Ok(false) => Some(format!("check '{}' failed", check.name)),
        Err(err) => Some(err),
    };

    (
        CheckResult {
            name: check.name,
            status,
            duration,
            message,
        },
        health,
    )
}

/// 并发执行所有检查并汇总
pub async fn aggregate(checks: Vec<HealthCheck>, timeout: Duration) -> HealthReport {
    let results = join_all(checks.into_iter().map(|check| run_check(check, timeout))).await;
    let mut status = HealthStatus::Healthy;
    let mut check_results = Vec::with_capacity(results.len());
    for (result, health) in results {
        status = status.worst(health);
        check_results.push(result);
    }
    HealthReport::new(status, check_results)
}

/// 已分配堆内存占上限的比例
pub fn heap_usage_ratio(limit_bytes: u64) -> Result<f64, String> {
    if limit_bytes == 0 {
        return Err("memory limit is zero".to_string());
    }
    jemalloc_ctl::epoch::advance().map_err(|e| format!("failed to refresh allocator stats: {e}"))?;
    let allocated = jemalloc_ctl::stats::allocated::read()
        .map_err(|e| format!("failed to read allocator stats: {e}"))?;
    Ok(allocated as f64 / limit_bytes as f64)
}

/// 默认的内存检查
pub fn memory_probe(limit_bytes: u64) -> HealthProbe {
    health_probe(move || async move {
        let ratio = heap_usage_ratio(limit_bytes)?;
        if ratio >= MEMORY_USAGE_THRESHOLD {
            tracing::warn!(
                usage_percent = ratio * 100.0,
                limit_bytes = limit_bytes,
                "Heap usage above threshold"
            );
        }
        Ok(ratio < MEMORY_USAGE_THRESHOLD)
    })
}
