use std::future::Future;
use std::time::Duration;

use crate::services::error::ServiceError;
use crate::services::types::RetryPolicy;

/// 重试执行结果
#[derive(Debug, Clone, PartialEq)]
pub struct RetryOutcome<T> {
    pub result: Result<T, ServiceError>,
    /// 实际发生的重试次数（不含首次尝试）
    pub retries: u32,
}

/// 按策略执行操作：每次尝试受 `timeout` 约束，超时按可重试错误处理；
/// 不可重试的错误立即返回
pub async fn execute_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    timeout: Duration,
    mut operation: F,
) -> RetryOutcome<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, ServiceError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        let result = match tokio::time::timeout(timeout, operation(attempt)).await {
            Ok(result) => result,
            Err(_) => Err(ServiceError::timeout(timeout.as_millis())),
        };

        match result {
            Ok(value) => {
                return RetryOutcome {
                    result: Ok(value),
                    retries: attempt,
                };
            }
            Err(err) if err.retryable && attempt + 1 < max_attempts => {
                let delay = policy.delay_for(attempt);
                tracing::warn!(
                    attempt = attempt + 1,
                    max_attempts = max_attempts,
                    retry_in_ms = delay.as_millis() as u64,
                    code = %err.code,
                    error = %err.message,
                    "Retryable failure, backing off"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => {
                return RetryOutcome {
                    result: Err(err),
                    retries: attempt,
                };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            backoff_multiplier: 2.0,
        }
    }

    #[tokio::test]
    async fn retries_until_success() {
        let calls = &AtomicU32::new(0);
        let outcome = execute_with_retry(&fast_policy(3), Duration::from_secs(1), move |_| async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(ServiceError::network("connection reset"))
            } else {
                Ok("done")
            }
        })
        .await;

        assert_eq!(outcome.result, Ok("done"));
        assert_eq!(outcome.retries, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn validation_errors_are_not_retried() {
        let calls = &AtomicU32::new(0);
        let outcome: RetryOutcome<()> =
            execute_with_retry(&fast_policy(5), Duration::from_secs(1), move |_| async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ServiceError::validation("vendorId is required"))
            })
            .await;

        assert_eq!(outcome.retries, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(outcome.result.unwrap_err().status_code, 400);
    }

    #[tokio::test(start_paused = true)]
    async fn timeouts_are_retried_then_surface_as_terminal_failure() {
        let calls = &AtomicU32::new(0);
        let outcome: RetryOutcome<()> =
            execute_with_retry(&fast_policy(3), Duration::from_millis(50), move |_| async move {
                calls.fetch_add(1, Ordering::SeqCst);
                std::future::pending::<Result<(), ServiceError>>().await
            })
            .await;

        let err = outcome.result.unwrap_err();
        assert_eq!(err.code, crate::services::error::ErrorCode::Timeout);
        assert_eq!(err.status_code, 408);
        assert_eq!(outcome.retries, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
