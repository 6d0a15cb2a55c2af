use std::collections::VecDeque;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tokio::time::Instant;

use crate::services::types::CircuitBreakerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        };
        f.write_str(s)
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    /// 监控窗口内的失败时间点
    failures: VecDeque<Instant>,
    opened_at: Option<Instant>,
    /// 半开状态下是否已有探测请求在执行
    probe_in_flight: bool,
}

/// 熔断器：窗口内失败达到阈值后打开，等待 reset_timeout 后放行一个探测请求
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failures: VecDeque::new(),
                opened_at: None,
                probe_in_flight: false,
            }),
        }
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// 申请放行；半开状态下只发放一个试探凭证
    pub fn acquire(&self) -> Option<CallPermit<'_>> {
        let mut inner = self.lock();
        let trial = match inner.state {
            CircuitState::Closed => false,
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|opened| opened.elapsed())
                    .unwrap_or_default();
                if elapsed < self.config.reset_timeout {
                    return None;
                }
                inner.state = CircuitState::HalfOpen;
                true
            }
            CircuitState::HalfOpen if inner.probe_in_flight => return None,
            CircuitState::HalfOpen => true,
        };
        if trial {
            inner.probe_in_flight = true;
        }
        Some(CallPermit {
            breaker: self,
            trial,
            settled: false,
        })
    }

    fn record_success(&self) {
        let mut inner = self.lock();
        if inner.state == CircuitState::HalfOpen {
            tracing::info!("Circuit closed after successful probe");
        }
        inner.state = CircuitState::Closed;
        inner.failures.clear();
        inner.opened_at = None;
        inner.probe_in_flight = false;
    }

    fn record_failure(&self) {
        let now = Instant::now();
        let mut inner = self.lock();
        match inner.state {
            CircuitState::HalfOpen | CircuitState::Open => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(now);
                inner.probe_in_flight = false;
            }
            CircuitState::Closed => {
                if self.config.failure_threshold == 0 {
                    return;
                }
                let window = self.config.monitoring_window;
                inner.failures.push_back(now);
                while inner
                    .failures
                    .front()
                    .is_some_and(|at| now.duration_since(*at) > window)
                {
                    inner.failures.pop_front();
                }
                if inner.failures.len() >= self.config.failure_threshold as usize {
                    tracing::warn!(
                        failures = inner.failures.len(),
                        window_secs = window.as_secs(),
                        "Circuit opened after repeated failures"
                    );
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(now);
                    inner.failures.clear();
                }
            }
        }
    }

    /// 试探请求未给出结果就被丢弃，重新打开熔断器并重新计时
    fn abandon_trial(&self) {
        let mut inner = self.lock();
        if inner.state == CircuitState::HalfOpen && inner.probe_in_flight {
            tracing::warn!("Circuit probe abandoned, reopening");
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
            inner.probe_in_flight = false;
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// 熔断器放行凭证，调用结束后用 `success`/`failure` 记录结果
#[must_use]
pub struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl CallPermit<'_> {
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn success(mut self) {
        self.settled = true;
        self.breaker.record_success();
    }

    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.record_failure();
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if self.trial && !self.settled {
            self.breaker.abandon_trial();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: 3,
            reset_timeout: Duration::from_secs(30),
            monitoring_window: Duration::from_secs(60),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn opens_at_threshold_and_half_opens_after_reset() {
        let breaker = breaker();
        for _ in 0..3 {
            breaker.acquire().unwrap().failure();
        }
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(breaker.acquire().is_none());

        tokio::time::advance(Duration::from_secs(31)).await;
        let trial = breaker.acquire().unwrap();
        assert!(trial.is_trial());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        // 半开状态只放行一个试探请求
        assert!(breaker.acquire().is_none());

        trial.success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(!breaker.acquire().unwrap().is_trial());
    }

    #[tokio::test(start_paused = true)]
    async fn failures_outside_window_are_forgotten() {
        let breaker = breaker();
        breaker.acquire().unwrap().failure();
        breaker.acquire().unwrap().failure();
        tokio::time::advance(Duration::from_secs(61)).await;
        breaker.acquire().unwrap().failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_trial_reopens() {
        let breaker = breaker();
        for _ in 0..3 {
            breaker.acquire().unwrap().failure();
        }
        tokio::time::advance(Duration::from_secs(31)).await;
        breaker.acquire().unwrap().failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(breaker.acquire().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_trial_reopens_and_allows_a_later_trial() {
        let breaker = breaker();
        for _ in 0..3 {
            breaker.acquire().unwrap().failure();
        }
        tokio::time::advance(Duration::from_secs(31)).await;
        drop(breaker.acquire().unwrap());
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(breaker.acquire().is_none());

        tokio::time::advance(Duration::from_secs(31)).await;
        let trial = breaker.acquire().unwrap();
        assert!(trial.is_trial());
        trial.success();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn dropping_closed_permit_changes_nothing() {
        let breaker = breaker();
        drop(breaker.acquire().unwrap());
        breaker.acquire().unwrap().failure();
        drop(breaker.acquire().unwrap());
        assert_eq!(breaker.state(), CircuitState::Closed);
    }
}
