use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};

use dashmap::DashMap;
use futures::FutureExt;
use futures::future::join_all;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};

use super::types::{
    EventConfig, EventError, EventHandler, EventStats, PublishReport, ServiceEvent,
    SubscriptionEntry, SubscriptionStats, WILDCARD,
};
use crate::services::types::{CheckResult, CheckStatus, HealthReport, HealthStatus};

/// 发布计数
#[derive(Debug, Default)]
struct PublishCounters {
    events_published: u64,
    events_delivered: u64,
    delivery_failures: u64,
}

/// 进程内事件总线：按类型订阅，逐订阅者重试，保留有限历史
#[derive(Debug, Clone)]
pub struct EventBus {
    /// 事件类型（或 `*`）-> 订阅列表
    subscriptions: Arc<DashMap<String, Vec<Arc<SubscriptionEntry>>>>,
    /// 最近的事件，最旧的在前
    history: Arc<Mutex<VecDeque<Arc<ServiceEvent>>>>,
    /// 事件统计
    counters: Arc<Mutex<PublishCounters>>,
    /// 观察者广播通道
    watchers: broadcast::Sender<Arc<ServiceEvent>>,
    /// 配置
    config: EventConfig,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(EventConfig::default())
    }
}

impl EventBus {
    /// 创建新的事件总线
    pub fn new(config: EventConfig) -> Self {
        let (watchers, _) = broadcast::channel(config.channel_capacity.max(1));
        Self {
            subscriptions: Arc::new(DashMap::new()),
            history: Arc::new(Mutex::new(VecDeque::new())),
            counters: Arc::new(Mutex::new(PublishCounters::default())),
            watchers,
            config,
        }
    }

    pub fn config(&self) -> &EventConfig {
        &self.config
    }

    /// 发布事件，等待所有订阅者完成投递尝试（成功或重试耗尽）后返回
    pub async fn publish(&self, event: ServiceEvent) -> Result<PublishReport, EventError> {
        // 验证事件类型
        if event.event_type.is_empty() || event.event_type == WILDCARD {
            return Err(EventError::InvalidEventType {
                event_type: event.event_type,
            });
        }

        let event = Arc::new(event);
        self.append_history(event.clone());
        // 没有观察者时发送失败，忽略即可
        let _ = self.watchers.send(event.clone());

        let targets = self.matching_subscriptions(&event.event_type);
        let subscriber_count = targets.len();

        // 每个订阅者一个任务，互不影响
        let deliveries = targets.into_iter().map(|subscription| {
            let event = event.clone();
            let config = self.config.clone();
            tokio::spawn(async move { Self::deliver(&config, &subscription, event).await })
        });
        let outcomes = join_all(deliveries).await;

        let delivered = outcomes
            .iter()
            .filter(|outcome| matches!(outcome, Ok(true)))
            .count();
        let failed = subscriber_count - delivered;

        {
            let mut counters = self.lock_counters();
            counters.events_published += 1;
            counters.events_delivered += delivered as u64;
            counters.delivery_failures += failed as u64;
        }

        tracing::debug!(
            event_type = %event.event_type,
            event_id = %event.id,
            subscriber_count = %subscriber_count,
            failed = %failed,
            "Published event"
        );

        Ok(PublishReport {
            event_id: event.id.clone(),
            subscribers: subscriber_count,
            delivered,
            failed,
        })
    }

    /// 向单个订阅者投递，失败时按指数退避重试
    async fn deliver(
        config: &EventConfig,
        subscription: &SubscriptionEntry,
        event: Arc<ServiceEvent>,
    ) -> bool {
        let max_attempts = config.max_retries.max(1);
        for attempt in 0..max_attempts {
            subscription.record_call();
            let outcome = AssertUnwindSafe((subscription.handler)(event.clone()))
                .catch_unwind()
                .await;
            let error = match outcome {
                Ok(Ok(())) => return true,
                Ok(Err(err)) => err.to_string(),
                Err(_) => "event handler panicked".to_string(),
            };

            if attempt + 1 < max_attempts {
                let delay = config.retry_delay(attempt);
                tracing::warn!(
                    event_type = %event.event_type,
                    event_id = %event.id,
                    subscription_id = %subscription.id,
                    attempt = attempt + 1,
                    retry_in_ms = delay.as_millis() as u64,
                    error = %error,
                    "Event handler failed, retrying"
                );
                tokio::time::sleep(delay).await;
            } else {
                tracing::error!(
                    event_type = %event.event_type,
                    event_id = %event.id,
                    subscription_id = %subscription.id,
                    attempts = max_attempts,
                    error = %error,
                    "Event handler failed after all retries"
                );
            }
        }
        subscription.record_error();
        false
    }

    /// 订阅指定事件类型（`*` 订阅所有事件），返回用于取消订阅的句柄
    pub fn subscribe(
        &self,
        event_type: &str,
        handler: EventHandler,
    ) -> Result<Subscription, EventError> {
        if event_type.is_empty() {
            return Err(EventError::InvalidEventType {
                event_type: event_type.to_string(),
            });
        }

        let entry = Arc::new(SubscriptionEntry::new(event_type, handler));
        let subscription_id = entry.id.clone();
        {
            let mut list = self.subscriptions.entry(event_type.to_string()).or_default();
            // 检查订阅者限制
            if list.len() >= self.config.max_subscribers_per_type {
                return Err(EventError::SubscriberLimitExceeded {
                    event_type: event_type.to_string(),
                });
            }
            list.push(entry);
        }

        tracing::info!(
            event_type = %event_type,
            subscription_id = %subscription_id,
            "New subscription created"
        );

        Ok(Subscription {
            id: subscription_id,
            event_type: event_type.to_string(),
            bus: self.clone(),
        })
    }

    /// 取消订阅；订阅列表为空时移除该事件类型
    pub fn unsubscribe(&self, event_type: &str, subscription_id: &str) -> bool {
        let removed = match self.subscriptions.get_mut(event_type) {
            Some(mut list) => {
                let before = list.len();
                list.retain(|entry| entry.id != subscription_id);
                before != list.len()
            }
            None => false,
        };
        self.subscriptions
            .remove_if(event_type, |_, list| list.is_empty());

        if removed {
            tracing::info!(
                event_type = %event_type,
                subscription_id = %subscription_id,
                "Unsubscribed from events"
            );
        } else {
            tracing::debug!(
                event_type = %event_type,
                subscription_id = %subscription_id,
                "Unsubscribe requested for unknown subscription"
            );
        }
        removed
    }

    /// 以流的形式观察已发布的事件，不参与重试和统计
    pub fn watch(&self, pattern: &str) -> impl Stream<Item = Arc<ServiceEvent>> + Send + 'static {
        let pattern = pattern.to_string();
        BroadcastStream::new(self.watchers.subscribe()).filter_map(move |result| match result {
            Ok(event) if pattern == WILDCARD || event.event_type == pattern => Some(event),
            Ok(_) => None,
            Err(err) => {
                tracing::debug!(error = %err, "Event watcher lagged behind");
                None
            }
        })
    }

    /// 最近的事件，最新的在前
    pub fn get_event_history(
        &self,
        event_type: Option<&str>,
        limit: Option<usize>,
    ) -> Vec<Arc<ServiceEvent>> {
        let history = self.lock_history();
        history
            .iter()
            .rev()
            .filter(|event| event_type.is_none_or(|t| event.event_type == t))
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect()
    }

    // 获取订阅统计信息
    pub fn get_subscription_stats(&self) -> SubscriptionStats {
        let mut stats = SubscriptionStats::default();
        for entry in self.subscriptions.iter() {
            stats
                .subscriptions_by_type
                .insert(entry.key().clone(), entry.value().len());
            for subscription in entry.value() {
                let info = subscription.info();
                stats.total_calls += info.call_count;
                stats.total_errors += info.error_count;
                stats.subscriptions.push(info);
            }
        }
        stats.total_subscriptions = stats.subscriptions.len();
        stats
    }

    // 获取事件统计信息
    pub fn get_event_stats(&self) -> EventStats {
        let now = SystemTime::now();
        let hour = Duration::from_secs(60 * 60);
        let mut events_by_type: HashMap<String, usize> = HashMap::new();
        let mut last_hour = 0usize;

        let events_in_history = {
            let history = self.lock_history();
            for event in history.iter() {
                *events_by_type.entry(event.event_type.clone()).or_default() += 1;
                let recent = now
                    .duration_since(event.timestamp)
                    .map(|age| age <= hour)
                    .unwrap_or(true);
                if recent {
                    last_hour += 1;
                }
            }
            history.len()
        };

        let counters = self.lock_counters();
        EventStats {
            events_in_history,
            events_by_type,
            events_per_minute: last_hour as f64 / 60.0,
            events_published: counters.events_published,
            events_delivered: counters.events_delivered,
            delivery_failures: counters.delivery_failures,
        }
    }

    /// 根据累计的处理错误率计算健康状态
    pub fn health_check(&self) -> HealthReport {
        let started = std::time::Instant::now();
        let stats = self.get_subscription_stats();
        let error_rate = if stats.total_calls == 0 {
            0.0
        } else {
            stats.total_errors as f64 / stats.total_calls as f64
        };
        let status = status_for_error_rate(error_rate);
        if status != HealthStatus::Healthy {
            tracing::warn!(
                error_rate = error_rate,
                total_calls = stats.total_calls,
                total_errors = stats.total_errors,
                status = %status,
                "Event bus handler error rate elevated"
            );
        }

        let check_status = match status {
            HealthStatus::Healthy => CheckStatus::Pass,
            HealthStatus::Degraded => CheckStatus::Warn,
            HealthStatus::Unhealthy => CheckStatus::Fail,
        };
        HealthReport::new(
            status,
            vec![CheckResult {
                name: "handler_error_rate".to_string(),
                status: check_status,
                duration: started.elapsed(),
                message: Some(format!(
                    "{:.2}% handler errors ({} errors / {} calls, {} subscriptions)",
                    error_rate * 100.0,
                    stats.total_errors,
                    stats.total_calls,
                    stats.total_subscriptions
                )),
            }],
        )
    }

    /// 清理超过 TTL 的历史事件，返回移除数量
    pub fn cleanup(&self) -> usize {
        let ttl = self.config.event_ttl();
        let now = SystemTime::now();
        let mut history = self.lock_history();
        let before = history.len();
        history.retain(|event| {
            now.duration_since(event.timestamp)
                .map(|age| age <= ttl)
                .unwrap_or(true)
        });
        let removed = before - history.len();
        if removed > 0 {
            tracing::debug!(removed = removed, "Cleaned up expired event history");
        }
        removed
    }

    /// 清空所有订阅和历史
    pub fn clear(&self) {
        self.subscriptions.clear();
        self.lock_history().clear();
        *self.lock_counters() = PublishCounters::default();
        tracing::info!("Event bus cleared");
    }

    fn append_history(&self, event: Arc<ServiceEvent>) {
        let mut history = self.lock_history();
        history.push_back(event);
        while history.len() > self.config.max_event_history {
            history.pop_front();
        }
    }

    /// 精确匹配的订阅加上所有通配订阅
    fn matching_subscriptions(&self, event_type: &str) -> Vec<Arc<SubscriptionEntry>> {
        let mut targets: Vec<Arc<SubscriptionEntry>> = self
            .subscriptions
            .get(event_type)
            .map(|list| list.value().clone())
            .unwrap_or_default();
        if let Some(wildcards) = self.subscriptions.get(WILDCARD) {
            targets.extend(wildcards.value().iter().cloned());
        }
        targets
    }

    fn lock_history(&self) -> MutexGuard<'_, VecDeque<Arc<ServiceEvent>>> {
        self.history.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_counters(&self) -> MutexGuard<'_, PublishCounters> {
        self.counters.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// 错误率超过 10% 为 unhealthy，超过 5% 为 degraded
fn status_for_error_rate(error_rate: f64) -> HealthStatus {
    if error_rate > 0.10 {
        HealthStatus::Unhealthy
    } else if error_rate > 0.05 {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    }
}

/// 订阅句柄，调用 [`Subscription::unsubscribe`] 取消订阅
#[derive(Debug, Clone)]
pub struct Subscription {
    id: String,
    event_type: String,
    bus: EventBus,
}

impl Subscription {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn unsubscribe(self) -> bool {
        self.bus.unsubscribe(&self.event_type, &self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::event::types::event_handler;

    fn bus_with_counts(calls: u64, errors: u64) -> EventBus {
        let bus = EventBus::default();
        let subscription = bus
            .subscribe("po.created", event_handler(|_| async { Ok(()) }))
            .unwrap();
        let list = bus.subscriptions.get("po.created").unwrap();
        let entry = list
            .iter()
            .find(|entry| entry.id == subscription.id())
            .unwrap();
        entry.call_count.store(calls, Ordering::Relaxed);
        entry.error_count.store(errors, Ordering::Relaxed);
        drop(list);
        bus
    }

    #[test]
    fn health_thresholds_follow_error_rate() {
        assert_eq!(bus_with_counts(100, 0).health_check().status, HealthStatus::Healthy);
        assert_eq!(bus_with_counts(100, 5).health_check().status, HealthStatus::Healthy);
        assert_eq!(bus_with_counts(100, 6).health_check().status, HealthStatus::Degraded);
        assert_eq!(bus_with_counts(100, 10).health_check().status, HealthStatus::Degraded);
        assert_eq!(bus_with_counts(100, 11).health_check().status, HealthStatus::Unhealthy);
    }

    #[test]
    fn no_calls_is_healthy() {
        assert_eq!(EventBus::default().health_check().status, HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn empty_type_list_is_removed_on_last_unsubscribe() {
        let bus = EventBus::default();
        let first = bus
            .subscribe("vendor.updated", event_handler(|_| async { Ok(()) }))
            .unwrap();
        let second = bus
            .subscribe("vendor.updated", event_handler(|_| async { Ok(()) }))
            .unwrap();

        assert!(first.unsubscribe());
        assert!(bus.subscriptions.contains_key("vendor.updated"));
        assert!(second.unsubscribe());
        assert!(!bus.subscriptions.contains_key("vendor.updated"));
    }
}
