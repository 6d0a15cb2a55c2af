use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, SystemTime};

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::services::types::HealthStatus;

/// 匹配所有事件类型的通配订阅
pub const WILDCARD: &str = "*";

pub const SERVICE_STARTED: &str = "service.started";
pub const SERVICE_STOPPED: &str = "service.stopped";
pub const ORCHESTRATOR_STARTED: &str = "orchestrator.started";
pub const ORCHESTRATOR_STOPPED: &str = "orchestrator.stopped";
pub const ORCHESTRATOR_HEALTH_CHECK: &str = "orchestrator.health.check";

/// 事件总线配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventConfig {
    /// 每个事件类型的最大订阅者数量
    pub max_subscribers_per_type: usize,
    /// 观察者广播通道容量
    pub channel_capacity: usize,
    /// 事件历史保留大小
    pub max_event_history: usize,
    /// 每个订阅者的最大投递次数
    pub max_retries: u32,
    /// 重试退避的基础时长（毫秒），第 n 次失败后等待 base * 2^n
    pub retry_base_delay_ms: u64,
    /// 事件 TTL 秒数
    pub event_ttl_seconds: u64,
}

impl EventConfig {
    /// 获取事件 TTL 时长
    pub fn event_ttl(&self) -> Duration {
        Duration::from_secs(self.event_ttl_seconds)
    }

    pub fn retry_delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms.saturating_mul(1u64 << attempt.min(20)))
    }
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            max_subscribers_per_type: 1000,
            channel_capacity: 1024,
            max_event_history: 1000,
            max_retries: 3,
            retry_base_delay_ms: 100,
            event_ttl_seconds: 24 * 60 * 60,
        }
    }
}

/// 事件总线错误类型
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EventError {
    #[error("Invalid event type: {event_type}")]
    InvalidEventType { event_type: String },

    #[error("Subscriber limit exceeded for event type: {event_type}")]
    SubscriberLimitExceeded { event_type: String },
}

/// 事件载荷：内部事件使用强类型，跨服务的业务事件使用结构化 JSON
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventPayload {
    ServiceStarted {
        service: String,
        version: String,
    },
    ServiceStopped {
        service: String,
    },
    OrchestratorStarted {
        services: Vec<String>,
    },
    OrchestratorStopped {
        uptime: Duration,
    },
    OrchestratorHealthCheck {
        status: HealthStatus,
        healthy_services: usize,
        total_services: usize,
    },
    Domain {
        data: Value,
    },
}

impl EventPayload {
    /// 内部事件对应的固定类型名，业务事件返回 None
    pub fn system_event_type(&self) -> Option<&'static str> {
        match self {
            EventPayload::ServiceStarted { .. } => Some(SERVICE_STARTED),
            EventPayload::ServiceStopped { .. } => Some(SERVICE_STOPPED),
            EventPayload::OrchestratorStarted { .. } => Some(ORCHESTRATOR_STARTED),
            EventPayload::OrchestratorStopped { .. } => Some(ORCHESTRATOR_STOPPED),
            EventPayload::OrchestratorHealthCheck { .. } => Some(ORCHESTRATOR_HEALTH_CHECK),
            EventPayload::Domain { .. } => None,
        }
    }
}

/// 已发布的事件，发布后不可变
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceEvent {
    pub id: String,
    pub event_type: String,
    pub source: String,
    pub payload: EventPayload,
    pub timestamp: SystemTime,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl ServiceEvent {
    pub fn new(event_type: impl Into<String>, source: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            event_type: event_type.into(),
            source: source.into(),
            payload,
            timestamp: SystemTime::now(),
            correlation_id: None,
        }
    }

    /// 业务事件
    pub fn domain(event_type: impl Into<String>, source: impl Into<String>, data: Value) -> Self {
        Self::new(event_type, source, EventPayload::Domain { data })
    }

    /// 内部事件，类型名由载荷决定
    pub fn system(source: impl Into<String>, payload: EventPayload) -> Self {
        let event_type = payload.system_event_type().unwrap_or("domain");
        Self::new(event_type, source, payload)
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// 业务事件的数据部分
    pub fn data(&self) -> Option<&Value> {
        match &self.payload {
            EventPayload::Domain { data } => Some(data),
            _ => None,
        }
    }
}

pub type HandlerResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// 事件处理函数
pub type EventHandler = Arc<dyn Fn(Arc<ServiceEvent>) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// 将异步闭包包装为 [`EventHandler`]
pub fn event_handler<F, Fut>(f: F) -> EventHandler
where
    F: Fn(Arc<ServiceEvent>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(move |event| Box::pin(f(event)))
}

/// 总线内部保存的订阅
pub(crate) struct SubscriptionEntry {
    pub(crate) id: String,
    pub(crate) pattern: String,
    pub(crate) handler: EventHandler,
    pub(crate) created_at: SystemTime,
    pub(crate) call_count: AtomicU64,
    pub(crate) error_count: AtomicU64,
    pub(crate) last_called: Mutex<Option<SystemTime>>,
}

impl SubscriptionEntry {
    pub(crate) fn new(pattern: &str, handler: EventHandler) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            pattern: pattern.to_string(),
            handler,
            created_at: SystemTime::now(),
            call_count: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            last_called: Mutex::new(None),
        }
    }

    pub(crate) fn record_call(&self) {
        self.call_count.fetch_add(1, Ordering::Relaxed);
        *self.last_called.lock().unwrap_or_else(PoisonError::into_inner) = Some(SystemTime::now());
    }

    pub(crate) fn record_error(&self) {
        self.error_count.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn info(&self) -> SubscriptionInfo {
        SubscriptionInfo {
            id: self.id.clone(),
            pattern: self.pattern.clone(),
            created_at: self.created_at,
            call_count: self.call_count.load(Ordering::Relaxed),
            error_count: self.error_count.load(Ordering::Relaxed),
            last_called: *self.last_called.lock().unwrap_or_else(PoisonError::into_inner),
        }
    }
}

impl fmt::Debug for SubscriptionEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionEntry")
            .field("id", &self.id)
            .field("pattern", &self.pattern)
            .field("call_count", &self.call_count)
            .field("error_count", &self.error_count)
            .finish_non_exhaustive()
    }
}

/// 订阅者信息
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubscriptionInfo {
    /// 订阅ID
    pub id: String,
    /// 订阅的事件类型（或 `*`）
    pub pattern: String,
    /// 订阅时间
    pub created_at: SystemTime,
    /// 调用次数（每次投递尝试计一次）
    pub call_count: u64,
    /// 重试耗尽后的失败次数
    pub error_count: u64,
    pub last_called: Option<SystemTime>,
}

/// 订阅统计信息
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SubscriptionStats {
    pub total_subscriptions: usize,
    pub subscriptions_by_type: HashMap<String, usize>,
    pub total_calls: u64,
    pub total_errors: u64,
    pub subscriptions: Vec<SubscriptionInfo>,
}

/// 事件统计信息
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EventStats {
    /// 历史中的事件数量
    pub events_in_history: usize,
    /// 按类型统计的历史事件数量
    pub events_by_type: HashMap<String, usize>,
    /// 最近一小时的平均每分钟事件数
    pub events_per_minute: f64,
    /// 已发布的事件总数
    pub events_published: u64,
    /// 成功投递的次数
    pub events_delivered: u64,
    /// 重试耗尽的投递次数
    pub delivery_failures: u64,
}

/// 单次发布的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishReport {
    pub event_id: String,
    pub subscribers: usize,
    pub delivered: usize,
    pub failed: usize,
}
