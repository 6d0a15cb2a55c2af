use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde_json::Value;

use super::health::{HealthCheck, HealthProbe};
use crate::services::error::ServiceError;
use crate::services::event::{
    EventBus, EventError, EventHandler, PublishReport, ServiceEvent, Subscription,
};
use crate::services::runtime::Runtime;
use crate::services::types::{ServiceDescriptor, ServiceRequest};

/// 每个具体服务实现的三个钩子，生命周期、重试和健康检查由 [`Microservice`] 提供
///
/// [`Microservice`]: super::Microservice
#[async_trait]
pub trait ServiceHandler: Send + Sync + 'static {
    /// 启动时调用，一般在这里订阅事件、注册额外的健康检查
    async fn initialize(&self, ctx: &ServiceContext) -> Result<(), ServiceError>;

    /// 停止时调用，之后未释放的订阅由基类统一释放
    async fn shutdown(&self, ctx: &ServiceContext) -> Result<(), ServiceError>;

    async fn handle_request(
        &self,
        ctx: &ServiceContext,
        request: &ServiceRequest,
    ) -> Result<Value, ServiceError>;
}

/// 服务运行期上下文：描述、共享运行时、订阅和健康检查
#[derive(Debug)]
pub struct ServiceContext {
    descriptor: ServiceDescriptor,
    runtime: Runtime,
    running: AtomicBool,
    checks: Mutex<Vec<HealthCheck>>,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl ServiceContext {
    pub(crate) fn new(descriptor: ServiceDescriptor, runtime: Runtime) -> Self {
        Self {
            descriptor,
            runtime,
            running: AtomicBool::new(false),
            checks: Mutex::new(Vec::new()),
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    pub fn descriptor(&self) -> &ServiceDescriptor {
        &self.descriptor
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.runtime.event_bus
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub(crate) fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
    }

    /// 以本服务为来源发布业务事件
    pub async fn publish_event(
        &self,
        event_type: &str,
        data: Value,
        correlation_id: Option<String>,
    ) -> Result<PublishReport, EventError> {
        let mut event = ServiceEvent::domain(event_type, self.name(), data);
        event.correlation_id = correlation_id;
        self.runtime.event_bus.publish(event).await
    }

    /// 订阅事件，句柄由上下文保存，服务停止时释放
    pub fn subscribe(&self, event_type: &str, handler: EventHandler) -> Result<(), EventError> {
        let subscription = self.runtime.event_bus.subscribe(event_type, handler)?;
        tracing::debug!(
            service_name = %self.name(),
            event_type = %event_type,
            subscription_id = %subscription.id(),
            "Service subscribed to events"
        );
        self.lock_subscriptions().push(subscription);
        Ok(())
    }

    /// 释放所有订阅，返回释放的数量
    pub fn unsubscribe_all(&self) -> usize {
        let subscriptions: Vec<Subscription> = self.lock_subscriptions().drain(..).collect();
        let count = subscriptions.len();
        for subscription in subscriptions {
            subscription.unsubscribe();
        }
        count
    }

    pub fn subscription_count(&self) -> usize {
        self.lock_subscriptions().len()
    }

    /// 注册（或替换同名的）健康检查
    pub fn add_health_check(&self, name: &str, probe: HealthProbe) {
        let mut checks = self.lock_checks();
        checks.retain(|check| check.name != name);
        checks.push(HealthCheck {
            name: name.to_string(),
            probe,
        });
    }

    pub fn remove_health_check(&self, name: &str) -> bool {
        let mut checks = self.lock_checks();
        let before = checks.len();
        checks.retain(|check| check.name != name);
        before != checks.len()
    }

    pub(crate) fn health_checks(&self) -> Vec<HealthCheck> {
        self.lock_checks().clone()
    }

    fn lock_checks(&self) -> MutexGuard<'_, Vec<HealthCheck>> {
        self.checks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_subscriptions(&self) -> MutexGuard<'_, Vec<Subscription>> {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
