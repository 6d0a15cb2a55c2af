use super::event::{EventBus, EventConfig};
use super::gateway::{ApiGateway, GatewayConfig};
use super::registry::{RegistryConfig, ServiceRegistry};

/// 默认的内存上限，默认健康检查按它计算使用率
pub const DEFAULT_MEMORY_LIMIT_BYTES: u64 = 2 * 1024 * 1024 * 1024;

/// 注册表、事件总线和网关的共享句柄，显式传给每个服务和编排器
#[derive(Debug, Clone)]
pub struct Runtime {
    pub registry: ServiceRegistry,
    pub event_bus: EventBus,
    pub gateway: ApiGateway,
    pub memory_limit_bytes: u64,
}

impl Runtime {
    pub fn new(registry: RegistryConfig, events: EventConfig, gateway: GatewayConfig) -> Self {
        let registry = ServiceRegistry::new(registry);
        let gateway = ApiGateway::new(registry.clone(), gateway);
        Self {
            registry,
            event_bus: EventBus::new(events),
            gateway,
            memory_limit_bytes: DEFAULT_MEMORY_LIMIT_BYTES,
        }
    }

    pub fn with_memory_limit(mut self, memory_limit_bytes: u64) -> Self {
        self.memory_limit_bytes = memory_limit_bytes;
        self
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new(
            RegistryConfig::default(),
            EventConfig::default(),
            GatewayConfig::default(),
        )
    }
}
