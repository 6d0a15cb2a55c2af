pub mod event_bus;
pub mod types;

pub use event_bus::{EventBus, Subscription};
pub use types::{
    EventConfig, EventError, EventHandler, EventPayload, EventStats, HandlerResult,
    PublishReport, ServiceEvent, SubscriptionInfo, SubscriptionStats, WILDCARD, event_handler,
};
