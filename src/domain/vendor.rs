use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value, json};

use super::store::DocumentStore;
use super::{now_millis, payload_object, query_filter, require_str};
use crate::services::error::ServiceError;
use crate::services::event::{HandlerResult, ServiceEvent, event_handler};
use crate::services::microservice::{Microservice, ServiceContext, ServiceHandler, health_probe};
use crate::services::runtime::Runtime;
use crate::services::types::{Method, ServiceDescriptor, ServiceRequest};

pub const VENDOR_SERVICE: &str = "vendor-service";
pub const VENDORS: &str = "vendors";
pub const VENDOR_NOTIFICATIONS: &str = "vendor_notifications";
pub const VENDOR_NOTIFICATION_REQUIRED: &str = "vendor.notification.required";

/// 供应商服务：供应商的增删改查，并记录需要发给供应商的通知
pub struct VendorService {
    store: Arc<dyn DocumentStore>,
}

impl VendorService {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    pub fn descriptor() -> ServiceDescriptor {
        ServiceDescriptor::new(VENDOR_SERVICE, "1.0.0")
    }

    /// 在给定运行时上创建服务实例
    pub fn create(runtime: Runtime, store: Arc<dyn DocumentStore>) -> Arc<Microservice> {
        Microservice::new(Self::descriptor(), runtime, Self::new(store))
    }

    async fn list(&self, request: &ServiceRequest) -> Result<Value, ServiceError> {
        let filter = query_filter(request, &["status", "category"]);
        let vendors = self.store.find_many(VENDORS, &filter).await?;
        Ok(Value::Array(vendors))
    }

    async fn get(&self, id: &str) -> Result<Value, ServiceError> {
        self.store
            .find_by_id(VENDORS, id)
            .await?
            .ok_or_else(|| ServiceError::not_found(format!("vendor {id} not found")))
    }

    async fn create_vendor(&self, request: &ServiceRequest) -> Result<Value, ServiceError> {
        let mut vendor = payload_object(request)?;
        require_str(&vendor, "name")?;
        require_str(&vendor, "email")?;
        vendor
            .entry("status")
            .or_insert_with(|| Value::String("Active".into()));
        vendor.insert("createdAt".into(), json!(now_millis()));

        let created = self.store.create(VENDORS, Value::Object(vendor)).await?;
        tracing::info!(vendor_id = ?created.get("id"), "Vendor created");
        Ok(created)
    }

    async fn update(&self, id: &str, request: &ServiceRequest) -> Result<Value, ServiceError> {
        let mut changes = payload_object(request)?;
        changes.insert("updatedAt".into(), json!(now_millis()));
        Ok(self.store.update(VENDORS, id, Value::Object(changes)).await?)
    }

    async fn delete(&self, id: &str) -> Result<Value, ServiceError> {
        if self.store.delete(VENDORS, id).await? {
            Ok(json!({ "id": id, "deleted": true }))
        } else {
            Err(ServiceError::not_found(format!("vendor {id} not found")))
        }
    }

    async fn notifications(&self, vendor_id: &str) -> Result<Value, ServiceError> {
        let mut filter = Map::new();
        filter.insert("vendorId".into(), Value::String(vendor_id.to_string()));
        let notifications = self.store.find_many(VENDOR_NOTIFICATIONS, &filter).await?;
        Ok(Value::Array(notifications))
    }
}

/// 记录一条待发送的供应商通知
async fn record_notification(store: Arc<dyn DocumentStore>, event: Arc<ServiceEvent>) -> HandlerResult {
    let data = event.data().cloned().unwrap_or(Value::Null);
    let vendor_id = data
        .get("vendorId")
        .and_then(Value::as_str)
        .ok_or("notification event without vendorId")?;

    let notification = json!({
        "vendorId": vendor_id,
        "poId": data.get("poId").cloned().unwrap_or(Value::Null),
        "eventId": event.id,
        "source": event.source,
        "correlationId": event.correlation_id,
        "receivedAt": now_millis(),
    });
    store.create(VENDOR_NOTIFICATIONS, notification).await?;
    tracing::info!(
        vendor_id = %vendor_id,
        event_id = %event.id,
        "Vendor notification recorded"
    );
    Ok(())
}

#[async_trait]
impl ServiceHandler for VendorService {
    async fn initialize(&self, ctx: &ServiceContext) -> Result<(), ServiceError> {
        let store = self.store.clone();
        ctx.add_health_check(
            "storage",
            health_probe(move || {
                let store = store.clone();
                async move {
                    store
                        .find_many(VENDORS, &Map::new())
                        .await
                        .map(|_| true)
                        .map_err(|e| e.to_string())
                }
            }),
        );

        let store = self.store.clone();
        ctx.subscribe(
            VENDOR_NOTIFICATION_REQUIRED,
            event_handler(move |event| record_notification(store.clone(), event)),
        )
        .map_err(|e| ServiceError::internal(e.to_string()))?;
        Ok(())
    }

    async fn shutdown(&self, _ctx: &ServiceContext) -> Result<(), ServiceError> {
        Ok(())
    }

    async fn handle_request(
        &self,
        _ctx: &ServiceContext,
        request: &ServiceRequest,
    ) -> Result<Value, ServiceError> {
        let segments = request.segments();
        match (request.method, segments.as_slice()) {
            (Method::Get, ["api", "vendors"]) => self.list(request).await,
            (Method::Post, ["api", "vendors"]) => self.create_vendor(request).await,
            (Method::Get, ["api", "vendors", id]) => self.get(id).await,
            (Method::Put | Method::Patch, ["api", "vendors", id]) => self.update(id, request).await,
            (Method::Delete, ["api", "vendors", id]) => self.delete(id).await,
            (Method::Get, ["api", "vendors", id, "notifications"]) => self.notifications(id).await,
            _ => Err(ServiceError::route_not_found(&request.endpoint)),
        }
    }
}
