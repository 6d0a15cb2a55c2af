use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value, json};

use super::store::DocumentStore;
use super::vendor::VENDOR_NOTIFICATION_REQUIRED;
use super::{now_millis, payload_object, query_filter, require_str};
use crate::services::error::ServiceError;
use crate::services::event::{EventBus, HandlerResult, ServiceEvent, event_handler};
use crate::services::microservice::{Microservice, ServiceContext, ServiceHandler, health_probe};
use crate::services::runtime::Runtime;
use crate::services::types::{Method, ServiceDescriptor, ServiceRequest};

pub const PURCHASE_ORDER_SERVICE: &str = "purchase-order-service";
pub const PURCHASE_ORDERS: &str = "purchase_orders";
pub const PO_STATUS_CHANGED: &str = "po.status.changed";

/// 采购单可用的状态
pub const PO_STATUSES: [&str; 6] = [
    "Draft",
    "Submitted",
    "Approved",
    "Rejected",
    "Fulfilled",
    "Cancelled",
];
const APPROVED: &str = "Approved";

/// 采购单服务：采购单的增删改查与状态流转，审批通过后通知供应商
pub struct PurchaseOrderService {
    store: Arc<dyn DocumentStore>,
}

impl PurchaseOrderService {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    pub fn descriptor() -> ServiceDescriptor {
        ServiceDescriptor::new(PURCHASE_ORDER_SERVICE, "1.0.0")
    }

    pub fn create(runtime: Runtime, store: Arc<dyn DocumentStore>) -> Arc<Microservice> {
        Microservice::new(Self::descriptor(), runtime, Self::new(store))
    }

    async fn find(&self, id: &str) -> Result<Value, ServiceError> {
        self.store
            .find_by_id(PURCHASE_ORDERS, id)
            .await?
            .ok_or_else(|| ServiceError::not_found(format!("purchase order {id} not found")))
    }

    async fn list(&self, request: &ServiceRequest) -> Result<Value, ServiceError> {
        let filter = query_filter(request, &["status", "vendorId"]);
        let orders = self.store.find_many(PURCHASE_ORDERS, &filter).await?;
        Ok(Value::Array(orders))
    }

    async fn create_order(&self, request: &ServiceRequest) -> Result<Value, ServiceError> {
        let mut order = payload_object(request)?;
        require_str(&order, "vendorId")?;
        let total = match order.get("items") {
            Some(Value::Array(items)) if !items.is_empty() => order_total(items),
            _ => return Err(ServiceError::validation("items is required")),
        };
        order
            .entry("totalAmount")
            .or_insert_with(|| json!(total));
        order.insert("status".into(), Value::String("Draft".into()));
        order.insert("createdAt".into(), json!(now_millis()));

        let created = self.store.create(PURCHASE_ORDERS, Value::Object(order)).await?;
        tracing::info!(
            po_id = ?created.get("id"),
            vendor_id = ?created.get("vendorId"),
            "Purchase order created"
        );
        Ok(created)
    }

    async fn update(&self, id: &str, request: &ServiceRequest) -> Result<Value, ServiceError> {
        let mut changes = payload_object(request)?;
        if changes.contains_key("status") {
            return Err(ServiceError::invalid_request(
                "status changes go through the status endpoint",
            ));
        }
        changes.insert("updatedAt".into(), json!(now_millis()));
        Ok(self
            .store
            .update(PURCHASE_ORDERS, id, Value::Object(changes))
            .await?)
    }

    async fn delete(&self, id: &str) -> Result<Value, ServiceError> {
        if self.store.delete(PURCHASE_ORDERS, id).await? {
            Ok(json!({ "id": id, "deleted": true }))
        } else {
            Err(ServiceError::not_found(format!("purchase order {id} not found")))
        }
    }

    /// 修改状态并发布 `po.status.changed`，请求ID作为关联ID
    async fn change_status(
        &self,
        ctx: &ServiceContext,
        id: &str,
        request: &ServiceRequest,
    ) -> Result<Value, ServiceError> {
        let body = payload_object(request)?;
        let new_status = require_str(&body, "status")?;
        if !PO_STATUSES.contains(&new_status) {
            return Err(ServiceError::validation(format!(
                "unknown purchase order status '{new_status}'"
            )));
        }

        let current = self.find(id).await?;
        let old_status = current.get("status").cloned().unwrap_or(Value::Null);
        let vendor_id = current.get("vendorId").cloned().unwrap_or(Value::Null);
        let updated = self
            .store
            .update(
                PURCHASE_ORDERS,
                id,
                json!({ "status": new_status, "updatedAt": now_millis() }),
            )
            .await?;

        let change = json!({
            "poId": id,
            "vendorId": vendor_id,
            "oldStatus": old_status,
            "newStatus": new_status,
        });
        if let Err(err) = ctx
            .publish_event(
                PO_STATUS_CHANGED,
                change,
                request.request_id().map(str::to_string),
            )
            .await
        {
            tracing::warn!(po_id = %id, error = %err, "Failed to publish status change");
        }
        Ok(updated)
    }
}

fn order_total(items: &[Value]) -> f64 {
    items
        .iter()
        .map(|item| {
            let quantity = item.get("quantity").and_then(Value::as_f64).unwrap_or(0.0);
            let unit_price = item.get("unitPrice").and_then(Value::as_f64).unwrap_or(0.0);
            quantity * unit_price
        })
        .sum()
}

/// 审批通过时发布 `vendor.notification.required`，保留原事件的关联ID
async fn notify_vendor_on_approval(
    bus: EventBus,
    source: String,
    event: Arc<ServiceEvent>,
) -> HandlerResult {
    let Some(data) = event.data() else {
        return Ok(());
    };
    if data.get("newStatus").and_then(Value::as_str) != Some(APPROVED) {
        return Ok(());
    }

    let vendor_id = data
        .get("vendorId")
        .and_then(Value::as_str)
        .ok_or("approved purchase order without vendorId")?;
    let po_id = data
        .get("poId")
        .and_then(Value::as_str)
        .ok_or("approved purchase order without poId")?;

    let mut notification = ServiceEvent::domain(
        VENDOR_NOTIFICATION_REQUIRED,
        source,
        json!({
            "vendorId": vendor_id,
            "poId": po_id,
            "reason": "purchase_order_approved",
        }),
    );
    notification.correlation_id = event.correlation_id.clone();
    bus.publish(notification).await?;
    tracing::info!(po_id = %po_id, vendor_id = %vendor_id, "Vendor notification requested");
    Ok(())
}

#[async_trait]
impl ServiceHandler for PurchaseOrderService {
    async fn initialize(&self, ctx: &ServiceContext) -> Result<(), ServiceError> {
        let store = self.store.clone();
        ctx.add_health_check(
            "storage",
            health_probe(move || {
                let store = store.clone();
                async move {
                    store
                        .find_many(PURCHASE_ORDERS, &Map::new())
                        .await
                        .map(|_| true)
                        .map_err(|e| e.to_string())
                }
            }),
        );

        let bus = ctx.event_bus().clone();
        let source = ctx.name().to_string();
        ctx.subscribe(
            PO_STATUS_CHANGED,
            event_handler(move |event| {
                notify_vendor_on_approval(bus.clone(), source.clone(), event)
            }),
        )
        .map_err(|e| ServiceError::internal(e.to_string()))?;
        Ok(())
    }

    async fn shutdown(&self, _ctx: &ServiceContext) -> Result<(), ServiceError> {
        Ok(())
    }

    async fn handle_request(
        &self,
        ctx: &ServiceContext,
        request: &ServiceRequest,
    ) -> Result<Value, ServiceError> {
        let segments = request.segments();
        match (request.method, segments.as_slice()) {
            (Method::Get, ["api", "purchase-orders"]) => self.list(request).await,
            (Method::Post, ["api", "purchase-orders"]) => self.create_order(request).await,
            (Method::Get, ["api", "purchase-orders", id]) => self.find(id).await,
            (Method::Put, ["api", "purchase-orders", id]) => self.update(id, request).await,
            (Method::Delete, ["api", "purchase-orders", id]) => self.delete(id).await,
            (Method::Patch, ["api", "purchase-orders", id, "status"]) => {
                self.change_status(ctx, id, request).await
            }
            _ => Err(ServiceError::route_not_found(&request.endpoint)),
        }
    }
}
