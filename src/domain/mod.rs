//! Demo procurement services built on the microservice base
//!
//! - `store`: the document storage seam and its in-memory implementation
//! - `vendor`: vendor records and vendor notifications
//! - `purchase_order`: purchase orders and the approval fan-out

pub mod purchase_order;
pub mod store;
pub mod vendor;

use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::{Map, Value};

use crate::services::error::ServiceError;
use crate::services::types::ServiceRequest;

pub use purchase_order::{
    PO_STATUS_CHANGED, PURCHASE_ORDER_SERVICE, PURCHASE_ORDERS, PurchaseOrderService,
};
pub use store::{DocumentStore, ID_FIELD, InMemoryStore, StoreError};
pub use vendor::{VENDOR_NOTIFICATION_REQUIRED, VENDOR_NOTIFICATIONS, VENDOR_SERVICE, VENDORS, VendorService};

/// 请求体必须是 JSON 对象
pub(crate) fn payload_object(request: &ServiceRequest) -> Result<Map<String, Value>, ServiceError> {
    match &request.payload {
        Some(Value::Object(object)) => Ok(object.clone()),
        Some(_) => Err(ServiceError::invalid_request("request body must be a JSON object")),
        None => Err(ServiceError::invalid_request("request body is required")),
    }
}

pub(crate) fn require_str<'a>(
    object: &'a Map<String, Value>,
    field: &str,
) -> Result<&'a str, ServiceError> {
    match object.get(field) {
        Some(Value::String(value)) if !value.trim().is_empty() => Ok(value),
        _ => Err(ServiceError::validation(format!("{field} is required"))),
    }
}

/// 将查询参数中允许过滤的字段转成过滤条件
pub(crate) fn query_filter(request: &ServiceRequest, fields: &[&str]) -> Map<String, Value> {
    fields
        .iter()
        .filter_map(|field| {
            request
                .query
                .get(*field)
                .map(|value| (field.to_string(), Value::String(value.clone())))
        })
        .collect()
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}
