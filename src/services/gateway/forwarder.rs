use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use uuid::Uuid;

use super::middleware::{Middleware, Next};
use crate::services::error::ServiceError;
use crate::services::types::{HEADER_GATEWAY, HEADER_REQUEST_ID, ServiceRequest, ServiceResponse};

/// 网关转发标记的取值
pub const GATEWAY_MARKER: &str = "api-gateway";

/// 可被网关分发请求的服务
#[async_trait]
pub trait ServiceEndpoint: Send + Sync {
    async fn process_request(&self, request: ServiceRequest) -> ServiceResponse;
}

/// 补充请求ID、网关标记和路径参数
pub fn enrich_request(mut request: ServiceRequest, params: HashMap<String, String>) -> ServiceRequest {
    let request_id = request
        .request_id()
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    request
        .headers
        .insert(HEADER_REQUEST_ID.to_string(), request_id);
    request
        .headers
        .insert(HEADER_GATEWAY.to_string(), GATEWAY_MARKER.to_string());
    request.params.extend(params);
    request
}

// 经过中间件链转发请求到目标服务，链路中的 panic 转为 GATEWAY_ERROR
pub async fn forward_request(
    chain: &[Arc<dyn Middleware>],
    endpoint: &dyn ServiceEndpoint,
    request: ServiceRequest,
) -> ServiceResponse {
    let method = request.method;
    let endpoint_path = request.endpoint.clone();
    match AssertUnwindSafe(Next::new(chain, endpoint).run(request))
        .catch_unwind()
        .await
    {
        Ok(response) => response,
        Err(_) => {
            tracing::error!(
                method = %method,
                endpoint = %endpoint_path,
                "Gateway pipeline panicked"
            );
            ServiceResponse::fail(ServiceError::gateway("request pipeline panicked"))
        }
    }
}
