use std::sync::Arc;

use serde_json::json;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;

use crate::config::Config;
use crate::services::event::{EventBus, WILDCARD};
use crate::services::orchestrator::{Orchestrator, install_shutdown_hook};
use crate::services::types::{HEADER_CLIENT_ID, Method, ServiceRequest};

/// 按配置构建带默认服务的编排器
pub fn build(config: &Config) -> Orchestrator {
    Orchestrator::with_default_services(config.runtime(), config.orchestrator.clone())
}

/// 订阅全部事件并记录审计日志
pub fn spawn_audit_tap(event_bus: &EventBus) -> JoinHandle<()> {
    let mut events = Box::pin(event_bus.watch(WILDCARD));
    tokio::spawn(async move {
        while let Some(event) = events.next().await {
            tracing::info!(
                event_id = %event.id,
                event_type = %event.event_type,
                source = %event.source,
                correlation_id = ?event.correlation_id,
                "Audit event"
            );
        }
    })
}

pub async fn start(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let orchestrator = Arc::new(build(&config));
    let audit = spawn_audit_tap(&orchestrator.runtime().event_bus);

    orchestrator.start().await?;
    tracing::info!(order = ?orchestrator.start_order()?, "Procurement mesh is running");

    run_demo_flow(&orchestrator).await;
    let metrics = orchestrator.get_metrics().await;
    tracing::info!(metrics = %serde_json::to_string(&metrics)?, "Metrics snapshot");

    // 正常情况下收到信号后进程直接退出
    install_shutdown_hook(orchestrator.clone()).await?;
    orchestrator.stop().await?;
    audit.abort();
    Ok(())
}

/// 通过网关走一遍采购流程：创建供应商、创建采购单、审批、查询供应商通知
async fn run_demo_flow(orchestrator: &Orchestrator) {
    let gateway = &orchestrator.runtime().gateway;
    let send = |request: ServiceRequest| async move {
        let request = request.with_header(HEADER_CLIENT_ID, "demo");
        let label = format!("{} {}", request.method, request.endpoint);
        let response = gateway.route(request).await;
        let body = match &response.result {
            Ok(data) => data.to_string(),
            Err(err) => serde_json::to_string(err).unwrap_or_else(|_| err.to_string()),
        };
        tracing::info!(
            request = %label,
            request_id = %response.metadata.request_id,
            status = response.status_code(),
            body = %body,
            "Demo request"
        );
        response
    };

    send(
        ServiceRequest::new(Method::Post, "/api/vendors").with_payload(json!({
            "id": "V1",
            "name": "Acme Industrial Supply",
            "email": "orders@acme.example",
        })),
    )
    .await;

    let created = send(
        ServiceRequest::new(Method::Post, "/api/purchase-orders").with_payload(json!({
            "id": "PO-2025-001",
            "vendorId": "V1",
            "items": [{"sku": "BOLT-M8", "quantity": 500, "unitPrice": 0.12}],
        })),
    )
    .await;
    if !created.is_success() {
        return;
    }

    send(
        ServiceRequest::new(Method::Patch, "/api/purchase-orders/PO-2025-001/status")
            .with_payload(json!({ "status": "Approved" })),
    )
    .await;
    send(ServiceRequest::new(Method::Get, "/api/vendors/V1/notifications")).await;
}
