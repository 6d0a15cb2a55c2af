use std::collections::HashMap;
use std::time::Duration;

use serde::Serialize;

use super::route::RouteInfo;

/// 网关运行时计数
#[derive(Debug, Clone, Default)]
pub(crate) struct GatewayMetrics {
    pub(crate) total_requests: u64,
    pub(crate) successful_requests: u64,
    pub(crate) failed_requests: u64,
    pub(crate) average_response_time_ms: f64,
    pub(crate) requests_by_service: HashMap<String, u64>,
    pub(crate) requests_by_endpoint: HashMap<String, u64>,
}

impl GatewayMetrics {
    pub(crate) fn record(
        &mut self,
        service_name: Option<&str>,
        endpoint_key: String,
        duration: Duration,
        success: bool,
    ) {
        self.total_requests += 1;
        if success {
            self.successful_requests += 1;
        } else {
            self.failed_requests += 1;
        }

        // 滑动平均
        let n = self.total_requests as f64;
        let sample = duration.as_secs_f64() * 1000.0;
        self.average_response_time_ms += (sample - self.average_response_time_ms) / n;

        if let Some(service_name) = service_name {
            *self
                .requests_by_service
                .entry(service_name.to_string())
                .or_default() += 1;
        }
        *self.requests_by_endpoint.entry(endpoint_key).or_default() += 1;
    }

    /// 错误率百分比
    pub(crate) fn error_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.failed_requests as f64 / self.total_requests as f64 * 100.0
        }
    }
}

/// 网关统计信息
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GatewayStats {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub average_response_time_ms: f64,
    /// 错误率（百分比）
    pub error_rate: f64,
    pub requests_by_service: HashMap<String, u64>,
    pub requests_by_endpoint: HashMap<String, u64>,
    pub routes: Vec<RouteInfo>,
    pub global_middleware: Vec<String>,
}
