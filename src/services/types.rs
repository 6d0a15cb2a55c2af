use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error::ServiceError;

/// 请求头：请求ID
pub const HEADER_REQUEST_ID: &str = "x-request-id";
/// 请求头：处理请求的服务名
pub const HEADER_SERVICE_NAME: &str = "x-service-name";
/// 请求头：经过网关转发的标记
pub const HEADER_GATEWAY: &str = "x-forwarded-by";
/// 请求头：限流使用的客户端ID
pub const HEADER_CLIENT_ID: &str = "x-client-id";

/// 重试策略
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
}

impl RetryPolicy {
    /// 第 `attempt` 次（从 0 开始）失败后的等待时长，不加抖动
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.backoff_multiplier.max(1.0).powi(attempt as i32);
        let secs = (self.base_delay.as_secs_f64() * factor).min(self.max_delay.as_secs_f64());
        Duration::try_from_secs_f64(secs).unwrap_or(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
        }
    }
}

/// 熔断器阈值
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// 监控窗口内触发熔断的失败次数
    pub failure_threshold: u32,
    /// 熔断后进入半开状态前的等待时长
    pub reset_timeout: Duration,
    /// 统计失败次数的时间窗口
    pub monitoring_window: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(60),
            monitoring_window: Duration::from_secs(60),
        }
    }
}

/// 服务描述：构造时确定，生命周期内不可变
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    pub name: String,
    pub version: String,
    pub timeout: Duration,
    pub retry: RetryPolicy,
    pub circuit_breaker: CircuitBreakerConfig,
}

impl ServiceDescriptor {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_circuit_breaker(mut self, circuit_breaker: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = circuit_breaker;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    /// 取两者中更差的状态
    pub fn worst(self, other: HealthStatus) -> HealthStatus {
        self.max(other)
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Pass,
    Warn,
    Fail,
}

/// 单项健康检查结果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckResult {
    pub name: String,
    pub status: CheckStatus,
    pub duration: Duration,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// 健康报告，创建后不再修改
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub timestamp: SystemTime,
    pub checks: Vec<CheckResult>,
}

impl HealthReport {
    pub fn new(status: HealthStatus, checks: Vec<CheckResult>) -> Self {
        Self {
            status,
            timestamp: SystemTime::now(),
            checks,
        }
    }

    /// 仅由状态构成的报告，附带一条说明
    pub fn with_message(status: HealthStatus, check: &str, message: impl Into<String>) -> Self {
        let check_status = match status {
            HealthStatus::Healthy => CheckStatus::Pass,
            HealthStatus::Degraded => CheckStatus::Warn,
            HealthStatus::Unhealthy => CheckStatus::Fail,
        };
        Self::new(
            status,
            vec![CheckResult {
                name: check.to_string(),
                status: check_status,
                duration: Duration::ZERO,
                message: Some(message.into()),
            }],
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = ServiceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(Method::Get),
            "POST" => Ok(Method::Post),
            "PUT" => Ok(Method::Put),
            "PATCH" => Ok(Method::Patch),
            "DELETE" => Ok(Method::Delete),
            other => Err(ServiceError::invalid_request(format!(
                "Unsupported method: {other}"
            ))),
        }
    }
}

/// 进程内请求信封
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceRequest {
    pub method: Method,
    pub endpoint: String,
    #[serde(default)]
    pub payload: Option<Value>,
    #[serde(default)]
    pub query: HashMap<String, String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// 网关根据路由模式解析出的路径参数
    #[serde(default)]
    pub params: HashMap<String, String>,
}

impl ServiceRequest {
    pub fn new(method: Method, endpoint: impl Into<String>) -> Self {
        Self {
            method,
            endpoint: endpoint.into(),
            payload: None,
            query: HashMap::new(),
            headers: HashMap::new(),
            params: HashMap::new(),
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.insert(name.into(), value.into());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    pub fn request_id(&self) -> Option<&str> {
        self.header(HEADER_REQUEST_ID)
    }

    /// 去掉首尾 '/' 后的路径段
    pub fn segments(&self) -> Vec<&str> {
        self.endpoint
            .split('?')
            .next()
            .unwrap_or_default()
            .split('/')
            .filter(|s| !s.is_empty())
            .collect()
    }
}

/// 响应元数据
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResponseMetadata {
    pub request_id: String,
    pub timestamp: SystemTime,
    pub duration: Duration,
    pub retry_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    /// 响应头注解点（CORS 等中间件写入）
    pub headers: HashMap<String, String>,
}

impl Default for ResponseMetadata {
    fn default() -> Self {
        Self {
            request_id: String::new(),
            timestamp: SystemTime::now(),
            duration: Duration::ZERO,
            retry_count: 0,
            service: None,
            headers: HashMap::new(),
        }
    }
}

/// 响应信封：成功时只有数据，失败时只有错误
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceResponse {
    pub result: Result<Value, ServiceError>,
    pub metadata: ResponseMetadata,
}

impl ServiceResponse {
    pub fn ok(data: Value) -> Self {
        Self {
            result: Ok(data),
            metadata: ResponseMetadata::default(),
        }
    }

    pub fn fail(error: ServiceError) -> Self {
        Self {
            result: Err(error),
            metadata: ResponseMetadata::default(),
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.metadata.request_id = request_id.into();
        self
    }

    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    pub fn data(&self) -> Option<&Value> {
        self.result.as_ref().ok()
    }

    pub fn error(&self) -> Option<&ServiceError> {
        self.result.as_ref().err()
    }

    pub fn status_code(&self) -> u16 {
        match &self.result {
            Ok(_) => 200,
            Err(err) => err.status_code,
        }
    }
}

impl From<Result<Value, ServiceError>> for ServiceResponse {
    fn from(result: Result<Value, ServiceError>) -> Self {
        Self {
            result,
            metadata: ResponseMetadata::default(),
        }
    }
}

/// 以 `{success, data?, error?, metadata}` 的形式输出，保持对外信封的形状
impl Serialize for ServiceResponse {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeStruct;

        let mut state = serializer.serialize_struct("ServiceResponse", 3)?;
        state.serialize_field("success", &self.is_success())?;
        match &self.result {
            Ok(data) => state.serialize_field("data", data)?,
            Err(error) => state.serialize_field("error", error)?,
        }
        state.serialize_field("metadata", &self.metadata)?;
        state.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_capped_by_max_delay() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            backoff_multiplier: 2.0,
        };
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for(3), Duration::from_millis(500));
    }

    #[test]
    fn huge_max_delay_does_not_overflow() {
        let policy = RetryPolicy {
            max_attempts: 500,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::MAX,
            backoff_multiplier: 10.0,
        };
        assert_eq!(policy.delay_for(400), Duration::MAX);
        assert_eq!(policy.delay_for(0), Duration::from_secs(1));
    }

    #[test]
    fn response_envelope_serializes_discriminant() {
        let ok = serde_json::to_value(ServiceResponse::ok(serde_json::json!({"id": 1}))).unwrap();
        assert_eq!(ok["success"], true);
        assert!(ok.get("error").is_none());

        let failed =
            serde_json::to_value(ServiceResponse::fail(ServiceError::validation("bad"))).unwrap();
        assert_eq!(failed["success"], false);
        assert_eq!(failed["error"]["code"], "VALIDATION");
        assert!(failed.get("data").is_none());
    }

    #[test]
    fn segments_ignore_query_and_slashes() {
        let req = ServiceRequest::new(Method::Get, "/api/purchase-orders/PO-1/?x=1");
        assert_eq!(req.segments(), vec!["api", "purchase-orders", "PO-1"]);
    }
}
