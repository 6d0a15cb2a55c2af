use std::fmt;

use serde::{Serialize, Serializer};
use serde_json::Value;

/// 可重试的错误码
const RETRYABLE_CODES: [ErrorCode; 3] = [
    ErrorCode::Timeout,
    ErrorCode::NetworkError,
    ErrorCode::ServiceUnavailable,
];

/// 可重试的 HTTP 状态码
const RETRYABLE_STATUS_CODES: [u16; 6] = [408, 429, 500, 502, 503, 504];

/// 稳定的错误码，渲染为 SCREAMING_SNAKE 字符串
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    RouteNotFound,
    ServiceUnavailable,
    MethodNotAllowed,
    RateLimitExceeded,
    Validation,
    InvalidRequest,
    NotFound,
    Timeout,
    NetworkError,
    InternalError,
    GatewayError,
    /// 业务服务自定义的错误码，原样透传
    Domain(String),
}

impl ErrorCode {
    pub fn as_str(&self) -> &str {
        match self {
            ErrorCode::RouteNotFound => "ROUTE_NOT_FOUND",
            ErrorCode::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            ErrorCode::MethodNotAllowed => "METHOD_NOT_ALLOWED",
            ErrorCode::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            ErrorCode::Validation => "VALIDATION",
            ErrorCode::InvalidRequest => "INVALID_REQUEST",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::NetworkError => "NETWORK_ERROR",
            ErrorCode::InternalError => "INTERNAL_ERROR",
            ErrorCode::GatewayError => "GATEWAY_ERROR",
            ErrorCode::Domain(code) => code.as_str(),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for ErrorCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// 响应中携带的结构化错误
#[derive(Debug, Clone, PartialEq, Serialize, thiserror::Error)]
#[error("{code}: {message}")]
pub struct ServiceError {
    pub code: ErrorCode,
    pub message: String,
    pub retryable: bool,
    pub status_code: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl ServiceError {
    /// 根据错误码与状态码自动判定是否可重试
    pub fn new(code: ErrorCode, message: impl Into<String>, status_code: u16) -> Self {
        let retryable = Self::is_retryable_code(&code, status_code);
        Self {
            code,
            message: message.into(),
            retryable,
            status_code,
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn is_retryable_code(code: &ErrorCode, status_code: u16) -> bool {
        RETRYABLE_CODES.contains(code) || RETRYABLE_STATUS_CODES.contains(&status_code)
    }

    pub fn route_not_found(endpoint: &str) -> Self {
        Self::new(
            ErrorCode::RouteNotFound,
            format!("No route found for endpoint: {endpoint}"),
            404,
        )
    }

    pub fn method_not_allowed(method: &str, endpoint: &str) -> Self {
        Self::new(
            ErrorCode::MethodNotAllowed,
            format!("Method {method} not allowed for endpoint: {endpoint}"),
            405,
        )
    }

    pub fn service_unavailable(service_name: &str) -> Self {
        Self::new(
            ErrorCode::ServiceUnavailable,
            format!("Service '{service_name}' is not available"),
            503,
        )
    }

    pub fn rate_limited(client_id: &str) -> Self {
        Self::new(
            ErrorCode::RateLimitExceeded,
            format!("Rate limit exceeded for client: {client_id}"),
            429,
        )
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Validation, message, 400)
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidRequest, message, 400)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, message, 404)
    }

    pub fn timeout(after_ms: u128) -> Self {
        Self::new(
            ErrorCode::Timeout,
            format!("Request timed out after {after_ms}ms"),
            408,
        )
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NetworkError, message, 502)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message, 500)
    }

    pub fn gateway(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::GatewayError, message, 500)
    }

    /// 业务服务声明的错误，重试判定只看状态码
    pub fn domain(code: impl Into<String>, message: impl Into<String>, status_code: u16) -> Self {
        Self::new(ErrorCode::Domain(code.into()), message, status_code)
    }
}
