// 定义网关配置错误类型
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayError {
    InvalidPattern(String),
    DuplicateMiddleware(String),
}

impl std::fmt::Display for GatewayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GatewayError::InvalidPattern(msg) => write!(f, "Invalid route pattern: {msg}"),
            GatewayError::DuplicateMiddleware(name) => {
                write!(f, "Middleware already registered: {name}")
            }
        }
    }
}

impl std::error::Error for GatewayError {}
