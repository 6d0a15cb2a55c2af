use std::collections::HashMap;

use serde::Serialize;

use super::error::GatewayError;
use crate::services::types::Method;

/// 通配段捕获到的剩余路径存放在这个参数名下
pub const WILDCARD_PARAM: &str = "*";

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Literal(String),
    Param(String),
    Wildcard,
}

/// 编译后的路由模式，支持字面量段、`:name` 参数段和末尾的 `*`
#[derive(Debug, Clone, PartialEq)]
pub struct RoutePattern {
    raw: String,
    segments: Vec<Segment>,
}

impl RoutePattern {
    pub fn parse(raw: &str) -> Result<Self, GatewayError> {
        if raw.is_empty() || !raw.starts_with('/') {
            return Err(GatewayError::InvalidPattern(format!(
                "'{raw}' must start with '/'"
            )));
        }

        let parts: Vec<&str> = raw.split('/').filter(|s| !s.is_empty()).collect();
        let mut segments = Vec::with_capacity(parts.len());
        for (index, part) in parts.iter().enumerate() {
            let segment = if *part == "*" {
                if index + 1 != parts.len() {
                    return Err(GatewayError::InvalidPattern(format!(
                        "'{raw}': '*' is only allowed as the last segment"
                    )));
                }
                Segment::Wildcard
            } else if let Some(name) = part.strip_prefix(':') {
                if name.is_empty() {
                    return Err(GatewayError::InvalidPattern(format!(
                        "'{raw}': parameter segment needs a name"
                    )));
                }
                Segment::Param(name.to_string())
            } else if part.contains('*') {
                return Err(GatewayError::InvalidPattern(format!(
                    "'{raw}': '*' must be a whole segment"
                )));
            } else {
                Segment::Literal(part.to_string())
            };
            segments.push(segment);
        }

        Ok(Self {
            raw: raw.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// 匹配成功时返回路径参数
    pub fn matches(&self, path: &str) -> Option<HashMap<String, String>> {
        let path = path.split('?').next().unwrap_or_default();
        let parts: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let mut params = HashMap::new();

        for (index, segment) in self.segments.iter().enumerate() {
            match segment {
                Segment::Wildcard => {
                    params.insert(WILDCARD_PARAM.to_string(), parts[index.min(parts.len())..].join("/"));
                    return Some(params);
                }
                Segment::Literal(literal) => {
                    if parts.get(index) != Some(&literal.as_str()) {
                        return None;
                    }
                }
                Segment::Param(name) => {
                    let value = parts.get(index)?;
                    params.insert(name.clone(), (*value).to_string());
                }
            }
        }

        (parts.len() == self.segments.len()).then_some(params)
    }
}

/// 添加路由时的可选项
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RouteOptions {
    /// 允许的方法，None 表示不限制
    pub methods: Option<Vec<Method>>,
    /// 按顺序执行的具名中间件
    pub middleware: Vec<String>,
}

impl RouteOptions {
    pub fn methods(mut self, methods: impl IntoIterator<Item = Method>) -> Self {
        self.methods = Some(methods.into_iter().collect());
        self
    }

    pub fn middleware(mut self, name: impl Into<String>) -> Self {
        self.middleware.push(name.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Route {
    pub pattern: RoutePattern,
    pub service_name: String,
    pub options: RouteOptions,
}

impl Route {
    pub fn allows(&self, method: Method) -> bool {
        self.options
            .methods
            .as_ref()
            .is_none_or(|methods| methods.contains(&method))
    }

    pub fn info(&self) -> RouteInfo {
        RouteInfo {
            pattern: self.pattern.as_str().to_string(),
            service_name: self.service_name.clone(),
            methods: self
                .options
                .methods
                .as_ref()
                .map(|methods| methods.iter().map(|m| m.as_str().to_string()).collect()),
            middleware: self.options.middleware.clone(),
        }
    }
}

/// 路由表快照
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RouteInfo {
    pub pattern: String,
    pub service_name: String,
    pub methods: Option<Vec<String>>,
    pub middleware: Vec<String>,
}
