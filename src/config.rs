use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::services::event::EventConfig;
use crate::services::gateway::GatewayConfig;
use crate::services::orchestrator::OrchestratorConfig;
use crate::services::registry::RegistryConfig;
use crate::services::runtime::Runtime;

/// 环境变量覆盖项的前缀
pub const ENV_PREFIX: &str = "MESH_";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub logging: LoggingConfig,
    pub registry: RegistryConfig,
    pub event_bus: EventConfig,
    pub gateway: GatewayConfig,
    pub orchestrator: OrchestratorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// 未设置 RUST_LOG 时使用的过滤规则
    pub level: String,
    pub with_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            with_target: false,
        }
    }
}

/// 可由 `MESH_*` 环境变量覆盖的配置项
#[derive(Debug, Default, Deserialize)]
struct EnvOverrides {
    log_level: Option<String>,
    health_check_interval_secs: Option<u64>,
    gateway_enabled: Option<bool>,
    rate_limit_max_requests: Option<u32>,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid configuration file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid environment override: {0}")]
    Env(#[from] envy::Error),
}

impl Config {
    /// 读取配置文件（不存在时使用默认值），再叠加 `.env` 与 `MESH_*` 环境变量
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        // .env 文件是可选的
        let _ = dotenvy::dotenv();

        let mut config = match fs::read_to_string(path) {
            Ok(contents) => Self::from_toml_str(&contents)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "Config file not found, using defaults");
                Self::default()
            }
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        config.apply_env(std::env::vars())?;
        Ok(config)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(contents)?)
    }

    /// 叠加环境变量，只识别带 `MESH_` 前缀的键
    pub fn apply_env<I>(&mut self, vars: I) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let overrides: EnvOverrides = envy::prefixed(ENV_PREFIX).from_iter(vars)?;
        if let Some(level) = overrides.log_level {
            self.logging.level = level;
        }
        if let Some(secs) = overrides.health_check_interval_secs {
            self.registry.health_check_interval_secs = secs;
            self.orchestrator.health_check_interval_secs = secs;
        }
        if let Some(enabled) = overrides.gateway_enabled {
            self.gateway.enabled = enabled;
        }
        if let Some(max_requests) = overrides.rate_limit_max_requests {
            self.gateway.rate_limit_max_requests = max_requests;
        }
        Ok(())
    }

    /// 按配置构建共享运行时
    pub fn runtime(&self) -> Runtime {
        Runtime::new(
            self.registry.clone(),
            self.event_bus.clone(),
            self.gateway.clone(),
        )
        .with_memory_limit(self.orchestrator.memory_limit_bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_sections_fall_back_to_defaults() {
        let config = Config::from_toml_str(
            r#"
            [gateway]
            rate_limit_max_requests = 5

            [event_bus]
            max_event_history = 50
            "#,
        )
        .unwrap();

        assert_eq!(config.gateway.rate_limit_max_requests, 5);
        assert_eq!(config.gateway.rate_limit_window_secs, 60);
        assert_eq!(config.event_bus.max_event_history, 50);
        assert_eq!(config.event_bus.max_retries, 3);
        assert_eq!(config.orchestrator.health_check_interval_secs, 30);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn prefixed_env_vars_override_file_values() {
        let mut config = Config::default();
        config
            .apply_env([
                ("MESH_LOG_LEVEL".to_string(), "debug".to_string()),
                ("MESH_HEALTH_CHECK_INTERVAL_SECS".to_string(), "5".to_string()),
                ("MESH_GATEWAY_ENABLED".to_string(), "false".to_string()),
                ("UNRELATED".to_string(), "ignored".to_string()),
            ])
            .unwrap();

        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.registry.health_check_interval_secs, 5);
        assert_eq!(config.orchestrator.health_check_interval_secs, 5);
        assert!(!config.gateway.enabled);
        assert_eq!(config.gateway.rate_limit_max_requests, 100);
    }

    #[test]
    fn malformed_values_are_reported() {
        let mut config = Config::default();
        let err = config
            .apply_env([("MESH_RATE_LIMIT_MAX_REQUESTS".to_string(), "many".to_string())])
            .unwrap_err();
        assert!(matches!(err, ConfigError::Env(_)));
        assert!(Config::from_toml_str("[gateway\n").is_err());
    }
}
