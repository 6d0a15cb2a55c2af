use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

/// 初始化日志：优先使用 `RUST_LOG`，未设置时使用配置中的级别
///
/// 重复调用时保留已安装的 subscriber，返回 false
pub fn init(config: &LoggingConfig) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.with_target)
        .try_init()
        .is_ok()
}
