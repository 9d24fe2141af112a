use std::env;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub const DEBUG_ENV: &str = "AGENTPILOT_DEBUG";

/// 日志配置
pub struct LoggingConfig;

impl LoggingConfig {
    /// 初始化日志系统
    ///
    /// 支持通过环境变量配置：
    /// - RUST_LOG: 设置日志级别（error, warn, info, debug, trace）
    /// - AGENTPILOT_DEBUG: 启用详细调试输出
    ///
    /// 重复调用是安全的，第二次起不会覆盖已安装的 subscriber。
    pub fn init() {
        let is_debug = Self::is_debug();

        let env_filter = match EnvFilter::try_from_default_env() {
            Ok(filter) => filter,
            Err(_) => {
                if is_debug {
                    EnvFilter::new("agentpilot=debug,info")
                } else {
                    EnvFilter::new("agentpilot=info,warn")
                }
            }
        };

        let fmt_layer = if is_debug {
            fmt::layer()
                .with_target(true)
                .with_file(true)
                .with_line_number(true)
                .with_thread_ids(true)
        } else {
            fmt::layer()
                .with_target(false)
                .with_file(false)
                .with_line_number(false)
                .with_thread_ids(false)
        };

        let installed = tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()
            .is_ok();

        if installed && is_debug {
            tracing::debug!("debug logging enabled");
        }
    }

    /// 初始化日志系统（带自定义过滤器）
    pub fn init_with_filter(filter: &str) {
        let env_filter = EnvFilter::new(filter);

        let _ = tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer())
            .try_init();
    }

    /// 检查是否启用调试模式
    pub fn is_debug() -> bool {
        env::var(DEBUG_ENV).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_debug() {
        env::remove_var(DEBUG_ENV);
        assert!(!LoggingConfig::is_debug());

        env::set_var(DEBUG_ENV, "1");
        assert!(LoggingConfig::is_debug());

        env::remove_var(DEBUG_ENV);
    }

    #[test]
    fn test_init_twice_does_not_panic() {
        LoggingConfig::init_with_filter("agentpilot=warn");
        LoggingConfig::init();
    }
}
