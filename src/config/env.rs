use std::env;
use std::str::FromStr;

use crate::error::{PilotError, Result};

/// 环境变量配置管理
pub struct EnvConfig;

impl EnvConfig {
    /// 展开 `${VAR}` 引用；空值视为未配置
    pub fn resolve(value: &str) -> Result<String> {
        if let Some(name) = value
            .strip_prefix("${")
            .and_then(|rest| rest.strip_suffix('}'))
        {
            Self::get_env(name)
        } else if value.is_empty() {
            Err(PilotError::config("value is empty"))
        } else {
            Ok(value.to_string())
        }
    }

    /// 从环境变量获取值
    pub fn get_env(key: &str) -> Result<String> {
        env::var(key).map_err(|_| {
            PilotError::config(format!(
                "environment variable `{key}` is not set"
            ))
        })
    }

    /// 获取可选的环境变量，空值视为未设置
    pub fn get_env_optional(key: &str) -> Option<String> {
        env::var(key).ok().filter(|value| !value.trim().is_empty())
    }

    /// 读取并解析数值型环境变量
    pub fn get_parsed<T: FromStr>(key: &str) -> Result<Option<T>> {
        match Self::get_env_optional(key) {
            None => Ok(None),
            Some(raw) => raw.trim().parse::<T>().map(Some).map_err(|_| {
                PilotError::config(format!("environment variable `{key}` has invalid value `{raw}`"))
            }),
        }
    }
}

/// 宏：简化环境变量获取
#[macro_export]
macro_rules! env_var {
    ($key:expr) => {
        $crate::config::EnvConfig::get_env($key)
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_reference_is_config_error() {
        let err = EnvConfig::resolve("${AGENTPILOT_TEST_NEVER_SET}").unwrap_err();
        assert!(matches!(err, PilotError::Config(_)));
    }

    #[test]
    fn test_get_parsed() {
        env::set_var("AGENTPILOT_TEST_NUMBER", "12");
        assert_eq!(EnvConfig::get_parsed::<u32>("AGENTPILOT_TEST_NUMBER").unwrap(), Some(12));
        env::set_var("AGENTPILOT_TEST_NUMBER", "twelve");
        assert!(EnvConfig::get_parsed::<u32>("AGENTPILOT_TEST_NUMBER").is_err());
        env::remove_var("AGENTPILOT_TEST_NUMBER");
    }
}
