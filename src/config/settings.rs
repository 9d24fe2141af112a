use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::env::EnvConfig;
use crate::error::{PilotError, Result};
use crate::llm::TierModels;

pub const MODEL_FAST_ENV: &str = "AGENTPILOT_MODEL_FAST";
pub const MODEL_SMART_ENV: &str = "AGENTPILOT_MODEL_SMART";
pub const MODEL_DEEP_ENV: &str = "AGENTPILOT_MODEL_DEEP";
pub const API_BASE_ENV: &str = "AGENTPILOT_API_BASE";
pub const API_KEY_ENV: &str = "AGENTPILOT_API_KEY";
pub const CONCURRENCY_ENV: &str = "AGENTPILOT_WORKER_CONCURRENCY";
pub const SHUTDOWN_GRACE_ENV: &str = "AGENTPILOT_SHUTDOWN_GRACE_SECS";
pub const LOCK_DURATION_ENV: &str = "AGENTPILOT_LOCK_DURATION_SECS";
pub const STALLED_INTERVAL_ENV: &str = "AGENTPILOT_STALLED_INTERVAL_SECS";
pub const QUEUE_NAME_ENV: &str = "AGENTPILOT_QUEUE";
pub const QUEUE_PREFIX_ENV: &str = "AGENTPILOT_QUEUE_PREFIX";
pub const REDIS_URL_ENV: &str = "AGENTPILOT_REDIS_URL";

/// 进程级运行配置
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PilotSettings {
    pub models: TierModels,
    pub api_base_url: Option<String>,
    /// 字面值或 `${VAR}` 引用
    pub api_key: Option<String>,
    pub request_timeout_secs: u64,
    pub worker_concurrency: usize,
    pub shutdown_grace_secs: u64,
    pub lock_duration_secs: u64,
    pub stalled_interval_secs: u64,
    pub poll_interval_ms: u64,
    pub queue_name: String,
    pub queue_prefix: String,
    pub redis_url: Option<String>,
    pub job_attempts: u32,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
    pub keep_completed: usize,
    pub keep_failed: usize,
}

impl Default for PilotSettings {
    fn default() -> Self {
        Self {
            models: TierModels::default(),
            api_base_url: None,
            api_key: None,
            request_timeout_secs: 60,
            worker_concurrency: 4,
            shutdown_grace_secs: 30,
            lock_duration_secs: 30,
            stalled_interval_secs: 30,
            poll_interval_ms: 500,
            queue_name: "workflow-execution".to_string(),
            queue_prefix: "agentpilot".to_string(),
            redis_url: None,
            job_attempts: 3,
            backoff_initial_ms: 2_000,
            backoff_max_ms: 60_000,
            keep_completed: 100,
            keep_failed: 500,
        }
    }
}

impl PilotSettings {
    /// 默认值叠加环境变量
    pub fn from_env() -> Result<Self> {
        Self::default().overlay_env()
    }

    /// 读取 JSON 文件后叠加环境变量
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|err| {
            PilotError::config(format!("failed to read settings {}: {err}", path.display()))
        })?;
        let settings: PilotSettings = serde_json::from_str(&raw)?;
        settings.overlay_env()
    }

    pub fn overlay_env(mut self) -> Result<Self> {
        if let Some(model) = EnvConfig::get_env_optional(MODEL_FAST_ENV) {
            self.models.fast = model;
        }
        if let Some(model) = EnvConfig::get_env_optional(MODEL_SMART_ENV) {
            self.models.smart = model;
        }
        if let Some(model) = EnvConfig::get_env_optional(MODEL_DEEP_ENV) {
            self.models.deep = model;
        }
        if let Some(base) = EnvConfig::get_env_optional(API_BASE_ENV) {
            self.api_base_url = Some(base);
        }
        if let Some(key) = EnvConfig::get_env_optional(API_KEY_ENV) {
            self.api_key = Some(key);
        }
        if let Some(value) = EnvConfig::get_parsed(CONCURRENCY_ENV)? {
            self.worker_concurrency = value;
        }
        if let Some(value) = EnvConfig::get_parsed(SHUTDOWN_GRACE_ENV)? {
            self.shutdown_grace_secs = value;
        }
        if let Some(value) = EnvConfig::get_parsed(LOCK_DURATION_ENV)? {
            self.lock_duration_secs = value;
        }
        if let Some(value) = EnvConfig::get_parsed(STALLED_INTERVAL_ENV)? {
            self.stalled_interval_secs = value;
        }
        if let Some(name) = EnvConfig::get_env_optional(QUEUE_NAME_ENV) {
            self.queue_name = name;
        }
        if let Some(prefix) = EnvConfig::get_env_optional(QUEUE_PREFIX_ENV) {
            self.queue_prefix = prefix;
        }
        if let Some(url) = EnvConfig::get_env_optional(REDIS_URL_ENV) {
            self.redis_url = Some(url);
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.worker_concurrency == 0 {
            return Err(PilotError::config("worker concurrency must be at least 1"));
        }
        if self.lock_duration_secs == 0 {
            return Err(PilotError::config("lock duration must be positive"));
        }
        if self.job_attempts == 0 {
            return Err(PilotError::config("job attempts must be at least 1"));
        }
        if self.queue_name.trim().is_empty() {
            return Err(PilotError::config("queue name must not be empty"));
        }
        Ok(())
    }

    /// 解析后的 API key；未配置时返回 None
    pub fn resolved_api_key(&self) -> Result<Option<String>> {
        match self.api_key.as_deref() {
            None | Some("") => Ok(None),
            Some(raw) => EnvConfig::resolve(raw).map(Some),
        }
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn lock_duration(&self) -> Duration {
        Duration::from_secs(self.lock_duration_secs)
    }

    pub fn stalled_interval(&self) -> Duration {
        Duration::from_secs(self.stalled_interval_secs.max(1))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(10))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_queue_policy() {
        let settings = PilotSettings::default();
        assert_eq!(settings.worker_concurrency, 4);
        assert_eq!(settings.shutdown_grace(), Duration::from_secs(30));
        assert_eq!(settings.lock_duration(), Duration::from_secs(30));
        assert_eq!(settings.job_attempts, 3);
        assert_eq!(settings.keep_completed, 100);
        assert_eq!(settings.keep_failed, 500);
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let settings: PilotSettings =
            serde_json::from_str(r#"{"worker_concurrency": 8, "queue_name": "agents"}"#).unwrap();
        assert_eq!(settings.worker_concurrency, 8);
        assert_eq!(settings.queue_name, "agents");
        assert_eq!(settings.shutdown_grace_secs, 30);
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let settings = PilotSettings {
            worker_concurrency: 0,
            ..PilotSettings::default()
        };
        assert!(settings.validate().is_err());
    }
}
