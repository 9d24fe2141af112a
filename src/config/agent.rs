use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{PilotError, Result};
use crate::eval::{AutonomyTier, EvalRules};
use crate::llm::ModelTier;
use crate::utils::validation::ConfigValidator;

/// 数据源描述
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchSource {
    pub name: String,
    /// 数据源类型，如 `crm`、`gmail`、`calendar`
    pub kind: String,
    #[serde(default)]
    pub params: Value,
    /// 凭据引用，通常写成 `${VAR}`，每次抓取时重新解析
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl FetchSource {
    pub fn new(name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            params: Value::Null,
            credential: None,
        }
    }
}

/// Agent 配置，核心只读
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    pub id: String,
    pub name: String,
    pub system_prompt: String,
    #[serde(default)]
    pub tier: ModelTier,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_max_steps")]
    pub max_steps: u32,
    #[serde(default)]
    pub autonomy: AutonomyTier,
    #[serde(default)]
    pub eval: EvalRules,
    #[serde(default)]
    pub sources: Vec<FetchSource>,
    /// 允许提出的动作，写入 prompt
    #[serde(default)]
    pub allowed_actions: Vec<String>,
    #[serde(default)]
    pub workspace_id: Option<String>,
    #[serde(default)]
    pub owner_id: Option<String>,
}

fn default_temperature() -> f32 {
    0.7
}

fn default_max_tokens() -> u32 {
    1024
}

fn default_max_steps() -> u32 {
    5
}

impl AgentConfig {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        system_prompt: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            system_prompt: system_prompt.into(),
            tier: ModelTier::default(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            max_steps: default_max_steps(),
            autonomy: AutonomyTier::default(),
            eval: EvalRules::default(),
            sources: Vec::new(),
            allowed_actions: Vec::new(),
            workspace_id: None,
            owner_id: None,
        }
    }

    pub fn with_eval(mut self, eval: EvalRules) -> Self {
        self.eval = eval;
        self
    }

    pub fn with_autonomy(mut self, autonomy: AutonomyTier) -> Self {
        self.autonomy = autonomy;
        self
    }

    pub fn with_source(mut self, source: FetchSource) -> Self {
        self.sources.push(source);
        self
    }

    pub fn with_tier(mut self, tier: ModelTier) -> Self {
        self.tier = tier;
        self
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let config: AgentConfig = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_value(value: Value) -> Result<Self> {
        let config: AgentConfig = serde_json::from_value(value)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|err| {
            PilotError::config(format!("failed to read agent config {}: {err}", path.display()))
        })?;
        Self::from_json(&raw)
    }

    pub fn validate(&self) -> Result<()> {
        ConfigValidator::validate_agent(self)
    }
}
