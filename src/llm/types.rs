use std::fmt;
use std::pin::Pin;
use std::str::FromStr;

use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::LlmError;

/// 模型档位，按延迟/成本递增
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelTier {
    Fast,
    #[default]
    Smart,
    Deep,
}

impl ModelTier {
    pub const ALL: [ModelTier; 3] = [ModelTier::Fast, ModelTier::Smart, ModelTier::Deep];

    pub fn as_str(&self) -> &'static str {
        match self {
            ModelTier::Fast => "fast",
            ModelTier::Smart => "smart",
            ModelTier::Deep => "deep",
        }
    }
}

impl fmt::Display for ModelTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fast" => Ok(ModelTier::Fast),
            "smart" => Ok(ModelTier::Smart),
            "deep" => Ok(ModelTier::Deep),
            other => Err(format!("unknown model tier `{other}`")),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub input: Value,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub tool_call_id: String,
    pub name: String,
    pub content: String,
    #[serde(default)]
    pub is_error: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_results: Vec<ToolResult>,
}

impl ChatMessage {
    fn plain(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_results: Vec::new(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::plain(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::plain(Role::Assistant, content)
    }

    pub fn assistant_with_tools(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls,
            ..Self::plain(Role::Assistant, content)
        }
    }

    pub fn tool_results(results: Vec<ToolResult>) -> Self {
        Self {
            tool_results: results,
            ..Self::plain(Role::Tool, "")
        }
    }
}

/// 发送给模型的工具定义
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub input_schema: Value,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

fn default_temperature() -> f32 {
    0.7
}

fn default_max_tokens() -> u32 {
    4096
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }

    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

impl std::ops::AddAssign for TokenUsage {
    fn add_assign(&mut self, rhs: Self) {
        self.input_tokens += rhs.input_tokens;
        self.output_tokens += rhs.output_tokens;
    }
}

/// 调用方请求
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LlmRequest {
    #[serde(default)]
    pub system: Option<String>,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub tier: ModelTier,
    #[serde(default)]
    pub params: GenerationParams,
    #[serde(default = "default_max_steps")]
    pub max_steps: u32,
}

fn default_max_steps() -> u32 {
    5
}

impl LlmRequest {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            system: None,
            messages,
            tier: ModelTier::default(),
            params: GenerationParams::default(),
            max_steps: default_max_steps(),
        }
    }

    pub fn prompt(user: impl Into<String>) -> Self {
        Self::new(vec![ChatMessage::user(user)])
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_tier(mut self, tier: ModelTier) -> Self {
        self.tier = tier;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.params.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.params.max_tokens = max_tokens;
        self
    }

    pub fn with_max_steps(mut self, max_steps: u32) -> Self {
        self.max_steps = max_steps;
        self
    }
}

/// 一次模型往返的请求（已解析出具体模型 id）
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ModelRequest {
    pub model: String,
    #[serde(default)]
    pub system: Option<String>,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub tools: Vec<ToolDefinition>,
    pub params: GenerationParams,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelResponse {
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default)]
    pub usage: TokenUsage,
}

impl ModelResponse {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Self::default()
        }
    }

    pub fn with_tool_call(mut self, id: &str, name: &str, input: Value) -> Self {
        self.tool_calls.push(ToolCall {
            id: id.to_string(),
            name: name.to_string(),
            input,
        });
        self
    }

    pub fn with_usage(mut self, input_tokens: u64, output_tokens: u64) -> Self {
        self.usage = TokenUsage::new(input_tokens, output_tokens);
        self
    }
}

/// 模型流式输出的原始片段
#[derive(Clone, Debug, PartialEq)]
pub enum ModelChunk {
    TextDelta(String),
    ToolCallStart { id: String, name: String },
    ToolCall(ToolCall),
    Usage(TokenUsage),
}

pub type ModelStream = Pin<Box<dyn Stream<Item = Result<ModelChunk, LlmError>> + Send>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    MaxSteps,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepAction {
    Thinking,
    ToolUse,
    FinalResponse,
}

impl StepAction {
    pub fn classify(response: &ModelResponse) -> Self {
        if !response.tool_calls.is_empty() {
            StepAction::ToolUse
        } else if response.content.trim().is_empty() {
            StepAction::Thinking
        } else {
            StepAction::FinalResponse
        }
    }
}

/// 每一步模型调用产生一条用量事件
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UsageEvent {
    pub model: String,
    pub tier: ModelTier,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
    pub latency_ms: u64,
    pub step: u32,
    pub action: StepAction,
}

/// 完整调用结果
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LlmRun {
    pub content: String,
    pub stop_reason: StopReason,
    pub model: String,
    pub steps: u32,
    pub usage: TokenUsage,
    pub cost_usd: f64,
    pub latency_ms: u64,
    pub messages: Vec<ChatMessage>,
}

/// 流式语义事件
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum StreamEvent {
    TextDelta { delta: String },
    ToolInputStart { id: String, name: String },
    ToolInputAvailable { id: String, name: String, input: Value },
    ToolOutputAvailable { id: String, output: String, is_error: bool },
    StepComplete { step: u32, usage: TokenUsage },
    Finish { stop_reason: StopReason, usage: TokenUsage },
    Error { message: String, retryable: bool },
}

pub type EventStream = Pin<Box<dyn Stream<Item = StreamEvent> + Send>>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn tier_parses_case_insensitively() {
        assert_eq!("FAST".parse::<ModelTier>().unwrap(), ModelTier::Fast);
        assert_eq!(" deep ".parse::<ModelTier>().unwrap(), ModelTier::Deep);
        assert!("huge".parse::<ModelTier>().is_err());
    }

    #[test]
    fn classify_step_actions() {
        let text = ModelResponse::text("done");
        assert_eq!(StepAction::classify(&text), StepAction::FinalResponse);

        let tools = ModelResponse::text("").with_tool_call("t1", "search", json!({}));
        assert_eq!(StepAction::classify(&tools), StepAction::ToolUse);

        assert_eq!(
            StepAction::classify(&ModelResponse::default()),
            StepAction::Thinking
        );
    }

    #[test]
    fn stream_events_serialize_with_kebab_tags() {
        let event = StreamEvent::ToolInputStart {
            id: "t1".into(),
            name: "search".into(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "tool-input-start");
    }
}
