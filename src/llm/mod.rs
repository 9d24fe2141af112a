// LLM 模块 - 分档模型、工具循环、用量计费

pub mod client;
pub mod echo;
pub mod http;
pub mod pricing;
pub mod types;

pub use client::{ChatModel, DynChatModel, LlmClient, NoTools, ToolHandler, UsageLedger, UsageSink};
pub use echo::LocalEchoModel;
#[cfg(feature = "openai-client")]
pub use http::HttpChatModel;
pub use pricing::{PricingTable, TierModels, TierRates};
pub use types::{
    ChatMessage, EventStream, GenerationParams, LlmRequest, LlmRun, ModelChunk, ModelRequest,
    ModelResponse, ModelStream, ModelTier, Role, StepAction, StopReason, StreamEvent, TokenUsage,
    ToolCall, ToolDefinition, ToolResult, UsageEvent,
};
