//! HTTP 后端模块
//!
//! 核心组件：
//! - `HttpChatModel`: OpenAI 兼容的 chat-completions 后端，支持工具调用与流式输出
//! - `SseParser`: SSE (Server-Sent Events) 流式响应解析器

#[cfg(feature = "openai-client")]
pub mod generic;
#[cfg(feature = "openai-client")]
pub mod stream;

#[cfg(feature = "openai-client")]
pub use generic::HttpChatModel;
#[cfg(feature = "openai-client")]
pub use stream::{SseEvent, SseParser};
