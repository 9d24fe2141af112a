use async_trait::async_trait;

use super::client::ChatModel;
use super::types::{ModelRequest, ModelResponse, Role, TokenUsage};
use crate::error::LlmError;

/// 本地回显后端，不访问网络，便于开发调试
#[derive(Default, Clone)]
pub struct LocalEchoModel;

#[async_trait]
impl ChatModel for LocalEchoModel {
    fn name(&self) -> &str {
        "local-echo"
    }

    async fn respond(&self, request: ModelRequest) -> Result<ModelResponse, LlmError> {
        let last_user = request
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.clone())
            .unwrap_or_default();
        let input_tokens = request
            .messages
            .iter()
            .map(|m| approx_tokens(&m.content))
            .sum::<u64>()
            + request.system.as_deref().map(approx_tokens).unwrap_or(0);
        let content = format!("[Echo] {last_user}");
        let output_tokens = approx_tokens(&content);
        Ok(ModelResponse {
            content,
            tool_calls: Vec::new(),
            usage: TokenUsage::new(input_tokens, output_tokens),
        })
    }
}

/// 粗略估算：约 4 个字符一个 token
pub fn approx_tokens(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::types::{ChatMessage, GenerationParams};

    #[tokio::test]
    async fn echoes_last_user_message() {
        let response = LocalEchoModel
            .respond(ModelRequest {
                model: "local".into(),
                system: Some("be brief".into()),
                messages: vec![ChatMessage::user("first"), ChatMessage::user("second")],
                tools: Vec::new(),
                params: GenerationParams::default(),
            })
            .await
            .unwrap();
        assert_eq!(response.content, "[Echo] second");
        assert!(response.usage.input_tokens > 0);
    }
}
