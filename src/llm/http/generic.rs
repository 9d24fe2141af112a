use std::collections::{BTreeMap, VecDeque};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde_json::{json, Value};
use tracing::instrument;

use super::stream::{SseEvent, SseParser};
use crate::error::LlmError;
use crate::llm::client::ChatModel;
use crate::llm::types::{
    ChatMessage, ModelChunk, ModelRequest, ModelResponse, ModelStream, Role, TokenUsage, ToolCall,
};

/// OpenAI 兼容的 chat-completions 后端
#[derive(Clone)]
pub struct HttpChatModel {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl HttpChatModel {
    /// 创建带连接池与超时的 HTTP 客户端
    fn create_client(timeout: Duration) -> Result<reqwest::Client, LlmError> {
        reqwest::Client::builder()
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .connect_timeout(Duration::from_secs(10))
            .timeout(timeout)
            .build()
            .map_err(|e| LlmError::Network(format!("failed to build HTTP client: {e}")))
    }

    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, LlmError> {
        let base_url = base_url.into();
        Ok(Self {
            client: Self::create_client(timeout)?,
            endpoint: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            api_key: api_key.into(),
        })
    }

    fn build_body(request: &ModelRequest, stream: bool) -> Value {
        let mut messages = Vec::new();
        if let Some(system) = &request.system {
            messages.push(json!({ "role": "system", "content": system }));
        }
        for message in &request.messages {
            messages.extend(wire_messages(message));
        }

        let mut body = json!({
            "model": request.model,
            "messages": messages,
            "temperature": request.params.temperature,
            "max_tokens": request.params.max_tokens,
        });
        if !request.tools.is_empty() {
            body["tools"] = Value::Array(
                request
                    .tools
                    .iter()
                    .map(|tool| {
                        json!({
                            "type": "function",
                            "function": {
                                "name": tool.name,
                                "description": tool.description,
                                "parameters": tool.input_schema,
                            }
                        })
                    })
                    .collect(),
            );
        }
        if stream {
            body["stream"] = Value::Bool(true);
            body["stream_options"] = json!({ "include_usage": true });
        }
        body
    }

    async fn send(&self, body: &Value) -> Result<reqwest::Response, LlmError> {
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| LlmError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(LlmError::from_status(status.as_u16(), text));
        }
        Ok(response)
    }
}

fn wire_messages(message: &ChatMessage) -> Vec<Value> {
    match message.role {
        Role::System => vec![json!({ "role": "system", "content": message.content })],
        Role::User => vec![json!({ "role": "user", "content": message.content })],
        Role::Assistant if message.tool_calls.is_empty() => {
            vec![json!({ "role": "assistant", "content": message.content })]
        }
        Role::Assistant => {
            let calls: Vec<Value> = message
                .tool_calls
                .iter()
                .map(|call| {
                    json!({
                        "id": call.id,
                        "type": "function",
                        "function": { "name": call.name, "arguments": call.input.to_string() }
                    })
                })
                .collect();
            let content = if message.content.is_empty() {
                Value::Null
            } else {
                Value::String(message.content.clone())
            };
            vec![json!({ "role": "assistant", "content": content, "tool_calls": calls })]
        }
        Role::Tool => message
            .tool_results
            .iter()
            .map(|result| {
                json!({
                    "role": "tool",
                    "tool_call_id": result.tool_call_id,
                    "content": result.content,
                })
            })
            .collect(),
    }
}

fn parse_arguments(raw: &str) -> Value {
    if raw.trim().is_empty() {
        return json!({});
    }
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn parse_usage(payload: &Value) -> Option<TokenUsage> {
    let usage = payload.get("usage").filter(|u| !u.is_null())?;
    Some(TokenUsage::new(
        usage["prompt_tokens"].as_u64().unwrap_or(0),
        usage["completion_tokens"].as_u64().unwrap_or(0),
    ))
}

fn parse_response(payload: &Value) -> Result<ModelResponse, LlmError> {
    let message = payload["choices"]
        .get(0)
        .map(|choice| &choice["message"])
        .ok_or_else(|| LlmError::InvalidResponse("missing choices[0].message".into()))?;

    let content = message["content"].as_str().unwrap_or_default().to_string();
    let tool_calls = message["tool_calls"]
        .as_array()
        .map(|calls| {
            calls
                .iter()
                .map(|call| ToolCall {
                    id: call["id"].as_str().unwrap_or_default().to_string(),
                    name: call["function"]["name"]
                        .as_str()
                        .unwrap_or_default()
                        .to_string(),
                    input: parse_arguments(call["function"]["arguments"].as_str().unwrap_or("")),
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(ModelResponse {
        content,
        tool_calls,
        usage: parse_usage(payload).unwrap_or_default(),
    })
}

#[derive(Default)]
struct PartialCall {
    id: String,
    name: String,
    arguments: String,
}

type ByteStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>, LlmError>> + Send>>;

/// 把 SSE 增量还原成有序的模型片段
struct DeltaAssembler {
    body: ByteStream,
    parser: SseParser,
    pending: VecDeque<Result<ModelChunk, LlmError>>,
    calls: BTreeMap<u64, PartialCall>,
    usage: Option<TokenUsage>,
    finished: bool,
}

impl DeltaAssembler {
    fn absorb(&mut self, event: SseEvent) {
        let json = match event {
            SseEvent::Done => {
                self.flush();
                return;
            }
            SseEvent::Data(json) => json,
        };

        if let Some(usage) = parse_usage(&json) {
            self.usage = Some(usage);
        }
        let Some(choice) = json["choices"].get(0) else {
            return;
        };
        let delta = &choice["delta"];
        if let Some(text) = delta["content"].as_str() {
            if !text.is_empty() {
                self.pending
                    .push_back(Ok(ModelChunk::TextDelta(text.to_string())));
            }
        }
        if let Some(calls) = delta["tool_calls"].as_array() {
            for call in calls {
                let index = call["index"].as_u64().unwrap_or(0);
                let is_new = !self.calls.contains_key(&index);
                let entry = self.calls.entry(index).or_default();
                if let Some(id) = call["id"].as_str() {
                    entry.id = id.to_string();
                }
                if let Some(name) = call["function"]["name"].as_str() {
                    entry.name.push_str(name);
                }
                if let Some(args) = call["function"]["arguments"].as_str() {
                    entry.arguments.push_str(args);
                }
                if is_new {
                    self.pending.push_back(Ok(ModelChunk::ToolCallStart {
                        id: entry.id.clone(),
                        name: entry.name.clone(),
                    }));
                }
            }
        }
    }

    fn flush(&mut self) {
        for (_, call) in std::mem::take(&mut self.calls) {
            self.pending.push_back(Ok(ModelChunk::ToolCall(ToolCall {
                id: call.id,
                name: call.name,
                input: parse_arguments(&call.arguments),
            })));
        }
        if let Some(usage) = self.usage.take() {
            self.pending.push_back(Ok(ModelChunk::Usage(usage)));
        }
        self.finished = true;
    }

    async fn next_chunk(&mut self) -> Option<Result<ModelChunk, LlmError>> {
        loop {
            if let Some(item) = self.pending.pop_front() {
                return Some(item);
            }
            if self.finished {
                return None;
            }
            match self.body.next().await {
                Some(Ok(bytes)) => match self.parser.parse_chunk(&bytes) {
                    Ok(events) => {
                        for event in events {
                            self.absorb(event);
                        }
                    }
                    Err(err) => {
                        self.finished = true;
                        self.pending.push_back(Err(err));
                    }
                },
                Some(Err(err)) => {
                    self.finished = true;
                    self.pending.push_back(Err(err));
                }
                None => self.flush(),
            }
        }
    }
}

#[async_trait]
impl ChatModel for HttpChatModel {
    fn name(&self) -> &str {
        "openai-compatible"
    }

    #[instrument(skip(self, request), fields(model = %request.model))]
    async fn respond(&self, request: ModelRequest) -> Result<ModelResponse, LlmError> {
        let body = Self::build_body(&request, false);
        let response = self.send(&body).await?;
        let payload: Value = response
            .json()
            .await
            .map_err(|e| LlmError::InvalidResponse(e.to_string()))?;
        parse_response(&payload)
    }

    fn respond_stream(self: Arc<Self>, request: ModelRequest) -> ModelStream {
        let body = Self::build_body(&request, true);
        let opened = async move {
            let response = self.send(&body).await?;
            let bytes: ByteStream = Box::pin(response.bytes_stream().map(|chunk| {
                chunk
                    .map(|b| b.to_vec())
                    .map_err(|e| LlmError::Network(e.to_string()))
            }));
            Ok::<_, LlmError>(DeltaAssembler {
                body: bytes,
                parser: SseParser::new(),
                pending: VecDeque::new(),
                calls: BTreeMap::new(),
                usage: None,
                finished: false,
            })
        };

        Box::pin(
            futures::stream::once(opened).flat_map(|opened| -> ModelStream {
                match opened {
                    Ok(assembler) => Box::pin(futures::stream::unfold(
                        assembler,
                        |mut assembler| async move {
                            let item = assembler.next_chunk().await?;
                            Some((item, assembler))
                        },
                    )),
                    Err(err) => Box::pin(futures::stream::iter(vec![Err(err)])),
                }
            }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::types::{GenerationParams, ToolDefinition, ToolResult};

    #[test]
    fn body_carries_tools_and_tool_messages() {
        let request = ModelRequest {
            model: "gpt-test".into(),
            system: Some("sys".into()),
            messages: vec![
                ChatMessage::user("hi"),
                ChatMessage::assistant_with_tools(
                    "",
                    vec![ToolCall {
                        id: "c1".into(),
                        name: "lookup".into(),
                        input: json!({"q": "x"}),
                    }],
                ),
                ChatMessage::tool_results(vec![ToolResult {
                    tool_call_id: "c1".into(),
                    name: "lookup".into(),
                    content: "found".into(),
                    is_error: false,
                }]),
            ],
            tools: vec![ToolDefinition {
                name: "lookup".into(),
                description: "find things".into(),
                input_schema: json!({"type": "object"}),
            }],
            params: GenerationParams::default(),
        };
        let body = HttpChatModel::build_body(&request, false);
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[2]["tool_calls"][0]["function"]["arguments"], "{\"q\":\"x\"}");
        assert_eq!(messages[3]["role"], "tool");
        assert_eq!(body["tools"][0]["function"]["name"], "lookup");
        assert!(body.get("stream").is_none());
    }

    #[test]
    fn parses_tool_calls_and_usage() {
        let payload = json!({
            "choices": [{
                "message": {
                    "content": null,
                    "tool_calls": [{
                        "id": "call_1",
                        "function": { "name": "send_email", "arguments": "{\"to\":\"a@b.c\"}" }
                    }]
                }
            }],
            "usage": { "prompt_tokens": 12, "completion_tokens": 7 }
        });
        let response = parse_response(&payload).unwrap();
        assert_eq!(response.content, "");
        assert_eq!(response.tool_calls[0].input["to"], "a@b.c");
        assert_eq!(response.usage, TokenUsage::new(12, 7));
    }

    #[test]
    fn missing_choices_is_invalid_response() {
        let err = parse_response(&json!({})).unwrap_err();
        assert!(matches!(err, LlmError::InvalidResponse(_)));
    }
}
