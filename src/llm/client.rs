use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::pricing::PricingTable;
use super::types::{
    ChatMessage, EventStream, LlmRequest, LlmRun, ModelChunk, ModelRequest, ModelResponse,
    ModelStream, StepAction, StopReason, StreamEvent, TokenUsage, ToolCall, ToolDefinition,
    ToolResult, UsageEvent,
};
use crate::error::{LlmError, Result};

/// 模型后端：一次请求对应一次 provider 往返
#[async_trait]
pub trait ChatModel: Send + Sync + 'static {
    fn name(&self) -> &str;

    async fn respond(&self, request: ModelRequest) -> std::result::Result<ModelResponse, LlmError>;

    /// 默认实现把完整响应拆成片段，真正支持流式的后端应覆盖它
    fn respond_stream(self: Arc<Self>, request: ModelRequest) -> ModelStream {
        Box::pin(
            futures::stream::once(async move { self.respond(request).await })
                .flat_map(|result| futures::stream::iter(response_chunks(result))),
        )
    }
}

pub type DynChatModel = Arc<dyn ChatModel>;

fn response_chunks(
    result: std::result::Result<ModelResponse, LlmError>,
) -> Vec<std::result::Result<ModelChunk, LlmError>> {
    match result {
        Ok(response) => {
            let mut chunks = Vec::new();
            if !response.content.is_empty() {
                chunks.push(Ok(ModelChunk::TextDelta(response.content)));
            }
            for call in response.tool_calls {
                chunks.push(Ok(ModelChunk::ToolCallStart {
                    id: call.id.clone(),
                    name: call.name.clone(),
                }));
                chunks.push(Ok(ModelChunk::ToolCall(call)));
            }
            chunks.push(Ok(ModelChunk::Usage(response.usage)));
            chunks
        }
        Err(err) => vec![Err(err)],
    }
}

/// 工具调用处理器；失败以错误字符串返回，不会中断循环
#[async_trait]
pub trait ToolHandler: Send + Sync {
    /// 随请求发给模型的工具定义
    fn definitions(&self) -> Vec<ToolDefinition> {
        Vec::new()
    }

    async fn handle(&self, call: &ToolCall) -> std::result::Result<String, String>;
}

pub struct NoTools;

#[async_trait]
impl ToolHandler for NoTools {
    async fn handle(&self, call: &ToolCall) -> std::result::Result<String, String> {
        Err(format!("no handler registered for tool `{}`", call.name))
    }
}

pub trait UsageSink: Send + Sync {
    fn record(&self, event: &UsageEvent);
}

/// 内存用量账本
#[derive(Default)]
pub struct UsageLedger {
    events: Mutex<Vec<UsageEvent>>,
}

impl UsageLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<UsageEvent> {
        self.events.lock().clone()
    }

    pub fn total_cost(&self) -> f64 {
        self.events.lock().iter().map(|e| e.cost_usd).sum()
    }
}

impl UsageSink for UsageLedger {
    fn record(&self, event: &UsageEvent) {
        self.events.lock().push(event.clone());
    }
}

/// 分档 LLM 客户端：档位解析、工具循环、用量计费、流式事件
#[derive(Clone)]
pub struct LlmClient {
    model: DynChatModel,
    pricing: Arc<PricingTable>,
    usage_sink: Option<Arc<dyn UsageSink>>,
    tool_timeout: Option<Duration>,
}

impl LlmClient {
    pub fn new(model: DynChatModel) -> Self {
        Self {
            model,
            pricing: Arc::new(PricingTable::default()),
            usage_sink: None,
            tool_timeout: None,
        }
    }

    pub fn with_pricing(mut self, pricing: PricingTable) -> Self {
        self.pricing = Arc::new(pricing);
        self
    }

    pub fn with_usage_sink(mut self, sink: Arc<dyn UsageSink>) -> Self {
        self.usage_sink = Some(sink);
        self
    }

    pub fn with_tool_timeout(mut self, duration: Duration) -> Self {
        self.tool_timeout = Some(duration);
        self
    }

    pub fn pricing(&self) -> &PricingTable {
        &self.pricing
    }

    pub fn backend_name(&self) -> &str {
        self.model.name()
    }

    fn model_request(
        &self,
        request: &LlmRequest,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> ModelRequest {
        ModelRequest {
            model: self.pricing.models.model_for(request.tier).to_string(),
            system: request.system.clone(),
            messages: messages.to_vec(),
            tools: tools.to_vec(),
            params: request.params,
        }
    }

    fn record_usage(
        &self,
        request: &LlmRequest,
        model: &str,
        usage: TokenUsage,
        latency_ms: u64,
        step: u32,
        action: StepAction,
    ) -> f64 {
        let cost_usd = self
            .pricing
            .cost(model, usage.input_tokens, usage.output_tokens);
        let event = UsageEvent {
            model: model.to_string(),
            tier: request.tier,
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            cost_usd,
            latency_ms,
            step,
            action,
        };
        debug!(
            model = %event.model,
            tier = %event.tier,
            step,
            tokens_in = usage.input_tokens,
            tokens_out = usage.output_tokens,
            cost_usd,
            latency_ms,
            "llm step finished"
        );
        if let Some(sink) = &self.usage_sink {
            sink.record(&event);
        }
        cost_usd
    }

    async fn dispatch(&self, tools: &dyn ToolHandler, call: &ToolCall) -> ToolResult {
        let outcome = match self.tool_timeout {
            Some(limit) => match timeout(limit, tools.handle(call)).await {
                Ok(result) => result,
                Err(_) => Err(format!("tool `{}` timed out after {:?}", call.name, limit)),
            },
            None => tools.handle(call).await,
        };
        match outcome {
            Ok(content) => ToolResult {
                tool_call_id: call.id.clone(),
                name: call.name.clone(),
                content,
                is_error: false,
            },
            Err(message) => {
                warn!(tool = %call.name, error = %message, "tool invocation failed");
                ToolResult {
                    tool_call_id: call.id.clone(),
                    name: call.name.clone(),
                    content: format!("Error: {message}"),
                    is_error: true,
                }
            }
        }
    }

    /// 单次生成，不带工具
    pub async fn complete_once(&self, request: LlmRequest) -> Result<LlmRun> {
        let model_request = self.model_request(&request, &request.messages, &[]);
        let model = model_request.model.clone();
        let started = Instant::now();
        let response = self.model.respond(model_request).await?;
        let latency_ms = started.elapsed().as_millis() as u64;
        let cost_usd = self.record_usage(
            &request,
            &model,
            response.usage,
            latency_ms,
            1,
            StepAction::classify(&response),
        );

        let mut messages = request.messages;
        messages.push(ChatMessage::assistant(response.content.clone()));
        Ok(LlmRun {
            content: response.content,
            stop_reason: StopReason::EndTurn,
            model,
            steps: 1,
            usage: response.usage,
            cost_usd,
            latency_ms,
            messages,
        })
    }

    /// 多步工具调用循环
    pub async fn run(&self, request: LlmRequest, tools: &dyn ToolHandler) -> Result<LlmRun> {
        let started = Instant::now();
        let mut messages = request.messages.clone();
        let mut usage = TokenUsage::default();
        let mut cost_usd = 0.0;
        let mut content = String::new();
        let mut steps = 0u32;
        let model = self.pricing.models.model_for(request.tier).to_string();
        let definitions = tools.definitions();

        for step in 1..=request.max_steps {
            steps = step;
            let step_started = Instant::now();
            let response = self
                .model
                .respond(self.model_request(&request, &messages, &definitions))
                .await?;
            usage += response.usage;
            cost_usd += self.record_usage(
                &request,
                &model,
                response.usage,
                step_started.elapsed().as_millis() as u64,
                step,
                StepAction::classify(&response),
            );
            if !response.content.is_empty() {
                content = response.content.clone();
            }

            if response.tool_calls.is_empty() {
                messages.push(ChatMessage::assistant(response.content.clone()));
                return Ok(LlmRun {
                    content: response.content,
                    stop_reason: StopReason::EndTurn,
                    model,
                    steps,
                    usage,
                    cost_usd,
                    latency_ms: started.elapsed().as_millis() as u64,
                    messages,
                });
            }

            let mut results = Vec::with_capacity(response.tool_calls.len());
            for call in &response.tool_calls {
                debug!(tool = %call.name, step, "dispatching tool call");
                results.push(self.dispatch(tools, call).await);
            }
            messages.push(ChatMessage::assistant_with_tools(
                response.content,
                response.tool_calls,
            ));
            messages.push(ChatMessage::tool_results(results));
        }

        warn!(max_steps = request.max_steps, "tool loop hit step limit");
        Ok(LlmRun {
            content,
            stop_reason: StopReason::MaxSteps,
            model,
            steps,
            usage,
            cost_usd,
            latency_ms: started.elapsed().as_millis() as u64,
            messages,
        })
    }

    /// 流式版本：后台任务执行同样的循环，按生成顺序推送事件
    pub fn stream(&self, request: LlmRequest, tools: Arc<dyn ToolHandler>) -> EventStream {
        let (tx, rx) = mpsc::unbounded();
        let client = self.clone();
        tokio::spawn(async move {
            if let Err(err) = client.drive_stream(request, tools, &tx).await {
                let _ = tx.unbounded_send(StreamEvent::Error {
                    retryable: err.is_retryable(),
                    message: err.to_string(),
                });
            }
        });
        Box::pin(rx)
    }

    async fn drive_stream(
        &self,
        request: LlmRequest,
        tools: Arc<dyn ToolHandler>,
        tx: &mpsc::UnboundedSender<StreamEvent>,
    ) -> std::result::Result<(), LlmError> {
        let emit = |event: StreamEvent| {
            let _ = tx.unbounded_send(event);
        };
        let model = self.pricing.models.model_for(request.tier).to_string();
        let mut messages = request.messages.clone();
        let mut total = TokenUsage::default();
        let definitions = tools.definitions();

        for step in 1..=request.max_steps {
            if tx.is_closed() {
                debug!(step, "stream receiver dropped, stopping tool loop");
                return Ok(());
            }
            let step_started = Instant::now();
            let mut chunks = Arc::clone(&self.model)
                .respond_stream(self.model_request(&request, &messages, &definitions));
            let mut text = String::new();
            let mut calls: Vec<ToolCall> = Vec::new();
            let mut usage = TokenUsage::default();

            while let Some(chunk) = chunks.next().await {
                match chunk? {
                    ModelChunk::TextDelta(delta) => {
                        text.push_str(&delta);
                        emit(StreamEvent::TextDelta { delta });
                    }
                    ModelChunk::ToolCallStart { id, name } => {
                        emit(StreamEvent::ToolInputStart { id, name });
                    }
                    ModelChunk::ToolCall(call) => {
                        emit(StreamEvent::ToolInputAvailable {
                            id: call.id.clone(),
                            name: call.name.clone(),
                            input: call.input.clone(),
                        });
                        calls.push(call);
                    }
                    ModelChunk::Usage(reported) => usage += reported,
                }
            }

            total += usage;
            let response = ModelResponse {
                content: text,
                tool_calls: calls,
                usage,
            };
            self.record_usage(
                &request,
                &model,
                usage,
                step_started.elapsed().as_millis() as u64,
                step,
                StepAction::classify(&response),
            );

            if response.tool_calls.is_empty() {
                emit(StreamEvent::StepComplete { step, usage });
                emit(StreamEvent::Finish {
                    stop_reason: StopReason::EndTurn,
                    usage: total,
                });
                return Ok(());
            }

            let mut results = Vec::with_capacity(response.tool_calls.len());
            for call in &response.tool_calls {
                // 消费方已离开时不再触发有副作用的工具
                if tx.is_closed() {
                    debug!(tool = %call.name, step, "stream receiver dropped, skipping tool call");
                    return Ok(());
                }
                let result = self.dispatch(tools.as_ref(), call).await;
                emit(StreamEvent::ToolOutputAvailable {
                    id: result.tool_call_id.clone(),
                    output: result.content.clone(),
                    is_error: result.is_error,
                });
                results.push(result);
            }
            messages.push(ChatMessage::assistant_with_tools(
                response.content,
                response.tool_calls,
            ));
            messages.push(ChatMessage::tool_results(results));
            emit(StreamEvent::StepComplete { step, usage });
        }

        emit(StreamEvent::Finish {
            stop_reason: StopReason::MaxSteps,
            usage: total,
        });
        Ok(())
    }
}
