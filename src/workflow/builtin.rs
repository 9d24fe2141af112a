use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::debug;
use uuid::Uuid;

use super::context::ExecutionContext;
use super::executor::{NodeExecutor, NodeInput, NodeOutcome, NodeRegistry};
use crate::catalog::AgentCatalog;
use crate::config::AgentConfig;
use crate::engine::{AgentEngine, AgentRunRequest, TriggerSource};
use crate::error::{PilotError, Result};
use crate::llm::{LlmClient, LlmRequest, ModelTier};

pub const MAX_DELAY_MS: u64 = 60_000;

/// `set`：合并静态值
pub struct SetNode;

#[derive(Deserialize)]
struct SetConfig {
    values: Map<String, Value>,
}

#[async_trait]
impl NodeExecutor for SetNode {
    fn node_type(&self) -> &str {
        "set"
    }

    async fn execute(&self, input: NodeInput<'_>, ctx: ExecutionContext) -> Result<NodeOutcome> {
        let config: SetConfig = input.config()?;
        Ok(NodeOutcome::Continue(ctx.merged(config.values)))
    }
}

/// `template`：渲染 `{{var}}` 写入输出键
pub struct TemplateNode;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TemplateConfig {
    template: String,
    #[serde(default = "default_template_key")]
    output_key: String,
}

fn default_template_key() -> String {
    "output".to_string()
}

#[async_trait]
impl NodeExecutor for TemplateNode {
    fn node_type(&self) -> &str {
        "template"
    }

    async fn execute(&self, input: NodeInput<'_>, ctx: ExecutionContext) -> Result<NodeOutcome> {
        let config: TemplateConfig = input.config()?;
        let rendered = ctx.render(&config.template);
        Ok(NodeOutcome::Continue(
            ctx.with(config.output_key, Value::String(rendered)),
        ))
    }
}

/// `condition`：比较上下文中的值，结果写成布尔
pub struct ConditionNode;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConditionConfig {
    key: String,
    equals: Value,
    #[serde(default = "default_condition_key")]
    output_key: String,
}

fn default_condition_key() -> String {
    "condition".to_string()
}

#[async_trait]
impl NodeExecutor for ConditionNode {
    fn node_type(&self) -> &str {
        "condition"
    }

    async fn execute(&self, input: NodeInput<'_>, ctx: ExecutionContext) -> Result<NodeOutcome> {
        let config: ConditionConfig = input.config()?;
        let matched = ctx.lookup(&config.key) == Some(&config.equals);
        debug!(node_id = input.node_id(), key = %config.key, matched, "condition evaluated");
        Ok(NodeOutcome::Continue(
            ctx.with(config.output_key, Value::Bool(matched)),
        ))
    }
}

/// `delay`：有上限的等待
pub struct DelayNode;

#[derive(Deserialize)]
struct DelayConfig {
    ms: u64,
}

#[async_trait]
impl NodeExecutor for DelayNode {
    fn node_type(&self) -> &str {
        "delay"
    }

    async fn execute(&self, input: NodeInput<'_>, ctx: ExecutionContext) -> Result<NodeOutcome> {
        let config: DelayConfig = input.config()?;
        tokio::time::sleep(Duration::from_millis(config.ms.min(MAX_DELAY_MS))).await;
        Ok(NodeOutcome::Continue(ctx))
    }
}

/// `wait_for_event`：挂起工作流，直到外部事件带着恢复令牌回来
pub struct WaitForEventNode;

#[derive(Deserialize)]
struct WaitConfig {
    event: String,
}

#[async_trait]
impl NodeExecutor for WaitForEventNode {
    fn node_type(&self) -> &str {
        "wait_for_event"
    }

    async fn execute(&self, input: NodeInput<'_>, ctx: ExecutionContext) -> Result<NodeOutcome> {
        let config: WaitConfig = input.config()?;
        let resume_token = Uuid::new_v4().to_string();
        let ctx = ctx.with(
            "awaiting_event",
            json!({
                "event": config.event,
                "nodeId": input.node_id(),
                "resumeToken": resume_token,
            }),
        );
        Ok(NodeOutcome::Suspend { resume_token, ctx })
    }
}

/// `llm`：渲染 prompt 后单次生成
pub struct LlmNode {
    client: LlmClient,
}

impl LlmNode {
    pub fn new(client: LlmClient) -> Self {
        Self { client }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LlmNodeConfig {
    prompt: String,
    #[serde(default)]
    system: Option<String>,
    #[serde(default)]
    tier: ModelTier,
    #[serde(default)]
    temperature: Option<f32>,
    #[serde(default)]
    max_tokens: Option<u32>,
    #[serde(default = "default_llm_key")]
    output_key: String,
}

fn default_llm_key() -> String {
    "llm_output".to_string()
}

#[async_trait]
impl NodeExecutor for LlmNode {
    fn node_type(&self) -> &str {
        "llm"
    }

    async fn execute(&self, input: NodeInput<'_>, ctx: ExecutionContext) -> Result<NodeOutcome> {
        let config: LlmNodeConfig = input.config()?;
        let mut request = LlmRequest::prompt(ctx.render(&config.prompt)).with_tier(config.tier);
        if let Some(system) = config.system.as_deref() {
            request = request.with_system(ctx.render(system));
        }
        if let Some(temperature) = config.temperature {
            request = request.with_temperature(temperature);
        }
        if let Some(max_tokens) = config.max_tokens {
            request = request.with_max_tokens(max_tokens);
        }
        let run = self.client.complete_once(request).await?;
        Ok(NodeOutcome::Continue(
            ctx.with(config.output_key, Value::String(run.content)),
        ))
    }
}

/// `agent`：在工作流中运行一次 agent，结果写入输出键
pub struct AgentNode {
    engine: Arc<AgentEngine>,
    agents: Arc<AgentCatalog>,
}

impl AgentNode {
    pub fn new(engine: Arc<AgentEngine>, agents: Arc<AgentCatalog>) -> Self {
        Self { engine, agents }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AgentNodeConfig {
    #[serde(default)]
    agent_id: Option<String>,
    #[serde(default)]
    agent: Option<AgentConfig>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    recipient: Option<String>,
    #[serde(default = "default_agent_key")]
    output_key: String,
}

fn default_agent_key() -> String {
    "agent".to_string()
}

#[async_trait]
impl NodeExecutor for AgentNode {
    fn node_type(&self) -> &str {
        "agent"
    }

    async fn execute(&self, input: NodeInput<'_>, ctx: ExecutionContext) -> Result<NodeOutcome> {
        let config: AgentNodeConfig = input.config()?;
        let agent = match (config.agent, config.agent_id.as_deref()) {
            (Some(inline), _) => {
                inline.validate()?;
                Arc::new(inline)
            }
            (None, Some(id)) => self.agents.require(id)?,
            (None, None) => {
                return Err(PilotError::MissingField {
                    node: input.node_id().to_string(),
                    field: "agentId".to_string(),
                })
            }
        };

        let mut request = AgentRunRequest::new(TriggerSource::Workflow)
            .with_context(ctx.to_value().to_string());
        request.user_id = input.user_id.map(str::to_string);
        if let Some(message) = config.message.as_deref() {
            request = request.with_message(ctx.render(message));
        }
        if let Some(recipient) = config.recipient.as_deref() {
            request = request.with_recipient(ctx.render(recipient));
        }

        let result = self.engine.run(&agent, request).await?;
        Ok(NodeOutcome::Continue(ctx.with(
            config.output_key,
            json!({
                "runId": result.run_id,
                "status": result.status,
                "decision": result.eval.decision,
                "content": result.content,
                "costUsd": result.trace.metrics.cost_usd,
            }),
        )))
    }
}

/// 内置执行器依赖
#[derive(Clone)]
pub struct BuiltinDeps {
    pub llm: LlmClient,
    pub engine: Arc<AgentEngine>,
    pub agents: Arc<AgentCatalog>,
}

impl NodeRegistry {
    /// 不依赖外部服务的内置节点
    pub fn basic() -> Result<Self> {
        NodeRegistry::new()
            .with(Arc::new(SetNode))?
            .with(Arc::new(TemplateNode))?
            .with(Arc::new(ConditionNode))?
            .with(Arc::new(DelayNode))?
            .with(Arc::new(WaitForEventNode))
    }

    /// 全部内置节点，在启动时组装一次
    pub fn with_builtins(deps: BuiltinDeps) -> Result<Self> {
        Self::basic()?
            .with(Arc::new(LlmNode::new(deps.llm)))?
            .with(Arc::new(AgentNode::new(deps.engine, deps.agents)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::graph::{Connection, WorkflowGraph, WorkflowNode};
    use crate::workflow::{WorkflowExecutor, WorkflowOutcome};

    fn executor() -> WorkflowExecutor {
        WorkflowExecutor::new(Arc::new(NodeRegistry::basic().unwrap()))
    }

    #[tokio::test]
    async fn set_template_condition_chain() {
        let graph = WorkflowGraph::new(
            vec![
                WorkflowNode::new("greet", "template", json!({"template": "Hi {{name}}", "outputKey": "greeting"})),
                WorkflowNode::new("seed", "set", json!({"values": {"name": "Ana", "tier": "gold"}})),
                WorkflowNode::new("check", "condition", json!({"key": "tier", "equals": "gold", "outputKey": "vip"})),
            ],
            vec![Connection::new("seed", "greet"), Connection::new("seed", "check")],
        );
        let outcome = executor()
            .run(&graph, None, ExecutionContext::new())
            .await
            .unwrap();
        let ctx = outcome.context();
        assert_eq!(ctx.get_str("greeting"), Some("Hi Ana"));
        assert_eq!(ctx.get("vip"), Some(&json!(true)));
    }

    #[tokio::test]
    async fn template_without_field_names_it() {
        let graph = WorkflowGraph::new(
            vec![WorkflowNode::new("t", "template", json!({"outputKey": "x"}))],
            vec![],
        );
        let err = executor()
            .run(&graph, None, ExecutionContext::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PilotError::MissingField { ref field, .. } if field == "template"));
    }

    #[tokio::test]
    async fn wait_for_event_suspends_and_resume_continues() {
        let graph = WorkflowGraph::new(
            vec![
                WorkflowNode::new("start", "set", json!({"values": {"stage": "booked"}})),
                WorkflowNode::new("wait", "wait_for_event", json!({"event": "recording.ready"})),
                WorkflowNode::new("after", "template", json!({"template": "{{stage}}: {{transcript}}", "outputKey": "summary"})),
            ],
            vec![Connection::new("start", "wait"), Connection::new("wait", "after")],
        );
        let executor = executor();
        let outcome = executor
            .run(&graph, Some("u1"), ExecutionContext::new())
            .await
            .unwrap();
        let WorkflowOutcome::Suspended {
            node_id,
            resume_token,
            ctx,
            records,
        } = outcome
        else {
            panic!("expected suspension");
        };
        assert_eq!(node_id, "wait");
        assert_eq!(records.len(), 2);
        assert_eq!(
            ctx.lookup("awaiting_event.resumeToken"),
            Some(&json!(resume_token))
        );
        assert!(!ctx.contains("summary"));

        let stale = executor
            .resume(&graph, &node_id, "not-the-token", Some("u1"), ctx.clone(), json!({}))
            .await;
        assert!(matches!(stale, Err(PilotError::Config(_))));

        let resumed = executor
            .resume(
                &graph,
                &node_id,
                &resume_token,
                Some("u1"),
                ctx.clone(),
                json!({"transcript": "all good"}),
            )
            .await
            .unwrap();
        assert!(!resumed.is_suspended());
        assert_eq!(resumed.records().len(), 1);
        assert_eq!(resumed.context().get_str("summary"), Some("booked: all good"));
        assert!(!resumed.context().contains("awaiting_event"));

        let replay = executor
            .resume(&graph, &node_id, &resume_token, Some("u1"), ctx, json!({}))
            .await
            .unwrap_err();
        assert!(!replay.is_retryable());
    }

    #[tokio::test]
    async fn delay_is_capped() {
        let graph = WorkflowGraph::new(
            vec![WorkflowNode::new("d", "delay", json!({"ms": 5}))],
            vec![],
        );
        let outcome = executor()
            .run(&graph, None, ExecutionContext::new().with("k", json!(1)))
            .await
            .unwrap();
        assert_eq!(outcome.context().get("k"), Some(&json!(1)));
    }
}
