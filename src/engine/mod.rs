//! 单次 agent 运行的编排
//!
//! before 钩子 → 抓取数据 → 组装 prompt → 单次生成 → 评估 → 映射状态 → 保存追踪 → after/on_error 钩子。

pub mod fetch;
pub mod hooks;
pub mod prompt;
pub mod request;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info, warn};

use crate::config::AgentConfig;
use crate::error::{ExecutionError, PilotError, Result};
use crate::eval::{Decision, EvalContext, EvalEngine, EvalResult};
use crate::llm::{ChatMessage, LlmClient, LlmRequest};
use crate::trace::{AgentTrace, AgentTracer, NullTraceSink, RunStatus, TraceSink};

pub use fetch::{
    fetch_all, Credentials, DataFetcher, NoopFetcher, SourceData, StaticFetcher,
};
pub use hooks::{AgentHook, HookContext, HookFailure, HookFailurePolicy, HookRegistry};
pub use prompt::{build_prompt, BuiltPrompt};
pub use request::{AgentRunRequest, TriggerSource};

use hooks::HookPhase;

/// 评估结论到运行状态的映射
pub fn status_for(decision: Decision) -> RunStatus {
    match decision {
        Decision::AutoSend => RunStatus::Completed,
        Decision::NeedsReview => RunStatus::PendingReview,
        Decision::Blocked => RunStatus::Blocked,
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AgentRunResult {
    pub run_id: String,
    pub agent_id: String,
    pub status: RunStatus,
    pub content: String,
    pub eval: EvalResult,
    pub sources: Vec<SourceData>,
    pub trace: AgentTrace,
}

impl AgentRunResult {
    pub fn decision(&self) -> Decision {
        self.eval.decision
    }

    /// 只有 auto_send 才可直接执行外部动作
    pub fn may_execute(&self) -> bool {
        self.eval.decision == Decision::AutoSend
    }
}

struct StepOutput {
    content: String,
    eval: EvalResult,
    sources: Vec<SourceData>,
}

/// Agent 执行引擎
#[derive(Clone)]
pub struct AgentEngine {
    llm: LlmClient,
    eval: EvalEngine,
    fetcher: Arc<dyn DataFetcher>,
    sink: Arc<dyn TraceSink>,
    hooks: HookRegistry,
}

impl AgentEngine {
    pub fn new(llm: LlmClient, eval: EvalEngine) -> Self {
        Self {
            llm,
            eval,
            fetcher: Arc::new(NoopFetcher),
            sink: Arc::new(NullTraceSink),
            hooks: HookRegistry::default(),
        }
    }

    pub fn with_fetcher(mut self, fetcher: Arc<dyn DataFetcher>) -> Self {
        self.fetcher = fetcher;
        self
    }

    pub fn with_trace_sink(mut self, sink: Arc<dyn TraceSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_hooks(mut self, hooks: HookRegistry) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn llm(&self) -> &LlmClient {
        &self.llm
    }

    pub async fn run(&self, agent: &AgentConfig, request: AgentRunRequest) -> Result<AgentRunResult> {
        let mut tracer = AgentTracer::new(&agent.id);
        let run_id = tracer.run_id().to_string();
        let ctx = HookContext {
            agent,
            request: &request,
            run_id: &run_id,
        };
        info!(
            agent_id = %agent.id,
            run_id = %run_id,
            triggered_by = %request.triggered_by,
            "agent run started"
        );

        if let Err(failure) = self.hooks.run(HookPhase::Before, ctx, None, None).await {
            tracer.record_error("hook:before", failure.to_string());
            return Err(self.fail(tracer, ctx, failure.to_string(), false).await);
        }
        tracer.record_decision(
            "hook:before",
            json!({ "hooks": self.hooks.len(), "policy": self.hooks.policy() }),
        );

        let output = match self.execute_steps(agent, &request, &mut tracer).await {
            Ok(output) => output,
            Err(err) => {
                tracer.record_error("run", err.to_string());
                let retryable = err.is_retryable();
                return Err(self.fail(tracer, ctx, err.to_string(), retryable).await);
            }
        };

        let status = status_for(output.eval.decision);
        tracer.record_decision(
            "status",
            json!({ "decision": output.eval.decision, "status": status }),
        );
        let trace = tracer.finalize(status);
        self.persist(&trace).await;
        info!(
            agent_id = %agent.id,
            run_id = %run_id,
            status = %status,
            cost_usd = trace.metrics.cost_usd,
            "agent run finished"
        );

        let result = AgentRunResult {
            run_id: run_id.clone(),
            agent_id: agent.id.clone(),
            status,
            content: output.content,
            eval: output.eval,
            sources: output.sources,
            trace,
        };

        if let Err(failure) = self.hooks.run(HookPhase::After, ctx, Some(&result), None).await {
            error!(run_id = %run_id, error = %failure, "after hook failed");
            return Err(PilotError::Execution(ExecutionError {
                agent_id: agent.id.clone(),
                run_id,
                message: failure.to_string(),
                retryable: false,
            }));
        }
        Ok(result)
    }

    async fn execute_steps(
        &self,
        agent: &AgentConfig,
        request: &AgentRunRequest,
        tracer: &mut AgentTracer,
    ) -> Result<StepOutput> {
        let sources = fetch_all(self.fetcher.as_ref(), &agent.sources).await;
        for item in &sources {
            tracer.record_tool_call(
                &format!("fetch:{}", item.source),
                json!({ "kind": item.kind }),
                item.result.clone(),
                item.duration_ms,
            );
        }

        let prompt = build_prompt(agent, &sources, request);
        let llm_request = LlmRequest::new(vec![ChatMessage::user(prompt.user.clone())])
            .with_system(prompt.system.clone())
            .with_tier(agent.tier)
            .with_temperature(agent.temperature)
            .with_max_tokens(agent.max_tokens)
            .with_max_steps(agent.max_steps);
        let run = self.llm.complete_once(llm_request).await?;
        tracer.record_llm_call(
            "generate",
            Some(json!({ "system": prompt.system, "user": prompt.user })),
            &run,
        );

        let eval_ctx = EvalContext {
            recipient_name: request.recipient_name.clone(),
            conversation_history: request.conversation_history.clone(),
            autonomy: agent.autonomy,
        };
        let eval = self.eval.evaluate(&run.content, &eval_ctx, &agent.eval).await;
        tracer.record_decision("eval", serde_json::to_value(&eval)?);

        Ok(StepOutput {
            content: run.content,
            eval,
            sources,
        })
    }

    async fn fail(
        &self,
        tracer: AgentTracer,
        ctx: HookContext<'_>,
        message: String,
        retryable: bool,
    ) -> PilotError {
        let trace = tracer.finalize(RunStatus::Failed);
        self.persist(&trace).await;
        let mut error = ExecutionError {
            agent_id: ctx.agent.id.clone(),
            run_id: ctx.run_id.to_string(),
            message,
            retryable,
        };
        error!(agent_id = %error.agent_id, run_id = %error.run_id, error = %error.message, "agent run failed");

        if let Err(failure) = self.hooks.run(HookPhase::Error, ctx, None, Some(&error)).await {
            error.message = format!("{}; {failure}", error.message);
        }
        PilotError::Execution(error)
    }

    async fn persist(&self, trace: &AgentTrace) {
        if let Err(err) = self.sink.save(trace).await {
            warn!(run_id = %trace.run_id, error = %err, "failed to persist trace");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decisions_map_to_statuses() {
        assert_eq!(status_for(Decision::AutoSend), RunStatus::Completed);
        assert_eq!(status_for(Decision::NeedsReview), RunStatus::PendingReview);
        assert_eq!(status_for(Decision::Blocked), RunStatus::Blocked);
    }
}
