use std::fmt;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::llm::{LlmRun, TokenUsage};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    LlmCall,
    ToolCall,
    Decision,
    Error,
}

/// 运行最终状态
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Failed,
    Blocked,
    PendingReview,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Blocked => "blocked",
            RunStatus::PendingReview => "pending_review",
        };
        f.write_str(text)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TraceStep {
    pub index: usize,
    pub kind: StepKind,
    pub name: String,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default)]
    pub usage: TokenUsage,
    #[serde(default)]
    pub cost_usd: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TraceMetrics {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
    pub duration_ms: u64,
    pub llm_calls: u32,
    pub tool_calls: u32,
    pub errors: u32,
}

impl TraceMetrics {
    /// 从步骤列表重新汇总
    pub fn from_steps(steps: &[TraceStep]) -> Self {
        let mut metrics = TraceMetrics::default();
        for step in steps {
            metrics.input_tokens += step.usage.input_tokens;
            metrics.output_tokens += step.usage.output_tokens;
            metrics.cost_usd += step.cost_usd;
            match step.kind {
                StepKind::LlmCall => metrics.llm_calls += 1,
                StepKind::ToolCall => metrics.tool_calls += 1,
                StepKind::Error => metrics.errors += 1,
                StepKind::Decision => {}
            }
        }
        metrics
    }
}

/// 完成后不可变的运行记录
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AgentTrace {
    pub run_id: String,
    pub agent_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: RunStatus,
    pub steps: Vec<TraceStep>,
    pub metrics: TraceMetrics,
}

impl AgentTrace {
    pub fn to_json(&self) -> crate::error::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn steps_of(&self, kind: StepKind) -> impl Iterator<Item = &TraceStep> {
        self.steps.iter().filter(move |step| step.kind == kind)
    }
}

/// 单次运行的追加式记录器
#[derive(Debug)]
pub struct AgentTracer {
    run_id: String,
    agent_id: String,
    started_at: DateTime<Utc>,
    clock: Instant,
    steps: Vec<TraceStep>,
    metrics: TraceMetrics,
}

impl AgentTracer {
    pub fn new(agent_id: impl Into<String>) -> Self {
        Self::with_run_id(agent_id, Uuid::new_v4().to_string())
    }

    pub fn with_run_id(agent_id: impl Into<String>, run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            agent_id: agent_id.into(),
            started_at: Utc::now(),
            clock: Instant::now(),
            steps: Vec::new(),
            metrics: TraceMetrics::default(),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn steps(&self) -> &[TraceStep] {
        &self.steps
    }

    pub fn metrics(&self) -> &TraceMetrics {
        &self.metrics
    }

    fn push(&mut self, kind: StepKind, name: impl Into<String>, duration_ms: u64) -> &mut TraceStep {
        let index = self.steps.len();
        self.steps.push(TraceStep {
            index,
            kind,
            name: name.into(),
            started_at: Utc::now(),
            duration_ms,
            input: None,
            output: None,
            model: None,
            usage: TokenUsage::default(),
            cost_usd: 0.0,
            error: None,
        });
        &mut self.steps[index]
    }

    fn refresh(&mut self) {
        let duration_ms = self.clock.elapsed().as_millis() as u64;
        self.metrics = TraceMetrics {
            duration_ms,
            ..TraceMetrics::from_steps(&self.steps)
        };
    }

    pub fn record_llm_call(&mut self, name: &str, prompt: Option<Value>, run: &LlmRun) {
        let step = self.push(StepKind::LlmCall, name, run.latency_ms);
        step.input = prompt;
        step.output = Some(Value::String(run.content.clone()));
        step.model = Some(run.model.clone());
        step.usage = run.usage;
        step.cost_usd = run.cost_usd;
        self.refresh();
    }

    pub fn record_tool_call(
        &mut self,
        name: &str,
        input: Value,
        output: std::result::Result<Value, String>,
        duration_ms: u64,
    ) {
        let step = self.push(StepKind::ToolCall, name, duration_ms);
        step.input = Some(input);
        match output {
            Ok(value) => step.output = Some(value),
            Err(message) => step.error = Some(message),
        }
        self.refresh();
    }

    pub fn record_decision(&mut self, name: &str, detail: Value) {
        let step = self.push(StepKind::Decision, name, 0);
        step.output = Some(detail);
        self.refresh();
    }

    pub fn record_error(&mut self, name: &str, message: impl Into<String>) {
        let step = self.push(StepKind::Error, name, 0);
        step.error = Some(message.into());
        self.refresh();
    }

    /// 结束记录，之后不可再追加
    pub fn finalize(mut self, status: RunStatus) -> AgentTrace {
        self.refresh();
        AgentTrace {
            run_id: self.run_id,
            agent_id: self.agent_id,
            started_at: self.started_at,
            finished_at: Utc::now(),
            status,
            steps: self.steps,
            metrics: self.metrics,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::StopReason;
    use serde_json::json;

    fn run(input: u64, output: u64, cost: f64) -> LlmRun {
        LlmRun {
            content: "draft".into(),
            stop_reason: StopReason::EndTurn,
            model: "m".into(),
            steps: 1,
            usage: TokenUsage::new(input, output),
            cost_usd: cost,
            latency_ms: 12,
            messages: Vec::new(),
        }
    }

    #[test]
    fn metrics_follow_appended_steps() {
        let mut tracer = AgentTracer::new("agent-1");
        tracer.record_llm_call("generate", None, &run(100, 20, 0.5));
        tracer.record_llm_call("judge", None, &run(50, 10, 0.25));
        tracer.record_tool_call("crm.lookup", json!({"id": 1}), Err("timeout".into()), 3);
        tracer.record_error("fetch", "source down");
        tracer.record_decision("eval", json!({"decision": "auto_send"}));

        let metrics = tracer.metrics().clone();
        assert_eq!(metrics.llm_calls, 2);
        assert_eq!(metrics.tool_calls, 1);
        assert_eq!(metrics.errors, 1);
        assert_eq!(metrics.input_tokens + metrics.output_tokens, 180);
        assert!((metrics.cost_usd - 0.75).abs() < 1e-12);

        let trace = tracer.finalize(RunStatus::Completed);
        assert_eq!(trace.steps.len(), 5);
        assert!(trace.steps.iter().enumerate().all(|(i, s)| s.index == i));
        assert_eq!(trace.steps_of(StepKind::LlmCall).count(), 2);
        assert!(trace.finished_at >= trace.started_at);
    }

    #[test]
    fn trace_serializes_status_in_snake_case() {
        let trace = AgentTracer::with_run_id("a", "r").finalize(RunStatus::PendingReview);
        let value: Value = serde_json::from_str(&trace.to_json().unwrap()).unwrap();
        assert_eq!(value["status"], "pending_review");
        assert_eq!(value["run_id"], "r");
    }
}
