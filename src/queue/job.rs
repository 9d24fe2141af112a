use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::backoff::RetryPolicy;
use crate::engine::TriggerSource;

/// 挂起工作流的恢复点
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumePoint {
    pub node_id: String,
    pub resume_token: String,
    /// 挂起时的上下文
    #[serde(default)]
    pub context: Map<String, Value>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowJob {
    pub workflow_id: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub initial_data: Map<String, Value>,
    #[serde(default)]
    pub triggered_by: TriggerSource,
    /// 存在时表示续跑，`initial_data` 作为外部事件数据合并
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume: Option<ResumePoint>,
}

impl WorkflowJob {
    pub fn new(workflow_id: impl Into<String>, triggered_by: TriggerSource) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            user_id: None,
            initial_data: Map::new(),
            triggered_by,
            resume: None,
        }
    }

    pub fn with_data(mut self, data: Map<String, Value>) -> Self {
        self.initial_data = data;
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn resuming(mut self, resume: ResumePoint) -> Self {
        self.resume = Some(resume);
        self
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentJob {
    pub agent_id: String,
    #[serde(default)]
    pub workspace_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub triggered_by: TriggerSource,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub context: Option<String>,
    #[serde(default)]
    pub recipient_name: Option<String>,
}

impl AgentJob {
    pub fn new(agent_id: impl Into<String>, triggered_by: TriggerSource) -> Self {
        Self {
            agent_id: agent_id.into(),
            workspace_id: None,
            user_id: None,
            triggered_by,
            message: None,
            context: None,
            recipient_name: None,
        }
    }
}

/// 队列任务负载
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobPayload {
    Workflow(WorkflowJob),
    Agent(AgentJob),
}

impl JobPayload {
    pub fn target(&self) -> &str {
        match self {
            JobPayload::Workflow(job) => &job.workflow_id,
            JobPayload::Agent(job) => &job.agent_id,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Waiting,
    Delayed,
    Active,
    Completed,
    Failed,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            JobStatus::Waiting => "waiting",
            JobStatus::Delayed => "delayed",
            JobStatus::Active => "active",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        };
        f.write_str(text)
    }
}

/// 入队参数
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobOptions {
    pub attempts: u32,
    pub backoff: RetryPolicy,
    /// 延迟执行的毫秒数
    #[serde(default)]
    pub delay_ms: u64,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: RetryPolicy::default(),
            delay_ms: 0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Success,
    Suspended,
    Failed,
}

/// 任务处理结果
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    pub execution_id: String,
    pub status: ExecutionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume: Option<ResumePoint>,
}

/// 队列中的一个任务
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub queue: String,
    pub payload: JobPayload,
    pub options: JobOptions,
    pub status: JobStatus,
    pub attempts_made: u32,
    pub created_at: DateTime<Utc>,
    /// 最早可被领取的时间
    pub run_at: DateTime<Utc>,
    #[serde(default)]
    pub lock_token: Option<String>,
    #[serde(default)]
    pub locked_by: Option<String>,
    #[serde(default)]
    pub lock_expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub result: Option<JobResult>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(id: impl Into<String>, queue: impl Into<String>, payload: JobPayload, options: JobOptions) -> Self {
        let now = Utc::now();
        let run_at = now + chrono::Duration::milliseconds(options.delay_ms as i64);
        let status = if options.delay_ms > 0 {
            JobStatus::Delayed
        } else {
            JobStatus::Waiting
        };
        Self {
            id: id.into(),
            queue: queue.into(),
            payload,
            options,
            status,
            attempts_made: 0,
            created_at: now,
            run_at,
            lock_token: None,
            locked_by: None,
            lock_expires_at: None,
            last_error: None,
            result: None,
            finished_at: None,
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.status, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn holds_lock(&self, token: &str) -> bool {
        self.status == JobStatus::Active && self.lock_token.as_deref() == Some(token)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounts {
    pub waiting: usize,
    pub delayed: usize,
    pub active: usize,
    pub completed: usize,
    pub failed: usize,
}
