use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::info;
use uuid::Uuid;

use super::job::{AgentJob, ExecutionStatus, Job, JobPayload, JobResult, ResumePoint, WorkflowJob};
use crate::catalog::{AgentCatalog, WorkflowCatalog};
use crate::engine::{AgentEngine, AgentRunRequest};
use crate::error::Result;
use crate::workflow::{ExecutionContext, WorkflowExecutor, WorkflowOutcome};

/// 任务处理器；返回的错误交给 worker 决定是否重试
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> Result<JobResult>;
}

/// 按负载类型分发到工作流执行器或 agent 引擎
pub struct PilotJobHandler {
    executor: WorkflowExecutor,
    workflows: Arc<WorkflowCatalog>,
    engine: Arc<AgentEngine>,
    agents: Arc<AgentCatalog>,
}

impl PilotJobHandler {
    pub fn new(
        executor: WorkflowExecutor,
        workflows: Arc<WorkflowCatalog>,
        engine: Arc<AgentEngine>,
        agents: Arc<AgentCatalog>,
    ) -> Self {
        Self {
            executor,
            workflows,
            engine,
            agents,
        }
    }

    async fn handle_workflow(&self, job: &WorkflowJob) -> Result<JobResult> {
        let graph = self.workflows.require(&job.workflow_id)?;
        let execution_id = Uuid::new_v4().to_string();
        let user_id = job.user_id.as_deref();

        let outcome = match &job.resume {
            Some(point) => {
                let ctx = ExecutionContext::from_map(point.context.clone());
                self.executor
                    .resume(
                        &graph,
                        &point.node_id,
                        &point.resume_token,
                        user_id,
                        ctx,
                        Value::Object(job.initial_data.clone()),
                    )
                    .await?
            }
            None => {
                let ctx = ExecutionContext::from_map(job.initial_data.clone());
                self.executor.run(&graph, user_id, ctx).await?
            }
        };

        let result = match outcome {
            WorkflowOutcome::Completed { ctx, records } => {
                info!(workflow_id = %job.workflow_id, %execution_id, nodes = records.len(), "workflow completed");
                JobResult {
                    workflow_id: Some(job.workflow_id.clone()),
                    agent_id: None,
                    execution_id,
                    status: ExecutionStatus::Success,
                    result: Some(ctx.to_value()),
                    error: None,
                    resume: None,
                }
            }
            WorkflowOutcome::Suspended {
                node_id,
                resume_token,
                ctx,
                ..
            } => {
                info!(workflow_id = %job.workflow_id, %execution_id, %node_id, "workflow suspended");
                let context = match ctx.to_value() {
                    Value::Object(map) => map,
                    _ => Default::default(),
                };
                JobResult {
                    workflow_id: Some(job.workflow_id.clone()),
                    agent_id: None,
                    execution_id,
                    status: ExecutionStatus::Suspended,
                    result: None,
                    error: None,
                    resume: Some(ResumePoint {
                        node_id,
                        resume_token,
                        context,
                    }),
                }
            }
        };
        Ok(result)
    }

    async fn handle_agent(&self, job: &AgentJob) -> Result<JobResult> {
        let agent = self.agents.require(&job.agent_id)?;
        let mut request = AgentRunRequest::new(job.triggered_by);
        request.workspace_id = job.workspace_id.clone();
        request.user_id = job.user_id.clone();
        request.user_message = job.message.clone();
        request.additional_context = job.context.clone();
        request.recipient_name = job.recipient_name.clone();

        let run = self.engine.run(&agent, request).await?;
        Ok(JobResult {
            workflow_id: None,
            agent_id: Some(job.agent_id.clone()),
            execution_id: run.run_id.clone(),
            status: ExecutionStatus::Success,
            result: Some(json!({
                "status": run.status,
                "decision": run.eval.decision,
                "content": run.content,
            })),
            error: None,
            resume: None,
        })
    }
}

#[async_trait]
impl JobHandler for PilotJobHandler {
    async fn handle(&self, job: &Job) -> Result<JobResult> {
        match &job.payload {
            JobPayload::Workflow(workflow) => self.handle_workflow(workflow).await,
            JobPayload::Agent(agent) => self.handle_agent(agent).await,
        }
    }
}
