use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use agentpilot::config::PilotSettings;
use agentpilot::queue::{
    ExecutionStatus, Job, JobHandler, JobOptions, JobPayload, JobStatus, JobStore, MemoryJobStore,
    WorkerOptions, WorkflowJob,
};
use agentpilot::workflow::{ExecutionContext, NodeExecutor, NodeInput, NodeOutcome, WorkflowGraph};
use agentpilot::{LlmError, PilotError, PilotServices, Result, TriggerSource};

/// 前若干次调用返回可重试错误
struct FlakyNode {
    failures: u32,
    calls: AtomicU32,
}

#[async_trait]
impl NodeExecutor for FlakyNode {
    fn node_type(&self) -> &str {
        "flaky"
    }

    async fn execute(&self, _input: NodeInput<'_>, ctx: ExecutionContext) -> Result<NodeOutcome> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.failures {
            return Err(PilotError::Llm(LlmError::Network("connection reset".into())));
        }
        Ok(NodeOutcome::Continue(ctx.with("flaky_calls", json!(call))))
    }
}

fn settings() -> PilotSettings {
    PilotSettings {
        job_attempts: 3,
        backoff_initial_ms: 20,
        backoff_max_ms: 50,
        ..PilotSettings::default()
    }
}

fn worker_options() -> WorkerOptions {
    WorkerOptions {
        id: "it-worker".into(),
        concurrency: 2,
        lock_duration: Duration::from_secs(5),
        stalled_interval: Duration::from_secs(5),
        poll_interval: Duration::from_millis(10),
        grace_period: Duration::from_secs(1),
    }
}

fn services(flaky_failures: u32) -> (PilotServices, Arc<FlakyNode>) {
    let flaky = Arc::new(FlakyNode {
        failures: flaky_failures,
        calls: AtomicU32::new(0),
    });
    let services = PilotServices::builder(settings())
        .store(Arc::new(MemoryJobStore::new("it-queue")))
        .without_judge()
        .node(flaky.clone())
        .build()
        .expect("services build");
    (services, flaky)
}

fn add_workflow(services: &PilotServices, id: &str, graph: Value) {
    let graph = WorkflowGraph::from_value(graph).expect("valid graph");
    services.workflows.insert(id, graph);
}

async fn wait_finished(store: &dyn JobStore, id: &str) -> Job {
    for _ in 0..200 {
        if let Some(job) = store.get(id).await.expect("store get") {
            if job.is_finished() {
                return job;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job {id} did not finish in time");
}

fn data(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

#[tokio::test]
async fn workflow_job_runs_nodes_in_dependency_order() -> anyhow::Result<()> {
    let (services, _) = services(0);
    add_workflow(
        &services,
        "greet",
        json!({
            "nodes": [
                {"id": "render", "type": "template", "data": {"template": "Hello {{name}} from {{team}}"}},
                {"id": "defaults", "type": "set", "data": {"values": {"team": "Sales"}}}
            ],
            "connections": [{"fromNodeId": "defaults", "toNodeId": "render"}]
        }),
    );

    let worker = services.worker_with(worker_options());
    let shutdown = worker.shutdown_signal();
    let running = tokio::spawn(worker.run());

    let id = services
        .enqueue_workflow(
            WorkflowJob::new("greet", TriggerSource::Webhook).with_data(data(json!({"name": "Dana"}))),
        )
        .await?;
    let job = wait_finished(services.store.as_ref(), &id).await;

    shutdown.trigger();
    let report = running.await??;
    assert_eq!(report.completed, 1);

    assert_eq!(job.status, JobStatus::Completed);
    let result = job.result.expect("job result");
    assert_eq!(result.status, ExecutionStatus::Success);
    assert_eq!(result.workflow_id.as_deref(), Some("greet"));
    assert_eq!(result.result.unwrap()["output"], "Hello Dana from Sales");
    Ok(())
}

#[tokio::test]
async fn suspended_workflow_resumes_from_event() -> anyhow::Result<()> {
    let (services, _) = services(0);
    add_workflow(
        &services,
        "approval",
        json!({
            "nodes": [
                {"id": "draft", "type": "set", "data": {"values": {"draft": "Renewal offer"}}},
                {"id": "wait", "type": "wait_for_event", "data": {"event": "manager_reply"}},
                {"id": "final", "type": "template", "data": {"template": "{{draft}}: {{reply}}", "outputKey": "summary"}}
            ],
            "connections": [
                {"fromNodeId": "draft", "toNodeId": "wait"},
                {"fromNodeId": "wait", "toNodeId": "final"}
            ]
        }),
    );
    let handler = services.job_handler();

    let first = Job::new(
        "j1",
        "it-queue",
        JobPayload::Workflow(WorkflowJob::new("approval", TriggerSource::Manual)),
        JobOptions::default(),
    );
    let suspended = handler.handle(&first).await?;
    assert_eq!(suspended.status, ExecutionStatus::Suspended);
    let point = suspended.resume.expect("resume point");
    assert_eq!(point.node_id, "wait");
    assert_eq!(point.context["awaiting_event"]["resumeToken"], point.resume_token.as_str());

    let mut forged = point.clone();
    forged.resume_token = "guessed".into();
    let forged = Job::new(
        "j-forged",
        "it-queue",
        JobPayload::Workflow(WorkflowJob::new("approval", TriggerSource::Webhook).resuming(forged)),
        JobOptions::default(),
    );
    let err = handler.handle(&forged).await.unwrap_err();
    assert!(!err.is_retryable());

    let resume_job = |id: &str| {
        Job::new(
            id,
            "it-queue",
            JobPayload::Workflow(
                WorkflowJob::new("approval", TriggerSource::Webhook)
                    .with_data(data(json!({"reply": "approved"})))
                    .resuming(point.clone()),
            ),
            JobOptions::default(),
        )
    };
    let finished = handler.handle(&resume_job("j2")).await?;
    assert_eq!(finished.status, ExecutionStatus::Success);
    let output = finished.result.unwrap();
    assert_eq!(output["summary"], "Renewal offer: approved");
    assert!(output.get("awaiting_event").is_none());

    // 同一事件重复投递不会再跑一遍后续节点
    let replay = services.job_handler().handle(&resume_job("j3")).await.unwrap_err();
    assert!(!replay.is_retryable());
    assert!(replay.to_string().contains("already used"));
    Ok(())
}

#[tokio::test]
async fn transient_node_failures_are_retried_with_backoff() -> anyhow::Result<()> {
    let (services, flaky) = services(2);
    add_workflow(
        &services,
        "flaky",
        json!({"nodes": [{"id": "f", "type": "flaky"}]}),
    );

    let worker = services.worker_with(worker_options());
    let shutdown = worker.shutdown_signal();
    let running = tokio::spawn(worker.run());

    let id = services
        .enqueue_workflow(WorkflowJob::new("flaky", TriggerSource::Cron))
        .await?;
    let job = wait_finished(services.store.as_ref(), &id).await;
    shutdown.trigger();
    let report = running.await??;

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.attempts_made, 2);
    assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
    assert_eq!(report.retried, 2);
    assert_eq!(report.completed, 1);
    Ok(())
}

#[tokio::test]
async fn exhausted_attempts_leave_failed_job() -> anyhow::Result<()> {
    let (services, flaky) = services(10);
    add_workflow(
        &services,
        "flaky",
        json!({"nodes": [{"id": "f", "type": "flaky"}]}),
    );

    let worker = services.worker_with(worker_options());
    let shutdown = worker.shutdown_signal();
    let running = tokio::spawn(worker.run());

    let id = services
        .enqueue_workflow(WorkflowJob::new("flaky", TriggerSource::Cron))
        .await?;
    let job = wait_finished(services.store.as_ref(), &id).await;
    shutdown.trigger();
    running.await??;

    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempts_made, 3);
    assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
    assert!(job.last_error.unwrap().contains("connection reset"));
    assert_eq!(services.store.counts().await?.failed, 1);
    Ok(())
}

#[tokio::test]
async fn configuration_errors_fail_without_retry() -> anyhow::Result<()> {
    let (services, _) = services(0);
    add_workflow(
        &services,
        "broken",
        json!({"nodes": [
            {"id": "a", "type": "set", "data": {"values": {}}},
            {"id": "b", "type": "send_fax"}
        ]}),
    );
    add_workflow(
        &services,
        "loop",
        json!({
            "nodes": [{"id": "a", "type": "set", "data": {"values": {}}}, {"id": "b", "type": "set", "data": {"values": {}}}],
            "connections": [{"fromNodeId": "a", "toNodeId": "b"}, {"fromNodeId": "b", "toNodeId": "a"}]
        }),
    );

    let worker = services.worker_with(worker_options());
    let shutdown = worker.shutdown_signal();
    let running = tokio::spawn(worker.run());

    let unknown = services
        .enqueue_workflow(WorkflowJob::new("broken", TriggerSource::Manual))
        .await?;
    let cyclic = services
        .enqueue_workflow(WorkflowJob::new("loop", TriggerSource::Manual))
        .await?;
    let unknown = wait_finished(services.store.as_ref(), &unknown).await;
    let cyclic = wait_finished(services.store.as_ref(), &cyclic).await;
    shutdown.trigger();
    running.await??;

    assert_eq!(unknown.status, JobStatus::Failed);
    assert_eq!(unknown.attempts_made, 1);
    assert!(unknown.last_error.unwrap().contains("send_fax"));
    assert_eq!(cyclic.attempts_made, 1);
    assert!(cyclic.last_error.unwrap().contains("contains a cycle"));
    Ok(())
}

#[tokio::test]
async fn stalled_job_is_picked_up_by_another_worker() -> anyhow::Result<()> {
    let (services, _) = services(0);
    add_workflow(
        &services,
        "greet",
        json!({"nodes": [{"id": "s", "type": "set", "data": {"values": {"done": true}}}]}),
    );
    let id = services
        .enqueue_workflow(WorkflowJob::new("greet", TriggerSource::Manual))
        .await?;

    // 领取后不处理，模拟崩溃的 worker
    let abandoned = services
        .store
        .claim("crashed-worker", Duration::from_millis(20))
        .await?
        .expect("job claimed");
    assert_eq!(abandoned.id, id);
    tokio::time::sleep(Duration::from_millis(40)).await;

    let worker = services.worker_with(WorkerOptions {
        stalled_interval: Duration::from_millis(20),
        ..worker_options()
    });
    let shutdown = worker.shutdown_signal();
    let running = tokio::spawn(worker.run());
    let job = wait_finished(services.store.as_ref(), &id).await;
    shutdown.trigger();
    running.await??;

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.attempts_made, 1);
    assert_eq!(job.result.unwrap().result.unwrap()["done"], true);
    Ok(())
}

#[tokio::test]
async fn agent_job_records_decision_in_result() -> anyhow::Result<()> {
    let (services, _) = services(0);
    services.agents.add(agentpilot::AgentConfig::new(
        "digest",
        "Digest",
        "Summarise the day.",
    ));

    let worker = services.worker_with(worker_options());
    let shutdown = worker.shutdown_signal();
    let running = tokio::spawn(worker.run());

    let mut job = agentpilot::queue::AgentJob::new("digest", TriggerSource::Cron);
    job.message = Some("What happened today?".into());
    let id = services.enqueue_agent(job).await?;
    let job = wait_finished(services.store.as_ref(), &id).await;
    shutdown.trigger();
    running.await??;

    let result = job.result.expect("job result");
    assert_eq!(result.status, ExecutionStatus::Success);
    assert_eq!(result.agent_id.as_deref(), Some("digest"));
    let body = result.result.expect("agent output");
    // review 级别且没有评审者时按拦截处理
    assert_eq!(body["decision"], "blocked");
    assert!(body["content"].as_str().unwrap_or_default().contains("What happened today?"));
    Ok(())
}
