//! 进程级依赖容器
//!
//! 启动时组装一次 LLM 客户端、评估引擎、agent 引擎、节点注册表与任务队列，
//! 之后以 `Arc` 共享给 worker 与调用方。

use std::sync::Arc;

use tracing::info;

use crate::catalog::{AgentCatalog, WorkflowCatalog};
use crate::config::PilotSettings;
use crate::engine::{AgentEngine, DataFetcher, HookRegistry, NoopFetcher};
use crate::error::Result;
use crate::eval::{EvalEngine, LlmJudge, SafetyJudge};
use crate::llm::{DynChatModel, LlmClient, LocalEchoModel, PricingTable, UsageSink};
use crate::queue::{
    AgentJob, JobOptions, JobPayload, JobStore, MemoryJobStore, PilotJobHandler, Retention,
    RetryPolicy, Worker, WorkerOptions, WorkflowJob,
};
use crate::trace::{NullTraceSink, TraceSink};
use crate::workflow::{BuiltinDeps, NodeExecutor, NodeRegistry, WorkflowExecutor};

pub const DEFAULT_API_BASE: &str = "https://api.openai.com/v1";

/// 共享服务
#[derive(Clone)]
pub struct PilotServices {
    pub settings: Arc<PilotSettings>,
    pub llm: LlmClient,
    pub eval: EvalEngine,
    pub engine: Arc<AgentEngine>,
    pub registry: Arc<NodeRegistry>,
    pub executor: WorkflowExecutor,
    pub store: Arc<dyn JobStore>,
    pub agents: Arc<AgentCatalog>,
    pub workflows: Arc<WorkflowCatalog>,
}

impl PilotServices {
    pub fn builder(settings: PilotSettings) -> PilotServicesBuilder {
        PilotServicesBuilder::new(settings)
    }

    /// 按配置生成入队参数
    pub fn job_options(&self) -> JobOptions {
        JobOptions {
            attempts: self.settings.job_attempts,
            backoff: RetryPolicy {
                initial_ms: self.settings.backoff_initial_ms,
                max_ms: self.settings.backoff_max_ms,
                ..RetryPolicy::default()
            },
            delay_ms: 0,
        }
    }

    pub async fn enqueue_workflow(&self, job: WorkflowJob) -> Result<String> {
        self.workflows.require(&job.workflow_id)?;
        self.store
            .enqueue(JobPayload::Workflow(job), self.job_options())
            .await
    }

    pub async fn enqueue_agent(&self, job: AgentJob) -> Result<String> {
        self.agents.require(&job.agent_id)?;
        self.store
            .enqueue(JobPayload::Agent(job), self.job_options())
            .await
    }

    pub fn job_handler(&self) -> PilotJobHandler {
        PilotJobHandler::new(
            self.executor.clone(),
            self.workflows.clone(),
            self.engine.clone(),
            self.agents.clone(),
        )
    }

    pub fn worker(&self) -> Worker {
        self.worker_with(WorkerOptions::from_settings(&self.settings))
    }

    pub fn worker_with(&self, options: WorkerOptions) -> Worker {
        Worker::new(self.store.clone(), Arc::new(self.job_handler()), options)
    }
}

pub struct PilotServicesBuilder {
    settings: PilotSettings,
    model: Option<DynChatModel>,
    fetcher: Option<Arc<dyn DataFetcher>>,
    trace_sink: Option<Arc<dyn TraceSink>>,
    store: Option<Arc<dyn JobStore>>,
    usage_sink: Option<Arc<dyn UsageSink>>,
    judge: Option<Arc<dyn SafetyJudge>>,
    without_judge: bool,
    hooks: HookRegistry,
    nodes: Vec<Arc<dyn NodeExecutor>>,
    agents: Option<Arc<AgentCatalog>>,
    workflows: Option<Arc<WorkflowCatalog>>,
}

impl PilotServicesBuilder {
    pub fn new(settings: PilotSettings) -> Self {
        Self {
            settings,
            model: None,
            fetcher: None,
            trace_sink: None,
            store: None,
            usage_sink: None,
            judge: None,
            without_judge: false,
            hooks: HookRegistry::default(),
            nodes: Vec::new(),
            agents: None,
            workflows: None,
        }
    }

    pub fn model(mut self, model: DynChatModel) -> Self {
        self.model = Some(model);
        self
    }

    pub fn fetcher(mut self, fetcher: Arc<dyn DataFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn trace_sink(mut self, sink: Arc<dyn TraceSink>) -> Self {
        self.trace_sink = Some(sink);
        self
    }

    pub fn store(mut self, store: Arc<dyn JobStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn usage_sink(mut self, sink: Arc<dyn UsageSink>) -> Self {
        self.usage_sink = Some(sink);
        self
    }

    pub fn judge(mut self, judge: Arc<dyn SafetyJudge>) -> Self {
        self.judge = Some(judge);
        self.without_judge = false;
        self
    }

    /// 不配置 L3 评审者
    pub fn without_judge(mut self) -> Self {
        self.judge = None;
        self.without_judge = true;
        self
    }

    pub fn hooks(mut self, hooks: HookRegistry) -> Self {
        self.hooks = hooks;
        self
    }

    /// 额外的节点执行器，与内置节点一起注册
    pub fn node(mut self, executor: Arc<dyn NodeExecutor>) -> Self {
        self.nodes.push(executor);
        self
    }

    pub fn agents(mut self, agents: Arc<AgentCatalog>) -> Self {
        self.agents = Some(agents);
        self
    }

    pub fn workflows(mut self, workflows: Arc<WorkflowCatalog>) -> Self {
        self.workflows = Some(workflows);
        self
    }

    pub fn build(self) -> Result<PilotServices> {
        self.settings.validate()?;
        let settings = Arc::new(self.settings);

        let model = match self.model {
            Some(model) => model,
            None => default_model(&settings)?,
        };
        let mut llm = LlmClient::new(model)
            .with_pricing(PricingTable::with_models(settings.models.clone()));
        if let Some(sink) = self.usage_sink {
            llm = llm.with_usage_sink(sink);
        }

        let eval = match (self.judge, self.without_judge) {
            (Some(judge), _) => EvalEngine::new(judge),
            (None, true) => EvalEngine::without_judge(),
            (None, false) => EvalEngine::new(Arc::new(LlmJudge::new(llm.clone()))),
        };

        let engine = Arc::new(
            AgentEngine::new(llm.clone(), eval.clone())
                .with_fetcher(self.fetcher.unwrap_or_else(|| Arc::new(NoopFetcher)))
                .with_trace_sink(self.trace_sink.unwrap_or_else(|| Arc::new(NullTraceSink)))
                .with_hooks(self.hooks),
        );

        let agents = self
            .agents
            .unwrap_or_else(|| Arc::new(AgentCatalog::agents()));
        let workflows = self
            .workflows
            .unwrap_or_else(|| Arc::new(WorkflowCatalog::workflows()));

        let mut registry = NodeRegistry::with_builtins(BuiltinDeps {
            llm: llm.clone(),
            engine: engine.clone(),
            agents: agents.clone(),
        })?;
        for node in self.nodes {
            registry.register(node)?;
        }
        let registry = Arc::new(registry);

        let store = match self.store {
            Some(store) => store,
            None => default_store(&settings)?,
        };

        info!(
            backend = llm.backend_name(),
            queue = store.queue_name(),
            judge = eval.has_judge(),
            "services ready"
        );

        Ok(PilotServices {
            executor: WorkflowExecutor::new(registry.clone()),
            settings,
            llm,
            eval,
            engine,
            registry,
            store,
            agents,
            workflows,
        })
    }
}

/// 配置了 API key 时使用 HTTP 后端，否则本地回显
fn default_model(settings: &PilotSettings) -> Result<DynChatModel> {
    #[cfg(feature = "openai-client")]
    if let Some(key) = settings.resolved_api_key()? {
        let base = settings
            .api_base_url
            .clone()
            .unwrap_or_else(|| DEFAULT_API_BASE.to_string());
        let model = crate::llm::HttpChatModel::new(base, key, settings.request_timeout())?;
        return Ok(Arc::new(model));
    }
    #[cfg(not(feature = "openai-client"))]
    if settings.resolved_api_key()?.is_some() {
        tracing::warn!("api key configured but the openai-client feature is disabled, using local echo backend");
    }
    Ok(Arc::new(LocalEchoModel))
}

fn default_store(settings: &PilotSettings) -> Result<Arc<dyn JobStore>> {
    let retention = Retention {
        keep_completed: settings.keep_completed,
        keep_failed: settings.keep_failed,
    };
    #[cfg(feature = "redis-store")]
    if let Some(url) = settings.redis_url.as_deref() {
        let store = crate::queue::RedisJobStore::open(
            url,
            settings.queue_prefix.clone(),
            settings.queue_name.clone(),
        )?
        .with_retention(retention);
        return Ok(Arc::new(store));
    }
    Ok(Arc::new(
        MemoryJobStore::new(settings.queue_name.clone()).with_retention(retention),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentConfig;
    use crate::engine::TriggerSource;

    #[test]
    fn builds_with_defaults() {
        let services = PilotServices::builder(PilotSettings::default())
            .build()
            .unwrap();
        assert_eq!(services.llm.backend_name(), "local-echo");
        assert!(services.eval.has_judge());
        assert!(services.registry.contains("agent"));
        assert!(services.registry.contains("wait_for_event"));
        assert_eq!(services.store.queue_name(), "workflow-execution");
    }

    #[test]
    fn job_options_follow_settings() {
        let settings = PilotSettings {
            job_attempts: 5,
            backoff_initial_ms: 100,
            ..PilotSettings::default()
        };
        let services = PilotServices::builder(settings).without_judge().build().unwrap();
        let options = services.job_options();
        assert_eq!(options.attempts, 5);
        assert_eq!(options.backoff.initial_ms, 100);
        assert!(!services.eval.has_judge());
    }

    #[tokio::test]
    async fn enqueue_rejects_unknown_targets() {
        let services = PilotServices::builder(PilotSettings::default())
            .build()
            .unwrap();
        assert!(services
            .enqueue_agent(AgentJob::new("missing", TriggerSource::Manual))
            .await
            .is_err());

        services
            .agents
            .add(AgentConfig::new("a1", "Agent", "You help."));
        let id = services
            .enqueue_agent(AgentJob::new("a1", TriggerSource::Manual))
            .await
            .unwrap();
        assert!(services.store.get(&id).await.unwrap().is_some());
    }
}
