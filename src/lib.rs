pub mod catalog;
pub mod config;
pub mod engine;
pub mod error;
pub mod eval;
pub mod llm;
pub mod queue;
pub mod service;
pub mod tools;
pub mod trace;
pub mod utils;
pub mod workflow;

pub use catalog::{AgentCatalog, Catalog, WorkflowCatalog};
pub use config::{AgentConfig, EnvConfig, FetchSource, PilotSettings};
pub use engine::{
    AgentEngine, AgentHook, AgentRunRequest, AgentRunResult, DataFetcher, HookFailurePolicy,
    HookRegistry, SourceData, TriggerSource,
};
pub use error::{ExecutionError, LlmError, PilotError, Result};
pub use eval::{Decision, EvalContext, EvalEngine, EvalResult, EvalRules, SafetyJudge};
pub use llm::{ChatModel, LlmClient, LlmRequest, LlmRun, LocalEchoModel, ModelTier, PricingTable};
pub use queue::{
    JobHandler, JobOptions, JobPayload, JobResult, JobStore, MemoryJobStore, ShutdownSignal,
    Worker, WorkerOptions,
};
pub use service::{PilotServices, PilotServicesBuilder};
pub use tools::{Tool, ToolRegistry};
pub use trace::{AgentTrace, AgentTracer, RunStatus, TraceSink};
pub use utils::{logging, validation};
pub use workflow::{
    ExecutionContext, NodeExecutor, NodeOutcome, NodeRegistry, WorkflowExecutor, WorkflowGraph,
    WorkflowOutcome,
};
