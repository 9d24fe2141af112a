// 任务队列：持久化存储、重试退避、并发 worker 与优雅关闭

pub mod backoff;
pub mod handler;
pub mod job;
#[cfg(feature = "redis-store")]
pub mod redis_store;
pub mod store;
pub mod worker;

pub use backoff::RetryPolicy;
pub use handler::{JobHandler, PilotJobHandler};
pub use job::{
    AgentJob, ExecutionStatus, Job, JobCounts, JobOptions, JobPayload, JobResult, JobStatus,
    ResumePoint, WorkflowJob,
};
#[cfg(feature = "redis-store")]
pub use redis_store::RedisJobStore;
pub use store::{FailOutcome, JobStore, MemoryJobStore, Retention, StalledSweep};
pub use worker::{
    listen_for_os_signals, JobOutcome, ShutdownSignal, Worker, WorkerOptions, WorkerReport,
};
