// 运行追踪：步骤、聚合指标、最终状态

pub mod sink;
pub mod tracer;

pub use sink::{MemoryTraceSink, NullTraceSink, TraceSink};
pub use tracer::{AgentTrace, AgentTracer, RunStatus, StepKind, TraceMetrics, TraceStep};
