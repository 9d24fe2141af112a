// 工作流：图定义、拓扑排序、节点执行与挂起/恢复

pub mod builtin;
pub mod context;
pub mod executor;
pub mod graph;
pub mod sort;

pub use builtin::{
    AgentNode, BuiltinDeps, ConditionNode, DelayNode, LlmNode, SetNode, TemplateNode,
    WaitForEventNode,
};
pub use context::ExecutionContext;
pub use executor::{
    parse_node_config, NodeExecutor, NodeInput, NodeOutcome, NodeRecord, NodeRegistry,
    WorkflowExecutor, WorkflowOutcome,
};
pub use graph::{Connection, WorkflowGraph, WorkflowNode};
pub use sort::{execution_order, topological_sort};
