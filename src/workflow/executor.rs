use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::context::ExecutionContext;
use super::graph::{WorkflowGraph, WorkflowNode};
use super::sort::topological_sort;
use crate::error::{PilotError, Result};

/// 单个节点的执行结果
#[derive(Clone, Debug, PartialEq)]
pub enum NodeOutcome {
    Continue(ExecutionContext),
    /// 等待外部事件；任务在此结束，事件到达后由新任务续跑
    Suspend {
        resume_token: String,
        ctx: ExecutionContext,
    },
}

/// 节点执行时可见的输入
#[derive(Clone, Copy, Debug)]
pub struct NodeInput<'a> {
    pub node: &'a WorkflowNode,
    pub user_id: Option<&'a str>,
}

impl<'a> NodeInput<'a> {
    pub fn node_id(&self) -> &'a str {
        &self.node.id
    }

    /// 把 `data` 解析为该节点类型的配置
    pub fn config<T: DeserializeOwned>(&self) -> Result<T> {
        parse_node_config(self.node)
    }
}

pub fn parse_node_config<T: DeserializeOwned>(node: &WorkflowNode) -> Result<T> {
    let data = match &node.data {
        Value::Null => Value::Object(Default::default()),
        other => other.clone(),
    };
    serde_json::from_value(data).map_err(|err| {
        let message = err.to_string();
        match missing_field(&message) {
            Some(field) => PilotError::MissingField {
                node: node.id.clone(),
                field,
            },
            None => PilotError::config(format!("node `{}` has invalid data: {message}", node.id)),
        }
    })
}

fn missing_field(message: &str) -> Option<String> {
    let rest = message.strip_prefix("missing field `")?;
    let end = rest.find('`')?;
    Some(rest[..end].to_string())
}

/// 节点执行器
#[async_trait]
pub trait NodeExecutor: Send + Sync {
    fn node_type(&self) -> &str;

    async fn execute(&self, input: NodeInput<'_>, ctx: ExecutionContext) -> Result<NodeOutcome>;
}

/// 节点类型到执行器的映射，在启动时一次性组装
#[derive(Clone, Default)]
pub struct NodeRegistry {
    executors: HashMap<String, Arc<dyn NodeExecutor>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, executor: Arc<dyn NodeExecutor>) -> Result<()> {
        let node_type = executor.node_type().to_string();
        if self.executors.contains_key(&node_type) {
            return Err(PilotError::config(format!(
                "node executor `{node_type}` registered twice"
            )));
        }
        self.executors.insert(node_type, executor);
        Ok(())
    }

    pub fn with(mut self, executor: Arc<dyn NodeExecutor>) -> Result<Self> {
        self.register(executor)?;
        Ok(self)
    }

    pub fn get(&self, node_type: &str) -> Result<Arc<dyn NodeExecutor>> {
        self.executors
            .get(node_type)
            .cloned()
            .ok_or_else(|| PilotError::UnknownNodeType(node_type.to_string()))
    }

    pub fn contains(&self, node_type: &str) -> bool {
        self.executors.contains_key(node_type)
    }
}

/// 每个节点的执行记录
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub node_id: String,
    pub node_type: String,
    pub duration_ms: u64,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum WorkflowOutcome {
    Completed {
        ctx: ExecutionContext,
        records: Vec<NodeRecord>,
    },
    Suspended {
        node_id: String,
        resume_token: String,
        ctx: ExecutionContext,
        records: Vec<NodeRecord>,
    },
}

impl WorkflowOutcome {
    pub fn context(&self) -> &ExecutionContext {
        match self {
            WorkflowOutcome::Completed { ctx, .. } | WorkflowOutcome::Suspended { ctx, .. } => ctx,
        }
    }

    pub fn records(&self) -> &[NodeRecord] {
        match self {
            WorkflowOutcome::Completed { records, .. }
            | WorkflowOutcome::Suspended { records, .. } => records,
        }
    }

    pub fn is_suspended(&self) -> bool {
        matches!(self, WorkflowOutcome::Suspended { .. })
    }
}

/// 工作流执行器
#[derive(Clone)]
pub struct WorkflowExecutor {
    registry: Arc<NodeRegistry>,
    /// 已使用的恢复令牌，克隆之间共享
    consumed: Arc<Mutex<HashSet<String>>>,
}

impl WorkflowExecutor {
    pub fn new(registry: Arc<NodeRegistry>) -> Self {
        Self {
            registry,
            consumed: Arc::default(),
        }
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    /// 排序并检查所有节点类型都已注册，任何节点运行之前完成
    pub fn plan<'a>(&self, graph: &'a WorkflowGraph) -> Result<Vec<&'a WorkflowNode>> {
        graph.validate()?;
        let order = topological_sort(&graph.nodes, &graph.connections)?;
        for node in &order {
            if !self.registry.contains(&node.node_type) {
                return Err(PilotError::UnknownNodeType(node.node_type.clone()));
            }
        }
        Ok(order)
    }

    pub async fn run(
        &self,
        graph: &WorkflowGraph,
        user_id: Option<&str>,
        ctx: ExecutionContext,
    ) -> Result<WorkflowOutcome> {
        let order = self.plan(graph)?;
        info!(workflow = graph.label(), nodes = order.len(), "workflow started");
        self.run_nodes(graph, &order, user_id, ctx).await
    }

    /// 从挂起节点之后继续，外部事件数据合并进上下文
    /// 从挂起节点之后继续；令牌必须与挂起时写入上下文的一致，且只能使用一次
    pub async fn resume(
        &self,
        graph: &WorkflowGraph,
        node_id: &str,
        resume_token: &str,
        user_id: Option<&str>,
        ctx: ExecutionContext,
        event_data: Value,
    ) -> Result<WorkflowOutcome> {
        let order = self.plan(graph)?;
        let position = order
            .iter()
            .position(|node| node.id == node_id)
            .ok_or_else(|| {
                PilotError::config(format!(
                    "cannot resume workflow `{}`: unknown node `{node_id}`",
                    graph.label()
                ))
            })?;
        let awaiting = (
            ctx.lookup("awaiting_event.nodeId").and_then(Value::as_str),
            ctx.lookup("awaiting_event.resumeToken").and_then(Value::as_str),
        );
        if awaiting != (Some(node_id), Some(resume_token)) {
            return Err(PilotError::config(format!(
                "cannot resume workflow `{}` at `{node_id}`: resume token does not match",
                graph.label()
            )));
        }
        if !self.consumed.lock().insert(resume_token.to_string()) {
            return Err(PilotError::config(format!(
                "cannot resume workflow `{}` at `{node_id}`: resume token already used",
                graph.label()
            )));
        }

        let ctx = ctx.without("awaiting_event");
        let ctx = match event_data {
            Value::Object(map) => ctx.merged(map),
            Value::Null => ctx,
            other => ctx.with("event", other),
        };
        info!(workflow = graph.label(), node_id, "workflow resumed");
        let outcome = self
            .run_nodes(graph, &order[position + 1..], user_id, ctx)
            .await;
        if outcome.is_err() {
            // 失败的续跑可以重试
            self.consumed.lock().remove(resume_token);
        }
        outcome
    }

    async fn run_nodes(
        &self,
        graph: &WorkflowGraph,
        nodes: &[&WorkflowNode],
        user_id: Option<&str>,
        mut ctx: ExecutionContext,
    ) -> Result<WorkflowOutcome> {
        let mut records = Vec::with_capacity(nodes.len());
        for node in nodes {
            let executor = self.registry.get(&node.node_type)?;
            let started = Instant::now();
            debug!(node_id = %node.id, node_type = %node.node_type, "node started");
            let outcome = executor
                .execute(NodeInput { node, user_id }, ctx.clone())
                .await;
            let duration_ms = started.elapsed().as_millis() as u64;

            match outcome {
                Ok(NodeOutcome::Continue(next)) => {
                    records.push(NodeRecord {
                        node_id: node.id.clone(),
                        node_type: node.node_type.clone(),
                        duration_ms,
                        ok: true,
                        error: None,
                    });
                    ctx = next;
                }
                Ok(NodeOutcome::Suspend { resume_token, ctx }) => {
                    records.push(NodeRecord {
                        node_id: node.id.clone(),
                        node_type: node.node_type.clone(),
                        duration_ms,
                        ok: true,
                        error: None,
                    });
                    info!(
                        workflow = graph.label(),
                        node_id = %node.id,
                        "workflow suspended awaiting external event"
                    );
                    return Ok(WorkflowOutcome::Suspended {
                        node_id: node.id.clone(),
                        resume_token,
                        ctx,
                        records,
                    });
                }
                Err(err) => {
                    warn!(
                        workflow = graph.label(),
                        node_id = %node.id,
                        node_type = %node.node_type,
                        duration_ms,
                        error = %err,
                        "node failed"
                    );
                    return Err(match err {
                        PilotError::Node { .. }
                        | PilotError::MissingField { .. }
                        | PilotError::Config(_)
                        | PilotError::Serialization(_)
                        | PilotError::Llm(_)
                        | PilotError::Execution(_) => err,
                        other => PilotError::Node {
                            node: node.id.clone(),
                            message: other.to_string(),
                        },
                    });
                }
            }
        }
        info!(workflow = graph.label(), nodes = records.len(), "workflow completed");
        Ok(WorkflowOutcome::Completed { ctx, records })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::graph::Connection;
    use parking_lot::Mutex;
    use serde_json::json;

    struct Recording {
        seen: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl NodeExecutor for Recording {
        fn node_type(&self) -> &str {
            "record"
        }

        async fn execute(&self, input: NodeInput<'_>, ctx: ExecutionContext) -> Result<NodeOutcome> {
            self.seen.lock().push(input.node_id().to_string());
            let count = ctx.get("count").and_then(Value::as_u64).unwrap_or(0);
            Ok(NodeOutcome::Continue(ctx.with("count", json!(count + 1))))
        }
    }

    #[derive(Deserialize)]
    struct Needs {
        #[allow(dead_code)]
        target: String,
    }

    #[test]
    fn missing_field_is_reported_by_name() {
        let node = WorkflowNode::new("n1", "x", json!({}));
        let err = parse_node_config::<Needs>(&node).err().unwrap();
        assert!(matches!(
            err,
            PilotError::MissingField { ref node, ref field } if node == "n1" && field == "target"
        ));
    }

    #[tokio::test]
    async fn unknown_type_fails_before_any_node_runs() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let registry = NodeRegistry::new()
            .with(Arc::new(Recording { seen: seen.clone() }))
            .unwrap();
        let executor = WorkflowExecutor::new(Arc::new(registry));
        let graph = WorkflowGraph::new(
            vec![
                WorkflowNode::new("a", "record", Value::Null),
                WorkflowNode::new("b", "send_fax", Value::Null),
            ],
            vec![Connection::new("a", "b")],
        );
        let err = executor
            .run(&graph, None, ExecutionContext::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PilotError::UnknownNodeType(ref t) if t == "send_fax"));
        assert!(seen.lock().is_empty());
    }

    #[tokio::test]
    async fn context_threads_through_sorted_nodes() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let registry = NodeRegistry::new()
            .with(Arc::new(Recording { seen: seen.clone() }))
            .unwrap();
        let executor = WorkflowExecutor::new(Arc::new(registry));
        let graph = WorkflowGraph::new(
            vec![
                WorkflowNode::new("c", "record", Value::Null),
                WorkflowNode::new("b", "record", Value::Null),
                WorkflowNode::new("a", "record", Value::Null),
            ],
            vec![Connection::new("a", "b"), Connection::new("b", "c")],
        );
        let outcome = executor
            .run(&graph, Some("user-1"), ExecutionContext::new())
            .await
            .unwrap();
        assert_eq!(*seen.lock(), vec!["a", "b", "c"]);
        assert_eq!(outcome.context().get("count"), Some(&json!(3)));
        assert_eq!(outcome.records().len(), 3);
        assert!(!outcome.is_suspended());
    }
}
