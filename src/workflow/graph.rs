use std::collections::HashSet;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{PilotError, Result};

/// 工作流图：节点与有向连接
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowGraph {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    pub nodes: Vec<WorkflowNode>,
    #[serde(default)]
    pub connections: Vec<Connection>,
}

/// 图节点
///
/// `type` 选择执行器，`data` 为该类型的配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowNode {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: String,
    #[serde(default)]
    pub data: Value,
}

impl WorkflowNode {
    pub fn new(id: impl Into<String>, node_type: impl Into<String>, data: Value) -> Self {
        Self {
            id: id.into(),
            node_type: node_type.into(),
            data,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    #[serde(rename = "fromNodeId")]
    pub from: String,
    #[serde(rename = "toNodeId")]
    pub to: String,
}

impl Connection {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
        }
    }
}

impl WorkflowGraph {
    pub fn new(nodes: Vec<WorkflowNode>, connections: Vec<Connection>) -> Self {
        Self {
            id: None,
            name: None,
            nodes,
            connections,
        }
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let graph: WorkflowGraph = serde_json::from_str(raw)?;
        graph.validate()?;
        Ok(graph)
    }

    pub fn from_value(value: Value) -> Result<Self> {
        let graph: WorkflowGraph = serde_json::from_value(value)?;
        graph.validate()?;
        Ok(graph)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|err| {
            PilotError::config(format!("failed to read workflow {}: {err}", path.display()))
        })?;
        Self::from_json(&raw)
    }

    /// 节点 id 唯一，连接两端都必须存在
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for node in &self.nodes {
            if node.id.trim().is_empty() {
                return Err(PilotError::config("workflow node id must not be empty"));
            }
            if !seen.insert(node.id.as_str()) {
                return Err(PilotError::config(format!(
                    "duplicate workflow node id `{}`",
                    node.id
                )));
            }
        }
        for connection in &self.connections {
            for end in [&connection.from, &connection.to] {
                if !seen.contains(end.as_str()) {
                    return Err(PilotError::config(format!(
                        "connection {} -> {} references unknown node `{end}`",
                        connection.from, connection.to
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn node(&self, id: &str) -> Option<&WorkflowNode> {
        self.nodes.iter().find(|node| node.id == id)
    }

    pub fn label(&self) -> &str {
        self.id
            .as_deref()
            .or(self.name.as_deref())
            .unwrap_or("workflow")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_camel_case_connections() {
        let graph = WorkflowGraph::from_json(
            r#"{
                "id": "wf-1",
                "nodes": [
                    {"id": "a", "type": "set", "data": {"values": {"x": 1}}},
                    {"id": "b", "type": "template"}
                ],
                "connections": [{"fromNodeId": "a", "toNodeId": "b"}]
            }"#,
        )
        .unwrap();
        assert_eq!(graph.connections, vec![Connection::new("a", "b")]);
        assert_eq!(graph.node("b").unwrap().data, Value::Null);
        assert_eq!(graph.label(), "wf-1");
    }

    #[test]
    fn rejects_duplicates_and_dangling_edges() {
        let dup = WorkflowGraph::new(
            vec![
                WorkflowNode::new("a", "set", Value::Null),
                WorkflowNode::new("a", "set", Value::Null),
            ],
            vec![],
        );
        assert!(matches!(dup.validate(), Err(PilotError::Config(_))));

        let dangling = WorkflowGraph::new(
            vec![WorkflowNode::new("a", "set", Value::Null)],
            vec![Connection::new("a", "ghost")],
        );
        let err = dangling.validate().unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }
}
