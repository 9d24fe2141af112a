use std::collections::HashMap;
use std::fs;

use serde_json::json;

use agentpilot::workflow::{
    execution_order, Connection, ExecutionContext, NodeRegistry, WorkflowExecutor, WorkflowGraph,
    WorkflowNode,
};
use agentpilot::PilotError;

fn positions(order: &[String]) -> HashMap<&str, usize> {
    order
        .iter()
        .enumerate()
        .map(|(index, id)| (id.as_str(), index))
        .collect()
}

#[test]
fn every_connection_points_forward() {
    // 两层扇出再汇合，外加一个孤立节点
    let ids = ["trigger", "crm", "calendar", "merge", "draft", "review", "notes"];
    let nodes: Vec<WorkflowNode> = ids
        .iter()
        .rev()
        .map(|id| WorkflowNode::new(*id, "set", json!({"values": {}})))
        .collect();
    let connections = vec![
        Connection::new("trigger", "crm"),
        Connection::new("trigger", "calendar"),
        Connection::new("crm", "merge"),
        Connection::new("calendar", "merge"),
        Connection::new("merge", "draft"),
        Connection::new("draft", "review"),
        Connection::new("crm", "draft"),
    ];

    let order = execution_order(&nodes, &connections).unwrap();
    assert_eq!(order.len(), ids.len());
    let at = positions(&order);
    for connection in &connections {
        assert!(
            at[connection.from.as_str()] < at[connection.to.as_str()],
            "{} should run before {}",
            connection.from,
            connection.to
        );
    }
    assert!(at.contains_key("notes"));
}

#[test]
fn cycle_error_is_specific() {
    let nodes = vec![
        WorkflowNode::new("a", "set", json!({})),
        WorkflowNode::new("b", "set", json!({})),
        WorkflowNode::new("c", "set", json!({})),
    ];
    let connections = vec![
        Connection::new("a", "b"),
        Connection::new("b", "c"),
        Connection::new("c", "a"),
    ];
    match execution_order(&nodes, &connections) {
        Err(PilotError::Cycle(members)) => {
            assert_eq!(members.len(), 3);
            assert!(members.contains(&"a".to_string()));
        }
        other => panic!("expected cycle error, got {other:?}"),
    }
}

#[test]
fn graph_validation_rejects_bad_references() {
    let duplicate = WorkflowGraph::from_value(json!({
        "nodes": [{"id": "a", "type": "set"}, {"id": "a", "type": "set"}]
    }));
    assert!(matches!(duplicate, Err(PilotError::Config(_))));

    let dangling = WorkflowGraph::from_value(json!({
        "nodes": [{"id": "a", "type": "set"}],
        "connections": [{"fromNodeId": "a", "toNodeId": "ghost"}]
    }));
    assert!(matches!(dangling, Err(PilotError::Config(_))));
}

#[tokio::test]
async fn graph_file_runs_with_basic_nodes() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("lead.json");
    fs::write(
        &path,
        serde_json::to_string(&json!({
            "id": "lead-followup",
            "nodes": [
                {"id": "check", "type": "condition", "data": {"key": "lead.stage", "equals": "hot", "outputKey": "isHot"}},
                {"id": "note", "type": "template", "data": {"template": "Call {{lead.name}} today", "outputKey": "task"}},
                {"id": "pause", "type": "delay", "data": {"ms": 1}}
            ],
            "connections": [
                {"fromNodeId": "check", "toNodeId": "note"},
                {"fromNodeId": "note", "toNodeId": "pause"}
            ]
        }))?,
    )?;

    let graph = WorkflowGraph::from_path(&path)?;
    let executor = WorkflowExecutor::new(std::sync::Arc::new(NodeRegistry::basic()?));
    let ctx = ExecutionContext::from_value(json!({"lead": {"name": "Dana", "stage": "hot"}}));
    let outcome = executor.run(&graph, Some("user-1"), ctx).await?;

    assert!(!outcome.is_suspended());
    assert_eq!(outcome.context().get("isHot"), Some(&json!(true)));
    assert_eq!(outcome.context().get_str("task"), Some("Call Dana today"));
    let visited: Vec<&str> = outcome.records().iter().map(|r| r.node_id.as_str()).collect();
    assert_eq!(visited, vec!["check", "note", "pause"]);
    Ok(())
}

#[tokio::test]
async fn missing_node_field_is_reported_by_name() -> anyhow::Result<()> {
    let graph = WorkflowGraph::from_value(json!({
        "nodes": [{"id": "render", "type": "template", "data": {"outputKey": "x"}}]
    }))?;
    let executor = WorkflowExecutor::new(std::sync::Arc::new(NodeRegistry::basic()?));
    let err = executor
        .run(&graph, None, ExecutionContext::new())
        .await
        .unwrap_err();
    match err {
        PilotError::MissingField { node, field } => {
            assert_eq!(node, "render");
            assert_eq!(field, "template");
        }
        other => panic!("unexpected error {other:?}"),
    }
    Ok(())
}
