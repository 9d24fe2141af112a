use std::collections::{HashMap, HashSet, VecDeque};

use super::graph::{Connection, WorkflowNode};
use crate::error::{PilotError, Result};

/// 拓扑排序，返回可执行顺序
///
/// 没有连接时按列出顺序返回；孤立节点保留在结果中。
/// 存在环时返回 `PilotError::Cycle`，携带环上的节点。
pub fn topological_sort<'a>(
    nodes: &'a [WorkflowNode],
    connections: &[Connection],
) -> Result<Vec<&'a WorkflowNode>> {
    if connections.is_empty() {
        return Ok(nodes.iter().collect());
    }

    let index: HashMap<&str, usize> = nodes
        .iter()
        .enumerate()
        .map(|(i, node)| (node.id.as_str(), i))
        .collect();

    let mut outgoing: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
    let mut incoming: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
    let mut in_degree = vec![0usize; nodes.len()];
    let mut seen_edges = HashSet::new();

    for connection in connections {
        let (Some(&from), Some(&to)) = (
            index.get(connection.from.as_str()),
            index.get(connection.to.as_str()),
        ) else {
            return Err(PilotError::config(format!(
                "connection {} -> {} references an unknown node",
                connection.from, connection.to
            )));
        };
        if !seen_edges.insert((from, to)) {
            continue;
        }
        outgoing[from].push(to);
        incoming[to].push(from);
        in_degree[to] += 1;
    }

    let mut ready: VecDeque<usize> = (0..nodes.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(nodes.len());
    while let Some(current) = ready.pop_front() {
        order.push(current);
        for &next in &outgoing[current] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                ready.push_back(next);
            }
        }
    }

    if order.len() < nodes.len() {
        let cycle = find_cycle(&in_degree, &incoming)
            .into_iter()
            .map(|i| nodes[i].id.clone())
            .collect();
        return Err(PilotError::Cycle(cycle));
    }

    Ok(order.into_iter().map(|i| &nodes[i]).collect())
}

/// 排序后剩余的节点都至少有一条来自剩余节点的入边，沿入边回溯必然回到某个已访问节点
fn find_cycle(in_degree: &[usize], incoming: &[Vec<usize>]) -> Vec<usize> {
    let remaining = |i: usize| in_degree[i] > 0;
    let Some(start) = (0..in_degree.len()).find(|&i| remaining(i)) else {
        return Vec::new();
    };

    let mut path = vec![start];
    let mut position: HashMap<usize, usize> = HashMap::from([(start, 0)]);
    let mut current = start;
    loop {
        let Some(&prev) = incoming[current].iter().find(|&&p| remaining(p)) else {
            return path;
        };
        if let Some(&at) = position.get(&prev) {
            let mut cycle: Vec<usize> = path[at..].to_vec();
            cycle.reverse();
            return cycle;
        }
        position.insert(prev, path.len());
        path.push(prev);
        current = prev;
    }
}

/// 只返回节点 id 的便捷版本
pub fn execution_order(nodes: &[WorkflowNode], connections: &[Connection]) -> Result<Vec<String>> {
    Ok(topological_sort(nodes, connections)?
        .into_iter()
        .map(|node| node.id.clone())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn nodes(ids: &[&str]) -> Vec<WorkflowNode> {
        ids.iter()
            .map(|id| WorkflowNode::new(*id, "set", Value::Null))
            .collect()
    }

    fn position(order: &[String], id: &str) -> usize {
        order.iter().position(|n| n == id).unwrap()
    }

    #[test]
    fn no_connections_keeps_listed_order() {
        let order = execution_order(&nodes(&["c", "a", "b"]), &[]).unwrap();
        assert_eq!(order, vec!["c", "a", "b"]);
    }

    #[test]
    fn isolated_nodes_are_kept() {
        let order = execution_order(&nodes(&["A", "B", "C"]), &[Connection::new("A", "B")]).unwrap();
        assert_eq!(order.len(), 3);
        assert!(position(&order, "A") < position(&order, "B"));
        assert!(order.contains(&"C".to_string()));
    }

    #[test]
    fn three_node_cycle_is_reported() {
        let err = execution_order(
            &nodes(&["A", "B", "C"]),
            &[
                Connection::new("A", "B"),
                Connection::new("B", "C"),
                Connection::new("C", "A"),
            ],
        )
        .unwrap_err();
        match err {
            PilotError::Cycle(members) => {
                let mut members = members;
                members.sort();
                assert_eq!(members, vec!["A", "B", "C"]);
            }
            other => panic!("expected cycle error, got {other:?}"),
        }
    }

    #[test]
    fn cycle_members_exclude_downstream_nodes() {
        let err = execution_order(
            &nodes(&["start", "x", "y", "tail"]),
            &[
                Connection::new("start", "x"),
                Connection::new("x", "y"),
                Connection::new("y", "x"),
                Connection::new("y", "tail"),
            ],
        )
        .unwrap_err();
        let PilotError::Cycle(mut members) = err else {
            panic!("expected cycle error");
        };
        members.sort();
        assert_eq!(members, vec!["x", "y"]);
        assert!(PilotError::Cycle(members).to_string().contains("contains a cycle"));
    }

    #[test]
    fn self_loop_is_a_cycle() {
        let err = execution_order(&nodes(&["a"]), &[Connection::new("a", "a")]).unwrap_err();
        assert!(matches!(err, PilotError::Cycle(ref m) if m == &vec!["a".to_string()]));
    }

    #[test]
    fn diamond_respects_every_edge() {
        let edges = vec![
            Connection::new("a", "b"),
            Connection::new("a", "c"),
            Connection::new("b", "d"),
            Connection::new("c", "d"),
            Connection::new("a", "b"),
        ];
        let order = execution_order(&nodes(&["d", "c", "b", "a"]), &edges).unwrap();
        assert_eq!(order.len(), 4);
        for edge in &edges {
            assert!(position(&order, &edge.from) < position(&order, &edge.to));
        }
    }
}
