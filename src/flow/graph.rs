//! Flow graph types and structural validation (§4.J).

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, FlowError, Result};
use crate::flow::node::Node;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphNode {
    pub id: String,
    #[serde(default)]
    pub muted: bool,
    #[serde(flatten)]
    pub data: Node,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    pub id: String,
    pub from_node: String,
    #[serde(default)]
    pub from_port: Option<String>,
    pub to_node: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Graph {
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<Edge>,
}

impl Graph {
    pub fn node(&self, id: &str) -> Option<&GraphNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn start_node(&self) -> Option<&GraphNode> {
        self.nodes.iter().find(|n| matches!(n.data, Node::Start(_)))
    }

    /// Outgoing edges for `node_id`, in declaration order.
    pub fn outgoing(&self, node_id: &str) -> Vec<&Edge> {
        self.edges.iter().filter(|e| e.from_node == node_id).collect()
    }

    /// Rejects dangling/unknown node references and graphs without
    /// exactly one Start node.
    pub fn validate(&self) -> Result<()> {
        let ids: HashSet<&str> = self.nodes.iter().map(|n| n.id.as_str()).collect();
        if ids.len() != self.nodes.len() {
            return Err(FlowError::InvalidGraph("duplicate node id".to_string()).into());
        }

        let start_count = self.nodes.iter().filter(|n| matches!(n.data, Node::Start(_))).count();
        if start_count != 1 {
            return Err(FlowError::InvalidGraph(format!("graph must have exactly one Start node, found {start_count}")).into());
        }

        for edge in &self.edges {
            if !ids.contains(edge.from_node.as_str()) {
                return Err(FlowError::InvalidGraph(format!("edge {} references unknown source node {}", edge.id, edge.from_node)).into());
            }
            if !ids.contains(edge.to_node.as_str()) {
                return Err(FlowError::InvalidGraph(format!("edge {} references unknown target node {}", edge.id, edge.to_node)).into());
            }
        }

        Ok(())
    }

    /// Picks the next edge out of `node_id`: a `next_port` match, a
    /// preferred edge id, the first port-less edge, or the first edge.
    pub fn select_next_edge(&self, node_id: &str, next_port: Option<&str>, preferred_edge_id: Option<&str>) -> Option<&Edge> {
        let outgoing = self.outgoing(node_id);
        if let Some(preferred) = preferred_edge_id {
            if let Some(edge) = outgoing.iter().find(|e| e.id == preferred) {
                return Some(edge);
            }
        }
        if let Some(port) = next_port {
            if let Some(edge) = outgoing.iter().find(|e| e.from_port.as_deref() == Some(port)) {
                return Some(edge);
            }
        }
        outgoing
            .iter()
            .find(|e| e.from_port.is_none())
            .or_else(|| outgoing.first())
            .copied()
    }
}

pub fn ensure_not_revisited(visited: &mut HashSet<String>, node_id: &str) -> Result<()> {
    if !visited.insert(node_id.to_string()) {
        return Err(CoreError::Flow(FlowError::Cycle(node_id.to_string())));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::node::{EndData, StartData};

    fn graph_with(nodes: Vec<GraphNode>, edges: Vec<Edge>) -> Graph {
        Graph { nodes, edges }
    }

    #[test]
    fn validate_rejects_dangling_edge() {
        let g = graph_with(
            vec![GraphNode {
                id: "start".into(),
                muted: false,
                data: Node::Start(StartData::default()),
            }],
            vec![Edge {
                id: "e1".into(),
                from_node: "start".into(),
                from_port: None,
                to_node: "missing".into(),
            }],
        );
        assert!(g.validate().is_err());
    }

    #[test]
    fn validate_rejects_multiple_start_nodes() {
        let g = graph_with(
            vec![
                GraphNode { id: "s1".into(), muted: false, data: Node::Start(StartData::default()) },
                GraphNode { id: "s2".into(), muted: false, data: Node::Start(StartData::default()) },
            ],
            vec![],
        );
        assert!(g.validate().is_err());
    }

    #[test]
    fn validate_accepts_well_formed_graph() {
        let g = graph_with(
            vec![
                GraphNode { id: "start".into(), muted: false, data: Node::Start(StartData::default()) },
                GraphNode { id: "end".into(), muted: false, data: Node::End(EndData::default()) },
            ],
            vec![Edge { id: "e1".into(), from_node: "start".into(), from_port: None, to_node: "end".into() }],
        );
        assert!(g.validate().is_ok());
    }

    #[test]
    fn select_next_edge_prefers_matching_port() {
        let g = graph_with(
            vec![],
            vec![
                Edge { id: "e-pass".into(), from_node: "n".into(), from_port: Some("pass".into()), to_node: "a".into() },
                Edge { id: "e-fail".into(), from_node: "n".into(), from_port: Some("fail".into()), to_node: "b".into() },
            ],
        );
        let edge = g.select_next_edge("n", Some("fail"), None).unwrap();
        assert_eq!(edge.to_node, "b");
    }

    #[test]
    fn ensure_not_revisited_fails_on_second_visit() {
        let mut visited = HashSet::new();
        ensure_not_revisited(&mut visited, "a").unwrap();
        assert!(ensure_not_revisited(&mut visited, "a").is_err());
    }
}
