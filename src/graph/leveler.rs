use std::collections::HashSet;

use crate::error::GraphError;

use super::{FlowGraph, NodeId};

/// Assign nodes to execution levels.
///
/// Level 0 holds every node without incoming edges; each following level holds
/// the not-yet-placed nodes whose predecessors are all placed in earlier levels.
/// Nodes still unplaced once no progress is possible sit on a cycle.
pub fn levelize(graph: &FlowGraph) -> Result<Vec<Vec<NodeId>>, GraphError> {
    let mut placed: HashSet<NodeId> = HashSet::with_capacity(graph.nodes().len());
    let mut levels: Vec<Vec<NodeId>> = Vec::new();

    loop {
        let level: Vec<NodeId> = graph
            .nodes()
            .iter()
            .filter(|node| !placed.contains(&node.id))
            .filter(|node| {
                graph
                    .predecessors(&node.id)
                    .iter()
                    .all(|pred| placed.contains(pred))
            })
            .map(|node| node.id.clone())
            .collect();

        if level.is_empty() {
            break;
        }
        placed.extend(level.iter().cloned());
        levels.push(level);
    }

    if placed.len() < graph.nodes().len() {
        let unresolved = graph
            .nodes()
            .iter()
            .filter(|node| !placed.contains(&node.id))
            .map(|node| node.id.clone())
            .collect();
        return Err(GraphError::Cycle(unresolved));
    }

    Ok(levels)
}

/// Levels restricted to `subset`, ignoring edges from outside of it.
pub fn levelize_subset(graph: &FlowGraph, subset: &HashSet<NodeId>) -> Result<Vec<Vec<NodeId>>, GraphError> {
    let mut placed: HashSet<NodeId> = HashSet::with_capacity(subset.len());
    let mut levels = Vec::new();

    loop {
        let level: Vec<NodeId> = graph
            .nodes()
            .iter()
            .filter(|node| subset.contains(&node.id) && !placed.contains(&node.id))
            .filter(|node| {
                graph
                    .predecessors(&node.id)
                    .iter()
                    .filter(|pred| subset.contains(*pred))
                    .all(|pred| placed.contains(pred))
            })
            .map(|node| node.id.clone())
            .collect();

        if level.is_empty() {
            break;
        }
        placed.extend(level.iter().cloned());
        levels.push(level);
    }

    if placed.len() < subset.len() {
        let mut unresolved: Vec<NodeId> = subset.difference(&placed).cloned().collect();
        unresolved.sort();
        return Err(GraphError::Cycle(unresolved));
    }
    Ok(levels)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Edge, Node, NodeKind};
    use serde_json::json;
    use std::collections::HashMap;

    fn graph(ids: &[&str], edges: &[(&str, &str)]) -> FlowGraph {
        FlowGraph::build(
            ids.iter()
                .map(|id| Node::new(*id, NodeKind::TextDisplay, json!({})))
                .collect(),
            edges.iter().map(|(s, t)| Edge::new(*s, *t)).collect(),
        )
        .unwrap()
    }

    #[test]
    fn test_diamond_levels() {
        let g = graph(
            &["d", "b", "a", "c"],
            &[("a", "b"), ("a", "c"), ("b", "d"), ("c", "d")],
        );
        let levels = levelize(&g).unwrap();
        assert_eq!(levels, vec![vec!["a"], vec!["b", "c"], vec!["d"]]);
    }

    #[test]
    fn test_every_node_above_its_predecessors() {
        let g = graph(
            &["a", "b", "c", "d", "e", "f"],
            &[("a", "c"), ("b", "c"), ("c", "e"), ("d", "e"), ("a", "f"), ("e", "f")],
        );
        let levels = levelize(&g).unwrap();
        let index: HashMap<&str, usize> = levels
            .iter()
            .enumerate()
            .flat_map(|(i, l)| l.iter().map(move |id| (id.as_str(), i)))
            .collect();

        for edge in g.edges() {
            assert!(index[edge.target.as_str()] > index[edge.source.as_str()]);
        }
        for id in ["a", "b", "d"] {
            assert_eq!(index[id], 0);
        }
        assert_eq!(index["f"], 3);
    }

    #[test]
    fn test_cycle_is_reported() {
        let g = graph(&["a", "b", "c"], &[("a", "b"), ("b", "c"), ("c", "b")]);
        let err = levelize(&g).unwrap_err();
        assert_eq!(err, GraphError::Cycle(vec!["b".into(), "c".into()]));
    }

    #[test]
    fn test_empty_graph() {
        let g = graph(&[], &[]);
        assert!(levelize(&g).unwrap().is_empty());
    }

    #[test]
    fn test_subset_ignores_outside_predecessors() {
        let g = graph(&["x", "it", "a", "b"], &[("it", "a"), ("x", "b"), ("a", "b")]);
        let subset: HashSet<NodeId> = ["a", "b"].iter().map(|s| s.to_string()).collect();
        let levels = levelize_subset(&g, &subset).unwrap();
        assert_eq!(levels, vec![vec!["a"], vec!["b"]]);
    }
}
