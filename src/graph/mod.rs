//! Flow graph model: nodes, edges and the petgraph index built over them.

pub mod leveler;

use std::collections::{HashMap, HashSet};
use std::fmt;

use petgraph::Direction;
use petgraph::graph::NodeIndex;
use petgraph::prelude::StableDiGraph;
use petgraph::visit::{Dfs, EdgeRef};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::environment::Environment;
use crate::error::GraphError;
pub use leveler::levelize;

pub type NodeId = String;

/// Node type tag; selects the executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Http,
    Format,
    File,
    Parser,
    Conditional,
    Iterator,
    Test,
    Command,
    DatabaseQuery,
    Rss,
    Prompt,
    Counter,
    TextDisplay,
    Collector,
}

impl NodeKind {
    pub const ALL: [NodeKind; 14] = [
        NodeKind::Http,
        NodeKind::Format,
        NodeKind::File,
        NodeKind::Parser,
        NodeKind::Conditional,
        NodeKind::Iterator,
        NodeKind::Test,
        NodeKind::Command,
        NodeKind::DatabaseQuery,
        NodeKind::Rss,
        NodeKind::Prompt,
        NodeKind::Counter,
        NodeKind::TextDisplay,
        NodeKind::Collector,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Http => "http",
            NodeKind::Format => "format",
            NodeKind::File => "file",
            NodeKind::Parser => "parser",
            NodeKind::Conditional => "conditional",
            NodeKind::Iterator => "iterator",
            NodeKind::Test => "test",
            NodeKind::Command => "command",
            NodeKind::DatabaseQuery => "database_query",
            NodeKind::Rss => "rss",
            NodeKind::Prompt => "prompt",
            NodeKind::Counter => "counter",
            NodeKind::TextDisplay => "text_display",
            NodeKind::Collector => "collector",
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit of work. `data` is the type-specific configuration object.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct Node {
    pub id: NodeId,
    #[serde(rename = "type")]
    pub kind: NodeKind,
    #[serde(default = "empty_object")]
    pub data: Value,
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

impl Node {
    pub fn new(id: impl Into<String>, kind: NodeKind, data: Value) -> Self {
        Self {
            id: id.into(),
            kind,
            data,
        }
    }

    /// Write one field of `data`, turning a non-object `data` into an object first.
    pub fn set_field(&mut self, field: &str, value: Value) {
        if !self.data.is_object() {
            self.data = empty_object();
        }
        if let Value::Object(map) = &mut self.data {
            map.insert(field.to_string(), value);
        }
    }
}

/// Directed dependency from `source` to `target`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct Edge {
    pub source: NodeId,
    pub target: NodeId,
    /// Named output on the source, e.g. `output-1` / `output-else` on conditionals.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_handle: Option<String>,
}

impl Edge {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            source_handle: None,
        }
    }

    pub fn with_handle(mut self, handle: impl Into<String>) -> Self {
        self.source_handle = Some(handle.into());
        self
    }
}

/// What a caller hands to the engine for one run.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct FlowDocument {
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
    #[serde(default)]
    pub environment: Environment,
}

/// Nodes + edges with a petgraph index for traversal.
#[derive(Debug, Clone, Default)]
pub struct FlowGraph {
    nodes: Vec<Node>,
    edges: Vec<Edge>,
    graph: StableDiGraph<NodeId, usize>,
    index_of: HashMap<NodeId, NodeIndex>,
}

impl FlowGraph {
    /// Build the graph. Edges that reference unknown nodes are ignored.
    pub fn build(nodes: Vec<Node>, edges: Vec<Edge>) -> Result<Self, GraphError> {
        let mut graph = StableDiGraph::new();
        let mut index_of = HashMap::with_capacity(nodes.len());

        // 1) add nodes to graph
        for node in &nodes {
            if index_of.contains_key(&node.id) {
                return Err(GraphError::DuplicateNode(node.id.clone()));
            }
            let idx = graph.add_node(node.id.clone());
            index_of.insert(node.id.clone(), idx);
        }

        // 2) add edges; the weight is the edge's position in `edges`
        for (pos, edge) in edges.iter().enumerate() {
            if let (Some(&i), Some(&j)) = (index_of.get(&edge.source), index_of.get(&edge.target)) {
                graph.add_edge(i, j, pos);
            }
        }

        Ok(Self {
            nodes,
            edges,
            graph,
            index_of,
        })
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn node_mut(&mut self, id: &str) -> Option<&mut Node> {
        self.nodes.iter_mut().find(|n| n.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index_of.contains_key(id)
    }

    /// Edges pointing at `id`, in declaration order.
    pub fn incoming_edges(&self, id: &str) -> Vec<&Edge> {
        let Some(&idx) = self.index_of.get(id) else {
            return Vec::new();
        };
        let mut positions: Vec<usize> = self
            .graph
            .edges_directed(idx, Direction::Incoming)
            .map(|e| *e.weight())
            .collect();
        positions.sort_unstable();
        positions.into_iter().map(|p| &self.edges[p]).collect()
    }

    /// Distinct ids of direct predecessors.
    pub fn predecessors(&self, id: &str) -> Vec<NodeId> {
        let mut seen = HashSet::new();
        self.incoming_edges(id)
            .into_iter()
            .filter(|e| seen.insert(e.source.clone()))
            .map(|e| e.source.clone())
            .collect()
    }

    /// Transitive closure over outgoing edges, excluding `id` itself.
    pub fn downstream(&self, id: &str) -> HashSet<NodeId> {
        let Some(&start) = self.index_of.get(id) else {
            return HashSet::new();
        };
        let mut out = HashSet::new();
        let mut dfs = Dfs::new(&self.graph, start);
        while let Some(nx) = dfs.next(&self.graph) {
            if nx != start {
                out.insert(self.graph[nx].clone());
            }
        }
        out
    }
}

impl TryFrom<FlowDocument> for FlowGraph {
    type Error = GraphError;

    fn try_from(doc: FlowDocument) -> Result<Self, Self::Error> {
        FlowGraph::build(doc.nodes, doc.edges)
    }
}
