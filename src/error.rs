//! Error types shared across the engine.
//!
//! Executor-level failures live in [`crate::node::NodeError`] and never leave an
//! executor; everything here is either run-level (aborts a flow) or belongs to an
//! injected collaborator.

use thiserror::Error;

use crate::template::TemplateError;

/// Result alias for run-level operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Structural problems with a flow graph.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum GraphError {
    /// The registry has no executor for this node type.
    #[error("no executor registered for node type `{kind}` (node `{node_id}`)")]
    NoExecutor { node_id: String, kind: String },

    /// Nodes left unplaced once levelling stabilised.
    #[error("flow contains a cycle; unresolved nodes: {}", .0.join(", "))]
    Cycle(Vec<String>),

    #[error("node `{0}` does not exist in the flow")]
    UnknownNode(String),

    #[error("duplicate node id `{0}`")]
    DuplicateNode(String),
}

/// Errors that abort a whole run.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error("execution cancelled")]
    Cancelled,

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("execution `{0}` not found")]
    ExecutionNotFound(String),

    #[error("invalid status transition for `{id}`: {from} -> {to}")]
    InvalidTransition { id: String, from: String, to: String },

    #[error(transparent)]
    Template(#[from] TemplateError),
}

/// Failure reported by an injected capability (HTTP, database, command, decrypt).
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CapabilityError {
    #[error("request failed: {0}")]
    Request(String),

    #[error("{capability} is not available in this runtime")]
    Unsupported { capability: &'static str },

    #[error("decryption failed: {0}")]
    Decrypt(String),

    #[error("{0}")]
    Upstream(String),
}

/// Errors from the key-value persistence boundary.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StoreError {
    #[error("`{id}` not found in `{collection}`")]
    NotFound { collection: String, id: String },

    #[error("I/O error: {0}")]
    Io(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_error_names_nodes() {
        let err = GraphError::Cycle(vec!["a".into(), "b".into()]);
        assert_eq!(err.to_string(), "flow contains a cycle; unresolved nodes: a, b");
    }

    #[test]
    fn test_engine_error_wraps_graph_error() {
        let err: EngineError = GraphError::UnknownNode("x".into()).into();
        assert_eq!(err.to_string(), "node `x` does not exist in the flow");
    }
}
