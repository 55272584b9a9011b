//! Progress callbacks emitted by the orchestrator.
//!
//! Observers only watch: nothing they do feeds back into the run.

use serde_json::Value;
use tracing::{debug, info, trace};

use crate::graph::NodeId;
use crate::result::StandardResult;

use super::state::HistoryEntry;

pub trait FlowObserver: Send + Sync {
    fn add_to_history(&self, _entry: &HistoryEntry) {}

    /// `key` is the node id, suffixed with the iteration when there is one.
    fn add_log(&self, _key: &str, _result: &StandardResult) {}

    fn set_executing_node_ids(&self, _ids: &[NodeId]) {}

    fn update_node_data(&self, _node_id: &str, _field: &str, _value: &Value) {}

    fn set_last_output(&self, _node_id: &str, _result: &StandardResult) {}

    fn set_last_input(&self, _node_id: &str, _input: &Value) {}

    fn set_environment_variable(&self, _name: &str, _value: &Value) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl FlowObserver for NoopObserver {}

/// Forwards every callback to `tracing`; history goes to the `execution` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl FlowObserver for TracingObserver {
    fn add_to_history(&self, entry: &HistoryEntry) {
        info!(
            target: "execution",
            sequence = entry.sequence,
            node_id = %entry.node_id,
            node_type = %entry.node_type,
            iteration = ?entry.iteration,
            success = entry.result.success,
            error = ?entry.result.error,
            elapsed_ms = (entry.finished_at - entry.started_at).num_milliseconds(),
            "node executed"
        );
    }

    fn add_log(&self, key: &str, result: &StandardResult) {
        debug!(%key, success = result.success, "node log");
    }

    fn set_executing_node_ids(&self, ids: &[NodeId]) {
        trace!(?ids, "executing nodes");
    }

    fn update_node_data(&self, node_id: &str, field: &str, value: &Value) {
        debug!(%node_id, %field, %value, "node data updated");
    }

    fn set_last_output(&self, node_id: &str, result: &StandardResult) {
        trace!(%node_id, response = %result.response, "last output");
    }

    fn set_last_input(&self, node_id: &str, input: &Value) {
        trace!(%node_id, %input, "last input");
    }

    fn set_environment_variable(&self, name: &str, _value: &Value) {
        debug!(%name, "environment variable set");
    }
}
