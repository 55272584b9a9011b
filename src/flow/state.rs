use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::environment::Environment;
use crate::graph::{NodeId, NodeKind};
use crate::result::StandardResult;

/// Cursor of one iterator node, owned by the orchestrator between calls.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IteratorState {
    pub current_index: usize,
    pub items: Vec<Value>,
    pub total_items: usize,
    /// Iteration of the enclosing iterator when this state was created.
    pub parent_iteration: Option<u64>,
    pub is_inner_iterator: bool,
    pub completed: bool,
}

impl IteratorState {
    pub fn new(items: Vec<Value>, parent_iteration: Option<u64>) -> Self {
        Self {
            current_index: 0,
            total_items: items.len(),
            items,
            is_inner_iterator: parent_iteration.is_some(),
            parent_iteration,
            completed: false,
        }
    }

    pub fn has_more(&self) -> bool {
        self.current_index < self.total_items
    }

    /// Take the item under the cursor and advance.
    pub fn advance(&mut self) -> Option<(usize, Value)> {
        let index = self.current_index;
        let item = self.items.get(index)?.clone();
        self.current_index += 1;
        Some((index, item))
    }

    /// Rewind for the next parent item, keeping the state around.
    pub fn rewind(&mut self) {
        self.current_index = 0;
        self.completed = true;
    }
}

/// One executed node, in execution order.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub sequence: u64,
    pub node_id: NodeId,
    pub node_type: NodeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iteration: Option<u64>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub result: StandardResult,
}

/// What a finished run hands back to its caller.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FlowRunReport {
    /// Last result of every node that ran.
    pub outputs: BTreeMap<NodeId, StandardResult>,
    /// Input slots each node saw on its most recent execution; `null` marks a predecessor that did not fire.
    pub last_input: BTreeMap<NodeId, Value>,
    pub history: Vec<HistoryEntry>,
    pub environment: Environment,
    /// Node executions in the run, including ones trimmed from `history`.
    pub total: u64,
}

impl FlowRunReport {
    pub fn output(&self, node_id: &str) -> Option<&StandardResult> {
        self.outputs.get(node_id)
    }

    pub fn executions_of(&self, node_id: &str) -> usize {
        self.history.iter().filter(|h| h.node_id == node_id).count()
    }
}

/// Per-run bookkeeping. Reset at the start of every run.
#[derive(Debug, Default)]
pub struct RunState {
    pub outputs: HashMap<NodeId, StandardResult>,
    pub last_input: HashMap<NodeId, Value>,
    pub iterator_states: HashMap<NodeId, IteratorState>,
    pub executing: BTreeSet<NodeId>,
    history: VecDeque<HistoryEntry>,
    history_limit: usize,
    sequence: u64,
}

impl RunState {
    pub fn new(history_limit: usize) -> Self {
        Self {
            history_limit,
            ..Default::default()
        }
    }

    pub fn clear(&mut self) {
        let limit = self.history_limit;
        *self = Self::new(limit);
    }

    pub fn next_sequence(&mut self) -> u64 {
        self.sequence += 1;
        self.sequence
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn push_history(&mut self, entry: HistoryEntry) {
        if self.history_limit == 0 {
            return;
        }
        while self.history.len() >= self.history_limit {
            self.history.pop_front();
        }
        self.history.push_back(entry);
    }

    pub fn history(&self) -> impl Iterator<Item = &HistoryEntry> {
        self.history.iter()
    }

    pub fn executing_ids(&self) -> Vec<NodeId> {
        self.executing.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(seq: u64) -> HistoryEntry {
        HistoryEntry {
            sequence: seq,
            node_id: format!("n{seq}"),
            node_type: NodeKind::TextDisplay,
            iteration: None,
            started_at: Utc::now(),
            finished_at: Utc::now(),
            result: StandardResult::success(format!("n{seq}"), json!(null)),
        }
    }

    #[test]
    fn test_iterator_state_advances_and_rewinds() {
        let mut st = IteratorState::new(vec![json!("a"), json!("b")], None);
        assert!(!st.is_inner_iterator);
        assert_eq!(st.advance(), Some((0, json!("a"))));
        assert_eq!(st.advance(), Some((1, json!("b"))));
        assert!(!st.has_more());
        assert_eq!(st.advance(), None);

        st.rewind();
        assert_eq!(st.current_index, 0);
        assert!(st.completed);
    }

    #[test]
    fn test_history_is_capped() {
        let mut state = RunState::new(2);
        for i in 1..=3 {
            let seq = state.next_sequence();
            assert_eq!(seq, i);
            state.push_history(entry(seq));
        }
        let seqs: Vec<u64> = state.history().map(|h| h.sequence).collect();
        assert_eq!(seqs, vec![2, 3]);

        state.clear();
        assert_eq!(state.sequence(), 0);
        assert_eq!(state.history().count(), 0);
    }
}
