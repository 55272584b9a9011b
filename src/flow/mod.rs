//! Flow orchestrator.
//!
//! A run walks the levels produced by [`levelize`]. Plain nodes of a level run
//! concurrently; iterators of a level run one after another, each re-running its
//! whole downstream subgraph once per item. Node side effects (environment
//! writes, data updates, iterator cursors) come back from the executor and are
//! applied here, in one place, before the next node starts.

pub mod manager;
pub mod observer;
pub mod state;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, join_all};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::capability::Capabilities;
use crate::config::EngineConfig;
use crate::environment::Environment;
use crate::error::{EngineError, GraphError};
use crate::graph::leveler::levelize_subset;
use crate::graph::{FlowDocument, FlowGraph, Node, NodeId, NodeKind, levelize};
use crate::node::{ExecutorRegistry, NodeContext, NodeEffects, NodeExecutor, NodeInput};
use crate::result::StandardResult;

use observer::{FlowObserver, NoopObserver};
use state::{FlowRunReport, HistoryEntry, RunState};

/// A node ready to run: input gathered, context built, nothing borrowed from the executor.
struct Invocation {
    node: Node,
    executor: Arc<dyn NodeExecutor>,
    input: NodeInput,
    ctx: NodeContext,
    sequence: u64,
}

struct Finished {
    node: Node,
    input: NodeInput,
    sequence: u64,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    result: StandardResult,
    effects: NodeEffects,
}

impl Invocation {
    async fn run(self, step_delay: Duration) -> Finished {
        if !step_delay.is_zero() {
            tokio::time::sleep(step_delay).await;
        }
        let Invocation {
            node,
            executor,
            input,
            mut ctx,
            sequence,
        } = self;
        let started_at = Utc::now();
        let result = executor.execute(&node, &input, &mut ctx).await;
        Finished {
            node,
            input,
            sequence,
            started_at,
            finished_at: Utc::now(),
            result,
            effects: ctx.into_effects(),
        }
    }
}

/// Drives one flow at a time. Reuse across runs is fine; all state is reset on `execute`.
pub struct FlowExecutor {
    registry: Arc<ExecutorRegistry>,
    capabilities: Arc<Capabilities>,
    observer: Arc<dyn FlowObserver>,
    config: EngineConfig,
    graph: FlowGraph,
    environment: Environment,
    state: RunState,
    cancel: CancellationToken,
}

impl FlowExecutor {
    pub fn new(registry: Arc<ExecutorRegistry>, capabilities: Arc<Capabilities>, config: EngineConfig) -> Self {
        Self {
            registry,
            capabilities,
            observer: Arc::new(NoopObserver),
            config,
            graph: FlowGraph::default(),
            environment: Environment::new(),
            state: RunState::new(config.history_limit),
            cancel: CancellationToken::new(),
        }
    }

    /// Built-in executors and default capabilities.
    pub fn headless(config: EngineConfig) -> Self {
        Self::new(
            Arc::new(ExecutorRegistry::builtin()),
            Arc::new(Capabilities::headless(Duration::from_millis(config.http_timeout_ms))),
            config,
        )
    }

    pub fn with_observer(mut self, observer: Arc<dyn FlowObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// The graph as of the last run, including data updates made by nodes.
    pub fn graph(&self) -> &FlowGraph {
        &self.graph
    }

    pub fn environment(&self) -> &Environment {
        &self.environment
    }

    /// Run `doc` to completion.
    ///
    /// A failed node does not stop the run; its downstream simply sees the
    /// failed result. Graph errors and cancellation abort it.
    #[tracing::instrument(name = "flow_execute", skip_all, fields(nodes = doc.nodes.len(), edges = doc.edges.len()))]
    pub async fn execute(&mut self, doc: FlowDocument, cancel: CancellationToken) -> Result<FlowRunReport, EngineError> {
        self.state.clear();
        self.cancel = cancel;
        self.environment = doc.environment;
        self.graph = FlowGraph::build(doc.nodes, doc.edges)?;

        let levels = levelize(&self.graph)?;
        for node in self.graph.nodes() {
            self.registry.resolve(node)?;
        }

        let mut handled: HashSet<NodeId> = HashSet::new();
        for (depth, level) in levels.into_iter().enumerate() {
            let (iterators, plain): (Vec<NodeId>, Vec<NodeId>) = level
                .into_iter()
                .filter(|id| !handled.contains(id))
                .partition(|id| self.is_iterator(id));
            debug!(level = depth, plain = plain.len(), iterators = iterators.len(), "executing level");

            self.execute_level(&plain).await?;
            handled.extend(plain);

            for id in iterators {
                if handled.contains(&id) {
                    continue;
                }
                let done = self.execute_iterator_and_descendants(&id).await?;
                handled.extend(done);
            }
        }

        info!(executions = self.state.sequence(), "flow finished");
        Ok(self.report())
    }

    fn is_iterator(&self, id: &str) -> bool {
        self.graph.node(id).is_some_and(|n| n.kind == NodeKind::Iterator)
    }

    fn step_delay(&self) -> Duration {
        Duration::from_millis(self.config.step_delay_ms)
    }

    /// Run `ids` concurrently and apply their results in level order.
    async fn execute_level(&mut self, ids: &[NodeId]) -> Result<(), EngineError> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut prepared = Vec::with_capacity(ids.len());
        for id in ids {
            match self.prepare(id) {
                Ok(invocation) => prepared.push(invocation),
                Err(err) => {
                    for invocation in &prepared {
                        self.unmark(&invocation.node.id);
                    }
                    return Err(err);
                }
            }
        }

        let delay = self.step_delay();
        let finished = join_all(prepared.into_iter().map(|inv| inv.run(delay))).await;
        for done in finished {
            self.commit(done);
        }
        Ok(())
    }

    async fn execute_node(&mut self, id: &str) -> Result<StandardResult, EngineError> {
        let invocation = self.prepare(id)?;
        let done = invocation.run(self.step_delay()).await;
        Ok(self.commit(done))
    }

    /// Run an iterator and, for every item it emits, one pass over its downstream.
    ///
    /// Returns every node handled here so the level loop can skip them.
    fn execute_iterator_and_descendants<'a>(
        &'a mut self,
        iterator_id: &'a str,
    ) -> BoxFuture<'a, Result<HashSet<NodeId>, EngineError>> {
        Box::pin(async move {
            let downstream = self.graph.downstream(iterator_id);
            let order: Vec<NodeId> = levelize_subset(&self.graph, &downstream)?
                .into_iter()
                .flatten()
                .collect();

            let mut result = self.execute_node(iterator_id).await?;
            let mut passes = 0usize;
            while result.should_continue() {
                let mut inner_handled: HashSet<NodeId> = HashSet::new();
                for id in &order {
                    if inner_handled.contains(id) {
                        continue;
                    }
                    if self.is_iterator(id) {
                        let done = self.execute_iterator_and_descendants(id).await?;
                        inner_handled.extend(done);
                    } else {
                        self.execute_node(id).await?;
                    }
                }
                passes += 1;
                result = self.execute_node(iterator_id).await?;
            }
            debug!(iterator = %iterator_id, passes, downstream = order.len(), "iterator drained");

            let mut handled = downstream;
            handled.insert(iterator_id.to_string());
            Ok(handled)
        })
    }

    fn prepare(&mut self, id: &str) -> Result<Invocation, EngineError> {
        if self.cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        let node = self
            .graph
            .node(id)
            .cloned()
            .ok_or_else(|| GraphError::UnknownNode(id.to_string()))?;
        let executor = self.registry.resolve(&node)?;

        self.state.executing.insert(node.id.clone());
        self.observer.set_executing_node_ids(&self.state.executing_ids());
        let sequence = self.state.next_sequence();

        let input = self.build_input(id);
        let input_json = input.to_json();
        self.observer.set_last_input(id, &input_json);
        self.state.last_input.insert(node.id.clone(), input_json);

        let ctx = NodeContext::new(
            node.id.clone(),
            self.environment.clone(),
            self.capabilities.clone(),
            self.cancel.clone(),
        )
        .with_iterator_state(self.state.iterator_states.remove(id));

        Ok(Invocation {
            node,
            executor,
            input,
            ctx,
            sequence,
        })
    }

    /// One slot per predecessor with its cached output.
    ///
    /// An edge leaving a conditional through a handle other than the branch it
    /// chose yields an empty slot.
    fn build_input(&self, id: &str) -> NodeInput {
        let mut input = NodeInput::new();
        for edge in self.graph.incoming_edges(id) {
            let cached = self.state.outputs.get(&edge.source);
            let from_conditional = self
                .graph
                .node(&edge.source)
                .is_some_and(|n| n.kind == NodeKind::Conditional);

            let slot = match (cached, edge.source_handle.as_deref()) {
                (Some(result), Some(handle)) if from_conditional => {
                    if result.output_path() == Some(handle) {
                        Some(result.clone())
                    } else {
                        debug!(node_id = %id, source = %edge.source, %handle, "branch not taken");
                        None
                    }
                }
                (cached, _) => cached.cloned(),
            };
            input.push(edge.source.clone(), slot);
        }
        input
    }

    fn commit(&mut self, done: Finished) -> StandardResult {
        let Finished {
            node,
            input,
            sequence,
            started_at,
            finished_at,
            result,
            effects,
        } = done;
        let id = node.id.clone();

        if result.success {
            for (name, value) in effects.environment_writes {
                self.observer.set_environment_variable(&name, &value);
                self.environment.set(name, value);
            }
        } else if !effects.environment_writes.is_empty() {
            debug!(node_id = %id, "discarding environment writes of failed node");
        }
        for (field, value) in effects.data_updates {
            if let Some(stored) = self.graph.node_mut(&id) {
                stored.set_field(&field, value.clone());
            }
            self.observer.update_node_data(&id, &field, &value);
        }
        if let Some(cursor) = effects.iterator_state {
            self.state.iterator_states.insert(id.clone(), cursor);
        }

        let iteration = result
            .iteration()
            .or_else(|| input.iterator().and_then(StandardResult::iteration));
        let log_key = match iteration {
            Some(n) => format!("{id}-iteration-{n}"),
            None => id.clone(),
        };
        self.observer.add_log(&log_key, &result);

        self.state.outputs.insert(id.clone(), result.clone());
        self.observer.set_last_output(&id, &result);

        let entry = HistoryEntry {
            sequence,
            node_id: id.clone(),
            node_type: node.kind,
            iteration,
            started_at,
            finished_at,
            result: result.clone(),
        };
        self.observer.add_to_history(&entry);
        self.state.push_history(entry);

        self.unmark(&id);
        result
    }

    fn unmark(&mut self, id: &str) {
        self.state.executing.remove(id);
        self.observer.set_executing_node_ids(&self.state.executing_ids());
    }

    fn report(&self) -> FlowRunReport {
        FlowRunReport {
            outputs: self
                .state
                .outputs
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            last_input: self
                .state
                .last_input
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            history: self.state.history().cloned().collect(),
            environment: self.environment.clone(),
            total: self.state.sequence(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Edge;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        logs: Mutex<Vec<String>>,
        executing: Mutex<Vec<Vec<NodeId>>>,
    }

    impl FlowObserver for Recorder {
        fn add_log(&self, key: &str, _result: &StandardResult) {
            self.logs.lock().unwrap().push(key.to_string());
        }

        fn set_executing_node_ids(&self, ids: &[NodeId]) {
            self.executing.lock().unwrap().push(ids.to_vec());
        }
    }

    fn executor(observer: Arc<dyn FlowObserver>) -> FlowExecutor {
        FlowExecutor::headless(EngineConfig::default()).with_observer(observer)
    }

    fn text(id: &str, text: &str) -> Node {
        Node::new(id, NodeKind::TextDisplay, json!({ "text": text }))
    }

    #[tokio::test]
    async fn test_conditional_prunes_untaken_branch() {
        let doc = FlowDocument {
            nodes: vec![
                Node::new(
                    "cond",
                    NodeKind::Conditional,
                    json!({"conditions": [{"field": 1, "operator": "==", "value": 1}]}),
                ),
                text("yes", "taken"),
                text("no", "skipped"),
            ],
            edges: vec![
                Edge::new("cond", "yes").with_handle("output-1"),
                Edge::new("cond", "no").with_handle("output-else"),
            ],
            environment: Environment::new(),
        };

        let report = executor(Arc::new(NoopObserver))
            .execute(doc, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.last_input["no"], json!({"cond": null}));
        assert_eq!(report.last_input["yes"]["cond"]["response"]["outputPath"], json!("output-1"));
        assert_eq!(report.total, 3);
    }

    #[tokio::test]
    async fn test_iteration_log_keys_and_executing_cleared() {
        let recorder = Arc::new(Recorder::default());
        let doc = FlowDocument {
            nodes: vec![
                Node::new("it", NodeKind::Iterator, json!({"source": "custom", "items": ["a", "b"]})),
                text("show", "{{it.response.item}}"),
            ],
            edges: vec![Edge::new("it", "show")],
            environment: Environment::new(),
        };

        let report = executor(recorder.clone())
            .execute(doc, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.output("show").unwrap().response, json!({"text": "b"}));

        let logs = recorder.logs.lock().unwrap().clone();
        assert_eq!(
            logs,
            vec![
                "it-iteration-1",
                "show-iteration-1",
                "it-iteration-2",
                "show-iteration-2",
                "it",
            ]
        );
        let last = recorder.executing.lock().unwrap().last().cloned().unwrap();
        assert!(last.is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let token = CancellationToken::new();
        token.cancel();
        let doc = FlowDocument {
            nodes: vec![text("a", "x")],
            edges: vec![],
            environment: Environment::new(),
        };
        let err = executor(Arc::new(NoopObserver)).execute(doc, token).await.unwrap_err();
        assert!(matches!(err, EngineError::Cancelled));
    }

    #[tokio::test]
    async fn test_cycle_is_reported() {
        let doc = FlowDocument {
            nodes: vec![text("a", "x"), text("b", "y"), text("c", "z")],
            edges: vec![Edge::new("a", "b"), Edge::new("b", "a")],
            environment: Environment::new(),
        };
        let err = executor(Arc::new(NoopObserver))
            .execute(doc, CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            EngineError::Graph(GraphError::Cycle(ids)) => assert_eq!(ids, vec!["a", "b"]),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_failed_node_does_not_stop_run() {
        let doc = FlowDocument {
            nodes: vec![
                Node::new("http", NodeKind::Http, json!({"url": "{{$MISSING}}"})),
                text("after", "{{http.success}}"),
            ],
            edges: vec![Edge::new("http", "after")],
            environment: Environment::new(),
        };
        let report = executor(Arc::new(NoopObserver))
            .execute(doc, CancellationToken::new())
            .await
            .unwrap();
        assert!(!report.output("http").unwrap().success);
        assert_eq!(report.output("after").unwrap().response["text"], json!("false"));
    }
}
