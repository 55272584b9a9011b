//! Executor contract shared by every node type.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::capability::Capabilities;
use crate::environment::{Environment, EnvironmentHandle};
use crate::error::{CapabilityError, GraphError};
use crate::flow::state::IteratorState;
use crate::graph::{Node, NodeId, NodeKind};
use crate::result::StandardResult;
use crate::template::{self, TemplateContext, TemplateError};

/// Failure inside one executor. Never escapes [`NodeExecutor::execute`].
#[derive(Debug, Clone, Error, PartialEq)]
pub enum NodeError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error(transparent)]
    Capability(#[from] CapabilityError),

    #[error("limit reached: {0}")]
    LimitReached(String),

    #[error("execution cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("{0}")]
    Failed(String),
}

impl From<std::io::Error> for NodeError {
    fn from(err: std::io::Error) -> Self {
        NodeError::Io(err.to_string())
    }
}

/// Input slots of one invocation, one per distinct predecessor in edge order.
///
/// `None` marks a predecessor that did not fire this time: it has not run yet,
/// or it is a conditional whose chosen branch is not the edge's handle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeInput {
    slots: Vec<(NodeId, Option<StandardResult>)>,
}

impl NodeInput {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a slot. A source already present stays live if either slot is live.
    pub fn push(&mut self, source: impl Into<NodeId>, result: Option<StandardResult>) {
        let source = source.into();
        match self.slots.iter_mut().find(|(id, _)| *id == source) {
            Some((_, slot)) => {
                if slot.is_none() {
                    *slot = result;
                }
            }
            None => self.slots.push((source, result)),
        }
    }

    pub fn with(mut self, source: impl Into<NodeId>, result: StandardResult) -> Self {
        self.push(source, Some(result));
        self
    }

    pub fn slots(&self) -> &[(NodeId, Option<StandardResult>)] {
        &self.slots
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn get(&self, source: &str) -> Option<&StandardResult> {
        self.slots
            .iter()
            .find(|(id, _)| id == source)
            .and_then(|(_, r)| r.as_ref())
    }

    pub fn live(&self) -> impl Iterator<Item = (&NodeId, &StandardResult)> {
        self.slots
            .iter()
            .filter_map(|(id, r)| r.as_ref().map(|r| (id, r)))
    }

    pub fn first_live(&self) -> Option<&StandardResult> {
        self.live().map(|(_, r)| r).next()
    }

    /// Closest iterator result among the inputs.
    pub fn iterator(&self) -> Option<&StandardResult> {
        self.live().map(|(_, r)| r).find(|r| r.is_iterator())
    }

    /// Template context: source id -> StandardResult JSON, live slots only.
    pub fn context(&self) -> TemplateContext {
        self.live()
            .map(|(id, r)| (id.clone(), r.to_json()))
            .collect()
    }

    /// Slot view reported to observers, with `null` for slots that did not fire.
    pub fn to_json(&self) -> Value {
        let map: Map<String, Value> = self
            .slots
            .iter()
            .map(|(id, r)| (id.clone(), r.as_ref().map(|r| r.to_json()).unwrap_or(Value::Null)))
            .collect();
        Value::Object(map)
    }
}

/// Everything an executor may touch for one invocation.
///
/// Side effects are collected here and applied by the orchestrator once the
/// executor returns.
pub struct NodeContext {
    node_id: NodeId,
    env: EnvironmentHandle,
    capabilities: Arc<Capabilities>,
    iterator_state: Option<IteratorState>,
    data_updates: Vec<(String, Value)>,
    cancel: CancellationToken,
}

/// Side effects an invocation produced.
#[derive(Debug, Default)]
pub struct NodeEffects {
    pub environment_writes: Vec<(String, Value)>,
    pub data_updates: Vec<(String, Value)>,
    pub iterator_state: Option<IteratorState>,
}

impl NodeContext {
    pub fn new(
        node_id: impl Into<NodeId>,
        environment: Environment,
        capabilities: Arc<Capabilities>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            env: EnvironmentHandle::new(environment),
            capabilities,
            iterator_state: None,
            data_updates: Vec::new(),
            cancel,
        }
    }

    pub fn with_iterator_state(mut self, state: Option<IteratorState>) -> Self {
        self.iterator_state = state;
        self
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn environment(&self) -> &Environment {
        self.env.environment()
    }

    pub fn set_environment_variable(&mut self, name: impl Into<String>, value: Value) {
        self.env.set(name, value);
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    pub fn iterator_state(&self) -> Option<&IteratorState> {
        self.iterator_state.as_ref()
    }

    pub fn iterator_state_mut(&mut self) -> &mut Option<IteratorState> {
        &mut self.iterator_state
    }

    /// Record a change to this node's `data`. The orchestrator applies it after the call.
    pub fn update_node_data(&mut self, field: impl Into<String>, value: Value) {
        self.data_updates.push((field.into(), value));
    }

    pub fn data_updates(&self) -> &[(String, Value)] {
        &self.data_updates
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Call before every capability invocation.
    pub fn check_cancelled(&self) -> Result<(), NodeError> {
        if self.cancel.is_cancelled() {
            return Err(NodeError::Cancelled);
        }
        Ok(())
    }

    /// Expand `{{...}}` against `context` and this invocation's environment view.
    pub fn render(&self, text: &str, context: &TemplateContext) -> Result<String, NodeError> {
        Ok(template::evaluate_template(text, context, self.environment())?)
    }

    /// Expand templates in every string of `value`.
    pub fn render_value(&self, value: &Value, context: &TemplateContext) -> Result<Value, NodeError> {
        Ok(template::evaluate_value(value, context, self.environment())?)
    }

    pub fn into_effects(self) -> NodeEffects {
        NodeEffects {
            environment_writes: self.env.into_writes(),
            data_updates: self.data_updates,
            iterator_state: self.iterator_state,
        }
    }
}

impl fmt::Debug for NodeContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeContext")
            .field("node_id", &self.node_id)
            .field("iterator_state", &self.iterator_state)
            .field("data_updates", &self.data_updates)
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait NodeExecutor: Send + Sync {
    fn kind(&self) -> NodeKind;

    /// Type-specific work. Errors are turned into a failed [`StandardResult`] by `execute`.
    async fn run(&self, node: &Node, input: &NodeInput, ctx: &mut NodeContext) -> Result<Value, NodeError>;

    async fn execute(&self, node: &Node, input: &NodeInput, ctx: &mut NodeContext) -> StandardResult {
        match self.run(node, input, ctx).await {
            Ok(response) => {
                debug!(node_id = %node.id, kind = %node.kind, "node succeeded");
                StandardResult::success(node.id.clone(), response)
            }
            Err(err) => {
                warn!(node_id = %node.id, kind = %node.kind, error = %err, "node failed");
                StandardResult::failure(node.id.clone(), err.to_string())
            }
        }
    }
}

/// Static map from node type to executor.
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    executors: HashMap<NodeKind, Arc<dyn NodeExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with an executor for every [`NodeKind`].
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        for executor in crate::nodes::builtin_executors() {
            registry.register(executor);
        }
        registry
    }

    pub fn register(&mut self, executor: Arc<dyn NodeExecutor>) -> Option<Arc<dyn NodeExecutor>> {
        self.executors.insert(executor.kind(), executor)
    }

    pub fn get(&self, kind: NodeKind) -> Option<Arc<dyn NodeExecutor>> {
        self.executors.get(&kind).cloned()
    }

    pub fn resolve(&self, node: &Node) -> Result<Arc<dyn NodeExecutor>, GraphError> {
        self.get(node.kind).ok_or_else(|| GraphError::NoExecutor {
            node_id: node.id.clone(),
            kind: node.kind.to_string(),
        })
    }

    pub fn len(&self) -> usize {
        self.executors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executors.is_empty()
    }
}

impl fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<&str> = self.executors.keys().map(|k| k.as_str()).collect();
        kinds.sort_unstable();
        f.debug_struct("ExecutorRegistry").field("kinds", &kinds).finish()
    }
}
