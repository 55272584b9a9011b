//! Iterator node: hands out one item per call until its list is drained.
//!
//! The cursor lives in an [`IteratorState`] owned by the orchestrator and lent
//! to the node for each call. An inner iterator (one fed by another iterator)
//! re-reads its items whenever the parent moves to its next item.

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;

use crate::flow::state::IteratorState;
use crate::graph::{Node, NodeKind};
use crate::node::{NodeContext, NodeError, NodeExecutor, NodeInput};
use crate::template::{self, TemplateError};

use super::config;

#[derive(Debug, Clone, Copy, Default, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum ItemSource {
    #[default]
    Input,
    Custom,
}

#[derive(Debug, Clone, Default, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct IteratorConfig {
    #[serde(default)]
    pub source: ItemSource,
    /// Static items for `source: custom`; a JSON array string is accepted too.
    #[serde(default, alias = "customItems")]
    pub items: Value,
    /// Path to the array inside the upstream response, or a `<node>.<path>` expression.
    #[serde(default)]
    pub array_path: Option<String>,
    /// Template applied to each item, with the item available as `item`.
    #[serde(default)]
    pub item_template: Option<String>,
}

pub struct IteratorNode;

impl IteratorNode {
    fn collect_items(cfg: &IteratorConfig, input: &NodeInput, ctx: &NodeContext) -> Result<Vec<Value>, NodeError> {
        if cfg.source == ItemSource::Custom {
            return match &cfg.items {
                Value::Array(items) => Ok(items.clone()),
                Value::Null => Ok(Vec::new()),
                Value::String(s) if s.trim().is_empty() => Ok(Vec::new()),
                Value::String(s) => match serde_json::from_str::<Value>(s) {
                    Ok(Value::Array(items)) => Ok(items),
                    _ => Err(NodeError::Config("custom items must be a JSON array".into())),
                },
                _ => Err(NodeError::Config("custom items must be an array".into())),
            };
        }

        let Some(upstream) = input.first_live() else {
            return Ok(Vec::new());
        };
        let response = &upstream.response;

        if let Some(path) = cfg.array_path.as_deref().map(str::trim).filter(|p| !p.is_empty()) {
            let found = template::evaluate(path, response).or_else(|source| {
                template::evaluate_expression(path, &input.context(), ctx.environment()).map_err(|_| {
                    TemplateError::Path {
                        expression: path.to_string(),
                        source,
                    }
                })
            })?;
            return match found {
                Value::Array(items) => Ok(items),
                Value::Null => Ok(Vec::new()),
                other => Ok(vec![other]),
            };
        }

        Ok(match response {
            Value::Array(items) => items.clone(),
            other => match other.get("items").or_else(|| other.get("item")) {
                Some(Value::Array(items)) => items.clone(),
                _ => Vec::new(),
            },
        })
    }

    fn apply_template(cfg: &IteratorConfig, item: Value, input: &NodeInput, ctx: &NodeContext) -> Result<Value, NodeError> {
        let Some(text) = cfg.item_template.as_deref().filter(|t| !t.trim().is_empty()) else {
            return Ok(item);
        };
        let mut context = input.context();
        context.insert("item".to_string(), item);
        Ok(Value::String(ctx.render(text, &context)?))
    }
}

#[async_trait]
impl NodeExecutor for IteratorNode {
    fn kind(&self) -> NodeKind {
        NodeKind::Iterator
    }

    #[tracing::instrument(name = "iterator_node", skip_all, fields(node_id = %node.id))]
    async fn run(&self, node: &Node, input: &NodeInput, ctx: &mut NodeContext) -> Result<Value, NodeError> {
        let cfg: IteratorConfig = config(node)?;

        let parent = input.iterator();
        let parent_iteration = parent.and_then(|p| p.iteration());
        let parent_continues = parent.is_some_and(|p| p.should_continue());

        let reinit = match ctx.iterator_state() {
            None => true,
            Some(state) => {
                state.completed || (state.is_inner_iterator && state.parent_iteration != parent_iteration)
            }
        };
        if reinit {
            let items = Self::collect_items(&cfg, input, ctx)?;
            debug!(items = items.len(), ?parent_iteration, "iterator initialised");
            *ctx.iterator_state_mut() = Some(IteratorState::new(items, parent_iteration));
        }

        let Some(state) = ctx.iterator_state_mut().as_mut() else {
            return Err(NodeError::Failed("iterator state missing".into()));
        };
        let total = state.total_items;

        match state.advance() {
            Some((index, item)) => {
                let current = index + 1;
                let has_more = state.has_more();
                let percentage = ((current as f64 / total as f64) * 100.0).round();
                let progress = json!({"current": current, "total": total, "percentage": percentage});
                let item = Self::apply_template(&cfg, item, input, ctx)?;
                ctx.update_node_data("progress", progress.clone());
                Ok(json!({
                    "isIterator": true,
                    "item": item,
                    "index": index,
                    "shouldContinue": true,
                    "iteration": {"current": current, "total": total, "hasMore": has_more},
                    "progress": progress,
                }))
            }
            None => {
                if state.is_inner_iterator && parent_continues {
                    state.rewind();
                } else {
                    *ctx.iterator_state_mut() = None;
                }
                debug!(processed = total, "iterator complete");
                Ok(json!({
                    "isIterator": true,
                    "complete": true,
                    "processedItems": total,
                    "shouldContinue": false,
                }))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes::testing::context;
    use crate::result::StandardResult;

    fn node(data: Value) -> Node {
        Node::new("it", NodeKind::Iterator, data)
    }

    #[tokio::test]
    async fn test_outer_iterator_exhaustion() {
        let n = node(json!({"source": "custom", "items": ["a", "b", "c"]}));
        let mut ctx = context();
        let input = NodeInput::new();

        for (current, has_more) in [(1, true), (2, true), (3, false)] {
            let r = IteratorNode.execute(&n, &input, &mut ctx).await;
            assert!(r.should_continue());
            assert_eq!(r.response["iteration"]["current"], json!(current));
            assert_eq!(r.response["iteration"]["hasMore"], json!(has_more));
        }
        assert_eq!(ctx.iterator_state().unwrap().current_index, 3);

        let done = IteratorNode.execute(&n, &input, &mut ctx).await;
        assert!(done.is_complete());
        assert!(!done.should_continue());
        assert_eq!(done.response["processedItems"], json!(3));
        assert!(ctx.iterator_state().is_none());

        let again = IteratorNode.execute(&n, &input, &mut ctx).await;
        assert_eq!(again.response["item"], json!("a"));
        assert_eq!(again.iteration(), Some(1));
    }

    #[tokio::test]
    async fn test_items_from_upstream() {
        let mut ctx = context();
        let input = NodeInput::new().with("h", StandardResult::success("h", json!({"data": {"users": [{"n": 1}, {"n": 2}]}})));
        let n = node(json!({"arrayPath": "data.users", "itemTemplate": "user {{item.n}}"}));
        let r = IteratorNode.execute(&n, &input, &mut ctx).await;
        assert_eq!(r.response["item"], json!("user 1"));
        assert_eq!(r.response["progress"]["percentage"], json!(50.0));

        let mut ctx = context();
        let input = NodeInput::new().with("h", StandardResult::success("h", json!({"items": [10, 20]})));
        let r = IteratorNode.execute(&node(json!({})), &input, &mut ctx).await;
        assert_eq!(r.response["item"], json!(10));

        let mut ctx = context();
        let r = IteratorNode.execute(&node(json!({})), &NodeInput::new(), &mut ctx).await;
        assert!(r.is_complete());
        assert_eq!(r.response["processedItems"], json!(0));
    }

    #[tokio::test]
    async fn test_inner_iterator_rewinds_while_parent_continues() {
        let mut ctx = context();
        let n = node(json!({"arrayPath": "item"}));
        let parent = |iteration: u64, item: Value| {
            NodeInput::new().with(
                "outer",
                StandardResult::success(
                    "outer",
                    json!({"isIterator": true, "shouldContinue": true, "item": item,
                           "iteration": {"current": iteration, "total": 2, "hasMore": iteration < 2}}),
                ),
            )
        };

        let first = parent(1, json!([1, 2]));
        assert_eq!(IteratorNode.execute(&n, &first, &mut ctx).await.response["item"], json!(1));
        assert_eq!(IteratorNode.execute(&n, &first, &mut ctx).await.response["item"], json!(2));
        let done = IteratorNode.execute(&n, &first, &mut ctx).await;
        assert!(done.is_complete());
        let kept = ctx.iterator_state().unwrap();
        assert!(kept.is_inner_iterator && kept.completed);
        assert_eq!(kept.current_index, 0);

        let second = parent(2, json!(["x"]));
        let r = IteratorNode.execute(&n, &second, &mut ctx).await;
        assert_eq!(r.response["item"], json!("x"));
        assert_eq!(r.response["iteration"]["total"], json!(1));
    }
}
