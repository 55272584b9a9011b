use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::graph::{Node, NodeKind};
use crate::node::{NodeContext, NodeError, NodeExecutor, NodeInput};
use crate::template;

use super::{config, lenient_opt_u64};

#[derive(Debug, Clone, Default, Deserialize, JsonSchema)]
pub struct CollectorConfig {
    #[serde(default)]
    pub collection: Vec<Value>,
    /// `{{...}}` template producing the collected value.
    #[serde(default)]
    pub template: Option<String>,
    /// `<node>.<path>` expression producing the collected value.
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub unique: bool,
    #[serde(default)]
    pub batch: bool,
    #[serde(default, deserialize_with = "lenient_opt_u64")]
    pub batch_size: Option<u64>,
}

const DEFAULT_BATCH_SIZE: usize = 10;

/// Appends one value per call to the persisted `collection`.
///
/// In batch mode the collection is emitted (and cleared) only once it holds
/// `batch_size` values; other calls return `null`.
pub struct CollectorNode;

impl CollectorNode {
    fn extract(cfg: &CollectorConfig, input: &NodeInput, ctx: &NodeContext) -> Result<Value, NodeError> {
        let context = input.context();
        if let Some(text) = cfg.template.as_deref().filter(|t| !t.trim().is_empty()) {
            return Ok(Value::String(ctx.render(text, &context)?));
        }
        if let Some(path) = cfg.path.as_deref().map(str::trim).filter(|p| !p.is_empty()) {
            return Ok(template::evaluate_expression(path, &context, ctx.environment())?);
        }
        Ok(input
            .first_live()
            .map(|r| r.response.clone())
            .unwrap_or(Value::Null))
    }
}

#[async_trait]
impl NodeExecutor for CollectorNode {
    fn kind(&self) -> NodeKind {
        NodeKind::Collector
    }

    #[tracing::instrument(name = "collector_node", skip_all, fields(node_id = %node.id))]
    async fn run(&self, node: &Node, input: &NodeInput, ctx: &mut NodeContext) -> Result<Value, NodeError> {
        let cfg: CollectorConfig = config(node)?;
        let value = Self::extract(&cfg, input, ctx)?;

        let mut collection = cfg.collection.clone();
        if !(cfg.unique && collection.contains(&value)) {
            collection.push(value);
        }

        if cfg.batch {
            let size = cfg
                .batch_size
                .filter(|s| *s > 0)
                .map(|s| s as usize)
                .unwrap_or(DEFAULT_BATCH_SIZE);
            if collection.len() >= size {
                ctx.update_node_data("collection", json!([]));
                return Ok(Value::Array(collection));
            }
            ctx.update_node_data("collection", Value::Array(collection));
            return Ok(Value::Null);
        }

        ctx.update_node_data("collection", Value::Array(collection.clone()));
        Ok(Value::Array(collection))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes::testing::context;
    use crate::result::StandardResult;

    /// Apply the recorded update the way the orchestrator would.
    async fn collect(node: &mut Node, value: Value) -> StandardResult {
        let mut ctx = context();
        let input = NodeInput::new().with("src", StandardResult::success("src", value));
        let r = CollectorNode.execute(node, &input, &mut ctx).await;
        for (field, v) in ctx.data_updates() {
            node.set_field(field, v.clone());
        }
        r
    }

    #[tokio::test]
    async fn test_batching() {
        let mut node = Node::new("c", NodeKind::Collector, json!({"batch": true, "batch_size": 2}));
        let first = collect(&mut node, json!("v1")).await;
        assert!(first.success);
        assert_eq!(first.response, Value::Null);

        let second = collect(&mut node, json!("v2")).await;
        assert_eq!(second.response, json!(["v1", "v2"]));
        assert_eq!(node.data["collection"], json!([]));

        let third = collect(&mut node, json!("v3")).await;
        assert!(third.success);
        assert_eq!(third.response, Value::Null);
    }

    #[tokio::test]
    async fn test_unique_and_path() {
        let mut node = Node::new("c", NodeKind::Collector, json!({"unique": true, "path": "src.response.id"}));
        collect(&mut node, json!({"id": 1})).await;
        collect(&mut node, json!({"id": 2})).await;
        let r = collect(&mut node, json!({"id": 1})).await;
        assert_eq!(r.response, json!([1, 2]));
    }

    #[tokio::test]
    async fn test_template_value() {
        let mut node = Node::new("c", NodeKind::Collector, json!({"template": "#{{src.response.n}}"}));
        let r = collect(&mut node, json!({"n": 9})).await;
        assert_eq!(r.response, json!(["#9"]));
    }
}
