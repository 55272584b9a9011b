use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::graph::{Node, NodeKind};
use crate::node::{NodeContext, NodeError, NodeExecutor, NodeInput};

use super::{config, lenient_i64};

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct CounterConfig {
    #[serde(default, deserialize_with = "lenient_i64")]
    pub incrementor: i64,
    /// `0` means unbounded.
    #[serde(default, deserialize_with = "lenient_i64")]
    pub limit: i64,
    #[serde(default = "default_step", deserialize_with = "lenient_i64")]
    pub step: i64,
}

fn default_step() -> i64 {
    1
}

/// Increments the persisted `incrementor` field on every call.
pub struct CounterNode;

#[async_trait]
impl NodeExecutor for CounterNode {
    fn kind(&self) -> NodeKind {
        NodeKind::Counter
    }

    async fn run(&self, node: &Node, _input: &NodeInput, ctx: &mut NodeContext) -> Result<Value, NodeError> {
        let cfg: CounterConfig = config(node)?;

        if cfg.limit != 0 && cfg.incrementor >= cfg.limit {
            return Err(NodeError::LimitReached(format!(
                "counter is at {} of {}",
                cfg.incrementor, cfg.limit
            )));
        }

        let count = cfg.incrementor + cfg.step;
        ctx.update_node_data("incrementor", json!(count));
        Ok(json!({
            "count": count,
            "previous": cfg.incrementor,
            "limit": cfg.limit,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes::testing::context;

    #[tokio::test]
    async fn test_increments_and_records_update() {
        let mut ctx = context();
        let node = Node::new("c", NodeKind::Counter, json!({"incrementor": "2", "limit": 5}));
        let r = CounterNode.execute(&node, &NodeInput::new(), &mut ctx).await;
        assert_eq!(r.response["count"], json!(3));
        assert_eq!(ctx.data_updates(), &[("incrementor".to_string(), json!(3))]);
    }

    #[tokio::test]
    async fn test_limit_reached_makes_no_update() {
        let mut ctx = context();
        let node = Node::new("c", NodeKind::Counter, json!({"incrementor": 5, "limit": 5}));
        let r = CounterNode.execute(&node, &NodeInput::new(), &mut ctx).await;
        assert!(!r.success);
        assert_eq!(r.error.as_deref(), Some("limit reached: counter is at 5 of 5"));
        assert!(ctx.data_updates().is_empty());
    }

    #[tokio::test]
    async fn test_zero_limit_is_unbounded() {
        let mut ctx = context();
        let node = Node::new("c", NodeKind::Counter, json!({"incrementor": 100}));
        let r = CounterNode.execute(&node, &NodeInput::new(), &mut ctx).await;
        assert_eq!(r.response["count"], json!(101));
    }
}
