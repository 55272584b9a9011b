use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::graph::{Node, NodeKind};
use crate::node::{NodeContext, NodeError, NodeExecutor, NodeInput};
use crate::template::stringify;
use crate::util::as_number;

use super::{config, resolve_operand};

pub const ELSE_OUTPUT: &str = "output-else";

/// Output handle of the condition at `index` (0-based).
pub fn output_handle(index: usize) -> String {
    format!("output-{}", index + 1)
}

#[derive(Debug, Clone, Default, Deserialize, JsonSchema)]
pub struct ConditionalConfig {
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct Condition {
    #[serde(default)]
    pub field: Value,
    pub operator: String,
    #[serde(default)]
    pub value: Value,
}

/// Compare two operands. Unknown operators are a config error.
pub fn compare(operator: &str, left: &Value, right: &Value) -> Result<bool, NodeError> {
    let numbers = || as_number(left).zip(as_number(right));
    Ok(match operator.trim() {
        "==" => loose_eq(left, right),
        "!=" => !loose_eq(left, right),
        ">=" => numbers().is_some_and(|(l, r)| l >= r),
        "<=" => numbers().is_some_and(|(l, r)| l <= r),
        ">" => numbers().is_some_and(|(l, r)| l > r),
        "<" => numbers().is_some_and(|(l, r)| l < r),
        "contains" => stringify(left).contains(&stringify(right)),
        "not_contains" => !stringify(left).contains(&stringify(right)),
        other => return Err(NodeError::Config(format!("unknown operator `{other}`"))),
    })
}

/// Numeric equality when both sides read as numbers, text equality otherwise.
pub fn loose_eq(left: &Value, right: &Value) -> bool {
    match (as_number(left), as_number(right)) {
        (Some(l), Some(r)) if !left.is_boolean() && !right.is_boolean() => l == r,
        _ => left == right || stringify(left) == stringify(right),
    }
}

/// Picks the first matching condition's output handle, or `output-else`.
pub struct ConditionalNode;

#[async_trait]
impl NodeExecutor for ConditionalNode {
    fn kind(&self) -> NodeKind {
        NodeKind::Conditional
    }

    #[tracing::instrument(name = "conditional_node", skip_all, fields(node_id = %node.id))]
    async fn run(&self, node: &Node, input: &NodeInput, ctx: &mut NodeContext) -> Result<Value, NodeError> {
        let cfg: ConditionalConfig = config(node)?;
        let context = input.context();

        let mut matched = None;
        for (index, condition) in cfg.conditions.iter().enumerate() {
            let field = resolve_operand(&condition.field, &context, ctx);
            let value = resolve_operand(&condition.value, &context, ctx);
            if compare(&condition.operator, &field, &value)? {
                matched = Some(index);
                break;
            }
        }

        let output_path = matched.map(output_handle).unwrap_or_else(|| ELSE_OUTPUT.to_string());
        tracing::debug!(%output_path, "condition evaluated");

        Ok(json!({
            "outputPath": output_path,
            "matchedIndex": matched,
            "data": input.first_live().map(|r| r.response.clone()).unwrap_or(Value::Null),
        }))
    }
}
