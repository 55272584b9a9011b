use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::graph::{Node, NodeKind};
use crate::node::{NodeContext, NodeError, NodeExecutor, NodeInput};
use crate::template::stringify;

use super::config;

#[derive(Debug, Clone, Default, Deserialize, JsonSchema)]
pub struct TextDisplayConfig {
    #[serde(default)]
    pub text: Option<String>,
}

/// Shows templated text, or the first live input when no text is configured.
pub struct TextDisplayNode;

#[async_trait]
impl NodeExecutor for TextDisplayNode {
    fn kind(&self) -> NodeKind {
        NodeKind::TextDisplay
    }

    async fn run(&self, node: &Node, input: &NodeInput, ctx: &mut NodeContext) -> Result<Value, NodeError> {
        let cfg: TextDisplayConfig = config(node)?;
        let text = match cfg.text.as_deref().filter(|t| !t.is_empty()) {
            Some(t) => ctx.render(t, &input.context())?,
            None => input
                .first_live()
                .map(|r| stringify(&r.response))
                .unwrap_or_default(),
        };
        Ok(json!({ "text": text }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes::testing::context;
    use crate::result::StandardResult;

    #[tokio::test]
    async fn test_text_and_fallback() {
        let input = NodeInput::new().with("a", StandardResult::success("a", json!({"n": 1})));

        let node = Node::new("t", NodeKind::TextDisplay, json!({"text": "n = {{a.response.n}}"}));
        let r = TextDisplayNode.execute(&node, &input, &mut context()).await;
        assert_eq!(r.response, json!({"text": "n = 1"}));

        let node = Node::new("t", NodeKind::TextDisplay, json!({}));
        let r = TextDisplayNode.execute(&node, &input, &mut context()).await;
        assert_eq!(r.response, json!({"text": "{\"n\":1}"}));
    }
}
