use std::path::PathBuf;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::capability::CommandOptions;
use crate::graph::{Node, NodeKind};
use crate::node::{NodeContext, NodeError, NodeExecutor, NodeInput};

use super::{KeyValues, config, lenient_opt_u64, required};

#[derive(Debug, Clone, Default, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CommandConfig {
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub working_directory: Option<String>,
    #[serde(default)]
    pub env: KeyValues,
    #[serde(default, deserialize_with = "lenient_opt_u64")]
    pub timeout: Option<u64>,
}

pub struct CommandNode;

#[async_trait]
impl NodeExecutor for CommandNode {
    fn kind(&self) -> NodeKind {
        NodeKind::Command
    }

    #[tracing::instrument(name = "command_node", skip_all, fields(node_id = %node.id))]
    async fn run(&self, node: &Node, input: &NodeInput, ctx: &mut NodeContext) -> Result<Value, NodeError> {
        let cfg: CommandConfig = config(node)?;
        let context = input.context();

        let command = ctx.render(required(&cfg.command, "command")?, &context)?;
        let working_directory = match cfg.working_directory.as_deref().filter(|d| !d.trim().is_empty()) {
            Some(dir) => Some(PathBuf::from(ctx.render(dir, &context)?)),
            None => None,
        };
        let options = CommandOptions {
            working_directory,
            env: cfg.env.render(&context, ctx)?,
            timeout_ms: cfg.timeout,
        };

        ctx.check_cancelled()?;
        let runner = ctx.capabilities().command.clone();
        let out = runner.execute(&command, options).await?;

        Ok(json!({
            "output": out.output.trim_end(),
            "stderr": out.stderr,
            "exitCode": out.exit_code,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes::testing::context;
    use crate::result::StandardResult;

    #[tokio::test]
    async fn test_runs_templated_command() {
        let node = Node::new(
            "cmd",
            NodeKind::Command,
            json!({"command": "echo {{src.response.word}} $SUFFIX", "env": {"SUFFIX": "!"}}),
        );
        let input = NodeInput::new().with("src", StandardResult::success("src", json!({"word": "hello"})));
        let r = CommandNode.execute(&node, &input, &mut context()).await;
        assert!(r.success, "{:?}", r.error);
        assert_eq!(r.response["output"], json!("hello !"));
        assert_eq!(r.response["exitCode"], json!(0));
    }

    #[tokio::test]
    async fn test_failing_command() {
        let node = Node::new("cmd", NodeKind::Command, json!({"command": "exit 2"}));
        let r = CommandNode.execute(&node, &NodeInput::new(), &mut context()).await;
        assert!(!r.success);
        assert!(r.error.unwrap().starts_with("command exited with 2"));
    }
}
