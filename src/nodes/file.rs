use std::path::PathBuf;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::io::AsyncWriteExt;

use crate::graph::{Node, NodeKind};
use crate::node::{NodeContext, NodeError, NodeExecutor, NodeInput};
use crate::template::stringify;

use super::{config, required};

#[derive(Debug, Clone, Copy, Default, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum FileOperation {
    #[default]
    Read,
    Write,
    Append,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum FileFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Default, Deserialize, JsonSchema)]
pub struct FileConfig {
    #[serde(default)]
    pub operation: FileOperation,
    #[serde(default)]
    pub path: Option<String>,
    /// Content to write; defaults to the first live input's response.
    #[serde(default)]
    pub content: Option<Value>,
    #[serde(default)]
    pub format: FileFormat,
}

pub struct FileNode;

impl FileNode {
    fn content(cfg: &FileConfig, input: &NodeInput, ctx: &NodeContext) -> Result<String, NodeError> {
        let context = input.context();
        let value = match &cfg.content {
            Some(Value::String(s)) => Value::String(ctx.render(s, &context)?),
            Some(other) => ctx.render_value(other, &context)?,
            None => input.first_live().map(|r| r.response.clone()).unwrap_or(Value::Null),
        };
        Ok(match (cfg.format, &value) {
            (FileFormat::Json, Value::String(s)) => match serde_json::from_str::<Value>(s) {
                Ok(parsed) => serde_json::to_string_pretty(&parsed).map_err(|e| NodeError::Parse(e.to_string()))?,
                Err(_) => serde_json::to_string(s).map_err(|e| NodeError::Parse(e.to_string()))?,
            },
            (FileFormat::Json, v) => serde_json::to_string_pretty(v).map_err(|e| NodeError::Parse(e.to_string()))?,
            (FileFormat::Text, v) => stringify(v),
        })
    }
}

#[async_trait]
impl NodeExecutor for FileNode {
    fn kind(&self) -> NodeKind {
        NodeKind::File
    }

    #[tracing::instrument(name = "file_node", skip_all, fields(node_id = %node.id))]
    async fn run(&self, node: &Node, input: &NodeInput, ctx: &mut NodeContext) -> Result<Value, NodeError> {
        let cfg: FileConfig = config(node)?;
        let path = PathBuf::from(ctx.render(required(&cfg.path, "path")?, &input.context())?);
        ctx.check_cancelled()?;

        match cfg.operation {
            FileOperation::Read => {
                let text = tokio::fs::read_to_string(&path).await?;
                let content = match cfg.format {
                    FileFormat::Json => serde_json::from_str(&text)
                        .map_err(|e| NodeError::Parse(format!("{}: {e}", path.display())))?,
                    FileFormat::Text => Value::String(text),
                };
                Ok(json!({"path": path.display().to_string(), "content": content}))
            }
            FileOperation::Write | FileOperation::Append => {
                let content = Self::content(&cfg, input, ctx)?;
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    tokio::fs::create_dir_all(parent).await?;
                }
                let mut file = tokio::fs::OpenOptions::new()
                    .create(true)
                    .write(true)
                    .append(cfg.operation == FileOperation::Append)
                    .truncate(cfg.operation == FileOperation::Write)
                    .open(&path)
                    .await?;
                file.write_all(content.as_bytes()).await?;
                file.flush().await?;
                Ok(json!({"path": path.display().to_string(), "bytesWritten": content.len()}))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes::testing::context;
    use crate::result::StandardResult;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_write_append_read() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out").join("log.txt");
        let p = path.display().to_string();
        let input = NodeInput::new().with("src", StandardResult::success("src", json!({"line": "one"})));

        let write = Node::new("f", NodeKind::File, json!({"operation": "write", "path": p, "content": "{{src.response.line}}\n"}));
        let r = FileNode.execute(&write, &input, &mut context()).await;
        assert!(r.success, "{:?}", r.error);
        assert_eq!(r.response["bytesWritten"], json!(4));

        let append = Node::new("f", NodeKind::File, json!({"operation": "append", "path": p, "content": "two\n"}));
        FileNode.execute(&append, &input, &mut context()).await;

        let read = Node::new("f", NodeKind::File, json!({"path": p}));
        let r = FileNode.execute(&read, &input, &mut context()).await;
        assert_eq!(r.response["content"], json!("one\ntwo\n"));
    }

    #[tokio::test]
    async fn test_json_round_trip_from_input() {
        let dir = tempdir().unwrap();
        let p = dir.path().join("data.json").display().to_string();
        let input = NodeInput::new().with("src", StandardResult::success("src", json!({"a": [1, 2]})));

        let write = Node::new("f", NodeKind::File, json!({"operation": "write", "path": p, "format": "json"}));
        FileNode.execute(&write, &input, &mut context()).await;

        let read = Node::new("f", NodeKind::File, json!({"path": p, "format": "json"}));
        let r = FileNode.execute(&read, &NodeInput::new(), &mut context()).await;
        assert_eq!(r.response["content"], json!({"a": [1, 2]}));
    }

    #[tokio::test]
    async fn test_missing_file_fails() {
        let dir = tempdir().unwrap();
        let p = dir.path().join("nope.txt").display().to_string();
        let r = FileNode
            .execute(&Node::new("f", NodeKind::File, json!({"path": p})), &NodeInput::new(), &mut context())
            .await;
        assert!(r.error.unwrap().starts_with("I/O error"));
    }
}
