use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::graph::{Node, NodeKind};
use crate::node::{NodeContext, NodeError, NodeExecutor, NodeInput};
use crate::template::{self, TemplateError, stringify};
use crate::util::xml_to_json;

use super::config;

#[derive(Debug, Clone, Copy, Default, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum ParseFormat {
    #[default]
    Json,
    Xml,
    Lines,
    Csv,
}

#[derive(Debug, Clone, Default, Deserialize, JsonSchema)]
pub struct ParserConfig {
    #[serde(default)]
    pub format: ParseFormat,
    /// Source node id; defaults to the first live input.
    #[serde(default)]
    pub source: Option<String>,
    /// Path applied to the parsed value.
    #[serde(default)]
    pub path: Option<String>,
    /// CSV field separator, a single character (default `,`). Fields may be
    /// wrapped in double quotes; quoted fields do not span lines.
    #[serde(default)]
    pub delimiter: Option<String>,
}

/// Parses an upstream response into structured data.
pub struct ParserNode;

fn text_of(value: &Value) -> String {
    match value {
        Value::Object(map) => map.get("data").map(stringify).unwrap_or_else(|| stringify(value)),
        other => stringify(other),
    }
}

fn split_record(line: &str, delimiter: char) -> Vec<String> {
    let mut fields = Vec::new();
    let mut field = String::new();
    let mut quoted = false;
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '"' if quoted && chars.peek() == Some(&'"') => {
                field.push('"');
                chars.next();
            }
            '"' if quoted => quoted = false,
            '"' if field.trim().is_empty() => {
                field.clear();
                quoted = true;
            }
            c if c == delimiter && !quoted => fields.push(std::mem::take(&mut field).trim().to_string()),
            c => field.push(c),
        }
    }
    fields.push(field.trim().to_string());
    fields
}

fn parse_csv(text: &str, delimiter: char) -> Value {
    let mut rows = text
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| split_record(l, delimiter));
    let Some(header) = rows.next() else {
        return Value::Array(Vec::new());
    };
    Value::Array(
        rows.map(|row| {
            let obj: Map<String, Value> = header
                .iter()
                .enumerate()
                .map(|(i, h)| (h.clone(), Value::String(row.get(i).cloned().unwrap_or_default())))
                .collect();
            Value::Object(obj)
        })
        .collect(),
    )
}

fn csv_delimiter(raw: Option<&str>) -> Result<char, NodeError> {
    let Some(raw) = raw else {
        return Ok(',');
    };
    let mut chars = raw.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) => Ok(c),
        _ => Err(NodeError::Config(format!("`delimiter` must be one character, got {raw:?}"))),
    }
}

#[async_trait]
impl NodeExecutor for ParserNode {
    fn kind(&self) -> NodeKind {
        NodeKind::Parser
    }

    async fn run(&self, node: &Node, input: &NodeInput, _ctx: &mut NodeContext) -> Result<Value, NodeError> {
        let cfg: ParserConfig = config(node)?;
        let source = match cfg.source.as_deref().filter(|s| !s.is_empty()) {
            Some(id) => input.get(id).ok_or_else(|| TemplateError::MissingSource(id.to_string()))?,
            None => input
                .first_live()
                .ok_or_else(|| NodeError::Config("parser needs an input".into()))?,
        };
        let raw = &source.response;

        let parsed = match cfg.format {
            ParseFormat::Json => match raw {
                Value::String(s) => serde_json::from_str(s).map_err(|e| NodeError::Parse(e.to_string()))?,
                Value::Object(map) => match map.get("data") {
                    Some(Value::String(s)) => serde_json::from_str(s).map_err(|e| NodeError::Parse(e.to_string()))?,
                    _ => raw.clone(),
                },
                other => other.clone(),
            },
            ParseFormat::Xml => xml_to_json(&text_of(raw)).map_err(NodeError::Parse)?,
            ParseFormat::Lines => Value::Array(
                text_of(raw)
                    .lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty())
                    .map(|l| Value::String(l.to_string()))
                    .collect(),
            ),
            ParseFormat::Csv => parse_csv(&text_of(raw), csv_delimiter(cfg.delimiter.as_deref())?),
        };

        match cfg.path.as_deref().map(str::trim).filter(|p| !p.is_empty()) {
            Some(path) => template::evaluate(path, &parsed).map_err(|source| {
                NodeError::Template(TemplateError::Path {
                    expression: path.to_string(),
                    source,
                })
            }),
            None => Ok(parsed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes::testing::context;
    use crate::result::StandardResult;
    use serde_json::json;

    async fn parse(data: Value, response: Value) -> StandardResult {
        let input = NodeInput::new().with("src", StandardResult::success("src", response));
        ParserNode
            .execute(&Node::new("p", NodeKind::Parser, data), &input, &mut context())
            .await
    }

    #[tokio::test]
    async fn test_json_with_path() {
        let r = parse(json!({"path": "users[0].name"}), json!("{\"users\": [{\"name\": \"ann\"}]}")).await;
        assert_eq!(r.response, json!("ann"));
    }

    #[tokio::test]
    async fn test_http_body_xml_and_lines() {
        let r = parse(json!({"format": "xml"}), json!({"status": 200, "data": "<a><b>1</b></a>"})).await;
        assert_eq!(r.response, json!({"a": {"b": "1"}}));

        let r = parse(json!({"format": "lines"}), json!("x\n\n y \n")).await;
        assert_eq!(r.response, json!(["x", "y"]));
    }

    #[tokio::test]
    async fn test_csv() {
        let r = parse(json!({"format": "csv"}), json!("name,age\nann,3\nbob,4")).await;
        assert_eq!(r.response, json!([{"name": "ann", "age": "3"}, {"name": "bob", "age": "4"}]));
    }

    #[tokio::test]
    async fn test_csv_quoted_fields() {
        let r = parse(
            json!({"format": "csv"}),
            json!("name,age,note\n\"Smith, John\",42,\"says \"\"hi\"\"\"\n"),
        )
        .await;
        assert_eq!(r.response, json!([{"name": "Smith, John", "age": "42", "note": "says \"hi\""}]));

        let r = parse(json!({"format": "csv", "delimiter": ";"}), json!("a;b\n\"x;y\";z")).await;
        assert_eq!(r.response, json!([{"a": "x;y", "b": "z"}]));
    }

    #[tokio::test]
    async fn test_csv_rejects_bad_delimiter() {
        let r = parse(json!({"format": "csv", "delimiter": ""}), json!("a,b\n1,2")).await;
        assert!(!r.success);
        assert!(r.error.unwrap().starts_with("configuration error"));

        let r = parse(json!({"format": "csv", "delimiter": "::"}), json!("a,b\n1,2")).await;
        assert!(!r.success);
    }

    #[tokio::test]
    async fn test_invalid_json_fails() {
        let r = parse(json!({}), json!("{oops")).await;
        assert!(r.error.unwrap().starts_with("parse error"));
    }
}
