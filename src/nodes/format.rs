use async_trait::async_trait;
use handlebars::{Handlebars, handlebars_helper};
use once_cell::sync::Lazy;
use regex::Regex;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::debug;

use crate::graph::{Node, NodeKind};
use crate::node::{NodeContext, NodeError, NodeExecutor, NodeInput};
use crate::template::{TemplateError, stringify};
use crate::util::{decode_html_entities, xml_to_json};

use super::{config, required};

static ENV_SIGIL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{\s*\$([A-Za-z_][A-Za-z0-9_]*)\s*\}\}").expect("env sigil regex is valid"));

handlebars_helper!(json_helper: |v: Json| serde_json::to_string(v).unwrap_or_default());

#[derive(Debug, Clone, Copy, Default, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum FormatType {
    #[default]
    Text,
    Json,
    Xml,
}

/// Renders a Handlebars template over the upstream results.
///
/// The render context holds every live source id (its full result), plus
/// `sourceData` (responses by source id), `inputData` (first live response),
/// `data` (this node's config) and `raw` (first live result).
#[derive(Debug, Clone, Default, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FormatConfig {
    #[serde(default)]
    pub template: Option<String>,
    #[serde(default)]
    pub format_type: FormatType,
}

pub struct FormatNode {
    hbs: Handlebars<'static>,
}

impl FormatNode {
    pub fn new() -> Self {
        let mut hbs = Handlebars::new();
        hbs.register_helper("json", Box::new(json_helper));
        Self { hbs }
    }
}

impl Default for FormatNode {
    fn default() -> Self {
        Self::new()
    }
}

/// Replace `{{$NAME}}` before Handlebars sees the template.
fn expand_environment(template: &str, ctx: &NodeContext) -> Result<String, TemplateError> {
    let mut out = String::with_capacity(template.len());
    let mut last = 0;
    for caps in ENV_SIGIL_RE.captures_iter(template) {
        let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let value = ctx
            .environment()
            .get(name.as_str())
            .ok_or_else(|| TemplateError::MissingVariable(name.as_str().to_string()))?;
        out.push_str(&template[last..whole.start()]);
        out.push_str(&stringify(value));
        last = whole.end();
    }
    out.push_str(&template[last..]);
    Ok(out)
}

fn render_context(node: &Node, input: &NodeInput) -> Value {
    let mut data = Map::new();
    let mut source_data = Map::new();
    for (id, result) in input.live() {
        data.insert(id.clone(), result.to_json());
        source_data.insert(id.clone(), result.response.clone());
    }
    let first = input.first_live();
    data.insert("sourceData".into(), Value::Object(source_data));
    data.insert(
        "inputData".into(),
        first.map(|r| r.response.clone()).unwrap_or(Value::Null),
    );
    data.insert("data".into(), node.data.clone());
    data.insert("raw".into(), first.map(|r| r.to_json()).unwrap_or(Value::Null));
    Value::Object(data)
}

#[async_trait]
impl NodeExecutor for FormatNode {
    fn kind(&self) -> NodeKind {
        NodeKind::Format
    }

    #[tracing::instrument(name = "format_node", skip_all, fields(node_id = %node.id))]
    async fn run(&self, node: &Node, input: &NodeInput, ctx: &mut NodeContext) -> Result<Value, NodeError> {
        let cfg: FormatConfig = config(node)?;
        let template = expand_environment(required(&cfg.template, "template")?, ctx)?;

        let rendered = self
            .hbs
            .render_template(&template, &render_context(node, input))
            .map_err(|e| TemplateError::Render(e.to_string()))?;
        let text = decode_html_entities(&rendered);

        Ok(match cfg.format_type {
            FormatType::Text => Value::String(text),
            FormatType::Json => serde_json::from_str(&text).unwrap_or_else(|e| {
                debug!(error = %e, "format output is not JSON; returning text");
                Value::String(text)
            }),
            FormatType::Xml => xml_to_json(&text).unwrap_or_else(|e| {
                debug!(error = %e, "format output is not XML; returning text");
                Value::String(text)
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use crate::environment::Environment;
    use crate::capability::Capabilities;
    use crate::nodes::testing::{context, context_with};
    use crate::result::StandardResult;

    fn input() -> NodeInput {
        NodeInput::new().with(
            "A",
            StandardResult::success("A", json!({"status": 200, "data": {"value": 42, "name": "Tom & Jerry"}})),
        )
    }

    async fn run(data: Value, ctx: &mut NodeContext) -> StandardResult {
        FormatNode::new()
            .execute(&Node::new("B", NodeKind::Format, data), &input(), ctx)
            .await
    }

    #[tokio::test]
    async fn test_renders_upstream_value() {
        let r = run(json!({"template": "{{A.response.data.value}}"}), &mut context()).await;
        assert_eq!(r.response, json!("42"));
    }

    #[tokio::test]
    async fn test_entities_are_decoded() {
        let r = run(json!({"template": "{{inputData.data.name}}"}), &mut context()).await;
        assert_eq!(r.response, json!("Tom & Jerry"));
    }

    #[tokio::test]
    async fn test_literal_ampersand_keeps_decoding() {
        let r = run(json!({"template": "Q&A: {{inputData.data.name}} <{{A.response.status}}>"}), &mut context()).await;
        assert_eq!(r.response, json!("Q&A: Tom & Jerry <200>"));
    }

    #[tokio::test]
    async fn test_json_output_and_fallback() {
        let r = run(
            json!({"template": "{\"v\": {{A.response.data.value}}, \"d\": {{json sourceData.A.data}} }", "formatType": "json"}),
            &mut context(),
        )
        .await;
        assert_eq!(r.response, json!({"v": 42, "d": {"value": 42, "name": "Tom & Jerry"}}));

        let r = run(json!({"template": "not json", "formatType": "json"}), &mut context()).await;
        assert_eq!(r.response, json!("not json"));
    }

    #[tokio::test]
    async fn test_xml_output() {
        let r = run(
            json!({"template": "<v>{{A.response.data.value}}</v>", "formatType": "xml"}),
            &mut context(),
        )
        .await;
        assert_eq!(r.response, json!({"v": "42"}));
    }

    #[tokio::test]
    async fn test_environment_sigil() {
        let env = Environment::new().with_variable("WHO", json!("ops"));
        let mut ctx = context_with(Capabilities::headless(std::time::Duration::from_secs(1)), env);
        let r = run(json!({"template": "hi {{ $WHO }}"}), &mut ctx).await;
        assert_eq!(r.response, json!("hi ops"));

        let r = run(json!({"template": "hi {{$NOBODY}}"}), &mut context()).await;
        assert!(!r.success);
    }

    #[tokio::test]
    async fn test_template_required() {
        let r = run(json!({}), &mut context()).await;
        assert_eq!(r.error.as_deref(), Some("configuration error: `template` is required"));
    }
}
