//! Built-in executors, one module per node type.
//!
//! Each executor deserializes `node.data` into its own config struct; a config
//! that does not deserialize fails the node with [`NodeError::Config`].

pub mod collector;
pub mod command;
pub mod conditional;
pub mod counter;
pub mod database;
pub mod file;
pub mod format;
pub mod http;
pub mod iterator;
pub mod parser;
pub mod prompt;
pub mod rss;
pub mod test_node;
pub mod text_display;

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::de::{self, DeserializeOwned, Deserializer};
use serde::Deserialize;
use serde_json::Value;

use crate::graph::Node;
use crate::node::{NodeContext, NodeError, NodeExecutor};
use crate::template::{self, TemplateContext};

pub use collector::CollectorNode;
pub use command::CommandNode;
pub use conditional::ConditionalNode;
pub use counter::CounterNode;
pub use database::DatabaseQueryNode;
pub use file::FileNode;
pub use format::FormatNode;
pub use http::HttpNode;
pub use iterator::IteratorNode;
pub use parser::ParserNode;
pub use prompt::PromptNode;
pub use rss::RssNode;
pub use test_node::TestNode;
pub use text_display::TextDisplayNode;

pub fn builtin_executors() -> Vec<Arc<dyn NodeExecutor>> {
    vec![
        Arc::new(HttpNode),
        Arc::new(FormatNode::new()),
        Arc::new(FileNode),
        Arc::new(ParserNode),
        Arc::new(ConditionalNode),
        Arc::new(IteratorNode),
        Arc::new(TestNode),
        Arc::new(CommandNode),
        Arc::new(DatabaseQueryNode),
        Arc::new(RssNode),
        Arc::new(PromptNode),
        Arc::new(CounterNode),
        Arc::new(TextDisplayNode),
        Arc::new(CollectorNode),
    ]
}

/// Deserialize `node.data` into a typed config.
pub(crate) fn config<T: DeserializeOwned>(node: &Node) -> Result<T, NodeError> {
    let data = match &node.data {
        Value::Null => Value::Object(Default::default()),
        other => other.clone(),
    };
    serde_json::from_value(data)
        .map_err(|e| NodeError::Config(format!("invalid {} config: {e}", node.kind)))
}

/// A required string setting; empty counts as missing.
pub(crate) fn required<'a>(value: &'a Option<String>, name: &str) -> Result<&'a str, NodeError> {
    match value.as_deref().map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(NodeError::Config(format!("`{name}` is required"))),
    }
}

/// Resolve an operand: `{{...}}` templates are expanded, bare `<node>.<path>`
/// strings are evaluated, and anything that fails to resolve is kept literally.
pub(crate) fn resolve_operand(value: &Value, context: &TemplateContext, ctx: &NodeContext) -> Value {
    let Value::String(text) = value else {
        return value.clone();
    };
    if template::has_template(text) {
        return match ctx.render(text, context) {
            Ok(rendered) => Value::String(rendered),
            Err(_) => value.clone(),
        };
    }
    if text.contains('.') || text.starts_with('$') {
        if let Ok(found) = template::evaluate_expression(text, context, ctx.environment()) {
            return found;
        }
    }
    value.clone()
}

/// Key/value settings given either as an object or as `[{key, value}]` pairs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KeyValues(pub BTreeMap<String, String>);

impl<'de> Deserialize<'de> for KeyValues {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        struct Pair {
            key: String,
            #[serde(default)]
            value: Value,
        }

        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Map(BTreeMap<String, Value>),
            Pairs(Vec<Pair>),
            Null(()),
        }

        let map = match Repr::deserialize(deserializer)? {
            Repr::Map(map) => map,
            Repr::Pairs(pairs) => pairs
                .into_iter()
                .filter(|p| !p.key.trim().is_empty())
                .map(|p| (p.key, p.value))
                .collect(),
            Repr::Null(()) => BTreeMap::new(),
        };
        map.into_iter()
            .map(|(k, v)| match v {
                Value::String(s) => Ok((k, s)),
                Value::Number(_) | Value::Bool(_) => Ok((k, v.to_string())),
                Value::Null => Ok((k, String::new())),
                _ => Err(de::Error::custom(format!("value of `{k}` must be a scalar"))),
            })
            .collect::<Result<_, _>>()
            .map(KeyValues)
    }
}

impl schemars::JsonSchema for KeyValues {
    fn schema_name() -> std::borrow::Cow<'static, str> {
        "KeyValues".into()
    }

    fn json_schema(generator: &mut schemars::SchemaGenerator) -> schemars::Schema {
        generator.subschema_for::<BTreeMap<String, String>>()
    }
}

impl KeyValues {
    pub fn render(&self, context: &TemplateContext, ctx: &NodeContext) -> Result<BTreeMap<String, String>, NodeError> {
        self.0
            .iter()
            .map(|(k, v)| Ok((k.clone(), ctx.render(v, context)?)))
            .collect()
    }
}

/// Accept a number or a numeric string.
pub(crate) fn lenient_i64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .ok_or_else(|| de::Error::custom("expected an integer")),
        Value::String(s) if s.trim().is_empty() => Ok(0),
        Value::String(s) => s.trim().parse().map_err(de::Error::custom),
        Value::Null => Ok(0),
        other => Err(de::Error::custom(format!("expected an integer, got {other}"))),
    }
}

pub(crate) fn lenient_opt_u64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u64>, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::Null => Ok(None),
        Value::Number(n) => Ok(n.as_u64()),
        Value::String(s) if s.trim().is_empty() => Ok(None),
        Value::String(s) => s.trim().parse().map(Some).map_err(de::Error::custom),
        other => Err(de::Error::custom(format!("expected a positive integer, got {other}"))),
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Arc;
    use std::time::Duration;

    use tokio_util::sync::CancellationToken;

    use crate::capability::Capabilities;
    use crate::environment::Environment;
    use crate::node::NodeContext;

    pub fn context() -> NodeContext {
        context_with(Capabilities::headless(Duration::from_secs(5)), Environment::new())
    }

    pub fn context_with(capabilities: Capabilities, environment: Environment) -> NodeContext {
        NodeContext::new("node", environment, Arc::new(capabilities), CancellationToken::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_key_values_accepts_both_shapes() {
        let a: KeyValues = serde_json::from_value(json!({"Accept": "json", "X-N": 3})).unwrap();
        let b: KeyValues =
            serde_json::from_value(json!([{"key": "Accept", "value": "json"}, {"key": "", "value": "x"}]))
                .unwrap();
        assert_eq!(a.0["X-N"], "3");
        assert_eq!(b.0.len(), 1);
        assert_eq!(b.0["Accept"], "json");
    }

    #[test]
    fn test_resolve_operand() {
        let ctx = testing::context();
        let context: TemplateContext = json!({"a": {"response": {"n": 4}}}).as_object().cloned().unwrap();
        assert_eq!(resolve_operand(&json!("a.response.n"), &context, &ctx), json!(4));
        assert_eq!(resolve_operand(&json!("{{a.response.n}}!"), &context, &ctx), json!("4!"));
        assert_eq!(resolve_operand(&json!("3.5"), &context, &ctx), json!("3.5"));
        assert_eq!(resolve_operand(&json!("plain"), &context, &ctx), json!("plain"));
        assert_eq!(resolve_operand(&json!(5), &context, &ctx), json!(5));
    }

    #[test]
    fn test_config_error_names_kind() {
        #[derive(Deserialize, Debug)]
        #[allow(dead_code)]
        struct C {
            n: u32,
        }
        let node = Node::new("x", crate::graph::NodeKind::Counter, json!({"n": "no"}));
        let err = config::<C>(&node).unwrap_err();
        assert!(err.to_string().starts_with("configuration error: invalid counter config"));
    }
}
