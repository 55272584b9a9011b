//! `{{ ... }}` template expansion over upstream node outputs.
//!
//! An expression is either `$NAME` (environment variable) or
//! `<nodeId>.<path>`, where the path is resolved with [`path::evaluate`]
//! against the context entry for `nodeId`.

pub mod path;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::environment::Environment;
pub use path::{PathError, evaluate};

static TEMPLATE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{\s*([^{}]*?)\s*\}\}").expect("template regex is valid"));

/// Map from source node id (or a synthetic key such as `response`) to a JSON value.
pub type TemplateContext = Map<String, Value>;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum TemplateError {
    #[error("environment variable `{0}` is not set; configure it in the active environment")]
    MissingVariable(String),

    #[error("no input from `{0}` is available to this node")]
    MissingSource(String),

    #[error("cannot resolve `{expression}`: {source}")]
    Path {
        expression: String,
        #[source]
        source: PathError,
    },

    #[error("empty template expression")]
    EmptyExpression,

    #[error("template render error: {0}")]
    Render(String),
}

/// True if `text` contains at least one `{{ ... }}` expression.
pub fn has_template(text: &str) -> bool {
    TEMPLATE_RE.is_match(text)
}

/// Resolve a single expression (the part between the braces).
pub fn evaluate_expression(
    expression: &str,
    context: &TemplateContext,
    environment: &Environment,
) -> Result<Value, TemplateError> {
    let expression = expression.trim();
    if expression.is_empty() {
        return Err(TemplateError::EmptyExpression);
    }

    if let Some(name) = expression.strip_prefix('$') {
        return environment
            .get(name.trim())
            .cloned()
            .ok_or_else(|| TemplateError::MissingVariable(name.trim().to_string()));
    }

    let (node_id, rest) = match expression.split_once('.') {
        Some((head, tail)) => (head, tail),
        None => (expression, ""),
    };
    let root = context
        .get(node_id)
        .ok_or_else(|| TemplateError::MissingSource(node_id.to_string()))?;

    path::evaluate(rest, root).map_err(|source| TemplateError::Path {
        expression: expression.to_string(),
        source,
    })
}

/// Expand every `{{ ... }}` in `template`. Each occurrence is resolved on its own
/// and spliced into the original text; objects and arrays are inserted as JSON.
pub fn evaluate_template(
    template: &str,
    context: &TemplateContext,
    environment: &Environment,
) -> Result<String, TemplateError> {
    let mut out = String::with_capacity(template.len());
    let mut last = 0;

    for caps in TEMPLATE_RE.captures_iter(template) {
        let (Some(whole), Some(expr)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        out.push_str(&template[last..whole.start()]);
        let value = evaluate_expression(expr.as_str(), context, environment)?;
        out.push_str(&stringify(&value));
        last = whole.end();
    }
    out.push_str(&template[last..]);
    Ok(out)
}

/// Expand templates inside every string of a JSON value, recursively.
pub fn evaluate_value(
    value: &Value,
    context: &TemplateContext,
    environment: &Environment,
) -> Result<Value, TemplateError> {
    Ok(match value {
        Value::String(s) if has_template(s) => {
            Value::String(evaluate_template(s, context, environment)?)
        }
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|v| evaluate_value(v, context, environment))
                .collect::<Result<_, _>>()?,
        ),
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), evaluate_value(v, context, environment)?);
            }
            Value::Object(out)
        }
        other => other.clone(),
    })
}

/// Text form used when a value is spliced into a template.
pub fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx(value: Value) -> TemplateContext {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_substitutes_node_paths() {
        let context = ctx(json!({"node1": {"name": "World"}}));
        let out = evaluate_template("Hello {{node1.name}}", &context, &Environment::new()).unwrap();
        assert_eq!(out, "Hello World");
    }

    #[test]
    fn test_environment_sigil() {
        let env = Environment::new().with_variable("API_KEY", json!("xyz"));
        let out = evaluate_template("{{$API_KEY}}", &TemplateContext::new(), &env).unwrap();
        assert_eq!(out, "xyz");
    }

    #[test]
    fn test_missing_environment_variable_fails() {
        let err = evaluate_template("{{ $NOPE }}", &TemplateContext::new(), &Environment::new())
            .unwrap_err();
        assert_eq!(err, TemplateError::MissingVariable("NOPE".into()));
    }

    #[test]
    fn test_objects_are_inserted_as_json() {
        let context = ctx(json!({"a": {"obj": {"k": 1}, "list": [1, 2]}}));
        let out = evaluate_template("{{a.obj}} {{ a.list }}", &context, &Environment::new()).unwrap();
        assert_eq!(out, r#"{"k":1} [1,2]"#);
    }

    #[test]
    fn test_repeated_expressions_each_replaced() {
        let context = ctx(json!({"a": {"x": 7}}));
        let out = evaluate_template("{{a.x}}+{{a.x}}", &context, &Environment::new()).unwrap();
        assert_eq!(out, "7+7");
    }

    #[test]
    fn test_whole_source_without_path() {
        let context = ctx(json!({"item": "apple"}));
        let out = evaluate_template("fruit: {{item}}", &context, &Environment::new()).unwrap();
        assert_eq!(out, "fruit: apple");
    }

    #[test]
    fn test_unknown_source_and_bad_path() {
        let context = ctx(json!({"a": {"x": 1}}));
        assert_eq!(
            evaluate_template("{{b.x}}", &context, &Environment::new()).unwrap_err(),
            TemplateError::MissingSource("b".into())
        );
        assert!(matches!(
            evaluate_template("{{a.y}}", &context, &Environment::new()).unwrap_err(),
            TemplateError::Path { .. }
        ));
    }

    #[test]
    fn test_evaluate_value_walks_nested_strings() {
        let context = ctx(json!({"a": {"id": 5}}));
        let body = json!({"user": "{{a.id}}", "tags": ["t-{{a.id}}", 3]});
        let out = evaluate_value(&body, &context, &Environment::new()).unwrap();
        assert_eq!(out, json!({"user": "5", "tags": ["t-5", 3]}));
    }

    #[test]
    fn test_text_without_templates_is_untouched() {
        let out = evaluate_template("plain {text}", &TemplateContext::new(), &Environment::new()).unwrap();
        assert_eq!(out, "plain {text}");
        assert!(!has_template("plain {text}"));
    }
}
