use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::graph::{Node, NodeKind};
use crate::node::{NodeContext, NodeError, NodeExecutor, NodeInput};
use crate::result::StandardResult;
use crate::template::{self, TemplateContext, stringify};
use crate::util::as_number;

use super::conditional::loose_eq;
use super::config;

#[derive(Debug, Clone, Copy, Default, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Target {
    Status,
    Headers,
    #[default]
    Body,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum Assertion {
    #[default]
    Equals,
    NotEquals,
    Contains,
    NotContains,
    GreaterThan,
    LessThan,
    Exists,
    NotExists,
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TestCase {
    #[serde(default)]
    pub name: Option<String>,
    /// Source node id; defaults to the first live input.
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default, rename = "type")]
    pub target: Target,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub operator: Assertion,
    #[serde(default)]
    pub expected: Value,
    #[serde(default)]
    pub stop_on_failure: bool,
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TestConfig {
    #[serde(default)]
    pub tests: Vec<TestCase>,
    #[serde(default = "default_true")]
    pub require_all: bool,
    #[serde(default = "default_true")]
    pub continue_on_failure: bool,
}

fn default_true() -> bool {
    true
}

/// Pull the value a case inspects out of a source result.
fn extract(case: &TestCase, source: &StandardResult) -> Value {
    let response = &source.response;
    let path = case.path.as_deref().map(str::trim).filter(|p| !p.is_empty());
    match case.target {
        Target::Status => response.get("status").cloned().unwrap_or(Value::Null),
        Target::Headers => {
            let headers = response.get("headers").cloned().unwrap_or(Value::Null);
            match (path, headers.as_object()) {
                (Some(name), Some(map)) => map
                    .iter()
                    .find(|(k, _)| k.eq_ignore_ascii_case(name))
                    .map(|(_, v)| v.clone())
                    .unwrap_or(Value::Null),
                _ => headers,
            }
        }
        Target::Body => {
            let body = response.get("data").unwrap_or(response);
            match path {
                Some(p) => template::evaluate(p, body).unwrap_or(Value::Null),
                None => body.clone(),
            }
        }
    }
}

pub fn check(assertion: Assertion, actual: &Value, expected: &Value) -> bool {
    match assertion {
        Assertion::Equals => loose_eq(actual, expected),
        Assertion::NotEquals => !loose_eq(actual, expected),
        Assertion::Contains => contains(actual, expected),
        Assertion::NotContains => !contains(actual, expected),
        Assertion::GreaterThan => as_number(actual).zip(as_number(expected)).is_some_and(|(a, e)| a > e),
        Assertion::LessThan => as_number(actual).zip(as_number(expected)).is_some_and(|(a, e)| a < e),
        Assertion::Exists => !actual.is_null(),
        Assertion::NotExists => actual.is_null(),
    }
}

fn contains(actual: &Value, expected: &Value) -> bool {
    match actual {
        Value::Array(items) => items.iter().any(|v| loose_eq(v, expected)),
        Value::Object(map) => match expected {
            Value::String(key) => map.contains_key(key),
            _ => false,
        },
        Value::Null => false,
        other => stringify(other).contains(&stringify(expected)),
    }
}

/// Runs assertions over upstream results.
///
/// A failing run returns a failed result whose error summarises the failed cases.
pub struct TestNode;

#[async_trait]
impl NodeExecutor for TestNode {
    fn kind(&self) -> NodeKind {
        NodeKind::Test
    }

    #[tracing::instrument(name = "test_node", skip_all, fields(node_id = %node.id))]
    async fn run(&self, node: &Node, input: &NodeInput, ctx: &mut NodeContext) -> Result<Value, NodeError> {
        let cfg: TestConfig = config(node)?;
        let context: TemplateContext = input.context();

        let mut results = Vec::with_capacity(cfg.tests.len());
        let mut failed_names = Vec::new();

        for (i, case) in cfg.tests.iter().enumerate() {
            let name = case.name.clone().unwrap_or_else(|| format!("test {}", i + 1));
            let source = match case.source.as_deref().filter(|s| !s.is_empty()) {
                Some(id) => input.get(id),
                None => input.first_live(),
            };
            let expected = match &case.expected {
                Value::String(s) => Value::String(ctx.render(s, &context)?),
                other => other.clone(),
            };

            let (passed, actual, error) = match source {
                Some(src) => {
                    let actual = extract(case, src);
                    (check(case.operator, &actual, &expected), actual, None)
                }
                None => (false, Value::Null, Some("source did not produce a result")),
            };

            results.push(json!({
                "name": name,
                "passed": passed,
                "actual": actual,
                "expected": expected,
                "operator": case.operator_name(),
                "error": error,
            }));
            if !passed {
                failed_names.push(name);
                if !cfg.continue_on_failure && case.stop_on_failure {
                    tracing::debug!("stopping after failed test");
                    break;
                }
            }
        }

        let total = results.len();
        let passed = total - failed_names.len();
        let success = if cfg.require_all {
            failed_names.is_empty()
        } else {
            passed > 0 || cfg.tests.is_empty()
        };

        if !success {
            return Err(NodeError::Failed(format!(
                "{} of {} tests failed: {}",
                failed_names.len(),
                total,
                failed_names.join(", ")
            )));
        }

        Ok(json!({
            "passed": passed,
            "failed": failed_names.len(),
            "total": total,
            "results": results,
        }))
    }
}

impl TestCase {
    fn operator_name(&self) -> &'static str {
        match self.operator {
            Assertion::Equals => "equals",
            Assertion::NotEquals => "not_equals",
            Assertion::Contains => "contains",
            Assertion::NotContains => "not_contains",
            Assertion::GreaterThan => "greater_than",
            Assertion::LessThan => "less_than",
            Assertion::Exists => "exists",
            Assertion::NotExists => "not_exists",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes::testing::context;

    fn http_input() -> NodeInput {
        NodeInput::new().with(
            "api",
            StandardResult::success(
                "api",
                json!({"status": 200, "headers": {"Content-Type": "application/json"}, "data": {"items": [1, 2], "name": "alpha"}}),
            ),
        )
    }

    async fn run(data: Value) -> StandardResult {
        TestNode
            .execute(&Node::new("t", NodeKind::Test, data), &http_input(), &mut context())
            .await
    }

    #[tokio::test]
    async fn test_all_pass() {
        let r = run(json!({"tests": [
            {"type": "status", "operator": "equals", "expected": "200"},
            {"type": "headers", "path": "content-type", "operator": "contains", "expected": "json"},
            {"source": "api", "type": "body", "path": "items", "operator": "contains", "expected": 2},
            {"type": "body", "path": "missing", "operator": "not_exists"},
            {"type": "body", "path": "items[1]", "operator": "greater_than", "expected": 1}
        ]}))
        .await;
        assert!(r.success, "{:?}", r.error);
        assert_eq!(r.response["passed"], json!(5));
    }

    #[tokio::test]
    async fn test_require_all_fails_with_summary() {
        let r = run(json!({"tests": [
            {"name": "ok", "type": "status", "expected": 200},
            {"name": "bad", "type": "status", "expected": 500}
        ]}))
        .await;
        assert!(!r.success);
        assert_eq!(r.response, Value::Null);
        assert_eq!(r.error.as_deref(), Some("1 of 2 tests failed: bad"));
    }

    #[tokio::test]
    async fn test_any_pass_mode() {
        let r = run(json!({"requireAll": false, "tests": [
            {"type": "status", "expected": 500},
            {"type": "body", "path": "name", "expected": "alpha"}
        ]}))
        .await;
        assert!(r.success);
        assert_eq!(r.response["failed"], json!(1));
    }

    #[tokio::test]
    async fn test_stop_on_failure() {
        let r = run(json!({"continueOnFailure": false, "tests": [
            {"name": "first", "type": "status", "expected": 500, "stopOnFailure": true},
            {"name": "second", "type": "status", "expected": 500}
        ]}))
        .await;
        assert_eq!(r.error.as_deref(), Some("1 of 1 tests failed: first"));
    }
}
