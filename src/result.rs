use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// The envelope every node executor returns.
///
/// A failed result never carries a response: `success == false` implies
/// `response` is `null` and `error` is set.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct StandardResult {
    pub success: bool,
    #[serde(default)]
    pub response: Value,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub source_id: Option<String>,
}

impl StandardResult {
    pub fn success(source_id: impl Into<String>, response: Value) -> Self {
        Self {
            success: true,
            response,
            error: None,
            source_id: Some(source_id.into()),
        }
    }

    pub fn failure(source_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            response: Value::Null,
            error: Some(error.into()),
            source_id: Some(source_id.into()),
        }
    }

    pub fn to_json(&self) -> Value {
        json!({
            "success": self.success,
            "response": self.response,
            "error": self.error,
            "source_id": self.source_id,
        })
    }

    /// True when the response was produced by an iterator node.
    pub fn is_iterator(&self) -> bool {
        self.response
            .get("isIterator")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Whether an iterator emitted an item and wants its downstream to run.
    pub fn should_continue(&self) -> bool {
        self.success
            && self
                .response
                .get("shouldContinue")
                .and_then(Value::as_bool)
                .unwrap_or(false)
    }

    /// 1-based iteration counter of an iterator response.
    pub fn iteration(&self) -> Option<u64> {
        self.response.pointer("/iteration/current").and_then(Value::as_u64)
    }

    /// True once an iterator reports it has drained its items.
    pub fn is_complete(&self) -> bool {
        self.response
            .get("complete")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Conditional branch chosen by this result, if any.
    pub fn output_path(&self) -> Option<&str> {
        self.response.get("outputPath").and_then(Value::as_str)
    }
}
