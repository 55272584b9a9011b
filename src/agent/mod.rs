//! AI provider adapters used by the prompt node.
//!
//! Each adapter turns a [`PromptRequest`] into an HTTP request for its provider
//! and pulls the completion text back out of the provider's response body.

pub mod anthropic;
pub mod openai;

use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::Lazy;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::capability::HttpRequest;
use crate::error::CapabilityError;

pub use anthropic::AnthropicAdapter;
pub use openai::OpenAiAdapter;

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PromptRequest {
    pub prompt: String,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub max_tokens: Option<u64>,
    #[serde(default)]
    pub temperature: Option<f64>,
}

/// Stored integration record (`integrations` collection).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Integration {
    pub id: String,
    #[serde(alias = "name")]
    pub provider: String,
    /// Encrypted API key; passed through the decrypt capability before use.
    pub api_key: String,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
}

pub trait ProviderAdapter: Send + Sync {
    fn name(&self) -> &'static str;

    fn default_model(&self) -> &'static str;

    fn build_request(&self, request: &PromptRequest, api_key: &str, base_url: Option<&str>) -> HttpRequest;

    fn parse_response(&self, body: &Value) -> Result<String, CapabilityError>;
}

static ADAPTERS: Lazy<HashMap<&'static str, Arc<dyn ProviderAdapter>>> = Lazy::new(|| {
    let adapters: [Arc<dyn ProviderAdapter>; 2] = [Arc::new(AnthropicAdapter), Arc::new(OpenAiAdapter)];
    adapters.into_iter().map(|a| (a.name(), a)).collect()
});

/// Adapter for a provider name, case-insensitive.
pub fn adapter_for(provider: &str) -> Option<Arc<dyn ProviderAdapter>> {
    ADAPTERS.get(provider.trim().to_lowercase().as_str()).cloned()
}

pub fn providers() -> Vec<&'static str> {
    let mut names: Vec<&'static str> = ADAPTERS.keys().copied().collect();
    names.sort_unstable();
    names
}

/// Concatenate text parts of a content array.
pub(crate) fn join_text_parts(parts: &[Value]) -> String {
    parts
        .iter()
        .filter_map(|p| match p {
            Value::Object(obj) => obj.get("text").and_then(Value::as_str),
            Value::String(s) => Some(s.as_str()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_lookup_is_case_insensitive() {
        assert_eq!(adapter_for("Anthropic").map(|a| a.name()), Some("anthropic"));
        assert_eq!(adapter_for("openai").map(|a| a.name()), Some("openai"));
        assert!(adapter_for("ollama").is_none());
        assert_eq!(providers(), vec!["anthropic", "openai"]);
    }

    #[test]
    fn test_integration_accepts_name_alias() {
        let i: Integration =
            serde_json::from_value(json!({"id": "i1", "name": "openai", "apiKey": "enc"})).unwrap();
        assert_eq!(i.provider, "openai");
        assert!(i.base_url.is_none());
    }
}
