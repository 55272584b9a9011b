use serde_json::{Value, json};

use crate::capability::HttpRequest;
use crate::error::CapabilityError;

use super::{PromptRequest, ProviderAdapter, join_text_parts};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u64 = 1024;

/// Anthropic Messages API.
pub struct AnthropicAdapter;

impl ProviderAdapter for AnthropicAdapter {
    fn name(&self) -> &'static str {
        "anthropic"
    }

    fn default_model(&self) -> &'static str {
        "claude-3-5-sonnet-latest"
    }

    fn build_request(&self, request: &PromptRequest, api_key: &str, base_url: Option<&str>) -> HttpRequest {
        let mut body = json!({
            "model": request.model.as_deref().unwrap_or(self.default_model()),
            "max_tokens": request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            "messages": [{"role": "user", "content": request.prompt}],
        });
        if let Some(system) = request.system_prompt.as_deref().filter(|s| !s.trim().is_empty()) {
            body["system"] = json!(system);
        }
        if let Some(t) = request.temperature {
            body["temperature"] = json!(t);
        }

        let url = format!("{}/v1/messages", base_url.unwrap_or(DEFAULT_BASE_URL).trim_end_matches('/'));
        HttpRequest::post(url, body)
            .header("x-api-key", api_key)
            .header("anthropic-version", API_VERSION)
    }

    fn parse_response(&self, body: &Value) -> Result<String, CapabilityError> {
        if body.get("type").and_then(Value::as_str) == Some("error") {
            let msg = body
                .pointer("/error/message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error");
            return Err(CapabilityError::Upstream(format!("Anthropic API returned error: {msg}")));
        }
        match body.get("content") {
            Some(Value::Array(parts)) if !parts.is_empty() => Ok(join_text_parts(parts)),
            _ => Err(CapabilityError::Upstream("Anthropic response missing content".into())),
        }
    }
}
