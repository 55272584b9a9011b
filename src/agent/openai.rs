use serde_json::{Value, json};

use crate::capability::HttpRequest;
use crate::error::CapabilityError;

use super::{PromptRequest, ProviderAdapter, join_text_parts};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// OpenAI Chat Completions.
pub struct OpenAiAdapter;

impl ProviderAdapter for OpenAiAdapter {
    fn name(&self) -> &'static str {
        "openai"
    }

    fn default_model(&self) -> &'static str {
        "gpt-4o-mini"
    }

    fn build_request(&self, request: &PromptRequest, api_key: &str, base_url: Option<&str>) -> HttpRequest {
        let mut messages = Vec::new();
        if let Some(system) = request.system_prompt.as_deref().filter(|s| !s.trim().is_empty()) {
            messages.push(json!({"role": "system", "content": system}));
        }
        messages.push(json!({"role": "user", "content": request.prompt}));

        let mut body = json!({
            "model": request.model.as_deref().unwrap_or(self.default_model()),
            "messages": messages,
        });
        if let Some(max) = request.max_tokens {
            body["max_tokens"] = json!(max);
        }
        if let Some(t) = request.temperature {
            body["temperature"] = json!(t);
        }

        let url = format!(
            "{}/chat/completions",
            base_url.unwrap_or(DEFAULT_BASE_URL).trim_end_matches('/')
        );
        HttpRequest::post(url, body).header("Authorization", format!("Bearer {api_key}"))
    }

    fn parse_response(&self, body: &Value) -> Result<String, CapabilityError> {
        if let Some(msg) = body.pointer("/error/message").and_then(Value::as_str) {
            return Err(CapabilityError::Upstream(format!("OpenAI API returned error: {msg}")));
        }
        match body.pointer("/choices/0/message/content") {
            Some(Value::String(s)) => Ok(s.clone()),
            Some(Value::Array(parts)) => Ok(join_text_parts(parts)),
            Some(other) => Ok(other.to_string()),
            None => Err(CapabilityError::Upstream("OpenAI response missing message content".into())),
        }
    }
}
