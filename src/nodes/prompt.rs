use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::info;

use crate::agent::{Integration, PromptRequest, adapter_for};
use crate::error::CapabilityError;
use crate::graph::{Node, NodeKind};
use crate::node::{NodeContext, NodeError, NodeExecutor, NodeInput};
use crate::store::{collections, get_as};

use super::{config, lenient_opt_u64, required};

#[derive(Debug, Clone, Default, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PromptConfig {
    #[serde(default)]
    pub integration_id: Option<String>,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default, deserialize_with = "lenient_opt_u64")]
    pub max_tokens: Option<u64>,
    #[serde(default)]
    pub temperature: Option<f64>,
}

/// Sends a templated prompt to the provider named by a stored integration.
pub struct PromptNode;

#[async_trait]
impl NodeExecutor for PromptNode {
    fn kind(&self) -> NodeKind {
        NodeKind::Prompt
    }

    #[tracing::instrument(name = "prompt_node", skip_all, fields(node_id = %node.id))]
    async fn run(&self, node: &Node, input: &NodeInput, ctx: &mut NodeContext) -> Result<Value, NodeError> {
        let cfg: PromptConfig = config(node)?;
        let context = input.context();

        let integration_id = required(&cfg.integration_id, "integrationId")?;
        let prompt = ctx.render(required(&cfg.prompt, "prompt")?, &context)?;
        let system_prompt = match cfg.system_prompt.as_deref().filter(|s| !s.trim().is_empty()) {
            Some(s) => Some(ctx.render(s, &context)?),
            None => None,
        };

        let caps = ctx.capabilities().clone();
        let integration: Integration = get_as(caps.store.as_ref(), collections::INTEGRATIONS, integration_id)
            .await
            .map_err(|e| NodeError::Config(format!("integration `{integration_id}`: {e}")))?;
        let adapter = adapter_for(&integration.provider).ok_or_else(|| {
            NodeError::Config(format!("unsupported AI provider `{}`", integration.provider))
        })?;

        ctx.check_cancelled()?;
        let api_key = caps
            .decrypter
            .decrypt(&integration.api_key)
            .await
            .map_err(|e| match e {
                CapabilityError::Decrypt(_) => e,
                other => CapabilityError::Decrypt(other.to_string()),
            })?;

        let model = cfg
            .model
            .clone()
            .filter(|m| !m.trim().is_empty())
            .or_else(|| integration.model.clone())
            .unwrap_or_else(|| adapter.default_model().to_string());
        let request = PromptRequest {
            prompt,
            system_prompt,
            model: Some(model.clone()),
            max_tokens: cfg.max_tokens,
            temperature: cfg.temperature,
        };
        let http_request = adapter.build_request(&request, &api_key, integration.base_url.as_deref());

        ctx.check_cancelled()?;
        let resp = caps.http.request(http_request).await?;
        if resp.status >= 400 {
            let detail = adapter
                .parse_response(&resp.data)
                .err()
                .map(|e| e.to_string())
                .unwrap_or_else(|| resp.data.to_string());
            return Err(CapabilityError::Upstream(format!(
                "{} returned status {}: {detail}",
                adapter.name(),
                resp.status
            ))
            .into());
        }
        let text = adapter.parse_response(&resp.data)?;
        info!(provider = adapter.name(), %model, "prompt completed");

        Ok(json!({
            "text": text,
            "provider": adapter.name(),
            "model": model,
        }))
    }
}
