use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::capability::HttpRequest;
use crate::graph::{Node, NodeKind};
use crate::node::{NodeContext, NodeError, NodeExecutor, NodeInput};

use super::{KeyValues, config, lenient_opt_u64, required};

/// Calls the injected HTTP client with a templated request.
///
/// Every received response, whatever its status, is a success carrying
/// `{status, headers, data}`; transport failures fail the node.
#[derive(Debug, Clone, Default, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HttpConfig {
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub headers: KeyValues,
    #[serde(default)]
    pub params: KeyValues,
    #[serde(default)]
    pub body: Option<Value>,
    #[serde(default, deserialize_with = "lenient_opt_u64")]
    pub timeout: Option<u64>,
    /// Variables to set from the response, e.g. `{"name": "TOKEN", "template": "{{response.data.token}}"}`.
    #[serde(default)]
    pub environment_vars: Vec<EnvironmentVar>,
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct EnvironmentVar {
    #[serde(alias = "key")]
    pub name: String,
    #[serde(alias = "value")]
    pub template: String,
}

pub struct HttpNode;

#[async_trait]
impl NodeExecutor for HttpNode {
    fn kind(&self) -> NodeKind {
        NodeKind::Http
    }

    #[tracing::instrument(name = "http_node", skip_all, fields(node_id = %node.id))]
    async fn run(&self, node: &Node, input: &NodeInput, ctx: &mut NodeContext) -> Result<Value, NodeError> {
        let cfg: HttpConfig = config(node)?;
        let context = input.context();

        let url = ctx.render(required(&cfg.url, "url")?, &context)?;
        let method = match &cfg.method {
            Some(m) if !m.trim().is_empty() => ctx.render(m, &context)?.trim().to_uppercase(),
            _ => "GET".to_string(),
        };
        let body = match &cfg.body {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) if s.trim().is_empty() => None,
            Some(Value::String(s)) => {
                let rendered = ctx.render(s, &context)?;
                Some(serde_json::from_str(&rendered).unwrap_or(Value::String(rendered)))
            }
            Some(other) => Some(ctx.render_value(other, &context)?),
        };

        let request = HttpRequest {
            method,
            url,
            headers: cfg.headers.render(&context, ctx)?,
            params: cfg.params.render(&context, ctx)?,
            body,
            timeout_ms: cfg.timeout,
        };

        ctx.check_cancelled()?;
        let http = ctx.capabilities().http.clone();
        let resp = http.request(request).await?;

        let response = json!({
            "status": resp.status,
            "headers": resp.headers,
            "data": resp.data,
        });

        if !cfg.environment_vars.is_empty() {
            let mut env_context = context.clone();
            env_context.insert("response".to_string(), response.clone());
            let mut rendered = Vec::with_capacity(cfg.environment_vars.len());
            for var in &cfg.environment_vars {
                if var.name.trim().is_empty() {
                    continue;
                }
                rendered.push((var.name.trim(), ctx.render(&var.template, &env_context)?));
            }
            for (name, value) in rendered {
                tracing::debug!(%name, "setting environment variable from response");
                ctx.set_environment_variable(name, Value::String(value));
            }
        }

        Ok(response)
    }
}
