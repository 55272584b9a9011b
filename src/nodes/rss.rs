use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::capability::HttpRequest;
use crate::error::CapabilityError;
use crate::graph::{Node, NodeKind};
use crate::node::{NodeContext, NodeError, NodeExecutor, NodeInput};
use crate::util::xml_to_json;

use super::{config, lenient_opt_u64, required};

const DEFAULT_MAX_ITEMS: usize = 10;

#[derive(Debug, Clone, Default, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RssConfig {
    #[serde(default, alias = "feedUrl")]
    pub url: Option<String>,
    /// `0` returns every item.
    #[serde(default, deserialize_with = "lenient_opt_u64")]
    pub max_items: Option<u64>,
}

/// Fetches an RSS 2.0 or Atom feed and normalises its entries.
pub struct RssNode;

/// Text of an element that may carry attributes (`{"#text": ...}`).
fn text(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.trim().to_string(),
        Some(Value::Object(map)) => map
            .get("#text")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .trim()
            .to_string(),
        Some(Value::Array(items)) => text(items.first()),
        _ => String::new(),
    }
}

fn as_list(value: Option<&Value>) -> Vec<&Value> {
    match value {
        Some(Value::Array(items)) => items.iter().collect(),
        Some(other) => vec![other],
        None => Vec::new(),
    }
}

fn atom_link(value: Option<&Value>) -> String {
    let links = as_list(value);
    let pick = links
        .iter()
        .find(|l| l.get("@rel").and_then(Value::as_str).is_none_or(|r| r == "alternate"))
        .or_else(|| links.first());
    match pick {
        Some(Value::Object(map)) => map.get("@href").and_then(Value::as_str).unwrap_or_default().to_string(),
        Some(other) => text(Some(other)),
        None => String::new(),
    }
}

/// Normalise a parsed feed document into `{title, items}`.
pub fn normalize_feed(doc: &Value) -> Result<Value, NodeError> {
    if let Some(channel) = doc.pointer("/rss/channel").or_else(|| doc.pointer("/rdf:RDF/channel")) {
        let raw_items = match doc.pointer("/rss/channel") {
            Some(_) => as_list(channel.get("item")),
            None => as_list(doc.pointer("/rdf:RDF/item")),
        };
        let items = raw_items
            .into_iter()
            .map(|item| {
                json!({
                    "title": text(item.get("title")),
                    "link": text(item.get("link")),
                    "description": text(item.get("description")),
                    "pubDate": text(item.get("pubDate").or_else(|| item.get("dc:date"))),
                    "guid": text(item.get("guid")),
                })
            })
            .collect::<Vec<_>>();
        return Ok(json!({"title": text(channel.get("title")), "items": items}));
    }

    if let Some(feed) = doc.get("feed") {
        let items = as_list(feed.get("entry"))
            .into_iter()
            .map(|entry| {
                json!({
                    "title": text(entry.get("title")),
                    "link": atom_link(entry.get("link")),
                    "description": text(entry.get("summary").or_else(|| entry.get("content"))),
                    "pubDate": text(entry.get("published").or_else(|| entry.get("updated"))),
                    "guid": text(entry.get("id")),
                })
            })
            .collect::<Vec<_>>();
        return Ok(json!({"title": text(feed.get("title")), "items": items}));
    }

    Err(NodeError::Parse("document is neither an RSS nor an Atom feed".into()))
}

#[async_trait]
impl NodeExecutor for RssNode {
    fn kind(&self) -> NodeKind {
        NodeKind::Rss
    }

    #[tracing::instrument(name = "rss_node", skip_all, fields(node_id = %node.id))]
    async fn run(&self, node: &Node, input: &NodeInput, ctx: &mut NodeContext) -> Result<Value, NodeError> {
        let cfg: RssConfig = config(node)?;
        let url = ctx.render(required(&cfg.url, "url")?, &input.context())?;

        ctx.check_cancelled()?;
        let http = ctx.capabilities().http.clone();
        let resp = http
            .request(HttpRequest::get(url.clone()).header("Accept", "application/rss+xml, application/atom+xml, text/xml"))
            .await?;
        if resp.status >= 400 {
            return Err(CapabilityError::Upstream(format!("feed {url} returned status {}", resp.status)).into());
        }
        let body = match &resp.data {
            Value::String(s) => s.clone(),
            other => return Err(NodeError::Parse(format!("feed body is not XML: {other}"))),
        };

        let doc = xml_to_json(&body).map_err(NodeError::Parse)?;
        let mut feed = normalize_feed(&doc)?;

        let max = cfg.max_items.map(|m| m as usize).unwrap_or(DEFAULT_MAX_ITEMS);
        if max > 0 {
            if let Some(Value::Array(items)) = feed.get_mut("items") {
                items.truncate(max);
            }
        }
        Ok(feed)
    }
}
