//! External collaborators the engine calls into.
//!
//! Executors only ever reach the outside world through these traits, so tests and
//! embedders can swap any of them.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::process::Command;
use tracing::{debug, warn};
use url::Url;

use crate::error::CapabilityError;
use crate::store::{InMemoryStore, Store};

pub type CapabilityResult<T> = Result<T, CapabilityError>;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HttpRequest {
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<Value>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: "GET".into(),
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn post(url: impl Into<String>, body: Value) -> Self {
        Self {
            method: "POST".into(),
            url: url.into(),
            body: Some(body),
            ..Default::default()
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseQuery {
    pub connection_id: String,
    pub query: String,
    #[serde(default)]
    pub parameters: Vec<Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QueryResult {
    pub row_count: u64,
    #[serde(default)]
    pub rows: Vec<Value>,
    #[serde(default)]
    pub fields: Vec<Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CommandOptions {
    #[serde(default)]
    pub working_directory: Option<PathBuf>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CommandOutput {
    pub output: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default)]
    pub exit_code: Option<i32>,
}

#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Any received response is `Ok`, whatever its status; only transport failures are errors.
    async fn request(&self, request: HttpRequest) -> CapabilityResult<HttpResponse>;
}

#[async_trait]
pub trait DatabaseClient: Send + Sync {
    async fn query(&self, query: DatabaseQuery) -> CapabilityResult<QueryResult>;
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn execute(&self, command: &str, options: CommandOptions) -> CapabilityResult<CommandOutput>;
}

#[async_trait]
pub trait Decrypter: Send + Sync {
    async fn decrypt(&self, ciphertext: &str) -> CapabilityResult<String>;
}

/// Bundle of collaborators shared by every executor in a run.
#[derive(Clone)]
pub struct Capabilities {
    pub http: Arc<dyn HttpClient>,
    pub database: Arc<dyn DatabaseClient>,
    pub command: Arc<dyn CommandRunner>,
    pub decrypter: Arc<dyn Decrypter>,
    pub store: Arc<dyn Store>,
}

impl Capabilities {
    /// Headless defaults: reqwest, `sh -c`, identity decryption, no database,
    /// and an in-memory store.
    pub fn headless(http_timeout: Duration) -> Self {
        Self {
            http: Arc::new(ReqwestHttpClient::new(http_timeout)),
            database: Arc::new(UnsupportedDatabase),
            command: Arc::new(ShellCommandRunner),
            decrypter: Arc::new(PlaintextDecrypter),
            store: InMemoryStore::new(),
        }
    }

    pub fn with_http(mut self, http: Arc<dyn HttpClient>) -> Self {
        self.http = http;
        self
    }

    pub fn with_database(mut self, database: Arc<dyn DatabaseClient>) -> Self {
        self.database = database;
        self
    }

    pub fn with_command(mut self, command: Arc<dyn CommandRunner>) -> Self {
        self.command = command;
        self
    }

    pub fn with_decrypter(mut self, decrypter: Arc<dyn Decrypter>) -> Self {
        self.decrypter = decrypter;
        self
    }

    pub fn with_store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = store;
        self
    }
}

impl fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Capabilities")
            .field("store", &self.store.name())
            .finish_non_exhaustive()
    }
}

pub struct ReqwestHttpClient {
    client: Client,
    timeout: Duration,
}

impl ReqwestHttpClient {
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: Client::new(),
            timeout,
        }
    }
}

#[async_trait]
impl HttpClient for ReqwestHttpClient {
    #[tracing::instrument(name = "http_request", skip(self, request), fields(method = %request.method, url = %request.url))]
    async fn request(&self, request: HttpRequest) -> CapabilityResult<HttpResponse> {
        let method = reqwest::Method::from_bytes(request.method.to_uppercase().as_bytes())
            .map_err(|e| CapabilityError::Request(format!("invalid method `{}`: {e}", request.method)))?;

        let mut url = Url::parse(&request.url)
            .map_err(|e| CapabilityError::Request(format!("invalid url `{}`: {e}", request.url)))?;
        if !request.params.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (k, v) in &request.params {
                pairs.append_pair(k, v);
            }
        }

        let mut headers = HeaderMap::new();
        for (k, v) in &request.headers {
            let name = HeaderName::from_bytes(k.as_bytes())
                .map_err(|e| CapabilityError::Request(format!("invalid header `{k}`: {e}")))?;
            let value = HeaderValue::from_str(v)
                .map_err(|e| CapabilityError::Request(format!("invalid header value for `{k}`: {e}")))?;
            headers.insert(name, value);
        }

        let timeout = request
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.timeout);
        let mut builder = self
            .client
            .request(method, url)
            .headers(headers)
            .timeout(timeout);
        builder = match request.body {
            Some(Value::String(text)) => builder.body(text),
            Some(Value::Null) | None => builder,
            Some(other) => builder.json(&other),
        };

        let resp = builder
            .send()
            .await
            .map_err(|e| CapabilityError::Request(e.to_string()))?;

        let status = resp.status().as_u16();
        let headers = resp
            .headers()
            .iter()
            .map(|(k, v)| (k.to_string(), String::from_utf8_lossy(v.as_bytes()).to_string()))
            .collect();
        let text = resp
            .text()
            .await
            .map_err(|e| CapabilityError::Request(format!("failed to read body: {e}")))?;
        let data = serde_json::from_str(&text).unwrap_or(Value::String(text));
        debug!(status, "http response received");

        Ok(HttpResponse { status, headers, data })
    }
}

/// Runs commands through `sh -c`.
pub struct ShellCommandRunner;

#[async_trait]
impl CommandRunner for ShellCommandRunner {
    #[tracing::instrument(name = "command_execute", skip(self, options))]
    async fn execute(&self, command: &str, options: CommandOptions) -> CapabilityResult<CommandOutput> {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command).kill_on_drop(true);
        if let Some(dir) = &options.working_directory {
            cmd.current_dir(dir);
        }
        cmd.envs(&options.env);

        let output = match options.timeout_ms {
            Some(ms) => tokio::time::timeout(Duration::from_millis(ms), cmd.output())
                .await
                .map_err(|_| CapabilityError::Upstream(format!("command timed out after {ms} ms")))?,
            None => cmd.output().await,
        }
        .map_err(|e| CapabilityError::Request(format!("failed to spawn command: {e}")))?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        if !output.status.success() {
            warn!(code = ?output.status.code(), "command exited unsuccessfully");
            let msg = if stderr.trim().is_empty() { stdout.trim().to_string() } else { stderr.trim().to_string() };
            return Err(CapabilityError::Upstream(format!(
                "command exited with {}: {msg}",
                output.status.code().map(|c| c.to_string()).unwrap_or_else(|| "signal".into())
            )));
        }

        Ok(CommandOutput {
            output: stdout,
            stderr,
            exit_code: output.status.code(),
        })
    }
}

/// Returns the input unchanged; for local runs where credentials are stored in clear.
pub struct PlaintextDecrypter;

#[async_trait]
impl Decrypter for PlaintextDecrypter {
    async fn decrypt(&self, ciphertext: &str) -> CapabilityResult<String> {
        Ok(ciphertext.to_string())
    }
}

pub struct UnsupportedDatabase;

#[async_trait]
impl DatabaseClient for UnsupportedDatabase {
    async fn query(&self, _query: DatabaseQuery) -> CapabilityResult<QueryResult> {
        Err(CapabilityError::Unsupported { capability: "database" })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_shell_runner_captures_stdout() {
        let out = ShellCommandRunner
            .execute("echo hello", CommandOptions::default())
            .await
            .unwrap();
        assert_eq!(out.output.trim(), "hello");
        assert_eq!(out.exit_code, Some(0));
    }

    #[tokio::test]
    async fn test_shell_runner_reports_failure() {
        let err = ShellCommandRunner
            .execute("echo oops >&2; exit 3", CommandOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err, CapabilityError::Upstream("command exited with 3: oops".into()));
    }

    #[tokio::test]
    async fn test_shell_runner_passes_env() {
        let mut options = CommandOptions::default();
        options.env.insert("GREETING".into(), "hi".into());
        let out = ShellCommandRunner.execute("echo $GREETING", options).await.unwrap();
        assert_eq!(out.output.trim(), "hi");
    }

    #[tokio::test]
    async fn test_unsupported_database() {
        let err = UnsupportedDatabase.query(DatabaseQuery::default()).await.unwrap_err();
        assert_eq!(err.to_string(), "database is not available in this runtime");
    }

    #[tokio::test]
    async fn test_reqwest_client_rejects_bad_url() {
        let client = ReqwestHttpClient::new(Duration::from_secs(1));
        let err = client.request(HttpRequest::get("not a url")).await.unwrap_err();
        assert!(matches!(err, CapabilityError::Request(_)));
    }
}
