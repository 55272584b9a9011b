//! Execution lifecycle: `pending -> running -> completed | error | cancelled`.
//!
//! Every transition is mirrored to the in-memory registry and the `executions`
//! store collection, then broadcast to subscribers.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::capability::Capabilities;
use crate::config::EngineConfig;
use crate::environment::Environment;
use crate::error::EngineError;
use crate::graph::{Edge, FlowDocument, Node};
use crate::node::ExecutorRegistry;
use crate::store::{Store, collections, save_as};

use super::FlowExecutor;
use super::observer::{FlowObserver, NoopObserver};
use super::state::FlowRunReport;

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Error,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Error | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted bookkeeping for one execution.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRecord {
    pub id: String,
    pub flow_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub status: ExecutionStatus,
    pub trigger_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

fn default_trigger() -> String {
    "manual".to_string()
}

/// Arguments of [`ExecutionService::start`].
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StartRequest {
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
    #[serde(default)]
    pub environment: Environment,
    /// Run at this time instead of immediately. Past times run immediately.
    #[serde(default)]
    pub scheduled_time: Option<DateTime<Utc>>,
    #[serde(default = "default_trigger")]
    pub trigger_type: String,
    #[serde(default)]
    pub user_id: Option<String>,
}

impl Default for StartRequest {
    fn default() -> Self {
        Self {
            nodes: Vec::new(),
            edges: Vec::new(),
            environment: Environment::new(),
            scheduled_time: None,
            trigger_type: default_trigger(),
            user_id: None,
        }
    }
}

impl From<FlowDocument> for StartRequest {
    fn from(doc: FlowDocument) -> Self {
        Self {
            nodes: doc.nodes,
            edges: doc.edges,
            environment: doc.environment,
            ..Default::default()
        }
    }
}

/// Filters for [`ExecutionService::list`]; `None` matches everything.
#[derive(Debug, Clone, Default)]
pub struct ExecutionFilter {
    pub flow_id: Option<String>,
    pub status: Option<ExecutionStatus>,
    pub user_id: Option<String>,
}

impl ExecutionFilter {
    fn matches(&self, record: &ExecutionRecord) -> bool {
        self.flow_id.as_ref().is_none_or(|f| *f == record.flow_id)
            && self.status.is_none_or(|s| s == record.status)
            && self
                .user_id
                .as_ref()
                .is_none_or(|u| record.user_id.as_ref() == Some(u))
    }
}

/// Broadcast on every status transition.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionEvent {
    pub execution_id: String,
    pub flow_id: String,
    pub status: ExecutionStatus,
    pub error: Option<String>,
    pub at: DateTime<Utc>,
}

pub struct ExecutionService {
    executions: DashMap<String, ExecutionRecord>,
    tokens: DashMap<String, CancellationToken>,
    reports: DashMap<String, FlowRunReport>,
    store: Arc<dyn Store>,
    events: broadcast::Sender<ExecutionEvent>,
    registry: Arc<ExecutorRegistry>,
    capabilities: Arc<Capabilities>,
    observer: Arc<dyn FlowObserver>,
    config: EngineConfig,
}

impl ExecutionService {
    /// Records are persisted to the store carried by `capabilities`.
    pub fn new(
        registry: Arc<ExecutorRegistry>,
        capabilities: Arc<Capabilities>,
        observer: Arc<dyn FlowObserver>,
        config: EngineConfig,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new(Self {
            executions: DashMap::new(),
            tokens: DashMap::new(),
            reports: DashMap::new(),
            store: capabilities.store.clone(),
            events,
            registry,
            capabilities,
            observer,
            config,
        })
    }

    pub fn headless(config: EngineConfig) -> Arc<Self> {
        Self::new(
            Arc::new(ExecutorRegistry::builtin()),
            Arc::new(Capabilities::headless(Duration::from_millis(config.http_timeout_ms))),
            Arc::new(NoopObserver),
            config,
        )
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.events.subscribe()
    }

    /// Create a pending execution and run it now or at `scheduled_time`.
    #[tracing::instrument(name = "start_execution", skip(self, request), fields(nodes = request.nodes.len()))]
    pub async fn start(self: &Arc<Self>, flow_id: &str, request: StartRequest) -> Result<String, EngineError> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let record = ExecutionRecord {
            id: id.clone(),
            flow_id: flow_id.to_string(),
            user_id: request.user_id.clone(),
            status: ExecutionStatus::Pending,
            trigger_type: request.trigger_type.clone(),
            scheduled_time: request.scheduled_time,
            start_time: None,
            end_time: None,
            error: None,
            created_at: now,
        };
        save_as(self.store.as_ref(), collections::EXECUTIONS, &id, &record).await?;
        self.executions.insert(id.clone(), record.clone());
        self.emit(&record);

        let cancel = CancellationToken::new();
        self.tokens.insert(id.clone(), cancel.clone());

        let doc = FlowDocument {
            nodes: request.nodes,
            edges: request.edges,
            environment: request.environment,
        };
        let delay = request
            .scheduled_time
            .and_then(|at| (at - now).to_std().ok())
            .filter(|d| !d.is_zero());

        let service = Arc::clone(self);
        let execution_id = id.clone();
        match delay {
            Some(delay) => {
                info!(execution_id = %id, delay_ms = delay.as_millis() as u64, "execution scheduled");
                let stop = cancel.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {
                            service.execute_flow(&execution_id, doc, cancel).await;
                        }
                        _ = stop.cancelled() => {
                            debug!(%execution_id, "scheduled run dropped");
                        }
                    }
                });
            }
            None => {
                tokio::spawn(async move {
                    service.execute_flow(&execution_id, doc, cancel).await;
                });
            }
        }
        Ok(id)
    }

    #[tracing::instrument(name = "execute_flow", skip(self, doc, cancel))]
    async fn execute_flow(&self, execution_id: &str, doc: FlowDocument, cancel: CancellationToken) {
        if cancel.is_cancelled() {
            self.tokens.remove(execution_id);
            return;
        }
        if let Err(err) = self.transition(execution_id, ExecutionStatus::Running, None).await {
            warn!(error = %err, "execution did not start");
            self.tokens.remove(execution_id);
            return;
        }

        let mut executor = FlowExecutor::new(self.registry.clone(), self.capabilities.clone(), self.config)
            .with_observer(self.observer.clone());
        let (status, message) = match executor.execute(doc, cancel).await {
            Ok(report) => {
                self.reports.insert(execution_id.to_string(), report);
                (ExecutionStatus::Completed, None)
            }
            Err(EngineError::Cancelled) => (ExecutionStatus::Cancelled, None),
            Err(err) => {
                error!(error = %err, "execution failed");
                (ExecutionStatus::Error, Some(err.to_string()))
            }
        };

        // a cancel() during the run already moved the record to `cancelled`
        if let Err(err) = self.transition(execution_id, status, message).await {
            debug!(error = %err, "final transition skipped");
        }
        self.tokens.remove(execution_id);
    }

    /// Move `id` to `status`; terminal records never move again.
    async fn transition(
        &self,
        id: &str,
        status: ExecutionStatus,
        message: Option<String>,
    ) -> Result<ExecutionRecord, EngineError> {
        let record = {
            let mut entry = self
                .executions
                .get_mut(id)
                .ok_or_else(|| EngineError::ExecutionNotFound(id.to_string()))?;
            if entry.status.is_terminal() {
                return Err(EngineError::InvalidTransition {
                    id: id.to_string(),
                    from: entry.status.to_string(),
                    to: status.to_string(),
                });
            }
            let now = Utc::now();
            entry.status = status;
            if status == ExecutionStatus::Running {
                entry.start_time = Some(now);
            } else if status.is_terminal() {
                entry.end_time = Some(now);
            }
            if message.is_some() {
                entry.error = message;
            }
            entry.clone()
        };

        save_as(self.store.as_ref(), collections::EXECUTIONS, id, &record).await?;
        info!(execution_id = %id, status = %record.status, "execution status changed");
        self.emit(&record);
        Ok(record)
    }

    fn emit(&self, record: &ExecutionRecord) {
        let event = ExecutionEvent {
            execution_id: record.id.clone(),
            flow_id: record.flow_id.clone(),
            status: record.status,
            error: record.error.clone(),
            at: Utc::now(),
        };
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    /// Stop a scheduled or running execution.
    ///
    /// A scheduled run never starts. Running nodes finish their current
    /// capability call; no further node starts.
    pub async fn cancel(&self, id: &str) -> Result<ExecutionRecord, EngineError> {
        if let Some((_, token)) = self.tokens.remove(id) {
            token.cancel();
        }
        self.transition(id, ExecutionStatus::Cancelled, None).await
    }

    pub fn get_status(&self, id: &str) -> Result<ExecutionRecord, EngineError> {
        self.executions
            .get(id)
            .map(|r| r.clone())
            .ok_or_else(|| EngineError::ExecutionNotFound(id.to_string()))
    }

    /// In-memory executions matching `filter`, oldest first.
    pub fn list(&self, filter: &ExecutionFilter) -> Vec<ExecutionRecord> {
        let mut records: Vec<ExecutionRecord> = self
            .executions
            .iter()
            .filter(|r| filter.matches(r.value()))
            .map(|r| r.value().clone())
            .collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        records
    }

    /// Report of a completed execution.
    pub fn get_report(&self, id: &str) -> Option<FlowRunReport> {
        self.reports.get(id).map(|r| r.clone())
    }

    /// Resolve once `id` reaches a terminal status.
    pub async fn wait(&self, id: &str) -> Result<ExecutionRecord, EngineError> {
        let mut events = self.subscribe();
        let current = self.get_status(id)?;
        if current.status.is_terminal() {
            return Ok(current);
        }
        loop {
            match events.recv().await {
                Ok(event) if event.execution_id == id && event.status.is_terminal() => {
                    return self.get_status(id);
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "execution events lagged");
                    let current = self.get_status(id)?;
                    if current.status.is_terminal() {
                        return Ok(current);
                    }
                }
                Err(broadcast::error::RecvError::Closed) => return self.get_status(id),
            }
        }
    }
}

impl fmt::Debug for ExecutionService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionService")
            .field("executions", &self.executions.len())
            .field("active", &self.tokens.len())
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}
