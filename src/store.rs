use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use crate::error::StoreError;

/// Well-known collection names.
pub mod collections {
    pub const FLOWS: &str = "flows";
    pub const CONNECTIONS: &str = "connections";
    pub const ENVIRONMENTS: &str = "environments";
    pub const INTEGRATIONS: &str = "integrations";
    pub const NODE_TEMPLATES: &str = "node_templates";
    pub const EXECUTIONS: &str = "executions";
}

/// Key-value persistence boundary, keyed by `(collection, id)`.
#[async_trait]
pub trait Store: Send + Sync {
    async fn save(&self, collection: &str, id: &str, value: Value) -> Result<(), StoreError>;
    async fn get(&self, collection: &str, id: &str) -> Result<Value, StoreError>;
    async fn list(&self, collection: &str) -> Result<Vec<Value>, StoreError>;
    async fn delete(&self, collection: &str, id: &str) -> Result<(), StoreError>;

    fn name(&self) -> &'static str;
}

impl fmt::Debug for dyn Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store").field("impl", &self.name()).finish()
    }
}

pub async fn save_as<T: Serialize>(
    store: &dyn Store,
    collection: &str,
    id: &str,
    value: &T,
) -> Result<(), StoreError> {
    store.save(collection, id, serde_json::to_value(value)?).await
}

pub async fn get_as<T: DeserializeOwned>(
    store: &dyn Store,
    collection: &str,
    id: &str,
) -> Result<T, StoreError> {
    let value = store.get(collection, id).await?;
    Ok(serde_json::from_value(value)?)
}

#[derive(Default)]
pub struct InMemoryStore {
    data: DashMap<(String, String), Value>,
}

impl InMemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn save(&self, collection: &str, id: &str, value: Value) -> Result<(), StoreError> {
        self.data.insert((collection.to_string(), id.to_string()), value);
        Ok(())
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Value, StoreError> {
        self.data
            .get(&(collection.to_string(), id.to_string()))
            .map(|v| v.value().clone())
            .ok_or_else(|| not_found(collection, id))
    }

    async fn list(&self, collection: &str) -> Result<Vec<Value>, StoreError> {
        let mut entries: Vec<(String, Value)> = self
            .data
            .iter()
            .filter(|e| e.key().0 == collection)
            .map(|e| (e.key().1.clone(), e.value().clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(entries.into_iter().map(|(_, v)| v).collect())
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<(), StoreError> {
        self.data
            .remove(&(collection.to_string(), id.to_string()))
            .map(|_| ())
            .ok_or_else(|| not_found(collection, id))
    }

    fn name(&self) -> &'static str {
        "InMemoryStore"
    }
}

/// One JSON document per record at `<root>/<collection>/<id>.json`.
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Arc<Self> {
        Arc::new(Self { root: root.into() })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, collection: &str, id: &str) -> Result<PathBuf, StoreError> {
        for part in [collection, id] {
            if part.is_empty() || part.contains(['/', '\\']) || part == "." || part == ".." {
                return Err(StoreError::Io(format!("invalid store key `{part}`")));
            }
        }
        Ok(self.root.join(collection).join(format!("{id}.json")))
    }
}

#[async_trait]
impl Store for FileStore {
    async fn save(&self, collection: &str, id: &str, value: Value) -> Result<(), StoreError> {
        let path = self.path_for(collection, id)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let body = serde_json::to_vec_pretty(&value)?;
        tokio::fs::write(&path, body).await?;
        debug!(path = %path.display(), "record saved");
        Ok(())
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Value, StoreError> {
        let path = self.path_for(collection, id)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(not_found(collection, id)),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, collection: &str) -> Result<Vec<Value>, StoreError> {
        let dir = self.root.join(collection);
        let mut reader = match tokio::fs::read_dir(&dir).await {
            Ok(r) => r,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut paths = Vec::new();
        while let Some(entry) = reader.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                paths.push(path);
            }
        }
        paths.sort();

        let mut out = Vec::with_capacity(paths.len());
        for path in paths {
            let bytes = tokio::fs::read(&path).await?;
            out.push(serde_json::from_slice(&bytes)?);
        }
        Ok(out)
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<(), StoreError> {
        let path = self.path_for(collection, id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(not_found(collection, id)),
            Err(e) => Err(e.into()),
        }
    }

    fn name(&self) -> &'static str {
        "FileStore"
    }
}

fn not_found(collection: &str, id: &str) -> StoreError {
    StoreError::NotFound {
        collection: collection.to_string(),
        id: id.to_string(),
    }
}
