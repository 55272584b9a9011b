use std::path::PathBuf;
use std::{env, fmt};

use async_trait::async_trait;
use dashmap::DashMap;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

pub const STEP_DELAY_KEY: &str = "NODEFLOW_STEP_DELAY_MS";
pub const HTTP_TIMEOUT_KEY: &str = "NODEFLOW_HTTP_TIMEOUT_MS";
pub const HISTORY_LIMIT_KEY: &str = "NODEFLOW_HISTORY_LIMIT";

/// Read-only string key/value configuration source.
#[async_trait]
pub trait ConfigManagerType: Send + Sync {
    async fn keys(&self) -> Vec<String>;
    async fn get(&self, key: &str) -> Option<String>;
    fn clone_box(&self) -> Box<dyn ConfigManagerType>;
    fn debug_box(&self) -> String;
}

pub struct ConfigManager(pub Box<dyn ConfigManagerType>);

impl ConfigManager {
    pub async fn get(&self, key: &str) -> Option<String> {
        self.0.get(key).await
    }
}

impl Clone for ConfigManager {
    fn clone(&self) -> Self {
        ConfigManager(self.0.clone_box())
    }
}

impl fmt::Debug for ConfigManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.debug_box())
    }
}

/// Process environment, seeded once from a `.env` file.
#[derive(Clone, Debug)]
pub struct EnvConfigManager {
    env_file: PathBuf,
}

impl EnvConfigManager {
    pub fn new(env_file: PathBuf) -> Box<Self> {
        if env_file.exists() {
            match dotenvy::from_path(&env_file) {
                Ok(()) => info!("loaded .env from {}", env_file.display()),
                Err(e) => warn!("could not parse {}: {e}", env_file.display()),
            }
        } else {
            info!("no .env at {}; using process environment", env_file.display());
        }
        Box::new(Self { env_file })
    }
}

#[async_trait]
impl ConfigManagerType for EnvConfigManager {
    async fn keys(&self) -> Vec<String> {
        env::vars().map(|(k, _)| k).collect()
    }

    async fn get(&self, key: &str) -> Option<String> {
        env::var(key).ok()
    }

    fn clone_box(&self) -> Box<dyn ConfigManagerType> {
        Box::new(self.clone())
    }

    fn debug_box(&self) -> String {
        format!("EnvConfigManager({})", self.env_file.display())
    }
}

/// In-memory configuration, for tests and embedding.
#[derive(Debug, Clone, Default)]
pub struct MapConfigManager {
    map: DashMap<String, String>,
}

impl MapConfigManager {
    pub fn new() -> Box<Self> {
        Box::new(Self::default())
    }

    pub fn set(&self, key: impl Into<String>, value: impl Into<String>) {
        self.map.insert(key.into(), value.into());
    }

    pub fn del(&self, key: &str) {
        self.map.remove(key);
    }
}

#[async_trait]
impl ConfigManagerType for MapConfigManager {
    async fn keys(&self) -> Vec<String> {
        self.map.iter().map(|entry| entry.key().clone()).collect()
    }

    async fn get(&self, key: &str) -> Option<String> {
        self.map.get(key).map(|v| v.clone())
    }

    fn clone_box(&self) -> Box<dyn ConfigManagerType> {
        Box::new(self.clone())
    }

    fn debug_box(&self) -> String {
        format!("MapConfigManager({} entries)", self.map.len())
    }
}

/// Engine tuning knobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct EngineConfig {
    /// Pause before each node, for pacing visual feedback. `0` in headless runs.
    pub step_delay_ms: u64,
    /// Default timeout of the bundled HTTP client.
    pub http_timeout_ms: u64,
    /// Maximum history entries kept per run.
    pub history_limit: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            step_delay_ms: 0,
            http_timeout_ms: 30_000,
            history_limit: 1_000,
        }
    }
}

impl EngineConfig {
    /// Read overrides from `config`; unparsable values keep the default.
    pub async fn load(config: &ConfigManager) -> Self {
        let defaults = Self::default();
        Self {
            step_delay_ms: read(config, STEP_DELAY_KEY, defaults.step_delay_ms).await,
            http_timeout_ms: read(config, HTTP_TIMEOUT_KEY, defaults.http_timeout_ms).await,
            history_limit: read(config, HISTORY_LIMIT_KEY, defaults.history_limit).await,
        }
    }

    pub fn with_step_delay(mut self, ms: u64) -> Self {
        self.step_delay_ms = ms;
        self
    }
}

async fn read<T>(config: &ConfigManager, key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy + fmt::Display,
{
    match config.get(key).await {
        None => default,
        Some(raw) => match raw.trim().parse() {
            Ok(v) => v,
            Err(_) => {
                warn!(%key, value = %raw, %default, "invalid number; using default");
                default
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::write;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_map_config_manager_basic() {
        let mgr = MapConfigManager::new();
        mgr.set("foo", "bar");
        mgr.set("foo", "baz");
        assert_eq!(mgr.get("foo").await, Some("baz".to_string()));
        assert_eq!(mgr.keys().await, vec!["foo".to_string()]);

        mgr.del("foo");
        assert_eq!(mgr.get("foo").await, None);
    }

    #[tokio::test]
    async fn test_engine_config_overrides_and_fallbacks() {
        let mgr = MapConfigManager::new();
        mgr.set(STEP_DELAY_KEY, "25");
        mgr.set(HISTORY_LIMIT_KEY, "lots");

        let cfg = EngineConfig::load(&ConfigManager(mgr)).await;
        assert_eq!(cfg.step_delay_ms, 25);
        assert_eq!(cfg.http_timeout_ms, 30_000);
        assert_eq!(cfg.history_limit, 1_000);
    }

    #[tokio::test]
    async fn test_env_config_manager_reads_env_file() {
        let dir = tempdir().unwrap();
        let env_path = dir.path().join(".env");
        write(&env_path, "NODEFLOW_TEST_ENV_FILE_KEY=abc123\n").unwrap();

        let mgr = EnvConfigManager::new(env_path.clone());
        assert_eq!(mgr.get("NODEFLOW_TEST_ENV_FILE_KEY").await, Some("abc123".to_string()));
        assert!(mgr.keys().await.contains(&"NODEFLOW_TEST_ENV_FILE_KEY".to_string()));
        assert_eq!(std::fs::read_to_string(&env_path).unwrap(), "NODEFLOW_TEST_ENV_FILE_KEY=abc123\n");
    }

    #[tokio::test]
    async fn test_missing_env_file_falls_back_to_process_env() {
        let dir = tempdir().unwrap();
        let mgr = EnvConfigManager::new(dir.path().join("absent.env"));
        let cfg = EngineConfig::load(&ConfigManager(mgr)).await;
        assert!(cfg.http_timeout_ms > 0);
    }
}
