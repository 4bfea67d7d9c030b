//! Metadata sources: where backend, measurement, and proxy configuration
//! come from. Grounded in `original_source/backend/config.go`'s
//! `RedisConfigSource`, generalized behind a trait so a plain JSON file can
//! stand in for local development and tests.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use redis::AsyncCommands;

use crate::config::{BackendConfig, ProxyConfig};
use crate::errors::ConfigError;

/// Everything a `Router` needs to (re)build its dispatch tables.
#[async_trait]
pub trait ConfigSource: Send + Sync {
    async fn load_backends(&self) -> Result<HashMap<String, BackendConfig>, ConfigError>;
    async fn load_measurements(&self) -> Result<HashMap<String, Vec<String>>, ConfigError>;
    async fn load_proxies(&self) -> Result<HashMap<String, ProxyConfig>, ConfigError>;
}

/// Reads `n:` (proxies), `b:` (backends), `m:` (measurement routing) hashes
/// from Redis, one field per name. Field values are JSON-encoded.
pub struct RedisConfigSource {
    client: redis::Client,
}

impl RedisConfigSource {
    pub fn new(url: &str) -> Result<Self, ConfigError> {
        let client = redis::Client::open(url).map_err(ConfigError::Redis)?;
        Ok(RedisConfigSource { client })
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, ConfigError> {
        let mut conn = self.client.get_async_connection().await?;
        let map: HashMap<String, String> = conn.hgetall(key).await?;
        Ok(map)
    }
}

#[async_trait]
impl ConfigSource for RedisConfigSource {
    async fn load_backends(&self) -> Result<HashMap<String, BackendConfig>, ConfigError> {
        let raw = self.hgetall("b:").await?;
        let mut backends = HashMap::with_capacity(raw.len());
        for (name, json) in raw {
            let cfg: BackendConfig = serde_json::from_str(&json)?;
            backends.insert(name, cfg.with_defaults_applied());
        }
        Ok(backends)
    }

    async fn load_measurements(&self) -> Result<HashMap<String, Vec<String>>, ConfigError> {
        let raw = self.hgetall("m:").await?;
        let mut measurements = HashMap::with_capacity(raw.len());
        for (name, json) in raw {
            let backend_names: Vec<String> = serde_json::from_str(&json)?;
            measurements.insert(name, backend_names);
        }
        Ok(measurements)
    }

    async fn load_proxies(&self) -> Result<HashMap<String, ProxyConfig>, ConfigError> {
        let raw = self.hgetall("n:").await?;
        let mut proxies = HashMap::with_capacity(raw.len());
        for (name, json) in raw {
            let cfg: ProxyConfig = serde_json::from_str(&json)?;
            proxies.insert(name, cfg);
        }
        Ok(proxies)
    }
}

/// JSON document on disk shaped like `ClusterMetadata` in the original,
/// minus `backendStatus` (liveness is runtime-only here).
#[derive(Debug, serde::Deserialize)]
struct FileMetadata {
    #[serde(default)]
    proxies: HashMap<String, ProxyConfig>,
    #[serde(default)]
    backends: HashMap<String, BackendConfig>,
    #[serde(default)]
    measurement_to_backends: HashMap<String, Vec<String>>,
}

/// A single JSON file backing all three metadata maps, for local
/// development and integration tests where standing up Redis is overkill.
pub struct FileConfigSource {
    path: PathBuf,
}

impl FileConfigSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileConfigSource { path: path.into() }
    }

    fn read(&self) -> Result<FileMetadata, ConfigError> {
        let raw = std::fs::read_to_string(&self.path)?;
        Ok(serde_json::from_str(&raw)?)
    }
}

#[async_trait]
impl ConfigSource for FileConfigSource {
    async fn load_backends(&self) -> Result<HashMap<String, BackendConfig>, ConfigError> {
        Ok(self
            .read()?
            .backends
            .into_iter()
            .map(|(name, cfg)| (name, cfg.with_defaults_applied()))
            .collect())
    }

    async fn load_measurements(&self) -> Result<HashMap<String, Vec<String>>, ConfigError> {
        Ok(self.read()?.measurement_to_backends)
    }

    async fn load_proxies(&self) -> Result<HashMap<String, ProxyConfig>, ConfigError> {
        Ok(self.read()?.proxies)
    }
}
