//! Typed configuration.
//!
//! Mirrors `original_source/backend/config.go`'s `ProxyConfig`/`BackendConfig`,
//! with defaults applied by `ConfigSource` implementations at load time
//! rather than scattered across call sites.

use serde::{Deserialize, Serialize};

fn default_flush_interval_ms() -> u64 {
    1000
}
fn default_rewrite_interval_ms() -> u64 {
    10_000
}
fn default_health_check_interval_ms() -> u64 {
    1000
}
fn default_request_timeout_ms() -> u64 {
    10_000
}
fn default_query_timeout_ms() -> u64 {
    600_000
}
fn default_max_rows_per_batch() -> u32 {
    10_000
}
fn default_idle_timeout_secs() -> u64 {
    10
}
fn default_stats_interval_secs() -> u64 {
    10
}

/// Immutable once loaded; one per TSDB backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    pub url: String,
    pub db: String,
    #[serde(default)]
    pub zone: String,

    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    #[serde(default = "default_rewrite_interval_ms")]
    pub rewrite_interval_ms: u64,
    #[serde(default = "default_health_check_interval_ms")]
    pub health_check_interval_ms: u64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_query_timeout_ms")]
    pub query_timeout_ms: u64,
    #[serde(default = "default_max_rows_per_batch")]
    pub max_rows_per_batch: u32,

    #[serde(default)]
    pub write_only: bool,
}

impl BackendConfig {
    /// Applies the standard defaults to any field left as its serde
    /// default (zero), matching `original_source/backend/config.go`'s
    /// `loadConfigFromRedis`, which only fills a field in if it was zero.
    pub fn with_defaults_applied(mut self) -> Self {
        if self.flush_interval_ms == 0 {
            self.flush_interval_ms = default_flush_interval_ms();
        }
        if self.rewrite_interval_ms == 0 {
            self.rewrite_interval_ms = default_rewrite_interval_ms();
        }
        if self.health_check_interval_ms == 0 {
            self.health_check_interval_ms = default_health_check_interval_ms();
        }
        if self.request_timeout_ms == 0 {
            self.request_timeout_ms = default_request_timeout_ms();
        }
        if self.query_timeout_ms == 0 {
            self.query_timeout_ms = default_query_timeout_ms();
        }
        if self.max_rows_per_batch == 0 {
            self.max_rows_per_batch = default_max_rows_per_batch();
        }
        self
    }
}

/// Per-node proxy configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub listen_addr: String,
    #[serde(default)]
    pub db: String,
    #[serde(default)]
    pub zone: String,

    #[serde(default = "default_stats_interval_secs")]
    pub stats_interval_secs: u64,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    #[serde(default)]
    pub write_tracing: bool,
    #[serde(default)]
    pub query_tracing: bool,
}

/// Top-level app configuration, read via the `config` crate from the file
/// named by `--config` plus environment overrides (`CYCLOTRON_*`).
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub proxy: ProxyConfig,
    pub config_source: ConfigSourceSettings,
}

/// Selects and parameterizes the `ConfigSource` implementation: a Redis-
/// backed source and a file-backed source, unified behind one interface.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ConfigSourceSettings {
    Redis { url: String, node: String },
    File { path: String },
}

impl AppConfig {
    pub fn load(path: &str) -> Result<Self, config::ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("CYCLOTRON").separator("__"))
            .build()?;
        settings.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_defaults_fill_zero_fields_only() {
        let cfg = BackendConfig {
            url: "http://127.0.0.1:8086".into(),
            db: "metrics".into(),
            zone: "a".into(),
            flush_interval_ms: 0,
            rewrite_interval_ms: 5_000,
            health_check_interval_ms: 0,
            request_timeout_ms: 0,
            query_timeout_ms: 0,
            max_rows_per_batch: 0,
            write_only: false,
        }
        .with_defaults_applied();

        assert_eq!(cfg.flush_interval_ms, 1000);
        assert_eq!(cfg.rewrite_interval_ms, 5_000);
        assert_eq!(cfg.health_check_interval_ms, 1000);
        assert_eq!(cfg.request_timeout_ms, 10_000);
        assert_eq!(cfg.query_timeout_ms, 600_000);
        assert_eq!(cfg.max_rows_per_batch, 10_000);
    }
}
