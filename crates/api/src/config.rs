//! Manager configuration: serde defaults, YAML files and `TETHER_*` environment overrides.

use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tether_core::{Gvk, InvalidGvk};
use tether_trigger::{BackoffPolicy, PoolConfig, SchedulerConfig};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing config: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("{var}={value:?}: {reason}")]
    Env { var: &'static str, value: String, reason: String },
    #[error(transparent)]
    Kind(#[from] InvalidGvk),
    #[error("{0}")]
    Invalid(String),
}

/// Runtime settings read once at startup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Puller tasks per shard for kinds without an override.
    pub workers: usize,
    pub threadiness: usize,
    pub shards: usize,
    /// Restrict caches to one namespace.
    pub namespace: Option<String>,
    /// Re-trigger every cached key this often; 0 disables.
    pub resync_secs: u64,
    pub backoff_first_ms: u64,
    pub backoff_max_secs: u64,
    /// Per-kind pool overrides keyed by `v1/Kind` or `group/v1/Kind`.
    pub kinds: BTreeMap<String, PoolConfig>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        let pool = PoolConfig::default();
        Self {
            workers: pool.workers,
            threadiness: pool.threadiness,
            shards: pool.shards,
            namespace: None,
            resync_secs: 300,
            backoff_first_ms: 100,
            backoff_max_secs: 60,
            kinds: BTreeMap::new(),
        }
    }
}

fn env_parse<T: FromStr>(var: &'static str) -> Result<Option<T>, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(var) {
        Ok(v) if v.trim().is_empty() => Ok(None),
        Ok(v) => v.trim().parse::<T>().map(Some).map_err(|e| ConfigError::Env { var, value: v, reason: e.to_string() }),
        Err(_) => Ok(None),
    }
}

impl ManagerConfig {
    pub fn from_yaml_str(s: &str) -> Result<Self, ConfigError> {
        if s.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(s)?)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io { path: path.display().to_string(), source })?;
        Self::from_yaml_str(&text)
    }

    /// Overlay `TETHER_*` environment variables onto `self`.
    pub fn with_env(mut self) -> Result<Self, ConfigError> {
        if let Some(v) = env_parse("TETHER_WORKERS")? { self.workers = v; }
        if let Some(v) = env_parse("TETHER_THREADINESS")? { self.threadiness = v; }
        if let Some(v) = env_parse("TETHER_SHARDS")? { self.shards = v; }
        if let Some(v) = env_parse::<String>("TETHER_NAMESPACE")? { self.namespace = Some(v); }
        if let Some(v) = env_parse("TETHER_RESYNC_SECS")? { self.resync_secs = v; }
        if let Some(v) = env_parse("TETHER_BACKOFF_FIRST_MS")? { self.backoff_first_ms = v; }
        if let Some(v) = env_parse("TETHER_BACKOFF_MAX_SECS")? { self.backoff_max_secs = v; }
        if let Ok(raw) = std::env::var("TETHER_KIND_CONFIG") {
            if !raw.trim().is_empty() {
                let kinds: BTreeMap<String, PoolConfig> = serde_json::from_str(&raw).map_err(|e| ConfigError::Env {
                    var: "TETHER_KIND_CONFIG",
                    value: raw.clone(),
                    reason: e.to_string(),
                })?;
                self.kinds.extend(kinds);
            }
        }
        Ok(self)
    }

    /// Defaults overlaid with the environment.
    pub fn from_env() -> Result<Self, ConfigError> { Self::default().with_env() }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let pool_ok = |p: &PoolConfig| p.workers > 0 && p.threadiness > 0 && p.shards > 0;
        if !pool_ok(&self.default_pool()) {
            return Err(ConfigError::Invalid("workers, threadiness and shards must be at least 1".into()));
        }
        for (key, pool) in self.kinds.iter() {
            Gvk::from_str(key)?;
            if !pool_ok(pool) {
                return Err(ConfigError::Invalid(format!("kind {}: workers, threadiness and shards must be at least 1", key)));
            }
        }
        if self.backoff_first_ms == 0 {
            return Err(ConfigError::Invalid("backoff_first_ms must be positive".into()));
        }
        if Duration::from_millis(self.backoff_first_ms) > Duration::from_secs(self.backoff_max_secs) {
            return Err(ConfigError::Invalid("backoff_first_ms exceeds backoff_max_secs".into()));
        }
        if matches!(self.namespace.as_deref(), Some(ns) if ns.trim().is_empty()) {
            return Err(ConfigError::Invalid("namespace must not be blank".into()));
        }
        Ok(())
    }

    fn default_pool(&self) -> PoolConfig {
        PoolConfig { workers: self.workers, threadiness: self.threadiness, shards: self.shards }
    }

    pub fn resync_interval(&self) -> Option<Duration> {
        (self.resync_secs > 0).then(|| Duration::from_secs(self.resync_secs))
    }

    pub fn scheduler_config(&self) -> Result<SchedulerConfig, ConfigError> {
        let mut kinds = rustc_hash::FxHashMap::default();
        for (key, pool) in self.kinds.iter() {
            kinds.insert(Gvk::from_str(key)?, *pool);
        }
        Ok(SchedulerConfig {
            defaults: self.default_pool(),
            kinds,
            backoff: BackoffPolicy {
                first: Duration::from_millis(self.backoff_first_ms),
                max: Duration::from_secs(self.backoff_max_secs),
                ..BackoffPolicy::default()
            },
        })
    }
}
