use std::collections::BTreeMap;
use std::env;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

/// Read a profiled env var: tries {PROFILE}_{KEY} first, falls back to {KEY}.
fn profiled_env_opt(profile: &str, key: &str) -> Option<String> {
    if !profile.is_empty() {
        let prefixed = format!("{}_{}", profile, key);
        if let Some(v) = env_opt(&prefixed) {
            return Some(v);
        }
    }
    env_opt(key)
}

fn profiled_env_or(profile: &str, key: &str, default: &str) -> String {
    profiled_env_opt(profile, key).unwrap_or_else(|| default.to_string())
}

fn profiled_env_u16(profile: &str, key: &str, default: u16) -> u16 {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn profiled_env_u32(profile: &str, key: &str, default: u32) -> u32 {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn profiled_env_u64(profile: &str, key: &str, default: u64) -> u64 {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

// ── Top-level config ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Active profile name (empty = default).
    pub profile: String,
    pub registry: RegistryConfig,
    pub cluster: ClusterConfig,
    pub engine: EngineConfig,
    pub worker: WorkerConfig,
}

impl Config {
    /// Build config from environment variables (call `load_dotenv()` first).
    /// Profile is read from `CURATOR_PROFILE`. When set (e.g. `PROD`),
    /// every key is first looked up as `{PROFILE}_{KEY}`, falling back to `{KEY}`.
    pub fn from_env() -> Self {
        let profile = env_or("CURATOR_PROFILE", "").to_uppercase();
        Self::for_profile(&profile)
    }

    /// Build config for a specific named profile (empty string = default).
    pub fn for_profile(profile: &str) -> Self {
        let p = profile.to_uppercase();
        let p = p.as_str();
        Self {
            profile: p.to_string(),
            registry: RegistryConfig::from_env_profiled(p),
            cluster: ClusterConfig::from_env_profiled(p),
            engine: EngineConfig::from_env_profiled(p),
            worker: WorkerConfig::from_env_profiled(p),
        }
    }

    pub fn profile_label(&self) -> &str {
        if self.profile.is_empty() { "default" } else { &self.profile }
    }

    /// Print a redacted summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Config loaded (profile: {}):", self.profile_label());
        tracing::info!("  registry:  host={}, db={}", self.registry.host, self.registry.database);
        tracing::info!("  cluster:   scheduler={}, engine={}", self.cluster.scheduler_url, self.cluster.engine_url);
        tracing::info!("  engine:    checkpoint_dir={}", self.engine.checkpoint_dir.display());
        tracing::info!(
            "  worker:    name={}, heartbeat={}s, staleness={}s",
            self.worker.worker_name, self.worker.heartbeat_interval_secs, self.worker.heartbeat_staleness_secs
        );
    }
}

// ── Registry (PostgreSQL) ─────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub ssl_mode: String,
    pub max_connections: u32,
    /// Transient-failure retries before a registry call escalates.
    pub connect_retries: u32,
}

impl RegistryConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            host: profiled_env_or(p, "PG_HOST", "localhost"),
            port: profiled_env_u16(p, "PG_PORT", 5432),
            database: profiled_env_or(p, "PG_DATABASE", "curator"),
            username: profiled_env_opt(p, "PG_USERNAME"),
            password: profiled_env_opt(p, "PG_PASSWORD"),
            ssl_mode: profiled_env_or(p, "PG_SSL_MODE", "prefer"),
            max_connections: profiled_env_u32(p, "PG_MAX_CONNECTIONS", 10),
            connect_retries: profiled_env_u32(p, "REGISTRY_CONNECT_RETRIES", 3),
        }
    }

    pub fn connection_string(&self) -> String {
        let user = self.username.as_deref().unwrap_or("postgres");
        let pass = self.password.as_deref().unwrap_or("");
        format!(
            "postgres://{}:{}@{}:{}/{}?sslmode={}",
            user, pass, self.host, self.port, self.database, self.ssl_mode
        )
    }

    pub fn is_configured(&self) -> bool {
        self.username.is_some()
    }
}

// ── Cluster (scheduler + dataset engine) ──────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Base URL of the external cluster scheduler API.
    pub scheduler_url: String,
    /// Base URL of the distributed dataset engine.
    pub engine_url: String,
    /// Container image used for submitted pipeline tasks.
    pub task_image: String,
    /// Directory shared with cluster tasks for completion artifacts.
    pub artifacts_dir: PathBuf,
    /// Watch reconnect backoff ceiling in seconds.
    pub watch_backoff_max_secs: u64,
    /// Extra environment (feature flags) injected into every submitted
    /// task, parsed from `CLUSTER_TASK_ENV` as `KEY=VALUE,KEY=VALUE`.
    pub task_env: BTreeMap<String, String>,
}

impl ClusterConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            scheduler_url: profiled_env_or(p, "CLUSTER_SCHEDULER_URL", "http://localhost:8300"),
            engine_url: profiled_env_or(p, "CLUSTER_ENGINE_URL", "http://localhost:8400"),
            task_image: profiled_env_or(p, "CLUSTER_TASK_IMAGE", "curator-pipeline:latest"),
            artifacts_dir: PathBuf::from(profiled_env_or(p, "ARTIFACTS_DIR", "data/artifacts")),
            watch_backoff_max_secs: profiled_env_u64(p, "WATCH_BACKOFF_MAX_SECS", 60),
            task_env: parse_env_pairs(&profiled_env_or(p, "CLUSTER_TASK_ENV", "")),
        }
    }
}

fn parse_env_pairs(raw: &str) -> BTreeMap<String, String> {
    raw.split(',')
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            let key = key.trim();
            if key.is_empty() {
                return None;
            }
            Some((key.to_string(), value.trim().to_string()))
        })
        .collect()
}

// ── Engine ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Where intermediate stage snapshots are written.
    pub checkpoint_dir: PathBuf,
    /// Records sampled per stage when tracing is enabled.
    pub trace_sample_size: u32,
    /// Host memory available to pipelines in GiB (0 = unknown).
    pub host_mem_gib: f64,
    /// Accelerator devices visible to this worker (0 = none).
    pub accelerator_count: u32,
    /// Free accelerator memory per device in GiB.
    pub accelerator_mem_gib: f64,
}

impl EngineConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            checkpoint_dir: PathBuf::from(profiled_env_or(p, "CHECKPOINT_DIR", "data/checkpoints")),
            trace_sample_size: profiled_env_u32(p, "TRACE_SAMPLE_SIZE", 10),
            host_mem_gib: profiled_env_opt(p, "HOST_MEM_GIB")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0.0),
            accelerator_count: profiled_env_u32(p, "ACCELERATOR_COUNT", 0),
            accelerator_mem_gib: profiled_env_opt(p, "ACCELERATOR_MEM_GIB")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0.0),
        }
    }
}

// ── Worker ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub worker_name: String,
    pub heartbeat_interval_secs: u64,
    /// Heartbeats older than this classify a worker offline.
    pub heartbeat_staleness_secs: u64,
    /// Interval between queued-job polls.
    pub poll_interval_secs: u64,
}

impl WorkerConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            worker_name: profiled_env_or(p, "WORKER_NAME", "curation-worker"),
            heartbeat_interval_secs: profiled_env_u64(p, "HEARTBEAT_INTERVAL_SECS", 30),
            heartbeat_staleness_secs: profiled_env_u64(p, "HEARTBEAT_STALENESS_SECS", 90),
            poll_interval_secs: profiled_env_u64(p, "JOB_POLL_INTERVAL_SECS", 5),
        }
    }
}
