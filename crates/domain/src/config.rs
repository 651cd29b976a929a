//! Runtime configuration, read from the environment once at startup.

use std::path::PathBuf;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Defaults
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub const DEFAULT_TURN_MAX_CONCURRENCY: usize = 64;
pub const DEFAULT_TURN_MAX_QUEUE: usize = 512;
pub const DEFAULT_SUBAGENT_MAX_CONCURRENCY: usize = 12;
pub const DEFAULT_SUBAGENT_MAX_QUEUE: usize = 256;
pub const DEFAULT_PYTHON_MAX_CONCURRENCY: usize = 16;
pub const DEFAULT_PYTHON_MAX_QUEUE: usize = 256;
pub const DEFAULT_SANDBOX_MAX_CONCURRENCY: usize = 3;
pub const DEFAULT_SANDBOX_MAX_QUEUE: usize = 16;
pub const DEFAULT_SANDBOX_REAPER_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_SANDBOX_IDLE_TTL_SECS: u64 = 900;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Root directory for the metadata DB, per-worldline analytical DBs,
    /// workspaces, and snapshots.
    pub data_dir: PathBuf,

    pub turn_max_concurrency: usize,
    pub turn_max_queue: usize,
    pub subagent_max_concurrency: usize,
    pub subagent_max_queue: usize,
    pub python_max_concurrency: usize,
    pub python_max_queue: usize,

    pub sandbox_max_concurrency: usize,
    pub sandbox_max_queue: usize,
    pub sandbox_reaper_interval_secs: u64,
    pub sandbox_idle_ttl_secs: u64,

    /// Default LLM provider name, resolved through the provider registry.
    pub llm_provider: Option<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            turn_max_concurrency: DEFAULT_TURN_MAX_CONCURRENCY,
            turn_max_queue: DEFAULT_TURN_MAX_QUEUE,
            subagent_max_concurrency: DEFAULT_SUBAGENT_MAX_CONCURRENCY,
            subagent_max_queue: DEFAULT_SUBAGENT_MAX_QUEUE,
            python_max_concurrency: DEFAULT_PYTHON_MAX_CONCURRENCY,
            python_max_queue: DEFAULT_PYTHON_MAX_QUEUE,
            sandbox_max_concurrency: DEFAULT_SANDBOX_MAX_CONCURRENCY,
            sandbox_max_queue: DEFAULT_SANDBOX_MAX_QUEUE,
            sandbox_reaper_interval_secs: DEFAULT_SANDBOX_REAPER_INTERVAL_SECS,
            sandbox_idle_ttl_secs: DEFAULT_SANDBOX_IDLE_TTL_SECS,
            llm_provider: None,
        }
    }
}

impl RuntimeConfig {
    /// Read configuration from the environment, falling back to defaults
    /// for missing or unparseable values.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            data_dir: std::env::var("WORLDLINE_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            turn_max_concurrency: env_usize("CHAT_TURN_MAX_CONCURRENCY", defaults.turn_max_concurrency),
            turn_max_queue: env_usize("CHAT_TURN_MAX_QUEUE", defaults.turn_max_queue),
            subagent_max_concurrency: env_usize(
                "CHAT_SUBAGENT_MAX_CONCURRENCY",
                defaults.subagent_max_concurrency,
            ),
            subagent_max_queue: env_usize("CHAT_SUBAGENT_MAX_QUEUE", defaults.subagent_max_queue),
            python_max_concurrency: env_usize(
                "CHAT_PYTHON_MAX_CONCURRENCY",
                defaults.python_max_concurrency,
            ),
            python_max_queue: env_usize("CHAT_PYTHON_MAX_QUEUE", defaults.python_max_queue),
            sandbox_max_concurrency: env_usize(
                "SANDBOX_MAX_CONCURRENCY",
                defaults.sandbox_max_concurrency,
            ),
            sandbox_max_queue: env_usize("SANDBOX_MAX_QUEUE", defaults.sandbox_max_queue),
            sandbox_reaper_interval_secs: env_u64(
                "SANDBOX_REAPER_INTERVAL_SECONDS",
                defaults.sandbox_reaper_interval_secs,
            ),
            sandbox_idle_ttl_secs: env_u64(
                "SANDBOX_IDLE_TTL_SECONDS",
                defaults.sandbox_idle_ttl_secs,
            ),
            llm_provider: std::env::var("LLM_PROVIDER").ok().filter(|v| !v.is_empty()),
        }
    }
}

fn env_usize(name: &str, default: usize) -> usize {
    match std::env::var(name) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!(var = name, value = %raw, "unparseable env var, using default");
            default
        }),
        Err(_) => default,
    }
}

fn env_u64(name: &str, default: u64) -> u64 {
    match std::env::var(name) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!(var = name, value = %raw, "unparseable env var, using default");
            default
        }),
        Err(_) => default,
    }
}
