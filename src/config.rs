use std::time::Duration;

use anyhow::Context;

pub const DEFAULT_SYNC_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_SYNC_MAX_RETRIES: usize = 3;
pub const DEFAULT_SYNC_BACKOFF_MS: u64 = 200;
pub const DEFAULT_SIMULATION_TRIALS: usize = 100;

/// Delivery policy for the external score service.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    /// Base URL of the score service; `None` leaves LTI courses unable to deliver.
    pub endpoint: Option<String>,
    pub timeout: Duration,
    /// Extra attempts on the idempotent 1.3 path. The 1.1 path never retries.
    pub max_retries: usize,
    pub backoff_base: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            timeout: Duration::from_secs(DEFAULT_SYNC_TIMEOUT_SECS),
            max_retries: DEFAULT_SYNC_MAX_RETRIES,
            backoff_base: Duration::from_millis(DEFAULT_SYNC_BACKOFF_MS),
        }
    }
}

pub fn max_backoff_delay() -> Duration {
    Duration::from_secs(5)
}

/// Longest an explicit push holds the request loop, whatever the roster size.
pub fn max_push_wait() -> Duration {
    Duration::from_secs(15)
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub sync: SyncConfig,
    pub simulation_trials: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sync: SyncConfig::default(),
            simulation_trials: DEFAULT_SIMULATION_TRIALS,
        }
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let mut cfg = Self::default();
        if let Some(endpoint) = lookup("ASSIGND_SCORE_ENDPOINT") {
            let endpoint = endpoint.trim().trim_end_matches('/').to_string();
            if !endpoint.is_empty() {
                cfg.sync.endpoint = Some(endpoint);
            }
        }
        if let Some(raw) = lookup("ASSIGND_SYNC_TIMEOUT_SECS") {
            let secs: u64 = raw
                .trim()
                .parse()
                .with_context(|| format!("ASSIGND_SYNC_TIMEOUT_SECS must be an integer, got {raw:?}"))?;
            cfg.sync.timeout = Duration::from_secs(secs.max(1));
        }
        if let Some(raw) = lookup("ASSIGND_SYNC_MAX_RETRIES") {
            cfg.sync.max_retries = raw
                .trim()
                .parse()
                .with_context(|| format!("ASSIGND_SYNC_MAX_RETRIES must be an integer, got {raw:?}"))?;
        }
        if let Some(raw) = lookup("ASSIGND_SYNC_BACKOFF_MS") {
            let ms: u64 = raw
                .trim()
                .parse()
                .with_context(|| format!("ASSIGND_SYNC_BACKOFF_MS must be an integer, got {raw:?}"))?;
            cfg.sync.backoff_base = Duration::from_millis(ms);
        }
        if let Some(raw) = lookup("ASSIGND_SIM_TRIALS") {
            let trials: usize = raw
                .trim()
                .parse()
                .with_context(|| format!("ASSIGND_SIM_TRIALS must be an integer, got {raw:?}"))?;
            cfg.simulation_trials = trials.max(1);
        }
        Ok(cfg)
    }
}
