//! Engine configuration loading from environment variables.
//!
//! All values are loaded from `MERGE_ENGINE_*` environment variables with
//! sensible defaults. Invalid values fall back to defaults without crashing;
//! floors keep the loaded configuration always valid.
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |---|---|---|
//! | `MERGE_ENGINE_MAX_CONCURRENT` | 8 | Max concurrent underlying calls |
//! | `MERGE_ENGINE_MAX_PENDING` | 256 | Max queued requests |
//! | `MERGE_ENGINE_KEY_HEADERS` | (empty) | Comma-separated header names folded into the dedup key |

use crate::error::ConfigError;
use crate::key::KeyPolicy;

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum simultaneously dispatched underlying calls. Must be >= 1.
    pub concurrency_limit: usize,
    /// Maximum requests parked behind an exhausted budget. Must be >= 1.
    pub max_pending: usize,
    /// Which request fields participate in the dedup key.
    pub key_policy: KeyPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            concurrency_limit: 8,
            max_pending: 256,
            key_policy: KeyPolicy::default(),
        }
    }
}

impl EngineConfig {
    /// Reject configurations the engine must never run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency_limit < 1 {
            return Err(ConfigError::InvalidConcurrencyLimit(self.concurrency_limit));
        }
        if self.max_pending < 1 {
            return Err(ConfigError::InvalidQueueDepth(self.max_pending));
        }
        Ok(())
    }

    /// Summary of all effective values.
    pub fn effective(&self) -> EffectiveConfig {
        EffectiveConfig {
            concurrency_limit: self.concurrency_limit,
            max_pending: self.max_pending,
            key_headers: self.key_policy.include_headers.clone(),
        }
    }
}

/// Effective configuration summary.
#[derive(Debug, Clone)]
pub struct EffectiveConfig {
    pub concurrency_limit: usize,
    pub max_pending: usize,
    pub key_headers: Vec<String>,
}

/// Parse a `usize` env var, returning `default` on missing or invalid.
fn parse_usize(key: &str, default: usize) -> usize {
    match std::env::var(key) {
        Ok(val) => val.parse::<usize>().unwrap_or(default),
        Err(_) => default,
    }
}

/// Parse a comma-separated env var into trimmed, non-empty entries.
fn parse_list(key: &str) -> Vec<String> {
    match std::env::var(key) {
        Ok(val) => val
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        Err(_) => Vec::new(),
    }
}

/// Load configuration from environment variables.
///
/// Missing or invalid values fall back to defaults; floors guarantee the
/// result passes [`EngineConfig::validate`].
pub fn load() -> EngineConfig {
    let concurrency_limit = parse_usize("MERGE_ENGINE_MAX_CONCURRENT", 8).max(1);
    let max_pending = parse_usize("MERGE_ENGINE_MAX_PENDING", 256).max(1);
    let include_headers = parse_list("MERGE_ENGINE_KEY_HEADERS");

    EngineConfig {
        concurrency_limit,
        max_pending,
        key_policy: KeyPolicy { include_headers },
    }
}
