use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub const DEFAULT_API_HOST: &str = "127.0.0.1";
pub const DEFAULT_API_PORT: u16 = 8000;
pub const DEFAULT_EVAL_CONCURRENCY: usize = 4;

/// Engine configuration sourced from the environment. There is no global
/// instance: the config is built once and threaded through an
/// [`crate::EngineContext`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Storage location. A `file:` prefix is tolerated; the remainder is
    /// treated as a directory path for the entity store.
    pub database_url: String,
    pub log_level: String,
    pub api_host: String,
    pub api_port: u16,
    /// Worker cap for the evaluation fan-out.
    pub eval_concurrency: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_url: "./crucible-data".to_string(),
            log_level: "info".to_string(),
            api_host: DEFAULT_API_HOST.to_string(),
            api_port: DEFAULT_API_PORT,
            eval_concurrency: DEFAULT_EVAL_CONCURRENCY,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database_url: env_string("DATABASE_URL").unwrap_or(defaults.database_url),
            log_level: env_string("LOG_LEVEL").unwrap_or(defaults.log_level),
            api_host: env_string("API_HOST").unwrap_or(defaults.api_host),
            api_port: env_string("API_PORT")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.api_port),
            eval_concurrency: env_string("CRUCIBLE_EVAL_CONCURRENCY")
                .and_then(|v| v.parse().ok())
                .filter(|v| *v > 0)
                .unwrap_or(defaults.eval_concurrency),
        }
    }

    pub fn store_path(&self) -> PathBuf {
        let raw = self
            .database_url
            .strip_prefix("file://")
            .or_else(|| self.database_url.strip_prefix("file:"))
            .unwrap_or(&self.database_url);
        PathBuf::from(raw)
    }
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}
