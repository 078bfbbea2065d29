//! Engine configuration types.
//!
//! `EngineConfig` represents the `nuoc.toml` that controls storage location,
//! scheduling limits, retry defaults, the HTTP listener and logging. Every
//! field has a default, so an empty file is a valid configuration.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::task::RetryPolicy;

/// Top-level configuration for the engine and its HTTP front end.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Directory holding the journal database.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Explicit database URL; derived from `data_dir` when absent.
    #[serde(default)]
    pub database_url: Option<String>,

    /// Upper bound on tasks executing at once across all jobs.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Interval between driver sweeps.
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,

    /// Retry settings for tasks that declare none.
    #[serde(default)]
    pub default_retry: RetryPolicy,

    /// Regressions allowed per job unless the job overrides it.
    #[serde(default = "default_max_regressions")]
    pub max_regressions: u32,

    #[serde(default)]
    pub http: HttpConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from(".oc-workflow")
}

fn default_max_concurrency() -> usize {
    8
}

fn default_sweep_interval_ms() -> u64 {
    1000
}

fn default_max_regressions() -> u32 {
    3
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            database_url: None,
            max_concurrency: default_max_concurrency(),
            sweep_interval_ms: default_sweep_interval_ms(),
            default_retry: RetryPolicy::default(),
            max_regressions: default_max_regressions(),
            http: HttpConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl EngineConfig {
    /// The configured database URL, or `sqlite://<data_dir>/journal.db`.
    pub fn resolved_database_url(&self) -> String {
        match &self.database_url {
            Some(url) => url.clone(),
            None => format!("sqlite://{}", self.data_dir.join("journal.db").display()),
        }
    }
}

/// HTTP listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

fn default_bind() -> String {
    "127.0.0.1:4097".to_string()
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

/// Log output settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `EnvFilter` directive; `RUST_LOG` wins when set.
    #[serde(default)]
    pub filter: Option<String>,
    /// Emit JSON lines instead of the human-readable format.
    #[serde(default)]
    pub json: bool,
    /// Export spans through OpenTelemetry (stdout exporter).
    #[serde(default)]
    pub otel: bool,
}
