//! Runtime configuration types.
//!
//! These types hold the concrete values that drive node runtime behavior.
//! Construct a [`NodeRuntime`](crate::runtime::NodeRuntime) through
//! [`RuntimeConfig::default`] plus field overrides, or load overrides from
//! the environment with [`RuntimeConfig::from_env`].
//!
//! # Defaults
//!
//! | Field | Default |
//! |-------|---------|
//! | `worker_threads` | available CPU parallelism |
//! | `thread_name_prefix` | `"contexture-worker"` |
//! | `gate_stall_warn` | 5 s |
//! | `gate_timeout` | `None` (wait forever) |
//! | `snapshot_history` | 8 |
//! | `migration_threshold` | 0.8 |

use std::time::Duration;

use thiserror::Error;

use crate::types::NodeAddr;

/// Error produced when an environment override cannot be parsed.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A numeric override had a non-numeric value.
    #[error("invalid value for {var}: {value:?}")]
    InvalidValue {
        /// The environment variable name.
        var: &'static str,
        /// The rejected value.
        value: String,
    },
}

/// Node runtime configuration.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Address of this node, as published in the context mapping.
    pub local_addr: NodeAddr,
    /// Number of event worker threads (default: available parallelism).
    pub worker_threads: usize,
    /// Name prefix for worker threads.
    pub thread_name_prefix: String,
    /// How long a ticket gate may fail to advance with waiters present
    /// before a warning is logged.
    pub gate_stall_warn: Duration,
    /// Optional hard bound on gate waits. `None` waits forever; a bound
    /// turns a missed wakeup into a recoverable `GateTimeout` error
    /// instead of a hang.
    pub gate_timeout: Option<Duration>,
    /// Number of committed snapshot versions each context retains for
    /// late readers.
    pub snapshot_history: usize,
    /// Threshold in `[0, 1]` used by percentile elasticity conditions.
    pub migration_threshold: f64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            local_addr: NodeAddr::new("localhost"),
            worker_threads: std::thread::available_parallelism().map_or(1, |n| n.get()),
            thread_name_prefix: "contexture-worker".to_string(),
            gate_stall_warn: Duration::from_secs(5),
            gate_timeout: None,
            snapshot_history: 8,
            migration_threshold: 0.8,
        }
    }
}

impl RuntimeConfig {
    /// Normalize configuration values to safe defaults.
    pub fn normalize(&mut self) {
        if self.worker_threads == 0 {
            self.worker_threads = 1;
        }
        if self.thread_name_prefix.is_empty() {
            self.thread_name_prefix = "contexture-worker".to_string();
        }
        if self.snapshot_history == 0 {
            self.snapshot_history = 1;
        }
        if !(0.0..=1.0).contains(&self.migration_threshold) {
            self.migration_threshold = 0.8;
        }
    }

    /// Builds a configuration from defaults plus environment overrides.
    ///
    /// Recognized variables: `CONTEXTURE_WORKERS`, `CONTEXTURE_ADDR`,
    /// `CONTEXTURE_GATE_TIMEOUT_MS`, `CONTEXTURE_SNAPSHOT_HISTORY`,
    /// `CONTEXTURE_MIGRATION_THRESHOLD`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Ok(v) = std::env::var("CONTEXTURE_WORKERS") {
            config.worker_threads = parse(&v, "CONTEXTURE_WORKERS")?;
        }
        if let Ok(v) = std::env::var("CONTEXTURE_ADDR") {
            config.local_addr = NodeAddr::new(v);
        }
        if let Ok(v) = std::env::var("CONTEXTURE_GATE_TIMEOUT_MS") {
            let ms: u64 = parse(&v, "CONTEXTURE_GATE_TIMEOUT_MS")?;
            config.gate_timeout = Some(Duration::from_millis(ms));
        }
        if let Ok(v) = std::env::var("CONTEXTURE_SNAPSHOT_HISTORY") {
            config.snapshot_history = parse(&v, "CONTEXTURE_SNAPSHOT_HISTORY")?;
        }
        if let Ok(v) = std::env::var("CONTEXTURE_MIGRATION_THRESHOLD") {
            config.migration_threshold = parse(&v, "CONTEXTURE_MIGRATION_THRESHOLD")?;
        }
        config.normalize();
        Ok(config)
    }
}

fn parse<T: std::str::FromStr>(value: &str, var: &'static str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        var,
        value: value.to_string(),
    })
}
