//! Runtime configuration.
//!
//! Configuration can be built programmatically or loaded from environment
//! variables:
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `LAMBARS_FIBER_WORKERS` | Host worker threads | 1 |
//! | `LAMBARS_FIBER_YIELD_OPS` | Interpreter steps per slice before yielding | 10000 |
//! | `LAMBARS_FIBER_REPORT_FAILURES` | Log root fibers that end in failure | false |
//!
//! Unparsable or zero values fall back to the defaults.
//!
//! # Examples
//!
//! ```rust
//! use lambars_fiber::runtime::RuntimeConfig;
//!
//! let config = RuntimeConfig::default()
//!     .with_worker_threads(2)
//!     .with_yield_op_count(512);
//! assert!(config.validate().is_ok());
//! assert_eq!(config.worker_threads(), 2);
//! ```

use std::env;

use super::error::RuntimeError;

/// Environment variable for [`RuntimeConfig::worker_threads`].
pub const WORKERS_ENV: &str = "LAMBARS_FIBER_WORKERS";
/// Environment variable for [`RuntimeConfig::yield_op_count`].
pub const YIELD_OPS_ENV: &str = "LAMBARS_FIBER_YIELD_OPS";
/// Environment variable for [`RuntimeConfig::report_failures`].
pub const REPORT_FAILURES_ENV: &str = "LAMBARS_FIBER_REPORT_FAILURES";

const DEFAULT_WORKER_THREADS: usize = 1;
const DEFAULT_YIELD_OP_COUNT: usize = 10_000;
const DEFAULT_THREAD_NAME: &str = "lambars-fiber";

/// Settings of a [`Runtime`](super::Runtime).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    worker_threads: usize,
    yield_op_count: usize,
    thread_name: String,
    report_failures: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            worker_threads: DEFAULT_WORKER_THREADS,
            yield_op_count: DEFAULT_YIELD_OP_COUNT,
            thread_name: DEFAULT_THREAD_NAME.to_string(),
            report_failures: false,
        }
    }
}

impl RuntimeConfig {
    /// A configuration using one worker thread per CPU.
    #[must_use]
    pub fn multi_threaded() -> Self {
        Self::default().with_worker_threads(num_cpus::get())
    }

    /// Loads the configuration from the environment.
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            worker_threads: read_positive(WORKERS_ENV).unwrap_or(defaults.worker_threads),
            yield_op_count: read_positive(YIELD_OPS_ENV).unwrap_or(defaults.yield_op_count),
            thread_name: defaults.thread_name,
            report_failures: env::var(REPORT_FAILURES_ENV)
                .ok()
                .and_then(|value| parse_flag(&value))
                .unwrap_or(defaults.report_failures),
        }
    }

    /// Sets the number of host worker threads.
    #[must_use]
    pub const fn with_worker_threads(mut self, worker_threads: usize) -> Self {
        self.worker_threads = worker_threads;
        self
    }

    /// Sets how many interpreter steps a fiber takes before yielding.
    #[must_use]
    pub const fn with_yield_op_count(mut self, yield_op_count: usize) -> Self {
        self.yield_op_count = yield_op_count;
        self
    }

    /// Sets the name of the host worker threads.
    #[must_use]
    pub fn with_thread_name(mut self, thread_name: impl Into<String>) -> Self {
        self.thread_name = thread_name.into();
        self
    }

    /// Enables logging of root fibers that end in failure.
    #[must_use]
    pub const fn with_report_failures(mut self, report_failures: bool) -> Self {
        self.report_failures = report_failures;
        self
    }

    /// Number of host worker threads.
    pub const fn worker_threads(&self) -> usize {
        self.worker_threads
    }

    /// Interpreter steps per slice.
    pub const fn yield_op_count(&self) -> usize {
        self.yield_op_count
    }

    /// Name of the host worker threads.
    pub fn thread_name(&self) -> &str {
        &self.thread_name
    }

    /// Whether failed root fibers are logged.
    pub const fn report_failures(&self) -> bool {
        self.report_failures
    }

    /// Checks that every setting is usable.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::InvalidConfig`] for zero worker threads, a
    /// zero step budget, or an empty thread name.
    pub fn validate(&self) -> Result<(), RuntimeError> {
        if self.worker_threads == 0 {
            return Err(RuntimeError::InvalidConfig(
                "worker_threads must be at least 1".to_string(),
            ));
        }
        if self.yield_op_count == 0 {
            return Err(RuntimeError::InvalidConfig(
                "yield_op_count must be at least 1".to_string(),
            ));
        }
        if self.thread_name.is_empty() {
            return Err(RuntimeError::InvalidConfig(
                "thread_name must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

fn read_positive(key: &str) -> Option<usize> {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<usize>().ok())
        .filter(|value| *value > 0)
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
