//! Observability: structured logging setup and engine counters.
//!
//! Logging goes through `tracing`; [`init_logging`] installs a
//! `tracing-subscriber` pipeline. Counters are plain atomics exposed as a
//! [`MetricsSnapshot`] for tests and diagnostics.

use std::sync::atomic::{AtomicU64, Ordering};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Log format options for structured logging
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Structured JSON output for log aggregators
    Json,
    /// Human-readable format for development (with all fields)
    Pretty,
    /// Compact format: timestamp level module message
    #[default]
    Compact,
}

/// Logging configuration.
///
/// # Example
///
/// ```rust,no_run
/// # use opwatch::runtime::observability::{init_logging, ObservabilityConfig, LogFormat};
/// let config = ObservabilityConfig {
///     log_format: LogFormat::Json,
///     log_level: "debug".to_string(),
///     ..Default::default()
/// };
/// init_logging(&config).expect("logging already initialized");
/// ```
///
/// # Correlation Fields
///
/// Engine logs carry:
/// - `operation_id` - Tracked operation identifier
/// - `connector` - Connector name
/// - `external_ref` - Remote handle
/// - `outcome` - Terminal outcome, on termination
#[derive(Debug, Clone)]
pub struct ObservabilityConfig {
    /// Log output format
    pub log_format: LogFormat,
    /// Log level filter for opwatch targets (e.g., "info", "debug")
    pub log_level: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_format: LogFormat::Compact,
            log_level: "info".to_string(),
        }
    }
}

fn default_filter_expression(level: &str) -> String {
    format!("warn,opwatch={level}")
}

/// Install the global subscriber. `RUST_LOG` overrides `log_level`.
///
/// # Errors
///
/// Returns an error if a global subscriber is already installed.
pub fn init_logging(config: &ObservabilityConfig) -> Result<(), String> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter_expression(&config.log_level)));

    match config.log_format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .try_init()
                .map_err(|e| format!("Failed to initialize JSON logging: {}", e))?;
        }
        LogFormat::Pretty => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().pretty())
                .try_init()
                .map_err(|e| format!("Failed to initialize pretty logging: {}", e))?;
        }
        LogFormat::Compact => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().compact())
                .try_init()
                .map_err(|e| format!("Failed to initialize compact logging: {}", e))?;
        }
    }

    Ok(())
}

/// Snapshot of engine counters for tests and diagnostics.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub operations_started: u64,
    pub start_failures: u64,
    pub polls: u64,
    pub transient_status_errors: u64,
    pub terminated_success: u64,
    pub terminated_failure: u64,
    pub terminated_timeout: u64,
    pub terminated_cancelled: u64,
    pub push_events: u64,
    pub push_ignored: u64,
    pub duplicate_deliveries: u64,
    pub emission_failures: u64,
}

impl MetricsSnapshot {
    pub fn terminations(&self) -> u64 {
        self.terminated_success + self.terminated_failure + self.terminated_timeout + self.terminated_cancelled
    }
}

#[derive(Debug, Default)]
pub struct EngineMetrics {
    operations_started: AtomicU64,
    start_failures: AtomicU64,
    polls: AtomicU64,
    transient_status_errors: AtomicU64,
    terminated_success: AtomicU64,
    terminated_failure: AtomicU64,
    terminated_timeout: AtomicU64,
    terminated_cancelled: AtomicU64,
    push_events: AtomicU64,
    push_ignored: AtomicU64,
    duplicate_deliveries: AtomicU64,
    emission_failures: AtomicU64,
}

impl EngineMetrics {
    #[inline]
    pub(crate) fn record_start(&self) {
        self.operations_started.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_start_failure(&self) {
        self.start_failures.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_poll(&self) {
        self.polls.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_transient_error(&self) {
        self.transient_status_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_termination(&self, outcome: crate::TerminalOutcome) {
        let counter = match outcome {
            crate::TerminalOutcome::Success => &self.terminated_success,
            crate::TerminalOutcome::Failure => &self.terminated_failure,
            crate::TerminalOutcome::Timeout => &self.terminated_timeout,
            crate::TerminalOutcome::Cancelled => &self.terminated_cancelled,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_push(&self) {
        self.push_events.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_push_ignored(&self) {
        self.push_ignored.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_duplicate(&self) {
        self.duplicate_deliveries.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_emission_failure(&self) {
        self.emission_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            operations_started: self.operations_started.load(Ordering::Relaxed),
            start_failures: self.start_failures.load(Ordering::Relaxed),
            polls: self.polls.load(Ordering::Relaxed),
            transient_status_errors: self.transient_status_errors.load(Ordering::Relaxed),
            terminated_success: self.terminated_success.load(Ordering::Relaxed),
            terminated_failure: self.terminated_failure.load(Ordering::Relaxed),
            terminated_timeout: self.terminated_timeout.load(Ordering::Relaxed),
            terminated_cancelled: self.terminated_cancelled.load(Ordering::Relaxed),
            push_events: self.push_events.load(Ordering::Relaxed),
            push_ignored: self.push_ignored.load(Ordering::Relaxed),
            duplicate_deliveries: self.duplicate_deliveries.load(Ordering::Relaxed),
            emission_failures: self.emission_failures.load(Ordering::Relaxed),
        }
    }
}
