//! Strongly typed operation requests.
//!
//! The engine never sees loosely typed configuration. Dynamic input (for
//! example a node's JSON configuration in a workflow graph) is decoded and
//! validated exactly once by [`OperationRequest::from_config`]; everything
//! downstream works with the resulting [`OperationRequest`].

use crate::{CorrelationKey, OperationId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60 * 60);
/// Longest accepted timeout. Deadlines are persisted as epoch millis and
/// must stay well inside the store's signed 64-bit range.
pub const MAX_TIMEOUT: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// How completion is observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PollMode {
    /// Query the remote status every poll interval; push events may also
    /// resolve the operation.
    #[default]
    Poll,
    /// No status API. Only a push event resolves the operation; a single
    /// callback enforces the timeout.
    PushOnly,
}

/// Validation failure for a request field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestError {
    pub field: String,
    pub message: String,
}

impl RequestError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for RequestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid {}: {}", self.field, self.message)
    }
}

impl std::error::Error for RequestError {}

/// Validated request to start and track one remote operation.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationRequest {
    pub operation_id: OperationId,
    pub connector: String,
    /// Passed to the remote `start` call and compared on re-initiation.
    pub idempotency_key: String,
    pub poll_interval: Duration,
    pub timeout: Duration,
    pub mode: PollMode,
    pub correlation: Vec<CorrelationKey>,
    /// Vendor-specific start parameters, opaque to the engine.
    pub params: Value,
}

impl OperationRequest {
    pub fn builder(operation_id: impl Into<OperationId>, connector: impl Into<String>) -> OperationRequestBuilder {
        OperationRequestBuilder {
            operation_id: operation_id.into(),
            connector: connector.into(),
            idempotency_key: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
            timeout: DEFAULT_TIMEOUT,
            mode: PollMode::Poll,
            correlation: Vec::new(),
            params: Value::Null,
        }
    }

    /// Decode and validate a loosely typed configuration object.
    ///
    /// ```
    /// # use opwatch::OperationRequest;
    /// let req = OperationRequest::from_config(&serde_json::json!({
    ///     "operation_id": "exec-1",
    ///     "connector": "ci",
    ///     "poll_interval_ms": 60000,
    ///     "timeout_ms": 600000,
    ///     "correlation": { "pipeline_run": "run-9" },
    ///     "params": { "branch": "main" }
    /// }))
    /// .unwrap();
    /// assert_eq!(req.correlation[0].value, "run-9");
    /// ```
    pub fn from_config(config: &Value) -> Result<Self, RequestError> {
        let raw: RawOperationConfig =
            serde_json::from_value(config.clone()).map_err(|e| RequestError::new("config", e.to_string()))?;

        let mut builder = Self::builder(raw.operation_id, raw.connector)
            .mode(raw.mode)
            .params(raw.params);
        if let Some(key) = raw.idempotency_key {
            builder = builder.idempotency_key(key);
        }
        if let Some(ms) = raw.poll_interval_ms {
            builder = builder.poll_interval(Duration::from_millis(ms));
        }
        if let Some(ms) = raw.timeout_ms {
            builder = builder.timeout(Duration::from_millis(ms));
        }
        for (key, value) in raw.correlation {
            builder = builder.correlate(key, value);
        }
        builder.build()
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawOperationConfig {
    operation_id: String,
    connector: String,
    #[serde(default)]
    idempotency_key: Option<String>,
    #[serde(default)]
    poll_interval_ms: Option<u64>,
    #[serde(default)]
    timeout_ms: Option<u64>,
    #[serde(default)]
    mode: PollMode,
    #[serde(default)]
    correlation: BTreeMap<String, String>,
    #[serde(default)]
    params: Value,
}

pub struct OperationRequestBuilder {
    operation_id: OperationId,
    connector: String,
    idempotency_key: Option<String>,
    poll_interval: Duration,
    timeout: Duration,
    mode: PollMode,
    correlation: Vec<CorrelationKey>,
    params: Value,
}

impl OperationRequestBuilder {
    pub fn idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn mode(mut self, mode: PollMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn correlate(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.correlation.push(CorrelationKey::new(key, value));
        self
    }

    pub fn params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }

    pub fn build(self) -> Result<OperationRequest, RequestError> {
        if self.operation_id.as_str().trim().is_empty() {
            return Err(RequestError::new("operation_id", "must not be empty"));
        }
        if self.connector.trim().is_empty() {
            return Err(RequestError::new("connector", "must not be empty"));
        }
        if self.timeout.is_zero() {
            return Err(RequestError::new("timeout", "must be greater than zero"));
        }
        if self.timeout > MAX_TIMEOUT {
            return Err(RequestError::new("timeout", "must not exceed 365 days"));
        }
        if self.mode == PollMode::Poll {
            if self.poll_interval.is_zero() {
                return Err(RequestError::new("poll_interval", "must be greater than zero"));
            }
            if self.poll_interval > self.timeout {
                return Err(RequestError::new("poll_interval", "must not exceed timeout"));
            }
        }
        for key in &self.correlation {
            if key.key.is_empty() || key.value.is_empty() {
                return Err(RequestError::new("correlation", "keys and values must not be empty"));
            }
        }

        let idempotency_key = self
            .idempotency_key
            .unwrap_or_else(|| self.operation_id.as_str().to_string());
        Ok(OperationRequest {
            operation_id: self.operation_id,
            connector: self.connector,
            idempotency_key,
            poll_interval: self.poll_interval,
            timeout: self.timeout,
            mode: self.mode,
            correlation: self.correlation,
            params: self.params,
        })
    }
}
