//! # opwatch
//!
//! Durable tracking of long-running remote operations.
//!
//! A connector starts something on a remote system (a build, a sandbox, a
//! cloud zone operation, a human approval) and the engine tracks it until it
//! reaches a terminal state. Completion can be observed on two independent
//! paths that may race each other:
//!
//! - **Polling**: a scheduled callback re-checks the remote status.
//! - **Push**: a webhook or bus event reports the new state.
//!
//! Every invocation is a discrete unit of work that reloads its state from a
//! durable [`providers::MetadataStore`], so the initiating step, each poll and
//! each push may run in different processes. Exactly one terminal result is
//! emitted per operation, whichever path resolves it first.
//!
//! ```rust,no_run
//! # use std::sync::Arc;
//! # use std::time::Duration;
//! # use opwatch::providers::in_memory::InMemoryProvider;
//! # use opwatch::runtime::{Engine, registry::ConnectorRegistry};
//! # use opwatch::{Connector, OperationRequest, RecordingEmitter, RemoteOperationClient};
//! # async fn example(client: Arc<dyn RemoteOperationClient>) -> Result<(), Box<dyn std::error::Error>> {
//! let provider = Arc::new(InMemoryProvider::default());
//! let connectors = ConnectorRegistry::builder()
//!     .register(Connector::new("ci", client))
//!     .build();
//! let engine = Engine::builder(provider.clone(), provider.clone(), Arc::new(RecordingEmitter::default()))
//!     .connectors(connectors)
//!     .lookup(provider.clone())
//!     .build();
//!
//! let request = OperationRequest::builder("exec-1", "ci")
//!     .poll_interval(Duration::from_secs(60))
//!     .timeout(Duration::from_secs(600))
//!     .build()?;
//! engine.start(request).await?;
//! let _dispatcher = engine.start_dispatcher(provider);
//! # Ok(())
//! # }
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

pub mod cache;
pub mod client;
pub mod clock;
pub mod connector;
pub mod emitter;
pub mod providers;
pub mod request;
pub mod runtime;
pub mod webhook;

pub use client::{Client, WaitError};
pub use clock::{Clock, ManualClock, SystemClock};
pub use connector::{Connector, FieldEventMapper, PushEventMapper, RemoteError, RemoteOperationClient};
pub use emitter::{Emission, EventEmitter, RecordingEmitter};
pub use request::{OperationRequest, PollMode, RequestError};
pub use runtime::{Engine, EngineError, PollOutcome, PushOutcome, RuntimeOptions, Termination};

/// Stable identity of a tracked operation, scoped to one execution instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(String);

impl OperationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for OperationId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for OperationId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Opaque handle returned by the remote system when the operation was started.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExternalRef(String);

impl ExternalRef {
    pub fn new(r: impl Into<String>) -> Self {
        Self(r.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ExternalRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Key/value pair used to match an inbound push event to a started operation.
///
/// Compound keys ("pipeline name + execution id") are expressed by joining the
/// parts into a single value, see [`CorrelationKey::compound`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CorrelationKey {
    pub key: String,
    pub value: String,
}

impl CorrelationKey {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Build a key whose value is the `/`-joined concatenation of `parts`.
    pub fn compound<I, S>(key: impl Into<String>, parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let value = parts
            .into_iter()
            .map(|p| p.as_ref().to_string())
            .collect::<Vec<_>>()
            .join("/");
        Self { key: key.into(), value }
    }
}

/// Terminal outcome of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalOutcome {
    Success,
    Failure,
    Timeout,
    Cancelled,
}

impl TerminalOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            TerminalOutcome::Success => "success",
            TerminalOutcome::Failure => "failure",
            TerminalOutcome::Timeout => "timeout",
            TerminalOutcome::Cancelled => "cancelled",
        }
    }

    /// Output channel the terminal result is emitted on.
    ///
    /// Cancellation has no channel of its own; it is reported on the failure
    /// channel and distinguished by the `outcome` field of the payload.
    pub fn channel(&self) -> OutputChannel {
        match self {
            TerminalOutcome::Success => OutputChannel::Success,
            TerminalOutcome::Failure | TerminalOutcome::Cancelled => OutputChannel::Failure,
            TerminalOutcome::Timeout => OutputChannel::Timeout,
        }
    }
}

impl fmt::Display for TerminalOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of an [`OperationRecord`].
///
/// Transitions only move forward: `Polling`/`AwaitingPush` may repeat or
/// terminate, and a `Terminated` status never changes again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "outcome", rename_all = "snake_case")]
pub enum OperationStatus {
    Polling,
    AwaitingPush,
    Terminated(TerminalOutcome),
}

impl OperationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, OperationStatus::Terminated(_))
    }

    pub fn terminal_outcome(&self) -> Option<TerminalOutcome> {
        match self {
            OperationStatus::Terminated(o) => Some(*o),
            _ => None,
        }
    }

    pub fn can_transition_to(&self, next: &OperationStatus) -> bool {
        match (self, next) {
            (OperationStatus::Terminated(_), _) => false,
            (OperationStatus::Polling, OperationStatus::AwaitingPush) => false,
            (OperationStatus::AwaitingPush, OperationStatus::Polling) => false,
            _ => true,
        }
    }

    /// Short label stored alongside the record for querying.
    pub fn label(&self) -> &'static str {
        match self {
            OperationStatus::Polling => "polling",
            OperationStatus::AwaitingPush => "awaiting_push",
            OperationStatus::Terminated(TerminalOutcome::Success) => "terminated_success",
            OperationStatus::Terminated(TerminalOutcome::Failure) => "terminated_failure",
            OperationStatus::Terminated(TerminalOutcome::Timeout) => "terminated_timeout",
            OperationStatus::Terminated(TerminalOutcome::Cancelled) => "terminated_cancelled",
        }
    }
}

/// Delivery state of the terminal emission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmissionState {
    Pending,
    Delivered,
}

/// The sole persisted entity: durable state of one tracked operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationRecord {
    pub operation_id: OperationId,
    pub connector: String,
    pub external_ref: ExternalRef,
    pub idempotency_key: String,
    pub status: OperationStatus,
    #[serde(default)]
    pub correlation: Vec<CorrelationKey>,
    pub started_at_ms: u64,
    pub timeout_at_ms: u64,
    pub poll_interval_ms: u64,
    /// Number of completed poll invocations; also the sequence number the
    /// next live poll callback must carry.
    #[serde(default)]
    pub polls: u64,
    #[serde(default)]
    pub last_polled_at_ms: Option<u64>,
    #[serde(default)]
    pub result_payload: Option<Value>,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub terminated_at_ms: Option<u64>,
    #[serde(default)]
    pub emission: Option<EmissionState>,
}

impl OperationRecord {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// True once wall-clock time is strictly past `timeout_at_ms`.
    pub fn is_timed_out(&self, now_ms: u64) -> bool {
        now_ms > self.timeout_at_ms
    }

    /// Copy of this record after one more non-terminal poll.
    pub fn with_poll_attempt(&self, now_ms: u64) -> Self {
        let mut next = self.clone();
        next.polls += 1;
        next.last_polled_at_ms = Some(now_ms);
        next
    }

    /// Terminal copy of this record, or `None` when already terminal.
    pub fn terminated(
        &self,
        outcome: TerminalOutcome,
        payload: Option<Value>,
        error: Option<String>,
        now_ms: u64,
    ) -> Option<Self> {
        if self.is_terminal() {
            return None;
        }
        let mut next = self.clone();
        next.status = OperationStatus::Terminated(outcome);
        next.result_payload = payload;
        next.last_error = error;
        next.terminated_at_ms = Some(now_ms);
        next.emission = Some(EmissionState::Pending);
        Some(next)
    }

    /// JSON payload delivered with the terminal emission.
    pub fn emission_payload(&self) -> Value {
        serde_json::json!({
            "operation_id": self.operation_id,
            "external_ref": self.external_ref,
            "outcome": self.status.terminal_outcome().map(|o| o.as_str()),
            "result": self.result_payload.clone().unwrap_or(Value::Null),
            "error": self.last_error,
            "started_at_ms": self.started_at_ms,
            "terminated_at_ms": self.terminated_at_ms,
        })
    }
}

/// Remote-reported state of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteState {
    Running,
    Succeeded,
    Failed,
}

impl RemoteState {
    /// Resolve raw completion signals. A failure signal wins over a
    /// simultaneous success signal.
    pub fn from_signals(succeeded: bool, failed: bool) -> Self {
        if failed {
            RemoteState::Failed
        } else if succeeded {
            RemoteState::Succeeded
        } else {
            RemoteState::Running
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RemoteState::Running)
    }
}

/// Result of a remote status query or a mapped push event.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteStatus {
    pub state: RemoteState,
    pub payload: Value,
    pub error: Option<String>,
}

impl RemoteStatus {
    pub fn running() -> Self {
        Self {
            state: RemoteState::Running,
            payload: Value::Null,
            error: None,
        }
    }

    pub fn succeeded(payload: Value) -> Self {
        Self {
            state: RemoteState::Succeeded,
            payload,
            error: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            state: RemoteState::Failed,
            payload: Value::Null,
            error: Some(message.into()),
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }
}

/// Inbound push notification, already authenticated and parsed.
#[derive(Debug, Clone, PartialEq)]
pub struct PushEvent {
    pub connector: String,
    pub body: Value,
}

impl PushEvent {
    pub fn new(connector: impl Into<String>, body: Value) -> Self {
        Self {
            connector: connector.into(),
            body,
        }
    }
}

/// Named output channel a terminal result is emitted on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputChannel {
    Success,
    Failure,
    Timeout,
}

impl OutputChannel {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputChannel::Success => "default",
            OutputChannel::Failure => "failure",
            OutputChannel::Timeout => "timeout",
        }
    }
}
