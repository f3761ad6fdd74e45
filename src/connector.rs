//! Vendor seams.
//!
//! A connector supplies only what is vendor specific: how to start the remote
//! operation, how to ask for its status, and how to read a push event. The
//! poll-vs-push race handling is implemented once in [`crate::runtime`].

use crate::request::OperationRequest;
use crate::{CorrelationKey, ExternalRef, PushEvent, RemoteState, RemoteStatus};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Failure talking to the remote system.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteError {
    pub message: String,
    /// HTTP status (or vendor equivalent) when one was received.
    pub status_code: Option<u16>,
}

impl RemoteError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status_code: None,
        }
    }

    pub fn with_status(status_code: u16, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status_code: Some(status_code),
        }
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status_code {
            Some(code) => write!(f, "remote error ({code}): {}", self.message),
            None => write!(f, "remote error: {}", self.message),
        }
    }
}

impl std::error::Error for RemoteError {}

/// Client for one vendor's long-running operation API.
#[async_trait::async_trait]
pub trait RemoteOperationClient: Send + Sync {
    /// Start the remote operation. Called at most once per initiation; the
    /// request's idempotency key should be forwarded when the vendor supports it.
    async fn start(&self, request: &OperationRequest) -> Result<ExternalRef, RemoteError>;

    /// Query the current remote status.
    async fn status(&self, external_ref: &ExternalRef) -> Result<RemoteStatus, RemoteError>;

    /// Follow-up fetch that builds the success payload (outputs, logs).
    async fn fetch_result(&self, _external_ref: &ExternalRef, status: &RemoteStatus) -> Result<Value, RemoteError> {
        Ok(status.payload.clone())
    }

    /// Best-effort remote cancellation.
    async fn cancel(&self, _external_ref: &ExternalRef) -> Result<(), RemoteError> {
        Ok(())
    }
}

/// Maps a vendor push event to a correlation key and a remote status.
pub trait PushEventMapper: Send + Sync {
    fn correlation_key(&self, event: &PushEvent) -> Option<CorrelationKey>;
    fn remote_status(&self, event: &PushEvent) -> RemoteStatus;
}

/// Field-based mapper for the common case where the event body carries the
/// correlation value and a state string at fixed JSON pointers.
///
/// ```
/// # use opwatch::{FieldEventMapper, PushEvent, PushEventMapper, RemoteState};
/// let mapper = FieldEventMapper::new("build_id", "/build/id", "/build/status")
///     .success_values(["SUCCEEDED"])
///     .failure_values(["FAILED", "TIMED_OUT"]);
/// let event = PushEvent::new("ci", serde_json::json!({"build": {"id": "b-1", "status": "FAILED"}}));
/// assert_eq!(mapper.correlation_key(&event).unwrap().value, "b-1");
/// assert_eq!(mapper.remote_status(&event).state, RemoteState::Failed);
/// ```
#[derive(Debug, Clone)]
pub struct FieldEventMapper {
    key: String,
    key_pointer: String,
    state_pointer: String,
    success_values: Vec<String>,
    failure_values: Vec<String>,
    error_pointer: Option<String>,
}

impl FieldEventMapper {
    pub fn new(key: impl Into<String>, key_pointer: impl Into<String>, state_pointer: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            key_pointer: key_pointer.into(),
            state_pointer: state_pointer.into(),
            success_values: Vec::new(),
            failure_values: Vec::new(),
            error_pointer: None,
        }
    }

    pub fn success_values<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.success_values = values.into_iter().map(Into::into).collect();
        self
    }

    pub fn failure_values<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.failure_values = values.into_iter().map(Into::into).collect();
        self
    }

    pub fn error_pointer(mut self, pointer: impl Into<String>) -> Self {
        self.error_pointer = Some(pointer.into());
        self
    }
}

fn scalar_as_string(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

impl PushEventMapper for FieldEventMapper {
    fn correlation_key(&self, event: &PushEvent) -> Option<CorrelationKey> {
        let value = event.body.pointer(&self.key_pointer).and_then(scalar_as_string)?;
        if value.is_empty() {
            return None;
        }
        Some(CorrelationKey::new(self.key.clone(), value))
    }

    fn remote_status(&self, event: &PushEvent) -> RemoteStatus {
        let state = event.body.pointer(&self.state_pointer).and_then(scalar_as_string);
        let Some(state) = state else {
            return RemoteStatus::running();
        };
        let succeeded = self.success_values.iter().any(|s| s == &state);
        let failed = self.failure_values.iter().any(|s| s == &state);
        match RemoteState::from_signals(succeeded, failed) {
            RemoteState::Running => RemoteStatus::running(),
            RemoteState::Succeeded => RemoteStatus::succeeded(event.body.clone()),
            RemoteState::Failed => {
                let message = self
                    .error_pointer
                    .as_deref()
                    .and_then(|p| event.body.pointer(p))
                    .and_then(scalar_as_string)
                    .unwrap_or_else(|| format!("remote operation reported {state}"));
                RemoteStatus::failed(message).with_payload(event.body.clone())
            }
        }
    }
}

/// A named vendor integration registered with the engine.
#[derive(Clone)]
pub struct Connector {
    name: String,
    client: Arc<dyn RemoteOperationClient>,
    push_mapper: Option<Arc<dyn PushEventMapper>>,
    webhook_secret: Option<String>,
}

impl Connector {
    pub fn new(name: impl Into<String>, client: Arc<dyn RemoteOperationClient>) -> Self {
        Self {
            name: name.into(),
            client,
            push_mapper: None,
            webhook_secret: None,
        }
    }

    pub fn with_push_mapper(mut self, mapper: Arc<dyn PushEventMapper>) -> Self {
        self.push_mapper = Some(mapper);
        self
    }

    /// Shared secret used to verify webhook signatures. Without one, the
    /// webhook ingress accepts unsigned requests for this connector.
    pub fn with_webhook_secret(mut self, secret: impl Into<String>) -> Self {
        self.webhook_secret = Some(secret.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn client(&self) -> &Arc<dyn RemoteOperationClient> {
        &self.client
    }

    pub fn push_mapper(&self) -> Option<&Arc<dyn PushEventMapper>> {
        self.push_mapper.as_ref()
    }

    pub fn webhook_secret(&self) -> Option<&str> {
        self.webhook_secret.as_deref()
    }
}

impl fmt::Debug for Connector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connector")
            .field("name", &self.name)
            .field("push_mapper", &self.push_mapper.is_some())
            .field("webhook_secret", &self.webhook_secret.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn mapper() -> FieldEventMapper {
        FieldEventMapper::new("execution", "/detail/execution-id", "/detail/state")
            .success_values(["SUCCEEDED"])
            .failure_values(["FAILED", "STOPPED"])
            .error_pointer("/detail/reason")
    }

    #[test]
    fn maps_terminal_failure_with_reason() {
        let ev = PushEvent::new(
            "pipeline",
            json!({"detail": {"execution-id": "e-1", "state": "FAILED", "reason": "stage deploy failed"}}),
        );
        let status = mapper().remote_status(&ev);
        assert_eq!(status.state, RemoteState::Failed);
        assert_eq!(status.error.as_deref(), Some("stage deploy failed"));
    }

    #[test]
    fn unknown_state_is_non_terminal() {
        let ev = PushEvent::new("pipeline", json!({"detail": {"execution-id": "e-1", "state": "IN_PROGRESS"}}));
        assert_eq!(mapper().remote_status(&ev).state, RemoteState::Running);
        let missing = PushEvent::new("pipeline", json!({"detail": {}}));
        assert_eq!(mapper().remote_status(&missing).state, RemoteState::Running);
    }

    #[test]
    fn value_listed_as_both_resolves_to_failure() {
        let m = FieldEventMapper::new("k", "/id", "/s")
            .success_values(["DONE"])
            .failure_values(["DONE"]);
        let ev = PushEvent::new("x", json!({"id": 1, "s": "DONE"}));
        assert_eq!(m.remote_status(&ev).state, RemoteState::Failed);
    }

    #[test]
    fn numeric_correlation_values_are_stringified() {
        let m = FieldEventMapper::new("run_id", "/run/id", "/run/status");
        let ev = PushEvent::new("ci", json!({"run": {"id": 42, "status": "queued"}}));
        assert_eq!(m.correlation_key(&ev), Some(CorrelationKey::new("run_id", "42")));
        let none = PushEvent::new("ci", json!({"run": {"status": "queued"}}));
        assert_eq!(m.correlation_key(&none), None);
    }

    #[test]
    fn remote_error_display_includes_status() {
        assert_eq!(
            RemoteError::with_status(503, "unavailable").to_string(),
            "remote error (503): unavailable"
        );
    }
}
