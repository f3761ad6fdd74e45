use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::request::OperationRequest;
use crate::runtime::{Engine, EngineError};
use crate::{OperationId, OperationRecord};
use serde_json::Value;

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Error returned by [`Client::wait_for_terminal`].
#[derive(Debug, Clone, PartialEq)]
pub enum WaitError {
    Timeout,
    NotFound(OperationId),
    Engine(EngineError),
}

impl fmt::Display for WaitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WaitError::Timeout => f.write_str("timed out waiting for terminal state"),
            WaitError::NotFound(id) => write!(f, "operation not found: {id}"),
            WaitError::Engine(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for WaitError {}

/// Thin client for control-plane operations.
///
/// Everything goes through the engine and its store, so a client in one
/// process observes operations started or resolved by another.
#[derive(Clone)]
pub struct Client {
    engine: Arc<Engine>,
}

impl Client {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    /// Start and track an operation.
    pub async fn start_operation(&self, request: OperationRequest) -> Result<OperationRecord, EngineError> {
        self.engine.start(request).await
    }

    /// Start an operation from a loosely typed node configuration.
    pub async fn start_from_config(&self, config: &Value) -> Result<OperationRecord, EngineError> {
        let request = OperationRequest::from_config(config)?;
        self.engine.start(request).await
    }

    /// Request cancellation. Returns `false` if the operation had already
    /// terminated.
    pub async fn cancel_operation(
        &self,
        operation_id: &OperationId,
        reason: impl Into<String>,
    ) -> Result<bool, EngineError> {
        self.engine.cancel(operation_id, reason).await
    }

    pub async fn get_operation(&self, operation_id: &OperationId) -> Result<Option<OperationRecord>, EngineError> {
        self.engine.get_operation(operation_id).await
    }

    /// Wait until the operation reaches a terminal status.
    ///
    /// This only observes the store; callbacks must be driven by a running
    /// dispatcher (here or elsewhere) for the operation to make progress.
    pub async fn wait_for_terminal(
        &self,
        operation_id: &OperationId,
        timeout: Duration,
    ) -> Result<OperationRecord, WaitError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match self.engine.get_operation(operation_id).await {
                Ok(Some(record)) if record.is_terminal() => return Ok(record),
                Ok(Some(_)) => {}
                Ok(None) => return Err(WaitError::NotFound(operation_id.clone())),
                Err(e) if e.is_retryable() => {
                    tracing::debug!(operation_id = %operation_id, error = %e, "Retrying status read while waiting");
                }
                Err(e) => return Err(WaitError::Engine(e)),
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(WaitError::Timeout);
            }
            tokio::time::sleep(WAIT_POLL_INTERVAL).await;
        }
    }
}
