//! Delivery of terminal results.

use crate::providers::ProviderError;
use crate::{OperationId, OutputChannel};
use serde_json::Value;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::Mutex;

/// One delivered result.
#[derive(Debug, Clone, PartialEq)]
pub struct Emission {
    /// `None` for raw push events forwarded without a matching operation.
    pub operation_id: Option<OperationId>,
    pub channel: OutputChannel,
    /// `<connector>.<outcome>`, or `<connector>.event` for forwarded events.
    pub event_type: String,
    pub payload: Value,
}

/// Sink for terminal results, e.g. the workflow graph's next node.
///
/// The engine calls `emit` at most once per operation for as long as the
/// previous call returned `Ok`.
#[async_trait::async_trait]
pub trait EventEmitter: Send + Sync {
    async fn emit(&self, emission: &Emission) -> Result<(), ProviderError>;
}

/// Emitter that keeps every emission in memory.
#[derive(Debug, Default)]
pub struct RecordingEmitter {
    emissions: Mutex<Vec<Emission>>,
    failures_remaining: AtomicU32,
}

impl RecordingEmitter {
    /// Make the next `n` calls to `emit` fail with a retryable error.
    pub fn fail_next(&self, n: u32) {
        self.failures_remaining.store(n, Ordering::SeqCst);
    }

    pub async fn emissions(&self) -> Vec<Emission> {
        self.emissions.lock().await.clone()
    }

    pub async fn emissions_for(&self, operation_id: &OperationId) -> Vec<Emission> {
        self.emissions
            .lock()
            .await
            .iter()
            .filter(|e| e.operation_id.as_ref() == Some(operation_id))
            .cloned()
            .collect()
    }
}

#[async_trait::async_trait]
impl EventEmitter for RecordingEmitter {
    async fn emit(&self, emission: &Emission) -> Result<(), ProviderError> {
        let failed = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(ProviderError::retryable("emit", "emitter unavailable"));
        }
        self.emissions.lock().await.push(emission.clone());
        Ok(())
    }
}
