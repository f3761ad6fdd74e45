use super::poller::next_callback_delay;
use super::{Engine, EngineError};
use crate::clock::duration_ms;
use crate::providers::{CallbackParams, POLL_CALLBACK, VersionedRecord};
use crate::request::{OperationRequest, PollMode};
use crate::{ExternalRef, OperationRecord, OperationStatus};
use tracing::{error, info, warn};

fn initial_record(request: &OperationRequest, external_ref: ExternalRef, now_ms: u64) -> OperationRecord {
    OperationRecord {
        operation_id: request.operation_id.clone(),
        connector: request.connector.clone(),
        external_ref,
        idempotency_key: request.idempotency_key.clone(),
        status: match request.mode {
            PollMode::Poll => OperationStatus::Polling,
            PollMode::PushOnly => OperationStatus::AwaitingPush,
        },
        correlation: request.correlation.clone(),
        started_at_ms: now_ms,
        timeout_at_ms: now_ms.saturating_add(duration_ms(request.timeout)),
        poll_interval_ms: duration_ms(request.poll_interval),
        polls: 0,
        last_polled_at_ms: None,
        result_payload: None,
        last_error: None,
        terminated_at_ms: None,
        emission: None,
    }
}

impl Engine {
    /// Start a remote operation and begin tracking it.
    ///
    /// The remote `start` is issued once per operation id. Re-running the
    /// initiation with the same idempotency key returns the stored record
    /// without calling the remote again; a different key is a conflict. If
    /// `start` fails nothing is persisted and nothing is scheduled.
    pub async fn start(&self, request: OperationRequest) -> Result<OperationRecord, EngineError> {
        let connector = self
            .connectors
            .get(&request.connector)
            .cloned()
            .ok_or_else(|| EngineError::UnknownConnector(request.connector.clone()))?;

        if let Some(existing) = self.store.get(&request.operation_id).await? {
            return self.resume_existing(existing, &request).await;
        }

        let external_ref = match connector.client().start(&request).await {
            Ok(external_ref) => external_ref,
            Err(e) => {
                self.metrics.record_start_failure();
                error!(
                    operation_id = %request.operation_id,
                    connector = %request.connector,
                    error = %e,
                    "Remote start failed"
                );
                return Err(EngineError::StartFailed {
                    connector: request.connector.clone(),
                    error: e,
                });
            }
        };

        let now = self.clock.now_ms();
        let record = initial_record(&request, external_ref, now);
        if !self.store.create(&record).await? {
            // A concurrent initiation of the same id persisted first; ours
            // started a second remote operation that nothing will track.
            warn!(
                operation_id = %request.operation_id,
                external_ref = %record.external_ref,
                "Concurrent start detected; cancelling duplicate remote operation"
            );
            if let Err(e) = connector.client().cancel(&record.external_ref).await {
                warn!(external_ref = %record.external_ref, error = %e, "Failed to cancel duplicate remote operation");
            }
            let existing = self
                .store
                .get(&request.operation_id)
                .await?
                .ok_or_else(|| EngineError::NotFound(request.operation_id.clone()))?;
            return self.resume_existing(existing, &request).await;
        }

        self.scheduler
            .schedule(
                POLL_CALLBACK,
                CallbackParams::new(record.operation_id.clone(), 0),
                next_callback_delay(&record, now),
            )
            .await?;

        self.metrics.record_start();
        info!(
            operation_id = %record.operation_id,
            connector = %record.connector,
            external_ref = %record.external_ref,
            status = record.status.label(),
            timeout_at_ms = record.timeout_at_ms,
            "Operation started"
        );
        Ok(record)
    }

    async fn resume_existing(
        &self,
        existing: VersionedRecord,
        request: &OperationRequest,
    ) -> Result<OperationRecord, EngineError> {
        let record = existing.record;
        if record.idempotency_key != request.idempotency_key {
            return Err(EngineError::Conflict {
                operation_id: record.operation_id.clone(),
                message: format!(
                    "already started with idempotency key {:?}, got {:?}",
                    record.idempotency_key, request.idempotency_key
                ),
            });
        }
        info!(
            operation_id = %record.operation_id,
            external_ref = %record.external_ref,
            "Operation already started; returning existing record"
        );
        if !record.is_terminal() {
            // The earlier initiation may have stopped before scheduling its
            // first callback. A surplus callback is discarded by the sequence check.
            let now = self.clock.now_ms();
            self.scheduler
                .schedule(
                    POLL_CALLBACK,
                    CallbackParams::new(record.operation_id.clone(), record.polls),
                    next_callback_delay(&record, now),
                )
                .await?;
        }
        Ok(record)
    }
}
