use super::{Engine, EngineError, Termination};
use crate::providers::{CallbackParams, POLL_CALLBACK, VersionedRecord};
use crate::{OperationRecord, OperationStatus, RemoteState, TerminalOutcome};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

/// What a single poll invocation did.
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    NotFound,
    /// Late or duplicate callback for a terminated operation. No-op.
    AlreadyTerminal(TerminalOutcome),
    /// Callback sequence no longer matches the record. No-op.
    Stale,
    /// Still running; the next poll was scheduled.
    Rescheduled { transient_error: bool },
    /// Another invocation advanced the record first. No-op.
    Superseded,
    Terminated(TerminalOutcome),
}

/// Delay until the next callback for `record`, evaluated at `now_ms`.
///
/// Push-only operations are only ever woken for their timeout, one
/// millisecond past the deadline.
pub(crate) fn next_callback_delay(record: &OperationRecord, now_ms: u64) -> Duration {
    match record.status {
        OperationStatus::AwaitingPush => {
            Duration::from_millis(record.timeout_at_ms.saturating_sub(now_ms).saturating_add(1))
        }
        _ => Duration::from_millis(record.poll_interval_ms),
    }
}

impl Engine {
    /// Handle one scheduled poll callback.
    ///
    /// Order of checks: terminal record, stale sequence, timeout, then the
    /// remote status query. Remote errors never terminate the operation;
    /// they are retried at the next interval until the timeout fires.
    pub async fn poll(&self, params: &CallbackParams) -> Result<PollOutcome, EngineError> {
        self.metrics.record_poll();
        let operation_id = &params.operation_id;

        let Some(current) = self.store.get(operation_id).await? else {
            warn!(operation_id = %operation_id, "Poll for unknown operation");
            return Ok(PollOutcome::NotFound);
        };

        if let Some(outcome) = current.record.status.terminal_outcome() {
            self.metrics.record_duplicate();
            debug!(operation_id = %operation_id, outcome = %outcome, "Late poll after termination ignored");
            self.ensure_emission(&current.record).await?;
            return Ok(PollOutcome::AlreadyTerminal(outcome));
        }

        if params.sequence != current.record.polls {
            self.metrics.record_duplicate();
            debug!(
                operation_id = %operation_id,
                sequence = params.sequence,
                expected = current.record.polls,
                "Stale poll callback ignored"
            );
            return Ok(PollOutcome::Stale);
        }

        let now = self.clock.now_ms();
        if current.record.is_timed_out(now) {
            let timeout_ms = current.record.timeout_at_ms.saturating_sub(current.record.started_at_ms);
            let message = format!("operation did not complete within {timeout_ms}ms");
            return self
                .resolve(current, TerminalOutcome::Timeout, None, Some(message))
                .await;
        }

        if current.record.status == OperationStatus::AwaitingPush {
            // Woken before the deadline, e.g. by clock skew between processes.
            return self.reschedule(current, now, false).await;
        }

        let Some(connector) = self.connectors.get(&current.record.connector).cloned() else {
            warn!(
                operation_id = %operation_id,
                connector = %current.record.connector,
                "Connector not registered in this process; will retry"
            );
            return self.reschedule(current, now, true).await;
        };

        let status = match connector.client().status(&current.record.external_ref).await {
            Ok(status) => status,
            Err(e) => {
                self.metrics.record_transient_error();
                warn!(
                    operation_id = %operation_id,
                    external_ref = %current.record.external_ref,
                    error = %e,
                    "Status check failed; retrying at next interval"
                );
                return self.reschedule(current, now, true).await;
            }
        };

        match status.state {
            RemoteState::Running => {
                debug!(operation_id = %operation_id, polls = current.record.polls + 1, "Remote operation still running");
                self.reschedule(current, now, false).await
            }
            RemoteState::Failed => {
                let error = status.error.clone().unwrap_or_else(|| "remote operation failed".to_string());
                let payload = (!status.payload.is_null()).then(|| status.payload.clone());
                self.resolve(current, TerminalOutcome::Failure, payload, Some(error)).await
            }
            RemoteState::Succeeded => {
                match connector
                    .client()
                    .fetch_result(&current.record.external_ref, &status)
                    .await
                {
                    Ok(payload) => {
                        self.resolve(current, TerminalOutcome::Success, Some(payload), None)
                            .await
                    }
                    Err(e) => {
                        self.metrics.record_transient_error();
                        warn!(
                            operation_id = %operation_id,
                            error = %e,
                            "Result fetch failed after success; retrying at next interval"
                        );
                        self.reschedule(current, now, true).await
                    }
                }
            }
        }
    }

    async fn resolve(
        &self,
        current: VersionedRecord,
        outcome: TerminalOutcome,
        payload: Option<Value>,
        error: Option<String>,
    ) -> Result<PollOutcome, EngineError> {
        Ok(match self.terminate_from(current, outcome, payload, error).await? {
            Termination::Won(_) => PollOutcome::Terminated(outcome),
            Termination::AlreadyTerminal(existing) => PollOutcome::AlreadyTerminal(existing),
            Termination::NotFound => PollOutcome::NotFound,
        })
    }

    /// Schedule the next callback, then record the poll.
    ///
    /// The callback is scheduled before the write so a crash in between
    /// leaves a live callback with the next sequence rather than none.
    async fn reschedule(
        &self,
        current: VersionedRecord,
        now: u64,
        transient_error: bool,
    ) -> Result<PollOutcome, EngineError> {
        let next = current.record.with_poll_attempt(now);
        let delay = next_callback_delay(&next, now);
        self.scheduler
            .schedule(
                POLL_CALLBACK,
                CallbackParams::new(next.operation_id.clone(), next.polls),
                delay,
            )
            .await?;

        if !self.store.compare_and_set(current.revision, &next).await? {
            debug!(operation_id = %next.operation_id, "Poll superseded by a concurrent write");
            return Ok(PollOutcome::Superseded);
        }
        Ok(PollOutcome::Rescheduled { transient_error })
    }
}
