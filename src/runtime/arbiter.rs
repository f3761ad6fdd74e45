use super::{Engine, EngineError};
use crate::emitter::Emission;
use crate::providers::{CallbackParams, EMIT_CALLBACK, ProviderError, VersionedRecord};
use crate::{EmissionState, OperationId, OperationRecord, TerminalOutcome};
use serde_json::Value;
use tracing::{debug, error, info, warn};

/// Result of a termination attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Termination {
    /// This caller performed the transition and the emission.
    Won(OperationRecord),
    /// Another delivery terminated the operation first.
    AlreadyTerminal(TerminalOutcome),
    NotFound,
}

fn emission_for(record: &OperationRecord) -> Emission {
    let outcome = record.status.terminal_outcome().unwrap_or(TerminalOutcome::Failure);
    Emission {
        operation_id: Some(record.operation_id.clone()),
        channel: outcome.channel(),
        event_type: format!("{}.{}", record.connector, outcome),
        payload: record.emission_payload(),
    }
}

impl Engine {
    /// Convert a running operation into a terminal one.
    ///
    /// The first caller to observe a non-terminal record wins: it writes the
    /// terminal record through a compare-and-set on the record revision and
    /// emits. Every later caller observes `Terminated` and does nothing.
    pub async fn terminate(
        &self,
        operation_id: &OperationId,
        outcome: TerminalOutcome,
        payload: Option<Value>,
        error: Option<String>,
    ) -> Result<Termination, EngineError> {
        match self.store.get(operation_id).await? {
            Some(current) => self.terminate_from(current, outcome, payload, error).await,
            None => Ok(Termination::NotFound),
        }
    }

    /// Terminate starting from an already loaded record; reloads on conflict.
    pub(crate) async fn terminate_from(
        &self,
        mut current: VersionedRecord,
        outcome: TerminalOutcome,
        payload: Option<Value>,
        error: Option<String>,
    ) -> Result<Termination, EngineError> {
        let mut conflicts = 0;
        loop {
            let now = self.clock.now_ms();
            let Some(terminal) = current.record.terminated(outcome, payload.clone(), error.clone(), now) else {
                let existing = current.record.status.terminal_outcome().unwrap_or(outcome);
                self.metrics.record_duplicate();
                debug!(
                    operation_id = %current.record.operation_id,
                    existing = %existing,
                    attempted = %outcome,
                    "Operation already terminal"
                );
                return Ok(Termination::AlreadyTerminal(existing));
            };

            if self.store.compare_and_set(current.revision, &terminal).await? {
                self.metrics.record_termination(outcome);
                info!(
                    operation_id = %terminal.operation_id,
                    connector = %terminal.connector,
                    external_ref = %terminal.external_ref,
                    outcome = %outcome,
                    "Operation terminated"
                );
                self.deliver_emission(&terminal, current.revision + 1).await;
                return Ok(Termination::Won(terminal));
            }

            conflicts += 1;
            if conflicts >= self.options.max_write_conflicts {
                return Err(EngineError::Provider(ProviderError::retryable(
                    "terminate",
                    format!("gave up after {conflicts} conflicting writes to {}", terminal.operation_id),
                )));
            }
            current = match self.store.get(&terminal.operation_id).await? {
                Some(reloaded) => reloaded,
                None => return Ok(Termination::NotFound),
            };
        }
    }

    /// Emit a terminal record stored at `revision`, then mark it delivered.
    /// On failure a redelivery callback is scheduled.
    async fn deliver_emission(&self, record: &OperationRecord, revision: u64) {
        let emission = emission_for(record);
        match self.emitter.emit(&emission).await {
            Ok(()) => {
                let mut delivered = record.clone();
                delivered.emission = Some(EmissionState::Delivered);
                match self.store.compare_and_set(revision, &delivered).await {
                    Ok(true) => {}
                    Ok(false) => warn!(operation_id = %record.operation_id, "Emission marker changed concurrently"),
                    Err(e) => warn!(operation_id = %record.operation_id, error = %e, "Failed to mark emission delivered"),
                }
            }
            Err(e) => {
                self.metrics.record_emission_failure();
                error!(
                    operation_id = %record.operation_id,
                    channel = emission.channel.as_str(),
                    error = %e,
                    "Terminal emission failed; scheduling redelivery"
                );
                let params = CallbackParams::new(record.operation_id.clone(), record.polls);
                if let Err(se) = self
                    .scheduler
                    .schedule(EMIT_CALLBACK, params, self.options.emission_retry_delay)
                    .await
                {
                    error!(operation_id = %record.operation_id, error = %se, "Failed to schedule emission redelivery");
                }
            }
        }
    }

    /// Queue a redelivery for a terminal record whose emission is still
    /// `Pending`.
    ///
    /// Called by late polls and pushes. A pending marker they observe means
    /// the winning invocation died between its terminal write and the emit,
    /// or is still emitting; in the second case the redelivery finds the
    /// marker `Delivered` and does nothing.
    pub(crate) async fn ensure_emission(&self, record: &OperationRecord) -> Result<(), EngineError> {
        if record.emission != Some(EmissionState::Pending) {
            return Ok(());
        }
        warn!(operation_id = %record.operation_id, "Terminal emission still pending; scheduling redelivery");
        self.scheduler
            .schedule(
                EMIT_CALLBACK,
                CallbackParams::new(record.operation_id.clone(), record.polls),
                self.options.emission_retry_delay,
            )
            .await?;
        Ok(())
    }

    /// Handler for the emission redelivery callback.
    pub(crate) async fn redeliver_emission(&self, operation_id: &OperationId) -> Result<(), EngineError> {
        let Some(current) = self.store.get(operation_id).await? else {
            return Ok(());
        };
        if !current.record.is_terminal() || current.record.emission != Some(EmissionState::Pending) {
            debug!(operation_id = %operation_id, "Nothing to redeliver");
            return Ok(());
        }
        // Claim the redelivery by bumping the revision so a concurrent
        // redelivery of the same callback cannot emit as well.
        if !self.store.compare_and_set(current.revision, &current.record).await? {
            return Ok(());
        }
        info!(operation_id = %operation_id, "Redelivering terminal emission");
        self.deliver_emission(&current.record, current.revision + 1).await;
        Ok(())
    }

    /// Cancel a running operation.
    ///
    /// Returns `true` if this call cancelled it, `false` if it was already
    /// terminal. The remote cancel is best effort; its failure is logged only.
    pub async fn cancel(&self, operation_id: &OperationId, reason: impl Into<String>) -> Result<bool, EngineError> {
        let reason = reason.into();
        match self
            .terminate(operation_id, TerminalOutcome::Cancelled, None, Some(reason))
            .await?
        {
            Termination::Won(record) => {
                match self.connectors.get(&record.connector) {
                    Some(connector) => {
                        if let Err(e) = connector.client().cancel(&record.external_ref).await {
                            warn!(
                                operation_id = %operation_id,
                                external_ref = %record.external_ref,
                                error = %e,
                                "Remote cancel failed"
                            );
                        }
                    }
                    None => warn!(
                        operation_id = %operation_id,
                        connector = %record.connector,
                        "Connector not registered; remote cancel skipped"
                    ),
                }
                Ok(true)
            }
            Termination::AlreadyTerminal(_) => Ok(false),
            Termination::NotFound => Err(EngineError::NotFound(operation_id.clone())),
        }
    }
}
