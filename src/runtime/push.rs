use super::{Engine, EngineError, Termination};
use crate::emitter::Emission;
use crate::providers::VersionedRecord;
use crate::{OutputChannel, PushEvent, RemoteState, TerminalOutcome};
use serde_json::Value;
use tracing::{debug, info, warn};

/// How an inbound push event was resolved.
#[derive(Debug, Clone, PartialEq)]
pub enum PushOutcome {
    /// No correlation lookup is configured; the raw event was re-emitted.
    Forwarded,
    /// No correlation key could be derived from the event.
    Uncorrelated,
    /// The key matched no tracked operation of this connector.
    Unmatched,
    AlreadyTerminal(TerminalOutcome),
    /// The event reports a non-terminal state; nothing changed.
    NonTerminal,
    Terminated(TerminalOutcome),
}

impl Engine {
    /// Resolve an authenticated push event against the tracked operations.
    ///
    /// Unmatched and non-terminal events are ignored, not errors.
    pub async fn handle_push(&self, event: &PushEvent) -> Result<PushOutcome, EngineError> {
        self.metrics.record_push();
        let connector = self
            .connectors
            .get(&event.connector)
            .cloned()
            .ok_or_else(|| EngineError::UnknownConnector(event.connector.clone()))?;

        let Some(lookup) = self.lookup.clone() else {
            return self.forward_raw(event).await;
        };

        let mapper = connector.push_mapper().cloned();
        let Some((mapper, key)) = mapper.and_then(|m| m.correlation_key(event).map(|k| (m, k))) else {
            self.metrics.record_push_ignored();
            debug!(connector = %event.connector, "Push event carries no correlation key");
            return Ok(PushOutcome::Uncorrelated);
        };

        let found = match lookup.find_by_key_value(&key.key, &key.value).await? {
            Some(operation_id) => self.store.get(&operation_id).await?,
            None => None,
        };
        let current = match found {
            Some(current) if current.record.connector == event.connector => current,
            _ => {
                self.metrics.record_push_ignored();
                info!(
                    connector = %event.connector,
                    key = %key.key,
                    value = %key.value,
                    "Push event matched no tracked operation"
                );
                return Ok(PushOutcome::Unmatched);
            }
        };

        if let Some(outcome) = current.record.status.terminal_outcome() {
            self.metrics.record_duplicate();
            debug!(operation_id = %current.record.operation_id, outcome = %outcome, "Push after termination ignored");
            self.ensure_emission(&current.record).await?;
            return Ok(PushOutcome::AlreadyTerminal(outcome));
        }

        let status = mapper.remote_status(event);
        match status.state {
            RemoteState::Running => {
                self.metrics.record_push_ignored();
                debug!(operation_id = %current.record.operation_id, "Non-terminal push event ignored");
                Ok(PushOutcome::NonTerminal)
            }
            RemoteState::Failed => {
                let error = status.error.clone().unwrap_or_else(|| "remote operation failed".to_string());
                let payload = (!status.payload.is_null()).then(|| status.payload.clone());
                self.resolve_push(current, TerminalOutcome::Failure, payload, Some(error))
                    .await
            }
            RemoteState::Succeeded => {
                let payload = match connector
                    .client()
                    .fetch_result(&current.record.external_ref, &status)
                    .await
                {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(
                            operation_id = %current.record.operation_id,
                            error = %e,
                            "Result fetch failed; using event payload"
                        );
                        status.payload.clone()
                    }
                };
                self.resolve_push(current, TerminalOutcome::Success, Some(payload), None)
                    .await
            }
        }
    }

    async fn resolve_push(
        &self,
        current: VersionedRecord,
        outcome: TerminalOutcome,
        payload: Option<Value>,
        error: Option<String>,
    ) -> Result<PushOutcome, EngineError> {
        Ok(match self.terminate_from(current, outcome, payload, error).await? {
            Termination::Won(_) => PushOutcome::Terminated(outcome),
            Termination::AlreadyTerminal(existing) => PushOutcome::AlreadyTerminal(existing),
            Termination::NotFound => PushOutcome::Unmatched,
        })
    }

    async fn forward_raw(&self, event: &PushEvent) -> Result<PushOutcome, EngineError> {
        let emission = Emission {
            operation_id: None,
            channel: OutputChannel::Success,
            event_type: format!("{}.event", event.connector),
            payload: event.body.clone(),
        };
        self.emitter.emit(&emission).await?;
        debug!(connector = %event.connector, "Forwarded uncorrelated push event");
        Ok(PushOutcome::Forwarded)
    }
}
