use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;

use super::{
    CallbackParams, CallbackQueue, CorrelationLookup, LockedCallback, MetadataStore, PollScheduler, ProviderError,
    ScheduledCallback, VersionedRecord,
};
use crate::clock::{Clock, SystemClock, duration_ms};
use crate::{OperationId, OperationRecord};

#[derive(Debug, Clone)]
struct QueueEntry {
    callback: ScheduledCallback,
    lock: Option<(String, u64)>,
    attempt_count: u32,
}

/// In-memory provider for tests and single-process embedding.
///
/// Implements every provider contract over process memory. Nothing survives
/// a restart; use [`super::sqlite::SqliteProvider`] for durability.
#[derive(Debug)]
pub struct InMemoryProvider {
    clock: Arc<dyn Clock>,
    records: Mutex<HashMap<OperationId, VersionedRecord>>,
    queue: Mutex<Vec<QueueEntry>>,
    next_token: AtomicU64,
}

impl Default for InMemoryProvider {
    fn default() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }
}

impl InMemoryProvider {
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            records: Mutex::new(HashMap::new()),
            queue: Mutex::new(Vec::new()),
            next_token: AtomicU64::new(1),
        }
    }

    /// Snapshot of callbacks not yet acked, in scheduling order (test utility).
    pub async fn pending_callbacks(&self) -> Vec<ScheduledCallback> {
        self.queue.lock().await.iter().map(|e| e.callback.clone()).collect()
    }

    /// Number of stored records (test utility).
    pub async fn record_count(&self) -> usize {
        self.records.lock().await.len()
    }
}

#[async_trait::async_trait]
impl MetadataStore for InMemoryProvider {
    async fn get(&self, operation_id: &OperationId) -> Result<Option<VersionedRecord>, ProviderError> {
        Ok(self.records.lock().await.get(operation_id).cloned())
    }

    async fn set(&self, record: &OperationRecord) -> Result<u64, ProviderError> {
        let mut g = self.records.lock().await;
        let revision = g.get(&record.operation_id).map(|v| v.revision + 1).unwrap_or(1);
        g.insert(
            record.operation_id.clone(),
            VersionedRecord {
                record: record.clone(),
                revision,
            },
        );
        Ok(revision)
    }

    async fn create(&self, record: &OperationRecord) -> Result<bool, ProviderError> {
        let mut g = self.records.lock().await;
        if g.contains_key(&record.operation_id) {
            return Ok(false);
        }
        g.insert(
            record.operation_id.clone(),
            VersionedRecord {
                record: record.clone(),
                revision: 1,
            },
        );
        Ok(true)
    }

    async fn compare_and_set(&self, expected_revision: u64, record: &OperationRecord) -> Result<bool, ProviderError> {
        let mut g = self.records.lock().await;
        match g.get_mut(&record.operation_id) {
            Some(current) if current.revision == expected_revision => {
                current.record = record.clone();
                current.revision += 1;
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(ProviderError::permanent(
                "compare_and_set",
                format!("record not found: {}", record.operation_id),
            )),
        }
    }
}

#[async_trait::async_trait]
impl PollScheduler for InMemoryProvider {
    async fn schedule(&self, name: &str, params: CallbackParams, delay: Duration) -> Result<(), ProviderError> {
        let visible_at_ms = self.clock.now_ms().saturating_add(duration_ms(delay));
        self.queue.lock().await.push(QueueEntry {
            callback: ScheduledCallback {
                name: name.to_string(),
                params,
                visible_at_ms,
            },
            lock: None,
            attempt_count: 0,
        });
        Ok(())
    }
}

#[async_trait::async_trait]
impl CallbackQueue for InMemoryProvider {
    async fn fetch_due(
        &self,
        now_ms: u64,
        lock_timeout: Duration,
        limit: usize,
    ) -> Result<Vec<LockedCallback>, ProviderError> {
        let mut q = self.queue.lock().await;
        let mut due: Vec<usize> = q
            .iter()
            .enumerate()
            .filter(|(_, e)| {
                e.callback.visible_at_ms <= now_ms && e.lock.as_ref().is_none_or(|(_, until)| *until <= now_ms)
            })
            .map(|(i, _)| i)
            .collect();
        due.sort_by_key(|i| q[*i].callback.visible_at_ms);
        due.truncate(limit);

        let locked_until = now_ms.saturating_add(duration_ms(lock_timeout));
        let mut out = Vec::with_capacity(due.len());
        for i in due {
            let token = format!("mem_{}", self.next_token.fetch_add(1, Ordering::SeqCst));
            let entry = &mut q[i];
            entry.lock = Some((token.clone(), locked_until));
            entry.attempt_count += 1;
            out.push(LockedCallback {
                callback: entry.callback.clone(),
                lock_token: token,
                attempt_count: entry.attempt_count,
            });
        }
        Ok(out)
    }

    async fn ack(&self, lock_token: &str) -> Result<(), ProviderError> {
        let mut q = self.queue.lock().await;
        let before = q.len();
        q.retain(|e| e.lock.as_ref().is_none_or(|(t, _)| t != lock_token));
        if q.len() == before {
            return Err(ProviderError::permanent("ack", format!("Invalid lock token: {lock_token}")));
        }
        Ok(())
    }

    async fn abandon(&self, lock_token: &str) -> Result<(), ProviderError> {
        let mut q = self.queue.lock().await;
        for e in q.iter_mut() {
            if e.lock.as_ref().is_some_and(|(t, _)| t == lock_token) {
                e.lock = None;
                return Ok(());
            }
        }
        Err(ProviderError::permanent(
            "abandon",
            format!("Invalid lock token: {lock_token}"),
        ))
    }
}

#[async_trait::async_trait]
impl CorrelationLookup for InMemoryProvider {
    async fn find_by_key_value(&self, key: &str, value: &str) -> Result<Option<OperationId>, ProviderError> {
        let g = self.records.lock().await;
        Ok(g
            .values()
            .filter(|v| {
                v.record
                    .correlation
                    .iter()
                    .any(|c| c.key == key && c.value == value)
            })
            .max_by_key(|v| v.record.started_at_ms)
            .map(|v| v.record.operation_id.clone()))
    }
}
