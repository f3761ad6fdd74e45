//! Durable collaborators of the engine.
//!
//! Providers are datastores only: they persist [`OperationRecord`]s, hold
//! scheduled callbacks and answer correlation lookups. All decisions about
//! what a record means live in the runtime. Every engine invocation reloads
//! the record from the provider at entry, so a provider must be visible
//! across processes for the engine to survive restarts.

use crate::{OperationId, OperationRecord};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub mod error;
pub mod in_memory;
pub mod sqlite;

pub use error::ProviderError;

/// Callback name for a scheduled status poll (or push-only timeout check).
pub const POLL_CALLBACK: &str = "opwatch.poll";
/// Callback name for redelivering a terminal emission that failed.
pub const EMIT_CALLBACK: &str = "opwatch.emit";

/// Parameters carried by a scheduled callback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallbackParams {
    pub operation_id: OperationId,
    /// Poll sequence the callback was scheduled for. A poll callback whose
    /// sequence no longer matches the record's `polls` counter is stale.
    #[serde(default)]
    pub sequence: u64,
}

impl CallbackParams {
    pub fn new(operation_id: OperationId, sequence: u64) -> Self {
        Self { operation_id, sequence }
    }
}

/// A callback waiting in the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledCallback {
    pub name: String,
    pub params: CallbackParams,
    pub visible_at_ms: u64,
}

/// A callback handed to a dispatcher under a peek-lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockedCallback {
    pub callback: ScheduledCallback,
    pub lock_token: String,
    /// Number of times this callback has been fetched, including this one.
    pub attempt_count: u32,
}

/// A record together with the store revision it was read at.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionedRecord {
    pub record: OperationRecord,
    pub revision: u64,
}

/// Durable per-execution record storage.
///
/// `set` is plain last-write-wins. The engine itself only writes through
/// `create` (insert-if-absent) and `compare_and_set` (conditional on the
/// revision it read), which is what makes termination race-free.
#[async_trait::async_trait]
pub trait MetadataStore: Send + Sync {
    /// Load a record and its current revision.
    async fn get(&self, operation_id: &OperationId) -> Result<Option<VersionedRecord>, ProviderError>;

    /// Unconditionally write a record; returns the new revision.
    async fn set(&self, record: &OperationRecord) -> Result<u64, ProviderError>;

    /// Insert a record at revision 1. Returns `false` if one already exists.
    async fn create(&self, record: &OperationRecord) -> Result<bool, ProviderError>;

    /// Replace the record only if its revision is still `expected_revision`.
    /// Returns `false` when another writer got there first.
    async fn compare_and_set(&self, expected_revision: u64, record: &OperationRecord) -> Result<bool, ProviderError>;
}

/// Best-effort, at-least-once future callbacks.
///
/// A callback fires no earlier than `delay` after scheduling; there is no
/// upper bound on lateness.
#[async_trait::async_trait]
pub trait PollScheduler: Send + Sync {
    async fn schedule(&self, name: &str, params: CallbackParams, delay: Duration) -> Result<(), ProviderError>;
}

/// Consumer side of the scheduler, used by the dispatcher.
#[async_trait::async_trait]
pub trait CallbackQueue: Send + Sync {
    /// Peek-lock up to `limit` callbacks visible at `now_ms`. A callback whose
    /// lock expires without `ack` becomes visible again.
    async fn fetch_due(
        &self,
        now_ms: u64,
        lock_timeout: Duration,
        limit: usize,
    ) -> Result<Vec<LockedCallback>, ProviderError>;

    /// Remove a processed callback.
    async fn ack(&self, lock_token: &str) -> Result<(), ProviderError>;

    /// Release a callback so it is redelivered.
    async fn abandon(&self, lock_token: &str) -> Result<(), ProviderError>;
}

/// Resolves a push event's correlation key to a tracked operation.
#[async_trait::async_trait]
pub trait CorrelationLookup: Send + Sync {
    /// When several operations share the key, the most recently started one
    /// is returned.
    async fn find_by_key_value(&self, key: &str, value: &str) -> Result<Option<OperationId>, ProviderError>;
}
