use sqlx::Row;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous};
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::debug;

use super::{
    CallbackParams, CallbackQueue, CorrelationLookup, LockedCallback, MetadataStore, PollScheduler, ProviderError,
    ScheduledCallback, VersionedRecord,
};
use crate::clock::{Clock, SystemClock, duration_ms};
use crate::{OperationId, OperationRecord};

/// SQLite-backed provider with transactional record, queue and correlation
/// storage.
///
/// Records, scheduled callbacks and correlation keys live in one database, so
/// a process that restarts (or a second process pointed at the same file)
/// picks up exactly where the previous one left off.
pub struct SqliteProvider {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
    token_seq: AtomicU64,
}

impl SqliteProvider {
    /// Convert sqlx error to ProviderError with appropriate retry classification
    fn sqlx_to_provider_error(operation: &str, e: sqlx::Error) -> ProviderError {
        let error_msg = e.to_string();

        if error_msg.contains("database is locked") || error_msg.contains("SQLITE_BUSY") {
            return ProviderError::retryable(operation, format!("Database locked: {error_msg}"));
        }

        if error_msg.contains("UNIQUE constraint") || error_msg.contains("PRIMARY KEY") {
            return ProviderError::permanent(operation, format!("Constraint violation: {error_msg}"));
        }

        if error_msg.contains("connection") || error_msg.contains("timeout") {
            return ProviderError::retryable(operation, format!("Connection error: {error_msg}"));
        }

        // Default: treat as retryable (conservative approach)
        ProviderError::retryable(operation, error_msg)
    }

    /// Open (creating if needed) a SQLite database.
    ///
    /// # Arguments
    /// * `database_url` - SQLite connection string (e.g., "sqlite:data.db" or "sqlite::memory:")
    ///
    /// # Errors
    ///
    /// Returns an error if database connection or schema initialization fails.
    pub async fn new(database_url: &str) -> Result<Self, sqlx::Error> {
        Self::with_clock(database_url, Arc::new(SystemClock)).await
    }

    /// Open a database, reading callback visibility times from `clock`.
    ///
    /// # Errors
    ///
    /// Returns an error if database connection or schema initialization fails.
    pub async fn with_clock(database_url: &str, clock: Arc<dyn Clock>) -> Result<Self, sqlx::Error> {
        let is_memory = database_url.contains(":memory:") || database_url.contains("mode=memory");

        let mut options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(60))
            .foreign_keys(true);
        options = if is_memory {
            options
                .journal_mode(SqliteJournalMode::Memory)
                .synchronous(SqliteSynchronous::Off)
        } else {
            options
                .journal_mode(SqliteJournalMode::Wal)
                .synchronous(SqliteSynchronous::Normal)
        };

        let mut pool_options = SqlitePoolOptions::new().max_connections(5);
        if is_memory {
            // The in-memory database lives only as long as one connection does.
            pool_options = pool_options.min_connections(1).idle_timeout(None).max_lifetime(None);
        }
        let pool = pool_options.connect_with(options).await?;

        Self::create_schema(&pool).await?;
        debug!(target: "opwatch::providers::sqlite", url = %database_url, "SQLite provider ready");

        Ok(Self {
            pool,
            clock,
            token_seq: AtomicU64::new(0),
        })
    }

    /// Convenience: a private in-memory database for tests.
    ///
    /// # Errors
    ///
    /// Returns an error if database connection or schema initialization fails.
    pub async fn new_in_memory() -> Result<Self, sqlx::Error> {
        Self::with_clock("sqlite::memory:", Arc::new(SystemClock)).await
    }

    async fn create_schema(pool: &SqlitePool) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS operations (
                operation_id TEXT PRIMARY KEY,
                revision INTEGER NOT NULL CHECK(revision >= 1),
                connector TEXT NOT NULL,
                status TEXT NOT NULL,
                record TEXT NOT NULL,
                started_at_ms INTEGER NOT NULL,
                updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS correlations (
                corr_key TEXT NOT NULL,
                corr_value TEXT NOT NULL,
                operation_id TEXT NOT NULL REFERENCES operations(operation_id) ON DELETE CASCADE,
                started_at_ms INTEGER NOT NULL,
                PRIMARY KEY (corr_key, corr_value, operation_id)
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS callbacks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                params TEXT NOT NULL,
                visible_at INTEGER NOT NULL,
                lock_token TEXT,
                locked_until INTEGER,
                attempt_count INTEGER NOT NULL DEFAULT 0 CHECK(attempt_count >= 0),
                created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_callbacks_visible ON callbacks(visible_at, lock_token)")
            .execute(pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_callbacks_lock ON callbacks(lock_token)")
            .execute(pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_correlations_operation ON correlations(operation_id)")
            .execute(pool)
            .await?;

        Ok(())
    }

    /// Generate a unique lock token
    fn generate_lock_token(&self) -> String {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        let seq = self.token_seq.fetch_add(1, Ordering::SeqCst);
        format!("lock_{now}_{}_{seq}", std::process::id())
    }

    fn encode_record(operation: &str, record: &OperationRecord) -> Result<String, ProviderError> {
        serde_json::to_string(record).map_err(|e| ProviderError::codec(operation, e))
    }

    /// Number of callbacks not yet acked (test utility).
    pub async fn pending_callback_count(&self) -> Result<i64, ProviderError> {
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM callbacks")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| Self::sqlx_to_provider_error("pending_callback_count", e))
    }
}

#[async_trait::async_trait]
impl MetadataStore for SqliteProvider {
    async fn get(&self, operation_id: &OperationId) -> Result<Option<VersionedRecord>, ProviderError> {
        let row = sqlx::query("SELECT revision, record FROM operations WHERE operation_id = ?")
            .bind(operation_id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Self::sqlx_to_provider_error("get", e))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let revision: i64 = row
            .try_get("revision")
            .map_err(|e| Self::sqlx_to_provider_error("get", e))?;
        let json: String = row
            .try_get("record")
            .map_err(|e| Self::sqlx_to_provider_error("get", e))?;
        let record: OperationRecord = serde_json::from_str(&json).map_err(|e| ProviderError::codec("get", e))?;

        Ok(Some(VersionedRecord {
            record,
            revision: revision as u64,
        }))
    }

    async fn set(&self, record: &OperationRecord) -> Result<u64, ProviderError> {
        let json = Self::encode_record("set", record)?;
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Self::sqlx_to_provider_error("set", e))?;

        let revision: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO operations (operation_id, revision, connector, status, record, started_at_ms)
            VALUES (?, 1, ?, ?, ?, ?)
            ON CONFLICT(operation_id) DO UPDATE SET
                revision = operations.revision + 1,
                connector = excluded.connector,
                status = excluded.status,
                record = excluded.record,
                started_at_ms = excluded.started_at_ms,
                updated_at = CURRENT_TIMESTAMP
            RETURNING revision
            "#,
        )
        .bind(record.operation_id.as_str())
        .bind(&record.connector)
        .bind(record.status.label())
        .bind(&json)
        .bind(record.started_at_ms as i64)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| Self::sqlx_to_provider_error("set", e))?;

        sqlx::query("DELETE FROM correlations WHERE operation_id = ?")
            .bind(record.operation_id.as_str())
            .execute(&mut *tx)
            .await
            .map_err(|e| Self::sqlx_to_provider_error("set", e))?;
        for key in &record.correlation {
            sqlx::query(
                "INSERT OR IGNORE INTO correlations (corr_key, corr_value, operation_id, started_at_ms) VALUES (?, ?, ?, ?)",
            )
            .bind(&key.key)
            .bind(&key.value)
            .bind(record.operation_id.as_str())
            .bind(record.started_at_ms as i64)
            .execute(&mut *tx)
            .await
            .map_err(|e| Self::sqlx_to_provider_error("set", e))?;
        }

        tx.commit()
            .await
            .map_err(|e| Self::sqlx_to_provider_error("set", e))?;
        Ok(revision as u64)
    }

    async fn create(&self, record: &OperationRecord) -> Result<bool, ProviderError> {
        let json = Self::encode_record("create", record)?;
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Self::sqlx_to_provider_error("create", e))?;

        let inserted = sqlx::query(
            r#"
            INSERT OR IGNORE INTO operations (operation_id, revision, connector, status, record, started_at_ms)
            VALUES (?, 1, ?, ?, ?, ?)
            "#,
        )
        .bind(record.operation_id.as_str())
        .bind(&record.connector)
        .bind(record.status.label())
        .bind(&json)
        .bind(record.started_at_ms as i64)
        .execute(&mut *tx)
        .await
        .map_err(|e| Self::sqlx_to_provider_error("create", e))?
        .rows_affected();

        if inserted == 0 {
            debug!(target: "opwatch::providers::sqlite", operation_id = %record.operation_id, "Record already exists");
            return Ok(false);
        }

        for key in &record.correlation {
            sqlx::query(
                "INSERT OR IGNORE INTO correlations (corr_key, corr_value, operation_id, started_at_ms) VALUES (?, ?, ?, ?)",
            )
            .bind(&key.key)
            .bind(&key.value)
            .bind(record.operation_id.as_str())
            .bind(record.started_at_ms as i64)
            .execute(&mut *tx)
            .await
            .map_err(|e| Self::sqlx_to_provider_error("create", e))?;
        }

        tx.commit()
            .await
            .map_err(|e| Self::sqlx_to_provider_error("create", e))?;
        Ok(true)
    }

    async fn compare_and_set(&self, expected_revision: u64, record: &OperationRecord) -> Result<bool, ProviderError> {
        let json = Self::encode_record("compare_and_set", record)?;
        let updated = sqlx::query(
            r#"
            UPDATE operations
            SET revision = revision + 1, status = ?, record = ?, updated_at = CURRENT_TIMESTAMP
            WHERE operation_id = ? AND revision = ?
            "#,
        )
        .bind(record.status.label())
        .bind(&json)
        .bind(record.operation_id.as_str())
        .bind(expected_revision as i64)
        .execute(&self.pool)
        .await
        .map_err(|e| Self::sqlx_to_provider_error("compare_and_set", e))?
        .rows_affected();

        if updated == 1 {
            return Ok(true);
        }

        let exists: Option<i64> = sqlx::query_scalar("SELECT revision FROM operations WHERE operation_id = ?")
            .bind(record.operation_id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Self::sqlx_to_provider_error("compare_and_set", e))?;
        match exists {
            Some(current) => {
                debug!(
                    target: "opwatch::providers::sqlite",
                    operation_id = %record.operation_id,
                    expected_revision,
                    current_revision = current,
                    "Revision mismatch"
                );
                Ok(false)
            }
            None => Err(ProviderError::permanent(
                "compare_and_set",
                format!("record not found: {}", record.operation_id),
            )),
        }
    }
}

#[async_trait::async_trait]
impl PollScheduler for SqliteProvider {
    async fn schedule(&self, name: &str, params: CallbackParams, delay: Duration) -> Result<(), ProviderError> {
        let encoded = serde_json::to_string(&params).map_err(|e| ProviderError::codec("schedule", e))?;
        let visible_at = self.clock.now_ms().saturating_add(duration_ms(delay));

        tracing::debug!(
            target: "opwatch::providers::sqlite",
            name,
            operation_id = %params.operation_id,
            sequence = params.sequence,
            delay = ?delay,
            "schedule"
        );

        sqlx::query("INSERT INTO callbacks (name, params, visible_at) VALUES (?, ?, ?)")
            .bind(name)
            .bind(encoded)
            .bind(visible_at as i64)
            .execute(&self.pool)
            .await
            .map_err(|e| Self::sqlx_to_provider_error("schedule", e))?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl CallbackQueue for SqliteProvider {
    async fn fetch_due(
        &self,
        now_ms: u64,
        lock_timeout: Duration,
        limit: usize,
    ) -> Result<Vec<LockedCallback>, ProviderError> {
        let now = now_ms as i64;
        let locked_until = now_ms.saturating_add(duration_ms(lock_timeout)) as i64;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Self::sqlx_to_provider_error("fetch_due", e))?;

        let rows = sqlx::query(
            r#"
            SELECT id, name, params, visible_at, attempt_count
            FROM callbacks
            WHERE visible_at <= ? AND (lock_token IS NULL OR locked_until <= ?)
            ORDER BY visible_at, id
            LIMIT ?
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| Self::sqlx_to_provider_error("fetch_due", e))?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let id: i64 = row.try_get("id").map_err(|e| Self::sqlx_to_provider_error("fetch_due", e))?;
            let name: String = row
                .try_get("name")
                .map_err(|e| Self::sqlx_to_provider_error("fetch_due", e))?;
            let params: String = row
                .try_get("params")
                .map_err(|e| Self::sqlx_to_provider_error("fetch_due", e))?;
            let visible_at: i64 = row
                .try_get("visible_at")
                .map_err(|e| Self::sqlx_to_provider_error("fetch_due", e))?;
            let attempt_count: i64 = row
                .try_get("attempt_count")
                .map_err(|e| Self::sqlx_to_provider_error("fetch_due", e))?;
            let params: CallbackParams =
                serde_json::from_str(&params).map_err(|e| ProviderError::codec("fetch_due", e))?;

            let token = self.generate_lock_token();
            let claimed = sqlx::query(
                r#"
                UPDATE callbacks
                SET lock_token = ?, locked_until = ?, attempt_count = attempt_count + 1
                WHERE id = ? AND (lock_token IS NULL OR locked_until <= ?)
                "#,
            )
            .bind(&token)
            .bind(locked_until)
            .bind(id)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(|e| Self::sqlx_to_provider_error("fetch_due", e))?
            .rows_affected();
            if claimed == 0 {
                continue;
            }

            out.push(LockedCallback {
                callback: ScheduledCallback {
                    name,
                    params,
                    visible_at_ms: visible_at as u64,
                },
                lock_token: token,
                attempt_count: (attempt_count + 1) as u32,
            });
        }

        tx.commit()
            .await
            .map_err(|e| Self::sqlx_to_provider_error("fetch_due", e))?;

        if !out.is_empty() {
            debug!(target: "opwatch::providers::sqlite", count = out.len(), "Fetched due callbacks");
        }
        Ok(out)
    }

    async fn ack(&self, lock_token: &str) -> Result<(), ProviderError> {
        let deleted = sqlx::query("DELETE FROM callbacks WHERE lock_token = ?")
            .bind(lock_token)
            .execute(&self.pool)
            .await
            .map_err(|e| Self::sqlx_to_provider_error("ack", e))?
            .rows_affected();
        if deleted == 0 {
            return Err(ProviderError::permanent("ack", format!("Invalid lock token: {lock_token}")));
        }
        Ok(())
    }

    async fn abandon(&self, lock_token: &str) -> Result<(), ProviderError> {
        let released = sqlx::query("UPDATE callbacks SET lock_token = NULL, locked_until = NULL WHERE lock_token = ?")
            .bind(lock_token)
            .execute(&self.pool)
            .await
            .map_err(|e| Self::sqlx_to_provider_error("abandon", e))?
            .rows_affected();
        if released == 0 {
            return Err(ProviderError::permanent(
                "abandon",
                format!("Invalid lock token: {lock_token}"),
            ));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl CorrelationLookup for SqliteProvider {
    async fn find_by_key_value(&self, key: &str, value: &str) -> Result<Option<OperationId>, ProviderError> {
        let id: Option<String> = sqlx::query_scalar(
            r#"
            SELECT operation_id FROM correlations
            WHERE corr_key = ? AND corr_value = ?
            ORDER BY started_at_ms DESC
            LIMIT 1
            "#,
        )
        .bind(key)
        .bind(value)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Self::sqlx_to_provider_error("find_by_key_value", e))?;
        Ok(id.map(OperationId::from))
    }
}
