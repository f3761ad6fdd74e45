//! The operation engine.
//!
//! [`Engine`] wires the collaborators together. Its behavior is split by
//! role across submodules, each adding methods to `Engine`:
//!
//! - `initiator`: start a remote operation and persist its record
//! - `poller`: the scheduled status-poll state machine
//! - `push`: resolution of inbound push events
//! - `arbiter`: the single path by which a record becomes terminal
//! - `dispatcher`: background loop feeding due callbacks to the engine
//!
//! No state is kept in memory between invocations. Each entry point reloads
//! the record, acts, and persists through a conditional write.

use crate::clock::{Clock, SystemClock};
use crate::connector::RemoteError;
use crate::emitter::EventEmitter;
use crate::providers::{
    CallbackParams, CorrelationLookup, EMIT_CALLBACK, MetadataStore, POLL_CALLBACK, PollScheduler, ProviderError,
};
use crate::request::RequestError;
use crate::{OperationId, OperationRecord};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

mod arbiter;
mod dispatcher;
mod initiator;
pub mod observability;
mod poller;
mod push;
pub mod registry;

pub use arbiter::Termination;
pub use dispatcher::DispatcherHandle;
pub use observability::{EngineMetrics, LogFormat, MetricsSnapshot, ObservabilityConfig};
pub use poller::PollOutcome;
pub use push::PushOutcome;
pub use registry::{ConnectorRegistry, ConnectorRegistryBuilder};

/// Configuration options for the Engine.
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    /// Dispatcher sleep when no callback is due.
    /// Default: 100ms
    pub dispatcher_idle_sleep: Duration,
    /// How long a fetched callback stays invisible to other dispatchers
    /// before it is redelivered.
    /// Default: 30s
    pub callback_lock_timeout: Duration,
    /// Maximum callbacks fetched (and processed concurrently) per pass.
    /// Default: 32
    pub max_callbacks_per_fetch: usize,
    /// Back-to-back deliveries of a callback that keeps failing
    /// transiently. After the last one the callback is re-armed with
    /// `callback_rearm_delay` instead of being released at once.
    /// Default: 10
    pub max_callback_attempts: u32,
    /// Delay before a callback that exhausted its attempts runs again.
    /// Default: 60s
    pub callback_rearm_delay: Duration,
    /// Delay before a failed terminal emission is retried.
    /// Default: 5s
    pub emission_retry_delay: Duration,
    /// Compare-and-set retries before a contended write gives up.
    /// Default: 16
    pub max_write_conflicts: u32,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            dispatcher_idle_sleep: Duration::from_millis(100),
            callback_lock_timeout: Duration::from_secs(30),
            max_callbacks_per_fetch: 32,
            max_callback_attempts: 10,
            callback_rearm_delay: Duration::from_secs(60),
            emission_retry_delay: Duration::from_secs(5),
            max_write_conflicts: 16,
        }
    }
}

/// Error returned by engine entry points.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineError {
    InvalidRequest(RequestError),
    UnknownConnector(String),
    /// The remote start call failed. Nothing was persisted.
    StartFailed { connector: String, error: RemoteError },
    /// Same operation id already started with a different idempotency key.
    Conflict { operation_id: OperationId, message: String },
    NotFound(OperationId),
    Provider(ProviderError),
}

impl EngineError {
    /// Whether retrying the same unit of work may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Provider(e) if e.is_retryable())
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::InvalidRequest(e) => write!(f, "{e}"),
            EngineError::UnknownConnector(name) => write!(f, "unknown connector: {name}"),
            EngineError::StartFailed { connector, error } => {
                write!(f, "failed to start operation on {connector}: {error}")
            }
            EngineError::Conflict { operation_id, message } => {
                write!(f, "conflicting start for {operation_id}: {message}")
            }
            EngineError::NotFound(id) => write!(f, "operation not found: {id}"),
            EngineError::Provider(e) => write!(f, "provider error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<ProviderError> for EngineError {
    fn from(e: ProviderError) -> Self {
        EngineError::Provider(e)
    }
}

impl From<RequestError> for EngineError {
    fn from(e: RequestError) -> Self {
        EngineError::InvalidRequest(e)
    }
}

/// Vendor-agnostic engine tracking remote operations to a single terminal
/// result.
pub struct Engine {
    store: Arc<dyn MetadataStore>,
    scheduler: Arc<dyn PollScheduler>,
    emitter: Arc<dyn EventEmitter>,
    lookup: Option<Arc<dyn CorrelationLookup>>,
    connectors: ConnectorRegistry,
    clock: Arc<dyn Clock>,
    options: RuntimeOptions,
    metrics: Arc<EngineMetrics>,
}

pub struct EngineBuilder {
    store: Arc<dyn MetadataStore>,
    scheduler: Arc<dyn PollScheduler>,
    emitter: Arc<dyn EventEmitter>,
    lookup: Option<Arc<dyn CorrelationLookup>>,
    connectors: ConnectorRegistry,
    clock: Arc<dyn Clock>,
    options: RuntimeOptions,
}

impl EngineBuilder {
    pub fn connectors(mut self, connectors: ConnectorRegistry) -> Self {
        self.connectors = connectors;
        self
    }

    /// Correlation lookup for push events. Without one, push events are
    /// forwarded raw instead of being resolved to an operation.
    pub fn lookup(mut self, lookup: Arc<dyn CorrelationLookup>) -> Self {
        self.lookup = Some(lookup);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn options(mut self, options: RuntimeOptions) -> Self {
        self.options = options;
        self
    }

    pub fn build(self) -> Arc<Engine> {
        Arc::new(Engine {
            store: self.store,
            scheduler: self.scheduler,
            emitter: self.emitter,
            lookup: self.lookup,
            connectors: self.connectors,
            clock: self.clock,
            options: self.options,
            metrics: Arc::new(EngineMetrics::default()),
        })
    }
}

impl Engine {
    pub fn builder(
        store: Arc<dyn MetadataStore>,
        scheduler: Arc<dyn PollScheduler>,
        emitter: Arc<dyn EventEmitter>,
    ) -> EngineBuilder {
        EngineBuilder {
            store,
            scheduler,
            emitter,
            lookup: None,
            connectors: ConnectorRegistry::default(),
            clock: Arc::new(SystemClock),
            options: RuntimeOptions::default(),
        }
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn options(&self) -> &RuntimeOptions {
        &self.options
    }

    pub fn connectors(&self) -> &ConnectorRegistry {
        &self.connectors
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Current persisted record for an operation.
    pub async fn get_operation(&self, operation_id: &OperationId) -> Result<Option<OperationRecord>, EngineError> {
        Ok(self.store.get(operation_id).await?.map(|v| v.record))
    }

    /// Route a scheduled callback by name.
    pub async fn dispatch_callback(&self, name: &str, params: &CallbackParams) -> Result<(), EngineError> {
        match name {
            POLL_CALLBACK => self.poll(params).await.map(|_| ()),
            EMIT_CALLBACK => self.redeliver_emission(&params.operation_id).await,
            other => {
                warn!(callback = other, operation_id = %params.operation_id, "Ignoring unknown callback");
                Ok(())
            }
        }
    }
}
