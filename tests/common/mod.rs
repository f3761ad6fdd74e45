// Not every test binary uses every helper.
#![allow(dead_code)]

use async_trait::async_trait;
use opwatch::providers::in_memory::InMemoryProvider;
use opwatch::providers::{MetadataStore, ProviderError, VersionedRecord};
use opwatch::request::OperationRequestBuilder;
use opwatch::runtime::{ConnectorRegistry, Engine, RuntimeOptions};
use opwatch::{
    Connector, ExternalRef, FieldEventMapper, ManualClock, OperationId, OperationRecord, OperationRequest, PushEvent,
    RecordingEmitter, RemoteError, RemoteOperationClient, RemoteStatus, TerminalOutcome,
};
use serde_json::{Value, json};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const CONNECTOR: &str = "ci";
pub const START_MS: u64 = 1_700_000_000_000;

/// Remote client that answers status queries from a script.
///
/// Once the script is exhausted every status query reports `Running`.
#[derive(Default)]
pub struct ScriptedClient {
    script: Mutex<VecDeque<Result<RemoteStatus, RemoteError>>>,
    start_calls: AtomicU32,
    status_calls: AtomicU32,
    fetch_failures: AtomicU32,
    fail_start: AtomicBool,
    cancelled: Mutex<Vec<ExternalRef>>,
}

impl ScriptedClient {
    pub fn push_status(&self, status: Result<RemoteStatus, RemoteError>) {
        self.script.lock().unwrap().push_back(status);
    }

    pub fn push_running(&self, n: usize) {
        for _ in 0..n {
            self.push_status(Ok(RemoteStatus::running()));
        }
    }

    pub fn push_errors(&self, n: usize) {
        for i in 0..n {
            self.push_status(Err(RemoteError::with_status(503, format!("unavailable #{i}"))));
        }
    }

    pub fn fail_start(&self) {
        self.fail_start.store(true, Ordering::SeqCst);
    }

    pub fn fail_fetch(&self, n: u32) {
        self.fetch_failures.store(n, Ordering::SeqCst);
    }

    pub fn start_calls(&self) -> u32 {
        self.start_calls.load(Ordering::SeqCst)
    }

    pub fn status_calls(&self) -> u32 {
        self.status_calls.load(Ordering::SeqCst)
    }

    pub fn cancelled(&self) -> Vec<ExternalRef> {
        self.cancelled.lock().unwrap().clone()
    }
}

#[async_trait]
impl RemoteOperationClient for ScriptedClient {
    async fn start(&self, request: &OperationRequest) -> Result<ExternalRef, RemoteError> {
        let n = self.start_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(RemoteError::with_status(400, "invalid pipeline"));
        }
        Ok(ExternalRef::new(format!("{}-ext-{n}", request.operation_id)))
    }

    async fn status(&self, _external_ref: &ExternalRef) -> Result<RemoteStatus, RemoteError> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(RemoteStatus::running()))
    }

    async fn fetch_result(&self, external_ref: &ExternalRef, status: &RemoteStatus) -> Result<Value, RemoteError> {
        let failed = self
            .fetch_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(RemoteError::new("logs not ready"));
        }
        Ok(json!({"external_ref": external_ref.as_str(), "status": status.payload}))
    }

    async fn cancel(&self, external_ref: &ExternalRef) -> Result<(), RemoteError> {
        self.cancelled.lock().unwrap().push(external_ref.clone());
        Ok(())
    }
}

/// Store wrapper whose `get` fails a configurable number of times.
pub struct FlakyStore {
    pub inner: Arc<InMemoryProvider>,
    failures: AtomicU32,
    permanent: AtomicBool,
}

impl FlakyStore {
    pub fn new(inner: Arc<InMemoryProvider>) -> Self {
        Self {
            inner,
            failures: AtomicU32::new(0),
            permanent: AtomicBool::new(false),
        }
    }

    pub fn fail_gets(&self, n: u32, permanent: bool) {
        self.permanent.store(permanent, Ordering::SeqCst);
        self.failures.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl MetadataStore for FlakyStore {
    async fn get(&self, operation_id: &OperationId) -> Result<Option<VersionedRecord>, ProviderError> {
        let failed = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(if self.permanent.load(Ordering::SeqCst) {
                ProviderError::permanent("get", "corrupt record")
            } else {
                ProviderError::retryable("get", "database is locked")
            });
        }
        self.inner.get(operation_id).await
    }

    async fn set(&self, record: &OperationRecord) -> Result<u64, ProviderError> {
        self.inner.set(record).await
    }

    async fn create(&self, record: &OperationRecord) -> Result<bool, ProviderError> {
        self.inner.create(record).await
    }

    async fn compare_and_set(&self, expected_revision: u64, record: &OperationRecord) -> Result<bool, ProviderError> {
        self.inner.compare_and_set(expected_revision, record).await
    }
}

pub fn ci_mapper() -> FieldEventMapper {
    FieldEventMapper::new("build_id", "/build/id", "/build/status")
        .success_values(["SUCCEEDED"])
        .failure_values(["FAILED", "STOPPED"])
        .error_pointer("/build/reason")
}

pub fn ci_connector(client: Arc<ScriptedClient>) -> Connector {
    Connector::new(CONNECTOR, client).with_push_mapper(Arc::new(ci_mapper()))
}

pub fn build_event(build_id: &str, status: &str) -> PushEvent {
    PushEvent::new(CONNECTOR, json!({"build": {"id": build_id, "status": status}}))
}

/// Engine over an in-memory provider driven by a manual clock.
pub struct Harness {
    pub clock: Arc<ManualClock>,
    pub provider: Arc<InMemoryProvider>,
    pub emitter: Arc<RecordingEmitter>,
    pub client: Arc<ScriptedClient>,
    pub engine: Arc<Engine>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_options(RuntimeOptions::default())
    }

    pub fn with_options(options: RuntimeOptions) -> Self {
        let clock = Arc::new(ManualClock::new(START_MS));
        let provider = Arc::new(InMemoryProvider::with_clock(clock.clone()));
        let emitter = Arc::new(RecordingEmitter::default());
        let client = Arc::new(ScriptedClient::default());
        let connectors = ConnectorRegistry::builder()
            .register(ci_connector(client.clone()))
            .build();
        let engine = Engine::builder(provider.clone(), provider.clone(), emitter.clone())
            .connectors(connectors)
            .lookup(provider.clone())
            .clock(clock.clone())
            .options(options)
            .build();
        Self {
            clock,
            provider,
            emitter,
            client,
            engine,
        }
    }

    /// Request correlated by `build_id = <id>`.
    pub fn request(id: &str) -> OperationRequestBuilder {
        OperationRequest::builder(id, CONNECTOR).correlate("build_id", id)
    }

    /// Run due callbacks until none are left at the current time.
    pub async fn drain(&self) -> usize {
        let mut total = 0;
        for _ in 0..1_000 {
            let n = self.engine.run_due_callbacks(self.provider.as_ref()).await.unwrap();
            if n == 0 {
                break;
            }
            total += n;
        }
        total
    }

    pub async fn advance_and_drain(&self, by: Duration) -> usize {
        self.clock.advance(by);
        self.drain().await
    }

    pub async fn record(&self, id: &str) -> OperationRecord {
        self.engine
            .get_operation(&OperationId::from(id))
            .await
            .unwrap()
            .expect("record exists")
    }
}

/// Engine whose record store can be made to fail, for dispatcher tests.
pub struct ManualSetup {
    pub clock: Arc<ManualClock>,
    pub provider: Arc<InMemoryProvider>,
    pub store: Arc<FlakyStore>,
    pub emitter: Arc<RecordingEmitter>,
    pub remote: Arc<ScriptedClient>,
    pub engine: Arc<Engine>,
}

impl ManualSetup {
    pub fn new(options: RuntimeOptions) -> Self {
        let clock = Arc::new(ManualClock::new(START_MS));
        let provider = Arc::new(InMemoryProvider::with_clock(clock.clone()));
        let store = Arc::new(FlakyStore::new(provider.clone()));
        let emitter = Arc::new(RecordingEmitter::default());
        let remote = Arc::new(ScriptedClient::default());
        let engine = Engine::builder(store.clone(), provider.clone(), emitter.clone())
            .connectors(ConnectorRegistry::builder().register(ci_connector(remote.clone())).build())
            .lookup(provider.clone())
            .clock(clock.clone())
            .options(options)
            .build();
        Self {
            clock,
            provider,
            store,
            emitter,
            remote,
            engine,
        }
    }

    pub async fn start(&self, id: &str) -> OperationRecord {
        let request = Harness::request(id)
            .poll_interval(Duration::from_secs(60))
            .build()
            .unwrap();
        self.engine.start(request).await.unwrap()
    }

    pub async fn outcome(&self, id: &str) -> Option<TerminalOutcome> {
        self.provider
            .get(&OperationId::from(id))
            .await
            .unwrap()
            .and_then(|v| v.record.status.terminal_outcome())
    }
}
