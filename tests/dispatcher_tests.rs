//! Background dispatcher, client facade and poison-callback handling.

mod common;

use common::{CONNECTOR, ManualSetup, ScriptedClient, ci_connector};
use opwatch::providers::POLL_CALLBACK;
use opwatch::providers::in_memory::InMemoryProvider;
use opwatch::runtime::{ConnectorRegistry, Engine, RuntimeOptions};
use opwatch::{Client, Clock, ManualClock, OperationId, RecordingEmitter, RemoteStatus, TerminalOutcome, WaitError};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn dispatcher_drives_operation_to_completion() {
    let provider = Arc::new(InMemoryProvider::default());
    let emitter = Arc::new(RecordingEmitter::default());
    let remote = Arc::new(ScriptedClient::default());
    remote.push_running(2);
    remote.push_status(Ok(RemoteStatus::succeeded(json!({"done": true}))));

    let engine = Engine::builder(provider.clone(), provider.clone(), emitter.clone())
        .connectors(ConnectorRegistry::builder().register(ci_connector(remote.clone())).build())
        .lookup(provider.clone())
        .options(RuntimeOptions {
            dispatcher_idle_sleep: Duration::from_millis(5),
            ..Default::default()
        })
        .build();
    let dispatcher = engine.start_dispatcher(provider.clone());

    let client = Client::new(engine.clone());
    let started = client
        .start_from_config(&json!({
            "operation_id": "run-1",
            "connector": CONNECTOR,
            "poll_interval_ms": 10,
            "timeout_ms": 10_000
        }))
        .await
        .unwrap();

    let record = client
        .wait_for_terminal(&started.operation_id, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(record.status.terminal_outcome(), Some(TerminalOutcome::Success));
    assert_eq!(remote.status_calls(), 3);
    assert_eq!(emitter.emissions().await.len(), 1);

    dispatcher.shutdown().await;
}

#[tokio::test]
async fn wait_reports_missing_and_timeout() {
    let provider = Arc::new(InMemoryProvider::default());
    let remote = Arc::new(ScriptedClient::default());
    let engine = Engine::builder(provider.clone(), provider.clone(), Arc::new(RecordingEmitter::default()))
        .connectors(ConnectorRegistry::builder().register(ci_connector(remote)).build())
        .build();
    let client = Client::new(engine);

    assert_eq!(
        client
            .wait_for_terminal(&OperationId::from("ghost"), Duration::from_millis(50))
            .await
            .unwrap_err(),
        WaitError::NotFound(OperationId::from("ghost"))
    );

    // No dispatcher: the operation never progresses.
    let started = client
        .start_from_config(&json!({"operation_id": "stuck", "connector": CONNECTOR}))
        .await
        .unwrap();
    assert_eq!(
        client
            .wait_for_terminal(&started.operation_id, Duration::from_millis(50))
            .await
            .unwrap_err(),
        WaitError::Timeout
    );
}

#[tokio::test]
async fn invalid_config_is_rejected_before_start() {
    let provider = Arc::new(InMemoryProvider::default());
    let remote = Arc::new(ScriptedClient::default());
    let engine = Engine::builder(provider.clone(), provider.clone(), Arc::new(RecordingEmitter::default()))
        .connectors(ConnectorRegistry::builder().register(ci_connector(remote.clone())).build())
        .build();
    let client = Client::new(engine);

    let err = client
        .start_from_config(&json!({
            "operation_id": "bad",
            "connector": CONNECTOR,
            "poll_interval_ms": 0
        }))
        .await
        .unwrap_err();
    assert!(matches!(err, opwatch::EngineError::InvalidRequest(_)));
    assert_eq!(remote.start_calls(), 0);
}

#[tokio::test]
async fn retryable_store_failure_is_redelivered() {
    let setup = ManualSetup::new(RuntimeOptions::default());
    setup.remote.push_status(Ok(RemoteStatus::succeeded(json!({}))));
    setup.start("op-1").await;

    setup.store.fail_gets(2, false);
    setup.clock.advance(Duration::from_secs(60));
    // Two failed deliveries are released, the third succeeds.
    for _ in 0..3 {
        assert_eq!(setup.engine.run_due_callbacks(setup.provider.as_ref()).await.unwrap(), 1);
    }
    assert_eq!(
        setup.outcome("op-1").await,
        Some(TerminalOutcome::Success)
    );
    assert!(setup.provider.pending_callbacks().await.is_empty());
}

#[tokio::test]
async fn exhausted_poll_callback_is_rearmed_until_timeout() {
    let setup = ManualSetup::new(RuntimeOptions {
        max_callback_attempts: 3,
        ..Default::default()
    });
    let started = setup.start("op-2").await;

    setup.store.fail_gets(3, false);
    setup.clock.advance(Duration::from_secs(60));
    let mut passes = 0;
    while setup.engine.run_due_callbacks(setup.provider.as_ref()).await.unwrap() > 0 {
        passes += 1;
        assert!(passes <= 3, "callback kept being redelivered without delay");
    }
    assert_eq!(passes, 3);

    // The only poll callback was replaced by a delayed copy, not dropped.
    let pending = setup.provider.pending_callbacks().await;
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].name, POLL_CALLBACK);
    assert_eq!(pending[0].params.sequence, 0);
    assert_eq!(
        pending[0].visible_at_ms,
        setup.clock.now_ms() + setup.engine.options().callback_rearm_delay.as_millis() as u64
    );
    assert_eq!(setup.outcome("op-2").await, None);

    setup.clock.set(started.timeout_at_ms + 1);
    while setup.engine.run_due_callbacks(setup.provider.as_ref()).await.unwrap() > 0 {}
    assert_eq!(setup.outcome("op-2").await, Some(TerminalOutcome::Timeout));
    assert_eq!(setup.emitter.emissions().await.len(), 1);
    assert!(setup.provider.pending_callbacks().await.is_empty());
}

#[tokio::test]
async fn permanent_failure_is_not_retried() {
    let setup = ManualSetup::new(RuntimeOptions::default());
    setup.start("op-3").await;

    setup.store.fail_gets(1, true);
    setup.clock.advance(Duration::from_secs(60));
    assert_eq!(setup.engine.run_due_callbacks(setup.provider.as_ref()).await.unwrap(), 1);
    assert!(setup.provider.pending_callbacks().await.is_empty());
    assert_eq!(setup.remote.status_calls(), 0);
}

#[tokio::test]
async fn shutdown_stops_idle_dispatcher() {
    let clock = Arc::new(ManualClock::new(0));
    let provider = Arc::new(InMemoryProvider::with_clock(clock.clone()));
    let engine = Engine::builder(provider.clone(), provider.clone(), Arc::new(RecordingEmitter::default()))
        .clock(clock)
        .build();
    let handle = engine.start_dispatcher(provider);
    tokio::time::timeout(Duration::from_secs(2), handle.shutdown())
        .await
        .expect("dispatcher stops promptly");
}
