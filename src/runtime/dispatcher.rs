use super::{Engine, EngineError};
use crate::providers::{CallbackQueue, LockedCallback, ProviderError};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{Instrument, error, info, info_span, warn};

/// Running callback dispatcher. Dropping the handle leaves the task running;
/// call [`DispatcherHandle::shutdown`] to stop it.
pub struct DispatcherHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl DispatcherHandle {
    /// Signal the dispatcher to stop and wait for the in-flight batch.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.join.await {
            warn!(error = %e, "Dispatcher task ended abnormally");
        }
    }
}

impl Engine {
    /// Spawn the background loop that feeds due callbacks to the engine.
    ///
    /// Several dispatchers, in this or other processes, may share one queue;
    /// peek-locking hands each callback to one of them at a time.
    pub fn start_dispatcher(self: &Arc<Self>, queue: Arc<dyn CallbackQueue>) -> DispatcherHandle {
        let (tx, mut rx) = watch::channel(false);
        let engine = Arc::clone(self);
        let join = tokio::spawn(async move {
            info!("Callback dispatcher started");
            loop {
                if *rx.borrow() {
                    break;
                }
                let fetched = match engine.run_due_callbacks(queue.as_ref()).await {
                    Ok(n) => n,
                    Err(e) => {
                        warn!(error = %e, "Failed to fetch due callbacks");
                        0
                    }
                };
                if fetched == 0 {
                    tokio::select! {
                        _ = tokio::time::sleep(engine.options.dispatcher_idle_sleep) => {}
                        _ = rx.changed() => {}
                    }
                }
            }
            info!("Callback dispatcher stopped");
        });
        DispatcherHandle { shutdown: tx, join }
    }

    /// Fetch one batch of due callbacks and process it concurrently.
    /// Returns the number of callbacks fetched.
    pub async fn run_due_callbacks(&self, queue: &dyn CallbackQueue) -> Result<usize, ProviderError> {
        let now = self.clock.now_ms();
        let batch = queue
            .fetch_due(now, self.options.callback_lock_timeout, self.options.max_callbacks_per_fetch)
            .await?;
        let fetched = batch.len();
        futures::future::join_all(batch.into_iter().map(|item| self.process_callback(queue, item))).await;
        Ok(fetched)
    }

    async fn process_callback(&self, queue: &dyn CallbackQueue, item: LockedCallback) {
        let span = info_span!(
            "callback",
            name = %item.callback.name,
            operation_id = %item.callback.params.operation_id,
            attempt = item.attempt_count,
        );
        let result = self
            .dispatch_callback(&item.callback.name, &item.callback.params)
            .instrument(span)
            .await;

        let settled = match result {
            Ok(()) => queue.ack(&item.lock_token).await,
            Err(e) if e.is_retryable() && item.attempt_count < self.options.max_callback_attempts => {
                warn!(
                    operation_id = %item.callback.params.operation_id,
                    attempt = item.attempt_count,
                    error = %e,
                    "Callback failed; releasing for redelivery"
                );
                queue.abandon(&item.lock_token).await
            }
            Err(e) if e.is_retryable() => self.rearm(queue, &item, &e).await,
            Err(e) => {
                log_dropped(&item, &e);
                queue.ack(&item.lock_token).await
            }
        };
        if let Err(e) = settled {
            warn!(
                operation_id = %item.callback.params.operation_id,
                error = %e,
                "Failed to settle callback; it will reappear after its lock expires"
            );
        }
    }

    /// Replace a callback that keeps failing transiently with a fresh copy
    /// due after `callback_rearm_delay`.
    ///
    /// A poll or emission callback may be the only thing still driving its
    /// operation, so it is never dropped while the failure is retryable.
    async fn rearm(
        &self,
        queue: &dyn CallbackQueue,
        item: &LockedCallback,
        e: &EngineError,
    ) -> Result<(), ProviderError> {
        warn!(
            callback = %item.callback.name,
            operation_id = %item.callback.params.operation_id,
            attempt = item.attempt_count,
            error = %e,
            delay_ms = self.options.callback_rearm_delay.as_millis() as u64,
            "Callback exhausted its attempts; re-arming"
        );
        // On failure the callback stays locked and reappears once the lock expires.
        self.scheduler
            .schedule(
                &item.callback.name,
                item.callback.params.clone(),
                self.options.callback_rearm_delay,
            )
            .await?;
        queue.ack(&item.lock_token).await
    }
}

fn log_dropped(item: &LockedCallback, e: &EngineError) {
    error!(
        callback = %item.callback.name,
        operation_id = %item.callback.params.operation_id,
        attempt = item.attempt_count,
        retryable = e.is_retryable(),
        error = %e,
        "Dropping callback after permanent failure"
    );
}
