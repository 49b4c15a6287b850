//! Processing driver: runs passes over the ready requests on a timer and on
//! connectivity changes.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use deferq_core::{ExecutionFailure, QueueResult, Request};
use serde::Serialize;
use tokio::sync::{Mutex, Notify, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::ProcessorConfig;
use crate::manager::{FailureOutcome, RetryManager};

/// `tokio::time::interval` rejects a zero period.
const MIN_TICK: Duration = Duration::from_millis(1);

/// Performs the actual request. Timeouts are the executor's concern.
#[async_trait]
pub trait RequestExecutor: Send + Sync {
    async fn execute(&self, request: &Request) -> Result<(), ExecutionFailure>;
}

/// Why a pass did not run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    AlreadyRunning,
    Offline,
}

/// Summary of one processing pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PassReport {
    pub skipped: Option<SkipReason>,
    pub escalated: usize,
    pub expired: usize,
    pub attempted: usize,
    pub succeeded: usize,
    pub retried: usize,
    pub dead_lettered: usize,
    pub dropped: usize,
    /// Connectivity was lost before every ready request was attempted.
    pub interrupted: bool,
}

impl PassReport {
    fn skipped(reason: SkipReason) -> Self {
        Self {
            skipped: Some(reason),
            ..Self::default()
        }
    }
}

/// Clears the in-flight flag when a pass ends, however it ends.
struct PassGuard<'a>(&'a AtomicBool);

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Drives processing passes against a shared [`RetryManager`].
#[derive(Clone)]
pub struct Processor {
    manager: Arc<Mutex<RetryManager>>,
    executor: Arc<dyn RequestExecutor>,
    connectivity: watch::Receiver<bool>,
    config: ProcessorConfig,
    running: Arc<AtomicBool>,
}

impl std::fmt::Debug for Processor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Processor")
            .field("config", &self.config)
            .field("online", &*self.connectivity.borrow())
            .field("running", &self.running.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Processor {
    pub fn new(
        manager: Arc<Mutex<RetryManager>>,
        executor: Arc<dyn RequestExecutor>,
        connectivity: watch::Receiver<bool>,
        config: ProcessorConfig,
    ) -> Self {
        Self {
            manager,
            executor,
            connectivity,
            config,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn manager(&self) -> &Arc<Mutex<RetryManager>> {
        &self.manager
    }

    pub fn is_online(&self) -> bool {
        *self.connectivity.borrow()
    }

    /// Run one pass: escalate stale requests, expire old ones, then attempt
    /// every ready request in queue order.
    ///
    /// At most one pass runs at a time; a concurrent call is skipped. The
    /// manager lock is never held while the executor runs. Persistence
    /// failures are logged and the pass carries on.
    pub async fn run_pass(&self) -> QueueResult<PassReport> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("skipping pass - another pass is in flight");
            return Ok(PassReport::skipped(SkipReason::AlreadyRunning));
        }
        let _guard = PassGuard(&self.running);

        if !self.is_online() {
            debug!("skipping pass - offline");
            return Ok(PassReport::skipped(SkipReason::Offline));
        }

        let mut report = PassReport::default();
        let ready = {
            let mut manager = self.manager.lock().await;
            report.escalated = tolerate(manager.escalate_stale(), "escalate stale requests")?;
            report.expired = tolerate(manager.expire(), "expire old requests")?;
            manager.ready_for_retry()?
        };

        for candidate in ready {
            if !self.is_online() {
                info!("connectivity lost; stopping pass early");
                report.interrupted = true;
                break;
            }

            // A request may have changed or left the queue since selection.
            let current = {
                let manager = self.manager.lock().await;
                manager.queue().get(&candidate.id)?.cloned()
            };
            let Some(request) = current else {
                continue;
            };

            report.attempted += 1;
            let result = self.executor.execute(&request).await;

            let mut manager = self.manager.lock().await;
            match result {
                Ok(()) => {
                    tolerate(manager.complete(&request.id), "complete request")?;
                    report.succeeded += 1;
                }
                Err(failure) => {
                    debug!("request {} failed: {failure}", request.id);
                    match manager.handle_failed_request(&request, &failure) {
                        Ok(FailureOutcome::Retried(_)) => report.retried += 1,
                        Ok(FailureOutcome::DeadLettered) => report.dead_lettered += 1,
                        Ok(FailureOutcome::Dropped) => report.dropped += 1,
                        Ok(FailureOutcome::NotQueued) => {}
                        Err(err) if err.is_persistence_failure() => {
                            error!("failed to record failure of request {}: {err}", request.id);
                        }
                        Err(err) => return Err(err),
                    }
                }
            }
        }

        info!(
            "processing pass finished: {} attempted, {} succeeded, {} retried, {} dead-lettered, {} dropped, {} escalated, {} expired",
            report.attempted,
            report.succeeded,
            report.retried,
            report.dead_lettered,
            report.dropped,
            report.escalated,
            report.expired
        );
        Ok(report)
    }

    /// Spawn the background loop.
    ///
    /// A pass runs on every tick of the configured interval and whenever
    /// connectivity comes back.
    pub fn start(self) -> ProcessorHandle {
        let shutdown = Arc::new(Notify::new());
        let signal = shutdown.clone();

        let task = tokio::spawn(async move {
            info!(
                "retry processor started (tick every {:?})",
                self.config.tick_interval
            );

            let period = self.config.tick_interval.max(MIN_TICK);
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut connectivity = self.connectivity.clone();
            let mut watching = true;

            loop {
                tokio::select! {
                    _ = signal.notified() => {
                        info!("retry processor received shutdown signal");
                        break;
                    }
                    _ = interval.tick() => {
                        self.run_logged().await;
                    }
                    changed = connectivity.changed(), if watching => {
                        if changed.is_err() {
                            debug!("connectivity sender dropped; relying on ticks only");
                            watching = false;
                            continue;
                        }
                        let online = *connectivity.borrow_and_update();
                        if online {
                            info!("connectivity restored; running pass");
                            self.run_logged().await;
                        }
                    }
                }
            }

            info!("retry processor stopped");
        });

        ProcessorHandle { shutdown, task }
    }

    async fn run_logged(&self) {
        if let Err(err) = self.run_pass().await {
            warn!("processing pass failed: {err}");
        }
    }
}

/// Handle to a running processor loop.
#[derive(Debug)]
pub struct ProcessorHandle {
    shutdown: Arc<Notify>,
    task: JoinHandle<()>,
}

impl ProcessorHandle {
    /// Stop future passes and wait for an in-flight pass to finish.
    pub async fn shutdown(self) {
        self.shutdown.notify_one();
        if let Err(err) = self.task.await {
            error!("retry processor task failed: {err}");
        }
    }
}

/// Log persistence failures and carry on with a default value.
fn tolerate<T: Default>(result: QueueResult<T>, context: &str) -> QueueResult<T> {
    match result {
        Err(err) if err.is_persistence_failure() => {
            error!("failed to {context}: {err}");
            Ok(T::default())
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DeferqConfig, RetryConfig};
    use chrono::Utc;
    use deferq_core::{FixedClock, InMemoryStore};
    use std::collections::HashMap;

    #[derive(Default)]
    struct ScriptedExecutor {
        failures: std::sync::Mutex<HashMap<String, ExecutionFailure>>,
        calls: std::sync::Mutex<Vec<String>>,
        went_offline: Option<watch::Sender<bool>>,
        attempted: Notify,
    }

    impl ScriptedExecutor {
        fn failing(self, id: &str, failure: ExecutionFailure) -> Self {
            self.failures.lock().unwrap().insert(id.to_string(), failure);
            self
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl RequestExecutor for ScriptedExecutor {
        async fn execute(&self, request: &Request) -> Result<(), ExecutionFailure> {
            self.calls.lock().unwrap().push(request.id.to_string());
            if let Some(sender) = &self.went_offline {
                let _ = sender.send(false);
            }
            self.attempted.notify_one();
            match self.failures.lock().unwrap().get(request.id.as_str()) {
                Some(failure) => Err(failure.clone()),
                None => Ok(()),
            }
        }
    }

    /// Executor that blocks until released.
    #[derive(Default)]
    struct GatedExecutor {
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl RequestExecutor for GatedExecutor {
        async fn execute(&self, _request: &Request) -> Result<(), ExecutionFailure> {
            self.entered.notify_one();
            self.release.notified().await;
            Ok(())
        }
    }

    fn manager() -> Arc<Mutex<RetryManager>> {
        let config = DeferqConfig {
            retry: RetryConfig::default().with_jitter(false),
            ..DeferqConfig::default()
        };
        let clock = Arc::new(FixedClock::new(Utc::now()));
        let mut manager = RetryManager::new(config, Arc::new(InMemoryStore::new()), clock);
        manager.initialize().unwrap();
        Arc::new(Mutex::new(manager))
    }

    async fn submit(manager: &Arc<Mutex<RetryManager>>, id: &str, priority: i32) {
        let request = Request::new("POST", "https://api.example.com/jobs")
            .with_id(id)
            .with_priority(priority);
        manager.lock().await.submit(request).unwrap();
    }

    fn processor(
        manager: Arc<Mutex<RetryManager>>,
        executor: Arc<dyn RequestExecutor>,
        online: bool,
    ) -> (Processor, watch::Sender<bool>) {
        let (tx, rx) = watch::channel(online);
        let config = ProcessorConfig::default().with_tick_interval(Duration::from_secs(3600));
        (Processor::new(manager, executor, rx, config), tx)
    }

    #[tokio::test]
    async fn pass_attempts_ready_requests_in_order() {
        let manager = manager();
        submit(&manager, "low", 0).await;
        submit(&manager, "high", 9).await;
        submit(&manager, "flaky", 5).await;

        let executor = Arc::new(
            ScriptedExecutor::default().failing("flaky", ExecutionFailure::with_status("busy", 503)),
        );
        let (processor, _tx) = processor(manager.clone(), executor.clone(), true);

        let report = processor.run_pass().await.unwrap();
        assert_eq!(executor.calls(), vec!["high", "flaky", "low"]);
        assert_eq!(report.attempted, 3);
        assert_eq!(report.succeeded, 2);
        assert_eq!(report.retried, 1);
        assert!(!report.interrupted);

        let manager = manager.lock().await;
        let remaining = manager.queue().get_all().unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].retry_count, 1);
    }

    #[tokio::test]
    async fn retried_request_waits_for_backoff() {
        let manager = manager();
        submit(&manager, "a", 0).await;
        let executor = Arc::new(ScriptedExecutor::default().failing("a", ExecutionFailure::new("timed out")));
        let (processor, _tx) = processor(manager, executor.clone(), true);

        processor.run_pass().await.unwrap();
        let report = processor.run_pass().await.unwrap();
        assert_eq!(report.attempted, 0);
        assert_eq!(executor.calls().len(), 1);
    }

    #[tokio::test]
    async fn failure_of_one_does_not_abort_the_pass() {
        let manager = manager();
        submit(&manager, "bad", 1).await;
        submit(&manager, "good", 0).await;
        let executor = Arc::new(
            ScriptedExecutor::default().failing("bad", ExecutionFailure::with_status("gone", 410)),
        );
        let (processor, _tx) = processor(manager.clone(), executor, true);

        let report = processor.run_pass().await.unwrap();
        assert_eq!(report.dead_lettered, 1);
        assert_eq!(report.succeeded, 1);
        assert_eq!(manager.lock().await.dead_letter().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn offline_pass_is_skipped() {
        let manager = manager();
        submit(&manager, "a", 0).await;
        let executor = Arc::new(ScriptedExecutor::default());
        let (processor, _tx) = processor(manager, executor.clone(), false);

        let report = processor.run_pass().await.unwrap();
        assert_eq!(report.skipped, Some(SkipReason::Offline));
        assert!(executor.calls().is_empty());
    }

    #[tokio::test]
    async fn losing_connectivity_stops_the_pass() {
        let manager = manager();
        submit(&manager, "first", 2).await;
        submit(&manager, "second", 1).await;

        let (tx, rx) = watch::channel(true);
        let executor = Arc::new(ScriptedExecutor {
            went_offline: Some(tx),
            ..ScriptedExecutor::default()
        });
        let processor = Processor::new(manager.clone(), executor.clone(), rx, ProcessorConfig::default());

        let report = processor.run_pass().await.unwrap();
        assert!(report.interrupted);
        assert_eq!(executor.calls(), vec!["first"]);

        let manager = manager.lock().await;
        let left = manager.queue().get(&"second".into()).unwrap().unwrap();
        assert_eq!(left.retry_count, 0);
    }

    #[tokio::test]
    async fn concurrent_pass_is_skipped() {
        let manager = manager();
        submit(&manager, "a", 0).await;
        let executor = Arc::new(GatedExecutor::default());
        let (processor, _tx) = processor(manager, executor.clone(), true);

        let background = processor.clone();
        let first = tokio::spawn(async move { background.run_pass().await });
        executor.entered.notified().await;

        let report = processor.run_pass().await.unwrap();
        assert_eq!(report.skipped, Some(SkipReason::AlreadyRunning));

        executor.release.notify_one();
        let report = first.await.unwrap().unwrap();
        assert_eq!(report.succeeded, 1);

        let report = processor.run_pass().await.unwrap();
        assert_eq!(report.skipped, None);
    }

    #[tokio::test]
    async fn background_loop_runs_on_start_and_shuts_down() {
        let manager = manager();
        submit(&manager, "a", 0).await;
        let executor = Arc::new(ScriptedExecutor::default());
        let (processor, _tx) = processor(manager.clone(), executor.clone(), true);

        let handle = processor.start();
        executor.attempted.notified().await;
        handle.shutdown().await;

        assert_eq!(executor.calls(), vec!["a"]);
        assert!(manager.lock().await.queue().is_empty());
    }

    #[tokio::test]
    async fn reconnect_triggers_a_pass() {
        let manager = manager();
        submit(&manager, "a", 0).await;
        let executor = Arc::new(ScriptedExecutor::default());
        let (processor, tx) = processor(manager.clone(), executor.clone(), false);

        let handle = processor.start();
        tx.send(true).unwrap();
        executor.attempted.notified().await;
        handle.shutdown().await;

        assert_eq!(executor.calls(), vec!["a"]);
    }
}
