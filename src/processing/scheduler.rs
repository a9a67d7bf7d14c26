//! The worker loop: claim a batch, run inference once, write every result.
//!
//! A batch is removed from the pending queue when it is claimed. If the
//! process dies before the results are written, those requests are lost and
//! their callers time out; there is no processing list to recover them from.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::broker::{Broker, BrokerResult};
use crate::domain::request::InferenceResult;
use crate::models::config::{PayloadSettings, Settings};
use crate::processing::backend::{InferenceBackend, InferenceError};
use crate::processing::batch::{fan_out, prepare_batch};
use crate::processing::liveness::Liveness;
use crate::results::ResultStore;
use crate::retry::{Backoff, retry_broker};

/// Counters for one scheduling cycle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub claimed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub orphaned: usize,
    /// Results that could not be written after all retries.
    pub lost: usize,
}

pub struct BatchScheduler<B> {
    broker: B,
    results: ResultStore<B>,
    backend: Arc<dyn InferenceBackend>,
    queue: String,
    batch_size: usize,
    server_sleep: Duration,
    payload: PayloadSettings,
    backoff: Backoff,
    write_retries: u32,
    worker_id: String,
    heartbeat_key: String,
    heartbeat_ttl: Duration,
    liveness: Liveness,
}

impl<B: Broker + Clone> BatchScheduler<B> {
    pub fn new(broker: B, backend: Arc<dyn InferenceBackend>, settings: &Settings) -> Self {
        let worker_id = format!("{}-{:08x}", std::process::id(), rand::random::<u32>());
        Self {
            results: ResultStore::new(
                broker.clone(),
                settings.queue.result_prefix.clone(),
                settings.queue.result_ttl(),
            ),
            broker,
            backend,
            queue: settings.queue.name.clone(),
            batch_size: settings.queue.batch_size,
            server_sleep: settings.queue.server_sleep(),
            payload: settings.payload.clone(),
            backoff: Backoff::from_settings(&settings.worker),
            write_retries: settings.worker.write_retries,
            heartbeat_key: format!("{}:heartbeat:{worker_id}", settings.queue.result_prefix),
            heartbeat_ttl: settings.worker.heartbeat_ttl(),
            worker_id,
            liveness: Liveness::new(),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn liveness(&self) -> Liveness {
        self.liveness.clone()
    }

    /// Runs cycles until `shutdown` becomes `true` or its sender is dropped.
    ///
    /// A batch in flight is always finished before returning.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        log::info!(
            "Worker {} consuming {} with backend {} (batch_size={}, server_sleep={:?})",
            self.worker_id,
            self.queue,
            self.backend.name(),
            self.batch_size,
            self.server_sleep
        );

        let mut failures = 0u32;
        while !*shutdown.borrow() {
            let delay = match self.run_cycle().await {
                Ok(report) => {
                    failures = 0;
                    (report.claimed == 0).then_some(self.server_sleep)
                }
                Err(error) => {
                    let delay = self.backoff.delay(failures);
                    failures = failures.saturating_add(1);
                    log::warn!(
                        "Failed to claim a batch from {}: {error}; retrying in {delay:?}",
                        self.queue
                    );
                    Some(delay)
                }
            };

            if let Some(delay) = delay
                && wait_or_shutdown(delay, &mut shutdown).await
            {
                break;
            }
        }

        log::info!(
            "Worker {} stopped after {} cycles",
            self.worker_id,
            self.liveness.cycles()
        );
    }

    /// Claims up to `batch_size` requests, waiting at most `server_sleep`,
    /// and processes them. An empty claim is a successful, empty cycle.
    pub async fn run_cycle(&self) -> BrokerResult<CycleReport> {
        let raw = self
            .broker
            .pop_batch(&self.queue, self.batch_size, self.server_sleep)
            .await?;

        let report = if raw.is_empty() {
            CycleReport::default()
        } else {
            self.process(raw).await
        };

        self.heartbeat().await;
        Ok(report)
    }

    async fn process(&self, raw: Vec<Vec<u8>>) -> CycleReport {
        let claimed = raw.len();
        let prepared = prepare_batch(raw, &self.payload);
        let mut results = prepared.failures;

        if !prepared.ids.is_empty() {
            let backend = Arc::clone(&self.backend);
            let input = prepared.input;
            let outcome = match tokio::task::spawn_blocking(move || backend.infer(&input)).await {
                Ok(outcome) => outcome,
                Err(error) => Err(InferenceError::Backend(format!(
                    "inference task did not complete: {error}"
                ))),
            };
            results.extend(fan_out(prepared.ids, outcome));
        }

        let succeeded = results.iter().filter(|r| r.is_success()).count();
        let mut report = CycleReport {
            claimed,
            succeeded,
            failed: results.len() - succeeded,
            orphaned: prepared.orphaned,
            lost: 0,
        };

        if let Err(error) = self.write_results(&results).await {
            report.lost = results.len();
            log::error!(
                "Lost {} results from worker {}: {error}",
                results.len(),
                self.worker_id
            );
        }

        log::info!(
            "Processed batch on {}: claimed={}, succeeded={}, failed={}, orphaned={}, lost={}",
            self.queue,
            report.claimed,
            report.succeeded,
            report.failed,
            report.orphaned,
            report.lost
        );
        report
    }

    async fn write_results(&self, results: &[InferenceResult]) -> BrokerResult<()> {
        if results.is_empty() {
            return Ok(());
        }
        let store = &self.results;
        retry_broker(self.backoff, self.write_retries, "result write", move || {
            store.put_all(results)
        })
        .await
    }

    async fn heartbeat(&self) {
        let at = self.liveness.touch();
        if let Err(error) = self
            .broker
            .set(
                &self.heartbeat_key,
                at.to_rfc3339().into_bytes(),
                self.heartbeat_ttl,
            )
            .await
        {
            log::debug!("Failed to write heartbeat for {}: {error}", self.worker_id);
        }
    }
}

/// Sleeps for `delay` unless shutdown is requested first. Returns true on shutdown.
async fn wait_or_shutdown(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => false,
        changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
    }
}
