//! Caller-side entry point: enqueue a payload and wait for its result.
//!
//! Delivery is at-least-once. A caller that gives up (timeout or dropping the
//! future) does not retract the pushed request, so a worker may still process
//! it and the unread result simply expires.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::time::Instant;

use crate::broker::{Broker, BrokerError};
use crate::codec::{CodecError, encode_request};
use crate::domain::request::{InferenceRequest, Prediction, ResultFailure, TensorPayload};
use crate::models::config::{PayloadSettings, Settings};
use crate::results::ResultStore;
use crate::retry::Backoff;

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("invalid payload: {0}")]
    InvalidPayload(#[from] CodecError),
    /// The outcome is unknown: the request may still be processed later.
    #[error("request {request_id} timed out after {waited:?}; outcome unknown")]
    Timeout {
        request_id: String,
        waited: Duration,
    },
    /// The worker reported a failure for this request.
    #[error("request {request_id} failed: {error}")]
    Failed {
        request_id: String,
        error: ResultFailure,
    },
    #[error("request {request_id} received an unreadable result: {message}")]
    CorruptResult { request_id: String, message: String },
}

/// Produces ids unique across processes: a random per-generator token plus a
/// monotonic counter.
#[derive(Debug)]
pub struct RequestIdGenerator {
    token: u64,
    counter: AtomicU64,
}

impl RequestIdGenerator {
    pub fn new() -> Self {
        Self {
            token: rand::random(),
            counter: AtomicU64::new(0),
        }
    }

    pub fn next_id(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        format!("{:016x}-{n}", self.token)
    }
}

impl Default for RequestIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

pub struct SubmissionGateway<B> {
    broker: B,
    results: ResultStore<B>,
    queue: String,
    payload: PayloadSettings,
    poll_interval: Duration,
    default_timeout: Duration,
    backoff: Backoff,
    ids: RequestIdGenerator,
}

impl<B: Broker + Clone> SubmissionGateway<B> {
    pub fn new(broker: B, settings: &Settings) -> Self {
        Self {
            results: ResultStore::new(
                broker.clone(),
                settings.queue.result_prefix.clone(),
                settings.queue.result_ttl(),
            ),
            broker,
            queue: settings.queue.name.clone(),
            payload: settings.payload.clone(),
            poll_interval: settings.queue.client_sleep(),
            default_timeout: settings.queue.client_timeout(),
            backoff: Backoff::from_settings(&settings.worker),
            ids: RequestIdGenerator::new(),
        }
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Enqueues `payload` and waits up to `timeout` for its result.
    pub async fn submit(
        &self,
        payload: TensorPayload,
        timeout: Duration,
    ) -> Result<Prediction, SubmitError> {
        let started = Instant::now();
        let deadline = started + timeout;
        let request_id = self.enqueue_until(payload, started, deadline).await?;
        self.wait_until(&request_id, started, deadline).await
    }

    /// Enqueues `payload` without waiting and returns its request id.
    ///
    /// Transient broker errors are retried for up to the default client timeout.
    pub async fn enqueue(&self, payload: TensorPayload) -> Result<String, SubmitError> {
        let started = Instant::now();
        self.enqueue_until(payload, started, started + self.default_timeout)
            .await
    }

    /// Waits up to `timeout` for the result of a previously enqueued request.
    pub async fn wait(&self, request_id: &str, timeout: Duration) -> Result<Prediction, SubmitError> {
        let started = Instant::now();
        self.wait_until(request_id, started, started + timeout).await
    }

    async fn enqueue_until(
        &self,
        payload: TensorPayload,
        started: Instant,
        deadline: Instant,
    ) -> Result<String, SubmitError> {
        self.payload.check(&payload)?;

        let request = InferenceRequest {
            id: self.ids.next_id(),
            payload,
            enqueued_at: Utc::now(),
        };
        let raw = encode_request(&request)?;

        let mut attempt = 0;
        loop {
            match self.broker.push(&self.queue, raw.clone()).await {
                Ok(()) => {
                    log::debug!("Enqueued request {} on {}", request.id, self.queue);
                    return Ok(request.id);
                }
                Err(error) => {
                    let now = Instant::now();
                    if now >= deadline {
                        log::warn!("Giving up enqueueing request {}: {error}", request.id);
                        return Err(SubmitError::Timeout {
                            request_id: request.id,
                            waited: now - started,
                        });
                    }
                    let delay = self.backoff.delay(attempt).min(deadline - now);
                    log::warn!(
                        "Failed to enqueue request {}: {error}; retrying in {delay:?}",
                        request.id
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn wait_until(
        &self,
        request_id: &str,
        started: Instant,
        deadline: Instant,
    ) -> Result<Prediction, SubmitError> {
        loop {
            match self.results.take(request_id).await {
                Ok(Some(result)) => {
                    if result.request_id != request_id {
                        return Err(SubmitError::CorruptResult {
                            request_id: request_id.to_string(),
                            message: format!("result carries id {}", result.request_id),
                        });
                    }
                    return result
                        .into_outcome()
                        .map_err(|error| SubmitError::Failed {
                            request_id: request_id.to_string(),
                            error,
                        });
                }
                Ok(None) => {}
                Err(BrokerError::Reply(message)) => {
                    return Err(SubmitError::CorruptResult {
                        request_id: request_id.to_string(),
                        message,
                    });
                }
                Err(error) => {
                    log::warn!("Failed to poll result for {request_id}: {error}");
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(SubmitError::Timeout {
                    request_id: request_id.to_string(),
                    waited: now - started,
                });
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }
}
