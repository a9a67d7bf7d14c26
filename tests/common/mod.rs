//! Helpers for integration tests.
#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use deadpool_redis::redis;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use pushkind_inferq::broker::Broker;
use pushkind_inferq::domain::request::{DType, Prediction};
use pushkind_inferq::models::config::Settings;
use pushkind_inferq::processing::backend::{BatchInput, InferenceBackend, InferenceError};
use pushkind_inferq::processing::scheduler::BatchScheduler;

/// Settings for two-float payloads with short intervals.
pub fn fast_settings() -> Settings {
    let mut settings = Settings::default();
    settings.payload.shape = vec![2];
    settings.payload.dtype = DType::Float32;
    settings.queue.server_sleep_ms = 10;
    settings.queue.client_sleep_ms = 10;
    settings.worker.retry_base_ms = 10;
    settings.worker.retry_max_ms = 100;
    settings
}

/// Returns every item unchanged and counts how many it has seen.
#[derive(Default)]
pub struct EchoBackend {
    pub rows: AtomicUsize,
    pub batches: AtomicUsize,
}

impl InferenceBackend for EchoBackend {
    fn name(&self) -> &'static str {
        "echo"
    }

    fn infer(&self, input: &BatchInput) -> Result<Vec<Prediction>, InferenceError> {
        let BatchInput::Tensor(tensor) = input else {
            return Err(InferenceError::Backend("echo expects tensors".into()));
        };
        self.batches.fetch_add(1, Ordering::SeqCst);
        self.rows.fetch_add(tensor.batch_size(), Ordering::SeqCst);
        Ok(tensor
            .rows()
            .map(|row| Prediction::vector(row.to_vec()))
            .collect())
    }
}

/// A worker running in the background until [`Worker::stop`] is called.
pub struct Worker {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl Worker {
    pub fn spawn<B>(broker: B, backend: Arc<dyn InferenceBackend>, settings: &Settings) -> Self
    where
        B: Broker + Clone + 'static,
    {
        let scheduler = BatchScheduler::new(broker, backend, settings);
        let (shutdown, rx) = watch::channel(false);
        let handle = tokio::spawn(async move { scheduler.run(rx).await });
        Self { shutdown, handle }
    }

    pub async fn stop(self) {
        self.shutdown.send_replace(true);
        self.handle.await.expect("worker task panicked");
    }
}

/// Redis namespace used by one test; its keys are removed on drop.
pub struct TestRedis {
    url: String,
    namespace: String,
}

impl TestRedis {
    /// Returns `None` unless `INFERQ_TEST_REDIS_URL` points at a Redis 7 server.
    pub fn from_env(test_name: &str) -> Option<Self> {
        let url = std::env::var("INFERQ_TEST_REDIS_URL").ok()?;
        Some(TestRedis {
            url,
            namespace: format!("inferq-test:{test_name}:{:08x}", rand::random::<u32>()),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Settings whose queue and result keys live inside this namespace.
    pub fn settings(&self) -> Settings {
        let mut settings = fast_settings();
        settings.queue.name = format!("{}:queue", self.namespace);
        settings.queue.result_prefix = format!("{}:result", self.namespace);
        settings
    }

    pub fn key(&self, suffix: &str) -> String {
        format!("{}:{suffix}", self.namespace)
    }
}

impl Drop for TestRedis {
    fn drop(&mut self) {
        let Ok(client) = redis::Client::open(self.url.as_str()) else {
            return;
        };
        let Ok(mut conn) = client.get_connection() else {
            return;
        };
        let keys: Vec<String> = redis::cmd("KEYS")
            .arg(format!("{}:*", self.namespace))
            .query(&mut conn)
            .unwrap_or_default();
        if !keys.is_empty() {
            redis::cmd("DEL").arg(keys).query::<()>(&mut conn).ok();
        }
    }
}
