//! In-process broker with the same semantics as [`super::RedisBroker`].
//!
//! Used by tests and for running gateway and workers inside one process.
//! Expiry follows the tokio clock so paused-time tests observe TTLs.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::broker::{Broker, BrokerError, BrokerResult};

#[derive(Default)]
struct State {
    queues: HashMap<String, VecDeque<Vec<u8>>>,
    values: HashMap<String, (Vec<u8>, Instant)>,
    offline: bool,
}

impl State {
    fn live_value(&mut self, key: &str) -> Option<&Vec<u8>> {
        let now = Instant::now();
        if self
            .values
            .get(key)
            .is_some_and(|(_, expires_at)| *expires_at <= now)
        {
            self.values.remove(key);
        }
        self.values.get(key).map(|(value, _)| value)
    }
}

#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<State>>,
    pushed: Arc<Notify>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates losing the connection: every call fails until restored.
    pub fn set_offline(&self, offline: bool) {
        if let Ok(mut state) = self.state.lock() {
            state.offline = offline;
        }
        self.pushed.notify_waiters();
    }

    fn lock(&self) -> BrokerResult<MutexGuard<'_, State>> {
        let state = self
            .state
            .lock()
            .map_err(|_| BrokerError::Connection("memory broker state poisoned".to_string()))?;
        if state.offline {
            return Err(BrokerError::Connection("memory broker offline".to_string()));
        }
        Ok(state)
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn push(&self, queue: &str, item: Vec<u8>) -> BrokerResult<()> {
        self.lock()?
            .queues
            .entry(queue.to_string())
            .or_default()
            .push_back(item);
        self.pushed.notify_waiters();
        Ok(())
    }

    async fn pop_batch(
        &self,
        queue: &str,
        max_n: usize,
        max_wait: Duration,
    ) -> BrokerResult<Vec<Vec<u8>>> {
        if max_n == 0 {
            return Ok(Vec::new());
        }
        let deadline = Instant::now() + max_wait;
        loop {
            // Registered before checking so a push between check and wait is not missed.
            let notified = self.pushed.notified();
            {
                let mut state = self.lock()?;
                if let Some(items) = state.queues.get_mut(queue).filter(|q| !q.is_empty()) {
                    let take = max_n.min(items.len());
                    return Ok(items.drain(..take).collect());
                }
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> BrokerResult<()> {
        self.lock()?
            .values
            .insert(key.to_string(), (value, Instant::now() + ttl));
        Ok(())
    }

    async fn set_many(&self, entries: Vec<(String, Vec<u8>)>, ttl: Duration) -> BrokerResult<()> {
        let mut state = self.lock()?;
        let expires_at = Instant::now() + ttl;
        for (key, value) in entries {
            state.values.insert(key, (value, expires_at));
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> BrokerResult<Option<Vec<u8>>> {
        Ok(self.lock()?.live_value(key).cloned())
    }

    async fn take(&self, key: &str) -> BrokerResult<Option<Vec<u8>>> {
        let mut state = self.lock()?;
        if state.live_value(key).is_none() {
            return Ok(None);
        }
        Ok(state.values.remove(key).map(|(value, _)| value))
    }

    async fn len(&self, queue: &str) -> BrokerResult<usize> {
        Ok(self.lock()?.queues.get(queue).map_or(0, VecDeque::len))
    }

    async fn ping(&self) -> BrokerResult<()> {
        self.lock().map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pop_batch_preserves_fifo_order_and_limit() {
        let broker = MemoryBroker::new();
        for i in 0..5u8 {
            broker.push("q", vec![i]).await.unwrap();
        }

        let first = broker.pop_batch("q", 3, Duration::ZERO).await.unwrap();
        let second = broker.pop_batch("q", 3, Duration::ZERO).await.unwrap();

        assert_eq!(first, vec![vec![0], vec![1], vec![2]]);
        assert_eq!(second, vec![vec![3], vec![4]]);
        assert_eq!(broker.len("q").await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn pop_batch_returns_empty_after_max_wait() {
        let broker = MemoryBroker::new();
        let started = Instant::now();

        let items = broker
            .pop_batch("q", 4, Duration::from_millis(250))
            .await
            .unwrap();

        assert!(items.is_empty());
        assert!(started.elapsed() >= Duration::from_millis(250));
        assert!(started.elapsed() < Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn pop_batch_wakes_on_push() {
        let broker = MemoryBroker::new();
        let producer = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            producer.push("q", b"job".to_vec()).await.unwrap();
        });
        let started = Instant::now();

        let items = broker.pop_batch("q", 4, Duration::from_secs(5)).await.unwrap();

        assert_eq!(items, vec![b"job".to_vec()]);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn values_expire_after_ttl() {
        let broker = MemoryBroker::new();
        broker
            .set("k", b"v".to_vec(), Duration::from_secs(2))
            .await
            .unwrap();

        assert_eq!(broker.get("k").await.unwrap(), Some(b"v".to_vec()));
        tokio::time::advance(Duration::from_secs(3)).await;
        assert_eq!(broker.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn take_reads_once() {
        let broker = MemoryBroker::new();
        broker
            .set_many(
                vec![("a".into(), b"1".to_vec()), ("b".into(), b"2".to_vec())],
                Duration::from_secs(60),
            )
            .await
            .unwrap();

        assert_eq!(broker.take("a").await.unwrap(), Some(b"1".to_vec()));
        assert_eq!(broker.take("a").await.unwrap(), None);
        assert_eq!(broker.get("b").await.unwrap(), Some(b"2".to_vec()));
    }

    #[tokio::test]
    async fn offline_broker_rejects_calls() {
        let broker = MemoryBroker::new();
        broker.set_offline(true);

        assert!(matches!(
            broker.push("q", vec![1]).await,
            Err(BrokerError::Connection(_))
        ));
        broker.set_offline(false);
        assert!(broker.ping().await.is_ok());
    }
}
