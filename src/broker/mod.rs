//! Shared store used for cross-process coordination.
//!
//! Every operation maps to a single atomic broker command, so callers in
//! different processes never race on a multi-step sequence.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub mod memory;
pub mod redis;

pub use memory::MemoryBroker;
pub use redis::RedisBroker;

/// Broker failures. All of them are treated as transient and retried by the
/// caller with backoff.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker connection failed: {0}")]
    Connection(String),
    #[error("broker command failed: {0}")]
    Command(String),
    #[error("unexpected broker reply: {0}")]
    Reply(String),
}

pub type BrokerResult<T> = Result<T, BrokerError>;

#[async_trait]
pub trait Broker: Send + Sync {
    /// Appends `item` to the tail of `queue`. Never blocks.
    async fn push(&self, queue: &str, item: Vec<u8>) -> BrokerResult<()>;

    /// Removes up to `max_n` items from the head of `queue` in one atomic step.
    ///
    /// Waits until at least one item is available or `max_wait` elapses; an
    /// elapsed wait yields an empty batch.
    async fn pop_batch(
        &self,
        queue: &str,
        max_n: usize,
        max_wait: Duration,
    ) -> BrokerResult<Vec<Vec<u8>>>;

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> BrokerResult<()>;

    /// Writes every entry with the same TTL in a single transaction.
    async fn set_many(&self, entries: Vec<(String, Vec<u8>)>, ttl: Duration) -> BrokerResult<()>;

    async fn get(&self, key: &str) -> BrokerResult<Option<Vec<u8>>>;

    /// Atomically reads and deletes `key`.
    async fn take(&self, key: &str) -> BrokerResult<Option<Vec<u8>>>;

    async fn len(&self, queue: &str) -> BrokerResult<usize>;

    async fn ping(&self) -> BrokerResult<()>;
}
