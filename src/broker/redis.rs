//! Redis-backed broker.
//!
//! Requires Redis 7 or newer (`BLMPOP`, `GETDEL`).

use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::redis;
use deadpool_redis::{Config, Connection, Pool, PoolConfig, PoolError, Runtime};

use crate::broker::{Broker, BrokerError, BrokerResult};
use crate::models::config::BrokerSettings;

impl From<redis::RedisError> for BrokerError {
    fn from(error: redis::RedisError) -> Self {
        if error.is_io_error() || error.is_connection_dropped() || error.is_timeout() {
            BrokerError::Connection(error.to_string())
        } else {
            BrokerError::Command(error.to_string())
        }
    }
}

impl From<PoolError> for BrokerError {
    fn from(error: PoolError) -> Self {
        BrokerError::Connection(error.to_string())
    }
}

/// Pooled Redis client. Cloning shares the pool.
#[derive(Clone)]
pub struct RedisBroker {
    pool: Pool,
}

impl RedisBroker {
    /// Creates the pool. No connection is opened until the first command.
    pub fn new(settings: &BrokerSettings) -> BrokerResult<Self> {
        let url = settings
            .url()
            .map_err(|e| BrokerError::Connection(e.to_string()))?;
        Self::from_url(url.as_str(), settings.pool_size)
    }

    pub fn from_url(url: &str, pool_size: usize) -> BrokerResult<Self> {
        let mut cfg = Config::from_url(url);
        cfg.pool = Some(PoolConfig::new(pool_size.max(1)));
        let pool = cfg
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| BrokerError::Connection(e.to_string()))?;
        Ok(Self { pool })
    }

    async fn conn(&self) -> BrokerResult<Connection> {
        Ok(self.pool.get().await?)
    }
}

/// Redis rejects a zero expiry, so sub-millisecond TTLs round up.
fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

#[async_trait]
impl Broker for RedisBroker {
    async fn push(&self, queue: &str, item: Vec<u8>) -> BrokerResult<()> {
        let mut conn = self.conn().await?;
        redis::cmd("RPUSH")
            .arg(queue)
            .arg(item)
            .query_async::<()>(&mut conn)
            .await?;
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
        let mut conn = self.conn().await?;

        // BLMPOP treats a zero timeout as "wait forever".
        if max_wait.is_zero() {
            let items: Option<Vec<Vec<u8>>> = redis::cmd("LPOP")
                .arg(queue)
                .arg(max_n)
                .query_async(&mut conn)
                .await?;
            return Ok(items.unwrap_or_default());
        }

        let popped: Option<(String, Vec<Vec<u8>>)> = redis::cmd("BLMPOP")
            .arg(max_wait.as_secs_f64())
            .arg(1)
            .arg(queue)
            .arg("LEFT")
            .arg("COUNT")
            .arg(max_n)
            .query_async(&mut conn)
            .await?;

        Ok(popped.map(|(_, items)| items).unwrap_or_default())
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> BrokerResult<()> {
        let mut conn = self.conn().await?;
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn set_many(&self, entries: Vec<(String, Vec<u8>)>, ttl: Duration) -> BrokerResult<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn().await?;
        let ttl = ttl_millis(ttl);

        let mut pipe = redis::pipe();
        pipe.atomic();
        for (key, value) in entries {
            pipe.cmd("SET")
                .arg(key)
                .arg(value)
                .arg("PX")
                .arg(ttl)
                .ignore();
        }
        pipe.query_async::<()>(&mut conn).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> BrokerResult<Option<Vec<u8>>> {
        let mut conn = self.conn().await?;
        Ok(redis::cmd("GET").arg(key).query_async(&mut conn).await?)
    }

    async fn take(&self, key: &str) -> BrokerResult<Option<Vec<u8>>> {
        let mut conn = self.conn().await?;
        Ok(redis::cmd("GETDEL").arg(key).query_async(&mut conn).await?)
    }

    async fn len(&self, queue: &str) -> BrokerResult<usize> {
        let mut conn = self.conn().await?;
        Ok(redis::cmd("LLEN").arg(queue).query_async(&mut conn).await?)
    }

    async fn ping(&self) -> BrokerResult<()> {
        let mut conn = self.conn().await?;
        let reply: String = redis::cmd("PING").query_async(&mut conn).await?;
        if reply != "PONG" {
            return Err(BrokerError::Reply(format!("PING answered {reply}")));
        }
        Ok(())
    }
}
