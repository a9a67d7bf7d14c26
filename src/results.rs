//! Result namespace in the broker: written by workers, read once by gateways.

use std::time::Duration;

use crate::broker::{Broker, BrokerError, BrokerResult};
use crate::codec::{decode_result, encode_result};
use crate::domain::request::InferenceResult;

#[derive(Clone)]
pub struct ResultStore<B> {
    broker: B,
    prefix: String,
    ttl: Duration,
}

impl<B: Broker> ResultStore<B> {
    pub fn new(broker: B, prefix: impl Into<String>, ttl: Duration) -> Self {
        Self {
            broker,
            prefix: prefix.into(),
            ttl,
        }
    }

    pub fn key(&self, request_id: &str) -> String {
        format!("{}:{request_id}", self.prefix)
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Writes every result under its request id with the configured TTL.
    pub async fn put_all(&self, results: &[InferenceResult]) -> BrokerResult<()> {
        let entries = results
            .iter()
            .map(|result| {
                encode_result(result)
                    .map(|raw| (self.key(&result.request_id), raw))
                    .map_err(|e| BrokerError::Command(format!("cannot encode result: {e}")))
            })
            .collect::<BrokerResult<Vec<_>>>()?;
        self.broker.set_many(entries, self.ttl).await
    }

    /// Removes and returns the result for `request_id`, if it has arrived.
    ///
    /// A stored value that fails to decode is reported as a reply error; it is
    /// already deleted, so retrying will not see it again.
    pub async fn take(&self, request_id: &str) -> BrokerResult<Option<InferenceResult>> {
        let Some(raw) = self.broker.take(&self.key(request_id)).await? else {
            return Ok(None);
        };
        decode_result(&raw)
            .map(Some)
            .map_err(|e| BrokerError::Reply(format!("malformed result for {request_id}: {e}")))
    }
}
