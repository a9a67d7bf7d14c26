//! Runs against a live Redis 7 server when `INFERQ_TEST_REDIS_URL` is set,
//! e.g. `INFERQ_TEST_REDIS_URL=redis://127.0.0.1:6379/15`. Skipped otherwise.

mod common;

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::time::Instant;

use pushkind_inferq::broker::{Broker, RedisBroker};
use pushkind_inferq::domain::request::TensorPayload;
use pushkind_inferq::gateway::SubmissionGateway;
use pushkind_inferq::processing::backend::NormalizeBackend;

use common::{TestRedis, Worker};

macro_rules! redis_or_skip {
    ($name:expr) => {
        match TestRedis::from_env($name) {
            Some(redis) => redis,
            None => {
                eprintln!("INFERQ_TEST_REDIS_URL not set; skipping {}", $name);
                return;
            }
        }
    };
}

#[tokio::test]
async fn pop_batch_is_fifo_and_capped() {
    let redis = redis_or_skip!("pop_batch");
    let broker = RedisBroker::from_url(redis.url(), 2).unwrap();
    let queue = redis.key("queue");
    for i in 0..5u8 {
        broker.push(&queue, vec![i]).await.unwrap();
    }

    let first = broker
        .pop_batch(&queue, 3, Duration::from_millis(100))
        .await
        .unwrap();
    let second = broker
        .pop_batch(&queue, 3, Duration::from_millis(100))
        .await
        .unwrap();

    assert_eq!(first, vec![vec![0], vec![1], vec![2]]);
    assert_eq!(second, vec![vec![3], vec![4]]);
    assert_eq!(broker.len(&queue).await.unwrap(), 0);
}

#[tokio::test]
async fn pop_batch_on_empty_queue_waits_then_returns_nothing() {
    let redis = redis_or_skip!("pop_empty");
    let broker = RedisBroker::from_url(redis.url(), 2).unwrap();

    let started = Instant::now();
    let batch = broker
        .pop_batch(&redis.key("queue"), 8, Duration::from_millis(200))
        .await
        .unwrap();

    assert!(batch.is_empty());
    assert!(started.elapsed() >= Duration::from_millis(150));
}

#[tokio::test]
async fn results_are_taken_once_and_expire() {
    let redis = redis_or_skip!("results");
    let broker = RedisBroker::from_url(redis.url(), 2).unwrap();
    let kept = redis.key("kept");
    let expiring = redis.key("expiring");

    broker
        .set_many(
            vec![(kept.clone(), b"a".to_vec())],
            Duration::from_secs(30),
        )
        .await
        .unwrap();
    broker
        .set(&expiring, b"b".to_vec(), Duration::from_millis(50))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;

    assert_eq!(broker.get(&kept).await.unwrap(), Some(b"a".to_vec()));
    assert_eq!(broker.take(&kept).await.unwrap(), Some(b"a".to_vec()));
    assert_eq!(broker.take(&kept).await.unwrap(), None);
    assert_eq!(broker.get(&expiring).await.unwrap(), None);
    broker.ping().await.unwrap();
}

#[tokio::test]
async fn gateway_and_two_workers_share_a_redis_queue() {
    let redis = redis_or_skip!("pipeline");
    let settings = redis.settings();
    let broker = RedisBroker::from_url(redis.url(), 8).unwrap();
    let gateway = SubmissionGateway::new(broker.clone(), &settings);
    let first = Worker::spawn(broker.clone(), Arc::new(NormalizeBackend), &settings);
    let second = Worker::spawn(broker.clone(), Arc::new(NormalizeBackend), &settings);

    let outcomes = join_all((1..=20).map(|i| {
        let payload = TensorPayload::from_f32(vec![2], &[0.0, i as f32]).unwrap();
        gateway.submit(payload, Duration::from_secs(5))
    }))
    .await;
    first.stop().await;
    second.stop().await;

    for outcome in outcomes {
        assert_eq!(outcome.unwrap().values, vec![0.0, 1.0]);
    }
    assert_eq!(broker.len(&settings.queue.name).await.unwrap(), 0);
}
