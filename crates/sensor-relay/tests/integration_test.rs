// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use mockito::{Matcher, Server, ServerGuard};
use sensor_relay::{
    delivery::{self, MetadataValue},
    memory::{MemoryBroker, Settlement},
    Consumer, Destination, Failure, HttpForwarder, Metadata, Outcome, Pipeline, RetryPolicy,
    ShutdownReason, Subscription, ATTEMPTS_KEY,
};
use std::sync::Arc;
use tokio::time::{sleep, timeout, Duration};
use tokio_util::sync::CancellationToken;

const SINK_PATH: &str = "/api/weather/logs";
const READING: &str = r#"{"city":"Recife","timestamp_utc":"2025-11-22T03:38:00Z","temperature_c":27.4,"humidity_pct":78,"rain_probability_pct":130}"#;

fn pipeline(server: &ServerGuard, broker: &MemoryBroker, max_retries: u32) -> Pipeline {
    let forwarder = HttpForwarder::new(
        reqwest::Client::new(),
        format!("{}{SINK_PATH}", server.url()),
    );
    Pipeline::new(
        Arc::new(forwarder),
        Arc::new(broker.publisher()),
        RetryPolicy::new(max_retries),
        Duration::from_secs(5),
    )
}

fn attempts(n: i64) -> Metadata {
    Metadata::from([(ATTEMPTS_KEY.to_string(), MetadataValue::Int(n))])
}

async fn process_one(
    pipeline: &Pipeline,
    broker: &MemoryBroker,
    payload: &str,
    metadata: Metadata,
) -> (u64, Outcome) {
    let id = broker.enqueue(payload, metadata).expect("enqueue failed");
    let mut subscription = broker.subscribe().expect("subscribe failed");
    let delivery = subscription
        .next_delivery()
        .await
        .expect("stream ended")
        .expect("delivery failed");
    (id, pipeline.process(delivery).await)
}

#[tokio::test]
async fn forwarded_reading_is_acknowledged() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", SINK_PATH)
        .match_header("content-type", "application/json")
        .match_body(Matcher::PartialJsonString(
            r#"{"city":"Recife","rain_probability_pct":100}"#.to_string(),
        ))
        .with_status(200)
        .expect(1)
        .create_async()
        .await;
    let broker = MemoryBroker::new();
    let pipeline = pipeline(&server, &broker, 3);

    let (id, outcome) = process_one(&pipeline, &broker, READING, Metadata::new()).await;

    mock.assert_async().await;
    assert!(matches!(outcome, Outcome::Forwarded));
    assert_eq!(broker.settlements(), vec![Settlement::Acked(id)]);
    assert!(broker.published(Destination::Primary).is_empty());
    assert!(broker.published(Destination::DeadLetter).is_empty());
}

#[tokio::test]
async fn sink_failure_requeues_with_incremented_attempts() {
    let mut server = Server::new_async().await;
    let _mock = server
        .mock("POST", SINK_PATH)
        .with_status(500)
        .create_async()
        .await;
    let broker = MemoryBroker::new();
    let pipeline = pipeline(&server, &broker, 3);

    let (id, outcome) = process_one(&pipeline, &broker, READING, Metadata::new()).await;

    assert!(matches!(outcome, Outcome::Requeued { attempt: 1 }));
    assert_eq!(broker.settlements(), vec![Settlement::Acked(id)]);

    let requeued = broker.published(Destination::Primary);
    assert_eq!(requeued.len(), 1);
    assert_eq!(requeued[0].payload, READING.as_bytes());
    assert_eq!(delivery::attempts(&requeued[0].metadata), 1);
    assert!(broker.published(Destination::DeadLetter).is_empty());
}

#[tokio::test]
async fn exhausted_retries_dead_letter_with_unchanged_attempts() {
    let mut server = Server::new_async().await;
    let _mock = server
        .mock("POST", SINK_PATH)
        .with_status(500)
        .create_async()
        .await;
    let broker = MemoryBroker::new();
    let pipeline = pipeline(&server, &broker, 3);

    let (id, outcome) = process_one(&pipeline, &broker, READING, attempts(3)).await;

    assert!(matches!(
        outcome,
        Outcome::DeadLettered {
            failure: Failure::Sink(_)
        }
    ));
    assert_eq!(broker.settlements(), vec![Settlement::Acked(id)]);

    let dead = broker.published(Destination::DeadLetter);
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].payload, READING.as_bytes());
    assert_eq!(delivery::attempts(&dead[0].metadata), 3);
    assert!(broker.published(Destination::Primary).is_empty());
}

#[tokio::test]
async fn reading_without_city_is_dead_lettered_verbatim() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", SINK_PATH)
        .expect(0)
        .create_async()
        .await;
    let broker = MemoryBroker::new();
    let pipeline = pipeline(&server, &broker, 3);
    let payload = r#"{"timestamp_utc":"2025-01-01T00:00:00Z"}"#;

    let (id, outcome) = process_one(&pipeline, &broker, payload, Metadata::new()).await;

    mock.assert_async().await;
    assert!(matches!(
        outcome,
        Outcome::DeadLettered {
            failure: Failure::Invalid(_)
        }
    ));
    assert_eq!(broker.settlements(), vec![Settlement::Acked(id)]);
    let dead = broker.published(Destination::DeadLetter);
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].payload, payload.as_bytes());
}

#[tokio::test]
async fn failed_requeue_publish_rejects_original() {
    let mut server = Server::new_async().await;
    let _mock = server
        .mock("POST", SINK_PATH)
        .with_status(503)
        .create_async()
        .await;
    let broker = MemoryBroker::new();
    broker.fail_publishes_to(Destination::Primary);
    let pipeline = pipeline(&server, &broker, 3);

    let (id, outcome) = process_one(&pipeline, &broker, READING, Metadata::new()).await;

    assert!(matches!(
        outcome,
        Outcome::Rejected {
            destination: Destination::Primary,
            ..
        }
    ));
    assert_eq!(broker.settlements(), vec![Settlement::Rejected(id)]);
}

#[tokio::test]
async fn failed_dead_letter_publish_rejects_original() {
    let server = Server::new_async().await;
    let broker = MemoryBroker::new();
    broker.fail_publishes_to(Destination::DeadLetter);
    let pipeline = pipeline(&server, &broker, 3);

    let (id, outcome) = process_one(&pipeline, &broker, "not json", Metadata::new()).await;

    assert!(matches!(
        outcome,
        Outcome::Rejected {
            destination: Destination::DeadLetter,
            ..
        }
    ));
    assert_eq!(broker.settlements(), vec![Settlement::Rejected(id)]);
}

async fn wait_for_settlements(broker: &MemoryBroker, count: usize) {
    timeout(Duration::from_secs(10), async {
        while broker.settlements().len() < count {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("deliveries were not settled in time");
}

#[tokio::test]
async fn consumer_retries_through_queue_until_dead_lettered() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", SINK_PATH)
        .with_status(500)
        .expect(3)
        .create_async()
        .await;
    let broker = MemoryBroker::new();
    let pipeline = Arc::new(pipeline(&server, &broker, 2));
    broker.enqueue(READING, Metadata::new()).unwrap();

    let cancel_token = CancellationToken::new();
    let consumer = Consumer::new(
        broker.subscribe().unwrap(),
        pipeline,
        1,
        cancel_token.clone(),
    );
    let handle = tokio::spawn(consumer.run());

    // original, two requeued copies
    wait_for_settlements(&broker, 3).await;
    cancel_token.cancel();
    let (reason, stats) = handle.await.unwrap();

    mock.assert_async().await;
    assert!(matches!(reason, ShutdownReason::Cancelled));
    assert_eq!(stats.requeued, 2);
    assert_eq!(stats.dead_lettered, 1);
    assert!(broker
        .settlements()
        .iter()
        .all(|s| matches!(s, Settlement::Acked(_))));

    let requeued = broker.published(Destination::Primary);
    let counts: Vec<u32> = requeued
        .iter()
        .map(|m| delivery::attempts(&m.metadata))
        .collect();
    assert_eq!(counts, vec![1, 2]);

    let dead = broker.published(Destination::DeadLetter);
    assert_eq!(dead.len(), 1);
    assert_eq!(delivery::attempts(&dead[0].metadata), 2);
}

#[tokio::test]
async fn consumer_drains_mixed_batch_and_stops_on_close() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", SINK_PATH)
        .with_status(201)
        .expect(4)
        .create_async()
        .await;
    let broker = MemoryBroker::new();
    let pipeline = Arc::new(pipeline(&server, &broker, 3));
    for _ in 0..4 {
        broker.enqueue(READING, Metadata::new()).unwrap();
    }
    broker.enqueue("{", Metadata::new()).unwrap();
    broker.close();

    let consumer = Consumer::new(
        broker.subscribe().unwrap(),
        pipeline,
        4,
        CancellationToken::new(),
    );
    let (reason, stats) = consumer.run().await;

    mock.assert_async().await;
    assert!(matches!(reason, ShutdownReason::StreamClosed));
    assert_eq!(stats.forwarded, 4);
    assert_eq!(stats.dead_lettered, 1);
    assert_eq!(broker.settlements().len(), 5);
    assert_eq!(broker.published(Destination::DeadLetter)[0].payload, b"{");
}
