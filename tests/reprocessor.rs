//! Dead-Letter Reprocessor Tests

mod common;

use common::{Harness, DLQ, QUEUE};
use scribeflow::core::{DeadLetterReprocessor, ReprocessOutcome, ReprocessorSettings};
use scribeflow::ingest::Broker;

fn reprocessor(harness: &Harness) -> DeadLetterReprocessor {
    DeadLetterReprocessor::new(
        harness.broker.clone(),
        QUEUE,
        ReprocessorSettings {
            max_attempts: 5,
            backoff_base_seconds: 0.0,
            ..Default::default()
        },
        harness.metrics.clone(),
    )
}

async fn dead_letter(harness: &Harness, body: serde_json::Value) {
    harness
        .broker
        .inner
        .publish(DLQ, serde_json::to_vec(&body).unwrap())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_last_allowed_attempt_is_republished_once() {
    let harness = Harness::new();
    dead_letter(
        &harness,
        serde_json::json!({"filename": "a.wav", "text": "t", "retry_attempts": 4, "reason": "downstream_failed"}),
    )
    .await;

    let outcome = reprocessor(&harness).poll_once().await.unwrap();
    assert_eq!(outcome, Some(ReprocessOutcome::Republished { attempts: 5 }));

    let main = harness.broker.messages(QUEUE);
    assert_eq!(main.len(), 1);
    assert_eq!(main[0]["retry_attempts"], 5);
    assert_eq!(main[0]["filename"], "a.wav");
    assert_eq!(harness.broker.inner.unacked(DLQ), 0);
    assert_eq!(harness.metrics.reprocessor_attempt.get(), 1);
    assert_eq!(harness.metrics.reprocessor_success.get(), 1);
}

#[tokio::test]
async fn test_exhausted_message_is_dropped() {
    let harness = Harness::new();
    dead_letter(
        &harness,
        serde_json::json!({"filename": "a.wav", "text": "t", "retry_attempts": 5}),
    )
    .await;

    let outcome = reprocessor(&harness).poll_once().await.unwrap().unwrap();
    assert!(matches!(outcome, ReprocessOutcome::PermanentFailure { .. }));
    assert!(harness.broker.messages(QUEUE).is_empty());
    assert!(harness.broker.messages(DLQ).is_empty());
    assert_eq!(harness.broker.inner.unacked(DLQ), 0);
    assert_eq!(harness.metrics.reprocessor_permanent_failure.get(), 1);
}

#[tokio::test]
async fn test_malformed_dead_letter_is_dropped() {
    let harness = Harness::new();
    harness
        .broker
        .inner
        .publish(DLQ, b"\xff\xfe garbage".to_vec())
        .await
        .unwrap();

    let outcome = reprocessor(&harness).poll_once().await.unwrap().unwrap();
    assert!(matches!(outcome, ReprocessOutcome::PermanentFailure { .. }));
    assert_eq!(harness.metrics.reprocessor_attempt.get(), 0);
    assert_eq!(harness.metrics.reprocessor_permanent_failure.get(), 1);
    assert_eq!(harness.broker.inner.unacked(DLQ), 0);
}

#[tokio::test]
async fn test_failed_republish_returns_to_dead_letter_queue() {
    let harness = Harness::new();
    harness.broker.fail_publishes(QUEUE, u32::MAX);
    dead_letter(&harness, serde_json::json!({"filename": "a.wav", "text": "t"})).await;

    let outcome = reprocessor(&harness).poll_once().await.unwrap();
    assert_eq!(outcome, Some(ReprocessOutcome::Requeued { attempts: 1 }));
    assert_eq!(harness.metrics.reprocessor_failure.get(), 1);

    let dlq = harness.broker.messages(DLQ);
    assert_eq!(dlq.len(), 1);
    assert_eq!(dlq[0]["retry_attempts"], 1);
}

#[tokio::test]
async fn test_counter_bounds_the_cycle() {
    let harness = Harness::new();
    let reprocessor = reprocessor(&harness);
    dead_letter(&harness, serde_json::json!({"filename": "a.wav", "text": "t"})).await;

    // Simulate a consumer that always fails: move each republish straight back
    let mut republished = 0;
    loop {
        match reprocessor.poll_once().await.unwrap() {
            Some(ReprocessOutcome::Republished { .. }) => {
                republished += 1;
                let delivery = harness.broker.inner.fetch(QUEUE).await.unwrap().unwrap();
                harness.broker.inner.ack(QUEUE, delivery.tag).await.unwrap();
                harness.broker.inner.publish(DLQ, delivery.body).await.unwrap();
            }
            Some(ReprocessOutcome::PermanentFailure { .. }) => break,
            other => panic!("unexpected {:?}", other),
        }
    }
    assert_eq!(republished, 5);
}

#[tokio::test]
async fn test_empty_queue() {
    let harness = Harness::new();
    assert_eq!(reprocessor(&harness).poll_once().await.unwrap(), None);
}

#[tokio::test]
async fn test_rejected_input_is_never_sent_back() {
    let harness = Harness::new();
    let consumer = harness.plain_consumer();
    harness.enqueue(&serde_json::json!({"filename": "a.wav"})).await;
    harness
        .broker
        .inner
        .publish(QUEUE, b"not-json".to_vec())
        .await
        .unwrap();
    consumer.poll_once().await.unwrap();
    consumer.poll_once().await.unwrap();
    assert_eq!(harness.broker.messages(DLQ).len(), 2);

    let reprocessor = reprocessor(&harness);
    for _ in 0..2 {
        let outcome = reprocessor.poll_once().await.unwrap().unwrap();
        assert!(matches!(outcome, ReprocessOutcome::PermanentFailure { .. }));
    }

    assert!(harness.broker.messages(QUEUE).is_empty());
    assert!(harness.broker.messages(DLQ).is_empty());
    assert_eq!(harness.metrics.reprocessor_permanent_failure.get(), 2);
    assert_eq!(harness.metrics.reprocessor_success.get(), 0);
}

#[tokio::test]
async fn test_persistence_failure_is_retried() {
    let harness = Harness::new();
    dead_letter(
        &harness,
        serde_json::json!({"filename": "a.wav", "text": "t", "reason": "persistence_failed"}),
    )
    .await;

    let outcome = reprocessor(&harness).poll_once().await.unwrap();
    assert_eq!(outcome, Some(ReprocessOutcome::Republished { attempts: 1 }));
    assert_eq!(harness.broker.messages(QUEUE).len(), 1);
}
