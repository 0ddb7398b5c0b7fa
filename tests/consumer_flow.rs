//! Consumer Integration Tests
//!
//! End-to-end handling of main-queue messages: dead-letter routing, delivery,
//! and reinjection of delivery-only retries through the reprocessor.

mod common;

use std::sync::Arc;

use common::{guarded, FailingSink, Harness, RecordingSink, SwitchSink, DLQ, QUEUE};
use scribeflow::core::{
    DeadLetterReprocessor, DeliveryOutcome, DownstreamDelivery, IdempotencySettings, Outcome,
    ReprocessOutcome, ReprocessorSettings,
};
use scribeflow::domain::DeadLetterReason;
use scribeflow::ingest::Broker;

fn instant_reprocessor(harness: &Harness) -> DeadLetterReprocessor {
    DeadLetterReprocessor::new(
        harness.broker.clone(),
        QUEUE,
        ReprocessorSettings {
            backoff_base_seconds: 0.0,
            ..Default::default()
        },
        harness.metrics.clone(),
    )
}

#[tokio::test]
async fn test_invalid_json_is_dead_lettered_and_acked() {
    let harness = Harness::new();
    let consumer = harness.plain_consumer();
    harness
        .broker
        .inner
        .publish(QUEUE, b"not json {".to_vec())
        .await
        .unwrap();

    let outcome = consumer.poll_once().await.unwrap().unwrap();
    assert_eq!(
        outcome,
        Outcome::DeadLettered {
            reason: DeadLetterReason::InvalidJson,
            record_id: None
        }
    );

    let dead = harness.broker.messages(DLQ);
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0]["raw_body"], "not json {");
    assert_eq!(dead[0]["reason"], "invalid_json");
    assert_eq!(harness.broker.inner.unacked(QUEUE), 0);
    assert_eq!(harness.metrics.consumer_dlq.get(), 1);
}

#[tokio::test]
async fn test_missing_fields_are_dead_lettered() {
    let harness = Harness::new();
    let consumer = harness.plain_consumer();
    harness.enqueue(&serde_json::json!({"filename": "visit.wav"})).await;

    let outcome = consumer.poll_once().await.unwrap().unwrap();
    assert!(matches!(
        outcome,
        Outcome::DeadLettered {
            reason: DeadLetterReason::MissingFields,
            ..
        }
    ));

    let dead = harness.broker.messages(DLQ);
    assert_eq!(dead[0]["filename"], "visit.wav");
    assert_eq!(dead[0]["reason"], "missing_fields");
    assert_eq!(harness.records.count().unwrap(), 0);
}

#[tokio::test]
async fn test_persisted_without_downstream() {
    let harness = Harness::new();
    let consumer = harness.plain_consumer();
    harness
        .enqueue(&serde_json::json!({
            "filename": "visit.wav",
            "text": "Takes metformin. Has diabetes. Follow up in two weeks.",
            "publish_time": 1.0
        }))
        .await;

    let outcome = consumer.poll_once().await.unwrap().unwrap();
    let Outcome::Persisted { id, delivery } = outcome else {
        panic!("expected persisted, got {:?}", outcome);
    };
    assert_eq!(delivery, DeliveryOutcome::NotConfigured);

    let record = harness.store.get_transcript(id).unwrap().unwrap();
    assert_eq!(record.summary.as_deref(), Some("Takes metformin. Has diabetes."));
    let enrichment = record.enrichment.unwrap();
    assert_eq!(enrichment["medications"], serde_json::json!(["metformin"]));
    assert_eq!(enrichment["problems"], serde_json::json!(["diabetes"]));
    assert!(harness.metrics.e2e_latency_ms_last.get() > 0);
}

#[tokio::test]
async fn test_delivered_document_and_id_recorded() {
    let harness = Harness::new();
    let sink = Arc::new(RecordingSink::new("clinical", Some("doc-17")));
    let delivery = DownstreamDelivery::new(
        Some(guarded("clinical", sink.clone(), 5, 3)),
        None,
        harness.metrics.clone(),
    );
    let consumer = harness.consumer(harness.gate(IdempotencySettings::default()), delivery);
    harness
        .enqueue(&serde_json::json!({"filename": "visit.wav", "text": "Uses aspirin."}))
        .await;

    let Some(Outcome::Persisted { id, .. }) = consumer.poll_once().await.unwrap() else {
        panic!("expected persisted");
    };

    let delivered = sink.delivered.lock().unwrap().clone();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].filename, "visit.wav");
    assert!(delivered[0].body.starts_with("Uses aspirin."));
    assert!(delivered[0].body.contains("\n\nSUMMARY:\n"));
    assert!(delivered[0].body.contains("\n\nENRICHMENT:\n"));

    let record = harness.store.get_transcript(id).unwrap().unwrap();
    assert_eq!(record.downstream_document_id.as_deref(), Some("doc-17"));
    assert_eq!(harness.metrics.delivery_clinical_success.get(), 1);
}

#[tokio::test]
async fn test_downstream_failure_retries_delivery_only() {
    let harness = Harness::new();
    let sink = Arc::new(SwitchSink::broken("doc-9"));
    let delivery = DownstreamDelivery::new(
        Some(guarded("clinical", sink.clone(), 10, 2)),
        None,
        harness.metrics.clone(),
    );
    let consumer = harness.consumer(harness.gate(IdempotencySettings::default()), delivery);
    harness
        .enqueue(&serde_json::json!({"filename": "visit.wav", "text": "hello there"}))
        .await;

    let outcome = consumer.poll_once().await.unwrap().unwrap();
    let Outcome::DeadLettered {
        reason: DeadLetterReason::DownstreamFailed,
        record_id: Some(id),
    } = outcome
    else {
        panic!("expected downstream dead letter, got {:?}", outcome);
    };
    assert_eq!(harness.records.count().unwrap(), 1);
    assert_eq!(harness.broker.messages(DLQ)[0]["record_id"], id);

    // Reinject; the gate must not suppress it and no second row is written
    sink.heal();
    let reprocessor = instant_reprocessor(&harness);
    assert_eq!(
        reprocessor.poll_once().await.unwrap(),
        Some(ReprocessOutcome::Republished { attempts: 1 })
    );

    let outcome = consumer.poll_once().await.unwrap().unwrap();
    assert!(matches!(outcome, Outcome::Redelivered { id: rid, .. } if rid == id));
    assert_eq!(harness.records.count().unwrap(), 1);
    assert_eq!(sink.inner.count(), 1);

    let record = harness.store.get_transcript(id).unwrap().unwrap();
    assert_eq!(record.downstream_document_id.as_deref(), Some("doc-9"));
}

#[tokio::test]
async fn test_redelivery_for_missing_record_is_dropped() {
    let harness = Harness::new();
    let consumer = harness.plain_consumer();
    harness
        .enqueue(&serde_json::json!({"filename": "visit.wav", "text": "hello", "record_id": 404}))
        .await;

    let outcome = consumer.poll_once().await.unwrap().unwrap();
    assert!(matches!(outcome, Outcome::Dropped { .. }));
    assert!(harness.broker.messages(DLQ).is_empty());
    assert_eq!(harness.broker.inner.unacked(QUEUE), 0);
}

#[tokio::test]
async fn test_unacked_delivery_is_redelivered_after_recover() {
    let harness = Harness::new();
    harness
        .enqueue(&serde_json::json!({"filename": "visit.wav", "text": "hello"}))
        .await;

    // Crash before ack
    let first = harness.broker.inner.fetch(QUEUE).await.unwrap().unwrap();
    assert!(!first.redelivered);
    assert_eq!(harness.broker.inner.recover(QUEUE).await.unwrap(), 1);

    let consumer = harness.plain_consumer();
    let outcome = consumer.poll_once().await.unwrap().unwrap();
    assert!(matches!(outcome, Outcome::Persisted { .. }));
    assert_eq!(harness.records.count().unwrap(), 1);
}

#[tokio::test]
async fn test_dead_letter_outage_requeues_instead_of_dropping() {
    let harness = Harness::new();
    let consumer = harness.plain_consumer();
    harness.broker.fail_publishes(DLQ, u32::MAX);
    harness.enqueue(&serde_json::json!({"filename": "a.wav"})).await;

    let outcome = consumer.poll_once().await.unwrap().unwrap();
    assert_eq!(
        outcome,
        Outcome::Requeued {
            reason: DeadLetterReason::MissingFields
        }
    );
    assert_eq!(harness.metrics.consumer_dlq_publish_failed.get(), 1);
    assert_eq!(harness.metrics.consumer_dlq.get(), 0);
    assert_eq!(harness.broker.inner.unacked(QUEUE), 0);
    assert_eq!(harness.broker.messages(QUEUE).len(), 1);

    harness.broker.heal();
    let outcome = consumer.poll_once().await.unwrap().unwrap();
    assert!(matches!(outcome, Outcome::DeadLettered { .. }));
    assert_eq!(harness.broker.messages(DLQ).len(), 1);
    assert!(harness.broker.messages(QUEUE).is_empty());
}

#[tokio::test]
async fn test_dead_letter_outage_after_persist_queues_stamped_retry() {
    let harness = Harness::new();
    let delivery = DownstreamDelivery::new(
        Some(guarded("clinical", Arc::new(FailingSink::new("clinical")), 10, 1)),
        None,
        harness.metrics.clone(),
    );
    let consumer = harness.consumer(harness.gate(IdempotencySettings::default()), delivery);
    harness.broker.fail_publishes(DLQ, u32::MAX);
    harness
        .enqueue(&serde_json::json!({"filename": "visit.wav", "text": "hello"}))
        .await;

    let outcome = consumer.poll_once().await.unwrap().unwrap();
    let Outcome::RetryQueued { record_id } = outcome else {
        panic!("expected a queued retry, got {:?}", outcome);
    };

    let main = harness.broker.messages(QUEUE);
    assert_eq!(main.len(), 1);
    assert_eq!(main[0]["record_id"], record_id);
    assert_eq!(main[0]["reason"], "downstream_failed");
    assert_eq!(harness.broker.inner.unacked(QUEUE), 0);
    assert_eq!(harness.records.count().unwrap(), 1);
}
