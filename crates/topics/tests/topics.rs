#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use kora_topics::{
    AdminCall, CreateTopicOptions, MemAdmin, PartitionChange, TopicConverger, TopicError, TopicOutcome, TopicSpec,
};

fn spec(partitions: i32, config: &[(&str, &str)]) -> TopicSpec {
    TopicSpec {
        name: "orders".into(),
        partitions,
        replication_factor: 3,
        config: config.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
    }
}

fn converger(admin: &Arc<MemAdmin>) -> TopicConverger {
    TopicConverger::new(admin.clone())
}

#[tokio::test]
async fn absent_topic_is_created_exactly_once() {
    let admin = Arc::new(MemAdmin::new());
    let topics = converger(&admin);

    assert_eq!(topics.ensure(&spec(6, &[])).await.unwrap(), TopicOutcome::Created);
    assert_eq!(
        admin.calls(),
        vec![AdminCall::CreateTopic(CreateTopicOptions {
            name: "orders".into(),
            partitions: 6,
            replication_factor: 3,
            config: BTreeMap::new(),
        })]
    );
}

#[tokio::test]
async fn equal_partition_count_sends_nothing() {
    let admin = Arc::new(MemAdmin::new().with_topic("orders", 6, 3));
    let topics = converger(&admin);

    let outcome = topics.ensure(&spec(6, &[])).await.unwrap();
    assert!(!outcome.wrote());
    assert!(admin.calls().is_empty());
}

#[tokio::test]
async fn shrink_is_refused_without_writes() {
    let admin = Arc::new(MemAdmin::new().with_topic("orders", 6, 3));
    let topics = converger(&admin);

    let outcome = topics.ensure(&spec(3, &[])).await.unwrap();
    assert_eq!(outcome, TopicOutcome::Converged { partitions_added_to: None, config_altered: false, shrink_refused: true });
    assert!(admin.calls().is_empty());
    assert_eq!(admin.topic("orders").unwrap().partitions, 6);
}

#[tokio::test]
async fn partition_count_only_grows() {
    for observed in 1..=5 {
        for desired in 1..=5 {
            let admin = Arc::new(MemAdmin::new().with_topic("orders", observed, 1));
            let change = converger(&admin).ensure_partition_count("orders", desired).await.unwrap();
            let calls = admin.calls();
            if desired > observed {
                assert_eq!(change, PartitionChange::Grown { from: observed, to: desired });
                assert_eq!(
                    calls,
                    vec![AdminCall::CreatePartitions { topic: "orders".into(), total: desired, assignment: None }]
                );
            } else {
                assert!(calls.is_empty(), "observed={} desired={}", observed, desired);
            }
        }
    }
}

#[tokio::test]
async fn config_is_altered_only_on_difference() {
    let admin = Arc::new(MemAdmin::new().with_topic("orders", 6, 3));
    admin.set_config("orders", "retention.ms", "1000");
    let topics = converger(&admin);
    let desired = spec(6, &[("retention.ms", "604800000"), ("cleanup.policy", "compact")]);

    let first = topics.ensure(&desired).await.unwrap();
    assert_eq!(first, TopicOutcome::Converged { partitions_added_to: None, config_altered: true, shrink_refused: false });
    assert_eq!(admin.calls().len(), 1);
    assert!(matches!(&admin.calls()[0], AdminCall::AlterConfig { config, .. } if config.len() == 2));

    admin.clear_calls();
    assert!(!topics.ensure(&desired).await.unwrap().wrote());
    assert!(admin.calls().is_empty());
}

#[tokio::test]
async fn repeated_ensure_is_idempotent() {
    let admin = Arc::new(MemAdmin::new());
    let topics = converger(&admin);
    let desired = spec(4, &[("min.insync.replicas", "2")]);

    topics.ensure(&desired).await.unwrap();
    admin.clear_calls();
    topics.ensure(&desired).await.unwrap();
    topics.ensure(&desired).await.unwrap();
    assert!(admin.calls().is_empty());
}

#[tokio::test]
async fn observe_maps_unknown_topic() {
    let admin = Arc::new(MemAdmin::new().with_topic("orders", 2, 3));
    let topics = converger(&admin);

    let meta = topics.observe("orders").await.unwrap();
    assert_eq!(meta.partitions.len(), 2);
    assert_eq!(meta.partitions[0].replicas, vec![0, 1, 2]);
    assert_eq!(topics.observe("payments").await.unwrap_err(), TopicError::TopicNotFound("payments".into()));
    assert!(matches!(
        topics.ensure_partition_count("payments", 3).await,
        Err(TopicError::TopicNotFound(_))
    ));
}

#[tokio::test]
async fn remove_is_a_noop_when_absent() {
    let admin = Arc::new(MemAdmin::new().with_topic("orders", 2, 3));
    let topics = converger(&admin);

    assert!(topics.remove("orders").await.unwrap());
    assert!(!topics.remove("orders").await.unwrap());
    assert_eq!(admin.calls(), vec![AdminCall::DeleteTopic("orders".into())]);
    assert!(!topics.exists("orders").await.unwrap());
}

#[tokio::test]
async fn unreachable_and_slow_brokers_are_retryable() {
    let admin = Arc::new(MemAdmin::new());
    admin.set_unreachable(true);
    let err = converger(&admin).ensure(&spec(1, &[])).await.unwrap_err();
    assert!(matches!(err, TopicError::AdminUnavailable { op: "list", .. }));
    assert!(err.is_retryable());

    admin.set_unreachable(false);
    admin.set_latency(Some(Duration::from_millis(200)));
    let err = converger(&admin).with_timeout(Duration::from_millis(20)).ensure(&spec(1, &[])).await.unwrap_err();
    assert!(matches!(err, TopicError::Timeout { .. }));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn broker_rejection_needs_operator() {
    let admin = Arc::new(MemAdmin::new());
    let err = converger(&admin).ensure(&spec(0, &[])).await.unwrap_err();
    assert!(matches!(err, TopicError::Rejected { op: "create", code: 37, .. }));
    assert!(err.needs_operator());
    assert!(admin.calls().is_empty());
}
