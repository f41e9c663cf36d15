//! Integration tests for the shared state store.
//!
//! Covers optimistic concurrency, queue ordering, strong reads, and pub/sub delivery.

#![cfg_attr(
    test,
    allow(
        clippy::expect_used,
        clippy::unwrap_used,
        clippy::panic,
        clippy::missing_panics_doc,
        clippy::tests_outside_test_module,
        clippy::assertions_on_result_states,
        reason = "Test allows"
    )
)]

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use maestro_core::{AgentId, OrchestrationError, StateStoreConfig};
use maestro_engine::{
    Consistency, EngineEvent, EventChannel, KeyPattern, StateChange, StateStore,
};
use serde_json::json;

fn spawn_store() -> StateStore {
    StateStore::spawn(&StateStoreConfig::default(), EventChannel::default())
}

#[tokio::test]
async fn test_budget_scenario() {
    common::init_tracing();
    let store = spawn_store();
    let coordinator = AgentId::from("coordinator");

    let first = store
        .write("budget", json!(10), &coordinator, None)
        .await
        .expect("initial write");
    assert_eq!(first.version, 1);

    let second = store
        .write("budget", json!(12), &coordinator, Some(1))
        .await
        .expect("versioned write");
    assert_eq!(second.version, 2);

    let stale = store.write("budget", json!(99), &coordinator, Some(1)).await;
    let error = stale.expect_err("stale write must fail");
    assert!(error.is_retryable());
    assert!(matches!(error, OrchestrationError::Concurrency { .. }));

    let current = store
        .read_detailed("budget", &coordinator, Consistency::Strong)
        .await;
    assert_eq!(current.value, Some(json!(12)));
    assert_eq!(current.version, Some(2));
}

#[tokio::test]
async fn test_retry_with_fresh_read_succeeds() {
    let store = spawn_store();
    let agent_a = AgentId::from("a");
    let agent_b = AgentId::from("b");

    store.write("plan", json!("v1"), &agent_a, None).await.expect("seed");
    let seen_by_a = store
        .read_detailed("plan", &agent_a, Consistency::Eventual)
        .await;
    let seen_by_b = store
        .read_detailed("plan", &agent_b, Consistency::Eventual)
        .await;

    store
        .write("plan", json!("b's plan"), &agent_b, seen_by_b.version)
        .await
        .expect("b wins the race");
    assert!(
        store
            .write("plan", json!("a's plan"), &agent_a, seen_by_a.version)
            .await
            .is_err()
    );

    let fresh = store
        .read_detailed("plan", &agent_a, Consistency::Eventual)
        .await;
    let receipt = store
        .write("plan", json!("a's plan"), &agent_a, fresh.version)
        .await
        .expect("retry after fresh read");
    assert_eq!(receipt.version, 3);
}

#[tokio::test]
async fn test_concurrent_writers_get_distinct_versions() {
    let store = spawn_store();
    let mut handles = Vec::new();

    for worker in 0..8 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            let agent = AgentId::new(format!("worker-{worker}"));
            let mut versions = Vec::new();
            for step in 0..10 {
                let receipt = store
                    .write("counter", json!(step), &agent, None)
                    .await
                    .expect("write");
                versions.push(receipt.version);
            }
            versions
        }));
    }

    let mut all_versions = Vec::new();
    for handle in handles {
        let versions = handle.await.expect("join");
        assert!(versions.windows(2).all(|pair| pair[0] < pair[1]));
        all_versions.extend(versions);
    }
    all_versions.sort_unstable();
    assert_eq!(all_versions, (1..=80).collect::<Vec<u64>>());

    let view = store
        .consistent_view(&AgentId::from("auditor"))
        .await
        .expect("view");
    assert_eq!(view.entries.get("counter").map(|entry| entry.version), Some(80));
    let total: u64 = view.clock.iter().map(|(_, count)| count).sum();
    assert_eq!(total, 80);
}

#[tokio::test]
async fn test_prefix_subscription_excludes_writer() {
    let store = spawn_store();
    let agent_a = AgentId::from("A");
    let agent_b = AgentId::from("B");
    let delivered: Arc<Mutex<Vec<(String, AgentId)>>> = Arc::default();

    let sink = Arc::clone(&delivered);
    store.subscribe(
        "spec:*",
        move |change: &StateChange| {
            sink.lock()
                .unwrap()
                .push((change.key.clone(), change.agent_id.clone()));
            Ok(())
        },
        &agent_b,
    );

    store.write("spec:1", json!({"title": "draft"}), &agent_a, None).await.expect("a writes");
    store.write("spec:1", json!({"title": "final"}), &agent_b, None).await.expect("b writes");
    store.consistent_view(&agent_b).await.expect("barrier");

    let delivered = delivered.lock().unwrap().clone();
    assert_eq!(delivered, vec![("spec:1".to_owned(), agent_a)]);
}

#[tokio::test]
async fn test_regex_subscription() {
    let store = spawn_store();
    let writer = AgentId::from("writer");
    let count: Arc<AtomicUsize> = Arc::default();

    let counter = Arc::clone(&count);
    let pattern = KeyPattern::regex(r"^task:\d+:status$").expect("valid regex");
    store.subscribe(
        pattern,
        move |_change: &StateChange| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        },
        &AgentId::from("listener"),
    );

    for key in ["task:1:status", "task:x:status", "task:22:status", "task:3:owner"] {
        store.write(key, json!("done"), &writer, None).await.expect("write");
    }
    store.consistent_view(&writer).await.expect("barrier");

    assert_eq!(count.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_subscriber_failure_does_not_affect_write() {
    let (events, mut receiver) = EventChannel::new();
    let store = StateStore::spawn(&StateStoreConfig::default(), events);
    let writer = AgentId::from("writer");

    store.subscribe(
        "k",
        |_change: &StateChange| Err(OrchestrationError::Other("listener down".to_owned())),
        &AgentId::from("listener"),
    );

    let receipt = store.write("k", json!(1), &writer, None).await.expect("write");
    assert_eq!(receipt.version, 1);
    assert_eq!(
        store.read("k", &writer, Consistency::Strong).await,
        Some(json!(1))
    );

    let event = receiver.recv().await.expect("event");
    assert!(matches!(
        event,
        EngineEvent::SubscriberFailed { ref key, ref error, .. }
            if key == "k" && error.contains("listener down")
    ));
}

#[tokio::test]
async fn test_store_lives_while_any_handle_exists() {
    let store = spawn_store();
    let agent = AgentId::from("a");
    store.write("k", json!(1), &agent, None).await.expect("write");

    let stale_handle = store.clone();
    drop(store);
    assert_eq!(
        stale_handle.read("k", &agent, Consistency::Eventual).await,
        Some(json!(1))
    );
}
