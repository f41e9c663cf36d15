//! Integration tests for the agent pool.
//!
//! Tests the per-type bound, reuse after release, waiting, and eviction.

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

use std::future::{Ready, ready};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use maestro_core::{AgentId, OrchestrationError, PoolConfig, Result};
use maestro_engine::{AgentPool, EngineEvent, EventChannel, ReleaseOptions};
use tokio::sync::oneshot;
use tokio::task::yield_now;
use tokio::time::{sleep, timeout};

#[derive(Debug)]
struct Worker {
    agent_id: AgentId,
}

fn pool_config(max_per_type: usize) -> PoolConfig {
    PoolConfig {
        max_per_type,
        acquire_timeout_ms: 5_000,
        ..PoolConfig::default()
    }
}

fn counting_factory(
    built: &Arc<AtomicUsize>,
) -> impl Fn(AgentId) -> Ready<Result<Worker>> + use<> {
    let built = Arc::clone(built);
    move |id| {
        built.fetch_add(1, Ordering::SeqCst);
        ready(Ok(Worker { agent_id: id }))
    }
}

#[tokio::test]
async fn test_third_acquire_waits_for_release_and_reuses() {
    common::init_tracing();
    let pool = Arc::new(AgentPool::new(pool_config(2), EventChannel::default()));
    let built = Arc::new(AtomicUsize::new(0));

    let first = pool
        .acquire("worker", counting_factory(&built))
        .await
        .expect("first");
    let second = pool
        .acquire("worker", counting_factory(&built))
        .await
        .expect("second");
    assert_ne!(first.id(), second.id());

    let (started_tx, started_rx) = oneshot::channel();
    let waiter_pool = Arc::clone(&pool);
    let waiter_built = Arc::clone(&built);
    let waiter = tokio::spawn(async move {
        started_tx.send(()).expect("signal start");
        waiter_pool
            .acquire("worker", counting_factory(&waiter_built))
            .await
    });
    started_rx.await.expect("waiter started");
    sleep(Duration::from_millis(50)).await;
    assert!(!waiter.is_finished());

    let released_id = first.id().clone();
    assert!(pool.release(first, ReleaseOptions::default()));

    let third = timeout(Duration::from_secs(2), waiter)
        .await
        .expect("waiter resolved")
        .expect("join")
        .expect("acquire");
    assert_eq!(third.id(), &released_id);
    assert_eq!(third.agent_id, released_id);
    assert_eq!(built.load(Ordering::SeqCst), 2);

    let stats = pool.stats();
    let worker = stats.by_type.get("worker").copied().expect("worker stats");
    assert_eq!(worker.busy, 2);
    assert_eq!(worker.available, 0);
    assert_eq!(worker.created, 2);
    assert_eq!(stats.reused, 1);
    assert_eq!(stats.acquired, 3);
}

#[tokio::test]
async fn test_bound_holds_under_contention() {
    let pool = Arc::new(AgentPool::new(pool_config(3), EventChannel::default()));
    let built = Arc::new(AtomicUsize::new(0));
    let mut tasks = Vec::new();

    for _ in 0..12 {
        let pool = Arc::clone(&pool);
        let built = Arc::clone(&built);
        tasks.push(tokio::spawn(async move {
            for _ in 0..5 {
                let agent = pool
                    .acquire("worker", counting_factory(&built))
                    .await
                    .expect("acquire");
                let stats = pool.stats();
                let live = stats.by_type.get("worker").map_or(0, |stats| stats.created);
                assert!(live <= 3, "live agents {live} exceed the bound");
                yield_now().await;
                pool.release(agent, ReleaseOptions::default());
            }
        }));
    }
    for task in tasks {
        task.await.expect("join");
    }

    assert!(built.load(Ordering::SeqCst) <= 3);
    let stats = pool.stats();
    assert_eq!(stats.acquired, 60);
    assert!(stats.efficiency > 0.9);
}

#[tokio::test]
async fn test_types_are_bounded_independently() {
    let pool = AgentPool::new(pool_config(1), EventChannel::default());
    let built = Arc::new(AtomicUsize::new(0));

    let _worker = pool
        .acquire("worker", counting_factory(&built))
        .await
        .expect("worker");
    let _reviewer = pool
        .acquire("reviewer", counting_factory(&built))
        .await
        .expect("reviewer");
    assert_eq!(pool.roster().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_reports_wait() {
    let config = PoolConfig {
        max_per_type: 1,
        acquire_timeout_ms: 30_000,
        ..PoolConfig::default()
    };
    let pool = AgentPool::new(config, EventChannel::default());
    let built = Arc::new(AtomicUsize::new(0));
    let _held = pool
        .acquire("worker", counting_factory(&built))
        .await
        .expect("held");

    let error = pool
        .acquire("worker", counting_factory(&built))
        .await
        .expect_err("must time out");
    assert!(error.is_retryable());
    assert!(matches!(
        error,
        OrchestrationError::PoolTimeout { waited_ms, .. } if waited_ms >= 30_000
    ));
}

#[tokio::test]
async fn test_lifecycle_events() {
    let (events, mut receiver) = EventChannel::new();
    let config = PoolConfig {
        idle_timeout_ms: 20,
        eviction_interval_ms: 10,
        ..pool_config(2)
    };
    let pool = AgentPool::new(config, events);
    let built = Arc::new(AtomicUsize::new(0));
    pool.start_eviction();

    let agent = pool
        .acquire("worker", counting_factory(&built))
        .await
        .expect("create");
    pool.release(agent, ReleaseOptions::default());
    let agent = pool
        .acquire("worker", counting_factory(&built))
        .await
        .expect("reuse");
    pool.release(agent, ReleaseOptions::failed("tool crashed"));
    let agent = pool
        .acquire("worker", counting_factory(&built))
        .await
        .expect("recreate");
    pool.release(agent, ReleaseOptions::default());

    let mut evicted = false;
    let mut seen = Vec::new();
    while !evicted {
        let event = timeout(Duration::from_secs(2), receiver.recv())
            .await
            .expect("event before timeout")
            .expect("channel open");
        evicted = matches!(event, EngineEvent::AgentEvicted { .. });
        seen.push(event);
    }

    let kinds: Vec<&str> = seen
        .iter()
        .map(|event| match event {
            EngineEvent::AgentCreated { .. } => "created",
            EngineEvent::AgentReused { .. } => "reused",
            EngineEvent::AgentReleased { .. } => "released",
            EngineEvent::AgentDestroyed { .. } => "destroyed",
            EngineEvent::AgentEvicted { .. } => "evicted",
            _ => "other",
        })
        .collect();
    assert_eq!(
        kinds,
        vec!["created", "released", "reused", "destroyed", "created", "released", "evicted"]
    );
    assert!(matches!(
        seen.get(3),
        Some(EngineEvent::AgentDestroyed { reason: Some(reason), .. }) if reason == "tool crashed"
    ));
    assert_eq!(pool.stats().by_type.get("worker").map(|stats| stats.created), Some(0));

    pool.shutdown();
}
