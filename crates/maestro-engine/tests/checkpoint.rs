//! Integration tests for checkpoint persistence and recovery.

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

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use maestro_core::{
    AgentId, AgentRecord, AgentStatus, CheckpointConfig, OrchestrationError, StateStoreConfig,
};
use maestro_engine::{
    Autosaver, BudgetCounters, CheckpointManager, EngineEvent, EventChannel, FileLists,
    OrchestrationState, StateStore, TaskLists,
};
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::time::sleep;

fn ids(values: &[&str]) -> Vec<String> {
    values.iter().map(|value| (*value).to_owned()).collect()
}

fn sample_state() -> OrchestrationState {
    OrchestrationState {
        project: json!({"name": "demo", "goal": "ship it"}),
        config: json!({"max_concurrent": 4}),
        tasks: TaskLists {
            completed: ids(&["t1", "t2"]),
            pending: ids(&["t3"]),
            failed: Vec::new(),
        },
        sub_coordinators: vec![
            TaskLists {
                completed: ids(&["t2", "s1"]),
                pending: ids(&["t3", "s2"]),
                failed: ids(&["s3"]),
            },
            TaskLists {
                completed: ids(&["s1", "t1"]),
                pending: Vec::new(),
                failed: ids(&["s3"]),
            },
        ],
        budget: BudgetCounters {
            spent: 1.25,
            limit: Some(10.0),
            tokens_used: 48_000,
            requests: 17,
        },
        files: FileLists {
            modified: vec![PathBuf::from("src/lib.rs")],
            created: vec![PathBuf::from("src/new.rs"), PathBuf::from("tests/new.rs")],
        },
        agents: vec![AgentRecord {
            agent_id: AgentId::from("worker-1"),
            agent_type: "worker".to_owned(),
            status: AgentStatus::Available,
            times_acquired: 3,
            created_at: 1_700_000_000_000,
            last_released_at: Some(1_700_000_050_000),
        }],
    }
}

fn manager_in(tmp: &TempDir) -> CheckpointManager {
    CheckpointManager::new(tmp.path(), &CheckpointConfig::default(), EventChannel::default())
}

#[tokio::test]
async fn test_round_trip_deduplicates_tasks() {
    common::init_tracing();
    let tmp = TempDir::new().expect("create temp dir");
    let manager = manager_in(&tmp);
    let state = sample_state();

    let id = manager.create_checkpoint(&state).await.expect("create");
    assert!(manager.has_checkpoint().await);

    let restored = manager.restore_from_checkpoint().await.expect("restore");
    assert!(restored.should_resume);
    assert_eq!(restored.checkpoint_id, id);
    assert_eq!(restored.tasks.completed, ids(&["t1", "t2", "s1"]));
    assert_eq!(restored.tasks.pending, ids(&["t3", "s2"]));
    assert_eq!(restored.tasks.failed, ids(&["s3"]));
    assert_eq!(restored.budget, state.budget);
    assert_eq!(restored.files, state.files);
    assert_eq!(restored.agents, state.agents);
    assert_eq!(restored.project, state.project);
    assert_eq!(restored.config, state.config);
    assert!(restored.shared_state.is_none());
}

#[tokio::test]
async fn test_layout_and_metadata() {
    let tmp = TempDir::new().expect("create temp dir");
    let manager = manager_in(&tmp);

    let id = manager.create_checkpoint(&sample_state()).await.expect("create");

    let live = tmp.path().join(".maestro/checkpoint.json");
    let archive = tmp.path().join(format!(".maestro/checkpoints/{id}.json"));
    assert!(live.exists());
    assert!(archive.exists());
    assert_eq!(
        fs::read(&live).expect("read live"),
        fs::read(&archive).expect("read archive")
    );

    let metadata = manager
        .get_checkpoint_metadata()
        .await
        .expect("metadata")
        .expect("present");
    assert_eq!(metadata.id, id);
    assert_eq!(metadata.version, 1);
    assert_eq!((metadata.completed, metadata.pending, metadata.failed), (3, 2, 1));
}

#[tokio::test]
async fn test_clear_keeps_history_and_is_idempotent() {
    let tmp = TempDir::new().expect("create temp dir");
    let (events, mut receiver) = EventChannel::new();
    let manager = CheckpointManager::new(tmp.path(), &CheckpointConfig::default(), events);

    manager.create_checkpoint(&sample_state()).await.expect("create");
    assert!(manager.clear_checkpoint().await.expect("clear"));
    assert!(!manager.clear_checkpoint().await.expect("clear again"));
    assert!(!manager.has_checkpoint().await);
    assert!(manager.load_latest_checkpoint().await.expect("load").is_none());
    assert_eq!(manager.get_history(10).await.expect("history").len(), 1);

    assert!(matches!(
        receiver.try_recv(),
        Ok(EngineEvent::CheckpointCreated { .. })
    ));
    assert!(matches!(receiver.try_recv(), Ok(EngineEvent::CheckpointCleared)));
}

#[tokio::test]
async fn test_history_newest_first() {
    let tmp = TempDir::new().expect("create temp dir");
    let manager = manager_in(&tmp);

    let mut created = Vec::new();
    for spent in [1.0, 2.0, 3.0] {
        let mut state = sample_state();
        state.budget.spent = spent;
        created.push(manager.create_checkpoint(&state).await.expect("create"));
        sleep(Duration::from_millis(5)).await;
    }

    let history = manager.get_history(2).await.expect("history");
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].id, created[2]);
    assert_eq!(history[1].id, created[1]);
    assert!((history[0].spent - 3.0).abs() < f64::EPSILON);
}

#[tokio::test]
async fn test_budget_floats_survive_exactly() {
    let tmp = TempDir::new().expect("create temp dir");
    let manager = manager_in(&tmp);
    let awkward = [
        4.055_474_706_295_447e-187,
        0.1 + 0.2,
        f64::MIN_POSITIVE,
        f64::MAX,
        5e-324,
        1.000_000_000_000_000_2,
    ];

    for value in awkward {
        let mut state = sample_state();
        state.budget.spent = value;
        state.budget.limit = Some(value / 3.0);
        manager.create_checkpoint(&state).await.expect("create");

        let restored = manager.restore_from_checkpoint().await.expect("restore");
        assert_eq!(restored.budget.spent.to_bits(), value.to_bits());
        assert_eq!(
            restored.budget.limit.map(f64::to_bits),
            Some((value / 3.0).to_bits())
        );
    }
}

#[tokio::test]
async fn test_invalid_live_checkpoint_is_a_state_error() {
    let tmp = TempDir::new().expect("create temp dir");
    let manager = manager_in(&tmp);
    manager.create_checkpoint(&sample_state()).await.expect("create");

    let live = manager.live_path().to_path_buf();
    let mut document: Value =
        serde_json::from_slice(&fs::read(&live).expect("read")).expect("parse");
    document["tasks"]["pending"] = json!("t3");
    fs::write(&live, document.to_string()).expect("corrupt");

    assert!(matches!(
        manager.load_latest_checkpoint().await,
        Err(OrchestrationError::State(_))
    ));
    assert!(matches!(
        manager.restore_from_checkpoint().await,
        Err(OrchestrationError::State(_))
    ));
}

#[tokio::test]
async fn test_checkpoint_captures_store_entries() {
    let tmp = TempDir::new().expect("create temp dir");
    let manager = manager_in(&tmp);
    let store = StateStore::spawn(&StateStoreConfig::default(), EventChannel::default());
    let coordinator = AgentId::from("coordinator");

    store.write("budget", json!(10), &coordinator, None).await.expect("write");
    store.write("budget", json!(12), &coordinator, Some(1)).await.expect("write");
    store.write("phase", json!("review"), &AgentId::from("w1"), None).await.expect("write");

    manager
        .create_checkpoint_with_store(&sample_state(), &store, &coordinator)
        .await
        .expect("create");
    let restored = manager.restore_from_checkpoint().await.expect("restore");
    let shared = restored.shared_state.expect("shared state captured");

    assert_eq!(shared.len(), 2);
    let budget = shared.get("budget").expect("budget entry");
    assert_eq!(budget.value, json!(12));
    assert_eq!(budget.version, 2);
    assert_eq!(
        shared.get("phase").map(|entry| entry.last_modified_by.clone()),
        Some(AgentId::from("w1"))
    );
}

#[tokio::test(start_paused = true)]
async fn test_autosaver_snapshots_periodically() {
    let tmp = TempDir::new().expect("create temp dir");
    let manager = Arc::new(manager_in(&tmp));

    let autosaver = Autosaver::start(
        Arc::clone(&manager),
        Duration::from_secs(300),
        sample_state,
    );
    assert!(!manager.has_checkpoint().await);

    let mut saved = false;
    for _ in 0..50 {
        sleep(Duration::from_secs(301)).await;
        if manager.has_checkpoint().await {
            saved = true;
            break;
        }
    }
    autosaver.stop();
    assert!(saved);
}
