//! End-to-end crash recovery through `OrchestrationEngine`.

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

use std::path::Path;
use std::time::Duration;

use maestro_core::{
    AgentId, AgentStatus, OrchestrationConfig, OrchestrationError, PoolConfig, Result,
};
use maestro_engine::{
    Consistency, OrchestrationEngine, OrchestrationState, ReleaseOptions, TaskLists,
};
use serde_json::json;
use tempfile::TempDir;
use tokio::time::sleep;

struct Worker;

async fn make_worker(_id: AgentId) -> Result<Worker> {
    Ok(Worker)
}

fn engine_at(root: &Path) -> OrchestrationEngine<Worker> {
    OrchestrationEngine::new(OrchestrationConfig::default(), root.to_path_buf())
        .expect("engine")
}

fn run_state() -> OrchestrationState {
    OrchestrationState {
        project: json!({"name": "demo"}),
        tasks: TaskLists {
            completed: vec!["plan".to_owned()],
            pending: vec!["build".to_owned(), "test".to_owned()],
            failed: Vec::new(),
        },
        ..OrchestrationState::default()
    }
}

#[tokio::test]
async fn test_checkpoint_then_resume_in_fresh_engine() {
    common::init_tracing();
    let tmp = TempDir::new().expect("create temp dir");
    let coordinator = AgentId::from("coordinator");

    {
        let engine = engine_at(tmp.path());
        let agent = engine
            .pool()
            .acquire("builder", make_worker)
            .await
            .expect("acquire");
        engine.pool().release(agent, ReleaseOptions::default());

        engine
            .state()
            .write("phase", json!("build"), &coordinator, None)
            .await
            .expect("write phase");
        engine
            .state()
            .write("phase", json!("test"), &coordinator, Some(1))
            .await
            .expect("advance phase");

        engine.checkpoint(run_state()).await.expect("checkpoint");
    }

    let engine = engine_at(tmp.path());
    let restored = engine.resume().await.expect("resume").expect("checkpoint found");
    assert!(restored.should_resume);
    assert_eq!(restored.tasks.pending, vec!["build".to_owned(), "test".to_owned()]);
    assert_eq!(restored.agents.len(), 1);
    let record = restored.agents.first().expect("roster entry");
    assert_eq!(record.agent_type, "builder");
    assert_eq!(record.status, AgentStatus::Available);
    assert_eq!(record.times_acquired, 1);

    let phase = engine
        .state()
        .read_detailed("phase", &coordinator, Consistency::Strong)
        .await;
    assert_eq!(phase.value, Some(json!("test")));
    assert_eq!(phase.version, Some(1));

    assert!(engine.finish_successfully().await.expect("finish"));
    assert!(engine.resume().await.expect("resume after finish").is_none());
}

#[tokio::test(start_paused = true)]
async fn test_autosave_tick_captures_store_entries() {
    let tmp = TempDir::new().expect("create temp dir");
    let coordinator = AgentId::from("coordinator");

    {
        let engine = engine_at(tmp.path());
        engine
            .state()
            .write("phase", json!("build"), &coordinator, None)
            .await
            .expect("write phase");
        assert!(engine.start_autosave(run_state));

        let mut saved = false;
        for _ in 0..50 {
            sleep(Duration::from_secs(301)).await;
            if engine.checkpoints().has_checkpoint().await {
                saved = true;
                break;
            }
        }
        assert!(saved);
    }

    let engine = engine_at(tmp.path());
    let restored = engine.resume().await.expect("resume").expect("checkpoint found");
    let shared = restored.shared_state.expect("autosave captured the store");
    assert_eq!(shared.get("phase").map(|entry| entry.value.clone()), Some(json!("build")));
    assert_eq!(
        engine
            .state()
            .read("phase", &coordinator, Consistency::Strong)
            .await,
        Some(json!("build"))
    );
}

#[tokio::test]
async fn test_resume_without_checkpoint_is_none() {
    let tmp = TempDir::new().expect("create temp dir");
    let engine = engine_at(tmp.path());

    assert!(engine.resume().await.expect("resume").is_none());
    assert!(!engine.finish_successfully().await.expect("finish"));
}

#[tokio::test]
async fn test_shutdown_writes_final_checkpoint() {
    let tmp = TempDir::new().expect("create temp dir");
    let engine = engine_at(tmp.path());
    assert!(engine.start_autosave(run_state));

    let id = engine.shutdown(run_state()).await.expect("shutdown");
    let metadata = engine
        .checkpoints()
        .get_checkpoint_metadata()
        .await
        .expect("metadata")
        .expect("present");
    assert_eq!(metadata.id, id);
    assert_eq!(metadata.completed, 1);
}

#[tokio::test]
async fn test_invalid_config_is_rejected() {
    let tmp = TempDir::new().expect("create temp dir");
    let config = OrchestrationConfig {
        pool: PoolConfig {
            max_per_type: 0,
            ..PoolConfig::default()
        },
        ..OrchestrationConfig::default()
    };

    let built = OrchestrationEngine::<Worker>::new(config, tmp.path().to_path_buf());
    assert!(matches!(built, Err(OrchestrationError::Config(_))));
}

#[tokio::test]
async fn test_autosave_disabled_at_zero_interval() {
    let tmp = TempDir::new().expect("create temp dir");
    let mut config = OrchestrationConfig::default();
    config.checkpoint.autosave_interval_seconds = 0;

    let engine: OrchestrationEngine<Worker> =
        OrchestrationEngine::new(config, tmp.path().to_path_buf()).expect("engine");
    assert!(!engine.start_autosave(OrchestrationState::default));
}
