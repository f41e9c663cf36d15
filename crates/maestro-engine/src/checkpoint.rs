//! Durable orchestration snapshots for crash recovery.
//!
//! The live checkpoint sits at `<root>/<control_dir>/<file_name>`; every
//! checkpoint is also archived, immutably, as `<history_dir>/<id>.json`.

use std::collections::{BTreeMap, HashSet};
use std::io::ErrorKind;
use std::iter;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use maestro_core::{
    AgentId, AgentRecord, CheckpointConfig, CheckpointId, OrchestrationError, Result,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::fs as tfs;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::events::{EngineEvent, EventChannel};
use crate::state::{EntryView, StateStore};

/// Checkpoint format version written and accepted.
pub const CHECKPOINT_VERSION: u32 = 1;

/// Task identifiers by outcome.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskLists {
    /// Finished successfully
    pub completed: Vec<String>,
    /// Not started or in progress
    pub pending: Vec<String>,
    /// Finished unsuccessfully
    pub failed: Vec<String>,
}

impl TaskLists {
    /// Union of `lists`, each list deduplicated in first-seen order.
    pub fn merged<'lists>(lists: impl IntoIterator<Item = &'lists Self>) -> Self {
        let mut merged = Self::default();
        let mut seen: [HashSet<String>; 3] = Default::default();
        let [seen_completed, seen_pending, seen_failed] = &mut seen;

        for list in lists {
            extend_unique(&mut merged.completed, seen_completed, &list.completed);
            extend_unique(&mut merged.pending, seen_pending, &list.pending);
            extend_unique(&mut merged.failed, seen_failed, &list.failed);
        }
        merged
    }
}

fn extend_unique(target: &mut Vec<String>, seen: &mut HashSet<String>, source: &[String]) {
    for task_id in source {
        if seen.insert(task_id.clone()) {
            target.push(task_id.clone());
        }
    }
}

/// Spending and usage counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BudgetCounters {
    /// Amount spent so far
    pub spent: f64,
    /// Spending limit, if any
    pub limit: Option<f64>,
    /// Tokens consumed
    pub tokens_used: u64,
    /// Backend requests made
    pub requests: u64,
}

/// Files the run has touched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileLists {
    /// Existing files that were changed
    pub modified: Vec<PathBuf>,
    /// Files that were created
    pub created: Vec<PathBuf>,
}

/// Orchestration state handed to [`CheckpointManager::create_checkpoint`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrchestrationState {
    /// Project description
    pub project: Value,
    /// Run configuration
    pub config: Value,
    /// The top-level coordinator's tasks
    pub tasks: TaskLists,
    /// Tasks of nested coordinators; may repeat top-level ids
    pub sub_coordinators: Vec<TaskLists>,
    /// Budget counters
    pub budget: BudgetCounters,
    /// Touched files
    pub files: FileLists,
    /// Live agents
    pub agents: Vec<AgentRecord>,
}

/// On-disk checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Identifier, also the archive file stem
    pub id: CheckpointId,
    /// Creation time
    pub timestamp: DateTime<Utc>,
    /// Format version
    pub version: u32,
    /// Project description
    pub project: Value,
    /// Run configuration
    pub config: Value,
    /// Deduplicated task lists across all coordinators
    pub tasks: TaskLists,
    /// Budget counters
    pub budget: BudgetCounters,
    /// Touched files
    pub files: FileLists,
    /// Live agents
    pub agents: Vec<AgentRecord>,
    /// State store entries, if the checkpoint captured them
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shared_state: Option<BTreeMap<String, EntryView>>,
}

/// Summary of a checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    /// Identifier
    pub id: CheckpointId,
    /// Creation time
    pub timestamp: DateTime<Utc>,
    /// Format version
    pub version: u32,
    /// Completed task count
    pub completed: usize,
    /// Pending task count
    pub pending: usize,
    /// Failed task count
    pub failed: usize,
    /// Amount spent
    pub spent: f64,
}

impl From<&Checkpoint> for CheckpointMetadata {
    fn from(checkpoint: &Checkpoint) -> Self {
        Self {
            id: checkpoint.id.clone(),
            timestamp: checkpoint.timestamp,
            version: checkpoint.version,
            completed: checkpoint.tasks.completed.len(),
            pending: checkpoint.tasks.pending.len(),
            failed: checkpoint.tasks.failed.len(),
            spent: checkpoint.budget.spent,
        }
    }
}

/// State reconstructed from the live checkpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct RestoredState {
    /// Checkpoint it came from
    pub checkpoint_id: CheckpointId,
    /// When that checkpoint was taken
    pub timestamp: DateTime<Utc>,
    /// Project description
    pub project: Value,
    /// Run configuration
    pub config: Value,
    /// Deduplicated task lists
    pub tasks: TaskLists,
    /// Budget counters
    pub budget: BudgetCounters,
    /// Touched files
    pub files: FileLists,
    /// Agents that were live
    pub agents: Vec<AgentRecord>,
    /// State store entries, if captured
    pub shared_state: Option<BTreeMap<String, EntryView>>,
    /// Always true: a restored run should continue where it stopped
    pub should_resume: bool,
}

impl From<Checkpoint> for RestoredState {
    fn from(checkpoint: Checkpoint) -> Self {
        Self {
            checkpoint_id: checkpoint.id,
            timestamp: checkpoint.timestamp,
            project: checkpoint.project,
            config: checkpoint.config,
            tasks: checkpoint.tasks,
            budget: checkpoint.budget,
            files: checkpoint.files,
            agents: checkpoint.agents,
            shared_state: checkpoint.shared_state,
            should_resume: true,
        }
    }
}

/// Writes, reads, and archives checkpoints for one workspace.
pub struct CheckpointManager {
    live_path: PathBuf,
    history_path: PathBuf,
    max_history: usize,
    /// Millisecond stamp of the newest checkpoint this manager issued.
    last_issued: AtomicU64,
    events: EventChannel,
}

impl CheckpointManager {
    /// Manager for the workspace at `workspace_root`.
    pub fn new(workspace_root: &Path, config: &CheckpointConfig, events: EventChannel) -> Self {
        Self {
            live_path: config.live_path(workspace_root),
            history_path: config.history_path(workspace_root),
            max_history: config.max_history.max(1),
            last_issued: AtomicU64::new(0),
            events,
        }
    }

    /// Live checkpoint path.
    pub fn live_path(&self) -> &Path {
        &self.live_path
    }

    /// History directory.
    pub fn history_path(&self) -> &Path {
        &self.history_path
    }

    /// Snapshot `state`, write it as the live checkpoint, and archive a copy.
    ///
    /// # Errors
    /// Returns a state error if serialization or any write fails.
    pub async fn create_checkpoint(&self, state: &OrchestrationState) -> Result<CheckpointId> {
        self.write_checkpoint(self.build(state, None)).await
    }

    /// Like [`create_checkpoint`](Self::create_checkpoint), also capturing
    /// every State Store entry.
    ///
    /// # Errors
    /// Returns an error if the store is closed or any write fails.
    pub async fn create_checkpoint_with_store(
        &self,
        state: &OrchestrationState,
        store: &StateStore,
        agent_id: &AgentId,
    ) -> Result<CheckpointId> {
        let view = store.consistent_view(agent_id).await?;
        self.write_checkpoint(self.build(state, Some(view.entries)))
            .await
    }

    fn build(
        &self,
        state: &OrchestrationState,
        shared_state: Option<BTreeMap<String, EntryView>>,
    ) -> Checkpoint {
        let now = Utc::now();
        let millis = self.next_millis(u64::try_from(now.timestamp_millis()).unwrap_or(0));
        let timestamp = i64::try_from(millis)
            .ok()
            .and_then(DateTime::<Utc>::from_timestamp_millis)
            .unwrap_or(now);
        Checkpoint {
            id: CheckpointId::generate(millis),
            timestamp,
            version: CHECKPOINT_VERSION,
            project: state.project.clone(),
            config: state.config.clone(),
            tasks: TaskLists::merged(iter::once(&state.tasks).chain(state.sub_coordinators.iter())),
            budget: state.budget.clone(),
            files: state.files.clone(),
            agents: state.agents.clone(),
            shared_state,
        }
    }

    /// Strictly increasing stamps, so checkpoints taken within the same
    /// millisecond still order by creation.
    fn next_millis(&self, now: u64) -> u64 {
        let previous = self
            .last_issued
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(now.max(last.saturating_add(1)))
            })
            .unwrap_or_else(|last| last);
        now.max(previous.saturating_add(1))
    }

    async fn write_checkpoint(&self, checkpoint: Checkpoint) -> Result<CheckpointId> {
        let json = serde_json::to_vec_pretty(&checkpoint).map_err(|error| {
            OrchestrationError::State(format!("Failed to serialize checkpoint: {error}"))
        })?;

        write_atomic(&self.live_path, &json).await?;
        let archive = self.history_path.join(format!("{}.json", checkpoint.id));
        write_atomic(&archive, &json).await?;
        self.prune_history().await;

        info!(
            "Created checkpoint {} ({} completed, {} pending, {} failed)",
            checkpoint.id,
            checkpoint.tasks.completed.len(),
            checkpoint.tasks.pending.len(),
            checkpoint.tasks.failed.len()
        );
        self.events.send(EngineEvent::CheckpointCreated {
            checkpoint_id: checkpoint.id.clone(),
        });
        Ok(checkpoint.id)
    }

    /// Read the live checkpoint. A missing file is `Ok(None)`.
    ///
    /// # Errors
    /// Returns a state error if the file cannot be read or fails validation.
    pub async fn load_latest_checkpoint(&self) -> Result<Option<Checkpoint>> {
        let bytes = match tfs::read(&self.live_path).await {
            Ok(bytes) => bytes,
            Err(error) if error.kind() == ErrorKind::NotFound => return Ok(None),
            Err(error) => {
                return Err(OrchestrationError::State(format!(
                    "Failed to read checkpoint {}: {error}",
                    self.live_path.display()
                )));
            }
        };
        parse_checkpoint(&bytes).map(Some)
    }

    /// Whether a live checkpoint exists.
    pub async fn has_checkpoint(&self) -> bool {
        tfs::try_exists(&self.live_path).await.unwrap_or(false)
    }

    /// Summary of the live checkpoint, if any.
    ///
    /// # Errors
    /// Returns a state error if the checkpoint is unreadable or invalid.
    pub async fn get_checkpoint_metadata(&self) -> Result<Option<CheckpointMetadata>> {
        Ok(self
            .load_latest_checkpoint()
            .await?
            .as_ref()
            .map(CheckpointMetadata::from))
    }

    /// Reconstruct the state saved in the live checkpoint.
    ///
    /// # Errors
    /// Returns a state error if there is no checkpoint or it is invalid.
    pub async fn restore_from_checkpoint(&self) -> Result<RestoredState> {
        let checkpoint = self.load_latest_checkpoint().await?.ok_or_else(|| {
            OrchestrationError::State(format!(
                "No checkpoint to restore at {}",
                self.live_path.display()
            ))
        })?;
        info!(
            "Restoring from checkpoint {} taken at {}",
            checkpoint.id, checkpoint.timestamp
        );
        Ok(RestoredState::from(checkpoint))
    }

    /// Remove the live checkpoint. History is kept. Returns whether a file
    /// was removed.
    ///
    /// # Errors
    /// Returns a state error if removal fails for a reason other than absence.
    pub async fn clear_checkpoint(&self) -> Result<bool> {
        match tfs::remove_file(&self.live_path).await {
            Ok(()) => {
                info!("Cleared checkpoint {}", self.live_path.display());
                self.events.send(EngineEvent::CheckpointCleared);
                Ok(true)
            }
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(false),
            Err(error) => Err(OrchestrationError::State(format!(
                "Failed to clear checkpoint {}: {error}",
                self.live_path.display()
            ))),
        }
    }

    /// Summaries of the `limit` most recent archived checkpoints, newest first.
    /// Unreadable archives are skipped.
    ///
    /// # Errors
    /// Returns a state error if the history directory cannot be listed.
    pub async fn get_history(&self, limit: usize) -> Result<Vec<CheckpointMetadata>> {
        let mut summaries = Vec::new();
        for path in self.history_files().await? {
            let parsed = match tfs::read(&path).await {
                Ok(bytes) => parse_checkpoint(&bytes),
                Err(error) => Err(OrchestrationError::from(error)),
            };
            match parsed {
                Ok(checkpoint) => summaries.push(CheckpointMetadata::from(&checkpoint)),
                Err(error) => warn!("Skipping archived checkpoint {}: {}", path.display(), error),
            }
        }

        summaries.sort_by(|left, right| {
            right
                .timestamp
                .cmp(&left.timestamp)
                .then_with(|| right.id.as_str().cmp(left.id.as_str()))
        });
        summaries.truncate(limit);
        Ok(summaries)
    }

    /// Archive files, oldest first by the stamp embedded in the name.
    async fn history_files(&self) -> Result<Vec<PathBuf>> {
        let mut entries = match tfs::read_dir(&self.history_path).await {
            Ok(entries) => entries,
            Err(error) if error.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(error) => {
                return Err(OrchestrationError::State(format!(
                    "Failed to list {}: {error}",
                    self.history_path.display()
                )));
            }
        };

        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_archive = path.extension().and_then(|ext| ext.to_str()) == Some("json")
                && path
                    .file_name()
                    .and_then(|name| name.to_str())
                    .is_some_and(|name| name.starts_with("checkpoint-"));
            if is_archive {
                files.push(path);
            }
        }
        files.sort_by_cached_key(|path| archive_order(path));
        Ok(files)
    }

    async fn prune_history(&self) {
        let files = match self.history_files().await {
            Ok(files) => files,
            Err(error) => {
                warn!("Could not list checkpoint history: {}", error);
                return;
            }
        };
        let excess = files.len().saturating_sub(self.max_history);
        for path in files.iter().take(excess) {
            match tfs::remove_file(path).await {
                Ok(()) => debug!("Pruned archived checkpoint {}", path.display()),
                Err(error) => warn!("Failed to prune {}: {}", path.display(), error),
            }
        }
    }
}

/// `(millis, suffix)` from `checkpoint-<millis>-<suffix>.json`. Names that do
/// not parse sort first and are pruned first.
fn archive_order(path: &Path) -> (u64, String) {
    let stem = path
        .file_stem()
        .and_then(|stem| stem.to_str())
        .and_then(|stem| stem.strip_prefix("checkpoint-"))
        .unwrap_or_default();
    let (millis, suffix) = stem.split_once('-').unwrap_or((stem, ""));
    (millis.parse().unwrap_or(0), suffix.to_owned())
}

/// Structural checks on the raw document, then the typed parse.
fn parse_checkpoint(bytes: &[u8]) -> Result<Checkpoint> {
    let value: Value = serde_json::from_slice(bytes)
        .map_err(|error| OrchestrationError::State(format!("Checkpoint is not JSON: {error}")))?;

    if !value.get("id").is_some_and(Value::is_string) {
        return Err(invalid("missing id"));
    }
    if value.get("timestamp").is_none_or(Value::is_null) {
        return Err(invalid("missing timestamp"));
    }
    let Some(tasks) = value.get("tasks") else {
        return Err(invalid("missing tasks"));
    };
    for list in ["completed", "pending", "failed"] {
        if !tasks.get(list).is_some_and(Value::is_array) {
            return Err(invalid(&format!("tasks.{list} is not an array")));
        }
    }
    let version = value.get("version").and_then(Value::as_u64);
    if version != Some(u64::from(CHECKPOINT_VERSION)) {
        return Err(invalid(&format!(
            "unsupported version {version:?}, expected {CHECKPOINT_VERSION}"
        )));
    }

    serde_json::from_value(value).map_err(|error| invalid(&error.to_string()))
}

fn invalid(reason: &str) -> OrchestrationError {
    OrchestrationError::State(format!("Invalid checkpoint: {reason}"))
}

/// Write through a sibling temp file and rename over the target.
async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path.parent().ok_or_else(|| {
        OrchestrationError::State(format!("{} has no parent directory", path.display()))
    })?;
    tfs::create_dir_all(parent).await.map_err(|error| {
        OrchestrationError::State(format!("Failed to create {}: {error}", parent.display()))
    })?;

    let temp_path = parent.join(format!(".checkpoint.{}.tmp", Uuid::new_v4().simple()));
    let written = match tfs::write(&temp_path, bytes).await {
        Ok(()) => tfs::rename(&temp_path, path).await,
        Err(error) => Err(error),
    };
    if let Err(error) = written {
        drop(tfs::remove_file(&temp_path).await);
        return Err(OrchestrationError::State(format!(
            "Failed to write {}: {error}",
            path.display()
        )));
    }
    Ok(())
}

/// Periodic checkpointing in the background. Stops when dropped.
pub struct Autosaver {
    handle: JoinHandle<()>,
}

impl Autosaver {
    /// Every `period`, snapshot `provider()` through `manager`. Failures are
    /// logged and the next tick tries again.
    pub fn start<P>(manager: Arc<CheckpointManager>, period: Duration, provider: P) -> Self
    where
        P: Fn() -> OrchestrationState + Send + Sync + 'static,
    {
        Self::spawn(manager, period, None, provider)
    }

    /// Like [`start`](Self::start), also capturing every State Store entry
    /// as seen by `agent_id`.
    pub fn start_with_store<P>(
        manager: Arc<CheckpointManager>,
        period: Duration,
        store: StateStore,
        agent_id: AgentId,
        provider: P,
    ) -> Self
    where
        P: Fn() -> OrchestrationState + Send + Sync + 'static,
    {
        Self::spawn(manager, period, Some((store, agent_id)), provider)
    }

    fn spawn<P>(
        manager: Arc<CheckpointManager>,
        period: Duration,
        store: Option<(StateStore, AgentId)>,
        provider: P,
    ) -> Self
    where
        P: Fn() -> OrchestrationState + Send + Sync + 'static,
    {
        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let state = provider();
                let saved = match &store {
                    Some((shared, agent_id)) => {
                        manager
                            .create_checkpoint_with_store(&state, shared, agent_id)
                            .await
                    }
                    None => manager.create_checkpoint(&state).await,
                };
                if let Err(error) = saved {
                    warn!("Autosave failed: {}", error);
                }
            }
        });
        Self { handle }
    }

    /// Stop autosaving.
    pub fn stop(self) {
        drop(self);
    }
}

impl Drop for Autosaver {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;
    use tokio::time::sleep;

    fn list(completed: &[&str], pending: &[&str], failed: &[&str]) -> TaskLists {
        let owned = |ids: &[&str]| -> Vec<String> { ids.iter().map(|id| (*id).to_owned()).collect() };
        TaskLists {
            completed: owned(completed),
            pending: owned(pending),
            failed: owned(failed),
        }
    }

    fn create_manager() -> (TempDir, CheckpointManager) {
        let tmp_dir = match TempDir::new() {
            Ok(dir) => dir,
            Err(error) => panic!("create temp dir: {error}"),
        };
        let manager = CheckpointManager::new(
            tmp_dir.path(),
            &CheckpointConfig::default(),
            EventChannel::default(),
        );
        (tmp_dir, manager)
    }

    #[test]
    fn test_merge_deduplicates_in_first_seen_order() {
        let top = list(&["t1", "t2"], &["t3"], &[]);
        let nested = list(&["t2", "t4", "t1"], &["t3", "t5"], &["t6"]);

        let merged = TaskLists::merged([&top, &nested]);
        assert_eq!(merged, list(&["t1", "t2", "t4"], &["t3", "t5"], &["t6"]));
    }

    #[test]
    fn test_parse_rejects_structural_problems() {
        let missing_id = json!({"timestamp": "2024-01-01T00:00:00Z", "version": 1,
            "tasks": {"completed": [], "pending": [], "failed": []}});
        let bad_tasks = json!({"id": "checkpoint-1-a", "timestamp": "2024-01-01T00:00:00Z",
            "version": 1, "tasks": {"completed": "t1", "pending": [], "failed": []}});
        let bad_version = json!({"id": "checkpoint-1-a", "timestamp": "2024-01-01T00:00:00Z",
            "version": 7, "tasks": {"completed": [], "pending": [], "failed": []}});

        for document in [missing_id, bad_tasks, bad_version] {
            let bytes = document.to_string().into_bytes();
            assert!(matches!(
                parse_checkpoint(&bytes),
                Err(OrchestrationError::State(_))
            ));
        }
        assert!(matches!(
            parse_checkpoint(b"not json"),
            Err(OrchestrationError::State(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_checkpoint_is_not_an_error() {
        let (_tmp, manager) = create_manager();

        assert!(!manager.has_checkpoint().await);
        assert!(matches!(manager.load_latest_checkpoint().await, Ok(None)));
        assert!(matches!(manager.get_checkpoint_metadata().await, Ok(None)));
        assert!(matches!(
            manager.restore_from_checkpoint().await,
            Err(OrchestrationError::State(_))
        ));
        assert!(matches!(manager.clear_checkpoint().await, Ok(false)));
    }

    #[tokio::test]
    async fn test_history_is_pruned() {
        let tmp_dir = match TempDir::new() {
            Ok(dir) => dir,
            Err(error) => panic!("create temp dir: {error}"),
        };
        let config = CheckpointConfig {
            max_history: 2,
            ..CheckpointConfig::default()
        };
        let manager = CheckpointManager::new(tmp_dir.path(), &config, EventChannel::default());

        let mut ids = Vec::new();
        for _ in 0..3 {
            match manager.create_checkpoint(&OrchestrationState::default()).await {
                Ok(id) => ids.push(id),
                Err(error) => panic!("checkpoint failed: {error}"),
            }
            sleep(Duration::from_millis(5)).await;
        }

        let history = match manager.get_history(10).await {
            Ok(history) => history,
            Err(error) => panic!("history failed: {error}"),
        };
        let history_ids: Vec<CheckpointId> = history.into_iter().map(|entry| entry.id).collect();
        let expected: Vec<CheckpointId> = ids.iter().rev().take(2).cloned().collect();
        assert_eq!(history_ids, expected);
    }

    #[tokio::test]
    async fn test_pruning_keeps_newest_when_created_back_to_back() {
        let tmp_dir = match TempDir::new() {
            Ok(dir) => dir,
            Err(error) => panic!("create temp dir: {error}"),
        };
        let config = CheckpointConfig {
            max_history: 1,
            ..CheckpointConfig::default()
        };
        let manager = CheckpointManager::new(tmp_dir.path(), &config, EventChannel::default());

        for round in 0..100 {
            let id = match manager.create_checkpoint(&OrchestrationState::default()).await {
                Ok(id) => id,
                Err(error) => panic!("checkpoint {round} failed: {error}"),
            };
            let history = match manager.get_history(10).await {
                Ok(history) => history,
                Err(error) => panic!("history failed: {error}"),
            };
            assert_eq!(history.len(), 1);
            assert_eq!(history.first().map(|entry| entry.id.clone()), Some(id));
        }
    }

    #[test]
    fn test_issued_stamps_strictly_increase() {
        let (_tmp, manager) = create_manager();

        assert_eq!(manager.next_millis(1_000), 1_000);
        assert_eq!(manager.next_millis(1_000), 1_001);
        assert_eq!(manager.next_millis(900), 1_002);
        assert_eq!(manager.next_millis(5_000), 5_000);
    }

    #[test]
    fn test_archive_order_is_numeric() {
        let older = archive_order(Path::new("/h/checkpoint-999-ffffffff.json"));
        let newer = archive_order(Path::new("/h/checkpoint-1000-00000000.json"));
        assert!(older < newer);
        assert_eq!(archive_order(Path::new("/h/checkpoint-junk.json")).0, 0);
    }

    #[tokio::test]
    async fn test_zero_history_still_keeps_latest_archive() {
        let tmp_dir = match TempDir::new() {
            Ok(dir) => dir,
            Err(error) => panic!("create temp dir: {error}"),
        };
        let config = CheckpointConfig {
            max_history: 0,
            ..CheckpointConfig::default()
        };
        let manager = CheckpointManager::new(tmp_dir.path(), &config, EventChannel::default());

        let id = match manager.create_checkpoint(&OrchestrationState::default()).await {
            Ok(id) => id,
            Err(error) => panic!("checkpoint failed: {error}"),
        };
        let archive = manager.history_path().join(format!("{id}.json"));
        assert!(archive.exists());
    }
}
