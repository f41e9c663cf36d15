use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use maestro_core::sync::IgnoreLock as _;
use maestro_core::{AgentId, CheckpointId, OrchestrationConfig, Result};
use tracing::info;

use crate::checkpoint::{Autosaver, CheckpointManager, OrchestrationState, RestoredState};
use crate::events::EventChannel;
use crate::isolation::{FileLockManager, LockVerifier};
use crate::pool::AgentPool;
use crate::state::StateStore;
use crate::transaction::TransactionLog;
use crate::workspace::LocalFs;

/// Agent id the engine uses for its own store access.
pub const COORDINATOR_ID: &str = "coordinator";

/// The four engine components wired together for one workspace.
pub struct OrchestrationEngine<A> {
    config: OrchestrationConfig,
    workspace_root: PathBuf,
    coordinator: AgentId,
    state: StateStore,
    transactions: Arc<TransactionLog>,
    locks: Arc<FileLockManager>,
    pool: Arc<AgentPool<A>>,
    checkpoints: Arc<CheckpointManager>,
    autosaver: Mutex<Option<Autosaver>>,
}

impl<A: Send + 'static> OrchestrationEngine<A> {
    /// Build an engine whose events are discarded.
    ///
    /// Must be called inside a tokio runtime.
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid.
    pub fn new(config: OrchestrationConfig, workspace_root: PathBuf) -> Result<Self> {
        Self::with_events(config, workspace_root, EventChannel::default())
    }

    /// Build an engine reporting to `events`.
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid.
    pub fn with_events(
        config: OrchestrationConfig,
        workspace_root: PathBuf,
        events: EventChannel,
    ) -> Result<Self> {
        config.validate()?;

        let fs = Arc::new(LocalFs::new(workspace_root.clone()));
        let workspace_root = fs.root_path().to_path_buf();
        let locks = FileLockManager::new();
        let verifier: Arc<dyn LockVerifier> = Arc::<FileLockManager>::clone(&locks);
        let transactions = Arc::new(
            TransactionLog::new(fs, &config.transactions, events.clone())
                .with_lock_verifier(verifier),
        );
        let state = StateStore::spawn(&config.state_store, events.clone());
        let pool = Arc::new(AgentPool::new(config.pool.clone(), events.clone()));
        pool.start_eviction();
        let checkpoints = Arc::new(CheckpointManager::new(
            &workspace_root,
            &config.checkpoint,
            events,
        ));

        info!("Orchestration engine ready at {}", workspace_root.display());
        Ok(Self {
            config,
            workspace_root,
            coordinator: AgentId::from(COORDINATOR_ID),
            state,
            transactions,
            locks,
            pool,
            checkpoints,
            autosaver: Mutex::new(None),
        })
    }

    /// Effective configuration.
    pub fn config(&self) -> &OrchestrationConfig {
        &self.config
    }

    /// Workspace root.
    pub fn workspace_root(&self) -> &Path {
        &self.workspace_root
    }

    /// Shared state store.
    pub fn state(&self) -> &StateStore {
        &self.state
    }

    /// Transaction log.
    pub fn transactions(&self) -> &Arc<TransactionLog> {
        &self.transactions
    }

    /// Advisory file locks consulted by rollback.
    pub fn locks(&self) -> &Arc<FileLockManager> {
        &self.locks
    }

    /// Agent pool.
    pub fn pool(&self) -> &Arc<AgentPool<A>> {
        &self.pool
    }

    /// Checkpoint manager.
    pub fn checkpoints(&self) -> &Arc<CheckpointManager> {
        &self.checkpoints
    }

    /// Checkpoint `state` together with the agent roster and the store's entries.
    ///
    /// # Errors
    /// Returns an error if the store is closed or the checkpoint cannot be written.
    pub async fn checkpoint(&self, mut state: OrchestrationState) -> Result<CheckpointId> {
        state.agents = self.pool.roster();
        self.checkpoints
            .create_checkpoint_with_store(&state, &self.state, &self.coordinator)
            .await
    }

    /// Restore from the live checkpoint if there is one, replaying captured
    /// store entries into the state store. Replayed keys start again at version 1.
    ///
    /// # Errors
    /// Returns an error if the checkpoint is invalid or a replayed write fails.
    pub async fn resume(&self) -> Result<Option<RestoredState>> {
        if !self.checkpoints.has_checkpoint().await {
            return Ok(None);
        }
        let restored = self.checkpoints.restore_from_checkpoint().await?;

        if let Some(entries) = &restored.shared_state {
            for (key, entry) in entries {
                self.state
                    .write(key, entry.value.clone(), &entry.last_modified_by, None)
                    .await?;
            }
            info!("Replayed {} state entries from checkpoint", entries.len());
        }
        Ok(Some(restored))
    }

    /// Autosave through `provider` at the configured interval, capturing the
    /// pool roster and every State Store entry. Returns false if autosave is
    /// disabled. Replaces a running autosaver.
    pub fn start_autosave<P>(&self, provider: P) -> bool
    where
        P: Fn() -> OrchestrationState + Send + Sync + 'static,
    {
        let seconds = self.config.checkpoint.autosave_interval_seconds;
        if seconds == 0 {
            return false;
        }

        let pool = Arc::clone(&self.pool);
        let autosaver = Autosaver::start_with_store(
            Arc::clone(&self.checkpoints),
            Duration::from_secs(seconds),
            self.state.clone(),
            self.coordinator.clone(),
            move || {
                let mut state = provider();
                state.agents = pool.roster();
                state
            },
        );
        *self.autosaver.lock_ignore_poison() = Some(autosaver);
        true
    }

    /// Remove the live checkpoint after a fully successful run.
    ///
    /// # Errors
    /// Returns an error if the checkpoint cannot be removed.
    pub async fn finish_successfully(&self) -> Result<bool> {
        self.stop_autosave();
        self.checkpoints.clear_checkpoint().await
    }

    /// Write a final checkpoint and shut the pool down.
    ///
    /// # Errors
    /// Returns an error if the final checkpoint cannot be written; the pool is
    /// shut down regardless.
    pub async fn shutdown(&self, state: OrchestrationState) -> Result<CheckpointId> {
        self.stop_autosave();
        let checkpoint = self.checkpoint(state).await;
        self.pool.shutdown();
        info!("Orchestration engine shut down");
        checkpoint
    }

    fn stop_autosave(&self) {
        if let Some(autosaver) = self.autosaver.lock_ignore_poison().take() {
            autosaver.stop();
        }
    }
}
