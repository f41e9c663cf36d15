//! Orchestration and consistency engine.
//!
//! Four components coordinate worker agents over a shared workspace:
//! - [`StateStore`]: versioned key/value state behind a single ordered queue,
//!   with optimistic writes, pub/sub, and strong or eventual reads
//! - [`TransactionLog`]: undo-logged groups of file mutations
//! - [`AgentPool`]: bounded, reusable agents per type
//! - [`CheckpointManager`]: durable snapshots for crash recovery
//!
//! [`OrchestrationEngine`] wires them together from an
//! [`OrchestrationConfig`](maestro_core::OrchestrationConfig).

/// Bounded TTL cache
pub mod cache;
/// Checkpoint persistence and recovery
pub mod checkpoint;
/// Engine facade
pub mod engine;
/// Diagnostic events
pub mod events;
/// Advisory file locks
pub mod isolation;
/// Agent pool
pub mod pool;
/// Shared state store
pub mod state;
/// Transaction log
pub mod transaction;
/// Workspace file system
pub mod workspace;

pub use cache::BoundedCache;
pub use checkpoint::{
    Autosaver, BudgetCounters, CHECKPOINT_VERSION, Checkpoint, CheckpointManager,
    CheckpointMetadata, FileLists, OrchestrationState, RestoredState, TaskLists,
};
pub use engine::{COORDINATOR_ID, OrchestrationEngine};
pub use events::{EngineEvent, EventChannel};
pub use isolation::{FileLockManager, LockInfo, LockVerifier, WriteLockGuard};
pub use pool::{AgentPool, PoolStats, PooledAgent, ReleaseOptions, TypeStats};
pub use state::{
    Consistency, ConsistentView, EntryView, KeyPattern, ReadOutcome, StateChange, StateEntry,
    StateStore, SubscriberCallback, VectorClock, WriteReceipt,
};
pub use transaction::{FileIssue, FileOperation, RollbackReport, TransactionLog, TransactionScope};
pub use workspace::{LocalFs, MAX_FILE_BYTES, WorkspaceFs};
