//! Core types shared across the maestro orchestration engine.
//!
//! This crate provides the error taxonomy, identifiers, configuration, and the
//! small value types that more than one engine component needs to agree on.

/// Configuration for the state store, agent pool, transactions, and checkpoints.
pub mod config;
/// Error types and result definitions.
pub mod error;
/// Strongly typed identifiers.
pub mod ids;
/// Synchronization utilities for handling poisoned locks.
pub mod sync;
/// Wall-clock helpers.
pub mod time;
/// Value types shared between engine components.
pub mod types;

pub use config::{
    CheckpointConfig, OrchestrationConfig, PoolConfig, StateStoreConfig, TransactionConfig,
};
pub use error::{OrchestrationError, Result};
pub use ids::{AgentId, CheckpointId, SubscriptionId, TransactionId};
pub use sync::{IgnoreLock, IgnoreRwLock};
pub use types::{AgentRecord, AgentStatus, FileOperationKind, TransactionStatus};
