//! Diagnostic events emitted by engine components.

use std::path::PathBuf;

use maestro_core::{AgentId, CheckpointId, SubscriptionId, TransactionId, TransactionStatus};
use tokio::sync::mpsc;

/// Something an engine component wants observers to know about.
///
/// None of these change control flow; failures that matter to callers are
/// returned as errors instead.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// A strong read was re-queued too often and returned the committed value
    ConsistencyFallback {
        /// Key that was read
        key: String,
        /// Reader
        agent_id: AgentId,
        /// Re-queues performed before giving up
        retries: u32,
    },
    /// A subscriber callback returned an error, or panicked in an unwinding build;
    /// other subscribers were still notified
    SubscriberFailed {
        /// Failing subscription
        subscription_id: SubscriptionId,
        /// Key whose change was being delivered
        key: String,
        /// Failure description
        error: String,
    },
    /// The pool constructed a new agent
    AgentCreated {
        /// Agent type
        agent_type: String,
        /// New agent
        agent_id: AgentId,
    },
    /// The pool handed out an idle agent
    AgentReused {
        /// Agent type
        agent_type: String,
        /// Reused agent
        agent_id: AgentId,
    },
    /// An agent went back to the pool
    AgentReleased {
        /// Agent type
        agent_type: String,
        /// Released agent
        agent_id: AgentId,
    },
    /// An agent was permanently discarded on release
    AgentDestroyed {
        /// Agent type
        agent_type: String,
        /// Destroyed agent
        agent_id: AgentId,
        /// Error that caused the destruction, if any
        reason: Option<String>,
    },
    /// An idle agent was evicted by the sweep
    AgentEvicted {
        /// Agent type
        agent_type: String,
        /// Evicted agent
        agent_id: AgentId,
        /// How long it had been idle
        idle_ms: u64,
    },
    /// A transaction committed
    TransactionCommitted {
        /// Transaction
        transaction_id: TransactionId,
        /// Files touched
        files: usize,
    },
    /// A transaction finished rolling back
    TransactionRolledBack {
        /// Transaction
        transaction_id: TransactionId,
        /// Final status
        status: TransactionStatus,
        /// Per-file failures
        errors: usize,
    },
    /// Rollback noticed something suspicious but carried on
    RollbackWarning {
        /// Transaction
        transaction_id: TransactionId,
        /// Affected path
        path: PathBuf,
        /// What was noticed
        message: String,
    },
    /// A checkpoint was written and archived
    CheckpointCreated {
        /// Checkpoint
        checkpoint_id: CheckpointId,
    },
    /// The live checkpoint was removed
    CheckpointCleared,
}

/// Channel for engine diagnostic events
#[derive(Clone)]
pub struct EventChannel {
    sender: mpsc::UnboundedSender<EngineEvent>,
}

impl EventChannel {
    /// Create a channel and the receiver observers read from.
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<EngineEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    /// Send an event; a dropped receiver is not an error.
    pub fn send(&self, event: EngineEvent) {
        drop(self.sender.send(event));
    }
}

impl Default for EventChannel {
    fn default() -> Self {
        Self::new().0
    }
}
