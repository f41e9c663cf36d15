use serde::{Deserialize, Serialize};

use crate::ids::AgentId;

/// Lifecycle of a file transaction.
///
/// `Active -> Committing -> Committed`, or
/// `Active -> RollingBack -> RolledBack | RollbackFailed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionStatus {
    /// Accepting operations and backups
    Active,
    /// Commit in progress
    Committing,
    /// Committed; backups discarded
    Committed,
    /// Rollback in progress
    RollingBack,
    /// Every recoverable file was restored
    RolledBack,
    /// Rollback could not restore anything; needs manual intervention
    RollbackFailed,
}

impl TransactionStatus {
    /// Whether the transaction reached a final state.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Committed | Self::RolledBack | Self::RollbackFailed
        )
    }
}

/// Kind of file mutation recorded in a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileOperationKind {
    /// File did not exist before the operation
    Create,
    /// Existing file content was replaced
    Modify,
    /// File was removed
    Delete,
}

/// Whether a pooled agent is currently handed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AgentStatus {
    /// Idle in the pool
    Available,
    /// Held by a caller
    Busy,
}

/// Serializable roster entry for one live agent.
///
/// Serialization is symmetric: every field written to a checkpoint is read back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentRecord {
    /// Agent identifier
    pub agent_id: AgentId,
    /// Agent type the pool keyed it under
    pub agent_type: String,
    /// Availability at snapshot time
    pub status: AgentStatus,
    /// How many times the agent was handed out
    pub times_acquired: u64,
    /// Unix millis when the agent was constructed
    pub created_at: u64,
    /// Unix millis of the last release, if any
    pub last_released_at: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_statuses() {
        assert!(TransactionStatus::Committed.is_terminal());
        assert!(TransactionStatus::RolledBack.is_terminal());
        assert!(TransactionStatus::RollbackFailed.is_terminal());
        assert!(!TransactionStatus::Active.is_terminal());
        assert!(!TransactionStatus::RollingBack.is_terminal());
    }

    #[test]
    fn test_agent_record_round_trip_keeps_every_field() {
        let record = AgentRecord {
            agent_id: AgentId::from("worker-1"),
            agent_type: "worker".to_owned(),
            status: AgentStatus::Busy,
            times_acquired: 4,
            created_at: 1_000,
            last_released_at: Some(2_000),
        };

        let json = match serde_json::to_value(&record) {
            Ok(json) => json,
            Err(error) => panic!("serialize failed: {error}"),
        };
        let fields: Vec<&String> = json
            .as_object()
            .map(|object| object.keys().collect())
            .unwrap_or_default();
        assert_eq!(fields.len(), 6);

        let restored: AgentRecord = match serde_json::from_value(json) {
            Ok(restored) => restored,
            Err(error) => panic!("deserialize failed: {error}"),
        };
        assert_eq!(restored, record);
    }
}
