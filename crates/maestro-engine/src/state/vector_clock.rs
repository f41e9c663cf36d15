use std::collections::BTreeMap;

use maestro_core::AgentId;
use serde::{Deserialize, Serialize};

/// Per-agent write counters.
///
/// Records how many writes each agent has made. Used as a last-writer
/// diagnostic and merge hint, not to enforce causal ordering.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VectorClock {
    counters: BTreeMap<AgentId, u64>,
}

impl VectorClock {
    /// Increment `agent_id`'s counter and return the new value.
    pub fn increment(&mut self, agent_id: &AgentId) -> u64 {
        let counter = self.counters.entry(agent_id.clone()).or_insert(0);
        *counter += 1;
        *counter
    }

    /// Counter for `agent_id` (0 if it never wrote).
    pub fn get(&self, agent_id: &AgentId) -> u64 {
        self.counters.get(agent_id).copied().unwrap_or(0)
    }

    /// Take the per-agent maximum of both clocks.
    pub fn merge(&mut self, other: &Self) {
        for (agent_id, &count) in &other.counters {
            let counter = self.counters.entry(agent_id.clone()).or_insert(0);
            *counter = (*counter).max(count);
        }
    }

    /// Agents and their counters, ordered by agent id.
    pub fn iter(&self) -> impl Iterator<Item = (&AgentId, u64)> {
        self.counters.iter().map(|(agent_id, &count)| (agent_id, count))
    }
}
