//! Shared, versioned key/value state with pub/sub and tunable consistency.
//!
//! All reads and writes go through one FIFO queue drained by a single task,
//! which gives every operation a global order without a lock around the map.
//! Writes use optimistic concurrency: a write carrying a stale
//! `expected_version` is rejected and leaves the store untouched.

mod drain;
/// Change listeners and key patterns
pub mod subscription;
/// Per-agent write counters
pub mod vector_clock;

use std::collections::BTreeMap;
use std::sync::Arc;

use maestro_core::time::unix_millis;
use maestro_core::{
    AgentId, OrchestrationError, Result, StateStoreConfig, SubscriptionId,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::warn;

use crate::events::EventChannel;
use drain::{DrainLoop, Operation, Request};
pub use subscription::{KeyPattern, SubscriberCallback};
use subscription::SubscriptionRegistry;
pub use vector_clock::VectorClock;

/// Read consistency level.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Consistency {
    /// Return whatever is committed when the read reaches the head of the queue
    #[default]
    Eventual,
    /// Wait (by re-queueing) for writes to the same key queued before the read is served
    Strong,
}

/// One versioned value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateEntry {
    /// Stored value
    pub value: Value,
    /// Starts at 1, increases by exactly 1 per successful write
    pub version: u64,
    /// Unix millis of the last write
    pub last_modified: u64,
    /// Agent that wrote last
    pub last_modified_by: AgentId,
    /// Store clock at the time of the write
    pub vector_clock: VectorClock,
}

/// Read-only projection of an entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryView {
    /// Stored value
    pub value: Value,
    /// Current version
    pub version: u64,
    /// Unix millis of the last write
    pub last_modified: u64,
    /// Agent that wrote last
    pub last_modified_by: AgentId,
}

impl From<&StateEntry> for EntryView {
    fn from(entry: &StateEntry) -> Self {
        Self {
            value: entry.value.clone(),
            version: entry.version,
            last_modified: entry.last_modified,
            last_modified_by: entry.last_modified_by.clone(),
        }
    }
}

/// Snapshot of the whole store at one point in the operation order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsistentView {
    /// Agent that asked for the view
    pub requested_by: AgentId,
    /// Unix millis when the view was taken
    pub taken_at: u64,
    /// Store clock at that point
    pub clock: VectorClock,
    /// Every entry, ordered by key
    pub entries: BTreeMap<String, EntryView>,
}

impl ConsistentView {
    /// Values only, ordered by key.
    pub fn values(&self) -> BTreeMap<String, Value> {
        self.entries
            .iter()
            .map(|(key, entry)| (key.clone(), entry.value.clone()))
            .collect()
    }
}

/// Acknowledgement of a successful write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteReceipt {
    /// New version of the key
    pub version: u64,
    /// Unix millis of the write
    pub timestamp: u64,
}

/// Result of a read, including whether strong consistency had to be given up.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadOutcome {
    /// Committed value, if the key exists
    pub value: Option<Value>,
    /// Committed version, if the key exists
    pub version: Option<u64>,
    /// True when a strong read exhausted its retries and fell back to eventual
    pub degraded: bool,
}

/// Change delivered to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub struct StateChange {
    /// Written key
    pub key: String,
    /// New value
    pub value: Value,
    /// New version
    pub version: u64,
    /// Writer
    pub agent_id: AgentId,
    /// Unix millis of the write
    pub timestamp: u64,
    /// Store clock after the write
    pub vector_clock: VectorClock,
}

/// Handle to the state store. Cheap to clone; the store stops when the last
/// handle is dropped.
#[derive(Clone)]
pub struct StateStore {
    sender: mpsc::UnboundedSender<Operation>,
    subscriptions: Arc<SubscriptionRegistry>,
}

impl StateStore {
    /// Start the store's drain task on the current tokio runtime.
    pub fn spawn(config: &StateStoreConfig, events: EventChannel) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let subscriptions = Arc::new(SubscriptionRegistry::default());
        let drain = DrainLoop::new(
            Arc::clone(&subscriptions),
            events,
            config.max_strong_retries,
        );
        tokio::spawn(drain.run(receiver));

        Self {
            sender,
            subscriptions,
        }
    }

    /// Read a value. Never fails: a missing key or a stopped store reads as `None`.
    pub async fn read(
        &self,
        key: &str,
        agent_id: &AgentId,
        consistency: Consistency,
    ) -> Option<Value> {
        self.read_detailed(key, agent_id, consistency).await.value
    }

    /// Read a value along with its version and whether the read was degraded.
    pub async fn read_detailed(
        &self,
        key: &str,
        agent_id: &AgentId,
        consistency: Consistency,
    ) -> ReadOutcome {
        let (reply, receiver) = oneshot::channel();
        let submitted = self.submit(key, agent_id, Request::Read { consistency, reply });

        let outcome = match submitted {
            Ok(()) => receiver.await.ok(),
            Err(_) => None,
        };
        outcome.unwrap_or_else(|| {
            warn!("Read of '{}' by {} after the state store stopped", key, agent_id);
            ReadOutcome {
                value: None,
                version: None,
                degraded: false,
            }
        })
    }

    /// Write a value.
    ///
    /// With `expected_version`, the write only applies if the key's current
    /// version equals it (an absent key never matches).
    ///
    /// # Errors
    /// Returns [`OrchestrationError::Concurrency`] on a version mismatch, in
    /// which case nothing was modified, or [`OrchestrationError::StoreClosed`]
    /// if the store has stopped.
    pub async fn write(
        &self,
        key: &str,
        value: Value,
        agent_id: &AgentId,
        expected_version: Option<u64>,
    ) -> Result<WriteReceipt> {
        let (reply, receiver) = oneshot::channel();
        self.submit(
            key,
            agent_id,
            Request::Write {
                value,
                expected_version,
                reply,
            },
        )?;
        receiver
            .await
            .map_err(|_| OrchestrationError::StoreClosed)?
    }

    /// Snapshot every entry, ordered after all previously submitted operations.
    ///
    /// # Errors
    /// Returns [`OrchestrationError::StoreClosed`] if the store has stopped.
    pub async fn consistent_view(&self, agent_id: &AgentId) -> Result<ConsistentView> {
        let (reply, receiver) = oneshot::channel();
        self.submit("", agent_id, Request::View { reply })?;
        receiver.await.map_err(|_| OrchestrationError::StoreClosed)
    }

    /// Listen for changes to keys matching `pattern` made by other agents.
    ///
    /// Callbacks run on the store's drain task after the write is acknowledged
    /// and before the next operation is applied, so they should be quick.
    /// A callback reports failure by returning an error, which is sent as
    /// [`EngineEvent::SubscriberFailed`](crate::EngineEvent::SubscriberFailed) and
    /// does not affect other subscribers.
    ///
    /// Callbacks must not panic. Release builds abort on panic, which takes
    /// down the store together with the process; only unwinding builds
    /// recover and report the panic like a returned error.
    pub fn subscribe<F>(
        &self,
        pattern: impl Into<KeyPattern>,
        callback: F,
        agent_id: &AgentId,
    ) -> SubscriptionId
    where
        F: Fn(&StateChange) -> Result<()> + Send + Sync + 'static,
    {
        self.subscriptions
            .add(pattern.into(), agent_id.clone(), Arc::new(callback))
    }

    /// Remove a subscription. Returns whether it existed.
    pub fn unsubscribe(&self, subscription_id: SubscriptionId) -> bool {
        self.subscriptions.remove(subscription_id)
    }

    /// Number of active subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    fn submit(&self, key: &str, agent_id: &AgentId, request: Request) -> Result<()> {
        self.sender
            .send(Operation {
                key: key.to_owned(),
                agent_id: agent_id.clone(),
                submitted_at: unix_millis(),
                retry_count: 0,
                request,
            })
            .map_err(|_| OrchestrationError::StoreClosed)
    }
}

#[cfg(test)]
#[allow(
    clippy::assertions_on_result_states,
    reason = "Test code has different conventions"
)]
mod tests {
    use super::*;
    use crate::events::EngineEvent;
    use futures::future::join_all;
    use serde_json::json;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn spawn_store() -> StateStore {
        StateStore::spawn(&StateStoreConfig::default(), EventChannel::default())
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let store = spawn_store();
        let agent = AgentId::from("coordinator");

        let receipt = match store.write("budget", json!(10), &agent, None).await {
            Ok(receipt) => receipt,
            Err(error) => panic!("write failed: {error}"),
        };
        assert_eq!(receipt.version, 1);

        let value = store.read("budget", &agent, Consistency::Eventual).await;
        assert_eq!(value, Some(json!(10)));
        assert_eq!(store.read("missing", &agent, Consistency::Strong).await, None);
    }

    #[tokio::test]
    async fn test_stale_expected_version_rejected() {
        let store = spawn_store();
        let agent = AgentId::from("coordinator");

        assert!(store.write("budget", json!(10), &agent, None).await.is_ok());
        let second = store.write("budget", json!(12), &agent, Some(1)).await;
        assert_eq!(second.ok().map(|receipt| receipt.version), Some(2));

        let stale = store.write("budget", json!(99), &agent, Some(1)).await;
        assert!(matches!(
            stale,
            Err(OrchestrationError::Concurrency {
                expected: 1,
                actual: Some(2),
                ..
            })
        ));

        let outcome = store
            .read_detailed("budget", &agent, Consistency::Eventual)
            .await;
        assert_eq!(outcome.value, Some(json!(12)));
        assert_eq!(outcome.version, Some(2));
    }

    #[tokio::test]
    async fn test_expected_version_on_absent_key_rejected() {
        let store = spawn_store();
        let agent = AgentId::from("a");

        let result = store.write("fresh", json!(1), &agent, Some(0)).await;
        assert!(matches!(
            result,
            Err(OrchestrationError::Concurrency { actual: None, .. })
        ));
        assert_eq!(store.read("fresh", &agent, Consistency::Eventual).await, None);
    }

    #[tokio::test]
    async fn test_writes_apply_in_submission_order() {
        let store = spawn_store();
        let agent = AgentId::from("a");

        let writes = (0..20).map(|index| store.write("counter", json!(index), &agent, None));
        let receipts = join_all(writes).await;

        let versions: Vec<u64> = receipts
            .into_iter()
            .filter_map(|receipt| receipt.ok().map(|receipt| receipt.version))
            .collect();
        assert_eq!(versions, (1..=20).collect::<Vec<u64>>());
        assert_eq!(
            store.read("counter", &agent, Consistency::Eventual).await,
            Some(json!(19))
        );
    }

    #[tokio::test]
    async fn test_strong_read_waits_for_queued_write() {
        let store = spawn_store();
        let reader = AgentId::from("reader");
        let writer = AgentId::from("writer");

        let (strong, written) = tokio::join!(
            store.read_detailed("plan", &reader, Consistency::Strong),
            store.write("plan", json!("v1"), &writer, None)
        );

        assert!(written.is_ok());
        assert_eq!(strong.value, Some(json!("v1")));
        assert!(!strong.degraded);
    }

    #[tokio::test]
    async fn test_eventual_read_does_not_wait() {
        let store = spawn_store();
        let reader = AgentId::from("reader");
        let writer = AgentId::from("writer");

        let (eventual, written) = tokio::join!(
            store.read("plan", &reader, Consistency::Eventual),
            store.write("plan", json!("v1"), &writer, None)
        );

        assert!(written.is_ok());
        assert_eq!(eventual, None);
    }

    #[tokio::test]
    async fn test_strong_read_degrades_after_retry_budget() {
        let (events, mut receiver) = EventChannel::new();
        let config = StateStoreConfig {
            max_strong_retries: 0,
        };
        let store = StateStore::spawn(&config, events);
        let reader = AgentId::from("reader");
        let writer = AgentId::from("writer");

        let (strong, written) = tokio::join!(
            store.read_detailed("plan", &reader, Consistency::Strong),
            store.write("plan", json!("v1"), &writer, None)
        );

        assert!(written.is_ok());
        assert!(strong.degraded);
        assert_eq!(strong.value, None);
        assert_eq!(
            receiver.try_recv().ok(),
            Some(EngineEvent::ConsistencyFallback {
                key: "plan".to_owned(),
                agent_id: reader,
                retries: 0,
            })
        );
    }

    #[tokio::test]
    async fn test_strong_read_degrades_at_default_budget_under_steady_writes() {
        let (events, mut receiver) = EventChannel::new();
        let config = StateStoreConfig::default();
        assert_eq!(config.max_strong_retries, 10);
        let store = StateStore::spawn(&config, events);
        let reader = AgentId::from("reader");
        let writer = AgentId::from("writer");

        // Each write is submitted only after the previous one is acknowledged,
        // so a same-key write is queued every time the read comes back around.
        let steady_writes = async {
            let mut applied = 0u32;
            for round in 0..30 {
                if store.write("plan", json!(round), &writer, None).await.is_ok() {
                    applied += 1;
                }
            }
            applied
        };
        let (strong, applied) = tokio::join!(
            store.read_detailed("plan", &reader, Consistency::Strong),
            steady_writes
        );

        assert_eq!(applied, 30);
        assert!(strong.degraded);
        assert_eq!(strong.version, Some(10));

        let mut fallbacks = Vec::new();
        while let Ok(event) = receiver.try_recv() {
            if let EngineEvent::ConsistencyFallback { key, retries, .. } = event {
                fallbacks.push((key, retries));
            }
        }
        assert_eq!(fallbacks, vec![("plan".to_owned(), 10)]);
    }

    #[tokio::test]
    async fn test_subscriber_receives_other_agents_writes_only() {
        let store = spawn_store();
        let agent_a = AgentId::from("A");
        let agent_b = AgentId::from("B");
        let received: Arc<Mutex<Vec<StateChange>>> = Arc::default();

        let sink = Arc::clone(&received);
        store.subscribe(
            "spec:*",
            move |change: &StateChange| {
                if let Ok(mut changes) = sink.lock() {
                    changes.push(change.clone());
                }
                Ok(())
            },
            &agent_b,
        );

        assert!(store.write("spec:1", json!("draft"), &agent_a, None).await.is_ok());
        assert!(store.write("spec:1", json!("final"), &agent_b, None).await.is_ok());
        assert!(store.write("other", json!(1), &agent_a, None).await.is_ok());
        // Fan-out completes before later operations are applied.
        assert!(store.consistent_view(&agent_a).await.is_ok());

        let changes = received.lock().map(|changes| changes.clone()).unwrap_or_default();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes.first().map(|change| change.agent_id.clone()), Some(agent_a));
        assert_eq!(changes.first().map(|change| change.version), Some(1));
    }

    #[tokio::test]
    async fn test_failing_subscriber_is_isolated() {
        let (events, mut receiver) = EventChannel::new();
        let store = StateStore::spawn(&StateStoreConfig::default(), events);
        let writer = AgentId::from("writer");
        let delivered: Arc<AtomicUsize> = Arc::default();

        let failing = store.subscribe(
            "jobs*",
            |_change: &StateChange| Err(OrchestrationError::Other("boom".to_owned())),
            &AgentId::from("failing"),
        );
        store.subscribe(
            "jobs*",
            |change: &StateChange| {
                assert!(change.key.is_empty(), "panicking subscriber");
                Ok(())
            },
            &AgentId::from("panicking"),
        );
        let counter = Arc::clone(&delivered);
        store.subscribe(
            "jobs*",
            move |_change: &StateChange| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
            &AgentId::from("healthy"),
        );

        let receipt = store.write("jobs:1", json!(true), &writer, None).await;
        assert!(receipt.is_ok());
        assert!(store.consistent_view(&writer).await.is_ok());

        assert_eq!(delivered.load(Ordering::SeqCst), 1);
        let mut failures = Vec::new();
        while let Ok(event) = receiver.try_recv() {
            if let EngineEvent::SubscriberFailed { subscription_id, .. } = event {
                failures.push(subscription_id);
            }
        }
        assert_eq!(failures.len(), 2);
        assert!(failures.contains(&failing));
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let store = spawn_store();
        let writer = AgentId::from("writer");
        let delivered: Arc<AtomicUsize> = Arc::default();

        let counter = Arc::clone(&delivered);
        let id = store.subscribe(
            "k",
            move |_change: &StateChange| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
            &AgentId::from("listener"),
        );
        assert_eq!(store.subscription_count(), 1);
        assert!(store.unsubscribe(id));
        assert!(!store.unsubscribe(id));

        assert!(store.write("k", json!(1), &writer, None).await.is_ok());
        assert!(store.consistent_view(&writer).await.is_ok());
        assert_eq!(delivered.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_consistent_view_and_vector_clock() {
        let store = spawn_store();
        let agent_a = AgentId::from("a");
        let agent_b = AgentId::from("b");

        assert!(store.write("x", json!(1), &agent_a, None).await.is_ok());
        assert!(store.write("x", json!(2), &agent_a, None).await.is_ok());
        assert!(store.write("y", json!("b"), &agent_b, None).await.is_ok());

        let view = match store.consistent_view(&agent_b).await {
            Ok(view) => view,
            Err(error) => panic!("view failed: {error}"),
        };
        assert_eq!(view.requested_by, agent_b);
        assert_eq!(view.entries.len(), 2);
        assert_eq!(view.entries.get("x").map(|entry| entry.version), Some(2));
        assert_eq!(
            view.entries.get("y").map(|entry| entry.last_modified_by.clone()),
            Some(agent_b.clone())
        );
        assert_eq!(view.clock.get(&agent_a), 2);
        assert_eq!(view.clock.get(&agent_b), 1);
        assert_eq!(view.values().get("x"), Some(&json!(2)));
    }
}
