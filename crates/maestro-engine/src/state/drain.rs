//! The single routine that owns and mutates the key/value map.
//!
//! Operations are applied strictly one at a time in queue order. A write is
//! fully applied, acknowledged, and fanned out to subscribers before the next
//! operation starts.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use maestro_core::time::unix_millis;
use maestro_core::{AgentId, OrchestrationError, Result};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::yield_now;
use tracing::{debug, warn};

use super::subscription::SubscriptionRegistry;
use super::vector_clock::VectorClock;
use super::{
    Consistency, ConsistentView, EntryView, ReadOutcome, StateChange, StateEntry, WriteReceipt,
};
use crate::events::{EngineEvent, EventChannel};

/// A queued request.
pub(super) struct Operation {
    pub(super) key: String,
    pub(super) agent_id: AgentId,
    pub(super) submitted_at: u64,
    pub(super) retry_count: u32,
    pub(super) request: Request,
}

pub(super) enum Request {
    Read {
        consistency: Consistency,
        reply: oneshot::Sender<ReadOutcome>,
    },
    Write {
        value: Value,
        expected_version: Option<u64>,
        reply: oneshot::Sender<Result<WriteReceipt>>,
    },
    View {
        reply: oneshot::Sender<ConsistentView>,
    },
}

impl Operation {
    fn is_write_to(&self, key: &str) -> bool {
        matches!(self.request, Request::Write { .. }) && self.key == key
    }
}

pub(super) struct DrainLoop {
    entries: HashMap<String, StateEntry>,
    clock: VectorClock,
    queue: VecDeque<Operation>,
    subscriptions: Arc<SubscriptionRegistry>,
    events: EventChannel,
    max_strong_retries: u32,
}

impl DrainLoop {
    pub(super) fn new(
        subscriptions: Arc<SubscriptionRegistry>,
        events: EventChannel,
        max_strong_retries: u32,
    ) -> Self {
        Self {
            entries: HashMap::new(),
            clock: VectorClock::default(),
            queue: VecDeque::new(),
            subscriptions,
            events,
            max_strong_retries,
        }
    }

    /// Drain operations until every handle is dropped.
    pub(super) async fn run(mut self, mut receiver: mpsc::UnboundedReceiver<Operation>) {
        loop {
            if self.queue.is_empty() {
                match receiver.recv().await {
                    Some(operation) => self.queue.push_back(operation),
                    None => break,
                }
            }
            // Everything already submitted joins the queue, so strong reads
            // can see writes waiting behind them.
            while let Ok(operation) = receiver.try_recv() {
                self.queue.push_back(operation);
            }
            if let Some(operation) = self.queue.pop_front() {
                self.apply(operation);
                // Submitters woken by a reply get to queue their follow-up
                // before a requeued strong read is looked at again.
                yield_now().await;
            }
        }
        debug!("State store drain loop stopped with {} keys", self.entries.len());
    }

    fn apply(&mut self, operation: Operation) {
        let Operation {
            key,
            agent_id,
            submitted_at,
            retry_count,
            request,
        } = operation;

        match request {
            Request::Read { consistency, reply } => {
                let write_pending = consistency == Consistency::Strong
                    && self.queue.iter().any(|queued| queued.is_write_to(&key));

                if write_pending && retry_count < self.max_strong_retries {
                    self.queue.push_back(Operation {
                        key,
                        agent_id,
                        submitted_at,
                        retry_count: retry_count + 1,
                        request: Request::Read { consistency, reply },
                    });
                    return;
                }

                if write_pending {
                    warn!(
                        "Strong read of '{}' by {} degraded to eventual after {} retries ({} ms queued)",
                        key,
                        agent_id,
                        retry_count,
                        unix_millis().saturating_sub(submitted_at)
                    );
                    self.events.send(EngineEvent::ConsistencyFallback {
                        key: key.clone(),
                        agent_id,
                        retries: retry_count,
                    });
                }

                let entry = self.entries.get(&key);
                drop(reply.send(ReadOutcome {
                    value: entry.map(|entry| entry.value.clone()),
                    version: entry.map(|entry| entry.version),
                    degraded: write_pending,
                }));
            }
            Request::Write {
                value,
                expected_version,
                reply,
            } => {
                let outcome = self.apply_write(key, value, agent_id, expected_version);
                match outcome {
                    Ok(change) => {
                        drop(reply.send(Ok(WriteReceipt {
                            version: change.version,
                            timestamp: change.timestamp,
                        })));
                        self.notify(&change);
                    }
                    Err(error) => {
                        drop(reply.send(Err(error)));
                    }
                }
            }
            Request::View { reply } => {
                let entries: BTreeMap<String, EntryView> = self
                    .entries
                    .iter()
                    .map(|(key, entry)| (key.clone(), EntryView::from(entry)))
                    .collect();
                drop(reply.send(ConsistentView {
                    requested_by: agent_id,
                    taken_at: unix_millis(),
                    clock: self.clock.clone(),
                    entries,
                }));
            }
        }
    }

    fn apply_write(
        &mut self,
        key: String,
        value: Value,
        agent_id: AgentId,
        expected_version: Option<u64>,
    ) -> Result<StateChange> {
        let current = self.entries.get(&key).map(|entry| entry.version);

        if let Some(expected) = expected_version
            && current != Some(expected)
        {
            debug!(
                "Rejected write to '{}' by {}: expected version {}, found {:?}",
                key, agent_id, expected, current
            );
            return Err(OrchestrationError::Concurrency {
                key,
                expected,
                actual: current,
            });
        }

        self.clock.increment(&agent_id);
        let version = current.map_or(1, |version| version + 1);
        let timestamp = unix_millis();

        let entry = StateEntry {
            value: value.clone(),
            version,
            last_modified: timestamp,
            last_modified_by: agent_id.clone(),
            vector_clock: self.clock.clone(),
        };
        self.entries.insert(key.clone(), entry);

        Ok(StateChange {
            key,
            value,
            version,
            agent_id,
            timestamp,
            vector_clock: self.clock.clone(),
        })
    }

    /// Deliver a change to every matching subscriber.
    ///
    /// Returned errors are reported and never stop delivery. A panic is only
    /// contained when the build unwinds; with `panic = "abort"` it ends the
    /// process.
    fn notify(&self, change: &StateChange) {
        for subscription in self.subscriptions.matching(&change.key, &change.agent_id) {
            let outcome = catch_unwind(AssertUnwindSafe(|| (subscription.callback)(change)));
            let failure = match outcome {
                Ok(Ok(())) => None,
                Ok(Err(error)) => Some(error.to_string()),
                Err(payload) => Some(
                    payload
                        .downcast_ref::<&str>()
                        .map(|message| (*message).to_owned())
                        .or_else(|| payload.downcast_ref::<String>().cloned())
                        .map_or_else(
                            || "subscriber panicked".to_owned(),
                            |message| format!("subscriber panicked: {message}"),
                        ),
                ),
            };

            if let Some(error) = failure {
                warn!(
                    "Subscriber {} failed on '{}': {}",
                    subscription.id, change.key, error
                );
                self.events.send(EngineEvent::SubscriberFailed {
                    subscription_id: subscription.id,
                    key: change.key.clone(),
                    error,
                });
            }
        }
    }
}
