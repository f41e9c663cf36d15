//! Bounded, reusable pools of worker agents keyed by agent type.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use maestro_core::sync::IgnoreLock as _;
use maestro_core::time::unix_millis;
use maestro_core::{AgentId, AgentRecord, AgentStatus, OrchestrationError, PoolConfig, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{self, interval, sleep_until};
use tracing::{debug, info, warn};

use crate::events::{EngineEvent, EventChannel};

/// An agent handed out by the pool. Must be given back with [`AgentPool::release`].
#[derive(Debug)]
pub struct PooledAgent<A> {
    id: AgentId,
    agent_type: String,
    agent: A,
}

impl<A> PooledAgent<A> {
    /// Pool-assigned identifier.
    pub fn id(&self) -> &AgentId {
        &self.id
    }

    /// Type the agent was acquired under.
    pub fn agent_type(&self) -> &str {
        &self.agent_type
    }
}

impl<A> Deref for PooledAgent<A> {
    type Target = A;

    fn deref(&self) -> &A {
        &self.agent
    }
}

impl<A> DerefMut for PooledAgent<A> {
    fn deref_mut(&mut self) -> &mut A {
        &mut self.agent
    }
}

/// How an agent is given back.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReleaseOptions {
    /// Discard the instance instead of returning it to the pool
    pub destroy: bool,
    /// Error the agent ran into; also discards the instance
    pub error: Option<String>,
}

impl ReleaseOptions {
    /// Discard the instance.
    pub fn destroy() -> Self {
        Self {
            destroy: true,
            error: None,
        }
    }

    /// Discard the instance because it failed.
    pub fn failed(error: impl ToString) -> Self {
        Self {
            destroy: false,
            error: Some(error.to_string()),
        }
    }

    fn discards(&self) -> bool {
        self.destroy || self.error.is_some()
    }
}

/// Counts for one agent type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeStats {
    /// Idle instances
    pub available: usize,
    /// Handed-out instances
    pub busy: usize,
    /// Live instances (`available + busy`)
    pub created: usize,
}

/// Pool-wide statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PoolStats {
    /// Per agent type
    pub by_type: BTreeMap<String, TypeStats>,
    /// Successful acquisitions
    pub acquired: u64,
    /// Acquisitions served by an idle instance
    pub reused: u64,
    /// `reused / acquired`, 0 before the first acquisition
    pub efficiency: f64,
}

struct AgentMeta {
    id: AgentId,
    created_at: u64,
    times_acquired: u64,
    last_released: Option<Instant>,
    last_released_at: Option<u64>,
}

impl AgentMeta {
    fn record(&self, agent_type: &str, status: AgentStatus) -> AgentRecord {
        AgentRecord {
            agent_id: self.id.clone(),
            agent_type: agent_type.to_owned(),
            status,
            times_acquired: self.times_acquired,
            created_at: self.created_at,
            last_released_at: self.last_released_at,
        }
    }
}

struct IdleAgent<A> {
    meta: AgentMeta,
    agent: A,
}

struct TypeSlot<A> {
    available: VecDeque<IdleAgent<A>>,
    busy: HashMap<AgentId, AgentMeta>,
    /// Instances being constructed; they count against the bound
    reserving: usize,
    notify: Arc<Notify>,
}

impl<A> Default for TypeSlot<A> {
    fn default() -> Self {
        Self {
            available: VecDeque::new(),
            busy: HashMap::new(),
            reserving: 0,
            notify: Arc::new(Notify::new()),
        }
    }
}

impl<A> TypeSlot<A> {
    fn live(&self) -> usize {
        self.available.len() + self.busy.len()
    }
}

struct PoolState<A> {
    slots: HashMap<String, TypeSlot<A>>,
    acquired: u64,
    reused: u64,
    closed: bool,
}

struct PoolInner<A> {
    state: Mutex<PoolState<A>>,
    config: PoolConfig,
    events: EventChannel,
    eviction: Mutex<Option<JoinHandle<()>>>,
}

enum Claim<A> {
    Reused(PooledAgent<A>),
    Create,
    Wait(Arc<Notify>),
}

/// Per-type bounded agent pool.
///
/// At most `max_per_type` instances of each type are alive at once. Idle
/// instances are reused before new ones are built; when the type is at
/// capacity, `acquire` waits for a release until `acquire_timeout`.
pub struct AgentPool<A> {
    inner: Arc<PoolInner<A>>,
}

impl<A: Send + 'static> AgentPool<A> {
    /// Create an empty pool.
    pub fn new(config: PoolConfig, events: EventChannel) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                state: Mutex::new(PoolState {
                    slots: HashMap::new(),
                    acquired: 0,
                    reused: 0,
                    closed: false,
                }),
                config,
                events,
                eviction: Mutex::new(None),
            }),
        }
    }

    /// Acquire an agent of `agent_type`.
    ///
    /// Reuses an idle instance if there is one, otherwise builds one with
    /// `factory` if the type has spare capacity, otherwise waits for a release.
    ///
    /// # Errors
    /// Returns [`OrchestrationError::PoolTimeout`] if nothing became available
    /// within the acquire timeout, the factory's error if construction failed,
    /// or an error if the pool was shut down.
    pub async fn acquire<F, Fut>(&self, agent_type: &str, factory: F) -> Result<PooledAgent<A>>
    where
        F: FnOnce(AgentId) -> Fut,
        Fut: Future<Output = Result<A>>,
    {
        let started = time::Instant::now();
        let deadline = started + self.inner.config.acquire_timeout();

        loop {
            let notify = match self.inner.claim(agent_type) {
                Claim::Reused(agent) => return Ok(agent),
                Claim::Create => return self.inner.create(agent_type, factory).await,
                Claim::Wait(notify) => notify,
            };

            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            // A release may have landed between claim and enable.
            if self.inner.has_capacity(agent_type) {
                continue;
            }

            tokio::select! {
                () = &mut notified => {}
                () = sleep_until(deadline) => {
                    let waited_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
                    warn!("Timed out after {}ms waiting for a '{}' agent", waited_ms, agent_type);
                    return Err(OrchestrationError::PoolTimeout {
                        agent_type: agent_type.to_owned(),
                        waited_ms,
                    });
                }
            }
        }
    }

    /// Give an agent back.
    ///
    /// The agent always leaves the busy set. With `destroy` or `error` set it
    /// is discarded; otherwise it becomes available for reuse. Returns whether
    /// the agent was busy in this pool.
    pub fn release(&self, handle: PooledAgent<A>, options: ReleaseOptions) -> bool {
        let PooledAgent {
            id,
            agent_type,
            agent,
        } = handle;

        let mut state = self.inner.state.lock_ignore_poison();
        let Some(slot) = state.slots.get_mut(&agent_type) else {
            warn!("Released agent {} of unknown type '{}'", id, agent_type);
            return false;
        };
        let Some(mut meta) = slot.busy.remove(&id) else {
            warn!("Released agent {} that is not busy", id);
            return false;
        };

        if options.discards() {
            drop(agent);
            slot.notify.notify_one();
            drop(state);
            info!("Destroyed agent {} ({})", id, agent_type);
            self.inner.events.send(EngineEvent::AgentDestroyed {
                agent_type,
                agent_id: id,
                reason: options.error,
            });
            return true;
        }

        meta.last_released = Some(Instant::now());
        meta.last_released_at = Some(unix_millis());
        slot.available.push_back(IdleAgent { meta, agent });
        slot.notify.notify_one();
        drop(state);

        debug!("Released agent {} ({})", id, agent_type);
        self.inner.events.send(EngineEvent::AgentReleased {
            agent_type,
            agent_id: id,
        });
        true
    }

    /// Remove idle agents released longer ago than the idle timeout.
    /// Returns how many were evicted.
    pub fn evict_idle(&self) -> usize {
        self.inner.evict_idle()
    }

    /// Run [`evict_idle`](Self::evict_idle) every eviction interval until
    /// shutdown or until the pool is dropped. Calling it again is a no-op.
    pub fn start_eviction(&self) {
        let mut eviction = self.inner.eviction.lock_ignore_poison();
        if eviction.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }

        let weak: Weak<PoolInner<A>> = Arc::downgrade(&self.inner);
        let period = self.inner.config.eviction_interval();
        *eviction = Some(tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.evict_idle();
            }
        }));
    }

    /// Per-type counts and reuse efficiency.
    pub fn stats(&self) -> PoolStats {
        let state = self.inner.state.lock_ignore_poison();
        let by_type = state
            .slots
            .iter()
            .map(|(agent_type, slot)| {
                (
                    agent_type.clone(),
                    TypeStats {
                        available: slot.available.len(),
                        busy: slot.busy.len(),
                        created: slot.live(),
                    },
                )
            })
            .collect();

        let efficiency = if state.acquired == 0 {
            0.0
        } else {
            state.reused as f64 / state.acquired as f64
        };
        PoolStats {
            by_type,
            acquired: state.acquired,
            reused: state.reused,
            efficiency,
        }
    }

    /// Serializable record of every live agent, ordered by type then id.
    pub fn roster(&self) -> Vec<AgentRecord> {
        let state = self.inner.state.lock_ignore_poison();
        let mut records: Vec<AgentRecord> = state
            .slots
            .iter()
            .flat_map(|(agent_type, slot)| {
                let idle = slot
                    .available
                    .iter()
                    .map(|idle| idle.meta.record(agent_type, AgentStatus::Available));
                let busy = slot
                    .busy
                    .values()
                    .map(|meta| meta.record(agent_type, AgentStatus::Busy));
                idle.chain(busy).collect::<Vec<_>>()
            })
            .collect();
        drop(state);

        records.sort_by(|left, right| {
            left.agent_type
                .cmp(&right.agent_type)
                .then_with(|| left.agent_id.cmp(&right.agent_id))
        });
        records
    }

    /// Stop the eviction sweep, drop idle agents, and forget all bookkeeping.
    /// Later acquisitions fail; later releases are ignored.
    pub fn shutdown(&self) {
        if let Some(handle) = self.inner.eviction.lock_ignore_poison().take() {
            handle.abort();
        }

        let mut state = self.inner.state.lock_ignore_poison();
        state.closed = true;
        for slot in state.slots.values() {
            slot.notify.notify_waiters();
        }
        let live: usize = state.slots.values().map(TypeSlot::live).sum();
        state.slots.clear();
        drop(state);

        info!("Agent pool shut down ({} live agents dropped)", live);
    }
}

impl<A> PoolInner<A> {
    fn claim(&self, agent_type: &str) -> Claim<A> {
        let mut state = self.state.lock_ignore_poison();
        if state.closed {
            return Claim::Create;
        }
        let max_per_type = self.config.max_per_type;
        let slot = state.slots.entry(agent_type.to_owned()).or_default();

        if let Some(IdleAgent { mut meta, agent }) = slot.available.pop_back() {
            meta.times_acquired += 1;
            meta.last_released = None;
            let id = meta.id.clone();
            slot.busy.insert(id.clone(), meta);
            state.acquired += 1;
            state.reused += 1;
            drop(state);

            debug!("Reusing agent {} ({})", id, agent_type);
            self.events.send(EngineEvent::AgentReused {
                agent_type: agent_type.to_owned(),
                agent_id: id.clone(),
            });
            return Claim::Reused(PooledAgent {
                id,
                agent_type: agent_type.to_owned(),
                agent,
            });
        }

        if slot.live() + slot.reserving < max_per_type {
            slot.reserving += 1;
            return Claim::Create;
        }
        Claim::Wait(Arc::clone(&slot.notify))
    }

    fn has_capacity(&self, agent_type: &str) -> bool {
        let state = self.state.lock_ignore_poison();
        state.closed
            || state.slots.get(agent_type).is_none_or(|slot| {
                !slot.available.is_empty()
                    || slot.live() + slot.reserving < self.config.max_per_type
            })
    }

    async fn create<F, Fut>(&self, agent_type: &str, factory: F) -> Result<PooledAgent<A>>
    where
        F: FnOnce(AgentId) -> Fut,
        Fut: Future<Output = Result<A>>,
    {
        if self.state.lock_ignore_poison().closed {
            return Err(OrchestrationError::Other("agent pool is shut down".to_owned()));
        }

        let mut reservation = Reservation {
            inner: self,
            agent_type,
            armed: true,
        };
        let id = AgentId::generate(agent_type);
        let agent = factory(id.clone()).await.inspect_err(|error| {
            warn!("Failed to create '{}' agent: {}", agent_type, error);
        })?;
        reservation.armed = false;

        let now = unix_millis();
        let mut state = self.state.lock_ignore_poison();
        let slot = state.slots.entry(agent_type.to_owned()).or_default();
        slot.reserving = slot.reserving.saturating_sub(1);
        slot.busy.insert(
            id.clone(),
            AgentMeta {
                id: id.clone(),
                created_at: now,
                times_acquired: 1,
                last_released: None,
                last_released_at: None,
            },
        );
        state.acquired += 1;
        drop(state);

        info!("Created agent {} ({})", id, agent_type);
        self.events.send(EngineEvent::AgentCreated {
            agent_type: agent_type.to_owned(),
            agent_id: id.clone(),
        });
        Ok(PooledAgent {
            id,
            agent_type: agent_type.to_owned(),
            agent,
        })
    }

    fn evict_idle(&self) -> usize {
        let idle_timeout = self.config.idle_timeout();
        let mut evicted = Vec::new();

        let mut state = self.state.lock_ignore_poison();
        for (agent_type, slot) in &mut state.slots {
            let (stale, fresh): (VecDeque<_>, VecDeque<_>) =
                slot.available.drain(..).partition(|idle| {
                    idle.meta
                        .last_released
                        .is_some_and(|released| released.elapsed() > idle_timeout)
                });
            slot.available = fresh;
            for idle in stale {
                let idle_ms = idle.meta.last_released.map_or(0, |released| {
                    u64::try_from(released.elapsed().as_millis()).unwrap_or(u64::MAX)
                });
                evicted.push((agent_type.clone(), idle.meta.id, idle_ms));
            }
        }
        drop(state);

        for (agent_type, agent_id, idle_ms) in &evicted {
            debug!("Evicted idle agent {} ({}) after {}ms", agent_id, agent_type, idle_ms);
            self.events.send(EngineEvent::AgentEvicted {
                agent_type: agent_type.clone(),
                agent_id: agent_id.clone(),
                idle_ms: *idle_ms,
            });
        }
        evicted.len()
    }
}

/// Capacity held while a factory runs; given back if construction fails or
/// the acquiring future is dropped.
struct Reservation<'pool, A> {
    inner: &'pool PoolInner<A>,
    agent_type: &'pool str,
    armed: bool,
}

impl<A> Drop for Reservation<'_, A> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut state = self.inner.state.lock_ignore_poison();
        if let Some(slot) = state.slots.get_mut(self.agent_type) {
            slot.reserving = slot.reserving.saturating_sub(1);
            slot.notify.notify_one();
        }
    }
}

#[cfg(test)]
#[allow(
    clippy::assertions_on_result_states,
    reason = "Test code has different conventions"
)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::sleep;

    fn pool(max_per_type: usize, acquire_timeout_ms: u64) -> AgentPool<String> {
        let config = PoolConfig {
            max_per_type,
            acquire_timeout_ms,
            ..PoolConfig::default()
        };
        AgentPool::new(config, EventChannel::default())
    }

    async fn make(id: AgentId) -> Result<String> {
        Ok(format!("agent:{id}"))
    }

    #[tokio::test]
    async fn test_release_then_acquire_reuses() {
        let pool = pool(2, 1_000);

        let first = match pool.acquire("worker", make).await {
            Ok(agent) => agent,
            Err(error) => panic!("acquire failed: {error}"),
        };
        let first_id = first.id().clone();
        assert!(first.starts_with("agent:worker-"));
        assert!(pool.release(first, ReleaseOptions::default()));

        let second = match pool.acquire("worker", make).await {
            Ok(agent) => agent,
            Err(error) => panic!("acquire failed: {error}"),
        };
        assert_eq!(second.id(), &first_id);

        let stats = pool.stats();
        assert_eq!(stats.acquired, 2);
        assert_eq!(stats.reused, 1);
        assert!((stats.efficiency - 0.5).abs() < f64::EPSILON);
        assert_eq!(
            stats.by_type.get("worker"),
            Some(&TypeStats {
                available: 0,
                busy: 1,
                created: 1
            })
        );
    }

    #[tokio::test]
    async fn test_destroy_frees_capacity() {
        let pool = pool(1, 1_000);

        let agent = match pool.acquire("worker", make).await {
            Ok(agent) => agent,
            Err(error) => panic!("acquire failed: {error}"),
        };
        let old_id = agent.id().clone();
        assert!(pool.release(agent, ReleaseOptions::failed("crashed")));
        assert_eq!(pool.stats().by_type.get("worker").map(|stats| stats.created), Some(0));

        let replacement = match pool.acquire("worker", make).await {
            Ok(agent) => agent,
            Err(error) => panic!("acquire failed: {error}"),
        };
        assert_ne!(replacement.id(), &old_id);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_times_out_at_capacity() {
        let pool = pool(1, 500);
        let _held = match pool.acquire("worker", make).await {
            Ok(agent) => agent,
            Err(error) => panic!("acquire failed: {error}"),
        };

        let result = pool.acquire("worker", make).await;
        assert!(matches!(
            result,
            Err(OrchestrationError::PoolTimeout { ref agent_type, .. }) if agent_type == "worker"
        ));
    }

    #[tokio::test]
    async fn test_factory_failure_returns_reservation() {
        let pool = pool(1, 1_000);

        let failed = pool
            .acquire("worker", |_id| async {
                Err::<String, _>(OrchestrationError::Factory("no backend".to_owned()))
            })
            .await;
        assert!(matches!(failed, Err(OrchestrationError::Factory(_))));

        let agent = pool.acquire("worker", make).await;
        assert!(agent.is_ok());
    }

    #[tokio::test]
    async fn test_evict_idle_removes_stale_agents() {
        let config = PoolConfig {
            idle_timeout_ms: 50,
            ..PoolConfig::default()
        };
        let pool: AgentPool<String> = AgentPool::new(config, EventChannel::default());

        let agent = match pool.acquire("worker", make).await {
            Ok(agent) => agent,
            Err(error) => panic!("acquire failed: {error}"),
        };
        assert!(pool.release(agent, ReleaseOptions::default()));
        assert_eq!(pool.evict_idle(), 0);

        sleep(Duration::from_millis(100)).await;
        assert_eq!(pool.evict_idle(), 1);
        assert_eq!(pool.stats().by_type.get("worker").map(|stats| stats.created), Some(0));
    }

    #[tokio::test]
    async fn test_roster_lists_live_agents() {
        let pool = pool(3, 1_000);
        let busy = match pool.acquire("worker", make).await {
            Ok(agent) => agent,
            Err(error) => panic!("acquire failed: {error}"),
        };
        let idle = match pool.acquire("reviewer", make).await {
            Ok(agent) => agent,
            Err(error) => panic!("acquire failed: {error}"),
        };
        assert!(pool.release(idle, ReleaseOptions::default()));

        let roster = pool.roster();
        assert_eq!(roster.len(), 2);
        assert_eq!(roster.first().map(|record| record.status), Some(AgentStatus::Available));
        assert_eq!(roster.get(1).map(|record| record.agent_id.clone()), Some(busy.id().clone()));
        assert!(roster.first().is_some_and(|record| record.last_released_at.is_some()));
    }

    #[tokio::test]
    async fn test_zero_eviction_interval_keeps_sweeping() {
        let config = PoolConfig {
            idle_timeout_ms: 20,
            eviction_interval_ms: 0,
            ..PoolConfig::default()
        };
        let pool: AgentPool<String> = AgentPool::new(config, EventChannel::default());
        pool.start_eviction();

        let agent = match pool.acquire("worker", make).await {
            Ok(agent) => agent,
            Err(error) => panic!("acquire failed: {error}"),
        };
        assert!(pool.release(agent, ReleaseOptions::default()));

        sleep(Duration::from_millis(200)).await;
        assert_eq!(pool.stats().by_type.get("worker").map(|stats| stats.created), Some(0));
        let running = pool
            .inner
            .eviction
            .lock()
            .map(|eviction| eviction.as_ref().is_some_and(|handle| !handle.is_finished()))
            .unwrap_or(false);
        assert!(running);
    }

    #[tokio::test]
    async fn test_shutdown_rejects_acquire() {
        let pool = pool(1, 1_000);
        let agent = match pool.acquire("worker", make).await {
            Ok(agent) => agent,
            Err(error) => panic!("acquire failed: {error}"),
        };
        pool.shutdown();

        assert!(!pool.release(agent, ReleaseOptions::default()));
        assert!(pool.acquire("worker", make).await.is_err());
        assert!(pool.stats().by_type.is_empty());
    }
}
