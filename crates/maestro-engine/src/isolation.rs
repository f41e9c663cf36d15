use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use maestro_core::sync::IgnoreRwLock as _;
use maestro_core::time::unix_millis;
use maestro_core::{AgentId, OrchestrationError, Result};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Details of an advisory lock held on a path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    /// Lock identifier handed to the holder
    pub lock_id: String,
    /// Agent holding the lock
    pub holder: AgentId,
    /// Locked path
    pub path: PathBuf,
    /// Unix millis when the lock was taken
    pub acquired_at: u64,
}

/// Advisory lock inspection consulted by rollback.
#[async_trait]
pub trait LockVerifier: Send + Sync {
    /// Whether `lock_id` is currently held by `agent_id`.
    async fn verify_lock(&self, lock_id: &str, agent_id: &AgentId) -> bool;

    /// Current lock on `path`, if any.
    async fn lock_info(&self, path: &Path) -> Option<LockInfo>;
}

type WriteLocks = HashMap<PathBuf, LockInfo>;

/// Tracks which files are being modified by which agents
#[derive(Default)]
pub struct FileLockManager {
    write_locks: RwLock<WriteLocks>,
}

impl FileLockManager {
    /// Create an empty lock manager.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Acquire write locks on files (exclusive access).
    ///
    /// Re-acquiring a path the agent already holds keeps the existing lock.
    ///
    /// # Errors
    /// Returns an error if any file is already locked by another agent. No lock
    /// is taken in that case.
    pub fn acquire_write_locks(
        self: &Arc<Self>,
        agent_id: &AgentId,
        files: &[PathBuf],
    ) -> Result<WriteLockGuard> {
        let mut write_locks = self.write_locks.write_ignore_poison();

        for file in files {
            if let Some(existing) = write_locks.get(file)
                && existing.holder != *agent_id
            {
                return Err(OrchestrationError::FileLocked {
                    path: file.clone(),
                    holder: existing.holder.clone(),
                });
            }
        }

        let mut acquired = Vec::with_capacity(files.len());
        for file in files {
            if write_locks.contains_key(file) {
                continue;
            }
            let info = LockInfo {
                lock_id: format!("lock-{}", Uuid::new_v4().simple()),
                holder: agent_id.clone(),
                path: file.clone(),
                acquired_at: unix_millis(),
            };
            acquired.push(info.clone());
            write_locks.insert(file.clone(), info);
        }
        drop(write_locks);

        Ok(WriteLockGuard {
            manager: Arc::clone(self),
            locks: acquired,
        })
    }

    /// Number of locked paths.
    pub fn locked_count(&self) -> usize {
        self.write_locks.read_ignore_poison().len()
    }

    fn release(&self, locks: &[LockInfo]) {
        let mut write_locks = self.write_locks.write_ignore_poison();
        for lock in locks {
            if write_locks
                .get(&lock.path)
                .is_some_and(|held| held.lock_id == lock.lock_id)
            {
                write_locks.remove(&lock.path);
            }
        }
    }
}

#[async_trait]
impl LockVerifier for FileLockManager {
    async fn verify_lock(&self, lock_id: &str, agent_id: &AgentId) -> bool {
        self.write_locks
            .read_ignore_poison()
            .values()
            .any(|info| info.lock_id == lock_id && info.holder == *agent_id)
    }

    async fn lock_info(&self, path: &Path) -> Option<LockInfo> {
        self.write_locks.read_ignore_poison().get(path).cloned()
    }
}

/// RAII guard for write locks - released on drop
pub struct WriteLockGuard {
    manager: Arc<FileLockManager>,
    locks: Vec<LockInfo>,
}

impl WriteLockGuard {
    /// Locks newly taken by this guard.
    pub fn locks(&self) -> &[LockInfo] {
        &self.locks
    }
}

impl Drop for WriteLockGuard {
    fn drop(&mut self) {
        self.manager.release(&self.locks);
    }
}

#[cfg(test)]
#[allow(
    clippy::assertions_on_result_states,
    reason = "Test code has different conventions"
)]
mod tests {
    use super::*;
    use std::slice::from_ref;

    #[tokio::test]
    async fn test_write_lock_exclusive() {
        let manager = FileLockManager::new();
        let agent_a = AgentId::from("a");
        let agent_b = AgentId::from("b");
        let file = PathBuf::from("test.rs");

        let _guard_a = match manager.acquire_write_locks(&agent_a, from_ref(&file)) {
            Ok(guard) => guard,
            Err(error) => panic!("failed to acquire write lock: {error}"),
        };

        let result = manager.acquire_write_locks(&agent_b, &[file]);
        assert!(matches!(
            result,
            Err(OrchestrationError::FileLocked { holder, .. }) if holder == agent_a
        ));
    }

    #[tokio::test]
    async fn test_locks_released_on_drop() {
        let manager = FileLockManager::new();
        let agent = AgentId::from("a");
        let file = PathBuf::from("test.rs");

        {
            let _guard = match manager.acquire_write_locks(&agent, from_ref(&file)) {
                Ok(guard) => guard,
                Err(error) => panic!("failed to acquire write lock: {error}"),
            };
            assert_eq!(manager.locked_count(), 1);
        }

        assert_eq!(manager.locked_count(), 0);
        assert!(manager.lock_info(&file).await.is_none());
    }

    #[tokio::test]
    async fn test_verify_lock_checks_holder() {
        let manager = FileLockManager::new();
        let agent = AgentId::from("a");
        let file = PathBuf::from("test.rs");

        let guard = match manager.acquire_write_locks(&agent, from_ref(&file)) {
            Ok(guard) => guard,
            Err(error) => panic!("failed to acquire write lock: {error}"),
        };
        let lock_id = match guard.locks().first() {
            Some(lock) => lock.lock_id.clone(),
            None => panic!("guard holds no locks"),
        };

        assert!(manager.verify_lock(&lock_id, &agent).await);
        assert!(!manager.verify_lock(&lock_id, &AgentId::from("b")).await);
        assert!(!manager.verify_lock("lock-unknown", &agent).await);

        let info = manager.lock_info(&file).await;
        assert_eq!(info.map(|info| info.holder), Some(agent));
    }

    #[tokio::test]
    async fn test_conflict_takes_no_partial_locks() {
        let manager = FileLockManager::new();
        let holder = AgentId::from("holder");
        let other = AgentId::from("other");
        let held = PathBuf::from("held.rs");
        let free = PathBuf::from("free.rs");

        let _guard = match manager.acquire_write_locks(&holder, from_ref(&held)) {
            Ok(guard) => guard,
            Err(error) => panic!("failed to acquire write lock: {error}"),
        };
        let result = manager.acquire_write_locks(&other, &[free.clone(), held]);

        assert!(result.is_err());
        assert!(manager.lock_info(&free).await.is_none());
    }
}
