//! Poison-tolerant locking.
//!
//! Engine bookkeeping (pool slots, subscriber registries) stays consistent even
//! if a holder panicked, because every critical section leaves the data in a
//! valid state before calling out. A poisoned lock is therefore recovered
//! rather than propagated.

use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Lock acquisition that ignores poisoning.
pub trait IgnoreLock<T> {
    /// Lock the mutex, recovering the guard if a previous holder panicked.
    fn lock_ignore_poison(&self) -> MutexGuard<'_, T>;
}

impl<T> IgnoreLock<T> for Mutex<T> {
    fn lock_ignore_poison(&self) -> MutexGuard<'_, T> {
        self.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Read/write lock acquisition that ignores poisoning.
pub trait IgnoreRwLock<T> {
    /// Acquire shared access, recovering from poison.
    fn read_ignore_poison(&self) -> RwLockReadGuard<'_, T>;
    /// Acquire exclusive access, recovering from poison.
    fn write_ignore_poison(&self) -> RwLockWriteGuard<'_, T>;
}

impl<T> IgnoreRwLock<T> for RwLock<T> {
    fn read_ignore_poison(&self) -> RwLockReadGuard<'_, T> {
        self.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_ignore_poison(&self) -> RwLockWriteGuard<'_, T> {
        self.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
#[allow(
    clippy::assertions_on_result_states,
    reason = "Test code has different conventions"
)]
mod tests {
    use super::*;
    use std::panic::{AssertUnwindSafe, catch_unwind};

    #[test]
    fn test_poisoned_mutex_is_recovered() {
        let values = Mutex::new(vec![1u32]);
        let result = catch_unwind(AssertUnwindSafe(|| {
            let guard = values.lock_ignore_poison();
            assert!(guard.is_empty(), "poison the lock");
        }));
        assert!(result.is_err());
        assert!(values.is_poisoned());

        values.lock_ignore_poison().push(2);
        assert_eq!(*values.lock_ignore_poison(), vec![1, 2]);
    }

    #[test]
    fn test_poisoned_rwlock_is_recovered() {
        let names = RwLock::new(vec!["a".to_owned()]);
        let result = catch_unwind(AssertUnwindSafe(|| {
            let guard = names.write_ignore_poison();
            assert!(guard.is_empty(), "poison the lock");
        }));
        assert!(result.is_err());

        names.write_ignore_poison().push("b".to_owned());
        assert_eq!(names.read_ignore_poison().len(), 2);
    }
}
