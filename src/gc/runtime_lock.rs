//! RuntimeLock - RAII serialization of native calls on one runtime.
//!
//! The foreign engine is single-threaded per runtime, so every native call
//! except `terminate_execution` runs under this lock. The lock is re-entrant
//! per thread: a foreign callback that calls back into the same runtime gets a
//! no-op guard instead of deadlocking on itself.

use std::cell::RefCell;
use std::sync::{Mutex, MutexGuard, PoisonError, TryLockError};

thread_local! {
    /// Ids of the runtimes whose lock this thread currently holds.
    static HELD_LOCKS: RefCell<Vec<u64>> = const { RefCell::new(Vec::new()) };
}

/// Whether the current thread holds the lock of runtime `id`.
pub fn is_held_by_current_thread(id: u64) -> bool {
    HELD_LOCKS.with(|held| held.borrow().contains(&id))
}

/// RAII guard over a runtime's native lock.
///
/// The guard is `!Send`: it must be dropped on the thread that acquired it.
///
/// # Example
///
/// ```ignore
/// let lock = RuntimeLock::acquire(runtime_id, &native_lock);
/// engine.execute(handle, "1 + 1")?;
/// drop(lock);
/// ```
pub struct RuntimeLock<'a> {
    id: u64,
    /// `None` for a nested acquisition on the owning thread.
    guard: Option<MutexGuard<'a, ()>>,
}

impl<'a> RuntimeLock<'a> {
    /// Block until the lock is free, or return a nested guard if this thread
    /// already owns it.
    pub fn acquire(id: u64, mutex: &'a Mutex<()>) -> Self {
        if is_held_by_current_thread(id) {
            return Self { id, guard: None };
        }

        // `()` carries no state a panic could have corrupted.
        let guard = mutex.lock().unwrap_or_else(PoisonError::into_inner);
        Self::register(id, guard)
    }

    /// Like [`RuntimeLock::acquire`] but returns `None` instead of blocking
    /// when another thread holds the lock.
    pub fn try_acquire(id: u64, mutex: &'a Mutex<()>) -> Option<Self> {
        if is_held_by_current_thread(id) {
            return Some(Self { id, guard: None });
        }

        match mutex.try_lock() {
            Ok(guard) => Some(Self::register(id, guard)),
            Err(TryLockError::Poisoned(poisoned)) => Some(Self::register(id, poisoned.into_inner())),
            Err(TryLockError::WouldBlock) => None,
        }
    }

    fn register(id: u64, guard: MutexGuard<'a, ()>) -> Self {
        HELD_LOCKS.with(|held| held.borrow_mut().push(id));
        log::trace!("Runtime {} locked", id);
        Self {
            id,
            guard: Some(guard),
        }
    }

    /// Whether this guard actually took the lock (as opposed to nesting).
    pub fn is_outermost(&self) -> bool {
        self.guard.is_some()
    }

    pub fn runtime_id(&self) -> u64 {
        self.id
    }
}

impl Drop for RuntimeLock<'_> {
    fn drop(&mut self) {
        if self.guard.is_none() {
            return;
        }

        HELD_LOCKS.with(|held| {
            let mut held = held.borrow_mut();
            if let Some(pos) = held.iter().rposition(|id| *id == self.id) {
                held.remove(pos);
            }
        });
        log::trace!("Runtime {} unlocked", self.id);
        // MutexGuard drops after the bookkeeping above
    }
}

impl std::fmt::Debug for RuntimeLock<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeLock")
            .field("id", &self.id)
            .field("outermost", &self.is_outermost())
            .finish()
    }
}
