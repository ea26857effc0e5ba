//! Per-runtime handle table.
//!
//! Maps each live native handle to the shared state of the wrapper that owns
//! it. The mutex guards map mutation only; native release calls always happen
//! after it is dropped.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::engine::{INVALID_HANDLE, NativeHandle};
use crate::error::{Error, Result};
use crate::values::ReferenceState;

struct TableInner {
    entries: HashMap<NativeHandle, Arc<ReferenceState>>,
    /// Set during teardown so values created concurrently cannot slip in
    /// after the drain snapshot.
    sealed: bool,
}

pub(crate) struct ReferenceTable {
    inner: Mutex<TableInner>,
}

impl Default for ReferenceTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ReferenceTable {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(TableInner {
                entries: HashMap::with_capacity(64),
                sealed: false,
            }),
        }
    }

    /// Store `state` under its current handle.
    ///
    /// Returns `Ok(false)` without storing anything for the invalid handle.
    pub(crate) fn insert(&self, state: &Arc<ReferenceState>) -> Result<bool> {
        let handle = state.handle();
        if handle == INVALID_HANDLE {
            return Ok(false);
        }

        let mut inner = self.inner.lock().expect("reference table poisoned");
        if inner.sealed {
            return Err(Error::RuntimeClosed);
        }
        let previous = inner.entries.insert(handle, Arc::clone(state));
        debug_assert!(previous.is_none(), "native handle {handle} issued twice");

        tracing::trace!(handle, kind = %state.kind(), "reference added");
        Ok(true)
    }

    pub(crate) fn remove(&self, handle: NativeHandle) -> Option<Arc<ReferenceState>> {
        let removed = self
            .inner
            .lock()
            .expect("reference table poisoned")
            .entries
            .remove(&handle);

        if removed.is_some() {
            tracing::trace!(handle, "reference removed");
        }
        removed
    }

    pub(crate) fn contains(&self, handle: NativeHandle) -> bool {
        self.inner
            .lock()
            .expect("reference table poisoned")
            .entries
            .contains_key(&handle)
    }

    pub(crate) fn count(&self) -> usize {
        self.inner
            .lock()
            .expect("reference table poisoned")
            .entries
            .len()
    }

    pub(crate) fn weak_count(&self) -> usize {
        self.inner
            .lock()
            .expect("reference table poisoned")
            .entries
            .values()
            .filter(|state| state.is_weak())
            .count()
    }

    /// Snapshot and clear every entry. With `seal`, every later insert fails
    /// with [`Error::RuntimeClosed`].
    pub(crate) fn drain(&self, seal: bool) -> Vec<Arc<ReferenceState>> {
        let mut inner = self.inner.lock().expect("reference table poisoned");
        if seal {
            inner.sealed = true;
        }
        inner.entries.drain().map(|(_, state)| state).collect()
    }

    pub(crate) fn is_sealed(&self) -> bool {
        self.inner.lock().expect("reference table poisoned").sealed
    }
}

impl std::fmt::Debug for ReferenceTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReferenceTable")
            .field("count", &self.count())
            .field("sealed", &self.is_sealed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ReferenceType;

    fn state(handle: NativeHandle) -> Arc<ReferenceState> {
        Arc::new(ReferenceState::new(handle, ReferenceType::Object))
    }

    #[test]
    fn test_insert_and_remove() {
        let table = ReferenceTable::new();
        let a = state(1);

        assert!(table.insert(&a).unwrap());
        assert!(table.contains(1));
        assert_eq!(table.count(), 1);

        let removed = table.remove(1).unwrap();
        assert!(Arc::ptr_eq(&removed, &a));
        assert!(table.remove(1).is_none());
        assert_eq!(table.count(), 0);
    }

    #[test]
    fn test_invalid_handle_is_ignored() {
        let table = ReferenceTable::new();
        assert!(!table.insert(&state(INVALID_HANDLE)).unwrap());
        assert_eq!(table.count(), 0);
    }

    #[test]
    fn test_sealed_table_rejects_inserts() {
        let table = ReferenceTable::new();
        table.insert(&state(1)).unwrap();
        table.insert(&state(2)).unwrap();

        assert_eq!(table.drain(false).len(), 2);
        assert!(!table.is_sealed());

        table.insert(&state(1)).unwrap();
        table.insert(&state(2)).unwrap();
        let drained = table.drain(true);
        assert_eq!(drained.len(), 2);
        assert_eq!(table.count(), 0);
        assert!(matches!(table.insert(&state(3)), Err(Error::RuntimeClosed)));
        assert!(table.is_sealed());
    }

    #[test]
    fn test_weak_count() {
        let table = ReferenceTable::new();
        let a = state(1);
        let b = state(2);
        table.insert(&a).unwrap();
        table.insert(&b).unwrap();

        b.set_weak(true);
        assert_eq!(table.weak_count(), 1);
    }
}
