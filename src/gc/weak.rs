//! Weak reference coordinator.
//!
//! A weak handle may be reclaimed by the foreign collector at any time. When
//! that happens the engine calls back through `on_weak_collected`, and the
//! wrapper is evicted from the handle table without a second release: the
//! foreign side already freed it.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::engine::{NativeHandle, NativeResult};
use crate::error::{Error, Result};
use crate::reference_table::ReferenceTable;
use crate::values::ReferenceState;

#[derive(Debug, Default)]
pub struct WeakReferences {
    collected: AtomicU64,
}

impl WeakReferences {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flip `state` to weak through `native`. Returns `false` if it already
    /// was weak, in which case the engine is not called.
    pub(crate) fn mark_weak<F>(&self, state: &ReferenceState, native: F) -> Result<bool>
    where
        F: FnOnce(NativeHandle) -> NativeResult<()>,
    {
        let handle = state.handle();
        if state.is_closed() {
            return Err(Error::ReferenceClosed);
        }
        if state.is_weak() {
            return Ok(false);
        }

        native(handle).map_err(Error::native("set_weak"))?;
        state.set_weak(true);
        tracing::trace!(handle, "reference marked weak");
        Ok(true)
    }

    /// Flip `state` back to strong. Returns `false` if it already was strong.
    pub(crate) fn clear_weak<F>(&self, state: &ReferenceState, native: F) -> Result<bool>
    where
        F: FnOnce(NativeHandle) -> NativeResult<()>,
    {
        let handle = state.handle();
        if state.is_closed() {
            return Err(Error::ReferenceClosed);
        }
        if !state.is_weak() {
            return Ok(false);
        }

        native(handle).map_err(Error::native("clear_weak"))?;
        state.set_weak(false);
        tracing::trace!(handle, "reference made strong");
        Ok(true)
    }

    /// Evict a handle the foreign collector reclaimed.
    ///
    /// The wrapper is invalidated but the handle is not released again.
    pub(crate) fn on_collected(
        &self,
        table: &ReferenceTable,
        handle: NativeHandle,
    ) -> Option<Arc<ReferenceState>> {
        let state = table.remove(handle)?;
        state.take_handle();
        self.collected.fetch_add(1, Ordering::Relaxed);

        tracing::trace!(handle, "weak reference collected");
        Some(state)
    }

    /// Number of weak handles the foreign collector has reclaimed.
    pub fn collected_count(&self) -> u64 {
        self.collected.load(Ordering::Relaxed)
    }
}
