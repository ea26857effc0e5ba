//! Deferred release queue for native handles.
//!
//! ## Problem
//!
//! A [`ValueRef`](crate::ValueRef) can be dropped on any thread, including
//! one that does not hold its runtime's lock while another thread is in the
//! middle of a native call. Releasing the handle right there would race the
//! engine.
//!
//! ## Solution
//!
//! Queue the handle instead, then release everything pending the next time
//! the runtime lock is acquired.
//!
//! ```ignore
//! // From any thread
//! queue.defer(handle);
//!
//! // Under the runtime lock
//! queue.process_all(|handle| engine.release_reference(runtime, handle));
//! ```

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::engine::NativeHandle;

/// Per-runtime queue of handles waiting for release.
pub struct DeferredReleaseQueue {
    queue: Mutex<VecDeque<NativeHandle>>,

    /// Fast check for pending items (avoids lock acquisition on hot path)
    pending_count: AtomicU64,
}

impl Default for DeferredReleaseQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl DeferredReleaseQueue {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::with_capacity(8)),
            pending_count: AtomicU64::new(0),
        }
    }

    /// Queue a handle for release. Callable from any thread without the
    /// runtime lock.
    pub fn defer(&self, handle: NativeHandle) {
        self.queue
            .lock()
            .expect("deferred release queue poisoned")
            .push_back(handle);
        self.pending_count.fetch_add(1, Ordering::Release);

        tracing::trace!(handle, pending = self.len(), "deferred handle release");
    }

    /// Lock-free check for pending releases.
    #[inline]
    pub fn has_pending(&self) -> bool {
        self.pending_count.load(Ordering::Acquire) > 0
    }

    #[inline]
    pub fn len(&self) -> u64 {
        self.pending_count.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        !self.has_pending()
    }

    /// Hand every pending handle to `release` and return how many there were.
    ///
    /// Must be called while holding the runtime lock.
    pub fn process_all<F>(&self, mut release: F) -> usize
    where
        F: FnMut(NativeHandle),
    {
        if !self.has_pending() {
            return 0;
        }

        let handles: VecDeque<NativeHandle> = {
            let mut queue = self.queue.lock().expect("deferred release queue poisoned");
            std::mem::take(&mut *queue)
        };

        let count = handles.len();
        if count == 0 {
            return 0;
        }

        for handle in handles {
            release(handle);
        }

        self.pending_count
            .fetch_sub(count as u64, Ordering::Release);

        tracing::trace!("Processed {} deferred handle releases", count);
        count
    }
}

impl std::fmt::Debug for DeferredReleaseQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeferredReleaseQueue")
            .field("pending_count", &self.len())
            .finish()
    }
}
