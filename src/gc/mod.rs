//! Handle lifetime plumbing.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  RuntimeLock (RAII)                                         │
//! │  ├── Serializes native calls on one runtime                 │
//! │  ├── Re-entrant per thread (thread-local bookkeeping)       │
//! │  └── Outermost acquisition drains deferred releases         │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │  DeferredReleaseQueue                                       │
//! │  ├── Handles whose wrapper dropped while the lock was busy  │
//! │  └── Released on next lock acquisition                      │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │  WeakReferences                                             │
//! │  ├── strong ⇄ weak transitions (idempotent)                 │
//! │  └── Foreign collection → evict without release             │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │  MemoryNotifier                                             │
//! │  └── Pressure signal → GC-scheduled flag on every runtime   │
//! └─────────────────────────────────────────────────────────────┘
//! ```

mod deferred_release;
mod memory_notifier;
mod runtime_lock;
mod weak;

pub use deferred_release::DeferredReleaseQueue;
pub use memory_notifier::{MemoryNotification, MemoryNotifier};
pub use runtime_lock::{RuntimeLock, is_held_by_current_thread};
pub use weak::WeakReferences;

#[cfg(test)]
mod tests;
