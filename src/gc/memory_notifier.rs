//! Process memory-pressure listener.
//!
//! A notification never drives the foreign collector itself. It only raises
//! the GC-scheduled flag on every registered runtime; each runtime turns that
//! into one low-memory hint the next time it removes a reference.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::host::RuntimeRegistry;

/// Kind of process memory-pressure signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryNotification {
    /// Usage crossed the configured threshold.
    ThresholdExceeded,
    /// Usage was still above the threshold after a managed collection.
    CollectionThresholdExceeded,
    Other,
}

impl MemoryNotification {
    /// Whether this signal should schedule a foreign collection.
    pub fn is_pressure(self) -> bool {
        matches!(
            self,
            MemoryNotification::ThresholdExceeded | MemoryNotification::CollectionThresholdExceeded
        )
    }
}

pub struct MemoryNotifier {
    registered: AtomicBool,
    registry: Arc<RuntimeRegistry>,
    notifications: AtomicU64,
}

impl MemoryNotifier {
    pub(crate) fn new(registry: Arc<RuntimeRegistry>) -> Self {
        Self {
            registered: AtomicBool::new(false),
            registry,
            notifications: AtomicU64::new(0),
        }
    }

    /// Start reacting to notifications. Idempotent.
    pub fn register_listeners(&self) {
        if !self.registered.swap(true, Ordering::AcqRel) {
            log::debug!("Memory notifier registered");
        }
    }

    /// Stop reacting to notifications. Idempotent.
    pub fn unregister_listener(&self) {
        if self.registered.swap(false, Ordering::AcqRel) {
            log::debug!("Memory notifier unregistered");
        }
    }

    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::Acquire)
    }

    /// Deliver one notification. Returns how many runtimes were flagged.
    pub fn handle_notification(&self, notification: MemoryNotification) -> usize {
        if !self.is_registered() || !notification.is_pressure() {
            return 0;
        }
        self.notifications.fetch_add(1, Ordering::Relaxed);

        // Snapshot first so the registry lock is not held while flagging.
        let runtimes = self.registry.snapshot();
        for runtime in &runtimes {
            runtime.schedule_gc();
        }

        log::debug!(
            "Memory pressure ({:?}): scheduled GC on {} runtime(s)",
            notification,
            runtimes.len()
        );
        runtimes.len()
    }

    /// Pressure notifications handled while registered.
    pub fn notification_count(&self) -> u64 {
        self.notifications.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for MemoryNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryNotifier")
            .field("registered", &self.is_registered())
            .field("notifications", &self.notification_count())
            .finish()
    }
}
