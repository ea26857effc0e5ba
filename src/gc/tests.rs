//! Tests for handle lifetime plumbing.

use std::sync::{Arc, Mutex};

use super::*;
use crate::engine::{NativeError, ReferenceType};
use crate::error::Error;
use crate::reference_table::ReferenceTable;
use crate::values::ReferenceState;

#[test]
fn test_queue_creation() {
    let queue = DeferredReleaseQueue::new();
    assert!(queue.is_empty());
    assert_eq!(queue.len(), 0);
    assert!(!queue.has_pending());
}

#[test]
fn test_queue_processes_in_order() {
    let queue = DeferredReleaseQueue::new();
    queue.defer(3);
    queue.defer(1);
    queue.defer(2);
    assert_eq!(queue.len(), 3);

    let mut released = Vec::new();
    assert_eq!(queue.process_all(|h| released.push(h)), 3);
    assert_eq!(released, vec![3, 1, 2]);
    assert!(queue.is_empty());

    // Nothing left
    assert_eq!(queue.process_all(|_| panic!("queue should be empty")), 0);
}

#[test]
fn test_deferred_from_other_thread() {
    let queue = Arc::new(DeferredReleaseQueue::new());
    let handles: Vec<_> = (0..4)
        .map(|i| {
            let queue = Arc::clone(&queue);
            std::thread::spawn(move || queue.defer(100 + i))
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let mut released = Vec::new();
    queue.process_all(|h| released.push(h));
    released.sort();
    assert_eq!(released, vec![100, 101, 102, 103]);
}

#[test]
fn test_lock_is_reentrant() {
    let mutex = Mutex::new(());
    let outer = RuntimeLock::acquire(1, &mutex);
    assert!(outer.is_outermost());
    assert!(is_held_by_current_thread(1));

    {
        let inner = RuntimeLock::acquire(1, &mutex);
        assert!(!inner.is_outermost());
    }
    // Dropping the nested guard keeps the lock
    assert!(is_held_by_current_thread(1));

    drop(outer);
    assert!(!is_held_by_current_thread(1));
}

#[test]
fn test_try_acquire_from_other_thread() {
    let mutex = Arc::new(Mutex::new(()));
    let lock = RuntimeLock::acquire(2, &mutex);

    let other = Arc::clone(&mutex);
    let acquired = std::thread::spawn(move || RuntimeLock::try_acquire(2, &other).is_some())
        .join()
        .unwrap();
    assert!(!acquired);

    drop(lock);
    assert!(RuntimeLock::try_acquire(2, &mutex).is_some());
}

#[test]
fn test_locks_are_tracked_per_runtime() {
    let first = Mutex::new(());
    let second = Mutex::new(());

    let a = RuntimeLock::acquire(10, &first);
    let b = RuntimeLock::acquire(11, &second);
    assert!(b.is_outermost());

    drop(a);
    assert!(!is_held_by_current_thread(10));
    assert!(is_held_by_current_thread(11));
}

#[test]
fn test_mark_weak_is_idempotent() {
    let weak = WeakReferences::new();
    let state = ReferenceState::new(5, ReferenceType::Object);
    let mut calls = 0;

    assert!(weak.mark_weak(&state, |_| {
        calls += 1;
        Ok(())
    })
    .unwrap());
    assert!(!weak.mark_weak(&state, |_| {
        calls += 1;
        Ok(())
    })
    .unwrap());
    assert_eq!(calls, 1);
    assert!(state.is_weak());

    assert!(weak.clear_weak(&state, |_| Ok(())).unwrap());
    assert!(!state.is_weak());
}

#[test]
fn test_mark_weak_on_closed_state() {
    let weak = WeakReferences::new();
    let state = ReferenceState::new(5, ReferenceType::Object);
    state.take_handle();

    let result = weak.mark_weak(&state, |_| Ok(()));
    assert!(matches!(result, Err(Error::ReferenceClosed)));
}

#[test]
fn test_mark_weak_native_failure_keeps_strong() {
    let weak = WeakReferences::new();
    let state = ReferenceState::new(5, ReferenceType::Object);

    let err = weak
        .mark_weak(&state, |h| Err(NativeError::InvalidHandle(h)))
        .unwrap_err();
    assert_eq!(err.operation(), Some("set_weak"));
    assert!(!state.is_weak());
}

#[test]
fn test_collected_is_evicted_without_release() {
    let weak = WeakReferences::new();
    let table = ReferenceTable::new();
    let state = Arc::new(ReferenceState::new(9, ReferenceType::Map));
    table.insert(&state).unwrap();
    state.set_weak(true);

    let evicted = weak.on_collected(&table, 9).unwrap();
    assert!(Arc::ptr_eq(&evicted, &state));
    assert!(state.is_closed());
    assert_eq!(table.count(), 0);
    assert_eq!(weak.collected_count(), 1);

    // Unknown handles are ignored
    assert!(weak.on_collected(&table, 9).is_none());
    assert_eq!(weak.collected_count(), 1);
}

#[test]
fn test_pressure_kinds() {
    assert!(MemoryNotification::ThresholdExceeded.is_pressure());
    assert!(MemoryNotification::CollectionThresholdExceeded.is_pressure());
    assert!(!MemoryNotification::Other.is_pressure());
}

#[test]
fn test_notifier_requires_registration() {
    let registry = Arc::new(crate::host::RuntimeRegistry::new());
    let notifier = MemoryNotifier::new(registry);

    assert_eq!(notifier.handle_notification(MemoryNotification::ThresholdExceeded), 0);
    assert_eq!(notifier.notification_count(), 0);

    notifier.register_listeners();
    notifier.register_listeners();
    assert!(notifier.is_registered());
    assert_eq!(notifier.handle_notification(MemoryNotification::ThresholdExceeded), 0);
    assert_eq!(notifier.notification_count(), 1);

    notifier.unregister_listener();
    assert!(!notifier.is_registered());
}
