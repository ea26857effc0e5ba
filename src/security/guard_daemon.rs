//! Wall-clock timeout enforcement via one shared daemon thread.
//!
//! ## How it works
//!
//! 1. Each [`Guard`] is an entry in a deadline-ordered queue
//! 2. The daemon thread sleeps on a condition variable until the earliest
//!    deadline, or until the queue changes
//! 3. Expired entries are popped, the queue lock is dropped, then each owner
//!    gets `terminate_execution()`
//! 4. Dropping a guard removes its entry
//!
//! ## Thread safety
//!
//! Termination is delivered without taking any runtime lock, so it reaches a
//! runtime that is busy inside a foreign call.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

/// Something a guard can interrupt.
pub trait ExecutionTarget: Send + Sync {
    /// Async-safe, idempotent interrupt of in-flight execution.
    fn terminate_execution(&self);
}

type GuardKey = (Instant, u64);

struct GuardEntry {
    target: Weak<dyn ExecutionTarget>,
    triggered: Arc<AtomicBool>,
    start_time: Instant,
}

impl GuardEntry {
    fn fire(self) {
        self.triggered.store(true, Ordering::SeqCst);
        match self.target.upgrade() {
            Some(target) => {
                log::warn!(
                    "Guard timeout after {:?}, terminating execution",
                    self.start_time.elapsed()
                );
                target.terminate_execution();
            }
            None => log::debug!("Guard fired for a runtime that is gone"),
        }
    }
}

#[derive(Default)]
struct GuardQueue {
    entries: BTreeMap<GuardKey, GuardEntry>,
    /// Guard id → current deadline, to find entries by id.
    deadlines: HashMap<u64, Instant>,
    next_id: u64,
    quitting: bool,
}

impl GuardQueue {
    fn insert(&mut self, id: u64, deadline: Instant, entry: GuardEntry) {
        self.deadlines.insert(id, deadline);
        self.entries.insert((deadline, id), entry);
    }

    fn remove(&mut self, id: u64) -> Option<GuardEntry> {
        let deadline = self.deadlines.remove(&id)?;
        self.entries.remove(&(deadline, id))
    }

    fn pop_expired(&mut self, now: Instant) -> Vec<GuardEntry> {
        let mut expired = Vec::new();
        while let Some(entry) = self.entries.first_entry() {
            let (deadline, id) = *entry.key();
            if deadline > now {
                break;
            }
            expired.push(entry.remove());
            self.deadlines.remove(&id);
        }
        expired
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.entries.keys().next().map(|(deadline, _)| *deadline)
    }
}

struct DaemonShared {
    queue: Mutex<GuardQueue>,
    wakeup: Condvar,
}

impl DaemonShared {
    fn lock(&self) -> std::sync::MutexGuard<'_, GuardQueue> {
        self.queue.lock().expect("guard queue poisoned")
    }

    fn run(&self) {
        let mut queue = self.lock();
        loop {
            if queue.quitting {
                break;
            }

            let expired = queue.pop_expired(Instant::now());
            if !expired.is_empty() {
                // Never call into a runtime while holding the queue.
                drop(queue);
                for entry in expired {
                    entry.fire();
                }
                queue = self.lock();
                continue;
            }

            queue = match queue.next_deadline() {
                Some(deadline) => {
                    let wait = deadline.saturating_duration_since(Instant::now());
                    self.wakeup
                        .wait_timeout(queue, wait)
                        .expect("guard queue poisoned")
                        .0
                }
                None => self.wakeup.wait(queue).expect("guard queue poisoned"),
            };
        }
        log::debug!("Guard daemon stopped");
    }
}

/// Background watchdog shared by every runtime of a host.
///
/// The thread starts on the first scheduled guard.
pub struct GuardDaemon {
    shared: Arc<DaemonShared>,
    thread_name: String,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl GuardDaemon {
    pub fn new(thread_name: impl Into<String>) -> Self {
        Self {
            shared: Arc::new(DaemonShared {
                queue: Mutex::new(GuardQueue::default()),
                wakeup: Condvar::new(),
            }),
            thread_name: thread_name.into(),
            thread: Mutex::new(None),
        }
    }

    fn ensure_started(&self) -> Result<()> {
        let mut thread = self.thread.lock().expect("guard daemon poisoned");
        if thread.is_some() {
            return Ok(());
        }

        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name(self.thread_name.clone())
            .spawn(move || shared.run())?;
        log::debug!("Guard daemon started ({})", self.thread_name);
        *thread = Some(handle);
        Ok(())
    }

    /// Arm a guard that terminates `target` once `timeout` elapses.
    pub fn schedule(&self, target: Weak<dyn ExecutionTarget>, timeout: Duration) -> Result<Guard> {
        if timeout.is_zero() {
            return Err(Error::InvalidArgument(
                "guard timeout must be positive".to_string(),
            ));
        }
        if self.shared.lock().quitting {
            return Err(Error::HostClosed);
        }
        self.ensure_started()?;

        let start_time = Instant::now();
        let deadline = start_time + timeout;
        let triggered = Arc::new(AtomicBool::new(false));

        let id = {
            let mut queue = self.shared.lock();
            let id = queue.next_id;
            queue.next_id += 1;
            queue.insert(
                id,
                deadline,
                GuardEntry {
                    target: target.clone(),
                    triggered: Arc::clone(&triggered),
                    start_time,
                },
            );
            id
        };
        self.shared.wakeup.notify_one();

        Ok(Guard {
            id,
            shared: Arc::clone(&self.shared),
            target,
            triggered,
            start_time,
            deadline,
        })
    }

    /// Guards currently waiting for their deadline.
    pub fn queue_len(&self) -> usize {
        self.shared.lock().entries.len()
    }

    pub fn is_running(&self) -> bool {
        self.thread
            .lock()
            .expect("guard daemon poisoned")
            .is_some()
    }

    /// Stop the daemon thread and drop every pending guard. Idempotent.
    pub fn shutdown(&self) {
        {
            let mut queue = self.shared.lock();
            queue.quitting = true;
            queue.entries.clear();
            queue.deadlines.clear();
        }
        self.shared.wakeup.notify_all();

        let handle = self.thread.lock().expect("guard daemon poisoned").take();
        if let Some(handle) = handle {
            // The daemon itself may drop the last host reference.
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if let Err(e) = handle.join() {
                log::error!("Guard daemon thread panicked: {:?}", e);
            }
        }
    }
}

impl Drop for GuardDaemon {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for GuardDaemon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuardDaemon")
            .field("thread_name", &self.thread_name)
            .field("queue_len", &self.queue_len())
            .field("running", &self.is_running())
            .finish()
    }
}

/// RAII deadline on one guarded execution.
///
/// Dropping the guard cancels it.
///
/// # Example
///
/// ```rust,ignore
/// let guard = runtime.guard(Duration::from_secs(30))?;
/// let result = runtime.execute(source);
/// if guard.was_triggered() {
///     // result is a termination error
/// }
/// ```
pub struct Guard {
    id: u64,
    shared: Arc<DaemonShared>,
    target: Weak<dyn ExecutionTarget>,
    triggered: Arc<AtomicBool>,
    start_time: Instant,
    deadline: Instant,
}

impl Guard {
    pub fn start_time(&self) -> Instant {
        self.start_time
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Whether the deadline passed and termination was requested.
    pub fn was_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    /// Whether the guard is still waiting for its deadline.
    pub fn is_pending(&self) -> bool {
        self.shared.lock().deadlines.contains_key(&self.id)
    }

    /// Move the deadline to `start_time + timeout`.
    ///
    /// The entry is removed and re-inserted to keep the queue ordered. A
    /// guard that already fired is armed again.
    pub fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        if timeout.is_zero() {
            return Err(Error::InvalidArgument(
                "guard timeout must be positive".to_string(),
            ));
        }

        let deadline = self.start_time + timeout;
        {
            let mut queue = self.shared.lock();
            if queue.quitting {
                return Err(Error::HostClosed);
            }
            queue.remove(self.id);
            self.triggered.store(false, Ordering::SeqCst);
            queue.insert(
                self.id,
                deadline,
                GuardEntry {
                    target: self.target.clone(),
                    triggered: Arc::clone(&self.triggered),
                    start_time: self.start_time,
                },
            );
        }
        self.deadline = deadline;
        self.shared.wakeup.notify_one();
        Ok(())
    }

    /// Remove the guard from the queue. Idempotent.
    pub fn cancel(&self) {
        let removed = self.shared.lock().remove(self.id);
        if removed.is_some() {
            log::trace!("Guard {} cancelled", self.id);
        }
    }
}

impl Drop for Guard {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl std::fmt::Debug for Guard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Guard")
            .field("id", &self.id)
            .field("deadline", &self.deadline)
            .field("triggered", &self.was_triggered())
            .finish()
    }
}
