//! Bounded pool of reusable runtimes.
//!
//! Pooled runtimes are never destroyed by an ordinary `close()`. When a
//! [`PooledRuntime`] is dropped its context is reset (every reference it
//! handed out is released) and the runtime goes back to the idle list.
//!
//! ```text
//! acquire() ── semaphore permit ── idle.pop() or host.create_runtime(pooled)
//!                                        │
//!                                 PooledRuntime (Deref<Target = Runtime>)
//!                                        │ drop
//!                        reset_context() ─┴─ ok  → idle.push()
//!                                            err → close(force)
//! ```

use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::{Error, Result};
use crate::host::Host;
use crate::observers::RuntimeObserver;
use crate::options::RuntimeOptions;
use crate::runtime::Runtime;

/// Default number of runtimes a pool hands out at once.
pub const DEFAULT_POOL_MAX_SIZE: usize = 4;

/// Reset the context of a runtime when it returns to the pool.
pub const DEFAULT_RESET_ON_RELEASE: bool = true;

/// Configuration for a [`RuntimePool`].
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of runtimes lent out concurrently.
    pub max_size: usize,
    /// Reset each runtime's context before it goes back to the idle list.
    pub reset_on_release: bool,
    /// How long `acquire()` waits for a free slot. `None` waits forever.
    pub acquire_timeout: Option<Duration>,
    /// Options for runtimes the pool creates. `pooled` is forced on.
    pub options: RuntimeOptions,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: DEFAULT_POOL_MAX_SIZE,
            reset_on_release: DEFAULT_RESET_ON_RELEASE,
            acquire_timeout: None,
            options: RuntimeOptions::pooled(),
        }
    }
}

impl PoolConfig {
    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = Some(timeout);
        self
    }
}

/// Pool statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Runtimes waiting in the idle list
    pub idle: usize,
    /// Runtimes currently lent out
    pub active: usize,
    /// Maximum concurrent runtimes
    pub capacity: usize,
    /// Runtimes created over the pool's lifetime
    pub created: usize,
}

struct PoolShared {
    host: Host,
    config: PoolConfig,
    idle: Mutex<Vec<Runtime>>,
    semaphore: Arc<Semaphore>,
    created: AtomicUsize,
    closed: AtomicBool,
}

impl PoolShared {
    fn give_back(&self, runtime: Runtime) {
        runtime.inner().set_in_use(false);

        if self.closed.load(Ordering::Acquire) || runtime.is_closed() {
            close_quietly(&runtime);
            return;
        }

        if self.config.reset_on_release
            && let Err(e) = runtime.reset_context()
        {
            log::warn!(
                "Runtime {} failed to reset, discarding it: {}",
                runtime.handle(),
                e
            );
            close_quietly(&runtime);
            return;
        }

        self.idle.lock().expect("pool idle list poisoned").push(runtime);
    }
}

fn close_quietly(runtime: &Runtime) {
    if let Err(e) = runtime.close(true) {
        log::warn!("Failed to close pooled runtime: {}", e);
    }
}

/// Bounded pool of runtimes created with [`RuntimeOptions::pooled`].
#[derive(Clone)]
pub struct RuntimePool {
    shared: Arc<PoolShared>,
}

impl RuntimePool {
    pub fn new(host: Host, mut config: PoolConfig) -> Self {
        config.options.pooled = true;
        log::info!(
            "Initializing RuntimePool with max_size={}, heap_max={}MB",
            config.max_size,
            config.options.heap_max_mb
        );

        Self {
            shared: Arc::new(PoolShared {
                host,
                semaphore: Arc::new(Semaphore::new(config.max_size)),
                config,
                idle: Mutex::new(Vec::new()),
                created: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// Borrow a runtime, waiting for a free slot if all are lent out.
    pub async fn acquire(&self) -> Result<PooledRuntime> {
        let semaphore = Arc::clone(&self.shared.semaphore);
        let permit = match self.shared.config.acquire_timeout {
            Some(timeout) => tokio::time::timeout(timeout, semaphore.acquire_owned())
                .await
                .map_err(|_| Error::PoolTimeout(timeout))?,
            None => semaphore.acquire_owned().await,
        }
        .map_err(|_| Error::PoolClosed)?;

        self.checkout(permit)
    }

    /// Borrow a runtime only if a slot is free right now.
    pub fn try_acquire(&self) -> Result<Option<PooledRuntime>> {
        match Arc::clone(&self.shared.semaphore).try_acquire_owned() {
            Ok(permit) => self.checkout(permit).map(Some),
            Err(tokio::sync::TryAcquireError::NoPermits) => Ok(None),
            Err(tokio::sync::TryAcquireError::Closed) => Err(Error::PoolClosed),
        }
    }

    fn checkout(&self, permit: OwnedSemaphorePermit) -> Result<PooledRuntime> {
        if self.is_closed() {
            return Err(Error::PoolClosed);
        }

        let idle = self.shared.idle.lock().expect("pool idle list poisoned").pop();
        let runtime = match idle {
            Some(runtime) => {
                tracing::debug!(runtime = runtime.handle(), "pool hit");
                runtime
            }
            None => {
                let runtime = self
                    .shared
                    .host
                    .create_runtime(self.shared.config.options.clone())?;
                let created = self.shared.created.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::debug!(runtime = runtime.handle(), created, "pool miss, runtime created");
                runtime
            }
        };
        runtime.inner().set_in_use(true);

        Ok(PooledRuntime {
            runtime: Some(runtime),
            pool: Arc::clone(&self.shared),
            _permit: permit,
        })
    }

    pub fn stats(&self) -> PoolStats {
        let idle = self.shared.idle.lock().expect("pool idle list poisoned").len();
        let capacity = self.shared.config.max_size;
        PoolStats {
            idle,
            active: capacity - self.shared.semaphore.available_permits().min(capacity),
            capacity,
            created: self.shared.created.load(Ordering::Relaxed),
        }
    }

    /// Run `observer` over idle runtimes until it asks to stop.
    pub fn observe(&self, observer: &mut dyn RuntimeObserver) -> usize {
        let idle = self.shared.idle.lock().expect("pool idle list poisoned").clone();
        let mut observed = 0;
        for runtime in &idle {
            observed += 1;
            if !observer.observe(runtime) {
                break;
            }
        }
        observed
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Force-close idle runtimes and stop lending. Runtimes still lent out
    /// are force-closed when they come back.
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.semaphore.close();

        let idle = std::mem::take(&mut *self.shared.idle.lock().expect("pool idle list poisoned"));
        log::info!("Closing RuntimePool ({} idle runtimes)", idle.len());
        for runtime in &idle {
            close_quietly(runtime);
        }
    }
}

impl std::fmt::Debug for RuntimePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimePool")
            .field("stats", &self.stats())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// A runtime on loan from a [`RuntimePool`]. Returned on drop.
pub struct PooledRuntime {
    runtime: Option<Runtime>,
    pool: Arc<PoolShared>,
    _permit: OwnedSemaphorePermit,
}

impl Deref for PooledRuntime {
    type Target = Runtime;

    fn deref(&self) -> &Runtime {
        // Only taken in drop.
        self.runtime.as_ref().expect("pooled runtime already returned")
    }
}

impl Drop for PooledRuntime {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            self.pool.give_back(runtime);
        }
    }
}

impl std::fmt::Debug for PooledRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("PooledRuntime").field(&self.runtime).finish()
    }
}
