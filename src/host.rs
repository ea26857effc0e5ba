//! Host - the process-wide owner of runtimes.
//!
//! The host loads the native library on first use, keeps a registry of every
//! live runtime, runs the guard daemon and owns the memory notifier. It is an
//! ordinary value: build one per process (or one per test) and clone it where
//! needed.
//!
//! ```text
//! Host ── Arc<HostShared>
//!         ├── engine        OnceLock: loaded once, failure re-surfaced
//!         ├── registry      handle → Weak<runtime>
//!         ├── daemon        GuardDaemon thread
//!         └── notifier      MemoryNotifier → registry
//! ```
//!
//! Lock order: a runtime lock may be held while nothing else is; the registry
//! lock is never taken while a runtime lock is held.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use crate::engine::{EngineLoader, NativeEngine, NativeHandle, NativeResult};
use crate::error::{Error, Result};
use crate::gc::{MemoryNotification, MemoryNotifier};
use crate::observers::RuntimeObserver;
use crate::options::{HostConfig, RuntimeOptions};
use crate::runtime::{Runtime, RuntimeInner};
use crate::security::GuardDaemon;

/// Process-wide table of live runtimes, keyed by native handle.
///
/// Holds runtimes weakly: registration never keeps a runtime alive.
#[derive(Default)]
pub(crate) struct RuntimeRegistry {
    runtimes: Mutex<HashMap<NativeHandle, Weak<RuntimeInner>>>,
}

impl RuntimeRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn insert(&self, handle: NativeHandle, runtime: Weak<RuntimeInner>) {
        self.runtimes
            .lock()
            .expect("runtime registry poisoned")
            .insert(handle, runtime);
    }

    fn remove(&self, handle: NativeHandle) -> bool {
        self.runtimes
            .lock()
            .expect("runtime registry poisoned")
            .remove(&handle)
            .is_some()
    }

    pub(crate) fn len(&self) -> usize {
        self.runtimes.lock().expect("runtime registry poisoned").len()
    }

    /// Live runtimes at this instant. The registry lock is released before
    /// the caller touches any of them.
    pub(crate) fn snapshot(&self) -> Vec<Arc<RuntimeInner>> {
        self.runtimes
            .lock()
            .expect("runtime registry poisoned")
            .values()
            .filter_map(Weak::upgrade)
            .collect()
    }
}

pub(crate) struct HostShared {
    loader: Box<dyn EngineLoader>,
    engine: OnceLock<std::result::Result<Arc<dyn NativeEngine>, String>>,
    config: HostConfig,
    registry: Arc<RuntimeRegistry>,
    daemon: GuardDaemon,
    notifier: MemoryNotifier,
    closed: AtomicBool,
}

impl HostShared {
    pub(crate) fn daemon(&self) -> &GuardDaemon {
        &self.daemon
    }

    pub(crate) fn unregister(&self, handle: NativeHandle) {
        if self.registry.remove(handle) {
            log::debug!("Runtime {} unregistered from host", handle);
        }
    }

    fn engine(&self) -> Result<Arc<dyn NativeEngine>> {
        self.engine
            .get_or_init(|| match self.loader.load() {
                Ok(engine) => {
                    log::info!("Native library loaded");
                    Ok(engine)
                }
                Err(e) => {
                    log::error!("Failed to load native library: {}", e);
                    Err(e.to_string())
                }
            })
            .clone()
            .map_err(Error::LibraryNotLoaded)
    }
}

/// Process-wide runtime host.
#[derive(Clone)]
pub struct Host {
    shared: Arc<HostShared>,
}

impl Host {
    /// Build a host that loads its engine through `loader` on first use.
    pub fn new(loader: impl EngineLoader + 'static, config: HostConfig) -> Self {
        let registry = Arc::new(RuntimeRegistry::new());
        let notifier = MemoryNotifier::new(Arc::clone(&registry));
        if config.register_memory_notifier {
            notifier.register_listeners();
        }

        Self {
            shared: Arc::new(HostShared {
                loader: Box::new(loader),
                engine: OnceLock::new(),
                daemon: GuardDaemon::new(config.guard_thread_name.clone()),
                config,
                registry,
                notifier,
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Build a host around an already loaded engine.
    pub fn with_engine(engine: Arc<dyn NativeEngine>, config: HostConfig) -> Self {
        Self::new(
            move || -> NativeResult<Arc<dyn NativeEngine>> { Ok(Arc::clone(&engine)) },
            config,
        )
    }

    pub fn config(&self) -> &HostConfig {
        &self.shared.config
    }

    /// Load the native library if it is not loaded yet.
    ///
    /// A load failure is recorded and returned again on every later call.
    pub fn engine(&self) -> Result<Arc<dyn NativeEngine>> {
        self.shared.engine()
    }

    pub fn is_library_loaded(&self) -> bool {
        matches!(self.shared.engine.get(), Some(Ok(_)))
    }

    /// Recorded library load failure, if loading was attempted and failed.
    pub fn library_load_error(&self) -> Option<String> {
        match self.shared.engine.get() {
            Some(Err(e)) => Some(e.clone()),
            _ => None,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Allocate a native runtime and register it with this host.
    pub fn create_runtime(&self, options: RuntimeOptions) -> Result<Runtime> {
        if self.is_closed() {
            return Err(Error::HostClosed);
        }
        let engine = self.shared.engine()?;

        let runtime = Runtime::create(engine, Arc::downgrade(&self.shared), options)?;
        self.shared
            .registry
            .insert(runtime.handle(), Arc::downgrade(runtime.inner()));

        log::debug!(
            "Runtime {} created ({} registered)",
            runtime.handle(),
            self.shared.registry.len()
        );
        Ok(runtime)
    }

    /// Force-close `runtime`. Idempotent.
    pub fn close_runtime(&self, runtime: &Runtime) -> Result<()> {
        runtime.close(true)
    }

    pub fn runtime_count(&self) -> usize {
        self.shared.registry.len()
    }

    pub fn runtimes(&self) -> Vec<Runtime> {
        self.shared
            .registry
            .snapshot()
            .into_iter()
            .map(Runtime::from_inner)
            .collect()
    }

    /// Run `observer` over registered runtimes until it asks to stop.
    /// Returns how many runtimes it saw.
    pub fn observe(&self, observer: &mut dyn RuntimeObserver) -> usize {
        let mut observed = 0;
        for runtime in self.runtimes() {
            observed += 1;
            if !observer.observe(&runtime) {
                break;
            }
        }
        observed
    }

    pub fn memory_notifier(&self) -> &MemoryNotifier {
        &self.shared.notifier
    }

    /// Deliver a process memory-pressure signal. Returns how many runtimes
    /// were flagged.
    pub fn notify_memory(&self, notification: MemoryNotification) -> usize {
        self.shared.notifier.handle_notification(notification)
    }

    pub fn guard_daemon(&self) -> &GuardDaemon {
        &self.shared.daemon
    }

    /// Stop the daemon and the notifier.
    ///
    /// Runtimes still registered are reported as [`Error::RuntimeLeak`]; they
    /// stay usable and must be closed by their owners.
    pub fn close(&self) -> Result<()> {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.shared.notifier.unregister_listener();
        self.shared.daemon.shutdown();

        let remaining = self.shared.registry.len();
        if remaining > 0 {
            log::warn!("Host closed with {} runtime(s) still registered", remaining);
            return Err(Error::RuntimeLeak(remaining));
        }
        log::info!("Host closed");
        Ok(())
    }
}

impl std::fmt::Debug for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Host")
            .field("library_loaded", &self.is_library_loaded())
            .field("runtimes", &self.runtime_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::NativeError;
    use crate::engine::recording::RecordingEngine;
    use std::sync::atomic::AtomicUsize;

    fn quiet_config() -> HostConfig {
        HostConfig {
            guard_thread_name: "host-test-guard".to_string(),
            ..HostConfig::default()
        }
    }

    #[test]
    fn test_library_failure_is_sticky() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);
        let host = Host::new(
            move || -> NativeResult<Arc<dyn NativeEngine>> {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(NativeError::LibraryLoad("libjs.so: cannot open".to_string()))
            },
            quiet_config(),
        );

        for _ in 0..3 {
            let err = host.create_runtime(RuntimeOptions::default()).unwrap_err();
            assert!(matches!(err, Error::LibraryNotLoaded(ref msg) if msg.contains("libjs.so")));
        }
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert!(!host.is_library_loaded());
        assert!(host.library_load_error().is_some());
    }

    #[test]
    fn test_create_registers_and_close_unregisters() {
        let engine = Arc::new(RecordingEngine::new());
        let host = Host::with_engine(engine.clone(), quiet_config());

        let runtime = host.create_runtime(RuntimeOptions::default()).unwrap();
        assert_eq!(host.runtime_count(), 1);
        assert_eq!(host.runtimes()[0], runtime);

        host.close_runtime(&runtime).unwrap();
        host.close_runtime(&runtime).unwrap();
        assert_eq!(host.runtime_count(), 0);
        assert_eq!(engine.runtime_count(), 0);
        assert!(host.close().is_ok());
    }

    #[test]
    fn test_close_reports_leaked_runtimes() {
        let host = Host::with_engine(Arc::new(RecordingEngine::new()), quiet_config());
        let runtime = host.create_runtime(RuntimeOptions::default()).unwrap();

        assert!(matches!(host.close(), Err(Error::RuntimeLeak(1))));
        assert!(matches!(
            host.create_runtime(RuntimeOptions::default()),
            Err(Error::HostClosed)
        ));
        runtime.close(true).unwrap();
    }

    #[test]
    fn test_dropped_runtime_leaves_registry() {
        let host = Host::with_engine(Arc::new(RecordingEngine::new()), quiet_config());
        let runtime = host.create_runtime(RuntimeOptions::default()).unwrap();
        drop(runtime);
        assert_eq!(host.runtime_count(), 0);
    }
}
