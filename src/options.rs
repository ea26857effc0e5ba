//! Runtime and host configuration.

/// Default initial heap size handed to the engine, in MB.
pub const DEFAULT_HEAP_INITIAL_MB: usize = 16;

/// Default maximum heap size handed to the engine, in MB.
pub const DEFAULT_HEAP_MAX_MB: usize = 128;

/// Name of the guard daemon thread.
pub const DEFAULT_GUARD_THREAD_NAME: &str = "jsbridge-guard-daemon";

/// Options for a single runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeOptions {
    /// Name under which the global object is exposed (`globalThis` alias).
    pub global_name: Option<String>,
    /// Pooled runtimes are reset and reused; an ordinary `close(false)`
    /// leaves them open.
    pub pooled: bool,
    pub heap_initial_mb: usize,
    pub heap_max_mb: usize,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            global_name: None,
            pooled: false,
            heap_initial_mb: DEFAULT_HEAP_INITIAL_MB,
            heap_max_mb: DEFAULT_HEAP_MAX_MB,
        }
    }
}

impl RuntimeOptions {
    pub fn pooled() -> Self {
        Self {
            pooled: true,
            ..Self::default()
        }
    }

    pub fn with_global_name(mut self, name: impl Into<String>) -> Self {
        self.global_name = Some(name.into());
        self
    }
}

/// Options for the process-wide [`Host`](crate::Host).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostConfig {
    /// Subscribe the memory notifier as soon as the host is built.
    pub register_memory_notifier: bool,
    /// Thread name of the guard daemon.
    pub guard_thread_name: String,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            register_memory_notifier: true,
            guard_thread_name: DEFAULT_GUARD_THREAD_NAME.to_string(),
        }
    }
}
