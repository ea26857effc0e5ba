#![allow(dead_code)]

use std::sync::Arc;

use jsbridge_runtime::engine::recording::RecordingEngine;
use jsbridge_runtime::{Host, HostConfig, Runtime, RuntimeOptions};

/// A host backed by the in-memory engine, plus the engine for assertions.
pub struct TestHost {
    pub engine: Arc<RecordingEngine>,
    pub host: Host,
}

impl TestHost {
    pub fn new() -> Self {
        Self::with_config(HostConfig::default())
    }

    pub fn with_config(config: HostConfig) -> Self {
        let engine = Arc::new(RecordingEngine::new());
        let host = Host::with_engine(engine.clone(), config);
        Self { engine, host }
    }

    pub fn runtime(&self) -> Runtime {
        self.host
            .create_runtime(RuntimeOptions::default())
            .expect("runtime creation failed")
    }

    /// Close `runtime` and check its tables are empty.
    pub fn close_clean(&self, runtime: &Runtime) {
        runtime.close(true).expect("close failed");
        assert!(runtime.is_closed());
        assert_eq!(runtime.reference_count(), 0);
        assert_eq!(runtime.callback_context_count(), 0);
        assert_eq!(runtime.module_count(), 0);
    }
}
