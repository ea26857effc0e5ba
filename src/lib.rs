pub mod callback;
pub mod converter;
pub mod engine;
pub mod error;
pub mod gc;
pub mod host;
pub mod observers;
pub mod options;
mod reference_table;
pub mod runtime;
pub mod runtime_pool;
pub mod scope;
pub mod security;
pub mod values;

// Core API
pub use error::{Error, Result};
pub use host::Host;
pub use runtime::{InspectorSession, Runtime, RuntimeState, RuntimeStatistics};
pub use runtime_pool::{PoolConfig, PoolStats, PooledRuntime, RuntimePool};
pub use scope::{Scope, ScopeReport};
pub use values::{Value, ValueRef};

// Boundary types
pub use callback::{CallbackContext, CallbackInfo, CallbackSignature};
pub use converter::{DefaultConverter, ValueConverter};
pub use engine::{
    CallbackType, EngineLoader, NativeEngine, NativeError, NativeHandle, NativeValue,
    ReferenceType,
};
pub use gc::{MemoryNotification, RuntimeLock};
pub use options::{HostConfig, RuntimeOptions};
pub use security::Guard;
