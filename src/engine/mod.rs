//! Contract between the reference bookkeeping and the foreign script engine.
//!
//! The engine itself (parsing, compilation, execution, its object graph) lives
//! on the other side of this trait. Everything the runtime knows about a
//! foreign value is an opaque [`NativeHandle`] plus the [`ReferenceType`] the
//! engine reported when the handle was produced.
//!
//! ## Ownership protocol
//!
//! ```text
//! ┌──────────────────────────┐   create_* / execute / call   ┌──────────────────┐
//! │  Runtime (managed side)  │ ────────────────────────────▶ │  NativeEngine    │
//! │  ├── ReferenceTable      │ ◀──────────────────────────── │  (foreign side)  │
//! │  ├── CallbackRegistry    │        new handle / value     │                  │
//! │  └── DeferredRelease     │                               │                  │
//! │                          │ ── release_reference(h) ────▶ │  frees handle    │
//! │                          │                               │                  │
//! │  EngineHooks             │ ◀── on_weak_collected(h) ──── │  foreign GC      │
//! │                          │ ◀── invoke_callback(ctx) ──── │  JS → Rust call  │
//! │                          │ ◀── on_callback_released ──── │  function freed  │
//! └──────────────────────────┘                               └──────────────────┘
//! ```
//!
//! Every handle handed to the managed side is owned by it and must be released
//! exactly once. A reference returned from a managed callback transfers one
//! handle back to the engine.

pub mod recording;

use std::sync::Arc;

use crate::options::RuntimeOptions;

/// Opaque identifier of a foreign value or runtime.
pub type NativeHandle = u64;

/// Reserved "no handle" value. Never issued by an engine.
pub const INVALID_HANDLE: NativeHandle = 0;

/// Result of a native call.
pub type NativeResult<T> = std::result::Result<T, NativeError>;

/// Kind of a foreign object-like value.
///
/// Primitives never get a handle, so they have no entry here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReferenceType {
    Object,
    Array,
    Map,
    Set,
    Function,
    Promise,
    Module,
    Script,
    Context,
    Error,
    Proxy,
    Symbol,
    Iterator,
    WeakMap,
    WeakSet,
    PrimitiveObject,
    ArrayBuffer,
    TypedArray,
    DataView,
}

impl ReferenceType {
    /// Human readable name, as the foreign engine spells it.
    pub fn name(self) -> &'static str {
        match self {
            ReferenceType::Object => "Object",
            ReferenceType::Array => "Array",
            ReferenceType::Map => "Map",
            ReferenceType::Set => "Set",
            ReferenceType::Function => "Function",
            ReferenceType::Promise => "Promise",
            ReferenceType::Module => "Module",
            ReferenceType::Script => "Script",
            ReferenceType::Context => "Context",
            ReferenceType::Error => "Error",
            ReferenceType::Proxy => "Proxy",
            ReferenceType::Symbol => "Symbol",
            ReferenceType::Iterator => "Iterator",
            ReferenceType::WeakMap => "WeakMap",
            ReferenceType::WeakSet => "WeakSet",
            ReferenceType::PrimitiveObject => "PrimitiveObject",
            ReferenceType::ArrayBuffer => "ArrayBuffer",
            ReferenceType::TypedArray => "TypedArray",
            ReferenceType::DataView => "DataView",
        }
    }

    /// Whether `create_reference` accepts this kind.
    ///
    /// Functions, modules and scripts have dedicated factory calls.
    pub fn is_creatable(self) -> bool {
        matches!(
            self,
            ReferenceType::Object
                | ReferenceType::Array
                | ReferenceType::Map
                | ReferenceType::Set
                | ReferenceType::Promise
        )
    }
}

impl std::fmt::Display for ReferenceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A value as it crosses the boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum NativeValue {
    Undefined,
    Null,
    Boolean(bool),
    Integer(i32),
    Long(i64),
    Double(f64),
    String(String),
    Reference {
        handle: NativeHandle,
        kind: ReferenceType,
    },
}

impl NativeValue {
    pub fn is_reference(&self) -> bool {
        matches!(self, NativeValue::Reference { .. })
    }
}

/// Failure signalled by the foreign engine.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum NativeError {
    /// Execution was interrupted by `terminate_execution`.
    #[error("execution terminated")]
    Terminated,

    /// An uncaught foreign exception.
    #[error("uncaught exception: {message}")]
    Exception { message: String },

    #[error("invalid handle {0}")]
    InvalidHandle(NativeHandle),

    #[error("runtime {0} not found")]
    RuntimeNotFound(NativeHandle),

    #[error("operation not supported: {0}")]
    Unsupported(&'static str),

    /// The native library could not be loaded.
    #[error("failed to load native library: {0}")]
    LibraryLoad(String),
}

impl NativeError {
    pub fn exception(message: impl Into<String>) -> Self {
        NativeError::Exception {
            message: message.into(),
        }
    }
}

/// How a managed callback is exposed to foreign code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallbackType {
    Function,
    Getter,
    Setter,
}

/// What the engine needs to know to build a foreign function around a
/// managed callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackDescriptor {
    pub name: String,
    pub callback_type: CallbackType,
    pub arity: Option<usize>,
    pub this_required: bool,
    pub return_result: bool,
}

/// Notifications the engine delivers back into the managed side.
///
/// Installed once per runtime at creation. Implementations must not assume
/// they are called on the thread that created the runtime.
pub trait EngineHooks: Send + Sync {
    /// The foreign collector reclaimed a weak handle. The handle is already
    /// freed on the foreign side and must not be released again.
    fn on_weak_collected(&self, value: NativeHandle);

    /// The foreign function bound to `context` was freed.
    fn on_callback_released(&self, context: NativeHandle);

    /// Foreign code called a managed callback.
    ///
    /// Reference arguments are fresh handles owned by the managed side. A
    /// reference in the returned value is a handle owned by the engine.
    fn invoke_callback(
        &self,
        context: NativeHandle,
        this: Option<NativeValue>,
        args: Vec<NativeValue>,
    ) -> NativeResult<NativeValue>;
}

/// The call surface of the foreign engine.
///
/// All operations except [`NativeEngine::terminate_execution`] are only called
/// while the owning runtime's lock is held.
pub trait NativeEngine: Send + Sync {
    fn create_runtime(
        &self,
        options: &RuntimeOptions,
        hooks: Arc<dyn EngineHooks>,
    ) -> NativeResult<NativeHandle>;

    fn close_runtime(&self, runtime: NativeHandle) -> NativeResult<()>;

    /// Rebuild the runtime's context in place. Every outstanding value handle
    /// becomes invalid.
    fn reset_context(&self, runtime: NativeHandle) -> NativeResult<()>;

    /// Rebuild the whole isolate in place. Every outstanding value handle
    /// becomes invalid.
    fn reset_isolate(&self, runtime: NativeHandle) -> NativeResult<()>;

    fn create_reference(
        &self,
        runtime: NativeHandle,
        kind: ReferenceType,
    ) -> NativeResult<NativeHandle>;

    fn compile_module(
        &self,
        runtime: NativeHandle,
        resource_name: &str,
        source: &str,
    ) -> NativeResult<NativeHandle>;

    fn execute(&self, runtime: NativeHandle, source: &str) -> NativeResult<NativeValue>;

    fn call_function(
        &self,
        runtime: NativeHandle,
        function: NativeHandle,
        receiver: Option<&NativeValue>,
        args: &[NativeValue],
    ) -> NativeResult<NativeValue>;

    fn invoke(
        &self,
        runtime: NativeHandle,
        target: NativeHandle,
        function_name: &str,
        args: &[NativeValue],
    ) -> NativeResult<NativeValue>;

    fn get_property(
        &self,
        runtime: NativeHandle,
        target: NativeHandle,
        key: &str,
    ) -> NativeResult<NativeValue>;

    fn set_property(
        &self,
        runtime: NativeHandle,
        target: NativeHandle,
        key: &str,
        value: &NativeValue,
    ) -> NativeResult<()>;

    fn clone_reference(
        &self,
        runtime: NativeHandle,
        value: NativeHandle,
    ) -> NativeResult<NativeHandle>;

    fn release_reference(&self, runtime: NativeHandle, value: NativeHandle) -> NativeResult<()>;

    fn set_weak(&self, runtime: NativeHandle, value: NativeHandle) -> NativeResult<()>;

    fn clear_weak(&self, runtime: NativeHandle, value: NativeHandle) -> NativeResult<()>;

    fn is_weak(&self, runtime: NativeHandle, value: NativeHandle) -> NativeResult<bool>;

    fn register_callback(
        &self,
        runtime: NativeHandle,
        descriptor: &CallbackDescriptor,
    ) -> NativeResult<NativeHandle>;

    fn unregister_callback(&self, runtime: NativeHandle, context: NativeHandle)
    -> NativeResult<()>;

    fn create_function(
        &self,
        runtime: NativeHandle,
        context: NativeHandle,
    ) -> NativeResult<NativeHandle>;

    fn bind_accessor(
        &self,
        runtime: NativeHandle,
        target: NativeHandle,
        name: &str,
        getter: NativeHandle,
        setter: Option<NativeHandle>,
    ) -> NativeResult<()>;

    /// Interrupt whatever the runtime is executing.
    ///
    /// Async-safe: called from the guard daemon without any runtime lock.
    /// A no-op when the runtime is idle or already terminated.
    fn terminate_execution(&self, runtime: NativeHandle);

    /// Hint that the process is low on memory and the foreign collector
    /// should run.
    fn low_memory_notification(&self, runtime: NativeHandle) -> NativeResult<()>;
}

/// Loads the native library and hands out the engine it exposes.
pub trait EngineLoader: Send + Sync {
    fn load(&self) -> NativeResult<Arc<dyn NativeEngine>>;
}

impl<F> EngineLoader for F
where
    F: Fn() -> NativeResult<Arc<dyn NativeEngine>> + Send + Sync,
{
    fn load(&self) -> NativeResult<Arc<dyn NativeEngine>> {
        self()
    }
}
