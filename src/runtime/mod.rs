//! Runtime - the aggregate root of the reference lifecycle.
//!
//! A [`Runtime`] owns one native runtime handle and everything the managed
//! side tracks for it:
//!
//! ```text
//! Runtime ─── Arc<RuntimeInner>
//!             ├── native_lock        serializes native calls
//!             ├── ReferenceTable     handle → wrapper state
//!             ├── CallbackRegistry   context handle → closure
//!             ├── ModuleCache        resource name → module
//!             ├── WeakReferences     strong ⇄ weak, foreign collection
//!             ├── DeferredRelease    releases queued off-lock
//!             └── gc_scheduled       set by the memory notifier
//! ```
//!
//! State machine: `Created → Active → (Resetting → Active)* → Closed`.
//! `Closed` is terminal; every operation but `close` fails with
//! [`Error::RuntimeClosed`] afterwards.

mod module_cache;

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use crate::callback::{CallbackContext, CallbackRegistry};
use crate::converter::{DefaultConverter, ValueConverter};
use crate::engine::{
    CallbackType, EngineHooks, INVALID_HANDLE, NativeEngine, NativeError, NativeHandle,
    NativeResult, NativeValue, ReferenceType,
};
use crate::error::{Error, Result};
use crate::gc::{DeferredReleaseQueue, RuntimeLock, WeakReferences};
use crate::host::HostShared;
use crate::options::RuntimeOptions;
use crate::reference_table::ReferenceTable;
use crate::scope::Scope;
use crate::security::{ExecutionTarget, Guard};
use crate::values::{ReferenceState, Value, ValueRef};

use module_cache::ModuleCache;

/// Process-unique runtime ids, used to key the thread-local lock bookkeeping.
static NEXT_RUNTIME_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RuntimeState {
    Created = 0,
    Active = 1,
    Resetting = 2,
    Closed = 3,
}

impl RuntimeState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => RuntimeState::Created,
            1 => RuntimeState::Active,
            2 => RuntimeState::Resetting,
            _ => RuntimeState::Closed,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum ResetKind {
    Context,
    Isolate,
}

/// Point-in-time counters of one runtime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RuntimeStatistics {
    pub reference_count: usize,
    pub weak_reference_count: usize,
    pub callback_context_count: usize,
    pub module_count: usize,
    pub pending_release_count: u64,
    pub collected_weak_count: u64,
}

/// Debugger session bound to a runtime. Closed together with it.
pub trait InspectorSession: Send + Sync {
    fn on_runtime_closed(&self);
}

pub(crate) struct RuntimeInner {
    id: u64,
    handle: AtomicU64,
    engine: Arc<dyn NativeEngine>,
    host: Weak<HostShared>,
    options: RuntimeOptions,
    state: AtomicU8,
    native_lock: Mutex<()>,
    references: ReferenceTable,
    callbacks: CallbackRegistry,
    modules: ModuleCache,
    weak_refs: WeakReferences,
    deferred: DeferredReleaseQueue,
    gc_scheduled: AtomicBool,
    in_use: AtomicBool,
    converter: RwLock<Arc<dyn ValueConverter>>,
    inspector: Mutex<Option<Arc<dyn InspectorSession>>>,
    self_ref: Weak<RuntimeInner>,
}

impl RuntimeInner {
    #[inline]
    pub(crate) fn native_handle(&self) -> NativeHandle {
        self.handle.load(Ordering::Acquire)
    }

    #[inline]
    fn state(&self) -> RuntimeState {
        RuntimeState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: RuntimeState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub(crate) fn schedule_gc(&self) {
        self.gc_scheduled.store(true, Ordering::Release);
    }

    pub(crate) fn set_in_use(&self, in_use: bool) {
        self.in_use.store(in_use, Ordering::Release);
    }

    /// Take the native lock, releasing deferred handles on the outermost
    /// acquisition.
    fn lock_native(&self) -> RuntimeLock<'_> {
        let lock = RuntimeLock::acquire(self.id, &self.native_lock);
        if lock.is_outermost() && self.deferred.has_pending() {
            self.process_deferred();
        }
        lock
    }

    fn try_lock_native(&self) -> Option<RuntimeLock<'_>> {
        RuntimeLock::try_acquire(self.id, &self.native_lock)
    }

    /// Take the native lock and fail fast if the runtime is closed.
    pub(crate) fn acquire_active(&self) -> Result<RuntimeLock<'_>> {
        let lock = self.lock_native();
        if self.state() == RuntimeState::Closed {
            return Err(Error::RuntimeClosed);
        }
        Ok(lock)
    }

    fn process_deferred(&self) {
        let runtime = self.native_handle();
        let released = self.deferred.process_all(|handle| {
            if runtime == INVALID_HANDLE {
                return;
            }
            if let Err(e) = self.engine.release_reference(runtime, handle) {
                tracing::debug!(handle, error = %e, "deferred release failed");
            }
        });
        if released > 0 {
            self.on_reference_removed();
        }
    }

    /// Release one handle on the engine. Must hold the native lock.
    ///
    /// A handle the engine no longer knows counts as already released.
    fn release_native(&self, handle: NativeHandle) -> Result<()> {
        let runtime = self.native_handle();
        if runtime == INVALID_HANDLE {
            return Ok(());
        }
        match self.engine.release_reference(runtime, handle) {
            Ok(()) => Ok(()),
            Err(NativeError::InvalidHandle(_)) => {
                tracing::trace!(handle, "handle already released");
                Ok(())
            }
            Err(e) => Err(Error::native("release_reference")(e)),
        }
    }

    /// Consume a pending GC hint, if any. Must hold the native lock.
    fn on_reference_removed(&self) {
        if !self.gc_scheduled.swap(false, Ordering::AcqRel) {
            return;
        }
        let runtime = self.native_handle();
        if runtime == INVALID_HANDLE {
            return;
        }
        match self.engine.low_memory_notification(runtime) {
            Ok(()) => tracing::debug!(runtime, "low memory notification sent"),
            Err(e) => tracing::warn!(runtime, error = %e, "low memory notification failed"),
        }
    }

    /// Wrap a handle the managed side now owns.
    pub(crate) fn wrap(&self, handle: NativeHandle, kind: ReferenceType) -> Result<ValueRef> {
        if handle == INVALID_HANDLE {
            return Err(Error::native("wrap")(NativeError::InvalidHandle(handle)));
        }

        let state = Arc::new(ReferenceState::new(handle, kind));
        match self.references.insert(&state) {
            Ok(_) => Ok(ValueRef::new(state, self.self_ref.clone())),
            Err(e) => {
                // Sealed by teardown: nobody else will ever release it.
                state.take_handle();
                match self.try_lock_native() {
                    Some(_lock) => {
                        if let Err(e) = self.release_native(handle) {
                            tracing::debug!(handle, error = %e, "release of rejected handle failed");
                        }
                    }
                    None => self.deferred.defer(handle),
                }
                Err(e)
            }
        }
    }

    /// Explicit close of a wrapper.
    pub(crate) fn close_reference(&self, state: &Arc<ReferenceState>) -> Result<()> {
        let Some(handle) = state.take_handle() else {
            return Err(Error::ReferenceClosed);
        };
        self.references.remove(handle);
        let evicted = if state.kind() == ReferenceType::Module {
            self.modules.remove_state(state)
        } else {
            None
        };

        let result = {
            let _lock = self.lock_native();
            let result = self.release_native(handle);
            self.on_reference_removed();
            result
        };
        drop(evicted);
        result
    }

    /// Last clone of an unclosed strong wrapper went away.
    pub(crate) fn drop_reference(&self, state: &ReferenceState) {
        let Some(handle) = state.take_handle() else {
            return;
        };
        self.references.remove(handle);

        match self.try_lock_native() {
            Some(_lock) => {
                if let Err(e) = self.release_native(handle) {
                    tracing::debug!(handle, error = %e, "release on drop failed");
                }
                self.on_reference_removed();
            }
            None => self.deferred.defer(handle),
        }
    }

    pub(crate) fn set_weak(&self, state: &ReferenceState) -> Result<()> {
        let _lock = self.acquire_active()?;
        let runtime = self.native_handle();
        self.weak_refs
            .mark_weak(state, |handle| self.engine.set_weak(runtime, handle))?;
        Ok(())
    }

    pub(crate) fn clear_weak(&self, state: &ReferenceState) -> Result<()> {
        let _lock = self.acquire_active()?;
        let runtime = self.native_handle();
        self.weak_refs
            .clear_weak(state, |handle| self.engine.clear_weak(runtime, handle))?;
        Ok(())
    }

    pub(crate) fn query_weak(&self, state: &ReferenceState) -> Result<bool> {
        let _lock = self.acquire_active()?;
        let handle = state.handle();
        if handle == INVALID_HANDLE {
            return Err(Error::ReferenceClosed);
        }
        let weak = self
            .engine
            .is_weak(self.native_handle(), handle)
            .map_err(Error::native("is_weak"))?;
        state.set_weak(weak);
        Ok(weak)
    }

    pub(crate) fn clone_reference(&self, state: &ReferenceState) -> Result<ValueRef> {
        let _lock = self.acquire_active()?;
        let handle = state.handle();
        if handle == INVALID_HANDLE {
            return Err(Error::ReferenceClosed);
        }
        let cloned = self
            .engine
            .clone_reference(self.native_handle(), handle)
            .map_err(Error::native("clone_reference"))?;
        self.wrap(cloned, state.kind())
    }

    fn on_weak_collected(&self, handle: NativeHandle) {
        if self.weak_refs.on_collected(&self.references, handle).is_none() {
            tracing::trace!(handle, "collected handle was not tracked");
            return;
        }
        if let Some(_lock) = self.try_lock_native() {
            self.on_reference_removed();
        }
    }

    /// Drain the handle table and module cache, releasing every handle.
    ///
    /// Leftovers other than weak references and cached modules point at
    /// missing close discipline in calling code and are logged.
    fn remove_all_references(&self, seal: bool) {
        let states = self.references.drain(seal);
        let modules = self.modules.drain(seal);

        let total = states.len();
        let weak = states.iter().filter(|state| state.is_weak()).count();
        let module_count = modules.len();

        for state in &states {
            if let Some(handle) = state.take_handle()
                && let Err(e) = self.release_native(handle)
            {
                tracing::debug!(handle, error = %e, "release during drain failed");
            }
        }
        // Module states were drained above; dropping them releases nothing.
        drop(modules);

        if total != weak + module_count {
            tracing::warn!(
                runtime = self.native_handle(),
                total,
                weak,
                modules = module_count,
                "references leaked at teardown"
            );
        } else if total > 0 {
            tracing::debug!(total, weak, modules = module_count, "references drained");
        }
    }

    fn reset(&self, kind: ResetKind) -> Result<()> {
        let _lock = self.acquire_active()?;
        self.set_state(RuntimeState::Resetting);

        self.remove_all_references(false);
        self.callbacks.remove_all();

        let runtime = self.native_handle();
        let result = match kind {
            ResetKind::Context => self
                .engine
                .reset_context(runtime)
                .map_err(Error::native("reset_context")),
            ResetKind::Isolate => self
                .engine
                .reset_isolate(runtime)
                .map_err(Error::native("reset_isolate")),
        };

        self.set_state(RuntimeState::Active);
        log::debug!("Runtime {} reset ({:?})", runtime, kind);
        result
    }

    pub(crate) fn close(&self, force: bool) -> Result<()> {
        if self.options.pooled && !force {
            log::trace!("Pooled runtime {} kept open", self.native_handle());
            return Ok(());
        }

        let (handle, result) = {
            let _lock = self.lock_native();
            if self.state() == RuntimeState::Closed {
                return Ok(());
            }
            self.set_state(RuntimeState::Closed);

            self.remove_all_references(true);
            self.callbacks.remove_all();
            let inspector = self
                .inspector
                .lock()
                .expect("inspector slot poisoned")
                .take();
            if let Some(inspector) = inspector {
                inspector.on_runtime_closed();
            }

            let handle = self.handle.swap(INVALID_HANDLE, Ordering::AcqRel);
            let result = self
                .engine
                .close_runtime(handle)
                .map_err(Error::native("close_runtime"));
            (handle, result)
        };

        // Host lock is never taken while holding the runtime lock.
        if let Some(host) = self.host.upgrade() {
            host.unregister(handle);
        }
        log::debug!("Runtime {} closed", handle);
        result
    }
}

impl ExecutionTarget for RuntimeInner {
    fn terminate_execution(&self) {
        let handle = self.native_handle();
        if handle != INVALID_HANDLE {
            self.engine.terminate_execution(handle);
        }
    }
}

impl Drop for RuntimeInner {
    fn drop(&mut self) {
        if self.state() == RuntimeState::Closed {
            return;
        }
        tracing::warn!(
            runtime = self.native_handle(),
            "runtime dropped without close, forcing teardown"
        );
        if let Err(e) = self.close(true) {
            tracing::warn!(error = %e, "forced teardown failed");
        }
    }
}

/// Hooks the engine calls back into. Holds the runtime weakly so the engine
/// never keeps it alive.
struct RuntimeHooks {
    runtime: Weak<RuntimeInner>,
}

impl EngineHooks for RuntimeHooks {
    fn on_weak_collected(&self, value: NativeHandle) {
        if let Some(runtime) = self.runtime.upgrade() {
            runtime.on_weak_collected(value);
        }
    }

    fn on_callback_released(&self, context: NativeHandle) {
        if let Some(runtime) = self.runtime.upgrade() {
            runtime.callbacks.unregister(context);
        }
    }

    fn invoke_callback(
        &self,
        context: NativeHandle,
        this: Option<NativeValue>,
        args: Vec<NativeValue>,
    ) -> NativeResult<NativeValue> {
        let Some(inner) = self.runtime.upgrade() else {
            return Err(NativeError::exception("runtime is closed"));
        };
        Runtime::from_inner(inner)
            .dispatch_callback(context, this, args)
            .map_err(|e| match e {
                Error::Native { source, .. } => source,
                other => NativeError::exception(other.to_string()),
            })
    }
}

/// Handle to one foreign runtime. Cheap to clone; all clones share state.
///
/// Dropping the last clone of a runtime that was never closed force-closes
/// it and logs a warning.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

impl Runtime {
    pub(crate) fn create(
        engine: Arc<dyn NativeEngine>,
        host: Weak<HostShared>,
        options: RuntimeOptions,
    ) -> Result<Runtime> {
        let inner = Arc::new_cyclic(|self_ref| RuntimeInner {
            id: NEXT_RUNTIME_ID.fetch_add(1, Ordering::Relaxed),
            handle: AtomicU64::new(INVALID_HANDLE),
            engine,
            host,
            options,
            state: AtomicU8::new(RuntimeState::Created as u8),
            native_lock: Mutex::new(()),
            references: ReferenceTable::new(),
            callbacks: CallbackRegistry::new(),
            modules: ModuleCache::new(),
            weak_refs: WeakReferences::new(),
            deferred: DeferredReleaseQueue::new(),
            gc_scheduled: AtomicBool::new(false),
            in_use: AtomicBool::new(false),
            converter: RwLock::new(Arc::new(DefaultConverter)),
            inspector: Mutex::new(None),
            self_ref: self_ref.clone(),
        });

        let hooks: Arc<dyn EngineHooks> = Arc::new(RuntimeHooks {
            runtime: Arc::downgrade(&inner),
        });
        match inner.engine.create_runtime(&inner.options, hooks) {
            Ok(handle) => {
                inner.handle.store(handle, Ordering::Release);
                inner.set_state(RuntimeState::Active);
                tracing::debug!(runtime = handle, "runtime created");
                Ok(Runtime { inner })
            }
            Err(e) => {
                inner.set_state(RuntimeState::Closed);
                Err(Error::RuntimeCreation(e))
            }
        }
    }

    pub(crate) fn from_inner(inner: Arc<RuntimeInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn inner(&self) -> &Arc<RuntimeInner> {
        &self.inner
    }

    pub(crate) fn inner_ptr(&self) -> *const RuntimeInner {
        Arc::as_ptr(&self.inner)
    }

    /// Native runtime handle, or `0` once closed.
    pub fn handle(&self) -> NativeHandle {
        self.inner.native_handle()
    }

    pub fn state(&self) -> RuntimeState {
        self.inner.state()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == RuntimeState::Closed
    }

    pub fn is_pooled(&self) -> bool {
        self.inner.options.pooled
    }

    pub fn options(&self) -> &RuntimeOptions {
        &self.inner.options
    }

    /// Whether a pool currently lends this runtime out.
    pub fn is_in_use(&self) -> bool {
        self.inner.in_use.load(Ordering::Acquire)
    }

    /// Tear the runtime down. No-op if already closed.
    ///
    /// A pooled runtime is only closed with `force`; otherwise it stays open
    /// for reuse.
    pub fn close(&self, force: bool) -> Result<()> {
        self.inner.close(force)
    }

    /// Release every reference and rebuild the native context in place.
    pub fn reset_context(&self) -> Result<()> {
        self.inner.reset(ResetKind::Context)
    }

    /// Release every reference and rebuild the whole native isolate in place.
    pub fn reset_isolate(&self) -> Result<()> {
        self.inner.reset(ResetKind::Isolate)
    }

    /// Take the native lock for a batch of calls. Nested calls from the same
    /// thread do not block.
    pub fn lock(&self) -> Result<RuntimeLock<'_>> {
        self.inner.acquire_active()
    }

    pub fn scope(&self) -> Scope<'_> {
        Scope::new(self)
    }

    pub fn converter(&self) -> Arc<dyn ValueConverter> {
        Arc::clone(&self.inner.converter.read().expect("converter lock poisoned"))
    }

    pub fn set_converter(&self, converter: Arc<dyn ValueConverter>) {
        *self.inner.converter.write().expect("converter lock poisoned") = converter;
    }

    /// Take ownership of a native handle, inserting it into the handle table.
    pub fn wrap_reference(&self, handle: NativeHandle, kind: ReferenceType) -> Result<ValueRef> {
        self.inner.wrap(handle, kind)
    }

    fn checked_handle(&self, value: &ValueRef) -> Result<NativeHandle> {
        let handle = value.handle();
        if handle == INVALID_HANDLE {
            return Err(Error::ReferenceClosed);
        }
        if !value.belongs_to(self) {
            return Err(Error::InvalidArgument(format!(
                "{} handle {handle} belongs to another runtime",
                value.kind()
            )));
        }
        Ok(handle)
    }

    fn native_args(&self, converter: &dyn ValueConverter, args: &[Value]) -> Result<Vec<NativeValue>> {
        args.iter()
            .map(|arg| converter.to_native(self, arg))
            .collect()
    }

    pub fn execute(&self, source: &str) -> Result<Value> {
        let converter = self.converter();
        let _lock = self.inner.acquire_active()?;
        let result = self
            .inner
            .engine
            .execute(self.handle(), source)
            .map_err(Error::native("execute"))?;
        converter.to_value(self, result)
    }

    pub fn call_function(
        &self,
        function: &ValueRef,
        receiver: Option<&Value>,
        args: &[Value],
    ) -> Result<Value> {
        let function = self.checked_handle(function)?;
        let converter = self.converter();
        let receiver = receiver
            .map(|r| converter.to_native(self, r))
            .transpose()?;
        let args = self.native_args(&*converter, args)?;

        let _lock = self.inner.acquire_active()?;
        let result = self
            .inner
            .engine
            .call_function(self.handle(), function, receiver.as_ref(), &args)
            .map_err(Error::native("call_function"))?;
        converter.to_value(self, result)
    }

    /// Call method `function_name` on `target`.
    pub fn invoke(&self, target: &ValueRef, function_name: &str, args: &[Value]) -> Result<Value> {
        let target = self.checked_handle(target)?;
        let converter = self.converter();
        let args = self.native_args(&*converter, args)?;

        let _lock = self.inner.acquire_active()?;
        let result = self
            .inner
            .engine
            .invoke(self.handle(), target, function_name, &args)
            .map_err(Error::native("invoke"))?;
        converter.to_value(self, result)
    }

    pub fn get_property(&self, target: &ValueRef, key: &str) -> Result<Value> {
        let target = self.checked_handle(target)?;
        let converter = self.converter();

        let _lock = self.inner.acquire_active()?;
        let result = self
            .inner
            .engine
            .get_property(self.handle(), target, key)
            .map_err(Error::native("get_property"))?;
        converter.to_value(self, result)
    }

    pub fn set_property(&self, target: &ValueRef, key: &str, value: &Value) -> Result<()> {
        let target = self.checked_handle(target)?;
        let value = self.converter().to_native(self, value)?;

        let _lock = self.inner.acquire_active()?;
        self.inner
            .engine
            .set_property(self.handle(), target, key, &value)
            .map_err(Error::native("set_property"))
    }

    /// Create an empty foreign value of a creatable kind.
    pub fn create_reference(&self, kind: ReferenceType) -> Result<ValueRef> {
        if !kind.is_creatable() {
            return Err(Error::InvalidArgument(format!(
                "{kind} values cannot be created directly"
            )));
        }

        let _lock = self.inner.acquire_active()?;
        let handle = self
            .inner
            .engine
            .create_reference(self.handle(), kind)
            .map_err(Error::native("create_reference"))?;
        self.inner.wrap(handle, kind)
    }

    pub fn create_array(&self) -> Result<ValueRef> {
        self.create_reference(ReferenceType::Array)
    }

    pub fn create_object(&self) -> Result<ValueRef> {
        self.create_reference(ReferenceType::Object)
    }

    pub fn create_map(&self) -> Result<ValueRef> {
        self.create_reference(ReferenceType::Map)
    }

    pub fn create_set(&self) -> Result<ValueRef> {
        self.create_reference(ReferenceType::Set)
    }

    pub fn create_promise(&self) -> Result<ValueRef> {
        self.create_reference(ReferenceType::Promise)
    }

    /// Compile a module. The result is not cached; see [`Runtime::add_module`].
    pub fn compile_module(&self, resource_name: &str, source: &str) -> Result<ValueRef> {
        let _lock = self.inner.acquire_active()?;
        let handle = self
            .inner
            .engine
            .compile_module(self.handle(), resource_name, source)
            .map_err(Error::native("compile_module"))?;
        self.inner.wrap(handle, ReferenceType::Module)
    }

    /// Expose `context` to foreign code as a function value.
    ///
    /// The context is registered (its handle becomes valid) only once the
    /// engine accepted it.
    pub fn create_function(&self, context: Arc<CallbackContext>) -> Result<ValueRef> {
        if context.is_valid() {
            return Err(Error::InvalidArgument(format!(
                "callback context `{}` is already registered",
                context.name()
            )));
        }

        let _lock = self.inner.acquire_active()?;
        let runtime = self.handle();
        let engine = &self.inner.engine;

        let context_handle = engine
            .register_callback(runtime, &context.descriptor())
            .map_err(Error::native("register_callback"))?;
        context.set_handle(context_handle);
        self.inner.callbacks.register(Arc::clone(&context))?;

        match engine.create_function(runtime, context_handle) {
            Ok(function) => self.inner.wrap(function, ReferenceType::Function),
            Err(e) => {
                self.inner.callbacks.unregister(context_handle);
                if let Err(e) = engine.unregister_callback(runtime, context_handle) {
                    tracing::warn!(handle = context_handle, error = %e, "callback rollback failed");
                }
                Err(Error::native("create_function")(e))
            }
        }
    }

    /// Install a getter and optional setter named `name` on `target`.
    ///
    /// Both contexts are registered together or not at all.
    pub fn bind_accessor(
        &self,
        target: &ValueRef,
        name: &str,
        getter: Arc<CallbackContext>,
        setter: Option<Arc<CallbackContext>>,
    ) -> Result<()> {
        let target = self.checked_handle(target)?;
        if getter.callback_type() != CallbackType::Getter {
            return Err(Error::InvalidArgument(format!(
                "`{}` is not a getter",
                getter.name()
            )));
        }
        if let Some(setter) = &setter
            && setter.callback_type() != CallbackType::Setter
        {
            return Err(Error::InvalidArgument(format!(
                "`{}` is not a setter",
                setter.name()
            )));
        }
        if getter.is_valid() || setter.as_ref().is_some_and(|s| s.is_valid()) {
            return Err(Error::InvalidArgument(format!(
                "accessor `{name}` is already registered"
            )));
        }

        let _lock = self.inner.acquire_active()?;
        let runtime = self.handle();
        let engine = &self.inner.engine;

        let getter_handle = engine
            .register_callback(runtime, &getter.descriptor())
            .map_err(Error::native("register_callback"))?;
        let setter_handle = match &setter {
            Some(setter) => match engine.register_callback(runtime, &setter.descriptor()) {
                Ok(handle) => Some(handle),
                Err(e) => {
                    if let Err(e) = engine.unregister_callback(runtime, getter_handle) {
                        tracing::warn!(handle = getter_handle, error = %e, "getter rollback failed");
                    }
                    return Err(Error::native("register_callback")(e));
                }
            },
            None => None,
        };

        getter.set_handle(getter_handle);
        if let (Some(setter), Some(handle)) = (&setter, setter_handle) {
            setter.set_handle(handle);
        }
        self.inner
            .callbacks
            .register_pair(Arc::clone(&getter), setter.clone())?;

        if let Err(e) = engine.bind_accessor(runtime, target, name, getter_handle, setter_handle) {
            for handle in std::iter::once(getter_handle).chain(setter_handle) {
                self.inner.callbacks.unregister(handle);
                if let Err(e) = engine.unregister_callback(runtime, handle) {
                    tracing::warn!(handle, error = %e, "accessor rollback failed");
                }
            }
            return Err(Error::native("bind_accessor")(e));
        }
        Ok(())
    }

    /// Unregister a callback context on both sides.
    pub fn remove_callback_context(&self, handle: NativeHandle) -> Result<()> {
        let _lock = self.inner.acquire_active()?;
        self.inner
            .callbacks
            .unregister(handle)
            .ok_or(Error::CallbackNotFound(handle))?;
        self.inner
            .engine
            .unregister_callback(self.handle(), handle)
            .map_err(Error::native("unregister_callback"))
    }

    pub fn callback_context(&self, handle: NativeHandle) -> Option<Arc<CallbackContext>> {
        self.inner.callbacks.get(handle)
    }

    /// Foreign code called the callback registered under `context`.
    fn dispatch_callback(
        &self,
        context: NativeHandle,
        this: Option<NativeValue>,
        args: Vec<NativeValue>,
    ) -> Result<NativeValue> {
        let _lock = self.inner.acquire_active()?;
        let converter = self.converter();

        let Some(callback) = self.inner.callbacks.get(context) else {
            this.iter().chain(args.iter()).for_each(|v| self.release_owned(v));
            return Err(Error::CallbackNotFound(context));
        };

        // Everything handed to the callback is released when it returns.
        let mut scope = self.scope();
        let has_this = this.is_some();
        let mut adopted = Vec::with_capacity(args.len() + 1);
        let mut failure = None;
        for value in this.into_iter().chain(args) {
            if failure.is_some() {
                self.release_owned(&value);
                continue;
            }
            match converter.to_value(self, value) {
                Ok(value) => adopted.push(scope.add_value(value)),
                Err(e) => failure = Some(e),
            }
        }
        if let Some(e) = failure {
            return Err(e);
        }

        let (this, args) = match adopted.split_first() {
            Some((this, args)) if has_this => (Some(this), args),
            _ => (None, &adopted[..]),
        };
        let result = callback.call(self, this, args)?;

        if !callback.signature().return_result {
            return Ok(NativeValue::Undefined);
        }
        self.transfer_to_engine(&*converter, &result)
    }

    /// Release a boundary value the managed side owns but will not wrap.
    fn release_owned(&self, value: &NativeValue) {
        if let NativeValue::Reference { handle, .. } = value
            && let Err(e) = self.inner.release_native(*handle)
        {
            tracing::debug!(handle, error = %e, "failed to release unwrapped handle");
        }
    }

    /// Hand a callback result to the engine. References get a fresh handle
    /// the engine owns; the managed wrapper keeps its own.
    fn transfer_to_engine(&self, converter: &dyn ValueConverter, value: &Value) -> Result<NativeValue> {
        match converter.to_native(self, value)? {
            NativeValue::Reference { handle, kind } => {
                let handle = self
                    .inner
                    .engine
                    .clone_reference(self.handle(), handle)
                    .map_err(Error::native("clone_reference"))?;
                Ok(NativeValue::Reference { handle, kind })
            }
            primitive => Ok(primitive),
        }
    }

    /// Cache `module` under `resource_name`, closing any module it replaces.
    ///
    /// Fails with [`Error::RuntimeClosed`] once teardown has started.
    pub fn add_module(&self, resource_name: impl Into<String>, module: &ValueRef) -> Result<()> {
        let _lock = self.inner.acquire_active()?;
        self.checked_handle(module)?;
        if module.kind() != ReferenceType::Module {
            return Err(Error::InvalidArgument(format!(
                "expected a Module, got {}",
                module.kind()
            )));
        }

        let resource_name = resource_name.into();
        let previous = self.inner.modules.insert(resource_name.clone(), module.clone())?;

        if let Some(previous) = previous
            && !previous.same_value(module)
            && !previous.is_closed()
        {
            tracing::debug!(resource_name, "replacing cached module");
            if let Err(e) = previous.force_close() {
                tracing::warn!(resource_name, error = %e, "failed to close replaced module");
            }
        }
        Ok(())
    }

    /// Take `resource_name` out of the cache without closing it.
    pub fn remove_module(&self, resource_name: &str) -> Option<ValueRef> {
        self.inner.modules.remove(resource_name)
    }

    pub fn get_module(&self, resource_name: &str) -> Option<ValueRef> {
        self.inner.modules.get(resource_name)
    }

    pub fn contains_module(&self, resource_name: &str) -> bool {
        self.inner.modules.contains(resource_name)
    }

    /// Arm a wall-clock guard that terminates execution after `timeout`.
    pub fn guard(&self, timeout: Duration) -> Result<Guard> {
        let host = self.inner.host.upgrade().ok_or(Error::HostClosed)?;
        if self.is_closed() {
            return Err(Error::RuntimeClosed);
        }
        let target: Weak<RuntimeInner> = Arc::downgrade(&self.inner);
        host.daemon().schedule(target, timeout)
    }

    /// Interrupt in-flight foreign execution. Safe from any thread, without
    /// the runtime lock; a no-op when nothing runs.
    pub fn terminate_execution(&self) {
        ExecutionTarget::terminate_execution(&*self.inner);
    }

    /// Send the engine a low-memory hint right away.
    pub fn low_memory_notification(&self) -> Result<()> {
        let _lock = self.inner.acquire_active()?;
        self.inner
            .engine
            .low_memory_notification(self.handle())
            .map_err(Error::native("low_memory_notification"))
    }

    /// Raise the GC-scheduled flag; the next reference removal consumes it.
    pub fn schedule_gc(&self) {
        self.inner.schedule_gc();
    }

    pub fn is_gc_scheduled(&self) -> bool {
        self.inner.gc_scheduled.load(Ordering::Acquire)
    }

    pub fn attach_inspector(&self, inspector: Arc<dyn InspectorSession>) -> Result<()> {
        let _lock = self.inner.acquire_active()?;
        *self.inner.inspector.lock().expect("inspector slot poisoned") = Some(inspector);
        Ok(())
    }

    pub fn has_inspector(&self) -> bool {
        self.inner
            .inspector
            .lock()
            .expect("inspector slot poisoned")
            .is_some()
    }

    pub fn reference_count(&self) -> usize {
        self.inner.references.count()
    }

    pub fn callback_context_count(&self) -> usize {
        self.inner.callbacks.count()
    }

    pub fn module_count(&self) -> usize {
        self.inner.modules.len()
    }

    pub fn statistics(&self) -> RuntimeStatistics {
        RuntimeStatistics {
            reference_count: self.inner.references.count(),
            weak_reference_count: self.inner.references.weak_count(),
            callback_context_count: self.inner.callbacks.count(),
            module_count: self.inner.modules.len(),
            pending_release_count: self.inner.deferred.len(),
            collected_weak_count: self.inner.weak_refs.collected_count(),
        }
    }
}

impl PartialEq for Runtime {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Runtime {}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("handle", &self.handle())
            .field("state", &self.state())
            .field("pooled", &self.is_pooled())
            .field("references", &self.reference_count())
            .finish()
    }
}
