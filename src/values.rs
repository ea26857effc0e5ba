//! Managed-side representation of foreign values.
//!
//! Primitives are plain data. Everything object-like is a [`ValueRef`]: a
//! clonable wrapper around one handle-table entry. All clones share the same
//! identity, so closing any of them closes the handle for all.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use crate::engine::{INVALID_HANDLE, NativeHandle, ReferenceType};
use crate::error::{Error, Result};
use crate::runtime::{Runtime, RuntimeInner};

/// Shared identity of one wrapped handle.
///
/// The handle table and every clone of a [`ValueRef`] point at the same
/// state. Whoever swaps the handle to [`INVALID_HANDLE`] first owns the
/// release; everyone else sees the value as closed.
pub(crate) struct ReferenceState {
    handle: AtomicU64,
    kind: ReferenceType,
    weak: AtomicBool,
}

impl ReferenceState {
    pub(crate) fn new(handle: NativeHandle, kind: ReferenceType) -> Self {
        Self {
            handle: AtomicU64::new(handle),
            kind,
            weak: AtomicBool::new(false),
        }
    }

    #[inline]
    pub(crate) fn handle(&self) -> NativeHandle {
        self.handle.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn kind(&self) -> ReferenceType {
        self.kind
    }

    #[inline]
    pub(crate) fn is_closed(&self) -> bool {
        self.handle() == INVALID_HANDLE
    }

    #[inline]
    pub(crate) fn is_weak(&self) -> bool {
        self.weak.load(Ordering::Acquire)
    }

    pub(crate) fn set_weak(&self, weak: bool) {
        self.weak.store(weak, Ordering::Release);
    }

    /// Invalidate the state and hand back the handle it held.
    ///
    /// Returns `None` if some other path already took it.
    pub(crate) fn take_handle(&self) -> Option<NativeHandle> {
        match self.handle.swap(INVALID_HANDLE, Ordering::AcqRel) {
            INVALID_HANDLE => None,
            handle => Some(handle),
        }
    }
}

impl fmt::Debug for ReferenceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReferenceState")
            .field("handle", &self.handle())
            .field("kind", &self.kind)
            .field("weak", &self.is_weak())
            .finish()
    }
}

struct ValueInner {
    state: Arc<ReferenceState>,
    runtime: Weak<RuntimeInner>,
}

impl Drop for ValueInner {
    fn drop(&mut self) {
        // Weak handles belong to the foreign collector now.
        if self.state.is_weak() || self.state.is_closed() {
            return;
        }
        if let Some(runtime) = self.runtime.upgrade() {
            runtime.drop_reference(&self.state);
        }
    }
}

/// A foreign object-like value, tracked in its runtime's handle table.
///
/// Dropping the last clone of an unclosed, strong `ValueRef` releases the
/// handle. Weak values are left to the foreign collector.
#[derive(Clone)]
pub struct ValueRef {
    inner: Arc<ValueInner>,
}

impl ValueRef {
    pub(crate) fn new(state: Arc<ReferenceState>, runtime: Weak<RuntimeInner>) -> Self {
        Self {
            inner: Arc::new(ValueInner { state, runtime }),
        }
    }

    pub(crate) fn state(&self) -> &Arc<ReferenceState> {
        &self.inner.state
    }

    /// Current native handle, or [`INVALID_HANDLE`] once closed.
    pub fn handle(&self) -> NativeHandle {
        self.inner.state.handle()
    }

    pub fn kind(&self) -> ReferenceType {
        self.inner.state.kind()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.is_closed()
    }

    /// Locally recorded weak flag. See [`ValueRef::is_weak_native`].
    pub fn is_weak(&self) -> bool {
        self.inner.state.is_weak()
    }

    /// Owning runtime, if it is still alive.
    pub fn runtime(&self) -> Result<Runtime> {
        self.inner
            .runtime
            .upgrade()
            .map(Runtime::from_inner)
            .ok_or(Error::RuntimeClosed)
    }

    pub(crate) fn belongs_to(&self, runtime: &Runtime) -> bool {
        std::ptr::eq(self.inner.runtime.as_ptr(), runtime.inner_ptr())
    }

    /// Release the handle.
    ///
    /// A weak value is owned by the foreign collector, so this is a no-op for
    /// it; use [`ValueRef::force_close`] to release it anyway.
    pub fn close(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ReferenceClosed);
        }
        if self.is_weak() {
            return Ok(());
        }
        self.release()
    }

    /// Release the handle whether or not it is weak.
    pub fn force_close(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ReferenceClosed);
        }
        self.release()
    }

    fn release(&self) -> Result<()> {
        match self.inner.runtime.upgrade() {
            Some(runtime) => runtime.close_reference(&self.inner.state),
            None => {
                // The runtime freed everything on its way out.
                self.inner.state.take_handle();
                Ok(())
            }
        }
    }

    /// Let the foreign collector reclaim this value independently of managed
    /// liveness. Idempotent.
    pub fn set_weak(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ReferenceClosed);
        }
        self.runtime()?.inner().set_weak(&self.inner.state)
    }

    /// Make this value strong again. Idempotent.
    pub fn clear_weak(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ReferenceClosed);
        }
        self.runtime()?.inner().clear_weak(&self.inner.state)
    }

    /// Ask the engine whether the handle is weak and resync the local flag.
    pub fn is_weak_native(&self) -> Result<bool> {
        if self.is_closed() {
            return Err(Error::ReferenceClosed);
        }
        self.runtime()?.inner().query_weak(&self.inner.state)
    }

    /// New wrapper with its own native handle to the same foreign value.
    pub fn try_clone(&self) -> Result<ValueRef> {
        if self.is_closed() {
            return Err(Error::ReferenceClosed);
        }
        self.runtime()?.inner().clone_reference(&self.inner.state)
    }

    /// Give up this clone without releasing the handle.
    ///
    /// If it was the last clone, the handle-table entry stays alive until it
    /// is closed through another wrapper or the runtime tears down.
    pub(crate) fn relinquish(self) {
        if let Ok(mut inner) = Arc::try_unwrap(self.inner) {
            inner.runtime = Weak::new();
        }
    }

    /// Whether both wrappers share one handle-table identity.
    pub fn same_value(&self, other: &ValueRef) -> bool {
        Arc::ptr_eq(&self.inner.state, &other.inner.state)
    }

    pub fn invoke(&self, function_name: &str, args: &[Value]) -> Result<Value> {
        self.runtime()?.invoke(self, function_name, args)
    }

    pub fn call(&self, receiver: Option<&Value>, args: &[Value]) -> Result<Value> {
        self.runtime()?.call_function(self, receiver, args)
    }

    pub fn get_property(&self, key: &str) -> Result<Value> {
        self.runtime()?.get_property(self, key)
    }

    pub fn set_property(&self, key: &str, value: impl Into<Value>) -> Result<()> {
        self.runtime()?.set_property(self, key, &value.into())
    }
}

impl fmt::Debug for ValueRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValueRef")
            .field("handle", &self.handle())
            .field("kind", &self.kind())
            .field("weak", &self.is_weak())
            .finish()
    }
}

/// A managed view of a foreign value.
#[derive(Debug, Clone)]
pub enum Value {
    Undefined,
    Null,
    Boolean(bool),
    Integer(i32),
    Long(i64),
    Double(f64),
    String(String),
    Reference(ValueRef),
}

impl Value {
    pub fn is_undefined(&self) -> bool {
        matches!(self, Value::Undefined)
    }

    pub fn is_null_or_undefined(&self) -> bool {
        matches!(self, Value::Null | Value::Undefined)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(i64::from(*i)),
            Value::Long(l) => Some(*l),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Integer(i) => Some(f64::from(*i)),
            Value::Double(d) => Some(*d),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_reference(&self) -> Option<&ValueRef> {
        match self {
            Value::Reference(r) => Some(r),
            _ => None,
        }
    }

    pub fn into_reference(self) -> Option<ValueRef> {
        match self {
            Value::Reference(r) => Some(r),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Boolean(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Integer(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Long(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Double(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<ValueRef> for Value {
    fn from(value: ValueRef) -> Self {
        Value::Reference(value)
    }
}

impl From<&ValueRef> for Value {
    fn from(value: &ValueRef) -> Self {
        Value::Reference(value.clone())
    }
}
