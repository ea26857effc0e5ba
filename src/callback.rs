//! Managed callbacks exposed to foreign code.
//!
//! A [`CallbackContext`] is an explicit closure registration: the engine
//! only ever sees the opaque context handle, and dispatch looks the closure
//! up by that handle. No reflection, no name lookup.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::engine::{CallbackDescriptor, CallbackType, INVALID_HANDLE, NativeHandle};
use crate::error::{Error, Result};
use crate::runtime::Runtime;
use crate::values::Value;

/// Boxed managed callback.
pub type CallbackFn = dyn Fn(&CallbackInfo<'_>) -> Result<Value> + Send + Sync;

/// Shape a foreign call must have to reach the callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallbackSignature {
    /// Exact argument count, or `None` for variadic.
    pub arity: Option<usize>,
    /// The call must carry a `this` receiver.
    pub this_required: bool,
    /// Whether the callback's result is handed back to foreign code.
    pub return_result: bool,
}

impl Default for CallbackSignature {
    fn default() -> Self {
        Self {
            arity: None,
            this_required: false,
            return_result: true,
        }
    }
}

impl CallbackSignature {
    pub(crate) fn check(&self, name: &str, this: Option<&Value>, arg_count: usize) -> Result<()> {
        match self.arity {
            Some(arity) if arity != arg_count => {
                return Err(Error::CallbackSignatureMismatch {
                    name: name.to_string(),
                    reason: format!("expected {arity} argument(s), got {arg_count}"),
                });
            }
            _ => {}
        }
        if self.this_required && this.is_none_or(Value::is_null_or_undefined) {
            return Err(Error::CallbackSignatureMismatch {
                name: name.to_string(),
                reason: "a `this` receiver is required".to_string(),
            });
        }
        Ok(())
    }
}

/// Arguments of one foreign call into a managed callback.
///
/// Reference arguments are owned by a scope that closes when the callback
/// returns. Use [`ValueRef::try_clone`](crate::ValueRef::try_clone) to keep one.
pub struct CallbackInfo<'a> {
    pub(crate) runtime: &'a Runtime,
    pub(crate) this: Option<&'a Value>,
    pub(crate) args: &'a [Value],
    pub(crate) receiver: Option<&'a (dyn Any + Send + Sync)>,
}

impl<'a> CallbackInfo<'a> {
    pub fn runtime(&self) -> &'a Runtime {
        self.runtime
    }

    pub fn this(&self) -> Option<&'a Value> {
        self.this
    }

    pub fn args(&self) -> &'a [Value] {
        self.args
    }

    pub fn arg(&self, index: usize) -> Option<&'a Value> {
        self.args.get(index)
    }

    /// Managed receiver the context was registered with, downcast to `T`.
    pub fn receiver<T: Any>(&self) -> Option<&'a T> {
        self.receiver.and_then(|r| r.downcast_ref::<T>())
    }
}

/// One managed function exposed to the engine.
///
/// The handle is `0` until the engine registers the context, and goes back
/// to `0` when the context is removed or its runtime is torn down.
pub struct CallbackContext {
    handle: AtomicU64,
    name: String,
    callback_type: CallbackType,
    receiver: Option<Arc<dyn Any + Send + Sync>>,
    signature: CallbackSignature,
    callback: Arc<CallbackFn>,
}

impl CallbackContext {
    fn with_type<F>(name: impl Into<String>, callback_type: CallbackType, callback: F) -> Self
    where
        F: Fn(&CallbackInfo<'_>) -> Result<Value> + Send + Sync + 'static,
    {
        Self {
            handle: AtomicU64::new(INVALID_HANDLE),
            name: name.into(),
            callback_type,
            receiver: None,
            signature: CallbackSignature::default(),
            callback: Arc::new(callback),
        }
    }

    pub fn function<F>(name: impl Into<String>, callback: F) -> Self
    where
        F: Fn(&CallbackInfo<'_>) -> Result<Value> + Send + Sync + 'static,
    {
        Self::with_type(name, CallbackType::Function, callback)
    }

    pub fn getter<F>(name: impl Into<String>, callback: F) -> Self
    where
        F: Fn(&CallbackInfo<'_>) -> Result<Value> + Send + Sync + 'static,
    {
        let mut context = Self::with_type(name, CallbackType::Getter, callback);
        context.signature.arity = Some(0);
        context
    }

    /// Setters receive the assigned value as their single argument and never
    /// return a result.
    pub fn setter<F>(name: impl Into<String>, callback: F) -> Self
    where
        F: Fn(&CallbackInfo<'_>) -> Result<Value> + Send + Sync + 'static,
    {
        let mut context = Self::with_type(name, CallbackType::Setter, callback);
        context.signature.arity = Some(1);
        context.signature.return_result = false;
        context
    }

    pub fn with_receiver(mut self, receiver: Arc<dyn Any + Send + Sync>) -> Self {
        self.receiver = Some(receiver);
        self
    }

    pub fn with_arity(mut self, arity: usize) -> Self {
        self.signature.arity = Some(arity);
        self
    }

    pub fn this_required(mut self) -> Self {
        self.signature.this_required = true;
        self
    }

    pub fn without_result(mut self) -> Self {
        self.signature.return_result = false;
        self
    }

    pub fn handle(&self) -> NativeHandle {
        self.handle.load(Ordering::Acquire)
    }

    pub fn is_valid(&self) -> bool {
        self.handle() != INVALID_HANDLE
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn callback_type(&self) -> CallbackType {
        self.callback_type
    }

    pub fn signature(&self) -> &CallbackSignature {
        &self.signature
    }

    pub(crate) fn set_handle(&self, handle: NativeHandle) {
        debug_assert!(!self.is_valid(), "callback context `{}` registered twice", self.name);
        self.handle.store(handle, Ordering::Release);
    }

    pub(crate) fn invalidate(&self) {
        self.handle.store(INVALID_HANDLE, Ordering::Release);
    }

    pub(crate) fn descriptor(&self) -> CallbackDescriptor {
        CallbackDescriptor {
            name: self.name.clone(),
            callback_type: self.callback_type,
            arity: self.signature.arity,
            this_required: self.signature.this_required,
            return_result: self.signature.return_result,
        }
    }

    pub(crate) fn call(
        &self,
        runtime: &Runtime,
        this: Option<&Value>,
        args: &[Value],
    ) -> Result<Value> {
        self.signature.check(&self.name, this, args.len())?;

        let info = CallbackInfo {
            runtime,
            this,
            args,
            receiver: self.receiver.as_deref(),
        };
        (self.callback)(&info)
    }
}

impl fmt::Debug for CallbackContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackContext")
            .field("handle", &self.handle())
            .field("name", &self.name)
            .field("callback_type", &self.callback_type)
            .field("signature", &self.signature)
            .field("has_receiver", &self.receiver.is_some())
            .finish()
    }
}

/// Registered contexts of one runtime, keyed by context handle.
///
/// Uses its own lock, independent of the handle table, so registering a
/// callback while the table is being walked cannot deadlock.
#[derive(Default)]
pub(crate) struct CallbackRegistry {
    contexts: Mutex<HashMap<NativeHandle, Arc<CallbackContext>>>,
}

impl CallbackRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(&self, context: Arc<CallbackContext>) -> Result<()> {
        self.register_all([context])
    }

    /// Register a getter/setter pair under one lock acquisition.
    pub(crate) fn register_pair(
        &self,
        getter: Arc<CallbackContext>,
        setter: Option<Arc<CallbackContext>>,
    ) -> Result<()> {
        self.register_all(std::iter::once(getter).chain(setter))
    }

    fn register_all(&self, contexts: impl IntoIterator<Item = Arc<CallbackContext>>) -> Result<()> {
        let contexts: Vec<_> = contexts.into_iter().collect();
        if let Some(invalid) = contexts.iter().find(|c| !c.is_valid()) {
            return Err(Error::InvalidArgument(format!(
                "callback context `{}` has no native handle",
                invalid.name()
            )));
        }

        let mut map = self.contexts.lock().expect("callback registry poisoned");
        for context in contexts {
            tracing::trace!(handle = context.handle(), name = context.name(), "callback registered");
            map.insert(context.handle(), context);
        }
        Ok(())
    }

    pub(crate) fn unregister(&self, handle: NativeHandle) -> Option<Arc<CallbackContext>> {
        let removed = self
            .contexts
            .lock()
            .expect("callback registry poisoned")
            .remove(&handle);

        if let Some(context) = &removed {
            context.invalidate();
            tracing::trace!(handle, name = context.name(), "callback unregistered");
        }
        removed
    }

    pub(crate) fn get(&self, handle: NativeHandle) -> Option<Arc<CallbackContext>> {
        self.contexts
            .lock()
            .expect("callback registry poisoned")
            .get(&handle)
            .cloned()
    }

    pub(crate) fn count(&self) -> usize {
        self.contexts.lock().expect("callback registry poisoned").len()
    }

    /// Clear every context at teardown, warning if the engine left any
    /// behind. Returns how many were dropped.
    pub(crate) fn remove_all(&self) -> usize {
        let drained: Vec<_> = {
            let mut map = self.contexts.lock().expect("callback registry poisoned");
            map.drain().map(|(_, context)| context).collect()
        };

        if !drained.is_empty() {
            tracing::warn!(
                count = drained.len(),
                "callback contexts still registered at teardown"
            );
        }
        for context in &drained {
            context.invalidate();
        }
        // Closures are dropped here, outside the registry lock.
        drained.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registered(name: &str, handle: NativeHandle) -> Arc<CallbackContext> {
        let context = Arc::new(CallbackContext::function(name, |_| Ok(Value::Undefined)));
        context.set_handle(handle);
        context
    }

    #[test]
    fn test_context_starts_invalid() {
        let context = CallbackContext::function("noop", |_| Ok(Value::Undefined));
        assert_eq!(context.handle(), INVALID_HANDLE);
        assert!(!context.is_valid());
        assert!(context.signature().return_result);
    }

    #[test]
    fn test_accessor_signatures() {
        let getter = CallbackContext::getter("x", |_| Ok(Value::Integer(1)));
        assert_eq!(getter.signature().arity, Some(0));

        let setter = CallbackContext::setter("x", |_| Ok(Value::Undefined));
        assert_eq!(setter.signature().arity, Some(1));
        assert!(!setter.signature().return_result);
        assert_eq!(setter.descriptor().callback_type, CallbackType::Setter);
    }

    #[test]
    fn test_signature_check() {
        let signature = CallbackSignature {
            arity: Some(2),
            this_required: true,
            return_result: true,
        };
        let this = Value::Integer(0);

        assert!(signature.check("f", Some(&this), 2).is_ok());
        assert!(matches!(
            signature.check("f", Some(&this), 1),
            Err(Error::CallbackSignatureMismatch { .. })
        ));
        assert!(matches!(
            signature.check("f", None, 2),
            Err(Error::CallbackSignatureMismatch { .. })
        ));
        assert!(matches!(
            signature.check("f", Some(&Value::Undefined), 2),
            Err(Error::CallbackSignatureMismatch { .. })
        ));
    }

    #[test]
    fn test_register_requires_handle() {
        let registry = CallbackRegistry::new();
        let context = Arc::new(CallbackContext::function("f", |_| Ok(Value::Undefined)));

        assert!(matches!(
            registry.register(context),
            Err(Error::InvalidArgument(_))
        ));
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn test_register_pair_and_unregister() {
        let registry = CallbackRegistry::new();
        let getter = registered("get", 10);
        let setter = registered("set", 11);

        registry
            .register_pair(Arc::clone(&getter), Some(Arc::clone(&setter)))
            .unwrap();
        assert_eq!(registry.count(), 2);
        assert!(registry.get(10).is_some());

        let removed = registry.unregister(10).unwrap();
        assert_eq!(removed.name(), "get");
        assert!(!getter.is_valid());
        assert!(registry.unregister(10).is_none());
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn test_remove_all_invalidates() {
        let registry = CallbackRegistry::new();
        let a = registered("a", 1);
        let b = registered("b", 2);
        registry.register(Arc::clone(&a)).unwrap();
        registry.register(Arc::clone(&b)).unwrap();

        assert_eq!(registry.remove_all(), 2);
        assert_eq!(registry.count(), 0);
        assert!(!a.is_valid());
        assert!(!b.is_valid());
        assert_eq!(registry.remove_all(), 0);
    }

    #[test]
    fn test_receiver_downcast() {
        struct Counter(u32);

        let receiver: Arc<dyn Any + Send + Sync> = Arc::new(Counter(7));
        let context = CallbackContext::function("count", |info| {
            let counter = info.receiver::<Counter>().map(|c| c.0).unwrap_or(0);
            Ok(Value::Integer(counter as i32))
        })
        .with_receiver(receiver);

        let host = crate::Host::with_engine(
            Arc::new(crate::engine::recording::RecordingEngine::new()),
            crate::HostConfig::default(),
        );
        let runtime = host.create_runtime(crate::RuntimeOptions::default()).unwrap();

        let result = context.call(&runtime, None, &[]).unwrap();
        assert_eq!(result.as_i32(), Some(7));

        runtime.close(true).unwrap();
    }
}
