//! In-memory [`NativeEngine`] for tests, benches and embedders that run
//! without the native library.
//!
//! The engine keeps a tiny object graph per runtime and hands out a fresh
//! handle for every value that crosses the boundary, exactly like the real
//! library does. Every call is counted per [`NativeOp`], release attempts are
//! counted per handle, and any operation can be made to fail once with
//! [`RecordingEngine::fail_next`].
//!
//! Foreign collection is simulated with [`RecordingEngine::collect_garbage`];
//! long-running scripts with a handler installed through
//! [`RecordingEngine::set_script_handler`] that polls
//! [`ScriptContext::is_terminating`].
//!
//! Hooks are never called while the engine's own lock is held, so callbacks
//! may re-enter the engine freely.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use super::{
    CallbackDescriptor, EngineHooks, NativeEngine, NativeError, NativeHandle, NativeResult,
    NativeValue, ReferenceType,
};
use crate::options::RuntimeOptions;

/// One kind of native call, for per-operation accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NativeOp {
    CreateRuntime,
    CloseRuntime,
    ResetContext,
    ResetIsolate,
    CreateReference,
    CompileModule,
    Execute,
    CallFunction,
    Invoke,
    GetProperty,
    SetProperty,
    CloneReference,
    ReleaseReference,
    SetWeak,
    ClearWeak,
    IsWeak,
    RegisterCallback,
    UnregisterCallback,
    CreateFunction,
    BindAccessor,
    TerminateExecution,
    LowMemoryNotification,
}

type ObjectId = u64;

/// Script evaluator. Gets the source and returns the completion value; a
/// reference in the result is a handle the caller owns.
pub type ScriptHandler =
    dyn Fn(&ScriptContext<'_>, &str) -> NativeResult<NativeValue> + Send + Sync;

#[derive(Debug, Clone)]
enum Slot {
    Primitive(NativeValue),
    Object(ObjectId),
}

#[derive(Debug)]
struct Object {
    kind: ReferenceType,
    elements: Vec<Slot>,
    properties: HashMap<String, Slot>,
    accessors: HashMap<String, (NativeHandle, Option<NativeHandle>)>,
    callback: Option<NativeHandle>,
    /// Live handles pointing at this object.
    handles: usize,
    /// Slots of other objects holding this one.
    retained: usize,
}

impl Object {
    fn new(kind: ReferenceType) -> Self {
        Self {
            kind,
            elements: Vec::new(),
            properties: HashMap::new(),
            accessors: HashMap::new(),
            callback: None,
            handles: 0,
            retained: 0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct HandleEntry {
    object: ObjectId,
    weak: bool,
}

struct RuntimeSlot {
    ids: Arc<AtomicU64>,
    hooks: Arc<dyn EngineHooks>,
    handles: HashMap<NativeHandle, HandleEntry>,
    objects: HashMap<ObjectId, Object>,
    callbacks: HashMap<NativeHandle, CallbackDescriptor>,
    executing: Arc<AtomicBool>,
    terminating: Arc<AtomicBool>,
}

impl RuntimeSlot {
    fn next_id(&self) -> u64 {
        self.ids.fetch_add(1, Ordering::Relaxed)
    }

    fn alloc(&mut self, object: Object) -> ObjectId {
        let id = self.next_id();
        self.objects.insert(id, object);
        id
    }

    fn issue(&mut self, object: ObjectId) -> NativeHandle {
        let handle = self.next_id();
        self.handles.insert(
            handle,
            HandleEntry {
                object,
                weak: false,
            },
        );
        if let Some(object) = self.objects.get_mut(&object) {
            object.handles += 1;
        }
        handle
    }

    fn entry(&mut self, handle: NativeHandle) -> NativeResult<&mut HandleEntry> {
        self.handles
            .get_mut(&handle)
            .ok_or(NativeError::InvalidHandle(handle))
    }

    fn object_id(&self, handle: NativeHandle) -> NativeResult<ObjectId> {
        self.handles
            .get(&handle)
            .map(|entry| entry.object)
            .ok_or(NativeError::InvalidHandle(handle))
    }

    fn object(&self, id: ObjectId) -> NativeResult<&Object> {
        self.objects
            .get(&id)
            .ok_or_else(|| NativeError::exception("object was freed"))
    }

    fn object_mut(&mut self, id: ObjectId) -> NativeResult<&mut Object> {
        self.objects
            .get_mut(&id)
            .ok_or_else(|| NativeError::exception("object was freed"))
    }

    /// A fresh handle to whatever `value` points at.
    fn adopt(&mut self, value: &NativeValue) -> NativeResult<NativeValue> {
        match value {
            NativeValue::Reference { handle, kind } => {
                let object = self.object_id(*handle)?;
                Ok(NativeValue::Reference {
                    handle: self.issue(object),
                    kind: *kind,
                })
            }
            primitive => Ok(primitive.clone()),
        }
    }

    fn retain(&mut self, value: &NativeValue) -> NativeResult<Slot> {
        match value {
            NativeValue::Reference { handle, .. } => {
                let id = self.object_id(*handle)?;
                self.object_mut(id)?.retained += 1;
                Ok(Slot::Object(id))
            }
            primitive => Ok(Slot::Primitive(primitive.clone())),
        }
    }

    fn unretain(&mut self, slot: Slot) {
        if let Slot::Object(id) = slot
            && let Some(object) = self.objects.get_mut(&id)
        {
            object.retained = object.retained.saturating_sub(1);
        }
    }

    fn read(&mut self, slot: &Slot) -> NativeValue {
        match slot {
            Slot::Primitive(value) => value.clone(),
            Slot::Object(id) => match self.objects.get(id).map(|object| object.kind) {
                Some(kind) => NativeValue::Reference {
                    handle: self.issue(*id),
                    kind,
                },
                None => NativeValue::Undefined,
            },
        }
    }

    /// Drop one handle. Returns the callback context whose function was freed.
    fn release(&mut self, handle: NativeHandle) -> NativeResult<Option<NativeHandle>> {
        let entry = self
            .handles
            .remove(&handle)
            .ok_or(NativeError::InvalidHandle(handle))?;

        let Some(object) = self.objects.get_mut(&entry.object) else {
            return Ok(None);
        };
        object.handles -= 1;
        if object.handles > 0 || object.retained > 0 {
            return Ok(None);
        }

        let freed = self.objects.remove(&entry.object);
        let context = freed.and_then(|object| object.callback);
        if let Some(context) = context {
            self.callbacks.remove(&context);
        }
        Ok(context)
    }

    fn clear(&mut self) {
        self.handles.clear();
        self.objects.clear();
        self.callbacks.clear();
    }
}

/// Work left to do once the engine lock is released.
enum Step {
    Done(NativeValue),
    Callback {
        hooks: Arc<dyn EngineHooks>,
        context: NativeHandle,
        this: Option<NativeValue>,
        args: Vec<NativeValue>,
    },
}

fn property_key(value: Option<&NativeValue>) -> NativeResult<String> {
    Ok(match value {
        None | Some(NativeValue::Undefined) => "undefined".to_string(),
        Some(NativeValue::Null) => "null".to_string(),
        Some(NativeValue::Boolean(b)) => b.to_string(),
        Some(NativeValue::Integer(i)) => i.to_string(),
        Some(NativeValue::Long(l)) => l.to_string(),
        Some(NativeValue::Double(d)) => d.to_string(),
        Some(NativeValue::String(s)) => s.clone(),
        Some(NativeValue::Reference { .. }) => {
            return Err(NativeError::Unsupported("object keys"));
        }
    })
}

/// What a script handler can do while it runs.
pub struct ScriptContext<'a> {
    engine: &'a RecordingEngine,
    runtime: NativeHandle,
    terminating: &'a AtomicBool,
}

impl ScriptContext<'_> {
    pub fn runtime(&self) -> NativeHandle {
        self.runtime
    }

    /// Set once `terminate_execution` hit this run.
    pub fn is_terminating(&self) -> bool {
        self.terminating.load(Ordering::Acquire)
    }

    /// Allocate a value the script returns to its caller.
    pub fn create(&self, kind: ReferenceType) -> NativeResult<NativeValue> {
        let handle = self.engine.create_reference(self.runtime, kind)?;
        Ok(NativeValue::Reference { handle, kind })
    }

    /// Call a function value from script, the way foreign code would.
    pub fn call_function(
        &self,
        function: NativeHandle,
        args: &[NativeValue],
    ) -> NativeResult<NativeValue> {
        self.engine.call_function(self.runtime, function, None, args)
    }
}

/// Evaluates literals: numbers, quoted strings, booleans, `null`,
/// `undefined`, `{}` and `[]`.
fn evaluate_literal(ctx: &ScriptContext<'_>, source: &str) -> NativeResult<NativeValue> {
    let source = source.trim().trim_end_matches(';').trim();
    let quoted = |q: char| source.len() >= 2 && source.starts_with(q) && source.ends_with(q);

    match source {
        "" | "undefined" => Ok(NativeValue::Undefined),
        "null" => Ok(NativeValue::Null),
        "true" => Ok(NativeValue::Boolean(true)),
        "false" => Ok(NativeValue::Boolean(false)),
        "{}" => ctx.create(ReferenceType::Object),
        "[]" => ctx.create(ReferenceType::Array),
        _ if quoted('"') || quoted('\'') => {
            Ok(NativeValue::String(source[1..source.len() - 1].to_string()))
        }
        _ => {
            if let Ok(i) = source.parse::<i32>() {
                Ok(NativeValue::Integer(i))
            } else if let Ok(l) = source.parse::<i64>() {
                Ok(NativeValue::Long(l))
            } else if let Ok(d) = source.parse::<f64>() {
                Ok(NativeValue::Double(d))
            } else {
                Err(NativeError::exception(format!(
                    "SyntaxError: cannot evaluate `{source}`"
                )))
            }
        }
    }
}

/// Deterministic in-memory engine. See the module docs.
pub struct RecordingEngine {
    ids: Arc<AtomicU64>,
    runtimes: Mutex<HashMap<NativeHandle, RuntimeSlot>>,
    ops: Mutex<HashMap<NativeOp, usize>>,
    release_attempts: Mutex<HashMap<NativeHandle, usize>>,
    failures: Mutex<HashMap<NativeOp, NativeError>>,
    handler: RwLock<Arc<ScriptHandler>>,
}

impl Default for RecordingEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingEngine {
    pub fn new() -> Self {
        let handler: Arc<ScriptHandler> = Arc::new(evaluate_literal);
        Self {
            ids: Arc::new(AtomicU64::new(1)),
            runtimes: Mutex::new(HashMap::new()),
            ops: Mutex::new(HashMap::new()),
            release_attempts: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
            handler: RwLock::new(handler),
        }
    }

    /// Replace the script evaluator used by `execute`.
    pub fn set_script_handler<F>(&self, handler: F)
    where
        F: Fn(&ScriptContext<'_>, &str) -> NativeResult<NativeValue> + Send + Sync + 'static,
    {
        let handler: Arc<ScriptHandler> = Arc::new(handler);
        *self.handler.write().expect("script handler poisoned") = handler;
    }

    /// Make the next call of `op` fail with `error`.
    pub fn fail_next(&self, op: NativeOp, error: NativeError) {
        self.failures
            .lock()
            .expect("failure table poisoned")
            .insert(op, error);
    }

    /// How many times `op` was called.
    pub fn count(&self, op: NativeOp) -> usize {
        self.ops
            .lock()
            .expect("op counters poisoned")
            .get(&op)
            .copied()
            .unwrap_or(0)
    }

    /// Release attempts for `handle`, including ones rejected as invalid.
    pub fn release_count(&self, handle: NativeHandle) -> usize {
        self.release_attempts
            .lock()
            .expect("release counters poisoned")
            .get(&handle)
            .copied()
            .unwrap_or(0)
    }

    pub fn runtime_count(&self) -> usize {
        self.runtimes.lock().expect("recording engine poisoned").len()
    }

    /// Outstanding handles of `runtime`; `0` for unknown runtimes.
    pub fn live_handle_count(&self, runtime: NativeHandle) -> usize {
        self.inspect(runtime, |slot| slot.handles.len())
    }

    pub fn weak_handle_count(&self, runtime: NativeHandle) -> usize {
        self.inspect(runtime, |slot| {
            slot.handles.values().filter(|entry| entry.weak).count()
        })
    }

    pub fn contains_handle(&self, runtime: NativeHandle, handle: NativeHandle) -> bool {
        self.inspect(runtime, |slot| slot.handles.contains_key(&handle))
    }

    /// Registered callback contexts of `runtime`.
    pub fn callback_count(&self, runtime: NativeHandle) -> usize {
        self.inspect(runtime, |slot| slot.callbacks.len())
    }

    pub fn is_executing(&self, runtime: NativeHandle) -> bool {
        self.inspect(runtime, |slot| slot.executing.load(Ordering::Acquire))
    }

    /// Run the foreign collector: every weak handle of `runtime` is freed and
    /// reported through `on_weak_collected`. Returns how many were collected.
    pub fn collect_garbage(&self, runtime: NativeHandle) -> usize {
        let (hooks, collected, freed_callbacks) = {
            let mut runtimes = self.runtimes.lock().expect("recording engine poisoned");
            let Some(slot) = runtimes.get_mut(&runtime) else {
                return 0;
            };
            let collected: Vec<NativeHandle> = slot
                .handles
                .iter()
                .filter(|(_, entry)| entry.weak)
                .map(|(handle, _)| *handle)
                .collect();
            let freed_callbacks: Vec<NativeHandle> = collected
                .iter()
                .filter_map(|handle| slot.release(*handle).ok().flatten())
                .collect();
            (Arc::clone(&slot.hooks), collected, freed_callbacks)
        };

        tracing::trace!(runtime, collected = collected.len(), "simulated collection");
        for handle in &collected {
            hooks.on_weak_collected(*handle);
        }
        for context in freed_callbacks {
            hooks.on_callback_released(context);
        }
        collected.len()
    }

    fn inspect<R: Default>(&self, runtime: NativeHandle, f: impl FnOnce(&RuntimeSlot) -> R) -> R {
        self.runtimes
            .lock()
            .expect("recording engine poisoned")
            .get(&runtime)
            .map(f)
            .unwrap_or_default()
    }

    fn record(&self, op: NativeOp) -> NativeResult<()> {
        *self
            .ops
            .lock()
            .expect("op counters poisoned")
            .entry(op)
            .or_default() += 1;
        match self.failures.lock().expect("failure table poisoned").remove(&op) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn with_runtime<R>(
        &self,
        runtime: NativeHandle,
        f: impl FnOnce(&mut RuntimeSlot) -> NativeResult<R>,
    ) -> NativeResult<R> {
        let mut runtimes = self.runtimes.lock().expect("recording engine poisoned");
        let slot = runtimes
            .get_mut(&runtime)
            .ok_or(NativeError::RuntimeNotFound(runtime))?;
        f(slot)
    }

    fn finish(step: Step) -> NativeResult<NativeValue> {
        match step {
            Step::Done(value) => Ok(value),
            Step::Callback {
                hooks,
                context,
                this,
                args,
            } => hooks.invoke_callback(context, this, args),
        }
    }

    /// Drop a handle without counting it as a managed release.
    fn discard(&self, runtime: NativeHandle, value: &NativeValue) {
        if let NativeValue::Reference { handle, .. } = value {
            let _ = self.with_runtime(runtime, |slot| slot.release(*handle));
        }
    }
}

impl NativeEngine for RecordingEngine {
    fn create_runtime(
        &self,
        options: &RuntimeOptions,
        hooks: Arc<dyn EngineHooks>,
    ) -> NativeResult<NativeHandle> {
        self.record(NativeOp::CreateRuntime)?;
        if options.heap_max_mb == 0 || options.heap_initial_mb > options.heap_max_mb {
            return Err(NativeError::exception(format!(
                "invalid heap limits {}MB..{}MB",
                options.heap_initial_mb, options.heap_max_mb
            )));
        }

        let handle = self.ids.fetch_add(1, Ordering::Relaxed);
        self.runtimes.lock().expect("recording engine poisoned").insert(
            handle,
            RuntimeSlot {
                ids: Arc::clone(&self.ids),
                hooks,
                handles: HashMap::new(),
                objects: HashMap::new(),
                callbacks: HashMap::new(),
                executing: Arc::new(AtomicBool::new(false)),
                terminating: Arc::new(AtomicBool::new(false)),
            },
        );
        Ok(handle)
    }

    fn close_runtime(&self, runtime: NativeHandle) -> NativeResult<()> {
        self.record(NativeOp::CloseRuntime)?;
        self.runtimes
            .lock()
            .expect("recording engine poisoned")
            .remove(&runtime)
            .map(drop)
            .ok_or(NativeError::RuntimeNotFound(runtime))
    }

    fn reset_context(&self, runtime: NativeHandle) -> NativeResult<()> {
        self.record(NativeOp::ResetContext)?;
        self.with_runtime(runtime, |slot| {
            slot.clear();
            Ok(())
        })
    }

    fn reset_isolate(&self, runtime: NativeHandle) -> NativeResult<()> {
        self.record(NativeOp::ResetIsolate)?;
        self.with_runtime(runtime, |slot| {
            slot.clear();
            Ok(())
        })
    }

    fn create_reference(
        &self,
        runtime: NativeHandle,
        kind: ReferenceType,
    ) -> NativeResult<NativeHandle> {
        self.record(NativeOp::CreateReference)?;
        self.with_runtime(runtime, |slot| {
            let object = slot.alloc(Object::new(kind));
            Ok(slot.issue(object))
        })
    }

    fn compile_module(
        &self,
        runtime: NativeHandle,
        resource_name: &str,
        source: &str,
    ) -> NativeResult<NativeHandle> {
        self.record(NativeOp::CompileModule)?;
        if resource_name.is_empty() {
            return Err(NativeError::exception("module resource name is empty"));
        }
        self.with_runtime(runtime, |slot| {
            let mut module = Object::new(ReferenceType::Module);
            module.properties.insert(
                "resource".to_string(),
                Slot::Primitive(NativeValue::String(resource_name.to_string())),
            );
            module.properties.insert(
                "source".to_string(),
                Slot::Primitive(NativeValue::String(source.to_string())),
            );
            let id = slot.alloc(module);
            Ok(slot.issue(id))
        })
    }

    fn execute(&self, runtime: NativeHandle, source: &str) -> NativeResult<NativeValue> {
        self.record(NativeOp::Execute)?;
        let (executing, terminating) = self.with_runtime(runtime, |slot| {
            Ok((Arc::clone(&slot.executing), Arc::clone(&slot.terminating)))
        })?;
        let handler = Arc::clone(&self.handler.read().expect("script handler poisoned"));

        terminating.store(false, Ordering::Release);
        executing.store(true, Ordering::Release);
        let ctx = ScriptContext {
            engine: self,
            runtime,
            terminating: &terminating,
        };
        let result = handler(&ctx, source);
        executing.store(false, Ordering::Release);

        if terminating.swap(false, Ordering::AcqRel) {
            if let Ok(value) = &result {
                self.discard(runtime, value);
            }
            return Err(NativeError::Terminated);
        }
        result
    }

    fn call_function(
        &self,
        runtime: NativeHandle,
        function: NativeHandle,
        receiver: Option<&NativeValue>,
        args: &[NativeValue],
    ) -> NativeResult<NativeValue> {
        self.record(NativeOp::CallFunction)?;
        let step = self.with_runtime(runtime, |slot| {
            let object = slot.object(slot.object_id(function)?)?;
            if object.kind != ReferenceType::Function {
                return Err(NativeError::exception(format!(
                    "TypeError: {} is not a function",
                    object.kind
                )));
            }
            let Some(context) = object.callback else {
                return Ok(Step::Done(NativeValue::Undefined));
            };
            if !slot.callbacks.contains_key(&context) {
                return Err(NativeError::exception("callback was released"));
            }

            let this = receiver.map(|r| slot.adopt(r)).transpose()?;
            let args = args
                .iter()
                .map(|arg| slot.adopt(arg))
                .collect::<NativeResult<Vec<_>>>()?;
            Ok(Step::Callback {
                hooks: Arc::clone(&slot.hooks),
                context,
                this,
                args,
            })
        })?;
        Self::finish(step)
    }

    fn invoke(
        &self,
        runtime: NativeHandle,
        target: NativeHandle,
        function_name: &str,
        args: &[NativeValue],
    ) -> NativeResult<NativeValue> {
        use ReferenceType::{Array, Map, Object as Obj, Promise, Set};

        self.record(NativeOp::Invoke)?;
        let step = self.with_runtime(runtime, |slot| {
            let id = slot.object_id(target)?;
            let kind = slot.object(id)?.kind;

            let value = match (kind, function_name) {
                (Array, "push") => {
                    let values = args
                        .iter()
                        .map(|arg| slot.retain(arg))
                        .collect::<NativeResult<Vec<_>>>()?;
                    let elements = &mut slot.object_mut(id)?.elements;
                    elements.extend(values);
                    NativeValue::Integer(elements.len() as i32)
                }
                (Array, "pop") => {
                    let popped = slot.object_mut(id)?.elements.pop();
                    match popped {
                        Some(popped) => {
                            let value = slot.read(&popped);
                            slot.unretain(popped);
                            value
                        }
                        None => NativeValue::Undefined,
                    }
                }
                (Map | Obj, "set") | (Set, "add") | (Promise, "resolve") => {
                    let (key, value) = match (kind, function_name) {
                        (Set, _) => (property_key(args.first())?, args.first()),
                        (Promise, _) => ("value".to_string(), args.first()),
                        _ => (property_key(args.first())?, args.get(1)),
                    };
                    let stored = match value {
                        Some(value) => slot.retain(value)?,
                        None => Slot::Primitive(NativeValue::Undefined),
                    };
                    let replaced = slot.object_mut(id)?.properties.insert(key, stored);
                    if let Some(replaced) = replaced {
                        slot.unretain(replaced);
                    }
                    NativeValue::Undefined
                }
                (Map | Obj, "get") => {
                    let key = property_key(args.first())?;
                    let stored = slot.object(id)?.properties.get(&key).cloned();
                    match stored {
                        Some(stored) => slot.read(&stored),
                        None => NativeValue::Undefined,
                    }
                }
                (Map | Obj | Set, "has") => {
                    let key = property_key(args.first())?;
                    NativeValue::Boolean(slot.object(id)?.properties.contains_key(&key))
                }
                (Map | Obj | Set, "delete") => {
                    let key = property_key(args.first())?;
                    let removed = slot.object_mut(id)?.properties.remove(&key);
                    let found = removed.is_some();
                    if let Some(removed) = removed {
                        slot.unretain(removed);
                    }
                    NativeValue::Boolean(found)
                }
                _ => {
                    let method = slot.object(id)?.properties.get(function_name).cloned();
                    let context = match method {
                        Some(Slot::Object(method)) => slot.object(method)?.callback,
                        _ => None,
                    };
                    let Some(context) = context else {
                        return Err(NativeError::exception(format!(
                            "TypeError: {function_name} is not a function"
                        )));
                    };
                    let this = NativeValue::Reference {
                        handle: slot.issue(id),
                        kind,
                    };
                    let args = args
                        .iter()
                        .map(|arg| slot.adopt(arg))
                        .collect::<NativeResult<Vec<_>>>()?;
                    return Ok(Step::Callback {
                        hooks: Arc::clone(&slot.hooks),
                        context,
                        this: Some(this),
                        args,
                    });
                }
            };
            Ok(Step::Done(value))
        })?;
        Self::finish(step)
    }

    fn get_property(
        &self,
        runtime: NativeHandle,
        target: NativeHandle,
        key: &str,
    ) -> NativeResult<NativeValue> {
        self.record(NativeOp::GetProperty)?;
        let step = self.with_runtime(runtime, |slot| {
            let id = slot.object_id(target)?;
            let object = slot.object(id)?;
            let kind = object.kind;

            if let Some((getter, _)) = object.accessors.get(key).copied() {
                let this = NativeValue::Reference {
                    handle: slot.issue(id),
                    kind,
                };
                return Ok(Step::Callback {
                    hooks: Arc::clone(&slot.hooks),
                    context: getter,
                    this: Some(this),
                    args: Vec::new(),
                });
            }

            let stored = match (kind, key) {
                (ReferenceType::Array, "length") => {
                    Some(Slot::Primitive(NativeValue::Integer(object.elements.len() as i32)))
                }
                (ReferenceType::Map | ReferenceType::Set, "size") => Some(Slot::Primitive(
                    NativeValue::Integer(object.properties.len() as i32),
                )),
                (ReferenceType::Array, _) => match key.parse::<usize>() {
                    Ok(index) => object.elements.get(index).cloned(),
                    Err(_) => object.properties.get(key).cloned(),
                },
                _ => object.properties.get(key).cloned(),
            };
            Ok(Step::Done(match stored {
                Some(stored) => slot.read(&stored),
                None => NativeValue::Undefined,
            }))
        })?;
        Self::finish(step)
    }

    fn set_property(
        &self,
        runtime: NativeHandle,
        target: NativeHandle,
        key: &str,
        value: &NativeValue,
    ) -> NativeResult<()> {
        self.record(NativeOp::SetProperty)?;
        let step = self.with_runtime(runtime, |slot| {
            let id = slot.object_id(target)?;
            let object = slot.object(id)?;
            let kind = object.kind;

            if let Some((_, setter)) = object.accessors.get(key).copied() {
                let Some(setter) = setter else {
                    return Ok(Step::Done(NativeValue::Undefined));
                };
                let this = NativeValue::Reference {
                    handle: slot.issue(id),
                    kind,
                };
                let value = slot.adopt(value)?;
                return Ok(Step::Callback {
                    hooks: Arc::clone(&slot.hooks),
                    context: setter,
                    this: Some(this),
                    args: vec![value],
                });
            }

            let stored = slot.retain(value)?;
            let object = slot.object_mut(id)?;
            let replaced = match key.parse::<usize>() {
                Ok(index) if kind == ReferenceType::Array => {
                    if index >= object.elements.len() {
                        object.elements.resize(
                            index + 1,
                            Slot::Primitive(NativeValue::Undefined),
                        );
                    }
                    Some(std::mem::replace(&mut object.elements[index], stored))
                }
                _ => object.properties.insert(key.to_string(), stored),
            };
            if let Some(replaced) = replaced {
                slot.unretain(replaced);
            }
            Ok(Step::Done(NativeValue::Undefined))
        })?;
        Self::finish(step).map(drop)
    }

    fn clone_reference(
        &self,
        runtime: NativeHandle,
        value: NativeHandle,
    ) -> NativeResult<NativeHandle> {
        self.record(NativeOp::CloneReference)?;
        self.with_runtime(runtime, |slot| {
            let object = slot.object_id(value)?;
            Ok(slot.issue(object))
        })
    }

    fn release_reference(&self, runtime: NativeHandle, value: NativeHandle) -> NativeResult<()> {
        self.record(NativeOp::ReleaseReference)?;
        *self
            .release_attempts
            .lock()
            .expect("release counters poisoned")
            .entry(value)
            .or_default() += 1;

        let (hooks, freed_callback) = self.with_runtime(runtime, |slot| {
            let freed = slot.release(value)?;
            Ok((Arc::clone(&slot.hooks), freed))
        })?;
        if let Some(context) = freed_callback {
            hooks.on_callback_released(context);
        }
        Ok(())
    }

    fn set_weak(&self, runtime: NativeHandle, value: NativeHandle) -> NativeResult<()> {
        self.record(NativeOp::SetWeak)?;
        self.with_runtime(runtime, |slot| {
            slot.entry(value)?.weak = true;
            Ok(())
        })
    }

    fn clear_weak(&self, runtime: NativeHandle, value: NativeHandle) -> NativeResult<()> {
        self.record(NativeOp::ClearWeak)?;
        self.with_runtime(runtime, |slot| {
            slot.entry(value)?.weak = false;
            Ok(())
        })
    }

    fn is_weak(&self, runtime: NativeHandle, value: NativeHandle) -> NativeResult<bool> {
        self.record(NativeOp::IsWeak)?;
        self.with_runtime(runtime, |slot| Ok(slot.entry(value)?.weak))
    }

    fn register_callback(
        &self,
        runtime: NativeHandle,
        descriptor: &CallbackDescriptor,
    ) -> NativeResult<NativeHandle> {
        self.record(NativeOp::RegisterCallback)?;
        self.with_runtime(runtime, |slot| {
            let context = slot.next_id();
            slot.callbacks.insert(context, descriptor.clone());
            Ok(context)
        })
    }

    fn unregister_callback(
        &self,
        runtime: NativeHandle,
        context: NativeHandle,
    ) -> NativeResult<()> {
        self.record(NativeOp::UnregisterCallback)?;
        self.with_runtime(runtime, |slot| {
            slot.callbacks
                .remove(&context)
                .map(drop)
                .ok_or(NativeError::InvalidHandle(context))
        })
    }

    fn create_function(
        &self,
        runtime: NativeHandle,
        context: NativeHandle,
    ) -> NativeResult<NativeHandle> {
        self.record(NativeOp::CreateFunction)?;
        self.with_runtime(runtime, |slot| {
            if !slot.callbacks.contains_key(&context) {
                return Err(NativeError::InvalidHandle(context));
            }
            let mut function = Object::new(ReferenceType::Function);
            function.callback = Some(context);
            let id = slot.alloc(function);
            Ok(slot.issue(id))
        })
    }

    fn bind_accessor(
        &self,
        runtime: NativeHandle,
        target: NativeHandle,
        name: &str,
        getter: NativeHandle,
        setter: Option<NativeHandle>,
    ) -> NativeResult<()> {
        self.record(NativeOp::BindAccessor)?;
        self.with_runtime(runtime, |slot| {
            for context in std::iter::once(getter).chain(setter) {
                if !slot.callbacks.contains_key(&context) {
                    return Err(NativeError::InvalidHandle(context));
                }
            }
            let id = slot.object_id(target)?;
            slot.object_mut(id)?
                .accessors
                .insert(name.to_string(), (getter, setter));
            Ok(())
        })
    }

    fn terminate_execution(&self, runtime: NativeHandle) {
        *self
            .ops
            .lock()
            .expect("op counters poisoned")
            .entry(NativeOp::TerminateExecution)
            .or_default() += 1;

        let runtimes = self.runtimes.lock().expect("recording engine poisoned");
        if let Some(slot) = runtimes.get(&runtime)
            && slot.executing.load(Ordering::Acquire)
        {
            slot.terminating.store(true, Ordering::Release);
        }
    }

    fn low_memory_notification(&self, runtime: NativeHandle) -> NativeResult<()> {
        self.record(NativeOp::LowMemoryNotification)?;
        self.with_runtime(runtime, |_| Ok(()))
    }
}

impl std::fmt::Debug for RecordingEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordingEngine")
            .field("runtimes", &self.runtime_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoHooks;

    impl EngineHooks for NoHooks {
        fn on_weak_collected(&self, _value: NativeHandle) {}
        fn on_callback_released(&self, _context: NativeHandle) {}
        fn invoke_callback(
            &self,
            _context: NativeHandle,
            _this: Option<NativeValue>,
            _args: Vec<NativeValue>,
        ) -> NativeResult<NativeValue> {
            Ok(NativeValue::Undefined)
        }
    }

    fn runtime(engine: &RecordingEngine) -> NativeHandle {
        engine
            .create_runtime(&RuntimeOptions::default(), Arc::new(NoHooks))
            .unwrap()
    }

    #[test]
    fn test_release_twice_is_invalid() {
        let engine = RecordingEngine::new();
        let rt = runtime(&engine);
        let handle = engine.create_reference(rt, ReferenceType::Object).unwrap();

        engine.release_reference(rt, handle).unwrap();
        assert_eq!(
            engine.release_reference(rt, handle),
            Err(NativeError::InvalidHandle(handle))
        );
        assert_eq!(engine.release_count(handle), 2);
        assert_eq!(engine.live_handle_count(rt), 0);
    }

    #[test]
    fn test_array_push_and_read_back() {
        let engine = RecordingEngine::new();
        let rt = runtime(&engine);
        let array = engine.create_reference(rt, ReferenceType::Array).unwrap();
        let item = engine.create_reference(rt, ReferenceType::Object).unwrap();
        let item_value = NativeValue::Reference {
            handle: item,
            kind: ReferenceType::Object,
        };

        let len = engine
            .invoke(rt, array, "push", &[NativeValue::Integer(7), item_value])
            .unwrap();
        assert_eq!(len, NativeValue::Integer(2));
        assert_eq!(
            engine.get_property(rt, array, "length").unwrap(),
            NativeValue::Integer(2)
        );

        // Stored objects come back under a fresh handle.
        let NativeValue::Reference { handle, .. } = engine.get_property(rt, array, "1").unwrap()
        else {
            panic!("expected a reference");
        };
        assert_ne!(handle, item);
        assert_eq!(engine.live_handle_count(rt), 3);
    }

    #[test]
    fn test_collect_garbage_frees_weak_handles_only() {
        let engine = RecordingEngine::new();
        let rt = runtime(&engine);
        let strong = engine.create_reference(rt, ReferenceType::Object).unwrap();
        let weak = engine.create_reference(rt, ReferenceType::Object).unwrap();
        engine.set_weak(rt, weak).unwrap();

        assert_eq!(engine.collect_garbage(rt), 1);
        assert!(engine.contains_handle(rt, strong));
        assert!(!engine.contains_handle(rt, weak));
    }

    #[test]
    fn test_fail_next_is_consumed() {
        let engine = RecordingEngine::new();
        let rt = runtime(&engine);
        engine.fail_next(NativeOp::CreateReference, NativeError::exception("boom"));

        assert!(engine.create_reference(rt, ReferenceType::Map).is_err());
        assert!(engine.create_reference(rt, ReferenceType::Map).is_ok());
        assert_eq!(engine.count(NativeOp::CreateReference), 2);
    }

    #[test]
    fn test_default_script_handler_literals() {
        let engine = RecordingEngine::new();
        let rt = runtime(&engine);

        assert_eq!(engine.execute(rt, "42").unwrap(), NativeValue::Integer(42));
        assert_eq!(
            engine.execute(rt, "'hi'").unwrap(),
            NativeValue::String("hi".to_string())
        );
        assert!(matches!(
            engine.execute(rt, "[]").unwrap(),
            NativeValue::Reference {
                kind: ReferenceType::Array,
                ..
            }
        ));
        assert!(matches!(
            engine.execute(rt, "while (true) {}"),
            Err(NativeError::Exception { .. })
        ));
    }

    #[test]
    fn test_terminate_is_noop_when_idle() {
        let engine = RecordingEngine::new();
        let rt = runtime(&engine);

        engine.terminate_execution(rt);
        assert_eq!(engine.count(NativeOp::TerminateExecution), 1);
        assert_eq!(engine.execute(rt, "1").unwrap(), NativeValue::Integer(1));
    }
}
