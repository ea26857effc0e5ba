mod common;

use std::sync::Arc;
use std::thread;

use common::TestHost;
use jsbridge_runtime::engine::recording::NativeOp;
use jsbridge_runtime::engine::{INVALID_HANDLE, NativeEngine, NativeError, NativeResult};
use jsbridge_runtime::{Error, Host, HostConfig, RuntimeOptions, RuntimeState, Value};

#[test]
fn test_create_use_close_leaves_nothing_behind() {
    let t = TestHost::new();
    let runtime = t.runtime();
    let native = runtime.handle();
    assert_eq!(runtime.state(), RuntimeState::Active);

    let array = runtime.create_array().unwrap();
    let object = runtime.create_object().unwrap();
    let len = array
        .invoke("push", &[Value::from(&object), Value::from(1)])
        .unwrap();
    assert_eq!(len.as_i32(), Some(2));
    assert_eq!(runtime.reference_count(), 2);

    let (a, o) = (array.handle(), object.handle());
    array.close().unwrap();
    object.close().unwrap();

    assert_eq!(t.engine.release_count(a), 1);
    assert_eq!(t.engine.release_count(o), 1);
    assert_eq!(runtime.reference_count(), 0);
    assert_eq!(t.engine.live_handle_count(native), 0);

    t.close_clean(&runtime);
    assert_eq!(t.engine.runtime_count(), 0);
    assert_eq!(t.host.runtime_count(), 0);
}

#[test]
fn test_double_close_releases_once() {
    let t = TestHost::new();
    let runtime = t.runtime();

    let map = runtime.create_map().unwrap();
    let alias = map.clone();
    let handle = map.handle();

    map.close().unwrap();
    assert!(alias.is_closed());
    assert!(matches!(alias.close(), Err(Error::ReferenceClosed)));
    assert!(matches!(alias.force_close(), Err(Error::ReferenceClosed)));
    assert_eq!(t.engine.release_count(handle), 1);

    t.close_clean(&runtime);
}

#[test]
fn test_dropping_last_clone_releases() {
    let t = TestHost::new();
    let runtime = t.runtime();

    let object = runtime.create_object().unwrap();
    let handle = object.handle();
    let alias = object.clone();

    drop(object);
    assert_eq!(t.engine.release_count(handle), 0);
    assert_eq!(runtime.reference_count(), 1);

    drop(alias);
    assert_eq!(t.engine.release_count(handle), 1);
    assert_eq!(runtime.reference_count(), 0);

    t.close_clean(&runtime);
}

#[test]
fn test_drop_while_locked_elsewhere_is_deferred() {
    let t = TestHost::new();
    let runtime = t.runtime();

    let object = runtime.create_object().unwrap();
    let handle = object.handle();

    let lock = runtime.lock().unwrap();
    thread::spawn(move || drop(object)).join().unwrap();

    assert_eq!(t.engine.release_count(handle), 0);
    assert_eq!(runtime.statistics().pending_release_count, 1);
    assert_eq!(runtime.reference_count(), 0);
    drop(lock);

    // The next acquisition drains the queue.
    drop(runtime.lock().unwrap());
    assert_eq!(t.engine.release_count(handle), 1);
    assert_eq!(runtime.statistics().pending_release_count, 0);

    t.close_clean(&runtime);
}

#[test]
fn test_concurrent_create_and_drop() {
    let t = TestHost::new();
    let runtime = t.runtime();

    let workers: Vec<_> = (0..4)
        .map(|_| {
            let runtime = runtime.clone();
            thread::spawn(move || {
                for _ in 0..100 {
                    let object = runtime.create_object().unwrap();
                    drop(object);
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }
    drop(runtime.lock().unwrap());

    assert_eq!(runtime.reference_count(), 0);
    assert_eq!(t.engine.count(NativeOp::CreateReference), 400);
    assert_eq!(t.engine.count(NativeOp::ReleaseReference), 400);
    assert_eq!(t.engine.live_handle_count(runtime.handle()), 0);

    t.close_clean(&runtime);
}

#[test]
fn test_operations_after_close_fail() {
    let t = TestHost::new();
    let runtime = t.runtime();

    runtime.close(true).unwrap();
    runtime.close(true).unwrap();

    assert_eq!(runtime.handle(), INVALID_HANDLE);
    assert!(matches!(runtime.create_array(), Err(Error::RuntimeClosed)));
    assert!(matches!(runtime.execute("1"), Err(Error::RuntimeClosed)));
    assert!(matches!(runtime.reset_context(), Err(Error::RuntimeClosed)));
    assert_eq!(t.engine.count(NativeOp::CloseRuntime), 1);
}

#[test]
fn test_teardown_releases_outstanding_values() {
    let t = TestHost::new();
    let runtime = t.runtime();

    let array = runtime.create_array().unwrap();
    let object = runtime.create_object().unwrap();
    let (a, o) = (array.handle(), object.handle());

    runtime.close(true).unwrap();

    assert!(array.is_closed());
    assert!(object.is_closed());
    assert_eq!(t.engine.release_count(a), 1);
    assert_eq!(t.engine.release_count(o), 1);
    assert!(matches!(array.close(), Err(Error::ReferenceClosed)));

    drop(array);
    drop(object);
    assert_eq!(t.engine.release_count(a), 1);
    assert_eq!(t.engine.release_count(o), 1);
}

#[test]
fn test_dropping_unclosed_runtime_forces_teardown() {
    let t = TestHost::new();
    let runtime = t.runtime();
    let object = runtime.create_object().unwrap();
    let handle = object.handle();

    drop(runtime);

    assert!(object.is_closed());
    assert!(matches!(object.runtime(), Err(Error::RuntimeClosed)));
    assert_eq!(t.engine.release_count(handle), 1);
    assert_eq!(t.engine.runtime_count(), 0);
    assert_eq!(t.host.runtime_count(), 0);
}

#[test]
fn test_reset_context_keeps_runtime_usable() {
    let t = TestHost::new();
    let runtime = t.runtime();

    let object = runtime.create_object().unwrap();
    let handle = object.handle();

    runtime.reset_context().unwrap();
    assert!(object.is_closed());
    assert_eq!(t.engine.release_count(handle), 1);
    assert_eq!(runtime.state(), RuntimeState::Active);

    let array = runtime.create_array().unwrap();
    array.close().unwrap();

    runtime.reset_isolate().unwrap();
    assert_eq!(t.engine.count(NativeOp::ResetIsolate), 1);
    t.close_clean(&runtime);
}

#[test]
fn test_try_clone_owns_its_own_handle() {
    let t = TestHost::new();
    let runtime = t.runtime();

    let object = runtime.create_object().unwrap();
    object.set_property("answer", 42).unwrap();
    let copy = object.try_clone().unwrap();

    assert_ne!(object.handle(), copy.handle());
    assert!(!object.same_value(&copy));
    assert!(object.same_value(&object.clone()));

    object.close().unwrap();
    assert!(!copy.is_closed());
    assert_eq!(copy.get_property("answer").unwrap().as_i32(), Some(42));

    copy.close().unwrap();
    t.close_clean(&runtime);
}

#[test]
fn test_values_from_another_runtime_are_rejected() {
    let t = TestHost::new();
    let first = t.runtime();
    let second = t.runtime();

    let foreign = first.create_object().unwrap();
    let target = second.create_array().unwrap();

    let err = second
        .invoke(&target, "push", &[Value::from(&foreign)])
        .unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));

    foreign.close().unwrap();
    target.close().unwrap();
    t.close_clean(&first);
    t.close_clean(&second);
}

#[test]
fn test_module_cache() {
    let t = TestHost::new();
    let runtime = t.runtime();

    let first = runtime.compile_module("main.js", "export default 1").unwrap();
    runtime.add_module("main.js", &first).unwrap();
    assert!(runtime.contains_module("main.js"));
    assert!(runtime.get_module("main.js").unwrap().same_value(&first));

    // Replacing closes the previous module.
    let second = runtime.compile_module("main.js", "export default 2").unwrap();
    runtime.add_module("main.js", &second).unwrap();
    assert!(first.is_closed());
    assert_eq!(runtime.module_count(), 1);

    // Closing a cached module evicts it.
    second.close().unwrap();
    assert!(!runtime.contains_module("main.js"));

    let object = runtime.create_object().unwrap();
    assert!(matches!(
        runtime.add_module("object.js", &object),
        Err(Error::InvalidArgument(_))
    ));

    object.close().unwrap();
    t.close_clean(&runtime);
}

#[test]
fn test_replacing_weak_module_releases_it() {
    let t = TestHost::new();
    let runtime = t.runtime();

    let first = runtime.compile_module("main.js", "export default 1").unwrap();
    let first_handle = first.handle();
    first.set_weak().unwrap();
    runtime.add_module("main.js", &first).unwrap();

    let second = runtime.compile_module("main.js", "export default 2").unwrap();
    runtime.add_module("main.js", &second).unwrap();

    assert!(first.is_closed());
    assert_eq!(t.engine.release_count(first_handle), 1);
    assert_eq!(runtime.reference_count(), 1);
    assert!(runtime.get_module("main.js").unwrap().same_value(&second));

    t.close_clean(&runtime);
}

#[test]
fn test_add_module_after_close_fails() {
    let t = TestHost::new();
    let runtime = t.runtime();

    let module = runtime.compile_module("lib.js", "").unwrap();
    runtime.add_module("lib.js", &module).unwrap();
    runtime.close(true).unwrap();

    assert_eq!(runtime.module_count(), 0);
    assert!(module.is_closed());
    assert!(matches!(
        runtime.add_module("lib.js", &module),
        Err(Error::RuntimeClosed)
    ));
}

#[test]
fn test_teardown_wins_against_concurrent_add_module() {
    let t = TestHost::new();
    let runtime = t.runtime();

    let adder = {
        let runtime = runtime.clone();
        thread::spawn(move || {
            let mut compiled = Vec::new();
            for i in 0..500 {
                let name = format!("m{i}.js");
                let module = match runtime.compile_module(&name, "") {
                    Ok(module) => module,
                    Err(Error::RuntimeClosed) => break,
                    Err(e) => panic!("unexpected compile error: {e}"),
                };
                match runtime.add_module(name, &module) {
                    Ok(()) | Err(Error::RuntimeClosed) => {}
                    Err(e) => panic!("unexpected add_module error: {e}"),
                }
                compiled.push(module);
            }
            compiled
        })
    };

    thread::sleep(std::time::Duration::from_millis(1));
    runtime.close(true).unwrap();
    let compiled = adder.join().unwrap();

    assert_eq!(runtime.module_count(), 0);
    assert!(compiled.iter().all(|module| module.is_closed()));
}

#[test]
fn test_library_load_failure_is_resurfaced() {
    let host = Host::new(
        || -> NativeResult<Arc<dyn NativeEngine>> {
            Err(NativeError::LibraryLoad("libjsbridge.so: cannot open shared object".to_string()))
        },
        HostConfig::default(),
    );

    for _ in 0..2 {
        let err = host.create_runtime(RuntimeOptions::default()).unwrap_err();
        assert!(matches!(err, Error::LibraryNotLoaded(_)));
        assert!(err.to_string().contains("libjsbridge.so"));
    }
    assert_eq!(host.runtime_count(), 0);
    assert!(host.close().is_ok());
}

#[test]
fn test_runtime_creation_failure() {
    let t = TestHost::new();
    let options = RuntimeOptions {
        heap_max_mb: 0,
        ..RuntimeOptions::default()
    };

    let err = t.host.create_runtime(options).unwrap_err();
    assert!(matches!(err, Error::RuntimeCreation(_)));
    assert_eq!(t.host.runtime_count(), 0);
}

#[test]
fn test_native_failure_carries_operation() {
    let t = TestHost::new();
    let runtime = t.runtime();

    t.engine
        .fail_next(NativeOp::CreateReference, NativeError::exception("out of memory"));
    let err = runtime.create_set().unwrap_err();
    assert_eq!(err.operation(), Some("create_reference"));
    assert_eq!(runtime.reference_count(), 0);

    let err = runtime.execute("definitely not a literal").unwrap_err();
    assert_eq!(err.operation(), Some("execute"));
    assert!(!err.is_terminated());

    t.close_clean(&runtime);
}

#[test]
fn test_statistics() {
    let t = TestHost::new();
    let runtime = t.runtime();

    let object = runtime.create_object().unwrap();
    let weak = runtime.create_object().unwrap();
    weak.set_weak().unwrap();
    let module = runtime.compile_module("a.js", "").unwrap();
    runtime.add_module("a.js", &module).unwrap();

    let stats = runtime.statistics();
    assert_eq!(stats.reference_count, 3);
    assert_eq!(stats.weak_reference_count, 1);
    assert_eq!(stats.module_count, 1);
    assert_eq!(stats.callback_context_count, 0);

    object.close().unwrap();
    t.close_clean(&runtime);
}

#[test]
fn test_remove_module_keeps_it_open() {
    let t = TestHost::new();
    let runtime = t.runtime();

    let module = runtime.compile_module("util.js", "export const x = 1").unwrap();
    runtime.add_module("util.js", &module).unwrap();

    let removed = runtime.remove_module("util.js").unwrap();
    assert!(removed.same_value(&module));
    assert!(!module.is_closed());
    assert!(runtime.get_module("util.js").is_none());
    assert!(runtime.remove_module("util.js").is_none());

    module.close().unwrap();
    t.close_clean(&runtime);
}

#[derive(Default)]
struct RecordingInspector {
    closed: std::sync::atomic::AtomicUsize,
}

impl jsbridge_runtime::InspectorSession for RecordingInspector {
    fn on_runtime_closed(&self) {
        self.closed
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    }
}

#[test]
fn test_inspector_is_cleared_at_close() {
    let t = TestHost::new();
    let runtime = t.runtime();
    let inspector = Arc::new(RecordingInspector::default());

    runtime.attach_inspector(inspector.clone()).unwrap();
    assert!(runtime.has_inspector());

    runtime.close(true).unwrap();
    runtime.close(true).unwrap();
    assert!(!runtime.has_inspector());
    assert_eq!(inspector.closed.load(std::sync::atomic::Ordering::SeqCst), 1);
}
