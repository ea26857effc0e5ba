mod common;

use std::panic::{AssertUnwindSafe, catch_unwind};

use common::TestHost;
use jsbridge_runtime::engine::recording::NativeOp;
use jsbridge_runtime::{Runtime, Value, ValueRef};

#[test]
fn test_scope_closes_on_normal_exit() {
    let t = TestHost::new();
    let runtime = t.runtime();

    let (array, object) = {
        let mut scope = runtime.scope();
        let array = scope.create_array().unwrap();
        let object = scope.create_object().unwrap();
        assert_eq!(scope.len(), 2);
        (array, object)
    };

    assert!(array.is_closed());
    assert!(object.is_closed());
    assert_eq!(runtime.reference_count(), 0);
    t.close_clean(&runtime);
}

fn build_then_fail(runtime: &Runtime, created: &mut Vec<ValueRef>) -> jsbridge_runtime::Result<()> {
    let mut scope = runtime.scope();
    created.push(scope.create_array()?);
    created.push(scope.create_map()?);
    scope.execute("this is not a literal")?;
    Ok(())
}

#[test]
fn test_scope_closes_on_error_path() {
    let t = TestHost::new();
    let runtime = t.runtime();

    let mut created = Vec::new();
    let err = build_then_fail(&runtime, &mut created).unwrap_err();

    assert_eq!(err.operation(), Some("execute"));
    assert_eq!(created.len(), 2);
    assert!(created.iter().all(ValueRef::is_closed));
    assert_eq!(runtime.reference_count(), 0);
    t.close_clean(&runtime);
}

#[test]
fn test_scope_closes_on_panic() {
    let t = TestHost::new();
    let runtime = t.runtime();

    let mut created = Vec::new();
    let mut handles = Vec::new();
    let result = catch_unwind(AssertUnwindSafe(|| {
        let mut scope = runtime.scope();
        for value in [scope.create_object().unwrap(), scope.create_promise().unwrap()] {
            handles.push(value.handle());
            created.push(value);
        }
        panic!("callback blew up");
    }));

    assert!(result.is_err());
    assert!(created.iter().all(ValueRef::is_closed));
    for handle in handles {
        assert_eq!(t.engine.release_count(handle), 1);
    }
    assert_eq!(runtime.reference_count(), 0);
    t.close_clean(&runtime);
}

#[test]
fn test_escaping_scope_hands_values_to_caller() {
    let t = TestHost::new();
    let runtime = t.runtime();

    let (array, scratch_handle) = {
        let mut scope = runtime.scope();
        let array = scope.create_array().unwrap();
        let scratch = scope.create_object().unwrap();
        array.invoke("push", &[Value::from(&scratch)]).unwrap();
        scope.mark_escaping();
        (array, scratch.handle())
    };

    assert!(!array.is_closed());
    assert_eq!(runtime.reference_count(), 2);
    assert_eq!(t.engine.count(NativeOp::ReleaseReference), 0);
    assert_eq!(t.engine.release_count(scratch_handle), 0);
    assert_eq!(array.get_property("length").unwrap().as_i32(), Some(1));

    array.close().unwrap();
    t.close_clean(&runtime);
    assert_eq!(t.engine.release_count(scratch_handle), 1);
}

#[test]
fn test_escaping_scope_as_last_owner_releases_nothing() {
    let t = TestHost::new();
    let runtime = t.runtime();

    let mut scope = runtime.scope();
    let handle = scope.create_object().unwrap().handle();
    scope.mark_escaping();
    drop(scope);

    assert_eq!(t.engine.count(NativeOp::ReleaseReference), 0);
    assert_eq!(runtime.reference_count(), 1);

    // Teardown picks up what nobody holds anymore.
    t.close_clean(&runtime);
    assert_eq!(t.engine.release_count(handle), 1);
}

#[test]
fn test_close_report_skips_already_closed() {
    let t = TestHost::new();
    let runtime = t.runtime();

    let mut scope = runtime.scope();
    let _array = scope.create_array().unwrap();
    let object = scope.create_object().unwrap();
    object.close().unwrap();

    let report = scope.close();
    assert_eq!(report.closed, 1);
    assert!(report.is_clean());
    assert!(scope.is_closed());

    // Idempotent
    assert_eq!(scope.close().closed, 0);
    drop(scope);

    t.close_clean(&runtime);
}

#[test]
fn test_weak_values_survive_scope() {
    let t = TestHost::new();
    let runtime = t.runtime();

    let weak = {
        let mut scope = runtime.scope();
        let object = scope.create_object().unwrap();
        object.set_weak().unwrap();
        object
    };

    // Close on a weak value is left to the foreign collector.
    assert!(!weak.is_closed());
    assert_eq!(t.engine.release_count(weak.handle()), 0);
    assert_eq!(t.engine.collect_garbage(runtime.handle()), 1);
    assert!(weak.is_closed());

    t.close_clean(&runtime);
}

#[test]
fn test_primitives_pass_through() {
    let t = TestHost::new();
    let runtime = t.runtime();

    let mut scope = runtime.scope();
    assert_eq!(scope.execute("42").unwrap().as_i32(), Some(42));
    assert_eq!(
        scope.execute("'hello'").unwrap().as_str(),
        Some("hello")
    );
    assert!(scope.is_empty());

    let object = scope.execute("{}").unwrap();
    assert!(object.as_reference().is_some());
    assert_eq!(scope.len(), 1);
    drop(scope);

    assert!(object.as_reference().unwrap().is_closed());
    t.close_clean(&runtime);
}

fn build_numbers(runtime: &Runtime) -> jsbridge_runtime::Result<ValueRef> {
    let mut scope = runtime.scope();
    let array = scope.create_array()?;
    for i in 1..=3 {
        array.invoke("push", &[Value::from(i)])?;
    }
    scope.mark_escaping();
    assert_eq!(scope.close().closed, 0);
    Ok(array)
}

#[test]
fn test_leak_free_happy_path() {
    let t = TestHost::new();
    let runtime = t.runtime();

    let array = build_numbers(&runtime).unwrap();
    assert_eq!(runtime.reference_count(), 1);
    assert_eq!(array.get_property("length").unwrap().as_i32(), Some(3));
    assert_eq!(array.get_property("2").unwrap().as_i32(), Some(3));

    array.close().unwrap();
    assert_eq!(runtime.reference_count(), 0);
    t.close_clean(&runtime);
}
