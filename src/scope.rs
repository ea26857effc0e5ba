//! Scoped batch acquisition of foreign values.
//!
//! A [`Scope`] collects every value created during one unit of work and
//! closes all of them when it goes out of scope, on the normal path, on `?`
//! and during unwinding alike. Marking the scope escaping hands ownership of
//! everything in it to the caller instead.
//!
//! ```ignore
//! fn build(runtime: &Runtime) -> Result<ValueRef> {
//!     let mut scope = runtime.scope();
//!     let array = scope.create_array()?;
//!     let tmp = scope.create_object()?; // released when `scope` drops
//!     array.invoke("push", &[Value::from(&tmp)])?;
//!     scope.mark_escaping();
//!     Ok(array)
//! }
//! ```

use std::sync::Arc;

use crate::callback::CallbackContext;
use crate::error::{Error, Result};
use crate::runtime::Runtime;
use crate::values::{Value, ValueRef};

/// Outcome of [`Scope::close`].
#[derive(Debug, Default)]
pub struct ScopeReport {
    /// Values this close released.
    pub closed: usize,
    /// Close failures; a failure never stops the rest of the batch.
    pub failures: Vec<Error>,
}

impl ScopeReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

pub struct Scope<'rt> {
    runtime: &'rt Runtime,
    values: Vec<ValueRef>,
    escaping: bool,
    closed: bool,
}

impl<'rt> Scope<'rt> {
    pub(crate) fn new(runtime: &'rt Runtime) -> Self {
        Self {
            runtime,
            values: Vec::new(),
            escaping: false,
            closed: false,
        }
    }

    pub fn runtime(&self) -> &'rt Runtime {
        self.runtime
    }

    /// Track `value` and hand it back.
    pub fn add(&mut self, value: ValueRef) -> ValueRef {
        debug_assert!(!self.closed, "value added to a closed scope");
        debug_assert!(
            value.belongs_to(self.runtime),
            "value added to a scope of another runtime"
        );
        self.values.push(value.clone());
        value
    }

    /// Track `value` if it is a reference. Primitives pass through.
    pub fn add_value(&mut self, value: Value) -> Value {
        if let Value::Reference(reference) = &value {
            self.add(reference.clone());
        }
        value
    }

    /// Transfer every tracked value to the caller: `close` releases nothing.
    pub fn mark_escaping(&mut self) {
        self.escaping = true;
    }

    pub fn is_escaping(&self) -> bool {
        self.escaping
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Close every tracked value unless the scope escapes. Idempotent.
    ///
    /// Values that are already closed are skipped, not reported.
    pub fn close(&mut self) -> ScopeReport {
        let mut report = ScopeReport::default();
        if self.closed {
            return report;
        }
        self.closed = true;

        let values = std::mem::take(&mut self.values);
        if self.escaping {
            values.into_iter().for_each(ValueRef::relinquish);
            return report;
        }

        for value in values {
            if value.is_closed() {
                continue;
            }
            match value.close() {
                Ok(()) => report.closed += 1,
                Err(Error::ReferenceClosed) => {}
                Err(e) => report.failures.push(e),
            }
        }

        tracing::trace!(
            closed = report.closed,
            failures = report.failures.len(),
            "scope closed"
        );
        report
    }

    pub fn create_array(&mut self) -> Result<ValueRef> {
        let value = self.runtime.create_array()?;
        Ok(self.add(value))
    }

    pub fn create_object(&mut self) -> Result<ValueRef> {
        let value = self.runtime.create_object()?;
        Ok(self.add(value))
    }

    pub fn create_map(&mut self) -> Result<ValueRef> {
        let value = self.runtime.create_map()?;
        Ok(self.add(value))
    }

    pub fn create_set(&mut self) -> Result<ValueRef> {
        let value = self.runtime.create_set()?;
        Ok(self.add(value))
    }

    pub fn create_promise(&mut self) -> Result<ValueRef> {
        let value = self.runtime.create_promise()?;
        Ok(self.add(value))
    }

    pub fn create_function(&mut self, context: Arc<CallbackContext>) -> Result<ValueRef> {
        let value = self.runtime.create_function(context)?;
        Ok(self.add(value))
    }

    pub fn compile_module(&mut self, resource_name: &str, source: &str) -> Result<ValueRef> {
        let value = self.runtime.compile_module(resource_name, source)?;
        Ok(self.add(value))
    }

    pub fn execute(&mut self, source: &str) -> Result<Value> {
        let value = self.runtime.execute(source)?;
        Ok(self.add_value(value))
    }
}

impl Drop for Scope<'_> {
    fn drop(&mut self) {
        let report = self.close();
        for failure in &report.failures {
            tracing::warn!(error = %failure, "failed to release scoped value");
        }
    }
}

impl std::fmt::Debug for Scope<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scope")
            .field("values", &self.values.len())
            .field("escaping", &self.escaping)
            .field("closed", &self.closed)
            .finish()
    }
}
