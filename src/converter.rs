//! Pluggable conversion between boundary values and managed values.

use crate::engine::NativeValue;
use crate::error::{Error, Result};
use crate::runtime::Runtime;
use crate::values::Value;

/// Maps values crossing the boundary to and from their managed form.
///
/// `to_value` receives ownership of any handle inside `value` and must either
/// wrap it (see [`Runtime::wrap_reference`]) or release it.
pub trait ValueConverter: Send + Sync {
    fn to_value(&self, runtime: &Runtime, value: NativeValue) -> Result<Value>;

    /// Borrowing conversion: a reference keeps its existing handle.
    fn to_native(&self, runtime: &Runtime, value: &Value) -> Result<NativeValue>;
}

/// Primitives map one to one; references become table-backed wrappers.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultConverter;

impl ValueConverter for DefaultConverter {
    fn to_value(&self, runtime: &Runtime, value: NativeValue) -> Result<Value> {
        Ok(match value {
            NativeValue::Undefined => Value::Undefined,
            NativeValue::Null => Value::Null,
            NativeValue::Boolean(b) => Value::Boolean(b),
            NativeValue::Integer(i) => Value::Integer(i),
            NativeValue::Long(l) => Value::Long(l),
            NativeValue::Double(d) => Value::Double(d),
            NativeValue::String(s) => Value::String(s),
            NativeValue::Reference { handle, kind } => {
                Value::Reference(runtime.wrap_reference(handle, kind)?)
            }
        })
    }

    fn to_native(&self, runtime: &Runtime, value: &Value) -> Result<NativeValue> {
        Ok(match value {
            Value::Undefined => NativeValue::Undefined,
            Value::Null => NativeValue::Null,
            Value::Boolean(b) => NativeValue::Boolean(*b),
            Value::Integer(i) => NativeValue::Integer(*i),
            Value::Long(l) => NativeValue::Long(*l),
            Value::Double(d) => NativeValue::Double(*d),
            Value::String(s) => NativeValue::String(s.clone()),
            Value::Reference(reference) => {
                if reference.is_closed() {
                    return Err(Error::ReferenceClosed);
                }
                if !reference.belongs_to(runtime) {
                    return Err(Error::InvalidArgument(format!(
                        "{} handle {} belongs to another runtime",
                        reference.kind(),
                        reference.handle()
                    )));
                }
                NativeValue::Reference {
                    handle: reference.handle(),
                    kind: reference.kind(),
                }
            }
        })
    }
}
