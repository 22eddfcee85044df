//! Moving values between isolates.
//!
//! A value leaves its isolate as a [`Transferable`] and enters another one
//! through [`Transferable::transfer_in`]. Packages never hold an
//! [`crate::ObjectRef`] into the source heap: primitives are copied,
//! plain data travels as an encoded [`ExternalCopy`], and native objects
//! travel as their shareable handles.

use std::fmt;

use tracing::trace;

use crate::{
    class::Capability,
    error::{Error, Result},
    handles::{
        ContextHandle, ExternalCopy, ExternalCopyHandle, IsolateHandle, NativeModuleHandle,
        ReferenceHandle, ScriptHandle, library,
    },
    heap::{Heap, HeapObject},
    isolate::Scope,
    value::{Primitive, Value},
};

pub enum Transferable {
    Primitive(Primitive),
    /// Structural copy that transfers in as a plain value.
    Data(ExternalCopy),
    /// Transfers in as an `ExternalCopy` instance.
    ExternalCopy(ExternalCopy),
    Isolate(IsolateHandle),
    Context(ContextHandle),
    Reference(ReferenceHandle),
    Script(ScriptHandle),
    NativeModule(NativeModuleHandle),
    /// Re-installs the whole capability surface in the destination.
    Library,
}

impl Transferable {
    /// Reconstruct the package as a value owned by `scope`'s isolate.
    ///
    /// # Errors
    /// Returns [`Error::ResourceExhausted`] if the destination heap cannot
    /// hold the value. The destination is left unchanged on failure.
    pub fn transfer_in(self, scope: &mut Scope<'_>) -> Result<Value> {
        trace!(isolate = %scope.isolate_id(), kind = %self, "transfer in");
        match self {
            Self::Primitive(primitive) => Ok(primitive.into_value()),
            Self::Data(copy) => copy.copy_into(scope),
            Self::ExternalCopy(copy) => scope
                .new_native(ExternalCopyHandle::new(copy))
                .map(Value::Object),
            Self::Isolate(handle) => scope.new_native(handle).map(Value::Object),
            Self::Context(handle) => scope.new_native(handle).map(Value::Object),
            Self::Reference(handle) => scope.new_native(handle).map(Value::Object),
            Self::Script(handle) => scope.new_native(handle).map(Value::Object),
            Self::NativeModule(handle) => scope.new_native(handle).map(Value::Object),
            Self::Library => library::instantiate(scope),
        }
    }

    #[must_use]
    pub const fn capability(&self) -> Option<Capability> {
        Some(match self {
            Self::Primitive(_) | Self::Data(_) => return None,
            Self::ExternalCopy(_) => Capability::ExternalCopy,
            Self::Isolate(_) => Capability::Isolate,
            Self::Context(_) => Capability::Context,
            Self::Reference(_) => Capability::Reference,
            Self::Script(_) => Capability::Script,
            Self::NativeModule(_) => Capability::NativeModule,
            Self::Library => Capability::Library,
        })
    }

    /// The primitive carried by this package, if any.
    #[must_use]
    pub const fn as_primitive(&self) -> Option<&Primitive> {
        match self {
            Self::Primitive(primitive) => Some(primitive),
            _ => None,
        }
    }
}

impl From<Primitive> for Transferable {
    fn from(value: Primitive) -> Self {
        Self::Primitive(value)
    }
}

impl fmt::Display for Transferable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self, self.capability()) {
            (Self::Primitive(_), _) => f.write_str("primitive"),
            (Self::Data(_), _) => f.write_str("data"),
            (_, Some(capability)) => f.write_str(capability.class_name()),
            (_, None) => f.write_str("unknown"),
        }
    }
}

/// Package `value` for another isolate.
///
/// Only primitives and instances of native classes have a transfer
/// contract. Nothing in `heap` is modified.
pub(crate) fn transfer_out(heap: &Heap, value: &Value) -> Result<Transferable> {
    let Value::Object(object) = value else {
        return Primitive::from_value(value)
            .map(Transferable::Primitive)
            .ok_or_else(|| Error::NotTransferable("unknown primitive".to_string()));
    };
    match heap.get(object)? {
        HeapObject::Native(native) => native.handle().transfer_out(),
        other => Err(Error::NotTransferable(format!(
            "{} has no transfer contract",
            other.kind()
        ))),
    }
}
