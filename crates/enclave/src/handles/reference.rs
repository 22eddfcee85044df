use std::{
    any::Any,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use crate::{
    class::{Capability, ClassHandle},
    error::{Error, Result},
    isolate::{IsolateHolder, Scope},
    transfer::Transferable,
    value::{IsolateId, Primitive, TypeOf, Value},
};

use super::ExternalCopy;

/// Reference to a value that stays in its owning isolate.
///
/// Operations from other isolates or threads are marshaled to the owner.
/// Only the owner can [`ReferenceHandle::deref`] it.
#[derive(Clone, Debug)]
pub struct ReferenceHandle {
    holder: IsolateHolder,
    value: Value,
    type_of: TypeOf,
    released: Arc<AtomicBool>,
}

impl ReferenceHandle {
    /// Reference `value` in the scope's isolate.
    ///
    /// # Errors
    /// Returns an ownership error if `value` is not from this isolate.
    pub fn new(scope: &Scope<'_>, value: Value) -> Result<Self> {
        let type_of = scope.type_of(&value)?;
        Ok(Self::from_parts(scope.holder()?, value, type_of))
    }

    pub(crate) fn from_parts(holder: IsolateHolder, value: Value, type_of: TypeOf) -> Self {
        Self {
            holder,
            value,
            type_of,
            released: Arc::new(AtomicBool::new(false)),
        }
    }

    #[must_use]
    pub fn isolate_id(&self) -> IsolateId {
        self.holder.id()
    }

    #[must_use]
    pub const fn type_of(&self) -> TypeOf {
        self.type_of
    }

    fn value(&self) -> Result<Value> {
        if self.released.load(Ordering::Acquire) {
            return Err(Error::TypeError("reference has been released".to_string()));
        }
        Ok(self.value.clone())
    }

    /// The referenced value. Only valid in the owning isolate.
    ///
    /// # Errors
    /// Returns [`Error::WrongIsolate`] from any other isolate.
    pub fn deref(&self, scope: &Scope<'_>) -> Result<Value> {
        if scope.isolate_id() != self.isolate_id() {
            return Err(Error::WrongIsolate);
        }
        self.value()
    }

    /// Structural copy of the referenced value.
    ///
    /// # Errors
    /// Returns [`Error::DataClone`] if the value cannot be cloned.
    pub fn copy(&self) -> Result<ExternalCopy> {
        let value = self.value()?;
        self.holder
            .strong()?
            .run_sync(move |scope| scope.copy_out(&value))
    }

    /// Async form of [`ReferenceHandle::copy`].
    ///
    /// # Errors
    /// Same as [`ReferenceHandle::copy`].
    pub async fn copy_async(&self) -> Result<ExternalCopy> {
        let value = self.value()?;
        let env = self.holder.strong()?;
        env.run_async(move |scope| scope.copy_out(&value)).await
    }

    /// Read a property. Primitives come back as-is, anything else as a
    /// reference owned by the same isolate.
    ///
    /// # Errors
    /// Returns [`Error::TypeError`] if the referenced value is `undefined`
    /// or `null`.
    pub fn get(&self, key: &str) -> Result<Transferable> {
        let value = self.value()?;
        let key = key.to_string();
        self.holder.strong()?.run_sync(move |scope| {
            let property = scope.get(&value, &key)?;
            match Primitive::from_value(&property) {
                Some(primitive) => Ok(Transferable::Primitive(primitive)),
                None => Ok(Transferable::Reference(Self::new(scope, property)?)),
            }
        })
    }

    /// Write a property, transferring `value` into the owning isolate.
    ///
    /// # Errors
    /// Returns [`Error::TypeError`] if the referenced value is not an
    /// object.
    pub fn set(&self, key: &str, value: Transferable) -> Result<()> {
        let target = self.value()?;
        let object = *target
            .as_object()
            .ok_or_else(|| Error::TypeError("reference is not an object".to_string()))?;
        let key = key.to_string();
        self.holder.strong()?.run_sync(move |scope| {
            let value = value.transfer_in(scope)?;
            scope.set(&object, &key, value)
        })
    }

    /// Drop this reference's claim on the value. Idempotent.
    pub fn release(&self) {
        self.released.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }
}

impl ClassHandle for ReferenceHandle {
    fn capability(&self) -> Capability {
        Capability::Reference
    }

    fn transfer_out(&self) -> Result<Transferable> {
        self.value()?;
        let mut handle = self.clone();
        handle.unanchor();
        Ok(Transferable::Reference(handle))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn anchor(&mut self, isolate: IsolateId) {
        self.holder = self.holder.anchored(isolate);
    }

    fn unanchor(&mut self) {
        self.holder = self.holder.rooted();
    }
}
