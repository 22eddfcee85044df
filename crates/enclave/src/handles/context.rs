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
    isolate::IsolateHolder,
    transfer::Transferable,
    value::{IsolateId, ObjectRef, TypeOf, Value},
};

use super::ReferenceHandle;

/// A context inside an isolate: a global object scripts run against.
#[derive(Clone, Debug)]
pub struct ContextHandle {
    holder: IsolateHolder,
    global: ObjectRef,
    released: Arc<AtomicBool>,
}

impl ContextHandle {
    pub(crate) fn new(holder: IsolateHolder, global: ObjectRef) -> Self {
        Self {
            holder,
            global,
            released: Arc::new(AtomicBool::new(false)),
        }
    }

    #[must_use]
    pub fn isolate_id(&self) -> IsolateId {
        self.holder.id()
    }

    #[must_use]
    pub const fn holder(&self) -> &IsolateHolder {
        &self.holder
    }

    pub(crate) fn global_object(&self) -> Result<ObjectRef> {
        if self.released.load(Ordering::Acquire) {
            return Err(Error::TypeError("context has been released".to_string()));
        }
        Ok(self.global)
    }

    /// Reference to this context's global object.
    ///
    /// # Errors
    /// Returns [`Error::TypeError`] if the context was released.
    pub fn global(&self) -> Result<ReferenceHandle> {
        Ok(ReferenceHandle::from_parts(
            self.holder.rooted(),
            Value::Object(self.global_object()?),
            TypeOf::Object,
        ))
    }

    /// Free the context's global object. Later calls are no-ops, as is
    /// releasing a context whose isolate is gone.
    ///
    /// # Errors
    /// Returns [`Error::Reentrant`] when called from the owning isolate's
    /// thread.
    pub fn release(&self) -> Result<()> {
        if self.released.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let Ok(env) = self.holder.strong() else {
            return Ok(());
        };
        let global = self.global;
        match env.run_sync(move |scope| scope.release_context(&global)) {
            Err(Error::Disposed) => Ok(()),
            Err(e) => {
                self.released.store(false, Ordering::Release);
                Err(e)
            }
            Ok(()) => Ok(()),
        }
    }

    #[must_use]
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }
}

impl ClassHandle for ContextHandle {
    fn capability(&self) -> Capability {
        Capability::Context
    }

    fn transfer_out(&self) -> Result<Transferable> {
        let mut handle = self.clone();
        handle.unanchor();
        Ok(Transferable::Context(handle))
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
