use std::{any::Any, fmt, sync::Arc};

use crate::{
    class::{Capability, ClassHandle},
    error::Result,
    isolate::Scope,
    transfer::Transferable,
    value::{ObjectRef, Value},
};

use super::{ContextHandle, ReferenceHandle};

/// Native code that populates an exports object inside a context.
pub trait NativeModule: Send + Sync + 'static {
    /// # Errors
    /// Whatever the module reports; the exports object is discarded.
    fn instantiate(&self, scope: &mut Scope<'_>, exports: &ObjectRef) -> Result<()>;
}

impl<F> NativeModule for F
where
    F: Fn(&mut Scope<'_>, &ObjectRef) -> Result<()> + Send + Sync + 'static,
{
    fn instantiate(&self, scope: &mut Scope<'_>, exports: &ObjectRef) -> Result<()> {
        self(scope, exports)
    }
}

/// A module resolved from the embedding's catalog.
#[derive(Clone)]
pub struct NativeModuleHandle {
    name: Arc<str>,
    module: Arc<dyn NativeModule>,
}

impl NativeModuleHandle {
    pub(crate) fn new(name: &str, module: Arc<dyn NativeModule>) -> Self {
        Self {
            name: name.into(),
            module,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Instantiate the module in `context`; returns its exports.
    ///
    /// # Errors
    /// Returns the module's own failure, or [`crate::Error::Disposed`] if
    /// the context's isolate is gone.
    pub fn create(&self, context: &ContextHandle) -> Result<ReferenceHandle> {
        context.global_object()?;
        let module = Arc::clone(&self.module);
        context.holder().strong()?.run_sync(move |scope| {
            let exports = scope.new_object()?;
            if let Err(e) = module.instantiate(scope, &exports) {
                let _ = scope.heap_mut().free(&exports);
                return Err(e);
            }
            ReferenceHandle::new(scope, Value::Object(exports))
        })
    }
}

impl fmt::Debug for NativeModuleHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeModuleHandle")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl ClassHandle for NativeModuleHandle {
    fn capability(&self) -> Capability {
        Capability::NativeModule
    }

    fn transfer_out(&self) -> Result<Transferable> {
        Ok(Transferable::NativeModule(self.clone()))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
