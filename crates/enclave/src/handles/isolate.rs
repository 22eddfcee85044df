use std::{any::Any, sync::Arc};

use crate::{
    class::{Capability, ClassHandle},
    engine::ScriptOrigin,
    error::Result,
    heap::HeapStatistics,
    isolate::{IsolateEnvironment, IsolateHolder},
    transfer::Transferable,
    value::IsolateId,
};

use super::{ContextHandle, ScriptHandle};

/// Handle to an isolate, usable from any thread and from other isolates.
#[derive(Clone, Debug)]
pub struct IsolateHandle {
    holder: IsolateHolder,
}

impl IsolateHandle {
    pub(crate) const fn new(holder: IsolateHolder) -> Self {
        Self { holder }
    }

    #[must_use]
    pub const fn holder(&self) -> &IsolateHolder {
        &self.holder
    }

    #[must_use]
    pub fn id(&self) -> IsolateId {
        self.holder.id()
    }

    /// # Errors
    /// Returns [`crate::Error::Disposed`] once the isolate is released.
    pub fn environment(&self) -> Result<Arc<IsolateEnvironment>> {
        self.holder.strong()
    }

    /// Create a context with its own global object.
    ///
    /// # Errors
    /// Returns [`crate::Error::ResourceExhausted`] if the context does not
    /// fit in the isolate's heap.
    pub fn create_context(&self) -> Result<ContextHandle> {
        let holder = self.holder.rooted();
        self.holder.strong()?.run_sync(move |scope| {
            let global = scope.create_context()?;
            Ok(ContextHandle::new(holder, global))
        })
    }

    /// Async form of [`IsolateHandle::create_context`].
    ///
    /// # Errors
    /// Same as [`IsolateHandle::create_context`].
    pub async fn create_context_async(&self) -> Result<ContextHandle> {
        let holder = self.holder.rooted();
        let env = self.holder.strong()?;
        env.run_async(move |scope| {
            let global = scope.create_context()?;
            Ok(ContextHandle::new(holder, global))
        })
        .await
    }

    /// # Errors
    /// Returns [`crate::Error::Script`] if the source does not compile.
    pub fn compile_script(&self, source: &str, origin: ScriptOrigin) -> Result<ScriptHandle> {
        let holder = self.holder.rooted();
        let source = source.to_string();
        self.holder.strong()?.run_sync(move |scope| {
            let program = scope.embedding().engine().compile(&source, &origin)?;
            Ok(ScriptHandle::new(holder, program, origin))
        })
    }

    /// # Errors
    /// Returns [`crate::Error::Disposed`] once the isolate is released.
    pub fn heap_statistics(&self) -> Result<HeapStatistics> {
        self.holder
            .strong()?
            .run_sync(|scope| Ok(scope.heap().statistics()))
    }

    /// Release the isolate and wait for its thread. Idempotent.
    pub fn dispose(&self) {
        self.holder.release_and_join();
    }

    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.holder.is_disposed()
    }
}

impl ClassHandle for IsolateHandle {
    fn capability(&self) -> Capability {
        Capability::Isolate
    }

    fn transfer_out(&self) -> Result<Transferable> {
        let mut handle = self.clone();
        handle.unanchor();
        Ok(Transferable::Isolate(handle))
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
