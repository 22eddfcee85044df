use std::{any::Any, fmt, sync::Arc};

use crate::{
    class::{Capability, ClassHandle},
    engine::{Program, ScriptOrigin},
    error::{Error, Result},
    isolate::{IsolateHolder, Scope},
    transfer::Transferable,
    value::{IsolateId, ObjectRef, Primitive, Value},
};

use super::{ContextHandle, ReferenceHandle};

/// How the completion value of a script leaves its isolate.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ResultMode {
    /// Through the value's own transfer contract. Plain objects fail.
    #[default]
    Transfer,
    /// Structural copy.
    Copy,
    /// A reference that keeps the value in its isolate.
    Reference,
}

/// A script compiled for one isolate.
#[derive(Clone)]
pub struct ScriptHandle {
    holder: IsolateHolder,
    program: Arc<dyn Program>,
    origin: ScriptOrigin,
}

impl ScriptHandle {
    pub(crate) fn new(
        holder: IsolateHolder,
        program: Arc<dyn Program>,
        origin: ScriptOrigin,
    ) -> Self {
        Self {
            holder,
            program,
            origin,
        }
    }

    #[must_use]
    pub fn isolate_id(&self) -> IsolateId {
        self.holder.id()
    }

    #[must_use]
    pub const fn origin(&self) -> &ScriptOrigin {
        &self.origin
    }

    /// Run the script in `context` and return its completion value.
    ///
    /// # Errors
    /// Returns [`Error::WrongIsolate`] if `context` belongs to another
    /// isolate, or whatever the script or the result conversion raised.
    pub fn run(&self, context: &ContextHandle, mode: ResultMode) -> Result<Transferable> {
        let global = self.target(context)?;
        let program = Arc::clone(&self.program);
        self.holder.strong()?.run_sync(move |scope| {
            let value = program.run(scope, &global)?;
            complete(scope, value, mode)
        })
    }

    /// Async form of [`ScriptHandle::run`].
    ///
    /// # Errors
    /// Same as [`ScriptHandle::run`].
    pub async fn run_async(
        &self,
        context: &ContextHandle,
        mode: ResultMode,
    ) -> Result<Transferable> {
        let global = self.target(context)?;
        let program = Arc::clone(&self.program);
        let env = self.holder.strong()?;
        env.run_async(move |scope| {
            let value = program.run(scope, &global)?;
            complete(scope, value, mode)
        })
        .await
    }

    fn target(&self, context: &ContextHandle) -> Result<ObjectRef> {
        if context.isolate_id() != self.isolate_id() {
            return Err(Error::WrongIsolate);
        }
        context.global_object()
    }
}

fn complete(scope: &mut Scope<'_>, value: Value, mode: ResultMode) -> Result<Transferable> {
    if let Some(primitive) = Primitive::from_value(&value) {
        return Ok(Transferable::Primitive(primitive));
    }
    match mode {
        ResultMode::Transfer => scope.transfer_out(&value),
        ResultMode::Copy => scope.copy_out(&value).map(Transferable::Data),
        ResultMode::Reference => ReferenceHandle::new(scope, value).map(Transferable::Reference),
    }
}

impl fmt::Debug for ScriptHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptHandle")
            .field("isolate", &self.holder.id())
            .field("origin", &self.origin)
            .finish_non_exhaustive()
    }
}

impl ClassHandle for ScriptHandle {
    fn capability(&self) -> Capability {
        Capability::Script
    }

    fn transfer_out(&self) -> Result<Transferable> {
        let mut handle = self.clone();
        handle.unanchor();
        Ok(Transferable::Script(handle))
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
