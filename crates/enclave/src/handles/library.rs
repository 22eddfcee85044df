use std::{
    any::Any,
    sync::LazyLock,
    time::{Duration, Instant},
};

use tracing::debug;

use crate::{
    class::{Capability, ClassHandle},
    error::{Error, Result},
    isolate::Scope,
    transfer::Transferable,
    value::{ObjectRef, Value},
};

/// Global name the library is installed under in a default isolate.
pub const LIBRARY_GLOBAL: &str = "enclave";

/// The bootstrap object. Its properties are the isolate's constructors.
#[derive(Clone, Copy, Debug, Default)]
pub struct LibraryHandle;

impl ClassHandle for LibraryHandle {
    fn capability(&self) -> Capability {
        Capability::Library
    }

    fn transfer_out(&self) -> Result<Transferable> {
        Ok(Transferable::Library)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

static EPOCH: LazyLock<Instant> = LazyLock::new(Instant::now);

/// Utilities reachable as `lib` on a library object. Stays in its isolate.
#[derive(Clone, Copy, Debug, Default)]
pub struct LibHandle;

impl LibHandle {
    /// Monotonic `[seconds, nanoseconds]`, relative to `previous` when
    /// given.
    #[must_use]
    pub fn hrtime(&self, previous: Option<[u64; 2]>) -> [u64; 2] {
        let now = EPOCH.elapsed();
        let elapsed = previous.map_or(now, |[secs, nanos]| {
            #[allow(clippy::cast_possible_truncation)]
            let nanos = nanos as u32;
            now.saturating_sub(Duration::new(secs, nanos))
        });
        [elapsed.as_secs(), u64::from(elapsed.subsec_nanos())]
    }
}

impl ClassHandle for LibHandle {
    fn capability(&self) -> Capability {
        Capability::Lib
    }

    fn transfer_out(&self) -> Result<Transferable> {
        Err(Error::NotTransferable("lib object".to_string()))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Build a library object exposing every constructor of `scope`'s isolate.
pub(crate) fn instantiate(scope: &mut Scope<'_>) -> Result<Value> {
    let library = scope.new_native(LibraryHandle)?;
    let installed = Capability::SURFACE
        .iter()
        .try_for_each(|&capability| {
            let template = scope.class_template(capability)?;
            scope.set(
                &library,
                capability.class_name(),
                Value::Object(template.constructor()),
            )
        })
        .and_then(|()| install_lib(scope, &library));
    if let Err(e) = installed {
        let _ = scope.heap_mut().free(&library);
        return Err(e);
    }
    debug!(isolate = %scope.isolate_id(), "library installed");
    Ok(Value::Object(library))
}

fn install_lib(scope: &mut Scope<'_>, library: &ObjectRef) -> Result<()> {
    let lib = scope.new_native(LibHandle)?;
    if let Err(e) = scope.set(library, "lib", Value::Object(lib)) {
        let _ = scope.heap_mut().free(&lib);
        return Err(e);
    }
    Ok(())
}
