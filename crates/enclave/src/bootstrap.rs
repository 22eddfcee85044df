use tracing::info;

use crate::{
    config::IsolateOptions,
    embedding::Embedding,
    error::{Result, fatal},
    global,
    handles::library::{self, LIBRARY_GLOBAL},
    isolate::{IsolateEnvironment, IsolateHolder},
    registry::ProcessRegistry,
    value::NativeContextId,
};

/// Set up the default isolate for the hosting runtime's context `native_id`.
///
/// The isolate is registered in [`ProcessRegistry::global`] and gets the
/// library object installed as `enclave` on its global. When the hosting
/// runtime reports the context finished, the isolate is released, joined
/// and unregistered.
///
/// # Errors
/// Returns [`crate::Error::ResourceExhausted`] if the isolate cannot be
/// created.
///
/// # Panics
/// If the hosting runtime provides no platform, or `native_id` is already
/// registered.
pub fn init(embedding: &Embedding, native_id: NativeContextId) -> Result<IsolateHolder> {
    if embedding.host().platform().is_none() {
        fatal("hosting runtime provides no platform");
    }

    let options = IsolateOptions::default();
    let holder = IsolateEnvironment::spawn(embedding, &options, Some(native_id))?;
    let registry = ProcessRegistry::global();
    registry.register(native_id, holder.clone());

    let installed = holder.strong().and_then(|env| {
        env.run_sync(|scope| {
            let library = library::instantiate(scope)?;
            let global = scope.global();
            scope.set(&global, LIBRARY_GLOBAL, library)
        })
    });
    if let Err(e) = installed {
        registry.finish(native_id);
        return Err(e);
    }

    embedding.host().add_context_finished_callback(
        native_id,
        Box::new(|id| {
            ProcessRegistry::global().finish(id);
        }),
    );
    global::ensure_global_init(embedding);
    if let Some(delegate) = global::platform_delegate() {
        delegate.register_isolate(holder.id(), holder.weak());
    }

    info!(native_id = %native_id, isolate = %holder.id(), "enclave initialized");
    Ok(holder)
}
