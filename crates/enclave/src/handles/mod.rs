//! Native classes exposed to script code.

mod context;
mod external_copy;
mod isolate;
pub(crate) mod library;
mod native_module;
mod reference;
mod script;

pub use self::{
    context::ContextHandle,
    external_copy::{ExternalCopy, ExternalCopyHandle},
    isolate::IsolateHandle,
    library::{LIBRARY_GLOBAL, LibHandle, LibraryHandle},
    native_module::{NativeModule, NativeModuleHandle},
    reference::ReferenceHandle,
    script::{ResultMode, ScriptHandle},
};
use crate::{
    class::Capability,
    config::IsolateOptions,
    error::{Error, Result},
    isolate::Scope,
    value::Value,
};

/// `new <capability>(...args)` from script code.
pub(crate) fn construct(
    capability: Capability,
    scope: &mut Scope<'_>,
    args: &[Value],
) -> Result<Value> {
    let first = args.first().cloned().unwrap_or_default();
    let instance = match capability {
        Capability::Isolate => {
            let options = isolate_options(scope, &first)?;
            let handle = scope.embedding().create_isolate(&options)?;
            scope.new_native(handle)?
        }
        Capability::ExternalCopy => {
            let copy = scope.copy_out(&first)?;
            scope.new_native(ExternalCopyHandle::new(copy))?
        }
        Capability::Reference => {
            let handle = ReferenceHandle::new(scope, first)?;
            scope.new_native(handle)?
        }
        Capability::NativeModule => {
            let name = first
                .as_str()
                .ok_or_else(|| Error::TypeError("module name must be a string".to_string()))?;
            let module = scope.embedding().native_module(name)?;
            scope.new_native(NativeModuleHandle::new(name, module))?
        }
        Capability::Context | Capability::Script | Capability::Library | Capability::Lib => {
            return Err(Error::TypeError(format!(
                "{} constructor is private",
                capability.class_name()
            )));
        }
    };
    Ok(Value::Object(instance))
}

fn isolate_options(scope: &Scope<'_>, options: &Value) -> Result<IsolateOptions> {
    let mut resolved = IsolateOptions::default();
    if options.as_object().is_none() {
        return Ok(resolved);
    }
    match scope.get(options, "memoryLimit")? {
        Value::Undefined => {}
        Value::Number(mb) if mb.is_finite() && mb >= 0.0 => {
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let mb = mb as usize;
            resolved = resolved.memory_limit_mb(mb);
        }
        _ => {
            return Err(Error::TypeError(
                "memoryLimit must be a non-negative number".to_string(),
            ));
        }
    }
    if let Value::String(name) = scope.get(options, "name")? {
        resolved = resolved.name(&*name);
    }
    Ok(resolved)
}
