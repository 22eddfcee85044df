//! Script engine seam and the bundled engine.

use std::sync::{
    Arc, OnceLock,
    atomic::{AtomicUsize, Ordering},
};

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::{
    config::{EngineFlags, ResourceLimits},
    error::{Error, Result},
    global::PlatformDelegate,
    heap::Heap,
    isolate::Scope,
    value::{IsolateId, ObjectRef, StructuredValue, Value},
};

/// Where a script came from, for error messages.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScriptOrigin {
    pub filename: String,
    pub line_offset: u32,
}

impl ScriptOrigin {
    #[must_use]
    pub fn new(filename: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            line_offset: 0,
        }
    }

    #[must_use]
    pub const fn line_offset(mut self, line_offset: u32) -> Self {
        self.line_offset = line_offset;
        self
    }
}

impl Default for ScriptOrigin {
    fn default() -> Self {
        Self::new("<anonymous>")
    }
}

/// A compiled script. Compiled once, runnable in any context of the isolate
/// that compiled it.
pub trait Program: Send + Sync + 'static {
    /// Run against the context whose global object is `global`.
    ///
    /// # Errors
    /// Returns [`Error::Script`] for failures raised by the script.
    fn run(&self, scope: &mut Scope<'_>, global: &ObjectRef) -> Result<Value>;
}

pub trait Engine: Send + Sync + 'static {
    /// Apply process-wide flags. Global init calls this once for every
    /// embedding's engine, before that embedding's first non-default
    /// isolate.
    fn set_flags(&self, flags: &EngineFlags);

    fn install_platform_delegate(&self, delegate: Arc<PlatformDelegate>);

    /// Create the heap backing a new isolate.
    ///
    /// # Errors
    /// Returns [`Error::ResourceExhausted`] if the engine cannot host
    /// another isolate with these limits.
    fn create_heap(&self, isolate: IsolateId, limits: &ResourceLimits) -> Result<Heap>;

    /// # Errors
    /// Returns [`Error::Script`] if `source` does not compile.
    fn compile(&self, source: &str, origin: &ScriptOrigin) -> Result<Arc<dyn Program>>;
}

impl<T: Engine + ?Sized> Engine for Arc<T> {
    fn set_flags(&self, flags: &EngineFlags) {
        (**self).set_flags(flags);
    }

    fn install_platform_delegate(&self, delegate: Arc<PlatformDelegate>) {
        (**self).install_platform_delegate(delegate);
    }

    fn create_heap(&self, isolate: IsolateId, limits: &ResourceLimits) -> Result<Heap> {
        (**self).create_heap(isolate, limits)
    }

    fn compile(&self, source: &str, origin: &ScriptOrigin) -> Result<Arc<dyn Program>> {
        (**self).compile(source, origin)
    }
}

struct Budget {
    total: usize,
    used: AtomicUsize,
}

/// Share of the engine memory budget held by one heap.
pub struct Reservation {
    budget: Arc<Budget>,
    size: usize,
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.budget.used.fetch_sub(self.size, Ordering::AcqRel);
    }
}

/// Bundled engine.
///
/// Scripts are data programs: a JSON literal evaluates to a fresh copy of
/// that value, and a dotted path such as `config.limits.max` reads a
/// property chain off the context's global object.
pub struct DefaultEngine {
    budget: Option<Arc<Budget>>,
    flags: RwLock<EngineFlags>,
    delegate: OnceLock<Arc<PlatformDelegate>>,
}

impl DefaultEngine {
    #[must_use]
    pub fn new() -> Self {
        Self {
            budget: None,
            flags: RwLock::new(EngineFlags::default()),
            delegate: OnceLock::new(),
        }
    }

    /// Cap the sum of heap limits across all live isolates.
    #[must_use]
    pub fn with_memory_budget(mut self, bytes: usize) -> Self {
        self.budget = Some(Arc::new(Budget {
            total: bytes,
            used: AtomicUsize::new(0),
        }));
        self
    }

    #[must_use]
    pub fn flags(&self) -> EngineFlags {
        self.flags.read().clone()
    }

    #[must_use]
    pub fn platform_delegate(&self) -> Option<&Arc<PlatformDelegate>> {
        self.delegate.get()
    }

    fn reserve(&self, size: usize) -> Result<Option<Reservation>> {
        let Some(budget) = &self.budget else {
            return Ok(None);
        };
        budget
            .used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(size).filter(|next| *next <= budget.total)
            })
            .map_err(|used| {
                Error::exhausted(format!(
                    "engine memory budget: {size} bytes requested, {} of {} in use",
                    used, budget.total
                ))
            })?;
        Ok(Some(Reservation {
            budget: Arc::clone(budget),
            size,
        }))
    }
}

impl Default for DefaultEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine for DefaultEngine {
    fn set_flags(&self, flags: &EngineFlags) {
        info!(args = ?flags.to_args(), "setting engine flags");
        self.flags.write().merge(flags);
    }

    fn install_platform_delegate(&self, delegate: Arc<PlatformDelegate>) {
        if self.delegate.set(delegate).is_err() {
            debug!("platform delegate already installed");
        }
    }

    fn create_heap(&self, isolate: IsolateId, limits: &ResourceLimits) -> Result<Heap> {
        let limit = self.flags.read().effective_limit(limits.memory_limit);
        let heap = Heap::new(isolate, limit);
        Ok(match self.reserve(limit)? {
            Some(reservation) => heap.with_reservation(reservation),
            None => heap,
        })
    }

    fn compile(&self, source: &str, origin: &ScriptOrigin) -> Result<Arc<dyn Program>> {
        let trimmed = source.trim();
        if is_property_path(trimmed) {
            return Ok(Arc::new(LookupProgram {
                path: trimmed.split('.').map(str::to_string).collect(),
            }));
        }
        match serde_json::from_str::<serde_json::Value>(source) {
            Ok(json) => Ok(Arc::new(LiteralProgram(StructuredValue::from(json)))),
            Err(e) => Err(Error::Script(format!(
                "{}:{}:{}: {e}",
                origin.filename,
                e.line() + origin.line_offset as usize,
                e.column()
            ))),
        }
    }
}

fn is_property_path(source: &str) -> bool {
    !matches!(source, "true" | "false" | "null")
        && source.split('.').all(|part| {
            let mut chars = part.chars();
            chars
                .next()
                .is_some_and(|c| c.is_ascii_alphabetic() || c == '_' || c == '$')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
        })
}

struct LiteralProgram(StructuredValue);

impl Program for LiteralProgram {
    fn run(&self, scope: &mut Scope<'_>, _global: &ObjectRef) -> Result<Value> {
        scope.materialize(&self.0)
    }
}

struct LookupProgram {
    path: Vec<String>,
}

impl Program for LookupProgram {
    fn run(&self, scope: &mut Scope<'_>, global: &ObjectRef) -> Result<Value> {
        let mut current = Value::Object(*global);
        for key in &self.path {
            current = match &current {
                Value::Object(object) => scope.heap().get_property(object, key)?,
                other => {
                    return Err(Error::Script(format!(
                        "TypeError: cannot read property {key:?} of {}",
                        scope.heap().type_of(other)?.as_str()
                    )));
                }
            };
        }
        Ok(current)
    }
}
