//! Native classes and the per-isolate constructor cache.

use std::{
    any::Any,
    collections::HashMap,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use tracing::debug;

use crate::{
    error::Result,
    heap::{Heap, HeapObject},
    transfer::Transferable,
    value::{IsolateId, ObjectRef},
};

/// A native class exposed to script code.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Capability {
    Context,
    ExternalCopy,
    Isolate,
    NativeModule,
    Reference,
    Script,
    /// The bootstrap object carrying the other six.
    Library,
    /// Utilities installed as `lib` on every library object.
    Lib,
}

impl Capability {
    /// Constructors installed on every library object.
    pub const SURFACE: [Self; 6] = [
        Self::Context,
        Self::ExternalCopy,
        Self::Isolate,
        Self::NativeModule,
        Self::Reference,
        Self::Script,
    ];

    #[must_use]
    pub const fn class_name(self) -> &'static str {
        match self {
            Self::Context => "Context",
            Self::ExternalCopy => "ExternalCopy",
            Self::Isolate => "Isolate",
            Self::NativeModule => "NativeModule",
            Self::Reference => "Reference",
            Self::Script => "Script",
            Self::Library => "Library",
            Self::Lib => "Lib",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.class_name())
    }
}

/// Behavior shared by every native class instance.
///
/// Instances live inside a heap as native objects. Whatever state they hold
/// must be safe to reach from another isolate's thread, since the package
/// produced by [`ClassHandle::transfer_out`] crosses isolates.
pub trait ClassHandle: Send + Sync + 'static {
    fn capability(&self) -> Capability;

    /// Package this instance for another isolate.
    ///
    /// # Errors
    /// Returns [`crate::Error::NotTransferable`] for classes without a
    /// transfer contract.
    fn transfer_out(&self) -> Result<Transferable>;

    fn as_any(&self) -> &dyn Any;

    /// Called before the instance is stored in the heap of `isolate`.
    /// Holders of that same isolate become anchored there.
    fn anchor(&mut self, _isolate: IsolateId) {}

    /// Undo [`ClassHandle::anchor`] on a copy leaving the heap.
    fn unanchor(&mut self) {}
}

/// Script-visible constructor of one capability in one isolate.
#[derive(Debug)]
pub struct ClassTemplate {
    capability: Capability,
    isolate: IsolateId,
    constructor: ObjectRef,
    serial: u64,
}

impl ClassTemplate {
    #[must_use]
    pub const fn capability(&self) -> Capability {
        self.capability
    }

    #[must_use]
    pub const fn isolate(&self) -> IsolateId {
        self.isolate
    }

    #[must_use]
    pub const fn constructor(&self) -> ObjectRef {
        self.constructor
    }

    /// Process-unique number of this template.
    #[must_use]
    pub const fn serial(&self) -> u64 {
        self.serial
    }
}

/// Lazily built constructor templates of one isolate.
#[derive(Default)]
pub struct ClassRegistry {
    templates: HashMap<Capability, Arc<ClassTemplate>>,
}

impl ClassRegistry {
    #[must_use]
    pub fn get(&self, capability: Capability) -> Option<&Arc<ClassTemplate>> {
        self.templates.get(&capability)
    }

    /// Return the cached template for `capability`, building it on first use.
    ///
    /// # Errors
    /// Returns [`crate::Error::ResourceExhausted`] if the constructor object
    /// does not fit in `heap`.
    pub fn get_or_create(
        &mut self,
        heap: &mut Heap,
        capability: Capability,
    ) -> Result<Arc<ClassTemplate>> {
        static NEXT_SERIAL: AtomicU64 = AtomicU64::new(1);

        if let Some(template) = self.templates.get(&capability) {
            return Ok(Arc::clone(template));
        }

        let constructor = heap.alloc(HeapObject::Constructor(capability))?;
        let template = Arc::new(ClassTemplate {
            capability,
            isolate: heap.isolate(),
            constructor,
            serial: NEXT_SERIAL.fetch_add(1, Ordering::Relaxed),
        });
        debug!(isolate = %heap.isolate(), class = %capability, "class template created");
        self.templates.insert(capability, Arc::clone(&template));
        Ok(template)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.templates.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}
