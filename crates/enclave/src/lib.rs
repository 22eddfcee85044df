mod internal;

mod bootstrap;
pub mod class;
pub mod config;
mod embedding;
pub mod engine;
pub mod error;
pub mod global;
pub mod handles;
pub mod heap;
pub mod host;
pub mod isolate;
pub mod registry;
#[cfg(feature = "trace")]
pub mod trace;
pub mod transfer;
pub mod value;

pub use bootstrap::init;
pub use class::{Capability, ClassHandle, ClassRegistry, ClassTemplate};
pub use config::{EngineFlags, IsolateOptions, ResourceLimits};
pub use embedding::{Embedding, EmbeddingBuilder};
pub use engine::{DefaultEngine, Engine, Program, ScriptOrigin};
pub use error::{Error, Result};
pub use global::{InitOnce, PlatformDelegate, ensure_global_init};
pub use handles::{
    ContextHandle, ExternalCopy, ExternalCopyHandle, IsolateHandle, LIBRARY_GLOBAL, LibHandle,
    LibraryHandle, NativeModule, NativeModuleHandle, ReferenceHandle, ResultMode, ScriptHandle,
};
pub use heap::{Heap, HeapObject, HeapStatistics};
pub use host::{FinishCallback, Host, ManualHost, Platform, PlatformTask, ThreadPlatform};
pub use isolate::{IsolateEnvironment, IsolateHolder, Lifecycle, Scope, WeakIsolate};
pub use registry::{ProcessRegistry, ShutdownState};
pub use transfer::Transferable;
pub use value::{IsolateId, NativeContextId, ObjectRef, Primitive, StructuredValue, TypeOf, Value};
