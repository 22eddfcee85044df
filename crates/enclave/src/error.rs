use thiserror::Error;

pub type Result<T, E = Error> = core::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum Error {
    /// The engine could not allocate a context, a heap object or a copy.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// `transfer_out` was called on a value without a transfer contract.
    #[error("a non-transferable value was passed: {0}")]
    NotTransferable(String),

    /// The isolate was released; the handle can no longer reach it.
    #[error("isolate is disposed")]
    Disposed,

    /// A handle or object reference was used against an isolate that does
    /// not own it.
    #[error("value belongs to a different isolate")]
    WrongIsolate,

    /// A blocking call targeted the isolate whose thread is making the call.
    #[error("blocking call into the current isolate would deadlock")]
    Reentrant,

    /// The object reference is stale (freed or never allocated).
    #[error("invalid object reference")]
    InvalidReference,

    #[error("{0}")]
    TypeError(String),

    /// Structural copy hit something that cannot be cloned.
    #[error("could not clone value: {0}")]
    DataClone(String),

    #[error("native module not found: {0}")]
    ModuleNotFound(String),

    /// Compile or run failure reported by the engine.
    #[error("script error: {0}")]
    Script(String),

    /// A marshaled task panicked on the isolate thread.
    #[error("task aborted on isolate thread")]
    TaskAborted,

    #[error(transparent)]
    Codec(#[from] enclave_cbor::Error),

    /// Embedder-supplied engine or host failure (type-erased).
    #[error("runtime error: {0}")]
    Runtime(#[source] anyhow::Error),
}

impl Error {
    /// Whether the caller may retry or continue after this failure.
    ///
    /// Everything reported as a value is recoverable at the call site; only
    /// [`Error::TaskAborted`] and [`Error::Runtime`] leave the outcome of
    /// the attempted operation unknown.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        !matches!(self, Self::TaskAborted | Self::Runtime(_))
    }

    pub(crate) fn exhausted(what: impl std::fmt::Display) -> Self {
        Self::ResourceExhausted(what.to_string())
    }
}

/// Report a broken contract with the hosting runtime and stop.
///
/// Registry and lifecycle invariants are never surfaced as error values: a
/// violated invariant leaves the registry in a state that cannot be told
/// apart from a use-after-free.
#[track_caller]
pub(crate) fn fatal(message: &str) -> ! {
    tracing::error!(target: "enclave::fatal", "{message}");
    panic!("enclave invariant violated: {message}");
}
