//! Resource-limited isolates and their owning threads.
//!
//! Each isolate runs on one dedicated thread that owns its heap, class
//! cache and contexts. Other threads reach it only by posting tasks to its
//! queue; see [`IsolateEnvironment::run_sync`] and
//! [`IsolateEnvironment::run_async`].

mod holder;
mod scope;

use std::{
    fmt,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{
        Arc, OnceLock,
        atomic::{AtomicBool, AtomicU8, Ordering},
    },
    thread::{JoinHandle, ThreadId},
};

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, info_span, warn};

pub use self::holder::{IsolateHolder, WeakIsolate};
pub use self::scope::Scope;
use crate::{
    class::ClassRegistry,
    config::{IsolateOptions, ResourceLimits},
    embedding::Embedding,
    error::{Error, Result},
    global,
    heap::{Heap, HeapObject, Properties},
    value::{IsolateId, NativeContextId, ObjectRef},
};

pub(crate) type Task = Box<dyn FnOnce(&mut Scope<'_>) + Send + 'static>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Lifecycle {
    Initializing = 0,
    Running = 1,
    Releasing = 2,
    Disposed = 3,
}

impl Lifecycle {
    const fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Initializing,
            1 => Self::Running,
            2 => Self::Releasing,
            _ => Self::Disposed,
        }
    }
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Initializing => "initializing",
            Self::Running => "running",
            Self::Releasing => "releasing",
            Self::Disposed => "disposed",
        };
        f.write_str(name)
    }
}

/// State owned by the isolate thread.
pub(crate) struct IsolateState {
    pub(crate) heap: Heap,
    pub(crate) classes: ClassRegistry,
    pub(crate) default_global: ObjectRef,
    pub(crate) contexts: Vec<ObjectRef>,
    pub(crate) self_holder: WeakIsolate,
}

impl IsolateState {
    fn new(mut heap: Heap, self_holder: WeakIsolate) -> Result<Self> {
        let default_global = heap.alloc(HeapObject::Object(Properties::default()))?;
        Ok(Self {
            heap,
            classes: ClassRegistry::default(),
            default_global,
            contexts: Vec::new(),
            self_holder,
        })
    }
}

pub struct IsolateEnvironment {
    id: IsolateId,
    native_id: Option<NativeContextId>,
    name: String,
    limits: ResourceLimits,
    embedding: Embedding,
    lifecycle: AtomicU8,
    tasks: Mutex<Option<mpsc::UnboundedSender<Task>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
    thread_id: OnceLock<ThreadId>,
    memory_limit_hit: AtomicBool,
}

impl IsolateEnvironment {
    /// Create an isolate and start its thread.
    ///
    /// `native_id` is set for the default isolate of a hosting-runtime
    /// context. Every other isolate triggers global init first.
    pub(crate) fn spawn(
        embedding: &Embedding,
        options: &IsolateOptions,
        native_id: Option<NativeContextId>,
    ) -> Result<IsolateHolder> {
        if native_id.is_none() {
            global::ensure_global_init(embedding);
        }

        let defaults = embedding.default_options();
        let limits = options.resolve(defaults);
        let id = IsolateId::next();
        let name = defaults
            .merged_with(options)
            .display_name()
            .map_or_else(|| id.to_string(), str::to_string);

        let heap = embedding.engine().create_heap(id, &limits)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let env = Arc::new(Self {
            id,
            native_id,
            name,
            limits,
            embedding: embedding.clone(),
            lifecycle: AtomicU8::new(Lifecycle::Initializing as u8),
            tasks: Mutex::new(Some(tx)),
            thread: Mutex::new(None),
            thread_id: OnceLock::new(),
            memory_limit_hit: AtomicBool::new(false),
        });
        let holder = IsolateHolder::new(Arc::clone(&env));
        let state = IsolateState::new(heap, holder.weak())?;

        let thread = std::thread::Builder::new()
            .name(format!("enclave-{}", env.name))
            .spawn({
                let env = Arc::clone(&env);
                move || env.run_loop(state, rx)
            })
            .map_err(|e| Error::exhausted(format_args!("isolate thread: {e}")))?;
        let _ = env.thread_id.set(thread.thread().id());
        *env.thread.lock() = Some(thread);

        if let Some(delegate) = global::platform_delegate() {
            delegate.register_isolate(id, holder.weak());
        }
        info!(
            isolate = %id,
            name = %env.name,
            memory_limit = limits.memory_limit,
            default = native_id.is_some(),
            "isolate created"
        );
        Ok(holder)
    }

    fn run_loop(self: Arc<Self>, mut state: IsolateState, mut rx: mpsc::UnboundedReceiver<Task>) {
        let span = info_span!("isolate", isolate = %self.id);
        let _enter = span.enter();
        let _ = self.lifecycle.compare_exchange(
            Lifecycle::Initializing as u8,
            Lifecycle::Running as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        debug!("isolate thread started");

        while let Some(task) = rx.blocking_recv() {
            {
                let mut scope = Scope::new(&self, &mut state);
                if catch_unwind(AssertUnwindSafe(|| task(&mut scope))).is_err() {
                    warn!("task panicked on isolate thread");
                }
            }
            if state.heap.limit_hit() {
                self.memory_limit_hit.store(true, Ordering::Release);
            }
        }

        // Drops natives held by the heap, which may release other isolates.
        drop(state);
        if let Some(delegate) = global::platform_delegate() {
            delegate.unregister_isolate(self.id);
        }
        self.lifecycle
            .store(Lifecycle::Disposed as u8, Ordering::Release);
        debug!("isolate thread exited");
    }

    #[must_use]
    pub const fn id(&self) -> IsolateId {
        self.id
    }

    #[must_use]
    pub const fn native_id(&self) -> Option<NativeContextId> {
        self.native_id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub const fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    #[must_use]
    pub const fn embedding(&self) -> &Embedding {
        &self.embedding
    }

    #[must_use]
    pub fn lifecycle(&self) -> Lifecycle {
        Lifecycle::from_u8(self.lifecycle.load(Ordering::Acquire))
    }

    /// Whether any allocation in this isolate was ever refused.
    #[must_use]
    pub fn memory_limit_hit(&self) -> bool {
        self.memory_limit_hit.load(Ordering::Acquire)
    }

    pub(crate) fn is_accepting(&self) -> bool {
        self.lifecycle() < Lifecycle::Releasing
    }

    /// Whether the caller is running on this isolate's thread.
    #[must_use]
    pub fn is_current_thread(&self) -> bool {
        self.thread_id.get() == Some(&std::thread::current().id())
    }

    pub(crate) fn post(&self, task: Task) -> Result<()> {
        let tasks = self.tasks.lock();
        let tx = tasks.as_ref().ok_or(Error::Disposed)?;
        tx.send(task).map_err(|_| Error::Disposed)
    }

    /// Run `f` on the isolate thread and block until it returns.
    ///
    /// # Errors
    /// Returns [`Error::Reentrant`] when called from the isolate's own
    /// thread, [`Error::Disposed`] once the isolate stopped accepting work
    /// and [`Error::TaskAborted`] if `f` panicked.
    pub fn run_sync<R, F>(&self, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut Scope<'_>) -> Result<R> + Send + 'static,
    {
        if self.is_current_thread() {
            return Err(Error::Reentrant);
        }
        let (tx, rx) = std::sync::mpsc::sync_channel(1);
        self.post(Box::new(move |scope: &mut Scope<'_>| {
            let _ = tx.send(f(scope));
        }))?;
        rx.recv().map_err(|_| Error::TaskAborted)?
    }

    /// Run `f` on the isolate thread and await its result.
    ///
    /// # Errors
    /// Same as [`IsolateEnvironment::run_sync`], except that queuing from
    /// the isolate's own thread is allowed.
    pub async fn run_async<R, F>(&self, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut Scope<'_>) -> Result<R> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.post(Box::new(move |scope: &mut Scope<'_>| {
            let _ = tx.send(f(scope));
        }))?;
        rx.await.map_err(|_| Error::TaskAborted)?
    }

    /// Stop accepting work. Queued tasks still run.
    fn release(&self) -> Option<JoinHandle<()>> {
        self.lifecycle
            .fetch_max(Lifecycle::Releasing as u8, Ordering::AcqRel);
        drop(self.tasks.lock().take());
        self.thread.lock().take()
    }

    /// Stop accepting work and wait for the thread to drain its queue.
    ///
    /// From the isolate's own thread this only closes the queue: the thread
    /// exits once the running task returns.
    fn release_and_join(&self) {
        let Some(thread) = self.release() else {
            return;
        };
        if self.is_current_thread() {
            debug!(isolate = %self.id, "released from own thread");
            return;
        }
        debug!(isolate = %self.id, "joining isolate thread");
        if thread.join().is_err() {
            warn!(isolate = %self.id, "isolate thread panicked");
        }
        self.lifecycle
            .store(Lifecycle::Disposed as u8, Ordering::Release);
        info!(isolate = %self.id, "isolate disposed");
    }
}

impl fmt::Debug for IsolateEnvironment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IsolateEnvironment")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("lifecycle", &self.lifecycle())
            .finish_non_exhaustive()
    }
}
