//! Process-wide one-time setup and the engine's platform delegate.

use std::sync::{
    Arc, OnceLock,
    atomic::{AtomicBool, Ordering},
};

use dashmap::DashMap;
use tracing::{info, trace};

use crate::{
    config::EngineFlags,
    embedding::Embedding,
    error::fatal,
    host::{Platform, PlatformTask},
    isolate::{Scope, WeakIsolate},
    value::IsolateId,
};

/// Lock-free run-once guard, usable from a `static`.
pub struct InitOnce {
    started: AtomicBool,
    finished: AtomicBool,
}

struct FinishOnDrop<'a>(&'a AtomicBool);

impl Drop for FinishOnDrop<'_> {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Release);
    }
}

impl InitOnce {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            started: AtomicBool::new(false),
            finished: AtomicBool::new(false),
        }
    }

    /// Run `f` unless another caller already has. Returns whether this call
    /// ran it. Callers that lose the race wait until the winner is done.
    pub fn run(&self, f: impl FnOnce()) -> bool {
        if self.started.swap(true, Ordering::AcqRel) {
            self.wait();
            return false;
        }
        let _finish = FinishOnDrop(&self.finished);
        f();
        true
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    fn wait(&self) {
        while !self.is_complete() {
            std::hint::spin_loop();
            std::thread::yield_now();
        }
    }
}

impl Default for InitOnce {
    fn default() -> Self {
        Self::new()
    }
}

static GLOBAL_INIT: InitOnce = InitOnce::new();
static DELEGATE: OnceLock<Arc<PlatformDelegate>> = OnceLock::new();

/// Create the platform delegate once per process, then hand the engine
/// flags and the delegate to `embedding`'s engine if it has not seen them
/// yet. Returns whether this call did the process-wide work.
///
/// # Panics
/// If the hosting runtime provides no platform on the first call.
pub fn ensure_global_init(embedding: &Embedding) -> bool {
    let ran = GLOBAL_INIT.run(|| {
        info!(args = ?EngineFlags::per_isolate_limits().to_args(), "global init");
        let Some(platform) = embedding.host().platform() else {
            fatal("hosting runtime provides no platform");
        };
        DELEGATE.get_or_init(|| Arc::new(PlatformDelegate::new(platform)));
    });
    embedding.configure_engine(|engine| {
        engine.set_flags(&EngineFlags::per_isolate_limits());
        if let Some(delegate) = DELEGATE.get() {
            engine.install_platform_delegate(Arc::clone(delegate));
        }
    });
    ran
}

#[must_use]
pub fn is_initialized() -> bool {
    GLOBAL_INIT.is_complete()
}

/// The delegate installed by global init.
#[must_use]
pub fn platform_delegate() -> Option<&'static Arc<PlatformDelegate>> {
    DELEGATE.get()
}

/// Platform services handed to the engine.
///
/// Foreground tasks run on the thread of the isolate they target, background
/// tasks on the hosting runtime's workers.
pub struct PlatformDelegate {
    platform: Arc<dyn Platform>,
    isolates: DashMap<IsolateId, WeakIsolate>,
}

impl PlatformDelegate {
    #[must_use]
    pub fn new(platform: Arc<dyn Platform>) -> Self {
        Self {
            platform,
            isolates: DashMap::new(),
        }
    }

    pub fn register_isolate(&self, id: IsolateId, isolate: WeakIsolate) {
        self.isolates.insert(id, isolate);
    }

    pub fn unregister_isolate(&self, id: IsolateId) {
        self.isolates.remove(&id);
    }

    /// Queue `task` on the thread of `isolate`. Returns `false` and drops the
    /// task if the isolate is unknown or no longer accepts work.
    pub fn post_task(&self, isolate: IsolateId, task: PlatformTask) -> bool {
        let Some(weak) = self.isolates.get(&isolate).map(|entry| entry.value().clone()) else {
            trace!(isolate = %isolate, "task for unknown isolate dropped");
            return false;
        };
        let Ok(env) = weak.resolve() else {
            trace!(isolate = %isolate, "task for disposed isolate dropped");
            return false;
        };
        env.post(Box::new(move |_: &mut Scope<'_>| task())).is_ok()
    }

    pub fn post_worker_task(&self, task: PlatformTask) {
        self.platform.call_on_worker_thread(task);
    }

    #[must_use]
    pub fn isolate_count(&self) -> usize {
        self.isolates.len()
    }
}
