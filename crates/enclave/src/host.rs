use std::{collections::HashMap, sync::Arc};

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::value::NativeContextId;

pub type PlatformTask = Box<dyn FnOnce() + Send + 'static>;

/// Invoked once the hosting runtime has finished a native context.
pub type FinishCallback = Box<dyn FnOnce(NativeContextId) + Send + 'static>;

/// Thread and task services of the hosting runtime.
pub trait Platform: Send + Sync + 'static {
    fn call_on_worker_thread(&self, task: PlatformTask);
}

impl<T: Platform + ?Sized> Platform for Arc<T> {
    fn call_on_worker_thread(&self, task: PlatformTask) {
        (**self).call_on_worker_thread(task);
    }
}

/// The runtime that embeds this crate.
pub trait Host: Send + Sync + 'static {
    /// Register `callback` to run when the native context `id` finishes.
    ///
    /// The callback may run on any thread, but must run after every
    /// background thread of that context has drained.
    fn add_context_finished_callback(&self, id: NativeContextId, callback: FinishCallback);

    /// `None` when the runtime was started without a multi-context platform.
    fn platform(&self) -> Option<Arc<dyn Platform>>;
}

impl<T: Host + ?Sized> Host for Arc<T> {
    fn add_context_finished_callback(&self, id: NativeContextId, callback: FinishCallback) {
        (**self).add_context_finished_callback(id, callback);
    }

    fn platform(&self) -> Option<Arc<dyn Platform>> {
        (**self).platform()
    }
}

/// Runs every worker task on a fresh OS thread.
#[derive(Clone, Copy, Debug, Default)]
pub struct ThreadPlatform;

impl Platform for ThreadPlatform {
    fn call_on_worker_thread(&self, task: PlatformTask) {
        if let Err(e) = std::thread::Builder::new()
            .name("enclave-worker".to_string())
            .spawn(task)
        {
            tracing::error!("failed to spawn worker thread: {e}");
        }
    }
}

/// Host whose finish notifications are fired explicitly.
pub struct ManualHost {
    platform: Option<Arc<dyn Platform>>,
    callbacks: Mutex<HashMap<NativeContextId, Vec<FinishCallback>>>,
}

impl ManualHost {
    #[must_use]
    pub fn new() -> Self {
        Self::with_platform(Some(Arc::new(ThreadPlatform)))
    }

    #[must_use]
    pub fn with_platform(platform: Option<Arc<dyn Platform>>) -> Self {
        Self {
            platform,
            callbacks: Mutex::new(HashMap::new()),
        }
    }

    /// Fire the finish callbacks registered for `id`, in registration order.
    /// Returns how many ran.
    pub fn notify_finished(&self, id: NativeContextId) -> usize {
        let callbacks = self.callbacks.lock().remove(&id).unwrap_or_default();
        debug!(native_id = %id, count = callbacks.len(), "context finished");
        let count = callbacks.len();
        for callback in callbacks {
            callback(id);
        }
        count
    }
}

impl Default for ManualHost {
    fn default() -> Self {
        Self::new()
    }
}

impl Host for ManualHost {
    fn add_context_finished_callback(&self, id: NativeContextId, callback: FinishCallback) {
        trace!(native_id = %id, "finish callback registered");
        self.callbacks.lock().entry(id).or_default().push(callback);
    }

    fn platform(&self) -> Option<Arc<dyn Platform>> {
        self.platform.clone()
    }
}
