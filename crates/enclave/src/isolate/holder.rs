use std::{
    fmt,
    sync::{Arc, Weak},
};

use parking_lot::RwLock;

use super::IsolateEnvironment;
use crate::{
    error::{Error, Result},
    value::IsolateId,
};

struct HolderInner {
    id: IsolateId,
    env: RwLock<Option<Arc<IsolateEnvironment>>>,
}

impl Drop for HolderInner {
    fn drop(&mut self) {
        // The last holder only closes the queue. Joining is left to an
        // explicit release so a drop can never block on another isolate.
        if let Some(env) = self.env.get_mut().take() {
            drop(env.release());
        }
    }
}

#[derive(Clone)]
enum Link {
    Strong(Arc<HolderInner>),
    /// Held from inside the isolate's own heap.
    Anchored(Weak<HolderInner>),
}

/// Strong handle to an isolate.
///
/// Clones share one holder. Dropping the last clone stops the isolate from
/// accepting work; [`IsolateHolder::release_and_join`] also waits for its
/// thread to drain.
///
/// A handle stored in the heap of the isolate it points at is anchored: it
/// reaches the isolate like any other holder but does not count towards
/// keeping it alive.
#[derive(Clone)]
pub struct IsolateHolder {
    id: IsolateId,
    link: Link,
}

impl IsolateHolder {
    pub(crate) fn new(env: Arc<IsolateEnvironment>) -> Self {
        Self::from_inner(Arc::new(HolderInner {
            id: env.id(),
            env: RwLock::new(Some(env)),
        }))
    }

    fn from_inner(inner: Arc<HolderInner>) -> Self {
        Self {
            id: inner.id,
            link: Link::Strong(inner),
        }
    }

    fn inner(&self) -> Option<Arc<HolderInner>> {
        match &self.link {
            Link::Strong(inner) => Some(Arc::clone(inner)),
            Link::Anchored(weak) => weak.upgrade(),
        }
    }

    #[must_use]
    pub const fn id(&self) -> IsolateId {
        self.id
    }

    /// The live isolate, kept alive for as long as the returned `Arc` is.
    ///
    /// # Errors
    /// Returns [`Error::Disposed`] once release has started.
    pub fn strong(&self) -> Result<Arc<IsolateEnvironment>> {
        self.inner()
            .and_then(|inner| {
                inner
                    .env
                    .read()
                    .as_ref()
                    .filter(|env| env.is_accepting())
                    .cloned()
            })
            .ok_or(Error::Disposed)
    }

    #[must_use]
    pub fn weak(&self) -> WeakIsolate {
        match &self.link {
            Link::Strong(inner) => WeakIsolate(Arc::downgrade(inner)),
            Link::Anchored(weak) => WeakIsolate(weak.clone()),
        }
    }

    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.strong().is_err()
    }

    /// Whether this clone counts towards keeping the isolate alive.
    #[must_use]
    pub const fn is_anchored(&self) -> bool {
        matches!(self.link, Link::Anchored(_))
    }

    /// This holder as stored in the heap of `isolate`.
    pub(crate) fn anchored(&self, isolate: IsolateId) -> Self {
        match &self.link {
            Link::Strong(inner) if self.id == isolate => Self {
                id: self.id,
                link: Link::Anchored(Arc::downgrade(inner)),
            },
            _ => self.clone(),
        }
    }

    /// Inverse of [`IsolateHolder::anchored`]. Stays anchored once every
    /// strong holder is gone.
    pub(crate) fn rooted(&self) -> Self {
        match &self.link {
            Link::Anchored(weak) => weak.upgrade().map_or_else(|| self.clone(), Self::from_inner),
            Link::Strong(_) => self.clone(),
        }
    }

    /// Signal the isolate to stop, wait for queued work to finish and drop
    /// the engine resources. Later calls are no-ops.
    pub fn release_and_join(&self) {
        let env = self.inner().and_then(|inner| inner.env.write().take());
        if let Some(env) = env {
            env.release_and_join();
        }
    }

    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        std::ptr::eq(self.as_ptr(), other.as_ptr())
    }

    fn as_ptr(&self) -> *const HolderInner {
        match &self.link {
            Link::Strong(inner) => Arc::as_ptr(inner),
            Link::Anchored(weak) => weak.as_ptr(),
        }
    }
}

impl fmt::Debug for IsolateHolder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IsolateHolder")
            .field("id", &self.id)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

/// Non-owning handle to an isolate. Never revives a released isolate.
#[derive(Clone, Default)]
pub struct WeakIsolate(Weak<HolderInner>);

impl WeakIsolate {
    /// # Errors
    /// Returns [`Error::Disposed`] if the isolate was released or every
    /// strong holder is gone.
    pub fn resolve(&self) -> Result<Arc<IsolateEnvironment>> {
        self.upgrade().ok_or(Error::Disposed)?.strong()
    }

    pub(crate) fn upgrade(&self) -> Option<IsolateHolder> {
        self.0.upgrade().map(IsolateHolder::from_inner)
    }
}

impl fmt::Debug for WeakIsolate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let id = self.0.upgrade().map(|inner| inner.id);
        f.debug_tuple("WeakIsolate").field(&id).finish()
    }
}
