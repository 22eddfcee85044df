//! Process-wide map from hosting-runtime contexts to their default isolates.
//!
//! Entries are created by [`crate::init`] and removed only by
//! [`ProcessRegistry::finish`], which the hosting runtime drives once it has
//! finished the native context. An entry moves through
//! `Registered -> ReleaseRequested -> Joined -> Unregistered`; the registry
//! lock is held for each transition but never across the join.

use std::{collections::HashMap, sync::OnceLock};

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::{error::fatal, isolate::IsolateHolder, value::NativeContextId};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShutdownState {
    Registered,
    ReleaseRequested,
    Joined,
    Unregistered,
}

struct RegistryEntry {
    holder: IsolateHolder,
    state: ShutdownState,
}

#[derive(Default)]
pub struct ProcessRegistry {
    entries: Mutex<HashMap<NativeContextId, RegistryEntry>>,
}

impl ProcessRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The registry shared by every [`crate::init`] call in this process.
    pub fn global() -> &'static Self {
        static REGISTRY: OnceLock<ProcessRegistry> = OnceLock::new();
        REGISTRY.get_or_init(Self::new)
    }

    /// Record `holder` as the canonical holder for `id`.
    ///
    /// # Panics
    /// If `id` is already present, in any shutdown state.
    pub fn register(&self, id: NativeContextId, holder: IsolateHolder) {
        let mut entries = self.entries.lock();
        if entries.contains_key(&id) {
            drop(entries);
            fatal(&format!("native context {id} registered twice"));
        }
        debug!(native_id = %id, isolate = %holder.id(), "context registered");
        entries.insert(
            id,
            RegistryEntry {
                holder,
                state: ShutdownState::Registered,
            },
        );
    }

    #[must_use]
    pub fn lookup(&self, id: NativeContextId) -> Option<IsolateHolder> {
        self.entries.lock().get(&id).map(|entry| entry.holder.clone())
    }

    /// Shutdown state of `id`. Absent entries are `Unregistered`.
    #[must_use]
    pub fn state(&self, id: NativeContextId) -> ShutdownState {
        self.entries
            .lock()
            .get(&id)
            .map_or(ShutdownState::Unregistered, |entry| entry.state)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Handle the hosting runtime's finish notification for `id`.
    ///
    /// Releases and joins the isolate, then drops the entry. Returns `false`
    /// without doing anything if `id` is unknown or already shutting down.
    pub fn finish(&self, id: NativeContextId) -> bool {
        let holder = {
            let mut entries = self.entries.lock();
            let Some(entry) = entries.get_mut(&id) else {
                debug!(native_id = %id, "finish for unknown context");
                return false;
            };
            if entry.state != ShutdownState::Registered {
                debug!(native_id = %id, state = ?entry.state, "finish already in progress");
                return false;
            }
            entry.state = ShutdownState::ReleaseRequested;
            entry.holder.clone()
        };

        holder.release_and_join();

        let mut entries = self.entries.lock();
        match entries.get_mut(&id) {
            Some(entry) if entry.state == ShutdownState::ReleaseRequested => {
                entry.state = ShutdownState::Joined;
            }
            _ => {
                drop(entries);
                fatal(&format!("registry entry for {id} changed during release"));
            }
        }
        entries.remove(&id);
        drop(entries);
        info!(native_id = %id, isolate = %holder.id(), "context unregistered");
        true
    }
}
