//! Isolate options and process-wide engine flags.

use tracing::warn;

/// Memory limit used when neither the caller, the environment nor the
/// embedding picks one.
pub const DEFAULT_MEMORY_LIMIT_MB: usize = 128;

/// Smallest heap an isolate is created with.
pub const MIN_MEMORY_LIMIT_MB: usize = 8;

/// Heap cap the engine applies to every isolate until global init clears it.
pub const ENGINE_DEFAULT_HEAP_CAP_MB: usize = 1024;

/// Environment variable consulted when no explicit memory limit is given.
pub const MEMORY_LIMIT_ENV: &str = "ENCLAVE_MEMORY_LIMIT_MB";

const MB: usize = 1024 * 1024;

/// Resolved per-isolate limits, in bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResourceLimits {
    pub memory_limit: usize,
}

impl ResourceLimits {
    #[must_use]
    pub const fn from_mb(memory_limit_mb: usize) -> Self {
        Self {
            memory_limit: memory_limit_mb.saturating_mul(MB),
        }
    }
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self::from_mb(DEFAULT_MEMORY_LIMIT_MB)
    }
}

/// Options for a new isolate.
///
/// An unset memory limit falls back to the environment, then to the
/// embedding defaults, then to [`DEFAULT_MEMORY_LIMIT_MB`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IsolateOptions {
    pub(crate) memory_limit_mb: Option<usize>,
    pub(crate) name: Option<String>,
}

impl IsolateOptions {
    /// Set the heap limit in MiB. Values under [`MIN_MEMORY_LIMIT_MB`] are
    /// raised to the floor.
    #[must_use]
    pub const fn memory_limit_mb(mut self, memory_limit_mb: usize) -> Self {
        self.memory_limit_mb = Some(memory_limit_mb);
        self
    }

    /// Name used for the isolate thread and in log fields.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    #[must_use]
    pub fn display_name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Merge `overrides` into these options. Fields set in `overrides` win.
    #[must_use]
    pub fn merged_with(&self, overrides: &Self) -> Self {
        Self {
            memory_limit_mb: overrides.memory_limit_mb.or(self.memory_limit_mb),
            name: overrides.name.clone().or_else(|| self.name.clone()),
        }
    }

    /// Resolve the limits for a new isolate, with `defaults` supplied by the
    /// embedding.
    #[must_use]
    pub fn resolve(&self, defaults: &Self) -> ResourceLimits {
        let env = std::env::var(MEMORY_LIMIT_ENV).ok();
        resolve_limits(self.memory_limit_mb, env.as_deref(), defaults.memory_limit_mb)
    }
}

fn resolve_limits(
    explicit: Option<usize>,
    env: Option<&str>,
    fallback: Option<usize>,
) -> ResourceLimits {
    let requested = explicit
        .or_else(|| {
            env.and_then(|raw| match raw.trim().parse() {
                Ok(mb) => Some(mb),
                Err(e) => {
                    warn!("ignoring {MEMORY_LIMIT_ENV}={raw:?}: {e}");
                    None
                }
            })
        })
        .or(fallback)
        .unwrap_or(DEFAULT_MEMORY_LIMIT_MB);

    if requested < MIN_MEMORY_LIMIT_MB {
        warn!(
            requested_mb = requested,
            floor_mb = MIN_MEMORY_LIMIT_MB,
            "memory limit below floor, raising"
        );
        return ResourceLimits::from_mb(MIN_MEMORY_LIMIT_MB);
    }
    ResourceLimits::from_mb(requested)
}

/// Engine flags applied once per process, before the first non-default
/// isolate is created.
///
/// `None` leaves the engine default in place. `Some(0)` removes the default
/// generation cap so per-isolate limits alone govern allocation.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EngineFlags {
    pub max_semi_space_size_mb: Option<usize>,
    pub max_old_space_size_mb: Option<usize>,
}

impl EngineFlags {
    /// The flags set by global init.
    #[must_use]
    pub const fn per_isolate_limits() -> Self {
        Self {
            max_semi_space_size_mb: Some(0),
            max_old_space_size_mb: Some(0),
        }
    }

    /// Overlay the fields set in `other`.
    pub const fn merge(&mut self, other: &Self) {
        if let Some(v) = other.max_semi_space_size_mb {
            self.max_semi_space_size_mb = Some(v);
        }
        if let Some(v) = other.max_old_space_size_mb {
            self.max_old_space_size_mb = Some(v);
        }
    }

    /// Command-line form, as an engine flag parser expects it.
    #[must_use]
    pub fn to_args(&self) -> Vec<String> {
        let mut args = Vec::with_capacity(4);
        if let Some(v) = self.max_semi_space_size_mb {
            args.push("--max-semi-space-size".to_string());
            args.push(v.to_string());
        }
        if let Some(v) = self.max_old_space_size_mb {
            args.push("--max-old-space-size".to_string());
            args.push(v.to_string());
        }
        args
    }

    /// Heap ceiling an isolate that asked for `requested` bytes ends up with.
    #[must_use]
    pub fn effective_limit(&self, requested: usize) -> usize {
        match self.max_old_space_size_mb {
            Some(0) => requested,
            Some(cap) => requested.min(cap.saturating_mul(MB)),
            None => requested.min(ENGINE_DEFAULT_HEAP_CAP_MB * MB),
        }
    }
}
