use crate::error::{Error, Result};

/// Byte accounting for one heap.
pub struct MemoryLimiter {
    max_memory_hard: usize,
    current: usize,
    limit_hit: bool,
}

impl MemoryLimiter {
    pub const fn new(max_memory_hard: usize) -> Self {
        Self {
            max_memory_hard,
            current: 0,
            limit_hit: false,
        }
    }

    pub const fn current(&self) -> usize {
        self.current
    }

    pub const fn limit(&self) -> usize {
        self.max_memory_hard
    }

    /// Whether an allocation has been refused since creation.
    pub const fn limit_hit(&self) -> bool {
        self.limit_hit
    }

    pub const fn memory_growing(&mut self, desired: usize) -> bool {
        if desired > self.max_memory_hard {
            self.limit_hit = true;
            return false;
        }
        self.current = desired;
        true
    }

    pub fn grow(&mut self, additional: usize) -> Result<()> {
        let desired = self.current.saturating_add(additional);
        if self.memory_growing(desired) {
            Ok(())
        } else {
            Err(Error::exhausted(format_args!(
                "heap limit of {} bytes exceeded ({} in use, {additional} requested)",
                self.max_memory_hard, self.current
            )))
        }
    }

    pub const fn shrink(&mut self, released: usize) {
        self.current = self.current.saturating_sub(released);
    }
}
