//! Resource limits applied to each plugin store

use wasmtime::ResourceLimiter;

/// Caps guest memory growth and remembers when it refused a request
///
/// The refusal lets the dispatcher report a trapping guest allocator as
/// [`PluginError::OutOfMemory`](crate::PluginError::OutOfMemory) rather than a
/// generic trap.
#[derive(Debug, Clone)]
pub struct MemoryLimiter {
    max_memory_bytes: usize,
    max_table_elements: usize,
    refused: Option<usize>,
}

impl MemoryLimiter {
    pub const DEFAULT_MAX_TABLE_ELEMENTS: usize = 10_000;

    pub fn new(max_memory_bytes: u64) -> Self {
        Self {
            max_memory_bytes: usize::try_from(max_memory_bytes).unwrap_or(usize::MAX),
            max_table_elements: Self::DEFAULT_MAX_TABLE_ELEMENTS,
            refused: None,
        }
    }

    pub fn max_memory_bytes(&self) -> usize {
        self.max_memory_bytes
    }

    /// Whether growth was refused since the last [`reset`](Self::reset)
    pub fn denied(&self) -> bool {
        self.refused.is_some()
    }

    /// Memory size in bytes of the last refused growth request
    pub fn refused_bytes(&self) -> Option<u64> {
        self.refused.map(|bytes| bytes as u64)
    }

    pub fn reset(&mut self) {
        self.refused = None;
    }
}

impl ResourceLimiter for MemoryLimiter {
    fn memory_growing(
        &mut self,
        current: usize,
        desired: usize,
        maximum: Option<usize>,
    ) -> anyhow::Result<bool> {
        let allowed =
            desired <= self.max_memory_bytes && maximum.map_or(true, |max| desired <= max);
        if !allowed {
            self.refused = Some(desired);
            tracing::debug!(
                current,
                desired,
                limit = self.max_memory_bytes,
                "Guest memory growth refused"
            );
        }
        Ok(allowed)
    }

    fn table_growing(
        &mut self,
        _current: usize,
        desired: usize,
        maximum: Option<usize>,
    ) -> anyhow::Result<bool> {
        let max = maximum.unwrap_or(self.max_table_elements);
        Ok(desired <= max && desired <= self.max_table_elements)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: usize = 65_536;

    #[test]
    fn test_growth_within_limit() {
        let mut limiter = MemoryLimiter::new(4 * PAGE as u64);
        assert!(limiter.memory_growing(PAGE, 4 * PAGE, None).unwrap());
        assert!(!limiter.denied());
    }

    #[test]
    fn test_growth_past_limit_is_recorded() {
        let mut limiter = MemoryLimiter::new(2 * PAGE as u64);
        assert!(!limiter.memory_growing(PAGE, 3 * PAGE, None).unwrap());
        assert!(limiter.denied());
        assert_eq!(limiter.refused_bytes(), Some(3 * PAGE as u64));

        limiter.reset();
        assert!(!limiter.denied());
        assert_eq!(limiter.refused_bytes(), None);
    }

    #[test]
    fn test_module_maximum_applies() {
        let mut limiter = MemoryLimiter::new(16 * PAGE as u64);
        assert!(!limiter
            .memory_growing(PAGE, 3 * PAGE, Some(2 * PAGE))
            .unwrap());
    }
}
