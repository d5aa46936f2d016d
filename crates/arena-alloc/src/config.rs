//! Engine configuration.

use derive_more::IsVariant;

/// How callers name an allocation when freeing it.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, IsVariant)]
pub enum HandleMode {
    /// Allocations are freed by the payload pointer.
    #[default]
    Pointer,
    /// Allocations additionally receive a [`RegionId`](crate::RegionId) and
    /// may be freed by it. Freeing by pointer keeps working.
    Identifier,
}

/// How free regions are merged after a free.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, IsVariant)]
pub enum Coalescing {
    /// Sweep the whole chain from the head, merging every free pair.
    #[default]
    Sweep,
    /// Merge the freed region with its successor and predecessor only.
    Neighbors,
}

/// What happens when a free names no live allocation.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, IsVariant)]
pub enum InvalidFree {
    /// Leave the arena untouched, log a warning and return the error.
    #[default]
    Reject,
    /// Treat the request as a fatal precondition violation.
    Abort,
}

/// Configuration of a free-list heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapConfig {
    handles: HandleMode,
    coalescing: Coalescing,
    invalid_free: InvalidFree,
    min_growth: usize,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl HeapConfig {
    /// Minimum number of bytes requested from a growth source.
    pub const DEFAULT_MIN_GROWTH: usize = 64 * 1024;

    #[must_use]
    pub const fn new() -> Self {
        Self {
            handles: HandleMode::Pointer,
            coalescing: Coalescing::Sweep,
            invalid_free: InvalidFree::Reject,
            min_growth: Self::DEFAULT_MIN_GROWTH,
        }
    }

    #[must_use]
    pub const fn with_handles(mut self, handles: HandleMode) -> Self {
        self.handles = handles;
        self
    }

    #[must_use]
    pub const fn with_coalescing(mut self, coalescing: Coalescing) -> Self {
        self.coalescing = coalescing;
        self
    }

    #[must_use]
    pub const fn with_invalid_free(mut self, invalid_free: InvalidFree) -> Self {
        self.invalid_free = invalid_free;
        self
    }

    #[must_use]
    pub const fn with_min_growth(mut self, min_growth: usize) -> Self {
        self.min_growth = min_growth;
        self
    }

    #[must_use]
    pub const fn handles(&self) -> HandleMode {
        self.handles
    }

    #[must_use]
    pub const fn coalescing(&self) -> Coalescing {
        self.coalescing
    }

    #[must_use]
    pub const fn invalid_free(&self) -> InvalidFree {
        self.invalid_free
    }

    #[must_use]
    pub const fn min_growth(&self) -> usize {
        self.min_growth
    }
}

/// Configuration of a page pool.
///
/// Fill bytes overwrite a whole page so that stale references read junk
/// instead of plausible data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    free_fill: Option<u8>,
    alloc_fill: Option<u8>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl PoolConfig {
    pub const DEFAULT_FREE_FILL: u8 = 0x01;
    pub const DEFAULT_ALLOC_FILL: u8 = 0x05;

    #[must_use]
    pub const fn new() -> Self {
        Self {
            free_fill: Some(Self::DEFAULT_FREE_FILL),
            alloc_fill: Some(Self::DEFAULT_ALLOC_FILL),
        }
    }

    #[must_use]
    pub const fn with_free_fill(mut self, fill: Option<u8>) -> Self {
        self.free_fill = fill;
        self
    }

    #[must_use]
    pub const fn with_alloc_fill(mut self, fill: Option<u8>) -> Self {
        self.alloc_fill = fill;
        self
    }

    #[must_use]
    pub const fn free_fill(&self) -> Option<u8> {
        self.free_fill
    }

    #[must_use]
    pub const fn alloc_fill(&self) -> Option<u8> {
        self.alloc_fill
    }
}
