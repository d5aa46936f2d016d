//! Bump-pointer arena.
//!
//! The lowest-capability allocator in the crate: a cursor advances through a
//! fixed arena and never moves back. [`BumpArena::free`] accepts any pointer
//! and does nothing, so memory is only reclaimed by dropping the arena as a
//! whole. It suits boot-time allocations that live forever.

use core::ptr::NonNull;

use log::{debug, info, trace};
use snafu::ensure;
use spin::Mutex;

use crate::{
    arena::Arena,
    error::{AlreadyInitializedSnafu, InitError},
    region::ALIGNMENT,
};

/// A lock-guarded bump allocator over one arena.
pub struct BumpArena {
    inner: Mutex<Option<Bump>>,
}

#[derive(Debug)]
struct Bump {
    arena: Arena,
    cursor: usize,
}

unsafe impl Send for Bump {}

impl Default for BumpArena {
    fn default() -> Self {
        Self::new()
    }
}

impl BumpArena {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(None),
        }
    }

    /// Hands `start..end` to the arena.
    ///
    /// `start` is rounded up to [`ALIGNMENT`] and the length down to a
    /// multiple of it.
    ///
    /// # Safety
    ///
    /// The caller must ensure that:
    ///
    /// - The memory range is valid for reads and writes
    /// - The memory range is not used by anything else
    /// - The memory range outlives the arena
    pub unsafe fn init(&self, start: *mut u8, end: *mut u8) -> Result<(), InitError> {
        let bounds = {
            let mut inner = self.inner.lock();
            ensure!(inner.is_none(), AlreadyInitializedSnafu);

            let size = end.addr().saturating_sub(start.addr());
            let arena = unsafe { Arena::carve(start, size, ALIGNMENT, ALIGNMENT, ALIGNMENT)? };
            let bounds = arena.start_addr()..arena.end_addr();
            *inner = Some(Bump { arena, cursor: 0 });
            bounds
        };
        info!(
            "bump arena at {:#x}..{:#x} ({} bytes)",
            bounds.start,
            bounds.end,
            bounds.len(),
        );
        Ok(())
    }

    /// Hands out the next `size` bytes.
    ///
    /// Returns `None` for a zero-byte request, before initialisation, and
    /// when the request would cross the arena end.
    pub fn allocate(&self, size: usize) -> Option<NonNull<u8>> {
        if size == 0 {
            return None;
        }
        let taken = {
            let mut inner = self.inner.lock();
            let bump = inner.as_mut()?;
            match size
                .checked_next_multiple_of(ALIGNMENT)
                .and_then(|size| bump.cursor.checked_add(size))
                .filter(|end| *end <= bump.arena.len())
            {
                Some(end) => {
                    let ptr = bump.arena.ptr_at(bump.cursor);
                    bump.cursor = end;
                    Ok(ptr)
                }
                None => Err(bump.arena.len() - bump.cursor),
            }
        };

        match taken {
            Ok(ptr) => {
                trace!("bump alloc {size} bytes at {:#x}", ptr.addr());
                Some(ptr)
            }
            Err(left) => {
                debug!("bump arena exhausted: {size} bytes requested, {left} left");
                None
            }
        }
    }

    /// Accepts a pointer back without reclaiming it.
    pub fn free(&self, ptr: NonNull<u8>) {
        trace!("bump free {:#x} ignored", ptr.addr());
    }

    /// Bytes left between the cursor and the arena end.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.inner
            .lock()
            .as_ref()
            .map_or(0, |bump| bump.arena.len() - bump.cursor)
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use core::alloc::Layout;

    use super::*;

    fn with_test_arena<F>(size: usize, test_fn: F)
    where
        F: FnOnce(&BumpArena, *mut u8),
    {
        unsafe {
            let layout = Layout::from_size_align(size, 16).unwrap();
            let start = std::alloc::alloc(layout);
            start.write_bytes(0x11, size);
            let arena = BumpArena::new();
            arena.init(start, start.add(size)).unwrap();
            test_fn(&arena, start);
            std::alloc::dealloc(start, layout);
        }
    }

    #[test]
    fn test_allocations_advance() {
        with_test_arena(8192, |arena, start| {
            let p1 = arena.allocate(1024).unwrap();
            let p2 = arena.allocate(2048).unwrap();
            assert_eq!(p1.as_ptr(), start);
            assert_eq!(p2.as_ptr(), start.wrapping_add(1024));
            assert_eq!(arena.remaining(), 8192 - 3072);
        });
    }

    #[test]
    fn test_free_does_not_reclaim() {
        with_test_arena(8192, |arena, start| {
            let p1 = arena.allocate(1024).unwrap();
            arena.free(p1);
            let p2 = arena.allocate(1024).unwrap();
            assert_eq!(p2.as_ptr(), start.wrapping_add(1024));
        });
    }

    #[test]
    fn test_requests_stay_aligned() {
        with_test_arena(256, |arena, _| {
            let p1 = arena.allocate(3).unwrap();
            let p2 = arena.allocate(13).unwrap();
            assert_eq!(p2.addr().get() - p1.addr().get(), ALIGNMENT);
            assert!(p2.addr().get().is_multiple_of(ALIGNMENT));
            assert_eq!(arena.remaining(), 256 - 24);
        });
    }

    #[test]
    fn test_zero_and_oversized_requests() {
        with_test_arena(256, |arena, _| {
            assert!(arena.allocate(0).is_none());
            assert!(arena.allocate(257).is_none());
            assert!(arena.allocate(usize::MAX).is_none());
            assert_eq!(arena.remaining(), 256);

            assert!(arena.allocate(256).is_some());
            assert!(arena.allocate(1).is_none());
            assert_eq!(arena.remaining(), 0);
        });
    }

    #[test]
    fn test_init_errors() {
        with_test_arena(64, |arena, start| unsafe {
            assert!(matches!(
                arena.init(start, start.add(64)),
                Err(InitError::AlreadyInitialized { .. })
            ));
            let fresh = BumpArena::new();
            assert!(matches!(
                fresh.init(start, start.add(4)),
                Err(InitError::ArenaTooSmall { .. })
            ));
        });
    }

    #[test]
    fn test_uninitialized_arena() {
        let arena = BumpArena::new();
        assert!(arena.allocate(8).is_none());
        assert_eq!(arena.remaining(), 0);
    }
}
