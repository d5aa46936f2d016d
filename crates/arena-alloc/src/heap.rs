//! Lock-guarded free-list heap.
//!
//! Every operation takes the heap's spin lock for the duration of one chain
//! walk and releases it on every exit path, so operations on one heap are
//! linearizable. Diagnostic reads take the same lock, so they never observe a
//! region mid-split or mid-merge.
//!
//! Nothing allocates or logs while the lock is held. The engine records what
//! an operation did and the events are logged after the guard is dropped, so
//! the heap stays usable as the global allocator even when the logger itself
//! allocates or inspects the heap.

use core::{
    alloc::{GlobalAlloc, Layout},
    ptr::{self, NonNull},
};

use arrayvec::ArrayVec;
use snafu::ensure;
use spin::Mutex;

use crate::{
    config::HeapConfig,
    error::{
        AlreadyInitializedSnafu, CorruptionError, FreeError, InitError, NotInitializedSnafu,
        SnapshotError,
    },
    free_list::{self, Events, FreeListHeap},
    grow::{Grow, NoGrow},
    region::{ALIGNMENT, Allocation, HeapStats, RegionId, RegionInfo},
};

/// A [`FreeListHeap`] behind a spin lock, initialised once.
///
/// Until [`init`](Self::init) runs the heap behaves like an empty arena:
/// allocations fail and frees are rejected.
pub struct LockedHeap<G = NoGrow> {
    config: HeapConfig,
    inner: Mutex<Option<FreeListHeap<G>>>,
}

impl<G> LockedHeap<G> {
    #[must_use]
    pub const fn new(config: HeapConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(None),
        }
    }
}

impl LockedHeap<NoGrow> {
    /// Hands the arena `start..start + size` to the heap.
    ///
    /// Initialising twice is a precondition violation and is reported as
    /// [`InitError::AlreadyInitialized`]; the first arena stays in use.
    ///
    /// # Safety
    ///
    /// Same requirements as [`FreeListHeap::new`].
    pub unsafe fn init(&self, start: *mut u8, size: usize) -> Result<(), InitError> {
        unsafe { self.init_with_grow(start, size, NoGrow) }
    }
}

impl<G> LockedHeap<G>
where
    G: Grow,
{
    /// Hands the arena to the heap together with a growth source.
    ///
    /// # Safety
    ///
    /// Same requirements as [`FreeListHeap::with_grow`].
    pub unsafe fn init_with_grow(
        &self,
        start: *mut u8,
        size: usize,
        grow: G,
    ) -> Result<(), InitError> {
        let range = {
            let mut inner = self.inner.lock();
            ensure!(inner.is_none(), AlreadyInitializedSnafu);
            let heap = unsafe { FreeListHeap::create(start, size, self.config, grow)? };
            inner.insert(heap).arena_range()
        };
        free_list::log_init(range, &self.config);
        Ok(())
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.inner.lock().is_some()
    }

    #[must_use]
    pub fn config(&self) -> &HeapConfig {
        &self.config
    }

    /// See [`FreeListHeap::allocate`].
    pub fn allocate(&self, size: usize) -> Option<Allocation> {
        let mut events = Events::new();
        let allocation = self.inner.lock().as_mut()?.allocate_recorded(size, &mut events);
        events.emit();
        allocation
    }

    /// See [`FreeListHeap::free`].
    #[track_caller]
    pub fn free(&self, ptr: NonNull<u8>) -> Result<(), FreeError> {
        let mut events = Events::new();
        let result = match self.inner.lock().as_mut() {
            Some(heap) => heap.free_recorded(ptr, &mut events),
            None => NotInitializedSnafu.fail(),
        };
        self.finish_free(&events, result)
    }

    /// See [`FreeListHeap::free_by_id`].
    #[track_caller]
    pub fn free_by_id(&self, id: RegionId) -> Result<(), FreeError> {
        let mut events = Events::new();
        let result = match self.inner.lock().as_mut() {
            Some(heap) => heap.free_by_id_recorded(id, &mut events),
            None => NotInitializedSnafu.fail(),
        };
        self.finish_free(&events, result)
    }

    /// Logs a free and applies the invalid-free policy. Runs unlocked.
    #[track_caller]
    fn finish_free(&self, events: &Events, result: Result<(), FreeError>) -> Result<(), FreeError> {
        events.emit();
        match result {
            Ok(()) => Ok(()),
            Err(err) => free_list::reject(self.config.invalid_free(), err),
        }
    }

    /// See [`FreeListHeap::dump_state`]. Empty before initialisation.
    pub fn dump_state<const N: usize>(&self) -> Result<ArrayVec<RegionInfo, N>, SnapshotError> {
        match self.inner.lock().as_ref() {
            Some(heap) => heap.dump_state(),
            None => Ok(ArrayVec::new()),
        }
    }

    /// See [`FreeListHeap::for_each_region`].
    ///
    /// `f` runs with the lock held and must not call back into this heap.
    pub fn for_each_region<F>(&self, f: F)
    where
        F: FnMut(RegionInfo),
    {
        if let Some(heap) = self.inner.lock().as_ref() {
            heap.for_each_region(f);
        }
    }

    #[must_use]
    pub fn stats(&self) -> HeapStats {
        self.inner
            .lock()
            .as_ref()
            .map(FreeListHeap::stats)
            .unwrap_or_default()
    }

    pub fn validate(&self) -> Result<(), CorruptionError> {
        self.inner
            .lock()
            .as_ref()
            .map_or(Ok(()), FreeListHeap::validate)
    }
}

unsafe impl<G> GlobalAlloc for LockedHeap<G>
where
    G: Grow + Send,
{
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > ALIGNMENT {
            return ptr::null_mut();
        }
        self.allocate(layout.size())
            .map_or(ptr::null_mut(), |allocation| allocation.ptr.as_ptr())
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        if let Some(ptr) = NonNull::new(ptr) {
            // Rejections are already logged; `dealloc` has no way to report them.
            let _ = self.free(ptr);
        }
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread};

    use super::*;
    use crate::{
        config::{Coalescing, HandleMode, InvalidFree},
        region::HEADER_SIZE,
    };

    /// Backing memory that outlives the heap using it.
    struct TestArena {
        start: *mut u8,
        layout: Layout,
    }

    unsafe impl Send for TestArena {}
    unsafe impl Sync for TestArena {}

    impl TestArena {
        fn new(size: usize) -> Self {
            let layout = Layout::from_size_align(size, 16).unwrap();
            let start = unsafe { std::alloc::alloc(layout) };
            unsafe {
                start.write_bytes(0x11, size);
            }
            Self { start, layout }
        }
    }

    impl Drop for TestArena {
        fn drop(&mut self) {
            unsafe { std::alloc::dealloc(self.start, self.layout) };
        }
    }

    fn with_test_allocator<F>(size: usize, config: HeapConfig, test_fn: F)
    where
        F: FnOnce(&LockedHeap),
    {
        let arena = TestArena::new(size);
        let heap = LockedHeap::new(config);
        unsafe { heap.init(arena.start, size).unwrap() };
        test_fn(&heap);
        drop(heap);
        drop(arena);
    }

    #[test]
    fn test_uninitialized_heap() {
        let heap: LockedHeap = LockedHeap::new(HeapConfig::new());
        assert!(!heap.is_initialized());
        assert!(heap.allocate(16).is_none());
        assert!(matches!(
            heap.free(NonNull::dangling()),
            Err(FreeError::NotInitialized { .. })
        ));
        assert!(heap.dump_state::<4>().unwrap().is_empty());
        assert_eq!(heap.stats(), HeapStats::default());
        heap.validate().unwrap();
    }

    #[test]
    fn test_double_init_is_refused() {
        let arena = TestArena::new(1024);
        let heap: LockedHeap = LockedHeap::new(HeapConfig::new());
        unsafe {
            heap.init(arena.start, 512).unwrap();
            let err = heap.init(arena.start.add(512), 512).unwrap_err();
            assert!(matches!(err, InitError::AlreadyInitialized { .. }));
        }
        assert_eq!(heap.stats().arena_size, 512);
    }

    #[test]
    fn test_allocate_and_free() {
        with_test_allocator(1024, HeapConfig::new(), |heap| {
            let allocation = heap.allocate(100).unwrap();
            let regions = heap.dump_state::<4>().unwrap();
            assert_eq!(regions.len(), 2);
            assert_eq!(regions[0].addr, allocation.ptr.addr().get());
            assert!(!regions[0].free);

            heap.free(allocation.ptr).unwrap();
            let regions = heap.dump_state::<4>().unwrap();
            assert_eq!(regions.len(), 1);
            assert_eq!(regions[0].size, 1024 - HEADER_SIZE);
        });
    }

    #[test]
    fn test_free_by_id() {
        let config = HeapConfig::new().with_handles(HandleMode::Identifier);
        with_test_allocator(1024, config, |heap| {
            let first = heap.allocate(32).unwrap();
            let second = heap.allocate(32).unwrap();
            heap.free_by_id(second.id.unwrap()).unwrap();
            heap.free_by_id(first.id.unwrap()).unwrap();
            assert!(matches!(
                heap.free_by_id(RegionId::SENTINEL),
                Err(FreeError::ReservedId { .. })
            ));
            assert_eq!(heap.stats().regions, 1);
        });
    }

    #[test]
    fn test_for_each_region_matches_dump() {
        with_test_allocator(2048, HeapConfig::new(), |heap| {
            let _a = heap.allocate(10).unwrap();
            let b = heap.allocate(20).unwrap();
            let _c = heap.allocate(30).unwrap();
            heap.free(b.ptr).unwrap();

            let mut visited = Vec::new();
            heap.for_each_region(|region| visited.push(region));
            assert_eq!(visited.as_slice(), heap.dump_state::<8>().unwrap().as_slice());
        });
    }

    #[test]
    fn test_global_alloc() {
        with_test_allocator(1024, HeapConfig::new(), |heap| unsafe {
            let layout = Layout::from_size_align(64, 8).unwrap();
            let ptr = heap.alloc(layout);
            assert!(!ptr.is_null());
            ptr.write_bytes(0x33, layout.size());
            heap.dealloc(ptr, layout);

            let aligned = Layout::from_size_align(64, 64).unwrap();
            assert!(heap.alloc(aligned).is_null());

            let huge = Layout::from_size_align(4096, 8).unwrap();
            assert!(heap.alloc(huge).is_null());
            assert_eq!(heap.stats().regions, 1);
        });
    }

    #[test]
    #[should_panic = "critical allocator error"]
    fn test_abort_policy_on_uninitialized_heap() {
        let heap: LockedHeap = LockedHeap::new(HeapConfig::new().with_invalid_free(InvalidFree::Abort));
        let _ = heap.free(NonNull::dangling());
    }

    #[test]
    fn test_concurrent_allocations() {
        for coalescing in [Coalescing::Sweep, Coalescing::Neighbors] {
            let arena = TestArena::new(64 * 1024);
            let heap = Arc::new(LockedHeap::new(
                HeapConfig::new().with_coalescing(coalescing),
            ));
            unsafe { heap.init(arena.start, 64 * 1024).unwrap() };

            let handles = (0..4_u8)
                .map(|tag| {
                    let heap = Arc::clone(&heap);
                    thread::spawn(move || {
                        for round in 0..200 {
                            let size = 16 + usize::from(tag) * 8 + round % 64;
                            let Some(allocation) = heap.allocate(size) else {
                                continue;
                            };
                            let ptr = allocation.ptr;
                            unsafe {
                                ptr.write_bytes(tag, size);
                                thread::yield_now();
                                for i in 0..size {
                                    assert_eq!(ptr.add(i).read(), tag);
                                }
                            }
                            heap.free(ptr).unwrap();
                        }
                    })
                })
                .collect::<Vec<_>>();
            for handle in handles {
                handle.join().unwrap();
            }

            heap.validate().unwrap();
            let regions = heap.dump_state::<4>().unwrap();
            assert_eq!(regions.len(), 1);
            assert!(regions[0].free);
            assert_eq!(regions[0].size, 64 * 1024 - HEADER_SIZE);
        }
    }
}
