//! Pool of uniform, page-sized units.
//!
//! Free pages form a LIFO stack threaded through the pages themselves: the
//! first word of a free page holds the offset of the next free page. The
//! pool never splits or merges, so there is no header per page.
//!
//! Unlike the byte heaps, the pool treats a bad page address as fatal. A page
//! that is misaligned or outside the pool can only come from a corrupted
//! caller, and pushing it would hand the same memory out twice.

use core::{ops::Range, ptr::NonNull};

use log::{info, trace};
use snafu::ensure;
use spin::{Mutex, Once};

use crate::{
    arena::Arena,
    config::PoolConfig,
    error::{
        self, AlreadyInitializedSnafu, BrokenPageLinkSnafu, InitError, PageDoubleFreeSnafu,
        PageOutOfRangeSnafu, UnalignedPageSnafu,
    },
    region::NIL,
};

/// Size and alignment of a pool page.
pub const PAGE_SIZE: usize = 4096;

/// A lock-guarded stack of free pages.
pub struct PagePool {
    config: PoolConfig,
    bounds: Once<Range<usize>>,
    inner: Mutex<Option<FreePages>>,
}

#[derive(Debug)]
struct FreePages {
    arena: Arena,
    head: usize,
    free: usize,
    total: usize,
}

unsafe impl Send for FreePages {}

impl FreePages {
    fn is_page(&self, offset: usize) -> bool {
        offset < self.arena.len() && offset.is_multiple_of(PAGE_SIZE)
    }

    fn push(&mut self, offset: usize) {
        if offset == self.head {
            error::fatal(
                PageDoubleFreeSnafu {
                    addr: self.arena.start_addr() + offset,
                }
                .build(),
            );
        }
        self.arena.set_link(offset, self.head);
        self.head = offset;
        self.free += 1;
    }

    fn pop(&mut self) -> Option<NonNull<u8>> {
        if self.head == NIL {
            return None;
        }
        let offset = self.head;
        let next = self.arena.link(offset);
        if next != NIL && !self.is_page(next) {
            error::fatal(BrokenPageLinkSnafu { link: next }.build());
        }
        self.head = next;
        self.free -= 1;
        Some(self.arena.ptr_at(offset))
    }
}

impl PagePool {
    #[must_use]
    pub const fn new(config: PoolConfig) -> Self {
        Self {
            config,
            bounds: Once::new(),
            inner: Mutex::new(None),
        }
    }

    /// Hands every whole page in `start..end` to the pool.
    ///
    /// `start` is rounded up to a page boundary. Pages are pushed in
    /// ascending address order, so the first [`page_alloc`](Self::page_alloc)
    /// returns the highest page.
    ///
    /// # Safety
    ///
    /// The caller must ensure that:
    ///
    /// - The memory range is valid for reads and writes
    /// - The memory range is not used by anything else
    /// - The memory range outlives the pool
    pub unsafe fn init(&self, start: *mut u8, end: *mut u8) -> Result<(), InitError> {
        let (bounds, total) = {
            let mut inner = self.inner.lock();
            ensure!(inner.is_none(), AlreadyInitializedSnafu);

            let size = end.addr().saturating_sub(start.addr());
            let arena = unsafe { Arena::carve(start, size, PAGE_SIZE, PAGE_SIZE, PAGE_SIZE)? };
            let total = arena.len() / PAGE_SIZE;
            let bounds = arena.start_addr()..arena.end_addr();
            let mut pages = FreePages {
                arena,
                head: NIL,
                free: 0,
                total,
            };
            for offset in (0..pages.arena.len()).step_by(PAGE_SIZE) {
                if let Some(fill) = self.config.free_fill() {
                    unsafe {
                        pages.arena.ptr_at(offset).write_bytes(fill, PAGE_SIZE);
                    }
                }
                pages.push(offset);
            }
            *inner = Some(pages);
            self.bounds.call_once(|| bounds.clone());
            (bounds, total)
        };
        info!(
            "page pool at {:#x}..{:#x} ({total} pages)",
            bounds.start, bounds.end
        );
        Ok(())
    }

    /// Takes the most recently freed page, or `None` if the pool is empty.
    pub fn page_alloc(&self) -> Option<NonNull<u8>> {
        let page = self.inner.lock().as_mut()?.pop()?;
        if let Some(fill) = self.config.alloc_fill() {
            unsafe {
                page.write_bytes(fill, PAGE_SIZE);
            }
        }
        trace!("page alloc {:#x}", page.addr());
        Some(page)
    }

    /// Returns a page to the pool.
    ///
    /// # Panics
    ///
    /// Panics through the fatal error path if `page` is not page-aligned,
    /// lies outside the pool, or is the page most recently freed.
    ///
    /// # Safety
    ///
    /// `page` must have come from [`page_alloc`](Self::page_alloc) on this
    /// pool and must not be used after this call.
    #[track_caller]
    pub unsafe fn page_free(&self, page: NonNull<u8>) {
        let addr = page.addr().get();
        let bounds = self.bounds.get().cloned().unwrap_or(0..0);
        if !addr.is_multiple_of(PAGE_SIZE) {
            error::fatal(
                UnalignedPageSnafu {
                    addr,
                    align: PAGE_SIZE,
                }
                .build(),
            );
        }
        if !bounds.contains(&addr) {
            error::fatal(
                PageOutOfRangeSnafu {
                    addr,
                    start: bounds.start,
                    end: bounds.end,
                }
                .build(),
            );
        }

        if let Some(fill) = self.config.free_fill() {
            unsafe {
                page.write_bytes(fill, PAGE_SIZE);
            }
        }

        {
            let mut inner = self.inner.lock();
            let Some(pages) = inner.as_mut() else {
                unreachable!("page pool bounds are published after initialization");
            };
            pages.push(addr - bounds.start);
        }
        trace!("page free {addr:#x}");
    }

    /// Number of pages currently on the free stack.
    #[must_use]
    pub fn free_pages(&self) -> usize {
        self.inner.lock().as_ref().map_or(0, |pages| pages.free)
    }

    /// Number of pages the pool manages.
    #[must_use]
    pub fn total_pages(&self) -> usize {
        self.inner.lock().as_ref().map_or(0, |pages| pages.total)
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use core::alloc::Layout;
    use std::{sync::Arc, thread};

    use super::*;

    fn with_test_pages<F>(pages: usize, test_fn: F)
    where
        F: FnOnce(*mut u8, *mut u8),
    {
        unsafe {
            let layout = Layout::from_size_align(pages * PAGE_SIZE, PAGE_SIZE).unwrap();
            let start = std::alloc::alloc(layout);
            start.write_bytes(0x11, layout.size());
            test_fn(start, start.add(layout.size()));
            std::alloc::dealloc(start, layout);
        }
    }

    fn with_test_pool<F>(pages: usize, config: PoolConfig, test_fn: F)
    where
        F: FnOnce(&PagePool, *mut u8),
    {
        with_test_pages(pages, |start, end| unsafe {
            let pool = PagePool::new(config);
            pool.init(start, end).unwrap();
            test_fn(&pool, start);
        });
    }

    fn assert_filled(page: NonNull<u8>, range: Range<usize>, byte: u8) {
        for i in range {
            assert_eq!(unsafe { page.add(i).read() }, byte, "byte {i}");
        }
    }

    #[test]
    fn test_init_pushes_every_page() {
        with_test_pool(4, PoolConfig::new(), |pool, start| {
            assert_eq!(pool.total_pages(), 4);
            assert_eq!(pool.free_pages(), 4);

            // Ascending pushes put the highest page on top.
            let page = pool.page_alloc().unwrap();
            assert_eq!(page.as_ptr(), start.wrapping_add(3 * PAGE_SIZE));
            assert_eq!(pool.free_pages(), 3);
        });
    }

    #[test]
    fn test_init_rounds_start_up() {
        with_test_pages(4, |start, end| unsafe {
            let pool = PagePool::new(PoolConfig::new());
            pool.init(start.add(100), end).unwrap();
            assert_eq!(pool.total_pages(), 3);

            let mut lowest = None;
            while let Some(page) = pool.page_alloc() {
                lowest = Some(page);
            }
            assert_eq!(lowest.unwrap().as_ptr(), start.add(PAGE_SIZE));
        });
    }

    #[test]
    fn test_init_errors() {
        with_test_pages(2, |start, end| unsafe {
            let pool = PagePool::new(PoolConfig::new());
            assert!(matches!(
                pool.init(start, start.add(PAGE_SIZE - 1)),
                Err(InitError::ArenaTooSmall { .. })
            ));
            assert!(matches!(
                pool.init(end, start),
                Err(InitError::ArenaTooSmall { .. })
            ));
            pool.init(start, end).unwrap();
            assert!(matches!(
                pool.init(start, end),
                Err(InitError::AlreadyInitialized { .. })
            ));
        });
    }

    #[test]
    fn test_uninitialized_pool_is_empty() {
        let pool = PagePool::new(PoolConfig::new());
        assert!(pool.page_alloc().is_none());
        assert_eq!(pool.free_pages(), 0);
        assert_eq!(pool.total_pages(), 0);
    }

    #[test]
    fn test_lifo_order() {
        with_test_pool(4, PoolConfig::new(), |pool, _| unsafe {
            let a = pool.page_alloc().unwrap();
            let b = pool.page_alloc().unwrap();
            let c = pool.page_alloc().unwrap();

            pool.page_free(a);
            pool.page_free(c);
            pool.page_free(b);
            assert_eq!(pool.page_alloc(), Some(b));
            assert_eq!(pool.page_alloc(), Some(c));

            pool.page_free(b);
            assert_eq!(pool.page_alloc(), Some(b));
            assert_eq!(pool.page_alloc(), Some(a));
        });
    }

    #[test]
    fn test_exhaustion() {
        with_test_pool(3, PoolConfig::new(), |pool, _| unsafe {
            let pages = [
                pool.page_alloc().unwrap(),
                pool.page_alloc().unwrap(),
                pool.page_alloc().unwrap(),
            ];
            assert!(pool.page_alloc().is_none());
            assert_eq!(pool.free_pages(), 0);

            for page in pages {
                pool.page_free(page);
            }
            assert_eq!(pool.free_pages(), 3);
        });
    }

    #[test]
    fn test_fill_patterns() {
        with_test_pool(2, PoolConfig::new(), |pool, _| unsafe {
            let page = pool.page_alloc().unwrap();
            assert_filled(page, 0..PAGE_SIZE, PoolConfig::DEFAULT_ALLOC_FILL);

            page.write_bytes(0x33, PAGE_SIZE);
            pool.page_free(page);
            // The first word holds the stack link.
            assert_filled(
                page,
                size_of::<usize>()..PAGE_SIZE,
                PoolConfig::DEFAULT_FREE_FILL,
            );
        });
    }

    #[test]
    fn test_fills_disabled() {
        let config = PoolConfig::new().with_free_fill(None).with_alloc_fill(None);
        with_test_pool(2, config, |pool, _| unsafe {
            let page = pool.page_alloc().unwrap();
            assert_filled(page, size_of::<usize>()..PAGE_SIZE, 0x11);

            page.write_bytes(0x33, PAGE_SIZE);
            pool.page_free(page);
            let page = pool.page_alloc().unwrap();
            assert_filled(page, size_of::<usize>()..PAGE_SIZE, 0x33);
        });
    }

    #[test]
    #[should_panic = "critical allocator error"]
    fn test_free_out_of_range_is_fatal() {
        with_test_pool(2, PoolConfig::new(), |pool, start| unsafe {
            let outside = NonNull::new(start.add(2 * PAGE_SIZE)).unwrap();
            pool.page_free(outside);
        });
    }

    #[test]
    #[should_panic = "critical allocator error"]
    fn test_free_misaligned_is_fatal() {
        with_test_pool(2, PoolConfig::new(), |pool, _| unsafe {
            let page = pool.page_alloc().unwrap();
            pool.page_free(page.add(8));
        });
    }

    #[test]
    #[should_panic = "critical allocator error"]
    fn test_free_on_uninitialized_pool_is_fatal() {
        with_test_pages(1, |start, _| unsafe {
            let pool = PagePool::new(PoolConfig::new());
            pool.page_free(NonNull::new(start).unwrap());
        });
    }

    #[test]
    #[should_panic = "critical allocator error"]
    fn test_immediate_double_free_is_fatal() {
        with_test_pool(2, PoolConfig::new(), |pool, _| unsafe {
            let page = pool.page_alloc().unwrap();
            pool.page_free(page);
            pool.page_free(page);
        });
    }

    #[test]
    fn test_concurrent_pages() {
        with_test_pages(16, |start, end| unsafe {
            let pool = Arc::new(PagePool::new(PoolConfig::new()));
            pool.init(start, end).unwrap();

            let handles = (0..4_u8)
                .map(|tag| {
                    let pool = Arc::clone(&pool);
                    thread::spawn(move || {
                        for _ in 0..100 {
                            let Some(page) = pool.page_alloc() else {
                                continue;
                            };
                            page.write_bytes(tag, PAGE_SIZE);
                            thread::yield_now();
                            assert_filled(page, 0..PAGE_SIZE, tag);
                            pool.page_free(page);
                        }
                    })
                })
                .collect::<Vec<_>>();
            for handle in handles {
                handle.join().unwrap();
            }
            assert_eq!(pool.free_pages(), 16);
        });
    }
}
