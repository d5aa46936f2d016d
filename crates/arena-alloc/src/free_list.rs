//! First-fit free-list engine.
//!
//! The engine manages a single arena as an address-ordered chain of regions
//! that exactly tiles it. Each region starts with a header recording its
//! usable size, whether it is free, the offset of the next region and, in
//! identifier mode, the id of the allocation occupying it.
//!
//! # Algorithm
//!
//! - **Allocation**: walk the chain from the head and take the *first* free
//!   region large enough for the request (rounded up to [`ALIGNMENT`]). First
//!   fit keeps the common case short at the cost of some fragmentation; it
//!   is deliberately not best fit, so allocation order stays predictable.
//! - **Splitting**: if the chosen region could also hold another header plus
//!   one alignment unit, its tail becomes a new free region. Otherwise the
//!   whole region is handed out and the slack is accepted.
//! - **Freeing**: the handle is resolved by walking the chain, which rejects
//!   unknown pointers, unknown ids and double frees without touching the
//!   arena.
//! - **Coalescing**: after every free, adjacent free regions are merged,
//!   either by a sweep over the whole chain ([`Coalescing::Sweep`]) or with
//!   the freed region's two neighbours ([`Coalescing::Neighbors`]). Either
//!   way no two adjacent regions are free once a free returns.
//! - **Growth**: with a [`Grow`] source attached, a failed first-fit asks the
//!   source for more space contiguous with the arena end and retries.
//!
//! # Invariants
//!
//! - `Σ(size + HEADER_SIZE)` over the chain equals the arena size.
//! - No two adjacent regions are free after any operation returns.
//! - A used region's size never changes.
//! - Free regions carry [`RegionId::SENTINEL`].
//!
//! [`validate`](FreeListHeap::validate) checks all of these.
//!
//! # Logging
//!
//! Chain operations never log. They record what they did as events, and the
//! events are logged after the operation returns: by the public methods here,
//! or by [`LockedHeap`](crate::LockedHeap) once its lock is released. A logger
//! may therefore allocate from the heap it is observing.

use core::{ops::Range, ptr::NonNull};

use arrayvec::ArrayVec;
use log::{debug, info, trace, warn};
use snafu::{OptionExt as _, ensure};

use crate::{
    arena::Arena,
    config::{Coalescing, HandleMode, HeapConfig, InvalidFree},
    error::{
        self, AdjacentFreeSnafu, CorruptionError, DoubleFreeSnafu, FreeError,
        FreeRegionWithIdSnafu, IdentifiersDisabledSnafu, InitError, ReservedIdSnafu,
        SnapshotError, TooManyRegionsSnafu, UnknownIdSnafu, UnknownPointerSnafu,
    },
    grow::{Grow, NoGrow},
    region::{
        ALIGNMENT, Allocation, HEADER_SIZE, HeapStats, NIL, RegionHeader, RegionId, RegionInfo,
        aligned_request,
    },
};

/// Smallest arena that can hold one region.
pub const MIN_ARENA_SIZE: usize = HEADER_SIZE + ALIGNMENT;

/// The chain always starts at the beginning of the arena.
const HEAD: usize = 0;

/// Something a chain operation did, logged once no lock is held.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Event {
    Overflow {
        size: usize,
    },
    Exhausted {
        size: usize,
    },
    GrowthRefused {
        increment: usize,
    },
    GrowthDropped {
        addr: usize,
        arena_end: usize,
    },
    Grew {
        increment: usize,
        arena_size: usize,
    },
    Split {
        offset: usize,
        used: usize,
        rest: usize,
        rest_size: usize,
    },
    Allocated {
        addr: usize,
        size: usize,
        id: RegionId,
    },
    Freed {
        offset: usize,
        size: usize,
        id: RegionId,
        merged: usize,
    },
}

impl Event {
    fn emit(self) {
        match self {
            Self::Overflow { size } => debug!("allocation of {size} bytes overflows"),
            Self::Exhausted { size } => {
                debug!("heap exhausted: no free region holds {size} bytes");
            }
            Self::GrowthRefused { increment } => {
                debug!("growth source refused {increment} bytes");
            }
            Self::GrowthDropped { addr, arena_end } => warn!(
                "growth source returned {addr:#x} but the arena ends at {arena_end:#x}; \
                 extension dropped"
            ),
            Self::Grew {
                increment,
                arena_size,
            } => debug!("arena grew by {increment} bytes to {arena_size}"),
            Self::Split {
                offset,
                used,
                rest,
                rest_size,
            } => trace!(
                "split region {offset:#x}: {used} bytes used, {rest_size} bytes free at {rest:#x}"
            ),
            Self::Allocated { addr, size, id } => {
                trace!("allocated {size} bytes at {addr:#x} ({id})");
            }
            Self::Freed {
                offset,
                size,
                id,
                merged,
            } => trace!("freed {size} bytes at region {offset:#x} ({id}), {merged} merges"),
        }
    }
}

/// Events of one operation.
///
/// An allocation records at most a growth event, a split and its outcome.
#[derive(Debug, Default)]
pub(crate) struct Events(ArrayVec<Event, 4>);

impl Events {
    pub(crate) fn new() -> Self {
        Self(ArrayVec::new())
    }

    fn record(&mut self, event: Event) {
        self.0.push(event);
    }

    /// Logs the recorded events. Must not be called with a heap lock held.
    pub(crate) fn emit(&self) {
        for event in &self.0 {
            event.emit();
        }
    }

    #[cfg(test)]
    pub(crate) fn as_slice(&self) -> &[Event] {
        &self.0
    }
}

/// A free-list heap over one arena.
///
/// The heap is `Send` but not `Sync`; wrap it in a lock (see
/// [`LockedHeap`](crate::LockedHeap)) to share it between threads.
#[derive(Debug)]
pub struct FreeListHeap<G = NoGrow> {
    arena: Arena,
    config: HeapConfig,
    next_id: RegionId,
    grow: G,
}

unsafe impl<G> Send for FreeListHeap<G> where G: Send {}

/// A region found by walking the chain, together with its predecessor.
#[derive(Debug, Clone, Copy)]
struct Located {
    prev: Option<usize>,
    offset: usize,
    header: RegionHeader,
}

struct Regions<'a> {
    arena: &'a Arena,
    next: usize,
}

impl Iterator for Regions<'_> {
    type Item = (usize, RegionHeader);

    fn next(&mut self) -> Option<Self::Item> {
        if self.next == NIL {
            return None;
        }
        let offset = self.next;
        let header = self.arena.header(offset);
        self.next = header.next;
        Some((offset, header))
    }
}

impl FreeListHeap<NoGrow> {
    /// Creates a heap whose arena is `start..start + size` and never grows.
    ///
    /// The chain starts out as one free region covering the arena. The start
    /// is rounded up to [`ALIGNMENT`] and the size down to a multiple of it.
    ///
    /// # Safety
    ///
    /// The caller must ensure that:
    ///
    /// - The memory range is valid for reads and writes
    /// - The memory range is not used by anything else
    /// - The memory range outlives the heap
    pub unsafe fn new(start: *mut u8, size: usize, config: HeapConfig) -> Result<Self, InitError> {
        unsafe { Self::with_grow(start, size, config, NoGrow) }
    }
}

impl<G> FreeListHeap<G>
where
    G: Grow,
{
    /// Creates a heap that asks `grow` for more space when it runs out.
    ///
    /// # Safety
    ///
    /// Same requirements as [`FreeListHeap::new`]. In addition, space
    /// returned by `grow` must belong to the same allocation as the arena.
    pub unsafe fn with_grow(
        start: *mut u8,
        size: usize,
        config: HeapConfig,
        grow: G,
    ) -> Result<Self, InitError> {
        let heap = unsafe { Self::create(start, size, config, grow)? };
        log_init(heap.arena_range(), &heap.config);
        Ok(heap)
    }

    /// Builds the heap without logging.
    pub(crate) unsafe fn create(
        start: *mut u8,
        size: usize,
        config: HeapConfig,
        grow: G,
    ) -> Result<Self, InitError> {
        let mut arena = unsafe { Arena::carve(start, size, ALIGNMENT, ALIGNMENT, MIN_ARENA_SIZE)? };
        arena.set_header(HEAD, RegionHeader::free(arena.len() - HEADER_SIZE, NIL));
        Ok(Self {
            arena,
            config,
            next_id: RegionId::FIRST,
            grow,
        })
    }

    /// Address range of the arena.
    pub(crate) fn arena_range(&self) -> Range<usize> {
        self.arena.start_addr()..self.arena.end_addr()
    }

    #[must_use]
    pub fn config(&self) -> &HeapConfig {
        &self.config
    }

    /// Current arena size in bytes, headers included.
    #[must_use]
    pub fn arena_size(&self) -> usize {
        self.arena.len()
    }

    /// Allocates `size` bytes using first fit.
    ///
    /// Returns `None` when no free region is large enough and the growth
    /// source (if any) cannot provide more space. A failed allocation leaves
    /// the chain untouched.
    pub fn allocate(&mut self, size: usize) -> Option<Allocation> {
        let mut events = Events::new();
        let allocation = self.allocate_recorded(size, &mut events);
        events.emit();
        allocation
    }

    pub(crate) fn allocate_recorded(
        &mut self,
        size: usize,
        events: &mut Events,
    ) -> Option<Allocation> {
        let Some(aligned) = aligned_request(size) else {
            events.record(Event::Overflow { size });
            return None;
        };

        let fits = |_: usize, header: &RegionHeader| header.is_free() && header.size >= aligned;
        let found = match self.locate(fits) {
            Some(found) => found,
            None if self.grow_for(aligned, events) => self.locate(fits)?,
            None => {
                events.record(Event::Exhausted { size: aligned });
                return None;
            }
        };
        Some(self.take_region(found, aligned, events))
    }

    /// Frees the allocation whose payload starts at `ptr`.
    ///
    /// Works in both handle modes. A pointer that does not start a used
    /// region is handled according to [`HeapConfig::invalid_free`].
    #[track_caller]
    pub fn free(&mut self, ptr: NonNull<u8>) -> Result<(), FreeError> {
        let mut events = Events::new();
        let result = self.free_recorded(ptr, &mut events);
        events.emit();
        match result {
            Ok(()) => Ok(()),
            Err(err) => reject(self.config.invalid_free(), err),
        }
    }

    pub(crate) fn free_recorded(
        &mut self,
        ptr: NonNull<u8>,
        events: &mut Events,
    ) -> Result<(), FreeError> {
        let addr = ptr.addr().get();
        let found = self.locate_payload(addr)?;
        ensure!(!found.header.is_free(), DoubleFreeSnafu { addr });
        self.release(found, events);
        Ok(())
    }

    /// Frees the allocation carrying `id`.
    ///
    /// Only available in [`HandleMode::Identifier`]. The sentinel id 0 is
    /// always refused.
    #[track_caller]
    pub fn free_by_id(&mut self, id: RegionId) -> Result<(), FreeError> {
        let mut events = Events::new();
        let result = self.free_by_id_recorded(id, &mut events);
        events.emit();
        match result {
            Ok(()) => Ok(()),
            Err(err) => reject(self.config.invalid_free(), err),
        }
    }

    pub(crate) fn free_by_id_recorded(
        &mut self,
        id: RegionId,
        events: &mut Events,
    ) -> Result<(), FreeError> {
        let found = self.locate_id(id)?;
        self.release(found, events);
        Ok(())
    }

    /// Calls `f` for every region in address order.
    pub fn for_each_region<F>(&self, mut f: F)
    where
        F: FnMut(RegionInfo),
    {
        for (offset, header) in self.regions() {
            f(self.info(offset, &header));
        }
    }

    /// Returns a snapshot of the chain in address order.
    pub fn dump_state<const N: usize>(&self) -> Result<ArrayVec<RegionInfo, N>, SnapshotError> {
        let mut regions = ArrayVec::new();
        for (offset, header) in self.regions() {
            regions
                .try_push(self.info(offset, &header))
                .ok()
                .context(TooManyRegionsSnafu { capacity: N })?;
        }
        Ok(regions)
    }

    #[must_use]
    pub fn stats(&self) -> HeapStats {
        let mut stats = HeapStats {
            arena_size: self.arena.len(),
            ..HeapStats::default()
        };
        for (_, header) in self.regions() {
            stats.regions += 1;
            if header.is_free() {
                stats.free_bytes += header.size;
                stats.largest_free = stats.largest_free.max(header.size);
            } else {
                stats.used_regions += 1;
                stats.used_bytes += header.size;
            }
        }
        stats
    }

    /// Checks the chain invariants without panicking.
    ///
    /// Header validation already proves that the chain tiles the arena; this
    /// additionally checks that coalescing left no adjacent free regions and
    /// that free regions carry no id.
    pub fn validate(&self) -> Result<(), CorruptionError> {
        let mut offset = HEAD;
        let mut prev_free = None;
        while offset != NIL {
            let header = self.arena.try_header(offset)?;
            if header.is_free() {
                ensure!(
                    header.id().is_sentinel(),
                    FreeRegionWithIdSnafu {
                        offset,
                        id: header.id()
                    }
                );
                if let Some(prev) = prev_free {
                    return AdjacentFreeSnafu { offset: prev, next: offset }.fail();
                }
                prev_free = Some(offset);
            } else {
                prev_free = None;
            }
            offset = header.next;
        }
        Ok(())
    }

    fn regions(&self) -> Regions<'_> {
        Regions {
            arena: &self.arena,
            next: HEAD,
        }
    }

    fn info(&self, offset: usize, header: &RegionHeader) -> RegionInfo {
        RegionInfo {
            offset,
            addr: self.arena.start_addr() + offset + HEADER_SIZE,
            size: header.size,
            free: header.is_free(),
            id: header.id(),
        }
    }

    fn locate<P>(&self, mut pred: P) -> Option<Located>
    where
        P: FnMut(usize, &RegionHeader) -> bool,
    {
        let mut prev = None;
        for (offset, header) in self.regions() {
            if pred(offset, &header) {
                return Some(Located {
                    prev,
                    offset,
                    header,
                });
            }
            prev = Some(offset);
        }
        None
    }

    fn locate_payload(&self, addr: usize) -> Result<Located, FreeError> {
        let target = self
            .arena
            .offset_of(addr)
            .and_then(|offset| offset.checked_sub(HEADER_SIZE))
            .context(UnknownPointerSnafu { addr })?;
        self.locate(|offset, _| offset == target)
            .context(UnknownPointerSnafu { addr })
    }

    fn locate_id(&self, id: RegionId) -> Result<Located, FreeError> {
        ensure!(
            self.config.handles().is_identifier(),
            IdentifiersDisabledSnafu
        );
        ensure!(!id.is_sentinel(), ReservedIdSnafu);
        self.locate(|_, header| !header.is_free() && header.id() == id)
            .context(UnknownIdSnafu { id })
    }

    /// Marks a free region used, splitting off its tail when worthwhile.
    fn take_region(&mut self, found: Located, size: usize, events: &mut Events) -> Allocation {
        let Located {
            offset, mut header, ..
        } = found;
        debug_assert!(header.is_free() && header.size >= size);

        if header.size >= size + HEADER_SIZE + ALIGNMENT {
            let rest = offset + HEADER_SIZE + size;
            let rest_size = header.size - size - HEADER_SIZE;
            self.arena
                .set_header(rest, RegionHeader::free(rest_size, header.next));
            events.record(Event::Split {
                offset,
                used: size,
                rest,
                rest_size,
            });
            header.size = size;
            header.next = rest;
        }

        let id = match self.config.handles() {
            HandleMode::Pointer => RegionId::SENTINEL,
            HandleMode::Identifier => {
                let id = self.next_id;
                self.next_id = id.successor();
                id
            }
        };
        header.mark_used(id);
        self.arena.set_header(offset, header);

        let ptr = self.arena.ptr_at(offset + HEADER_SIZE);
        events.record(Event::Allocated {
            addr: ptr.addr().get(),
            size: header.size,
            id,
        });
        Allocation {
            ptr,
            id: (!id.is_sentinel()).then_some(id),
        }
    }

    fn release(&mut self, found: Located, events: &mut Events) {
        let Located {
            prev,
            offset,
            mut header,
        } = found;
        let (size, id) = (header.size, header.id());
        header.mark_free();
        self.arena.set_header(offset, header);

        let merged = match self.config.coalescing() {
            Coalescing::Sweep => self.coalesce_all(),
            Coalescing::Neighbors => {
                let next = usize::from(self.merge_with_next(offset));
                let prev = prev.is_some_and(|prev| self.merge_with_next(prev));
                next + usize::from(prev)
            }
        };
        events.record(Event::Freed {
            offset,
            size,
            id,
            merged,
        });
    }

    /// Absorbs the successor of the region at `offset` if both are free.
    fn merge_with_next(&mut self, offset: usize) -> bool {
        let mut header = self.arena.header(offset);
        if !header.is_free() || header.next == NIL {
            return false;
        }
        let next = self.arena.header(header.next);
        if !next.is_free() {
            return false;
        }
        header.size += HEADER_SIZE + next.size;
        header.next = next.next;
        self.arena.set_header(offset, header);
        true
    }

    /// Merges every adjacent free pair, staying on a region after a merge.
    ///
    /// Returns the number of merges.
    fn coalesce_all(&mut self) -> usize {
        let mut merged = 0;
        let mut offset = HEAD;
        while offset != NIL {
            if self.merge_with_next(offset) {
                merged += 1;
            } else {
                offset = self.arena.header(offset).next;
            }
        }
        merged
    }

    /// Extends the arena so that a `size`-byte request can succeed.
    fn grow_for(&mut self, size: usize, events: &mut Events) -> bool {
        let Some(increment) = size
            .checked_add(HEADER_SIZE)
            .map(|bytes| bytes.max(self.config.min_growth()))
            .and_then(|bytes| bytes.checked_next_multiple_of(ALIGNMENT))
        else {
            return false;
        };
        let Some(old_break) = self.grow.grow(increment) else {
            events.record(Event::GrowthRefused { increment });
            return false;
        };
        if old_break.addr().get() != self.arena.end_addr() {
            events.record(Event::GrowthDropped {
                addr: old_break.addr().get(),
                arena_end: self.arena.end_addr(),
            });
            return false;
        }

        // The trailing region must be read while it still ends the arena.
        let Some((last_offset, mut last)) = self.regions().last() else {
            return false;
        };
        let old_len = self.arena.len();
        unsafe {
            self.arena.extend(increment);
        }
        if last.is_free() {
            last.size += increment;
        } else {
            self.arena
                .set_header(old_len, RegionHeader::free(increment - HEADER_SIZE, NIL));
            last.next = old_len;
        }
        self.arena.set_header(last_offset, last);
        events.record(Event::Grew {
            increment,
            arena_size: self.arena.len(),
        });
        true
    }
}

pub(crate) fn log_init(range: Range<usize>, config: &HeapConfig) {
    info!(
        "free-list heap at {:#x}..{:#x} ({} bytes, {config:?})",
        range.start,
        range.end,
        range.len()
    );
}

/// Applies the invalid-free policy to a rejected request.
///
/// Logs, so it must not be called with a heap lock held.
#[track_caller]
pub(crate) fn reject(policy: InvalidFree, err: FreeError) -> Result<(), FreeError> {
    match policy {
        InvalidFree::Reject => {
            warn!("rejected free: {err}");
            Err(err)
        }
        InvalidFree::Abort => error::fatal(err),
    }
}
