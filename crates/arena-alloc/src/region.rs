//! Region headers and the public views of them.
//!
//! Every region in a free-list arena starts with a [`RegionHeader`]; the
//! payload handed to callers begins immediately after it.
//!
//! ```text
//! offset 0                                                     arena end
//! ┌────────┬──────────────┬────────┬──────────────────┬────────┬──────┐
//! │ header │ payload      │ header │ payload          │ header │ ...  │
//! └────────┴──────────────┴────────┴──────────────────┴────────┴──────┘
//!     │ next ─────────────────▲ │ next ─────────────────────▲
//! ```
//!
//! Links are arena-relative offsets rather than addresses, and the chain is
//! kept in address order, so `next` always equals the end of the region.

use derive_more::{Display, From};

/// Payload alignment and size granule of the free-list engine.
pub const ALIGNMENT: usize = 8;

/// Bytes occupied by a region header.
pub const HEADER_SIZE: usize = size_of::<RegionHeader>();
const _: () = assert!(HEADER_SIZE.is_multiple_of(ALIGNMENT));
const _: () = assert!(align_of::<RegionHeader>() == ALIGNMENT);

/// End-of-chain marker for [`RegionHeader::next`].
pub(crate) const NIL: usize = usize::MAX;

pub(crate) const REGION_MAGIC: u32 = 0x6865_6170;
pub(crate) const STATE_USED: u32 = 0;
pub(crate) const STATE_FREE: u32 = 1;

/// Handle of an allocation in identifier mode.
///
/// Identifiers start at 1 and increase with every successful allocation.
/// [`RegionId::SENTINEL`] (0) marks free regions, including the initial
/// region covering the whole arena, and is never handed out.
#[derive(Debug, Display, From, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[display("#{_0}")]
pub struct RegionId(usize);

impl RegionId {
    pub const SENTINEL: Self = Self(0);
    pub(crate) const FIRST: Self = Self(1);

    #[must_use]
    pub const fn new(raw: usize) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn get(self) -> usize {
        self.0
    }

    #[must_use]
    pub const fn is_sentinel(self) -> bool {
        self.0 == 0
    }

    pub(crate) const fn successor(self) -> Self {
        Self(self.0 + 1)
    }
}

/// In-arena metadata preceding each region's payload.
#[repr(C, align(8))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RegionHeader {
    pub(crate) magic: u32,
    pub(crate) state: u32,
    /// Usable bytes after the header.
    pub(crate) size: usize,
    /// Offset of the next header, or [`NIL`].
    pub(crate) next: usize,
    pub(crate) id: usize,
}

impl RegionHeader {
    pub(crate) const fn free(size: usize, next: usize) -> Self {
        Self {
            magic: REGION_MAGIC,
            state: STATE_FREE,
            size,
            next,
            id: 0,
        }
    }

    pub(crate) const fn is_free(&self) -> bool {
        self.state == STATE_FREE
    }

    pub(crate) const fn id(&self) -> RegionId {
        RegionId(self.id)
    }

    pub(crate) const fn mark_used(&mut self, id: RegionId) {
        self.state = STATE_USED;
        self.id = id.0;
    }

    pub(crate) const fn mark_free(&mut self) {
        self.state = STATE_FREE;
        self.id = 0;
    }
}

/// One entry of a heap state dump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionInfo {
    /// Offset of the region header from the arena start.
    pub offset: usize,
    /// Address of the first payload byte.
    pub addr: usize,
    /// Usable bytes, excluding the header.
    pub size: usize,
    pub free: bool,
    pub id: RegionId,
}

/// Result of a successful allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    pub ptr: core::ptr::NonNull<u8>,
    /// Assigned identifier; `None` unless the heap runs in identifier mode.
    pub id: Option<RegionId>,
}

/// Aggregate figures over the region chain.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HeapStats {
    pub arena_size: usize,
    pub regions: usize,
    pub used_regions: usize,
    pub used_bytes: usize,
    pub free_bytes: usize,
    pub largest_free: usize,
}

/// Rounds a request up to the engine's granule.
///
/// Zero-byte requests take one granule so every live allocation has its own
/// address. Returns `None` on overflow.
pub(crate) const fn aligned_request(size: usize) -> Option<usize> {
    if size == 0 {
        return Some(ALIGNMENT);
    }
    size.checked_next_multiple_of(ALIGNMENT)
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aligned_request() {
        let cases = [(0, 8), (1, 8), (8, 8), (9, 16), (100, 104), (256, 256)];
        for (size, expected) in cases {
            assert_eq!(aligned_request(size), Some(expected), "size {size}");
        }
        assert_eq!(aligned_request(usize::MAX), None);
    }

    #[test]
    fn test_header_state() {
        let mut header = RegionHeader::free(64, NIL);
        assert!(header.is_free());
        assert!(header.id().is_sentinel());

        header.mark_used(RegionId::new(7));
        assert!(!header.is_free());
        assert_eq!(header.id(), RegionId::new(7));

        header.mark_free();
        assert!(header.is_free());
        assert_eq!(header.id(), RegionId::SENTINEL);
    }

    #[test]
    fn test_region_id_display() {
        assert_eq!(RegionId::new(3).to_string(), "#3");
        assert_eq!(RegionId::FIRST.successor(), RegionId::new(2));
    }
}
