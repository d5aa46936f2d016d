//! Bounds-checked view over an arena's backing memory.
//!
//! Allocators address their bookkeeping by offset from the arena start. All
//! conversions between offsets and pointers go through [`Arena`], which
//! refuses offsets outside the arena and validates every region header it
//! reads, so a stray link is caught before it is followed.

use core::ptr::NonNull;

use snafu::{OptionExt as _, ensure};

use crate::{
    error::{
        self, ArenaTooSmallSnafu, BadMagicSnafu, BadStateSnafu, BrokenLinkSnafu,
        CorruptionError, HeaderOutOfBoundsSnafu, InitError, NullArenaSnafu,
        UnalignedHeaderSnafu,
    },
    region::{ALIGNMENT, HEADER_SIZE, NIL, REGION_MAGIC, RegionHeader, STATE_FREE, STATE_USED},
};

#[derive(Debug)]
pub(crate) struct Arena {
    base: NonNull<u8>,
    len: usize,
}

impl Arena {
    /// Carves an arena out of `start..start + size`.
    ///
    /// The start is rounded up to `align` and the length down to a multiple
    /// of `granule`.
    ///
    /// # Safety
    ///
    /// The caller must ensure that the memory range is valid for reads and
    /// writes, is not used by anything else, and outlives the arena.
    pub(crate) unsafe fn carve(
        start: *mut u8,
        size: usize,
        align: usize,
        granule: usize,
        min: usize,
    ) -> Result<Self, InitError> {
        let base = NonNull::new(start).context(NullArenaSnafu)?;
        let align_offset = start.align_offset(align);
        let len = size.saturating_sub(align_offset) / granule * granule;
        let end = start.addr().saturating_add(size);
        ensure!(
            len >= min,
            ArenaTooSmallSnafu {
                start: start.addr(),
                end,
                usable: len,
                min,
            }
        );
        // `len > 0` implies `align_offset < size`, so this stays in bounds.
        let base = unsafe { base.add(align_offset) };
        Ok(Self { base, len })
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn start_addr(&self) -> usize {
        self.base.addr().get()
    }

    pub(crate) fn end_addr(&self) -> usize {
        self.start_addr() + self.len
    }

    /// Returns the offset of `addr`, if it lies inside the arena.
    pub(crate) fn offset_of(&self, addr: usize) -> Option<usize> {
        let offset = addr.checked_sub(self.start_addr())?;
        (offset < self.len).then_some(offset)
    }

    /// Returns a pointer `offset` bytes into the arena.
    ///
    /// # Panics
    ///
    /// Panics if `offset` is past the arena end.
    pub(crate) fn ptr_at(&self, offset: usize) -> NonNull<u8> {
        assert!(
            offset <= self.len,
            "offset {offset:#x} outside {}-byte arena",
            self.len
        );
        unsafe { self.base.add(offset) }
    }

    /// Adds `additional` bytes directly after the current end.
    ///
    /// # Safety
    ///
    /// The caller must ensure that the added bytes are valid, exclusive to
    /// this arena and contiguous with it.
    pub(crate) unsafe fn extend(&mut self, additional: usize) {
        self.len += additional;
    }

    /// Reads and validates the region header at `offset`.
    pub(crate) fn try_header(&self, offset: usize) -> Result<RegionHeader, CorruptionError> {
        ensure!(
            offset.is_multiple_of(ALIGNMENT),
            UnalignedHeaderSnafu { offset }
        );
        ensure!(
            offset
                .checked_add(HEADER_SIZE)
                .is_some_and(|end| end <= self.len),
            HeaderOutOfBoundsSnafu {
                offset,
                len: self.len
            }
        );

        #[expect(clippy::cast_ptr_alignment)]
        let ptr = self.ptr_at(offset).as_ptr().cast::<RegionHeader>();
        let header = unsafe { ptr.read() };

        ensure!(
            header.magic == REGION_MAGIC,
            BadMagicSnafu {
                offset,
                magic: header.magic
            }
        );
        ensure!(
            header.state == STATE_FREE || header.state == STATE_USED,
            BadStateSnafu {
                offset,
                state: header.state
            }
        );

        let end = offset + HEADER_SIZE;
        let expected = match end.checked_add(header.size) {
            Some(end) if end == self.len => NIL,
            Some(end) if end < self.len => end,
            _ => {
                return HeaderOutOfBoundsSnafu {
                    offset,
                    len: self.len,
                }
                .fail();
            }
        };
        ensure!(
            header.next == expected,
            BrokenLinkSnafu {
                offset,
                next: header.next,
                expected,
            }
        );
        Ok(header)
    }

    /// Reads the region header at `offset`, treating corruption as fatal.
    #[track_caller]
    pub(crate) fn header(&self, offset: usize) -> RegionHeader {
        self.try_header(offset).unwrap_or_else(|err| error::fatal(err))
    }

    /// Writes a region header at `offset`.
    ///
    /// # Panics
    ///
    /// Panics if the header would not fit in the arena or is misaligned.
    pub(crate) fn set_header(&mut self, offset: usize, header: RegionHeader) {
        assert!(offset.is_multiple_of(ALIGNMENT));
        assert!(
            offset
                .checked_add(HEADER_SIZE)
                .is_some_and(|end| end <= self.len),
            "header at {offset:#x} outside {}-byte arena",
            self.len
        );
        #[expect(clippy::cast_ptr_alignment)]
        let ptr = self.ptr_at(offset).as_ptr().cast::<RegionHeader>();
        unsafe {
            ptr.write(header);
        }
    }

    /// Reads the link word stored at the start of a free unit.
    pub(crate) fn link(&self, offset: usize) -> usize {
        assert!(offset.is_multiple_of(align_of::<usize>()));
        assert!(offset + size_of::<usize>() <= self.len);
        #[expect(clippy::cast_ptr_alignment)]
        let ptr = self.ptr_at(offset).as_ptr().cast::<usize>();
        unsafe { ptr.read() }
    }

    /// Stores a link word at the start of a free unit.
    pub(crate) fn set_link(&mut self, offset: usize, link: usize) {
        assert!(offset.is_multiple_of(align_of::<usize>()));
        assert!(offset + size_of::<usize>() <= self.len);
        #[expect(clippy::cast_ptr_alignment)]
        let ptr = self.ptr_at(offset).as_ptr().cast::<usize>();
        unsafe {
            ptr.write(link);
        }
    }
}
