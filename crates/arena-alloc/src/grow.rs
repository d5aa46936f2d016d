//! Growth sources for free-list heaps.

use core::ptr::NonNull;

/// A parent allocator that can extend a heap's arena in place.
///
/// The contract follows `sbrk`: `grow` reserves `increment` more bytes and
/// returns the previous break, which is where the new bytes begin. A heap
/// only accepts an extension that starts exactly at its current arena end.
///
/// # Safety
///
/// Implementors must guarantee that the returned `increment` bytes are valid
/// for reads and writes, are not used by anything else, and stay valid for
/// as long as the heap that requested them.
pub unsafe trait Grow {
    fn grow(&mut self, increment: usize) -> Option<NonNull<u8>>;
}

/// Growth source that never grows; the arena keeps its initial size.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct NoGrow;

unsafe impl Grow for NoGrow {
    fn grow(&mut self, _increment: usize) -> Option<NonNull<u8>> {
        None
    }
}
