//! Error types shared by the allocator variants.
//!
//! Two severity classes exist. Initialisation failures, rejected frees and
//! snapshot overflow are ordinary [`Result`] values. Page pool misuse and
//! region chain corruption are fatal and are reported through [`fatal`],
//! because a broken chain cannot be repaired locally.

use core::fmt;

use snafu::{GenerateImplicitData, Snafu};

use crate::region::RegionId;

/// Source location captured when an error value is constructed.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Location(&'static core::panic::Location<'static>);

impl Default for Location {
    #[track_caller]
    fn default() -> Self {
        Self(core::panic::Location::caller())
    }
}

impl GenerateImplicitData for Location {
    #[track_caller]
    fn generate() -> Self {
        Self::default()
    }
}

impl fmt::Debug for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Errors returned while setting up an arena.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum InitError {
    #[snafu(display("arena start address is null"))]
    NullArena {
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display(
        "arena {start:#x}..{end:#x} leaves {usable} usable bytes, at least {min} are required"
    ))]
    ArenaTooSmall {
        start: usize,
        end: usize,
        usable: usize,
        min: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("allocator is already initialized"))]
    AlreadyInitialized {
        #[snafu(implicit)]
        location: Location,
    },
}

/// Errors returned when a free request names no live allocation.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum FreeError {
    #[snafu(display("allocator is not initialized"))]
    NotInitialized {
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("{addr:#x} is not the start of any region in the arena"))]
    UnknownPointer {
        addr: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("region at {addr:#x} is already free"))]
    DoubleFree {
        addr: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("id 0 is reserved for the initial arena region"))]
    ReservedId {
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("no allocated region has id {id}"))]
    UnknownId {
        id: RegionId,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("heap was configured without region identifiers"))]
    IdentifiersDisabled {
        #[snafu(implicit)]
        location: Location,
    },
}

/// Page pool misuse. Always fatal.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum PageError {
    #[snafu(display("page {addr:#x} is not aligned to {align} bytes"))]
    UnalignedPage {
        addr: usize,
        align: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("page {addr:#x} is outside the pool range {start:#x}..{end:#x}"))]
    PageOutOfRange {
        addr: usize,
        start: usize,
        end: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("page {addr:#x} is already on the free list"))]
    PageDoubleFree {
        addr: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("free page link {link:#x} does not name a page in the pool"))]
    BrokenPageLink {
        link: usize,
        #[snafu(implicit)]
        location: Location,
    },
}

/// The region chain no longer describes the arena.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum CorruptionError {
    #[snafu(display("region header at offset {offset:#x} lies outside the {len}-byte arena"))]
    HeaderOutOfBounds {
        offset: usize,
        len: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("region header at offset {offset:#x} is misaligned"))]
    UnalignedHeader {
        offset: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("region header at offset {offset:#x} has bad magic {magic:#010x}"))]
    BadMagic {
        offset: usize,
        magic: u32,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("region header at offset {offset:#x} has invalid state {state:#x}"))]
    BadState {
        offset: usize,
        state: u32,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display(
        "region at offset {offset:#x} links to {next:#x}, expected {expected:#x}"
    ))]
    BrokenLink {
        offset: usize,
        next: usize,
        expected: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("free regions at {offset:#x} and {next:#x} were not coalesced"))]
    AdjacentFree {
        offset: usize,
        next: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("free region at {offset:#x} carries id {id}"))]
    FreeRegionWithId {
        offset: usize,
        id: RegionId,
        #[snafu(implicit)]
        location: Location,
    },
}

/// A state snapshot did not fit in the caller's buffer.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SnapshotError {
    #[snafu(display("arena holds more than {capacity} regions"))]
    TooManyRegions {
        capacity: usize,
        #[snafu(implicit)]
        location: Location,
    },
}

/// Reports an unrecoverable allocator error and stops.
#[track_caller]
pub fn fatal<E>(err: E) -> !
where
    E: core::error::Error,
{
    panic!("critical allocator error: {err}\n  {err:?}");
}
