//! Arena allocators for kernel-style environments.
//!
//! Each allocator manages one caller-supplied arena and keeps its
//! bookkeeping inside that arena, so none of them needs a heap of its own.
//! The crate is `no_std` and works in bare-metal environments.
//!
//! # Available Allocators
//!
//! ## [`FreeListHeap`] / [`LockedHeap`]
//!
//! A first-fit free-list heap. The arena is tiled by an address-ordered
//! chain of regions, each prefixed by a [`HEADER_SIZE`]-byte header. Large
//! free regions are split on allocation and adjacent free regions are merged
//! on free. Best suited for:
//!
//! - Variable-sized allocations
//! - Arenas that must be inspected region by region ([`LockedHeap::dump_state`])
//! - Callers that want allocations named by small integer ids
//!   ([`HandleMode::Identifier`])
//!
//! **Performance**: O(n) allocation and deallocation where n is the number of
//! regions in the chain.
//!
//! [`LockedHeap`] wraps the engine in a spin lock and implements
//! [`GlobalAlloc`](core::alloc::GlobalAlloc).
//!
//! ## [`PagePool`]
//!
//! A LIFO stack of [`PAGE_SIZE`]-byte pages. Freed pages are overwritten with
//! a fill byte so that dangling references read junk.
//!
//! **Performance**: O(1) allocation and deallocation.
//!
//! ## [`BumpArena`]
//!
//! A cursor that only moves forward. Freeing is a no-op.
//!
//! **Performance**: O(1) allocation, no reclamation.
//!
//! # Usage Examples
//!
//! ```rust
//! use arena_alloc::{HandleMode, HeapConfig, LockedHeap};
//!
//! let heap = LockedHeap::new(HeapConfig::new().with_handles(HandleMode::Identifier));
//! let mut memory = vec![0_u64; 512]; // In a kernel, this would be reserved memory
//! unsafe {
//!     heap.init(memory.as_mut_ptr().cast(), 4096).unwrap();
//! }
//!
//! let first = heap.allocate(100).unwrap();
//! let second = heap.allocate(200).unwrap();
//! assert_eq!(first.id.unwrap().get(), 1);
//!
//! heap.free_by_id(second.id.unwrap()).unwrap();
//! heap.free(first.ptr).unwrap();
//!
//! let regions = heap.dump_state::<8>().unwrap();
//! assert_eq!(regions.len(), 1);
//! assert!(regions[0].free);
//! ```
//!
//! # Error Handling
//!
//! Allocation failure is an ordinary `None`. Rejected frees return a
//! [`FreeError`], or abort when the heap is configured with
//! [`InvalidFree::Abort`]. Corruption of a region chain and page pool misuse
//! are always fatal and end in a panic through [`error::fatal`].

#![cfg_attr(not(test), no_std)]
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

mod arena;
pub mod bump;
pub mod config;
pub mod error;
pub mod free_list;
pub mod grow;
pub mod heap;
pub mod page_pool;
pub mod region;

pub use self::{
    bump::BumpArena,
    config::{Coalescing, HandleMode, HeapConfig, InvalidFree, PoolConfig},
    error::{CorruptionError, FreeError, InitError, PageError, SnapshotError},
    free_list::{FreeListHeap, MIN_ARENA_SIZE},
    grow::{Grow, NoGrow},
    heap::LockedHeap,
    page_pool::{PAGE_SIZE, PagePool},
    region::{ALIGNMENT, Allocation, HEADER_SIZE, HeapStats, RegionId, RegionInfo},
};
