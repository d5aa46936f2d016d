//! Allocation sequences run against each allocator variant.

use std::{ops::Range, ptr::NonNull};

use arena_alloc::{
    Allocation, BumpArena, HandleMode, HeapConfig, LockedHeap, PAGE_SIZE, PagePool, PoolConfig,
};
use snafu::{OptionExt as _, ResultExt as _};

use crate::{BumpArgs, FirstFitArgs, PagesArgs, report::GenericError};

const MAX_DUMPED_REGIONS: usize = 64;

/// Host memory standing in for a reserved physical range.
struct Memory(Vec<u64>);

impl Memory {
    fn new(size: usize) -> Self {
        Self(vec![0; size.div_ceil(size_of::<u64>())])
    }

    fn range(&mut self) -> Range<*mut u8> {
        let range = self.0.as_mut_ptr_range();
        range.start.cast()..range.end.cast()
    }
}

fn fmt_ptr(ptr: Option<NonNull<u8>>) -> String {
    ptr.map_or_else(|| "null".to_owned(), |ptr| format!("{ptr:p}"))
}

fn print_state(heap: &LockedHeap) -> Result<(), GenericError> {
    let regions = heap
        .dump_state::<MAX_DUMPED_REGIONS>()
        .whatever_context("failed to snapshot heap")?;
    println!("{:>18} {:>10} {:>5} {:>5}", "address", "size", "state", "id");
    for region in regions {
        println!(
            "{:#018x} {:>10} {:>5} {:>5}",
            region.addr,
            region.size,
            if region.free { "free" } else { "used" },
            region.id.to_string(),
        );
    }
    Ok(())
}

fn allocate(heap: &LockedHeap, size: usize) -> Option<Allocation> {
    let allocation = heap.allocate(size);
    match allocation {
        Some(Allocation { ptr, id: Some(id) }) => {
            println!("allocated {size} bytes at {ptr:p} ({id})");
        }
        Some(Allocation { ptr, id: None }) => println!("allocated {size} bytes at {ptr:p}"),
        None => println!("not enough space for {size} bytes"),
    }
    allocation
}

fn release(heap: &LockedHeap, allocation: Option<Allocation>) -> Result<(), GenericError> {
    let Some(allocation) = allocation else {
        return Ok(());
    };
    match allocation.id {
        Some(id) => heap
            .free_by_id(id)
            .with_whatever_context(|_| format!("failed to free region {id}"))?,
        None => heap
            .free(allocation.ptr)
            .with_whatever_context(|_| format!("failed to free {:p}", allocation.ptr))?,
    }
    println!("freed {:p}", allocation.ptr);
    Ok(())
}

pub fn first_fit(args: &FirstFitArgs) -> Result<(), GenericError> {
    let handles = if args.ids {
        HandleMode::Identifier
    } else {
        HandleMode::Pointer
    };
    let config = HeapConfig::new()
        .with_handles(handles)
        .with_coalescing(args.coalescing);

    let mut memory = Memory::new(args.arena_size);
    let heap = LockedHeap::new(config);
    let range = memory.range();
    unsafe { heap.init(range.start, range.end.addr() - range.start.addr()) }
        .whatever_context("failed to initialize heap")?;

    let t1 = allocate(&heap, 100);
    let t2 = allocate(&heap, 200);
    let t3 = allocate(&heap, 300);
    print_state(&heap)?;

    release(&heap, t1)?;
    release(&heap, t2)?;
    print_state(&heap)?;

    let t4 = allocate(&heap, args.arena_size);
    print_state(&heap)?;

    release(&heap, t3)?;
    release(&heap, t4)?;
    print_state(&heap)?;

    let stats = heap.stats();
    println!(
        "{} regions, {} bytes free, largest free region {} bytes",
        stats.regions, stats.free_bytes, stats.largest_free
    );
    heap.validate().whatever_context("heap invariants violated")?;
    Ok(())
}

pub fn bump(args: &BumpArgs) -> Result<(), GenericError> {
    let mut memory = Memory::new(args.arena_size);
    let arena = BumpArena::new();
    let range = memory.range();
    unsafe { arena.init(range.start, range.end) }
        .whatever_context("failed to initialize bump arena")?;

    let p1 = arena.allocate(1024);
    println!("allocated 1024 bytes at {}", fmt_ptr(p1));
    let p2 = arena.allocate(2048);
    println!("allocated 2048 bytes at {}", fmt_ptr(p2));

    for (ptr, size) in [(p1, 1024), (p2, 2048)] {
        let ptr = ptr.whatever_context("bump arena ran out of space")?;
        arena.free(ptr);
        println!("freed {size} bytes at {ptr:p}");
    }

    let p3 = arena.allocate(4096);
    println!("allocated 4096 bytes at {}", fmt_ptr(p3));
    println!("{} bytes left in the bump arena", arena.remaining());
    Ok(())
}

pub fn pages(args: &PagesArgs) -> Result<(), GenericError> {
    let config = if args.no_fill {
        PoolConfig::new().with_free_fill(None).with_alloc_fill(None)
    } else {
        PoolConfig::new()
    };

    // One spare page so that rounding the start up still leaves `pages`.
    let mut memory = Memory::new((args.pages + 1) * PAGE_SIZE);
    let pool = PagePool::new(config);
    let range = memory.range();
    unsafe { pool.init(range.start, range.end) }
        .whatever_context("failed to initialize page pool")?;
    println!(
        "page pool holds {} of {} pages",
        pool.free_pages(),
        pool.total_pages()
    );

    let mut taken = Vec::new();
    while taken.len() < 3 {
        let page = pool.page_alloc().whatever_context("page pool ran out of pages")?;
        println!("page alloc {page:p}");
        taken.push(page);
    }

    for &page in &taken {
        unsafe { pool.page_free(page) };
        println!("page free {page:p}");
    }

    let Some(&last) = taken.last() else {
        return Ok(());
    };
    let page = pool.page_alloc().whatever_context("page pool ran out of pages")?;
    println!(
        "page alloc {page:p} ({})",
        if page == last {
            "most recently freed"
        } else {
            "unexpected order"
        }
    );
    unsafe { pool.page_free(page) };
    println!(
        "page pool holds {} of {} pages",
        pool.free_pages(),
        pool.total_pages()
    );
    Ok(())
}
