//! Segregated Fixed Heap — an array of [`BlockPool`]s indexed by block
//! size, picking the smallest pool whose block fits a request.
//!
//! Grounded on `kernel/src/mm/pool.rs`'s size-class idea (`SIZE_CLASSES`,
//! `get_size_class`), generalized from a hardcoded constant table into a
//! caller-supplied descriptor array per
//! `examples/original_source/public/fixed_heap.h`'s `HeapConfig`/
//! `FixedHeap`, which is also the authoritative source for this module's
//! static `free` via back-pointer dispatch.
//!
//! `HeapConfig` embeds its `BlockHeap` directly as a member
//! (`examples/original_source/public/fixed_heap.h`'s `protected: BlockHeap
//! m_clHeap;`), so the caller's own (typically `static`) config array is
//! the pools' only storage — `FixedHeap::Create` never allocates. This
//! module follows that shape exactly: [`SizeClass`] embeds a [`BlockPool`],
//! and [`SegregatedHeap`] borrows the caller's `&mut [SizeClass]` rather
//! than copying it into a `Vec`. No part of this module's core path heap
//! allocates, keeping it usable without a global allocator configured —
//! the same property the rest of this crate's allocators have.

use crate::mm::block_pool::{node_stride_for, BlockPool};

/// One size class: block size and count, plus the [`BlockPool`] carved
/// for it once [`SegregatedHeap::create`] runs.
///
/// Callers declare an array of these (typically `static` or stack-local)
/// and hand it to [`SegregatedHeap::create`]; the array itself is the
/// only storage the heap needs.
pub struct SizeClass {
    pub block_size: usize,
    pub block_count: usize,
    pool: BlockPool,
}

impl SizeClass {
    /// Declare a size class of `block_count` blocks of `block_size` bytes
    /// each. The embedded pool is uninitialized until
    /// [`SegregatedHeap::create`] carves it out of an arena.
    pub const fn new(block_size: usize, block_count: usize) -> Self {
        Self { block_size, block_count, pool: BlockPool::new() }
    }
}

/// An array of [`BlockPool`]s, one per [`SizeClass`], tried smallest
/// first.
///
/// The descriptor array corresponds to Mark3's zero-size-terminated
/// `HeapConfig` table; here it is simply a slice (a length-prefixed view
/// is the natural Rust equivalent — the sentinel was an implementation
/// detail of the C array, not part of the contract).
pub struct SegregatedHeap<'a> {
    classes: &'a mut [SizeClass],
}

impl<'a> SegregatedHeap<'a> {
    /// Validate `classes` is in non-decreasing `block_size` order, then
    /// carve one [`BlockPool`] per class out of consecutive regions of
    /// `arena`, in order.
    ///
    /// Descriptor ordering is an internal programmer error, not a runtime
    /// condition to recover from, so it is only checked in debug builds
    /// via `debug_assert!` (a misconfigured release build silently
    /// degrades to incorrect first-fit behavior rather than aborting).
    ///
    /// # Safety
    /// `arena` must be valid for reads and writes of at least
    /// `sum((block_size + node_header_overhead) * block_count)` bytes
    /// for the lifetime of this heap. `classes` must already be at its
    /// final, stable address and must never move for as long as the
    /// returned [`SegregatedHeap`] (or any pointer it has handed out) is
    /// alive — each [`BlockPool`]'s free list and owner back-pointers are
    /// computed from its slot's address in `classes` here.
    pub unsafe fn create(arena: *mut u8, classes: &'a mut [SizeClass]) -> Self {
        for pair in classes.windows(2) {
            debug_assert!(
                pair[0].block_size <= pair[1].block_size,
                "size classes must be supplied in non-decreasing block_size order"
            );
        }

        let mut cursor = arena;
        for class in classes.iter() {
            let region_bytes = node_stride_for(class.block_size) * class.block_count;
            cursor = class.pool.create(cursor, region_bytes, class.block_size);
        }

        Self { classes }
    }

    /// First-fit by size class: the smallest class whose `block_size` is
    /// at least `size` and that still has a free block. A size-0 request
    /// is treated as size 1 (the smallest class is eligible). If the
    /// smallest fitting class is exhausted, the next larger class is
    /// tried — allocation fails only when every large-enough class is
    /// full, or `size` exceeds every configured class.
    pub fn allocate(&self, size: usize) -> *mut u8 {
        let effective = size.max(1);
        for class in self.classes.iter() {
            if class.block_size >= effective && class.pool.is_free() {
                let p = class.pool.allocate();
                if !p.is_null() {
                    return p;
                }
            }
        }
        core::ptr::null_mut()
    }

    /// Free a payload pointer previously returned by `allocate`.
    ///
    /// Static by design (mirrors `FixedHeap::Free` in
    /// `examples/original_source/src/fixed_heap.cpp`): the owning pool is
    /// recovered from the back-pointer embedded in the node header, not
    /// by consulting `self`. Acquires the owning [`BlockPool`]'s critical
    /// section, not a heap-level one.
    ///
    /// # Safety
    /// `payload` must have been returned by `allocate` on a
    /// [`SegregatedHeap`] whose pools are still alive.
    pub unsafe fn free(payload: *mut u8) {
        BlockPool::free_by_owner(payload);
    }

    /// Total number of configured size classes.
    pub fn num_classes(&self) -> usize {
        self.classes.len()
    }
}
