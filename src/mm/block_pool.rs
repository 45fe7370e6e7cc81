//! Block-List Pool — a fixed-capacity pool of equal-sized nodes kept on
//! a singly-threaded (LIFO) intrusive free list.
//!
//! Grounded on [`BlockHeap`]'s free-list push/pop discipline from
//! `examples/original_source/src/fixed_heap.cpp`, generalized with the
//! owner back-pointer (`BlockHeapNode::m_clHeap`) that lets a raw payload
//! pointer be freed without consulting the owning
//! [`crate::mm::segregated::SegregatedHeap`]'s descriptor array — that is
//! exactly what makes `SegregatedHeap::free` a static function instead of
//! a method.
//!
//! [`BlockHeap`]: https://github.com/moslevin/Mark3 (not vendored; see `examples/original_source/`)

use core::mem::size_of;
use core::ptr;

use crate::containing_record;
use crate::ke::list::ListEntry;
use crate::ke::sync::SpinLock;

/// Node header prefixing every block: the free-list linkage plus a
/// back-pointer to the owning pool. The back-pointer's offset from the
/// payload is fixed (`size_of::<BlockNode>()`), independent of
/// `block_size` — this is what makes [`BlockPool::free_by_owner`] a pool
/// size-agnostic static function.
#[repr(C)]
struct BlockNode {
    link: ListEntry,
    owner: *const BlockPool,
}

/// Size in bytes of the link-node header prefixing every block, fixed
/// regardless of `block_size`. [`crate::mm::segregated::SegregatedHeap`]
/// uses this to size each size class's region of the shared arena.
pub const NODE_HEADER_SIZE: usize = size_of::<BlockNode>();

/// The number of bytes one node of `block_size` occupies, header
/// included. Exposed so [`crate::mm::segregated::SegregatedHeap`] can
/// size each size class's region of the shared arena exactly, instead of
/// duplicating this rounding rule.
pub const fn node_stride_for(block_size: usize) -> usize {
    NODE_HEADER_SIZE + round_up_const(block_size, size_of::<usize>())
}

const fn round_up_const(n: usize, align: usize) -> usize {
    (n + align - 1) / align * align
}

struct Inner {
    free_list: ListEntry,
    node_stride: usize,
    free_count: u32,
    total_count: u32,
}

// SAFETY: the embedded raw pointers only ever reference nodes within the
// arena this pool was given at `create` time; all access is serialized
// by the enclosing `SpinLock`.
unsafe impl Send for Inner {}

/// A fixed-capacity pool of equal-sized nodes on an intrusive free list.
///
/// Two-phase construction, matching the rest of this crate's kernel-style
/// objects: [`Self::new`] is a cheap `const fn`; [`Self::create`] carves
/// the arena and must be called exactly once, after `self` is at the
/// address it will occupy for the rest of its lifetime (the free list's
/// head is self-referential when empty, so `self` must not move once
/// `create` has run).
pub struct BlockPool {
    inner: SpinLock<Inner>,
}

impl BlockPool {
    /// Construct an empty, zero-capacity pool. Call [`Self::create`]
    /// before use.
    pub const fn new() -> Self {
        Self {
            inner: SpinLock::new(Inner {
                free_list: ListEntry::new(),
                node_stride: 0,
                free_count: 0,
                total_count: 0,
            }),
        }
    }

    /// Carve as many `(node header + block_size)` nodes as fit in
    /// `arena_size_bytes` starting at `arena`, link each into the free
    /// list, and back-point each to `self`.
    ///
    /// Returns a pointer just past the last initialized node, so callers
    /// (notably [`crate::mm::segregated::SegregatedHeap`]) can chain
    /// adjacent pool arenas carved from one larger block.
    ///
    /// # Safety
    /// `arena` must be valid for reads and writes of `arena_size_bytes`
    /// bytes for the lifetime of this pool. `self` must already be at
    /// its final, stable address (e.g. a `Box<BlockPool>`, an element of
    /// a `Vec` that has reached its final capacity, or a `static`) and
    /// must never move afterward — the free list's head and every
    /// node's owner back-pointer are computed from `self`'s address here.
    pub unsafe fn create(&self, arena: *mut u8, arena_size_bytes: usize, block_size: usize) -> *mut u8 {
        let node_stride = node_stride_for(block_size);
        let count = if node_stride == 0 { 0 } else { arena_size_bytes / node_stride };

        let mut guard = self.inner.lock();
        guard.free_list.init_head();
        guard.node_stride = node_stride;
        guard.total_count = count as u32;
        guard.free_count = count as u32;

        let self_ptr = self as *const BlockPool;
        for i in 0..count {
            let node = arena.add(i * node_stride) as *mut BlockNode;
            ptr::write(node, BlockNode { link: ListEntry::new(), owner: self_ptr });
            guard.free_list.insert_head(&mut (*node).link as *mut ListEntry);
        }

        arena.add(count * node_stride)
    }

    /// Pop the free list's head and return its payload pointer, or null
    /// if the pool is exhausted. O(1).
    pub fn allocate(&self) -> *mut u8 {
        let mut guard = self.inner.lock();
        let head = guard.free_list.head();
        if head.is_null() {
            return ptr::null_mut();
        }
        unsafe {
            ListEntry::remove_entry(head);
        }
        guard.free_count -= 1;
        let node = unsafe { containing_record!(head, BlockNode, link) };
        unsafe { (node as *mut u8).add(NODE_HEADER_SIZE) }
    }

    /// Push `payload`'s node back onto the head of the free list. O(1).
    ///
    /// A second `free` of an already-free node is undefined (the node
    /// would be linked into the list twice, corrupting it) — this is the
    /// one double-free case this crate does not tolerate, matching §4.5
    /// of the allocator contract.
    pub fn free(&self, payload: *mut u8) {
        let node = unsafe { payload.sub(NODE_HEADER_SIZE) } as *mut BlockNode;
        let mut guard = self.inner.lock();
        unsafe {
            guard.free_list.insert_head(&mut (*node).link as *mut ListEntry);
        }
        guard.free_count += 1;
    }

    /// Recover the owning pool from a payload pointer and free through
    /// it, without the caller needing to know which pool it came from.
    ///
    /// This is the static `Free(void*)` the segregated heap (C3) uses:
    /// it reads the back-pointer written at `create` time rather than
    /// scanning its own descriptor array.
    ///
    /// # Safety
    /// `payload` must have been returned by `allocate` on some
    /// [`BlockPool`] that is still alive.
    pub unsafe fn free_by_owner(payload: *mut u8) {
        let node = payload.sub(NODE_HEADER_SIZE) as *mut BlockNode;
        let owner = (*node).owner;
        (*owner).free(payload);
    }

    /// True iff at least one block is free.
    pub fn is_free(&self) -> bool {
        self.inner.lock().free_count > 0
    }

    pub fn num_free(&self) -> u32 {
        self.inner.lock().free_count
    }

    pub fn capacity(&self) -> u32 {
        self.inner.lock().total_count
    }
}

impl Default for BlockPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::boxed::Box;
    use std::vec::Vec;

    /// Boxed so the pool's final address is fixed before `create` runs
    /// (its free list and owner back-pointers are computed from that
    /// address) and stays fixed even though the `Box` handle itself is
    /// then moved around by the test.
    fn make_pool(arena: &mut [u8], block_size: usize) -> Box<BlockPool> {
        let pool = Box::new(BlockPool::new());
        unsafe {
            pool.create(arena.as_mut_ptr(), arena.len(), block_size);
        }
        pool
    }

    #[test]
    fn allocate_and_free_are_o1_and_lifo() {
        let mut arena = [0u8; 256];
        let pool = make_pool(&mut arena, 16);
        let capacity = pool.capacity();
        assert!(capacity > 0);

        let p0 = pool.allocate();
        let p1 = pool.allocate();
        assert!(!p0.is_null() && !p1.is_null());
        assert_ne!(p0, p1);

        pool.free(p1);
        let p2 = pool.allocate();
        assert_eq!(p1, p2, "LIFO free list should hand back the most recently freed node");
    }

    #[test]
    fn exhaustion_and_refill() {
        let mut arena = [0u8; 256];
        let pool = make_pool(&mut arena, 16);
        let capacity = pool.capacity();

        let mut ptrs: Vec<*mut u8> = Vec::new();
        for _ in 0..capacity {
            assert!(pool.is_free());
            let p = pool.allocate();
            assert!(!p.is_null());
            ptrs.push(p);
        }
        assert!(!pool.is_free());
        assert!(pool.allocate().is_null());

        for p in ptrs {
            pool.free(p);
        }
        assert_eq!(pool.num_free(), capacity);
    }

    #[test]
    fn free_by_owner_routes_to_the_right_pool() {
        let mut arena_a = [0u8; 128];
        let mut arena_b = [0u8; 128];
        let pool_a = make_pool(&mut arena_a, 8);
        let pool_b = make_pool(&mut arena_b, 8);

        let pa = pool_a.allocate();
        let pb = pool_b.allocate();
        assert!(!pa.is_null() && !pb.is_null());

        let free_a_before = pool_a.num_free();
        let free_b_before = pool_b.num_free();

        unsafe {
            BlockPool::free_by_owner(pa);
        }
        assert_eq!(pool_a.num_free(), free_a_before + 1);
        assert_eq!(pool_b.num_free(), free_b_before);

        unsafe {
            BlockPool::free_by_owner(pb);
        }
        assert_eq!(pool_b.num_free(), free_b_before + 1);
    }
}
