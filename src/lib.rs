//! Deterministic, fixed-overhead block and slab allocators.
//!
//! This crate provides four allocator strategies meant to be composed,
//! bottom-up, over caller-supplied memory:
//!
//! - [`rtl::bitmap_pool::BitmapPool`] — a fixed-capacity pool of equal-sized
//!   blocks tracked by one bit and one owner-tag word each.
//! - [`mm::block_pool::BlockPool`] — a fixed-capacity pool of equal-sized
//!   blocks kept on an intrusive free list.
//! - [`mm::segregated::SegregatedHeap`] — an array of [`mm::block_pool::BlockPool`]s
//!   indexed by block size, first-fit by size class.
//! - [`mm::slab::Slab`] — an on-demand page manager that carves each page
//!   it acquires into a [`rtl::bitmap_pool::BitmapPool`], migrating pages
//!   between has-free and full lists and releasing them eagerly when empty.
//!
//! None of these allocators coalesce, grow, shrink, or garbage collect.
//! Every operation is O(1) except `BitmapPool::allocate`/`free`, which are
//! O(1) typical and O(N) worst case in the pool's block count, and
//! `SegregatedHeap::allocate`, which is O(number of size classes). All
//! mutating operations are serialized by [`ke::sync::SpinLock`].
#![cfg_attr(not(test), no_std)]

#[macro_use]
pub mod ke;
pub mod rtl;
pub mod mm;
