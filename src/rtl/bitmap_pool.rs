//! Bitmap Pool — a fixed-capacity pool of equal-sized blocks, each
//! tracked by one bit and a leading owner-tag word.
//!
//! Grounded on [`crate::rtl::bitmap`] for the scan primitive and on
//! Mark3's `BitmapAllocator` (`examples/original_source/test/ut_bitmap.cpp`)
//! for the exact block/tag/capacity contract: exhaustive fill, tolerated
//! double-free, and round-trip write verification through the returned
//! payload pointer.
//!
//! Every block slot is `tag_word + max(object_size, one word)` bytes,
//! rounded up to word size. The tag word is the ABI seam this crate's
//! slab allocator ([`crate::mm::slab`]) relies on to map a freed payload
//! pointer back to its owning page — changing this layout breaks that
//! contract (spec layout note, §6).

use core::mem::size_of;
use core::ptr;

use crate::ke::sync::SpinLock;
use crate::rtl::bitmap::RtlBitmap;

/// Size in bytes of the owner-tag word stored immediately before every
/// payload. Fixed at the pointer width of the target.
pub const TAG_WORD_SIZE: usize = size_of::<usize>();

const WORD_SIZE: usize = size_of::<usize>();

#[inline]
fn round_up(n: usize, align: usize) -> usize {
    (n + align - 1) / align * align
}

struct Layout {
    slot_stride: usize,
    capacity: u32,
    bitmap_bytes: usize,
}

/// Compute how many blocks of `object_size` fit in `arena_size_bytes`,
/// and the per-slot stride, given the one-bit-plus-tag-word overhead
/// each block carries. Binary search over candidate counts: the clear-bit
/// bitmap's own byte cost makes the relationship between N and the bytes
/// it consumes non-linear once `ceil(N/8)` is folded in.
fn layout_for(arena_size_bytes: usize, object_size: usize) -> Layout {
    if object_size == 0 {
        return Layout { slot_stride: 0, capacity: 0, bitmap_bytes: 0 };
    }
    let slot_stride = round_up(TAG_WORD_SIZE + object_size.max(WORD_SIZE), WORD_SIZE);
    let fits = |n: u32| -> bool {
        let bitmap_bytes = ((n as usize) + 7) / 8;
        bitmap_bytes + (n as usize) * slot_stride <= arena_size_bytes
    };

    let mut lo: u32 = 0;
    let mut hi: u32 = (arena_size_bytes / slot_stride) as u32 + 1;
    while lo < hi {
        let mid = lo + (hi - lo + 1) / 2;
        if fits(mid) {
            lo = mid;
        } else {
            hi = mid - 1;
        }
    }
    let capacity = lo;
    let bitmap_bytes = ((capacity as usize) + 7) / 8;
    Layout { slot_stride, capacity, bitmap_bytes }
}

struct Inner {
    bitmap: RtlBitmap,
    slots_base: *mut u8,
    slot_stride: usize,
    capacity: u32,
    free: u32,
    cursor: u32,
}

// SAFETY: the raw pointers inside `Inner` only ever point into the arena
// supplied at `init` time, are never aliased outside the pool, and all
// access is serialized by the enclosing `SpinLock`.
unsafe impl Send for Inner {}

/// A fixed-capacity pool of equal-sized, tag-word-prefixed blocks over a
/// caller-supplied arena.
///
/// `init` must be called exactly once before any other operation; an
/// uninitialized pool behaves as a zero-capacity pool (every `allocate`
/// returns null).
pub struct BitmapPool {
    inner: SpinLock<Inner>,
}

impl BitmapPool {
    /// Construct an unusable, zero-capacity pool. Call [`Self::init`]
    /// before use.
    pub const fn new() -> Self {
        Self {
            inner: SpinLock::new(Inner {
                bitmap: EMPTY_BITMAP,
                slots_base: ptr::null_mut(),
                slot_stride: 0,
                capacity: 0,
                free: 0,
                cursor: 0,
            }),
        }
    }

    /// Lay out as many `object_size`-byte blocks as fit in
    /// `arena_size_bytes` starting at `arena`.
    ///
    /// Fails silently (capacity 0) if the arena cannot hold even one
    /// block, or if `object_size` is 0.
    ///
    /// # Safety
    /// `arena` must be valid for reads and writes of `arena_size_bytes`
    /// bytes for the lifetime of this pool, and must not be accessed
    /// through any other alias while the pool is alive.
    pub unsafe fn init(&mut self, arena: *mut u8, arena_size_bytes: usize, object_size: usize) {
        let layout = layout_for(arena_size_bytes, object_size);
        let mut guard = self.inner.lock();
        if layout.capacity == 0 {
            guard.bitmap = EMPTY_BITMAP;
            guard.slots_base = ptr::null_mut();
            guard.slot_stride = 0;
            guard.capacity = 0;
            guard.free = 0;
            guard.cursor = 0;
            return;
        }
        let mut bitmap = RtlBitmap::from_raw_parts(arena, layout.capacity);
        bitmap.clear_all_bits();
        guard.bitmap = bitmap;
        guard.slots_base = arena.add(layout.bitmap_bytes);
        guard.slot_stride = layout.slot_stride;
        guard.capacity = layout.capacity;
        guard.free = layout.capacity;
        guard.cursor = 0;
    }

    /// Allocate a block, stamping `tag` into its leading owner-tag word.
    ///
    /// Returns null if the pool is full. Typical case is O(1) thanks to
    /// the scan cursor; worst case is O(capacity).
    pub fn allocate(&self, tag: usize) -> *mut u8 {
        let mut guard = self.inner.lock();
        if guard.free == 0 {
            return ptr::null_mut();
        }
        let bit = match guard.bitmap.find_clear_bit_from(guard.cursor) {
            Some(b) => b,
            None => {
                log::warn!("bitmap_pool: free count > 0 but no clear bit found");
                return ptr::null_mut();
            }
        };
        guard.bitmap.set_bit(bit);
        guard.free -= 1;
        guard.cursor = (bit + 1) % guard.capacity;

        let slot_stride = guard.slot_stride;
        let slots_base = guard.slots_base;
        let slot = unsafe { slots_base.add((bit as usize) * slot_stride) };
        unsafe {
            (slot as *mut usize).write(tag);
            slot.add(TAG_WORD_SIZE)
        }
    }

    /// Free a previously allocated payload pointer.
    ///
    /// A double-free (the slot's bit is already clear) is detected and
    /// silently ignored: `num_free` is left unchanged. A pointer that
    /// does not land on a slot boundary within this pool's range is
    /// rejected and logged; it is never dereferenced.
    ///
    /// Returns `true` if this call actually cleared a set bit, `false` if
    /// it was a no-op (tolerated double-free or a rejected pointer).
    /// Callers that must react only to a *genuine* transition from
    /// allocated to free — [`crate::mm::slab::Slab::free`]'s page-release
    /// logic, notably — use this to avoid treating a repeated no-op as a
    /// fresh state change.
    pub fn free(&self, payload: *mut u8) -> bool {
        let mut guard = self.inner.lock();
        if guard.capacity == 0 || guard.slots_base.is_null() {
            return false;
        }
        let slot = unsafe { payload.sub(TAG_WORD_SIZE) };
        let base = guard.slots_base as usize;
        let addr = slot as usize;
        if addr < base {
            log::warn!("bitmap_pool: free of out-of-range pointer rejected");
            return false;
        }
        let byte_offset = addr - base;
        if byte_offset % guard.slot_stride != 0 {
            log::warn!("bitmap_pool: free of misaligned pointer rejected");
            return false;
        }
        let index = byte_offset / guard.slot_stride;
        if index >= guard.capacity as usize {
            log::warn!("bitmap_pool: free of out-of-range pointer rejected");
            return false;
        }
        let bit = index as u32;
        if !guard.bitmap.test_bit(bit) {
            log::debug!("bitmap_pool: double-free of slot {bit} ignored");
            return false;
        }
        guard.bitmap.clear_bit(bit);
        guard.free += 1;
        true
    }

    /// Recover the owner-tag word stored immediately before `payload`,
    /// without touching allocation state. Used by [`crate::mm::slab`] to
    /// map a freed object back to its owning page.
    ///
    /// # Safety
    /// `payload` must be a pointer previously returned by `allocate` on
    /// this pool (or an equivalent bitmap pool using the same tag-word
    /// layout), and must not have been freed and reused since.
    pub unsafe fn read_tag(payload: *mut u8) -> usize {
        let slot = payload.sub(TAG_WORD_SIZE);
        (slot as *const usize).read()
    }

    pub fn num_free(&self) -> u32 {
        self.inner.lock().free
    }

    pub fn capacity(&self) -> u32 {
        self.inner.lock().capacity
    }

    pub fn is_full(&self) -> bool {
        self.inner.lock().free == 0
    }

    pub fn is_empty(&self) -> bool {
        let guard = self.inner.lock();
        guard.free == guard.capacity
    }
}

impl Default for BitmapPool {
    fn default() -> Self {
        Self::new()
    }
}

/// A bitmap with zero capacity and no backing storage; the pre-`init`
/// placeholder state.
const EMPTY_BITMAP: RtlBitmap = unsafe { RtlBitmap::from_raw_parts(ptr::null_mut(), 0) };
