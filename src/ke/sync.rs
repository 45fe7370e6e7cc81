//! Critical section primitive.
//!
//! Every mutating operation in this crate (Allocate, Free, list
//! transitions) is serialized by acquiring a [`SpinLock`] on entry and
//! releasing it on every exit. There is no explicit unlock path: the
//! guard's `Drop` is the only release point, matching the "acquire on
//! enter, release on all exits" contract a scoped critical section is
//! expected to honor.
//!
//! Wraps [`spin::Mutex`] rather than hand-rolling atomic spin + interrupt
//! masking: this crate has no fixed target architecture, so the
//! `pushfq`/`cli`/`popfq` sequence the kernel's own spinlock uses is not
//! portable here, and `spin` is already used directly (not just
//! transitively) by the rest of this codebase's lineage.

use spin::Mutex;

/// A scoped mutual-exclusion region protecting `T`.
///
/// Acquisitions do not nest between distinct pool instances. Callers that
/// must hold more than one (e.g. a slab and the pool backing its page
/// supplier) are responsible for acquiring in a consistent order.
pub struct SpinLock<T> {
    inner: Mutex<T>,
}

impl<T> SpinLock<T> {
    /// Construct a new unlocked critical section around `data`.
    pub const fn new(data: T) -> Self {
        Self { inner: Mutex::new(data) }
    }

    /// Acquire the critical section, blocking the caller until available.
    ///
    /// Released automatically when the returned guard is dropped.
    #[inline]
    pub fn lock(&self) -> spin::MutexGuard<'_, T> {
        self.inner.lock()
    }
}
