//! Tagged atomic pointers (C2).
//!
//! A [`MarkedPtr`] packs up to three status bits into the low bits of a
//! pointer word. The pointee's alignment is checked at construction so the
//! tag bits never collide with address bits; callers never see a raw
//! `usize`, only a pointer plus its tag.

use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Number of low bits available for tagging. `1` or `2` cover every
/// container in this crate (logical-delete bit, or Ellen's two-bit
/// update-descriptor state).
pub trait TagWidth {
    /// Number of reserved bits.
    const BITS: u32;
    /// Mask selecting the tag bits.
    const MASK: usize = (1 << Self::BITS) - 1;
}

/// One reserved bit (logical-delete mark used by the ordered list and the
/// skip list).
pub struct Tag1;
impl TagWidth for Tag1 {
    const BITS: u32 = 1;
}

/// Two reserved bits (Ellen BST update-descriptor state).
pub struct Tag2;
impl TagWidth for Tag2 {
    const BITS: u32 = 2;
}

/// A non-atomic snapshot of a tagged pointer: an address plus its tag bits.
pub struct Marked<T> {
    ptr: *mut T,
    tag: usize,
}

impl<T> Marked<T> {
    /// Builds a snapshot from a raw, unmarked pointer and a tag.
    pub fn new(ptr: *mut T, tag: usize) -> Self {
        Self { ptr, tag }
    }

    /// The pointee, stripped of its tag bits. Null iff the original atomic
    /// held a null pointer.
    pub fn ptr(&self) -> *mut T {
        self.ptr
    }

    /// The tag bits alone.
    pub fn tag(&self) -> usize {
        self.tag
    }

    /// True if the pointee is null (the tag may still be non-zero, as a
    /// condemned-but-empty slot does in the hash trie heritage of this
    /// crate's Config-style containers).
    pub fn is_null(&self) -> bool {
        self.ptr.is_null()
    }
}

impl<T> Clone for Marked<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for Marked<T> {}

/// An atomic pointer with `W::BITS` low tag bits, CAS'd as a single machine
/// word.
///
/// Construction panics if `T`'s alignment can't host `W::BITS` tag bits;
/// this mirrors the "alignment checked on construction" invariant from the
/// design rather than silently corrupting addresses at runtime.
pub struct MarkedAtomic<T, W: TagWidth> {
    data: AtomicUsize,
    _marker: PhantomData<(*mut T, W)>,
}

fn assert_alignment<T, W: TagWidth>() {
    let align = std::mem::align_of::<T>();
    assert!(
        align >= (1 << W::BITS),
        "MarkedAtomic<{}>: alignment {} cannot host {} tag bits",
        std::any::type_name::<T>(),
        align,
        W::BITS
    );
}

impl<T, W: TagWidth> MarkedAtomic<T, W> {
    /// A null pointer with a zero tag.
    pub fn null() -> Self {
        assert_alignment::<T, W>();
        Self {
            data: AtomicUsize::new(0),
            _marker: PhantomData,
        }
    }

    /// Wraps an already-tagged raw pointer.
    pub fn from_raw(ptr: *mut T, tag: usize) -> Self {
        assert_alignment::<T, W>();
        Self {
            data: AtomicUsize::new(Self::pack(ptr, tag)),
            _marker: PhantomData,
        }
    }

    fn pack(ptr: *mut T, tag: usize) -> usize {
        debug_assert_eq!(ptr as usize & W::MASK, 0, "pointer not aligned for tag width");
        (ptr as usize) | (tag & W::MASK)
    }

    fn unpack(word: usize) -> Marked<T> {
        Marked::new((word & !W::MASK) as *mut T, word & W::MASK)
    }

    /// Reads the current pointer and tag.
    pub fn load(&self, order: Ordering) -> Marked<T> {
        Self::unpack(self.data.load(order))
    }

    /// Unconditionally stores a new pointer and tag.
    pub fn store(&self, ptr: *mut T, tag: usize, order: Ordering) {
        self.data.store(Self::pack(ptr, tag), order);
    }

    /// Strong CAS comparing both address and tag against `expected`.
    pub fn cas_strong(
        &self,
        expected: Marked<T>,
        new_ptr: *mut T,
        new_tag: usize,
        success: Ordering,
        failure: Ordering,
    ) -> Result<(), Marked<T>> {
        let old = Self::pack(expected.ptr, expected.tag);
        let new = Self::pack(new_ptr, new_tag);
        self.data
            .compare_exchange(old, new, success, failure)
            .map(|_| ())
            .map_err(Self::unpack)
    }

    /// Weak CAS; may spuriously fail even when the comparison holds, letting
    /// CAS-loop callers avoid the (rare) extra reload that `cas_strong`
    /// would otherwise force on contended retry.
    pub fn cas_weak(
        &self,
        expected: Marked<T>,
        new_ptr: *mut T,
        new_tag: usize,
        success: Ordering,
        failure: Ordering,
    ) -> Result<(), Marked<T>> {
        let old = Self::pack(expected.ptr, expected.tag);
        let new = Self::pack(new_ptr, new_tag);
        self.data
            .compare_exchange_weak(old, new, success, failure)
            .map(|_| ())
            .map_err(Self::unpack)
    }

    /// Atomically ORs `bits` into the tag, returning the previous marked
    /// value. Used to set a single status bit (e.g. logical-delete) without
    /// losing a concurrent tag update to the address.
    pub fn fetch_or_tag(&self, bits: usize, order: Ordering) -> Marked<T> {
        let prev = self.data.fetch_or(bits & W::MASK, order);
        Self::unpack(prev)
    }

    /// The raw machine word: address and tag bits combined. Exposed for
    /// diagnostics and tests only.
    pub fn all(&self, order: Ordering) -> usize {
        self.data.load(order)
    }
}

impl<T, W: TagWidth> Default for MarkedAtomic<T, W> {
    fn default() -> Self {
        Self::null()
    }
}

/// Convenience for building a never-moved sentinel pointer, used by list and
/// tree tails that must compare greater than every real key.
pub unsafe fn dangling<T>() -> *mut T {
    ptr::NonNull::dangling().as_ptr()
}

/// The publish-then-reload idiom every traversal uses to dereference a
/// [`MarkedAtomic`] safely: load it, publish the address into the guard's
/// reservation `slot`, reload, and retry if the address moved out from
/// under us before the publish was visible.
///
/// Under hazard pointers this loop is load-bearing (it's the only thing
/// standing between the reader and a concurrent `retire`). Under RCU,
/// [`crate::reclaim::Guard::publish`] is a no-op and the reread is there
/// only so both substrates share one code path; it costs one redundant
/// atomic load, never correctness.
pub fn protect<T, W: TagWidth>(
    guard: &impl crate::reclaim::Guard,
    slot: usize,
    atomic: &MarkedAtomic<T, W>,
    order: Ordering,
) -> Marked<T> {
    loop {
        let m = atomic.load(order);
        unsafe { guard.publish(slot, m.ptr() as *mut ()) };
        let m2 = atomic.load(order);
        if m2.ptr() == m.ptr() {
            return m2;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering::SeqCst;

    #[repr(align(8))]
    struct Aligned(u64);

    #[test]
    fn pack_unpack_roundtrip() {
        let val = Box::into_raw(Box::new(Aligned(42)));
        let a = MarkedAtomic::<Aligned, Tag1>::from_raw(val, 1);
        let m = a.load(SeqCst);
        assert_eq!(m.ptr(), val);
        assert_eq!(m.tag(), 1);
        unsafe { drop(Box::from_raw(val)) };
    }

    #[test]
    fn cas_strong_detects_tag_change() {
        let val = Box::into_raw(Box::new(Aligned(1)));
        let a = MarkedAtomic::<Aligned, Tag1>::from_raw(val, 0);
        let snapshot = a.load(SeqCst);
        assert!(a
            .cas_strong(snapshot, val, 1, SeqCst, SeqCst)
            .is_ok());
        // Stale snapshot (tag 0) must now fail against the updated tag 1.
        assert!(a.cas_strong(snapshot, val, 0, SeqCst, SeqCst).is_err());
        unsafe { drop(Box::from_raw(val)) };
    }

    #[test]
    #[should_panic(expected = "cannot host")]
    fn rejects_insufficient_alignment() {
        #[repr(align(1))]
        struct Unaligned(u8);
        let _ = MarkedAtomic::<Unaligned, Tag2>::null();
    }
}
