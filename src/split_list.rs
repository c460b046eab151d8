//! Split-ordered hash list (C5): one global Harris/Michael ordered list (C3)
//! holding both real items and per-bucket dummy markers, sorted by a
//! bit-reversed hash so every bucket is a contiguous sublist delimited by
//! two dummies.
//!
//! This component keeps its own copy of the C3 traversal rather than
//! reusing [`crate::michael_list`] directly, because it needs two things
//! that module doesn't expose: starting a traversal from an arbitrary
//! *anchor* node (a bucket's dummy) instead of the list head, and ordering
//! by a derived `(hash_key, payload)` pair instead of the payload alone.
//! Bucket dummies, once installed, are never removed, so an anchor pointer
//! stays valid for the list's whole lifetime and needs no hazard
//! protection of its own.

use std::cmp::Ordering as CmpOrdering;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use parking_lot::RwLock;

use crate::error::{CoreError, CoreResult};
use crate::marked_ptr::{protect, Marked, MarkedAtomic, Tag1};
use crate::reclaim::{Guard, Reclaim};

const SLOT_PRED: usize = 0;
const SLOT_CURR: usize = 1;

/// Hazard/guard slots one traversal needs.
pub const SLOTS_REQUIRED: usize = 2;

/// An intrusive node: either a real item (`payload: Some`) or a bucket
/// dummy (`payload: None`).
pub struct Node<T> {
    next: MarkedAtomic<Node<T>, Tag1>,
    hash_key: usize,
    payload: Option<T>,
}

impl<T> Node<T> {
    fn real(hash_key: usize, payload: T) -> Box<Self> {
        Box::new(Node {
            next: MarkedAtomic::null(),
            hash_key,
            payload: Some(payload),
        })
    }

    fn dummy(hash_key: usize) -> Box<Self> {
        Box::new(Node {
            next: MarkedAtomic::null(),
            hash_key,
            payload: None,
        })
    }

    /// The payload, if this is a real node (always `Some` for anything a
    /// caller of [`List::find`] or [`List::erase`] can observe).
    pub fn value(&self) -> Option<&T> {
        self.payload.as_ref()
    }
}

fn split_key_real(hash: usize) -> usize {
    hash.reverse_bits() | 1
}

fn split_key_dummy(bucket: usize) -> usize {
    bucket.reverse_bits() & !1
}

fn parent_bucket(b: usize) -> usize {
    debug_assert!(b > 0);
    let msb = usize::BITS - 1 - b.leading_zeros();
    b & !(1usize << msb)
}

fn cmp_entry<T: Ord>(node: &Node<T>, hash_key: usize, payload: Option<&T>) -> CmpOrdering {
    node.hash_key.cmp(&hash_key).then_with(|| match (&node.payload, payload) {
        (Some(a), Some(b)) => a.cmp(b),
        _ => CmpOrdering::Equal,
    })
}

/// A split-ordered hash list, generic over the reclamation domain `R`.
pub struct List<T, R: Reclaim> {
    head: MarkedAtomic<Node<T>, Tag1>,
    buckets: RwLock<Vec<AtomicPtr<Node<T>>>>,
    item_count: AtomicUsize,
    load_factor: usize,
    max_buckets: usize,
    reclaim: R,
}

impl<T: Ord, R: Reclaim> List<T, R> {
    /// Builds a table starting with `initial_buckets` buckets (must be a
    /// power of two), growing by doubling up to `max_buckets` once
    /// `item_count / bucket_count` exceeds `load_factor`.
    pub fn new(
        reclaim: R,
        initial_buckets: usize,
        max_buckets: usize,
        load_factor: usize,
    ) -> CoreResult<Self> {
        if !initial_buckets.is_power_of_two() || !max_buckets.is_power_of_two() {
            return Err(CoreError::PreconditionViolation(
                "bucket counts must be powers of two",
            ));
        }
        if initial_buckets > max_buckets {
            return Err(CoreError::PreconditionViolation(
                "initial_buckets must not exceed max_buckets",
            ));
        }
        if let Some(available) = reclaim.slot_budget() {
            if available < SLOTS_REQUIRED {
                return Err(CoreError::ResourceExhausted {
                    needed: SLOTS_REQUIRED,
                    available,
                });
            }
        }
        let root = Box::into_raw(Node::<T>::dummy(split_key_dummy(0)));
        let buckets: Vec<AtomicPtr<Node<T>>> = (0..initial_buckets)
            .map(|i| AtomicPtr::new(if i == 0 { root } else { ptr::null_mut() }))
            .collect();
        Ok(Self {
            head: MarkedAtomic::from_raw(root, 0),
            buckets: RwLock::new(buckets),
            item_count: AtomicUsize::new(0),
            load_factor,
            max_buckets,
            reclaim,
        })
    }

    /// Opens a read-side section.
    pub fn pin(&self) -> R::Guard {
        self.reclaim.pin()
    }

    fn bucket_count(&self) -> usize {
        self.buckets.read().len()
    }

    /// Finds (lazily initializing as needed) the dummy node heading
    /// bucket `b`'s sublist.
    fn get_bucket(&self, guard: &R::Guard, b: usize) -> *mut Node<T> {
        loop {
            let existing = self.buckets.read()[b].load(Ordering::Acquire);
            if !existing.is_null() {
                return existing;
            }
            let parent = if b == 0 {
                // The root dummy is installed at construction and never null.
                unreachable!("bucket 0 is always initialized")
            } else {
                self.get_bucket(guard, parent_bucket(b))
            };
            let dummy_key = split_key_dummy(b);
            let node = Node::<T>::dummy(dummy_key);
            // A dummy's key never collides with a real item's (the LSB
            // differs) or another dummy's (bucket indices are distinct), so
            // this insert can never hit the `Err` (duplicate) arm.
            let installed = match self.insert_after(guard, parent, dummy_key, None, node) {
                Ok(ptr) => ptr,
                Err(existing) => existing,
            };
            let buckets = self.buckets.read();
            if buckets[b]
                .compare_exchange(ptr::null_mut(), installed, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                // Another thread already published this bucket's dummy
                // first; ours is still linked into the global list (a
                // harmless extra dummy) so there's nothing to free.
            }
            // Either way `buckets[b]` is non-null now; loop once more to
            // read whichever pointer won.
        }
    }

    fn find_from(
        &self,
        guard: &R::Guard,
        anchor: *mut Node<T>,
        hash_key: usize,
        payload: Option<&T>,
    ) -> (*const MarkedAtomic<Node<T>, Tag1>, *mut Node<T>) {
        loop {
            let start: *const MarkedAtomic<Node<T>, Tag1> = if anchor.is_null() {
                &self.head
            } else {
                unsafe { &(*anchor).next }
            };
            let mut pred = start;
            let mut curr_marked = protect(guard, SLOT_CURR, unsafe { &*pred }, Ordering::Acquire);
            let mut restarted = false;
            loop {
                let curr = curr_marked.ptr();
                if curr.is_null() {
                    break;
                }
                let curr_node = unsafe { &*curr };
                let succ_marked = curr_node.next.load(Ordering::Acquire);
                if succ_marked.tag() & 1 != 0 {
                    let unlinked = unsafe { &*pred }.cas_strong(
                        Marked::new(curr, 0),
                        succ_marked.ptr(),
                        0,
                        Ordering::Release,
                        Ordering::Relaxed,
                    );
                    match unlinked {
                        Ok(()) => {
                            unsafe { guard.retire(curr) };
                            curr_marked =
                                protect(guard, SLOT_CURR, unsafe { &*pred }, Ordering::Acquire);
                            continue;
                        }
                        Err(_) => {
                            restarted = true;
                            break;
                        }
                    }
                }
                if cmp_entry(curr_node, hash_key, payload) == CmpOrdering::Less {
                    unsafe { guard.publish(SLOT_PRED, curr as *mut ()) };
                    pred = &curr_node.next;
                    curr_marked = protect(guard, SLOT_CURR, &curr_node.next, Ordering::Acquire);
                    continue;
                }
                break;
            }
            if restarted {
                continue;
            }
            return (pred, curr_marked.ptr());
        }
    }

    /// Inserts `node` right after `anchor`'s sublist position for
    /// `(hash_key, payload)`. `Ok` carries the freshly linked node; `Err`
    /// carries the pre-existing node that made this a duplicate (`node`
    /// itself was dropped). Used both for real items and for publishing a
    /// bucket's dummy.
    fn insert_after(
        &self,
        guard: &R::Guard,
        anchor: *mut Node<T>,
        hash_key: usize,
        payload: Option<&T>,
        node: Box<Node<T>>,
    ) -> Result<*mut Node<T>, *mut Node<T>> {
        let raw = Box::into_raw(node);
        loop {
            let (pred, curr) = self.find_from(guard, anchor, hash_key, payload);
            if !curr.is_null() && cmp_entry(unsafe { &*curr }, hash_key, payload) == CmpOrdering::Equal {
                unsafe { drop(Box::from_raw(raw)) };
                return Err(curr);
            }
            unsafe { (*raw).next.store(curr, 0, Ordering::Relaxed) };
            if unsafe { &*pred }
                .cas_strong(Marked::new(curr, 0), raw, 0, Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                return Ok(raw);
            }
        }
    }

    /// Inserts `item` under `hash`, growing the bucket array first if the
    /// load factor is exceeded. Returns `false` if an equal item (same
    /// hash and, per `Ord`, equal payload) is already present.
    pub fn insert(&self, guard: &R::Guard, hash: usize, item: T) -> bool {
        self.maybe_grow(hash);
        let bucket = hash % self.bucket_count();
        let dummy = self.get_bucket(guard, bucket);
        let split_key = split_key_real(hash);
        let node = Node::real(split_key, item);
        let payload_ref = node.payload.as_ref().unwrap() as *const T;
        // SAFETY: `payload_ref` only needs to live through `insert_after`,
        // which never moves or frees `node`'s contents before consuming it.
        let payload_ref = unsafe { &*payload_ref };
        match self.insert_after(guard, dummy, split_key, Some(payload_ref), node) {
            Ok(_) => {
                self.item_count.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(_) => false,
        }
    }

    fn maybe_grow(&self, _hash_hint: usize) {
        let count = self.item_count.load(Ordering::Relaxed);
        let buckets = self.bucket_count();
        if buckets >= self.max_buckets || self.load_factor == 0 {
            return;
        }
        if count / buckets > self.load_factor {
            let mut guard = self.buckets.write();
            if guard.len() < self.max_buckets && count / guard.len() > self.load_factor {
                let new_len = guard.len() * 2;
                guard.resize_with(new_len, || AtomicPtr::new(ptr::null_mut()));
                log::debug!("split-ordered list grew bucket array to {new_len} buckets");
            }
        }
    }

    /// Removes the item matching `(hash, item)` (via `Ord`), if present.
    pub fn erase(&self, guard: &R::Guard, hash: usize, item: &T) -> bool {
        let bucket = hash % self.bucket_count();
        let dummy = self.get_bucket(guard, bucket);
        let split_key = split_key_real(hash);
        loop {
            let (pred, curr) = self.find_from(guard, dummy, split_key, Some(item));
            if curr.is_null() || cmp_entry(unsafe { &*curr }, split_key, Some(item)) != CmpOrdering::Equal {
                return false;
            }
            let curr_node = unsafe { &*curr };
            let succ = curr_node.next.load(Ordering::Acquire);
            if succ.tag() & 1 != 0 {
                continue;
            }
            if curr_node
                .next
                .cas_strong(Marked::new(succ.ptr(), 0), succ.ptr(), 1, Ordering::AcqRel, Ordering::Relaxed)
                .is_err()
            {
                continue;
            }
            let physically_unlinked = unsafe { &*pred }
                .cas_strong(Marked::new(curr, 0), succ.ptr(), 0, Ordering::Release, Ordering::Relaxed)
                .is_ok();
            if physically_unlinked {
                unsafe { guard.retire(curr) };
            }
            self.item_count.fetch_sub(1, Ordering::Relaxed);
            return true;
        }
    }

    /// Applies `f` to the item matching `(hash, item)` while it's guarded.
    pub fn find(&self, guard: &R::Guard, hash: usize, item: &T, f: impl FnOnce(&T)) -> bool {
        let bucket = hash % self.bucket_count();
        let dummy = self.get_bucket(guard, bucket);
        let split_key = split_key_real(hash);
        let (_pred, curr) = self.find_from(guard, dummy, split_key, Some(item));
        if curr.is_null() {
            return false;
        }
        let curr_node = unsafe { &*curr };
        if cmp_entry(curr_node, split_key, Some(item)) != CmpOrdering::Equal {
            return false;
        }
        f(curr_node.payload.as_ref().unwrap());
        true
    }

    /// Current number of real items (best-effort under concurrent writers).
    pub fn len(&self) -> usize {
        self.item_count.load(Ordering::Relaxed)
    }
}

impl<T, R: Reclaim> Drop for List<T, R> {
    fn drop(&mut self) {
        let mut curr = self.head.load(Ordering::Relaxed).ptr();
        while !curr.is_null() {
            let boxed = unsafe { Box::from_raw(curr) };
            curr = boxed.next.load(Ordering::Relaxed).ptr();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reclaim::hp::HpDomain;

    fn list() -> List<u32, HpDomain> {
        List::new(HpDomain::new(SLOTS_REQUIRED), 2, 16, 4).unwrap()
    }

    fn h(v: u32) -> usize {
        v as usize
    }

    #[test]
    fn insert_find_erase_across_buckets() {
        let l = list();
        let guard = l.pin();
        for v in [1u32, 2, 3, 4, 5, 6, 7, 8] {
            assert!(l.insert(&guard, h(v), v));
        }
        assert_eq!(l.len(), 8);
        for v in [1u32, 2, 3, 4, 5, 6, 7, 8] {
            assert!(l.find(&guard, h(v), &v, |x| assert_eq!(*x, v)));
        }
        assert!(l.erase(&guard, h(4), &4));
        assert!(!l.find(&guard, h(4), &4, |_| unreachable!()));
        assert_eq!(l.len(), 7);
    }

    #[test]
    fn duplicate_insert_rejected() {
        let l = list();
        let guard = l.pin();
        assert!(l.insert(&guard, h(9), 9));
        assert!(!l.insert(&guard, h(9), 9));
        assert_eq!(l.len(), 1);
    }

    #[test]
    fn grows_past_initial_bucket_count() {
        let l = list();
        let guard = l.pin();
        for v in 0..20u32 {
            l.insert(&guard, h(v), v);
        }
        assert!(l.bucket_count() > 2);
    }
}
