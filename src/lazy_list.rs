//! Lazy-list variant of C3: per-node locks replace the logical/physical CAS
//! dance on the writer side; `find` stays lock-free.
//!
//! Used as the bucket sublist inside the split-ordered hash list, where a
//! stable, lockable view of adjacent nodes during resize-driven bucket
//! initialization is worth more than the Michael list's extra writer
//! parallelism.

use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::error::{CoreError, CoreResult};
use crate::marked_ptr::{protect, MarkedAtomic, Tag1};
use crate::reclaim::{Guard, Reclaim};

const SLOT_PRED: usize = 0;
const SLOT_CURR: usize = 1;

/// Hazard/guard slots one traversal needs; same budget as the lock-free list
/// since `find` walks the chain the same way.
pub const SLOTS_REQUIRED: usize = 2;

/// An intrusive lazy-list node: a payload plus a lock guarding mutation of
/// its own `deleted` flag and `next` pointer.
pub struct Node<T> {
    next: MarkedAtomic<Node<T>, Tag1>,
    deleted: AtomicBool,
    lock: Mutex<()>,
    value: T,
}

impl<T> Node<T> {
    /// Wraps `value` in a fresh, unlinked, undeleted node.
    pub fn new(value: T) -> Box<Self> {
        Box::new(Node {
            next: MarkedAtomic::null(),
            deleted: AtomicBool::new(false),
            lock: Mutex::new(()),
            value,
        })
    }

    /// The payload.
    pub fn value(&self) -> &T {
        &self.value
    }

    fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::Acquire)
    }
}

/// A lazy list: lock-free reads, lock-coupled writes.
pub struct List<T, R: Reclaim> {
    head: MarkedAtomic<Node<T>, Tag1>,
    reclaim: R,
}

impl<T, R: Reclaim> List<T, R> {
    /// Builds an empty list under `reclaim`.
    pub fn new(reclaim: R) -> CoreResult<Self> {
        if let Some(available) = reclaim.slot_budget() {
            if available < SLOTS_REQUIRED {
                return Err(CoreError::ResourceExhausted {
                    needed: SLOTS_REQUIRED,
                    available,
                });
            }
        }
        Ok(Self {
            head: MarkedAtomic::null(),
            reclaim,
        })
    }

    /// Opens a read-side section.
    pub fn pin(&self) -> R::Guard {
        self.reclaim.pin()
    }

    /// Lock-free traversal to the first node whose key is `>= key` (or the
    /// tail). Deleted nodes are skipped but not unlinked here; unlinking
    /// happens only under the owning pair's locks in `insert`/`erase`.
    fn find_unlocked<Q, F>(&self, guard: &R::Guard, key: &Q, cmp: &F) -> (*mut Node<T>, *mut Node<T>)
    where
        Q: ?Sized,
        F: Fn(&T, &Q) -> CmpOrdering,
    {
        let mut pred: *mut Node<T> = std::ptr::null_mut();
        let mut curr = protect(guard, SLOT_CURR, &self.head, Ordering::Acquire).ptr();
        loop {
            if curr.is_null() {
                return (pred, curr);
            }
            let curr_node = unsafe { &*curr };
            if !curr_node.is_deleted() && cmp(&curr_node.value, key) != CmpOrdering::Less {
                return (pred, curr);
            }
            unsafe { guard.publish(SLOT_PRED, curr as *mut ()) };
            pred = curr;
            curr = protect(guard, SLOT_CURR, &curr_node.next, Ordering::Acquire).ptr();
        }
    }

    fn pred_next<'a>(&'a self, pred: *mut Node<T>) -> &'a MarkedAtomic<Node<T>, Tag1> {
        if pred.is_null() {
            &self.head
        } else {
            unsafe { &(*pred).next }
        }
    }

    fn validate(&self, pred: *mut Node<T>, curr: *mut Node<T>) -> bool {
        let pred_ok = pred.is_null() || unsafe { !(*pred).is_deleted() };
        let curr_ok = curr.is_null() || unsafe { !(*curr).is_deleted() };
        let linked = self.pred_next(pred).load(Ordering::Acquire).ptr() == curr;
        pred_ok && curr_ok && linked
    }

    /// Inserts `node` if its key isn't already present.
    pub fn insert(&self, guard: &R::Guard, node: Box<Node<T>>) -> bool
    where
        T: Ord,
    {
        self.insert_by(guard, node, |a, b| a.cmp(b))
    }

    /// `insert` with a caller-supplied comparator.
    pub fn insert_by<F>(&self, guard: &R::Guard, node: Box<Node<T>>, cmp: F) -> bool
    where
        F: Fn(&T, &T) -> CmpOrdering,
    {
        let raw = Box::into_raw(node);
        loop {
            let key = unsafe { &(*raw).value };
            let (pred, curr) = self.find_unlocked(guard, key, &cmp);
            let _pred_lock = (!pred.is_null()).then(|| unsafe { (*pred).lock.lock() });
            let _curr_lock = (!curr.is_null()).then(|| unsafe { (*curr).lock.lock() });
            if !self.validate(pred, curr) {
                continue;
            }
            if !curr.is_null() && cmp(unsafe { &(*curr).value }, key) == CmpOrdering::Equal {
                unsafe { drop(Box::from_raw(raw)) };
                return false;
            }
            unsafe { (*raw).next.store(curr, 0, Ordering::Relaxed) };
            self.pred_next(pred)
                .store(raw, 0, Ordering::Release);
            return true;
        }
    }

    /// Removes the node matching `key`, retiring it through the reclamation
    /// domain once physically unlinked.
    pub fn erase<Q>(&self, guard: &R::Guard, key: &Q) -> bool
    where
        T: std::borrow::Borrow<Q> + Ord,
        Q: Ord + ?Sized,
    {
        self.erase_with(guard, key, |a, b| a.borrow().cmp(b))
    }

    /// `erase`, matching with a caller-supplied comparator.
    pub fn erase_with<Q, F>(&self, guard: &R::Guard, key: &Q, cmp: F) -> bool
    where
        Q: ?Sized,
        F: Fn(&T, &Q) -> CmpOrdering,
    {
        loop {
            let (pred, curr) = self.find_unlocked(guard, key, &cmp);
            if curr.is_null() || cmp(unsafe { &(*curr).value }, key) != CmpOrdering::Equal {
                return false;
            }
            let _pred_lock = (!pred.is_null()).then(|| unsafe { (*pred).lock.lock() });
            let _curr_lock = unsafe { (*curr).lock.lock() };
            if !self.validate(pred, curr) {
                continue;
            }
            let curr_node = unsafe { &*curr };
            curr_node.deleted.store(true, Ordering::Release);
            let next = curr_node.next.load(Ordering::Acquire);
            self.pred_next(pred).store(next.ptr(), 0, Ordering::Release);
            unsafe { guard.retire(curr) };
            return true;
        }
    }

    /// Applies `f` to the node matching `key` while it's guarded, lock-free.
    pub fn find<Q>(&self, guard: &R::Guard, key: &Q, f: impl FnOnce(&Node<T>)) -> bool
    where
        T: std::borrow::Borrow<Q> + Ord,
        Q: Ord + ?Sized,
    {
        let (_pred, curr) = self.find_unlocked(guard, key, &|a: &T, b: &Q| a.borrow().cmp(b));
        if curr.is_null() {
            return false;
        }
        let curr_node = unsafe { &*curr };
        if curr_node.is_deleted() || curr_node.value.borrow().cmp(key) != CmpOrdering::Equal {
            return false;
        }
        f(curr_node);
        true
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
        List::new(HpDomain::new(SLOTS_REQUIRED)).unwrap()
    }

    #[test]
    fn insert_find_erase_roundtrip() {
        let l = list();
        let guard = l.pin();
        assert!(l.insert(&guard, Node::new(10)));
        assert!(l.insert(&guard, Node::new(20)));
        assert!(!l.insert(&guard, Node::new(10)));
        assert!(l.find(&guard, &20u32, |n| assert_eq!(*n.value(), 20)));
        assert!(l.erase(&guard, &10u32));
        assert!(!l.find(&guard, &10u32, |_| unreachable!()));
    }
}
