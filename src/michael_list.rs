//! Lock-free ordered singly-linked list (C3), Harris/Michael algorithm.
//!
//! The list has no sentinel head node: `head` is a bare [`MarkedAtomic`]
//! pointing straight at the first live node (or null). A traversal always
//! keeps two hazard/guard slots published — [`SLOT_PRED`] for the node whose
//! `next` field is about to be CAS'd, [`SLOT_CURR`] for the node currently
//! being examined — which is also this component's declared [`SLOTS_REQUIRED`]
//! budget for hazard-pointer domains.

use std::cmp::Ordering as CmpOrdering;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::{CoreError, CoreResult};
use crate::marked_ptr::{protect, Marked, MarkedAtomic, Tag1};
use crate::reclaim::{Guard, Reclaim};

const SLOT_PRED: usize = 0;
const SLOT_CURR: usize = 1;

/// Hazard/guard slots one traversal of this list needs at once.
pub const SLOTS_REQUIRED: usize = 2;

/// An intrusive node. Callers construct one with [`Node::new`], hand
/// ownership to [`List::insert`], and get it back (still boxed) from
/// [`List::extract`].
pub struct Node<T> {
    next: MarkedAtomic<Node<T>, Tag1>,
    value: T,
}

impl<T> Node<T> {
    /// Wraps `value` in a fresh, unlinked node.
    pub fn new(value: T) -> Box<Self> {
        Box::new(Node {
            next: MarkedAtomic::null(),
            value,
        })
    }

    /// The payload. Available on a node the caller still owns, or on one
    /// borrowed through [`List::find`] while it's guarded.
    pub fn value(&self) -> &T {
        &self.value
    }
}

struct Position<T> {
    /// The atomic whose value, if CAS'd from `curr` to something else, unlinks
    /// `curr`. Either `&List::head` or `&pred_node.next`; valid for the
    /// duration of the call because its owner (the list itself, or a node
    /// kept alive in `SLOT_PRED`) outlives it.
    pred: *const MarkedAtomic<Node<T>, Tag1>,
    /// First node whose key is `>= key`, or null at the tail.
    curr: *mut Node<T>,
}

/// A lock-free ordered list, generic over the reclamation domain `R`.
pub struct List<T, R: Reclaim> {
    head: MarkedAtomic<Node<T>, Tag1>,
    reclaim: R,
    count: AtomicUsize,
}

impl<T, R: Reclaim> List<T, R> {
    /// Builds an empty list under `reclaim`. Fails if `reclaim` has a fixed
    /// hazard-slot budget smaller than [`SLOTS_REQUIRED`].
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
            count: AtomicUsize::new(0),
        })
    }

    /// Opens a read-side section for one traversal.
    pub fn pin(&self) -> R::Guard {
        self.reclaim.pin()
    }

    fn find_position<Q, F>(&self, guard: &R::Guard, key: &Q, cmp: F) -> Position<T>
    where
        Q: ?Sized,
        F: Fn(&T, &Q) -> CmpOrdering,
    {
        loop {
            let mut pred: *const MarkedAtomic<Node<T>, Tag1> = &self.head;
            let mut curr_marked = protect(guard, SLOT_CURR, unsafe { &*pred }, Ordering::Acquire);
            let mut restart = false;
            loop {
                let curr = curr_marked.ptr();
                if curr.is_null() {
                    return Position { pred, curr };
                }
                let curr_node = unsafe { &*curr };
                let succ_marked = curr_node.next.load(Ordering::Acquire);
                if succ_marked.tag() & 1 != 0 {
                    // `curr` is logically deleted; try to physically unlink it.
                    let expected = Marked::new(curr, 0);
                    let unlinked = unsafe { &*pred }.cas_strong(
                        expected,
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
                            restart = true;
                            break;
                        }
                    }
                }
                match cmp(&curr_node.value, key) {
                    CmpOrdering::Less => {
                        unsafe { guard.publish(SLOT_PRED, curr as *mut ()) };
                        pred = &curr_node.next;
                        curr_marked = protect(guard, SLOT_CURR, &curr_node.next, Ordering::Acquire);
                    }
                    _ => return Position { pred, curr },
                }
            }
            if !restart {
                unreachable!("loop only exits via return or explicit restart");
            }
        }
    }

    /// Links `node` in if no live node already shares its key; consumes the
    /// node either way (returning it via the `Err` arm would let a caller
    /// double-free it through another path).
    pub fn insert(&self, guard: &R::Guard, node: Box<Node<T>>) -> bool
    where
        T: Ord,
    {
        self.insert_by(guard, node, |a, b| a.cmp(b))
    }

    /// `insert`, ordering nodes by a caller-supplied comparator instead of
    /// `T: Ord`. Used by containers (the split-ordered hash list) that order
    /// nodes by a derived key rather than the payload itself.
    pub fn insert_by<F>(&self, guard: &R::Guard, node: Box<Node<T>>, cmp: F) -> bool
    where
        F: Fn(&T, &T) -> CmpOrdering,
    {
        let raw = Box::into_raw(node);
        loop {
            let key = unsafe { &(*raw).value };
            let pos = self.find_position(guard, key, &cmp);
            if !pos.curr.is_null() && cmp(unsafe { &(*pos.curr).value }, key) == CmpOrdering::Equal
            {
                unsafe { drop(Box::from_raw(raw)) };
                return false;
            }
            unsafe { (*raw).next.store(pos.curr, 0, Ordering::Relaxed) };
            let expected = Marked::new(pos.curr, 0);
            let pred = unsafe { &*pos.pred };
            if pred
                .cas_strong(expected, raw, 0, Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                self.count.fetch_add(1, Ordering::Relaxed);
                return true;
            }
        }
    }

    /// Update-or-insert: if a node with `node`'s key is already present,
    /// `f` is applied to the existing payload and `node` is dropped
    /// unlinked; otherwise `node` is inserted. Returns `(existed, inserted)`.
    pub fn ensure(&self, guard: &R::Guard, node: Box<Node<T>>, f: impl FnOnce(&T)) -> (bool, bool)
    where
        T: Ord,
    {
        let raw = Box::into_raw(node);
        loop {
            let key = unsafe { &(*raw).value };
            let pos = self.find_position(guard, key, |a: &T, b: &T| a.cmp(b));
            if !pos.curr.is_null()
                && unsafe { (*pos.curr).value.cmp(key) } == CmpOrdering::Equal
            {
                f(unsafe { &(*pos.curr).value });
                unsafe { drop(Box::from_raw(raw)) };
                return (true, false);
            }
            unsafe { (*raw).next.store(pos.curr, 0, Ordering::Relaxed) };
            let expected = Marked::new(pos.curr, 0);
            let pred = unsafe { &*pos.pred };
            if pred
                .cas_strong(expected, raw, 0, Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                self.count.fetch_add(1, Ordering::Relaxed);
                return (false, true);
            }
        }
    }

    /// Removes and retires the node matching `key`, if any.
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
        self.remove_matching(guard, key, &cmp, true).is_some()
    }

    /// Removes the node matching `key` and hands it back to the caller
    /// unlinked but not retired. Blocks (via [`Reclaim::synchronize`]) until
    /// no reader can still be observing it, so the caller may immediately
    /// mutate or drop fields the container itself never touched.
    pub fn extract<Q>(&self, guard: &R::Guard, key: &Q) -> Option<Box<Node<T>>>
    where
        T: std::borrow::Borrow<Q> + Ord,
        Q: Ord + ?Sized,
    {
        let raw = self.remove_matching(guard, key, &|a: &T, b: &Q| a.borrow().cmp(b), false)?;
        self.reclaim.synchronize();
        Some(unsafe { Box::from_raw(raw) })
    }

    /// Shared body for `erase_with`/`extract`: performs the logical-then-
    /// physical delete dance and, if `retire_on_success`, hands the node to
    /// the guard's retire queue; otherwise returns the raw pointer for the
    /// caller to reclaim however it likes.
    fn remove_matching<Q, F>(
        &self,
        guard: &R::Guard,
        key: &Q,
        cmp: &F,
        retire_on_success: bool,
    ) -> Option<*mut Node<T>>
    where
        Q: ?Sized,
        F: Fn(&T, &Q) -> CmpOrdering,
    {
        loop {
            let pos = self.find_position(guard, key, cmp);
            if pos.curr.is_null() {
                return None;
            }
            let curr_node = unsafe { &*pos.curr };
            if cmp(&curr_node.value, key) != CmpOrdering::Equal {
                return None;
            }
            let succ = curr_node.next.load(Ordering::Acquire);
            if succ.tag() & 1 != 0 {
                // Someone else is already deleting this node; help by
                // restarting the search, which will finish the unlink.
                continue;
            }
            let marked = curr_node.next.cas_strong(
                Marked::new(succ.ptr(), 0),
                succ.ptr(),
                1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            );
            if marked.is_err() {
                continue;
            }
            let pred = unsafe { &*pos.pred };
            let physically_unlinked = pred
                .cas_strong(
                    Marked::new(pos.curr, 0),
                    succ.ptr(),
                    0,
                    Ordering::Release,
                    Ordering::Relaxed,
                )
                .is_ok();
            if physically_unlinked && retire_on_success {
                unsafe { guard.retire(pos.curr) };
            }
            // If the physical unlink lost the race, a subsequent traversal's
            // logical-delete check (the `succ.tag() & 1 != 0` branch in
            // `find_position`) will finish unlinking it; `curr` stays
            // reachable but dead either way. The node is logically gone the
            // moment the mark CAS above wins, so the count drops here
            // regardless of which thread finishes the physical unlink.
            self.count.fetch_sub(1, Ordering::Relaxed);
            return Some(pos.curr);
        }
    }

    /// Applies `f` to the node matching `key` while it's guarded, returning
    /// whether a match was found.
    pub fn find<Q>(&self, guard: &R::Guard, key: &Q, f: impl FnOnce(&Node<T>)) -> bool
    where
        T: std::borrow::Borrow<Q> + Ord,
        Q: Ord + ?Sized,
    {
        let pos = self.find_position(guard, key, |a: &T, b: &Q| a.borrow().cmp(b));
        if pos.curr.is_null() {
            return false;
        }
        let curr_node = unsafe { &*pos.curr };
        if curr_node.value.borrow().cmp(key) != CmpOrdering::Equal {
            return false;
        }
        f(curr_node);
        true
    }

    /// True if the list currently has no live nodes. Best-effort: a
    /// concurrent insert can make this stale before the caller observes it.
    pub fn is_empty(&self, guard: &R::Guard) -> bool {
        protect(guard, SLOT_CURR, &self.head, Ordering::Acquire)
            .ptr()
            .is_null()
    }

    /// Approximate live node count: incremented once per successful
    /// `insert`/`ensure` and decremented once per successful
    /// `erase`/`extract`. A concurrent mutation can make this stale before
    /// the caller observes it.
    pub fn size(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    /// `size() == 0`, from the same approximate counter.
    pub fn empty(&self) -> bool {
        self.size() == 0
    }
}

impl<T, R: Reclaim> Drop for List<T, R> {
    fn drop(&mut self) {
        // No concurrent access is possible once `&mut self` is held; free the
        // chain directly instead of going through the reclamation domain.
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
    fn insert_then_find() {
        let l = list();
        let guard = l.pin();
        assert!(l.insert(&guard, Node::new(5)));
        assert!(l.insert(&guard, Node::new(1)));
        assert!(!l.insert(&guard, Node::new(5)));
        assert!(l.find(&guard, &1u32, |n| assert_eq!(*n.value(), 1)));
        assert!(!l.find(&guard, &42u32, |_| unreachable!()));
    }

    #[test]
    fn erase_removes_node() {
        let l = list();
        let guard = l.pin();
        l.insert(&guard, Node::new(3));
        assert!(l.erase(&guard, &3u32));
        assert!(!l.find(&guard, &3u32, |_| unreachable!()));
        assert!(!l.erase(&guard, &3u32));
    }

    #[test]
    fn extract_hands_back_ownership() {
        let l = list();
        let guard = l.pin();
        l.insert(&guard, Node::new(9));
        let node = l.extract(&guard, &9u32).expect("present");
        assert_eq!(*node.value(), 9);
        assert!(!l.find(&guard, &9u32, |_| unreachable!()));
    }

    #[test]
    fn ensure_updates_in_place_without_inserting() {
        let l = list();
        let guard = l.pin();
        l.insert(&guard, Node::new(2));
        let mut observed = 0u32;
        let (existed, inserted) = l.ensure(&guard, Node::new(2), |v| observed = *v);
        assert!(existed);
        assert!(!inserted);
        assert_eq!(observed, 2);
    }

    #[test]
    fn size_tracks_inserts_and_removals() {
        let l = list();
        let guard = l.pin();
        assert!(l.empty());
        l.insert(&guard, Node::new(1));
        l.insert(&guard, Node::new(2));
        assert_eq!(l.size(), 2);
        assert!(l.erase(&guard, &1u32));
        assert_eq!(l.size(), 1);
        l.extract(&guard, &2u32);
        assert_eq!(l.size(), 0);
        assert!(l.empty());
    }

    #[test]
    fn ordering_is_maintained_across_inserts() {
        let l = list();
        let guard = l.pin();
        for v in [5u32, 1, 4, 2, 3] {
            l.insert(&guard, Node::new(v));
        }
        let mut seen = Vec::new();
        for v in 1..=5u32 {
            l.find(&guard, &v, |n| seen.push(*n.value()));
        }
        assert_eq!(seen, vec![1, 2, 3, 4, 5]);
    }
}
