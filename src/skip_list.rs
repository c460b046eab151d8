//! Lock-free skip list (C4), built on the same logical/physical delete idiom
//! as the ordered list (C3) but replayed independently at every tower level.
//!
//! A node's height never changes after it becomes visible: level 0 is
//! published first (the node is live the instant that CAS succeeds), then
//! every level above it, each independently retried against that level's own
//! predecessor. Deletion marks top-down and unlinks top-down; a node only
//! counts as logically gone once its level-0 mark bit is set.

use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::{AtomicUsize, Ordering};

use rand::Rng;
use smallvec::SmallVec;

use crate::error::{CoreError, CoreResult};
use crate::marked_ptr::{protect, Marked, MarkedAtomic, Tag1};
use crate::reclaim::{Guard, Reclaim};

/// Hard ceiling on tower height, per the "H_max <= 32" invariant.
pub const MAX_HEIGHT_LIMIT: u8 = 32;

/// Typical tower height; towers rarely need more than this, so traversal
/// scratch space is stack-allocated up to it.
const INLINE_HEIGHT: usize = 16;

type Preds<T> = SmallVec<[*const MarkedAtomic<Node<T>, Tag1>; INLINE_HEIGHT]>;
type Succs<T> = SmallVec<[*mut Node<T>; INLINE_HEIGHT]>;

/// Hazard/guard slots a traversal of a list with `max_height` levels needs:
/// a pred and a curr reservation per level, plus three scratch slots for
/// the single-node find, extract-target, and iterator use cases.
pub const fn slots_required(max_height: u8) -> usize {
    2 * max_height as usize + 3
}

fn pred_slot(level: usize) -> usize {
    2 * level
}
fn curr_slot(level: usize) -> usize {
    2 * level + 1
}

/// An intrusive skip-list node. Height is fixed at construction and never
/// changes after the node is linked.
pub struct Node<T> {
    next: Box<[MarkedAtomic<Node<T>, Tag1>]>,
    value: T,
}

impl<T> Node<T> {
    /// Builds a node with an explicit tower height (`1..=max_height`).
    pub fn with_height(value: T, height: u8) -> Box<Self> {
        let next = (0..height).map(|_| MarkedAtomic::null()).collect();
        Box::new(Node { next, value })
    }

    /// The payload.
    pub fn value(&self) -> &T {
        &self.value
    }

    /// The node's tower height.
    pub fn height(&self) -> u8 {
        self.next.len() as u8
    }
}

/// A lock-free skip list, generic over the reclamation domain `R`.
pub struct List<T, R: Reclaim> {
    head: Box<[MarkedAtomic<Node<T>, Tag1>]>,
    max_height: u8,
    reclaim: R,
    count: AtomicUsize,
}

/// Draws a tower height in `[1, max_height]` with `P(h >= k) ~= 2^-(k-1)`,
/// using the calling thread's own RNG stream (never shared, so no race on
/// the generator itself).
pub fn random_level(max_height: u8) -> u8 {
    let mut height = 1u8;
    let mut rng = rand::thread_rng();
    while height < max_height && rng.gen::<bool>() {
        height += 1;
    }
    height
}

impl<T, R: Reclaim> List<T, R> {
    /// Builds an empty list whose towers never exceed `max_height` levels.
    /// Fails if `reclaim` has a fixed hazard budget smaller than
    /// [`slots_required`].
    pub fn new(reclaim: R, max_height: u8) -> CoreResult<Self> {
        if max_height == 0 || max_height > MAX_HEIGHT_LIMIT {
            return Err(CoreError::PreconditionViolation(
                "skip list max_height must be in 1..=32",
            ));
        }
        let needed = slots_required(max_height);
        if let Some(available) = reclaim.slot_budget() {
            if available < needed {
                return Err(CoreError::ResourceExhausted {
                    needed,
                    available,
                });
            }
        }
        let head = (0..max_height).map(|_| MarkedAtomic::null()).collect();
        Ok(Self {
            head,
            max_height,
            reclaim,
            count: AtomicUsize::new(0),
        })
    }

    /// Opens a read-side section.
    pub fn pin(&self) -> R::Guard {
        self.reclaim.pin()
    }

    /// The configured tower height ceiling.
    pub fn max_height(&self) -> u8 {
        self.max_height
    }

    fn head_atomic(&self, level: usize) -> *const MarkedAtomic<Node<T>, Tag1> {
        &self.head[level]
    }

    /// One of the three scratch slots beyond the `2 * max_height` per-level
    /// pred/curr reservations: `n` selects single-node find (0), extract
    /// target (1), or iterator (2) use.
    fn scratch_slot(&self, n: usize) -> usize {
        2 * self.max_height as usize + n
    }

    /// Approximate live node count: incremented once per successful
    /// `insert`/`insert_by` and decremented once per successful
    /// `erase`/`extract_min`/`extract_max`. A concurrent mutation can make
    /// this stale before the caller observes it.
    pub fn size(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    /// `size() == 0`, from the same approximate counter.
    pub fn empty(&self) -> bool {
        self.size() == 0
    }

    /// Top-down search producing, for every level, the predecessor whose
    /// `next[level]` currently points (or just pointed) at the first node
    /// whose key is `>= key`. Marked nodes encountered along the way are
    /// physically unlinked at that level as a side effect, mirroring the
    /// ordered list's `find_position`.
    fn find_position<Q, F>(&self, guard: &R::Guard, key: &Q, cmp: &F) -> (Preds<T>, Succs<T>)
    where
        Q: ?Sized,
        F: Fn(&T, &Q) -> CmpOrdering,
    {
        'restart: loop {
            let mut preds: Preds<T> = SmallVec::from_elem(
                std::ptr::null(),
                self.max_height as usize,
            );
            let mut succs: Succs<T> =
                SmallVec::from_elem(std::ptr::null_mut(), self.max_height as usize);
            let mut pred: *const MarkedAtomic<Node<T>, Tag1> = self.head_atomic(self.max_height as usize - 1);
            for level in (0..self.max_height as usize).rev() {
                // Re-anchor `pred` at this level's head entry the first time
                // we touch a level below where an inherited `pred` was found
                // (a node's tower may not reach every level).
                let mut curr_marked = protect(
                    guard,
                    curr_slot(level),
                    unsafe { &*pred },
                    Ordering::Acquire,
                );
                loop {
                    let curr = curr_marked.ptr();
                    if curr.is_null() {
                        break;
                    }
                    let curr_node = unsafe { &*curr };
                    let succ_marked = curr_node.next[level].load(Ordering::Acquire);
                    if succ_marked.tag() & 1 != 0 {
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
                                if level == 0 {
                                    unsafe { guard.retire(curr) };
                                }
                                curr_marked = protect(
                                    guard,
                                    curr_slot(level),
                                    unsafe { &*pred },
                                    Ordering::Acquire,
                                );
                                continue;
                            }
                            Err(_) => continue 'restart,
                        }
                    }
                    if cmp(&curr_node.value, key) == CmpOrdering::Less {
                        unsafe { guard.publish(pred_slot(level), curr as *mut ()) };
                        pred = &curr_node.next[level];
                        curr_marked =
                            protect(guard, curr_slot(level), unsafe { &*pred }, Ordering::Acquire);
                        continue;
                    }
                    break;
                }
                preds[level] = pred;
                succs[level] = curr_marked.ptr();
            }
            return (preds, succs);
        }
    }

    /// Inserts `node` (whose height was already fixed by the caller, via
    /// [`random_level`]) if its key isn't already present.
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
        let height = node.height() as usize;
        let raw = Box::into_raw(node);
        loop {
            let key = unsafe { &(*raw).value };
            let (preds, succs) = self.find_position(guard, key, &cmp);
            if !succs[0].is_null() && cmp(unsafe { &(*succs[0]).value }, key) == CmpOrdering::Equal
            {
                unsafe { drop(Box::from_raw(raw)) };
                return false;
            }
            for level in 0..height {
                unsafe { (*raw).next[level].store(succs[level], 0, Ordering::Relaxed) };
            }
            // Publish level 0 first: the node becomes live the instant this
            // CAS succeeds, even though higher levels aren't linked yet.
            let expected0 = Marked::new(succs[0], 0);
            if unsafe { &*preds[0] }
                .cas_strong(expected0, raw, 0, Ordering::Release, Ordering::Relaxed)
                .is_err()
            {
                continue;
            }
            for level in 1..height {
                loop {
                    let (preds_l, succs_l) = self.find_position(guard, key, &cmp);
                    unsafe { (*raw).next[level].store(succs_l[level], 0, Ordering::Relaxed) };
                    let expected = Marked::new(succs_l[level], 0);
                    if unsafe { &*preds_l[level] }
                        .cas_strong(expected, raw, 0, Ordering::Release, Ordering::Relaxed)
                        .is_ok()
                    {
                        break;
                    }
                }
            }
            self.count.fetch_add(1, Ordering::Relaxed);
            return true;
        }
    }

    /// Removes the node matching `key`: marks every level top-down, then
    /// unlinks top-down once level 0 (the line that makes it logically
    /// gone) is marked.
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
        T: Ord,
        Q: ?Sized,
        F: Fn(&T, &Q) -> CmpOrdering,
    {
        loop {
            let (_preds, succs) = self.find_position(guard, key, &cmp);
            if succs[0].is_null() || cmp(unsafe { &(*succs[0]).value }, key) != CmpOrdering::Equal
            {
                return false;
            }
            if self.delete_node(guard, succs[0], true) {
                return true;
            }
            // Another thread won the race to mark this node first; from our
            // call's point of view it's gone either way, but only the
            // winner reports success. Re-search: the loser's next pass will
            // no longer find it.
        }
    }

    /// Marks every level of `node` top-down, then — only if *this* call won
    /// the level-0 mark CAS (the true ownership point: a node counts as
    /// logically deleted only once level 0 is marked) — physically unlinks
    /// top-down. If `retire_on_success`, also retires it; callers that
    /// instead hand the node's `Box` back to their own caller (the
    /// `extract_min`/`extract_max` family) pass `false` so the node isn't
    /// both retired here and reclaimed again there. Returns whether this
    /// call owned the deletion; a caller that loses the race must not
    /// retire or reclaim the node a second time.
    fn delete_node(&self, guard: &R::Guard, node: *mut Node<T>, retire_on_success: bool) -> bool
    where
        T: Ord,
    {
        let node_ref = unsafe { &*node };
        let height = node_ref.height() as usize;
        let mut owner = false;
        for level in (0..height).rev() {
            loop {
                let succ = node_ref.next[level].load(Ordering::Acquire);
                if succ.tag() & 1 != 0 {
                    break;
                }
                match node_ref.next[level].cas_strong(
                    Marked::new(succ.ptr(), 0),
                    succ.ptr(),
                    1,
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                ) {
                    Ok(()) => {
                        if level == 0 {
                            owner = true;
                        }
                        break;
                    }
                    Err(_) => continue,
                }
            }
        }
        if !owner {
            return false;
        }
        // Best-effort top-down physical unlink; a concurrent find finishes
        // whatever level this pass misses (it will observe the mark set
        // above and help unlink it there).
        let (preds, _) = self.find_position(guard, &node_ref.value, &|a: &T, b: &T| a.cmp(b));
        for level in 0..height {
            let succ = node_ref.next[level].load(Ordering::Acquire);
            let _ = unsafe { &*preds[level] }.cas_strong(
                Marked::new(node, 0),
                succ.ptr(),
                0,
                Ordering::Release,
                Ordering::Relaxed,
            );
        }
        self.count.fetch_sub(1, Ordering::Relaxed);
        if retire_on_success {
            unsafe { guard.retire(node) };
        }
        true
    }

    /// Applies `f` to the node matching `key` while it's guarded.
    pub fn find<Q>(&self, guard: &R::Guard, key: &Q, f: impl FnOnce(&Node<T>)) -> bool
    where
        T: std::borrow::Borrow<Q> + Ord,
        Q: Ord + ?Sized,
    {
        let (_preds, succs) =
            self.find_position(guard, key, &|a: &T, b: &Q| a.borrow().cmp(b));
        if succs[0].is_null() {
            return false;
        }
        let node = unsafe { &*succs[0] };
        if node.value.borrow().cmp(key) != CmpOrdering::Equal {
            return false;
        }
        f(node);
        true
    }

    /// Extracts and unlinks the leftmost live node, handing ownership back
    /// to the caller once no reader can still observe it.
    pub fn extract_min(&self, guard: &R::Guard) -> Option<Box<Node<T>>>
    where
        T: Ord,
    {
        loop {
            let mut curr = protect(guard, curr_slot(0), &self.head[0], Ordering::Acquire).ptr();
            loop {
                if curr.is_null() {
                    return None;
                }
                let node = unsafe { &*curr };
                let next = node.next[0].load(Ordering::Acquire);
                if next.tag() & 1 == 0 {
                    break;
                }
                curr = protect(guard, curr_slot(0), &node.next[0], Ordering::Acquire).ptr();
            }
            // `retire_on_success = false`: we take ownership of the `Box`
            // ourselves below, so `delete_node` must not also retire it.
            if self.delete_node(guard, curr, false) {
                self.reclaim.synchronize();
                return Some(unsafe { Box::from_raw(curr) });
            }
            // Lost the race to claim this node; another extraction (or an
            // `erase`) already owns it. Restart the leftmost scan.
        }
    }

    /// Extracts and unlinks the rightmost live node, handing ownership back
    /// to the caller once no reader can still observe it. The level-0 chain
    /// has no tail pointer, so finding the rightmost node costs a full scan
    /// (unlike `extract_min`, which is O(1) from `head`).
    pub fn extract_max(&self, guard: &R::Guard) -> Option<Box<Node<T>>>
    where
        T: Ord,
    {
        loop {
            let mut curr = protect(guard, curr_slot(0), &self.head[0], Ordering::Acquire).ptr();
            let mut last_live: *mut Node<T> = std::ptr::null_mut();
            while !curr.is_null() {
                let node = unsafe { &*curr };
                let next = node.next[0].load(Ordering::Acquire);
                if next.tag() & 1 == 0 {
                    // Re-publish into a dedicated scratch slot: `curr_slot(0)`
                    // keeps getting overwritten as the scan moves on, but
                    // `last_live` must stay hazard-protected until we act on
                    // it below.
                    unsafe { guard.publish(self.scratch_slot(1), curr as *mut ()) };
                    last_live = curr;
                }
                curr = protect(guard, curr_slot(0), &node.next[0], Ordering::Acquire).ptr();
            }
            if last_live.is_null() {
                return None;
            }
            if self.delete_node(guard, last_live, false) {
                self.reclaim.synchronize();
                return Some(unsafe { Box::from_raw(last_live) });
            }
            // Lost the race to claim this node; restart the rightmost scan.
        }
    }
}

impl<T, R: Reclaim> Drop for List<T, R> {
    fn drop(&mut self) {
        let mut curr = self.head[0].load(Ordering::Relaxed).ptr();
        while !curr.is_null() {
            let boxed = unsafe { Box::from_raw(curr) };
            curr = boxed.next[0].load(Ordering::Relaxed).ptr();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reclaim::hp::HpDomain;

    fn list(max_height: u8) -> List<u32, HpDomain> {
        List::new(HpDomain::new(slots_required(max_height)), max_height).unwrap()
    }

    #[test]
    fn insert_find_erase() {
        let l = list(8);
        let guard = l.pin();
        for v in [5u32, 1, 9, 3, 7] {
            let height = random_level(l.max_height());
            assert!(l.insert(&guard, Node::with_height(v, height)));
        }
        assert!(l.find(&guard, &3u32, |n| assert_eq!(*n.value(), 3)));
        assert!(l.erase(&guard, &3u32));
        assert!(!l.find(&guard, &3u32, |_| unreachable!()));
    }

    #[test]
    fn extract_min_returns_in_order() {
        let l = list(8);
        let guard = l.pin();
        for v in [4u32, 2, 6, 1] {
            let height = random_level(l.max_height());
            l.insert(&guard, Node::with_height(v, height));
        }
        let mut out = Vec::new();
        while let Some(node) = l.extract_min(&guard) {
            out.push(*node.value());
        }
        assert_eq!(out, vec![1, 2, 4, 6]);
    }

    #[test]
    fn extract_max_returns_in_reverse_order() {
        let l = list(8);
        let guard = l.pin();
        for v in [4u32, 2, 6, 1] {
            let height = random_level(l.max_height());
            l.insert(&guard, Node::with_height(v, height));
        }
        let mut out = Vec::new();
        while let Some(node) = l.extract_max(&guard) {
            out.push(*node.value());
        }
        assert_eq!(out, vec![6, 4, 2, 1]);
    }

    #[test]
    fn size_tracks_inserts_and_extracts() {
        let l = list(8);
        let guard = l.pin();
        assert!(l.empty());
        for v in [5u32, 3, 8, 3, 1] {
            let height = random_level(l.max_height());
            l.insert(&guard, Node::with_height(v, height));
        }
        assert_eq!(l.size(), 4);
        assert_eq!(l.extract_min(&guard).map(|n| *n.value()), Some(1));
        assert_eq!(l.extract_max(&guard).map(|n| *n.value()), Some(8));
        assert_eq!(l.size(), 2);
    }

    #[test]
    fn rejects_undersized_hazard_budget() {
        let domain = HpDomain::new(1);
        assert!(matches!(
            List::<u32, HpDomain>::new(domain, 8),
            Err(CoreError::ResourceExhausted { .. })
        ));
    }
}
