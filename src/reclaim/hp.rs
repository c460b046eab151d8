//! Hazard-pointer memory reclamation.
//!
//! Each registered thread owns a fixed-size array of hazard slots, kept on a
//! global, append-only linked list (entries are reused across thread exits,
//! never freed, mirroring the well-known restriction that a lock-free list
//! of hazard records cannot reclaim its own nodes without a reclamation
//! scheme of its own). A reader publishes a pointer into a slot with the
//! "protect" publish/reload idiom before dereferencing it; a writer retires
//! a pointer into its own thread's list and, once that list grows past a
//! threshold, scans the union of every thread's published hazards and frees
//! whatever isn't in it.

use std::cell::{RefCell, UnsafeCell};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};
use std::sync::Arc;

use super::{DeadlockPolicy, Guard, Reclaim};
use crate::error::{CoreError, CoreResult};

/// Default scan threshold: free once a thread's retired list grows past
/// twice the domain's slot budget.
const DEFAULT_THRESHOLD_FACTOR: usize = 2;

struct Retired {
    ptr: *mut (),
    drop_fn: unsafe fn(*mut ()),
}

// SAFETY: `ptr` is an opaque handle only ever dereferenced through
// `drop_fn`, which was built from the concrete `T` at retire time on the
// thread that owned it; moving the closed-over fields between threads
// before the drop runs is fine because the drop itself does the actual
// dereference on whichever thread runs the scan.
unsafe impl Send for Retired {}

struct Record {
    hazards: Box<[AtomicPtr<()>]>,
    next: AtomicPtr<Record>,
    active: AtomicBool,
    retired: UnsafeCell<Vec<Retired>>,
}

// SAFETY: `retired` is only ever touched by the thread that registered this
// record (enforced by HpGuard/HpDomain never handing out a Record pointer
// to more than one thread at a time).
unsafe impl Sync for Record {}

struct Inner {
    slots_per_thread: usize,
    retire_threshold: usize,
    head: AtomicPtr<Record>,
}

/// A hazard-pointer reclamation domain.
///
/// Cloning is cheap (it's a handle around an `Arc`); clones share the same
/// global hazard list.
#[derive(Clone)]
pub struct HpDomain {
    inner: Arc<Inner>,
}

impl HpDomain {
    /// Creates a domain where every registered thread gets `slots_per_thread`
    /// hazard slots. Containers validate at construction that this is large
    /// enough for their traversal (see [`CoreError::ResourceExhausted`]).
    pub fn new(slots_per_thread: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                slots_per_thread,
                retire_threshold: slots_per_thread * DEFAULT_THRESHOLD_FACTOR,
                head: AtomicPtr::new(std::ptr::null_mut()),
            }),
        }
    }

    /// Number of hazard slots each thread gets under this domain.
    pub fn slots_per_thread(&self) -> usize {
        self.inner.slots_per_thread
    }

    /// Fails with [`CoreError::ResourceExhausted`] if the domain wasn't
    /// configured with at least `needed` slots per thread.
    pub fn require_slots(&self, needed: usize) -> CoreResult<()> {
        if self.inner.slots_per_thread < needed {
            Err(CoreError::ResourceExhausted {
                needed,
                available: self.inner.slots_per_thread,
            })
        } else {
            Ok(())
        }
    }

    fn register(&self) -> *mut Record {
        let record = Box::into_raw(Box::new(Record {
            hazards: (0..self.inner.slots_per_thread)
                .map(|_| AtomicPtr::new(std::ptr::null_mut()))
                .collect(),
            next: AtomicPtr::new(std::ptr::null_mut()),
            active: AtomicBool::new(true),
            retired: UnsafeCell::new(Vec::new()),
        }));
        loop {
            let head = self.inner.head.load(Ordering::Relaxed);
            unsafe { (*record).next.store(head, Ordering::Relaxed) };
            if self
                .inner
                .head
                .compare_exchange_weak(head, record, Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                return record;
            }
        }
    }

    /// Registers the calling thread explicitly, returning a handle that
    /// deactivates the thread's hazard slots (without freeing the record
    /// itself, which stays on the list for reuse) when dropped.
    pub fn register_thread(&self) -> ThreadHandle {
        let record = self.register();
        ThreadHandle {
            domain: self.clone(),
            record,
        }
    }

    fn local_record(&self) -> *mut Record {
        thread_local! {
            static RECORDS: RefCell<HashMap<usize, *mut Record>> = RefCell::new(HashMap::new());
        }
        let key = Arc::as_ptr(&self.inner) as usize;
        RECORDS.with(|cell| {
            let mut map = cell.borrow_mut();
            *map.entry(key).or_insert_with(|| self.register())
        })
    }

    fn collect_hazards(&self) -> Vec<*mut ()> {
        let mut out = Vec::new();
        let mut current = self.inner.head.load(Ordering::Acquire);
        while !current.is_null() {
            let record = unsafe { &*current };
            if record.active.load(Ordering::Acquire) {
                for hazard in record.hazards.iter() {
                    let p = hazard.load(Ordering::Acquire);
                    if !p.is_null() {
                        out.push(p);
                    }
                }
            }
            current = record.next.load(Ordering::Acquire);
        }
        out
    }

    fn scan(&self, record: &Record) {
        let retired = unsafe { &mut *record.retired.get() };
        if retired.len() < self.inner.retire_threshold {
            return;
        }
        self.scan_forced(record);
    }

    fn scan_forced(&self, record: &Record) {
        let hazards = self.collect_hazards();
        let retired = unsafe { &mut *record.retired.get() };
        let before = retired.len();
        retired.retain(|r| {
            if hazards.contains(&r.ptr) {
                true
            } else {
                unsafe { (r.drop_fn)(r.ptr) };
                false
            }
        });
        log::trace!(
            "hazard-pointer scan reclaimed {} of {} retired nodes ({} hazards live)",
            before - retired.len(),
            before,
            hazards.len()
        );
    }
}

/// RAII registration for a single thread. Dropping it deactivates the
/// thread's hazard slots; the underlying record is kept on the domain's
/// list (which never shrinks) and reused if the thread registers again.
pub struct ThreadHandle {
    domain: HpDomain,
    record: *mut Record,
}

impl Drop for ThreadHandle {
    fn drop(&mut self) {
        let record = unsafe { &*self.record };
        record.active.store(false, Ordering::Release);
        self.domain.scan(record);
    }
}

/// One open hazard-pointer traversal.
pub struct HpGuard {
    domain: HpDomain,
    record: *mut Record,
}

impl Reclaim for HpDomain {
    type Guard = HpGuard;

    fn pin(&self) -> HpGuard {
        let record = self.local_record();
        unsafe { &*record }.active.store(true, Ordering::Release);
        HpGuard {
            domain: self.clone(),
            record,
        }
    }

    fn synchronize(&self) {
        // No grace period to wait for under HP: forcing an out-of-schedule
        // scan on our own thread's retired list is the closest analogue.
        let record = unsafe { &*self.local_record() };
        self.scan_forced(record);
    }

    fn slot_budget(&self) -> Option<usize> {
        Some(self.inner.slots_per_thread)
    }
}

impl Guard for HpGuard {
    unsafe fn publish(&self, slot: usize, addr: *mut ()) {
        let record = &*self.record;
        record.hazards[slot].store(addr, Ordering::Release);
    }

    unsafe fn retire<T: Send + 'static>(&self, ptr: *mut T) {
        unsafe fn drop_typed<T>(p: *mut ()) {
            drop(Box::from_raw(p as *mut T));
        }
        let record = &*self.record;
        (*record.retired.get()).push(Retired {
            ptr: ptr as *mut (),
            drop_fn: drop_typed::<T>,
        });
        self.domain.scan(record);
    }
}

/// The policy this domain applies to a writer calling in from inside its
/// own guard. Hazard pointers have no notion of "inside a read section"
/// distinct from the guard used for one traversal, so every [`pin`] opens
/// an independent section; this is exposed only so containers generic over
/// [`Reclaim`] can query a uniform API.
pub fn deadlock_policy() -> DeadlockPolicy {
    DeadlockPolicy::Ignore
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering::SeqCst;

    #[test]
    fn protect_sees_live_value() {
        let domain = HpDomain::new(4);
        let value = Box::into_raw(Box::new(55usize));
        let guard = domain.pin();
        unsafe { guard.publish(0, value as *mut ()) };
        assert_eq!(unsafe { *value }, 55);
        unsafe { drop(Box::from_raw(value)) };
    }

    #[test]
    fn retire_defers_until_unprotected() {
        let domain = HpDomain::new(2);
        let value = Box::into_raw(Box::new(7usize));
        let src = AtomicPtr::new(value);

        let reader = domain.pin();
        let protected = src.load(SeqCst);
        unsafe { reader.publish(0, protected as *mut ()) };

        let writer = domain.pin();
        src.store(std::ptr::null_mut(), SeqCst);
        unsafe { writer.retire(protected) };
        // Force past-threshold scan attempts; the value must survive them
        // because `reader` still has it published.
        for _ in 0..8 {
            domain.synchronize();
        }
        assert_eq!(unsafe { *protected }, 7);
        drop(reader);
    }

    #[test]
    fn resource_exhausted_detected_at_construction() {
        let domain = HpDomain::new(2);
        assert!(domain.require_slots(2).is_ok());
        assert!(matches!(
            domain.require_slots(5),
            Err(CoreError::ResourceExhausted { needed: 5, available: 2 })
        ));
    }
}
