//! Read-Copy-Update reclamation, in its three "general" flavors.
//!
//! All three share one read side: `read_lock`/`read_unlock` just publish and
//! retract the calling thread's current epoch, reentrantly. They differ
//! only in when `synchronize` actually runs relative to `retire`:
//!
//! * [`Flavor::GeneralInstant`] — `retire` calls `synchronize` itself, then
//!   drops the value. Simplest, slowest per-retire.
//! * [`Flavor::GeneralBuffered`] — `retire` enqueues into a bounded ring;
//!   once it fills, the calling thread runs one `synchronize` and drains it.
//! * [`Flavor::GeneralThreaded`] — a dedicated reclaimer thread owns
//!   `synchronize` and draining; `retire` only enqueues and wakes it up.
//!   The thread holds only a [`Weak`] reference to the domain's shared
//!   state, so it exits on its own once every [`RcuDomain`] handle has been
//!   dropped, instead of needing an explicit shutdown call.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::Duration;

use super::{DeadlockPolicy, Guard, Reclaim};
use crate::error::{CoreError, CoreResult};

const INACTIVE: u64 = u64::MAX;
const RECLAIMER_POLL_INTERVAL: Duration = Duration::from_millis(20);

struct Retired {
    ptr: *mut (),
    drop_fn: unsafe fn(*mut ()),
}

// SAFETY: the pointee is only ever dereferenced by `drop_fn`, built from the
// concrete type at retire time; the type itself carries no thread affinity.
unsafe impl Send for Retired {}

struct ReaderRecord {
    epoch: AtomicU64,
    next: AtomicPtr<ReaderRecord>,
}

/// Which of the three "general" RCU flavors a domain runs.
pub enum Flavor {
    /// `retire` synchronizes immediately, inline.
    GeneralInstant,
    /// `retire` enqueues into a bounded ring and drains on overflow.
    GeneralBuffered {
        /// Ring capacity; the `C` from "after `C+1` retirements ... one
        /// `synchronize`".
        ring_capacity: usize,
    },
    /// A background thread drives `synchronize` and draining.
    GeneralThreaded,
}

struct Inner {
    global_epoch: AtomicU64,
    readers: AtomicPtr<ReaderRecord>,
    deadlock_policy: DeadlockPolicy,
    flavor_state: FlavorState,
}

enum FlavorState {
    Instant,
    Buffered {
        capacity: usize,
        ring: Mutex<VecDeque<Retired>>,
    },
    Threaded {
        pending: Mutex<Vec<Retired>>,
        condvar: Condvar,
    },
}

thread_local! {
    static NESTING: std::cell::Cell<u32> = std::cell::Cell::new(0);
}

/// An RCU reclamation domain running one of the three general flavors.
///
/// Cloning shares the same underlying state; the `GeneralThreaded` flavor's
/// reclaimer thread keeps only a weak reference to that state, so it winds
/// down on its own once the last clone is dropped.
#[derive(Clone)]
pub struct RcuDomain {
    inner: Arc<Inner>,
}

impl RcuDomain {
    /// Builds a domain. `deadlock_policy` governs what happens when a
    /// mutating call is made from inside the calling thread's own
    /// already-open read section (see [`RcuDomain::try_pin`]).
    pub fn new(flavor: Flavor, deadlock_policy: DeadlockPolicy) -> Self {
        let flavor_state = match flavor {
            Flavor::GeneralInstant => FlavorState::Instant,
            Flavor::GeneralBuffered { ring_capacity } => FlavorState::Buffered {
                capacity: ring_capacity,
                ring: Mutex::new(VecDeque::with_capacity(ring_capacity)),
            },
            Flavor::GeneralThreaded => FlavorState::Threaded {
                pending: Mutex::new(Vec::new()),
                condvar: Condvar::new(),
            },
        };
        let inner = Arc::new(Inner {
            global_epoch: AtomicU64::new(0),
            readers: AtomicPtr::new(std::ptr::null_mut()),
            deadlock_policy,
            flavor_state,
        });
        if matches!(inner.flavor_state, FlavorState::Threaded { .. }) {
            spawn_reclaimer(Arc::downgrade(&inner));
        }
        Self { inner }
    }

    fn register(&self) -> *mut ReaderRecord {
        let record = Box::into_raw(Box::new(ReaderRecord {
            epoch: AtomicU64::new(INACTIVE),
            next: AtomicPtr::new(std::ptr::null_mut()),
        }));
        loop {
            let head = self.inner.readers.load(Ordering::Relaxed);
            unsafe { (*record).next.store(head, Ordering::Relaxed) };
            if self
                .inner
                .readers
                .compare_exchange_weak(head, record, Ordering::Release, Ordering::Relaxed)
                .is_ok()
            {
                return record;
            }
        }
    }

    fn local_record(&self) -> *mut ReaderRecord {
        thread_local! {
            static RECORDS: std::cell::RefCell<std::collections::HashMap<usize, *mut ReaderRecord>> =
                std::cell::RefCell::new(std::collections::HashMap::new());
        }
        let key = Arc::as_ptr(&self.inner) as usize;
        RECORDS.with(|cell| {
            let mut map = cell.borrow_mut();
            *map.entry(key).or_insert_with(|| self.register())
        })
    }

    /// Opens a read-side section, honoring the domain's [`DeadlockPolicy`]
    /// when the calling thread already has one open: `Fail` rejects with
    /// [`CoreError::Deadlock`], `Defer` and `Ignore` both proceed (this
    /// substrate has no separate deferred-work queue, so "deferring" a
    /// mutation just means running it without assuming the caller's own
    /// still-open epoch ever advances; `synchronize`'s reader scan already
    /// only blocks on *other* readers making progress).
    pub fn try_pin(&self) -> CoreResult<RcuGuard> {
        let nested = NESTING.with(|n| n.get() > 0);
        if nested && self.inner.deadlock_policy == DeadlockPolicy::Fail {
            return Err(CoreError::Deadlock);
        }
        Ok(self.pin_inner(nested))
    }

    fn pin_inner(&self, nested: bool) -> RcuGuard {
        NESTING.with(|n| n.set(n.get() + 1));
        let record = self.local_record();
        if !nested {
            let now = self.inner.global_epoch.load(Ordering::Acquire);
            unsafe { &*record }.epoch.store(now, Ordering::Release);
        }
        RcuGuard {
            domain: self.clone(),
            record,
            nested,
        }
    }

    fn retire_dyn(&self, retired: Retired) {
        match &self.inner.flavor_state {
            FlavorState::Instant => {
                self.synchronize();
                unsafe { (retired.drop_fn)(retired.ptr) };
            }
            FlavorState::Buffered { capacity, ring } => {
                let drained = {
                    let mut ring = ring.lock().unwrap();
                    ring.push_back(retired);
                    if ring.len() >= *capacity {
                        Some(ring.drain(..).collect::<Vec<_>>())
                    } else {
                        None
                    }
                };
                if let Some(batch) = drained {
                    self.synchronize();
                    for r in batch {
                        unsafe { (r.drop_fn)(r.ptr) };
                    }
                }
            }
            FlavorState::Threaded {
                pending, condvar, ..
            } => {
                pending.lock().unwrap().push(retired);
                condvar.notify_one();
            }
        }
    }
}

/// Waits for every reader record except `exclude` to cross `target`.
///
/// `exclude` is the calling thread's own record (or null from the reclaimer
/// thread, which never holds one on this domain). A thread that calls
/// `synchronize` from inside its own still-open read section — as `retire`
/// does under the `GeneralInstant`/`GeneralBuffered` flavors, and as
/// `extract`-style container operations do — must not wait on itself: its
/// own epoch can never reach `INACTIVE` until that very section closes.
fn synchronize_inner(inner: &Inner, exclude: *mut ReaderRecord) {
    let target = inner.global_epoch.fetch_add(1, Ordering::AcqRel) + 1;
    let mut current = inner.readers.load(Ordering::Acquire);
    while !current.is_null() {
        if current != exclude {
            let record = unsafe { &*current };
            loop {
                let observed = record.epoch.load(Ordering::Acquire);
                if observed == INACTIVE || observed >= target {
                    break;
                }
                std::hint::spin_loop();
            }
        }
        current = unsafe { &*current }.next.load(Ordering::Acquire);
    }
}

/// Runs the `GeneralThreaded` reclaimer loop. Holds only a [`Weak`] handle,
/// so it never keeps the domain's state alive on its own; once every real
/// [`RcuDomain`] clone is gone the next `upgrade` fails and the thread
/// returns, winding the thread down without an explicit shutdown call.
fn spawn_reclaimer(weak: Weak<Inner>) {
    let _ = std::thread::Builder::new()
        .name("rcu-reclaimer".into())
        .spawn(move || loop {
            let inner = match weak.upgrade() {
                Some(inner) => inner,
                None => return,
            };
            let (pending, condvar) = match &inner.flavor_state {
                FlavorState::Threaded { pending, condvar } => (pending, condvar),
                _ => unreachable!("reclaimer thread only runs under GeneralThreaded"),
            };
            let batch: Vec<Retired> = {
                let mut guard = pending.lock().unwrap();
                if guard.is_empty() {
                    let (guard2, _timeout) =
                        condvar.wait_timeout(guard, RECLAIMER_POLL_INTERVAL).unwrap();
                    guard = guard2;
                }
                guard.drain(..).collect()
            };
            if batch.is_empty() {
                continue;
            }
            synchronize_inner(&inner, std::ptr::null_mut());
            for r in batch {
                unsafe { (r.drop_fn)(r.ptr) };
            }
        });
}

impl Reclaim for RcuDomain {
    type Guard = RcuGuard;

    fn pin(&self) -> RcuGuard {
        let nested = NESTING.with(|n| n.get() > 0);
        self.pin_inner(nested)
    }

    fn synchronize(&self) {
        synchronize_inner(&self.inner, self.local_record());
    }
}

/// One open RCU read-side critical section.
pub struct RcuGuard {
    domain: RcuDomain,
    record: *mut ReaderRecord,
    nested: bool,
}

impl Guard for RcuGuard {
    unsafe fn publish(&self, _slot: usize, _addr: *mut ()) {
        // The whole read-side section is the protection: RCU needs no
        // per-pointer bookkeeping once inside an open epoch.
    }

    unsafe fn retire<T: Send + 'static>(&self, ptr: *mut T) {
        unsafe fn drop_typed<T>(p: *mut ()) {
            drop(Box::from_raw(p as *mut T));
        }
        self.domain.retire_dyn(Retired {
            ptr: ptr as *mut (),
            drop_fn: drop_typed::<T>,
        });
    }

    fn is_nested(&self) -> bool {
        self.nested
    }
}

impl Drop for RcuGuard {
    fn drop(&mut self) {
        let depth = NESTING.with(|n| {
            let v = n.get() - 1;
            n.set(v);
            v
        });
        if depth == 0 {
            unsafe { &*self.record }
                .epoch
                .store(INACTIVE, Ordering::Release);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instant_flavor_frees_after_synchronize() {
        let domain = RcuDomain::new(Flavor::GeneralInstant, DeadlockPolicy::Ignore);
        let value = Box::into_raw(Box::new(3usize));
        let guard = domain.pin();
        unsafe { guard.retire(value) };
    }

    #[test]
    fn buffered_flavor_drains_on_overflow() {
        let domain = RcuDomain::new(
            Flavor::GeneralBuffered { ring_capacity: 2 },
            DeadlockPolicy::Ignore,
        );
        let guard = domain.pin();
        for _ in 0..2 {
            let value = Box::into_raw(Box::new(1usize));
            unsafe { guard.retire(value) };
        }
    }

    #[test]
    fn threaded_flavor_reclaims_eventually() {
        let domain = RcuDomain::new(Flavor::GeneralThreaded, DeadlockPolicy::Ignore);
        let guard = domain.pin();
        let value = Box::into_raw(Box::new(9usize));
        unsafe { guard.retire(value) };
        drop(guard);
        std::thread::sleep(Duration::from_millis(100));
    }

    #[test]
    fn nested_pin_detected() {
        let domain = RcuDomain::new(Flavor::GeneralInstant, DeadlockPolicy::Fail);
        let _outer = domain.pin();
        assert!(matches!(domain.try_pin(), Err(CoreError::Deadlock)));
    }

    #[test]
    fn synchronize_waits_for_active_reader() {
        use std::sync::Barrier;

        let domain = RcuDomain::new(Flavor::GeneralInstant, DeadlockPolicy::Ignore);
        let barrier = Arc::new(Barrier::new(2));
        let reader_domain = domain.clone();
        let reader_barrier = barrier.clone();
        let handle = std::thread::spawn(move || {
            let _guard = reader_domain.pin();
            reader_barrier.wait();
            std::thread::sleep(Duration::from_millis(50));
        });
        barrier.wait();
        domain.synchronize();
        handle.join().unwrap();
    }
}
