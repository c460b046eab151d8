//! The safe memory reclamation substrate (C1).
//!
//! Every lock-free container in this crate is generic over a [`Reclaim`]
//! domain rather than hard-wired to one scheme, so the hazard-pointer and
//! RCU implementations below are drop-in replacements for each other. A
//! traversal opens a [`Guard`] once (the read-side critical section for the
//! whole walk), uses it to dereference every atomic pointer it loads, and
//! hands every unlinked node to the guard's `retire` instead of freeing it
//! directly.

pub mod hp;
pub mod rcu;

/// Policy applied when a writer calls a mutating operation from inside its
/// own already-open read-side section.
///
/// Only the RCU domain enforces this; hazard pointers have no notion of a
/// "read section" distinct from the guard used for one traversal, so
/// reentrancy there is simply two independent guards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadlockPolicy {
    /// Return [`crate::error::CoreError::Deadlock`] immediately.
    Fail,
    /// Defer the mutation: run it as if the nested section had not been
    /// open, by simply not waiting on the caller's own epoch.
    Defer,
    /// Proceed as requested; the caller is responsible for the consequences
    /// (a `synchronize` called from inside a read section will block
    /// forever against itself under some flavors).
    Ignore,
}

/// A reclamation domain: something that can open [`Guard`]s and, at some
/// point after every guard that could see a retired pointer has closed,
/// actually destroy it.
pub trait Reclaim: Send + Sync {
    /// The read-side critical section type this domain hands out.
    type Guard: Guard;

    /// Opens a read-side critical section. Reentrant: nested `pin` calls on
    /// the same thread must not deadlock against each other.
    fn pin(&self) -> Self::Guard;

    /// Blocks until every guard that was open when this call started has
    /// closed at least once. Used by writers that need a hard guarantee no
    /// reader can still observe previously retired state (for example,
    /// before returning ownership of an `extract`ed node's memory to a
    /// caller who will mutate fields the container itself never touches).
    fn synchronize(&self);

    /// The number of reservation slots a single guard from this domain can
    /// publish into, if the domain has a fixed budget at all.
    ///
    /// Hazard-pointer domains return `Some(slots_per_thread)`; containers use
    /// it to fail fast at construction (see [`crate::error::CoreError::ResourceExhausted`])
    /// rather than silently running out of slots mid-traversal. RCU domains
    /// have no such budget and keep the default `None`.
    fn slot_budget(&self) -> Option<usize> {
        None
    }
}

/// An open read-side critical section, alive for the duration of one
/// traversal.
///
/// Containers never call [`Guard::publish`] directly; they call
/// [`crate::marked_ptr::protect`], which wraps the publish-then-reload idiom
/// (read the atomic, publish the address, reread, retry on mismatch) around
/// it. Under HP that idiom is load-bearing; under RCU `publish` is a no-op
/// and the whole read-side section is already the protection.
pub trait Guard {
    /// Publishes `addr` into reservation `slot` for as long as this guard
    /// lives. `slot` indexes a reservation within the guard (hazard
    /// pointers need a distinct slot per concurrently-alive pointer within
    /// one traversal, e.g. `pred` and `curr`); RCU guards ignore it.
    ///
    /// # Safety
    /// `addr` must either be null or point at an object that is valid for
    /// reads until retired.
    unsafe fn publish(&self, slot: usize, addr: *mut ());

    /// Defers destruction of `ptr` until no guard opened before this call
    /// returns can still observe it.
    ///
    /// # Safety
    /// `ptr` must already be unreachable from every live atomic pointer
    /// (physically unlinked), and must not be retired more than once.
    unsafe fn retire<T: Send + 'static>(&self, ptr: *mut T);

    /// Whether this guard was opened while the calling thread already had
    /// another guard from the same domain open. Used to implement
    /// [`DeadlockPolicy`].
    fn is_nested(&self) -> bool {
        false
    }
}
