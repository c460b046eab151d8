//! Error kinds raised by the core.
//!
//! Most operations never fail outright: a miss is `false`/`None`, not an
//! error. The variants here cover the cases section 7 of the design calls
//! out as genuine failures rather than ordinary misses.

use thiserror::Error;

/// Failure modes the core can raise.
///
/// `NotFound` and `AlreadyExists` are deliberately absent: callers observe
/// those through `bool`/`Option` return values, not through this type.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A mutating operation was attempted from inside the calling thread's
    /// own RCU read-side critical section, and the domain's deadlock policy
    /// is configured to reject rather than defer or ignore the reentrancy.
    #[error("mutating call re-entered an open read-side critical section")]
    Deadlock,

    /// A container could not reserve as many hazard-pointer slots as its
    /// traversal needs. Detected at construction time, before any pointer is
    /// ever dereferenced.
    #[error("hazard-pointer domain exhausted: need {needed} slots, have {available}")]
    ResourceExhausted {
        /// Slots the container's traversal requires.
        needed: usize,
        /// Slots actually configured on the domain.
        available: usize,
    },

    /// A supplied pointer, height, or arity violates a structural
    /// precondition (misaligned node, cuckoo arity mismatch, skip-list
    /// height out of range).
    #[error("precondition violated: {0}")]
    PreconditionViolation(&'static str),
}

/// Result alias for writer-side operations that can fail.
pub type CoreResult<T> = Result<T, CoreError>;
