//! Concurrent associative containers built on a pluggable safe memory
//! reclamation substrate.
//!
//! Every lock-free container (`michael_list`, `skip_list`, `split_list`,
//! `ellen_tree`) is generic over a [`reclaim::Reclaim`] domain: hazard
//! pointers ([`reclaim::hp::HpDomain`]) or one of the RCU flavors
//! ([`reclaim::rcu::RcuDomain`]) plug into the same traversal code. The
//! fine-grained-locking containers (`lazy_list`, `cuckoo_set`,
//! `striped_map`) use `parking_lot` mutexes directly and don't need a
//! reclamation domain at all — nothing is ever freed while a lock that
//! guards it could still be held.
//!
//! # Choosing a container
//!
//! | Need | Container |
//! |---|---|
//! | Ordered set, lock-free | [`michael_list`] |
//! | Ordered set, lock-coupled writers | [`lazy_list`] |
//! | Ordered set, `O(log n)` expected | [`skip_list`] |
//! | Unordered set, incremental resize | [`split_list`] |
//! | Ordered set, non-blocking helping | [`ellen_tree`] |
//! | Unordered set, `O(1)` expected lookup | [`cuckoo_set`] |
//! | Chained map | [`striped_map`] |
//!
//! # Logging
//!
//! Reclamation scans and resize events are logged through the `log` facade
//! at `trace`/`debug` level; wire up any `log::Log` implementation (the
//! test suite uses `env_logger`) to observe them.

pub mod cuckoo_set;
pub mod ellen_tree;
pub mod error;
pub mod lazy_list;
pub mod marked_ptr;
pub mod michael_list;
pub mod reclaim;
pub mod skip_list;
pub mod split_list;
pub mod striped_map;

pub use error::{CoreError, CoreResult};
pub use marked_ptr::{Marked, MarkedAtomic, Tag1, Tag2, TagWidth};
pub use reclaim::{Guard, Reclaim};
