//! Striped hash map (C8): a plain chained hash table where `B` buckets
//! share `L < B` mutexes (bucket `b` is protected by stripe `b mod L`).
//! `resize()` doubles `B` while `L` stays fixed, rehashing every bucket
//! under the global (every-stripe) lock.
//!
//! Each bucket is a small unordered `Vec<(K, V)>` rather than a balanced
//! tree or intrusive list — with `L` already serializing access to a whole
//! stripe of buckets, a bucket is expected to stay short, and a flat `Vec`
//! avoids per-entry heap nodes for the common case.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::cell::UnsafeCell;

use parking_lot::{Mutex, MutexGuard, RwLock};

use crate::error::{CoreError, CoreResult};

/// A user-supplied hash function over `K`.
pub trait HashOne<K>: Send + Sync {
    /// Hashes `key`.
    fn hash(&self, key: &K) -> u64;
}

/// When [`StripedMap::maybe_resize`] should double the bucket count.
pub enum ResizePolicy {
    /// Resize once `len() as f64 / bucket_count() as f64` exceeds this.
    LoadFactor(f64),
    /// Resize once any single bucket's length exceeds this.
    BucketLen(usize),
    /// Never resize automatically; callers may still call [`StripedMap::resize`].
    Never,
}

struct Bucket<K, V>(UnsafeCell<Vec<(K, V)>>);

// SAFETY: every access to a bucket's contents happens while the caller
// holds the stripe mutex `b mod L` for that bucket's index `b`, or (during
// `resize`) holds every stripe mutex and the buckets write lock.
unsafe impl<K: Send, V: Send> Sync for Bucket<K, V> {}

/// A striped chained hash map.
pub struct StripedMap<K, V, H> {
    hasher: H,
    buckets: RwLock<Vec<Bucket<K, V>>>,
    stripes: Vec<Mutex<()>>,
    count: AtomicUsize,
    resize_policy: ResizePolicy,
}

impl<K: Eq + Clone + Send + Sync, V: Send + Sync, H: HashOne<K>> StripedMap<K, V, H> {
    /// Builds a map with `initial_buckets` buckets (rounded up to a power
    /// of two) and `stripe_count` mutexes (also rounded up, and required to
    /// be `<=` the bucket count).
    pub fn new(
        hasher: H,
        initial_buckets: usize,
        stripe_count: usize,
        resize_policy: ResizePolicy,
    ) -> CoreResult<Self> {
        let b = initial_buckets.next_power_of_two().max(1);
        let l = stripe_count.next_power_of_two().max(1);
        if l > b {
            return Err(CoreError::PreconditionViolation(
                "stripe count must not exceed the initial bucket count",
            ));
        }
        Ok(Self {
            hasher,
            buckets: RwLock::new((0..b).map(|_| Bucket(UnsafeCell::new(Vec::new()))).collect()),
            stripes: (0..l).map(|_| Mutex::new(())).collect(),
            count: AtomicUsize::new(0),
            resize_policy,
        })
    }

    fn bucket_index(&self, buckets_len: usize, key: &K) -> usize {
        (self.hasher.hash(key) as usize) % buckets_len
    }

    fn stripe_for(&self, bucket_idx: usize) -> &Mutex<()> {
        &self.stripes[bucket_idx % self.stripes.len()]
    }

    fn with_bucket<R>(&self, key: &K, f: impl FnOnce(&mut Vec<(K, V)>) -> R) -> R {
        let buckets = self.buckets.read();
        let idx = self.bucket_index(buckets.len(), key);
        let _stripe: MutexGuard<'_, ()> = self.stripe_for(idx).lock();
        let bucket = unsafe { &mut *buckets[idx].0.get() };
        f(bucket)
    }

    /// Inserts or overwrites the value for `key`; returns the prior value.
    pub fn insert(&self, key: K, value: V) -> Option<V> {
        let prior = self.with_bucket(&key, |bucket| {
            if let Some(slot) = bucket.iter_mut().find(|(k, _)| *k == key) {
                Some(std::mem::replace(&mut slot.1, value))
            } else {
                bucket.push((key.clone(), value));
                None
            }
        });
        if prior.is_none() {
            self.count.fetch_add(1, Ordering::Relaxed);
        }
        self.maybe_resize();
        prior
    }

    /// Applies `f` to the value for `key`, if present.
    pub fn get<R>(&self, key: &K, f: impl FnOnce(&V) -> R) -> Option<R> {
        self.with_bucket(key, |bucket| {
            bucket.iter().find(|(k, _)| k == key).map(|(_, v)| f(v))
        })
    }

    /// Whether `key` is present.
    pub fn contains(&self, key: &K) -> bool {
        self.with_bucket(key, |bucket| bucket.iter().any(|(k, _)| k == key))
    }

    /// Removes `key`, returning its value if present.
    pub fn remove(&self, key: &K) -> Option<V> {
        let removed = self.with_bucket(key, |bucket| {
            bucket
                .iter()
                .position(|(k, _)| k == key)
                .map(|pos| bucket.swap_remove(pos).1)
        });
        if removed.is_some() {
            self.count.fetch_sub(1, Ordering::Relaxed);
        }
        removed
    }

    /// Number of entries currently stored.
    pub fn len(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    /// Whether the map holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current bucket count.
    pub fn bucket_count(&self) -> usize {
        self.buckets.read().len()
    }

    fn maybe_resize(&self) {
        let should = match self.resize_policy {
            ResizePolicy::Never => false,
            ResizePolicy::LoadFactor(threshold) => {
                let b = self.bucket_count();
                self.len() as f64 / b as f64 > threshold
            }
            ResizePolicy::BucketLen(threshold) => {
                let buckets = self.buckets.read();
                buckets
                    .iter()
                    .any(|b| unsafe { &*b.0.get() }.len() > threshold)
            }
        };
        if should {
            self.resize();
        }
    }

    /// Doubles the bucket count, holding every stripe mutex plus the global
    /// buckets write lock while every entry is rehashed into the new array.
    pub fn resize(&self) {
        let _stripe_guards: Vec<MutexGuard<'_, ()>> = self.stripes.iter().map(|m| m.lock()).collect();
        let mut buckets = self.buckets.write();
        let old_b = buckets.len();
        let new_b = old_b * 2;
        let mut entries = Vec::new();
        for bucket in buckets.iter() {
            entries.append(unsafe { &mut *bucket.0.get() });
        }
        let mut new_buckets: Vec<Bucket<K, V>> =
            (0..new_b).map(|_| Bucket(UnsafeCell::new(Vec::new()))).collect();
        for (k, v) in entries {
            let idx = (self.hasher.hash(&k) as usize) % new_b;
            unsafe { &mut *new_buckets[idx].0.get() }.push((k, v));
        }
        *buckets = new_buckets;
        log::debug!("striped map resized from {old_b} to {new_b} buckets");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct IdentityHash;
    impl HashOne<u64> for IdentityHash {
        fn hash(&self, key: &u64) -> u64 {
            *key
        }
    }

    fn map() -> StripedMap<u64, String, IdentityHash> {
        StripedMap::new(IdentityHash, 8, 2, ResizePolicy::LoadFactor(0.75)).unwrap()
    }

    #[test]
    fn insert_get_remove_roundtrip() {
        let m = map();
        assert_eq!(m.insert(1, "one".to_string()), None);
        assert_eq!(m.insert(1, "uno".to_string()), Some("one".to_string()));
        assert!(m.get(&1, |v| assert_eq!(v, "uno")).is_some());
        assert_eq!(m.remove(&1), Some("uno".to_string()));
        assert!(!m.contains(&1));
    }

    #[test]
    fn resizes_past_load_factor() {
        let m = map();
        for i in 0..20u64 {
            m.insert(i, i.to_string());
        }
        assert!(m.bucket_count() > 8);
        for i in 0..20u64 {
            assert!(m.contains(&i));
        }
        assert_eq!(m.len(), 20);
    }

    #[test]
    fn rejects_stripe_count_above_bucket_count() {
        assert!(StripedMap::<u64, u64, IdentityHash>::new(IdentityHash, 4, 8, ResizePolicy::Never).is_err());
    }
}
