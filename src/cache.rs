//! Time-bounded response cache.
//!
//! Entries expire lazily: nothing sweeps in the background, `get` compares the entry's
//! deadline against the injected [`Clock`] and deletes it when the deadline has passed.
//! An optional size bound evicts the oldest-inserted entry on overflow.
//!
//! Every [`clear`](ResponseCache::clear) starts a new epoch. Writers that captured an
//! older epoch before their call went out are ignored, so a response fetched for a
//! session that has since ended never lands in the cache.

use crate::clock::Clock;
use crate::signature::RequestSignature;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

#[derive(Debug, Clone)]
struct CacheEntry<T> {
    value: T,
    expires_at_millis: u64,
    generation: u64,
}

#[derive(Debug)]
struct CacheState<T> {
    entries: HashMap<RequestSignature, CacheEntry<T>>,
    // Insertion order; stale generations are skipped during eviction.
    order: VecDeque<(RequestSignature, u64)>,
    next_generation: u64,
    epoch: u64,
}

/// Signature-keyed cache with per-entry TTL.
#[derive(Debug)]
pub struct ResponseCache<T> {
    state: Mutex<CacheState<T>>,
    max_entries: Option<usize>,
    clock: Arc<dyn Clock>,
}

impl<T: Clone> ResponseCache<T> {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_capacity(clock, None)
    }

    /// `max_entries = None` leaves the cache unbounded.
    pub fn with_capacity(clock: Arc<dyn Clock>, max_entries: Option<usize>) -> Self {
        Self {
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                order: VecDeque::new(),
                next_generation: 0,
                epoch: 0,
            }),
            max_entries,
            clock,
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fresh value for `signature`, removing it if expired.
    pub fn get(&self, signature: &RequestSignature) -> Option<T> {
        let now = self.clock.now_millis();
        let mut state = self.lock();
        let expires_at_millis = state.entries.get(signature)?.expires_at_millis;
        if now >= expires_at_millis {
            state.entries.remove(signature);
            tracing::debug!(signature = %signature, "cache entry expired");
            return None;
        }
        state.entries.get(signature).map(|entry| entry.value.clone())
    }

    /// Current epoch; advanced by every `clear`.
    pub fn epoch(&self) -> u64 {
        self.lock().epoch
    }

    /// Store `value` until `now + ttl`. A zero TTL stores nothing.
    pub fn set(&self, signature: RequestSignature, value: T, ttl: Duration) {
        let epoch = self.epoch();
        self.set_in_epoch(signature, value, ttl, epoch);
    }

    /// Like `set`, but dropped when the cache was cleared after `epoch` was read.
    /// Returns whether the value was stored.
    pub fn set_in_epoch(&self, signature: RequestSignature, value: T, ttl: Duration, epoch: u64) -> bool {
        self.insert(signature, value, ttl, epoch, false)
    }

    /// Like `set_in_epoch`, but leaves a fresh existing entry untouched.
    pub fn fill_in_epoch(&self, signature: RequestSignature, value: T, ttl: Duration, epoch: u64) -> bool {
        self.insert(signature, value, ttl, epoch, true)
    }

    fn insert(
        &self,
        signature: RequestSignature,
        value: T,
        ttl: Duration,
        epoch: u64,
        keep_existing: bool,
    ) -> bool {
        if ttl.is_zero() {
            return false;
        }
        let now = self.clock.now_millis();
        let ttl_millis = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
        let expires_at_millis = now.saturating_add(ttl_millis);

        let mut state = self.lock();
        if state.epoch != epoch {
            tracing::debug!(signature = %signature, "dropping cache write from a cleared epoch");
            return false;
        }
        if keep_existing && state.entries.get(&signature).is_some_and(|e| now < e.expires_at_millis) {
            return false;
        }
        let generation = state.next_generation;
        state.next_generation += 1;
        state.order.push_back((signature.clone(), generation));
        state.entries.insert(signature, CacheEntry { value, expires_at_millis, generation });

        if let Some(max) = self.max_entries {
            while state.entries.len() > max {
                let Some((oldest, generation)) = state.order.pop_front() else { break };
                if state.entries.get(&oldest).is_some_and(|e| e.generation == generation) {
                    state.entries.remove(&oldest);
                    tracing::debug!(signature = %oldest, "cache entry evicted");
                }
            }
        }
        if state.order.len() > state.entries.len() * 2 + 16 {
            let CacheState { entries, order, .. } = &mut *state;
            order.retain(|(sig, generation)| {
                entries.get(sig).is_some_and(|e| e.generation == *generation)
            });
        }
        true
    }

    /// Remove one entry. Returns whether it was present.
    pub fn invalidate(&self, signature: &RequestSignature) -> bool {
        self.lock().entries.remove(signature).is_some()
    }

    /// Remove every entry whose signature matches. Returns the number removed.
    pub fn invalidate_where<F>(&self, mut predicate: F) -> usize
    where
        F: FnMut(&RequestSignature) -> bool,
    {
        let mut state = self.lock();
        let before = state.entries.len();
        state.entries.retain(|sig, _| !predicate(sig));
        before - state.entries.len()
    }

    /// Remove everything and start a new epoch.
    pub fn clear(&self) {
        let mut state = self.lock();
        state.entries.clear();
        state.order.clear();
        state.epoch += 1;
    }

    /// Stored entries, including expired ones not yet read.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
