use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Instant;

use quarry_core::{CacheError, Result};

use crate::stats::CacheStats;

/// A cached underlying resource (an archive reader, a parse context, ...).
///
/// `close` is called exactly once, when the registry evicts the entry or the
/// owning scope tears down. Secondary cleanup failures must be handled (and
/// logged) by the implementation; they are never propagated.
pub trait Resource: Send + 'static {
    fn close(&mut self) {}
}

/// A keyed map of reference-counted resources with atomic claim-or-create
/// semantics.
///
/// Concurrent [`acquire`](LeaseRegistry::acquire) calls for the same key
/// never open the resource twice: the first caller installs a placeholder
/// and runs the factory outside the registry lock; late arrivals block on a
/// condvar until the placeholder resolves (or is removed on factory error,
/// in which case one of them claims the key next).
///
/// Entries are closed by the LRU trim pass (only when no external borrower
/// holds a lease), or unconditionally by [`clear`](LeaseRegistry::clear) at
/// scope teardown.
pub struct LeaseRegistry<R: Resource> {
    name: &'static str,
    max_size: usize,
    stats: Arc<CacheStats>,
    slots: Mutex<HashMap<String, Slot<R>>>,
    resolved: Condvar,
    next_id: AtomicU64,
}

enum Slot<R: Resource> {
    /// A factory call for this key is in flight.
    Pending,
    Ready(Arc<LeaseEntry<R>>),
}

#[derive(Debug)]
pub struct LeaseEntry<R> {
    id: u64,
    key: String,
    state: Mutex<EntryState<R>>,
}

#[derive(Debug)]
struct EntryState<R> {
    /// `None` once the entry has been closed.
    resource: Option<R>,
    /// Leases held by callers. The registry's own baseline reference is not
    /// counted here; an entry with zero external refs is idle and evictable.
    external_refs: usize,
    closed: bool,
    last_active: Instant,
}

impl<R: Resource> LeaseRegistry<R> {
    pub fn new(name: &'static str, max_size: usize, stats: Arc<CacheStats>) -> Self {
        Self {
            name,
            max_size,
            stats,
            slots: Mutex::new(HashMap::new()),
            resolved: Condvar::new(),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn stats(&self) -> &Arc<CacheStats> {
        &self.stats
    }

    /// Number of live (non-closed) entries currently in the registry.
    pub fn len(&self) -> usize {
        self.lock_slots()
            .values()
            .filter(|slot| match slot {
                Slot::Ready(entry) => !entry.lock_state().closed,
                Slot::Pending => false,
            })
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns a lease on the entry for `key`, opening it via `factory` if
    /// no live entry exists.
    ///
    /// The factory runs without any registry lock held, so one slow open
    /// never stalls acquisition of unrelated keys. A factory failure removes
    /// the placeholder before the error is returned; it can never wedge
    /// future acquires for the key.
    pub fn acquire(&self, key: &str, factory: impl FnOnce() -> Result<R>) -> Result<Lease<R>> {
        let mut slots = self.lock_slots();
        loop {
            match slots.get(key) {
                Some(Slot::Pending) => {
                    slots = self
                        .resolved
                        .wait(slots)
                        .expect("lease registry mutex poisoned");
                }
                Some(Slot::Ready(entry)) => {
                    let entry = Arc::clone(entry);
                    let mut state = entry.lock_state();
                    if state.closed {
                        // Closed entries are terminal; replace with a fresh one.
                        drop(state);
                        slots.remove(key);
                        break;
                    }
                    state.external_refs += 1;
                    state.last_active = Instant::now();
                    drop(state);
                    drop(slots);
                    self.stats.record_hit();
                    tracing::debug!(
                        target = "quarry.cache",
                        cache = self.name,
                        key,
                        id = entry.id,
                        "reusing cached resource"
                    );
                    self.trim();
                    return Ok(Lease { entry });
                }
                None => break,
            }
        }

        // Claim the key so concurrent requesters wait instead of opening the
        // resource a second time.
        slots.insert(key.to_owned(), Slot::Pending);
        drop(slots);

        let result = factory();

        let mut slots = self.lock_slots();
        match result {
            Ok(resource) => {
                let entry = Arc::new(LeaseEntry {
                    id: self.next_id.fetch_add(1, Ordering::Relaxed),
                    key: key.to_owned(),
                    state: Mutex::new(EntryState {
                        resource: Some(resource),
                        external_refs: 1,
                        closed: false,
                        last_active: Instant::now(),
                    }),
                });
                slots.insert(key.to_owned(), Slot::Ready(Arc::clone(&entry)));
                self.resolved.notify_all();
                drop(slots);
                self.stats.record_open();
                self.stats.inc_resident();
                tracing::debug!(
                    target = "quarry.cache",
                    cache = self.name,
                    key,
                    id = entry.id,
                    "opened new resource"
                );
                self.trim();
                Ok(Lease { entry })
            }
            Err(err) => {
                slots.remove(key);
                self.resolved.notify_all();
                drop(slots);
                tracing::debug!(
                    target = "quarry.cache",
                    cache = self.name,
                    key,
                    error = %err,
                    "factory failed; placeholder removed"
                );
                Err(err)
            }
        }
    }

    /// Prunes closed entries and, while the registry exceeds its capacity,
    /// force-closes idle entries least-recently-active first.
    ///
    /// Entries with an outstanding external lease are never evicted, even if
    /// that leaves the registry over capacity: correctness wins over the
    /// size bound.
    pub fn trim(&self) {
        let victims = {
            let mut slots = self.lock_slots();
            slots.retain(|_, slot| match slot {
                Slot::Ready(entry) => !entry.lock_state().closed,
                Slot::Pending => true,
            });

            let mut victims = Vec::new();
            if slots.len() > self.max_size {
                let mut idle: Vec<(Instant, String)> = slots
                    .iter()
                    .filter_map(|(key, slot)| match slot {
                        Slot::Ready(entry) => {
                            let state = entry.lock_state();
                            (state.external_refs == 0).then(|| (state.last_active, key.clone()))
                        }
                        Slot::Pending => None,
                    })
                    .collect();
                idle.sort_by_key(|(last_active, _)| *last_active);

                for (_, key) in idle {
                    if slots.len() <= self.max_size {
                        break;
                    }
                    if let Some(Slot::Ready(entry)) = slots.remove(&key) {
                        victims.push(entry);
                    }
                }
            }
            victims
        };

        for entry in victims {
            self.stats.record_eviction();
            self.close_entry(&entry, "lru");
        }
    }

    /// Unconditionally closes every entry. Called from the scope teardown
    /// hook; outstanding leases keep their (now closed) entries and observe
    /// [`CacheError::Closed`] on further use.
    pub fn clear(&self) {
        let entries: Vec<Arc<LeaseEntry<R>>> = {
            let mut slots = self.lock_slots();
            let drained = std::mem::take(&mut *slots);
            self.resolved.notify_all();
            drained
                .into_values()
                .filter_map(|slot| match slot {
                    Slot::Ready(entry) => Some(entry),
                    Slot::Pending => None,
                })
                .collect()
        };
        for entry in entries {
            let borrowed = entry.lock_state().external_refs;
            if borrowed > 0 {
                tracing::warn!(
                    target = "quarry.cache",
                    cache = self.name,
                    key = entry.key.as_str(),
                    refs = borrowed,
                    "closing resource with outstanding leases at teardown"
                );
            }
            self.close_entry(&entry, "teardown");
        }
    }

    fn close_entry(&self, entry: &LeaseEntry<R>, reason: &'static str) {
        let resource = {
            let mut state = entry.lock_state();
            if state.closed {
                return;
            }
            state.closed = true;
            state.resource.take()
        };
        if let Some(mut resource) = resource {
            resource.close();
            self.stats.dec_resident();
            tracing::debug!(
                target = "quarry.cache",
                cache = self.name,
                key = entry.key.as_str(),
                id = entry.id,
                reason,
                "closed resource"
            );
        }
    }

    fn lock_slots(&self) -> MutexGuard<'_, HashMap<String, Slot<R>>> {
        self.slots.lock().expect("lease registry mutex poisoned")
    }
}

impl<R> LeaseEntry<R> {
    fn lock_state(&self) -> MutexGuard<'_, EntryState<R>> {
        self.state.lock().expect("lease entry mutex poisoned")
    }
}

/// A caller-held reference to a cached resource.
///
/// Dropping the lease releases the reference; there is no explicit release
/// call to forget. The resource itself is only reachable through
/// [`with`](Lease::with), so a lease can never outlive-use the underlying
/// handle after the registry closed it; it gets [`CacheError::Closed`]
/// instead.
#[derive(Debug)]
pub struct Lease<R> {
    entry: Arc<LeaseEntry<R>>,
}

impl<R> Lease<R> {
    /// Runs `f` against the resource, briefly holding the entry's lock.
    pub fn with<T>(&self, f: impl FnOnce(&R) -> T) -> Result<T> {
        let state = self.entry.lock_state();
        match &state.resource {
            Some(resource) => Ok(f(resource)),
            None => Err(CacheError::Closed),
        }
    }

    pub fn id(&self) -> u64 {
        self.entry.id
    }

    pub fn key(&self) -> &str {
        &self.entry.key
    }

    pub fn is_closed(&self) -> bool {
        self.entry.lock_state().closed
    }
}

impl<R> Clone for Lease<R> {
    fn clone(&self) -> Self {
        let mut state = self.entry.lock_state();
        state.external_refs += 1;
        drop(state);
        Self {
            entry: Arc::clone(&self.entry),
        }
    }
}

impl<R> Drop for Lease<R> {
    fn drop(&mut self) {
        let mut state = self.entry.lock_state();
        state.external_refs = state.external_refs.saturating_sub(1);
        state.last_active = Instant::now();
    }
}
