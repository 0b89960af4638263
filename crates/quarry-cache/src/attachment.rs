use std::collections::HashSet;
use std::ops::Deref;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use lru::LruCache;
use quarry_core::{CacheError, Result};

use crate::stats::CacheStats;

/// TTL + size bounded cache for whole composite-file parses (e.g. a mail
/// store), where individual sub-resources ("attachments") are opened and
/// closed far more often than the parent.
///
/// Eviction is cooperative: sweeping an entry out of the cache only drops
/// the cache's own baseline reference, outside the cache lock. An entry
/// still borrowed through a [`CompositeLease`] or [`AttachmentHandle`] stays
/// alive until its last borrower releases it.
pub struct AttachmentCache<P: Send + Sync + 'static> {
    name: &'static str,
    ttl: Duration,
    max_size: usize,
    stats: Arc<CacheStats>,
    state: Mutex<CacheState<P>>,
    resolved: Condvar,
}

struct CacheState<P: Send + Sync + 'static> {
    entries: LruCache<String, CachedParse<P>>,
    /// Keys with an in-flight factory call; late arrivals wait.
    pending: HashSet<String>,
}

struct CachedParse<P: Send + Sync + 'static> {
    entry: Arc<CompositeEntry<P>>,
    last_used: Instant,
}

impl<P: Send + Sync + 'static> AttachmentCache<P> {
    pub fn new(name: &'static str, ttl: Duration, max_size: usize) -> Self {
        Self {
            name,
            ttl,
            max_size,
            stats: Arc::new(CacheStats::default()),
            state: Mutex::new(CacheState {
                entries: LruCache::unbounded(),
                pending: HashSet::new(),
            }),
            resolved: Condvar::new(),
        }
    }

    pub fn stats(&self) -> &Arc<CacheStats> {
        &self.stats
    }

    /// Returns a lease on the parse for `key`, running `factory` if no live
    /// entry exists or the cached one has sat idle past its TTL.
    pub fn get_or_open(
        &self,
        key: &str,
        factory: impl FnOnce() -> Result<P>,
    ) -> Result<CompositeLease<P>> {
        let mut victims = Vec::new();
        {
            let mut state = self.lock_state();
            loop {
                self.sweep_locked(&mut state, &mut victims);
                if state.pending.contains(key) {
                    state = self
                        .resolved
                        .wait(state)
                        .expect("attachment cache mutex poisoned");
                    continue;
                }
                if let Some(cached) = state.entries.get_mut(key) {
                    cached.last_used = Instant::now();
                    let entry = Arc::clone(&cached.entry);
                    entry.inc_ref();
                    drop(state);
                    self.stats.record_hit();
                    release_all(victims);
                    return Ok(CompositeLease { entry });
                }
                state.pending.insert(key.to_owned());
                break;
            }
        }
        release_all(victims);

        let result = factory();

        let mut victims = Vec::new();
        let lease = {
            let mut state = self.lock_state();
            state.pending.remove(key);
            self.resolved.notify_all();
            match result {
                Ok(parse) => {
                    let entry = Arc::new(CompositeEntry::new(
                        key.to_owned(),
                        parse,
                        Arc::clone(&self.stats),
                    ));
                    // Two references up front: the cache's baseline and the
                    // caller's lease.
                    entry.inc_ref();
                    entry.inc_ref();
                    state.entries.put(
                        key.to_owned(),
                        CachedParse {
                            entry: Arc::clone(&entry),
                            last_used: Instant::now(),
                        },
                    );
                    self.stats.record_open();
                    self.stats.inc_resident();
                    while state.entries.len() > self.max_size {
                        match state.entries.pop_lru() {
                            Some((_, cached)) => {
                                self.stats.record_eviction();
                                victims.push(cached.entry);
                            }
                            None => break,
                        }
                    }
                    Ok(CompositeLease { entry })
                }
                Err(err) => Err(err),
            }
        };
        release_all(victims);
        lease
    }

    /// Evicts entries idle past the TTL. Normally run opportunistically on
    /// every [`get_or_open`](AttachmentCache::get_or_open).
    pub fn sweep_expired(&self) {
        let mut victims = Vec::new();
        {
            let mut state = self.lock_state();
            self.sweep_locked(&mut state, &mut victims);
        }
        release_all(victims);
    }

    /// Drops every cached entry. Registered as the owning scope's teardown
    /// hook by the per-format cache that wraps this.
    pub fn clear(&self) {
        let victims: Vec<_> = {
            let mut state = self.lock_state();
            let mut drained = Vec::new();
            while let Some((_, cached)) = state.entries.pop_lru() {
                drained.push(cached.entry);
            }
            drained
        };
        for entry in &victims {
            let refs = entry.refs();
            if refs > 1 {
                tracing::warn!(
                    target = "quarry.cache",
                    cache = self.name,
                    key = entry.key.as_str(),
                    refs = refs - 1,
                    "dropping composite parse with outstanding leases at teardown"
                );
            }
        }
        release_all(victims);
    }

    pub fn len(&self) -> usize {
        self.lock_state().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn sweep_locked(
        &self,
        state: &mut MutexGuard<'_, CacheState<P>>,
        victims: &mut Vec<Arc<CompositeEntry<P>>>,
    ) {
        loop {
            // The LRU tail is the least recently used entry; everything
            // behind it is fresher, so one non-expired tail ends the sweep.
            let expired = match state.entries.peek_lru() {
                Some((_, cached)) => cached.last_used.elapsed() > self.ttl,
                None => false,
            };
            if !expired {
                return;
            }
            if let Some((key, cached)) = state.entries.pop_lru() {
                tracing::debug!(
                    target = "quarry.cache",
                    cache = self.name,
                    key = key.as_str(),
                    "composite parse expired"
                );
                self.stats.record_eviction();
                victims.push(cached.entry);
            }
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, CacheState<P>> {
        self.state.lock().expect("attachment cache mutex poisoned")
    }
}

/// Releases the cache's baseline references outside any cache lock, so a
/// slow parent closure can never stall an eviction sweep.
fn release_all<P: Send + Sync + 'static>(victims: Vec<Arc<CompositeEntry<P>>>) {
    for entry in victims {
        entry.dec_ref();
    }
}

/// A whole-file parse with explicit reference counting, shared between the
/// cache and all outstanding leases and attachment handles.
pub struct CompositeEntry<P> {
    key: String,
    stats: Arc<CacheStats>,
    state: Mutex<CompositeState<P>>,
}

struct CompositeState<P> {
    parse: Option<Arc<P>>,
    refs: usize,
    /// Outstanding attachment handles, tracked separately for diagnostics.
    attachments_open: usize,
}

impl<P> CompositeEntry<P> {
    fn new(key: String, parse: P, stats: Arc<CacheStats>) -> Self {
        Self {
            key,
            stats,
            state: Mutex::new(CompositeState {
                parse: Some(Arc::new(parse)),
                refs: 0,
                attachments_open: 0,
            }),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn refs(&self) -> usize {
        self.lock_state().refs
    }

    pub fn attachments_open(&self) -> usize {
        self.lock_state().attachments_open
    }

    /// Terminal teardown: fails with [`CacheError::InUse`] while any
    /// reference is outstanding, otherwise releases the parse.
    pub fn try_to_close(&self) -> Result<()> {
        let mut state = self.lock_state();
        if state.refs > 0 {
            return Err(CacheError::InUse { refs: state.refs });
        }
        if state.parse.take().is_some() {
            self.stats.dec_resident();
        }
        Ok(())
    }

    fn inc_ref(&self) {
        self.lock_state().refs += 1;
    }

    fn dec_ref(&self) {
        let released = {
            let mut state = self.lock_state();
            state.refs = state.refs.saturating_sub(1);
            if state.refs == 0 {
                state.parse.take()
            } else {
                None
            }
        };
        if released.is_some() {
            self.stats.dec_resident();
            tracing::debug!(
                target = "quarry.cache",
                key = self.key.as_str(),
                "composite parse released"
            );
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, CompositeState<P>> {
        self.state.lock().expect("composite entry mutex poisoned")
    }
}

/// Lease on a whole composite-file parse. Dropping it releases the
/// reference; the parse closes when cache baseline and all leases are gone.
pub struct CompositeLease<P: Send + Sync + 'static> {
    entry: Arc<CompositeEntry<P>>,
}

impl<P: Send + Sync + 'static> CompositeLease<P> {
    /// Runs `f` against the parse result.
    pub fn with<T>(&self, f: impl FnOnce(&P) -> T) -> Result<T> {
        let parse = self.parse()?;
        Ok(f(&parse))
    }

    /// Opens a sub-resource against the parse. The handle holds one
    /// additional parent reference for as long as it is outstanding.
    pub fn open_attachment<A>(
        &self,
        open: impl FnOnce(&P) -> Result<A>,
    ) -> Result<AttachmentHandle<A, P>> {
        let parse = self.parse()?;
        {
            let mut state = self.entry.lock_state();
            state.refs += 1;
            state.attachments_open += 1;
        }
        match open(&parse) {
            Ok(attachment) => Ok(AttachmentHandle {
                attachment,
                parent: Arc::clone(&self.entry),
            }),
            Err(err) => {
                release_attachment(&self.entry);
                Err(err)
            }
        }
    }

    pub fn entry(&self) -> &Arc<CompositeEntry<P>> {
        &self.entry
    }

    fn parse(&self) -> Result<Arc<P>> {
        self.entry
            .lock_state()
            .parse
            .clone()
            .ok_or(CacheError::Closed)
    }
}

impl<P: Send + Sync + 'static> Clone for CompositeLease<P> {
    fn clone(&self) -> Self {
        self.entry.inc_ref();
        Self {
            entry: Arc::clone(&self.entry),
        }
    }
}

impl<P: Send + Sync + 'static> Drop for CompositeLease<P> {
    fn drop(&mut self) {
        self.entry.dec_ref();
    }
}

/// An open sub-resource pinning its parent parse.
pub struct AttachmentHandle<A, P> {
    attachment: A,
    parent: Arc<CompositeEntry<P>>,
}

impl<A, P> std::fmt::Debug for AttachmentHandle<A, P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttachmentHandle")
            .field("parent", &self.parent.key)
            .finish_non_exhaustive()
    }
}

impl<A, P> Deref for AttachmentHandle<A, P> {
    type Target = A;

    fn deref(&self) -> &A {
        &self.attachment
    }
}

impl<A, P> Drop for AttachmentHandle<A, P> {
    fn drop(&mut self) {
        release_attachment(&self.parent);
    }
}

fn release_attachment<P>(entry: &Arc<CompositeEntry<P>>) {
    {
        let mut state = entry.lock_state();
        state.attachments_open = state.attachments_open.saturating_sub(1);
    }
    entry.dec_ref();
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    struct FakeStore {
        attachments: Vec<&'static str>,
    }

    fn cache(ttl: Duration, max_size: usize) -> AttachmentCache<FakeStore> {
        AttachmentCache::new("pst", ttl, max_size)
    }

    #[test]
    fn second_open_is_a_hit() {
        let cache = cache(Duration::from_secs(60), 5);
        let opens = AtomicUsize::new(0);
        for _ in 0..2 {
            let lease = cache
                .get_or_open("k", || {
                    opens.fetch_add(1, Ordering::SeqCst);
                    Ok(FakeStore {
                        attachments: vec!["a"],
                    })
                })
                .unwrap();
            assert_eq!(lease.with(|s| s.attachments.len()).unwrap(), 1);
        }
        assert_eq!(opens.load(Ordering::SeqCst), 1);
        assert_eq!(cache.stats().hits(), 1);
    }

    #[test]
    fn released_parses_stay_cached_for_the_next_hit() {
        let cache = cache(Duration::from_secs(60), 5);
        drop(
            cache
                .get_or_open("k", || {
                    Ok(FakeStore {
                        attachments: vec!["a"],
                    })
                })
                .unwrap(),
        );
        // The cache's baseline reference keeps the parse alive after the
        // caller's lease is gone.
        assert_eq!(cache.stats().resident(), 1);
        let lease = cache
            .get_or_open("k", || panic!("must be served from cache"))
            .unwrap();
        assert_eq!(lease.with(|s| s.attachments.len()).unwrap(), 1);
        assert_eq!(cache.stats().hits(), 1);
    }

    #[test]
    fn expired_entries_are_reopened() {
        let cache = cache(Duration::from_millis(10), 5);
        let opens = AtomicUsize::new(0);
        let open = |opens: &AtomicUsize| {
            opens.fetch_add(1, Ordering::SeqCst);
            Ok(FakeStore {
                attachments: vec![],
            })
        };
        drop(cache.get_or_open("k", || open(&opens)).unwrap());
        std::thread::sleep(Duration::from_millis(30));
        drop(cache.get_or_open("k", || open(&opens)).unwrap());
        assert_eq!(opens.load(Ordering::SeqCst), 2);
        assert_eq!(cache.stats().evictions(), 1);
    }

    #[test]
    fn size_bound_evicts_least_recently_used() {
        let cache = cache(Duration::from_secs(60), 1);
        drop(
            cache
                .get_or_open("a", || {
                    Ok(FakeStore {
                        attachments: vec![],
                    })
                })
                .unwrap(),
        );
        drop(
            cache
                .get_or_open("b", || {
                    Ok(FakeStore {
                        attachments: vec![],
                    })
                })
                .unwrap(),
        );
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.stats().evictions(), 1);
        // "a" was evicted and released (no outstanding leases).
        assert_eq!(cache.stats().resident(), 1);
    }

    #[test]
    fn eviction_does_not_kill_borrowed_parses() {
        let cache = cache(Duration::from_secs(60), 1);
        let lease_a = cache
            .get_or_open("a", || {
                Ok(FakeStore {
                    attachments: vec!["x"],
                })
            })
            .unwrap();
        drop(
            cache
                .get_or_open("b", || {
                    Ok(FakeStore {
                        attachments: vec![],
                    })
                })
                .unwrap(),
        );
        // "a" was evicted from the cache but is still borrowed.
        assert_eq!(cache.stats().evictions(), 1);
        assert_eq!(lease_a.with(|s| s.attachments.len()).unwrap(), 1);
        drop(lease_a);
        assert_eq!(cache.stats().resident(), 1);
    }

    #[test]
    fn attachment_handles_pin_the_parent() {
        let cache = cache(Duration::from_secs(60), 5);
        let lease = cache
            .get_or_open("k", || {
                Ok(FakeStore {
                    attachments: vec!["first", "second"],
                })
            })
            .unwrap();
        let attachment = lease
            .open_attachment(|store| {
                store
                    .attachments
                    .first()
                    .copied()
                    .ok_or_else(|| CacheError::not_found("attachment 0"))
            })
            .unwrap();
        assert_eq!(*attachment, "first");
        assert_eq!(lease.entry().attachments_open(), 1);

        let entry = Arc::clone(lease.entry());
        drop(lease);
        cache.clear();
        // The attachment handle still pins the parse.
        assert_eq!(*attachment, "first");
        assert!(matches!(
            entry.try_to_close(),
            Err(CacheError::InUse { refs: 1 })
        ));
        drop(attachment);
        assert_eq!(entry.attachments_open(), 0);
        assert!(entry.try_to_close().is_ok());
    }

    #[test]
    fn failed_attachment_open_releases_its_reference() {
        let cache = cache(Duration::from_secs(60), 5);
        let lease = cache
            .get_or_open("k", || {
                Ok(FakeStore {
                    attachments: vec![],
                })
            })
            .unwrap();
        let err = lease
            .open_attachment(|_| Err::<(), _>(CacheError::not_found("attachment 7")))
            .unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(lease.entry().attachments_open(), 0);
        assert_eq!(lease.entry().refs(), 2);
    }
}
