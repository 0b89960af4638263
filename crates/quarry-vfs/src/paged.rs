use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Instant;

use lru::LruCache;
use quarry_cache::CacheStats;
use quarry_core::{CacheError, FileSpec, Result, Scope};

use crate::accessor::{Accessor, AccessorRegistry, AccessorStream};

/// A byte-range reader with a fixed-size page cache, shared across all
/// plugins that need random access to the same underlying file.
///
/// Closing a paged reader drops the OS handle and the page cache but leaves
/// the reader itself usable: the next [`read_at`](PagedReader::read_at)
/// transparently reopens the accessor. Losing a pool slot therefore degrades
/// to "reopen on demand", never to an error.
pub struct PagedReader {
    key: String,
    spec: FileSpec,
    accessor: Arc<dyn Accessor>,
    page_size: u64,
    page_count: usize,
    stats: Arc<CacheStats>,
    pool: Weak<Mutex<PoolInner>>,
    state: Mutex<ReaderState>,
}

struct ReaderState {
    stream: Option<Box<dyn AccessorStream>>,
    /// page index -> page contents; short pages mark end of file.
    pages: LruCache<u64, Box<[u8]>>,
    last_active: Instant,
}

impl PagedReader {
    fn new(
        key: String,
        spec: FileSpec,
        accessor: Arc<dyn Accessor>,
        page_size: u64,
        page_count: usize,
        stats: Arc<CacheStats>,
        pool: Weak<Mutex<PoolInner>>,
    ) -> Self {
        Self {
            key,
            spec,
            accessor,
            page_size,
            page_count,
            stats,
            pool,
            state: Mutex::new(ReaderState {
                stream: None,
                pages: LruCache::unbounded(),
                last_active: Instant::now(),
            }),
        }
    }

    pub fn spec(&self) -> &FileSpec {
        &self.spec
    }

    pub fn is_open(&self) -> bool {
        self.lock_state().stream.is_some()
    }

    /// Reads up to `buf.len()` bytes at `offset`, returning the number of
    /// bytes read (short only at end of file).
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        let mut state = self.lock_state();
        let mut reopened = false;
        if state.stream.is_none() {
            self.open_locked(&mut state)?;
            reopened = true;
        }

        let mut total = 0;
        while total < buf.len() {
            let pos = offset + total as u64;
            let page_index = pos / self.page_size;
            let page_offset = (pos % self.page_size) as usize;

            if !state.pages.contains(&page_index) {
                let page = self.load_page_locked(&mut state, page_index)?;
                state.pages.put(page_index, page);
                while state.pages.len() > self.page_count {
                    state.pages.pop_lru();
                }
            }
            let page = state
                .pages
                .get(&page_index)
                .expect("page inserted above is present");

            if page_offset >= page.len() {
                break;
            }
            let n = (buf.len() - total).min(page.len() - page_offset);
            buf[total..total + n].copy_from_slice(&page[page_offset..page_offset + n]);
            total += n;

            // A short page is the end of the file.
            if (page.len() as u64) < self.page_size {
                break;
            }
        }
        state.last_active = Instant::now();
        drop(state);

        if reopened {
            self.mark_active();
        }
        Ok(total)
    }

    /// Drops the OS handle and the page cache. The reader stays usable.
    pub fn close(&self) {
        let had_stream = {
            let mut state = self.lock_state();
            state.pages.clear();
            state.stream.take().is_some()
        };
        if had_stream {
            self.stats.dec_resident();
            tracing::debug!(
                target = "quarry.vfs",
                key = self.key.as_str(),
                "paged reader closed"
            );
        }
        if let Some(pool) = self.pool.upgrade() {
            pool.lock()
                .expect("reader pool mutex poisoned")
                .active
                .pop(&self.key);
        }
    }

    fn open_locked(&self, state: &mut MutexGuard<'_, ReaderState>) -> Result<()> {
        let stream = self.accessor.open(&self.spec)?;
        state.stream = Some(stream);
        state.pages.clear();
        self.stats.record_open();
        self.stats.inc_resident();
        tracing::debug!(
            target = "quarry.vfs",
            key = self.key.as_str(),
            "paged reader opened"
        );
        Ok(())
    }

    /// Reads one page from the underlying stream.
    ///
    /// A zero-byte result can be spurious if the handle was invalidated by a
    /// concurrent refresh; exactly one reopen-and-retry is allowed before the
    /// result is treated as genuine end-of-stream.
    fn load_page_locked(
        &self,
        state: &mut MutexGuard<'_, ReaderState>,
        page_index: u64,
    ) -> Result<Box<[u8]>> {
        for attempt in 0..2 {
            let stream = state.stream.as_mut().ok_or(CacheError::Closed)?;
            stream.seek(SeekFrom::Start(page_index * self.page_size))?;

            let mut page = vec![0u8; self.page_size as usize];
            let mut filled = 0;
            loop {
                match stream.read(&mut page[filled..]) {
                    Ok(0) => break,
                    Ok(n) => {
                        filled += n;
                        if filled == page.len() {
                            break;
                        }
                    }
                    Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(err) => return Err(err.into()),
                }
            }

            if filled > 0 || attempt > 0 {
                page.truncate(filled);
                return Ok(page.into_boxed_slice());
            }

            tracing::debug!(
                target = "quarry.vfs",
                key = self.key.as_str(),
                page_index,
                "zero-byte page read; reopening once before accepting EOF"
            );
            state.stream = None;
            self.stats.dec_resident();
            self.open_locked(state)?;
        }
        Ok(Box::default())
    }

    fn mark_active(&self) {
        let Some(pool) = self.pool.upgrade() else {
            return;
        };
        let victims = {
            let mut inner = pool.lock().expect("reader pool mutex poisoned");
            let this = match inner.readers.get(&self.key) {
                Some(reader) => Arc::clone(reader),
                None => return,
            };
            inner.active.put(self.key.clone(), this);
            let mut victims = Vec::new();
            while inner.active.len() > inner.capacity {
                match inner.active.pop_lru() {
                    Some((_, reader)) => victims.push(reader),
                    None => break,
                }
            }
            victims
        };
        // Close victims outside the pool lock; close() re-locks the pool
        // briefly to deregister.
        for reader in victims {
            reader.close();
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, ReaderState> {
        self.state.lock().expect("paged reader mutex poisoned")
    }
}

struct PoolInner {
    capacity: usize,
    readers: HashMap<String, Arc<PagedReader>>,
    /// Readers currently holding an open OS handle, most recently used last.
    active: LruCache<String, Arc<PagedReader>>,
}

/// Pool of paged readers keyed by `(accessor, path)`, reused across
/// unrelated plugins.
///
/// Capacity is enforced only across *active* readers (those holding an open
/// handle); inactive entries cost nothing but memory and reopen on demand.
pub struct ReaderPool {
    page_size: u64,
    page_count: usize,
    stats: Arc<CacheStats>,
    registry: Arc<AccessorRegistry>,
    inner: Arc<Mutex<PoolInner>>,
}

impl ReaderPool {
    /// The pool owned by `scope`, created on first use and emptied at scope
    /// teardown.
    pub fn for_scope(scope: &Scope) -> Arc<Self> {
        scope.cache_get_or_init("reader_pool", || {
            let config = scope.config();
            let pool = Arc::new(Self::new(
                config.reader_pool_capacity,
                config.reader_page_size,
                config.reader_page_count,
                AccessorRegistry::for_scope(scope),
            ));
            let for_cleanup = Arc::clone(&pool);
            scope.register_cleanup(move || for_cleanup.clear());
            pool
        })
    }

    pub fn new(
        capacity: usize,
        page_size: u64,
        page_count: usize,
        registry: Arc<AccessorRegistry>,
    ) -> Self {
        Self {
            page_size,
            page_count,
            stats: Arc::new(CacheStats::default()),
            registry,
            inner: Arc::new(Mutex::new(PoolInner {
                capacity,
                readers: HashMap::new(),
                active: LruCache::unbounded(),
            })),
        }
    }

    pub fn stats(&self) -> &Arc<CacheStats> {
        &self.stats
    }

    /// Number of readers currently holding an open OS handle.
    pub fn active_len(&self) -> usize {
        self.lock_inner().active.len()
    }

    /// Returns the pooled reader for `spec`, creating it (without opening
    /// the underlying file yet) on first use.
    pub fn get_or_create(&self, spec: &FileSpec) -> Result<Arc<PagedReader>> {
        let key = spec.cache_key("paged");
        let mut inner = self.lock_inner();
        if let Some(reader) = inner.readers.get(&key) {
            self.stats.record_hit();
            return Ok(Arc::clone(reader));
        }
        let accessor = self.registry.get(&spec.accessor)?;
        let reader = Arc::new(PagedReader::new(
            key.clone(),
            spec.clone(),
            accessor,
            self.page_size,
            self.page_count,
            Arc::clone(&self.stats),
            Arc::downgrade(&self.inner),
        ));
        inner.readers.insert(key, Arc::clone(&reader));
        Ok(reader)
    }

    /// Closes and forgets every reader. Scope teardown hook.
    pub fn clear(&self) {
        let readers: Vec<_> = {
            let mut inner = self.lock_inner();
            inner.active.clear();
            inner.readers.drain().map(|(_, reader)| reader).collect()
        };
        for reader in readers {
            reader.close();
        }
    }

    fn lock_inner(&self) -> MutexGuard<'_, PoolInner> {
        self.inner.lock().expect("reader pool mutex poisoned")
    }
}
