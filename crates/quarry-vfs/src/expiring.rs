use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use crossbeam_channel as channel;
use quarry_cache::{CacheStats, Lease, LeaseRegistry, Resource};
use quarry_core::{guard_parser, FileSpec, Result, Scope};

use crate::formats::FormatSpec;
use crate::paged::{PagedReader, ReaderPool};

type Builder<P> = Box<dyn Fn(&Arc<PagedReader>) -> Result<P> + Send + Sync>;

/// A parsed filesystem context (e.g. volume metadata) that periodically
/// releases its underlying reader so long-running queries do not pin file
/// descriptors and parse state indefinitely.
///
/// "Closed" is always recoverable here: whether the reader was closed by the
/// expiry timer or explicitly, the next [`get`](ExpiringContext::get)
/// rebuilds the parse result through the transparently reopened reader. The
/// cycle only ends when the owning scope tears down.
pub struct ExpiringContext<P: Send + Sync + 'static> {
    format: &'static FormatSpec,
    reader: Arc<PagedReader>,
    builder: Builder<P>,
    parsed: Mutex<Option<Arc<P>>>,
    rebuilds: AtomicU64,
    stop_tx: Mutex<Option<channel::Sender<()>>>,
    ticker: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl<P: Send + Sync + 'static> ExpiringContext<P> {
    /// Validates the format magic through `reader` (failing fast on
    /// garbage), then starts the background expiry timer.
    pub fn start(
        scope: &Scope,
        reader: Arc<PagedReader>,
        format: &'static FormatSpec,
        builder: impl Fn(&Arc<PagedReader>) -> Result<P> + Send + Sync + 'static,
    ) -> Result<Arc<Self>> {
        format.probe(&reader)?;

        let (stop_tx, stop_rx) = channel::bounded::<()>(0);
        let context = Arc::new(Self {
            format,
            reader,
            builder: Box::new(builder),
            parsed: Mutex::new(None),
            rebuilds: AtomicU64::new(0),
            stop_tx: Mutex::new(Some(stop_tx)),
            ticker: Mutex::new(None),
        });

        let weak: Weak<Self> = Arc::downgrade(&context);
        let done = scope.done_signal();
        let cancel = scope.cancel_token().child_token();
        let expiry = scope.config().context_expiry();
        let format_name = format.name;
        let handle = std::thread::spawn(move || {
            let ticker = channel::tick(expiry);
            loop {
                channel::select! {
                    recv(ticker) -> _ => {
                        if cancel.is_cancelled() {
                            break;
                        }
                        let Some(context) = weak.upgrade() else { break };
                        context.expire();
                    }
                    recv(done) -> _ => break,
                    recv(stop_rx) -> _ => break,
                }
            }
            tracing::debug!(target = "quarry.vfs", format = format_name, "expiry timer exited");
        });
        *context.lock_ticker() = Some(handle);

        {
            let reader = Arc::clone(&context.reader);
            scope.register_cleanup(move || reader.close());
        }
        Ok(context)
    }

    /// Returns the parse result, rebuilding it if the reader was closed (by
    /// the timer or explicitly) since it was last built.
    pub fn get(&self) -> Result<Arc<P>> {
        let mut parsed = self.lock_parsed();
        if let Some(parsed) = &*parsed {
            return Ok(Arc::clone(parsed));
        }
        let built = guard_parser(self.format.name, || (self.builder)(&self.reader))?;
        self.rebuilds.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(
            target = "quarry.vfs",
            format = self.format.name,
            rebuilds = self.rebuilds.load(Ordering::SeqCst),
            "parse context built"
        );
        let built = Arc::new(built);
        *parsed = Some(Arc::clone(&built));
        Ok(built)
    }

    /// Force-closes the underlying reader and drops the cached parse.
    /// Invoked by the timer; callable directly as the explicit close.
    pub fn expire(&self) {
        self.lock_parsed().take();
        self.reader.close();
    }

    pub fn reader(&self) -> &Arc<PagedReader> {
        &self.reader
    }

    /// How many times the parse result has been (re)built.
    pub fn rebuilds(&self) -> u64 {
        self.rebuilds.load(Ordering::SeqCst)
    }

    fn shutdown(&self) {
        // Dropping the sender wakes the timer thread.
        self.stop_tx
            .lock()
            .expect("expiring context mutex poisoned")
            .take();
        if let Some(handle) = self.lock_ticker().take() {
            if handle.join().is_err() {
                tracing::warn!(
                    target = "quarry.vfs",
                    format = self.format.name,
                    "expiry timer panicked"
                );
            }
        }
        self.expire();
    }

    fn lock_parsed(&self) -> MutexGuard<'_, Option<Arc<P>>> {
        self.parsed.lock().expect("expiring context mutex poisoned")
    }

    fn lock_ticker(&self) -> MutexGuard<'_, Option<std::thread::JoinHandle<()>>> {
        self.ticker.lock().expect("expiring context mutex poisoned")
    }
}

impl<P: Send + Sync + 'static> std::fmt::Debug for ExpiringContext<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExpiringContext")
            .field("format", &self.format.name)
            .field("rebuilds", &self.rebuilds.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl<P: Send + Sync + 'static> Drop for ExpiringContext<P> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Registry entry wrapper so contexts can live in a [`LeaseRegistry`].
pub struct ContextHandle<P: Send + Sync + 'static>(Arc<ExpiringContext<P>>);

impl<P: Send + Sync + 'static> ContextHandle<P> {
    pub fn context(&self) -> &Arc<ExpiringContext<P>> {
        &self.0
    }
}

impl<P: Send + Sync + 'static> Resource for ContextHandle<P> {
    fn close(&mut self) {
        self.0.shutdown();
    }
}

/// Per-format "open or get cached" helper: at most one [`ExpiringContext`]
/// per `(accessor, path)` within a scope, created through the claim-or-wait
/// registry so concurrent workers never probe and start twice.
pub struct ContextCache<P: Send + Sync + 'static> {
    scope: Scope,
    format: &'static FormatSpec,
    registry: LeaseRegistry<ContextHandle<P>>,
}

impl<P: Send + Sync + 'static> ContextCache<P> {
    /// The cache owned by `scope` for `format`, created on first use.
    ///
    /// A given format must be used with a single parse-result type per
    /// scope.
    pub fn for_scope(scope: &Scope, format: &'static FormatSpec) -> Arc<Self> {
        scope.cache_get_or_init(format.cache_tag, || {
            let cache = Arc::new(Self {
                scope: scope.clone(),
                format,
                // Contexts do not pin file descriptors (their readers
                // self-close), so the registry itself is unbounded.
                registry: LeaseRegistry::new(
                    format.cache_tag,
                    usize::MAX,
                    Arc::new(CacheStats::default()),
                ),
            });
            let for_cleanup = Arc::clone(&cache);
            scope.register_cleanup(move || for_cleanup.registry.clear());
            cache
        })
    }

    /// Returns the context for `spec`, starting it via `builder` on first
    /// use.
    pub fn get_or_create(
        &self,
        spec: &FileSpec,
        builder: impl Fn(&Arc<PagedReader>) -> Result<P> + Send + Sync + 'static,
    ) -> Result<Arc<ExpiringContext<P>>> {
        let key = spec.cache_key(self.format.name);
        let lease: Lease<ContextHandle<P>> = self.registry.acquire(&key, || {
            let pool = ReaderPool::for_scope(&self.scope);
            let reader = pool.get_or_create(spec)?;
            let context = ExpiringContext::start(&self.scope, reader, self.format, builder)?;
            Ok(ContextHandle(context))
        })?;
        lease.with(|handle| Arc::clone(handle.context()))
    }

    pub fn stats(&self) -> &Arc<CacheStats> {
        self.registry.stats()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use quarry_core::{CacheError, ScopeConfig};

    use super::*;
    use crate::formats;

    fn ntfs_image() -> Vec<u8> {
        let mut image = vec![0u8; 4096];
        image[3..11].copy_from_slice(b"NTFS    ");
        image[11] = 0xAB;
        image
    }

    fn scope_with_expiry(secs: u64) -> Scope {
        Scope::new(ScopeConfig {
            context_expiry_secs: secs,
            ..ScopeConfig::default()
        })
    }

    #[derive(Debug)]
    struct VolumeInfo {
        tag: u8,
    }

    fn build_volume(reader: &Arc<PagedReader>) -> Result<VolumeInfo> {
        let mut tag = [0u8; 1];
        reader.read_at(&mut tag, 11)?;
        Ok(VolumeInfo { tag: tag[0] })
    }

    fn write_image(dir: &tempfile::TempDir, image: &[u8]) -> FileSpec {
        let file = dir.path().join("volume.img");
        std::fs::write(&file, image).unwrap();
        FileSpec::local(&file)
    }

    #[test]
    fn parse_context_is_built_once_and_cached() {
        let dir = tempfile::tempdir().unwrap();
        let spec = write_image(&dir, &ntfs_image());
        let scope = scope_with_expiry(3600);

        let cache = ContextCache::for_scope(&scope, &formats::NTFS);
        let builds = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&builds);
        let context = cache
            .get_or_create(&spec, move |reader| {
                counted.fetch_add(1, Ordering::SeqCst);
                build_volume(reader)
            })
            .unwrap();

        assert_eq!(context.get().unwrap().tag, 0xAB);
        assert_eq!(context.get().unwrap().tag, 0xAB);
        assert_eq!(builds.load(Ordering::SeqCst), 1);

        // A second lookup returns the same cached context.
        let again = cache.get_or_create(&spec, build_volume).unwrap();
        assert!(Arc::ptr_eq(&context, &again));
        assert_eq!(cache.stats().opens(), 1);

        scope.close();
    }

    #[test]
    fn expiry_recovers_transparently() {
        let dir = tempfile::tempdir().unwrap();
        let spec = write_image(&dir, &ntfs_image());
        let scope = scope_with_expiry(3600);

        let cache = ContextCache::for_scope(&scope, &formats::NTFS);
        let context = cache.get_or_create(&spec, build_volume).unwrap();
        assert_eq!(context.get().unwrap().tag, 0xAB);

        let pool = ReaderPool::for_scope(&scope);
        let opens_before = pool.stats().opens();

        context.expire();
        assert!(!context.reader().is_open());

        // The next access rebuilds the parse and reopens the reader once.
        assert_eq!(context.get().unwrap().tag, 0xAB);
        assert_eq!(context.rebuilds(), 2);
        assert_eq!(pool.stats().opens(), opens_before + 1);

        scope.close();
    }

    #[test]
    fn timer_fires_and_closes_the_reader() {
        let dir = tempfile::tempdir().unwrap();
        let spec = write_image(&dir, &ntfs_image());
        let scope = scope_with_expiry(1);

        let cache = ContextCache::for_scope(&scope, &formats::NTFS);
        let context = cache.get_or_create(&spec, build_volume).unwrap();
        assert_eq!(context.get().unwrap().tag, 0xAB);
        assert!(context.reader().is_open());

        std::thread::sleep(std::time::Duration::from_millis(1300));
        assert!(!context.reader().is_open());

        // Recovery after the timer, not just after explicit expiry.
        assert_eq!(context.get().unwrap().tag, 0xAB);
        scope.close();
    }

    #[test]
    fn cancelled_scopes_stop_expiring() {
        let dir = tempfile::tempdir().unwrap();
        let spec = write_image(&dir, &ntfs_image());
        let scope = scope_with_expiry(1);

        let cache = ContextCache::for_scope(&scope, &formats::NTFS);
        let context = cache.get_or_create(&spec, build_volume).unwrap();
        assert_eq!(context.get().unwrap().tag, 0xAB);
        assert!(context.reader().is_open());

        // After cancellation the timer stops closing the reader even though
        // the tick interval keeps elapsing.
        scope.cancel_token().cancel();
        std::thread::sleep(std::time::Duration::from_millis(1300));
        assert!(context.reader().is_open());

        scope.close();
    }

    #[test]
    fn garbage_volumes_fail_fast() {
        let dir = tempfile::tempdir().unwrap();
        let spec = write_image(&dir, &[0u8; 4096]);
        let scope = scope_with_expiry(3600);

        let cache = ContextCache::for_scope(&scope, &formats::NTFS);
        let err = cache.get_or_create(&spec, build_volume).unwrap_err();
        assert!(matches!(err, CacheError::Malformed { .. }));

        // The failed probe must not wedge the key.
        let err = cache.get_or_create(&spec, build_volume).unwrap_err();
        assert!(matches!(err, CacheError::Malformed { .. }));

        scope.close();
    }

    #[test]
    fn panicking_parsers_become_errors() {
        let dir = tempfile::tempdir().unwrap();
        let spec = write_image(&dir, &ntfs_image());
        let scope = scope_with_expiry(3600);

        let cache = ContextCache::for_scope(&scope, &formats::NTFS);
        let context = cache
            .get_or_create(&spec, |_reader| -> Result<VolumeInfo> {
                panic!("corrupt mft")
            })
            .unwrap();
        let err = context.get().unwrap_err();
        assert!(matches!(err, CacheError::ParserPanic { format: "ntfs", .. }));

        scope.close();
    }
}
