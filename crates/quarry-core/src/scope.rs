use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel as channel;
use serde::Deserialize;

use crate::cancel::CancelToken;

/// Tunables read from the execution context's configuration surface.
///
/// All fields have defaults so a partially specified config deserializes
/// cleanly.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ScopeConfig {
    /// Maximum number of simultaneously resident archive cache entries.
    pub max_archive_entries: usize,
    /// Maximum number of paged readers holding an open OS handle.
    pub reader_pool_capacity: usize,
    /// Page size for paged readers, in bytes.
    pub reader_page_size: u64,
    /// Number of pages each paged reader keeps resident.
    pub reader_page_count: usize,
    /// Interval after which a self-expiring parse context force-closes its
    /// underlying reader, in seconds.
    pub context_expiry_secs: u64,
    /// Idle time after which a cached composite-file parse becomes eligible
    /// for eviction, in seconds.
    pub attachment_ttl_secs: u64,
    /// Maximum number of cached composite-file parses.
    pub attachment_cache_size: usize,
}

impl Default for ScopeConfig {
    fn default() -> Self {
        Self {
            max_archive_entries: 5,
            reader_pool_capacity: 50,
            reader_page_size: 32 * 1024,
            reader_page_count: 100,
            context_expiry_secs: 30,
            attachment_ttl_secs: 60,
            attachment_cache_size: 5,
        }
    }
}

impl ScopeConfig {
    pub fn context_expiry(&self) -> Duration {
        Duration::from_secs(self.context_expiry_secs)
    }

    pub fn attachment_ttl(&self) -> Duration {
        Duration::from_secs(self.attachment_ttl_secs)
    }
}

type CleanupFn = Box<dyn FnOnce() + Send>;

/// The lifetime scope of one query's evaluation.
///
/// A scope owns every cache created during the query: caches are created on
/// first use via [`Scope::cache_get_or_init`] and torn down when the scope
/// [`close`](Scope::close)s, no matter how long the query ran. There are no
/// process-wide registries; two scopes never share cached resources.
///
/// Cloning is cheap and shares the underlying scope.
#[derive(Clone, Debug)]
pub struct Scope {
    inner: Arc<ScopeInner>,
}

struct ScopeInner {
    config: ScopeConfig,
    cancel: CancelToken,
    closed: AtomicBool,
    caches: Mutex<HashMap<&'static str, Arc<dyn Any + Send + Sync>>>,
    cleanups: Mutex<Vec<CleanupFn>>,
    done_tx: Mutex<Option<channel::Sender<()>>>,
    done_rx: channel::Receiver<()>,
}

impl std::fmt::Debug for ScopeInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopeInner")
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Default for Scope {
    fn default() -> Self {
        Self::new(ScopeConfig::default())
    }
}

impl Scope {
    pub fn new(config: ScopeConfig) -> Self {
        let (done_tx, done_rx) = channel::bounded(0);
        Self {
            inner: Arc::new(ScopeInner {
                config,
                cancel: CancelToken::new(),
                closed: AtomicBool::new(false),
                caches: Mutex::new(HashMap::new()),
                cleanups: Mutex::new(Vec::new()),
                done_tx: Mutex::new(Some(done_tx)),
                done_rx,
            }),
        }
    }

    pub fn config(&self) -> &ScopeConfig {
        &self.inner.config
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.inner.cancel
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// A receiver that becomes disconnected when the scope closes.
    ///
    /// Background loops select on this alongside their tickers; a `recv`
    /// error means "scope ended, exit now".
    pub fn done_signal(&self) -> channel::Receiver<()> {
        self.inner.done_rx.clone()
    }

    /// Registers a callback to run exactly once when the scope closes.
    ///
    /// Callbacks registered after the scope has already closed run
    /// immediately on the caller's thread.
    pub fn register_cleanup(&self, f: impl FnOnce() + Send + 'static) {
        if self.is_closed() {
            tracing::debug!(
                target = "quarry.scope",
                "cleanup registered after close; running immediately"
            );
            run_cleanup(Box::new(f));
            return;
        }
        let mut cleanups = self.inner.cleanups.lock().expect("scope cleanups poisoned");
        // The closed flag may have flipped while we waited for the lock; the
        // closing thread drains this vec exactly once, so re-check under it.
        if self.inner.closed.load(Ordering::SeqCst) {
            drop(cleanups);
            run_cleanup(Box::new(f));
        } else {
            cleanups.push(Box::new(f));
        }
    }

    /// Returns the scope-owned cache registered under `name`, creating it on
    /// first use. `init` runs without the caches lock held, so initializers
    /// may themselves look up other scope caches.
    ///
    /// Panics if `name` was previously used with a different type.
    pub fn cache_get_or_init<T>(&self, name: &'static str, init: impl FnOnce() -> Arc<T>) -> Arc<T>
    where
        T: Any + Send + Sync,
    {
        if let Some(existing) = self
            .inner
            .caches
            .lock()
            .expect("scope caches poisoned")
            .get(name)
        {
            return Arc::clone(existing)
                .downcast::<T>()
                .expect("scope cache registered under one name with two types");
        }

        // If two threads race past the lookup the first insert wins and the
        // loser's instance is discarded.
        let built = init() as Arc<dyn Any + Send + Sync>;
        let mut caches = self.inner.caches.lock().expect("scope caches poisoned");
        let entry = caches.entry(name).or_insert(built);
        Arc::clone(entry)
            .downcast::<T>()
            .expect("scope cache registered under one name with two types")
    }

    /// Ends the scope: cancels background work, wakes every loop waiting on
    /// [`done_signal`](Scope::done_signal), runs cleanups in reverse
    /// registration order, and drops all scope-owned caches.
    ///
    /// Closing twice is a no-op.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!(target = "quarry.scope", "scope closing");

        self.inner.cancel.cancel();
        // Dropping the sender disconnects every cloned done receiver.
        self.inner
            .done_tx
            .lock()
            .expect("scope done sender poisoned")
            .take();

        let cleanups = {
            let mut cleanups = self.inner.cleanups.lock().expect("scope cleanups poisoned");
            std::mem::take(&mut *cleanups)
        };
        for cleanup in cleanups.into_iter().rev() {
            run_cleanup(cleanup);
        }

        self.inner
            .caches
            .lock()
            .expect("scope caches poisoned")
            .clear();
    }
}

fn run_cleanup(f: CleanupFn) {
    if let Err(payload) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(f)) {
        tracing::warn!(
            target = "quarry.scope",
            message = crate::error::panic_payload_to_str(payload.as_ref()),
            "scope cleanup panicked"
        );
    }
}
