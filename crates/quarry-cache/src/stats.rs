use std::sync::atomic::{AtomicU64, Ordering};

/// Counters exposed by every cache in the layer.
///
/// The counters are exact, not sampled: tests assert on them (e.g. "the
/// factory ran exactly twice", "the spill-file count returned to zero").
#[derive(Debug, Default)]
pub struct CacheStats {
    opens: AtomicU64,
    hits: AtomicU64,
    resident: AtomicU64,
    evictions: AtomicU64,
    spills_created: AtomicU64,
    spills_live: AtomicU64,
}

impl CacheStats {
    pub fn record_open(&self) {
        self.opens.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::SeqCst);
    }

    pub fn inc_resident(&self) {
        self.resident.fetch_add(1, Ordering::SeqCst);
    }

    pub fn dec_resident(&self) {
        decrement(&self.resident);
    }

    pub fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_spill_created(&self) {
        self.spills_created.fetch_add(1, Ordering::SeqCst);
        self.spills_live.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_spill_removed(&self) {
        decrement(&self.spills_live);
    }

    /// Number of underlying factory opens performed.
    pub fn opens(&self) -> u64 {
        self.opens.load(Ordering::SeqCst)
    }

    /// Number of lookups served from an existing entry.
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::SeqCst)
    }

    /// Number of entries currently holding a live underlying resource.
    pub fn resident(&self) -> u64 {
        self.resident.load(Ordering::SeqCst)
    }

    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::SeqCst)
    }

    pub fn spills_created(&self) -> u64 {
        self.spills_created.load(Ordering::SeqCst)
    }

    /// Number of spill files currently on disk.
    pub fn spills_live(&self) -> u64 {
        self.spills_live.load(Ordering::SeqCst)
    }
}

fn decrement(counter: &AtomicU64) {
    let previous = counter.fetch_sub(1, Ordering::SeqCst);
    debug_assert!(previous > 0, "cache counter underflow");
}
