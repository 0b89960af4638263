//! Generic caching primitives for the quarry resource layer.
//!
//! The centerpiece is the [`LeaseRegistry`]: a keyed map of reference-counted
//! resources with atomic claim-or-create semantics, so concurrent requesters
//! for the same key never open the underlying resource twice, and an LRU trim
//! that never evicts an entry while someone still borrows it.
//!
//! [`AttachmentCache`] layers TTL + size bounded eviction on top of the same
//! reference-counting discipline, for composite files whose sub-resources are
//! opened far more often than the parent parse.

mod attachment;
mod registry;
mod stats;

pub use attachment::{AttachmentCache, AttachmentHandle, CompositeEntry, CompositeLease};
pub use registry::{Lease, LeaseEntry, LeaseRegistry, Resource};
pub use stats::CacheStats;
