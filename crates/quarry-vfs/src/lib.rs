//! Accessor abstraction and reader caches for the quarry resource layer.
//!
//! An [`Accessor`] provides named byte-stream access to paths (local files,
//! raw devices, nested archives). On top of that sit the shared caches the
//! metadata parsers rely on:
//!
//! - [`ReaderPool`]: paged readers keyed by `(accessor, path)`, resilient to
//!   aggressive trimming, since a closed reader reopens on the next read.
//! - [`ExpiringContext`] / [`ContextCache`]: parse contexts that periodically
//!   release their file handles and rebuild on demand, with fail-fast magic
//!   validation per container format (see [`formats`]).

mod accessor;
mod expiring;
pub mod formats;
mod paged;

pub use accessor::{Accessor, AccessorRegistry, AccessorStream, FileInfo, LocalAccessor};
pub use expiring::{ContextCache, ContextHandle, ExpiringContext};
pub use paged::{PagedReader, ReaderPool};
