//! Core shared types for the quarry resource-cache layer.
//!
//! This crate is intentionally small: virtual paths and file specs, the
//! error taxonomy, cooperative cancellation, and the per-query execution
//! scope that owns every cache's lifetime.

mod cancel;
mod error;
mod path;
mod scope;

pub use cancel::CancelToken;
pub use error::{guard_parser, panic_payload_to_str, CacheError, Result};
pub use path::{FileSpec, OsPath};
pub use scope::{Scope, ScopeConfig};
