//! Zip container support for the quarry resource layer.
//!
//! Archives are expensive to open (a full central directory parse) and cheap
//! to keep, so opens go through a scope-owned [`ZipFileCache`]: one cache
//! entry per container, one shared OS handle per entry, any number of
//! [`Member`] streams multiplexed over it. The [`ZipAccessor`] exposes the
//! whole thing through the generic accessor interface, delegates included,
//! so `zip` specs nest.

mod accessor;
mod cache;
mod index;
mod member;

pub use accessor::ZipAccessor;
pub use cache::{ArchiveFile, ZipFileCache};
pub use index::{Compression, MemberDesc, MemberIndex, RESERVED_MEMBER_PREFIX};
pub use member::Member;
