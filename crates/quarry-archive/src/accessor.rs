use std::sync::Arc;

use quarry_core::{FileSpec, Result, Scope};
use quarry_vfs::{Accessor, AccessorRegistry, AccessorStream, FileInfo};

use crate::cache::ZipFileCache;

/// Accessor serving members of zip containers, registered under `zip`.
///
/// The container itself is named by the spec's delegate and can live on any
/// registered accessor, including `zip` again, which is how doubly nested
/// archives resolve: the inner container opens as a member of the outer one.
pub struct ZipAccessor {
    scope: Scope,
}

impl ZipAccessor {
    /// Registers the accessor on the scope's registry.
    pub fn register(scope: &Scope) {
        let registry = AccessorRegistry::for_scope(scope);
        registry.register(Arc::new(Self {
            scope: scope.clone(),
        }));
    }

    fn cache(&self) -> Arc<ZipFileCache> {
        ZipFileCache::for_scope(&self.scope)
    }
}

impl Accessor for ZipAccessor {
    fn name(&self) -> &str {
        "zip"
    }

    fn open(&self, spec: &FileSpec) -> Result<Box<dyn AccessorStream>> {
        Ok(Box::new(self.cache().open_member(spec)?))
    }

    fn stat(&self, spec: &FileSpec) -> Result<FileInfo> {
        self.cache().stat(spec)
    }

    fn read_dir(&self, spec: &FileSpec) -> Result<Vec<FileInfo>> {
        self.cache().list_children(spec)
    }
}
