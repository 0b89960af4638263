use std::collections::HashMap;
use std::io::{Read, Seek};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use quarry_core::{CacheError, FileSpec, OsPath, Result, Scope};

/// A readable, seekable byte stream handed out by an accessor.
pub trait AccessorStream: Read + Seek + Send {}

impl<T: Read + Seek + Send> AccessorStream for T {}

/// Basic metadata for a path, independent of the backing accessor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileInfo {
    pub path: OsPath,
    pub size: u64,
    pub is_dir: bool,
    pub mtime: Option<SystemTime>,
}

/// A named provider of byte-stream access to paths: the local filesystem, a
/// raw device, a nested archive.
///
/// The trait is intentionally small; the cache layer only ever needs to open
/// a stream, stat a path and (for directory-shaped accessors) list children.
pub trait Accessor: Send + Sync {
    fn name(&self) -> &str;

    fn open(&self, spec: &FileSpec) -> Result<Box<dyn AccessorStream>>;

    fn stat(&self, spec: &FileSpec) -> Result<FileInfo>;

    fn read_dir(&self, spec: &FileSpec) -> Result<Vec<FileInfo>> {
        let _ = spec;
        Err(CacheError::Unsupported(format!(
            "accessor {} cannot list directories",
            self.name()
        )))
    }
}

/// Local OS filesystem accessor, registered under the name `file`.
#[derive(Debug, Default)]
pub struct LocalAccessor;

impl Accessor for LocalAccessor {
    fn name(&self) -> &str {
        "file"
    }

    fn open(&self, spec: &FileSpec) -> Result<Box<dyn AccessorStream>> {
        let path = spec.path.to_local_path();
        let file = std::fs::File::open(&path).map_err(|err| match err.kind() {
            std::io::ErrorKind::NotFound => CacheError::not_found(path.display().to_string()),
            _ => CacheError::Io(err),
        })?;
        Ok(Box::new(file))
    }

    fn stat(&self, spec: &FileSpec) -> Result<FileInfo> {
        let path = spec.path.to_local_path();
        let meta = std::fs::metadata(&path).map_err(|err| match err.kind() {
            std::io::ErrorKind::NotFound => CacheError::not_found(path.display().to_string()),
            _ => CacheError::Io(err),
        })?;
        Ok(FileInfo {
            path: spec.path.clone(),
            size: meta.len(),
            is_dir: meta.is_dir(),
            mtime: meta.modified().ok(),
        })
    }

    fn read_dir(&self, spec: &FileSpec) -> Result<Vec<FileInfo>> {
        let dir = spec.path.to_local_path();
        let mut out = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let meta = entry.metadata()?;
            let name = entry.file_name().to_string_lossy().into_owned();
            out.push(FileInfo {
                path: spec.path.join(name),
                size: meta.len(),
                is_dir: meta.is_dir(),
                mtime: meta.modified().ok(),
            });
        }
        Ok(out)
    }
}

/// Scope-owned mapping from accessor names to implementations.
///
/// Container accessors (e.g. the zip accessor) resolve their delegates
/// through the same registry, which is what makes nested specs compose.
#[derive(Default)]
pub struct AccessorRegistry {
    accessors: Mutex<HashMap<String, Arc<dyn Accessor>>>,
}

impl AccessorRegistry {
    /// The registry owned by `scope`, created on first use with the local
    /// accessor preregistered.
    pub fn for_scope(scope: &Scope) -> Arc<Self> {
        scope.cache_get_or_init("accessor_registry", || {
            let registry = Arc::new(Self::default());
            registry.register(Arc::new(LocalAccessor));
            registry
        })
    }

    pub fn register(&self, accessor: Arc<dyn Accessor>) {
        let mut accessors = self
            .accessors
            .lock()
            .expect("accessor registry mutex poisoned");
        accessors.insert(accessor.name().to_owned(), accessor);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Accessor>> {
        let accessors = self
            .accessors
            .lock()
            .expect("accessor registry mutex poisoned");
        accessors
            .get(name)
            .cloned()
            .ok_or_else(|| CacheError::UnknownAccessor(name.to_owned()))
    }

    /// Resolves `spec.accessor` and opens the stream.
    pub fn open(&self, spec: &FileSpec) -> Result<Box<dyn AccessorStream>> {
        self.get(&spec.accessor)?.open(spec)
    }
}
