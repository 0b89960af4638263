use std::io::{Read, Seek, SeekFrom};
use std::sync::{Arc, Mutex};

use quarry_cache::{CacheStats, Lease, LeaseRegistry, Resource};
use quarry_core::{guard_parser, CacheError, FileSpec, Result, Scope};
use quarry_vfs::{AccessorRegistry, AccessorStream, FileInfo};
use zip::ZipArchive;

use crate::index::MemberIndex;
use crate::member::Member;

/// A cached open archive: the member index plus the single shared stream
/// over the container's bytes.
///
/// The index is parsed once at open time; after that the zip machinery is
/// out of the picture and every member read is a positioned read through
/// [`read_raw`](ArchiveFile::read_raw). One OS handle per archive, no matter
/// how many members are open.
pub struct ArchiveFile {
    spec: FileSpec,
    index: MemberIndex,
    stream: Mutex<Option<Box<dyn AccessorStream>>>,
}

impl ArchiveFile {
    pub fn index(&self) -> &MemberIndex {
        &self.index
    }

    /// One positioned read against the shared container stream. The stream
    /// lock is held for exactly one seek+read pair, so concurrently open
    /// members interleave on the same handle.
    pub(crate) fn read_raw(&self, offset: u64, buf: &mut [u8]) -> std::io::Result<usize> {
        let mut guard = self.stream.lock().expect("archive stream mutex poisoned");
        let stream = guard
            .as_mut()
            .ok_or_else(|| std::io::Error::from(CacheError::Closed))?;
        stream.seek(SeekFrom::Start(offset))?;
        stream.read(buf)
    }
}

impl Resource for ArchiveFile {
    fn close(&mut self) {
        if let Ok(stream) = self.stream.get_mut() {
            stream.take();
        }
        tracing::debug!(
            target = "quarry.zip",
            container = %self.spec,
            "released archive handle"
        );
    }
}

/// Scope-owned cache of open archives, keyed by the container's delegate
/// spec.
///
/// Metadata calls ([`stat`](ZipFileCache::stat),
/// [`list_children`](ZipFileCache::list_children)) borrow the entry only for
/// the duration of the call; [`open_member`](ZipFileCache::open_member)
/// returns a handle that pins the entry against eviction until dropped.
pub struct ZipFileCache {
    scope: Scope,
    registry: LeaseRegistry<ArchiveFile>,
}

impl ZipFileCache {
    pub fn for_scope(scope: &Scope) -> Arc<Self> {
        scope.cache_get_or_init("zip_file_cache", || {
            let cache = Arc::new(Self {
                scope: scope.clone(),
                registry: LeaseRegistry::new(
                    "zip",
                    scope.config().max_archive_entries,
                    Arc::new(CacheStats::default()),
                ),
            });
            let teardown = Arc::clone(&cache);
            scope.register_cleanup(move || teardown.registry.clear());
            cache
        })
    }

    pub fn stats(&self) -> &Arc<CacheStats> {
        self.registry.stats()
    }

    /// Number of archives currently holding an open handle.
    pub fn resident(&self) -> usize {
        self.registry.len()
    }

    fn acquire(&self, spec: &FileSpec) -> Result<Lease<ArchiveFile>> {
        let delegate = spec.delegate().ok_or_else(|| {
            CacheError::Unsupported("zip spec names no delegate container".to_owned())
        })?;
        let key = delegate.cache_key("zip");
        self.registry
            .acquire(&key, || open_archive(&self.scope, delegate))
    }

    pub fn stat(&self, spec: &FileSpec) -> Result<FileInfo> {
        let lease = self.acquire(spec)?;
        lease.with(|archive| archive.index.stat(&spec.path))?
    }

    pub fn list_children(&self, spec: &FileSpec) -> Result<Vec<FileInfo>> {
        let lease = self.acquire(spec)?;
        lease.with(|archive| archive.index.list_children(&spec.path))
    }

    /// Opens a member for streaming. The returned [`Member`] counts as a
    /// borrower of the archive entry, so the LRU pass cannot close the
    /// shared handle out from under it.
    pub fn open_member(&self, spec: &FileSpec) -> Result<Member> {
        let lease = self.acquire(spec)?;
        let (info, desc) = lease.with(|archive| archive.index.lookup(&spec.path))??;
        Member::new(lease, info, desc, Arc::clone(self.registry.stats()))
    }
}

fn open_archive(scope: &Scope, delegate: &FileSpec) -> Result<ArchiveFile> {
    let accessors = AccessorRegistry::for_scope(scope);
    let stream = accessors.open(delegate)?;
    // The zip crate is only trusted as far as guard_parser lets it run.
    guard_parser("zip", || {
        let mut archive = ZipArchive::new(stream)
            .map_err(|err| CacheError::malformed("zip", err.to_string()))?;
        let index = MemberIndex::from_archive(&mut archive)?;
        tracing::debug!(
            target = "quarry.zip",
            container = %delegate,
            members = index.len(),
            "opened archive"
        );
        Ok(ArchiveFile {
            spec: delegate.clone(),
            index,
            stream: Mutex::new(Some(archive.into_inner())),
        })
    })
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;
    use std::path::Path;

    use quarry_core::OsPath;

    use super::*;
    use crate::index::Compression;

    fn write_zip(path: &Path, members: &[(&str, &[u8])]) {
        let file = std::fs::File::create(path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default();
        for (name, contents) in members {
            writer.start_file(*name, options).unwrap();
            writer.write_all(contents).unwrap();
        }
        writer.finish().unwrap();
    }

    fn member_spec(container: &Path, member: &str) -> FileSpec {
        FileSpec::new("zip", OsPath::parse(member)).with_delegate(FileSpec::local(container))
    }

    #[test]
    fn members_stream_stat_and_list() {
        let dir = tempfile::tempdir().unwrap();
        let container = dir.path().join("evidence.zip");
        write_zip(&container, &[("logs/app.log", b"line one\nline two\n")]);

        let scope = Scope::default();
        let cache = ZipFileCache::for_scope(&scope);

        let spec = member_spec(&container, "logs/app.log");
        let mut member = cache.open_member(&spec).unwrap();
        let mut contents = String::new();
        member.read_to_string(&mut contents).unwrap();
        assert_eq!(contents, "line one\nline two\n");

        let info = cache.stat(&spec).unwrap();
        assert_eq!(info.size, 18);
        assert!(!info.is_dir);

        let root = cache
            .list_children(&member_spec(&container, ""))
            .unwrap();
        assert_eq!(root.len(), 1);
        assert!(root[0].is_dir);
        assert_eq!(root[0].path.to_string(), "logs");

        // Everything above went through a single archive open.
        assert_eq!(cache.stats().opens(), 1);
        assert!(cache.stats().hits() >= 2);
        scope.close();
    }

    #[test]
    fn missing_members_are_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let container = dir.path().join("one.zip");
        write_zip(&container, &[("present.txt", b"x")]);

        let scope = Scope::default();
        let cache = ZipFileCache::for_scope(&scope);
        let err = cache
            .open_member(&member_spec(&container, "absent.txt"))
            .unwrap_err();
        assert!(err.is_not_found());
        scope.close();
    }

    #[test]
    fn reserved_members_are_hidden() {
        let dir = tempfile::tempdir().unwrap();
        let container = dir.path().join("meta.zip");
        write_zip(
            &container,
            &[
                (".__index.json", b"{}"),
                // A leading "./" must not smuggle a reserved member past the
                // prefix check.
                ("./.__shadow/cache.bin", b"x"),
                ("report.txt", b"findings"),
            ],
        );

        let scope = Scope::default();
        let cache = ZipFileCache::for_scope(&scope);
        let root = cache
            .list_children(&member_spec(&container, ""))
            .unwrap();
        assert_eq!(root.len(), 1);
        assert_eq!(root[0].path.to_string(), "report.txt");
        assert!(cache
            .stat(&member_spec(&container, ".__index.json"))
            .unwrap_err()
            .is_not_found());
        assert!(cache
            .stat(&member_spec(&container, ".__shadow/cache.bin"))
            .unwrap_err()
            .is_not_found());
        scope.close();
    }

    #[test]
    fn specs_without_delegates_are_rejected() {
        let scope = Scope::default();
        let cache = ZipFileCache::for_scope(&scope);
        let err = cache
            .open_member(&FileSpec::new("zip", OsPath::parse("x.txt")))
            .unwrap_err();
        assert!(matches!(err, CacheError::Unsupported(_)));
        scope.close();
    }

    #[test]
    fn garbage_containers_fail_without_wedging_the_key() {
        let dir = tempfile::tempdir().unwrap();
        let container = dir.path().join("not-a.zip");
        std::fs::write(&container, b"definitely not an archive").unwrap();

        let scope = Scope::default();
        let cache = ZipFileCache::for_scope(&scope);
        let spec = member_spec(&container, "x.txt");
        for _ in 0..2 {
            let err = cache.open_member(&spec).unwrap_err();
            assert!(matches!(err, CacheError::Malformed { format: "zip", .. }));
        }
        assert_eq!(cache.stats().resident(), 0);
        scope.close();
    }

    #[test]
    fn unsupported_compression_is_reported_at_open() {
        let dir = tempfile::tempdir().unwrap();
        let container = dir.path().join("plain.zip");
        write_zip(&container, &[("a.txt", b"abc")]);

        let scope = Scope::default();
        let cache = ZipFileCache::for_scope(&scope);
        let spec = member_spec(&container, "a.txt");
        let lease = cache.acquire(&spec).unwrap();
        let (info, mut desc) = lease.with(|a| a.index.lookup(&spec.path)).unwrap().unwrap();
        desc.compression = Compression::Unsupported;
        let err = Member::new(lease, info, desc, Arc::clone(cache.stats())).unwrap_err();
        assert!(matches!(err, CacheError::Unsupported(_)));
        scope.close();
    }

    #[test]
    fn scope_close_releases_all_archives() {
        let dir = tempfile::tempdir().unwrap();
        let container = dir.path().join("a.zip");
        write_zip(&container, &[("f.txt", b"payload")]);

        let scope = Scope::default();
        let cache = ZipFileCache::for_scope(&scope);
        let mut member = cache.open_member(&member_spec(&container, "f.txt")).unwrap();
        let mut contents = String::new();
        member.read_to_string(&mut contents).unwrap();
        drop(member);
        assert_eq!(cache.resident(), 1);

        scope.close();
        assert_eq!(cache.resident(), 0);
        assert_eq!(cache.stats().resident(), 0);
    }
}
