//! End-to-end behavior of nested archives under concurrency: many readers,
//! one open per container, everything released at scope teardown.

use std::io::{Cursor, Read, Write};

use quarry_archive::{ZipAccessor, ZipFileCache};
use quarry_core::{FileSpec, OsPath, Scope};
use quarry_vfs::AccessorRegistry;

fn init_logging() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

fn build_nested_fixture(dir: &std::path::Path) -> std::path::PathBuf {
    let options = zip::write::SimpleFileOptions::default();

    let mut inner = zip::ZipWriter::new(Cursor::new(Vec::new()));
    inner.start_file("hello1.txt", options).unwrap();
    inner.write_all(b"hello1\n").unwrap();
    let inner_bytes = inner.finish().unwrap().into_inner();

    let container = dir.join("nested.zip");
    let mut outer = zip::ZipWriter::new(std::fs::File::create(&container).unwrap());
    outer.start_file("hello.zip", options).unwrap();
    outer.write_all(&inner_bytes).unwrap();
    outer.finish().unwrap();
    container
}

fn nested_member_spec(container: &std::path::Path) -> FileSpec {
    let outer_member = FileSpec::new("zip", OsPath::parse("hello.zip"))
        .with_delegate(FileSpec::local(container));
    FileSpec::new("zip", OsPath::parse("hello1.txt")).with_delegate(outer_member)
}

#[test]
fn concurrent_nested_reads_share_two_opens() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let container = build_nested_fixture(dir.path());

    let scope = Scope::default();
    ZipAccessor::register(&scope);
    let cache = ZipFileCache::for_scope(&scope);
    let spec = nested_member_spec(&container);

    let handles: Vec<_> = (0..10)
        .map(|_| {
            let scope = scope.clone();
            let spec = spec.clone();
            std::thread::spawn(move || {
                let registry = AccessorRegistry::for_scope(&scope);
                let mut stream = registry.open(&spec).unwrap();
                let mut contents = String::new();
                stream.read_to_string(&mut contents).unwrap();
                contents
            })
        })
        .collect();

    for handle in handles {
        assert_eq!(handle.join().unwrap(), "hello1\n");
    }

    // Ten readers, two containers, exactly two archive opens.
    assert_eq!(cache.stats().opens(), 2);
    assert_eq!(cache.resident(), 2);

    scope.close();
    assert_eq!(cache.resident(), 0);
    assert_eq!(cache.stats().resident(), 0);
    assert_eq!(cache.stats().spills_live(), 0);
}

#[test]
fn nested_metadata_resolves_through_the_accessor_chain() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let container = build_nested_fixture(dir.path());

    let scope = Scope::default();
    ZipAccessor::register(&scope);
    let registry = AccessorRegistry::for_scope(&scope);
    let accessor = registry.get("zip").unwrap();

    let spec = nested_member_spec(&container);
    let info = accessor.stat(&spec).unwrap();
    assert_eq!(info.size, 7);
    assert!(!info.is_dir);

    let listing = accessor
        .read_dir(&spec.with_path(OsPath::root()))
        .unwrap();
    assert_eq!(listing.len(), 1);
    assert_eq!(listing[0].path.to_string(), "hello1.txt");

    scope.close();
}

#[test]
fn trim_keeps_borrowed_archives_open() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();

    // More containers than the archive cache admits.
    let options = zip::write::SimpleFileOptions::default();
    let mut specs = Vec::new();
    for i in 0..4 {
        let container = dir.path().join(format!("vol{i}.zip"));
        let mut writer = zip::ZipWriter::new(std::fs::File::create(&container).unwrap());
        writer.start_file("data.txt", options).unwrap();
        writer.write_all(format!("volume {i}").as_bytes()).unwrap();
        writer.finish().unwrap();
        specs.push(
            FileSpec::new("zip", OsPath::parse("data.txt"))
                .with_delegate(FileSpec::local(&container)),
        );
    }

    let mut config = quarry_core::ScopeConfig::default();
    config.max_archive_entries = 2;
    let scope = Scope::new(config);
    let cache = ZipFileCache::for_scope(&scope);

    // Hold every member open; none of the archives may be evicted.
    let members: Vec<_> = specs
        .iter()
        .map(|spec| cache.open_member(spec).unwrap())
        .collect();
    assert_eq!(cache.resident(), 4);
    assert_eq!(cache.stats().evictions(), 0);

    for (i, mut member) in members.into_iter().enumerate() {
        let mut contents = String::new();
        member.read_to_string(&mut contents).unwrap();
        assert_eq!(contents, format!("volume {i}"));
    }

    // With the borrows gone the next acquire trims back to capacity.
    let _refresh = cache.open_member(&specs[0]).unwrap();
    assert!(cache.resident() <= 3);
    assert!(cache.stats().evictions() >= 2);

    scope.close();
    assert_eq!(cache.stats().resident(), 0);
}

#[test]
fn spilled_inner_containers_clean_up_with_the_scope() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let container = build_nested_fixture(dir.path());

    let scope = Scope::default();
    ZipAccessor::register(&scope);
    let cache = ZipFileCache::for_scope(&scope);

    // Opening the inner archive spills `hello.zip` for random access; the
    // spill must live exactly as long as the inner archive entry.
    let mut member = cache.open_member(&nested_member_spec(&container)).unwrap();
    let mut contents = String::new();
    member.read_to_string(&mut contents).unwrap();
    assert_eq!(contents, "hello1\n");
    assert_eq!(cache.stats().spills_created(), 1);
    assert_eq!(cache.stats().spills_live(), 1);

    drop(member);
    scope.close();
    assert_eq!(cache.stats().spills_live(), 0);
}
