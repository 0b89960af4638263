use std::collections::HashMap;
use std::io::{Read, Seek};

use quarry_core::{CacheError, OsPath, Result};
use quarry_vfs::FileInfo;
use zip::ZipArchive;

/// Members whose first path component begins with this prefix carry
/// implementation metadata and are hidden from lookups and listings.
pub const RESERVED_MEMBER_PREFIX: &str = ".__";

/// How a member's bytes are stored in the archive.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Compression {
    Stored,
    Deflated,
    Unsupported,
}

/// Everything needed to stream a member independently of the central
/// directory: where its raw bytes start and how they are encoded.
#[derive(Clone, Debug)]
pub struct MemberDesc {
    pub data_start: u64,
    pub compressed_size: u64,
    pub size: u64,
    pub compression: Compression,
    pub crc32: u32,
}

struct IndexEntry {
    path: OsPath,
    desc: MemberDesc,
}

/// Ordered index of an archive's members, built once from the central
/// directory and immutable afterwards.
///
/// Directories are synthesized during enumeration; archive formats need not
/// contain explicit directory entries. All matching is component-wise.
pub struct MemberIndex {
    entries: Vec<IndexEntry>,
}

impl MemberIndex {
    /// Reads the full central directory. Directory markers, empty names and
    /// reserved internal members are skipped.
    pub fn from_archive<R: Read + Seek>(archive: &mut ZipArchive<R>) -> Result<Self> {
        let mut entries = Vec::with_capacity(archive.len());
        for i in 0..archive.len() {
            let member = archive
                .by_index_raw(i)
                .map_err(|err| CacheError::malformed("zip", err.to_string()))?;
            if member.is_dir() {
                continue;
            }
            let path = OsPath::parse(member.name());
            if path.is_root() {
                continue;
            }
            // Checked on the parsed path so leading "./" cannot mask the
            // prefix.
            if path.components()[0].starts_with(RESERVED_MEMBER_PREFIX) {
                continue;
            }
            let compression = match member.compression() {
                zip::CompressionMethod::Stored => Compression::Stored,
                zip::CompressionMethod::Deflated => Compression::Deflated,
                _ => Compression::Unsupported,
            };
            entries.push(IndexEntry {
                path,
                desc: MemberDesc {
                    data_start: member.data_start(),
                    compressed_size: member.compressed_size(),
                    size: member.size(),
                    compression,
                    crc32: member.crc32(),
                },
            });
        }
        Ok(Self::from_entries(entries))
    }

    fn from_entries(entries: Vec<IndexEntry>) -> Self {
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Exact component-sequence lookup of a concrete member.
    pub fn lookup(&self, path: &OsPath) -> Result<(FileInfo, MemberDesc)> {
        self.entries
            .iter()
            .find(|entry| entry.path == *path)
            .map(|entry| (file_info(&entry.path, &entry.desc), entry.desc.clone()))
            .ok_or_else(|| CacheError::not_found(path.to_string()))
    }

    /// Stat for a member or a synthesized directory. Not-found is a distinct
    /// error from I/O failures.
    pub fn stat(&self, path: &OsPath) -> Result<FileInfo> {
        if let Ok((info, _)) = self.lookup(path) {
            return Ok(info);
        }
        let is_dir = !path.is_root()
            && self
                .entries
                .iter()
                .any(|entry| entry.path.depth() > path.depth() && entry.path.starts_with(path));
        if is_dir {
            return Ok(dir_info(path.clone()));
        }
        Err(CacheError::not_found(path.to_string()))
    }

    /// Lists the direct children of `dir`.
    ///
    /// A deeper member synthesizes a directory entry the first time its
    /// ancestor at this depth is seen. When a concrete member and deeper
    /// members share a name at this depth, the first concrete member wins,
    /// both over the synthesized directory and over later duplicates.
    pub fn list_children(&self, dir: &OsPath) -> Vec<FileInfo> {
        let depth = dir.depth();
        let mut seen: HashMap<&str, usize> = HashMap::new();
        let mut out: Vec<FileInfo> = Vec::new();

        for entry in &self.entries {
            if entry.path.depth() <= depth || !entry.path.starts_with(dir) {
                continue;
            }
            let name = entry.path.components()[depth].as_str();
            let concrete = entry.path.depth() == depth + 1;
            match seen.get(name) {
                None => {
                    seen.insert(name, out.len());
                    if concrete {
                        out.push(file_info(&entry.path, &entry.desc));
                    } else {
                        out.push(dir_info(dir.join(name)));
                    }
                }
                Some(&slot) => {
                    if concrete && out[slot].is_dir {
                        out[slot] = file_info(&entry.path, &entry.desc);
                    }
                }
            }
        }
        out
    }
}

fn file_info(path: &OsPath, desc: &MemberDesc) -> FileInfo {
    FileInfo {
        path: path.clone(),
        size: desc.size,
        is_dir: false,
        mtime: None,
    }
}

fn dir_info(path: OsPath) -> FileInfo {
    FileInfo {
        path,
        size: 0,
        is_dir: true,
        mtime: None,
    }
}
