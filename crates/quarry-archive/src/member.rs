use std::cmp;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::sync::Arc;

use flate2::read::DeflateDecoder;
use quarry_cache::{CacheStats, Lease};
use quarry_core::{CacheError, Result};
use quarry_vfs::FileInfo;

use crate::cache::ArchiveFile;
use crate::index::{Compression, MemberDesc};

/// Forward-only view over one member's raw byte range in the container.
///
/// Each `read` takes the archive's stream lock for a single positioned read,
/// so any number of members share the one handle without stepping on each
/// other's position.
struct RawSlice {
    archive: Lease<ArchiveFile>,
    start: u64,
    len: u64,
    pos: u64,
}

impl Read for RawSlice {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pos >= self.len || buf.is_empty() {
            return Ok(0);
        }
        let want = cmp::min(buf.len() as u64, self.len - self.pos) as usize;
        let n = self
            .archive
            .with(|archive| archive.read_raw(self.start + self.pos, &mut buf[..want]))
            .map_err(io::Error::from)??;
        self.pos += n as u64;
        Ok(n)
    }
}

enum MemberSource {
    Stored(RawSlice),
    Deflated(Box<DeflateDecoder<RawSlice>>),
}

impl MemberSource {
    fn new(archive: Lease<ArchiveFile>, path: &str, desc: &MemberDesc) -> Result<Self> {
        let raw = RawSlice {
            archive,
            start: desc.data_start,
            len: desc.compressed_size,
            pos: 0,
        };
        match desc.compression {
            Compression::Stored => Ok(Self::Stored(raw)),
            Compression::Deflated => Ok(Self::Deflated(Box::new(DeflateDecoder::new(raw)))),
            Compression::Unsupported => Err(CacheError::Unsupported(format!(
                "compression method of member {path}"
            ))),
        }
    }
}

impl Read for MemberSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Stored(raw) => raw.read(buf),
            Self::Deflated(decoder) => decoder.read(buf),
        }
    }
}

/// An open archive member.
///
/// While it lives it counts as a borrower of its archive's cache entry, so
/// the shared container handle stays open. Sequential reads decompress on
/// the fly; the first position-changing seek materializes the member into an
/// unlinked temporary file and all further I/O is served from there. Seeks
/// that do not move the position never trigger the spill.
pub struct Member {
    info: FileInfo,
    desc: MemberDesc,
    archive: Lease<ArchiveFile>,
    stats: Arc<CacheStats>,
    source: Option<MemberSource>,
    spill: Option<File>,
    pos: u64,
}

impl Member {
    pub(crate) fn new(
        archive: Lease<ArchiveFile>,
        info: FileInfo,
        desc: MemberDesc,
        stats: Arc<CacheStats>,
    ) -> Result<Self> {
        let source = MemberSource::new(archive.clone(), &info.path.to_string(), &desc)?;
        Ok(Self {
            info,
            desc,
            archive,
            stats,
            source: Some(source),
            spill: None,
            pos: 0,
        })
    }

    pub fn info(&self) -> &FileInfo {
        &self.info
    }

    pub fn size(&self) -> u64 {
        self.info.size
    }

    /// Whether the member has been spilled to a temporary file.
    pub fn is_materialized(&self) -> bool {
        self.spill.is_some()
    }

    /// Decompresses the whole member into an unlinked temporary file and
    /// switches over to it, positioned at `target`.
    fn materialize(&mut self, target: u64) -> io::Result<u64> {
        let path = self.info.path.to_string();
        let mut source = MemberSource::new(self.archive.clone(), &path, &self.desc)
            .map_err(io::Error::from)?;
        let mut file = tempfile::tempfile()?;
        io::copy(&mut source, &mut file)?;
        self.stats.record_spill_created();
        tracing::debug!(
            target = "quarry.zip",
            member = %path,
            size = self.info.size,
            "spilled member for random access"
        );
        let pos = file.seek(SeekFrom::Start(target))?;
        self.spill = Some(file);
        self.source = None;
        Ok(pos)
    }
}

impl std::fmt::Debug for Member {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Member")
            .field("path", &self.info.path)
            .field("size", &self.info.size)
            .field("materialized", &self.spill.is_some())
            .finish_non_exhaustive()
    }
}

impl Read for Member {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if let Some(file) = &mut self.spill {
            return file.read(buf);
        }
        let source = self
            .source
            .as_mut()
            .expect("member has neither source nor spill");
        let n = source.read(buf)?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl Seek for Member {
    fn seek(&mut self, seek: SeekFrom) -> io::Result<u64> {
        if let Some(file) = &mut self.spill {
            return file.seek(seek);
        }
        let target = match seek {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::Current(delta) => self.pos.checked_add_signed(delta),
            SeekFrom::End(delta) => self.info.size.checked_add_signed(delta),
        };
        let target = target.ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "seek before start of member")
        })?;
        if target == self.pos {
            // Plugins routinely probe with `Current(0)`; position-preserving
            // seeks must stay free of the spill cost.
            return Ok(target);
        }
        self.materialize(target)
    }
}

impl Drop for Member {
    fn drop(&mut self) {
        if self.spill.take().is_some() {
            self.stats.record_spill_removed();
        }
    }
}
