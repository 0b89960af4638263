use quarry_core::{CacheError, Result};

use crate::paged::PagedReader;

/// Header probe for a container format: every `(offset, magic)` pair must
/// match before the format's (expensive, opaque) parser is invoked.
///
/// Probing is deliberately the only format knowledge this layer owns; the
/// parsers themselves are external factories.
#[derive(Debug)]
pub struct FormatSpec {
    pub name: &'static str,
    pub(crate) cache_tag: &'static str,
    probes: &'static [(u64, &'static [u8])],
}

impl FormatSpec {
    /// Validates the magic region through `reader`, failing fast with a
    /// typed error so no parse context is ever built over garbage data.
    pub fn probe(&self, reader: &PagedReader) -> Result<()> {
        for (offset, magic) in self.probes {
            let mut buf = vec![0u8; magic.len()];
            let n = reader.read_at(&mut buf, *offset)?;
            if n < magic.len() || buf != *magic {
                return Err(CacheError::malformed(
                    self.name,
                    format!("bad magic at offset {offset}"),
                ));
            }
        }
        Ok(())
    }
}

/// NTFS boot sector: OEM id `NTFS    ` at offset 3.
pub static NTFS: FormatSpec = FormatSpec {
    name: "ntfs",
    cache_tag: "ntfs_contexts",
    probes: &[(3, b"NTFS    ")],
};

/// EXT4 superblock magic `0xEF53` (little endian) at offset 0x438.
pub static EXT4: FormatSpec = FormatSpec {
    name: "ext4",
    cache_tag: "ext4_contexts",
    probes: &[(0x438, &[0x53, 0xEF])],
};

/// FAT boot sector signature `0x55AA` at offset 510.
pub static FAT: FormatSpec = FormatSpec {
    name: "fat",
    cache_tag: "fat_contexts",
    probes: &[(510, &[0x55, 0xAA])],
};

/// OLE / MS compound file binary header.
pub static MSCFB: FormatSpec = FormatSpec {
    name: "mscfb",
    cache_tag: "mscfb_contexts",
    probes: &[(0, &[0xD0, 0xCF, 0x11, 0xE0, 0xA1, 0xB1, 0x1A, 0xE1])],
};

/// Expert Witness Format segment header.
pub static EWF: FormatSpec = FormatSpec {
    name: "ewf",
    cache_tag: "ewf_contexts",
    probes: &[(0, &[0x45, 0x56, 0x46, 0x09, 0x0D, 0x0A, 0xFF, 0x00])],
};

/// VHDX file type identifier.
pub static VHDX: FormatSpec = FormatSpec {
    name: "vhdx",
    cache_tag: "vhdx_contexts",
    probes: &[(0, b"vhdxfile")],
};

/// VMDK sparse extent header.
pub static VMDK: FormatSpec = FormatSpec {
    name: "vmdk",
    cache_tag: "vmdk_contexts",
    probes: &[(0, b"KDMV")],
};
