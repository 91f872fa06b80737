//! Resources — the contiguous, optionally compressed regions of an archive.
//!
//! # Resource entry on disk (24 bytes, all fields little-endian)
//!
//! ```text
//! Offset  Size  Field
//!    0      7   size_in_wim    stored (on-disk) byte count
//!    7      1   flags          bit0 FREE, bit1 METADATA, bit2 COMPRESSED,
//!                              bit3 SPANNED
//!    8      8   offset         absolute file offset of the resource
//!   16      8   original_size  uncompressed byte count
//! ```
//!
//! The upper two bits of `offset` and `original_size` are reserved. The
//! lenient reader masks them off with a warning; the strict reader rejects
//! the archive.
//!
//! # Compressed resource body
//!
//! A chunk offset table followed by the compressed chunks. Uncompressed
//! content is cut at 32,768-byte boundaries; each chunk is compressed
//! independently so a reader can seek to any byte with a single table-slice
//! load. The first chunk's offset (always 0) is implicit and absent from the
//! table; entries are offsets relative to the end of the table. Entries are
//! 4 bytes when `original_size < 2^32`, 8 bytes otherwise. A chunk whose
//! compressed size equals its uncompressed size is stored verbatim and the
//! codec is not invoked when reading it back.

mod read;
mod write;

pub use read::{read_blob_verified, read_compressed, read_full, read_uncompressed, ChunkCursor};
pub use write::{write_resource, ResourceWriter};

use log::warn;

use crate::error::{Result, WimError};
use crate::header::WIM_CHUNK_SIZE;

pub const RESOURCE_ENTRY_DISK_SIZE: usize = 24;

pub const RESOURCE_FLAG_FREE: u8 = 0x01;
pub const RESOURCE_FLAG_METADATA: u8 = 0x02;
pub const RESOURCE_FLAG_COMPRESSED: u8 = 0x04;
pub const RESOURCE_FLAG_SPANNED: u8 = 0x08;

/// Bits 62–63 of `offset` and `original_size` are reserved.
const RESERVED_BITS_MASK: u64 = 0xC000_0000_0000_0000;

/// Tolerance over the chunk size when validating derived compressed chunk
/// sizes; anything larger is corruption, not overhead.
pub(crate) const CHUNK_SIZE_SLACK: u64 = 512;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceEntry {
    pub size_in_wim: u64,
    pub flags: u8,
    pub offset: u64,
    pub original_size: u64,
}

impl ResourceEntry {
    #[inline]
    pub fn is_compressed(&self) -> bool {
        self.flags & RESOURCE_FLAG_COMPRESSED != 0
    }

    #[inline]
    pub fn is_metadata(&self) -> bool {
        self.flags & RESOURCE_FLAG_METADATA != 0
    }

    /// An all-zero entry marks an absent resource (e.g. no boot metadata).
    #[inline]
    pub fn is_zero(&self) -> bool {
        *self == ResourceEntry::default()
    }

    /// Number of 32 KiB chunks in the uncompressed content.
    #[inline]
    pub fn chunk_count(&self) -> u64 {
        self.original_size.div_ceil(WIM_CHUNK_SIZE as u64)
    }

    /// Chunk-table entry width for this resource: 4 bytes below 2^32
    /// uncompressed, 8 at or above.
    #[inline]
    pub fn chunk_entry_size(&self) -> u64 {
        if self.original_size < (1u64 << 32) {
            4
        } else {
            8
        }
    }

    /// Byte size of the chunk offset table (first entry is implicit).
    #[inline]
    pub fn chunk_table_size(&self) -> u64 {
        self.chunk_count().saturating_sub(1) * self.chunk_entry_size()
    }

    /// Uncompressed size of chunk `index`; only the final chunk may be short.
    #[inline]
    pub fn chunk_original_size(&self, index: u64) -> u64 {
        let full = WIM_CHUNK_SIZE as u64;
        if index + 1 == self.chunk_count() {
            self.original_size - index * full
        } else {
            full
        }
    }

    pub fn write_to(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= RESOURCE_ENTRY_DISK_SIZE);
        debug_assert!(self.size_in_wim < (1u64 << 56), "stored size exceeds 7 bytes");
        buf[0..8].copy_from_slice(&self.size_in_wim.to_le_bytes());
        buf[7] = self.flags;
        buf[8..16].copy_from_slice(&self.offset.to_le_bytes());
        buf[16..24].copy_from_slice(&self.original_size.to_le_bytes());
    }

    /// Parse a 24-byte on-disk entry. In lenient mode, reserved offset/size
    /// bits are masked with a warning; in strict mode they are an error.
    pub fn from_bytes(buf: &[u8], strict: bool) -> Result<Self> {
        debug_assert!(buf.len() >= RESOURCE_ENTRY_DISK_SIZE);
        let mut size_bytes = [0u8; 8];
        size_bytes[..7].copy_from_slice(&buf[0..7]);
        let size_in_wim = u64::from_le_bytes(size_bytes);
        let flags = buf[7];
        let raw_offset = u64::from_le_bytes(buf[8..16].try_into().unwrap());
        let raw_original = u64::from_le_bytes(buf[16..24].try_into().unwrap());

        if (raw_offset | raw_original) & RESERVED_BITS_MASK != 0 {
            if strict {
                return Err(WimError::header(
                    "reserved bits 62-63 set in resource offset or size",
                ));
            }
            warn!(
                "masking reserved bits in resource entry (offset {:#x}, size {:#x})",
                raw_offset, raw_original
            );
        }

        Ok(Self {
            size_in_wim,
            flags,
            offset: raw_offset & !RESERVED_BITS_MASK,
            original_size: raw_original & !RESERVED_BITS_MASK,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_roundtrip() {
        let e = ResourceEntry {
            size_in_wim: 0x1234_5678_9a,
            flags: RESOURCE_FLAG_COMPRESSED | RESOURCE_FLAG_METADATA,
            offset: 0x0008_0000,
            original_size: 0x10_0000,
        };
        let mut buf = [0u8; RESOURCE_ENTRY_DISK_SIZE];
        e.write_to(&mut buf);
        let parsed = ResourceEntry::from_bytes(&buf, true).unwrap();
        assert_eq!(parsed, e);
    }

    #[test]
    fn reserved_bits_masked_lenient_rejected_strict() {
        let e = ResourceEntry {
            size_in_wim: 10,
            flags: 0,
            offset: 0x100,
            original_size: 10,
        };
        let mut buf = [0u8; RESOURCE_ENTRY_DISK_SIZE];
        e.write_to(&mut buf);
        buf[15] |= 0x80; // set bit 63 of offset

        assert!(ResourceEntry::from_bytes(&buf, true).is_err());
        let lenient = ResourceEntry::from_bytes(&buf, false).unwrap();
        assert_eq!(lenient.offset, 0x100);
    }

    #[test]
    fn chunk_geometry_boundaries() {
        let mk = |orig: u64| ResourceEntry {
            size_in_wim: 0,
            flags: RESOURCE_FLAG_COMPRESSED,
            offset: 0,
            original_size: orig,
        };
        // Exactly one chunk: no table entries.
        let e = mk(32768);
        assert_eq!(e.chunk_count(), 1);
        assert_eq!(e.chunk_table_size(), 0);
        // One byte over: two chunks, one 4-byte entry, 1-byte tail chunk.
        let e = mk(32769);
        assert_eq!(e.chunk_count(), 2);
        assert_eq!(e.chunk_table_size(), 4);
        assert_eq!(e.chunk_original_size(1), 1);
        // Past 2^32: 8-byte table entries.
        let e = mk(1u64 << 32);
        assert_eq!(e.chunk_entry_size(), 8);
    }
}
