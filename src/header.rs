//! Archive header — format anchor at offset 0.
//!
//! # On-disk layout (208 bytes, all fields little-endian)
//!
//! ```text
//! Offset  Size  Field
//!    0      8   magic          = "MSWIM\0\0\0"
//!    8      4   header_size    = 208
//!   12      4   version        = 0x10d00
//!   16      4   flags          see HDR_FLAG_*
//!   20      4   chunk_size     always 32768
//!   24     16   guid           unique per archive; shared across split parts
//!   40      2   part_number    1-based
//!   42      2   total_parts    1 unless spanned
//!   44      4   image_count
//!   48     24   blob_table     resource entry
//!   72     24   xml_data       resource entry
//!   96     24   boot_metadata  resource entry (all zeros if none)
//!  120      4   boot_index     0 = no bootable image
//!  124     24   integrity      resource entry (all zeros if none)
//!  148    ...   zero padding to exactly 208 bytes
//! ```
//!
//! # Codec selection
//! Compression is a header property: `HDR_FLAG_COMPRESSION` plus exactly one
//! of `HDR_FLAG_COMPRESS_XPRESS` / `HDR_FLAG_COMPRESS_LZX`. Uncompressed
//! archives set none of the three. Every compressed resource in the file
//! uses the declared codec; there is no per-resource negotiation.

use std::io::{self, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt};
use uuid::Uuid;

use crate::codec::CodecKind;
use crate::error::{Result, WimError};
use crate::resource::{ResourceEntry, RESOURCE_ENTRY_DISK_SIZE};

pub const MAGIC: &[u8; 8] = b"MSWIM\0\0\0";
pub const HEADER_SIZE: usize = 208;
pub const VERSION: u32 = 0x10d00;

/// Uncompressed chunk granularity of every compressed resource.
pub const WIM_CHUNK_SIZE: usize = 32768;

pub const HDR_FLAG_RESERVED: u32 = 0x0000_0001;
pub const HDR_FLAG_COMPRESSION: u32 = 0x0000_0002;
pub const HDR_FLAG_READONLY: u32 = 0x0000_0004;
pub const HDR_FLAG_SPANNED: u32 = 0x0000_0008;
pub const HDR_FLAG_INTEGRITY: u32 = 0x0000_0010;
pub const HDR_FLAG_COMPRESS_XPRESS: u32 = 0x0002_0000;
pub const HDR_FLAG_COMPRESS_LZX: u32 = 0x0004_0000;

#[derive(Debug, Clone)]
pub struct WimHeader {
    pub flags: u32,
    pub guid: Uuid,
    pub part_number: u16,
    pub total_parts: u16,
    pub image_count: u32,
    pub blob_table: ResourceEntry,
    pub xml_data: ResourceEntry,
    pub boot_metadata: ResourceEntry,
    pub boot_index: u32,
    pub integrity: ResourceEntry,
}

impl WimHeader {
    pub fn new(codec: CodecKind) -> Self {
        let flags = match codec {
            CodecKind::None => 0,
            CodecKind::Xpress => HDR_FLAG_COMPRESSION | HDR_FLAG_COMPRESS_XPRESS,
            CodecKind::Lzx => HDR_FLAG_COMPRESSION | HDR_FLAG_COMPRESS_LZX,
        };
        Self {
            flags,
            guid: Uuid::new_v4(),
            part_number: 1,
            total_parts: 1,
            image_count: 0,
            blob_table: ResourceEntry::default(),
            xml_data: ResourceEntry::default(),
            boot_metadata: ResourceEntry::default(),
            boot_index: 0,
            integrity: ResourceEntry::default(),
        }
    }

    /// The codec every compressed resource in this archive uses.
    pub fn codec(&self) -> Result<CodecKind> {
        let xpress = self.flags & HDR_FLAG_COMPRESS_XPRESS != 0;
        let lzx = self.flags & HDR_FLAG_COMPRESS_LZX != 0;
        if self.flags & HDR_FLAG_COMPRESSION == 0 {
            if xpress || lzx {
                return Err(WimError::header(
                    "codec flag set without the compression flag",
                ));
            }
            return Ok(CodecKind::None);
        }
        match (xpress, lzx) {
            (true, false) => Ok(CodecKind::Xpress),
            (false, true) => Ok(CodecKind::Lzx),
            (false, false) => Err(WimError::header(
                "compression flag set but no codec flag selected",
            )),
            (true, true) => Err(WimError::header("both codec flags set")),
        }
    }

    #[inline]
    pub fn is_spanned(&self) -> bool {
        self.flags & HDR_FLAG_SPANNED != 0
    }

    #[inline]
    pub fn has_integrity(&self) -> bool {
        self.flags & HDR_FLAG_INTEGRITY != 0
    }

    /// Write the header and pad to exactly [`HEADER_SIZE`] bytes.
    pub fn write<W: Write>(&self, mut w: W) -> io::Result<()> {
        let mut buf = Vec::with_capacity(HEADER_SIZE);
        buf.extend_from_slice(MAGIC); // 8
        buf.extend_from_slice(&(HEADER_SIZE as u32).to_le_bytes()); // 4
        buf.extend_from_slice(&VERSION.to_le_bytes()); // 4
        buf.extend_from_slice(&self.flags.to_le_bytes()); // 4
        buf.extend_from_slice(&(WIM_CHUNK_SIZE as u32).to_le_bytes()); // 4
        buf.extend_from_slice(self.guid.as_bytes()); // 16
        buf.extend_from_slice(&self.part_number.to_le_bytes()); // 2
        buf.extend_from_slice(&self.total_parts.to_le_bytes()); // 2
        buf.extend_from_slice(&self.image_count.to_le_bytes()); // 4

        let mut entry = [0u8; RESOURCE_ENTRY_DISK_SIZE];
        for res in [&self.blob_table, &self.xml_data, &self.boot_metadata] {
            res.write_to(&mut entry);
            buf.extend_from_slice(&entry); // 24 each
        }
        buf.extend_from_slice(&self.boot_index.to_le_bytes()); // 4
        self.integrity.write_to(&mut entry);
        buf.extend_from_slice(&entry); // 24

        debug_assert_eq!(buf.len(), 148);
        buf.resize(HEADER_SIZE, 0u8);
        w.write_all(&buf)
    }

    /// Read and validate a header. `strict` governs reserved-bit handling in
    /// the embedded resource entries.
    pub fn read<R: Read>(mut r: R, strict: bool) -> Result<Self> {
        let mut buf = [0u8; HEADER_SIZE];
        r.read_exact(&mut buf)
            .map_err(|e| WimError::header(format!("short header: {e}")))?;
        let mut cur = &buf[..];

        let mut magic = [0u8; 8];
        cur.read_exact(&mut magic).unwrap();
        if &magic != MAGIC {
            return Err(WimError::header("bad magic — not a WIM archive"));
        }

        let header_size = cur.read_u32::<LittleEndian>().unwrap();
        if (header_size as usize) < HEADER_SIZE {
            return Err(WimError::header(format!(
                "declared header size {header_size} below minimum {HEADER_SIZE}"
            )));
        }
        let version = cur.read_u32::<LittleEndian>().unwrap();
        if version != VERSION {
            return Err(WimError::header(format!(
                "unsupported format version {version:#x} (this build reads {VERSION:#x})"
            )));
        }
        let flags = cur.read_u32::<LittleEndian>().unwrap();
        let chunk_size = cur.read_u32::<LittleEndian>().unwrap();
        if chunk_size as usize != WIM_CHUNK_SIZE {
            return Err(WimError::header(format!(
                "chunk size {chunk_size} is not {WIM_CHUNK_SIZE}"
            )));
        }

        let mut guid_bytes = [0u8; 16];
        cur.read_exact(&mut guid_bytes).unwrap();
        let guid = Uuid::from_bytes(guid_bytes);

        let part_number = cur.read_u16::<LittleEndian>().unwrap();
        let total_parts = cur.read_u16::<LittleEndian>().unwrap();
        if part_number == 0 || part_number > total_parts {
            return Err(WimError::header(format!(
                "part {part_number} of {total_parts} is out of range"
            )));
        }
        let image_count = cur.read_u32::<LittleEndian>().unwrap();

        let mut entries = [ResourceEntry::default(); 3];
        for e in entries.iter_mut() {
            *e = ResourceEntry::from_bytes(&cur[..RESOURCE_ENTRY_DISK_SIZE], strict)?;
            cur = &cur[RESOURCE_ENTRY_DISK_SIZE..];
        }
        let [blob_table, xml_data, boot_metadata] = entries;

        let boot_index = cur.read_u32::<LittleEndian>().unwrap();
        if boot_index > image_count {
            return Err(WimError::header(format!(
                "boot index {boot_index} exceeds image count {image_count}"
            )));
        }
        let integrity = ResourceEntry::from_bytes(&cur[..RESOURCE_ENTRY_DISK_SIZE], strict)?;

        let header = Self {
            flags,
            guid,
            part_number,
            total_parts,
            image_count,
            blob_table,
            xml_data,
            boot_metadata,
            boot_index,
            integrity,
        };
        // Surface inconsistent codec flags now, not at first chunk read.
        header.codec()?;
        if header.has_integrity() && header.integrity.is_zero() {
            return Err(WimError::header(
                "integrity flag set but no integrity table resource",
            ));
        }
        Ok(header)
    }
}
