//! Content hashing and whole-file integrity.
//!
//! SHA-1 is the format's content address: blob keys, security-descriptor
//! interning, and the integrity table all use it. The integrity table is a
//! separate resource referenced from the header; it holds one SHA-1 per
//! 10 MiB slice of the region between the end of the header and the start of
//! the integrity table itself, so a whole archive can be checked without
//! decompressing anything.
//!
//! # On-disk layout (all fields little-endian)
//!
//! ```text
//! Offset  Size  Field
//!    0      8   covered_size   bytes of file covered by the table
//!    8      4   chunk_size     always 10 MiB
//!   12    N×20  chunk SHA-1s   ceil(covered_size / chunk_size) entries
//! ```

use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use byteorder::{ByteOrder, LittleEndian};
use sha1::{Digest, Sha1};

use crate::error::{Result, WimError};

pub const SHA1_LEN: usize = 20;

/// The 20-byte content address.
pub type Sha1Hash = [u8; SHA1_LEN];

/// Sentinel for "no content": empty streams carry this hash and reference no
/// blob.
pub const ZERO_HASH: Sha1Hash = [0u8; SHA1_LEN];

/// Integrity-table chunk granularity: 10 MiB of raw file bytes.
pub const INTEGRITY_CHUNK_SIZE: u32 = 10 * 1024 * 1024;

/// One-shot SHA-1.
pub fn sha1_of(data: &[u8]) -> Sha1Hash {
    let mut h = Sha1::new();
    h.update(data);
    h.finalize().into()
}

// ── Integrity table ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct IntegrityTable {
    pub covered_size: u64,
    pub chunks: Vec<Sha1Hash>,
}

impl IntegrityTable {
    /// Compute a table over `file[start..end)` by streaming 10 MiB slices.
    pub fn compute<F: Read + Seek>(file: &mut F, path: &Path, start: u64, end: u64) -> Result<Self> {
        debug_assert!(end >= start);
        file.seek(SeekFrom::Start(start)).map_err(|e| WimError::Seek {
            path: path.to_owned(),
            offset: start,
            source: e,
        })?;

        let covered_size = end - start;
        let mut chunks = Vec::with_capacity(covered_size.div_ceil(INTEGRITY_CHUNK_SIZE as u64) as usize);
        let mut remaining = covered_size;
        let mut buf = vec![0u8; 1 << 20];
        while remaining > 0 {
            let mut h = Sha1::new();
            let mut chunk_left = remaining.min(INTEGRITY_CHUNK_SIZE as u64);
            remaining -= chunk_left;
            while chunk_left > 0 {
                let n = (buf.len() as u64).min(chunk_left) as usize;
                file.read_exact(&mut buf[..n]).map_err(|e| WimError::Read {
                    path: path.to_owned(),
                    offset: end - remaining - chunk_left,
                    len: n,
                    source: e,
                })?;
                h.update(&buf[..n]);
                chunk_left -= n as u64;
            }
            chunks.push(h.finalize().into());
        }

        Ok(Self { covered_size, chunks })
    }

    /// Recompute over the same region and compare chunk by chunk.
    /// The first mismatching chunk fails with `InvalidResourceHash`.
    pub fn verify<F: Read + Seek>(&self, file: &mut F, path: &Path, start: u64) -> Result<()> {
        let actual = Self::compute(file, path, start, start + self.covered_size)?;
        if actual.chunks.len() != self.chunks.len() {
            return Err(WimError::header(format!(
                "integrity table holds {} chunk hashes, expected {}",
                self.chunks.len(),
                actual.chunks.len()
            )));
        }
        for (i, (want, got)) in self.chunks.iter().zip(&actual.chunks).enumerate() {
            if want != got {
                return Err(WimError::InvalidResourceHash {
                    hash: format!("integrity chunk {i}: {}", hex::encode(want)),
                    actual: hex::encode(got),
                });
            }
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(12 + self.chunks.len() * SHA1_LEN);
        out.extend_from_slice(&self.covered_size.to_le_bytes());
        out.extend_from_slice(&INTEGRITY_CHUNK_SIZE.to_le_bytes());
        for c in &self.chunks {
            out.extend_from_slice(c);
        }
        out
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < 12 {
            return Err(WimError::header("integrity table shorter than its fixed fields"));
        }
        let covered_size = LittleEndian::read_u64(&data[0..8]);
        let chunk_size = LittleEndian::read_u32(&data[8..12]);
        if chunk_size != INTEGRITY_CHUNK_SIZE {
            return Err(WimError::header(format!(
                "integrity chunk size {chunk_size} is not {INTEGRITY_CHUNK_SIZE}"
            )));
        }
        let want = covered_size.div_ceil(chunk_size as u64) as usize;
        let body = &data[12..];
        if body.len() != want * SHA1_LEN {
            return Err(WimError::header(format!(
                "integrity table body is {} bytes, expected {} hashes",
                body.len(),
                want
            )));
        }
        let chunks = body
            .chunks_exact(SHA1_LEN)
            .map(|c| {
                let mut h = ZERO_HASH;
                h.copy_from_slice(c);
                h
            })
            .collect();
        Ok(Self { covered_size, chunks })
    }
}
