//! Blob table — the SHA-1-indexed content store.
//!
//! Every unique byte stream in the archive is one blob, keyed by the SHA-1
//! of its uncompressed content. Streams hold non-owning references (the
//! hash); ownership of blob descriptors belongs to this table, which is what
//! gives the format its deduplication and integrity guarantees.
//!
//! # On-disk entry (50 bytes, all fields little-endian)
//!
//! ```text
//! Offset  Size  Field
//!    0     24   resource entry (see resource module)
//!   24      2   part_number
//!   26      4   reference count
//!   30     20   SHA-1 of the uncompressed content
//! ```
//!
//! The table resource is the concatenation of entries in insertion order;
//! per-image metadata resources appear here too, flagged METADATA with a
//! reference count of 1.
//!
//! Concurrency: one task mutates the table during capture; apply reads a
//! frozen table. The archive-level mutex lives in `WimFile`.

use std::collections::HashMap;
use std::path::PathBuf;

use crate::error::{Result, WimError};
use crate::integrity::{Sha1Hash, SHA1_LEN};
use crate::resource::{ResourceEntry, RESOURCE_ENTRY_DISK_SIZE};

pub const BLOB_ENTRY_DISK_SIZE: usize = RESOURCE_ENTRY_DISK_SIZE + 2 + 4 + SHA1_LEN;

/// Where a blob's bytes live until (and after) they are written into the
/// archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlobSource {
    /// Stored in this archive; `entry` is valid.
    Archive,
    /// Pending capture: stream out of a source file at write time.
    File {
        path: PathBuf,
        stream_name: Option<String>,
    },
    /// Pending capture of already-buffered bytes (reparse data, security).
    Memory(Vec<u8>),
    /// Stored in another archive (export): pull through its resource layer.
    Wim {
        path: PathBuf,
        entry: ResourceEntry,
        codec: crate::codec::CodecKind,
    },
}

#[derive(Debug, Clone)]
pub struct BlobDescriptor {
    pub hash: Sha1Hash,
    pub entry: ResourceEntry,
    pub part_number: u16,
    pub refcount: u32,
    pub source: BlobSource,
}

impl BlobDescriptor {
    fn write_to(&self, out: &mut Vec<u8>) {
        let mut res = [0u8; RESOURCE_ENTRY_DISK_SIZE];
        self.entry.write_to(&mut res);
        out.extend_from_slice(&res);
        out.extend_from_slice(&self.part_number.to_le_bytes());
        out.extend_from_slice(&self.refcount.to_le_bytes());
        out.extend_from_slice(&self.hash);
    }
}

/// SHA-1 → descriptor map preserving insertion order, so table writes are
/// deterministic and metadata resources keep their image ordering.
#[derive(Debug, Default)]
pub struct BlobTable {
    entries: Vec<BlobDescriptor>,
    by_hash: HashMap<Sha1Hash, usize>,
}

impl BlobTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &BlobDescriptor> {
        self.entries.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut BlobDescriptor> {
        self.entries.iter_mut()
    }

    pub fn lookup(&self, hash: &Sha1Hash) -> Option<&BlobDescriptor> {
        self.by_hash.get(hash).map(|&i| &self.entries[i])
    }

    pub fn lookup_mut(&mut self, hash: &Sha1Hash) -> Option<&mut BlobDescriptor> {
        let i = *self.by_hash.get(hash)?;
        Some(&mut self.entries[i])
    }

    /// Return the existing descriptor for `hash` after bumping its reference
    /// count, or insert the one produced by `make` with a count of 1.
    /// The `bool` is true when the blob was newly inserted.
    pub fn insert_or_intern(
        &mut self,
        hash: Sha1Hash,
        make: impl FnOnce() -> BlobDescriptor,
    ) -> (&mut BlobDescriptor, bool) {
        match self.by_hash.get(&hash) {
            Some(&i) => {
                let d = &mut self.entries[i];
                d.refcount += 1;
                (d, false)
            }
            None => {
                let mut d = make();
                d.hash = hash;
                d.refcount = 1;
                let i = self.entries.len();
                self.entries.push(d);
                self.by_hash.insert(hash, i);
                (&mut self.entries[i], true)
            }
        }
    }

    /// Drop `n` references from a blob. Zero-refcount entries linger as
    /// orphans until [`BlobTable::prune_orphans`] runs at write time.
    pub fn release(&mut self, hash: &Sha1Hash, n: u32) {
        if let Some(d) = self.lookup_mut(hash) {
            d.refcount = d.refcount.saturating_sub(n);
        }
    }

    /// Remove entries whose reference count reached zero. Returns how many
    /// were dropped.
    pub fn prune_orphans(&mut self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|d| d.refcount > 0);
        self.by_hash.clear();
        for (i, d) in self.entries.iter().enumerate() {
            self.by_hash.insert(d.hash, i);
        }
        before - self.entries.len()
    }

    /// Serialize in insertion order. Metadata-resource entries (flagged
    /// METADATA, tracked per image rather than content-addressed) are
    /// written first, in image order.
    pub fn to_bytes(&self, metadata: &[BlobDescriptor]) -> Vec<u8> {
        let mut out =
            Vec::with_capacity((metadata.len() + self.entries.len()) * BLOB_ENTRY_DISK_SIZE);
        for d in metadata {
            debug_assert!(d.entry.is_metadata());
            d.write_to(&mut out);
        }
        for d in &self.entries {
            d.write_to(&mut out);
        }
        out
    }

    /// Parse a decompressed blob-table resource. Metadata entries are split
    /// out (in table order, which is image order); content entries must
    /// have unique SHA-1 keys.
    pub fn from_bytes(data: &[u8], strict: bool) -> Result<(Self, Vec<BlobDescriptor>)> {
        if data.len() % BLOB_ENTRY_DISK_SIZE != 0 {
            return Err(WimError::metadata(
                0,
                format!(
                    "blob table size {} is not a multiple of {BLOB_ENTRY_DISK_SIZE}",
                    data.len()
                ),
            ));
        }
        let mut table = Self::new();
        let mut metadata = Vec::new();
        for (i, rec) in data.chunks_exact(BLOB_ENTRY_DISK_SIZE).enumerate() {
            let entry = ResourceEntry::from_bytes(&rec[..RESOURCE_ENTRY_DISK_SIZE], strict)?;
            let part_number = u16::from_le_bytes(rec[24..26].try_into().unwrap());
            let refcount = u32::from_le_bytes(rec[26..30].try_into().unwrap());
            let mut hash: Sha1Hash = [0; SHA1_LEN];
            hash.copy_from_slice(&rec[30..50]);

            if entry.original_size == 0 {
                return Err(WimError::metadata(
                    (i * BLOB_ENTRY_DISK_SIZE) as u64,
                    "blob entry with zero-length content (empty content must be elided)",
                ));
            }
            let descriptor = BlobDescriptor {
                hash,
                entry,
                part_number,
                refcount,
                source: BlobSource::Archive,
            };
            if entry.is_metadata() {
                metadata.push(descriptor);
                continue;
            }
            if table.by_hash.contains_key(&hash) {
                return Err(WimError::metadata(
                    (i * BLOB_ENTRY_DISK_SIZE) as u64,
                    format!("duplicate blob entry for {}", hex::encode(hash)),
                ));
            }
            let idx = table.entries.len();
            table.entries.push(descriptor);
            table.by_hash.insert(hash, idx);
        }
        Ok((table, metadata))
    }

    /// Sum of all reference counts; the load-time invariant checks this
    /// against the number of stream references across retained images.
    pub fn total_refs(&self) -> u64 {
        self.entries.iter().map(|d| d.refcount as u64).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integrity::sha1_of;

    fn blob(hash: Sha1Hash, size: u64) -> BlobDescriptor {
        BlobDescriptor {
            hash,
            entry: ResourceEntry {
                size_in_wim: size,
                flags: 0,
                offset: 4096,
                original_size: size,
            },
            part_number: 1,
            refcount: 0,
            source: BlobSource::Archive,
        }
    }

    #[test]
    fn intern_dedupes_and_counts() {
        let mut t = BlobTable::new();
        let h = sha1_of(b"hello");
        let (_, new) = t.insert_or_intern(h, || blob(h, 5));
        assert!(new);
        for _ in 0..999 {
            let (_, new) = t.insert_or_intern(h, || blob(h, 5));
            assert!(!new);
        }
        assert_eq!(t.len(), 1);
        assert_eq!(t.lookup(&h).unwrap().refcount, 1000);
        assert_eq!(t.total_refs(), 1000);
    }

    #[test]
    fn release_and_prune() {
        let mut t = BlobTable::new();
        let a = sha1_of(b"a");
        let b = sha1_of(b"b");
        t.insert_or_intern(a, || blob(a, 1));
        t.insert_or_intern(b, || blob(b, 1));
        t.release(&a, 1);
        assert_eq!(t.prune_orphans(), 1);
        assert!(t.lookup(&a).is_none());
        assert!(t.lookup(&b).is_some());
    }

    #[test]
    fn roundtrip_preserves_order_and_fields() {
        let mut t = BlobTable::new();
        for i in 0..10u8 {
            let h = sha1_of(&[i]);
            let (d, _) = t.insert_or_intern(h, || blob(h, 100 + i as u64));
            d.refcount = i as u32 + 1;
        }
        let bytes = t.to_bytes(&[]);
        assert_eq!(bytes.len(), 10 * BLOB_ENTRY_DISK_SIZE);

        let (parsed, metadata) = BlobTable::from_bytes(&bytes, true).unwrap();
        assert!(metadata.is_empty());
        assert_eq!(parsed.len(), 10);
        for (orig, got) in t.iter().zip(parsed.iter()) {
            assert_eq!(orig.hash, got.hash);
            assert_eq!(orig.refcount, got.refcount);
            assert_eq!(orig.entry, got.entry);
            assert_eq!(got.source, BlobSource::Archive);
        }
    }

    #[test]
    fn duplicate_hashes_are_rejected() {
        let mut t = BlobTable::new();
        let h = sha1_of(b"x");
        t.insert_or_intern(h, || blob(h, 1));
        let mut bytes = t.to_bytes(&[]);
        let dup = bytes.clone();
        bytes.extend_from_slice(&dup);
        assert!(BlobTable::from_bytes(&bytes, true).is_err());
    }

    #[test]
    fn truncated_table_is_rejected() {
        let mut t = BlobTable::new();
        let h = sha1_of(b"x");
        t.insert_or_intern(h, || blob(h, 1));
        let bytes = t.to_bytes(&[]);
        assert!(BlobTable::from_bytes(&bytes[..bytes.len() - 1], true).is_err());
    }
}
