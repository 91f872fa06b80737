//! High-level [`WimFile`] API — the primary embedding surface.
//!
//! ```no_run
//! use wimcore::{CodecKind, WimFile};
//! use wimcore::backend::posix::{PosixSource, PosixTarget};
//! use wimcore::capture::CaptureConfig;
//!
//! // Capture a directory into a fresh archive.
//! let mut wim = WimFile::create("out.wim", CodecKind::Lzx)?;
//! let mut source = PosixSource::new();
//! wim.add_image(&mut source, "/some/tree".as_ref(), "base", &CaptureConfig::new())?;
//! wim.write()?;
//!
//! // Re-open and apply.
//! let mut wim = WimFile::open("out.wim")?;
//! let mut target = PosixTarget::new("/restore/here");
//! wim.apply_image(1, &mut target, &Default::default())?;
//! # Ok::<(), wimcore::WimError>(())
//! ```
//!
//! Write updates are append-only for blob content: new blobs and changed
//! metadata go after the last kept resource, and only the blob table, XML
//! region, integrity table, and header are rewritten. `optimize` rebuilds
//! the whole file to shed orphaned content.

use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use log::warn;

use crate::apply::{self, ApplyOptions, ApplyStats};
use crate::backend::{ApplyTarget, CaptureSource};
use crate::blob::{BlobDescriptor, BlobSource, BlobTable};
use crate::capture::{self, CaptureConfig};
use crate::codec::CodecKind;
use crate::error::{Result, WimError};
use crate::header::{WimHeader, HDR_FLAG_INTEGRITY, HDR_FLAG_SPANNED, HEADER_SIZE};
use crate::integrity::{sha1_of, IntegrityTable, Sha1Hash};
use crate::metadata::{self, DuplicateStreamPolicy};
use crate::pool::HandlePool;
use crate::resource::{
    self, read_full, write_resource, ResourceEntry, ResourceWriter, RESOURCE_FLAG_METADATA,
};
use crate::security::SecurityTable;
use crate::tree::{FileTimes, FileTree};
use crate::xmldata::{ImageInfo, XmlData};

const POOL_RETAINED_HANDLES: usize = 8;
const COPY_BUF_SIZE: usize = crate::header::WIM_CHUNK_SIZE;

#[derive(Debug, Clone)]
pub struct OpenOptions {
    /// Reject reserved bits and invariant violations instead of masking or
    /// repairing with a warning.
    pub strict: bool,
    /// Verify the integrity table on open (when the archive carries one).
    pub check_integrity: bool,
    pub stream_policy: DuplicateStreamPolicy,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            strict: false,
            check_integrity: false,
            stream_policy: DuplicateStreamPolicy::Warn,
        }
    }
}

impl OpenOptions {
    pub fn strict() -> Self {
        Self {
            strict: true,
            check_integrity: true,
            stream_policy: DuplicateStreamPolicy::Error,
        }
    }
}

/// One image: tree, security table, properties, and the location of its
/// serialized metadata (cleared whenever the image is dirtied).
pub struct Image {
    pub tree: FileTree,
    pub security: SecurityTable,
    pub info: ImageInfo,
    metadata: Option<(ResourceEntry, Sha1Hash)>,
}

impl Image {
    fn stream_hashes(&self) -> Vec<Sha1Hash> {
        self.tree
            .stream_references()
            .into_iter()
            .map(|(h, _)| *h)
            .collect()
    }
}

pub struct WimFile {
    path: PathBuf,
    file: File,
    writable: bool,
    pool: HandlePool,
    header: WimHeader,
    codec: CodecKind,
    blobs: BlobTable,
    images: Vec<Image>,
    opts: OpenOptions,
}

impl WimFile {
    // ── Constructors ─────────────────────────────────────────────────────────

    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with(path, OpenOptions::default())
    }

    pub fn open_with<P: AsRef<Path>>(path: P, opts: OpenOptions) -> Result<Self> {
        let path = path.as_ref().to_owned();
        let (mut file, writable) = open_rw_or_ro(&path)?;

        let header = WimHeader::read(&mut file, opts.strict)?;
        let codec = header.codec()?;
        if header.is_spanned() {
            warn!(
                "{path:?} is part {} of {}: only locally stored blobs are readable",
                header.part_number, header.total_parts
            );
        }

        // Integrity first: everything else trusts the bytes.
        if opts.check_integrity && !header.integrity.is_zero() {
            let mut raw = Vec::new();
            read_full(&mut file, &path, &header.integrity, codec, &mut raw)?;
            let table = IntegrityTable::from_bytes(&raw)?;
            table.verify(&mut file, &path, HEADER_SIZE as u64)?;
        }

        // Blob table, with metadata entries split out in image order.
        let (blobs, metadata_entries) = if header.blob_table.is_zero() {
            (BlobTable::new(), Vec::new())
        } else {
            let mut raw = Vec::new();
            read_full(&mut file, &path, &header.blob_table, codec, &mut raw)?;
            BlobTable::from_bytes(&raw, opts.strict)?
        };

        if metadata_entries.len() as u32 != header.image_count {
            return Err(WimError::ImageCountMismatch {
                declared: header.image_count,
                found: metadata_entries.len() as u32,
            });
        }

        // XML property bag: best-effort, failures recorded then reported.
        let xml = if header.xml_data.is_zero() {
            XmlData::from_bytes(&[], metadata_entries.len())
        } else {
            let mut raw = Vec::new();
            read_full(&mut file, &path, &header.xml_data, codec, &mut raw)?;
            XmlData::from_bytes(&raw, metadata_entries.len())
        };
        for e in &xml.harvest_errors {
            warn!("image properties: {e}");
        }

        let mut this = Self {
            pool: HandlePool::new(path.clone(), POOL_RETAINED_HANDLES),
            path,
            file,
            writable,
            header,
            codec,
            blobs,
            images: Vec::new(),
            opts,
        };

        for (meta, info) in metadata_entries.into_iter().zip(xml.images) {
            let mut raw = Vec::new();
            read_full(&mut this.file, &this.path, &meta.entry, this.codec, &mut raw)?;
            if sha1_of(&raw) != meta.hash {
                return Err(WimError::InvalidResourceHash {
                    hash: hex::encode(meta.hash),
                    actual: hex::encode(sha1_of(&raw)),
                });
            }
            let (tree, security) = metadata::parse_image(&raw, this.opts.stream_policy)?;
            this.images.push(Image {
                tree,
                security,
                info,
                metadata: Some((meta.entry, meta.hash)),
            });
        }

        this.check_resolution_and_refcounts()?;
        Ok(this)
    }

    pub fn create<P: AsRef<Path>>(path: P, codec: CodecKind) -> Result<Self> {
        let path = path.as_ref().to_owned();
        let file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| WimError::Open {
                path: path.clone(),
                source: e,
            })?;
        Ok(Self {
            pool: HandlePool::new(path.clone(), POOL_RETAINED_HANDLES),
            path,
            file,
            writable: true,
            header: WimHeader::new(codec),
            codec,
            blobs: BlobTable::new(),
            images: Vec::new(),
            opts: OpenOptions::default(),
        })
    }

    /// Every stream reference must resolve to exactly one blob entry, and
    /// the blob reference counts must equal the stream references. In
    /// lenient mode a count mismatch is repaired with a warning.
    fn check_resolution_and_refcounts(&mut self) -> Result<()> {
        use std::collections::HashMap;
        // Content-only parts of a spanned set carry no images; their stored
        // counts come from part 1 and must be left alone.
        if self.header.is_spanned() && self.header.part_number != 1 {
            return Ok(());
        }
        let mut want: HashMap<Sha1Hash, u32> = HashMap::new();
        for image in &self.images {
            for hash in image.stream_hashes() {
                if self.blobs.lookup(&hash).is_none() {
                    return Err(WimError::metadata(
                        0,
                        format!("stream references missing blob {}", hex::encode(hash)),
                    ));
                }
                *want.entry(hash).or_insert(0) += 1;
            }
        }
        let mut mismatched = 0usize;
        for d in self.blobs.iter_mut() {
            let expected = want.get(&d.hash).copied().unwrap_or(0);
            if d.refcount != expected {
                mismatched += 1;
                d.refcount = expected;
            }
        }
        if mismatched > 0 {
            if self.opts.strict {
                return Err(WimError::metadata(
                    0,
                    format!("{mismatched} blob reference count(s) disagree with the stream references"),
                ));
            }
            warn!("repaired {mismatched} stale blob reference count(s)");
        }
        Ok(())
    }

    // ── Accessors ────────────────────────────────────────────────────────────

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn guid(&self) -> uuid::Uuid {
        self.header.guid
    }

    pub fn codec(&self) -> CodecKind {
        self.codec
    }

    pub fn image_count(&self) -> u32 {
        self.images.len() as u32
    }

    pub fn boot_index(&self) -> u32 {
        self.header.boot_index
    }

    pub fn blob_table(&self) -> &BlobTable {
        &self.blobs
    }

    /// Images are 1-based, as everywhere in the format.
    pub fn image(&self, index: u32) -> Result<&Image> {
        self.images
            .get(index.checked_sub(1).ok_or_else(|| self.no_image("0"))? as usize)
            .ok_or_else(|| self.no_image(&index.to_string()))
    }

    fn no_image(&self, selector: &str) -> WimError {
        WimError::NoImage {
            selector: selector.to_owned(),
            count: self.images.len() as u32,
        }
    }

    /// Resolve an image selector: a 1-based index or an image name.
    pub fn resolve_image(&self, selector: &str) -> Result<u32> {
        if let Ok(n) = selector.parse::<u32>() {
            self.image(n)?;
            return Ok(n);
        }
        for (i, image) in self.images.iter().enumerate() {
            if image.info.name == selector {
                return Ok(i as u32 + 1);
            }
        }
        Err(self.no_image(selector))
    }

    /// Ask the next write to append (or keep refreshing) an integrity
    /// table.
    pub fn set_integrity(&mut self, enabled: bool) {
        self.opts.check_integrity = enabled;
        if !enabled {
            self.header.flags &= !HDR_FLAG_INTEGRITY;
            self.header.integrity = ResourceEntry::default();
        }
    }

    pub fn set_boot_index(&mut self, index: u32) -> Result<()> {
        if index != 0 {
            self.image(index)?;
        }
        self.header.boot_index = index;
        Ok(())
    }

    // ── Image operations ─────────────────────────────────────────────────────

    /// Capture `root` as a new image named `name`. Returns its 1-based
    /// index.
    pub fn add_image(
        &mut self,
        source: &mut dyn CaptureSource,
        root: &Path,
        name: &str,
        config: &CaptureConfig,
    ) -> Result<u32> {
        self.check_name_free(name)?;
        let mut security = SecurityTable::new();
        let (tree, stats) =
            capture::capture_tree(source, root, config, &mut self.blobs, &mut security)?;
        let info = ImageInfo {
            name: name.to_owned(),
            dir_count: stats.dir_count,
            file_count: stats.file_count,
            total_bytes: stats.total_bytes,
            creation_time: FileTimes::now().creation,
            ..ImageInfo::default()
        };
        self.images.push(Image {
            tree,
            security,
            info,
            metadata: None,
        });
        Ok(self.images.len() as u32)
    }

    /// Install a synthetically built image. Stream references must already
    /// be interned (one [`WimFile::intern_blob`] call per reference).
    pub fn add_image_parts(
        &mut self,
        tree: FileTree,
        security: SecurityTable,
        info: ImageInfo,
    ) -> Result<u32> {
        self.check_name_free(&info.name)?;
        for (hash, _) in tree.stream_references() {
            if self.blobs.lookup(hash).is_none() {
                return Err(WimError::metadata(
                    0,
                    format!("stream references unknown blob {}", hex::encode(hash)),
                ));
            }
        }
        self.images.push(Image {
            tree,
            security,
            info,
            metadata: None,
        });
        Ok(self.images.len() as u32)
    }

    /// Intern in-memory bytes as a pending blob and account one stream
    /// reference to it.
    pub fn intern_blob(&mut self, data: &[u8]) -> Sha1Hash {
        let hash = sha1_of(data);
        let size = data.len() as u64;
        let owned = data.to_vec();
        self.blobs.insert_or_intern(hash, move || BlobDescriptor {
            hash,
            entry: ResourceEntry {
                original_size: size,
                ..ResourceEntry::default()
            },
            part_number: 1,
            refcount: 0,
            source: BlobSource::Memory(owned),
        });
        hash
    }

    /// Mark an image dirty after mutating its tree or security table
    /// directly; the next write re-serializes its metadata.
    pub fn invalidate_image(&mut self, index: u32) -> Result<()> {
        self.image(index)?;
        self.images[index as usize - 1].metadata = None;
        Ok(())
    }

    fn check_name_free(&self, name: &str) -> Result<()> {
        if !name.is_empty() && self.images.iter().any(|i| i.info.name == name) {
            return Err(WimError::ImageNameCollision {
                name: name.to_owned(),
            });
        }
        Ok(())
    }

    /// Drop an image; its blobs lose one reference per stream and orphans
    /// are pruned at the next write.
    pub fn delete_image(&mut self, index: u32) -> Result<()> {
        self.image(index)?;
        let image = self.images.remove(index as usize - 1);
        for hash in image.stream_hashes() {
            self.blobs.release(&hash, 1);
        }
        if self.header.boot_index == index {
            self.header.boot_index = 0;
        } else if self.header.boot_index > index {
            self.header.boot_index -= 1;
        }
        Ok(())
    }

    /// Copy an image into `dest`, blob-for-blob. Content already present in
    /// `dest` is only re-referenced, never restored.
    pub fn export_image(&mut self, index: u32, dest: &mut WimFile) -> Result<u32> {
        let image = self.image(index)?;
        dest.check_name_free(&image.info.name)?;

        let tree = image.tree.clone();
        let security = image.security.clone();
        let info = image.info.clone();

        let refs: Vec<Sha1Hash> = image.stream_hashes();
        for hash in refs {
            let src = self
                .blobs
                .lookup(&hash)
                .expect("load-time resolution holds")
                .clone();
            let from_path = self.path.clone();
            let codec = self.codec;
            dest.blobs.insert_or_intern(hash, move || {
                let source = match &src.source {
                    BlobSource::Archive => BlobSource::Wim {
                        path: from_path,
                        entry: src.entry,
                        codec,
                    },
                    other => other.clone(),
                };
                BlobDescriptor {
                    hash,
                    entry: ResourceEntry {
                        original_size: src.entry.original_size,
                        ..ResourceEntry::default()
                    },
                    part_number: 1,
                    refcount: 0,
                    source,
                }
            });
        }

        dest.images.push(Image {
            tree,
            security,
            info,
            metadata: None,
        });
        Ok(dest.images.len() as u32)
    }

    /// Apply an image onto a target back-end (both phases; see `apply`).
    pub fn apply_image(
        &mut self,
        index: u32,
        target: &mut dyn ApplyTarget,
        opts: &ApplyOptions,
    ) -> Result<ApplyStats> {
        self.image(index)?;
        let image = &self.images[index as usize - 1];
        apply::apply_tree(
            &mut self.file,
            &self.path,
            self.codec,
            &self.blobs,
            &image.tree,
            &image.security,
            target,
            opts,
        )
    }

    /// Read one blob's full verified content.
    pub fn read_blob(&mut self, hash: &Sha1Hash) -> Result<Vec<u8>> {
        let blob = self
            .blobs
            .lookup(hash)
            .ok_or_else(|| {
                WimError::metadata(0, format!("no blob {}", hex::encode(hash)))
            })?
            .clone();
        let mut out = Vec::new();
        resource::read_blob_verified(&mut self.file, &self.path, &blob, self.codec, &mut out)?;
        Ok(out)
    }

    /// Like [`WimFile::read_blob`] but usable through a shared reference:
    /// every call takes its own handle from the pool, so concurrent readers
    /// never contend on a file position.
    pub fn read_blob_shared(&self, hash: &Sha1Hash) -> Result<Vec<u8>> {
        let blob = self
            .blobs
            .lookup(hash)
            .ok_or_else(|| {
                WimError::metadata(0, format!("no blob {}", hex::encode(hash)))
            })?
            .clone();
        let mut handle = self.pool.acquire()?;
        let mut out = Vec::new();
        resource::read_blob_verified(&mut *handle, &self.path, &blob, self.codec, &mut out)?;
        Ok(out)
    }

    // ── Write path ───────────────────────────────────────────────────────────

    /// Persist all pending changes: append new blobs and changed metadata,
    /// then rewrite the blob table, XML region, integrity table, and
    /// header.
    pub fn write(&mut self) -> Result<()> {
        self.ensure_writable()?;
        self.blobs.prune_orphans();

        // Everything from the old blob table on is rewritten.
        let append_at = if self.header.blob_table.is_zero() {
            HEADER_SIZE as u64
        } else {
            self.header.blob_table.offset
        };
        // A fresh file zero-extends over the header region; it is written
        // for real in step 6.
        self.file.set_len(append_at).map_err(|e| WimError::Write {
            path: self.path.clone(),
            offset: append_at,
            source: e,
        })?;
        self.seek(append_at)?;

        // 1. Pending blob content, in table order. Emission order among
        // equal-prefix hashes is unspecified by the format; this is simply
        // discovery order.
        self.flush_pending_blobs()?;

        // 2. Metadata resources for new or dirtied images.
        for i in 0..self.images.len() {
            if self.images[i].metadata.is_some() {
                continue;
            }
            let raw = metadata::serialize_image(&self.images[i].tree, &self.images[i].security);
            let (entry, hash) = write_resource(
                &mut self.file,
                &self.path,
                self.codec,
                &raw,
                RESOURCE_FLAG_METADATA,
            )?;
            self.images[i].metadata = Some((entry, hash));
        }

        // 3. Blob table.
        let metadata_entries: Vec<BlobDescriptor> = self
            .images
            .iter()
            .map(|img| {
                let (entry, hash) = img.metadata.expect("serialized above");
                BlobDescriptor {
                    hash,
                    entry,
                    part_number: self.header.part_number,
                    refcount: 1,
                    source: BlobSource::Archive,
                }
            })
            .collect();
        let table_bytes = self.blobs.to_bytes(&metadata_entries);
        let (table_entry, _) =
            write_resource(&mut self.file, &self.path, self.codec, &table_bytes, 0)?;

        // 4. XML property bag, stored uncompressed so external tools can
        // inspect it.
        let xml = XmlData {
            images: self.images.iter().map(|i| i.info.clone()).collect(),
            harvest_errors: Vec::new(),
        };
        let xml_bytes = xml.to_bytes()?;
        let (xml_entry, _) =
            write_resource(&mut self.file, &self.path, CodecKind::None, &xml_bytes, 0)?;

        // 5. Integrity table over everything between header and itself.
        let keep_integrity = self.opts.check_integrity || self.header.has_integrity();
        let integrity_entry = if keep_integrity {
            let end = self.stream_position()?;
            let table =
                IntegrityTable::compute(&mut self.file, &self.path, HEADER_SIZE as u64, end)?;
            self.seek(end)?;
            let (entry, _) = write_resource(
                &mut self.file,
                &self.path,
                CodecKind::None,
                &table.to_bytes(),
                0,
            )?;
            self.header.flags |= HDR_FLAG_INTEGRITY;
            entry
        } else {
            ResourceEntry::default()
        };

        // 6. Header rewrite.
        self.header.blob_table = table_entry;
        self.header.xml_data = xml_entry;
        self.header.integrity = integrity_entry;
        self.header.image_count = self.images.len() as u32;
        self.header.boot_metadata = match self.header.boot_index {
            0 => ResourceEntry::default(),
            boot => self.images[boot as usize - 1].metadata.expect("serialized above").0,
        };
        self.seek(0)?;
        let mut h = Vec::new();
        self.header.write(&mut h).expect("in-memory write");
        self.file.write_all(&h).map_err(|e| WimError::Write {
            path: self.path.clone(),
            offset: 0,
            source: e,
        })?;
        self.file.sync_all().map_err(|e| WimError::Write {
            path: self.path.clone(),
            offset: 0,
            source: e,
        })?;
        Ok(())
    }

    fn flush_pending_blobs(&mut self) -> Result<()> {
        // Collect first: the table cannot be borrowed while the file moves.
        let pending: Vec<(Sha1Hash, u64, BlobSource)> = self
            .blobs
            .iter()
            .filter(|d| d.source != BlobSource::Archive)
            .map(|d| (d.hash, d.entry.original_size, d.source.clone()))
            .collect();

        for (hash, size, source) in pending {
            let entry = match &source {
                BlobSource::File { .. } | BlobSource::Memory(_) => {
                    let mut reader = capture::open_pending_source(&source)?;
                    let mut writer =
                        ResourceWriter::new(&mut self.file, &self.path, self.codec, size)?;
                    let mut buf = vec![0u8; COPY_BUF_SIZE];
                    loop {
                        let n = reader.read(&mut buf).map_err(|e| WimError::Read {
                            path: capture::pending_source_path(&source),
                            offset: 0,
                            len: buf.len(),
                            source: e,
                        })?;
                        if n == 0 {
                            break;
                        }
                        writer.write(&buf[..n])?;
                    }
                    let (entry, actual_hash) = writer.finish(0)?;
                    if actual_hash != hash {
                        return Err(WimError::InvalidResourceHash {
                            hash: hex::encode(hash),
                            actual: hex::encode(actual_hash),
                        });
                    }
                    entry
                }
                BlobSource::Wim {
                    path: src_path,
                    entry: src_entry,
                    codec: src_codec,
                } => {
                    let (mut src_file, _) = open_rw_or_ro(src_path)?;
                    let mut cursor =
                        resource::ChunkCursor::new(&mut src_file, src_path, src_entry, *src_codec)?;
                    let mut writer =
                        ResourceWriter::new(&mut self.file, &self.path, self.codec, size)?;
                    let mut chunk = vec![0u8; COPY_BUF_SIZE];
                    loop {
                        let n = cursor.next_chunk(&mut src_file, src_path, &mut chunk)?;
                        if n == 0 {
                            break;
                        }
                        writer.write(&chunk[..n])?;
                    }
                    let (entry, actual_hash) = writer.finish(0)?;
                    if actual_hash != hash {
                        return Err(WimError::InvalidResourceHash {
                            hash: hex::encode(hash),
                            actual: hex::encode(actual_hash),
                        });
                    }
                    entry
                }
                BlobSource::Archive => unreachable!("filtered above"),
            };
            let d = self.blobs.lookup_mut(&hash).expect("pending blob exists");
            d.entry = entry;
            d.part_number = self.header.part_number;
            d.source = BlobSource::Archive;
        }
        Ok(())
    }

    /// Rebuild the archive from scratch, dropping orphaned blob content and
    /// dead space. The file is replaced atomically.
    pub fn optimize(&mut self) -> Result<u64> {
        let old_size = self.file.metadata().map(|m| m.len()).unwrap_or(0);
        let tmp = self.path.with_extension("optimizing.tmp");

        {
            let mut dest = WimFile::create(&tmp, self.codec)?;
            dest.header.guid = self.header.guid;
            dest.opts.check_integrity = self.header.has_integrity();
            for i in 1..=self.image_count() {
                self.export_image(i, &mut dest)?;
            }
            dest.header.boot_index = self.header.boot_index;
            dest.write()?;
        }

        fs::rename(&tmp, &self.path).map_err(|e| WimError::Write {
            path: self.path.clone(),
            offset: 0,
            source: e,
        })?;
        let reopened = WimFile::open_with(&self.path, self.opts.clone())?;
        let new_size = reopened.file.metadata().map(|m| m.len()).unwrap_or(0);
        *self = reopened;
        Ok(old_size.saturating_sub(new_size))
    }

    /// Split into spanned parts no larger than `part_size` bytes of blob
    /// content each. Part 1 keeps all metadata, the property bag, and the
    /// full blob table (entries carry their part number); parts 2..N hold
    /// only blob content and their local table slice.
    pub fn split(&mut self, part_size: u64) -> Result<Vec<PathBuf>> {
        if self.blobs.iter().any(|d| d.source != BlobSource::Archive) {
            return Err(WimError::unsupported(
                "split requires a fully written archive (call write first)",
            ));
        }

        // Assign blobs to parts greedily by ascending offset.
        let mut assignment: Vec<(Sha1Hash, u16)> = Vec::new();
        let mut order: Vec<&BlobDescriptor> = self.blobs.iter().collect();
        order.sort_by_key(|d| d.entry.offset);
        let mut part: u16 = 1;
        let mut used: u64 = 0;
        for d in order {
            let sz = d.entry.size_in_wim;
            if used + sz > part_size && used > 0 {
                part += 1;
                used = 0;
            }
            used += sz;
            assignment.push((d.hash, part));
        }
        let total_parts = part.max(1);

        let stem = self
            .path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "archive".into());
        let dir = self
            .path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        let mut paths = Vec::new();
        let mut remote_entries: Vec<BlobDescriptor> = Vec::new();
        // Parts 2..N first, recording where every remote blob landed.
        for k in 2..=total_parts {
            let part_path = dir.join(format!("{stem}{k}.swm"));
            let written = self.write_split_part(&part_path, k, total_parts, &assignment)?;
            remote_entries.extend(written);
            paths.push(part_path);
        }
        let part1 = dir.join(format!("{stem}1.swm"));
        self.write_split_part1(&part1, total_parts, &assignment, &remote_entries)?;
        paths.insert(0, part1);
        Ok(paths)
    }

    /// Write one content-only part; returns the relocated blob entries.
    fn write_split_part(
        &mut self,
        part_path: &Path,
        part: u16,
        total_parts: u16,
        assignment: &[(Sha1Hash, u16)],
    ) -> Result<Vec<BlobDescriptor>> {
        let mut out = create_file_rw(part_path)?;
        out.write_all(&[0u8; HEADER_SIZE]).map_err(|e| WimError::Write {
            path: part_path.to_owned(),
            offset: 0,
            source: e,
        })?;

        let mut written = Vec::new();
        for (hash, assigned) in assignment {
            if *assigned != part {
                continue;
            }
            let entry = self.copy_blob_into(&mut out, part_path, hash)?;
            let src = self.blobs.lookup(hash).expect("assigned blob exists");
            written.push(BlobDescriptor {
                hash: *hash,
                entry,
                part_number: part,
                refcount: src.refcount,
                source: BlobSource::Archive,
            });
        }

        let mut local = BlobTable::new();
        for d in &written {
            local.insert_or_intern(d.hash, || d.clone());
            local.lookup_mut(&d.hash).unwrap().refcount = d.refcount;
        }
        let (table_entry, _) =
            write_resource(&mut out, part_path, self.codec, &local.to_bytes(&[]), 0)?;

        let mut header = self.header.clone();
        header.part_number = part;
        header.total_parts = total_parts;
        header.flags |= HDR_FLAG_SPANNED;
        header.flags &= !HDR_FLAG_INTEGRITY;
        header.image_count = 0;
        header.blob_table = table_entry;
        header.xml_data = ResourceEntry::default();
        header.boot_metadata = ResourceEntry::default();
        header.boot_index = 0;
        header.integrity = ResourceEntry::default();
        out.seek(SeekFrom::Start(0)).map_err(|e| WimError::Seek {
            path: part_path.to_owned(),
            offset: 0,
            source: e,
        })?;
        let mut h = Vec::new();
        header.write(&mut h).expect("in-memory write");
        out.write_all(&h).map_err(|e| WimError::Write {
            path: part_path.to_owned(),
            offset: 0,
            source: e,
        })?;
        Ok(written)
    }

    fn write_split_part1(
        &mut self,
        part_path: &Path,
        total_parts: u16,
        assignment: &[(Sha1Hash, u16)],
        remote_entries: &[BlobDescriptor],
    ) -> Result<()> {
        let mut out = create_file_rw(part_path)?;
        out.write_all(&[0u8; HEADER_SIZE]).map_err(|e| WimError::Write {
            path: part_path.to_owned(),
            offset: 0,
            source: e,
        })?;

        // Local blob content.
        let mut table = BlobTable::new();
        for (hash, assigned) in assignment {
            if *assigned != 1 {
                continue;
            }
            let entry = self.copy_blob_into(&mut out, part_path, hash)?;
            let src = self.blobs.lookup(hash).expect("assigned blob exists");
            let refcount = src.refcount;
            table.insert_or_intern(*hash, || BlobDescriptor {
                hash: *hash,
                entry,
                part_number: 1,
                refcount: 0,
                source: BlobSource::Archive,
            });
            table.lookup_mut(hash).unwrap().refcount = refcount;
        }
        // Remote entries so part 1 knows the full content map.
        for d in remote_entries {
            table.insert_or_intern(d.hash, || d.clone());
            table.lookup_mut(&d.hash).unwrap().refcount = d.refcount;
        }

        // Metadata resources, re-serialized locally.
        let mut metadata_entries = Vec::new();
        for image in &self.images {
            let raw = metadata::serialize_image(&image.tree, &image.security);
            let (entry, hash) =
                write_resource(&mut out, part_path, self.codec, &raw, RESOURCE_FLAG_METADATA)?;
            metadata_entries.push(BlobDescriptor {
                hash,
                entry,
                part_number: 1,
                refcount: 1,
                source: BlobSource::Archive,
            });
        }

        let (table_entry, _) =
            write_resource(&mut out, part_path, self.codec, &table.to_bytes(&metadata_entries), 0)?;
        let xml = XmlData {
            images: self.images.iter().map(|i| i.info.clone()).collect(),
            harvest_errors: Vec::new(),
        };
        let (xml_entry, _) =
            write_resource(&mut out, part_path, CodecKind::None, &xml.to_bytes()?, 0)?;

        let mut header = self.header.clone();
        header.part_number = 1;
        header.total_parts = total_parts;
        header.flags |= HDR_FLAG_SPANNED;
        header.flags &= !HDR_FLAG_INTEGRITY;
        header.image_count = self.images.len() as u32;
        header.blob_table = table_entry;
        header.xml_data = xml_entry;
        header.integrity = ResourceEntry::default();
        header.boot_metadata = match header.boot_index {
            0 => ResourceEntry::default(),
            boot => metadata_entries[boot as usize - 1].entry,
        };
        out.seek(SeekFrom::Start(0)).map_err(|e| WimError::Seek {
            path: part_path.to_owned(),
            offset: 0,
            source: e,
        })?;
        let mut h = Vec::new();
        header.write(&mut h).expect("in-memory write");
        out.write_all(&h).map_err(|e| WimError::Write {
            path: part_path.to_owned(),
            offset: 0,
            source: e,
        })?;
        Ok(())
    }

    /// Stream one stored blob into another file, recompressing with this
    /// archive's codec.
    fn copy_blob_into(
        &mut self,
        out: &mut File,
        out_path: &Path,
        hash: &Sha1Hash,
    ) -> Result<ResourceEntry> {
        let src = self.blobs.lookup(hash).expect("blob exists").clone();
        let mut cursor =
            resource::ChunkCursor::new(&mut self.file, &self.path, &src.entry, self.codec)?;
        let mut writer = ResourceWriter::new(out, out_path, self.codec, src.entry.original_size)?;
        let mut chunk = vec![0u8; COPY_BUF_SIZE];
        loop {
            let n = cursor.next_chunk(&mut self.file, &self.path, &mut chunk)?;
            if n == 0 {
                break;
            }
            writer.write(&chunk[..n])?;
        }
        let (entry, actual) = writer.finish(0)?;
        if actual != *hash {
            return Err(WimError::InvalidResourceHash {
                hash: hex::encode(hash),
                actual: hex::encode(actual),
            });
        }
        Ok(entry)
    }

    // ── Verification ─────────────────────────────────────────────────────────

    /// Verify the integrity table (when present) and every stored blob
    /// against its SHA-1 key.
    pub fn verify(&mut self) -> Result<VerifyStats> {
        if !self.header.integrity.is_zero() {
            let mut raw = Vec::new();
            read_full(&mut self.file, &self.path, &self.header.integrity, self.codec, &mut raw)?;
            IntegrityTable::from_bytes(&raw)?.verify(&mut self.file, &self.path, HEADER_SIZE as u64)?;
        }

        let stored: Vec<BlobDescriptor> = self
            .blobs
            .iter()
            .filter(|d| d.source == BlobSource::Archive)
            .cloned()
            .collect();

        #[cfg(feature = "parallel")]
        let verified = {
            use rayon::prelude::*;
            let path = self.path.clone();
            let codec = self.codec;
            let pool = &self.pool;
            stored
                .par_iter()
                .map(|blob| -> Result<()> {
                    let mut handle = pool.acquire()?;
                    let mut out = Vec::new();
                    resource::read_blob_verified(&mut *handle, &path, blob, codec, &mut out)
                })
                .collect::<Result<Vec<()>>>()?
                .len() as u64
        };

        #[cfg(not(feature = "parallel"))]
        let verified = {
            let mut out = Vec::new();
            for blob in &stored {
                resource::read_blob_verified(&mut self.file, &self.path, blob, self.codec, &mut out)?;
            }
            stored.len() as u64
        };

        // Metadata resources verify the same way.
        let mut checked_metadata = 0u64;
        for i in 0..self.images.len() {
            if let Some((entry, hash)) = self.images[i].metadata {
                let mut raw = Vec::new();
                read_full(&mut self.file, &self.path, &entry, self.codec, &mut raw)?;
                let actual = sha1_of(&raw);
                if actual != hash {
                    return Err(WimError::InvalidResourceHash {
                        hash: hex::encode(hash),
                        actual: hex::encode(actual),
                    });
                }
                checked_metadata += 1;
            }
        }

        Ok(VerifyStats {
            blobs_verified: verified,
            metadata_verified: checked_metadata,
        })
    }

    // ── Internals ────────────────────────────────────────────────────────────

    fn ensure_writable(&mut self) -> Result<()> {
        if self.writable {
            return Ok(());
        }
        let file = File::options()
            .read(true)
            .write(true)
            .open(&self.path)
            .map_err(|e| WimError::Open {
                path: self.path.clone(),
                source: e,
            })?;
        self.file = file;
        self.writable = true;
        Ok(())
    }

    fn seek(&mut self, offset: u64) -> Result<()> {
        self.file
            .seek(SeekFrom::Start(offset))
            .map(|_| ())
            .map_err(|e| WimError::Seek {
                path: self.path.clone(),
                offset,
                source: e,
            })
    }

    fn stream_position(&mut self) -> Result<u64> {
        self.file.stream_position().map_err(|e| WimError::Seek {
            path: self.path.clone(),
            offset: 0,
            source: e,
        })
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct VerifyStats {
    pub blobs_verified: u64,
    pub metadata_verified: u64,
}

fn open_rw_or_ro(path: &Path) -> Result<(File, bool)> {
    match File::options().read(true).write(true).open(path) {
        Ok(f) => Ok((f, true)),
        Err(_) => File::open(path)
            .map(|f| (f, false))
            .map_err(|e| WimError::Open {
                path: path.to_owned(),
                source: e,
            }),
    }
}

fn create_file_rw(path: &Path) -> Result<File> {
    File::options()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .map_err(|e| WimError::Open {
            path: path.to_owned(),
            source: e,
        })
}
