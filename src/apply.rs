//! Apply pipeline: dentry tree + blob table → files on a target.
//!
//! Two phases, deliberately separated: phase 1 materializes the whole file
//! structure (directories in preorder, then nondirectory inodes, hard-link
//! aliases, attributes, security, empty named streams); phase 2 walks the
//! referenced blobs in ascending archive offset and fans each one out to
//! every target stream that references it. A blob is decompressed exactly
//! once no matter how many streams share it — the single most important
//! performance property of this path.
//!
//! Failure of any target mid-blob aborts that blob (all open targets are
//! closed, partial files stay partial) and the apply reports the first
//! error. A SHA-1 mismatch at end-of-blob always fails the blob.
//! Cancellation lands between chunks; codecs are not reentrant, so a chunk
//! in flight always completes first.

use std::collections::HashMap;
use std::io::{Read, Seek, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::warn;
use sha1::{Digest, Sha1};

use crate::backend::{
    feature_names, ApplyTarget, FileRef, FEATURE_COMPRESSED_ATTR, FEATURE_DOS_ATTRS,
    FEATURE_HARD_LINKS, FEATURE_NAMED_STREAMS, FEATURE_REPARSE, FEATURE_SECURITY,
    FEATURE_SHORT_NAMES, FEATURE_TIMESTAMPS,
};
use crate::blob::{BlobSource, BlobTable};
use crate::capture::REPARSE_DATA_MAX;
use crate::codec::CodecKind;
use crate::error::{Result, WimError};
use crate::header::WIM_CHUNK_SIZE;
use crate::integrity::Sha1Hash;
use crate::resource::ChunkCursor;
use crate::security::{fixup_descriptor, SecurityTable};
use crate::tree::{
    FileTree, StreamKind, ATTR_ARCHIVE, ATTR_COMPRESSED, ATTR_HIDDEN, ATTR_SYSTEM,
};

// ── Cancellation ─────────────────────────────────────────────────────────────

/// Cooperative cancellation: the current chunk finishes, then the operation
/// returns `Cancelled`. Cloneable across threads.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ApplyOptions {
    /// Fail with `Unsupported` instead of dropping features the target
    /// lacks.
    pub strict: bool,
    pub cancel: Option<CancelToken>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ApplyStats {
    pub dir_count: u64,
    pub file_count: u64,
    pub link_count: u64,
    pub blob_count: u64,
    pub bytes_restored: u64,
    /// Feature mask the target lacked; nonzero only in lenient mode.
    pub dropped_features: u32,
}

// ── Feature negotiation ──────────────────────────────────────────────────────

fn features_used(tree: &FileTree, security: &SecurityTable) -> u32 {
    let mut mask = FEATURE_TIMESTAMPS;
    for d in &tree.dentries {
        if d.short_name.is_some() {
            mask |= FEATURE_SHORT_NAMES;
        }
    }
    let aliases = tree.aliases_by_inode();
    for (idx, inode) in tree.inodes.iter().enumerate() {
        if inode.named_streams().next().is_some() {
            mask |= FEATURE_NAMED_STREAMS;
        }
        if inode.is_reparse_point() {
            mask |= FEATURE_REPARSE;
        }
        if inode.security_id >= 0 && !security.is_empty() {
            mask |= FEATURE_SECURITY;
        }
        if inode.attributes & (ATTR_HIDDEN | ATTR_SYSTEM | ATTR_ARCHIVE) != 0 {
            mask |= FEATURE_DOS_ATTRS;
        }
        if inode.attributes & ATTR_COMPRESSED != 0 {
            mask |= FEATURE_COMPRESSED_ATTR;
        }
        if !inode.is_directory() && aliases.get(&idx).map_or(0, |v| v.len()) > 1 {
            mask |= FEATURE_HARD_LINKS;
        }
    }
    mask
}

// ── Blob targeting ───────────────────────────────────────────────────────────

enum StreamSlot {
    Unnamed,
    Named(String),
    Reparse { tag: u32 },
}

struct StreamTarget {
    fref: FileRef,
    slot: StreamSlot,
}

enum OpenTarget {
    Writer(Box<dyn Write + Send>),
    ReparseBuf { fref: FileRef, tag: u32, buf: Vec<u8> },
}

// ── Pipeline ─────────────────────────────────────────────────────────────────

#[allow(clippy::too_many_arguments)]
pub(crate) fn apply_tree<F: Read + Seek>(
    file: &mut F,
    archive_path: &Path,
    codec: CodecKind,
    blobs: &BlobTable,
    tree: &FileTree,
    security: &SecurityTable,
    target: &mut dyn ApplyTarget,
    opts: &ApplyOptions,
) -> Result<ApplyStats> {
    let mut stats = ApplyStats::default();

    // Feature negotiation happens before anything touches the target.
    let used = features_used(tree, security);
    let missing = used & !target.supported_features();
    if missing != 0 {
        if opts.strict {
            return Err(WimError::unsupported(format!(
                "target lacks required features: {}",
                feature_names(missing).join(", ")
            )));
        }
        warn!(
            "dropping features the target lacks: {}",
            feature_names(missing).join(", ")
        );
        stats.dropped_features = missing;
    }
    let keep = |feature: u32| missing & feature == 0;

    // ── Phase 1: file structure ─────────────────────────────────────────────
    let mut refs: HashMap<usize, FileRef> = HashMap::new();
    refs.insert(FileTree::ROOT, target.root()?);

    // Directories first, in preorder, so parents always exist.
    for &d in &tree.preorder()[1..] {
        let dentry = &tree.dentries[d];
        if !tree.inodes[dentry.inode].is_directory() {
            continue;
        }
        let parent = refs[&dentry.parent];
        let fref = target.create_dir(parent, &dentry.name)?;
        refs.insert(d, fref);
        stats.dir_count += 1;
        apply_creation_metadata(target, tree, security, dentry.inode, fref, parent, d, &keep)?;
    }

    // Nondirectories: first alias creates the inode, the rest hard-link to
    // it (or degrade to independent copies on targets without links).
    let aliases = tree.aliases_by_inode();
    let hard_links = keep(FEATURE_HARD_LINKS);
    let preorder_pos: HashMap<usize, usize> =
        tree.preorder().into_iter().enumerate().map(|(i, d)| (d, i)).collect();
    let mut blob_targets: HashMap<Sha1Hash, Vec<StreamTarget>> = HashMap::new();

    for (inode_idx, inode) in tree.inodes.iter().enumerate() {
        if inode.is_directory() {
            continue;
        }
        let Some(mut alias_list) = aliases.get(&inode_idx).cloned() else {
            continue; // unreachable inode
        };
        alias_list.sort_by_key(|d| preorder_pos[d]);

        let mut created: Vec<FileRef> = Vec::new();
        for (i, &d) in alias_list.iter().enumerate() {
            let dentry = &tree.dentries[d];
            let parent = refs[&dentry.parent];
            if i == 0 || !hard_links {
                let fref = target.create_file(parent, &dentry.name, inode.attributes)?;
                refs.insert(d, fref);
                created.push(fref);
                stats.file_count += 1;
                apply_creation_metadata(target, tree, security, inode_idx, fref, parent, d, &keep)?;
            } else {
                let fref = created[0];
                target.add_link(fref, parent, &dentry.name)?;
                refs.insert(d, fref);
                stats.link_count += 1;
            }
        }

        // Register blob-backed streams for phase 2; create empty named
        // streams now — they have no blob and will never appear there.
        for fref in &created {
            for s in &inode.streams {
                match (&s.kind, s.hash) {
                    (StreamKind::Named(name), None) if keep(FEATURE_NAMED_STREAMS) => {
                        target.open_stream(*fref, Some(name))?;
                    }
                    (StreamKind::Named(name), Some(h)) if keep(FEATURE_NAMED_STREAMS) => {
                        blob_targets.entry(h).or_default().push(StreamTarget {
                            fref: *fref,
                            slot: StreamSlot::Named(name.clone()),
                        });
                    }
                    (StreamKind::Data, Some(h)) => {
                        blob_targets.entry(h).or_default().push(StreamTarget {
                            fref: *fref,
                            slot: StreamSlot::Unnamed,
                        });
                    }
                    (StreamKind::Reparse, Some(h)) if keep(FEATURE_REPARSE) => {
                        blob_targets.entry(h).or_default().push(StreamTarget {
                            fref: *fref,
                            slot: StreamSlot::Reparse {
                                tag: inode.reparse_tag,
                            },
                        });
                    }
                    _ => {}
                }
            }
        }
    }

    // ── Phase 2: blob extraction, ascending archive offset ─────────────────
    let mut order: Vec<(&Sha1Hash, &Vec<StreamTarget>)> = blob_targets.iter().collect();
    let mut missing_blob: Option<Sha1Hash> = None;
    order.retain(|(h, _)| {
        let ok = blobs.lookup(h).is_some();
        if !ok && missing_blob.is_none() {
            missing_blob = Some(**h);
        }
        ok
    });
    if let Some(h) = missing_blob {
        return Err(WimError::metadata(
            0,
            format!("stream references unknown blob {}", hex::encode(h)),
        ));
    }
    order.sort_by_key(|(h, _)| blobs.lookup(h).unwrap().entry.offset);

    let mut chunk = vec![0u8; WIM_CHUNK_SIZE];
    for (hash, targets) in order {
        if opts.cancel.as_ref().is_some_and(|c| c.is_cancelled()) {
            return Err(WimError::Cancelled);
        }
        let blob = blobs.lookup(hash).unwrap();
        if blob.source != BlobSource::Archive {
            return Err(WimError::unsupported(format!(
                "blob {} is pending capture; write the archive before applying",
                hex::encode(blob.hash)
            )));
        }

        // begin_blob: open every target stream.
        let mut open: Vec<OpenTarget> = Vec::with_capacity(targets.len());
        for t in targets {
            open.push(match &t.slot {
                StreamSlot::Unnamed => OpenTarget::Writer(target.open_stream(t.fref, None)?),
                StreamSlot::Named(name) => {
                    OpenTarget::Writer(target.open_stream(t.fref, Some(name))?)
                }
                StreamSlot::Reparse { tag } => OpenTarget::ReparseBuf {
                    fref: t.fref,
                    tag: *tag,
                    buf: Vec::new(),
                },
            });
        }

        // chunk*: decompress once, fan out to every open target.
        let mut cursor = ChunkCursor::new(file, archive_path, &blob.entry, codec)?;
        let mut hasher = Sha1::new();
        loop {
            if opts.cancel.as_ref().is_some_and(|c| c.is_cancelled()) {
                return Err(WimError::Cancelled);
            }
            let n = cursor.next_chunk(file, archive_path, &mut chunk)?;
            if n == 0 {
                break;
            }
            hasher.update(&chunk[..n]);
            for t in open.iter_mut() {
                match t {
                    OpenTarget::Writer(w) => {
                        // A failed target aborts the whole blob; open
                        // writers close on drop, partial files remain.
                        w.write_all(&chunk[..n]).map_err(|e| WimError::Write {
                            path: archive_path.to_owned(),
                            offset: 0,
                            source: e,
                        })?;
                    }
                    OpenTarget::ReparseBuf { buf, .. } => {
                        if buf.len() + n > REPARSE_DATA_MAX {
                            return Err(WimError::InvalidReparseData {
                                detail: format!(
                                    "reparse blob {} exceeds {REPARSE_DATA_MAX} bytes",
                                    hex::encode(blob.hash)
                                ),
                            });
                        }
                        buf.extend_from_slice(&chunk[..n]);
                    }
                }
            }
            stats.bytes_restored += n as u64 * targets.len() as u64;
        }

        // end_blob: the hash must match before any reparse data is armed.
        let actual: Sha1Hash = hasher.finalize().into();
        if actual != *hash {
            return Err(WimError::InvalidResourceHash {
                hash: hex::encode(hash),
                actual: hex::encode(actual),
            });
        }
        for t in open {
            if let OpenTarget::ReparseBuf { fref, tag, buf } = t {
                target.write_reparse(fref, tag, &buf)?;
            }
        }
        stats.blob_count += 1;
    }

    // Finalization: attributes and timestamps land only after every write
    // has happened — a read-only bit applied earlier would block phase 2,
    // and creating children bumps directory times. Reverse preorder so
    // parents settle after their contents.
    for &d in tree.preorder().iter().rev() {
        let inode = &tree.inodes[tree.dentries[d].inode];
        let Some(&fref) = refs.get(&d) else { continue };
        target.set_attrs(fref, inode.attributes)?;
        if keep(FEATURE_TIMESTAMPS) {
            target.set_times(fref, &inode.times)?;
        }
    }

    Ok(stats)
}

/// Security and short names are applied at creation; attributes and times
/// wait for the finalization pass.
#[allow(clippy::too_many_arguments)]
fn apply_creation_metadata(
    target: &mut dyn ApplyTarget,
    tree: &FileTree,
    security: &SecurityTable,
    inode_idx: usize,
    fref: FileRef,
    parent: FileRef,
    dentry_idx: usize,
    keep: &dyn Fn(u32) -> bool,
) -> Result<()> {
    let inode = &tree.inodes[inode_idx];
    if keep(FEATURE_SECURITY) {
        if let Some(sd) = security.get(inode.security_id) {
            let fixed = fixup_descriptor(sd)?;
            target.set_security(fref, &fixed)?;
        }
    }
    if keep(FEATURE_SHORT_NAMES) {
        if let Some(short) = &tree.dentries[dentry_idx].short_name {
            target.set_short_name(fref, parent, short)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_token_is_sticky_and_shared() {
        let t = CancelToken::new();
        let u = t.clone();
        assert!(!u.is_cancelled());
        t.cancel();
        assert!(u.is_cancelled());
    }

    #[test]
    fn feature_mask_reflects_tree_contents() {
        use crate::tree::*;
        let mut tree = FileTree::new(FileTimes::default());
        let sec = SecurityTable::new();
        assert_eq!(
            features_used(&tree, &sec) & FEATURE_NAMED_STREAMS,
            0
        );

        let mut inode = Inode::new(ATTR_NORMAL, FileTimes::default());
        inode.streams.push(Stream {
            kind: StreamKind::Named("ads".into()),
            hash: None,
        });
        let i = tree.add_inode(inode);
        tree.add_child(FileTree::ROOT, "f".into(), i).unwrap();
        tree.add_child(FileTree::ROOT, "g".into(), i).unwrap();

        let used = features_used(&tree, &sec);
        assert!(used & FEATURE_NAMED_STREAMS != 0);
        assert!(used & FEATURE_HARD_LINKS != 0);
        assert!(used & FEATURE_TIMESTAMPS != 0);
        assert_eq!(used & FEATURE_REPARSE, 0);
    }
}
