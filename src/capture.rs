//! Capture pipeline: source tree → dentries + blob-table entries.
//!
//! One pass over the source. Each entry is stat'ed, filtered against the
//! exclusion patterns, bound into the tree (aliasing the inode when the
//! source inode id was already seen), and every stream is hashed by
//! streaming its bytes. New blobs retain a source location so the writer
//! can pull the bytes later; duplicate content just bumps a reference
//! count — that single map lookup is the whole deduplication story.
//!
//! Per-file errors are fatal unless the caller sets `continue_on_error`;
//! structural errors (unreadable root) always are.

use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};

use glob::Pattern;
use log::{debug, warn};
use sha1::{Digest, Sha1};

use crate::backend::CaptureSource;
use crate::blob::{BlobDescriptor, BlobSource, BlobTable};
use crate::error::{Result, WimError};
use crate::integrity::sha1_of;
use crate::resource::ResourceEntry;
use crate::security::SecurityTable;
use crate::tree::{FileTree, Inode, Stream, StreamKind, ATTR_DIRECTORY, ATTR_REPARSE_POINT};

/// Reparse data never exceeds this (Windows' reparse buffer ceiling).
pub const REPARSE_DATA_MAX: usize = 16 * 1024;

const HASH_BUF_SIZE: usize = 1 << 16;

#[derive(Debug, Default, Clone)]
pub struct CaptureConfig {
    exclusions: Vec<Pattern>,
    pub continue_on_error: bool,
}

impl CaptureConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an exclusion glob, matched against the path relative to the
    /// capture root (e.g. `tmp/*` or `**/*.log`).
    pub fn exclude(&mut self, pattern: &str) -> Result<&mut Self> {
        let p = Pattern::new(pattern).map_err(|e| {
            WimError::unsupported(format!("bad exclusion pattern \"{pattern}\": {e}"))
        })?;
        self.exclusions.push(p);
        Ok(self)
    }

    fn is_excluded(&self, rel: &Path) -> bool {
        self.exclusions.iter().any(|p| p.matches_path(rel))
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct CaptureStats {
    pub dir_count: u64,
    pub file_count: u64,
    pub stream_count: u64,
    pub total_bytes: u64,
    pub excluded: u64,
    pub errors: u64,
}

struct CaptureCtx<'a> {
    source: &'a mut dyn CaptureSource,
    config: &'a CaptureConfig,
    blobs: &'a mut BlobTable,
    security: &'a mut SecurityTable,
    /// Source inode id → tree inode index (hard-link aliasing).
    seen_inodes: HashMap<u64, usize>,
    stats: CaptureStats,
}

/// Capture the tree rooted at `root` into a fresh [`FileTree`], interning
/// blobs and security descriptors along the way.
pub fn capture_tree(
    source: &mut dyn CaptureSource,
    root: &Path,
    config: &CaptureConfig,
    blobs: &mut BlobTable,
    security: &mut SecurityTable,
) -> Result<(FileTree, CaptureStats)> {
    let root_item = source.stat(root)?;
    if root_item.attributes & ATTR_DIRECTORY == 0 {
        return Err(WimError::NotADirectory {
            path: root.to_owned(),
        });
    }

    let mut tree = FileTree::new(root_item.times);
    tree.inodes[0].attributes = root_item.attributes;

    let mut ctx = CaptureCtx {
        source,
        config,
        blobs,
        security,
        seen_inodes: HashMap::new(),
        stats: CaptureStats::default(),
    };
    if let Some(sd) = ctx.source.get_security(root)? {
        tree.inodes[0].security_id = ctx.security.intern(&sd);
    }
    capture_dir(&mut ctx, &mut tree, root, Path::new(""), FileTree::ROOT)?;
    Ok((tree, ctx.stats))
}

fn capture_dir(
    ctx: &mut CaptureCtx<'_>,
    tree: &mut FileTree,
    dir: &Path,
    rel: &Path,
    parent: usize,
) -> Result<()> {
    ctx.stats.dir_count += 1;
    // Children keep the source's natural order.
    for name in ctx.source.list_dir(dir)? {
        let path = dir.join(&name);
        let rel_child = rel.join(&name);
        if ctx.config.is_excluded(&rel_child) {
            debug!("excluded {rel_child:?}");
            ctx.stats.excluded += 1;
            continue;
        }
        match capture_entry(ctx, tree, &path, &name, parent) {
            Ok(Some(child)) if tree.inodes[tree.dentries[child].inode].is_directory() => {
                capture_dir(ctx, tree, &path, &rel_child, child)?;
            }
            Ok(_) => {}
            Err(e) if ctx.config.continue_on_error => {
                warn!("skipping {path:?}: {e}");
                ctx.stats.errors += 1;
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Capture one directory entry; returns its dentry index (None when the
/// entry was a hard-link alias of an already-captured inode... which still
/// yields a dentry, so None only on skip paths).
fn capture_entry(
    ctx: &mut CaptureCtx<'_>,
    tree: &mut FileTree,
    path: &Path,
    name: &str,
    parent: usize,
) -> Result<Option<usize>> {
    let item = ctx.source.stat(path)?;
    let is_dir = item.attributes & ATTR_DIRECTORY != 0;

    // Hard link: a nondirectory inode id seen before gets a new alias only.
    if !is_dir {
        if let Some(&inode_idx) = ctx.seen_inodes.get(&item.inode_id) {
            let dentry = tree.add_child(parent, name.to_owned(), inode_idx)?;
            ctx.stats.file_count += 1;
            return Ok(Some(dentry));
        }
    }

    let mut inode = Inode::new(item.attributes, item.times);

    if item.attributes & ATTR_REPARSE_POINT != 0 {
        match ctx.source.readlink_or_reparse(path)? {
            Some((tag, data)) => {
                if data.len() > REPARSE_DATA_MAX {
                    return Err(WimError::InvalidReparseData {
                        detail: format!(
                            "{path:?}: reparse data of {} bytes exceeds {REPARSE_DATA_MAX}",
                            data.len()
                        ),
                    });
                }
                inode.reparse_tag = tag;
                let hash = sha1_of(&data);
                let size = data.len() as u64;
                ctx.blobs.insert_or_intern(hash, || BlobDescriptor {
                    hash,
                    entry: ResourceEntry {
                        original_size: size,
                        ..ResourceEntry::default()
                    },
                    part_number: 1,
                    refcount: 0,
                    source: BlobSource::Memory(data),
                });
                inode.streams.push(Stream {
                    kind: StreamKind::Reparse,
                    hash: (size > 0).then_some(hash),
                });
                ctx.stats.stream_count += 1;
            }
            None => {
                return Err(WimError::InvalidReparseData {
                    detail: format!("{path:?}: reparse attribute without reparse data"),
                })
            }
        }
    }

    for stream in &item.streams {
        let kind = match &stream.name {
            None => StreamKind::Data,
            Some(n) => StreamKind::Named(n.clone()),
        };
        // Zero-byte streams reference no blob; the format elides empty
        // content entirely.
        if stream.size == 0 {
            inode.streams.push(Stream { kind, hash: None });
            continue;
        }
        let (hash, actual) = hash_stream(ctx.source, path, stream.name.as_deref())?;
        if actual != stream.size {
            warn!(
                "{path:?}: stream grew or shrank during capture ({} -> {actual} bytes)",
                stream.size
            );
        }
        ctx.blobs.insert_or_intern(hash, || BlobDescriptor {
            hash,
            entry: ResourceEntry {
                original_size: actual,
                ..ResourceEntry::default()
            },
            part_number: 1,
            refcount: 0,
            source: BlobSource::File {
                path: path.to_owned(),
                stream_name: stream.name.clone(),
            },
        });
        inode.streams.push(Stream {
            kind,
            hash: Some(hash),
        });
        ctx.stats.stream_count += 1;
        ctx.stats.total_bytes += actual;
    }

    if let Some(sd) = ctx.source.get_security(path)? {
        inode.security_id = ctx.security.intern(&sd);
    }

    let inode_idx = tree.add_inode(inode);
    if !is_dir {
        ctx.seen_inodes.insert(item.inode_id, inode_idx);
        ctx.stats.file_count += 1;
    }
    let dentry = tree.add_child(parent, name.to_owned(), inode_idx)?;
    Ok(Some(dentry))
}

/// Stream a source stream through SHA-1 without retaining the bytes.
fn hash_stream(
    source: &mut dyn CaptureSource,
    path: &Path,
    stream_name: Option<&str>,
) -> Result<(crate::integrity::Sha1Hash, u64)> {
    let mut reader = source.open_stream(path, stream_name)?;
    let mut hasher = Sha1::new();
    let mut buf = vec![0u8; HASH_BUF_SIZE];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf).map_err(|e| WimError::Read {
            path: path.to_owned(),
            offset: total,
            len: buf.len(),
            source: e,
        })?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        total += n as u64;
    }
    Ok((hasher.finalize().into(), total))
}

/// Open a pending blob's bytes for the writer. The writer re-hashes what it
/// reads, so a source modified between capture and write is caught there.
pub(crate) fn open_pending_source(
    source_loc: &BlobSource,
) -> Result<Box<dyn Read + '_>> {
    match source_loc {
        BlobSource::File { path, stream_name } => {
            if stream_name.is_some() {
                return Err(WimError::unsupported(
                    "pending alternate-stream sources require the capture back-end",
                ));
            }
            let f = std::fs::File::open(path).map_err(|e| WimError::Open {
                path: path.clone(),
                source: e,
            })?;
            Ok(Box::new(f))
        }
        BlobSource::Memory(data) => Ok(Box::new(&data[..])),
        BlobSource::Archive | BlobSource::Wim { .. } => Err(WimError::unsupported(
            "blob is not a pending capture source",
        )),
    }
}

pub(crate) fn pending_source_path(source_loc: &BlobSource) -> PathBuf {
    match source_loc {
        BlobSource::File { path, .. } => path.clone(),
        _ => PathBuf::from("<memory>"),
    }
}
