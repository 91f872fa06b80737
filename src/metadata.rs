//! Image metadata codec.
//!
//! A metadata resource is the security-descriptor table prelude followed by
//! the dentry tree in depth-first preorder: each directory's children are
//! written as one contiguous run located by the parent's `subdir_offset` and
//! terminated by an 8-byte zero end marker.
//!
//! # Dentry record (offsets relative to record start, all little-endian)
//!
//! ```text
//! Offset  Size  Field
//!    0      8   length          whole record incl. names and padding,
//!                               a multiple of 8; ADS records excluded
//!    8      4   attributes
//!   12      4   security_id     i32; −1 = none
//!   16      8   subdir_offset   children-run offset; 0 for nondirectories
//!   24     40   five 8-byte time slots: creation, last access, last write,
//!                               then two reserved (written zero, ignored)
//!   64     20   default-stream SHA-1: the unnamed data stream, or the
//!                               reparse stream for reparse points; all
//!                               zeros = empty
//!   84      4   reparse_tag
//!   88      8   hard-link group id; 0 = no aliases
//!   96      2   stream_count    ADS records following this record
//!   98      2   short name bytes (UTF-16LE, no terminator)
//!  100      2   long name bytes  (UTF-16LE, no terminator)
//!  102    ...   long name + NUL, short name + NUL, zero pad to 8
//! ```
//!
//! # Alternate-stream record
//!
//! ```text
//!    0      8   length (8-aligned)
//!    8     20   SHA-1 (all zeros = empty stream)
//!   28      2   name bytes (UTF-16LE, no terminator); 0 = the unnamed
//!                               data stream of a reparse-point inode
//!   30    ...   name + NUL, zero pad to 8
//! ```
//!
//! Hard links: dentries sharing a non-zero group id are unified to one
//! inode at parse time; when records disagree the first occurrence wins and
//! a link-group warning is raised.

use std::collections::{HashMap, HashSet};

use byteorder::{ByteOrder, LittleEndian};
use log::warn;

use crate::error::{Result, WimError};
use crate::integrity::{Sha1Hash, ZERO_HASH};
use crate::security::SecurityTable;
use crate::tree::{
    FileTimes, FileTree, Inode, Stream, StreamKind, ATTR_DIRECTORY, MAX_SHORT_NAME_UNITS,
};

const DENTRY_FIXED_LEN: usize = 102;
const ADS_FIXED_LEN: usize = 30;
const END_MARKER_LEN: usize = 8;

/// What to do when an inode ends up with two unnamed data streams (possible
/// in adversarial captures).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DuplicateStreamPolicy {
    /// Keep the first, drop the rest with a warning.
    #[default]
    Warn,
    /// Reject the metadata.
    Error,
}

#[inline]
fn align8(n: usize) -> usize {
    n.next_multiple_of(8)
}

fn utf16_bytes(s: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(s.len() * 2);
    for unit in s.encode_utf16() {
        out.extend_from_slice(&unit.to_le_bytes());
    }
    out
}

fn utf16_parse(bytes: &[u8], offset: u64) -> Result<String> {
    if bytes.len() % 2 != 0 {
        return Err(WimError::metadata(offset, "odd UTF-16 name length"));
    }
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes(c.try_into().unwrap()))
        .collect();
    char::decode_utf16(units.iter().copied())
        .collect::<std::result::Result<String, _>>()
        .map_err(|_| WimError::metadata(offset, "name is not valid UTF-16"))
}

// ── Serialization ────────────────────────────────────────────────────────────

/// Serialize an image (tree + security table) into metadata-resource bytes.
/// Hard-link group ids are assigned here: any inode with more than one alias
/// gets a stable non-zero id.
pub fn serialize_image(tree: &FileTree, security: &SecurityTable) -> Vec<u8> {
    let mut out = security.to_bytes();

    let aliases = tree.aliases_by_inode();
    let link_group_of = |inode_idx: usize| -> u64 {
        match aliases.get(&inode_idx) {
            Some(v) if v.len() > 1 && !tree.inodes[inode_idx].is_directory() => inode_idx as u64 + 1,
            _ => 0,
        }
    };

    // subdir_offset patch positions, per directory dentry.
    let mut patches: HashMap<usize, usize> = HashMap::new();

    emit_dentry(&mut out, tree, FileTree::ROOT, link_group_of(0), &mut patches);
    emit_children(&mut out, tree, FileTree::ROOT, &link_group_of, &mut patches);
    out
}

fn emit_children(
    out: &mut Vec<u8>,
    tree: &FileTree,
    dir: usize,
    link_group_of: &dyn Fn(usize) -> u64,
    patches: &mut HashMap<usize, usize>,
) {
    let run_offset = out.len() as u64;
    let patch_pos = patches[&dir];
    out[patch_pos..patch_pos + 8].copy_from_slice(&run_offset.to_le_bytes());

    for &child in &tree.dentries[dir].children {
        emit_dentry(out, tree, child, link_group_of(tree.dentries[child].inode), patches);
    }
    out.extend_from_slice(&[0u8; END_MARKER_LEN]);

    for &child in &tree.dentries[dir].children {
        if tree.inodes[tree.dentries[child].inode].is_directory() {
            emit_children(out, tree, child, link_group_of, patches);
        }
    }
}

fn emit_dentry(
    out: &mut Vec<u8>,
    tree: &FileTree,
    dentry_idx: usize,
    link_group: u64,
    patches: &mut HashMap<usize, usize>,
) {
    let dentry = &tree.dentries[dentry_idx];
    let inode = &tree.inodes[dentry.inode];

    let name = utf16_bytes(&dentry.name);
    let short = dentry.short_name.as_deref().map(utf16_bytes).unwrap_or_default();
    debug_assert!(short.len() / 2 <= MAX_SHORT_NAME_UNITS);

    let mut name_region = 0;
    if !name.is_empty() {
        name_region += name.len() + 2;
    }
    if !short.is_empty() {
        name_region += short.len() + 2;
    }
    let record_len = align8(DENTRY_FIXED_LEN + name_region);

    // Streams: the default slot carries the reparse stream for reparse
    // points, the unnamed data stream otherwise. Everything else becomes an
    // ADS record (an empty name marks a reparse point's data stream).
    let default_hash = if inode.is_reparse_point() {
        inode.reparse_stream().and_then(|s| s.hash)
    } else {
        inode.unnamed_stream().and_then(|s| s.hash)
    }
    .unwrap_or(ZERO_HASH);

    let mut ads: Vec<(&str, Option<Sha1Hash>)> = Vec::new();
    for s in &inode.streams {
        match &s.kind {
            StreamKind::Named(n) => ads.push((n, s.hash)),
            StreamKind::Data if inode.is_reparse_point() => ads.push(("", s.hash)),
            _ => {}
        }
    }

    let base = out.len();
    out.resize(base + record_len, 0);
    let rec = &mut out[base..base + record_len];
    LittleEndian::write_u64(&mut rec[0..8], record_len as u64);
    LittleEndian::write_u32(&mut rec[8..12], inode.attributes);
    LittleEndian::write_i32(&mut rec[12..16], inode.security_id);
    // subdir_offset at 16 patched when the children run is emitted.
    LittleEndian::write_u64(&mut rec[24..32], inode.times.creation);
    LittleEndian::write_u64(&mut rec[32..40], inode.times.last_access);
    LittleEndian::write_u64(&mut rec[40..48], inode.times.last_write);
    rec[64..84].copy_from_slice(&default_hash);
    LittleEndian::write_u32(&mut rec[84..88], inode.reparse_tag);
    LittleEndian::write_u64(&mut rec[88..96], link_group);
    LittleEndian::write_u16(&mut rec[96..98], ads.len() as u16);
    LittleEndian::write_u16(&mut rec[98..100], short.len() as u16);
    LittleEndian::write_u16(&mut rec[100..102], name.len() as u16);
    let mut pos = DENTRY_FIXED_LEN;
    if !name.is_empty() {
        rec[pos..pos + name.len()].copy_from_slice(&name);
        pos += name.len() + 2;
    }
    if !short.is_empty() {
        rec[pos..pos + short.len()].copy_from_slice(&short);
    }

    if inode.is_directory() {
        patches.insert(dentry_idx, base + 16);
    }

    for (ads_name, hash) in ads {
        let name = utf16_bytes(ads_name);
        let name_region = if name.is_empty() { 0 } else { name.len() + 2 };
        let len = align8(ADS_FIXED_LEN + name_region);
        let base = out.len();
        out.resize(base + len, 0);
        let rec = &mut out[base..base + len];
        LittleEndian::write_u64(&mut rec[0..8], len as u64);
        rec[8..28].copy_from_slice(&hash.unwrap_or(ZERO_HASH));
        LittleEndian::write_u16(&mut rec[28..30], name.len() as u16);
        if !name.is_empty() {
            rec[ADS_FIXED_LEN..ADS_FIXED_LEN + name.len()].copy_from_slice(&name);
        }
    }
}

// ── Parsing ──────────────────────────────────────────────────────────────────

struct RawDentry {
    attributes: u32,
    security_id: i32,
    subdir_offset: u64,
    times: FileTimes,
    reparse_tag: u32,
    link_group: u64,
    name: String,
    short_name: Option<String>,
    streams: Vec<Stream>,
    /// Offset just past this record and its ADS records.
    end: usize,
}

fn parse_record(data: &[u8], pos: usize, policy: DuplicateStreamPolicy) -> Result<RawDentry> {
    let off = pos as u64;
    let bounds = |need: usize| -> Result<()> {
        if pos + need > data.len() {
            Err(WimError::metadata(off, "dentry record overruns the metadata"))
        } else {
            Ok(())
        }
    };
    bounds(DENTRY_FIXED_LEN)?;
    let rec = &data[pos..];

    let length = LittleEndian::read_u64(&rec[0..8]) as usize;
    if length < DENTRY_FIXED_LEN || length % 8 != 0 {
        return Err(WimError::metadata(off, format!("bad dentry length {length}")));
    }
    bounds(length)?;

    let attributes = LittleEndian::read_u32(&rec[8..12]);
    let security_id = LittleEndian::read_i32(&rec[12..16]);
    if security_id < -1 {
        return Err(WimError::metadata(off, format!("bad security id {security_id}")));
    }
    let subdir_offset = LittleEndian::read_u64(&rec[16..24]);
    let times = FileTimes {
        creation: LittleEndian::read_u64(&rec[24..32]),
        last_access: LittleEndian::read_u64(&rec[32..40]),
        last_write: LittleEndian::read_u64(&rec[40..48]),
    };
    let mut default_hash: Sha1Hash = ZERO_HASH;
    default_hash.copy_from_slice(&rec[64..84]);
    let reparse_tag = LittleEndian::read_u32(&rec[84..88]);
    let link_group = LittleEndian::read_u64(&rec[88..96]);
    let stream_count = LittleEndian::read_u16(&rec[96..98]) as usize;
    let short_len = LittleEndian::read_u16(&rec[98..100]) as usize;
    let name_len = LittleEndian::read_u16(&rec[100..102]) as usize;

    let mut name_region = 0;
    if name_len > 0 {
        name_region += name_len + 2;
    }
    if short_len > 0 {
        name_region += short_len + 2;
    }
    if DENTRY_FIXED_LEN + name_region > length {
        return Err(WimError::metadata(off, "names overrun the dentry record"));
    }
    if short_len / 2 > MAX_SHORT_NAME_UNITS {
        return Err(WimError::metadata(
            off,
            format!("short name of {} UTF-16 units exceeds {MAX_SHORT_NAME_UNITS}", short_len / 2),
        ));
    }

    let mut npos = DENTRY_FIXED_LEN;
    let name = if name_len > 0 {
        let s = utf16_parse(&rec[npos..npos + name_len], off)?;
        npos += name_len + 2;
        s
    } else {
        String::new()
    };
    let short_name = if short_len > 0 {
        Some(utf16_parse(&rec[npos..npos + short_len], off)?)
    } else {
        None
    };

    // Build the stream set. The default slot first, then ADS records.
    let is_dir = attributes & ATTR_DIRECTORY != 0;
    let is_reparse = attributes & crate::tree::ATTR_REPARSE_POINT != 0;
    let mut streams = Vec::new();
    if is_reparse {
        streams.push(Stream {
            kind: StreamKind::Reparse,
            hash: (default_hash != ZERO_HASH).then_some(default_hash),
        });
    } else if !is_dir {
        streams.push(Stream {
            kind: StreamKind::Data,
            hash: (default_hash != ZERO_HASH).then_some(default_hash),
        });
    } else if default_hash != ZERO_HASH {
        return Err(WimError::metadata(off, "directory with a default data stream"));
    }

    let mut end = pos + length;
    for i in 0..stream_count {
        let soff = end as u64;
        if end + ADS_FIXED_LEN > data.len() {
            return Err(WimError::metadata(soff, "stream record overruns the metadata"));
        }
        let srec = &data[end..];
        let slen = LittleEndian::read_u64(&srec[0..8]) as usize;
        if slen < ADS_FIXED_LEN || slen % 8 != 0 || end + slen > data.len() {
            return Err(WimError::metadata(soff, format!("bad stream record length {slen}")));
        }
        let mut hash: Sha1Hash = ZERO_HASH;
        hash.copy_from_slice(&srec[8..28]);
        let sname_len = LittleEndian::read_u16(&srec[28..30]) as usize;
        if ADS_FIXED_LEN + if sname_len > 0 { sname_len + 2 } else { 0 } > slen {
            return Err(WimError::metadata(soff, "stream name overruns its record"));
        }
        let hash = (hash != ZERO_HASH).then_some(hash);
        if sname_len == 0 {
            // An unnamed data stream alongside the default slot.
            let already = streams.iter().any(|s| s.kind == StreamKind::Data);
            if already || !is_reparse {
                match policy {
                    DuplicateStreamPolicy::Error => {
                        return Err(WimError::metadata(
                            soff,
                            "inode carries two unnamed data streams",
                        ));
                    }
                    DuplicateStreamPolicy::Warn => {
                        warn!("dropping duplicate unnamed stream (record {i}) at offset {soff}");
                    }
                }
            } else {
                streams.push(Stream { kind: StreamKind::Data, hash });
            }
        } else {
            let sname = utf16_parse(&srec[ADS_FIXED_LEN..ADS_FIXED_LEN + sname_len], soff)?;
            if streams.iter().any(|s| s.name() == Some(sname.as_str())) {
                return Err(WimError::metadata(
                    soff,
                    format!("duplicate alternate stream name \"{sname}\""),
                ));
            }
            streams.push(Stream {
                kind: StreamKind::Named(sname),
                hash,
            });
        }
        end += slen;
    }

    Ok(RawDentry {
        attributes,
        security_id,
        subdir_offset,
        times,
        reparse_tag,
        link_group,
        name,
        short_name,
        streams,
        end,
    })
}

/// Parse a metadata resource into a tree and its security table.
pub fn parse_image(
    data: &[u8],
    policy: DuplicateStreamPolicy,
) -> Result<(FileTree, SecurityTable)> {
    let (security, consumed) = SecurityTable::from_bytes(data)?;

    let root = parse_record(data, consumed, policy)?;
    if root.attributes & ATTR_DIRECTORY == 0 {
        return Err(WimError::metadata(consumed as u64, "root dentry is not a directory"));
    }
    if !root.name.is_empty() {
        return Err(WimError::metadata(consumed as u64, "root dentry carries a name"));
    }

    let mut tree = FileTree::new(root.times);
    tree.inodes[0].attributes = root.attributes;
    tree.inodes[0].security_id = validate_security_id(root.security_id, &security, consumed as u64)?;
    tree.inodes[0].streams = root.streams.clone();

    let mut link_groups: HashMap<u64, usize> = HashMap::new();
    let mut visited_runs: HashSet<u64> = HashSet::new();
    parse_children(
        data,
        &mut tree,
        &security,
        FileTree::ROOT,
        root.subdir_offset,
        policy,
        &mut link_groups,
        &mut visited_runs,
    )?;
    Ok((tree, security))
}

fn validate_security_id(id: i32, security: &SecurityTable, off: u64) -> Result<i32> {
    if id >= 0 && id as usize >= security.len() {
        return Err(WimError::metadata(
            off,
            format!("security id {id} out of range ({} descriptors)", security.len()),
        ));
    }
    Ok(id)
}

#[allow(clippy::too_many_arguments)]
fn parse_children(
    data: &[u8],
    tree: &mut FileTree,
    security: &SecurityTable,
    parent: usize,
    run_offset: u64,
    policy: DuplicateStreamPolicy,
    link_groups: &mut HashMap<u64, usize>,
    visited_runs: &mut HashSet<u64>,
) -> Result<()> {
    if run_offset == 0 || run_offset as usize >= data.len() {
        return Err(WimError::metadata(run_offset, "children run offset out of range"));
    }
    if !visited_runs.insert(run_offset) {
        return Err(WimError::metadata(run_offset, "children runs form a cycle"));
    }

    let mut pos = run_offset as usize;
    loop {
        if pos + END_MARKER_LEN > data.len() {
            return Err(WimError::metadata(pos as u64, "unterminated children run"));
        }
        if LittleEndian::read_u64(&data[pos..pos + 8]) == 0 {
            return Ok(());
        }

        let raw = parse_record(data, pos, policy)?;
        let off = pos as u64;
        pos = raw.end;

        let is_dir = raw.attributes & ATTR_DIRECTORY != 0;
        let security_id = validate_security_id(raw.security_id, security, off)?;

        let inode_idx = match (raw.link_group, is_dir) {
            (0, _) | (_, true) => {
                new_inode(tree, &raw, security_id)
            }
            (group, false) => match link_groups.get(&group) {
                Some(&existing) => {
                    check_link_group_agreement(tree, existing, &raw, group);
                    existing
                }
                None => {
                    let idx = new_inode(tree, &raw, security_id);
                    tree.inodes[idx].link_group = group;
                    link_groups.insert(group, idx);
                    idx
                }
            },
        };

        if raw.name.is_empty() {
            return Err(WimError::metadata(off, "nameless dentry outside the root"));
        }
        let dentry_idx = tree.add_child(parent, raw.name.clone(), inode_idx)?;
        tree.dentries[dentry_idx].short_name = raw.short_name.clone();

        if is_dir {
            if raw.subdir_offset == 0 {
                return Err(WimError::metadata(off, "directory without a children run"));
            }
            parse_children(
                data,
                tree,
                security,
                dentry_idx,
                raw.subdir_offset,
                policy,
                link_groups,
                visited_runs,
            )?;
        } else if raw.subdir_offset != 0 {
            return Err(WimError::metadata(off, "nondirectory with a children run"));
        }
    }
}

fn new_inode(tree: &mut FileTree, raw: &RawDentry, security_id: i32) -> usize {
    let mut inode = Inode::new(raw.attributes, raw.times);
    inode.security_id = security_id;
    inode.reparse_tag = raw.reparse_tag;
    inode.streams = raw.streams.clone();
    tree.add_inode(inode)
}

/// First occurrence wins; disagreement is reported, not fatal.
fn check_link_group_agreement(tree: &FileTree, inode_idx: usize, raw: &RawDentry, group: u64) {
    let inode = &tree.inodes[inode_idx];
    if inode.attributes != raw.attributes
        || inode.security_id != raw.security_id
        || inode.times != raw.times
        || inode.reparse_tag != raw.reparse_tag
        || inode.streams != raw.streams
    {
        warn!("link group {group:#x} records disagree; keeping the first occurrence");
    }
}
