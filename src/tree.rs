//! In-memory image tree: inodes, dentries, streams.
//!
//! An inode is the identity of a file; a dentry is a name binding it into a
//! directory. Hard links are several dentries sharing one inode. Inodes own
//! their streams; a stream references at most one blob by SHA-1 and owns
//! nothing — resolution goes through the blob table. Both arenas use plain
//! indices, so aliasing needs no interior mutability and serialization
//! carries identity through the on-disk hard-link group id alone.

use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::error::{Result, WimError};
use crate::integrity::Sha1Hash;

// Windows file attribute bits (the subset the format carries).
pub const ATTR_READONLY: u32 = 0x0000_0001;
pub const ATTR_HIDDEN: u32 = 0x0000_0002;
pub const ATTR_SYSTEM: u32 = 0x0000_0004;
pub const ATTR_DIRECTORY: u32 = 0x0000_0010;
pub const ATTR_ARCHIVE: u32 = 0x0000_0020;
pub const ATTR_NORMAL: u32 = 0x0000_0080;
pub const ATTR_SPARSE: u32 = 0x0000_0200;
pub const ATTR_REPARSE_POINT: u32 = 0x0000_0400;
pub const ATTR_COMPRESSED: u32 = 0x0000_0800;

/// Reparse tag for symbolic links.
pub const REPARSE_TAG_SYMLINK: u32 = 0xA000_000C;

/// Longest short (DOS) name: 12 UTF-16 code units ("LONGNA~1.TXT").
pub const MAX_SHORT_NAME_UNITS: usize = 12;

// ── Timestamps ───────────────────────────────────────────────────────────────

/// Offset between 1601-01-01 (FILETIME epoch) and 1970-01-01 in seconds.
const FILETIME_UNIX_DIFF_SECS: u64 = 11_644_473_600;
const TICKS_PER_SEC: u64 = 10_000_000;

/// The three live timestamps of an inode, as 64-bit Windows FILETIME values
/// (100 ns ticks since 1601-01-01).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileTimes {
    pub creation: u64,
    pub last_access: u64,
    pub last_write: u64,
}

impl FileTimes {
    pub fn now() -> Self {
        let t = filetime_from_system(SystemTime::now());
        Self {
            creation: t,
            last_access: t,
            last_write: t,
        }
    }
}

pub fn filetime_from_system(t: SystemTime) -> u64 {
    match t.duration_since(UNIX_EPOCH) {
        Ok(d) => {
            (d.as_secs() + FILETIME_UNIX_DIFF_SECS) * TICKS_PER_SEC + d.subsec_nanos() as u64 / 100
        }
        // Pre-1970 times clamp toward the FILETIME epoch.
        Err(e) => {
            let back = e.duration();
            let secs = FILETIME_UNIX_DIFF_SECS.saturating_sub(back.as_secs() + 1);
            secs * TICKS_PER_SEC
        }
    }
}

pub fn filetime_to_system(ft: u64) -> SystemTime {
    let secs = ft / TICKS_PER_SEC;
    let nanos = (ft % TICKS_PER_SEC) * 100;
    if secs >= FILETIME_UNIX_DIFF_SECS {
        UNIX_EPOCH + Duration::new(secs - FILETIME_UNIX_DIFF_SECS, nanos as u32)
    } else {
        UNIX_EPOCH - Duration::from_secs(FILETIME_UNIX_DIFF_SECS - secs)
    }
}

// ── Streams ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamKind {
    /// The unnamed default data stream.
    Data,
    /// A named alternate data stream.
    Named(String),
    /// The reparse-point data stream.
    Reparse,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stream {
    pub kind: StreamKind,
    /// `None` for an empty stream: the format elides empty content.
    pub hash: Option<Sha1Hash>,
}

impl Stream {
    pub fn name(&self) -> Option<&str> {
        match &self.kind {
            StreamKind::Named(n) => Some(n),
            _ => None,
        }
    }
}

// ── Inodes ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Inode {
    pub attributes: u32,
    pub times: FileTimes,
    /// Index into the image's security table; −1 means none.
    pub security_id: i32,
    /// Zero unless the inode is a reparse point.
    pub reparse_tag: u32,
    /// On-disk hard-link identity; 0 when the inode has a single alias.
    pub link_group: u64,
    /// Ordered streams; at most one of each `Data`/`Reparse`, named streams
    /// unique by name.
    pub streams: Vec<Stream>,
}

impl Inode {
    pub fn new(attributes: u32, times: FileTimes) -> Self {
        Self {
            attributes,
            times,
            security_id: -1,
            reparse_tag: 0,
            link_group: 0,
            streams: Vec::new(),
        }
    }

    #[inline]
    pub fn is_directory(&self) -> bool {
        self.attributes & ATTR_DIRECTORY != 0
    }

    #[inline]
    pub fn is_reparse_point(&self) -> bool {
        self.attributes & ATTR_REPARSE_POINT != 0
    }

    pub fn unnamed_stream(&self) -> Option<&Stream> {
        self.streams.iter().find(|s| s.kind == StreamKind::Data)
    }

    pub fn reparse_stream(&self) -> Option<&Stream> {
        self.streams.iter().find(|s| s.kind == StreamKind::Reparse)
    }

    pub fn named_streams(&self) -> impl Iterator<Item = &Stream> {
        self.streams
            .iter()
            .filter(|s| matches!(s.kind, StreamKind::Named(_)))
    }
}

// ── Dentries ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Dentry {
    pub name: String,
    /// 8.3-style alias, at most [`MAX_SHORT_NAME_UNITS`] UTF-16 units.
    pub short_name: Option<String>,
    pub parent: usize,
    pub children: Vec<usize>,
    pub inode: usize,
}

/// One image's tree. Dentry 0 is the nameless root; its inode is a
/// directory.
#[derive(Debug, Clone)]
pub struct FileTree {
    pub dentries: Vec<Dentry>,
    pub inodes: Vec<Inode>,
}

impl FileTree {
    pub fn new(root_times: FileTimes) -> Self {
        let root_inode = Inode::new(ATTR_DIRECTORY, root_times);
        Self {
            dentries: vec![Dentry {
                name: String::new(),
                short_name: None,
                parent: 0,
                children: Vec::new(),
                inode: 0,
            }],
            inodes: vec![root_inode],
        }
    }

    pub const ROOT: usize = 0;

    pub fn add_inode(&mut self, inode: Inode) -> usize {
        self.inodes.push(inode);
        self.inodes.len() - 1
    }

    /// Bind `name` under `parent`. Child names are unique case-insensitively
    /// (approximated by Unicode simple lowercase folding) and a child can
    /// never be its own parent.
    pub fn add_child(&mut self, parent: usize, name: String, inode: usize) -> Result<usize> {
        if !self.inodes[self.dentries[parent].inode].is_directory() {
            return Err(WimError::NotADirectory {
                path: self.path_of(parent).into(),
            });
        }
        let folded = name.to_lowercase();
        for &c in &self.dentries[parent].children {
            if self.dentries[c].name.to_lowercase() == folded {
                return Err(WimError::metadata(
                    0,
                    format!("duplicate name \"{name}\" in directory \"{}\"", self.path_of(parent)),
                ));
            }
        }
        let idx = self.dentries.len();
        self.dentries.push(Dentry {
            name,
            short_name: None,
            parent,
            children: Vec::new(),
            inode,
        });
        self.dentries[parent].children.push(idx);
        Ok(idx)
    }

    /// Slash-separated path of a dentry, for diagnostics.
    pub fn path_of(&self, mut dentry: usize) -> String {
        let mut parts = Vec::new();
        while dentry != Self::ROOT {
            parts.push(self.dentries[dentry].name.clone());
            dentry = self.dentries[dentry].parent;
        }
        parts.reverse();
        format!("/{}", parts.join("/"))
    }

    /// Resolve a slash-separated path (case-insensitive components).
    pub fn lookup_path(&self, path: &str) -> Option<usize> {
        let mut cur = Self::ROOT;
        for comp in path.split('/').filter(|c| !c.is_empty()) {
            let folded = comp.to_lowercase();
            cur = *self.dentries[cur]
                .children
                .iter()
                .find(|&&c| self.dentries[c].name.to_lowercase() == folded)?;
        }
        Some(cur)
    }

    /// Depth-first preorder over dentry indices, root first.
    pub fn preorder(&self) -> Vec<usize> {
        let mut out = Vec::with_capacity(self.dentries.len());
        let mut stack = vec![Self::ROOT];
        while let Some(d) = stack.pop() {
            out.push(d);
            for &c in self.dentries[d].children.iter().rev() {
                stack.push(c);
            }
        }
        out
    }

    /// Dentry aliases per inode, in dentry order. Inodes with more than one
    /// alias form hard-link groups.
    pub fn aliases_by_inode(&self) -> HashMap<usize, Vec<usize>> {
        let mut map: HashMap<usize, Vec<usize>> = HashMap::new();
        for (i, d) in self.dentries.iter().enumerate() {
            map.entry(d.inode).or_default().push(i);
        }
        map
    }

    /// Every (inode, stream) pair that references a blob, with the dentries
    /// that reach it. Used for refcount accounting and apply targeting.
    pub fn stream_references(&self) -> Vec<(&Sha1Hash, usize)> {
        let mut out = Vec::new();
        let aliases = self.aliases_by_inode();
        for (inode_idx, inode) in self.inodes.iter().enumerate() {
            if !aliases.contains_key(&inode_idx) {
                continue; // unreachable inode: carries no live references
            }
            for s in &inode.streams {
                if let Some(h) = &s.hash {
                    out.push((h, inode_idx));
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filetime_roundtrip() {
        let now = SystemTime::now();
        let ft = filetime_from_system(now);
        let back = filetime_to_system(ft);
        let drift = now
            .duration_since(back)
            .unwrap_or_else(|e| e.duration())
            .as_nanos();
        assert!(drift < 100, "FILETIME granularity is 100ns, drift {drift}");
    }

    #[test]
    fn duplicate_child_names_are_case_insensitive() {
        let mut t = FileTree::new(FileTimes::default());
        let ino = t.add_inode(Inode::new(ATTR_NORMAL, FileTimes::default()));
        t.add_child(FileTree::ROOT, "ReadMe.txt".into(), ino).unwrap();
        assert!(t.add_child(FileTree::ROOT, "readme.TXT".into(), ino).is_err());
    }

    #[test]
    fn files_cannot_have_children() {
        let mut t = FileTree::new(FileTimes::default());
        let ino = t.add_inode(Inode::new(ATTR_NORMAL, FileTimes::default()));
        let f = t.add_child(FileTree::ROOT, "f".into(), ino).unwrap();
        let err = t.add_child(f, "x".into(), ino).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NotADirectory);
    }

    #[test]
    fn preorder_parent_before_child() {
        let mut t = FileTree::new(FileTimes::default());
        let dir = t.add_inode(Inode::new(ATTR_DIRECTORY, FileTimes::default()));
        let file = t.add_inode(Inode::new(ATTR_NORMAL, FileTimes::default()));
        let a = t.add_child(FileTree::ROOT, "a".into(), dir).unwrap();
        let b = t.add_child(a, "b".into(), file).unwrap();
        let order = t.preorder();
        let pos = |d| order.iter().position(|&x| x == d).unwrap();
        assert!(pos(FileTree::ROOT) < pos(a));
        assert!(pos(a) < pos(b));
    }

    #[test]
    fn lookup_and_paths() {
        let mut t = FileTree::new(FileTimes::default());
        let dir = t.add_inode(Inode::new(ATTR_DIRECTORY, FileTimes::default()));
        let file = t.add_inode(Inode::new(ATTR_NORMAL, FileTimes::default()));
        let a = t.add_child(FileTree::ROOT, "Windows".into(), dir).unwrap();
        let b = t.add_child(a, "notepad.exe".into(), file).unwrap();
        assert_eq!(t.lookup_path("/windows/NOTEPAD.EXE"), Some(b));
        assert_eq!(t.path_of(b), "/Windows/notepad.exe");
        assert_eq!(t.lookup_path("/missing"), None);
    }

    #[test]
    fn hard_link_aliases_share_an_inode() {
        let mut t = FileTree::new(FileTimes::default());
        let ino = t.add_inode(Inode::new(ATTR_NORMAL, FileTimes::default()));
        t.add_child(FileTree::ROOT, "x".into(), ino).unwrap();
        t.add_child(FileTree::ROOT, "y".into(), ino).unwrap();
        let aliases = t.aliases_by_inode();
        assert_eq!(aliases[&ino].len(), 2);
    }
}
