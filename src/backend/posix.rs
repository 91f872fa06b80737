//! Generic POSIX back-end.
//!
//! Maps the interface onto plain `std::fs`: hard links come from inode
//! numbers, symlinks become symlink-tagged reparse points whose data is the
//! UTF-8 target path, and timestamps are restored with the `filetime`
//! crate. POSIX has no alternate data streams, short names, or Windows
//! security descriptors, so those features are simply not advertised.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use filetime::FileTime;
use log::warn;

use super::{
    ApplyTarget, CaptureSource, FileRef, SourceItem, SourceStream, FEATURE_CASE_SENSITIVE,
    FEATURE_HARD_LINKS, FEATURE_REPARSE, FEATURE_TIMESTAMPS,
};
use crate::error::{Result, WimError};
use crate::tree::{
    filetime_from_system, filetime_to_system, FileTimes, ATTR_DIRECTORY, ATTR_NORMAL,
    ATTR_READONLY, ATTR_REPARSE_POINT, REPARSE_TAG_SYMLINK,
};

fn open_err(path: &Path) -> impl FnOnce(std::io::Error) -> WimError + '_ {
    move |e| WimError::Open {
        path: path.to_owned(),
        source: e,
    }
}

fn write_err(path: &Path) -> impl FnOnce(std::io::Error) -> WimError + '_ {
    move |e| WimError::Write {
        path: path.to_owned(),
        offset: 0,
        source: e,
    }
}

// ── Capture source ───────────────────────────────────────────────────────────

#[derive(Default)]
pub struct PosixSource;

impl PosixSource {
    pub fn new() -> Self {
        Self
    }
}

impl CaptureSource for PosixSource {
    fn stat(&mut self, path: &Path) -> Result<SourceItem> {
        let meta = fs::symlink_metadata(path).map_err(open_err(path))?;
        let ft = meta.file_type();

        let mut attributes = if ft.is_dir() {
            ATTR_DIRECTORY
        } else if ft.is_symlink() {
            ATTR_REPARSE_POINT
        } else {
            ATTR_NORMAL
        };
        if meta.permissions().mode() & 0o200 == 0 {
            attributes |= ATTR_READONLY;
        }

        let times = FileTimes {
            creation: meta
                .created()
                .map(filetime_from_system)
                .unwrap_or_else(|_| filetime_from_system(meta.modified().unwrap_or(std::time::UNIX_EPOCH))),
            last_access: meta
                .accessed()
                .map(filetime_from_system)
                .unwrap_or_default(),
            last_write: meta
                .modified()
                .map(filetime_from_system)
                .unwrap_or_default(),
        };

        let streams = if ft.is_file() {
            vec![SourceStream {
                name: None,
                size: meta.len(),
            }]
        } else {
            Vec::new()
        };

        Ok(SourceItem {
            attributes,
            times,
            inode_id: meta.ino(),
            streams,
        })
    }

    fn open_stream(
        &mut self,
        path: &Path,
        stream_name: Option<&str>,
    ) -> Result<Box<dyn Read + '_>> {
        if let Some(name) = stream_name {
            return Err(WimError::unsupported(format!(
                "POSIX sources have no alternate stream \"{name}\""
            )));
        }
        let f = File::open(path).map_err(open_err(path))?;
        Ok(Box::new(f))
    }

    fn list_dir(&mut self, path: &Path) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(path).map_err(open_err(path))? {
            let entry = entry.map_err(open_err(path))?;
            match entry.file_name().into_string() {
                Ok(name) => names.push(name),
                Err(os) => {
                    warn!(
                        "skipping {:?}: name is not valid Unicode",
                        path.join(os.to_string_lossy().as_ref())
                    );
                }
            }
        }
        Ok(names)
    }

    fn readlink_or_reparse(&mut self, path: &Path) -> Result<Option<(u32, Vec<u8>)>> {
        let meta = fs::symlink_metadata(path).map_err(open_err(path))?;
        if !meta.file_type().is_symlink() {
            return Ok(None);
        }
        let target = fs::read_link(path).map_err(open_err(path))?;
        Ok(Some((
            REPARSE_TAG_SYMLINK,
            target.to_string_lossy().into_owned().into_bytes(),
        )))
    }

    fn get_security(&mut self, _path: &Path) -> Result<Option<Vec<u8>>> {
        Ok(None)
    }
}

// ── Apply target ─────────────────────────────────────────────────────────────

pub struct PosixTarget {
    root: PathBuf,
    paths: Vec<PathBuf>,
}

impl PosixTarget {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            paths: Vec::new(),
        }
    }

    fn path_of(&self, f: FileRef) -> &Path {
        &self.paths[f.0 as usize]
    }

    fn register(&mut self, path: PathBuf) -> FileRef {
        self.paths.push(path);
        FileRef(self.paths.len() as u64 - 1)
    }
}

impl ApplyTarget for PosixTarget {
    fn root(&mut self) -> Result<FileRef> {
        fs::create_dir_all(&self.root).map_err(open_err(&self.root))?;
        let root = self.root.clone();
        Ok(self.register(root))
    }

    fn create_dir(&mut self, parent: FileRef, name: &str) -> Result<FileRef> {
        let path = self.path_of(parent).join(name);
        match fs::create_dir(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(write_err(&path)(e)),
        }
        Ok(self.register(path))
    }

    fn create_file(&mut self, parent: FileRef, name: &str, _attrs: u32) -> Result<FileRef> {
        let path = self.path_of(parent).join(name);
        File::create(&path).map_err(write_err(&path))?;
        Ok(self.register(path))
    }

    fn add_link(&mut self, target: FileRef, parent: FileRef, name: &str) -> Result<()> {
        let link = self.path_of(parent).join(name);
        fs::hard_link(self.path_of(target), &link).map_err(write_err(&link))
    }

    fn set_times(&mut self, f: FileRef, times: &FileTimes) -> Result<()> {
        let path = self.path_of(f).to_owned();
        let atime = FileTime::from_system_time(filetime_to_system(times.last_access));
        let mtime = FileTime::from_system_time(filetime_to_system(times.last_write));
        let meta = fs::symlink_metadata(&path).map_err(open_err(&path))?;
        if meta.file_type().is_symlink() {
            filetime::set_symlink_file_times(&path, atime, mtime).map_err(write_err(&path))
        } else {
            filetime::set_file_times(&path, atime, mtime).map_err(write_err(&path))
        }
    }

    fn set_attrs(&mut self, f: FileRef, attrs: u32) -> Result<()> {
        let path = self.path_of(f).to_owned();
        if attrs & ATTR_REPARSE_POINT != 0 {
            return Ok(()); // permissions do not apply through a symlink
        }
        let meta = fs::metadata(&path).map_err(open_err(&path))?;
        let mut perms = meta.permissions();
        if attrs & ATTR_READONLY != 0 {
            perms.set_mode(perms.mode() & !0o222);
        } else {
            perms.set_mode(perms.mode() | 0o200);
        }
        fs::set_permissions(&path, perms).map_err(write_err(&path))
    }

    fn set_security(&mut self, f: FileRef, _descriptor: &[u8]) -> Result<()> {
        Err(WimError::unsupported(format!(
            "POSIX targets cannot apply security descriptors ({:?})",
            self.path_of(f)
        )))
    }

    fn set_short_name(&mut self, f: FileRef, _parent: FileRef, _name: &str) -> Result<()> {
        Err(WimError::unsupported(format!(
            "POSIX targets have no short names ({:?})",
            self.path_of(f)
        )))
    }

    fn open_stream(
        &mut self,
        f: FileRef,
        stream_name: Option<&str>,
    ) -> Result<Box<dyn Write + Send>> {
        if let Some(name) = stream_name {
            return Err(WimError::unsupported(format!(
                "POSIX targets have no alternate stream \"{name}\""
            )));
        }
        let path = self.path_of(f);
        let file = File::create(path).map_err(write_err(path))?;
        Ok(Box::new(file))
    }

    fn write_reparse(&mut self, f: FileRef, tag: u32, data: &[u8]) -> Result<()> {
        if tag != REPARSE_TAG_SYMLINK {
            return Err(WimError::unsupported(format!(
                "POSIX targets only rehydrate symlink reparse points (tag {tag:#010x})"
            )));
        }
        let target = String::from_utf8(data.to_vec()).map_err(|_| WimError::InvalidReparseData {
            detail: "symlink target is not valid UTF-8".into(),
        })?;
        let path = self.path_of(f).to_owned();
        if path.exists() || fs::symlink_metadata(&path).is_ok() {
            fs::remove_file(&path).map_err(write_err(&path))?;
        }
        std::os::unix::fs::symlink(&target, &path).map_err(write_err(&path))
    }

    fn supported_features(&self) -> u32 {
        FEATURE_TIMESTAMPS | FEATURE_HARD_LINKS | FEATURE_CASE_SENSITIVE | FEATURE_REPARSE
    }
}
