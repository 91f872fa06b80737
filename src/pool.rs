//! Bounded file-handle pool for concurrent readers.
//!
//! Every concurrent read path acquires its own handle from the pool; the
//! single-threaded fast path is just a pool of size one. The mutex guards
//! only the free list — handles are opened and used outside the lock, so
//! `acquire`/`release` may block briefly on the mutex but never on I/O.
//! The pool grows in small increments up to its cap; releases beyond the
//! cap drop the handle instead of keeping it.

use std::fs::File;
use std::ops::{Deref, DerefMut};
use std::path::PathBuf;
use std::sync::Mutex;

use crate::error::{Result, WimError};

#[derive(Debug)]
pub struct HandlePool {
    path: PathBuf,
    free: Mutex<Vec<File>>,
    max_retained: usize,
}

impl HandlePool {
    pub fn new(path: PathBuf, max_retained: usize) -> Self {
        Self {
            path,
            free: Mutex::new(Vec::new()),
            max_retained: max_retained.max(1),
        }
    }

    /// Take a pooled handle, opening a fresh one when the free list is
    /// empty. The open happens after the lock is dropped.
    pub fn acquire(&self) -> Result<PooledFile<'_>> {
        let reused = self.free.lock().expect("handle pool poisoned").pop();
        let file = match reused {
            Some(f) => f,
            None => File::open(&self.path).map_err(|e| WimError::Open {
                path: self.path.clone(),
                source: e,
            })?,
        };
        Ok(PooledFile {
            file: Some(file),
            pool: self,
        })
    }

    fn release(&self, file: File) {
        let mut free = self.free.lock().expect("handle pool poisoned");
        if free.len() < self.max_retained {
            free.push(file);
        }
        // Beyond the cap the handle just closes on drop.
    }
}

/// RAII wrapper returning the handle to the pool on drop.
#[derive(Debug)]
pub struct PooledFile<'a> {
    file: Option<File>,
    pool: &'a HandlePool,
}

impl Deref for PooledFile<'_> {
    type Target = File;
    fn deref(&self) -> &File {
        self.file.as_ref().expect("pooled handle taken")
    }
}

impl DerefMut for PooledFile<'_> {
    fn deref_mut(&mut self) -> &mut File {
        self.file.as_mut().expect("pooled handle taken")
    }
}

impl Drop for PooledFile<'_> {
    fn drop(&mut self) {
        if let Some(f) = self.file.take() {
            self.pool.release(f);
        }
    }
}
