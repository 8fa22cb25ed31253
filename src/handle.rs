use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::Mutex;

use crate::error::{Error, Result};
use crate::lazy::LazyHandle;

/// A handle onto a blob whose entire contents are already on disk, complete and verified.
/// Reads don't touch the cache lock (per the concurrency model): the handle serializes
/// access to its own file descriptor with an internal mutex instead.
pub struct FileHandle {
    file: Mutex<Option<File>>,
    size: u64,
}

impl FileHandle {
    pub fn open(path: &Path, size: u64) -> Result<FileHandle> {
        let file = File::open(path)?;
        Ok(FileHandle {
            file: Mutex::new(Some(file)),
            size,
        })
    }

    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let mut guard = self.file.lock().unwrap();
        let file = guard.as_mut().ok_or(Error::Closed)?;
        file.seek(SeekFrom::Start(offset))?;
        let n = file.read(buf)?;
        Ok(n)
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn complete(&self) -> bool {
        true
    }

    pub fn close(&self) {
        *self.file.lock().unwrap() = None;
    }
}

/// The random-access handle produced by `Open`/`OpenLazy`: either the blob is already
/// fully present (`File`) or it is still being filled in on demand (`Lazy`). A closed trade
/// of two variants rather than `Box<dyn Trait>`, since this is a fixed, compile-time-known
/// set and callers never need to substitute a third kind.
pub enum Handle {
    File(FileHandle),
    Lazy(LazyHandle),
}

impl Handle {
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        match self {
            Handle::File(h) => h.read_at(buf, offset),
            Handle::Lazy(h) => h.read_at(buf, offset),
        }
    }

    pub fn size(&self) -> u64 {
        match self {
            Handle::File(h) => h.size(),
            Handle::Lazy(h) => h.size(),
        }
    }

    pub fn complete(&self) -> bool {
        match self {
            Handle::File(h) => h.complete(),
            Handle::Lazy(h) => h.complete(),
        }
    }

    pub fn close(&self) {
        match self {
            Handle::File(h) => h.close(),
            Handle::Lazy(h) => h.close(),
        }
    }
}
