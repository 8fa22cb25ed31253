use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::cancel::Context;
use crate::digest::Digest;
use crate::entry::Entry;
use crate::error::{Error, Result};
use crate::layout::Layout;
use crate::range::{self, Range};
use crate::registry::{Descriptor, Registry};
use crate::util;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Open,
    Complete,
    Closed,
}

struct LazyInner {
    state: State,
    file: Option<File>,
    entry: Entry,
    reference: String,
    entry_path: PathBuf,
    partial_path: PathBuf,
    blob_path: PathBuf,
    registry: Arc<dyn Registry>,
    ctx: Context,
}

/// A seekable handle that downloads only the byte ranges `ReadAt` actually touches,
/// transitioning `Open -> Complete` once the underlying file is fully covered and rehashes
/// to the expected digest. Progress lives in a sparse file on disk plus a persisted
/// `Entry`, so it survives a restart rather than an in-memory chunk map.
pub struct LazyHandle {
    inner: Mutex<LazyInner>,
}

impl LazyHandle {
    /// `entry` is the caller's best-known state for this digest (empty ranges for a brand
    /// new fetch, or whatever was loaded from disk for a handle reopened after a restart).
    pub fn open(
        ctx: Context,
        registry: Arc<dyn Registry>,
        layout: &Layout,
        reference: String,
        mut entry: Entry,
    ) -> Result<LazyHandle> {
        let partial_path = layout.partial_path(&entry.digest);
        let entry_path = layout.entry_path(&entry.digest);
        let blob_path = layout.blob_path(&entry.digest);

        if let Ok(meta) = std::fs::metadata(&partial_path) {
            if meta.len() != entry.size {
                entry.ranges.clear();
            }
        }
        let file = util::open_sized_rw(&partial_path, entry.size)?;

        let mut inner = LazyInner {
            state: State::Open,
            file: Some(file),
            entry,
            reference,
            entry_path,
            partial_path,
            blob_path,
            registry,
            ctx,
        };
        inner.persist_entry()?;
        Ok(LazyHandle {
            inner: Mutex::new(inner),
        })
    }

    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        self.inner.lock().unwrap().read_at(buf, offset)
    }

    pub fn size(&self) -> u64 {
        self.inner.lock().unwrap().entry.size
    }

    pub fn complete(&self) -> bool {
        self.inner.lock().unwrap().state == State::Complete
    }

    pub fn close(&self) {
        self.inner.lock().unwrap().close();
    }
}

impl LazyInner {
    fn descriptor(&self) -> Descriptor {
        Descriptor::new(
            self.entry.digest.clone(),
            self.entry.size,
            self.entry.media_type.clone(),
        )
    }

    fn read_at(&mut self, buf: &mut [u8], offset: u64) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.state == State::Closed {
            return Err(Error::Closed);
        }

        let wanted = (buf.len() as u64).min(self.entry.size.saturating_sub(offset));
        if wanted == 0 {
            return Ok(0);
        }

        if self.state == State::Open && !range::contains(&self.entry.ranges, offset, wanted) {
            let gaps = range::find_gaps_in(&self.entry.ranges, offset, wanted);
            for gap in gaps {
                self.ctx.check()?;
                self.fetch_gap(gap)?;
            }
            self.persist_entry()?;
            if range::is_complete(&self.entry.ranges, self.entry.size) {
                self.promote_to_complete()?;
            }
        }

        let file = self.file.as_mut().ok_or(Error::Closed)?;
        file.seek(SeekFrom::Start(offset))?;
        let n = file.read(&mut buf[..wanted as usize])?;
        Ok(n)
    }

    fn fetch_gap(&mut self, gap: Range) -> Result<()> {
        let desc = self.descriptor();
        let mut stream =
            self.registry
                .fetch_blob_range(&self.ctx, &self.reference, &desc, gap.offset, gap.length)?;
        let file = self.file.as_mut().ok_or(Error::Closed)?;
        file.seek(SeekFrom::Start(gap.offset))?;
        util::copy_exact(&mut stream, file, gap.length)?;
        self.entry.add_range(gap);
        Ok(())
    }

    /// Rehashes the whole sparse file; on match, promotes `.partial` to the final blob path
    /// and drops to a read-only handle of it. On mismatch the handle stays `Open`: some
    /// range's bytes disagreed with the digest and a later read will simply re-fetch it
    /// (the range stays recorded as present, matching "remain Open" rather than rolling
    /// back to force an immediate re-request).
    fn promote_to_complete(&mut self) -> Result<()> {
        {
            let file = self.file.as_mut().ok_or(Error::Closed)?;
            file.sync_all()?;
            file.seek(SeekFrom::Start(0))?;
            let mut hasher = ring::digest::Context::new(&ring::digest::SHA256);
            let mut buf = [0u8; 64 * 1024];
            loop {
                let n = file.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
            }
            let digest = Digest::from_sha256_bytes(hasher.finish().as_ref());
            if digest != self.entry.digest {
                return Ok(());
            }
        }
        self.file = None;
        std::fs::rename(&self.partial_path, &self.blob_path)?;
        self.file = Some(File::open(&self.blob_path)?);
        self.entry.reference = Some(self.reference.clone());
        self.entry.mark_complete();
        self.persist_entry()?;
        self.state = State::Complete;
        Ok(())
    }

    fn persist_entry(&mut self) -> Result<()> {
        self.entry.save(&self.entry_path)
    }

    fn close(&mut self) {
        self.ctx.cancel();
        let _ = self.persist_entry();
        self.file = None;
        self.state = State::Closed;
    }
}
