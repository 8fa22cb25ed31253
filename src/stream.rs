use std::fs::File;
use std::io::{self, Read, Write};
use std::path::PathBuf;

use crate::digest::Digest;
use crate::entry::Entry;
use crate::error::Result;
use crate::layout::Layout;
use crate::registry::Descriptor;

/// A forward-only reader that duplicates every byte the caller reads into an on-disk temp
/// file and an incremental hasher, finalizing into the cache on clean EOF with a matching
/// digest. The cache owns the destination file; the caller only controls the pace of reads.
pub struct TeeReader<R: Read> {
    inner: R,
    temp_file: Option<File>,
    hasher: ring::digest::Context,
    written: u64,
    write_failed: bool,
    desc: Descriptor,
    reference: String,
    tmp_path: PathBuf,
    blob_path: PathBuf,
    entry_path: PathBuf,
    finalized: bool,
}

impl<R: Read> TeeReader<R> {
    pub fn new(inner: R, layout: &Layout, reference: String, desc: Descriptor) -> Result<TeeReader<R>> {
        let tmp_path = layout.tmp_path(&desc.digest);
        let blob_path = layout.blob_path(&desc.digest);
        let entry_path = layout.entry_path(&desc.digest);
        let temp_file = File::create(&tmp_path)?;
        Ok(TeeReader {
            inner,
            temp_file: Some(temp_file),
            hasher: ring::digest::Context::new(&ring::digest::SHA256),
            written: 0,
            write_failed: false,
            desc,
            reference,
            tmp_path,
            blob_path,
            entry_path,
            finalized: false,
        })
    }

    fn tee(&mut self, chunk: &[u8]) {
        if self.write_failed {
            return;
        }
        let file = match self.temp_file.as_mut() {
            Some(f) => f,
            None => return,
        };
        if file.write_all(chunk).is_err() {
            self.write_failed = true;
            return;
        }
        self.hasher.update(chunk);
        self.written += chunk.len() as u64;
    }

    /// Drains whatever the caller didn't read, verifies, and finalizes or discards. Called
    /// from `Drop` so an early-dropped reader still gets cached on a clean underlying EOF —
    /// stopping partway through a read is a legitimate caller pattern, not an error.
    fn finish(&mut self) {
        if self.finalized {
            return;
        }
        self.finalized = true;

        if self.written < self.desc.size && !self.write_failed {
            let mut buf = [0u8; 64 * 1024];
            loop {
                let remaining = self.desc.size - self.written;
                if remaining == 0 {
                    break;
                }
                let want = (buf.len() as u64).min(remaining) as usize;
                match self.inner.read(&mut buf[..want]) {
                    Ok(0) => break,
                    Ok(n) => self.tee(&buf[..n]),
                    Err(_) => break,
                }
            }
        }

        let size_ok = !self.write_failed && self.written == self.desc.size;
        let hasher = std::mem::replace(&mut self.hasher, ring::digest::Context::new(&ring::digest::SHA256));
        let digest_ok = size_ok && Digest::from_sha256_bytes(hasher.finish().as_ref()) == self.desc.digest;

        if digest_ok {
            if let Some(file) = self.temp_file.as_ref() {
                let _ = file.sync_all();
            }
        }
        let _ = self.temp_file.take(); // release the fd before rename or removal

        if digest_ok {
            let _ = self.persist();
        } else {
            let _ = std::fs::remove_file(&self.tmp_path);
        }
    }

    fn persist(&self) -> Result<()> {
        std::fs::rename(&self.tmp_path, &self.blob_path)?;
        let mut entry = Entry::new(
            self.desc.digest.clone(),
            self.desc.size,
            self.desc.media_type.clone(),
            Some(self.reference.clone()),
        );
        entry.mark_complete();
        entry.save(&self.entry_path)?;
        Ok(())
    }
}

impl<R: Read> Read for TeeReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n > 0 {
            self.tee(&buf[..n]);
        } else {
            self.finish();
        }
        Ok(n)
    }
}

impl<R: Read> Drop for TeeReader<R> {
    fn drop(&mut self) {
        self.finish();
    }
}
