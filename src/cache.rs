use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::cancel::Context;
use crate::config::CacheConfig;
use crate::digest::Digest;
use crate::entry::Entry;
use crate::error::{Error, Result};
use crate::handle::{FileHandle, Handle};
use crate::layout::{self, Layout};
use crate::lazy::LazyHandle;
use crate::prune::{self, PruneStats};
use crate::range;
use crate::ref_index::RefEntry;
use crate::registry::{Descriptor, Registry};
use crate::stream::TeeReader;
use crate::tag_index::TagListEntry;
use crate::util;

enum Classification {
    Complete(Entry),
    Partial(Entry),
    Absent,
}

/// The blob cache. One instance owns its whole root directory (two instances over the same
/// root are unsupported, per design); it is cheap to wrap in `Arc` and share across threads,
/// which `prefetch` requires in order to spawn its background download.
pub struct Cache {
    layout: Layout,
    config: CacheConfig,
    registry: Arc<dyn Registry>,
    lock: RwLock<()>,
}

impl Cache {
    pub fn new(config: CacheConfig, registry: Arc<dyn Registry>) -> Result<Cache> {
        let layout = Layout::new(config.root.clone());
        layout.ensure_dirs()?;
        Ok(Cache {
            layout,
            config,
            registry,
            lock: RwLock::new(()),
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Classifies the on-disk state for `digest`, self-healing (evicting) any disagreement
    /// between the entry and what's actually on disk along the way.
    fn classify(&self, digest: &Digest) -> Result<Classification> {
        let entry_path = self.layout.entry_path(digest);
        let entry = match Entry::load(&entry_path) {
            Ok(e) => e,
            Err(e) => {
                log::debug!("self-heal: corrupt entry for {digest}: {e}");
                self.evict_locked(digest)?;
                None
            }
        };
        let entry = match entry {
            Some(e) => e,
            None => return Ok(Classification::Absent),
        };

        if !entry.complete {
            return Ok(Classification::Partial(entry));
        }

        let blob_path = self.layout.blob_path(digest);
        let on_disk_ok = match layout::safe_open_regular(&blob_path) {
            Ok(Some(file)) => file.metadata().map(|m| m.len() == entry.size).unwrap_or(false),
            _ => false,
        };
        if on_disk_ok {
            Ok(Classification::Complete(entry))
        } else {
            log::debug!("self-heal: blob file for {digest} missing or size mismatch");
            self.evict_locked(digest)?;
            Ok(Classification::Absent)
        }
    }

    fn evict_locked(&self, digest: &Digest) -> Result<()> {
        let _ = std::fs::remove_file(self.layout.blob_path(digest));
        let _ = std::fs::remove_file(self.layout.partial_path(digest));
        let _ = std::fs::remove_file(self.layout.tmp_path(digest));
        let _ = std::fs::remove_file(self.layout.entry_path(digest));
        self.remove_refs_pointing_at(digest)
    }

    fn remove_refs_pointing_at(&self, digest: &Digest) -> Result<()> {
        let dir = self.layout.refs_dir();
        let entries = match std::fs::read_dir(&dir) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        for dir_entry in entries {
            let path = dir_entry?.path();
            if let Ok(Some(ref_entry)) = RefEntry::load(&path) {
                if &ref_entry.digest == digest {
                    let _ = std::fs::remove_file(&path);
                }
            }
        }
        Ok(())
    }

    /// Streams the whole blob from the registry through a hasher into `<digest>.tmp`,
    /// verifies, and renames into place. Any failure along the way removes the temp file.
    fn full_download(&self, ctx: &Context, reference: &str, desc: &Descriptor) -> Result<()> {
        let tmp_path = self.layout.tmp_path(&desc.digest);
        let outcome = (|| -> Result<()> {
            let mut tmp = File::create(&tmp_path)?;
            let mut stream = self.registry.fetch_blob(ctx, reference, desc)?;
            let mut hasher = ring::digest::Context::new(&ring::digest::SHA256);
            let mut buf = [0u8; 64 * 1024];
            let mut written = 0u64;
            loop {
                ctx.check()?;
                let n = stream.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                tmp.write_all(&buf[..n])?;
                hasher.update(&buf[..n]);
                written += n as u64;
            }
            tmp.sync_all()?;
            if written != desc.size {
                return Err(Error::SizeMismatch {
                    expected: desc.size,
                    got: written,
                });
            }
            let digest = Digest::from_sha256_bytes(hasher.finish().as_ref());
            if digest != desc.digest {
                return Err(Error::DigestMismatch {
                    expected: desc.digest.to_string(),
                });
            }
            Ok(())
        })();

        match outcome {
            Ok(()) => {
                std::fs::rename(&tmp_path, self.layout.blob_path(&desc.digest))?;
                let mut entry = Entry::new(
                    desc.digest.clone(),
                    desc.size,
                    desc.media_type.clone(),
                    Some(reference.to_string()),
                );
                entry.mark_complete();
                if let Err(e) = entry.save(&self.layout.entry_path(&desc.digest)) {
                    log::warn!("failed to persist entry after download of {}: {e}", desc.digest);
                }
                Ok(())
            }
            Err(e) => {
                let _ = std::fs::remove_file(&tmp_path);
                Err(e)
            }
        }
    }

    /// Fetches only the missing gaps of a partial blob and, once complete, promotes it.
    /// `RangeNotSupported` and a failed whole-file rehash both discard progress so the
    /// caller falls back to `full_download`.
    fn resume(&self, ctx: &Context, reference: &str, desc: &Descriptor, mut entry: Entry) -> Result<()> {
        let partial_path = self.layout.partial_path(&desc.digest);
        let entry_path = self.layout.entry_path(&desc.digest);
        let mut file = util::open_sized_rw(&partial_path, desc.size)?;

        let gaps = range::find_gaps(&entry.ranges, desc.size);
        for gap in gaps {
            if ctx.is_cancelled() {
                entry.save(&entry_path)?;
                return Err(Error::Cancelled);
            }
            let mut stream =
                match self.registry.fetch_blob_range(ctx, reference, desc, gap.offset, gap.length) {
                    Ok(s) => s,
                    Err(Error::RangeNotSupported) => {
                        let _ = std::fs::remove_file(&partial_path);
                        let _ = std::fs::remove_file(&entry_path);
                        return Err(Error::RangeNotSupported);
                    }
                    Err(e) => return Err(e),
                };
            file.seek(SeekFrom::Start(gap.offset))?;
            util::copy_exact(&mut stream, &mut file, gap.length)?;
            entry.add_range(gap);
        }
        entry.save(&entry_path)?;

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
        if digest != desc.digest {
            drop(file);
            let _ = std::fs::remove_file(&partial_path);
            let _ = std::fs::remove_file(&entry_path);
            return Err(Error::DigestMismatch {
                expected: desc.digest.to_string(),
            });
        }
        drop(file);
        std::fs::rename(&partial_path, self.layout.blob_path(&desc.digest))?;
        entry.reference = Some(reference.to_string());
        entry.mark_complete();
        if let Err(e) = entry.save(&entry_path) {
            log::warn!("failed to persist entry after resume of {}: {e}", desc.digest);
        }
        Ok(())
    }

    /// Classifies, then drives whatever path (serve / resume / full-download) is needed to
    /// reach a complete, verified entry. Re-classifying at the top of every call is what
    /// gives "double-check after acquiring the lock" for free: a second caller blocked on
    /// the write lock behind an in-flight download simply observes `Complete` once it gets
    /// its turn.
    fn ensure_complete(&self, ctx: &Context, reference: &str, desc: &Descriptor) -> Result<Entry> {
        match self.classify(&desc.digest)? {
            Classification::Complete(entry) => Ok(entry),
            Classification::Partial(entry) => match self.resume(ctx, reference, desc, entry) {
                Ok(()) => self.reload_complete_entry(&desc.digest),
                Err(Error::RangeNotSupported) | Err(Error::DigestMismatch { .. }) => {
                    self.full_download(ctx, reference, desc)?;
                    self.reload_complete_entry(&desc.digest)
                }
                Err(e) => Err(e),
            },
            Classification::Absent => {
                self.full_download(ctx, reference, desc)?;
                self.reload_complete_entry(&desc.digest)
            }
        }
    }

    fn reload_complete_entry(&self, digest: &Digest) -> Result<Entry> {
        Entry::load(&self.layout.entry_path(digest))?
            .ok_or_else(|| Error::Corrupt(format!("entry for {digest} vanished after download")))
    }

    pub fn open(&self, ctx: &Context, reference: &str, desc: &Descriptor) -> Result<Handle> {
        ctx.check()?;
        let _guard = self.lock.write().unwrap();
        let entry = self.ensure_complete(ctx, reference, desc)?;
        Ok(Handle::File(FileHandle::open(
            &self.layout.blob_path(&desc.digest),
            entry.size,
        )?))
    }

    pub fn open_stream(
        &self,
        ctx: &Context,
        reference: &str,
        desc: &Descriptor,
    ) -> Result<Box<dyn Read + Send>> {
        ctx.check()?;
        let _guard = self.lock.write().unwrap();
        self.ensure_complete(ctx, reference, desc)?;
        Ok(Box::new(File::open(self.layout.blob_path(&desc.digest))?))
    }

    pub fn open_stream_through(
        &self,
        ctx: &Context,
        reference: &str,
        desc: &Descriptor,
    ) -> Result<Box<dyn Read + Send>> {
        ctx.check()?;
        let _guard = self.lock.write().unwrap();
        match self.classify(&desc.digest)? {
            Classification::Complete(_) => {
                Ok(Box::new(File::open(self.layout.blob_path(&desc.digest))?))
            }
            Classification::Partial(_) | Classification::Absent => {
                // A lazy session's leftovers would otherwise look like valid cached ranges
                // to a later lazy reader even though this stream is about to rewrite them.
                self.evict_locked(&desc.digest)?;
                let stream = self.registry.fetch_blob(ctx, reference, desc)?;
                let tee = TeeReader::new(stream, &self.layout, reference.to_string(), desc.clone())?;
                Ok(Box::new(tee))
            }
        }
    }

    pub fn open_lazy(&self, ctx: &Context, reference: &str, desc: &Descriptor) -> Result<Handle> {
        if self.config.verify_on_read {
            return Err(Error::LazyVerifyConflict);
        }
        ctx.check()?;
        let handle_ctx = ctx.child();
        let _guard = self.lock.write().unwrap();
        let entry = match self.classify(&desc.digest)? {
            Classification::Complete(entry) => {
                return Ok(Handle::File(FileHandle::open(
                    &self.layout.blob_path(&desc.digest),
                    entry.size,
                )?))
            }
            Classification::Partial(entry) => entry,
            Classification::Absent => Entry::new(
                desc.digest.clone(),
                desc.size,
                desc.media_type.clone(),
                Some(reference.to_string()),
            ),
        };
        let handle = LazyHandle::open(
            handle_ctx,
            self.registry.clone(),
            &self.layout,
            reference.to_string(),
            entry,
        )?;
        Ok(Handle::Lazy(handle))
    }

    pub fn evict(&self, digest: &Digest) -> Result<()> {
        let _guard = self.lock.write().unwrap();
        self.evict_locked(digest)
    }

    pub fn clear(&self) -> Result<()> {
        let _guard = self.lock.write().unwrap();
        for dir in [
            self.layout.blobs_dir(),
            self.layout.entries_dir(),
            self.layout.refs_dir(),
            self.layout.tags_dir(),
        ] {
            if dir.exists() {
                std::fs::remove_dir_all(&dir)?;
            }
        }
        self.layout.ensure_dirs()
    }

    /// Begins a background full download for `desc`, ignoring errors other than logging
    /// them at debug level; a cancelled `ctx` aborts the fetch silently, matching the
    /// "background prefetch never surfaces errors" policy.
    pub fn prefetch(self: &Arc<Cache>, ctx: &Context, reference: &str, desc: &Descriptor) {
        let cache = self.clone();
        let reference = reference.to_string();
        let desc = desc.clone();
        let ctx = ctx.child();
        std::thread::spawn(move || {
            let _guard = cache.lock.write().unwrap();
            let classification = match cache.classify(&desc.digest) {
                Ok(c) => c,
                Err(e) => {
                    log::debug!("prefetch classify failed for {}: {e}", desc.digest);
                    return;
                }
            };
            let result = match classification {
                Classification::Complete(_) => return,
                Classification::Partial(entry) => cache.resume(&ctx, &reference, &desc, entry),
                Classification::Absent => cache.full_download(&ctx, &reference, &desc),
            };
            if let Err(e) = result {
                if !matches!(e, Error::Cancelled) {
                    log::debug!("prefetch failed for {}: {e}", desc.digest);
                }
            }
        });
    }

    pub fn lookup_by_ref(&self, reference: &str, ttl: Duration) -> Result<Option<RefEntry>> {
        if ttl.is_zero() {
            return Ok(None);
        }
        let _guard = self.lock.read().unwrap();
        let path = self.layout.ref_path(reference);
        match RefEntry::load(&path)? {
            Some(entry) if !entry.is_stale(ttl.as_secs()) => Ok(Some(entry)),
            _ => Ok(None),
        }
    }

    pub fn update_ref_index(&self, reference: &str, desc: &Descriptor) -> Result<()> {
        let _guard = self.lock.write().unwrap();
        let entry = RefEntry::new(
            reference.to_string(),
            desc.digest.clone(),
            desc.size,
            desc.media_type.clone(),
        );
        entry.save(&self.layout.ref_path(reference))
    }

    pub fn list_tags(&self, ctx: &Context, repository: &str, ttl: Duration) -> Result<Vec<String>> {
        let _guard = self.lock.write().unwrap();
        let path = self.layout.tag_list_path(repository);
        if !ttl.is_zero() {
            if let Some(entry) = TagListEntry::load(&path)? {
                if !entry.is_stale(ttl.as_secs()) {
                    return Ok(entry.tags);
                }
            }
        }
        let tags = self.registry.list_tags(ctx, repository)?;
        if !ttl.is_zero() {
            let entry = TagListEntry::new(repository.to_string(), tags.clone());
            if let Err(e) = entry.save(&path) {
                log::warn!("failed to persist tag list for {repository}: {e}");
            }
        }
        Ok(tags)
    }

    /// Evicts by TTL then LRU down to `config.max_age`/`config.max_size`, then garbage
    /// collects any RefEntry left pointing at a digest that no longer survives.
    pub fn prune(&self, ctx: &Context) -> Result<PruneStats> {
        let _guard = self.lock.write().unwrap();
        prune::prune(ctx, &self.layout, self.config.max_size, self.config.max_age, |digest| {
            self.evict_locked(digest)
        })
    }

    pub(crate) fn layout(&self) -> &Layout {
        &self.layout
    }
}
