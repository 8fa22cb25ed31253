use std::collections::HashSet;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::cancel::Context;
use crate::digest::Digest;
use crate::entry::Entry;
use crate::error::Result;
use crate::layout::Layout;
use crate::ref_index::RefEntry;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneStats {
    pub entries_removed: u64,
    pub bytes_removed: u64,
    pub entries_remaining: u64,
    pub bytes_remaining: u64,
}

struct Candidate {
    digest: Digest,
    size: u64,
    last_accessed: u64,
    marked: bool,
}

/// TTL + LRU pruning with cross-index garbage collection, run under the cache's exclusive
/// lock. `layout` and `evict` are passed in rather than taking a `&Cache` directly so this
/// module stays a pure function of "what's on disk" plus one callback, independently
/// testable from the cache's own locking.
pub fn prune(
    ctx: &Context,
    layout: &Layout,
    max_size: u64,
    max_age: Duration,
    mut evict: impl FnMut(&Digest) -> Result<()>,
) -> Result<PruneStats> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before Unix epoch")
        .as_secs();

    let mut candidates = load_candidates(layout)?;

    // Phase A: TTL.
    if !max_age.is_zero() {
        let cutoff = now.saturating_sub(max_age.as_secs());
        for c in candidates.iter_mut() {
            if c.last_accessed < cutoff {
                c.marked = true;
            }
        }
    }

    // Phase B: LRU over whatever TTL left standing.
    if max_size > 0 {
        let mut unmarked: Vec<usize> = candidates
            .iter()
            .enumerate()
            .filter(|(_, c)| !c.marked)
            .map(|(i, _)| i)
            .collect();
        let mut total: u64 = unmarked.iter().map(|&i| candidates[i].size).sum();
        if total > max_size {
            unmarked.sort_by_key(|&i| candidates[i].last_accessed);
            for i in unmarked {
                if total <= max_size {
                    break;
                }
                total -= candidates[i].size;
                candidates[i].marked = true;
            }
        }
    }

    // Execute, honoring cancellation between entries.
    let mut stats = PruneStats::default();
    for c in &candidates {
        if ctx.is_cancelled() {
            break;
        }
        if c.marked {
            evict(&c.digest)?;
            stats.entries_removed += 1;
            stats.bytes_removed += c.size;
        } else {
            stats.entries_remaining += 1;
            stats.bytes_remaining += c.size;
        }
    }

    let surviving: HashSet<String> = candidates
        .iter()
        .filter(|c| !c.marked)
        .map(|c| c.digest.as_str().to_string())
        .collect();
    remove_orphaned_refs(layout, &surviving)?;

    Ok(stats)
}

fn load_candidates(layout: &Layout) -> Result<Vec<Candidate>> {
    let dir = layout.entries_dir();
    let read_dir = match std::fs::read_dir(&dir) {
        Ok(d) => d,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut out = Vec::new();
    for dir_entry in read_dir {
        let path = dir_entry?.path();
        if let Some(entry) = Entry::load(&path)? {
            out.push(Candidate {
                digest: entry.digest,
                size: entry.size,
                last_accessed: entry.last_accessed,
                marked: false,
            });
        }
    }
    Ok(out)
}

fn remove_orphaned_refs(layout: &Layout, surviving_digests: &HashSet<String>) -> Result<()> {
    let dir = layout.refs_dir();
    let read_dir = match std::fs::read_dir(&dir) {
        Ok(d) => d,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    for dir_entry in read_dir {
        let path = dir_entry?.path();
        if let Ok(Some(ref_entry)) = RefEntry::load(&path) {
            if !surviving_digests.contains(ref_entry.digest.as_str()) {
                let _ = std::fs::remove_file(&path);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use std::cell::RefCell;

    fn digest_of(bytes: &[u8]) -> Digest {
        Digest::from_sha256_bytes(ring::digest::digest(&ring::digest::SHA256, bytes).as_ref())
    }

    fn seed_entry(layout: &Layout, content: &[u8], last_accessed: u64) -> Digest {
        let digest = digest_of(content);
        std::fs::write(layout.blob_path(&digest), content).unwrap();
        let mut entry = Entry::new(digest.clone(), content.len() as u64, "application/octet-stream".into(), None);
        entry.mark_complete();
        entry.last_accessed = last_accessed;
        entry.created_at = last_accessed;
        entry.save(&layout.entry_path(&digest)).unwrap();
        digest
    }

    #[test]
    fn ttl_prune_evicts_only_the_oldest_entry() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path().to_path_buf());
        layout.ensure_dirs().unwrap();

        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs();
        let d_old = seed_entry(&layout, b"aaaaaaaaaa", now - 180);
        let d_mid = seed_entry(&layout, b"bbbbbbbbbb", now - 120);
        let d_new = seed_entry(&layout, b"cccccccccc", now);

        let evicted = RefCell::new(Vec::new());
        let stats = prune(
            &Context::background(),
            &layout,
            20,
            Duration::from_secs(150),
            |d| {
                evicted.borrow_mut().push(d.clone());
                std::fs::remove_file(layout.blob_path(d)).ok();
                std::fs::remove_file(layout.entry_path(d)).ok();
                Ok(())
            },
        )
        .unwrap();

        assert_eq!(evicted.into_inner(), vec![d_old]);
        assert_eq!(stats.entries_remaining, 2);
        assert_eq!(stats.bytes_remaining, 20);
        assert!(layout.entry_path(&d_mid).exists());
        assert!(layout.entry_path(&d_new).exists());
    }

    #[test]
    fn lru_prune_evicts_oldest_until_under_budget() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path().to_path_buf());
        layout.ensure_dirs().unwrap();

        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs();
        seed_entry(&layout, b"aaaaaaaaaa", now - 30);
        seed_entry(&layout, b"bbbbbbbbbb", now - 20);
        seed_entry(&layout, b"cccccccccc", now);

        let stats = prune(&Context::background(), &layout, 20, Duration::ZERO, |d| {
            std::fs::remove_file(layout.blob_path(d)).ok();
            std::fs::remove_file(layout.entry_path(d)).ok();
            Ok(())
        })
        .unwrap();

        assert_eq!(stats.entries_removed, 1);
        assert_eq!(stats.bytes_remaining, 20);
    }

    #[test]
    fn orphaned_ref_entries_are_removed_after_eviction() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path().to_path_buf());
        layout.ensure_dirs().unwrap();

        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs();
        let d_old = seed_entry(&layout, b"aaaaaaaaaa", now - 1000);
        let r = RefEntry::new("r:v1".into(), d_old.clone(), 10, "application/octet-stream".into());
        r.save(&layout.ref_path("r:v1")).unwrap();

        prune(&Context::background(), &layout, 0, Duration::from_secs(10), |d| {
            std::fs::remove_file(layout.blob_path(d)).ok();
            std::fs::remove_file(layout.entry_path(d)).ok();
            Ok(())
        })
        .unwrap();

        assert!(!layout.ref_path("r:v1").exists());
    }

    #[test]
    fn prune_is_monotone_on_entry_count() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::new(dir.path().to_path_buf());
        layout.ensure_dirs().unwrap();
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs();
        seed_entry(&layout, b"aaaaaaaaaa", now);

        let before = load_candidates(&layout).unwrap().len() as u64;
        let stats = prune(&Context::background(), &layout, 0, Duration::ZERO, |_| Ok(())).unwrap();
        assert!(stats.entries_remaining <= before);
    }
}
