use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::digest::Digest;
use crate::error::Result;
use crate::range::{self, Range, RangeSet};
use crate::util::{atomic_write_json, load_json};

/// Seconds since the Unix epoch. Plain `u64` rather than a `chrono`/`time` type: the only
/// operations the cache performs on timestamps are "now", "subtract", and "compare", and
/// the JSON on disk is meant to be human-readable, so a bare integer keeps both the type
/// and the document simple.
pub type Timestamp = u64;

pub fn now() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before Unix epoch")
        .as_secs()
}

const CURRENT_VERSION: u32 = 1;

/// The per-digest metadata document persisted at `entries/sha256/<hex>.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub version: u32,
    pub digest: Digest,
    pub size: u64,
    pub media_type: String,
    pub complete: bool,
    pub verified: bool,
    pub ranges: RangeSet,
    pub created_at: Timestamp,
    pub last_accessed: Timestamp,
    #[serde(rename = "ref", skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
}

impl Entry {
    /// A freshly created, empty (no ranges yet) entry for a digest whose download is
    /// starting now.
    pub fn new(digest: Digest, size: u64, media_type: String, reference: Option<String>) -> Entry {
        let at = now();
        Entry {
            version: CURRENT_VERSION,
            digest,
            size,
            media_type,
            complete: false,
            verified: false,
            ranges: Vec::new(),
            created_at: at,
            last_accessed: at,
            reference,
        }
    }

    pub fn mark_complete(&mut self) {
        self.complete = true;
        self.verified = true;
        self.ranges.clear();
    }

    pub fn add_range(&mut self, r: Range) {
        self.ranges = range::add(&self.ranges, r);
    }

    pub fn is_complete(&self) -> bool {
        range::is_complete(&self.ranges, self.size) || self.complete
    }

    pub fn coverage(&self) -> u64 {
        range::coverage(&self.ranges)
    }

    /// Checks internal consistency: a complete entry is always verified with no leftover
    /// ranges, and coverage never exceeds size. Used only in tests and debug assertions;
    /// production code never constructs an entry that could fail this.
    pub fn check_invariants(&self) -> bool {
        if self.complete {
            return self.verified && self.ranges.is_empty();
        }
        self.coverage() <= self.size
            && self.created_at <= self.last_accessed
            && self.ranges == range::merge(&self.ranges)
    }

    /// Loads the entry for `path`; does not bump `last_accessed` (only `save` does).
    /// Callers that read an entry and intend to keep using it call `touch` + `save`
    /// explicitly.
    pub fn load(path: &Path) -> Result<Option<Entry>> {
        load_json(path)
    }

    /// Atomically persists the entry: write-temp, fsync, rename. Bumps `last_accessed` to
    /// now before writing; `created_at` is left untouched (it is fixed at construction).
    pub fn save(&mut self, path: &Path) -> Result<()> {
        self.last_accessed = now();
        atomic_write_json(path, self)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn sample_digest() -> Digest {
        Digest::parse(
            "sha256:2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824",
        )
        .unwrap()
    }

    #[test]
    fn new_entry_satisfies_invariants() {
        let e = Entry::new(sample_digest(), 5, "application/octet-stream".into(), None);
        assert!(e.check_invariants());
        assert!(!e.complete);
    }

    #[test]
    fn mark_complete_clears_ranges() {
        let mut e = Entry::new(sample_digest(), 5, "application/octet-stream".into(), None);
        e.add_range(Range::new(0, 5));
        e.mark_complete();
        assert!(e.check_invariants());
        assert!(e.ranges.is_empty());
        assert!(e.verified);
    }

    #[test]
    fn save_then_load_roundtrips_modulo_last_accessed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("entry.json");
        let mut e = Entry::new(sample_digest(), 5, "application/octet-stream".into(), None);
        let created = e.created_at;
        std::thread::sleep(std::time::Duration::from_millis(5));
        e.save(&path).unwrap();

        let loaded = Entry::load(&path).unwrap().unwrap();
        assert_eq!(loaded.digest, e.digest);
        assert_eq!(loaded.size, e.size);
        assert_eq!(loaded.created_at, created);
        assert_eq!(loaded.last_accessed, e.last_accessed);
    }

    #[test]
    fn load_missing_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("entry.json");
        assert!(Entry::load(&path).unwrap().is_none());
    }

    #[test]
    fn ref_field_round_trips_json_key_name() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("entry.json");
        let mut e = Entry::new(
            sample_digest(),
            5,
            "application/octet-stream".into(),
            Some("example.com/repo:tag".into()),
        );
        e.save(&path).unwrap();
        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("\"ref\""));
        let loaded = Entry::load(&path).unwrap().unwrap();
        assert_eq!(loaded.reference.as_deref(), Some("example.com/repo:tag"));
    }
}
