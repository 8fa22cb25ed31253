use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::entry::{now, Timestamp};
use crate::error::Result;
use crate::util::{atomic_write_json, load_json};

/// The cached tag listing for one repository, persisted at `tags/<hash-of-repo>.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagListEntry {
    pub repository: String,
    pub tags: Vec<String>,
    pub validated_at: Timestamp,
}

impl TagListEntry {
    pub fn new(repository: String, tags: Vec<String>) -> TagListEntry {
        TagListEntry {
            repository,
            tags,
            validated_at: now(),
        }
    }

    pub fn is_stale(&self, max_age_secs: u64) -> bool {
        now().saturating_sub(self.validated_at) > max_age_secs
    }

    pub fn load(path: &Path) -> Result<Option<TagListEntry>> {
        load_json(path)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        atomic_write_json(path, self)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn save_then_load_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tags.json");
        let entry = TagListEntry::new(
            "example.com/repo".into(),
            vec!["latest".into(), "v1".into()],
        );
        entry.save(&path).unwrap();
        let loaded = TagListEntry::load(&path).unwrap().unwrap();
        assert_eq!(loaded, entry);
    }

    #[test]
    fn stale_after_max_age() {
        let mut entry = TagListEntry::new("example.com/repo".into(), vec!["latest".into()]);
        entry.validated_at = 0;
        assert!(entry.is_stale(10));
    }
}
