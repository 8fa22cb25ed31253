use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::digest::Digest;
use crate::entry::{now, Timestamp};
use crate::error::Result;
use crate::util::{atomic_write_json, load_json};

/// The resolution record for a reference string (e.g. `example.com/repo@sha256:...` or
/// `example.com/repo:tag`), persisted at `refs/<hash-of-ref>.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefEntry {
    #[serde(rename = "ref")]
    pub reference: String,
    pub digest: Digest,
    pub size: u64,
    pub media_type: String,
    pub validated_at: Timestamp,
}

impl RefEntry {
    pub fn new(reference: String, digest: Digest, size: u64, media_type: String) -> RefEntry {
        RefEntry {
            reference,
            digest,
            size,
            media_type,
            validated_at: now(),
        }
    }

    pub fn touch(&mut self) {
        self.validated_at = now();
    }

    pub fn is_stale(&self, max_age_secs: u64) -> bool {
        now().saturating_sub(self.validated_at) > max_age_secs
    }

    pub fn load(path: &Path) -> Result<Option<RefEntry>> {
        load_json(path)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        atomic_write_json(path, self)
    }
}
