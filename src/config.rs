use std::path::PathBuf;
use std::time::Duration;

use once_cell::sync::Lazy;

use crate::error::{Error, Result};

static PROJECT_DIRS: Lazy<Option<directories::ProjectDirs>> =
    Lazy::new(|| directories::ProjectDirs::from("dev", "ocicache", "ocicache"));

/// Cache-wide tuning knobs. `CacheConfig::default()` resolves a platform cache directory
/// from `PROJECT_DIRS`; everything else defaults to "pruning disabled".
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub root: PathBuf,
    /// Bytes. Zero disables size-based pruning.
    pub max_size: u64,
    /// Zero disables age-based pruning.
    pub max_age: Duration,
    /// Chunk size `OpenLazy` fetches are grown by when a read spans more than one gap
    /// region; the range algebra itself is chunk-agnostic, this only bounds request size.
    pub lazy_fetch_chunk_size: u64,
    /// Whole-blob verify-on-read is incompatible with lazy loading (see `LazyVerifyConflict`).
    pub verify_on_read: bool,
}

const DEFAULT_LAZY_FETCH_CHUNK_SIZE: u64 = 1 << 20; // 1 MiB

impl CacheConfig {
    pub fn new(root: PathBuf) -> CacheConfig {
        CacheConfig {
            root,
            max_size: 0,
            max_age: Duration::ZERO,
            lazy_fetch_chunk_size: DEFAULT_LAZY_FETCH_CHUNK_SIZE,
            verify_on_read: false,
        }
    }

    /// Resolves the root to the platform cache directory (`~/.cache/ocicache` and
    /// equivalents), failing if the platform offers no meaningful home directory.
    pub fn default_root() -> Result<PathBuf> {
        PROJECT_DIRS
            .as_ref()
            .map(|dirs| dirs.cache_dir().to_path_buf())
            .ok_or_else(|| Error::Corrupt("could not determine a platform cache directory".into()))
    }
}

impl Default for CacheConfig {
    fn default() -> CacheConfig {
        CacheConfig::new(CacheConfig::default_root().unwrap_or_else(|_| PathBuf::from(".ocicache")))
    }
}
