use std::fs::{self, File};
use std::path::{Path, PathBuf};

use ring::digest;

use crate::digest::Digest;
use crate::error::{Error, Result};

/// Directory layout and path-safety discipline for one cache root.
///
/// A `blobs/`, `entries/`, `refs/`, `tags/` tree keyed directly on hex digests, since
/// digests are already uniformly distributed and the on-disk layout is part of this
/// domain's contract, not an implementation detail.
#[derive(Debug, Clone)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    pub fn new(root: PathBuf) -> Layout {
        Layout { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn blobs_dir(&self) -> PathBuf {
        self.root.join("blobs").join("sha256")
    }

    pub fn entries_dir(&self) -> PathBuf {
        self.root.join("entries").join("sha256")
    }

    pub fn refs_dir(&self) -> PathBuf {
        self.root.join("refs")
    }

    pub fn tags_dir(&self) -> PathBuf {
        self.root.join("tags")
    }

    pub fn blob_path(&self, digest: &Digest) -> PathBuf {
        self.blobs_dir().join(digest.hex())
    }

    pub fn partial_path(&self, digest: &Digest) -> PathBuf {
        self.blobs_dir().join(format!("{}.partial", digest.hex()))
    }

    pub fn tmp_path(&self, digest: &Digest) -> PathBuf {
        self.blobs_dir().join(format!("{}.tmp", digest.hex()))
    }

    pub fn entry_path(&self, digest: &Digest) -> PathBuf {
        self.entries_dir().join(format!("{}.json", digest.hex()))
    }

    pub fn ref_path(&self, reference: &str) -> PathBuf {
        self.refs_dir().join(format!("{}.json", hash_key(reference)))
    }

    pub fn tag_list_path(&self, repository: &str) -> PathBuf {
        self.tags_dir().join(format!("{}.json", hash_key(repository)))
    }

    /// Creates the four top-level subtrees with owner-only permissions, if missing.
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [self.blobs_dir(), self.entries_dir(), self.refs_dir(), self.tags_dir()] {
            create_private_dir_all(&dir)?;
        }
        Ok(())
    }
}

fn hash_key(s: &str) -> String {
    let hashed = digest::digest(&digest::SHA256, s.as_bytes());
    data_encoding::HEXLOWER.encode(hashed.as_ref())
}

#[cfg(unix)]
pub fn create_private_dir_all(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::create_dir_all(path)?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o700))?;
    Ok(())
}

#[cfg(not(unix))]
pub fn create_private_dir_all(path: &Path) -> Result<()> {
    fs::create_dir_all(path)?;
    Ok(())
}

#[cfg(unix)]
fn tighten_file_permissions(f: &File) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    f.set_permissions(fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(not(unix))]
fn tighten_file_permissions(_f: &File) -> Result<()> {
    Ok(())
}

pub fn set_owner_only_permissions(f: &File) -> Result<()> {
    tighten_file_permissions(f)
}

/// Rejects symlinks and any non-regular file type at `path`, so that an attacker with
/// write access to the cache root cannot redirect a read into an arbitrary file. Returns
/// `Ok(None)` if nothing exists at `path` (a plain cache miss, not a safety violation).
pub fn safe_open_regular(path: &Path) -> Result<Option<File>> {
    let meta = match fs::symlink_metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if meta.file_type().is_symlink() {
        return Err(Error::Corrupt(format!(
            "refusing to follow symlink at {}",
            path.display()
        )));
    }
    if !meta.file_type().is_file() {
        return Err(Error::Corrupt(format!(
            "expected a regular file at {}",
            path.display()
        )));
    }
    match File::open(path) {
        Ok(f) => Ok(Some(f)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn paths_are_shaped_as_documented() {
        let layout = Layout::new(PathBuf::from("/cache"));
        let d = Digest::parse(
            "sha256:2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824",
        )
        .unwrap();
        assert_eq!(
            layout.blob_path(&d),
            PathBuf::from(
                "/cache/blobs/sha256/2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
            )
        );
        assert_eq!(
            layout.partial_path(&d).extension().unwrap(),
            "partial"
        );
        assert_eq!(layout.tmp_path(&d).extension().unwrap(), "tmp");
        assert!(layout.entry_path(&d).ends_with("entries/sha256/2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824.json"));
    }

    #[test]
    fn safe_open_regular_rejects_symlink() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("target");
        fs::write(&target, b"data").unwrap();
        let link = dir.path().join("link");
        #[cfg(unix)]
        std::os::unix::fs::symlink(&target, &link).unwrap();
        #[cfg(unix)]
        assert!(safe_open_regular(&link).is_err());
    }

    #[test]
    fn safe_open_regular_misses_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        assert!(safe_open_regular(&missing).unwrap().is_none());
    }

    #[test]
    fn safe_open_regular_rejects_directory() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("sub");
        fs::create_dir(&sub).unwrap();
        assert!(safe_open_regular(&sub).is_err());
    }
}
