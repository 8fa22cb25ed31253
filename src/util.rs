use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Error, Result};
use crate::layout::{safe_open_regular, set_owner_only_permissions};

/// Writes `value` as JSON to `path` atomically: serialize into a temp file in the same
/// directory, fsync, then rename over `path`. The temp file is removed if anything before
/// the rename fails.
pub fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let dir = path.parent().expect("cache paths always have a parent");
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    serde_json::to_writer_pretty(tmp.as_file_mut(), value)?;
    tmp.as_file_mut().sync_all()?;
    set_owner_only_permissions(tmp.as_file())?;
    tmp.persist(path).map_err(|e| Error::Io(e.error))?;
    Ok(())
}

/// Loads JSON from `path`. Returns `Ok(None)` on a plain cache miss (no file); a file that
/// exists but fails the symlink/regular-file safety check or fails to parse is reported as
/// `Error::Corrupt`, which callers treat as "evict and refetch" rather than "not found".
pub fn load_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let file = match safe_open_regular(path)? {
        Some(f) => f,
        None => return Ok(None),
    };
    match serde_json::from_reader(file) {
        Ok(value) => Ok(Some(value)),
        Err(e) => Err(Error::Corrupt(format!(
            "malformed document at {}: {e}",
            path.display()
        ))),
    }
}

/// A `Read` adapter that stops after `limit` bytes even if the underlying reader would
/// yield more, so resume/lazy range fetches can't be tricked into overrunning the caller's
/// buffer by a registry that ignores the requested range length.
pub struct LimitedReader<R> {
    inner: R,
    remaining: u64,
}

impl<R: Read> LimitedReader<R> {
    pub fn new(inner: R, limit: u64) -> LimitedReader<R> {
        LimitedReader {
            inner,
            remaining: limit,
        }
    }
}

impl<R: Read> Read for LimitedReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining == 0 {
            return Ok(0);
        }
        let max = std::cmp::min(buf.len() as u64, self.remaining) as usize;
        let n = self.inner.read(&mut buf[..max])?;
        self.remaining -= n as u64;
        Ok(n)
    }
}

/// Copies exactly `length` bytes from `src` to `dst`, erroring if the source runs dry
/// first. Used for resume and lazy range fetches where a short read from the registry
/// indicates a truncated or corrupt response.
pub fn copy_exact<R: Read, W: Write>(src: &mut R, dst: &mut W, length: u64) -> Result<()> {
    let mut limited = LimitedReader::new(src, length);
    let copied = io::copy(&mut limited, dst)?;
    if copied != length {
        return Err(Error::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("expected {length} bytes, got {copied}"),
        )));
    }
    Ok(())
}

/// Opens (creating if necessary) a sparse file of exactly `size` bytes for read+write, used
/// for both the streaming-tee temp file backing and the lazy handle's `.partial` file.
pub fn open_sized_rw(path: &Path, size: u64) -> Result<File> {
    let file = File::options()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?;
    set_owner_only_permissions(&file)?;
    if file.metadata()?.len() != size {
        file.set_len(size)?;
    }
    Ok(file)
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Cursor;
    use std::io::Seek;

    #[test]
    fn json_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.json");
        atomic_write_json(&path, &vec![1, 2, 3]).unwrap();
        let loaded: Option<Vec<i32>> = load_json(&path).unwrap();
        assert_eq!(loaded, Some(vec![1, 2, 3]));
    }

    #[test]
    fn load_json_missing_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nope.json");
        let loaded: Option<Vec<i32>> = load_json(&path).unwrap();
        assert_eq!(loaded, None);
    }

    #[test]
    fn load_json_malformed_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, b"not json").unwrap();
        let err = load_json::<Vec<i32>>(&path).unwrap_err();
        assert!(matches!(err, Error::Corrupt(_)));
    }

    #[test]
    fn limited_reader_stops_at_limit() {
        let data = b"0123456789";
        let mut limited = LimitedReader::new(Cursor::new(data), 4);
        let mut buf = Vec::new();
        limited.read_to_end(&mut buf).unwrap();
        assert_eq!(buf, b"0123");
    }

    #[test]
    fn copy_exact_errors_on_short_source() {
        let mut src = Cursor::new(b"abc".to_vec());
        let mut dst = Vec::new();
        assert!(copy_exact(&mut src, &mut dst, 10).is_err());
    }

    #[test]
    fn open_sized_rw_truncates_to_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial");
        {
            let f = open_sized_rw(&path, 100).unwrap();
            assert_eq!(f.metadata().unwrap().len(), 100);
        }
        {
            let mut f = open_sized_rw(&path, 100).unwrap();
            f.seek(std::io::SeekFrom::Start(0)).unwrap();
            f.write_all(b"hi").unwrap();
        }
        let f = open_sized_rw(&path, 100).unwrap();
        assert_eq!(f.metadata().unwrap().len(), 100);
    }
}
