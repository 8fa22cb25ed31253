use std::collections::HashMap;
use std::io::{Cursor, Read};
use std::sync::Mutex;

use crate::cancel::Context;
use crate::digest::Digest;
use crate::error::{Error, Result};

/// The blob identity and size a caller asks the cache to resolve, mirroring the descriptor
/// an OCI manifest entry carries. Resolving a reference to a `Descriptor` is out of scope
/// here (an external collaborator's job); the cache only ever consumes one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Descriptor {
    pub digest: Digest,
    pub size: u64,
    pub media_type: String,
}

impl Descriptor {
    pub fn new(digest: Digest, size: u64, media_type: impl Into<String>) -> Descriptor {
        Descriptor {
            digest,
            size,
            media_type: media_type.into(),
        }
    }
}

/// The small capability set the cache needs from a registry client, each call cancellable
/// through `ctx`. Modeled as a trait rather than a concrete HTTP type, so tests substitute
/// `FakeRegistry` for a live network.
pub trait Registry: Send + Sync {
    /// Whole-blob fetch.
    fn fetch_blob(
        &self,
        ctx: &Context,
        reference: &str,
        desc: &Descriptor,
    ) -> Result<Box<dyn Read + Send>>;

    /// Byte subrange fetch; the returned stream yields the requested bytes or fewer, never
    /// more. Implementations that talk to a registry lacking range support must return
    /// `Error::RangeNotSupported` rather than silently serving the whole blob.
    fn fetch_blob_range(
        &self,
        ctx: &Context,
        reference: &str,
        desc: &Descriptor,
        offset: u64,
        length: u64,
    ) -> Result<Box<dyn Read + Send>>;

    fn list_tags(&self, ctx: &Context, repository: &str) -> Result<Vec<String>>;
}

/// A single range request observed by `FakeRegistry`, recorded for tests to assert on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordedRangeRequest {
    pub offset: u64,
    pub length: u64,
}

/// An in-memory stand-in for a registry, keyed by digest, used throughout the cache's own
/// test suite. Records every range request it serves so tests can assert exactly which
/// bytes were (and weren't) pulled over the network.
pub struct FakeRegistry {
    blobs: HashMap<String, Vec<u8>>,
    tags: HashMap<String, Vec<String>>,
    range_requests: Mutex<Vec<RecordedRangeRequest>>,
    supports_range: bool,
}

impl FakeRegistry {
    pub fn new() -> FakeRegistry {
        FakeRegistry {
            blobs: HashMap::new(),
            tags: HashMap::new(),
            range_requests: Mutex::new(Vec::new()),
            supports_range: true,
        }
    }

    pub fn without_range_support() -> FakeRegistry {
        FakeRegistry {
            supports_range: false,
            ..FakeRegistry::new()
        }
    }

    pub fn put_blob(&mut self, digest: &Digest, content: Vec<u8>) {
        self.blobs.insert(digest.as_str().to_string(), content);
    }

    pub fn put_tags(&mut self, repository: &str, tags: Vec<String>) {
        self.tags.insert(repository.to_string(), tags);
    }

    pub fn range_requests(&self) -> Vec<RecordedRangeRequest> {
        self.range_requests.lock().unwrap().clone()
    }

    fn blob_bytes(&self, digest: &Digest) -> Result<&Vec<u8>> {
        self.blobs.get(digest.as_str()).ok_or(Error::NotFound)
    }
}

impl Default for FakeRegistry {
    fn default() -> FakeRegistry {
        FakeRegistry::new()
    }
}

impl Registry for FakeRegistry {
    fn fetch_blob(
        &self,
        ctx: &Context,
        _reference: &str,
        desc: &Descriptor,
    ) -> Result<Box<dyn Read + Send>> {
        ctx.check()?;
        let bytes = self.blob_bytes(&desc.digest)?;
        Ok(Box::new(Cursor::new(bytes.clone())))
    }

    fn fetch_blob_range(
        &self,
        ctx: &Context,
        _reference: &str,
        desc: &Descriptor,
        offset: u64,
        length: u64,
    ) -> Result<Box<dyn Read + Send>> {
        ctx.check()?;
        if !self.supports_range {
            return Err(Error::RangeNotSupported);
        }
        let bytes = self.blob_bytes(&desc.digest)?;
        let start = offset.min(bytes.len() as u64) as usize;
        let end = offset.saturating_add(length).min(bytes.len() as u64) as usize;
        self.range_requests
            .lock()
            .unwrap()
            .push(RecordedRangeRequest { offset, length });
        Ok(Box::new(Cursor::new(bytes[start..end].to_vec())))
    }

    fn list_tags(&self, ctx: &Context, repository: &str) -> Result<Vec<String>> {
        ctx.check()?;
        self.tags.get(repository).cloned().ok_or(Error::NotFound)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn digest_of(bytes: &[u8]) -> Digest {
        Digest::from_sha256_bytes(ring::digest::digest(&ring::digest::SHA256, bytes).as_ref())
    }

    #[test]
    fn fetch_blob_returns_full_content() {
        let mut reg = FakeRegistry::new();
        let digest = digest_of(b"hello world");
        reg.put_blob(&digest, b"hello world".to_vec());
        let desc = Descriptor::new(digest, 11, "application/octet-stream");
        let mut out = Vec::new();
        reg.fetch_blob(&Context::background(), "ref", &desc)
            .unwrap()
            .read_to_end(&mut out)
            .unwrap();
        assert_eq!(out, b"hello world");
    }

    #[test]
    fn fetch_blob_range_records_request_and_slices() {
        let mut reg = FakeRegistry::new();
        let digest = digest_of(b"hello world");
        reg.put_blob(&digest, b"hello world".to_vec());
        let desc = Descriptor::new(digest, 11, "application/octet-stream");
        let mut out = Vec::new();
        reg.fetch_blob_range(&Context::background(), "ref", &desc, 6, 5)
            .unwrap()
            .read_to_end(&mut out)
            .unwrap();
        assert_eq!(out, b"world");
        assert_eq!(
            reg.range_requests(),
            vec![RecordedRangeRequest {
                offset: 6,
                length: 5
            }]
        );
    }

    #[test]
    fn range_unsupported_registry_errors() {
        let mut reg = FakeRegistry::without_range_support();
        let digest = digest_of(b"x");
        reg.put_blob(&digest, b"x".to_vec());
        let desc = Descriptor::new(digest, 1, "application/octet-stream");
        let err = match reg.fetch_blob_range(&Context::background(), "ref", &desc, 0, 1) {
            Err(e) => e,
            Ok(_) => panic!("expected error"),
        };
        assert!(matches!(err, Error::RangeNotSupported));
    }

    #[test]
    fn missing_blob_is_not_found() {
        let reg = FakeRegistry::new();
        let desc = Descriptor::new(digest_of(b"nope"), 4, "application/octet-stream");
        let err = match reg.fetch_blob(&Context::background(), "ref", &desc) {
            Err(e) => e,
            Ok(_) => panic!("expected error"),
        };
        assert!(matches!(err, Error::NotFound));
    }

    #[test]
    fn cancelled_context_short_circuits() {
        let reg = FakeRegistry::new();
        let ctx = Context::background();
        ctx.cancel();
        let desc = Descriptor::new(digest_of(b"x"), 1, "application/octet-stream");
        let err = match reg.fetch_blob(&ctx, "ref", &desc) {
            Err(e) => e,
            Ok(_) => panic!("expected error"),
        };
        assert!(matches!(err, Error::Cancelled));
    }
}
