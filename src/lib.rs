//! A local, disk-backed cache for OCI registry blobs: content-addressed storage with
//! resumable range-based downloads, lazy on-demand fetch, a streaming pass-through mode,
//! and TTL/LRU pruning with cross-index garbage collection.
//!
//! The cache consumes a single [`Registry`] abstraction (fetch-full, fetch-range,
//! list-tags) and exposes [`Handle`]s and streaming [`std::io::Read`]ers to callers.
//! Manifest/descriptor resolution, authentication, and archive layout are out of scope —
//! callers supply a [`Descriptor`] and a human-readable reference string per call.

mod cache;
mod cancel;
mod config;
mod digest;
mod entry;
mod error;
mod handle;
mod http_registry;
mod layout;
mod lazy;
mod prune;
pub mod range;
mod ref_index;
mod registry;
mod stream;
mod tag_index;
mod util;

pub use cache::Cache;
pub use cancel::Context;
pub use config::CacheConfig;
pub use digest::Digest;
pub use entry::{Entry, Timestamp};
pub use error::{Error, Result};
pub use handle::{FileHandle, Handle};
pub use http_registry::HttpRegistry;
pub use lazy::LazyHandle;
pub use prune::PruneStats;
pub use range::{self as ranges, Range, RangeSet};
pub use ref_index::RefEntry;
pub use registry::{Descriptor, FakeRegistry, RecordedRangeRequest, Registry};
pub use tag_index::TagListEntry;
