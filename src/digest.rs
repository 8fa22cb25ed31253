use std::fmt;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Error, Result};

const SHA256_HEX_LEN: usize = 64;

/// A content digest of the form `sha256:` followed by 64 lowercase hex characters.
///
/// Equality (and the `Hash` impl used for map keys) is on the literal string: the prefix
/// and hex digits must match exactly, including case.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest(String);

impl Digest {
    /// Parses a digest string, rejecting anything that isn't `sha256:` + 64 lower-hex.
    pub fn parse(s: &str) -> Result<Digest> {
        let hex = s
            .strip_prefix("sha256:")
            .ok_or_else(|| Error::InvalidRef(format!("unsupported digest algorithm: {s}")))?;
        if hex.len() != SHA256_HEX_LEN {
            return Err(Error::InvalidRef(format!("bad digest length: {s}")));
        }
        if !hex.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b)) {
            return Err(Error::InvalidRef(format!("bad digest hex: {s}")));
        }
        Ok(Digest(s.to_string()))
    }

    /// Builds a digest from already-verified raw SHA-256 bytes, as produced by
    /// `ring::digest::digest(&ring::digest::SHA256, ...)`.
    pub fn from_sha256_bytes(raw: &[u8]) -> Digest {
        Digest(format!("sha256:{}", data_encoding::HEXLOWER.encode(raw)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The bare 64-hex part, used to build on-disk paths.
    pub fn hex(&self) -> &str {
        &self.0["sha256:".len()..]
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// Digests are persisted as their plain string form; deserializing re-validates through
// `parse` so a hand-edited or corrupted document can never produce an ill-formed `Digest`.
impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Digest, D::Error> {
        let s = String::deserialize(deserializer)?;
        Digest::parse(&s).map_err(D::Error::custom)
    }
}
