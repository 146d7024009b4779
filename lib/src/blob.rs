//! SHA-256 digests, blob descriptors, and blob producers.
//!
//! Everything a registry or cache addresses is a blob: an opaque byte
//! stream identified by the SHA-256 of its content.  A [`Blob`] is a
//! single-shot producer of such a stream; writing it out yields the
//! authoritative [`BlobDescriptor`] (size and digest of what was produced).

use std::fmt;
use std::io::{BufReader, Read, Write};
use std::{fs::File, io};

use camino::Utf8PathBuf;
use openssl::hash::{Hasher, MessageDigest};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::tar::TarBlob;

/// A decently large buffer, as used by e.g. coreutils `cat`.
/// System calls are expensive.
pub(crate) const BUF_CAPACITY: usize = 131072;

/// An error parsing a digest string.
#[derive(Debug, Error)]
pub enum DigestError {
    /// The algorithm prefix was not `sha256:`.
    #[error("unsupported digest algorithm in {0:?}; expected sha256")]
    UnsupportedAlgorithm(String),
    /// The hash portion was not 64 lowercase hex characters.
    #[error("invalid sha256 hash {0:?}; expected 64 lowercase hex characters")]
    InvalidHash(String),
}

/// A validated `sha256:<hex>` content digest.
///
/// The hash is always exactly 64 lowercase hex characters; equality and
/// hashing are over that canonical form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DescriptorDigest {
    hash: Box<str>,
}

impl DescriptorDigest {
    /// Parse from the prefixed form `sha256:<hex>`.
    pub fn from_digest(digest: &str) -> Result<Self, DigestError> {
        let hash = digest
            .strip_prefix("sha256:")
            .ok_or_else(|| DigestError::UnsupportedAlgorithm(digest.to_string()))?;
        Self::from_hash(hash)
    }

    /// Parse from a bare 64-character hex hash.
    pub fn from_hash(hash: &str) -> Result<Self, DigestError> {
        if hash.len() != 64 || !hash.bytes().all(|b| matches!(b, b'a'..=b'f' | b'0'..=b'9')) {
            return Err(DigestError::InvalidHash(hash.to_string()));
        }
        Ok(Self { hash: hash.into() })
    }

    /// The bare hex hash, without the algorithm prefix.
    pub fn hash(&self) -> &str {
        &self.hash
    }
}

impl fmt::Display for DescriptorDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sha256:{}", self.hash)
    }
}

impl Serialize for DescriptorDigest {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for DescriptorDigest {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_digest(&s).map_err(serde::de::Error::custom)
    }
}

/// Size and digest of a blob.  A negative size means "unknown".
///
/// Equality requires both sizes to be known: an unknown-size descriptor
/// compares unequal to everything, itself included.
#[derive(Debug, Clone)]
pub struct BlobDescriptor {
    size: i64,
    digest: DescriptorDigest,
}

impl BlobDescriptor {
    /// A descriptor with a known size.
    pub fn new(size: i64, digest: DescriptorDigest) -> Self {
        Self { size, digest }
    }

    /// A descriptor whose size is unknown.
    pub fn unknown_size(digest: DescriptorDigest) -> Self {
        Self { size: -1, digest }
    }

    /// The blob size in bytes, negative if unknown.
    pub fn size(&self) -> i64 {
        self.size
    }

    /// The blob digest.
    pub fn digest(&self) -> &DescriptorDigest {
        &self.digest
    }
}

impl PartialEq for BlobDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.size >= 0 && other.size >= 0 && self.size == other.size && self.digest == other.digest
    }
}

/// A writer wrapper computing a running SHA-256 and byte count.
///
/// Wrap any sink to learn the descriptor of whatever was written through;
/// wrap [`io::sink()`] to compute a descriptor while discarding the bytes.
pub struct DigestWriter<W: Write> {
    hash: Hasher,
    inner: W,
    size: u64,
}

impl<W: Write> DigestWriter<W> {
    /// Wrap `inner`.
    pub fn new(inner: W) -> io::Result<Self> {
        Ok(Self {
            hash: Hasher::new(MessageDigest::sha256())?,
            inner,
            size: 0,
        })
    }

    /// Finish hashing, returning the accumulated descriptor and the inner writer.
    pub fn finish(mut self) -> io::Result<(BlobDescriptor, W)> {
        let digest = hex::encode(self.hash.finish()?);
        let digest = DescriptorDigest::from_hash(&digest)
            .expect("sha256 output is 64 hex characters");
        Ok((BlobDescriptor::new(self.size as i64, digest), self.inner))
    }
}

impl<W: Write> Write for DigestWriter<W> {
    fn write(&mut self, srcbuf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(srcbuf)?;
        self.hash.update(&srcbuf[..n])?;
        self.size += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// A single-shot producer of blob bytes.
pub enum Blob {
    /// In-memory bytes.
    Bytes(Vec<u8>),
    /// Contents of a file.
    File(Utf8PathBuf),
    /// Bytes drained from an arbitrary reader.
    Stream(Box<dyn Read + Send>),
    /// A snapshotted tar stream; see [`crate::tar::TarStreamBuilder`].
    Tar(TarBlob),
}

impl Blob {
    /// A blob over the compact JSON serialization of `v`.
    pub fn from_json<S: Serialize>(v: &S) -> serde_json::Result<Self> {
        Ok(Self::Bytes(serde_json::to_vec(v)?))
    }

    /// Produce the bytes into `sink`, returning the authoritative descriptor.
    pub fn write_to<W: Write>(self, sink: W) -> io::Result<BlobDescriptor> {
        let mut out = DigestWriter::new(sink)?;
        match self {
            Blob::Bytes(b) => out.write_all(&b)?,
            Blob::File(path) => {
                let f = File::open(&path)?;
                let mut f = BufReader::with_capacity(BUF_CAPACITY, f);
                io::copy(&mut f, &mut out)?;
            }
            Blob::Stream(mut r) => {
                io::copy(&mut r, &mut out)?;
            }
            Blob::Tar(t) => t.write_entries(&mut out)?,
        }
        out.flush()?;
        let (descriptor, _) = out.finish()?;
        Ok(descriptor)
    }
}

impl fmt::Debug for Blob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Blob::Bytes(b) => f.debug_tuple("Bytes").field(&b.len()).finish(),
            Blob::File(p) => f.debug_tuple("File").field(p).finish(),
            Blob::Stream(_) => f.write_str("Stream(..)"),
            Blob::Tar(t) => f.debug_tuple("Tar").field(t).finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXAMPLE_DIGEST: &str =
        "sha256:8c662931926fa990b41da3c9f42663a537ccd498130030f9149173a0493832ad";

    #[test]
    fn test_digest_roundtrip() {
        let d = DescriptorDigest::from_digest(EXAMPLE_DIGEST).unwrap();
        assert_eq!(d.to_string(), EXAMPLE_DIGEST);
        let from_hash =
            DescriptorDigest::from_hash(EXAMPLE_DIGEST.strip_prefix("sha256:").unwrap()).unwrap();
        assert_eq!(d, from_hash);
    }

    #[test]
    fn test_digest_invalid() {
        for bad in [
            "",
            "sha256:",
            "sha256:xyz",
            // Uppercase hex is rejected
            "sha256:8C662931926FA990B41DA3C9F42663A537CCD498130030F9149173A0493832AD",
            // Too short
            "sha256:8c66",
            // Wrong algorithm
            "md5:8c662931926fa990b41da3c9f42663a537ccd498130030f9149173a0493832ad",
        ] {
            assert!(DescriptorDigest::from_digest(bad).is_err(), "{bad}");
        }
        assert!(DescriptorDigest::from_hash("8c66").is_err());
    }

    #[test]
    fn test_digest_serde() {
        let d = DescriptorDigest::from_digest(EXAMPLE_DIGEST).unwrap();
        let json = serde_json::to_string(&d).unwrap();
        assert_eq!(json, format!("\"{EXAMPLE_DIGEST}\""));
        let back: DescriptorDigest = serde_json::from_str(&json).unwrap();
        assert_eq!(d, back);
    }

    #[test]
    fn test_descriptor_equality() {
        let d = DescriptorDigest::from_digest(EXAMPLE_DIGEST).unwrap();
        let known = BlobDescriptor::new(42, d.clone());
        assert_eq!(known, known.clone());
        assert_ne!(known, BlobDescriptor::new(43, d.clone()));
        // Unknown size is never equal, not even to itself
        let unknown = BlobDescriptor::unknown_size(d);
        assert_ne!(unknown, unknown.clone());
        assert_ne!(unknown, known);
    }

    #[test]
    fn test_blob_write_matches_null_sink() {
        let payload = b"some blob content".to_vec();
        let mut buf = Vec::new();
        let written = Blob::Bytes(payload.clone()).write_to(&mut buf).unwrap();
        let discarded = Blob::Bytes(payload.clone()).write_to(io::sink()).unwrap();
        assert_eq!(written, discarded);
        assert_eq!(buf, payload);
        assert_eq!(written.size(), payload.len() as i64);
    }

    #[test]
    fn test_blob_stream() {
        let payload = b"streamed".to_vec();
        let via_stream = Blob::Stream(Box::new(io::Cursor::new(payload.clone())))
            .write_to(io::sink())
            .unwrap();
        let via_bytes = Blob::Bytes(payload).write_to(io::sink()).unwrap();
        assert_eq!(via_stream, via_bytes);
    }

    #[test]
    fn test_json_blob() {
        let blob = Blob::from_json(&serde_json::json!({"a": 1})).unwrap();
        let mut buf = Vec::new();
        blob.write_to(&mut buf).unwrap();
        assert_eq!(buf, br#"{"a":1}"#);
    }
}
