//! The content-addressed layer cache.
//!
//! On disk a cache is a directory holding one subdirectory per compressed
//! layer digest (`<hex>/<hex>.tar.gz`) plus a `cache.json` metadata index.
//! A digest directory counts as present only if it is indexed; stray
//! directories left by an interrupted writer are ignored.  Both the layer
//! file and the index are written temp-then-rename, so a crash can never
//! leave the index pointing at a missing file.
//!
//! Base layers are keyed by their compressed digest; application layers
//! (dependencies, resources, classes) are keyed by `(kind, source files)`
//! with a `(path, size, mtime)` fingerprint deciding staleness.

use std::fs::File;
use std::io::{self, Seek, Write};
use std::time::UNIX_EPOCH;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use rustix::fs::FlockOperation;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::blob::{Blob, BlobDescriptor, DescriptorDigest, DigestWriter};
use crate::image::CachedLayer;

const METADATA_FILENAME: &str = "cache.json";
const LOCK_FILENAME: &str = "cache.lock";

/// A failed cache operation.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// `cache.json` exists but cannot be parsed.  No repair is attempted;
    /// the user must clear the cache directory.
    #[error("cache metadata at {path} is corrupted (clear the cache directory): {source}")]
    MetadataCorrupted {
        /// Path of the unparseable index.
        path: Utf8PathBuf,
        /// The underlying parse failure.
        #[source]
        source: serde_json::Error,
    },
    /// The configured cache root exists but is not a directory.
    #[error("cache root {0} is not a directory")]
    NotADirectory(Utf8PathBuf),
    /// A cache path was not valid UTF-8.
    #[error("non UTF-8 path in cache: {0}")]
    NonUtf8Path(String),
    /// An underlying I/O failure.
    #[error(transparent)]
    Io(#[from] io::Error),
    /// Metadata serialization failure.
    #[error("serializing cache metadata: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Which build input a cached layer came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LayerKind {
    /// A layer of the base image.
    Base,
    /// The application dependency archives.
    Dependencies,
    /// The application resources.
    Resources,
    /// The compiled application classes.
    Classes,
}

impl LayerKind {
    /// The stable lowercase name, used in logs and timer labels.
    pub fn as_str(&self) -> &'static str {
        match self {
            LayerKind::Base => "base",
            LayerKind::Dependencies => "dependencies",
            LayerKind::Resources => "resources",
            LayerKind::Classes => "classes",
        }
    }
}

/// One indexed layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LayerMetadata {
    kind: LayerKind,
    digest: DescriptorDigest,
    diff_id: DescriptorDigest,
    size: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    source_files: Option<Vec<Utf8PathBuf>>,
    last_modified: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    source_fingerprint: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct CacheMetadata {
    layers: Vec<LayerMetadata>,
}

/// A layer cache rooted at one directory.
///
/// The value is cheap to clone; all state lives on disk.  Metadata reads
/// and read-modify-write updates happen under an exclusive advisory lock
/// on a sentinel file, held as briefly as possible.
#[derive(Debug, Clone)]
pub struct Cache {
    root: Utf8PathBuf,
}

impl Cache {
    /// Open (creating if needed) the cache at `root` and verify its index
    /// is loadable.
    pub fn init(root: &Utf8Path) -> Result<Self, CacheError> {
        std::fs::create_dir_all(root)?;
        if !root.is_dir() {
            return Err(CacheError::NotADirectory(root.to_owned()));
        }
        let cache = Self {
            root: root.to_owned(),
        };
        cache.with_lock(|| {
            let metadata_path = cache.metadata_path();
            if !metadata_path.exists() {
                cache.persist_metadata(&CacheMetadata::default())?;
            } else {
                cache.load_metadata()?;
            }
            Ok(())
        })?;
        Ok(cache)
    }

    /// The cache root directory.
    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    /// Store a layer whose blob produces *compressed* (`.tar.gz`) bytes.
    /// The diff-id is recovered by a decompression pass over the stored
    /// file before the layer is indexed.
    pub fn write_compressed(
        &self,
        kind: LayerKind,
        blob: Blob,
    ) -> Result<CachedLayer, CacheError> {
        let temp = tempfile::NamedTempFile::new_in(&self.root)?;
        let descriptor = blob.write_to(temp.as_file())?;
        temp.as_file().sync_all()?;
        let diff_id = uncompressed_digest(temp.as_file())?;
        self.commit(kind, None, None, temp, descriptor, diff_id)
    }

    /// Store an application layer whose blob produces *uncompressed* tar
    /// bytes; the writer gzips them on the way to disk and derives both
    /// digests in a single pass.
    pub fn write_uncompressed(
        &self,
        kind: LayerKind,
        source_files: &[Utf8PathBuf],
        blob: Blob,
    ) -> Result<CachedLayer, CacheError> {
        let fingerprint = source_fingerprint(source_files)?;
        let temp = tempfile::NamedTempFile::new_in(&self.root)?;
        let compressed = DigestWriter::new(temp.as_file())?;
        let mut encoder = GzEncoder::new(compressed, Compression::default());
        let uncompressed = blob.write_to(&mut encoder)?;
        let compressed = encoder.finish()?;
        let (descriptor, _) = compressed.finish()?;
        temp.as_file().sync_all()?;
        let diff_id = uncompressed.digest().clone();
        self.commit(
            kind,
            Some(sorted_paths(source_files)),
            Some(fingerprint),
            temp,
            descriptor,
            diff_id,
        )
    }

    /// Look up a layer by compressed digest.  Returns the layer only if
    /// it is indexed *and* its file still exists.
    pub fn get_layer(
        &self,
        digest: &DescriptorDigest,
    ) -> Result<Option<CachedLayer>, CacheError> {
        let metadata = self.with_lock(|| self.load_metadata())?;
        let found = metadata
            .layers
            .iter()
            .rev()
            .find(|l| &l.digest == digest);
        Ok(found.and_then(|l| self.to_cached_layer(l)))
    }

    /// Whether the sources for `(kind, source_files)` changed since the
    /// newest matching cache entry was written.  No entry counts as
    /// modified.
    pub fn are_source_files_modified(
        &self,
        kind: LayerKind,
        source_files: &[Utf8PathBuf],
    ) -> Result<bool, CacheError> {
        let current = source_fingerprint(source_files)?;
        let metadata = self.with_lock(|| self.load_metadata())?;
        match newest_for_sources(&metadata, kind, source_files) {
            Some(entry) => Ok(entry.source_fingerprint.as_deref() != Some(current.as_str())),
            None => Ok(true),
        }
    }

    /// The newest cached layer for `(kind, source_files)`, if any.
    pub fn get_layer_for_sources(
        &self,
        kind: LayerKind,
        source_files: &[Utf8PathBuf],
    ) -> Result<Option<CachedLayer>, CacheError> {
        let metadata = self.with_lock(|| self.load_metadata())?;
        let found = newest_for_sources(&metadata, kind, source_files);
        Ok(found.and_then(|l| self.to_cached_layer(l)))
    }

    /// The on-disk `.tar.gz` of the newest layer for `(kind, source_files)`.
    pub fn get_layer_file(
        &self,
        kind: LayerKind,
        source_files: &[Utf8PathBuf],
    ) -> Result<Option<Utf8PathBuf>, CacheError> {
        Ok(self
            .get_layer_for_sources(kind, source_files)?
            .map(|l| l.content_file().to_owned()))
    }

    fn layer_path(&self, digest: &DescriptorDigest) -> Utf8PathBuf {
        self.root
            .join(digest.hash())
            .join(format!("{}.tar.gz", digest.hash()))
    }

    fn metadata_path(&self) -> Utf8PathBuf {
        self.root.join(METADATA_FILENAME)
    }

    fn to_cached_layer(&self, metadata: &LayerMetadata) -> Option<CachedLayer> {
        let path = self.layer_path(&metadata.digest);
        if !path.exists() {
            return None;
        }
        Some(CachedLayer::new(
            path,
            BlobDescriptor::new(metadata.size, metadata.digest.clone()),
            metadata.diff_id.clone(),
        ))
    }

    /// Move the finished temp file into place, then index it.
    fn commit(
        &self,
        kind: LayerKind,
        source_files: Option<Vec<Utf8PathBuf>>,
        source_fingerprint: Option<String>,
        temp: tempfile::NamedTempFile,
        descriptor: BlobDescriptor,
        diff_id: DescriptorDigest,
    ) -> Result<CachedLayer, CacheError> {
        let path = self.layer_path(descriptor.digest());
        let digest_dir = path.parent().expect("layer path has a parent");
        std::fs::create_dir_all(digest_dir)?;
        temp.persist(&path).map_err(|e| e.error)?;
        debug!(layer = %descriptor.digest(), kind = kind.as_str(), "cached layer");

        let entry = LayerMetadata {
            kind,
            digest: descriptor.digest().clone(),
            diff_id: diff_id.clone(),
            size: descriptor.size(),
            source_files,
            last_modified: Utc::now(),
            source_fingerprint,
        };
        self.with_lock(|| {
            let mut metadata = self.load_metadata()?;
            metadata.layers.push(entry.clone());
            self.persist_metadata(&metadata)
        })?;
        Ok(CachedLayer::new(path, descriptor, diff_id))
    }

    fn load_metadata(&self) -> Result<CacheMetadata, CacheError> {
        let path = self.metadata_path();
        let contents = match std::fs::read(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(CacheMetadata::default()),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&contents)
            .map_err(|source| CacheError::MetadataCorrupted { path, source })
    }

    /// Rewrite `cache.json` atomically (write to temp, then rename).
    fn persist_metadata(&self, metadata: &CacheMetadata) -> Result<(), CacheError> {
        let mut temp = tempfile::NamedTempFile::new_in(&self.root)?;
        serde_json::to_writer(&mut temp, metadata)?;
        temp.as_file().sync_all()?;
        temp.persist(self.metadata_path()).map_err(|e| e.error)?;
        Ok(())
    }

    /// Run `f` holding the exclusive advisory lock on the sentinel file.
    /// The lock is released when the file handle drops.
    fn with_lock<T>(
        &self,
        f: impl FnOnce() -> Result<T, CacheError>,
    ) -> Result<T, CacheError> {
        let lock_file = File::create(self.root.join(LOCK_FILENAME))?;
        rustix::fs::flock(&lock_file, FlockOperation::LockExclusive)
            .map_err(io::Error::from)?;
        f()
    }
}

fn newest_for_sources<'a>(
    metadata: &'a CacheMetadata,
    kind: LayerKind,
    source_files: &[Utf8PathBuf],
) -> Option<&'a LayerMetadata> {
    let wanted = sorted_paths(source_files);
    metadata
        .layers
        .iter()
        .enumerate()
        .filter(|(_, l)| l.kind == kind && l.source_files.as_deref() == Some(wanted.as_slice()))
        // Newest last-modified time wins; insertion order breaks ties
        .max_by_key(|(i, l)| (l.last_modified, *i))
        .map(|(_, l)| l)
}

fn sorted_paths(paths: &[Utf8PathBuf]) -> Vec<Utf8PathBuf> {
    let mut sorted = paths.to_vec();
    sorted.sort();
    sorted
}

/// Digest of the decompressed contents of an on-disk `.tar.gz`.
fn uncompressed_digest(file: &File) -> Result<DescriptorDigest, CacheError> {
    let mut file = file.try_clone()?;
    file.seek(io::SeekFrom::Start(0))?;
    let mut decoder = GzDecoder::new(io::BufReader::new(file));
    let mut out = DigestWriter::new(io::sink())?;
    io::copy(&mut decoder, &mut out)?;
    let (descriptor, _) = out.finish()?;
    Ok(descriptor.digest().clone())
}

/// The ordered `(path, size, mtime)` fingerprint over every file reachable
/// from `source_files`, reduced to a hex digest.
pub fn source_fingerprint(source_files: &[Utf8PathBuf]) -> Result<String, CacheError> {
    let mut records = Vec::new();
    for root in sorted_paths(source_files) {
        collect_fingerprint_records(&root, &mut records)?;
    }
    let mut out = DigestWriter::new(io::sink())?;
    for (path, size, mtime) in records {
        // A stable, unambiguous framing of each record
        write!(out, "{path}\0{size}\0{mtime}\n")?;
    }
    let (descriptor, _) = out.finish()?;
    Ok(descriptor.digest().hash().to_string())
}

fn collect_fingerprint_records(
    path: &Utf8Path,
    records: &mut Vec<(Utf8PathBuf, u64, u128)>,
) -> Result<(), CacheError> {
    let metadata = std::fs::metadata(path)?;
    let mtime = metadata
        .modified()?
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    let size = if metadata.is_dir() { 0 } else { metadata.len() };
    records.push((path.to_owned(), size, mtime));
    if metadata.is_dir() {
        let mut children = Vec::new();
        for child in path.read_dir_utf8()? {
            children.push(child?.path().to_owned());
        }
        children.sort();
        for child in children {
            collect_fingerprint_records(&child, records)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use super::*;

    fn tempcache() -> (tempfile::TempDir, Cache) {
        let td = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(td.path()).unwrap().to_owned();
        let cache = Cache::init(&root).unwrap();
        (td, cache)
    }

    fn gzip(bytes: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(bytes).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn test_init_creates_metadata() {
        let (_td, cache) = tempcache();
        assert!(cache.metadata_path().exists());
        // Re-init over an existing cache is fine
        Cache::init(cache.root()).unwrap();
    }

    #[test]
    fn test_init_rejects_corrupt_metadata() {
        let (_td, cache) = tempcache();
        std::fs::write(cache.metadata_path(), b"{not json").unwrap();
        let err = Cache::init(cache.root()).unwrap_err();
        assert!(matches!(err, CacheError::MetadataCorrupted { .. }), "{err}");
    }

    #[test]
    fn test_write_compressed_and_lookup() {
        let (_td, cache) = tempcache();
        let content = b"base layer tar bytes";
        let layer = cache
            .write_compressed(LayerKind::Base, Blob::Bytes(gzip(content)))
            .unwrap();
        assert!(layer.content_file().exists());

        // diff-id is the digest of the *uncompressed* bytes
        let expected_diff = Blob::Bytes(content.to_vec())
            .write_to(io::sink())
            .unwrap();
        assert_eq!(layer.diff_id(), expected_diff.digest());

        let found = cache.get_layer(layer.descriptor().digest()).unwrap().unwrap();
        assert_eq!(&found, &layer);

        let other = DescriptorDigest::from_hash(&"ab".repeat(32)).unwrap();
        assert!(cache.get_layer(&other).unwrap().is_none());
    }

    #[test]
    fn test_indexed_but_missing_file_is_absent() {
        let (_td, cache) = tempcache();
        let layer = cache
            .write_compressed(LayerKind::Base, Blob::Bytes(gzip(b"x")))
            .unwrap();
        std::fs::remove_file(layer.content_file()).unwrap();
        assert!(cache
            .get_layer(layer.descriptor().digest())
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_write_uncompressed_roundtrip() {
        let (_td, cache) = tempcache();
        let td = tempfile::tempdir().unwrap();
        let src = Utf8Path::from_path(td.path()).unwrap().to_owned();
        std::fs::write(src.join("a.txt"), b"a").unwrap();
        let sources = vec![src.clone()];

        let content = b"uncompressed tar stream".to_vec();
        let layer = cache
            .write_uncompressed(
                LayerKind::Resources,
                &sources,
                Blob::Bytes(content.clone()),
            )
            .unwrap();

        // The stored file decompresses back to the original bytes
        let mut decoder = GzDecoder::new(File::open(layer.content_file()).unwrap());
        let mut back = Vec::new();
        decoder.read_to_end(&mut back).unwrap();
        assert_eq!(back, content);

        // And the diff-id matches those bytes
        let expected = Blob::Bytes(content).write_to(io::sink()).unwrap();
        assert_eq!(layer.diff_id(), expected.digest());
        // While the descriptor matches the compressed file
        assert_eq!(
            layer.descriptor().size(),
            layer.content_file().metadata().unwrap().len() as i64
        );
    }

    #[test]
    fn test_source_files_fingerprinting() {
        let (_td, cache) = tempcache();
        let td = tempfile::tempdir().unwrap();
        let src = Utf8Path::from_path(td.path()).unwrap().to_owned();
        std::fs::write(src.join("a.txt"), b"aaa").unwrap();
        std::fs::write(src.join("b.txt"), b"bbb").unwrap();
        let sources = vec![src.clone()];

        // Nothing cached yet: counts as modified
        assert!(cache
            .are_source_files_modified(LayerKind::Resources, &sources)
            .unwrap());

        cache
            .write_uncompressed(LayerKind::Resources, &sources, Blob::Bytes(b"tar".to_vec()))
            .unwrap();
        assert!(!cache
            .are_source_files_modified(LayerKind::Resources, &sources)
            .unwrap());
        // Same sources under a different kind are still unknown
        assert!(cache
            .are_source_files_modified(LayerKind::Classes, &sources)
            .unwrap());

        // Changing a file's size invalidates the fingerprint
        std::fs::write(src.join("b.txt"), b"bbbb").unwrap();
        assert!(cache
            .are_source_files_modified(LayerKind::Resources, &sources)
            .unwrap());
    }

    #[test]
    fn test_newest_entry_wins() {
        let (_td, cache) = tempcache();
        let td = tempfile::tempdir().unwrap();
        let src = Utf8Path::from_path(td.path()).unwrap().to_owned();
        std::fs::write(src.join("a.txt"), b"a").unwrap();
        let sources = vec![src.clone()];

        cache
            .write_uncompressed(LayerKind::Classes, &sources, Blob::Bytes(b"one".to_vec()))
            .unwrap();
        let second = cache
            .write_uncompressed(LayerKind::Classes, &sources, Blob::Bytes(b"two".to_vec()))
            .unwrap();

        let file = cache
            .get_layer_file(LayerKind::Classes, &sources)
            .unwrap()
            .unwrap();
        assert_eq!(&file, second.content_file());
    }
}
