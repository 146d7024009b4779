//! Deterministic tar streams.
//!
//! Layer content must hash identically across builds, so the tar policy is
//! pinned: entries are written in insertion order, owner/group are `0/0`,
//! modification times default to the epoch, and modes default to `0644`
//! for files and `0755` for directories.  Parent directories of an entry
//! are emitted implicitly, exactly once.  In-archive paths are given as
//! absolute POSIX paths and stored without the leading slash, matching how
//! container layers are conventionally archived.

use std::collections::BTreeSet;
use std::fs::File;
use std::io::{self, BufReader, Write};
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use tar::{EntryType, Header};

use crate::blob::{Blob, BUF_CAPACITY};

const DEFAULT_FILE_MODE: u32 = 0o644;
const DEFAULT_DIR_MODE: u32 = 0o755;

/// Where an entry's bytes come from.
#[derive(Debug, Clone)]
enum TarEntrySource {
    /// A file on disk.
    File(Utf8PathBuf),
    /// In-memory bytes.
    Bytes(Arc<[u8]>),
    /// A directory (no content).
    Directory,
}

/// One entry of a tar stream: a source, an absolute in-archive path, and
/// the pinned header fields.
#[derive(Debug, Clone)]
pub struct TarEntry {
    source: TarEntrySource,
    target: Utf8PathBuf,
    mode: u32,
    mtime: u64,
}

impl TarEntry {
    /// An entry whose bytes come from `source` on disk.
    pub fn from_file(source: impl Into<Utf8PathBuf>, target: impl Into<Utf8PathBuf>) -> Self {
        Self {
            source: TarEntrySource::File(source.into()),
            target: target.into(),
            mode: DEFAULT_FILE_MODE,
            mtime: 0,
        }
    }

    /// An entry over in-memory bytes.
    pub fn from_bytes(bytes: Vec<u8>, target: impl Into<Utf8PathBuf>) -> Self {
        Self {
            source: TarEntrySource::Bytes(bytes.into()),
            target: target.into(),
            mode: DEFAULT_FILE_MODE,
            mtime: 0,
        }
    }

    /// A directory entry.
    pub fn directory(target: impl Into<Utf8PathBuf>) -> Self {
        Self {
            source: TarEntrySource::Directory,
            target: target.into(),
            mode: DEFAULT_DIR_MODE,
            mtime: 0,
        }
    }

    /// Override the permission bits.
    pub fn with_mode(mut self, mode: u32) -> Self {
        self.mode = mode;
        self
    }

    /// Override the modification time (seconds since the epoch).
    pub fn with_mtime(mut self, mtime: u64) -> Self {
        self.mtime = mtime;
        self
    }

    /// The absolute in-archive path.
    pub fn target(&self) -> &Utf8Path {
        &self.target
    }
}

/// Builds a deterministic tar stream from an ordered list of entries.
#[derive(Debug, Default)]
pub struct TarStreamBuilder {
    entries: Vec<TarEntry>,
}

impl TarStreamBuilder {
    /// A builder with no entries.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry.  The in-archive path must be absolute.
    pub fn add_entry(&mut self, entry: TarEntry) -> anyhow::Result<()> {
        if !entry.target.is_absolute() {
            anyhow::bail!("in-archive path {} is not absolute", entry.target);
        }
        self.entries.push(entry);
        Ok(())
    }

    /// Recursively append the contents of `source` under `target`, sorted
    /// by name at every level so the result is stable across filesystems.
    pub fn add_directory_contents(
        &mut self,
        source: &Utf8Path,
        target: &Utf8Path,
    ) -> anyhow::Result<()> {
        let mut names = Vec::new();
        for child in source.read_dir_utf8()? {
            names.push(child?.file_name().to_owned());
        }
        names.sort();
        for name in names {
            let child = source.join(&name);
            let child_target = target.join(&name);
            if child.is_dir() {
                self.add_entry(TarEntry::directory(&child_target))?;
                self.add_directory_contents(&child, &child_target)?;
            } else {
                self.add_entry(TarEntry::from_file(child, child_target))?;
            }
        }
        Ok(())
    }

    /// Snapshot the current entry list into a [`Blob`].  Later mutation of
    /// the builder does not affect the returned blob.
    pub fn to_blob(&self) -> Blob {
        Blob::Tar(TarBlob {
            entries: self.entries.clone().into(),
        })
    }
}

/// A snapshotted entry list, written out as a tar stream on demand.
#[derive(Debug, Clone)]
pub struct TarBlob {
    entries: Arc<[TarEntry]>,
}

impl TarBlob {
    pub(crate) fn write_entries<W: Write>(&self, out: W) -> io::Result<()> {
        let mut builder = tar::Builder::new(out);
        let mut written_dirs = BTreeSet::new();
        for entry in self.entries.iter() {
            let path = in_archive_path(&entry.target);
            match &entry.source {
                TarEntrySource::Directory => {
                    append_dir(&mut builder, &mut written_dirs, path, entry)?;
                }
                TarEntrySource::File(source) => {
                    append_parents(&mut builder, &mut written_dirs, path, entry.mtime)?;
                    let f = File::open(source.as_std_path())?;
                    let size = f.metadata()?.len();
                    let mut h = file_header(entry, size);
                    let mut f = BufReader::with_capacity(BUF_CAPACITY, f);
                    builder.append_data(&mut h, path, &mut f)?;
                }
                TarEntrySource::Bytes(bytes) => {
                    append_parents(&mut builder, &mut written_dirs, path, entry.mtime)?;
                    let mut h = file_header(entry, bytes.len() as u64);
                    builder.append_data(&mut h, path, &bytes[..])?;
                }
            }
        }
        builder.finish()
    }
}

/// Strip the leading slash; in-archive names are stored relative.
fn in_archive_path(target: &Utf8Path) -> &Utf8Path {
    target.strip_prefix("/").unwrap_or(target)
}

fn file_header(entry: &TarEntry, size: u64) -> Header {
    let mut h = Header::new_gnu();
    h.set_entry_type(EntryType::Regular);
    h.set_uid(0);
    h.set_gid(0);
    h.set_mode(entry.mode);
    h.set_mtime(entry.mtime);
    h.set_size(size);
    h
}

fn append_dir<W: Write>(
    builder: &mut tar::Builder<W>,
    written: &mut BTreeSet<Utf8PathBuf>,
    path: &Utf8Path,
    entry: &TarEntry,
) -> io::Result<()> {
    append_parents(builder, written, path, entry.mtime)?;
    if !written.insert(path.to_owned()) {
        return Ok(());
    }
    let mut h = Header::new_gnu();
    h.set_entry_type(EntryType::Directory);
    h.set_uid(0);
    h.set_gid(0);
    h.set_mode(entry.mode);
    h.set_mtime(entry.mtime);
    h.set_size(0);
    builder.append_data(&mut h, path, &mut io::empty())
}

/// Emit any not-yet-written ancestors of `path`, oldest first.
fn append_parents<W: Write>(
    builder: &mut tar::Builder<W>,
    written: &mut BTreeSet<Utf8PathBuf>,
    path: &Utf8Path,
    mtime: u64,
) -> io::Result<()> {
    let parents = {
        let mut parents: Vec<_> = path
            .ancestors()
            .skip(1)
            .filter(|p| !p.as_str().is_empty())
            .collect();
        parents.reverse();
        parents
    };
    for parent in parents {
        if !written.insert(parent.to_owned()) {
            continue;
        }
        let mut h = Header::new_gnu();
        h.set_entry_type(EntryType::Directory);
        h.set_uid(0);
        h.set_gid(0);
        h.set_mode(DEFAULT_DIR_MODE);
        h.set_mtime(mtime);
        h.set_size(0);
        builder.append_data(&mut h, parent, &mut io::empty())?;
    }
    Ok(())
}
