//! Builds in-memory key indexes for data files, either by scanning the
//! data file itself or by decoding its hint sidecar. All live keys of a
//! directory must fit in memory.

use super::hint;
use super::record::Record;
use crate::error::Result;

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::io::BufReader;
use std::path::{Path, PathBuf};

/// An index entry for one key in one data file. Entries loaded from a hint
/// file have no tstamp or vsz, and only the low 16 bits of their hash are
/// meaningful.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct IndexEntry {
    /// Byte offset of the record header in the data file.
    pub datapos: u32,
    pub ver: i32,
    pub ksz: u32,
    pub hash: u32,
    pub tstamp: Option<i32>,
    /// Stored value size in bytes.
    pub vsz: Option<u32>,
}

/// Maps keys to their latest index entry.
pub type KeyIndex = BTreeMap<Vec<u8>, IndexEntry>;

/// The index of a single data file.
#[derive(Debug)]
pub struct FileIndex {
    pub path: PathBuf,
    /// The latest entry per key in this file.
    pub entries: KeyIndex,
    /// (key, ver) of records superseded by a later record for the same key
    /// within this file. Only populated by scans, and only when the
    /// versions differ.
    pub superseded: Vec<(Vec<u8>, i32)>,
}

impl FileIndex {
    /// An empty index for a file that could not be read. Contributes
    /// nothing to planning, so the file is never rewritten.
    pub fn empty(path: &Path) -> Self {
        Self { path: path.to_path_buf(), entries: KeyIndex::new(), superseded: Vec::new() }
    }

    /// Builds the index by scanning the data file. Scanning stops at the
    /// first invalid record, keeping the valid prefix.
    pub fn scan(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        let file_len = file.metadata()?.len();
        let mut r = BufReader::new(file);

        let mut entries = KeyIndex::new();
        let mut superseded = Vec::new();
        let mut pos = 0;
        while pos < file_len {
            let record = match Record::read_from(&mut r, pos, file_len) {
                Ok(Some(record)) => record,
                Ok(None) => break,
                Err(err) => {
                    log::error!("scan of {} stopped at offset {pos}: {err}", path.display());
                    break;
                }
            };
            pos += record.aligned_size();
            let entry = IndexEntry {
                datapos: record.datapos,
                ver: record.ver,
                ksz: record.key.len() as u32,
                hash: record.hash,
                tstamp: Some(record.tstamp),
                vsz: Some(record.value.len() as u32),
            };
            match entries.entry(record.key) {
                Entry::Occupied(mut o) => {
                    let old = o.insert(entry);
                    if old.ver != entry.ver {
                        superseded.push((o.key().clone(), old.ver));
                    }
                }
                Entry::Vacant(v) => {
                    v.insert(entry);
                }
            }
        }
        Ok(Self { path: path.to_path_buf(), entries, superseded })
    }

    /// Builds the index by decoding the data file's hint sidecar.
    pub fn from_hint(path: &Path) -> Result<Self> {
        let mut entries = KeyIndex::new();
        for entry in hint::read_hint_file(&hint::hint_path(path))? {
            let index_entry = IndexEntry {
                datapos: entry.datapos,
                ver: entry.ver,
                ksz: entry.key.len() as u32,
                hash: entry.hash as u32,
                tstamp: None,
                vsz: None,
            };
            entries.insert(entry.key, index_entry);
        }
        Ok(Self { path: path.to_path_buf(), entries, superseded: Vec::new() })
    }

    /// Loads the index from the hint file when allowed and present, falling
    /// back to a data file scan. Hint indexes lack timestamps, so callers
    /// applying an expiry policy must not allow hints.
    pub fn load(path: &Path, allow_hint: bool) -> Result<Self> {
        if allow_hint && hint::hint_path(path).is_file() {
            match Self::from_hint(path) {
                Ok(index) => return Ok(index),
                Err(err) => {
                    log::warn!("hint for {} unusable, rescanning: {err}", path.display());
                }
            }
        }
        Self::scan(path)
    }
}

/// Lists the data files in a directory, sorted by file name. The naming
/// convention makes lexicographic order the creation order.
pub fn data_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().is_some_and(|ext| ext == "data") && path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Merges per-file indexes into the live key set, in file order: a later
/// file's entry replaces an earlier file's, and tombstones remove the key.
pub fn live_index(indexes: &[FileIndex]) -> KeyIndex {
    let mut live = KeyIndex::new();
    for index in indexes {
        for (key, entry) in &index.entries {
            if entry.ver < 0 {
                live.remove(key);
            } else {
                live.insert(key.clone(), *entry);
            }
        }
    }
    live
}
