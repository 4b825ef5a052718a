//! Offline compaction of data files. The planner scans per-file indexes in
//! file order and decides which record occurrences are obsolete
//! (superseded by a later write, tombstoned, or expired); the compactor
//! then rewrites each affected file by streaming its records past the drop
//! set into a temp file, rebuilds the hint sidecar, and atomically renames
//! both into place. Files are never modified in place, and a failed
//! rewrite leaves the original untouched.

use super::expiry::ExpiryPolicy;
use super::hint::{self, HintEntry};
use super::index::{self, FileIndex};
use super::record::Record;
use crate::error::Result;
use crate::errdata;

use fs4::fs_std::FileExt;
use itertools::{EitherOrBoth, Itertools};
use std::collections::{BTreeSet, HashMap};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

/// Why a record occurrence is dropped during compaction.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum DropReason {
    /// A later write or a tombstone made this occurrence obsolete, or it is
    /// itself a tombstone with nothing left to shadow.
    Superseded,
    /// The expiry policy aged this record out.
    Expired,
}

/// A record occurrence: file tag (index into the sorted file list), key,
/// and version.
pub type DropKey = (usize, Vec<u8>, i32);

/// A compaction plan: the occurrences to drop and the files that need
/// rewriting.
#[derive(Debug, Default)]
pub struct Plan {
    pub drops: HashMap<DropKey, DropReason>,
    pub rewrite: BTreeSet<usize>,
}

impl Plan {
    fn drop_record(&mut self, tag: usize, key: &[u8], ver: i32, reason: DropReason) {
        self.drops.insert((tag, key.to_vec(), ver), reason);
        self.rewrite.insert(tag);
    }
}

/// Plans a compaction across per-file indexes, given in ascending file
/// order. File order is the version order for cross-file conflicts: a
/// key's occurrence in a later file supersedes any earlier occurrence
/// regardless of version numbers.
pub fn plan(indexes: &[FileIndex], policy: Option<&ExpiryPolicy>, now: i64) -> Plan {
    let mut plan = Plan::default();
    // The latest occurrence of each key seen so far, as (tag, ver).
    let mut latest: HashMap<&[u8], (usize, i32)> = HashMap::new();

    for (tag, index) in indexes.iter().enumerate() {
        for (key, ver) in &index.superseded {
            plan.drop_record(tag, key, *ver, DropReason::Superseded);
        }
        for (key, entry) in &index.entries {
            if let Some(&(old_tag, old_ver)) = latest.get(key.as_slice()) {
                plan.drop_record(old_tag, key, old_ver, DropReason::Superseded);
            } else if entry.ver < 0 {
                // A tombstone with nothing to shadow deletes itself.
                plan.drop_record(tag, key, entry.ver, DropReason::Superseded);
            } else if let (Some(policy), Some(tstamp), Some(vsz)) =
                (policy, entry.tstamp, entry.vsz)
            {
                if policy.expired(tstamp, vsz, now) {
                    plan.drop_record(tag, key, entry.ver, DropReason::Expired);
                }
            }
            latest.insert(key.as_slice(), (tag, entry.ver));
        }
    }
    plan
}

/// Compaction run totals.
#[derive(Debug, Default, PartialEq)]
pub struct CompactStats {
    /// Files rewritten.
    pub rewritten: usize,
    /// Files whose rewrite or scan failed; their data is untouched.
    pub failed: usize,
    /// Records written through to rewritten files.
    pub kept: u64,
    /// Records dropped as superseded or tombstoned.
    pub deleted: u64,
    /// Records dropped by the expiry policy.
    pub expired: u64,
}

/// Compacts all data files in a directory. Per-file failures are logged
/// and counted; the run continues with the remaining files. When an expiry
/// policy is given, indexes are always built by scanning, since hint files
/// carry no timestamps.
pub fn compact(dir: &Path, policy: Option<&ExpiryPolicy>, now: i64) -> Result<CompactStats> {
    let files = index::data_files(dir)?;
    let mut stats = CompactStats::default();

    let mut indexes = Vec::with_capacity(files.len());
    for path in &files {
        match FileIndex::load(path, policy.is_none()) {
            Ok(idx) => indexes.push(idx),
            Err(err) => {
                log::error!("indexing {} failed, skipping: {err}", path.display());
                stats.failed += 1;
                indexes.push(FileIndex::empty(path));
            }
        }
    }

    let plan = plan(&indexes, policy, now);
    for &tag in &plan.rewrite {
        match rewrite_file(&files[tag], tag, &plan.drops) {
            Ok((kept, deleted, expired)) => {
                log::debug!(
                    "rewrote {}: {kept} kept, {deleted} deleted, {expired} expired",
                    files[tag].display()
                );
                stats.rewritten += 1;
                stats.kept += kept;
                stats.deleted += deleted;
                stats.expired += expired;
            }
            Err(err) => {
                log::error!("compacting {} failed: {err}", files[tag].display());
                stats.failed += 1;
            }
        }
    }

    log::info!(
        "compacted {} of {} files: {} records kept, {} deleted, {} expired, {} failures",
        stats.rewritten,
        files.len(),
        stats.kept,
        stats.deleted,
        stats.expired,
        stats.failed
    );
    Ok(stats)
}

/// Appends .tmp to a path, for rewrite staging files.
fn tmp_path(path: &Path) -> PathBuf {
    let mut s = path.as_os_str().to_os_string();
    s.push(".tmp");
    PathBuf::from(s)
}

/// Rewrites one data file, dropping the occurrences planned for it, and
/// replaces its hint file. Both temp files are fully written before either
/// rename, and the hint is renamed after the data so it is never newer.
/// Returns (kept, deleted, expired) record counts.
fn rewrite_file(
    path: &Path,
    tag: usize,
    drops: &HashMap<DropKey, DropReason>,
) -> Result<(u64, u64, u64)> {
    let file = std::fs::OpenOptions::new().read(true).write(true).open(path)?;
    file.try_lock_exclusive()?;
    let file_len = file.metadata()?.len();
    let mut reader = BufReader::new(&file);

    let data_tmp = tmp_path(path);
    let out = std::fs::OpenOptions::new().write(true).create(true).truncate(true).open(&data_tmp)?;
    let mut writer = BufWriter::new(&out);

    let mut hints = Vec::new();
    let (mut kept, mut deleted, mut expired) = (0u64, 0u64, 0u64);
    let (mut pos, mut out_pos) = (0u64, 0u64);
    while pos < file_len {
        // A zero crc ends the valid prefix and the rest is dropped, but a
        // read error aborts the rewrite before any rename: the original
        // stays untouched and the temp files remain for a retry.
        let Some(record) = Record::read_from(&mut reader, pos, file_len)? else { break };
        pos += record.aligned_size();
        match drops.get(&(tag, record.key.clone(), record.ver)) {
            Some(DropReason::Superseded) => deleted += 1,
            Some(DropReason::Expired) => expired += 1,
            None => {
                let size = record.write_to(&mut writer)?;
                hints.push(HintEntry {
                    datapos: out_pos as u32,
                    ver: record.ver,
                    hash: (record.hash & 0xffff) as u16,
                    key: record.key,
                });
                out_pos += size;
                kept += 1;
            }
        }
    }
    writer.flush()?;
    drop(writer);
    // Don't fsync in tests, to speed them up.
    #[cfg(not(test))]
    out.sync_all()?;
    drop(out);

    let hint_path = hint::hint_path(path);
    let hint_tmp = tmp_path(&hint_path);
    hint::write_hint_file(&hint_tmp, &hints)?;

    std::fs::rename(&data_tmp, path)?;
    std::fs::rename(&hint_tmp, &hint_path)?;
    Ok((kept, deleted, expired))
}

/// Rebuilds the hint file for every data file by scanning it, replacing
/// any existing hint. Returns (built, failed) counts.
pub fn build_hints(dir: &Path) -> Result<(usize, usize)> {
    let (mut built, mut failed) = (0, 0);
    for path in index::data_files(dir)? {
        match build_hint(&path) {
            Ok(()) => built += 1,
            Err(err) => {
                log::error!("building hint for {} failed: {err}", path.display());
                failed += 1;
            }
        }
    }
    log::info!("built {built} hint files, {failed} failures");
    Ok((built, failed))
}

fn build_hint(path: &Path) -> Result<()> {
    let idx = FileIndex::scan(path)?;
    let entries: Vec<HintEntry> = idx
        .entries
        .iter()
        .map(|(key, e)| HintEntry {
            datapos: e.datapos,
            ver: e.ver,
            hash: (e.hash & 0xffff) as u16,
            key: key.clone(),
        })
        .collect();
    hint::write_hint_file(&hint::hint_path(path), &entries)
}

/// Prints the live keys of a directory: key, version, and record offset,
/// tab-separated. Live means the latest cross-file occurrence is not a
/// tombstone.
pub fn print_keys(dir: &Path, w: &mut impl Write) -> Result<()> {
    let files = index::data_files(dir)?;
    let mut indexes = Vec::with_capacity(files.len());
    for path in &files {
        indexes.push(FileIndex::load(path, true)?);
    }
    for (key, entry) in index::live_index(&indexes) {
        writeln!(w, "{}\t{}\t{}", String::from_utf8_lossy(&key), entry.ver, entry.datapos)?;
    }
    Ok(())
}

/// Validates every hint file against a rescan of its data file, comparing
/// record offsets and versions. Returns the number of differences found,
/// each logged as a warning.
pub fn validate_hints(dir: &Path) -> Result<u64> {
    let mut diffs = 0;
    for path in index::data_files(dir)? {
        let hint_path = hint::hint_path(&path);
        if !hint_path.is_file() {
            log::warn!("{} has no hint file", path.display());
            continue;
        }
        let scanned = FileIndex::scan(&path)?;
        let hinted = match FileIndex::from_hint(&path) {
            Ok(hinted) => hinted,
            Err(err) => {
                log::warn!("hint for {} is unreadable: {err}", path.display());
                diffs += 1;
                continue;
            }
        };
        diffs += diff_indexes(&path, &scanned.entries, &hinted.entries, |a, b| {
            let mut fields = Vec::new();
            if a.datapos != b.datapos {
                fields.push("datapos");
            }
            if a.ver != b.ver {
                fields.push("ver");
            }
            fields
        });
    }
    log::info!("hint validation found {diffs} differences");
    Ok(diffs)
}

/// Validates every hint file against a leftover .tmp hint from an
/// interrupted rewrite, comparing offsets, versions, hashes, and key
/// sizes. Returns the number of differences found.
pub fn validate_tmp_hints(dir: &Path) -> Result<u64> {
    let mut diffs = 0;
    for path in index::data_files(dir)? {
        let hint_path = hint::hint_path(&path);
        let hint_tmp = tmp_path(&hint_path);
        if !hint_path.is_file() || !hint_tmp.is_file() {
            continue;
        }
        let current = hint_index(&hint_path)?;
        let staged = hint_index(&hint_tmp)?;
        diffs += diff_indexes(&path, &current, &staged, |a, b| {
            let mut fields = Vec::new();
            if a.datapos != b.datapos {
                fields.push("datapos");
            }
            if a.ver != b.ver {
                fields.push("ver");
            }
            if a.hash & 0xffff != b.hash & 0xffff {
                fields.push("hash");
            }
            if a.ksz != b.ksz {
                fields.push("ksz");
            }
            fields
        });
    }
    log::info!("tmp hint validation found {diffs} differences");
    Ok(diffs)
}

fn hint_index(path: &Path) -> Result<index::KeyIndex> {
    let mut entries = index::KeyIndex::new();
    for entry in hint::read_hint_file(path)? {
        entries.insert(
            entry.key.clone(),
            index::IndexEntry {
                datapos: entry.datapos,
                ver: entry.ver,
                ksz: entry.key.len() as u32,
                hash: entry.hash as u32,
                tstamp: None,
                vsz: None,
            },
        );
    }
    Ok(entries)
}

/// Diffs two key indexes, using `compare` to name mismatched fields for
/// keys present in both, and logging each difference.
fn diff_indexes(
    path: &Path,
    a: &index::KeyIndex,
    b: &index::KeyIndex,
    compare: impl Fn(&index::IndexEntry, &index::IndexEntry) -> Vec<&'static str>,
) -> u64 {
    let mut diffs = 0;
    for pair in a.iter().merge_join_by(b.iter(), |x, y| x.0.cmp(y.0)) {
        let (key, mismatched) = match pair {
            EitherOrBoth::Both((key, ea), (_, eb)) => {
                let mismatched = compare(ea, eb);
                if mismatched.is_empty() {
                    continue;
                }
                (key, mismatched)
            }
            EitherOrBoth::Left((key, _)) => (key, vec!["only in first"]),
            EitherOrBoth::Right((key, _)) => (key, vec!["only in second"]),
        };
        log::warn!(
            "{}: key {} differs on {}",
            path.display(),
            String::from_utf8_lossy(key),
            mismatched.join(", ")
        );
        diffs += 1;
    }
    diffs
}

/// Runs an end-to-end smoke test in a scratch directory: write data files,
/// build and validate hints, compact, and check the surviving keys.
pub fn self_test() -> Result<()> {
    let dir = std::env::temp_dir().join(format!("beancask-selftest-{}", std::process::id()));
    std::fs::create_dir_all(&dir)?;
    let result = run_self_test(&dir);
    let _ = std::fs::remove_dir_all(&dir);
    result
}

fn run_self_test(dir: &Path) -> Result<()> {
    use super::record::write_data_file;

    let now = 1_700_000_000;
    let ts = now as i32;
    write_data_file(
        &dir.join("000.data"),
        &[
            Record::new(b"alpha", b"one", 1, ts),
            Record::new(b"beta", b"two", 1, ts),
            Record::new(b"alpha", b"one rewritten", 2, ts),
        ],
    )?;
    write_data_file(
        &dir.join("001.data"),
        &[Record::tombstone(b"beta", -1, ts), Record::new(b"gamma", b"three", 1, ts)],
    )?;

    let stats = compact(dir, None, now)?;
    if stats.failed != 0 || stats.deleted != 2 || stats.kept != 1 {
        return errdata!("self-test: unexpected compaction stats {stats:?}");
    }

    let mut indexes = Vec::new();
    for path in index::data_files(dir)? {
        indexes.push(FileIndex::scan(&path)?);
    }
    let live = index::live_index(&indexes);
    let keys: Vec<&[u8]> = live.keys().map(|k| k.as_slice()).collect();
    if keys != vec![b"alpha".as_slice(), b"gamma".as_slice()] {
        return errdata!("self-test: unexpected live keys after compaction");
    }
    if live[b"alpha".as_slice()].ver != 2 {
        return errdata!("self-test: wrong version survived compaction");
    }

    let (built, failed) = build_hints(dir)?;
    if built != 2 || failed != 0 {
        return errdata!("self-test: hint build got {built} built, {failed} failed");
    }
    if validate_hints(dir)? != 0 {
        return errdata!("self-test: rebuilt hints do not match data");
    }

    log::info!("self-test passed");
    Ok(())
}
