//! Change detection.
//!
//! File system events and full scans both reduce to [`ChangeRecord`]s. Records are only hints:
//! the sync coordinator re-reads the disk and compares against the persisted [`FileState`] before
//! touching the index, so duplicated or reordered records are harmless.
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::{
    collections::{BTreeMap, HashMap},
    fmt::{Display, Formatter},
    path::Path,
};
use walkdir::{DirEntry, WalkDir};

use crate::{
    error::NotebaseError,
    paths::{has_extension, is_hidden, relative_path},
    properties::{unix_millis, FileState},
};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeKind {
    Added,
    Modified,
    Deleted,
    Moved { from: String },
}

/// A path-level change, relative to the project root.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub path: String,
    pub kind: ChangeKind,
}

impl ChangeRecord {
    pub fn added(path: &str) -> ChangeRecord {
        ChangeRecord {
            path: path.to_string(),
            kind: ChangeKind::Added,
        }
    }

    pub fn modified(path: &str) -> ChangeRecord {
        ChangeRecord {
            path: path.to_string(),
            kind: ChangeKind::Modified,
        }
    }

    pub fn deleted(path: &str) -> ChangeRecord {
        ChangeRecord {
            path: path.to_string(),
            kind: ChangeKind::Deleted,
        }
    }

    pub fn moved(from: &str, to: &str) -> ChangeRecord {
        ChangeRecord {
            path: to.to_string(),
            kind: ChangeKind::Moved {
                from: from.to_string(),
            },
        }
    }
}

impl Display for ChangeRecord {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            ChangeKind::Added => write!(f, "+{}", self.path),
            ChangeKind::Modified => write!(f, "~{}", self.path),
            ChangeKind::Deleted => write!(f, "-{}", self.path),
            ChangeKind::Moved { from } => write!(f, "{from} -> {}", self.path),
        }
    }
}

/// Pending records coalesced per path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    records: BTreeMap<String, ChangeKind>,
}

impl ChangeSet {
    pub fn new() -> ChangeSet {
        ChangeSet::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn extend<I: IntoIterator<Item = ChangeRecord>>(&mut self, records: I) {
        for record in records {
            self.push(record);
        }
    }

    /// Merge a record into the set. Later records win, except that a file which appeared within
    /// the window stays `Added` and a file that vanished and came back is `Modified`.
    pub fn push(&mut self, record: ChangeRecord) {
        let ChangeRecord { path, kind } = record;
        match kind {
            ChangeKind::Added => {
                let merged = match self.records.get(&path) {
                    Some(ChangeKind::Deleted) | Some(ChangeKind::Modified) => ChangeKind::Modified,
                    Some(existing) => existing.clone(),
                    None => ChangeKind::Added,
                };
                self.records.insert(path, merged);
            }
            ChangeKind::Modified => {
                let merged = match self.records.get(&path) {
                    Some(ChangeKind::Added) => ChangeKind::Added,
                    Some(moved @ ChangeKind::Moved { .. }) => moved.clone(),
                    _ => ChangeKind::Modified,
                };
                self.records.insert(path, merged);
            }
            ChangeKind::Deleted => {
                if let Some(ChangeKind::Moved { from }) = self.records.get(&path).cloned() {
                    self.records.insert(from, ChangeKind::Deleted);
                }
                self.records.insert(path, ChangeKind::Deleted);
            }
            ChangeKind::Moved { from } => {
                let merged = match self.records.remove(&from) {
                    Some(ChangeKind::Added) => ChangeKind::Added,
                    Some(ChangeKind::Moved { from: origin }) => ChangeKind::Moved { from: origin },
                    _ => ChangeKind::Moved { from },
                };
                self.records.insert(path, merged);
            }
        }
    }

    /// Take every record in apply order: deletes, then moves, then adds and modifications, each
    /// group sorted by path.
    pub fn drain(&mut self) -> Vec<ChangeRecord> {
        let records = std::mem::take(&mut self.records);
        let mut deletes = Vec::new();
        let mut moves = Vec::new();
        let mut rest = Vec::new();
        for (path, kind) in records {
            let record = ChangeRecord { path, kind };
            match record.kind {
                ChangeKind::Deleted => deletes.push(record),
                ChangeKind::Moved { .. } => moves.push(record),
                _ => rest.push(record),
            }
        }
        deletes.into_iter().chain(moves).chain(rest).collect()
    }
}

/// What a scan knows about a file before reading it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSnapshot {
    pub mtime: i64,
    pub size: i64,
}

fn is_hidden_entry(entry: &DirEntry) -> bool {
    entry.depth() > 0
        && entry
            .file_name()
            .to_str()
            .map(|s| s.starts_with('.'))
            .unwrap_or(false)
}

/// Every non-hidden file under `root` with one of `extensions`, keyed by project-relative path.
pub fn scan_directory(
    root: &Path,
    extensions: &[String],
) -> Result<BTreeMap<String, FileSnapshot>, NotebaseError> {
    let mut files = BTreeMap::new();
    for entry in WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| !is_hidden_entry(e))
    {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) if e.io_error().map(|io| io.kind()) == Some(std::io::ErrorKind::NotFound) => {
                continue;
            }
            Err(e) => return Err(e.into()),
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let rel_path = relative_path(root, entry.path())?;
        if is_hidden(&rel_path) || !has_extension(&rel_path, extensions) {
            continue;
        }
        let metadata = match entry.metadata() {
            Ok(metadata) => metadata,
            Err(e) => {
                tracing::debug!("Skipping {rel_path}: {e}");
                continue;
            }
        };
        let mtime = metadata.modified().map(unix_millis).unwrap_or_default();
        files.insert(
            rel_path,
            FileSnapshot {
                mtime,
                size: metadata.len() as i64,
            },
        );
    }
    Ok(files)
}

/// Hex encoded sha256 of file content.
pub fn file_checksum(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Records that bring `known` in line with `disk`. Files whose mtime and size match their
/// persisted state are skipped without hashing.
pub fn diff_snapshots(
    disk: &BTreeMap<String, FileSnapshot>,
    known: &BTreeMap<String, FileState>,
) -> Vec<ChangeRecord> {
    let mut records = Vec::new();
    for (path, snapshot) in disk {
        match known.get(path) {
            None => records.push(ChangeRecord::added(path)),
            Some(state) if state.mtime != snapshot.mtime || state.size != snapshot.size => {
                records.push(ChangeRecord::modified(path))
            }
            Some(_) => {}
        }
    }
    for path in known.keys() {
        if !disk.contains_key(path) {
            records.push(ChangeRecord::deleted(path));
        }
    }
    records
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MovePairing {
    /// `(from, to)` pairs
    pub moves: Vec<(String, String)>,
    /// Paths whose checksum matched more than one candidate; handled as delete plus add
    pub ambiguous: Vec<String>,
}

/// Pair vanished files with appeared files of identical content. Pairing only happens when the
/// checksum identifies exactly one file on each side.
pub fn detect_moves(deleted: &[(String, String)], added: &[(String, String)]) -> MovePairing {
    let mut by_checksum: HashMap<&str, (Vec<&str>, Vec<&str>)> = HashMap::new();
    for (path, checksum) in deleted {
        by_checksum.entry(checksum).or_default().0.push(path);
    }
    for (path, checksum) in added {
        by_checksum.entry(checksum).or_default().1.push(path);
    }

    let mut pairing = MovePairing::default();
    for (froms, tos) in by_checksum.into_values() {
        match (froms.as_slice(), tos.as_slice()) {
            ([from], [to]) => pairing.moves.push((from.to_string(), to.to_string())),
            (froms, tos) if !froms.is_empty() && !tos.is_empty() => {
                tracing::warn!(
                    "{}",
                    NotebaseError::IdentityAmbiguity(format!(
                        "content of {froms:?} matches {tos:?}; treating as delete and add"
                    ))
                );
                pairing
                    .ambiguous
                    .extend(froms.iter().chain(tos.iter()).map(|p| p.to_string()));
            }
            _ => {}
        }
    }
    pairing.moves.sort();
    pairing.ambiguous.sort();
    pairing
}
