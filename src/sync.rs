//! Per-project reconciliation of the index with the file system.
//!
//! A [`SyncCoordinator`] takes batches of [`ChangeRecord`]s (from the watcher, a full scan or
//! its own retry queue) and drives every affected file through
//! `Detected → Parsing → Resolving → Persisting → Committed | Failed`.
//!
//! Reading and parsing run in parallel on the blocking pool. Commits are serial, one
//! [`Transaction`] per file, in a fixed order: deletions, moves, then additions and
//! modifications sorted by path. Committing one file at a time means a relation to a file later
//! in the batch is simply pending until that file commits and promotes it.
//!
//! Records are hints. Each path is re-read and compared with its persisted [`FileState`], so a
//! file whose checksum did not change never touches the index, and replaying a batch is a no-op.
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet, HashMap, VecDeque},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::Sender,
        Arc,
    },
    time::Duration,
};
use tokio::{
    task::{spawn_blocking, JoinSet},
    time::{sleep, timeout, Instant},
};

use crate::{
    changes::{detect_moves, diff_snapshots, file_checksum, scan_directory, ChangeKind, ChangeRecord},
    codec::{CodecMap, ParsedDocument},
    config::SyncConfig,
    db::{DbConnection, Transaction},
    error::NotebaseError,
    event::{Event, FileFingerprint, IndexEvent, IndexOutcome},
    paths::{has_extension, is_hidden, string_to_os_path},
    properties::{now_millis, unix_millis, FileState, FileStatus, Project},
    status::{DetectorState, FileSyncState, ParkedFile, SyncStatus, WatchMode},
};

/// First backoff step between attempts of a failing index transaction.
pub const TXN_BACKOFF: Duration = Duration::from_millis(25);

/// What one reconciliation batch did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    pub added: Vec<String>,
    pub modified: Vec<String>,
    pub deleted: Vec<String>,
    /// `(from, to)` pairs
    pub moves: Vec<(String, String)>,
    /// Content unchanged, only mtime or size refreshed
    pub touched: Vec<String>,
    /// Indexed as minimal entities because they failed to parse
    pub parse_errors: Vec<String>,
    /// Failed this batch and queued for retry
    pub failed: Vec<String>,
    /// Failed for good until their content changes
    pub parked: Vec<String>,
    /// Records that needed no index change
    pub unchanged: usize,
    /// Pending relations resolved by this batch
    pub promoted: u64,
}

impl SyncReport {
    /// Number of files whose indexed content changed.
    pub fn changed(&self) -> usize {
        self.added.len() + self.modified.len() + self.deleted.len() + self.moves.len()
    }

    pub fn merge(&mut self, other: SyncReport) {
        self.added.extend(other.added);
        self.modified.extend(other.modified);
        self.deleted.extend(other.deleted);
        self.moves.extend(other.moves);
        self.touched.extend(other.touched);
        self.parse_errors.extend(other.parse_errors);
        self.failed.extend(other.failed);
        self.parked.extend(other.parked);
        self.unchanged += other.unchanged;
        self.promoted += other.promoted;
    }
}

#[derive(Debug, Clone)]
struct RetryEntry {
    record: ChangeRecord,
    attempts: u32,
    due: Instant,
}

/// A file after the parallel read/parse stage.
#[derive(Debug)]
enum Prepared {
    Vanished,
    Unchanged,
    /// Same content, new mtime or size
    Touched(FileFingerprint),
    /// Same content as when it was parked
    StillParked,
    Parsed {
        fingerprint: FileFingerprint,
        document: ParsedDocument,
        text: String,
        parse_error: Option<String>,
    },
}

fn prepare_file(
    root: &Path,
    codecs: &CodecMap,
    rel_path: &str,
    known: Option<&FileState>,
) -> Result<Prepared, NotebaseError> {
    let full_path = root.join(string_to_os_path(rel_path));
    let metadata = match std::fs::metadata(&full_path) {
        Ok(metadata) if metadata.is_file() => metadata,
        Ok(_) => return Ok(Prepared::Vanished),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Prepared::Vanished),
        Err(e) => return Err(e.into()),
    };
    let bytes = match std::fs::read(&full_path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Prepared::Vanished),
        Err(e) => return Err(e.into()),
    };
    let fingerprint = FileFingerprint {
        checksum: file_checksum(&bytes),
        mtime: metadata.modified().map(unix_millis).unwrap_or_default(),
        size: bytes.len() as i64,
    };

    if let Some(state) = known {
        if state.checksum == fingerprint.checksum {
            return Ok(match state.status {
                FileStatus::Error => Prepared::StillParked,
                FileStatus::Ok if state.mtime == fingerprint.mtime && state.size == fingerprint.size => {
                    Prepared::Unchanged
                }
                FileStatus::Ok => Prepared::Touched(fingerprint),
            });
        }
    }

    let (document, parse_error) = codecs.parse_bytes(rel_path, &bytes)?;
    Ok(Prepared::Parsed {
        fingerprint,
        document,
        text: String::from_utf8_lossy(&bytes).into_owned(),
        parse_error: parse_error.map(|e| e.to_string()),
    })
}

pub struct SyncCoordinator {
    project: Project,
    root: PathBuf,
    db: DbConnection,
    codecs: CodecMap,
    config: SyncConfig,
    event_tx: Option<Sender<Event>>,
    cancelled: Arc<AtomicBool>,
    status: Arc<RwLock<SyncStatus>>,
    retries: BTreeMap<String, RetryEntry>,
    progress: HashMap<String, FileSyncState>,
    last_error: Option<String>,
    /// Most recent watcher failure, until the watcher delivers changes again
    watch_error: Option<String>,
}

impl SyncCoordinator {
    pub fn new(
        project: Project,
        db: DbConnection,
        codecs: CodecMap,
        config: SyncConfig,
    ) -> SyncCoordinator {
        let status = SyncStatus {
            project_id: project.id,
            project: project.name.clone(),
            ..Default::default()
        };
        SyncCoordinator {
            root: PathBuf::from(&project.path),
            project,
            db,
            codecs,
            config,
            event_tx: None,
            cancelled: Arc::new(AtomicBool::new(false)),
            status: Arc::new(RwLock::new(status)),
            retries: BTreeMap::new(),
            progress: HashMap::new(),
            last_error: None,
            watch_error: None,
        }
    }

    pub fn with_events(mut self, event_tx: Sender<Event>) -> SyncCoordinator {
        self.event_tx = Some(event_tx);
        self
    }

    pub fn project(&self) -> &Project {
        &self.project
    }

    /// Setting the flag stops the coordinator before its next file.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancelled.clone()
    }

    pub fn status_handle(&self) -> Arc<RwLock<SyncStatus>> {
        self.status.clone()
    }

    pub fn status(&self) -> SyncStatus {
        self.status.read().clone()
    }

    pub fn set_mode(&self, mode: WatchMode) {
        self.status.write().mode = mode;
    }

    /// Note a watcher failure. Until the watcher delivers changes again the project counts as
    /// scan-only and the failure is reported as its last error.
    pub fn record_watch_error(&mut self, message: String) {
        tracing::warn!("[SyncCoordinator] {}: {message}", self.project.name);
        let mut status = self.status.write();
        status.mode = WatchMode::ScanOnly;
        status.last_error = Some(message.clone());
        self.watch_error = Some(message);
    }

    /// The watcher delivered changes again after a failure.
    pub fn clear_watch_error(&mut self) {
        if self.watch_error.take().is_some() {
            self.set_mode(WatchMode::Events);
        }
    }

    /// Where `path` got to in the most recent batch.
    pub fn file_progress(&self, path: &str) -> Option<FileSyncState> {
        self.progress.get(path).copied()
    }

    /// Records still waiting for a retry.
    pub fn pending_retries(&self) -> usize {
        self.retries.len()
    }

    pub fn next_retry_at(&self) -> Option<Instant> {
        self.retries.values().map(|r| r.due).min()
    }

    fn emit(&self, event: Event) {
        if let Some(tx) = self.event_tx.as_ref() {
            if let Err(e) = tx.send(event) {
                tracing::debug!("[SyncCoordinator] event receiver gone: {e}");
            }
        }
    }

    fn set_state(&self, state: DetectorState) {
        self.status.write().state = state;
    }

    fn transition(&mut self, path: &str, state: FileSyncState) {
        tracing::trace!("[SyncCoordinator] {path}: {state}");
        self.progress.insert(path.to_string(), state);
    }

    fn check_cancelled(&self) -> Result<(), NotebaseError> {
        if self.cancelled.load(Ordering::Relaxed) {
            tracing::info!("[SyncCoordinator] {} cancelled", self.project.name);
            return Err(NotebaseError::OperationCancelled);
        }
        Ok(())
    }

    /// Rebuild the project's search rows if they drifted from the relational tables. Returns
    /// whether the index was already consistent.
    pub async fn verify_search_index(&self) -> Result<bool, NotebaseError> {
        if self.db.check_search_index(self.project.id).await? {
            return Ok(true);
        }
        tracing::warn!(
            "[SyncCoordinator] search index of {} drifted, rebuilding",
            self.project.name
        );
        self.db
            .rebuild_search_index(self.project.id, Some(&self.root))
            .await?;
        Ok(false)
    }

    /// Walk the project root and reconcile every difference with the persisted file state.
    #[tracing::instrument(skip(self), fields(project = %self.project.name))]
    pub async fn full_scan(&mut self) -> Result<SyncReport, NotebaseError> {
        self.check_cancelled()?;
        self.set_state(DetectorState::Scanning);
        let root = self.root.clone();
        let extensions = self.codecs.extensions();
        let disk = match spawn_blocking(move || scan_directory(&root, &extensions)).await? {
            Ok(disk) => disk,
            Err(e) => {
                tracing::warn!("[SyncCoordinator] scan of {:?} failed: {e}", self.root);
                self.last_error = Some(e.to_string());
                self.set_state(DetectorState::Idle);
                self.refresh_status().await?;
                return Err(e);
            }
        };
        self.set_state(DetectorState::Diffing);
        let known = self.db.file_states(self.project.id).await?;
        let records = diff_snapshots(&disk, &known);
        tracing::info!(
            "[SyncCoordinator] full scan of {}: {} files on disk, {} known, {} differences",
            self.project.name,
            disk.len(),
            known.len(),
            records.len()
        );
        self.reconcile(records, true).await
    }

    /// Reconcile a batch of change records.
    #[tracing::instrument(skip_all, fields(project = %self.project.name, records = records.len()))]
    pub async fn process(&mut self, records: Vec<ChangeRecord>) -> Result<SyncReport, NotebaseError> {
        self.reconcile(records, false).await
    }

    /// Re-run the records whose retry delay has expired.
    pub async fn retry_due(&mut self) -> Result<SyncReport, NotebaseError> {
        let now = Instant::now();
        let due = self
            .retries
            .values()
            .filter(|r| r.due <= now)
            .map(|r| r.record.clone())
            .collect::<Vec<_>>();
        if due.is_empty() {
            return Ok(SyncReport::default());
        }
        tracing::info!("[SyncCoordinator] retrying {} files", due.len());
        self.reconcile(due, false).await
    }

    fn is_tracked(&self, rel_path: &str) -> bool {
        !rel_path.is_empty()
            && !is_hidden(rel_path)
            && has_extension(rel_path, &self.codecs.extensions())
    }

    async fn reconcile(
        &mut self,
        records: Vec<ChangeRecord>,
        full_scan: bool,
    ) -> Result<SyncReport, NotebaseError> {
        self.check_cancelled()?;
        self.set_state(DetectorState::Diffing);
        self.progress.clear();
        self.last_error = None;
        let mut report = SyncReport::default();

        // Every path a record touches, the record to replay on failure, and rename hints.
        let mut paths = BTreeSet::new();
        let mut origin: HashMap<String, ChangeRecord> = HashMap::new();
        let mut rename_hints: BTreeMap<String, String> = BTreeMap::new();
        for record in records {
            match &record.kind {
                ChangeKind::Moved { from } => {
                    let (from_tracked, to_tracked) =
                        (self.is_tracked(from), self.is_tracked(&record.path));
                    if from_tracked {
                        paths.insert(from.clone());
                        origin.insert(from.clone(), ChangeRecord::deleted(from));
                    }
                    if to_tracked {
                        paths.insert(record.path.clone());
                        origin.insert(record.path.clone(), record.clone());
                    }
                    if from_tracked && to_tracked {
                        rename_hints.insert(record.path.clone(), from.clone());
                    }
                }
                _ if self.is_tracked(&record.path) => {
                    paths.insert(record.path.clone());
                    origin.insert(record.path.clone(), record.clone());
                }
                _ => report.unchanged += 1,
            }
        }
        if paths.is_empty() {
            self.finish_batch(&report, full_scan).await?;
            return Ok(report);
        }

        let known = self.db.file_states(self.project.id).await?;
        for path in paths.iter() {
            self.transition(path, FileSyncState::Detected);
        }
        self.set_state(DetectorState::Dispatched);
        let mut prepared = self.prepare_all(&paths, &known).await;

        // Split into deletions, new files and updates.
        let mut deleted = Vec::new();
        let mut added = Vec::new();
        for (path, result) in prepared.iter() {
            match result {
                Ok(Prepared::Vanished) if known.contains_key(path) => {
                    deleted.push((path.clone(), known[path].checksum.clone()))
                }
                Ok(Prepared::Parsed { fingerprint, .. }) if !known.contains_key(path) => {
                    added.push((path.clone(), fingerprint.checksum.clone()))
                }
                _ => {}
            }
        }

        let mut moves = Vec::new();
        for (to, from) in rename_hints.iter() {
            let from_deleted = deleted.iter().any(|(p, _)| p == from);
            let to_added = added.iter().any(|(p, _)| p == to);
            if from_deleted && to_added {
                moves.push((from.clone(), to.clone()));
            }
        }
        deleted.retain(|(p, _)| !moves.iter().any(|(from, _)| from == p));
        added.retain(|(p, _)| !moves.iter().any(|(_, to)| to == p));
        let pairing = detect_moves(&deleted, &added);
        moves.extend(pairing.moves);
        moves.sort();

        // Deletions.
        for (path, checksum) in deleted.iter() {
            if moves.iter().any(|(from, _)| from == path) {
                continue;
            }
            self.check_cancelled()?;
            let record = ChangeRecord::deleted(path);
            let event = IndexEvent::DocumentRemoved { path: path.clone() };
            if let Some(IndexOutcome::Removed { .. }) =
                self.commit(path, checksum, record, event, &mut report).await
            {
                report.deleted.push(path.clone());
            }
        }

        // Moves keep the entity and its identity.
        for (from, to) in moves.iter() {
            self.check_cancelled()?;
            let Some(Ok(Prepared::Parsed {
                fingerprint,
                document,
                text,
                parse_error,
            })) = prepared.remove(to)
            else {
                continue;
            };
            let checksum = fingerprint.checksum.clone();
            let record = ChangeRecord::moved(from, to);
            let event = IndexEvent::DocumentMoved {
                from: from.clone(),
                to: to.clone(),
                fingerprint,
                document,
                text,
                parse_error,
            };
            self.transition(from, FileSyncState::Resolving);
            if let Some(outcome) = self.commit(to, &checksum, record, event, &mut report).await {
                if let IndexOutcome::Moved { .. } | IndexOutcome::Upserted { .. } = outcome {
                    report.moves.push((from.clone(), to.clone()));
                }
                self.transition(from, FileSyncState::Committed);
            }
        }

        // Additions, modifications and touches, in path order.
        for (path, result) in prepared {
            if moves.iter().any(|(from, _)| *from == path) {
                continue;
            }
            self.check_cancelled()?;
            let record = origin
                .get(&path)
                .cloned()
                .unwrap_or_else(|| ChangeRecord::modified(&path));
            match result {
                Ok(Prepared::Parsed {
                    fingerprint,
                    document,
                    text,
                    parse_error,
                }) => {
                    let checksum = fingerprint.checksum.clone();
                    let failed_parse = parse_error.is_some();
                    let event = IndexEvent::DocumentIndexed {
                        path: path.clone(),
                        document,
                        text,
                        fingerprint,
                        parse_error,
                    };
                    if let Some(IndexOutcome::Upserted { promoted, .. }) =
                        self.commit(&path, &checksum, record, event, &mut report).await
                    {
                        if known.contains_key(&path) {
                            report.modified.push(path.clone());
                        } else {
                            report.added.push(path.clone());
                        }
                        if failed_parse {
                            report.parse_errors.push(path.clone());
                        }
                        report.promoted += promoted;
                    }
                }
                Ok(Prepared::Touched(fingerprint)) => {
                    let checksum = fingerprint.checksum.clone();
                    let event = IndexEvent::DocumentTouched {
                        path: path.clone(),
                        fingerprint,
                    };
                    if self
                        .commit(&path, &checksum, record, event, &mut report)
                        .await
                        .is_some()
                    {
                        report.touched.push(path.clone());
                    }
                }
                Ok(Prepared::Unchanged) | Ok(Prepared::StillParked) => {
                    self.retries.remove(&path);
                    self.transition(&path, FileSyncState::Committed);
                    report.unchanged += 1;
                }
                // Already committed as a deletion, or never indexed.
                Ok(Prepared::Vanished) => {
                    if !known.contains_key(&path) {
                        self.retries.remove(&path);
                        report.unchanged += 1;
                    }
                }
                Err(e) => {
                    let checksum = known
                        .get(&path)
                        .map(|s| s.checksum.clone())
                        .unwrap_or_default();
                    self.fail(&path, &checksum, record, e, &mut report).await;
                }
            }
        }

        self.finish_batch(&report, full_scan).await?;
        Ok(report)
    }

    /// Read, hash and parse `paths` on the blocking pool, `parse_concurrency` at a time.
    async fn prepare_all(
        &mut self,
        paths: &BTreeSet<String>,
        known: &BTreeMap<String, FileState>,
    ) -> BTreeMap<String, Result<Prepared, NotebaseError>> {
        let concurrency = self.config.parse_concurrency.max(1);
        let file_timeout = self.config.file_timeout();
        let mut queue = paths.iter().cloned().collect::<VecDeque<_>>();
        let mut tasks = JoinSet::new();
        let mut prepared = BTreeMap::new();

        loop {
            while tasks.len() < concurrency {
                let Some(path) = queue.pop_front() else {
                    break;
                };
                self.transition(&path, FileSyncState::Parsing);
                let root = self.root.clone();
                let codecs = self.codecs.clone();
                let state = known.get(&path).cloned();
                tasks.spawn(async move {
                    let task_path = path.clone();
                    let work = spawn_blocking(move || {
                        prepare_file(&root, &codecs, &task_path, state.as_ref())
                    });
                    let result = match timeout(file_timeout, work).await {
                        Ok(Ok(result)) => result,
                        Ok(Err(join_error)) => Err(join_error.into()),
                        Err(_) => Err(NotebaseError::Timeout(format!(
                            "reading and parsing {path} took longer than {file_timeout:?}"
                        ))),
                    };
                    (path, result)
                });
            }
            match tasks.join_next().await {
                Some(Ok((path, result))) => {
                    self.transition(&path, FileSyncState::Resolving);
                    prepared.insert(path, result);
                }
                Some(Err(e)) => tracing::error!("[SyncCoordinator] prepare task failed: {e}"),
                None => break,
            }
        }
        prepared
    }

    /// Apply one event in its own transaction, retrying transient store failures. Returns the
    /// outcome on success; on failure the file is queued for retry or parked.
    async fn commit(
        &mut self,
        path: &str,
        checksum: &str,
        record: ChangeRecord,
        event: IndexEvent,
        report: &mut SyncReport,
    ) -> Option<IndexOutcome> {
        self.transition(path, FileSyncState::Persisting);
        let mut txn = Transaction::with_config(self.project.id, &self.config);
        txn.add_event(event.clone());

        let mut attempt = 0;
        let result = loop {
            match txn.execute(&self.db).await {
                Ok(mut outcomes) => break Ok(outcomes.pop().unwrap_or(IndexOutcome::Recorded)),
                Err(e) if e.is_transient() && attempt < self.config.txn_retries => {
                    let backoff = TXN_BACKOFF * 2u32.saturating_pow(attempt);
                    tracing::debug!("[SyncCoordinator] {path}: {e}; retrying in {backoff:?}");
                    attempt += 1;
                    sleep(backoff).await;
                }
                Err(e) => break Err(e),
            }
        };

        match result {
            Ok(outcome) => {
                self.retries.remove(path);
                self.transition(path, FileSyncState::Committed);
                self.emit(Event::Index(self.project.id, event));
                Some(outcome)
            }
            Err(e) => {
                self.fail(path, checksum, record, e, report).await;
                None
            }
        }
    }

    async fn fail(
        &mut self,
        path: &str,
        checksum: &str,
        record: ChangeRecord,
        error: NotebaseError,
        report: &mut SyncReport,
    ) {
        self.transition(path, FileSyncState::Failed);
        let attempts = self.retries.get(path).map(|r| r.attempts).unwrap_or(0) + 1;
        let parked = attempts >= self.config.max_file_attempts || !error.is_transient();
        let message = format!("{path}: {error}");
        self.last_error = Some(message.clone());

        let event = IndexEvent::FileFailed {
            path: path.to_string(),
            checksum: checksum.to_string(),
            error: error.to_string(),
            attempts: attempts as i64,
            parked,
        };
        let mut txn = Transaction::with_config(self.project.id, &self.config);
        txn.add_event(event.clone());
        match txn.execute(&self.db).await {
            Ok(_) => self.emit(Event::Index(self.project.id, event)),
            Err(e) => tracing::warn!("[SyncCoordinator] could not record failure of {path}: {e}"),
        }

        if parked {
            tracing::warn!("[SyncCoordinator] parking {message} after {attempts} attempts");
            self.retries.remove(path);
            report.parked.push(path.to_string());
        } else {
            let delay = self.config.retry_delay(attempts);
            tracing::info!("[SyncCoordinator] {message}; attempt {attempts}, retrying in {delay:?}");
            self.retries.insert(
                path.to_string(),
                RetryEntry {
                    record,
                    attempts,
                    due: Instant::now() + delay,
                },
            );
            report.failed.push(path.to_string());
        }
    }

    async fn finish_batch(&mut self, report: &SyncReport, full_scan: bool) -> Result<(), NotebaseError> {
        if full_scan || report.changed() > 0 || self.last_error.is_some() {
            let mut txn = Transaction::with_config(self.project.id, &self.config);
            txn.add_event(IndexEvent::BatchCompleted {
                at: now_millis(),
                full_scan,
                last_error: self.last_error.clone(),
            });
            txn.execute(&self.db).await?;
        }
        if report.changed() > 0 || !report.failed.is_empty() || !report.parked.is_empty() {
            tracing::info!(
                "[SyncCoordinator] {}: {} added, {} modified, {} deleted, {} moved, {} failed, {} parked",
                self.project.name,
                report.added.len(),
                report.modified.len(),
                report.deleted.len(),
                report.moves.len(),
                report.failed.len(),
                report.parked.len()
            );
        }
        self.set_state(DetectorState::Idle);
        self.refresh_status().await
    }

    /// Re-read the persisted status fields and publish them.
    pub async fn refresh_status(&self) -> Result<(), NotebaseError> {
        let meta = self.db.sync_meta(self.project.id).await?;
        let entity_count = self.db.entity_count(self.project.id).await?;
        let parked_files = self
            .db
            .file_states(self.project.id)
            .await?
            .into_values()
            .filter(|s| s.status == FileStatus::Error)
            .map(|s| ParkedFile {
                path: s.path,
                attempts: s.attempts,
                error: s.last_error.unwrap_or_default(),
            })
            .collect::<Vec<_>>();
        let status = {
            let mut status = self.status.write();
            status.pending = self.retries.len();
            status.last_sync = meta.last_sync_at;
            status.last_scan = meta.last_scan_at;
            status.last_error = self
                .watch_error
                .clone()
                .or_else(|| self.last_error.clone())
                .or(meta.last_error);
            status.entity_count = entity_count;
            status.parked = parked_files.len();
            status.parked_files = parked_files;
            status.clone()
        };
        self.emit(Event::Status(status));
        Ok(())
    }
}
