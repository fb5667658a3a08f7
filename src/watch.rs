//! # Watch Service - Continuous Project Synchronization
//!
//! [`WatchService`] keeps the index of every active project in line with its directory. It owns
//! its own tokio runtime, so it can be driven from synchronous code, and runs one sync loop per
//! active project.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use notebase_core::{watch::WatchService, event::Event};
//! use std::{sync::mpsc::channel, path::PathBuf};
//!
//! let (tx, rx) = channel::<Event>();
//!
//! // Database at /workspace/notebase.db, configuration at /workspace/config.toml
//! let service = WatchService::new(PathBuf::from("/workspace"), tx)?;
//!
//! // Register a project and start watching it. An initial full scan runs immediately.
//! service.add_project("notes", &PathBuf::from("/workspace/notes"))?;
//!
//! for event in rx {
//!     match event {
//!         Event::Index(project_id, index_event) => {
//!             println!("project {project_id}: {index_event}");
//!         }
//!         Event::Status(status) => println!("{} pending", status.pending),
//!         Event::Ping => {}
//!     }
//! }
//! # Ok::<(), notebase_core::NotebaseError>(())
//! ```
//!
//! ## Threading Model
//!
//! 1. **File watcher** (`notify-debouncer-full`): debounces file system events for
//!    [`SyncConfig::debounce_ms`], maps them to [`ChangeRecord`]s and pushes them into the
//!    project's command channel. It never touches the index.
//! 2. **Sync loop** (one tokio task per project): consumes [`SyncCommand`]s, runs periodic full
//!    scans and due retries through the project's [`SyncCoordinator`].
//!
//! If the watcher cannot be started the project runs in [`WatchMode::ScanOnly`], scanning at
//! least every [`SyncConfig::scan_only_interval`]. Watcher errors put the project in the same
//! mode until the watcher delivers changes again, show up as the status `last_error` and trigger
//! an immediate full scan.
//!
//! ## Shutdown
//!
//! Disabling a project sets its cancel flag and sends [`SyncCommand::Shutdown`]; the loop
//! finishes the file it is committing and exits. Dropping the service stops every loop.
use notify_debouncer_full::{
    new_debouncer,
    notify::{
        event::{ModifyKind, RenameMode},
        Event as NotifyEvent, EventKind, RecommendedWatcher, RecursiveMode, Watcher,
    },
    DebounceEventResult, Debouncer, FileIdMap,
};
use parking_lot::{Mutex, RwLock};
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    result::Result,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::Sender,
        Arc,
    },
    time::Duration,
};
use tokio::{
    runtime::Runtime,
    sync::{
        mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
        oneshot,
    },
    task::JoinHandle,
    time::{interval, sleep_until, timeout, Interval, MissedTickBehavior},
};

use crate::{
    changes::{ChangeRecord, ChangeSet},
    codec::{CodecMap, CODECS},
    config::{ProjectConfigProvider, ProjectRecord, SyncConfig, TomlConfigProvider},
    db::{DbConnection, NOTEBASE_DB},
    error::NotebaseError,
    event::Event,
    paths::{extension, has_extension, is_hidden, relative_path},
    properties::{Project, ProjectId},
    registry::{ProjectChange, ProjectRegistry},
    status::{SyncStatus, WatchMode},
    sync::{SyncCoordinator, SyncReport},
};

/// How long disabling a project waits for its loop to finish the current file.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// A debounced file system watcher for one project root
type ProjectWatcher = Debouncer<RecommendedWatcher, FileIdMap>;

/// Messages consumed by a project's sync loop.
#[derive(Debug)]
pub enum SyncCommand {
    Changes(Vec<ChangeRecord>),
    /// Full scan; the report is sent back when a reply channel is given
    FullScan(Option<oneshot::Sender<Result<SyncReport, NotebaseError>>>),
    /// The watcher reported an error and may have missed changes
    WatcherFailed(String),
    Shutdown,
}

struct ProjectSyncer {
    project: Project,
    /// Dropping the debouncer stops the watcher thread
    watcher: Option<ProjectWatcher>,
    commands: UnboundedSender<SyncCommand>,
    cancelled: Arc<AtomicBool>,
    status: Arc<RwLock<SyncStatus>>,
    handle: JoinHandle<()>,
}

/// Map a notify event to change records relative to `root`. Returns `None` when the event
/// cannot be mapped to files (a directory was renamed or removed) and a full scan is needed.
pub fn event_records(
    root: &Path,
    extensions: &[String],
    event: &NotifyEvent,
) -> Option<Vec<ChangeRecord>> {
    let tracked = |path: &PathBuf| -> Option<String> {
        let rel = relative_path(root, path).ok()?;
        (!is_hidden(&rel) && has_extension(&rel, extensions)).then_some(rel)
    };
    // A path without any extension that vanished or moved is most likely a directory.
    let structural = |path: &PathBuf| -> bool {
        relative_path(root, path)
            .map(|rel| !rel.is_empty() && !is_hidden(&rel) && extension(&rel).is_none())
            .unwrap_or(false)
    };

    let mut records = Vec::new();
    match event.kind {
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if event.paths.len() == 2 => {
            if structural(&event.paths[0]) || structural(&event.paths[1]) {
                return None;
            }
            match (tracked(&event.paths[0]), tracked(&event.paths[1])) {
                (Some(from), Some(to)) => records.push(ChangeRecord::moved(&from, &to)),
                (Some(from), None) => records.push(ChangeRecord::deleted(&from)),
                (None, Some(to)) => records.push(ChangeRecord::added(&to)),
                (None, None) => {}
            }
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) | EventKind::Remove(_) => {
            for path in event.paths.iter() {
                if structural(path) {
                    return None;
                }
                if let Some(rel) = tracked(path) {
                    records.push(ChangeRecord::deleted(&rel));
                }
            }
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) | EventKind::Create(_) => {
            for path in event.paths.iter() {
                if path.is_dir() {
                    return None;
                }
                if let Some(rel) = tracked(path) {
                    records.push(ChangeRecord::added(&rel));
                }
            }
        }
        EventKind::Modify(ModifyKind::Name(_)) => {
            for path in event.paths.iter() {
                if structural(path) {
                    return None;
                }
                if let Some(rel) = tracked(path) {
                    records.push(ChangeRecord::modified(&rel));
                }
            }
        }
        EventKind::Modify(_) => {
            records.extend(
                event
                    .paths
                    .iter()
                    .filter_map(&tracked)
                    .map(|rel| ChangeRecord::modified(&rel)),
            );
        }
        _ => {}
    }
    Some(records)
}

fn create_watcher(
    root: &Path,
    extensions: Vec<String>,
    debounce: Duration,
    commands: UnboundedSender<SyncCommand>,
) -> Result<ProjectWatcher, NotebaseError> {
    let watch_root = root.to_path_buf();
    let mut debouncer = new_debouncer(debounce, None, move |result: DebounceEventResult| {
        match result {
            Ok(events) => {
                let mut changes = ChangeSet::new();
                let mut rescan = false;
                for event in events.iter() {
                    match event_records(&watch_root, &extensions, event) {
                        Some(records) => changes.extend(records),
                        None => rescan = true,
                    }
                }
                let command = if rescan {
                    tracing::debug!("[Debouncer] structural change under {watch_root:?}, rescanning");
                    SyncCommand::FullScan(None)
                } else if !changes.is_empty() {
                    tracing::debug!("[Debouncer] {} paths changed", changes.len());
                    SyncCommand::Changes(changes.drain())
                } else {
                    return;
                };
                if let Err(e) = commands.send(command) {
                    tracing::debug!("[Debouncer] sync loop is gone: {e}");
                }
            }
            Err(errors) => {
                let messages = errors
                    .into_iter()
                    .map(|error| NotebaseError::from(error).to_string())
                    .collect::<Vec<_>>();
                for message in messages.iter() {
                    tracing::error!("{message}");
                }
                let _ = commands.send(SyncCommand::WatcherFailed(messages.join("; ")));
            }
        }
    })?;
    debouncer.watcher().watch(root, RecursiveMode::Recursive)?;
    debouncer.cache().add_root(root, RecursiveMode::Recursive);
    Ok(debouncer)
}

fn scan_ticker(period: Option<Duration>) -> Option<Interval> {
    period.map(|period| {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.reset();
        ticker
    })
}

async fn scan_tick(ticker: &mut Option<Interval>) {
    match ticker.as_mut() {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

async fn retry_tick(at: Option<tokio::time::Instant>) {
    match at {
        Some(at) => sleep_until(at).await,
        None => std::future::pending::<()>().await,
    }
}

fn log_result(project: &str, what: &str, result: &Result<SyncReport, NotebaseError>) {
    if let Err(e) = result {
        tracing::warn!("[sync loop] {what} of {project} failed: {e}");
    }
}

#[tracing::instrument(skip_all, fields(project = %coordinator.project().name))]
async fn run_sync_loop(
    mut coordinator: SyncCoordinator,
    mut commands: UnboundedReceiver<SyncCommand>,
    scan_interval: Option<Duration>,
    scan_only_interval: Duration,
) {
    let name = coordinator.project().name.clone();
    let cancelled = coordinator.cancel_flag();
    tracing::info!("[sync loop] starting for project {name}");

    if let Err(e) = coordinator.verify_search_index().await {
        tracing::warn!("[sync loop] search index check of {name} failed: {e}");
    }
    let initial = coordinator.full_scan().await;
    log_result(&name, "initial scan", &initial);

    let mut ticker = match coordinator.status().mode {
        WatchMode::ScanOnly => scan_ticker(Some(scan_only_interval)),
        _ => scan_ticker(scan_interval),
    };

    while !cancelled.load(Ordering::Relaxed) {
        let retry_at = coordinator.next_retry_at();
        let result = tokio::select! {
            command = commands.recv() => match command {
                None | Some(SyncCommand::Shutdown) => break,
                Some(SyncCommand::Changes(records)) => {
                    coordinator.clear_watch_error();
                    let result = coordinator.process(records).await;
                    log_result(&name, "change batch", &result);
                    result
                }
                Some(SyncCommand::FullScan(reply)) => {
                    let result = coordinator.full_scan().await;
                    log_result(&name, "full scan", &result);
                    if let Some(reply) = reply {
                        let _ = reply.send(result.clone());
                    }
                    result
                }
                Some(SyncCommand::WatcherFailed(message)) => {
                    coordinator.record_watch_error(message);
                    if ticker.is_none() {
                        ticker = scan_ticker(Some(scan_only_interval));
                    }
                    let result = coordinator.full_scan().await;
                    log_result(&name, "rescan after watcher error", &result);
                    result
                }
            },
            _ = scan_tick(&mut ticker) => {
                let result = coordinator.full_scan().await;
                log_result(&name, "periodic scan", &result);
                result
            }
            _ = retry_tick(retry_at) => coordinator.retry_due().await,
        };
        if let Err(NotebaseError::OperationCancelled) = result {
            break;
        }
    }

    coordinator.set_mode(WatchMode::Stopped);
    if let Err(e) = coordinator.refresh_status().await {
        tracing::debug!("[sync loop] final status of {name}: {e}");
    }
    tracing::info!("[sync loop] stopped for project {name}");
}

pub struct WatchService {
    syncers: Arc<Mutex<HashMap<ProjectId, ProjectSyncer>>>,
    db: DbConnection,
    registry: ProjectRegistry,
    codecs: CodecMap,
    event_tx: Sender<Event>,
    runtime: Runtime,
    config_provider: Arc<dyn ProjectConfigProvider>,
    sync_config: SyncConfig,
}

impl WatchService {
    /// Open (or create) the service state under `root_dir`, reading `[sync]` settings from
    /// `root_dir/config.toml`.
    pub fn new(root_dir: PathBuf, event_tx: Sender<Event>) -> Result<Self, NotebaseError> {
        let config_provider = TomlConfigProvider::new(root_dir.join("config.toml"));
        let sync_config = config_provider.get_sync_config()?;
        Self::with_config(root_dir, event_tx, sync_config)
    }

    pub fn with_config(
        root_dir: PathBuf,
        event_tx: Sender<Event>,
        sync_config: SyncConfig,
    ) -> Result<Self, NotebaseError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(4)
            .enable_all()
            .build()?;

        std::fs::create_dir_all(&root_dir)?;
        let db = runtime.block_on(DbConnection::open(root_dir.join(NOTEBASE_DB)))?;

        let config_path = root_dir.join("config.toml");
        tracing::debug!("Initializing TomlConfigProvider with path: {:?}", config_path);
        let config_provider: Arc<dyn ProjectConfigProvider> =
            Arc::new(TomlConfigProvider::new(config_path));

        Ok(WatchService {
            syncers: Arc::new(Mutex::new(HashMap::new())),
            registry: ProjectRegistry::new(db.clone()),
            db,
            codecs: CODECS.clone(),
            event_tx,
            runtime,
            config_provider,
            sync_config,
        })
    }

    pub fn db_connection(&self) -> DbConnection {
        self.db.clone()
    }

    pub fn registry(&self) -> &ProjectRegistry {
        &self.registry
    }

    pub fn sync_config(&self) -> &SyncConfig {
        &self.sync_config
    }

    /// Run a future on the service runtime.
    pub fn block_on<F: std::future::Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }

    pub fn get_projects(&self) -> Result<Vec<ProjectRecord>, NotebaseError> {
        self.config_provider.get_projects()
    }

    /// Replace the configured projects (`None` re-applies the current configuration) and
    /// reconcile the running loops with them.
    pub fn set_projects(
        &self,
        new_records: Option<Vec<ProjectRecord>>,
    ) -> Result<Vec<ProjectRecord>, NotebaseError> {
        let old_records = self.get_projects()?;
        let records = new_records.unwrap_or_else(|| old_records.clone());

        let invalid_paths: Vec<&String> = records
            .iter()
            .filter(|record| !PathBuf::from(&record.path).is_dir())
            .map(|record| &record.path)
            .collect();
        if !invalid_paths.is_empty() {
            return Err(NotebaseError::NotFound(format!(
                "Project path(s) are not available: {invalid_paths:?}"
            )));
        }

        if records != old_records {
            self.config_provider.set_projects(records.clone())?;
        }
        self.reconcile_projects()?;
        Ok(records)
    }

    fn persist_registry(&self) -> Result<(), NotebaseError> {
        let records = self.block_on(self.registry.to_records())?;
        self.config_provider.set_projects(records)
    }

    pub fn add_project(&self, name: &str, path: &Path) -> Result<Project, NotebaseError> {
        let project = self.block_on(self.registry.register(name, path))?;
        self.persist_registry()?;
        if project.is_active && !self.is_running(project.id) {
            self.enable_project_syncer(&project)?;
        }
        Ok(project)
    }

    pub fn remove_project(&self, name: &str) -> Result<Project, NotebaseError> {
        let project = self.block_on(self.registry.require(name))?;
        self.disable_project_syncer(project.id)?;
        let project = self.block_on(self.registry.remove(name))?;
        self.persist_registry()?;
        Ok(project)
    }

    pub fn set_project_active(&self, name: &str, active: bool) -> Result<Project, NotebaseError> {
        let project = self.block_on(self.registry.set_active(name, active))?;
        self.persist_registry()?;
        if active && !self.is_running(project.id) {
            self.enable_project_syncer(&project)?;
        } else if !active {
            self.disable_project_syncer(project.id)?;
        }
        Ok(project)
    }

    /// Apply the configured projects to the registry, then run exactly one loop per active
    /// project. An empty configuration leaves the registry as it is.
    pub fn reconcile_projects(&self) -> Result<Vec<ProjectChange>, NotebaseError> {
        let records = self.get_projects()?;
        if records.is_empty() {
            return self.sync_running_loops().map(|_| Vec::new());
        }

        // Loops of projects about to be removed or deactivated stop before their rows change.
        let retiring = self
            .syncers
            .lock()
            .iter()
            .filter(|(_, s)| {
                !records
                    .iter()
                    .any(|r| r.name == s.project.name && r.active)
            })
            .map(|(id, _)| *id)
            .collect::<Vec<_>>();
        for project_id in retiring {
            self.disable_project_syncer(project_id)?;
        }

        let changes = self.block_on(self.registry.apply_records(&records))?;
        self.sync_running_loops()?;
        Ok(changes)
    }

    /// Run exactly one loop per active registered project.
    fn sync_running_loops(&self) -> Result<(), NotebaseError> {
        let active = self.block_on(self.registry.list_active_projects())?;
        let running = self.syncers.lock().keys().copied().collect::<Vec<_>>();
        for project_id in running {
            if !active.iter().any(|p| p.id == project_id) {
                self.disable_project_syncer(project_id)?;
            }
        }
        for project in active.iter() {
            if !self.is_running(project.id) {
                self.enable_project_syncer(project)?;
            }
        }
        Ok(())
    }

    fn is_running(&self, project_id: ProjectId) -> bool {
        self.syncers.lock().contains_key(&project_id)
    }

    /// Start the watcher and sync loop of a project.
    pub fn enable_project_syncer(&self, project: &Project) -> Result<(), NotebaseError> {
        let mut syncers = self.syncers.lock();
        if syncers.contains_key(&project.id) {
            return Err(NotebaseError::Custom(format!(
                "project '{}' is already being synchronized",
                project.name
            )));
        }

        let (command_tx, command_rx) = unbounded_channel::<SyncCommand>();
        let coordinator = SyncCoordinator::new(
            project.clone(),
            self.db.clone(),
            self.codecs.clone(),
            self.sync_config.clone(),
        )
        .with_events(self.event_tx.clone());

        let root = PathBuf::from(&project.path);
        let watcher = match create_watcher(
            &root,
            self.codecs.extensions(),
            self.sync_config.debounce(),
            command_tx.clone(),
        ) {
            Ok(watcher) => {
                coordinator.set_mode(WatchMode::Events);
                Some(watcher)
            }
            Err(e) => {
                tracing::warn!("Could not watch {:?}, falling back to periodic scans: {e}", root);
                coordinator.set_mode(WatchMode::ScanOnly);
                None
            }
        };

        let cancelled = coordinator.cancel_flag();
        let status = coordinator.status_handle();
        let handle = self.runtime.spawn(run_sync_loop(
            coordinator,
            command_rx,
            self.sync_config.scan_interval(),
            self.sync_config.scan_only_interval(),
        ));
        tracing::info!("Enabled syncer for project '{}'", project.name);
        syncers.insert(
            project.id,
            ProjectSyncer {
                project: project.clone(),
                watcher,
                commands: command_tx,
                cancelled,
                status,
                handle,
            },
        );
        Ok(())
    }

    /// Stop a project's watcher and loop, waiting for the file in progress to finish.
    pub fn disable_project_syncer(&self, project_id: ProjectId) -> Result<(), NotebaseError> {
        let Some(syncer) = self.syncers.lock().remove(&project_id) else {
            return Ok(());
        };
        syncer.cancelled.store(true, Ordering::Relaxed);
        let _ = syncer.commands.send(SyncCommand::Shutdown);
        drop(syncer.watcher);
        let name = syncer.project.name.clone();
        match self.block_on(timeout(SHUTDOWN_GRACE, syncer.handle)) {
            Ok(Ok(())) => tracing::info!("Disabled syncer for project '{name}'"),
            Ok(Err(e)) => tracing::warn!("Sync loop of '{name}' ended abnormally: {e}"),
            Err(_) => tracing::warn!("Sync loop of '{name}' did not stop within {SHUTDOWN_GRACE:?}"),
        }
        Ok(())
    }

    fn project_syncer_commands(
        &self,
        project_id: ProjectId,
    ) -> Option<UnboundedSender<SyncCommand>> {
        self.syncers
            .lock()
            .get(&project_id)
            .map(|s| s.commands.clone())
    }

    /// Queue a full scan of a project without waiting for it.
    pub fn trigger_sync(&self, name: &str) -> Result<(), NotebaseError> {
        let project = self.block_on(self.registry.require(name))?;
        match self.project_syncer_commands(project.id) {
            Some(commands) => Ok(commands.send(SyncCommand::FullScan(None))?),
            None => Err(NotebaseError::Command(format!(
                "project '{name}' is not active"
            ))),
        }
    }

    /// Run a full scan of a project and wait for its report. Inactive projects are scanned
    /// once without starting a loop.
    pub fn sync_now(&self, name: &str) -> Result<SyncReport, NotebaseError> {
        let project = self.block_on(self.registry.require(name))?;
        match self.project_syncer_commands(project.id) {
            Some(commands) => {
                let (reply_tx, reply_rx) = oneshot::channel();
                commands.send(SyncCommand::FullScan(Some(reply_tx)))?;
                self.block_on(reply_rx)?
            }
            None => {
                let mut coordinator = SyncCoordinator::new(
                    project,
                    self.db.clone(),
                    self.codecs.clone(),
                    self.sync_config.clone(),
                )
                .with_events(self.event_tx.clone());
                coordinator.set_mode(WatchMode::Stopped);
                self.block_on(coordinator.full_scan())
            }
        }
    }

    pub fn get_sync_status(&self, name: &str) -> Result<SyncStatus, NotebaseError> {
        let project = self.block_on(self.registry.require(name))?;
        if let Some(status) = self
            .syncers
            .lock()
            .get(&project.id)
            .map(|s| s.status.read().clone())
        {
            return Ok(status);
        }
        let coordinator = SyncCoordinator::new(
            project,
            self.db.clone(),
            self.codecs.clone(),
            self.sync_config.clone(),
        );
        coordinator.set_mode(WatchMode::Stopped);
        self.block_on(coordinator.refresh_status())?;
        Ok(coordinator.status())
    }
}

impl Drop for WatchService {
    fn drop(&mut self) {
        let syncers = std::mem::take(&mut *self.syncers.lock());
        for (_, syncer) in syncers {
            syncer.cancelled.store(true, Ordering::Relaxed);
            let _ = syncer.commands.send(SyncCommand::Shutdown);
            syncer.handle.abort();
        }
    }
}
