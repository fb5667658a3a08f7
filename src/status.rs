//! Sync status reported per project.
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

use crate::properties::ProjectId;

/// Change detector lifecycle: `Idle → Scanning → Diffing → Dispatched → Idle`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DetectorState {
    #[default]
    Idle,
    Scanning,
    Diffing,
    Dispatched,
}

/// How a project learns about changes.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WatchMode {
    /// File system notifications plus periodic scans
    #[default]
    Events,
    /// The watcher could not be started; periodic scans only
    ScanOnly,
    /// No loop is running for the project
    Stopped,
}

/// Per-file reconciliation state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileSyncState {
    Detected,
    Parsing,
    Resolving,
    Persisting,
    Committed,
    Failed,
}

impl Display for FileSyncState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FileSyncState::Detected => "detected",
            FileSyncState::Parsing => "parsing",
            FileSyncState::Resolving => "resolving",
            FileSyncState::Persisting => "persisting",
            FileSyncState::Committed => "committed",
            FileSyncState::Failed => "failed",
        };
        write!(f, "{name}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParkedFile {
    pub path: String,
    pub attempts: i64,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub project_id: ProjectId,
    pub project: String,
    /// Records waiting to be processed, retries included
    pub pending: usize,
    pub last_sync: Option<i64>,
    pub last_scan: Option<i64>,
    pub last_error: Option<String>,
    pub entity_count: i64,
    pub parked: usize,
    pub parked_files: Vec<ParkedFile>,
    pub state: DetectorState,
    pub mode: WatchMode,
}
