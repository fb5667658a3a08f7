use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

use crate::{
    codec::ParsedDocument,
    properties::{EntityId, ProjectId},
};

/// Metadata read from disk alongside the bytes that were parsed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileFingerprint {
    pub checksum: String,
    pub mtime: i64,
    pub size: i64,
}

/// A unit of work for the index store. All events staged in one
/// [`Transaction`](crate::db::Transaction) commit or roll back together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum IndexEvent {
    /// Parsed content for a new or changed file
    DocumentIndexed {
        path: String,
        document: ParsedDocument,
        /// Decoded file text, fed to the full-text index
        text: String,
        fingerprint: FileFingerprint,
        parse_error: Option<String>,
    },
    /// File content unchanged, only its mtime moved
    DocumentTouched {
        path: String,
        fingerprint: FileFingerprint,
    },
    DocumentRemoved {
        path: String,
    },
    /// File moved, possibly with changed content. The entity keeps its id.
    DocumentMoved {
        from: String,
        to: String,
        fingerprint: FileFingerprint,
        document: ParsedDocument,
        text: String,
        parse_error: Option<String>,
    },
    /// Reconciliation of a file failed; `parked` once retries are exhausted
    FileFailed {
        path: String,
        checksum: String,
        error: String,
        attempts: i64,
        parked: bool,
    },
    /// End of a reconciliation batch; recorded in the project's sync metadata
    BatchCompleted {
        at: i64,
        full_scan: bool,
        last_error: Option<String>,
    },
}

impl IndexEvent {
    /// File the event is about, if any.
    pub fn path(&self) -> Option<&str> {
        match self {
            IndexEvent::DocumentIndexed { path, .. }
            | IndexEvent::DocumentTouched { path, .. }
            | IndexEvent::DocumentRemoved { path }
            | IndexEvent::FileFailed { path, .. } => Some(path),
            IndexEvent::DocumentMoved { to, .. } => Some(to),
            IndexEvent::BatchCompleted { .. } => None,
        }
    }
}

impl Display for IndexEvent {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            IndexEvent::DocumentIndexed { path, document, .. } => write!(
                f,
                "DocumentIndexed({path}, {} observations, {} relations)",
                document.observations.len(),
                document.relations.len()
            ),
            IndexEvent::DocumentTouched { path, .. } => write!(f, "DocumentTouched({path})"),
            IndexEvent::DocumentRemoved { path } => write!(f, "DocumentRemoved({path})"),
            IndexEvent::DocumentMoved { from, to, .. } => write!(f, "DocumentMoved({from} -> {to})"),
            IndexEvent::FileFailed {
                path,
                attempts,
                parked,
                ..
            } => write!(f, "FileFailed({path}, attempt {attempts}, parked: {parked})"),
            IndexEvent::BatchCompleted { at, full_scan, .. } => {
                write!(f, "BatchCompleted({at}, full scan: {full_scan})")
            }
        }
    }
}

/// What a committed [IndexEvent] did to the index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexOutcome {
    Upserted {
        entity_id: EntityId,
        permalink: String,
        promoted: u64,
    },
    Removed {
        entity_id: Option<EntityId>,
    },
    Moved {
        entity_id: EntityId,
        permalink: String,
    },
    Recorded,
}

/// Notifications delivered to observers of the watch service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub enum Event {
    #[default]
    Ping,
    /// An event committed to a project's index
    Index(ProjectId, IndexEvent),
    /// A project's sync status changed
    Status(crate::status::SyncStatus),
}

impl Display for Event {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Event::Ping => write!(f, "Ping"),
            Event::Index(project_id, event) => write!(f, "Index(project {project_id}, {event})"),
            Event::Status(status) => write!(
                f,
                "Status({}, pending {}, parked {})",
                status.project, status.pending, status.parked
            ),
        }
    }
}
