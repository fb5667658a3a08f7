//! Records stored in the index: projects, entities, their observations and relations, and the
//! per-file sync state that lets a restart resume without rehashing unchanged files.
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fmt::{Display, Formatter},
    str::FromStr,
    time::{SystemTime, UNIX_EPOCH},
};

#[cfg(feature = "service")]
use sqlx::{sqlite::SqliteRow, FromRow, Row};

use crate::error::NotebaseError;

pub type ProjectId = i64;
pub type EntityId = i64;
pub type ObservationId = i64;
pub type RelationId = i64;

/// Frontmatter keys other than the ones promoted to entity columns.
pub type Metadata = BTreeMap<String, serde_json::Value>;

pub const DEFAULT_ENTITY_TYPE: &str = "note";

/// Milliseconds since the unix epoch; times before the epoch clamp to zero.
pub fn unix_millis(time: SystemTime) -> i64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

pub fn now_millis() -> i64 {
    unix_millis(SystemTime::now())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub id: ProjectId,
    pub name: String,
    /// Canonical absolute root directory
    pub path: String,
    pub is_active: bool,
    pub is_default: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    pub project_id: ProjectId,
    pub permalink: String,
    pub title: String,
    pub entity_type: String,
    pub file_path: String,
    pub checksum: String,
    pub mtime: i64,
    /// Permalink came from frontmatter rather than the file path
    pub permalink_explicit: bool,
    pub metadata: Metadata,
    pub parse_error: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Observation {
    pub id: ObservationId,
    pub entity_id: EntityId,
    pub project_id: ProjectId,
    pub category: String,
    pub content: String,
    pub context: Option<String>,
    pub tags: Vec<String>,
    pub ordinal: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relation {
    pub id: RelationId,
    pub project_id: ProjectId,
    pub from_id: EntityId,
    /// `None` while the target is a pending reference
    pub to_id: Option<EntityId>,
    /// Target text as written in the source document
    pub to_name: String,
    /// Normalized lookup key derived from `to_name`
    pub target_key: String,
    pub relation_type: String,
    pub context: Option<String>,
    pub ordinal: i64,
}

impl Relation {
    pub fn is_resolved(&self) -> bool {
        self.to_id.is_some()
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileStatus {
    #[default]
    Ok,
    /// Reconciliation failed too many times; not retried until the content changes
    Error,
}

impl Display for FileStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            FileStatus::Ok => write!(f, "ok"),
            FileStatus::Error => write!(f, "error"),
        }
    }
}

impl FromStr for FileStatus {
    type Err = NotebaseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ok" => Ok(FileStatus::Ok),
            "error" => Ok(FileStatus::Error),
            other => Err(NotebaseError::Serialization(format!(
                "unknown file status '{other}'"
            ))),
        }
    }
}

/// Persisted per-file sync state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileState {
    pub project_id: ProjectId,
    pub path: String,
    pub checksum: String,
    pub mtime: i64,
    pub size: i64,
    pub status: FileStatus,
    pub attempts: i64,
    pub last_error: Option<String>,
    pub updated_at: i64,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMeta {
    pub project_id: ProjectId,
    pub last_scan_at: Option<i64>,
    pub last_sync_at: Option<i64>,
    pub last_error: Option<String>,
}

#[cfg(feature = "service")]
impl FromRow<'_, SqliteRow> for Project {
    fn from_row(row: &SqliteRow) -> sqlx::Result<Self> {
        Ok(Project {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            path: row.try_get("path")?,
            is_active: row.try_get("is_active")?,
            is_default: row.try_get("is_default")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[cfg(feature = "service")]
impl FromRow<'_, SqliteRow> for Entity {
    fn from_row(row: &SqliteRow) -> sqlx::Result<Self> {
        let metadata_str: &str = row.try_get("metadata")?;
        let metadata = serde_json::from_str::<Metadata>(metadata_str)
            .map_err(|e| sqlx::Error::Decode(Box::new(e)))?;
        Ok(Entity {
            id: row.try_get("id")?,
            project_id: row.try_get("project_id")?,
            permalink: row.try_get("permalink")?,
            title: row.try_get("title")?,
            entity_type: row.try_get("entity_type")?,
            file_path: row.try_get("file_path")?,
            checksum: row.try_get("checksum")?,
            mtime: row.try_get("mtime")?,
            permalink_explicit: row.try_get("permalink_explicit")?,
            metadata,
            parse_error: row.try_get("parse_error")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[cfg(feature = "service")]
impl FromRow<'_, SqliteRow> for Observation {
    fn from_row(row: &SqliteRow) -> sqlx::Result<Self> {
        let tags_str: &str = row.try_get("tags")?;
        let tags = serde_json::from_str::<Vec<String>>(tags_str)
            .map_err(|e| sqlx::Error::Decode(Box::new(e)))?;
        Ok(Observation {
            id: row.try_get("id")?,
            entity_id: row.try_get("entity_id")?,
            project_id: row.try_get("project_id")?,
            category: row.try_get("category")?,
            content: row.try_get("content")?,
            context: row.try_get("context")?,
            tags,
            ordinal: row.try_get("ordinal")?,
        })
    }
}

#[cfg(feature = "service")]
impl FromRow<'_, SqliteRow> for Relation {
    fn from_row(row: &SqliteRow) -> sqlx::Result<Self> {
        Ok(Relation {
            id: row.try_get("id")?,
            project_id: row.try_get("project_id")?,
            from_id: row.try_get("from_id")?,
            to_id: row.try_get("to_id")?,
            to_name: row.try_get("to_name")?,
            target_key: row.try_get("target_key")?,
            relation_type: row.try_get("relation_type")?,
            context: row.try_get("context")?,
            ordinal: row.try_get("ordinal")?,
        })
    }
}

#[cfg(feature = "service")]
impl FromRow<'_, SqliteRow> for FileState {
    fn from_row(row: &SqliteRow) -> sqlx::Result<Self> {
        let status_str: &str = row.try_get("status")?;
        let status =
            FileStatus::from_str(status_str).map_err(|e| sqlx::Error::Decode(Box::new(e)))?;
        Ok(FileState {
            project_id: row.try_get("project_id")?,
            path: row.try_get("path")?,
            checksum: row.try_get("checksum")?,
            mtime: row.try_get("mtime")?,
            size: row.try_get("size")?,
            status,
            attempts: row.try_get("attempts")?,
            last_error: row.try_get("last_error")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[cfg(feature = "service")]
impl FromRow<'_, SqliteRow> for SyncMeta {
    fn from_row(row: &SqliteRow) -> sqlx::Result<Self> {
        Ok(SyncMeta {
            project_id: row.try_get("project_id")?,
            last_scan_at: row.try_get("last_scan_at")?,
            last_sync_at: row.try_get("last_sync_at")?,
            last_error: row.try_get("last_error")?,
        })
    }
}
