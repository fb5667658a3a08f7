//! SQLite-backed index store.
//!
//! Every write goes through a [`Transaction`]: a list of [`IndexEvent`]s for one project applied
//! inside a single SQLite transaction, so the entity row, its observations, relations, lookup
//! keys, search rows and file sync state always change together. Readers use the shared pool in
//! WAL mode and only ever see committed state.
use crate::{
    codec::{ParsedDocument, ParsedObservation},
    config::SyncConfig,
    error::NotebaseError,
    event::{FileFingerprint, IndexEvent, IndexOutcome},
    identity::{IdentityResolver, PermalinkAssignment},
    nodekey::{entity_keys, NodeKey},
    paths::string_to_os_path,
    properties::{
        now_millis, Entity, EntityId, FileState, FileStatus, Metadata, Observation, ProjectId,
        Relation, SyncMeta,
    },
    search,
};
use futures_core::future::BoxFuture;
use parking_lot::Mutex;
use sqlx::{
    error::BoxDynError,
    migrate::{Migration as SqlxMigration, MigrationSource, MigrationType, Migrator},
    sqlite::{
        Sqlite, SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePoolOptions,
        SqliteSynchronous,
    },
    ConnectOptions, Pool,
};
use std::{
    collections::{BTreeMap, HashMap},
    path::{Path, PathBuf},
    result::Result,
    sync::Arc,
    time::Duration,
};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

pub const NOTEBASE_DB: &str = "notebase.db";

/// Per-project write serialization. Projects never wait on each other's locks.
type WriteLocks = Arc<Mutex<HashMap<ProjectId, Arc<AsyncMutex<()>>>>>;

#[derive(Debug, Clone)]
pub struct DbConnection {
    pub pool: Pool<Sqlite>,
    write_locks: WriteLocks,
}

impl DbConnection {
    pub fn new(pool: Pool<Sqlite>) -> DbConnection {
        DbConnection {
            pool,
            write_locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn open(db_path: PathBuf) -> Result<DbConnection, NotebaseError> {
        Ok(DbConnection::new(db_init(db_path).await?))
    }

    /// Held for the duration of every write transaction against `project_id`.
    pub async fn project_write_lock(&self, project_id: ProjectId) -> OwnedMutexGuard<()> {
        let lock = self
            .write_locks
            .lock()
            .entry(project_id)
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    pub fn forget_project(&self, project_id: ProjectId) {
        self.write_locks.lock().remove(&project_id);
    }

    pub async fn file_states(
        &self,
        project_id: ProjectId,
    ) -> Result<BTreeMap<String, FileState>, NotebaseError> {
        let rows = sqlx::query_as::<_, FileState>("SELECT * FROM file_state WHERE project_id = ?")
            .bind(project_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|s| (s.path.clone(), s)).collect())
    }

    pub async fn sync_meta(&self, project_id: ProjectId) -> Result<SyncMeta, NotebaseError> {
        let meta = sqlx::query_as::<_, SyncMeta>("SELECT * FROM sync_meta WHERE project_id = ?")
            .bind(project_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(meta.unwrap_or(SyncMeta {
            project_id,
            ..Default::default()
        }))
    }

    pub async fn entity_count(&self, project_id: ProjectId) -> Result<i64, NotebaseError> {
        Ok(
            sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM entity WHERE project_id = ?")
                .bind(project_id)
                .fetch_one(&self.pool)
                .await?,
        )
    }

    /// Drop and rebuild every search row of a project from the relational tables. Body text is
    /// re-read from `root` when given and readable.
    #[tracing::instrument(skip(self))]
    pub async fn rebuild_search_index(
        &self,
        project_id: ProjectId,
        root: Option<&Path>,
    ) -> Result<usize, NotebaseError> {
        let _guard = self.project_write_lock(project_id).await;
        let mut tx = self.pool.begin().await?;
        search::remove_project(&mut tx, project_id).await?;
        let entities =
            sqlx::query_as::<_, Entity>("SELECT * FROM entity WHERE project_id = ? ORDER BY id")
                .bind(project_id)
                .fetch_all(&mut *tx)
                .await?;
        for entity in entities.iter() {
            let observations = get_observations(&mut tx, entity.id).await?;
            let relations = get_relations_from(&mut tx, entity.id).await?;
            let text = match root {
                Some(root) => tokio::fs::read(root.join(string_to_os_path(&entity.file_path)))
                    .await
                    .ok()
                    .map(|bytes| String::from_utf8_lossy(&bytes).into_owned()),
                None => None,
            };
            search::index_entity(&mut tx, entity, text.as_deref(), &observations, &relations)
                .await?;
        }
        tx.commit().await?;
        tracing::info!(
            "Rebuilt search index for project {project_id}: {} entities",
            entities.len()
        );
        Ok(entities.len())
    }

    /// True when the search index holds exactly one row per entity, observation and relation of
    /// the project.
    pub async fn check_search_index(&self, project_id: ProjectId) -> Result<bool, NotebaseError> {
        let mut tx = self.pool.begin().await?;
        for (kind, table) in [
            ("entity", "entity"),
            ("observation", "observation"),
            ("relation", "relation"),
        ] {
            let indexed = sqlx::query_scalar::<_, i64>(
                "SELECT COUNT(*) FROM search_index WHERE project_id = ? AND kind = ?",
            )
            .bind(project_id)
            .bind(kind)
            .fetch_one(&mut *tx)
            .await?;
            let stored = sqlx::query_scalar::<_, i64>(&format!(
                "SELECT COUNT(*) FROM {table} WHERE project_id = ?"
            ))
            .bind(project_id)
            .fetch_one(&mut *tx)
            .await?;
            if indexed != stored {
                tracing::debug!(
                    "[DbConnection] search index holds {indexed} {kind} rows, expected {stored}"
                );
                return Ok(false);
            }
        }
        let mapped = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM search_row WHERE project_id = ?",
        )
        .bind(project_id)
        .fetch_one(&mut *tx)
        .await?;
        let indexed = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM search_index WHERE project_id = ?",
        )
        .bind(project_id)
        .fetch_one(&mut *tx)
        .await?;
        Ok(mapped == indexed)
    }
}

/// Fields of an entity row as computed from a parsed document.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityDraft {
    pub file_path: String,
    pub permalink: String,
    pub permalink_explicit: bool,
    pub title: String,
    pub entity_type: String,
    pub checksum: String,
    pub mtime: i64,
    pub metadata: Metadata,
    pub parse_error: Option<String>,
}

/// A relation ready to be written, target already resolved (or not).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRelation {
    pub relation_type: String,
    pub to_name: String,
    pub target_key: String,
    pub to_id: Option<EntityId>,
    pub context: Option<String>,
}

pub async fn get_entity_by_path(
    conn: &mut SqliteConnection,
    project_id: ProjectId,
    file_path: &str,
) -> Result<Option<Entity>, NotebaseError> {
    Ok(
        sqlx::query_as::<_, Entity>("SELECT * FROM entity WHERE project_id = ? AND file_path = ?")
            .bind(project_id)
            .bind(file_path)
            .fetch_optional(&mut *conn)
            .await?,
    )
}

pub async fn get_entity_by_permalink(
    conn: &mut SqliteConnection,
    project_id: ProjectId,
    permalink: &str,
) -> Result<Option<Entity>, NotebaseError> {
    Ok(
        sqlx::query_as::<_, Entity>("SELECT * FROM entity WHERE project_id = ? AND permalink = ?")
            .bind(project_id)
            .bind(permalink)
            .fetch_optional(&mut *conn)
            .await?,
    )
}

pub async fn get_observations(
    conn: &mut SqliteConnection,
    entity_id: EntityId,
) -> Result<Vec<Observation>, NotebaseError> {
    Ok(sqlx::query_as::<_, Observation>(
        "SELECT * FROM observation WHERE entity_id = ? ORDER BY ordinal",
    )
    .bind(entity_id)
    .fetch_all(&mut *conn)
    .await?)
}

pub async fn get_relations_from(
    conn: &mut SqliteConnection,
    entity_id: EntityId,
) -> Result<Vec<Relation>, NotebaseError> {
    Ok(
        sqlx::query_as::<_, Relation>("SELECT * FROM relation WHERE from_id = ? ORDER BY ordinal")
            .bind(entity_id)
            .fetch_all(&mut *conn)
            .await?,
    )
}

pub async fn get_relations_to(
    conn: &mut SqliteConnection,
    entity_id: EntityId,
) -> Result<Vec<Relation>, NotebaseError> {
    Ok(sqlx::query_as::<_, Relation>(
        "SELECT * FROM relation WHERE to_id = ? ORDER BY from_id, ordinal",
    )
    .bind(entity_id)
    .fetch_all(&mut *conn)
    .await?)
}

/// Insert or update the entity stored at `draft.file_path`. The permalink must already be free
/// within the project (see [IdentityResolver::assign_permalink]).
pub async fn upsert_entity(
    conn: &mut SqliteConnection,
    project_id: ProjectId,
    draft: &EntityDraft,
) -> Result<Entity, NotebaseError> {
    let now = now_millis();
    let entity = sqlx::query_as::<_, Entity>(
        "INSERT INTO entity (project_id, permalink, title, entity_type, file_path, checksum, \
             mtime, permalink_explicit, metadata, parse_error, created_at, updated_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11) \
         ON CONFLICT(project_id, file_path) DO UPDATE SET \
             permalink = excluded.permalink, title = excluded.title, \
             entity_type = excluded.entity_type, checksum = excluded.checksum, \
             mtime = excluded.mtime, permalink_explicit = excluded.permalink_explicit, \
             metadata = excluded.metadata, parse_error = excluded.parse_error, \
             updated_at = excluded.updated_at \
         RETURNING *",
    )
    .bind(project_id)
    .bind(&draft.permalink)
    .bind(&draft.title)
    .bind(&draft.entity_type)
    .bind(&draft.file_path)
    .bind(&draft.checksum)
    .bind(draft.mtime)
    .bind(draft.permalink_explicit)
    .bind(serde_json::to_string(&draft.metadata)?)
    .bind(&draft.parse_error)
    .bind(now)
    .fetch_one(&mut *conn)
    .await?;
    Ok(entity)
}

/// Remove an entity with its observations, outgoing relations, keys and search rows. Relations
/// from other entities that pointed at it move to the next entity answering to their key, or
/// return to the pending-reference index. Returns how many of them became pending.
pub async fn delete_entity(
    conn: &mut SqliteConnection,
    project_id: ProjectId,
    entity_id: EntityId,
) -> Result<u64, NotebaseError> {
    let incoming_keys = sqlx::query_scalar::<_, String>(
        "SELECT DISTINCT target_key FROM relation \
         WHERE to_id = ? AND project_id = ? AND from_id != ?",
    )
    .bind(entity_id)
    .bind(project_id)
    .bind(entity_id)
    .fetch_all(&mut *conn)
    .await?;
    let detached = sqlx::query(
        "UPDATE relation SET to_id = NULL WHERE to_id = ? AND project_id = ? AND from_id != ?",
    )
    .bind(entity_id)
    .bind(project_id)
    .bind(entity_id)
    .execute(&mut *conn)
    .await?
    .rows_affected();
    search::remove_entity(conn, project_id, entity_id).await?;
    sqlx::query("DELETE FROM observation WHERE entity_id = ?")
        .bind(entity_id)
        .execute(&mut *conn)
        .await?;
    sqlx::query("DELETE FROM relation WHERE from_id = ?")
        .bind(entity_id)
        .execute(&mut *conn)
        .await?;
    sqlx::query("DELETE FROM entity_key WHERE entity_id = ?")
        .bind(entity_id)
        .execute(&mut *conn)
        .await?;
    sqlx::query("DELETE FROM entity WHERE id = ? AND project_id = ?")
        .bind(entity_id)
        .bind(project_id)
        .execute(&mut *conn)
        .await?;

    let reattached = IdentityResolver::refresh_targets(
        conn,
        project_id,
        incoming_keys.iter().map(String::as_str),
    )
    .await?
    .len() as u64;
    Ok(detached.saturating_sub(reattached))
}

/// Reattach an entity to a new path (and possibly permalink), keeping its id.
pub async fn move_entity(
    conn: &mut SqliteConnection,
    project_id: ProjectId,
    entity_id: EntityId,
    file_path: &str,
    permalink: &str,
) -> Result<Entity, NotebaseError> {
    let entity = sqlx::query_as::<_, Entity>(
        "UPDATE entity SET file_path = ?, permalink = ?, updated_at = ? \
         WHERE id = ? AND project_id = ? RETURNING *",
    )
    .bind(file_path)
    .bind(permalink)
    .bind(now_millis())
    .bind(entity_id)
    .bind(project_id)
    .fetch_one(&mut *conn)
    .await?;
    Ok(entity)
}

pub async fn replace_observations(
    conn: &mut SqliteConnection,
    project_id: ProjectId,
    entity_id: EntityId,
    observations: &[ParsedObservation],
) -> Result<Vec<Observation>, NotebaseError> {
    sqlx::query("DELETE FROM observation WHERE entity_id = ?")
        .bind(entity_id)
        .execute(&mut *conn)
        .await?;
    let mut stored = Vec::with_capacity(observations.len());
    for (ordinal, obs) in observations.iter().enumerate() {
        let row = sqlx::query_as::<_, Observation>(
            "INSERT INTO observation (entity_id, project_id, category, content, context, tags, ordinal) \
             VALUES (?, ?, ?, ?, ?, ?, ?) RETURNING *",
        )
        .bind(entity_id)
        .bind(project_id)
        .bind(&obs.category)
        .bind(&obs.content)
        .bind(&obs.context)
        .bind(serde_json::to_string(&obs.tags)?)
        .bind(ordinal as i64)
        .fetch_one(&mut *conn)
        .await?;
        stored.push(row);
    }
    Ok(stored)
}

pub async fn replace_relations(
    conn: &mut SqliteConnection,
    project_id: ProjectId,
    entity_id: EntityId,
    relations: &[NewRelation],
) -> Result<Vec<Relation>, NotebaseError> {
    sqlx::query("DELETE FROM relation WHERE from_id = ?")
        .bind(entity_id)
        .execute(&mut *conn)
        .await?;
    let mut stored = Vec::with_capacity(relations.len());
    for (ordinal, rel) in relations.iter().enumerate() {
        if let Some(to_id) = rel.to_id {
            let target_project =
                sqlx::query_scalar::<_, ProjectId>("SELECT project_id FROM entity WHERE id = ?")
                    .bind(to_id)
                    .fetch_optional(&mut *conn)
                    .await?;
            if target_project != Some(project_id) {
                return Err(NotebaseError::Persistence(format!(
                    "relation target {to_id} is not an entity of project {project_id}"
                )));
            }
        }
        let row = sqlx::query_as::<_, Relation>(
            "INSERT INTO relation (project_id, from_id, to_id, to_name, target_key, relation_type, context, ordinal) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?) RETURNING *",
        )
        .bind(project_id)
        .bind(entity_id)
        .bind(rel.to_id)
        .bind(&rel.to_name)
        .bind(&rel.target_key)
        .bind(&rel.relation_type)
        .bind(&rel.context)
        .bind(ordinal as i64)
        .fetch_one(&mut *conn)
        .await?;
        stored.push(row);
    }
    Ok(stored)
}

pub async fn replace_entity_keys(
    conn: &mut SqliteConnection,
    project_id: ProjectId,
    entity_id: EntityId,
    keys: &[NodeKey],
) -> Result<(), NotebaseError> {
    sqlx::query("DELETE FROM entity_key WHERE entity_id = ?")
        .bind(entity_id)
        .execute(&mut *conn)
        .await?;
    for key in keys {
        sqlx::query(
            "INSERT OR IGNORE INTO entity_key (entity_id, project_id, key, priority) VALUES (?, ?, ?, ?)",
        )
        .bind(entity_id)
        .bind(project_id)
        .bind(&key.key)
        .bind(key.kind.priority())
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

pub async fn upsert_file_state(
    conn: &mut SqliteConnection,
    state: &FileState,
) -> Result<(), NotebaseError> {
    sqlx::query(
        "INSERT INTO file_state (project_id, path, checksum, mtime, size, status, attempts, last_error, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT(project_id, path) DO UPDATE SET \
             checksum = excluded.checksum, mtime = excluded.mtime, size = excluded.size, \
             status = excluded.status, attempts = excluded.attempts, \
             last_error = excluded.last_error, updated_at = excluded.updated_at",
    )
    .bind(state.project_id)
    .bind(&state.path)
    .bind(&state.checksum)
    .bind(state.mtime)
    .bind(state.size)
    .bind(state.status.to_string())
    .bind(state.attempts)
    .bind(&state.last_error)
    .bind(state.updated_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub async fn delete_file_state(
    conn: &mut SqliteConnection,
    project_id: ProjectId,
    path: &str,
) -> Result<(), NotebaseError> {
    sqlx::query("DELETE FROM file_state WHERE project_id = ? AND path = ?")
        .bind(project_id)
        .bind(path)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

fn ok_file_state(project_id: ProjectId, path: &str, fingerprint: &FileFingerprint) -> FileState {
    FileState {
        project_id,
        path: path.to_string(),
        checksum: fingerprint.checksum.clone(),
        mtime: fingerprint.mtime,
        size: fingerprint.size,
        status: FileStatus::Ok,
        attempts: 0,
        last_error: None,
        updated_at: now_millis(),
    }
}

/// Events for one project, applied atomically.
#[derive(Debug, Clone)]
pub struct Transaction {
    project_id: ProjectId,
    events: Vec<IndexEvent>,
    update_permalinks_on_move: bool,
}

impl Transaction {
    pub fn new(project_id: ProjectId) -> Transaction {
        Transaction {
            project_id,
            events: Vec::new(),
            update_permalinks_on_move: SyncConfig::default().update_permalinks_on_move,
        }
    }

    pub fn with_config(project_id: ProjectId, config: &SyncConfig) -> Transaction {
        Transaction {
            update_permalinks_on_move: config.update_permalinks_on_move,
            ..Transaction::new(project_id)
        }
    }

    pub fn add_event(&mut self, event: IndexEvent) {
        self.events.push(event);
    }

    pub fn staged(&self) -> usize {
        self.events.len()
    }

    pub fn events(&self) -> &[IndexEvent] {
        &self.events
    }

    /// Apply every staged event in one SQLite transaction. On error nothing is committed.
    pub async fn execute(&self, db: &DbConnection) -> Result<Vec<IndexOutcome>, NotebaseError> {
        let _guard = db.project_write_lock(self.project_id).await;
        let mut tx = db.pool.begin().await?;
        let mut outcomes = Vec::with_capacity(self.events.len());
        for event in self.events.iter() {
            let outcome = self.apply(&mut tx, event).await.map_err(|e| {
                tracing::debug!("[Transaction] rolling back after {event}: {e}");
                e
            })?;
            outcomes.push(outcome);
        }
        tx.commit().await?;
        Ok(outcomes)
    }

    async fn apply(
        &self,
        conn: &mut SqliteConnection,
        event: &IndexEvent,
    ) -> Result<IndexOutcome, NotebaseError> {
        let project_id = self.project_id;
        match event {
            IndexEvent::DocumentIndexed {
                path,
                document,
                text,
                fingerprint,
                parse_error,
            } => {
                let existing = get_entity_by_path(conn, project_id, path).await?;
                let entity = index_document(
                    conn,
                    project_id,
                    path,
                    existing.as_ref(),
                    document,
                    text,
                    fingerprint,
                    parse_error.clone(),
                )
                .await?;
                upsert_file_state(conn, &ok_file_state(project_id, path, fingerprint)).await?;
                Ok(entity)
            }
            IndexEvent::DocumentTouched { path, fingerprint } => {
                upsert_file_state(conn, &ok_file_state(project_id, path, fingerprint)).await?;
                Ok(IndexOutcome::Recorded)
            }
            IndexEvent::DocumentRemoved { path } => {
                let existing = get_entity_by_path(conn, project_id, path).await?;
                if let Some(entity) = existing.as_ref() {
                    delete_entity(conn, project_id, entity.id).await?;
                }
                delete_file_state(conn, project_id, path).await?;
                Ok(IndexOutcome::Removed {
                    entity_id: existing.map(|e| e.id),
                })
            }
            IndexEvent::DocumentMoved {
                from,
                to,
                fingerprint,
                document,
                text,
                parse_error,
            } => {
                let outcome = self
                    .apply_move(conn, from, to, fingerprint, document, text, parse_error)
                    .await?;
                delete_file_state(conn, project_id, from).await?;
                upsert_file_state(conn, &ok_file_state(project_id, to, fingerprint)).await?;
                Ok(outcome)
            }
            IndexEvent::FileFailed {
                path,
                checksum,
                error,
                attempts,
                parked,
            } => {
                if *parked {
                    let previous = sqlx::query_as::<_, FileState>(
                        "SELECT * FROM file_state WHERE project_id = ? AND path = ?",
                    )
                    .bind(project_id)
                    .bind(path)
                    .fetch_optional(&mut *conn)
                    .await?;
                    upsert_file_state(
                        conn,
                        &FileState {
                            project_id,
                            path: path.clone(),
                            checksum: checksum.clone(),
                            mtime: previous.as_ref().map(|p| p.mtime).unwrap_or_default(),
                            size: previous.as_ref().map(|p| p.size).unwrap_or_default(),
                            status: FileStatus::Error,
                            attempts: *attempts,
                            last_error: Some(error.clone()),
                            updated_at: now_millis(),
                        },
                    )
                    .await?;
                }
                record_sync_meta(conn, project_id, None, None, Some(error)).await?;
                Ok(IndexOutcome::Recorded)
            }
            IndexEvent::BatchCompleted {
                at,
                full_scan,
                last_error,
            } => {
                let scan_at = full_scan.then_some(*at);
                record_sync_meta(conn, project_id, Some(*at), scan_at, last_error.as_deref())
                    .await?;
                Ok(IndexOutcome::Recorded)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn apply_move(
        &self,
        conn: &mut SqliteConnection,
        from: &str,
        to: &str,
        fingerprint: &FileFingerprint,
        document: &ParsedDocument,
        text: &str,
        parse_error: &Option<String>,
    ) -> Result<IndexOutcome, NotebaseError> {
        let project_id = self.project_id;
        let Some(entity) = get_entity_by_path(conn, project_id, from).await? else {
            tracing::debug!("[Transaction] move source {from} is not indexed, indexing {to}");
            let existing = get_entity_by_path(conn, project_id, to).await?;
            return index_document(
                conn,
                project_id,
                to,
                existing.as_ref(),
                document,
                text,
                fingerprint,
                parse_error.clone(),
            )
            .await;
        };

        if let Some(occupant) = get_entity_by_path(conn, project_id, to).await? {
            if occupant.id != entity.id {
                delete_entity(conn, project_id, occupant.id).await?;
            }
        }

        let permalink = if entity.permalink_explicit || !self.update_permalinks_on_move {
            entity.permalink.clone()
        } else {
            IdentityResolver::assign_permalink(conn, project_id, to, document, Some(&entity))
                .await?
                .permalink
        };
        let moved = move_entity(conn, project_id, entity.id, to, &permalink).await?;

        if moved.checksum != fingerprint.checksum {
            return index_document(
                conn,
                project_id,
                to,
                Some(&moved),
                document,
                text,
                fingerprint,
                parse_error.clone(),
            )
            .await;
        }

        let keys = entity_keys(&moved.permalink, &moved.title, &document.aliases);
        replace_entity_keys(conn, project_id, moved.id, &keys).await?;
        IdentityResolver::revalidate_incoming(conn, project_id, moved.id, &keys).await?;
        IdentityResolver::claim_keys(conn, project_id, moved.id, &keys).await?;
        let observations = get_observations(conn, moved.id).await?;
        let relations = get_relations_from(conn, moved.id).await?;
        search::index_entity(conn, &moved, Some(text), &observations, &relations).await?;
        tracing::debug!("[Transaction] moved entity {} {from} -> {to}", moved.id);
        Ok(IndexOutcome::Moved {
            entity_id: moved.id,
            permalink: moved.permalink,
        })
    }
}

/// Write a parsed document: entity row, keys, observations, relations, search rows and the
/// retargeting of relations that name one of its keys. `existing` is the entity currently stored for this file, if any.
#[allow(clippy::too_many_arguments)]
async fn index_document(
    conn: &mut SqliteConnection,
    project_id: ProjectId,
    path: &str,
    existing: Option<&Entity>,
    document: &ParsedDocument,
    text: &str,
    fingerprint: &FileFingerprint,
    parse_error: Option<String>,
) -> Result<IndexOutcome, NotebaseError> {
    if let Some(entity) = existing {
        if entity.file_path == path
            && entity.checksum == fingerprint.checksum
            && entity.parse_error == parse_error
        {
            tracing::debug!("[Transaction] {path} unchanged, skipping");
            return Ok(IndexOutcome::Upserted {
                entity_id: entity.id,
                permalink: entity.permalink.clone(),
                promoted: 0,
            });
        }
    }

    let PermalinkAssignment {
        permalink,
        explicit,
        conflict,
    } = IdentityResolver::assign_permalink(conn, project_id, path, document, existing).await?;
    if let Some(conflict) = conflict {
        tracing::warn!("{}", NotebaseError::from(conflict));
    }

    let entity = upsert_entity(
        conn,
        project_id,
        &EntityDraft {
            file_path: path.to_string(),
            permalink,
            permalink_explicit: explicit,
            title: document.title.clone(),
            entity_type: document.entity_type.clone(),
            checksum: fingerprint.checksum.clone(),
            mtime: fingerprint.mtime,
            metadata: document.metadata.clone(),
            parse_error,
        },
    )
    .await?;

    let keys = entity_keys(&entity.permalink, &entity.title, &document.aliases);
    replace_entity_keys(conn, project_id, entity.id, &keys).await?;
    let observations =
        replace_observations(conn, project_id, entity.id, &document.observations).await?;

    let mut new_relations = Vec::with_capacity(document.relations.len());
    for rel in document.relations.iter() {
        let target_key = rel.target_key();
        let to_id = IdentityResolver::resolve_target(conn, project_id, &target_key).await?;
        new_relations.push(NewRelation {
            relation_type: rel.relation_type.clone(),
            to_name: rel.target.clone(),
            target_key,
            to_id,
            context: rel.context.clone(),
        });
    }
    let relations = replace_relations(conn, project_id, entity.id, &new_relations).await?;

    if existing.is_some() {
        IdentityResolver::revalidate_incoming(conn, project_id, entity.id, &keys).await?;
    }
    let promoted = IdentityResolver::claim_keys(conn, project_id, entity.id, &keys).await?;
    search::index_entity(conn, &entity, Some(text), &observations, &relations).await?;

    tracing::debug!(
        "[Transaction] indexed {path} as '{}' ({} observations, {} relations, {promoted} promoted)",
        entity.permalink,
        observations.len(),
        relations.len()
    );
    Ok(IndexOutcome::Upserted {
        entity_id: entity.id,
        permalink: entity.permalink,
        promoted,
    })
}

async fn record_sync_meta(
    conn: &mut SqliteConnection,
    project_id: ProjectId,
    sync_at: Option<i64>,
    scan_at: Option<i64>,
    last_error: Option<&str>,
) -> Result<(), NotebaseError> {
    sqlx::query(
        "INSERT INTO sync_meta (project_id, last_sync_at, last_scan_at, last_error) VALUES (?1, ?2, ?3, ?4) \
         ON CONFLICT(project_id) DO UPDATE SET \
             last_sync_at = COALESCE(?2, last_sync_at), \
             last_scan_at = COALESCE(?3, last_scan_at), \
             last_error = ?4",
    )
    .bind(project_id)
    .bind(sync_at)
    .bind(scan_at)
    .bind(last_error)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub struct Migration {
    pub version: i64,
    pub description: &'static str,
    pub sql: &'static str,
    pub kind: MigrationType,
}

#[derive(Debug, Clone)]
struct MigrationList(Vec<(i64, &'static str, &'static str)>);

impl MigrationSource<'static> for MigrationList {
    fn resolve(self) -> BoxFuture<'static, Result<Vec<SqlxMigration>, BoxDynError>> {
        Box::pin(async move {
            let mut migrations = Vec::new();
            for (version, description, sql) in self.0 {
                migrations.push(SqlxMigration::new(
                    version,
                    description.into(),
                    MigrationType::ReversibleUp,
                    sql.into(),
                    false,
                ));
            }
            Ok(migrations)
        })
    }
}

impl From<&[Migration]> for MigrationList {
    fn from(migrations: &[Migration]) -> Self {
        MigrationList(
            migrations
                .iter()
                .filter(|m| matches!(m.kind, MigrationType::ReversibleUp))
                .map(|m| (m.version, m.description, m.sql))
                .collect(),
        )
    }
}

pub const MIGRATIONS: [Migration; 3] = [
    Migration {
        version: 1,
        description: "create_initial_tables",
        sql: "\
        CREATE TABLE project ( \
            id INTEGER PRIMARY KEY AUTOINCREMENT, \
            name TEXT NOT NULL UNIQUE, \
            path TEXT NOT NULL, \
            is_active INTEGER NOT NULL DEFAULT 1, \
            is_default INTEGER NOT NULL DEFAULT 0, \
            created_at INTEGER NOT NULL, \
            updated_at INTEGER NOT NULL); \
        CREATE TABLE entity ( \
            id INTEGER PRIMARY KEY AUTOINCREMENT, \
            project_id INTEGER NOT NULL REFERENCES project(id) ON DELETE CASCADE, \
            permalink TEXT NOT NULL, \
            title TEXT NOT NULL, \
            entity_type TEXT NOT NULL, \
            file_path TEXT NOT NULL, \
            checksum TEXT NOT NULL, \
            mtime INTEGER NOT NULL, \
            permalink_explicit INTEGER NOT NULL DEFAULT 0, \
            metadata TEXT NOT NULL DEFAULT '{}', \
            parse_error TEXT, \
            created_at INTEGER NOT NULL, \
            updated_at INTEGER NOT NULL, \
            UNIQUE(project_id, permalink), \
            UNIQUE(project_id, file_path)); \
        CREATE TABLE entity_key ( \
            entity_id INTEGER NOT NULL REFERENCES entity(id) ON DELETE CASCADE, \
            project_id INTEGER NOT NULL, \
            key TEXT NOT NULL, \
            priority INTEGER NOT NULL, \
            UNIQUE(entity_id, key)); \
        CREATE INDEX idx_entity_key ON entity_key(project_id, key, priority); \
        CREATE TABLE observation ( \
            id INTEGER PRIMARY KEY AUTOINCREMENT, \
            entity_id INTEGER NOT NULL REFERENCES entity(id) ON DELETE CASCADE, \
            project_id INTEGER NOT NULL, \
            category TEXT NOT NULL, \
            content TEXT NOT NULL, \
            context TEXT, \
            tags TEXT NOT NULL DEFAULT '[]', \
            ordinal INTEGER NOT NULL); \
        CREATE INDEX idx_observation_entity ON observation(entity_id); \
        CREATE TABLE relation ( \
            id INTEGER PRIMARY KEY AUTOINCREMENT, \
            project_id INTEGER NOT NULL, \
            from_id INTEGER NOT NULL REFERENCES entity(id) ON DELETE CASCADE, \
            to_id INTEGER REFERENCES entity(id) ON DELETE SET NULL, \
            to_name TEXT NOT NULL, \
            target_key TEXT NOT NULL, \
            relation_type TEXT NOT NULL, \
            context TEXT, \
            ordinal INTEGER NOT NULL); \
        CREATE INDEX idx_relation_from ON relation(from_id); \
        CREATE INDEX idx_relation_to ON relation(to_id); \
        CREATE INDEX idx_relation_pending ON relation(project_id, target_key) WHERE to_id IS NULL; \
        CREATE TABLE file_state ( \
            project_id INTEGER NOT NULL REFERENCES project(id) ON DELETE CASCADE, \
            path TEXT NOT NULL, \
            checksum TEXT NOT NULL, \
            mtime INTEGER NOT NULL, \
            size INTEGER NOT NULL, \
            status TEXT NOT NULL, \
            attempts INTEGER NOT NULL DEFAULT 0, \
            last_error TEXT, \
            updated_at INTEGER NOT NULL, \
            PRIMARY KEY(project_id, path)); \
        CREATE TABLE sync_meta ( \
            project_id INTEGER PRIMARY KEY REFERENCES project(id) ON DELETE CASCADE, \
            last_scan_at INTEGER, \
            last_sync_at INTEGER, \
            last_error TEXT);",
        kind: MigrationType::ReversibleUp,
    },
    Migration {
        version: 2,
        description: "create_search_index",
        sql: "\
        CREATE VIRTUAL TABLE search_index USING fts5( \
            title, \
            content_stems, \
            permalink, \
            directory, \
            content_snippet UNINDEXED, \
            file_path UNINDEXED, \
            kind UNINDEXED, \
            project_id UNINDEXED, \
            entity_id UNINDEXED, \
            item_id UNINDEXED, \
            entity_type UNINDEXED, \
            category UNINDEXED, \
            relation_type UNINDEXED, \
            updated_at UNINDEXED, \
            tokenize = \"unicode61 tokenchars '/'\", \
            prefix = '2 3 4');",
        kind: MigrationType::ReversibleUp,
    },
    Migration {
        version: 3,
        description: "index_relation_targets_and_search_rows",
        sql: "\
        CREATE INDEX idx_relation_target ON relation(project_id, target_key); \
        CREATE TABLE search_row ( \
            search_rowid INTEGER PRIMARY KEY, \
            project_id INTEGER NOT NULL, \
            entity_id INTEGER NOT NULL); \
        CREATE INDEX idx_search_row_entity ON search_row(project_id, entity_id); \
        INSERT INTO search_row (search_rowid, project_id, entity_id) \
            SELECT rowid, project_id, entity_id FROM search_index;",
        kind: MigrationType::ReversibleUp,
    },
];

#[tracing::instrument]
pub async fn db_init(db_path: PathBuf) -> Result<Pool<Sqlite>, NotebaseError> {
    tracing::debug!("Initializing index db from file: {:?}", db_path);
    let options = SqliteConnectOptions::new()
        .filename(&db_path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(5))
        .disable_statement_logging();

    let pool = SqlitePoolOptions::new()
        .max_connections(8)
        .connect_with(options)
        .await?;

    let migrator = Migrator::new(MigrationList::from(&MIGRATIONS[..])).await?;
    migrator.run(&pool).await?;

    let projects = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM project")
        .fetch_one(&pool)
        .await?;
    let entities = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM entity")
        .fetch_one(&pool)
        .await?;
    tracing::info!(
        "DB Connection initialized.\n \
         \tProject count:\t{projects} \n \
         \tEntity count:\t{entities}"
    );

    Ok(pool)
}
