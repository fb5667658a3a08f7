//! Shared test utilities for index store testing

use crate::{
    changes::file_checksum,
    codec::CODECS,
    db::{db_init, get_entity_by_path, DbConnection, Transaction},
    error::NotebaseError,
    event::{FileFingerprint, IndexEvent, IndexOutcome},
    properties::{Entity, Project, ProjectId},
    registry::ProjectRegistry,
};
use std::path::Path;
use tempfile::TempDir;

/// Initialize logging for tests
pub fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init()
        .ok();
}

/// A fresh database in `dir` with one project rooted at `dir/<name>`.
pub async fn test_project(dir: &TempDir, name: &str) -> (DbConnection, Project) {
    init_logging();
    let db = DbConnection::new(db_init(dir.path().join("test.db")).await.unwrap());
    let root = dir.path().join(name);
    std::fs::create_dir_all(&root).unwrap();
    let project = ProjectRegistry::new(db.clone())
        .register(name, &root)
        .await
        .unwrap();
    (db, project)
}

pub fn fingerprint(content: &str) -> FileFingerprint {
    FileFingerprint {
        checksum: file_checksum(content.as_bytes()),
        mtime: 0,
        size: content.len() as i64,
    }
}

/// Parse `content` as if it had been read from `path`.
pub fn indexed(path: &str, content: &str) -> IndexEvent {
    let (document, parse_error) = CODECS.parse_bytes(path, content.as_bytes()).unwrap();
    IndexEvent::DocumentIndexed {
        path: path.to_string(),
        document,
        text: content.to_string(),
        fingerprint: fingerprint(content),
        parse_error: parse_error.map(|e| e.to_string()),
    }
}

pub fn moved(from: &str, to: &str, content: &str) -> IndexEvent {
    let (document, parse_error) = CODECS.parse_bytes(to, content.as_bytes()).unwrap();
    IndexEvent::DocumentMoved {
        from: from.to_string(),
        to: to.to_string(),
        fingerprint: fingerprint(content),
        document,
        text: content.to_string(),
        parse_error: parse_error.map(|e| e.to_string()),
    }
}

pub fn removed(path: &str) -> IndexEvent {
    IndexEvent::DocumentRemoved {
        path: path.to_string(),
    }
}

/// Apply a single event in its own transaction.
pub async fn apply(
    db: &DbConnection,
    project_id: ProjectId,
    event: IndexEvent,
) -> Result<IndexOutcome, NotebaseError> {
    let mut txn = Transaction::new(project_id);
    txn.add_event(event);
    Ok(txn.execute(db).await?.remove(0))
}

pub async fn entity_at(db: &DbConnection, project_id: ProjectId, path: &str) -> Option<Entity> {
    let mut conn = db.pool.acquire().await.unwrap();
    get_entity_by_path(&mut conn, project_id, path).await.unwrap()
}

pub fn write_note(root: &Path, rel_path: &str, content: &str) {
    let path = root.join(rel_path);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, content).unwrap();
}
