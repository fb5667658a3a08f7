//! Shared test utilities for integration tests.
//!
//! Import from integration test files as:
//! ```ignore
//! mod common;
//! ```

use notebase_core::{
    codec::CODECS,
    config::SyncConfig,
    db::{get_entity_by_path, get_relations_from, DbConnection},
    identity::IdentityResolver,
    properties::{Entity, EntityId, Project, Relation},
    registry::ProjectRegistry,
    sync::SyncCoordinator,
};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Initialize tracing for tests, respecting RUST_LOG env var.
///
/// Safe to call multiple times; subsequent calls are no-ops.
#[allow(dead_code)]
pub fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init()
        .ok();
}

/// Settings that keep tests fast: no transaction retries, immediate file retries, no
/// periodic scans.
#[allow(dead_code)]
pub fn fast_config() -> SyncConfig {
    SyncConfig {
        debounce_ms: 100,
        scan_interval_secs: 0,
        txn_retries: 0,
        retry_base_ms: 0,
        retry_cap_ms: 0,
        ..Default::default()
    }
}

#[allow(dead_code)]
pub async fn test_db(temp_dir: &TempDir) -> DbConnection {
    init_logging();
    DbConnection::open(temp_dir.path().join("notebase.db"))
        .await
        .unwrap()
}

/// A registered project rooted at `<temp_dir>/<name>`.
#[allow(dead_code)]
pub struct TestProject {
    pub root: PathBuf,
    pub db: DbConnection,
    pub project: Project,
}

#[allow(dead_code)]
impl TestProject {
    pub async fn new(temp_dir: &TempDir, name: &str) -> TestProject {
        let db = test_db(temp_dir).await;
        TestProject::with_db(temp_dir, db, name).await
    }

    pub async fn with_db(temp_dir: &TempDir, db: DbConnection, name: &str) -> TestProject {
        let root = temp_dir.path().join(name);
        std::fs::create_dir_all(&root).unwrap();
        let project = ProjectRegistry::new(db.clone())
            .register(name, &root)
            .await
            .unwrap();
        TestProject {
            root: PathBuf::from(&project.path),
            db,
            project,
        }
    }

    pub fn path(&self, rel_path: &str) -> PathBuf {
        self.root.join(rel_path)
    }

    pub fn write(&self, rel_path: &str, content: &str) {
        let path = self.path(rel_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, content).unwrap();
    }

    pub fn remove(&self, rel_path: &str) {
        std::fs::remove_file(self.path(rel_path)).unwrap();
    }

    pub fn rename(&self, from: &str, to: &str) {
        let to_path = self.path(to);
        if let Some(parent) = to_path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::rename(self.path(from), to_path).unwrap();
    }

    pub fn coordinator(&self) -> SyncCoordinator {
        self.coordinator_with(fast_config())
    }

    pub fn coordinator_with(&self, config: SyncConfig) -> SyncCoordinator {
        SyncCoordinator::new(
            self.project.clone(),
            self.db.clone(),
            CODECS.clone(),
            config,
        )
    }

    pub async fn entity(&self, rel_path: &str) -> Option<Entity> {
        let mut conn = self.db.pool.acquire().await.unwrap();
        get_entity_by_path(&mut conn, self.project.id, rel_path)
            .await
            .unwrap()
    }

    pub async fn relations_from(&self, rel_path: &str) -> Vec<Relation> {
        let entity = self.entity(rel_path).await.unwrap();
        let mut conn = self.db.pool.acquire().await.unwrap();
        get_relations_from(&mut conn, entity.id).await.unwrap()
    }

    pub async fn pending(&self) -> Vec<(EntityId, String)> {
        let mut conn = self.db.pool.acquire().await.unwrap();
        IdentityResolver::pending(&mut conn, self.project.id)
            .await
            .unwrap()
    }

    /// The project's index with row ids replaced by file paths, comparable across projects.
    pub async fn snapshot(&self) -> IndexSnapshot {
        let pid = self.project.id;
        let entities = sqlx::query_as::<_, (String, String, String, String)>(
            "SELECT file_path, permalink, title, checksum FROM entity \
             WHERE project_id = ? ORDER BY file_path",
        )
        .bind(pid)
        .fetch_all(&self.db.pool)
        .await
        .unwrap();
        let relations = sqlx::query_as::<_, (String, i64, String, String, Option<String>)>(
            "SELECT f.file_path, r.ordinal, r.relation_type, r.target_key, t.file_path \
             FROM relation r JOIN entity f ON f.id = r.from_id \
             LEFT JOIN entity t ON t.id = r.to_id \
             WHERE r.project_id = ? ORDER BY f.file_path, r.ordinal",
        )
        .bind(pid)
        .fetch_all(&self.db.pool)
        .await
        .unwrap();
        let observations = sqlx::query_as::<_, (String, i64, String, String)>(
            "SELECT e.file_path, o.ordinal, o.category, o.content \
             FROM observation o JOIN entity e ON e.id = o.entity_id \
             WHERE o.project_id = ? ORDER BY e.file_path, o.ordinal",
        )
        .bind(pid)
        .fetch_all(&self.db.pool)
        .await
        .unwrap();
        let search_rows = sqlx::query_as::<_, (String, i64)>(
            "SELECT kind, COUNT(*) FROM search_index WHERE project_id = ? GROUP BY kind ORDER BY kind",
        )
        .bind(pid)
        .fetch_all(&self.db.pool)
        .await
        .unwrap();
        IndexSnapshot {
            entities,
            observations,
            relations,
            search_rows,
        }
    }
}

#[allow(dead_code)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSnapshot {
    pub entities: Vec<(String, String, String, String)>,
    pub observations: Vec<(String, i64, String, String)>,
    /// `(from path, ordinal, type, target key, target path)`; pending relations have no target
    pub relations: Vec<(String, i64, String, String, Option<String>)>,
    pub search_rows: Vec<(String, i64)>,
}

/// Write `files` under `root`, creating directories as needed.
#[allow(dead_code)]
pub fn write_files(root: &Path, files: &[(&str, &str)]) {
    for (rel_path, content) in files {
        let path = root.join(rel_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, content).unwrap();
    }
}
