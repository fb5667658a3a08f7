use super::helpers::*;
use crate::{
    db::{get_observations, Transaction},
    error::NotebaseError,
    event::IndexEvent,
    properties::FileStatus,
};
use tempfile::TempDir;
use test_log::test;

async fn search_rows(db: &crate::db::DbConnection, project_id: i64, path: &str) -> i64 {
    sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM search_index WHERE project_id = ? AND file_path = ?",
    )
    .bind(project_id)
    .bind(path)
    .fetch_one(&db.pool)
    .await
    .unwrap()
}

#[test(tokio::test)]
async fn test_failed_transaction_leaves_no_trace() {
    let dir = TempDir::new().unwrap();
    let (db, project) = test_project(&dir, "notes").await;
    sqlx::query(
        "CREATE TRIGGER reject_boom BEFORE INSERT ON observation WHEN NEW.content = 'boom' \
         BEGIN SELECT RAISE(ABORT, 'rejected'); END",
    )
    .execute(&db.pool)
    .await
    .unwrap();

    let result = apply(&db, project.id, indexed("c.md", "- [fact] boom\n")).await;
    assert!(matches!(result, Err(NotebaseError::Persistence(_))));
    assert!(entity_at(&db, project.id, "c.md").await.is_none());
    assert!(db.file_states(project.id).await.unwrap().is_empty());
    assert_eq!(search_rows(&db, project.id, "c.md").await, 0);

    // A failing update keeps the previous version intact.
    apply(&db, project.id, indexed("c.md", "- [fact] fine\n"))
        .await
        .unwrap();
    let before = entity_at(&db, project.id, "c.md").await.unwrap();
    assert!(apply(&db, project.id, indexed("c.md", "- [fact] boom\n"))
        .await
        .is_err());
    let after = entity_at(&db, project.id, "c.md").await.unwrap();
    assert_eq!(after.checksum, before.checksum);
    let mut conn = db.pool.acquire().await.unwrap();
    let observations = get_observations(&mut conn, after.id).await.unwrap();
    assert_eq!(observations.len(), 1);
    assert_eq!(observations[0].content, "fine");
    assert_eq!(
        db.file_states(project.id).await.unwrap()["c.md"].checksum,
        before.checksum
    );
}

#[test(tokio::test)]
async fn test_transaction_is_all_or_nothing() {
    let dir = TempDir::new().unwrap();
    let (db, project) = test_project(&dir, "notes").await;
    sqlx::query(
        "CREATE TRIGGER reject_boom BEFORE INSERT ON observation WHEN NEW.content = 'boom' \
         BEGIN SELECT RAISE(ABORT, 'rejected'); END",
    )
    .execute(&db.pool)
    .await
    .unwrap();

    let mut txn = Transaction::new(project.id);
    txn.add_event(indexed("a.md", "- [fact] fine\n"));
    txn.add_event(indexed("b.md", "- [fact] boom\n"));
    assert_eq!(txn.staged(), 2);
    assert!(txn.execute(&db).await.is_err());
    assert_eq!(db.entity_count(project.id).await.unwrap(), 0);
}

#[test(tokio::test)]
async fn test_file_state_follows_index() {
    let dir = TempDir::new().unwrap();
    let (db, project) = test_project(&dir, "notes").await;
    let content = "# A\n";
    apply(&db, project.id, indexed("a.md", content)).await.unwrap();
    let state = db.file_states(project.id).await.unwrap()["a.md"].clone();
    assert_eq!(state.checksum, fingerprint(content).checksum);
    assert_eq!(state.status, FileStatus::Ok);

    let mut touched = fingerprint(content);
    touched.mtime = 42;
    apply(
        &db,
        project.id,
        IndexEvent::DocumentTouched {
            path: "a.md".to_string(),
            fingerprint: touched,
        },
    )
    .await
    .unwrap();
    assert_eq!(db.file_states(project.id).await.unwrap()["a.md"].mtime, 42);

    apply(&db, project.id, removed("a.md")).await.unwrap();
    assert!(db.file_states(project.id).await.unwrap().is_empty());
    assert_eq!(search_rows(&db, project.id, "a.md").await, 0);
}

#[test(tokio::test)]
async fn test_parse_error_indexes_minimal_entity() {
    let dir = TempDir::new().unwrap();
    let (db, project) = test_project(&dir, "notes").await;
    apply(
        &db,
        project.id,
        indexed("broken note.md", "---\ntitle: [unclosed\n---\n- [fact] lost\n"),
    )
    .await
    .unwrap();
    let entity = entity_at(&db, project.id, "broken note.md").await.unwrap();
    assert_eq!(entity.title, "broken note");
    assert_eq!(entity.permalink, "broken-note");
    assert!(entity.parse_error.is_some());

    // Fixing the file clears the error.
    apply(
        &db,
        project.id,
        indexed("broken note.md", "---\ntitle: Fixed\n---\n- [fact] kept\n"),
    )
    .await
    .unwrap();
    let entity = entity_at(&db, project.id, "broken note.md").await.unwrap();
    assert_eq!(entity.title, "Fixed");
    assert!(entity.parse_error.is_none());
}

#[test(tokio::test)]
async fn test_search_index_check_and_rebuild() {
    let dir = TempDir::new().unwrap();
    let (db, project) = test_project(&dir, "notes").await;
    apply(&db, project.id, indexed("a.md", "# A\n- [fact] espresso\n"))
        .await
        .unwrap();
    apply(&db, project.id, indexed("b.md", "# B\n- see [[a]]\n"))
        .await
        .unwrap();
    assert!(db.check_search_index(project.id).await.unwrap());

    sqlx::query("DELETE FROM search_index WHERE project_id = ?")
        .bind(project.id)
        .execute(&db.pool)
        .await
        .unwrap();
    assert!(!db.check_search_index(project.id).await.unwrap());

    assert_eq!(db.rebuild_search_index(project.id, None).await.unwrap(), 2);
    assert!(db.check_search_index(project.id).await.unwrap());
    // entity, observation and relation rows
    assert_eq!(search_rows(&db, project.id, "a.md").await, 2);
    assert_eq!(search_rows(&db, project.id, "b.md").await, 2);

    // A missing observation row is drift too, even with every entity row present.
    sqlx::query("DELETE FROM search_index WHERE project_id = ? AND kind = 'observation'")
        .bind(project.id)
        .execute(&db.pool)
        .await
        .unwrap();
    assert!(!db.check_search_index(project.id).await.unwrap());
    db.rebuild_search_index(project.id, None).await.unwrap();
    assert!(db.check_search_index(project.id).await.unwrap());

    // Re-indexing an entity replaces its rows through the row map.
    apply(&db, project.id, indexed("a.md", "# A\n- [fact] espresso\n- [fact] lungo\n"))
        .await
        .unwrap();
    assert_eq!(search_rows(&db, project.id, "a.md").await, 3);
    assert!(db.check_search_index(project.id).await.unwrap());
}

#[test(tokio::test)]
async fn test_entity_read_sees_one_snapshot() {
    let dir = TempDir::new().unwrap();
    let (db, project) = test_project(&dir, "notes").await;
    apply(&db, project.id, indexed("a.md", "# A\n- [fact] first\n"))
        .await
        .unwrap();
    let before = entity_at(&db, project.id, "a.md").await.unwrap();

    let mut tx = db.pool.begin().await.unwrap();
    let entity_count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM entity")
        .fetch_one(&mut *tx)
        .await
        .unwrap();
    assert_eq!(entity_count, 1);

    // A commit landing after the read started is invisible to the rest of it.
    apply(&db, project.id, indexed("a.md", "# A\n- [fact] second\n- [fact] third\n"))
        .await
        .unwrap();
    let graph = crate::query::entity_graph(&mut tx, project.id, "a")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(graph.entity.checksum, before.checksum);
    assert_eq!(graph.observations.len(), 1);
    assert_eq!(graph.observations[0].content, "first");
    tx.commit().await.unwrap();

    let graph = crate::query::get_by_permalink(&db, project.id, "a")
        .await
        .unwrap()
        .unwrap();
    assert_ne!(graph.entity.checksum, before.checksum);
    assert_eq!(graph.observations.len(), 2);
}
