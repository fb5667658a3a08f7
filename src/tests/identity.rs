use super::helpers::*;
use crate::{
    event::IndexOutcome,
    identity::IdentityResolver,
    nodekey::short_hash,
};
use tempfile::TempDir;
use test_log::test;

#[test(tokio::test)]
async fn test_forward_reference_promotion() {
    let dir = TempDir::new().unwrap();
    let (db, project) = test_project(&dir, "notes").await;

    apply(&db, project.id, indexed("a.md", "- relates_to [[b]]\n"))
        .await
        .unwrap();
    let a = entity_at(&db, project.id, "a.md").await.unwrap();
    let mut conn = db.pool.acquire().await.unwrap();
    assert_eq!(
        IdentityResolver::pending(&mut conn, project.id).await.unwrap(),
        vec![(a.id, "b".to_string())]
    );
    drop(conn);

    let outcome = apply(&db, project.id, indexed("b.md", "# B\n")).await.unwrap();
    let IndexOutcome::Upserted {
        entity_id,
        permalink,
        promoted,
    } = outcome
    else {
        panic!("expected an upsert, got {outcome:?}");
    };
    assert_eq!(permalink, "b");
    assert_eq!(promoted, 1);

    let mut conn = db.pool.acquire().await.unwrap();
    assert!(IdentityResolver::pending(&mut conn, project.id)
        .await
        .unwrap()
        .is_empty());
    let relations = crate::db::get_relations_from(&mut conn, a.id).await.unwrap();
    assert_eq!(relations.len(), 1);
    assert_eq!(relations[0].to_id, Some(entity_id));
    assert_eq!(relations[0].relation_type, "relates_to");
}

#[test(tokio::test)]
async fn test_delete_returns_incoming_to_pending() {
    let dir = TempDir::new().unwrap();
    let (db, project) = test_project(&dir, "notes").await;
    apply(&db, project.id, indexed("b.md", "# B\n")).await.unwrap();
    apply(&db, project.id, indexed("a.md", "- relates_to [[b]]\n"))
        .await
        .unwrap();
    let a = entity_at(&db, project.id, "a.md").await.unwrap();

    let outcome = apply(&db, project.id, removed("b.md")).await.unwrap();
    assert!(matches!(outcome, IndexOutcome::Removed { entity_id: Some(_) }));
    assert!(entity_at(&db, project.id, "b.md").await.is_none());

    let mut conn = db.pool.acquire().await.unwrap();
    assert_eq!(
        IdentityResolver::pending(&mut conn, project.id).await.unwrap(),
        vec![(a.id, "b".to_string())]
    );
    drop(conn);

    // Recreating the target resolves the same relation again.
    apply(&db, project.id, indexed("b.md", "# B again\n"))
        .await
        .unwrap();
    let mut conn = db.pool.acquire().await.unwrap();
    assert!(IdentityResolver::pending(&mut conn, project.id)
        .await
        .unwrap()
        .is_empty());
}

#[test(tokio::test)]
async fn test_permalink_collision_is_deterministic_and_stable() {
    let dir = TempDir::new().unwrap();
    let (db, project) = test_project(&dir, "notes").await;
    let shared = "---\npermalink: shared\n---\n";

    apply(&db, project.id, indexed("notes/x.md", shared))
        .await
        .unwrap();
    apply(&db, project.id, indexed("y.md", shared)).await.unwrap();
    let hashed = format!("shared-{}", short_hash("y.md"));
    assert_eq!(
        entity_at(&db, project.id, "notes/x.md").await.unwrap().permalink,
        "shared"
    );
    assert_eq!(entity_at(&db, project.id, "y.md").await.unwrap().permalink, hashed);

    // A content edit keeps the assigned permalink.
    apply(&db, project.id, indexed("y.md", "---\npermalink: shared\n---\nmore\n"))
        .await
        .unwrap();
    assert_eq!(entity_at(&db, project.id, "y.md").await.unwrap().permalink, hashed);

    // Even once the original holder is gone.
    apply(&db, project.id, removed("notes/x.md")).await.unwrap();
    apply(&db, project.id, indexed("y.md", "---\npermalink: shared\n---\nlater\n"))
        .await
        .unwrap();
    assert_eq!(entity_at(&db, project.id, "y.md").await.unwrap().permalink, hashed);
}

#[test(tokio::test)]
async fn test_content_edit_keeps_identity() {
    let dir = TempDir::new().unwrap();
    let (db, project) = test_project(&dir, "notes").await;
    apply(&db, project.id, indexed("a.md", "# Alpha\n- [fact] one\n"))
        .await
        .unwrap();
    let before = entity_at(&db, project.id, "a.md").await.unwrap();

    apply(&db, project.id, indexed("a.md", "# Alpha Prime\n- [fact] two\n"))
        .await
        .unwrap();
    let after = entity_at(&db, project.id, "a.md").await.unwrap();
    assert_eq!(after.id, before.id);
    assert_eq!(after.permalink, "a");
    assert_eq!(after.title, "Alpha Prime");
    assert_ne!(after.checksum, before.checksum);
}

#[test(tokio::test)]
async fn test_alias_outranks_title() {
    let dir = TempDir::new().unwrap();
    let (db, project) = test_project(&dir, "notes").await;
    apply(&db, project.id, indexed("a.md", "# Coffee\n")).await.unwrap();
    apply(&db, project.id, indexed("b.md", "---\naliases: [Coffee]\n---\n"))
        .await
        .unwrap();
    apply(&db, project.id, indexed("c.md", "- likes [[Coffee]]\n"))
        .await
        .unwrap();

    let b = entity_at(&db, project.id, "b.md").await.unwrap();
    let c = entity_at(&db, project.id, "c.md").await.unwrap();
    let mut conn = db.pool.acquire().await.unwrap();
    let relations = crate::db::get_relations_from(&mut conn, c.id).await.unwrap();
    assert_eq!(relations[0].to_id, Some(b.id));
    assert_eq!(
        IdentityResolver::resolve_target(&mut conn, project.id, "coffee")
            .await
            .unwrap(),
        Some(b.id)
    );
}

#[test(tokio::test)]
async fn test_move_keeps_entity_and_incoming_relations() {
    let dir = TempDir::new().unwrap();
    let (db, project) = test_project(&dir, "notes").await;
    let content = "# Alpha\n- [fact] one\n";
    apply(&db, project.id, indexed("a.md", content)).await.unwrap();
    apply(&db, project.id, indexed("c.md", "- refs [[Alpha]]\n"))
        .await
        .unwrap();
    let a = entity_at(&db, project.id, "a.md").await.unwrap();

    let outcome = apply(&db, project.id, moved("a.md", "archive/a.md", content))
        .await
        .unwrap();
    assert_eq!(
        outcome,
        IndexOutcome::Moved {
            entity_id: a.id,
            permalink: "archive/a".to_string(),
        }
    );
    assert!(entity_at(&db, project.id, "a.md").await.is_none());

    let c = entity_at(&db, project.id, "c.md").await.unwrap();
    let mut conn = db.pool.acquire().await.unwrap();
    assert_eq!(
        crate::db::get_observations(&mut conn, a.id).await.unwrap().len(),
        1
    );
    let relations = crate::db::get_relations_from(&mut conn, c.id).await.unwrap();
    assert_eq!(relations[0].to_id, Some(a.id));
}

#[test(tokio::test)]
async fn test_explicit_permalink_survives_move() {
    let dir = TempDir::new().unwrap();
    let (db, project) = test_project(&dir, "notes").await;
    let content = "---\npermalink: pinned\n---\n";
    apply(&db, project.id, indexed("a.md", content)).await.unwrap();
    let outcome = apply(&db, project.id, moved("a.md", "b/c.md", content))
        .await
        .unwrap();
    assert!(matches!(outcome, IndexOutcome::Moved { permalink, .. } if permalink == "pinned"));
}

#[test(tokio::test)]
async fn test_resolution_independent_of_commit_order() {
    let notes = [
        ("a.md", "- relates_to [[coffee]]\n"),
        ("b.md", "---\ntitle: Coffee\n---\n"),
        ("coffee.md", "# Coffee Beans\n"),
    ];
    for order in [[0, 1, 2], [2, 1, 0], [1, 0, 2], [0, 2, 1]] {
        let dir = TempDir::new().unwrap();
        let (db, project) = test_project(&dir, "notes").await;
        for idx in order {
            let (path, content) = notes[idx];
            apply(&db, project.id, indexed(path, content)).await.unwrap();
        }
        let a = entity_at(&db, project.id, "a.md").await.unwrap();
        let coffee = entity_at(&db, project.id, "coffee.md").await.unwrap();
        let mut conn = db.pool.acquire().await.unwrap();
        let relations = crate::db::get_relations_from(&mut conn, a.id).await.unwrap();
        assert_eq!(relations[0].to_id, Some(coffee.id), "commit order {order:?}");
        drop(conn);

        // Rewriting only the linking note keeps the target.
        apply(&db, project.id, indexed("a.md", "Edited.\n\n- relates_to [[coffee]]\n"))
            .await
            .unwrap();
        let mut conn = db.pool.acquire().await.unwrap();
        let relations = crate::db::get_relations_from(&mut conn, a.id).await.unwrap();
        assert_eq!(relations[0].to_id, Some(coffee.id), "commit order {order:?}");
    }
}

#[test(tokio::test)]
async fn test_delete_falls_back_to_next_key_holder() {
    let dir = TempDir::new().unwrap();
    let (db, project) = test_project(&dir, "notes").await;
    apply(&db, project.id, indexed("b.md", "---\ntitle: Coffee\n---\n"))
        .await
        .unwrap();
    apply(&db, project.id, indexed("coffee.md", "# Coffee\n"))
        .await
        .unwrap();
    apply(&db, project.id, indexed("z.md", "- mentions [[coffee]]\n"))
        .await
        .unwrap();
    let b = entity_at(&db, project.id, "b.md").await.unwrap();
    let coffee = entity_at(&db, project.id, "coffee.md").await.unwrap();
    let z = entity_at(&db, project.id, "z.md").await.unwrap();
    let mut conn = db.pool.acquire().await.unwrap();
    assert_eq!(
        crate::db::get_relations_from(&mut conn, z.id).await.unwrap()[0].to_id,
        Some(coffee.id)
    );
    drop(conn);

    apply(&db, project.id, removed("coffee.md")).await.unwrap();
    let mut conn = db.pool.acquire().await.unwrap();
    assert_eq!(
        crate::db::get_relations_from(&mut conn, z.id).await.unwrap()[0].to_id,
        Some(b.id)
    );
    assert!(IdentityResolver::pending(&mut conn, project.id)
        .await
        .unwrap()
        .is_empty());
    drop(conn);

    // With no holder left the relation is pending again.
    apply(&db, project.id, removed("b.md")).await.unwrap();
    let mut conn = db.pool.acquire().await.unwrap();
    assert_eq!(
        IdentityResolver::pending(&mut conn, project.id).await.unwrap(),
        vec![(z.id, "coffee".to_string())]
    );
}
