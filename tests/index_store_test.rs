//! Read-side tests: full-text search, filters, entity lookup, statistics, directory listing
//! and context traversal over a synced fixture project.
#![cfg(feature = "service")]

mod common;

use common::TestProject;
use notebase_core::{
    query::{
        activity_metrics, build_context, get_by_permalink, list_directory, project_stats,
        query_by_project, search_text, DirectoryEntryKind, PaginatedQuery, SearchQuery,
    },
    search::SearchItemKind,
    NotebaseError,
};
use tempfile::TempDir;
use test_log::test;

const FIXTURE: [(&str, &str); 5] = [
    (
        "coffee/espresso.md",
        "---\ntitle: Espresso\ntype: drink\n---\n# Espresso\n\nStrong brewed coffee.\n\n\
         - [fact] brewed under pressure #method\n- [taste] bitter and rich\n\
         - pairs_with [[Croissant]]\n- made_from [[Coffee Beans]]\n",
    ),
    (
        "food/croissant.md",
        "---\ntitle: Croissant\ntype: food\n---\nFlaky pastry.\n\n- [fact] buttery layers\n",
    ),
    (
        "coffee/beans.md",
        "---\ntitle: Coffee Beans\naliases: [beans]\n---\nRoasted seeds.\n\n- [origin] ethiopia\n",
    ),
    ("lonely.md", "# Lonely\n\nNothing links here.\n"),
    ("drafts/todo.md", "- wants [[Matcha]]\n"),
];

async fn fixture(temp_dir: &TempDir) -> TestProject {
    let project = TestProject::new(temp_dir, "kb").await;
    common::write_files(&project.root, &FIXTURE);
    let report = project.coordinator().full_scan().await.unwrap();
    assert_eq!(report.added.len(), FIXTURE.len());
    project
}

fn query(query: SearchQuery) -> PaginatedQuery {
    query.into()
}

#[test(tokio::test)]
async fn test_search_ranks_matches() {
    let temp_dir = TempDir::new().unwrap();
    let kb = fixture(&temp_dir).await;
    let pid = kb.project.id;

    let page = search_text(&kb.db, pid, &query(SearchQuery::text("pressure")))
        .await
        .unwrap();
    assert!(page.results.iter().any(|m| m.kind == SearchItemKind::Observation
        && m.category.as_deref() == Some("fact")
        && m.permalink == "coffee/espresso"));
    assert!(page.results.iter().all(|m| m.score != 0.0));

    // The last term matches as a prefix.
    let page = search_text(&kb.db, pid, &query(SearchQuery::text("espr")))
        .await
        .unwrap();
    assert!(page
        .results
        .iter()
        .any(|m| m.kind == SearchItemKind::Entity && m.title == "Espresso"));

    // FTS syntax in user input is taken literally: `AND` is just another term.
    let page = search_text(&kb.db, pid, &query(SearchQuery::text("\"coffee\" AND (")))
        .await
        .unwrap();
    assert!(page.count > 0);
    assert!(page.results.iter().all(|m| m.permalink == "coffee/espresso"));
    let page = search_text(&kb.db, pid, &query(SearchQuery::text("*** ()")))
        .await
        .unwrap();
    assert_eq!(page.count, 0);
    assert!(page.results.is_empty());
}

#[test(tokio::test)]
async fn test_search_filters() {
    let temp_dir = TempDir::new().unwrap();
    let kb = fixture(&temp_dir).await;
    let pid = kb.project.id;

    let entities_only = SearchQuery {
        kinds: vec![SearchItemKind::Entity],
        ..SearchQuery::text("coffee")
    };
    let page = search_text(&kb.db, pid, &query(entities_only)).await.unwrap();
    let mut permalinks = page
        .results
        .iter()
        .map(|m| m.permalink.as_str())
        .collect::<Vec<_>>();
    permalinks.sort();
    assert_eq!(permalinks, vec!["coffee/beans", "coffee/espresso"]);

    let food = SearchQuery {
        entity_types: vec!["food".to_string()],
        ..Default::default()
    };
    let page = search_text(&kb.db, pid, &query(food)).await.unwrap();
    assert_eq!(page.count, 2);
    assert!(page.results.iter().all(|m| m.entity_type == "food"));

    let taste = SearchQuery {
        categories: vec!["taste".to_string()],
        ..Default::default()
    };
    let page = search_text(&kb.db, pid, &query(taste)).await.unwrap();
    assert_eq!(page.count, 1);
    assert_eq!(page.results[0].snippet, "bitter and rich");

    let pairs = SearchQuery {
        relation_types: vec!["pairs_with".to_string()],
        ..Default::default()
    };
    let page = search_text(&kb.db, pid, &query(pairs)).await.unwrap();
    assert_eq!(page.count, 1);
    assert_eq!(page.results[0].kind, SearchItemKind::Relation);

    let in_coffee = SearchQuery {
        directory: Some("coffee/".to_string()),
        ..Default::default()
    };
    let page = search_text(&kb.db, pid, &query(in_coffee)).await.unwrap();
    assert!(page.count > 0);
    assert!(page.results.iter().all(|m| m.file_path.starts_with("coffee/")));

    let by_permalink = SearchQuery {
        permalink: Some("food/*".to_string()),
        kinds: vec![SearchItemKind::Entity],
        ..Default::default()
    };
    let page = search_text(&kb.db, pid, &query(by_permalink)).await.unwrap();
    assert_eq!(page.count, 1);
    assert_eq!(page.results[0].title, "Croissant");

    let future = SearchQuery {
        updated_after: Some(i64::MAX),
        ..Default::default()
    };
    assert_eq!(search_text(&kb.db, pid, &query(future)).await.unwrap().count, 0);
}

#[test(tokio::test)]
async fn test_search_pagination() {
    let temp_dir = TempDir::new().unwrap();
    let kb = fixture(&temp_dir).await;
    let all = search_text(&kb.db, kb.project.id, &PaginatedQuery::default())
        .await
        .unwrap();
    assert!(all.count > 2);
    assert_eq!(all.results.len(), all.count);

    let second = search_text(
        &kb.db,
        kb.project.id,
        &PaginatedQuery {
            query: SearchQuery::default(),
            limit: Some(2),
            offset: Some(1),
        },
    )
    .await
    .unwrap();
    assert_eq!(second.count, all.count);
    assert_eq!(second.start, 1);
    assert_eq!(second.results, all.results[1..3].to_vec());

    let entities = query_by_project(&kb.db, kb.project.id, Some(2), None)
        .await
        .unwrap();
    assert_eq!(entities.count, FIXTURE.len());
    assert_eq!(entities.results[0].file_path, "coffee/beans.md");
}

#[test(tokio::test)]
async fn test_get_by_permalink() {
    let temp_dir = TempDir::new().unwrap();
    let kb = fixture(&temp_dir).await;
    let pid = kb.project.id;

    let espresso = get_by_permalink(&kb.db, pid, "coffee/espresso")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(espresso.entity.entity_type, "drink");
    assert_eq!(espresso.observations.len(), 2);
    assert_eq!(espresso.observations[0].tags, vec!["method".to_string()]);
    assert_eq!(espresso.relations.len(), 2);
    assert!(espresso.relations.iter().all(|r| r.to_id.is_some()));

    // Falls back to aliases and titles.
    let beans = get_by_permalink(&kb.db, pid, "beans").await.unwrap().unwrap();
    assert_eq!(beans.entity.permalink, "coffee/beans");
    assert_eq!(beans.incoming.len(), 1);
    let croissant = get_by_permalink(&kb.db, pid, "Croissant").await.unwrap().unwrap();
    assert_eq!(croissant.entity.file_path, "food/croissant.md");

    assert!(get_by_permalink(&kb.db, pid, "matcha").await.unwrap().is_none());
}

#[test(tokio::test)]
async fn test_project_stats() {
    let temp_dir = TempDir::new().unwrap();
    let kb = fixture(&temp_dir).await;
    let stats = project_stats(&kb.db, kb.project.id).await.unwrap();

    assert_eq!(stats.entity_count, 5);
    assert_eq!(stats.observation_count, 4);
    assert_eq!(stats.relation_count, 3);
    assert_eq!(stats.resolved_relations, 2);
    assert_eq!(stats.pending_relations, 1);
    assert_eq!(stats.parse_errors, 0);
    assert_eq!(stats.entity_types["note"], 3);
    assert_eq!(stats.observation_categories["fact"], 2);
    assert_eq!(stats.relation_types["wants"], 1);
    assert_eq!(
        stats.isolated,
        vec!["drafts/todo".to_string(), "lonely".to_string()]
    );
    assert_eq!(stats.most_connected[0], ("coffee/espresso".to_string(), 2));
}

#[test(tokio::test)]
async fn test_activity_metrics() {
    let temp_dir = TempDir::new().unwrap();
    let kb = fixture(&temp_dir).await;
    let pid = kb.project.id;

    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    kb.write("lonely.md", "# Lonely\n\nStill nothing links here.\n");
    let report = kb.coordinator().full_scan().await.unwrap();
    assert_eq!(report.modified, vec!["lonely.md".to_string()]);

    let metrics = activity_metrics(&kb.db, pid).await.unwrap();
    assert_eq!(metrics.recently_created.len(), 5);
    assert_eq!(metrics.recently_updated[0].permalink, "lonely");
    assert!(metrics.recently_updated[0].at > metrics.recently_updated[1].at);

    let month = sqlx::query_scalar::<_, String>("SELECT strftime('%Y-%m', 'now')")
        .fetch_one(&kb.db.pool)
        .await
        .unwrap();
    assert_eq!(metrics.monthly_growth.len(), 1);
    let growth = &metrics.monthly_growth[&month];
    assert_eq!(growth.entities, 5);
    assert_eq!(growth.observations, 4);
    assert_eq!(growth.relations, 3);
    assert_eq!(growth.total(), 12);
}

#[test(tokio::test)]
async fn test_list_directory() {
    let temp_dir = TempDir::new().unwrap();
    let kb = fixture(&temp_dir).await;
    let pid = kb.project.id;

    let root = list_directory(&kb.db, pid, "", 1).await.unwrap();
    let listed = root
        .iter()
        .map(|e| (e.kind, e.path.as_str(), e.file_count))
        .collect::<Vec<_>>();
    assert_eq!(
        listed,
        vec![
            (DirectoryEntryKind::Directory, "coffee", 2),
            (DirectoryEntryKind::Directory, "drafts", 1),
            (DirectoryEntryKind::Directory, "food", 1),
            (DirectoryEntryKind::File, "lonely.md", 1),
        ]
    );

    let coffee = list_directory(&kb.db, pid, "coffee", 1).await.unwrap();
    assert_eq!(coffee.len(), 2);
    assert_eq!(coffee[0].name, "beans.md");
    assert_eq!(coffee[0].title.as_deref(), Some("Coffee Beans"));
    assert_eq!(coffee[1].permalink.as_deref(), Some("coffee/espresso"));

    let deep = list_directory(&kb.db, pid, "", 2).await.unwrap();
    assert_eq!(deep.len(), 4 + 4);
}

#[test(tokio::test)]
async fn test_build_context() {
    let temp_dir = TempDir::new().unwrap();
    let kb = fixture(&temp_dir).await;
    let pid = kb.project.id;

    let context = build_context(&kb.db, pid, "food/croissant", 2, 10)
        .await
        .unwrap();
    assert_eq!(context.root.entity.title, "Croissant");
    let related = context
        .related
        .iter()
        .map(|(e, d)| (e.permalink.as_str(), *d))
        .collect::<Vec<_>>();
    assert_eq!(related, vec![("coffee/espresso", 1), ("coffee/beans", 2)]);
    assert_eq!(context.relations.len(), 2);

    let near = build_context(&kb.db, pid, "food/croissant", 1, 10)
        .await
        .unwrap();
    assert_eq!(near.related.len(), 1);

    let capped = build_context(&kb.db, pid, "coffee/espresso", 3, 1)
        .await
        .unwrap();
    assert_eq!(capped.related.len(), 1);

    assert!(matches!(
        build_context(&kb.db, pid, "nowhere", 2, 10).await,
        Err(NotebaseError::NotFound(_))
    ));
}
