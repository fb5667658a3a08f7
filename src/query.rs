//! Read side of the index store.
//!
//! Everything here only ever observes committed transactions. Each operation reads inside one
//! read transaction, so in WAL mode all of its statements see the same snapshot and never mix
//! two versions of an entity.
use petgraph::{graphmap::DiGraphMap, Direction};
use serde::{Deserialize, Serialize};
use sqlx::{
    sqlite::{SqliteConnection, SqliteRow},
    FromRow, QueryBuilder, Row, Sqlite,
};
use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::{
    db::{get_entity_by_permalink, get_observations, get_relations_from, get_relations_to, DbConnection},
    error::NotebaseError,
    identity::IdentityResolver,
    nodekey::target_key,
    properties::{Entity, EntityId, Observation, ProjectId, Relation},
    search::{fts_query, SearchItemKind},
};

pub const DEFAULT_LIMIT: usize = 100;
pub const DEFAULT_OFFSET: usize = 0;

/// Hard cap on context traversal depth.
pub const MAX_TRAVERSAL: u8 = 5;

/// A page of query results.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultsPage<B> {
    /// Total matches, not just the ones on this page
    pub count: usize,
    pub start: usize,
    pub results: B,
}

/// Full-text search with structured filters. Empty filter lists match everything.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchQuery {
    pub text: Option<String>,
    pub kinds: Vec<SearchItemKind>,
    pub entity_types: Vec<String>,
    pub categories: Vec<String>,
    pub relation_types: Vec<String>,
    /// Only rows whose file lives under this project-relative directory
    pub directory: Option<String>,
    /// Only rows whose entity permalink matches this glob, e.g. `notes/*`
    pub permalink: Option<String>,
    /// Only rows updated at or after this unix millisecond timestamp
    pub updated_after: Option<i64>,
}

impl SearchQuery {
    pub fn text(text: &str) -> SearchQuery {
        SearchQuery {
            text: Some(text.to_string()),
            ..Default::default()
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaginatedQuery {
    pub query: SearchQuery,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl From<SearchQuery> for PaginatedQuery {
    fn from(query: SearchQuery) -> Self {
        PaginatedQuery {
            query,
            limit: None,
            offset: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SearchMatch {
    pub kind: SearchItemKind,
    pub entity_id: EntityId,
    /// Entity, observation or relation id, according to `kind`
    pub item_id: i64,
    pub title: String,
    pub permalink: String,
    pub file_path: String,
    pub entity_type: String,
    pub category: Option<String>,
    pub relation_type: Option<String>,
    pub snippet: String,
    /// Higher is better; zero when no text was searched
    pub score: f64,
}

impl FromRow<'_, SqliteRow> for SearchMatch {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        let kind: String = row.try_get("kind")?;
        Ok(SearchMatch {
            kind: kind
                .parse()
                .map_err(|e: NotebaseError| sqlx::Error::Decode(e.into()))?,
            entity_id: row.try_get("entity_id")?,
            item_id: row.try_get("item_id")?,
            title: row.try_get("title")?,
            permalink: row.try_get("permalink")?,
            file_path: row.try_get("file_path")?,
            entity_type: row.try_get("entity_type")?,
            category: row.try_get("category")?,
            relation_type: row.try_get("relation_type")?,
            snippet: row.try_get("content_snippet")?,
            score: -row.try_get::<f64, _>("rank")?,
        })
    }
}

fn push_in_expr(qb: &mut QueryBuilder<Sqlite>, column: &str, values: &[String]) {
    if values.is_empty() {
        return;
    }
    qb.push(format!(" AND {column} IN ("));
    let mut separated = qb.separated(", ");
    for value in values {
        separated.push_bind(value.clone());
    }
    separated.push_unseparated(")");
}

fn push_filters(
    qb: &mut QueryBuilder<Sqlite>,
    project_id: ProjectId,
    query: &SearchQuery,
    fts: Option<&String>,
) {
    qb.push(" WHERE project_id = ");
    qb.push_bind(project_id);
    if let Some(fts) = fts {
        qb.push(" AND search_index MATCH ");
        qb.push_bind(fts.clone());
    }
    push_in_expr(
        qb,
        "kind",
        &query
            .kinds
            .iter()
            .map(|k| k.as_str().to_string())
            .collect::<Vec<_>>(),
    );
    push_in_expr(qb, "entity_type", &query.entity_types);
    push_in_expr(qb, "category", &query.categories);
    push_in_expr(qb, "relation_type", &query.relation_types);
    if let Some(dir) = query.directory.as_deref().map(|d| d.trim_matches('/')) {
        if !dir.is_empty() {
            qb.push(" AND file_path GLOB ");
            qb.push_bind(format!("{dir}/*"));
        }
    }
    if let Some(pattern) = query.permalink.as_ref() {
        qb.push(" AND permalink GLOB ");
        qb.push_bind(pattern.clone());
    }
    if let Some(after) = query.updated_after {
        qb.push(" AND updated_at >= ");
        qb.push_bind(after);
    }
}

/// Ranked full-text search within one project. Without query text every row matching the
/// filters is returned, most recently updated first.
pub async fn search_text(
    db: &DbConnection,
    project_id: ProjectId,
    pq: &PaginatedQuery,
) -> Result<ResultsPage<Vec<SearchMatch>>, NotebaseError> {
    let fts = pq.query.text.as_deref().and_then(|t| fts_query(t, true));
    if pq.query.text.as_deref().is_some_and(|t| !t.trim().is_empty()) && fts.is_none() {
        return Ok(ResultsPage {
            count: 0,
            start: pq.offset.unwrap_or(DEFAULT_OFFSET),
            results: Vec::new(),
        });
    }
    let limit = pq.limit.unwrap_or(DEFAULT_LIMIT);
    let offset = pq.offset.unwrap_or(DEFAULT_OFFSET);

    let mut tx = db.pool.begin().await?;
    let mut count_qb = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM search_index");
    push_filters(&mut count_qb, project_id, &pq.query, fts.as_ref());
    let count = count_qb.build_query_scalar::<i64>().fetch_one(&mut *tx).await?;

    let mut qb = QueryBuilder::<Sqlite>::new(if fts.is_some() {
        "SELECT *, rank FROM search_index"
    } else {
        "SELECT *, 0.0 AS rank FROM search_index"
    });
    push_filters(&mut qb, project_id, &pq.query, fts.as_ref());
    if fts.is_some() {
        qb.push(" ORDER BY rank, entity_id, item_id");
    } else {
        qb.push(" ORDER BY updated_at DESC, entity_id, item_id");
    }
    qb.push(" LIMIT ");
    qb.push_bind(limit as i64);
    qb.push(" OFFSET ");
    qb.push_bind(offset as i64);
    let results = qb.build_query_as::<SearchMatch>().fetch_all(&mut *tx).await?;
    tx.commit().await?;

    Ok(ResultsPage {
        count: count as usize,
        start: offset,
        results,
    })
}

/// Entities of a project ordered by file path.
pub async fn query_by_project(
    db: &DbConnection,
    project_id: ProjectId,
    limit: Option<usize>,
    offset: Option<usize>,
) -> Result<ResultsPage<Vec<Entity>>, NotebaseError> {
    let limit = limit.unwrap_or(DEFAULT_LIMIT);
    let offset = offset.unwrap_or(DEFAULT_OFFSET);
    let mut tx = db.pool.begin().await?;
    let count =
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM entity WHERE project_id = ?")
            .bind(project_id)
            .fetch_one(&mut *tx)
            .await?;
    let results = sqlx::query_as::<_, Entity>(
        "SELECT * FROM entity WHERE project_id = ? ORDER BY file_path LIMIT ? OFFSET ?",
    )
    .bind(project_id)
    .bind(limit as i64)
    .bind(offset as i64)
    .fetch_all(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(ResultsPage {
        count: count as usize,
        start: offset,
        results,
    })
}

/// An entity with everything attached to it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EntityGraph {
    pub entity: Entity,
    pub observations: Vec<Observation>,
    pub relations: Vec<Relation>,
    /// Resolved relations of other entities pointing here
    pub incoming: Vec<Relation>,
}

/// Look an entity up by permalink, falling back to any of its keys (alias, title, basename).
pub async fn get_by_permalink(
    db: &DbConnection,
    project_id: ProjectId,
    permalink: &str,
) -> Result<Option<EntityGraph>, NotebaseError> {
    let mut tx = db.pool.begin().await?;
    let graph = entity_graph(&mut tx, project_id, permalink).await?;
    tx.commit().await?;
    Ok(graph)
}

pub(crate) async fn entity_graph(
    conn: &mut SqliteConnection,
    project_id: ProjectId,
    permalink: &str,
) -> Result<Option<EntityGraph>, NotebaseError> {
    let entity = match get_entity_by_permalink(conn, project_id, permalink).await? {
        Some(entity) => Some(entity),
        None => match IdentityResolver::resolve_target(conn, project_id, &target_key(permalink))
            .await?
        {
            Some(id) => {
                sqlx::query_as::<_, Entity>("SELECT * FROM entity WHERE id = ?")
                    .bind(id)
                    .fetch_optional(&mut *conn)
                    .await?
            }
            None => None,
        },
    };
    let Some(entity) = entity else {
        return Ok(None);
    };
    Ok(Some(EntityGraph {
        observations: get_observations(conn, entity.id).await?,
        relations: get_relations_from(conn, entity.id).await?,
        incoming: get_relations_to(conn, entity.id).await?,
        entity,
    }))
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectStats {
    pub entity_count: usize,
    pub observation_count: usize,
    pub relation_count: usize,
    pub resolved_relations: usize,
    pub pending_relations: usize,
    pub parse_errors: usize,
    pub entity_types: BTreeMap<String, usize>,
    pub observation_categories: BTreeMap<String, usize>,
    pub relation_types: BTreeMap<String, usize>,
    /// Permalinks of entities with no resolved relation in either direction
    pub isolated: Vec<String>,
    /// Up to ten `(permalink, degree)` pairs, highest degree first
    pub most_connected: Vec<(String, usize)>,
}

async fn grouped_counts(
    conn: &mut SqliteConnection,
    sql: &str,
    project_id: ProjectId,
) -> Result<BTreeMap<String, usize>, NotebaseError> {
    let rows = sqlx::query_as::<_, (String, i64)>(sql)
        .bind(project_id)
        .fetch_all(&mut *conn)
        .await?;
    Ok(rows.into_iter().map(|(k, v)| (k, v as usize)).collect())
}

/// Entities as graph nodes, resolved relations as edges.
async fn project_graph(
    conn: &mut SqliteConnection,
    project_id: ProjectId,
) -> Result<(DiGraphMap<EntityId, ()>, BTreeMap<EntityId, Entity>), NotebaseError> {
    let entities = sqlx::query_as::<_, Entity>("SELECT * FROM entity WHERE project_id = ?")
        .bind(project_id)
        .fetch_all(&mut *conn)
        .await?;
    let edges = sqlx::query_as::<_, (EntityId, EntityId)>(
        "SELECT from_id, to_id FROM relation WHERE project_id = ? AND to_id IS NOT NULL",
    )
    .bind(project_id)
    .fetch_all(&mut *conn)
    .await?;
    let mut graph = DiGraphMap::new();
    for entity in entities.iter() {
        graph.add_node(entity.id);
    }
    for (from, to) in edges {
        graph.add_edge(from, to, ());
    }
    Ok((graph, entities.into_iter().map(|e| (e.id, e)).collect()))
}

pub async fn project_stats(
    db: &DbConnection,
    project_id: ProjectId,
) -> Result<ProjectStats, NotebaseError> {
    let mut tx = db.pool.begin().await?;
    let entity_types = grouped_counts(
        &mut tx,
        "SELECT entity_type, COUNT(*) FROM entity WHERE project_id = ? GROUP BY entity_type",
        project_id,
    )
    .await?;
    let observation_categories = grouped_counts(
        &mut tx,
        "SELECT category, COUNT(*) FROM observation WHERE project_id = ? GROUP BY category",
        project_id,
    )
    .await?;
    let relation_types = grouped_counts(
        &mut tx,
        "SELECT relation_type, COUNT(*) FROM relation WHERE project_id = ? GROUP BY relation_type",
        project_id,
    )
    .await?;
    let pending = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM relation WHERE project_id = ? AND to_id IS NULL",
    )
    .bind(project_id)
    .fetch_one(&mut *tx)
    .await?;
    let parse_errors = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM entity WHERE project_id = ? AND parse_error IS NOT NULL",
    )
    .bind(project_id)
    .fetch_one(&mut *tx)
    .await?;

    let (graph, entities) = project_graph(&mut tx, project_id).await?;
    tx.commit().await?;
    let degree = |id: EntityId| {
        graph.neighbors_directed(id, Direction::Outgoing).count()
            + graph.neighbors_directed(id, Direction::Incoming).count()
    };
    let isolated = entities
        .values()
        .filter(|e| degree(e.id) == 0)
        .map(|e| e.permalink.clone())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    let mut most_connected = entities
        .values()
        .map(|e| (e.permalink.clone(), degree(e.id)))
        .filter(|(_, d)| *d > 0)
        .collect::<Vec<_>>();
    most_connected.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    most_connected.truncate(10);

    let relation_count = relation_types.values().sum::<usize>();
    Ok(ProjectStats {
        entity_count: entities.len(),
        observation_count: observation_categories.values().sum(),
        relation_count,
        resolved_relations: relation_count.saturating_sub(pending as usize),
        pending_relations: pending as usize,
        parse_errors: parse_errors as usize,
        entity_types,
        observation_categories,
        relation_types,
        isolated,
        most_connected,
    })
}

/// Entities listed in each recent-activity list.
pub const RECENT_ACTIVITY: usize = 10;

/// Calendar months covered by [ActivityMetrics::monthly_growth], the current one excluded.
pub const GROWTH_MONTHS: u32 = 6;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivitySummary {
    pub entity_id: EntityId,
    pub title: String,
    pub permalink: String,
    pub entity_type: String,
    pub file_path: String,
    /// `created_at` or `updated_at` of the entity, by list
    pub at: i64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonthlyGrowth {
    pub entities: usize,
    pub observations: usize,
    pub relations: usize,
}

impl MonthlyGrowth {
    pub fn total(&self) -> usize {
        self.entities + self.observations + self.relations
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityMetrics {
    pub recently_created: Vec<ActivitySummary>,
    pub recently_updated: Vec<ActivitySummary>,
    /// Keyed by `YYYY-MM` (UTC). Observations and relations count towards the month their
    /// entity was created in.
    pub monthly_growth: BTreeMap<String, MonthlyGrowth>,
}

async fn recent_entities(
    conn: &mut SqliteConnection,
    project_id: ProjectId,
    column: &str,
) -> Result<Vec<ActivitySummary>, NotebaseError> {
    let rows = sqlx::query_as::<_, (EntityId, String, String, String, String, i64)>(&format!(
        "SELECT id, title, permalink, entity_type, file_path, {column} FROM entity \
         WHERE project_id = ? ORDER BY {column} DESC, id DESC LIMIT ?"
    ))
    .bind(project_id)
    .bind(RECENT_ACTIVITY as i64)
    .fetch_all(&mut *conn)
    .await?;
    Ok(rows
        .into_iter()
        .map(
            |(entity_id, title, permalink, entity_type, file_path, at)| ActivitySummary {
                entity_id,
                title,
                permalink,
                entity_type,
                file_path,
                at,
            },
        )
        .collect())
}

/// Recently created and updated entities, and per-month growth of the index.
pub async fn activity_metrics(
    db: &DbConnection,
    project_id: ProjectId,
) -> Result<ActivityMetrics, NotebaseError> {
    let mut tx = db.pool.begin().await?;
    let recently_created = recent_entities(&mut tx, project_id, "created_at").await?;
    let recently_updated = recent_entities(&mut tx, project_id, "updated_at").await?;

    let since = format!("-{GROWTH_MONTHS} months");
    let month = "strftime('%Y-%m', entity.created_at / 1000, 'unixepoch')";
    let window = "entity.project_id = ?1 AND entity.created_at >= \
                  CAST(strftime('%s', 'now', 'start of month', ?2) AS INTEGER) * 1000";
    let mut monthly_growth: BTreeMap<String, MonthlyGrowth> = BTreeMap::new();
    let counters: [(&str, fn(&mut MonthlyGrowth) -> &mut usize); 3] = [
        ("", |g| &mut g.entities),
        ("JOIN observation ON observation.entity_id = entity.id", |g| &mut g.observations),
        ("JOIN relation ON relation.from_id = entity.id", |g| &mut g.relations),
    ];
    for (join, counter) in counters {
        let rows = sqlx::query_as::<_, (String, i64)>(&format!(
            "SELECT {month} AS month, COUNT(*) FROM entity {join} \
             WHERE {window} GROUP BY month ORDER BY month"
        ))
        .bind(project_id)
        .bind(&since)
        .fetch_all(&mut *tx)
        .await?;
        for (month, count) in rows {
            *counter(monthly_growth.entry(month).or_default()) = count as usize;
        }
    }
    tx.commit().await?;

    Ok(ActivityMetrics {
        recently_created,
        recently_updated,
        monthly_growth,
    })
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DirectoryEntryKind {
    Directory,
    File,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryEntry {
    pub kind: DirectoryEntryKind,
    pub name: String,
    /// Project-relative path
    pub path: String,
    /// Set for files
    pub permalink: Option<String>,
    pub title: Option<String>,
    /// Indexed files below a directory entry, at any depth
    pub file_count: usize,
}

/// Indexed files and directories under `dir` (project root when empty), down to `depth` levels.
/// Directories sort before files.
pub async fn list_directory(
    db: &DbConnection,
    project_id: ProjectId,
    dir: &str,
    depth: usize,
) -> Result<Vec<DirectoryEntry>, NotebaseError> {
    let dir = dir.trim_matches('/');
    let prefix = if dir.is_empty() {
        String::new()
    } else {
        format!("{dir}/")
    };
    let rows = sqlx::query_as::<_, (String, String, String)>(
        "SELECT file_path, permalink, title FROM entity WHERE project_id = ? ORDER BY file_path",
    )
    .bind(project_id)
    .fetch_all(&db.pool)
    .await?;

    let depth = depth.max(1);
    let mut entries: BTreeMap<(DirectoryEntryKind, String), DirectoryEntry> = BTreeMap::new();
    for (file_path, permalink, title) in rows {
        let Some(rest) = file_path.strip_prefix(&prefix) else {
            continue;
        };
        let segments = rest.split('/').collect::<Vec<_>>();
        for level in 1..=depth.min(segments.len()) {
            let path = format!("{prefix}{}", segments[..level].join("/"));
            if level == segments.len() {
                entries.insert(
                    (DirectoryEntryKind::File, path.clone()),
                    DirectoryEntry {
                        kind: DirectoryEntryKind::File,
                        name: segments[level - 1].to_string(),
                        path,
                        permalink: Some(permalink.clone()),
                        title: Some(title.clone()),
                        file_count: 1,
                    },
                );
            } else {
                entries
                    .entry((DirectoryEntryKind::Directory, path.clone()))
                    .or_insert_with(|| DirectoryEntry {
                        kind: DirectoryEntryKind::Directory,
                        name: segments[level - 1].to_string(),
                        path,
                        permalink: None,
                        title: None,
                        file_count: 0,
                    })
                    .file_count += 1;
            }
        }
    }
    Ok(entries.into_values().collect())
}

/// An entity and its neighborhood over resolved relations, in both directions.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ContextGraph {
    pub root: EntityGraph,
    /// Related entities with their distance from the root, nearest first
    pub related: Vec<(Entity, u8)>,
    /// Resolved relations among the root and related entities
    pub relations: Vec<Relation>,
}

pub async fn build_context(
    db: &DbConnection,
    project_id: ProjectId,
    permalink: &str,
    depth: u8,
    max_related: usize,
) -> Result<ContextGraph, NotebaseError> {
    let mut tx = db.pool.begin().await?;
    let root = entity_graph(&mut tx, project_id, permalink)
        .await?
        .ok_or_else(|| NotebaseError::NotFound(format!("no entity '{permalink}'")))?;
    let (graph, mut entities) = project_graph(&mut tx, project_id).await?;

    let depth = depth.min(MAX_TRAVERSAL);
    let mut distance = BTreeMap::from([(root.entity.id, 0u8)]);
    let mut queue = VecDeque::from([root.entity.id]);
    let mut related = Vec::new();
    while let Some(id) = queue.pop_front() {
        let d = distance[&id];
        if d >= depth {
            continue;
        }
        let neighbors = graph
            .neighbors_directed(id, Direction::Outgoing)
            .chain(graph.neighbors_directed(id, Direction::Incoming))
            .collect::<BTreeSet<_>>();
        for next in neighbors {
            if distance.contains_key(&next) || related.len() >= max_related {
                continue;
            }
            distance.insert(next, d + 1);
            if let Some(entity) = entities.remove(&next) {
                related.push((entity, d + 1));
            }
            queue.push_back(next);
        }
    }

    let members = distance.keys().copied().collect::<Vec<_>>();
    let mut qb = QueryBuilder::<Sqlite>::new(
        "SELECT * FROM relation WHERE project_id = ",
    );
    qb.push_bind(project_id);
    qb.push(" AND from_id IN (");
    let mut separated = qb.separated(", ");
    for id in members.iter() {
        separated.push_bind(*id);
    }
    separated.push_unseparated(") AND to_id IN (");
    let mut separated = qb.separated(", ");
    for id in members.iter() {
        separated.push_bind(*id);
    }
    separated.push_unseparated(") ORDER BY from_id, ordinal");
    let relations = qb.build_query_as::<Relation>().fetch_all(&mut *tx).await?;
    tx.commit().await?;

    Ok(ContextGraph {
        root,
        related,
        relations,
    })
}
