//! Full-text search rows.
//!
//! Each entity owns one `entity` row plus one row per observation and relation in the FTS5
//! `search_index` table. The plain `search_row` table maps every FTS rowid to its entity. Rows
//! are always rewritten inside the same transaction as the relational data they mirror, so
//! search never sees a half-indexed entity.
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteConnection;
use std::{
    fmt::{Display, Formatter},
    str::FromStr,
};

use crate::{
    error::NotebaseError,
    paths::directory_of,
    properties::{Entity, EntityId, Observation, ProjectId, Relation},
};

/// Characters of body text kept for result snippets.
pub const SNIPPET_LEN: usize = 250;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SearchItemKind {
    Entity,
    Observation,
    Relation,
}

impl SearchItemKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SearchItemKind::Entity => "entity",
            SearchItemKind::Observation => "observation",
            SearchItemKind::Relation => "relation",
        }
    }
}

impl Display for SearchItemKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for SearchItemKind {
    type Err = NotebaseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "entity" => Ok(SearchItemKind::Entity),
            "observation" => Ok(SearchItemKind::Observation),
            "relation" => Ok(SearchItemKind::Relation),
            other => Err(NotebaseError::Serialization(format!(
                "unknown search item kind '{other}'"
            ))),
        }
    }
}

#[cfg(feature = "stemming")]
static STEMMER: once_cell::sync::Lazy<rust_stemmers::Stemmer> =
    once_cell::sync::Lazy::new(|| rust_stemmers::Stemmer::create(rust_stemmers::Algorithm::English));

/// Text as stored in the indexed `content_stems` column.
#[cfg(feature = "stemming")]
pub fn index_text(text: &str) -> String {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| STEMMER.stem(&w.to_lowercase()).into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Text as stored in the indexed `content_stems` column.
#[cfg(not(feature = "stemming"))]
pub fn index_text(text: &str) -> String {
    text.to_string()
}

#[cfg(feature = "stemming")]
fn query_term(term: &str) -> String {
    STEMMER.stem(&term.to_lowercase()).into_owned()
}

#[cfg(not(feature = "stemming"))]
fn query_term(term: &str) -> String {
    term.to_string()
}

/// Turn free user text into an FTS5 MATCH expression. Every term is quoted so that FTS5 syntax
/// characters in user input are taken literally; terms are implicitly AND-ed. With `prefix` the
/// last term also matches as a prefix. Returns `None` when the text holds no searchable term.
pub fn fts_query(text: &str, prefix: bool) -> Option<String> {
    let terms = text
        .split_whitespace()
        .map(|t| t.replace('"', ""))
        .filter(|t| t.chars().any(|c| c.is_alphanumeric()))
        .map(|t| query_term(&t))
        .collect::<Vec<_>>();
    let last = terms.len().checked_sub(1)?;
    Some(
        terms
            .iter()
            .enumerate()
            .map(|(idx, term)| {
                if prefix && idx == last {
                    format!("\"{term}\"*")
                } else {
                    format!("\"{term}\"")
                }
            })
            .collect::<Vec<_>>()
            .join(" "),
    )
}

/// Document text without its leading frontmatter block.
pub fn body_of(text: &str) -> &str {
    let trimmed = text.trim_start_matches('\u{feff}');
    let Some(rest) = trimmed
        .strip_prefix("---\n")
        .or_else(|| trimmed.strip_prefix("---\r\n"))
    else {
        return trimmed;
    };
    let mut offset = 0;
    for line in rest.split_inclusive('\n') {
        offset += line.len();
        if line.trim_end() == "---" {
            return &rest[offset..];
        }
    }
    trimmed
}

pub fn snippet(text: &str, max_chars: usize) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    match collapsed.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}…", &collapsed[..idx]),
        None => collapsed,
    }
}

struct SearchRow<'a> {
    title: &'a str,
    content: String,
    kind: SearchItemKind,
    item_id: i64,
    category: Option<&'a str>,
    relation_type: Option<&'a str>,
}

async fn insert_row(
    conn: &mut SqliteConnection,
    entity: &Entity,
    row: SearchRow<'_>,
) -> Result<(), NotebaseError> {
    let rowid = sqlx::query(
        "INSERT INTO search_index (title, content_stems, permalink, directory, content_snippet, \
             file_path, kind, project_id, entity_id, item_id, entity_type, category, \
             relation_type, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(row.title)
    .bind(index_text(&row.content))
    .bind(&entity.permalink)
    .bind(directory_of(&entity.file_path))
    .bind(snippet(&row.content, SNIPPET_LEN))
    .bind(&entity.file_path)
    .bind(row.kind.as_str())
    .bind(entity.project_id)
    .bind(entity.id)
    .bind(row.item_id)
    .bind(&entity.entity_type)
    .bind(row.category)
    .bind(row.relation_type)
    .bind(entity.updated_at)
    .execute(&mut *conn)
    .await?
    .last_insert_rowid();
    sqlx::query(
        "INSERT OR REPLACE INTO search_row (search_rowid, project_id, entity_id) VALUES (?, ?, ?)",
    )
    .bind(rowid)
    .bind(entity.project_id)
    .bind(entity.id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Replace every search row of `entity`. Without `text` the entity row is built from the
/// observations and relations alone.
pub async fn index_entity(
    conn: &mut SqliteConnection,
    entity: &Entity,
    text: Option<&str>,
    observations: &[Observation],
    relations: &[Relation],
) -> Result<(), NotebaseError> {
    remove_entity(conn, entity.project_id, entity.id).await?;

    let content = match text {
        Some(text) => body_of(text).to_string(),
        None => observations
            .iter()
            .map(|o| o.content.as_str())
            .chain(relations.iter().map(|r| r.to_name.as_str()))
            .collect::<Vec<_>>()
            .join("\n"),
    };
    insert_row(
        conn,
        entity,
        SearchRow {
            title: &entity.title,
            content,
            kind: SearchItemKind::Entity,
            item_id: entity.id,
            category: None,
            relation_type: None,
        },
    )
    .await?;

    for obs in observations {
        let mut content = obs.content.clone();
        for tag in obs.tags.iter() {
            content.push_str(" #");
            content.push_str(tag);
        }
        insert_row(
            conn,
            entity,
            SearchRow {
                title: &entity.title,
                content,
                kind: SearchItemKind::Observation,
                item_id: obs.id,
                category: Some(&obs.category),
                relation_type: None,
            },
        )
        .await?;
    }

    for rel in relations {
        let content = match rel.context.as_deref() {
            Some(context) => format!("{} {} {context}", rel.relation_type, rel.to_name),
            None => format!("{} {}", rel.relation_type, rel.to_name),
        };
        insert_row(
            conn,
            entity,
            SearchRow {
                title: &entity.title,
                content,
                kind: SearchItemKind::Relation,
                item_id: rel.id,
                category: None,
                relation_type: Some(&rel.relation_type),
            },
        )
        .await?;
    }
    Ok(())
}

/// Delete the search rows of one entity. FTS5 cannot index its UNINDEXED columns, so rows are
/// located through the `search_row` table and deleted by rowid.
pub async fn remove_entity(
    conn: &mut SqliteConnection,
    project_id: ProjectId,
    entity_id: EntityId,
) -> Result<u64, NotebaseError> {
    let removed = sqlx::query(
        "DELETE FROM search_index WHERE rowid IN \
         (SELECT search_rowid FROM search_row WHERE project_id = ? AND entity_id = ?)",
    )
    .bind(project_id)
    .bind(entity_id)
    .execute(&mut *conn)
    .await?
    .rows_affected();
    sqlx::query("DELETE FROM search_row WHERE project_id = ? AND entity_id = ?")
        .bind(project_id)
        .bind(entity_id)
        .execute(&mut *conn)
        .await?;
    Ok(removed)
}

/// Delete every search row of a project.
pub async fn remove_project(
    conn: &mut SqliteConnection,
    project_id: ProjectId,
) -> Result<u64, NotebaseError> {
    let removed = sqlx::query("DELETE FROM search_index WHERE project_id = ?")
        .bind(project_id)
        .execute(&mut *conn)
        .await?
        .rows_affected();
    sqlx::query("DELETE FROM search_row WHERE project_id = ?")
        .bind(project_id)
        .execute(&mut *conn)
        .await?;
    Ok(removed)
}
