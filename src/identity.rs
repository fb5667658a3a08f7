//! Permalink assignment and reference resolution.
//!
//! Every lookup key of an entity (permalink, aliases, title, file basename) lives in the
//! `entity_key` table with a priority. A relation's target key resolves to the lowest-priority
//! match, ties broken by entity id, so resolution is deterministic regardless of the order in
//! which files were indexed. Relations whose key matches nothing are pending: `to_id` is NULL and
//! the partial `idx_relation_pending` index serves as the pending-reference index.
use sqlx::sqlite::SqliteConnection;
use std::{
    collections::BTreeSet,
    fmt::{Display, Formatter},
};

use crate::{
    codec::ParsedDocument,
    error::NotebaseError,
    nodekey::{permalink_candidate, short_hash, NodeKey},
    properties::{Entity, EntityId, ProjectId},
};

/// Upper bound on numbered collision suffixes tried before giving up.
const MAX_COLLISION_SUFFIX: usize = 1000;

/// A permalink that could not be granted as requested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermalinkConflict {
    pub requested: String,
    /// Path of the entity that keeps the requested permalink
    pub holder: String,
    pub path: String,
    pub assigned: String,
}

impl Display for PermalinkConflict {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Permalink '{}' is held by {}; {} was assigned '{}'",
            self.requested, self.holder, self.path, self.assigned
        )
    }
}

impl From<PermalinkConflict> for NotebaseError {
    fn from(conflict: PermalinkConflict) -> Self {
        NotebaseError::ResolutionConflict {
            permalink: conflict.requested,
            holder: conflict.holder,
            path: conflict.path,
            assigned: conflict.assigned,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermalinkAssignment {
    pub permalink: String,
    /// True when the permalink came from frontmatter
    pub explicit: bool,
    pub conflict: Option<PermalinkConflict>,
}

pub struct IdentityResolver;

impl IdentityResolver {
    /// Choose the permalink for the document at `path`. `current` is the entity already stored
    /// for this file, if any.
    ///
    /// An entity that already holds its candidate (or a collision variant derived from its own
    /// path) keeps it, so content-only edits never change identity. Otherwise the first holder of
    /// a permalink keeps it and the newcomer gets `<candidate>-<path hash>`, then numbered
    /// variants of that.
    pub async fn assign_permalink(
        conn: &mut SqliteConnection,
        project_id: ProjectId,
        path: &str,
        document: &ParsedDocument,
        current: Option<&Entity>,
    ) -> Result<PermalinkAssignment, NotebaseError> {
        let (candidate, explicit) =
            permalink_candidate(document.permalink.as_deref(), path, &document.title);
        let hashed = format!("{candidate}-{}", short_hash(path));

        if let Some(entity) = current {
            let own_variant = entity.permalink == hashed
                || entity
                    .permalink
                    .strip_prefix(&format!("{hashed}-"))
                    .is_some_and(|n| n.parse::<usize>().is_ok());
            if entity.permalink == candidate || own_variant {
                return Ok(PermalinkAssignment {
                    permalink: entity.permalink.clone(),
                    explicit,
                    conflict: None,
                });
            }
        }
        let self_id = current.map(|e| e.id);

        let holder = match Self::holder_of(conn, project_id, &candidate).await? {
            Some((id, _)) if Some(id) == self_id => None,
            other => other,
        };
        let Some((_, holder_path)) = holder else {
            return Ok(PermalinkAssignment {
                permalink: candidate,
                explicit,
                conflict: None,
            });
        };

        for n in 1..=MAX_COLLISION_SUFFIX {
            let attempt = if n == 1 {
                hashed.clone()
            } else {
                format!("{hashed}-{n}")
            };
            match Self::holder_of(conn, project_id, &attempt).await? {
                Some((id, _)) if Some(id) != self_id => continue,
                _ => {
                    let conflict = PermalinkConflict {
                        requested: candidate,
                        holder: holder_path,
                        path: path.to_string(),
                        assigned: attempt.clone(),
                    };
                    return Ok(PermalinkAssignment {
                        permalink: attempt,
                        explicit,
                        conflict: Some(conflict),
                    });
                }
            }
        }
        Err(NotebaseError::IdentityAmbiguity(format!(
            "no free permalink derived from '{candidate}' for {path}"
        )))
    }

    async fn holder_of(
        conn: &mut SqliteConnection,
        project_id: ProjectId,
        permalink: &str,
    ) -> Result<Option<(EntityId, String)>, NotebaseError> {
        Ok(sqlx::query_as::<_, (EntityId, String)>(
            "SELECT id, file_path FROM entity WHERE project_id = ? AND permalink = ?",
        )
        .bind(project_id)
        .bind(permalink)
        .fetch_optional(&mut *conn)
        .await?)
    }

    /// Entity a normalized target key refers to within the project, if any.
    pub async fn resolve_target(
        conn: &mut SqliteConnection,
        project_id: ProjectId,
        target_key: &str,
    ) -> Result<Option<EntityId>, NotebaseError> {
        if target_key.is_empty() {
            return Ok(None);
        }
        Ok(sqlx::query_scalar::<_, EntityId>(
            "SELECT entity_id FROM entity_key WHERE project_id = ? AND key = ? \
             ORDER BY priority, entity_id LIMIT 1",
        )
        .bind(project_id)
        .bind(target_key)
        .fetch_optional(&mut *conn)
        .await?)
    }

    /// Resolve again every relation of the project whose target key is one of `keys`, whatever
    /// it points at now. Called whenever the set of entities answering to those keys changes, so
    /// that a relation always points at the best current match. Returns the `(before, after)`
    /// targets of every relation that changed.
    pub async fn refresh_targets<'k>(
        conn: &mut SqliteConnection,
        project_id: ProjectId,
        keys: impl IntoIterator<Item = &'k str>,
    ) -> Result<Vec<(Option<EntityId>, Option<EntityId>)>, NotebaseError> {
        let mut retargeted = Vec::new();
        for key in keys.into_iter().collect::<BTreeSet<_>>() {
            let relations = sqlx::query_as::<_, (i64, Option<EntityId>)>(
                "SELECT id, to_id FROM relation WHERE project_id = ? AND target_key = ?",
            )
            .bind(project_id)
            .bind(key)
            .fetch_all(&mut *conn)
            .await?;
            if relations.is_empty() {
                continue;
            }
            let to_id = Self::resolve_target(conn, project_id, key).await?;
            for (relation_id, current) in relations {
                if current == to_id {
                    continue;
                }
                sqlx::query("UPDATE relation SET to_id = ? WHERE id = ?")
                    .bind(to_id)
                    .bind(relation_id)
                    .execute(&mut *conn)
                    .await?;
                retargeted.push((current, to_id));
            }
        }
        Ok(retargeted)
    }

    /// Point every relation that names one of `keys` at its best match now that `entity_id`
    /// carries them. Returns how many pending relations were resolved to `entity_id`.
    pub async fn claim_keys(
        conn: &mut SqliteConnection,
        project_id: ProjectId,
        entity_id: EntityId,
        keys: &[NodeKey],
    ) -> Result<u64, NotebaseError> {
        let retargeted =
            Self::refresh_targets(conn, project_id, keys.iter().map(|k| k.key.as_str())).await?;
        let promoted = retargeted
            .iter()
            .filter(|(before, after)| before.is_none() && *after == Some(entity_id))
            .count() as u64;
        if !retargeted.is_empty() {
            tracing::debug!(
                "[IdentityResolver] {} relations retargeted, {promoted} pending promoted to {entity_id}",
                retargeted.len()
            );
        }
        Ok(promoted)
    }

    /// Re-resolve relations that point at `entity_id` through a key it no longer carries.
    pub async fn revalidate_incoming(
        conn: &mut SqliteConnection,
        project_id: ProjectId,
        entity_id: EntityId,
        keys: &[NodeKey],
    ) -> Result<u64, NotebaseError> {
        let current = keys.iter().map(|k| k.key.as_str()).collect::<BTreeSet<_>>();
        let incoming = sqlx::query_as::<_, (i64, String)>(
            "SELECT id, target_key FROM relation WHERE project_id = ? AND to_id = ?",
        )
        .bind(project_id)
        .bind(entity_id)
        .fetch_all(&mut *conn)
        .await?;

        let mut changed = 0;
        for (relation_id, target_key) in incoming {
            if current.contains(target_key.as_str()) {
                continue;
            }
            let to_id = Self::resolve_target(conn, project_id, &target_key).await?;
            sqlx::query("UPDATE relation SET to_id = ? WHERE id = ?")
                .bind(to_id)
                .bind(relation_id)
                .execute(&mut *conn)
                .await?;
            changed += 1;
        }
        Ok(changed)
    }

    /// Relations of the project still waiting for their target, as `(from_id, target_key)`.
    pub async fn pending(
        conn: &mut SqliteConnection,
        project_id: ProjectId,
    ) -> Result<Vec<(EntityId, String)>, NotebaseError> {
        Ok(sqlx::query_as::<_, (EntityId, String)>(
            "SELECT from_id, target_key FROM relation \
             WHERE project_id = ? AND to_id IS NULL ORDER BY from_id, ordinal",
        )
        .bind(project_id)
        .fetch_all(&mut *conn)
        .await?)
    }
}
