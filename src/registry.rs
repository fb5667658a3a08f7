//! Project registration and lifecycle.
use std::path::Path;

use crate::{
    config::ProjectRecord,
    db::DbConnection,
    error::NotebaseError,
    paths::os_path_to_string,
    properties::{now_millis, Project, ProjectId},
};

/// A registry change the watch service has to act on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProjectChange {
    Added(Project),
    Removed(Project),
    Activated(Project),
    Deactivated(Project),
}

#[derive(Debug, Clone)]
pub struct ProjectRegistry {
    db: DbConnection,
}

impl ProjectRegistry {
    pub fn new(db: DbConnection) -> ProjectRegistry {
        ProjectRegistry { db }
    }

    /// Register a directory as a project. The first registered project becomes the default.
    /// Registering the same name and path again returns the existing project.
    pub async fn register(&self, name: &str, path: &Path) -> Result<Project, NotebaseError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(NotebaseError::Command("project name must not be empty".into()));
        }
        let root = path.canonicalize().map_err(|e| {
            NotebaseError::NotFound(format!("project path {path:?} is not available: {e}"))
        })?;
        if !root.is_dir() {
            return Err(NotebaseError::Command(format!(
                "project path {root:?} is not a directory"
            )));
        }
        let root = os_path_to_string(&root);

        if let Some(existing) = self.get_by_name(name).await? {
            if existing.path == root {
                return Ok(existing);
            }
            return Err(NotebaseError::Command(format!(
                "project '{name}' is already registered at {}",
                existing.path
            )));
        }
        if let Some(other) = self
            .list_projects()
            .await?
            .into_iter()
            .find(|p| p.path == root)
        {
            return Err(NotebaseError::Command(format!(
                "{root} is already registered as project '{}'",
                other.name
            )));
        }

        let now = now_millis();
        let project = sqlx::query_as::<_, Project>(
            "INSERT INTO project (name, path, is_active, is_default, created_at, updated_at) \
             VALUES (?1, ?2, 1, NOT EXISTS (SELECT 1 FROM project), ?3, ?3) RETURNING *",
        )
        .bind(name)
        .bind(&root)
        .bind(now)
        .fetch_one(&self.db.pool)
        .await?;
        tracing::info!("Registered project '{}' at {}", project.name, project.path);
        Ok(project)
    }

    /// Delete a project with every row that belongs to it, in one transaction.
    pub async fn remove(&self, name: &str) -> Result<Project, NotebaseError> {
        let project = self.require(name).await?;
        {
            let _guard = self.db.project_write_lock(project.id).await;
            let mut tx = self.db.pool.begin().await?;
            for sql in [
                "DELETE FROM search_index WHERE project_id = ?",
                "DELETE FROM search_row WHERE project_id = ?",
                "DELETE FROM relation WHERE project_id = ?",
                "DELETE FROM observation WHERE project_id = ?",
                "DELETE FROM entity_key WHERE project_id = ?",
                "DELETE FROM entity WHERE project_id = ?",
                "DELETE FROM file_state WHERE project_id = ?",
                "DELETE FROM sync_meta WHERE project_id = ?",
                "DELETE FROM project WHERE id = ?",
            ] {
                sqlx::query(sql).bind(project.id).execute(&mut *tx).await?;
            }
            if project.is_default {
                sqlx::query(
                    "UPDATE project SET is_default = 1 \
                     WHERE id = (SELECT id FROM project ORDER BY id LIMIT 1)",
                )
                .execute(&mut *tx)
                .await?;
            }
            tx.commit().await?;
        }
        self.db.forget_project(project.id);
        tracing::info!("Removed project '{}'", project.name);
        Ok(project)
    }

    pub async fn list_projects(&self) -> Result<Vec<Project>, NotebaseError> {
        Ok(
            sqlx::query_as::<_, Project>("SELECT * FROM project ORDER BY name")
                .fetch_all(&self.db.pool)
                .await?,
        )
    }

    pub async fn list_active_projects(&self) -> Result<Vec<Project>, NotebaseError> {
        Ok(
            sqlx::query_as::<_, Project>("SELECT * FROM project WHERE is_active = 1 ORDER BY name")
                .fetch_all(&self.db.pool)
                .await?,
        )
    }

    pub async fn get(&self, id: ProjectId) -> Result<Option<Project>, NotebaseError> {
        Ok(
            sqlx::query_as::<_, Project>("SELECT * FROM project WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.db.pool)
                .await?,
        )
    }

    pub async fn get_by_name(&self, name: &str) -> Result<Option<Project>, NotebaseError> {
        Ok(
            sqlx::query_as::<_, Project>("SELECT * FROM project WHERE name = ?")
                .bind(name)
                .fetch_optional(&self.db.pool)
                .await?,
        )
    }

    pub async fn get_default(&self) -> Result<Option<Project>, NotebaseError> {
        Ok(
            sqlx::query_as::<_, Project>("SELECT * FROM project WHERE is_default = 1 LIMIT 1")
                .fetch_optional(&self.db.pool)
                .await?,
        )
    }

    /// Like [ProjectRegistry::get_by_name], but a missing project is an error.
    pub async fn require(&self, name: &str) -> Result<Project, NotebaseError> {
        self.get_by_name(name)
            .await?
            .ok_or_else(|| NotebaseError::NotFound(format!("project '{name}'")))
    }

    pub async fn set_active(&self, name: &str, active: bool) -> Result<Project, NotebaseError> {
        let project = sqlx::query_as::<_, Project>(
            "UPDATE project SET is_active = ?, updated_at = ? WHERE name = ? RETURNING *",
        )
        .bind(active)
        .bind(now_millis())
        .bind(name)
        .fetch_optional(&self.db.pool)
        .await?;
        project.ok_or_else(|| NotebaseError::NotFound(format!("project '{name}'")))
    }

    pub async fn set_default(&self, name: &str) -> Result<Project, NotebaseError> {
        let project = self.require(name).await?;
        let mut tx = self.db.pool.begin().await?;
        sqlx::query("UPDATE project SET is_default = (id = ?), updated_at = ?")
            .bind(project.id)
            .bind(now_millis())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        self.require(name).await
    }

    /// Make the registry match `records`: register new names, update activation and the
    /// default, remove projects that are no longer listed.
    pub async fn apply_records(
        &self,
        records: &[ProjectRecord],
    ) -> Result<Vec<ProjectChange>, NotebaseError> {
        let mut changes = Vec::new();
        for existing in self.list_projects().await? {
            if !records.iter().any(|r| r.name == existing.name) {
                changes.push(ProjectChange::Removed(self.remove(&existing.name).await?));
            }
        }

        for record in records {
            let before = self.get_by_name(&record.name).await?;
            let mut project = match before.as_ref() {
                Some(project) => project.clone(),
                None => self.register(&record.name, Path::new(&record.path)).await?,
            };
            if project.is_active != record.active {
                project = self.set_active(&record.name, record.active).await?;
            }
            if record.default && !project.is_default {
                project = self.set_default(&record.name).await?;
            }
            match before {
                None => changes.push(ProjectChange::Added(project)),
                Some(before) if before.is_active != project.is_active => {
                    changes.push(if project.is_active {
                        ProjectChange::Activated(project)
                    } else {
                        ProjectChange::Deactivated(project)
                    })
                }
                Some(_) => {}
            }
        }
        Ok(changes)
    }

    /// Current registry as configuration records.
    pub async fn to_records(&self) -> Result<Vec<ProjectRecord>, NotebaseError> {
        Ok(self
            .list_projects()
            .await?
            .into_iter()
            .map(|p| ProjectRecord {
                name: p.name,
                path: p.path,
                default: p.is_default,
                active: p.is_active,
            })
            .collect())
    }
}
