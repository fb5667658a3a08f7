use serde::{Deserialize, Serialize};
use std::{
    fmt::{Display, Formatter},
    path::PathBuf,
};

use crate::{
    error::NotebaseError,
    properties::{Project, ProjectId},
    query::{
        activity_metrics, build_context, get_by_permalink, list_directory, project_stats,
        search_text, ActivityMetrics, ContextGraph, DirectoryEntry, EntityGraph, PaginatedQuery,
        ProjectStats, ResultsPage, SearchMatch,
    },
    status::SyncStatus,
    sync::SyncReport,
    watch::WatchService,
};

/// Command interface between a host application and a running [WatchService]. Projects are
/// addressed by name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Op {
    ListProjects,
    AddProject { name: String, path: String },
    RemoveProject(String),
    SetProjectActive(String, bool),
    /// Queue a full scan without waiting for it
    TriggerSync(String),
    /// Run a full scan and return its report
    SyncNow(String),
    GetSyncStatus(String),
    Search(String, PaginatedQuery),
    GetEntity(String, String),
    /// Project, permalink, traversal depth, maximum related entities
    BuildContext(String, String, u8, usize),
    ProjectStats(String),
    ActivityMetrics(String),
    /// Project, directory (empty for the root), depth
    ListDirectory(String, String, usize),
}

impl Display for Op {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            Op::ListProjects => write!(f, "ListProjects"),
            Op::AddProject { name, path } => write!(f, "AddProject({name} at {path})"),
            Op::RemoveProject(name) => write!(f, "RemoveProject({name})"),
            Op::SetProjectActive(name, active) => write!(f, "SetProjectActive({name}, {active})"),
            Op::TriggerSync(name) => write!(f, "TriggerSync({name})"),
            Op::SyncNow(name) => write!(f, "SyncNow({name})"),
            Op::GetSyncStatus(name) => write!(f, "GetSyncStatus({name})"),
            Op::Search(name, pq) => write!(f, "Search({name}: {pq:?})"),
            Op::GetEntity(name, permalink) => write!(f, "GetEntity({name}:{permalink})"),
            Op::BuildContext(name, permalink, depth, max) => {
                write!(f, "BuildContext({name}:{permalink}, depth {depth}, max {max})")
            }
            Op::ProjectStats(name) => write!(f, "ProjectStats({name})"),
            Op::ActivityMetrics(name) => write!(f, "ActivityMetrics({name})"),
            Op::ListDirectory(name, dir, depth) => {
                write!(f, "ListDirectory({name}:/{dir}, depth {depth})")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OpResult {
    Ok,
    Projects(Vec<Project>),
    Project(Project),
    Report(SyncReport),
    Status(SyncStatus),
    Page(ResultsPage<Vec<SearchMatch>>),
    Entity(Option<EntityGraph>),
    Context(ContextGraph),
    Stats(ProjectStats),
    Activity(ActivityMetrics),
    Directory(Vec<DirectoryEntry>),
}

impl Display for OpResult {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            OpResult::Ok => write!(f, "Ok"),
            OpResult::Projects(v) => write!(
                f,
                "Projects({})",
                v.iter()
                    .map(|p| p.name.clone())
                    .collect::<Vec<String>>()
                    .join(", ")
            ),
            OpResult::Project(p) => write!(f, "Project({} at {})", p.name, p.path),
            OpResult::Report(r) => write!(f, "Report({} changed)", r.changed()),
            OpResult::Status(s) => write!(f, "Status({}: {} pending)", s.project, s.pending),
            OpResult::Page(r) => write!(
                f,
                "Page({}-{} of {} items)",
                r.start,
                r.start + r.results.len(),
                r.count
            ),
            OpResult::Entity(Some(graph)) => write!(f, "Entity({})", graph.entity.permalink),
            OpResult::Entity(None) => write!(f, "Entity(None)"),
            OpResult::Context(c) => write!(
                f,
                "Context({}, {} related)",
                c.root.entity.permalink,
                c.related.len()
            ),
            OpResult::Stats(s) => write!(f, "Stats({} entities)", s.entity_count),
            OpResult::Activity(a) => write!(
                f,
                "Activity({} months of growth)",
                a.monthly_growth.len()
            ),
            OpResult::Directory(v) => write!(f, "Directory({} entries)", v.len()),
        }
    }
}

impl WatchService {
    fn project_id(&self, name: &str) -> Result<ProjectId, NotebaseError> {
        Ok(self.block_on(self.registry().require(name))?.id)
    }

    /// Execute one [Op] against the service.
    pub fn handle(&self, op: Op) -> Result<OpResult, NotebaseError> {
        tracing::debug!("handling {op}");
        let db = self.db_connection();
        let result = match op {
            Op::ListProjects => OpResult::Projects(self.block_on(self.registry().list_projects())?),
            Op::AddProject { name, path } => {
                OpResult::Project(self.add_project(&name, &PathBuf::from(path))?)
            }
            Op::RemoveProject(name) => OpResult::Project(self.remove_project(&name)?),
            Op::SetProjectActive(name, active) => {
                OpResult::Project(self.set_project_active(&name, active)?)
            }
            Op::TriggerSync(name) => {
                self.trigger_sync(&name)?;
                OpResult::Ok
            }
            Op::SyncNow(name) => OpResult::Report(self.sync_now(&name)?),
            Op::GetSyncStatus(name) => OpResult::Status(self.get_sync_status(&name)?),
            Op::Search(name, pq) => {
                let project_id = self.project_id(&name)?;
                OpResult::Page(self.block_on(search_text(&db, project_id, &pq))?)
            }
            Op::GetEntity(name, permalink) => {
                let project_id = self.project_id(&name)?;
                OpResult::Entity(self.block_on(get_by_permalink(&db, project_id, &permalink))?)
            }
            Op::BuildContext(name, permalink, depth, max_related) => {
                let project_id = self.project_id(&name)?;
                OpResult::Context(self.block_on(build_context(
                    &db,
                    project_id,
                    &permalink,
                    depth,
                    max_related,
                ))?)
            }
            Op::ProjectStats(name) => {
                let project_id = self.project_id(&name)?;
                OpResult::Stats(self.block_on(project_stats(&db, project_id))?)
            }
            Op::ActivityMetrics(name) => {
                let project_id = self.project_id(&name)?;
                OpResult::Activity(self.block_on(activity_metrics(&db, project_id))?)
            }
            Op::ListDirectory(name, dir, depth) => {
                let project_id = self.project_id(&name)?;
                OpResult::Directory(self.block_on(list_directory(&db, project_id, &dir, depth))?)
            }
        };
        Ok(result)
    }
}
