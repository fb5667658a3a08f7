use serde::{Deserialize, Serialize};
use std::{
    fs::{read_to_string, write},
    path::PathBuf,
    time::Duration,
};

use crate::error::NotebaseError;

/// A project as written in `config.toml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectRecord {
    pub name: String,
    pub path: String,
    #[serde(default)]
    pub default: bool,
    #[serde(default = "default_true")]
    pub active: bool,
}

fn default_true() -> bool {
    true
}

/// Scan period used when a project has no working watcher and periodic scans are disabled.
pub const SCAN_ONLY_INTERVAL_SECS: u64 = 60;

/// Tuning knobs for change detection and reconciliation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Quiet period before a burst of file system events is handed to the coordinator
    pub debounce_ms: u64,
    /// Interval between full scans; zero disables periodic scanning
    pub scan_interval_secs: u64,
    /// Files parsed concurrently within one batch
    pub parse_concurrency: usize,
    /// Budget for reading, parsing and resolving one file
    pub file_timeout_secs: u64,
    /// Attempts for a single index transaction before the file counts as failed
    pub txn_retries: u32,
    /// Reconciliation attempts for a file before it is parked
    pub max_file_attempts: u32,
    pub retry_base_ms: u64,
    pub retry_cap_ms: u64,
    /// Recompute path-derived permalinks when files move
    pub update_permalinks_on_move: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            debounce_ms: 1000,
            scan_interval_secs: 300,
            parse_concurrency: 4,
            file_timeout_secs: 30,
            txn_retries: 3,
            max_file_attempts: 5,
            retry_base_ms: 1000,
            retry_cap_ms: 60_000,
            update_permalinks_on_move: true,
        }
    }
}

impl SyncConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn scan_interval(&self) -> Option<Duration> {
        (self.scan_interval_secs > 0).then(|| Duration::from_secs(self.scan_interval_secs))
    }

    /// Scan period for a project without a working watcher. Never disabled, since scans are
    /// then the only way changes are found.
    pub fn scan_only_interval(&self) -> Duration {
        match self.scan_interval_secs {
            0 => Duration::from_secs(SCAN_ONLY_INTERVAL_SECS),
            secs => Duration::from_secs(secs),
        }
    }

    pub fn file_timeout(&self) -> Duration {
        Duration::from_secs(self.file_timeout_secs.max(1))
    }

    /// Delay before reconciliation attempt `attempt` (1-based) of a failed file.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(20);
        let delay = self.retry_base_ms.saturating_mul(1u64 << exp);
        Duration::from_millis(delay.min(self.retry_cap_ms))
    }
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    sync: SyncConfig,
    #[serde(default)]
    projects: Vec<ProjectRecord>,
}

pub trait ProjectConfigProvider: Send + Sync {
    fn get_projects(&self) -> Result<Vec<ProjectRecord>, NotebaseError>;
    fn set_projects(&self, projects: Vec<ProjectRecord>) -> Result<(), NotebaseError>;
    fn get_sync_config(&self) -> Result<SyncConfig, NotebaseError>;
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TomlConfigProvider {
    path: PathBuf,
}

impl TomlConfigProvider {
    pub fn new(path: PathBuf) -> Self {
        TomlConfigProvider { path }
    }

    fn read(&self) -> Result<ConfigFile, NotebaseError> {
        tracing::debug!("Attempting to read config from: {:?}", &self.path);
        if !self.path.exists() {
            tracing::debug!("Config file not found, using defaults.");
            return Ok(ConfigFile::default());
        }
        let content = read_to_string(&self.path)?;
        Ok(toml::from_str(&content)?)
    }
}

impl ProjectConfigProvider for TomlConfigProvider {
    fn get_projects(&self) -> Result<Vec<ProjectRecord>, NotebaseError> {
        Ok(self.read()?.projects)
    }

    fn set_projects(&self, projects: Vec<ProjectRecord>) -> Result<(), NotebaseError> {
        tracing::debug!("Attempting to write projects to: {:?}", &self.path);
        let mut config = self.read()?;
        config.projects = projects;
        write(&self.path, toml::to_string(&config)?)?;
        Ok(())
    }

    fn get_sync_config(&self) -> Result<SyncConfig, NotebaseError> {
        Ok(self.read()?.sync)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let provider = TomlConfigProvider::new(dir.path().join("config.toml"));
        assert!(provider.get_projects().unwrap().is_empty());
        assert_eq!(provider.get_sync_config().unwrap(), SyncConfig::default());
    }

    #[test]
    fn test_partial_sync_table_and_projects() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[sync]\ndebounce_ms = 250\n\n[[projects]]\nname = \"notes\"\npath = \"/tmp/notes\"\n",
        )
        .unwrap();
        let provider = TomlConfigProvider::new(path);
        let sync = provider.get_sync_config().unwrap();
        assert_eq!(sync.debounce_ms, 250);
        assert_eq!(sync.max_file_attempts, SyncConfig::default().max_file_attempts);
        let projects = provider.get_projects().unwrap();
        assert_eq!(projects.len(), 1);
        assert!(projects[0].active);
        assert!(!projects[0].default);
    }

    #[test]
    fn test_set_projects_keeps_sync_table() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[sync]\nscan_interval_secs = 5\n").unwrap();
        let provider = TomlConfigProvider::new(path);
        provider
            .set_projects(vec![ProjectRecord {
                name: "work".to_string(),
                path: "/tmp/work".to_string(),
                default: true,
                active: true,
            }])
            .unwrap();
        assert_eq!(provider.get_sync_config().unwrap().scan_interval_secs, 5);
        assert_eq!(provider.get_projects().unwrap()[0].name, "work");
    }

    #[test]
    fn test_retry_delay_is_capped() {
        let config = SyncConfig {
            retry_base_ms: 100,
            retry_cap_ms: 1000,
            ..Default::default()
        };
        assert_eq!(config.retry_delay(1), Duration::from_millis(100));
        assert_eq!(config.retry_delay(2), Duration::from_millis(200));
        assert_eq!(config.retry_delay(4), Duration::from_millis(800));
        assert_eq!(config.retry_delay(5), Duration::from_millis(1000));
        assert_eq!(config.retry_delay(60), Duration::from_millis(1000));
    }

    #[test]
    fn test_scan_only_interval_is_never_disabled() {
        let config = SyncConfig {
            scan_interval_secs: 0,
            ..Default::default()
        };
        assert_eq!(config.scan_interval(), None);
        assert_eq!(
            config.scan_only_interval(),
            Duration::from_secs(SCAN_ONLY_INTERVAL_SECS)
        );
        let config = SyncConfig {
            scan_interval_secs: 5,
            ..Default::default()
        };
        assert_eq!(config.scan_only_interval(), Duration::from_secs(5));
    }
}
