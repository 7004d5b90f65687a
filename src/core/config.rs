use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::project::{Environment, Project};
use crate::server::Server;
use crate::ssh::SshSettings;

pub const CONFIG_ENV: &str = "SHIPWRIGHT_CONFIG";
pub const CONFIG_FILE: &str = "shipwright.json";

/// Root structure of shipwright.json
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    #[serde(default)]
    pub engine: EngineSettings,
    #[serde(default)]
    pub projects: Vec<Project>,
    #[serde(default)]
    pub environments: Vec<Environment>,
    #[serde(default)]
    pub servers: Vec<Server>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineSettings {
    /// Local checkouts, staging directories and packages.
    #[serde(default = "default_workspace_dir")]
    pub workspace_dir: PathBuf,

    /// SQLite file for tasks and records. Empty keeps state in memory.
    #[serde(default = "default_database")]
    pub database: String,

    /// Stop a release that runs longer than this. 0 disables the limit.
    #[serde(default)]
    pub release_timeout_secs: u64,

    /// Cap on concurrent host branches. 0 releases to every host at once.
    #[serde(default)]
    pub max_parallel_hosts: usize,

    #[serde(default = "default_console_poll_ms")]
    pub console_poll_ms: u64,

    #[serde(default)]
    pub ssh: SshSettings,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            workspace_dir: default_workspace_dir(),
            database: default_database(),
            release_timeout_secs: 0,
            max_parallel_hosts: 0,
            console_poll_ms: default_console_poll_ms(),
            ssh: SshSettings::default(),
        }
    }
}

// =============================================================================
// Default value functions
// =============================================================================

fn default_workspace_dir() -> PathBuf {
    std::env::temp_dir().join("shipwright")
}

fn default_database() -> String {
    "shipwright.db".to_string()
}

fn default_console_poll_ms() -> u64 {
    1000
}

// =============================================================================
// Catalog lookups
// =============================================================================

impl Settings {
    pub fn project(&self, id: i64) -> Result<&Project> {
        self.projects
            .iter()
            .find(|p| p.id == id)
            .ok_or_else(|| Error::project_not_found(id))
    }

    pub fn environment(&self, id: i64) -> Result<&Environment> {
        self.environments
            .iter()
            .find(|e| e.id == id)
            .ok_or_else(|| Error::environment_not_found(id))
    }

    pub fn server(&self, id: i64) -> Result<&Server> {
        self.servers
            .iter()
            .find(|s| s.id == id)
            .ok_or_else(|| Error::server_not_found(id))
    }

    /// Servers for `ids`, in `ids` order.
    pub fn servers_for(&self, ids: &[i64]) -> Result<Vec<Server>> {
        ids.iter().map(|id| self.server(*id).cloned()).collect()
    }

    /// Reject catalogs whose references do not resolve.
    pub fn validate(&self) -> Result<()> {
        for project in &self.projects {
            self.environment(project.environment_id).map_err(|_| {
                Error::config_invalid_value(
                    format!("projects[{}].environmentId", project.id),
                    Some(project.environment_id.to_string()),
                    "Unknown environment",
                )
            })?;
            for server_id in &project.server_ids {
                self.server(*server_id).map_err(|_| {
                    Error::config_invalid_value(
                        format!("projects[{}].serverIds", project.id),
                        Some(server_id.to_string()),
                        "Unknown server",
                    )
                })?;
            }
            if project.target_root.trim().is_empty() || project.target_releases.trim().is_empty()
            {
                return Err(Error::config_invalid_value(
                    format!("projects[{}]", project.id),
                    None,
                    "targetRoot and targetReleases are required",
                ));
            }
        }
        Ok(())
    }

    /// Resolved sqlite path, `None` for in-memory state.
    pub fn database_path(&self) -> Option<PathBuf> {
        let database = self.engine.database.trim();
        if database.is_empty() {
            None
        } else {
            Some(PathBuf::from(shellexpand::tilde(database).to_string()))
        }
    }

    pub fn workspace_dir(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.engine.workspace_dir.to_string_lossy()).to_string())
    }
}

// =============================================================================
// Loading functions
// =============================================================================

/// Load settings from `path`, else `$SHIPWRIGHT_CONFIG`, else ./shipwright.json.
/// Without any file the built-in defaults (and an empty catalog) apply.
pub fn load(path: Option<&Path>) -> Result<Settings> {
    let explicit = path
        .map(Path::to_path_buf)
        .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from));

    match explicit {
        Some(path) => load_from_file(&path),
        None => {
            let local = PathBuf::from(CONFIG_FILE);
            if local.exists() {
                load_from_file(&local)
            } else {
                tracing::debug!("no {} found, using defaults", CONFIG_FILE);
                Ok(Settings::default())
            }
        }
    }
}

pub fn load_from_file(path: &Path) -> Result<Settings> {
    let content = fs::read_to_string(path).map_err(|e| {
        Error::internal_io(e.to_string(), Some(format!("read {}", path.display())))
            .with_hint(format!("Pass --config or set {}", CONFIG_ENV))
    })?;

    let settings: Settings = serde_json::from_str(&content)
        .map_err(|e| Error::config_invalid_json(path.display().to_string(), e))?;
    settings.validate()?;
    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "engine": { "workspaceDir": "/var/lib/shipwright", "maxParallelHosts": 4 },
        "environments": [{ "id": 1, "name": "production" }],
        "servers": [
            { "id": 10, "host": "web-1", "user": "deploy" },
            { "id": 11, "host": "web-2", "user": "deploy", "port": 2222 }
        ],
        "projects": [{
            "id": 3,
            "environmentId": 1,
            "name": "storefront",
            "repoUrl": "git@example.com:shop/storefront.git",
            "targetRoot": "/srv/storefront/current",
            "targetReleases": "/srv/storefront/releases",
            "serverIds": [10, 11]
        }]
    }"#;

    #[test]
    fn engine_defaults_fill_missing_fields() {
        let settings: Settings = serde_json::from_str(SAMPLE).unwrap();
        assert_eq!(settings.engine.max_parallel_hosts, 4);
        assert_eq!(settings.engine.release_timeout_secs, 0);
        assert_eq!(settings.engine.console_poll_ms, 1000);
        assert_eq!(settings.engine.ssh.retry_attempts, 3);
        assert_eq!(settings.database_path(), Some(PathBuf::from("shipwright.db")));
        settings.validate().unwrap();
    }

    #[test]
    fn catalog_lookups() {
        let settings: Settings = serde_json::from_str(SAMPLE).unwrap();
        assert_eq!(settings.project(3).unwrap().name, "storefront");
        let servers = settings.servers_for(&[11, 10]).unwrap();
        assert_eq!(servers[0].port, 2222);
        assert_eq!(
            settings.server(99).unwrap_err().code,
            crate::error::ErrorCode::ServerNotFound
        );
    }

    #[test]
    fn unknown_server_reference_is_rejected() {
        let mut settings: Settings = serde_json::from_str(SAMPLE).unwrap();
        settings.projects[0].server_ids.push(42);
        let err = settings.validate().unwrap_err();
        assert_eq!(err.code, crate::error::ErrorCode::ConfigInvalidValue);
    }

    #[test]
    fn load_from_file_reports_invalid_json() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        fs::write(&path, "{ not json").unwrap();
        let err = load_from_file(&path).unwrap_err();
        assert_eq!(err.code, crate::error::ErrorCode::ConfigInvalidJson);

        fs::write(&path, SAMPLE).unwrap();
        let settings = load(Some(&path)).unwrap();
        assert_eq!(settings.servers.len(), 2);
    }
}
