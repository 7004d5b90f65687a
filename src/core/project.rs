use serde::{Deserialize, Serialize};

use crate::archive::{FileFilter, FilterMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EntityStatus {
    #[default]
    Enabled,
    Disabled,
}

impl EntityStatus {
    pub fn is_enabled(&self) -> bool {
        matches!(self, EntityStatus::Enabled)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Environment {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub status: EntityStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: i64,
    #[serde(default)]
    pub space_id: i64,
    pub environment_id: i64,
    pub name: String,
    pub repo_url: String,

    /// Newline-separated filename patterns applied when packaging.
    #[serde(default)]
    pub excludes: String,
    #[serde(default)]
    pub filter_mode: FilterMode,

    /// Newline-separated `KEY=value` lines exported to every command.
    #[serde(default)]
    pub task_vars: String,
    #[serde(default)]
    pub prev_deploy: String,
    #[serde(default)]
    pub post_deploy: String,
    #[serde(default)]
    pub prev_release: String,
    #[serde(default)]
    pub post_release: String,

    /// Path of the active-release symlink on every host.
    pub target_root: String,
    /// Directory holding one subdirectory per release on every host.
    pub target_releases: String,
    #[serde(default = "default_keep_versions")]
    pub keep_versions: usize,

    /// New tasks wait for an auditor when set.
    #[serde(default = "default_task_audit")]
    pub task_audit: bool,
    #[serde(default)]
    pub server_ids: Vec<i64>,
    #[serde(default)]
    pub status: EntityStatus,
}

fn default_keep_versions() -> usize {
    5
}

fn default_task_audit() -> bool {
    true
}

impl Project {
    pub fn file_filter(&self) -> FileFilter {
        FileFilter::from_block(&self.excludes, self.filter_mode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn project_defaults_from_minimal_json() {
        let project: Project = serde_json::from_str(
            r#"{
                "id": 3,
                "environmentId": 1,
                "name": "storefront",
                "repoUrl": "git@example.com:shop/storefront.git",
                "targetRoot": "/srv/storefront/current",
                "targetReleases": "/srv/storefront/releases"
            }"#,
        )
        .unwrap();

        assert_eq!(project.keep_versions, 5);
        assert!(project.task_audit);
        assert!(project.status.is_enabled());
        assert_eq!(project.filter_mode, FilterMode::Exclude);
        assert!(project.file_filter().is_empty());
    }

    #[test]
    fn disabled_status_round_trips_as_snake_case() {
        let env: Environment =
            serde_json::from_str(r#"{"id": 1, "name": "prod", "status": "disabled"}"#).unwrap();
        assert!(!env.status.is_enabled());
    }
}
