use std::path::{Path, PathBuf};

use crate::project::Project;
use crate::utils::{io, shell};

/// Paths owned by one run. Local paths are removed when the run ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployDirs {
    /// `<workspace>/<project id>`, shared by every run of the project.
    pub project_dir: PathBuf,
    /// Isolated copy of the checkout for this run.
    pub staging: PathBuf,
    pub package: PathBuf,
    pub remote_release_dir: String,
    pub remote_package: String,
    /// The active-release symlink.
    pub remote_root_link: String,
}

impl DeployDirs {
    pub fn new(workspace: &Path, project: &Project, version: &str, extension: &str) -> Self {
        let project_dir = workspace.join(project.id.to_string());
        let package_name = format!("{}.{}", version, extension);
        let releases = project.target_releases.trim();
        Self {
            staging: project_dir.join(version),
            package: project_dir.join(&package_name),
            project_dir,
            remote_release_dir: shell::posix_join(releases, version),
            remote_package: shell::posix_join(releases, &package_name),
            remote_root_link: trim_trailing_slash(project.target_root.trim()).to_string(),
        }
    }

    /// Temporary link renamed onto the active link. Versioned so two runs
    /// never share it.
    pub fn temp_link(&self, version: &str) -> String {
        format!("{}_tmp_{}", self.remote_root_link, version)
    }

    /// Best-effort removal of the local staging tree and package.
    pub fn cleanup(&self) {
        io::remove_quietly(&self.package);
        io::remove_quietly(&self.staging);
    }
}

fn trim_trailing_slash(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        path
    } else {
        trimmed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn project() -> Project {
        serde_json::from_value(serde_json::json!({
            "id": 12,
            "environmentId": 1,
            "name": "api",
            "repoUrl": "git@example.com:api.git",
            "targetRoot": "/srv/api/current/",
            "targetReleases": "/srv/api/releases"
        }))
        .unwrap()
    }

    #[test]
    fn paths_follow_version() {
        let dirs = DeployDirs::new(Path::new("/work"), &project(), "12_7_20240301_101500", "zip");
        assert_eq!(dirs.staging, PathBuf::from("/work/12/12_7_20240301_101500"));
        assert_eq!(dirs.package, PathBuf::from("/work/12/12_7_20240301_101500.zip"));
        assert_eq!(dirs.remote_release_dir, "/srv/api/releases/12_7_20240301_101500");
        assert_eq!(dirs.remote_package, "/srv/api/releases/12_7_20240301_101500.zip");
        assert_eq!(dirs.remote_root_link, "/srv/api/current");
        assert_eq!(
            dirs.temp_link("12_7_20240301_101500"),
            "/srv/api/current_tmp_12_7_20240301_101500"
        );
    }

    #[test]
    fn cleanup_removes_local_paths() {
        let workspace = tempfile::TempDir::new().unwrap();
        let dirs = DeployDirs::new(workspace.path(), &project(), "v", "zip");
        std::fs::create_dir_all(dirs.staging.join("src")).unwrap();
        std::fs::write(&dirs.package, b"pk").unwrap();
        dirs.cleanup();
        assert!(!dirs.staging.exists());
        assert!(!dirs.package.exists());
        assert!(dirs.project_dir.exists());
    }
}
