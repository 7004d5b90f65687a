//! Source checkout.
//!
//! A project's repository is cloned once into the workspace and reused;
//! each run checks out its revision there and copies the tree out to its
//! own staging directory.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::process::Command;

use crate::error::{Error, Result};
use crate::project::Project;
use crate::task::Revision;

#[async_trait]
pub trait SourceRepository: Send + Sync {
    async fn checkout_tag(&self, tag: &str) -> Result<()>;
    async fn checkout_branch_commit(&self, branch: &str, commit: &str) -> Result<()>;
    fn working_path(&self) -> PathBuf;

    async fn checkout(&self, revision: &Revision) -> Result<()> {
        match revision {
            Revision::Tag(tag) => self.checkout_tag(tag).await,
            Revision::BranchCommit { branch, commit } => {
                self.checkout_branch_commit(branch, commit).await
            }
        }
    }
}

pub trait RepositoryProvider: Send + Sync {
    fn open(&self, project: &Project) -> Result<Arc<dyn SourceRepository>>;
}

/// Working copies under `<workspace>/<project id>/repo`, driven by the git CLI.
#[derive(Debug, Clone)]
pub struct GitProvider {
    workspace: PathBuf,
}

impl GitProvider {
    pub fn new(workspace: impl Into<PathBuf>) -> Self {
        Self {
            workspace: workspace.into(),
        }
    }
}

impl RepositoryProvider for GitProvider {
    fn open(&self, project: &Project) -> Result<Arc<dyn SourceRepository>> {
        if project.repo_url.trim().is_empty() {
            return Err(Error::validation_invalid_argument(
                "repoUrl",
                "Project has no repository URL",
                Some(project.id.to_string()),
            ));
        }
        Ok(Arc::new(GitRepository::new(
            project.repo_url.trim(),
            self.workspace.join(project.id.to_string()).join("repo"),
        )))
    }
}

#[derive(Debug, Clone)]
pub struct GitRepository {
    url: String,
    path: PathBuf,
}

impl GitRepository {
    pub fn new(url: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            url: url.into(),
            path: path.into(),
        }
    }

    /// Clone on first use, otherwise fetch every ref.
    async fn sync(&self) -> Result<()> {
        if self.path.join(".git").exists() {
            return self
                .git(&["fetch", "--all", "--tags", "--prune", "--force"])
                .await
                .map(|_| ());
        }

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::deploy_checkout_failed(e.to_string()))?;
        }
        let target = self.path.to_string_lossy().to_string();
        run_git(None, &["clone", "--quiet", &self.url, &target]).await?;
        Ok(())
    }

    async fn git(&self, args: &[&str]) -> Result<String> {
        run_git(Some(&self.path), args).await
    }
}

#[async_trait]
impl SourceRepository for GitRepository {
    async fn checkout_tag(&self, tag: &str) -> Result<()> {
        self.sync().await?;
        let reference = format!("refs/tags/{}", tag);
        self.git(&["checkout", "--quiet", "--force", &reference]).await?;
        Ok(())
    }

    async fn checkout_branch_commit(&self, branch: &str, commit: &str) -> Result<()> {
        self.sync().await?;
        let upstream = format!("origin/{}", branch);
        self.git(&["checkout", "--quiet", "--force", "-B", branch, &upstream])
            .await?;
        self.git(&["reset", "--quiet", "--hard", commit]).await?;
        Ok(())
    }

    fn working_path(&self) -> PathBuf {
        self.path.clone()
    }
}

async fn run_git(dir: Option<&Path>, args: &[&str]) -> Result<String> {
    let mut cmd = Command::new("git");
    cmd.args(args);
    if let Some(dir) = dir {
        cmd.current_dir(dir);
    }
    // Never block on a credential prompt.
    cmd.env("GIT_TERMINAL_PROMPT", "0");

    let output = cmd.output().await.map_err(|e| {
        Error::deploy_checkout_failed(format!("Failed to run git {}: {}", args[0], e))
    })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::deploy_checkout_failed(format!(
            "git {} failed: {}",
            args.join(" "),
            stderr.trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::process::Command as StdCommand;
    use tempfile::TempDir;

    fn git(dir: &Path, args: &[&str]) -> String {
        let output = StdCommand::new("git")
            .args(["-c", "user.email=test@test.com", "-c", "user.name=Test User"])
            .args(args)
            .current_dir(dir)
            .output()
            .expect("Failed to run git");
        assert!(output.status.success(), "git {:?} failed", args);
        String::from_utf8_lossy(&output.stdout).trim().to_string()
    }

    fn origin() -> TempDir {
        let dir = TempDir::new().unwrap();
        let path = dir.path();
        git(path, &["init", "--quiet"]);
        fs::write(path.join("app.txt"), "v1").unwrap();
        git(path, &["add", "."]);
        git(path, &["commit", "--quiet", "-m", "first"]);
        git(path, &["tag", "v1.0.0"]);
        fs::write(path.join("app.txt"), "v2").unwrap();
        git(path, &["commit", "--quiet", "-am", "second"]);
        dir
    }

    #[tokio::test]
    async fn checks_out_tags_and_branch_commits() {
        let origin = origin();
        let branch = git(origin.path(), &["rev-parse", "--abbrev-ref", "HEAD"]);
        let head = git(origin.path(), &["rev-parse", "HEAD"]);

        let workspace = TempDir::new().unwrap();
        let repo = GitRepository::new(
            origin.path().to_string_lossy(),
            workspace.path().join("1/repo"),
        );

        repo.checkout(&Revision::Tag("v1.0.0".to_string()))
            .await
            .unwrap();
        assert_eq!(
            fs::read_to_string(repo.working_path().join("app.txt")).unwrap(),
            "v1"
        );

        repo.checkout(&Revision::BranchCommit {
            branch,
            commit: head,
        })
        .await
        .unwrap();
        assert_eq!(
            fs::read_to_string(repo.working_path().join("app.txt")).unwrap(),
            "v2"
        );
    }

    #[tokio::test]
    async fn unknown_tag_is_a_checkout_failure() {
        let origin = origin();
        let workspace = TempDir::new().unwrap();
        let repo = GitRepository::new(
            origin.path().to_string_lossy(),
            workspace.path().join("repo"),
        );
        let err = repo.checkout_tag("v9.9.9").await.unwrap_err();
        assert_eq!(err.code, crate::error::ErrorCode::DeployCheckoutFailed);
    }
}
