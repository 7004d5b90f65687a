//! Release tasks and their lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::project::{Environment, Project};
use crate::server::Server;

/// Lifecycle of a release task.
///
/// ```text
/// Waiting -> Approved | Rejected
/// Approved -> Releasing -> Finished | ReleaseFailed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Waiting,
    Approved,
    Rejected,
    Releasing,
    ReleaseFailed,
    Finished,
}

impl TaskStatus {
    /// Stable numeric code used for persistence.
    pub fn code(&self) -> i32 {
        match self {
            TaskStatus::Waiting => 1,
            TaskStatus::Approved => 2,
            TaskStatus::Rejected => 3,
            TaskStatus::Releasing => 4,
            TaskStatus::ReleaseFailed => 5,
            TaskStatus::Finished => 6,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            1 => Some(TaskStatus::Waiting),
            2 => Some(TaskStatus::Approved),
            3 => Some(TaskStatus::Rejected),
            4 => Some(TaskStatus::Releasing),
            5 => Some(TaskStatus::ReleaseFailed),
            6 => Some(TaskStatus::Finished),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Waiting => "waiting",
            TaskStatus::Approved => "approved",
            TaskStatus::Rejected => "rejected",
            TaskStatus::Releasing => "releasing",
            TaskStatus::ReleaseFailed => "release_failed",
            TaskStatus::Finished => "finished",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Rejected | TaskStatus::ReleaseFailed | TaskStatus::Finished
        )
    }

    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (TaskStatus::Waiting, TaskStatus::Approved)
                | (TaskStatus::Waiting, TaskStatus::Rejected)
                | (TaskStatus::Approved, TaskStatus::Releasing)
                | (TaskStatus::Releasing, TaskStatus::Finished)
                | (TaskStatus::Releasing, TaskStatus::ReleaseFailed)
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The source revision a task deploys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Revision {
    Tag(String),
    BranchCommit { branch: String, commit: String },
}

impl std::fmt::Display for Revision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Revision::Tag(tag) => write!(f, "tag {}", tag),
            Revision::BranchCommit { branch, commit } => write!(f, "{}@{}", branch, commit),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseTask {
    pub id: i64,
    #[serde(default)]
    pub space_id: i64,
    pub project_id: i64,
    pub environment_id: i64,
    pub name: String,
    pub user_id: i64,
    pub status: TaskStatus,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub prev_version: String,
    #[serde(default)]
    pub server_ids: Vec<i64>,
    #[serde(default)]
    pub tag: String,
    #[serde(default)]
    pub branch: String,
    #[serde(default)]
    pub commit_id: String,
    #[serde(default)]
    pub is_rollback: bool,
    #[serde(default)]
    pub last_error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audit_user_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ReleaseTask {
    /// Resolve the revision selector: a tag wins, otherwise both branch and
    /// commit are required.
    pub fn revision(&self) -> Result<Revision> {
        let tag = self.tag.trim();
        if !tag.is_empty() {
            return Ok(Revision::Tag(tag.to_string()));
        }
        let branch = self.branch.trim();
        let commit = self.commit_id.trim();
        if !branch.is_empty() && !commit.is_empty() {
            return Ok(Revision::BranchCommit {
                branch: branch.to_string(),
                commit: commit.to_string(),
            });
        }
        Err(Error::deploy_revision_invalid(self.id))
    }
}

/// Version string for one run: `<project>_<task>_<YYYYmmdd_HHMMSS>`.
pub fn release_version(project_id: i64, task_id: i64, at: DateTime<Utc>) -> String {
    format!("{}_{}_{}", project_id, task_id, at.format("%Y%m%d_%H%M%S"))
}

/// A task together with the entities it is released against.
#[derive(Debug, Clone)]
pub struct ReleaseRequest {
    pub task: ReleaseTask,
    pub project: Project,
    pub environment: Environment,
    pub servers: Vec<Server>,
}

impl ReleaseRequest {
    /// Checks that must hold before a task may enter `Releasing`.
    pub fn check(&self) -> Result<()> {
        if self.task.status != TaskStatus::Approved {
            return Err(Error::task_invalid_status(
                self.task.id,
                TaskStatus::Approved.as_str(),
                self.task.status.as_str(),
            ));
        }
        if !self.environment.status.is_enabled() {
            return Err(Error::environment_disabled(&self.environment.name));
        }
        if !self.project.status.is_enabled() {
            return Err(Error::project_disabled(&self.project.name));
        }
        if self.servers.is_empty() {
            return Err(Error::task_no_servers(self.task.id, &self.task.name));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn task(tag: &str, branch: &str, commit: &str) -> ReleaseTask {
        let now = Utc::now();
        ReleaseTask {
            id: 9,
            space_id: 1,
            project_id: 3,
            environment_id: 1,
            name: "hotfix".to_string(),
            user_id: 1,
            status: TaskStatus::Approved,
            version: String::new(),
            prev_version: String::new(),
            server_ids: vec![1],
            tag: tag.to_string(),
            branch: branch.to_string(),
            commit_id: commit.to_string(),
            is_rollback: false,
            last_error: String::new(),
            audit_user_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn revision_prefers_tag() {
        assert_eq!(
            task("v1.2.0", "main", "abc").revision().unwrap(),
            Revision::Tag("v1.2.0".to_string())
        );
    }

    #[test]
    fn revision_branch_requires_commit() {
        assert_eq!(
            task("", "main", "abc123").revision().unwrap(),
            Revision::BranchCommit {
                branch: "main".to_string(),
                commit: "abc123".to_string()
            }
        );
        let err = task("", "main", "").revision().unwrap_err();
        assert_eq!(err.code.as_str(), "deploy.revision_invalid");
        assert!(task("  ", "", "").revision().is_err());
    }

    #[test]
    fn version_is_deterministic() {
        let at = Utc.with_ymd_and_hms(2024, 3, 5, 14, 7, 9).unwrap();
        assert_eq!(release_version(3, 17, at), "3_17_20240305_140709");
    }

    #[test]
    fn transitions_are_monotonic() {
        assert!(TaskStatus::Waiting.can_transition_to(TaskStatus::Approved));
        assert!(TaskStatus::Approved.can_transition_to(TaskStatus::Releasing));
        assert!(TaskStatus::Releasing.can_transition_to(TaskStatus::ReleaseFailed));
        assert!(!TaskStatus::Finished.can_transition_to(TaskStatus::Releasing));
        assert!(!TaskStatus::Waiting.can_transition_to(TaskStatus::Releasing));
        assert!(!TaskStatus::Rejected.can_transition_to(TaskStatus::Approved));
    }

    #[test]
    fn status_codes_round_trip() {
        for status in [
            TaskStatus::Waiting,
            TaskStatus::Approved,
            TaskStatus::Rejected,
            TaskStatus::Releasing,
            TaskStatus::ReleaseFailed,
            TaskStatus::Finished,
        ] {
            assert_eq!(TaskStatus::from_code(status.code()), Some(status));
        }
        assert_eq!(TaskStatus::from_code(0), None);
    }
}
