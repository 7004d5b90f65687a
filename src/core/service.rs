//! Entry points for callers: task creation, audit, release, stop and
//! console tailing.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::config::Settings;
use crate::console;
use crate::deploy::{DeployTask, Services};
use crate::error::{Error, Result};
use crate::record::ExecutionRecord;
use crate::registry::TaskRegistry;
use crate::store::{MemoryStore, SqliteStore, Store};
use crate::task::{ReleaseRequest, ReleaseTask, TaskStatus};

/// Input for [`ReleaseService::create_task`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewTask {
    pub project_id: i64,
    pub name: String,
    pub user_id: i64,
    pub server_ids: Vec<i64>,
    #[serde(default)]
    pub tag: String,
    #[serde(default)]
    pub branch: String,
    #[serde(default)]
    pub commit_id: String,
    #[serde(default)]
    pub is_rollback: bool,
}

pub struct ReleaseService {
    settings: Settings,
    store: Arc<dyn Store>,
    registry: Arc<TaskRegistry>,
    poll_interval: Duration,
}

impl ReleaseService {
    pub fn new(settings: Settings, registry: Arc<TaskRegistry>) -> Self {
        let store = Arc::clone(&registry.services().store);
        let poll_interval = Duration::from_millis(settings.engine.console_poll_ms.max(1));
        Self {
            settings,
            store,
            registry,
            poll_interval,
        }
    }

    /// Service backed by the configured database (or memory) and the
    /// system collaborators.
    pub fn from_settings(settings: Settings) -> Result<Self> {
        let store: Arc<dyn Store> = match settings.database_path() {
            Some(path) => Arc::new(SqliteStore::open(&path)?),
            None => Arc::new(MemoryStore::new()),
        };
        let services = Arc::new(Services::from_settings(&settings, store));
        Ok(Self::new(settings, TaskRegistry::new(services)))
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Store a new task for a project. Requested servers outside the
    /// project are dropped; none left is an error. Projects requiring audit
    /// start in `Waiting`, others are approved immediately.
    pub fn create_task(&self, new: NewTask) -> Result<ReleaseTask> {
        let project = self.settings.project(new.project_id)?;
        let environment = self.settings.environment(project.environment_id)?;
        if !project.status.is_enabled() {
            return Err(Error::project_disabled(&project.name));
        }
        if !environment.status.is_enabled() {
            return Err(Error::environment_disabled(&environment.name));
        }
        if new.name.trim().is_empty() {
            return Err(Error::validation_invalid_argument(
                "name",
                "Task name is required",
                None,
            ));
        }

        let mut server_ids: Vec<i64> = Vec::new();
        for id in &new.server_ids {
            if project.server_ids.contains(id) && !server_ids.contains(id) {
                server_ids.push(*id);
            }
        }
        if server_ids.is_empty() {
            return Err(Error::validation_invalid_argument(
                "serverIds",
                "None of the requested servers belong to the project",
                Some(project.id.to_string()),
            )
            .with_hint(format!("Project servers: {:?}", project.server_ids)));
        }

        let now = Utc::now();
        let mut task = ReleaseTask {
            id: 0,
            space_id: project.space_id,
            project_id: project.id,
            environment_id: environment.id,
            name: new.name.trim().to_string(),
            user_id: new.user_id,
            status: if project.task_audit {
                TaskStatus::Waiting
            } else {
                TaskStatus::Approved
            },
            version: String::new(),
            prev_version: String::new(),
            server_ids,
            tag: new.tag.trim().to_string(),
            branch: new.branch.trim().to_string(),
            commit_id: new.commit_id.trim().to_string(),
            is_rollback: new.is_rollback,
            last_error: String::new(),
            audit_user_id: None,
            created_at: now,
            updated_at: now,
        };
        task.revision()?;

        task.id = self.store.insert_task(&task)?;
        tracing::info!(task_id = task.id, project_id = project.id, status = %task.status, "task created");
        Ok(task)
    }

    /// Approve or reject a waiting task.
    pub fn audit(&self, task_id: i64, approve: bool, auditor_id: i64) -> Result<ReleaseTask> {
        let next = if approve {
            TaskStatus::Approved
        } else {
            TaskStatus::Rejected
        };
        let moved = self.store.transition_status(
            task_id,
            TaskStatus::Waiting,
            next,
            None,
            Some(auditor_id),
        )?;
        let task = self.store.load_task(task_id)?;
        if !moved {
            return Err(Error::task_invalid_status(
                task_id,
                TaskStatus::Waiting.as_str(),
                task.status.as_str(),
            ));
        }
        tracing::info!(task_id, auditor_id, status = %next, "task audited");
        Ok(task)
    }

    /// The live view while a run is in flight, the stored task otherwise.
    pub fn task(&self, task_id: i64) -> Result<ReleaseTask> {
        match self.registry.lookup(task_id) {
            Some(live) => Ok(live.snapshot()),
            None => self.store.load_task(task_id),
        }
    }

    pub fn tasks(&self) -> Result<Vec<ReleaseTask>> {
        self.store.list_tasks()
    }

    pub fn records(&self, task_id: i64) -> Result<Vec<ExecutionRecord>> {
        self.store.records_after(task_id, 0)
    }

    /// Load a task with its project, environment and enabled servers.
    pub fn request(&self, task_id: i64) -> Result<ReleaseRequest> {
        let task = self.store.load_task(task_id)?;
        let project = self.settings.project(task.project_id)?.clone();
        let environment = self.settings.environment(task.environment_id)?.clone();

        let mut servers = Vec::with_capacity(task.server_ids.len());
        for id in &task.server_ids {
            match self.settings.server(*id) {
                Ok(server) if server.status.is_enabled() && server.is_valid() => {
                    servers.push(server.clone())
                }
                Ok(_) => tracing::warn!(task_id, server_id = id, "skipping disabled server"),
                Err(_) => tracing::warn!(task_id, server_id = id, "skipping unknown server"),
            }
        }

        Ok(ReleaseRequest {
            task,
            project,
            environment,
            servers,
        })
    }

    /// Register and start a run of `task_id`.
    pub async fn release(&self, task_id: i64, actor_id: i64) -> Result<Arc<DeployTask>> {
        let request = self.request(task_id)?;
        let task = self.registry.create_task(request, actor_id)?;
        task.start().await?;
        Ok(task)
    }

    /// Returns whether a live run was signalled.
    pub fn stop(&self, task_id: i64) -> bool {
        self.registry.stop(task_id)
    }

    pub async fn follow<F>(&self, task_id: i64, sink: F) -> Result<usize>
    where
        F: FnMut(&ExecutionRecord),
    {
        let live = self.registry.lookup(task_id);
        console::follow(
            self.store.as_ref(),
            live.as_deref(),
            task_id,
            self.poll_interval,
            sink,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::project::EntityStatus;

    const SETTINGS: &str = r#"{
        "engine": { "database": "" },
        "environments": [{ "id": 1, "name": "staging" }],
        "servers": [
            { "id": 10, "host": "web-1", "user": "deploy" },
            { "id": 11, "host": "web-2", "user": "deploy" },
            { "id": 12, "host": "web-3", "user": "deploy", "status": "disabled" }
        ],
        "projects": [
            {
                "id": 3,
                "environmentId": 1,
                "name": "storefront",
                "repoUrl": "git@example.com:shop/storefront.git",
                "targetRoot": "/srv/storefront/current",
                "targetReleases": "/srv/storefront/releases",
                "serverIds": [10, 11, 12]
            },
            {
                "id": 4,
                "environmentId": 1,
                "name": "docs",
                "repoUrl": "git@example.com:shop/docs.git",
                "targetRoot": "/srv/docs/current",
                "targetReleases": "/srv/docs/releases",
                "taskAudit": false,
                "serverIds": [10]
            }
        ]
    }"#;

    fn service() -> ReleaseService {
        let settings: Settings = serde_json::from_str(SETTINGS).unwrap();
        ReleaseService::from_settings(settings).unwrap()
    }

    fn new_task(project_id: i64, server_ids: Vec<i64>) -> NewTask {
        NewTask {
            project_id,
            name: "ship it".to_string(),
            user_id: 5,
            server_ids,
            tag: "v1.2.0".to_string(),
            ..NewTask::default()
        }
    }

    #[test]
    fn create_keeps_only_project_servers() {
        let service = service();
        let task = service.create_task(new_task(3, vec![11, 99, 10, 11])).unwrap();

        assert!(task.id > 0);
        assert_eq!(task.server_ids, vec![11, 10]);
        assert_eq!(task.environment_id, 1);
        assert_eq!(task.status, TaskStatus::Waiting);
        assert_eq!(service.task(task.id).unwrap().name, "ship it");
    }

    #[test]
    fn create_without_audit_is_approved() {
        let service = service();
        let task = service.create_task(new_task(4, vec![10])).unwrap();
        assert_eq!(task.status, TaskStatus::Approved);
    }

    #[test]
    fn create_rejects_foreign_servers_and_bad_revisions() {
        let service = service();
        let err = service.create_task(new_task(4, vec![11])).unwrap_err();
        assert_eq!(err.code, ErrorCode::ValidationInvalidArgument);

        let mut no_revision = new_task(3, vec![10]);
        no_revision.tag.clear();
        no_revision.branch = "main".to_string();
        let err = service.create_task(no_revision).unwrap_err();
        assert_eq!(err.code, ErrorCode::DeployRevisionInvalid);

        assert!(service.tasks().unwrap().is_empty());
    }

    #[test]
    fn create_requires_enabled_project() {
        let mut settings: Settings = serde_json::from_str(SETTINGS).unwrap();
        settings.projects[0].status = EntityStatus::Disabled;
        let service = ReleaseService::from_settings(settings).unwrap();

        let err = service.create_task(new_task(3, vec![10])).unwrap_err();
        assert_eq!(err.code, ErrorCode::ProjectDisabled);
    }

    #[test]
    fn audit_moves_waiting_tasks_once() {
        let service = service();
        let task = service.create_task(new_task(3, vec![10])).unwrap();

        let audited = service.audit(task.id, true, 8).unwrap();
        assert_eq!(audited.status, TaskStatus::Approved);
        assert_eq!(audited.audit_user_id, Some(8));

        let err = service.audit(task.id, false, 8).unwrap_err();
        assert_eq!(err.code, ErrorCode::TaskInvalidStatus);
        assert_eq!(err.details["actual"], "approved");
    }

    #[test]
    fn request_skips_disabled_servers() {
        let service = service();
        let task = service.create_task(new_task(3, vec![12, 10])).unwrap();

        let request = service.request(task.id).unwrap();
        let ids: Vec<i64> = request.servers.iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![10]);
        assert_eq!(request.project.name, "storefront");
    }

    #[tokio::test]
    async fn release_of_unaudited_task_is_refused() {
        let service = service();
        let task = service.create_task(new_task(3, vec![10])).unwrap();

        let err = service.release(task.id, 5).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::TaskInvalidStatus);
        assert!(service.registry().lookup(task.id).is_none());
        assert!(!service.stop(task.id));
    }
}
