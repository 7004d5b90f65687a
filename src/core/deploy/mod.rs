//! The deploy engine.
//!
//! A [`DeployTask`] drives one run of a release task through
//! prevDeploy, deploy, postDeploy and remoteRelease. Stop requests are
//! cooperative: the shared token is checked before every phase, every host
//! step and every command.

mod dirs;
mod fanout;
mod pipeline;

pub use dirs::DeployDirs;
pub use fanout::HostOutcomes;

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::archive::{Archiver, ZipArchiver};
use crate::config::Settings;
use crate::engine::{ExecutorFactory, SystemExecutors};
use crate::error::{Error, Result};
use crate::registry::TaskRegistry;
use crate::repository::{GitProvider, RepositoryProvider};
use crate::store::Store;
use crate::task::{release_version, ReleaseRequest, ReleaseTask, TaskStatus};
use crate::transfer::{FileTransfer, SshTransfer};
use pipeline::Pipeline;

/// Collaborators and limits shared by every task of a registry.
pub struct Services {
    pub store: Arc<dyn Store>,
    pub executors: Arc<dyn ExecutorFactory>,
    pub transfer: Arc<dyn FileTransfer>,
    pub repositories: Arc<dyn RepositoryProvider>,
    pub archiver: Arc<dyn Archiver>,
    pub workspace: PathBuf,
    pub release_timeout: Option<Duration>,
    /// 0 means one branch per host at once.
    pub max_parallel_hosts: usize,
    checkout_locks: Mutex<HashMap<i64, Arc<tokio::sync::Mutex<()>>>>,
}

impl Services {
    pub fn new(
        store: Arc<dyn Store>,
        executors: Arc<dyn ExecutorFactory>,
        transfer: Arc<dyn FileTransfer>,
        repositories: Arc<dyn RepositoryProvider>,
        archiver: Arc<dyn Archiver>,
        workspace: impl Into<PathBuf>,
    ) -> Self {
        Self {
            store,
            executors,
            transfer,
            repositories,
            archiver,
            workspace: workspace.into(),
            release_timeout: None,
            max_parallel_hosts: 0,
            checkout_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Git checkouts, zip packages and the system ssh binary.
    pub fn from_settings(settings: &Settings, store: Arc<dyn Store>) -> Self {
        let engine = &settings.engine;
        let workspace = settings.workspace_dir();
        Self::new(
            store,
            Arc::new(SystemExecutors::new(engine.ssh.clone())),
            Arc::new(SshTransfer::new(engine.ssh.clone())),
            Arc::new(GitProvider::new(workspace.clone())),
            Arc::new(ZipArchiver),
            workspace,
        )
        .with_release_timeout(match engine.release_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        })
        .with_max_parallel_hosts(engine.max_parallel_hosts)
    }

    pub fn with_release_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.release_timeout = timeout;
        self
    }

    pub fn with_max_parallel_hosts(mut self, limit: usize) -> Self {
        self.max_parallel_hosts = limit;
        self
    }

    fn checkout_lock(&self, project_id: i64) -> Arc<tokio::sync::Mutex<()>> {
        self.checkout_locks
            .lock()
            .entry(project_id)
            .or_default()
            .clone()
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HostResult {
    pub server_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Final state of a run, published on the task's completion signal.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskOutcome {
    pub task_id: i64,
    pub status: TaskStatus,
    pub version: String,
    pub prev_version: String,
    pub last_error: String,
    pub stopped: bool,
    pub hosts: Vec<HostResult>,
}

/// Terminal status of a run. A failed run still finishes when at least
/// one host released.
pub fn final_status(result: &Result<()>, hosts: &HostOutcomes) -> TaskStatus {
    match result {
        Ok(()) => TaskStatus::Finished,
        Err(_) if hosts.has_success() => TaskStatus::Finished,
        Err(_) => TaskStatus::ReleaseFailed,
    }
}

/// Resolve once the completion signal carries an outcome.
pub async fn until_done(done: &mut watch::Receiver<Option<TaskOutcome>>) {
    while done.borrow_and_update().is_none() {
        if done.changed().await.is_err() {
            return;
        }
    }
}

#[derive(Debug, Default)]
struct RunState {
    started: bool,
    stopped: bool,
}

/// One run of a release task. Created through [`TaskRegistry::create_task`].
pub struct DeployTask {
    id: i64,
    actor_id: i64,
    request: ReleaseRequest,
    task: Mutex<ReleaseTask>,
    state: Mutex<RunState>,
    cancel: CancellationToken,
    done: watch::Sender<Option<TaskOutcome>>,
    services: Arc<Services>,
    registry: Weak<TaskRegistry>,
}

impl fmt::Debug for DeployTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeployTask")
            .field("id", &self.id)
            .field("actor_id", &self.actor_id)
            .field("state", &*self.state.lock())
            .finish_non_exhaustive()
    }
}

impl DeployTask {
    pub(crate) fn new(
        request: ReleaseRequest,
        actor_id: i64,
        services: Arc<Services>,
        registry: Weak<TaskRegistry>,
    ) -> Self {
        let (done, _) = watch::channel(None);
        Self {
            id: request.task.id,
            actor_id,
            task: Mutex::new(request.task.clone()),
            request,
            state: Mutex::new(RunState::default()),
            cancel: CancellationToken::new(),
            done,
            services,
            registry,
        }
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    /// Current view of the task, including version and previous version.
    pub fn snapshot(&self) -> ReleaseTask {
        self.task.lock().clone()
    }

    pub fn is_started(&self) -> bool {
        self.state.lock().started
    }

    pub fn is_stopped(&self) -> bool {
        self.state.lock().stopped
    }

    /// Check preconditions, move the task to `Releasing` and spawn the run.
    ///
    /// On failure nothing runs and the task leaves the registry. Starting an
    /// already started task does nothing. Must be called within a Tokio
    /// runtime.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        match self.begin() {
            Ok(Some(version)) => {
                self.spawn(version);
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(err) => {
                tracing::warn!(task_id = self.id, error = %err, "release refused");
                self.state.lock().stopped = true;
                self.unregister();
                Err(err)
            }
        }
    }

    fn begin(&self) -> Result<Option<String>> {
        self.request.check()?;
        {
            let mut state = self.state.lock();
            if state.started {
                return Ok(None);
            }
            state.started = true;
        }

        let version = release_version(self.request.project.id, self.id, Utc::now());
        let moved = self.services.store.transition_status(
            self.id,
            TaskStatus::Approved,
            TaskStatus::Releasing,
            Some(&version),
            None,
        )?;
        if !moved {
            let actual = self
                .services
                .store
                .load_task(self.id)
                .map(|task| task.status.as_str())
                .unwrap_or("unknown");
            return Err(Error::task_invalid_status(
                self.id,
                TaskStatus::Approved.as_str(),
                actual,
            ));
        }

        {
            let mut task = self.task.lock();
            task.status = TaskStatus::Releasing;
            task.version = version.clone();
        }
        tracing::info!(
            task_id = self.id,
            version = %version,
            servers = self.request.servers.len(),
            "release started"
        );
        Ok(Some(version))
    }

    fn spawn(self: &Arc<Self>, version: String) {
        let task = Arc::clone(self);
        tokio::spawn(async move {
            let mut pipeline = Pipeline::new(&task, version);
            let result = pipeline.run().await;
            let (dirs, hosts) = pipeline.into_parts();
            task.finish(result, dirs, hosts).await;
        });

        if let Some(timeout) = self.services.release_timeout {
            let cancel = self.cancel.clone();
            let mut done = self.done.subscribe();
            let id = self.id;
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(timeout) => {
                        tracing::warn!(task_id = id, timeout_secs = timeout.as_secs(), "release timed out, stopping");
                        cancel.cancel();
                    }
                    _ = until_done(&mut done) => {}
                }
            });
        }
    }

    /// Request a stop. Only a started, unfinished task reacts; commands
    /// already running are left to finish.
    pub fn stop(&self) -> bool {
        let state = self.state.lock();
        if state.started && !state.stopped {
            self.cancel.cancel();
            tracing::info!(task_id = self.id, "stop requested");
            true
        } else {
            false
        }
    }

    /// Completion signal: holds the outcome once the run ended.
    pub fn finished(&self) -> watch::Receiver<Option<TaskOutcome>> {
        self.done.subscribe()
    }

    pub async fn wait(&self) -> Option<TaskOutcome> {
        let mut done = self.done.subscribe();
        until_done(&mut done).await;
        let outcome = done.borrow().clone();
        outcome
    }

    /// Keep the link target read before the swap, even if the swap fails.
    pub(crate) fn remember_prev_version(&self, prev_version: &str) {
        self.task.lock().prev_version = prev_version.to_string();
    }

    pub(crate) fn persist_prev_version(&self, prev_version: &str) {
        if let Err(err) = self
            .services
            .store
            .update_prev_version(self.id, prev_version)
        {
            tracing::warn!(task_id = self.id, error = %err, "failed to persist previous version");
        }
    }

    async fn finish(&self, result: Result<()>, dirs: Option<DeployDirs>, hosts: HostOutcomes) {
        let status = final_status(&result, &hosts);
        let last_error = match &result {
            Ok(()) => String::new(),
            Err(err) => err.message.clone(),
        };
        // A stop seen by host branches surfaces as a remote failure.
        let stopped = match &result {
            Ok(()) => false,
            Err(err) => err.is_stopped() || self.cancel.is_cancelled(),
        };

        match &result {
            Ok(()) => tracing::info!(task_id = self.id, "release finished"),
            Err(_) if stopped => tracing::info!(task_id = self.id, %status, "release stopped"),
            Err(err) => tracing::warn!(task_id = self.id, %status, error = %err, "release failed"),
        }

        if let Some(dirs) = dirs {
            if let Err(err) = tokio::task::spawn_blocking(move || dirs.cleanup()).await {
                tracing::warn!(task_id = self.id, error = %err, "cleanup of local paths failed");
            }
        }

        if let Err(err) = self
            .services
            .store
            .finish_task(self.id, status, &last_error)
        {
            tracing::error!(
                task_id = self.id,
                %status,
                error = %err,
                "failed to persist final task status"
            );
        }

        let outcome = {
            let mut task = self.task.lock();
            task.status = status;
            task.last_error = last_error.clone();
            TaskOutcome {
                task_id: self.id,
                status,
                version: task.version.clone(),
                prev_version: task.prev_version.clone(),
                last_error,
                stopped,
                hosts: hosts
                    .iter()
                    .map(|(server_id, err)| HostResult {
                        server_id,
                        error: err.map(|e| e.message.clone()),
                    })
                    .collect(),
            }
        };

        self.state.lock().stopped = true;
        self.unregister();
        self.done.send_replace(Some(outcome));
    }

    fn unregister(&self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove_task(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_success_finishes() {
        let mut hosts = HostOutcomes::default();
        hosts.insert(1, Some(Error::deploy_upload_failed("a", "refused")));
        hosts.insert(2, None);
        let failed: Result<()> = Err(hosts.to_error());
        assert_eq!(final_status(&failed, &hosts), TaskStatus::Finished);
    }

    #[test]
    fn failure_before_fan_out_is_release_failed() {
        let failed: Result<()> = Err(Error::deploy_checkout_failed("no ref"));
        assert_eq!(
            final_status(&failed, &HostOutcomes::default()),
            TaskStatus::ReleaseFailed
        );
        assert_eq!(
            final_status(&Ok(()), &HostOutcomes::default()),
            TaskStatus::Finished
        );
    }
}
