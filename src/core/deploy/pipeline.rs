//! The four local phases of a run.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use super::dirs::DeployDirs;
use super::fanout::HostOutcomes;
use super::{DeployTask, Services};
use crate::envs::{self, EnvSet};
use crate::error::{Error, Result};
use crate::project::Project;
use crate::record::{ExecutionRecord, Recorder, Stage, STATUS_ABNORMAL, STATUS_SUCCESS};
use crate::repository::SourceRepository;
use crate::task::Revision;
use crate::utils::{io, parser, shell};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Phase {
    PrevDeploy,
    Deploy,
    PostDeploy,
    RemoteRelease,
}

impl Phase {
    const ORDER: [Phase; 4] = [
        Phase::PrevDeploy,
        Phase::Deploy,
        Phase::PostDeploy,
        Phase::RemoteRelease,
    ];

    fn as_str(&self) -> &'static str {
        match self {
            Phase::PrevDeploy => "prevDeploy",
            Phase::Deploy => "deploy",
            Phase::PostDeploy => "postDeploy",
            Phase::RemoteRelease => "remoteRelease",
        }
    }
}

/// State of one run, alive for the run's duration.
pub(super) struct Pipeline<'a> {
    pub(super) task: &'a DeployTask,
    pub(super) version: String,
    pub(super) envs: EnvSet,
    pub(super) hosts: HostOutcomes,
    dirs: Option<DeployDirs>,
    repository: Option<Arc<dyn SourceRepository>>,
    revision: Option<Revision>,
}

impl<'a> Pipeline<'a> {
    pub(super) fn new(task: &'a DeployTask, version: String) -> Self {
        let envs = envs::task_envs(&task.request.project, &task.request.task);
        envs.add(envs::RELEASE_VERSION, version.clone());
        Self {
            task,
            version,
            envs,
            hosts: HostOutcomes::default(),
            dirs: None,
            repository: None,
            revision: None,
        }
    }

    pub(super) async fn run(&mut self) -> Result<()> {
        for phase in Phase::ORDER {
            if self.task.cancel.is_cancelled() {
                tracing::info!(task_id = self.task.id, phase = phase.as_str(), "stop observed, skipping phase");
                return Err(Error::deploy_stopped());
            }
            tracing::debug!(task_id = self.task.id, phase = phase.as_str(), "phase started");
            match phase {
                Phase::PrevDeploy => self.prev_deploy().await?,
                Phase::Deploy => self.deploy().await?,
                Phase::PostDeploy => self.post_deploy().await?,
                Phase::RemoteRelease => self.remote_release().await?,
            }
        }
        Ok(())
    }

    /// Hand back what the run leaves behind: local paths to clean and the
    /// host aggregate.
    pub(super) fn into_parts(self) -> (Option<DeployDirs>, HostOutcomes) {
        (self.dirs, self.hosts)
    }

    pub(super) fn services(&self) -> &'a Services {
        &self.task.services
    }

    pub(super) fn project(&self) -> &'a Project {
        &self.task.request.project
    }

    pub(super) fn dirs(&self) -> Result<&DeployDirs> {
        self.dirs
            .as_ref()
            .ok_or_else(|| Error::internal_unexpected("deploy paths used before prevDeploy"))
    }

    pub(super) fn checkpoint(&self) -> Result<()> {
        if self.task.cancel.is_cancelled() {
            return Err(Error::deploy_stopped());
        }
        Ok(())
    }

    pub(super) fn record(&self, stage: Stage, command: impl Into<String>) -> ExecutionRecord {
        ExecutionRecord::new(stage, self.task.id, self.task.actor_id, command)
    }

    /// Resolve the revision and repository, lay out the run's paths and
    /// run the project's pre-checkout commands.
    async fn prev_deploy(&mut self) -> Result<()> {
        let services = self.services();
        let project = self.project();

        let revision = self.task.request.task.revision()?;
        let repository = services.repositories.open(project)?;
        let dirs = DeployDirs::new(
            &services.workspace,
            project,
            &self.version,
            services.archiver.extension(),
        );
        tokio::fs::create_dir_all(&dirs.project_dir)
            .await
            .map_err(|e| {
                Error::internal_io(
                    e.to_string(),
                    Some(format!("create {}", dirs.project_dir.display())),
                )
            })?;
        self.envs
            .add(envs::DEPLOY_PATH, dirs.staging.to_string_lossy().to_string());

        let project_dir = dirs.project_dir.clone();
        self.dirs = Some(dirs);
        self.repository = Some(repository);
        self.revision = Some(revision);

        let commands = parser::parse_commands(&project.prev_deploy);
        self.run_local(Stage::PrevDeploy, commands, Some(project_dir.as_path()))
            .await
    }

    /// Check out the revision and copy the tree into the staging directory.
    async fn deploy(&mut self) -> Result<()> {
        let (repository, revision) = match (&self.repository, &self.revision) {
            (Some(repository), Some(revision)) => (repository.clone(), revision.clone()),
            _ => {
                return Err(Error::internal_unexpected(
                    "repository used before prevDeploy",
                ))
            }
        };
        let dirs = self.dirs()?.clone();
        let services = self.services();

        let mut recorder = Recorder::local(
            Arc::clone(&services.store),
            services.executors.as_ref(),
            &self.envs,
            self.record(
                Stage::Deploy,
                format!(
                    "checkout {} && copy {} {}",
                    revision,
                    repository.working_path().display(),
                    dirs.staging.display()
                ),
            ),
        );
        let started = Instant::now();
        let staged = self
            .checkout_to_staging(repository.as_ref(), &revision, &dirs)
            .await;
        let elapsed = started.elapsed().as_millis() as i64;
        match staged {
            Ok(files) => {
                recorder.save(STATUS_SUCCESS, format!("{} files staged", files), elapsed).await;
                Ok(())
            }
            Err(err) => {
                recorder.save(STATUS_ABNORMAL, err.message.clone(), elapsed).await;
                Err(err)
            }
        }
    }

    async fn checkout_to_staging(
        &self,
        repository: &dyn SourceRepository,
        revision: &Revision,
        dirs: &DeployDirs,
    ) -> Result<usize> {
        // Runs of one project share the working copy.
        let lock = self.services().checkout_lock(self.project().id);
        let _guard = lock.lock().await;

        repository.checkout(revision).await?;

        let source = repository.working_path();
        let staging = dirs.staging.clone();
        tokio::task::spawn_blocking(move || io::copy_tree(&source, &staging))
            .await
            .map_err(|e| Error::internal_unexpected(e.to_string()))?
            .map_err(|e| Error::deploy_checkout_failed(e.message))
    }

    /// Run the project's build commands in the staging directory, then pack
    /// it.
    async fn post_deploy(&mut self) -> Result<()> {
        let dirs = self.dirs()?.clone();
        let project = self.project();

        let commands = parser::parse_commands(&project.post_deploy);
        self.run_local(Stage::PostDeploy, commands, Some(dirs.staging.as_path()))
            .await?;

        let services = self.services();
        let mut recorder = Recorder::local(
            Arc::clone(&services.store),
            services.executors.as_ref(),
            &self.envs,
            self.record(
                Stage::PostDeploy,
                format!(
                    "pack {} from {}",
                    dirs.package.display(),
                    dirs.staging.display()
                ),
            ),
        );

        let archiver = Arc::clone(&services.archiver);
        let filter = project.file_filter();
        let started = Instant::now();
        let packed = tokio::task::spawn_blocking(move || {
            archiver.pack(&dirs.package, &dirs.staging, &filter)
        })
        .await
        .map_err(|e| Error::internal_unexpected(e.to_string()))
        .and_then(|result| result);
        let elapsed = started.elapsed().as_millis() as i64;

        match packed {
            Ok(files) => {
                tracing::debug!(task_id = self.task.id, files, "package written");
                recorder.save(STATUS_SUCCESS, format!("{} files packed", files), elapsed).await;
                Ok(())
            }
            Err(err) => {
                recorder.save(STATUS_ABNORMAL, err.message.clone(), elapsed).await;
                Err(err)
            }
        }
    }

    async fn run_local(&self, stage: Stage, commands: Vec<String>, dir: Option<&Path>) -> Result<()> {
        let services = self.services();
        for command in commands {
            let command = match dir {
                Some(dir) => shell::in_dir(&dir.to_string_lossy(), &command),
                None => command,
            };
            let mut recorder = Recorder::local(
                Arc::clone(&services.store),
                services.executors.as_ref(),
                &self.envs,
                self.record(stage, command),
            );
            recorder.run(&self.task.cancel).await?;
        }
        Ok(())
    }
}
