//! Per-host release branches.
//!
//! Each host runs prevRelease, release and postRelease in order. A failing
//! step ends that host's branch only; siblings carry on.

use futures::stream::{self, StreamExt};
use serde_json::json;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use super::pipeline::Pipeline;
use crate::error::{Error, Result};
use crate::record::{Recorder, Stage, STATUS_ABNORMAL, STATUS_SUCCESS};
use crate::server::Server;
use crate::utils::{parser, shell};

/// Outcome of every host branch, keyed by server id. `None` is success.
#[derive(Debug, Clone, Default)]
pub struct HostOutcomes {
    outcomes: BTreeMap<i64, Option<Error>>,
}

impl HostOutcomes {
    pub fn insert(&mut self, server_id: i64, outcome: Option<Error>) {
        self.outcomes.insert(server_id, outcome);
    }

    pub fn has_success(&self) -> bool {
        self.outcomes.values().any(Option::is_none)
    }

    pub fn failures(&self) -> impl Iterator<Item = (i64, &Error)> {
        self.outcomes
            .iter()
            .filter_map(|(id, outcome)| outcome.as_ref().map(|err| (*id, err)))
    }

    pub fn failed_count(&self) -> usize {
        self.failures().count()
    }

    pub fn iter(&self) -> impl Iterator<Item = (i64, Option<&Error>)> {
        self.outcomes.iter().map(|(id, outcome)| (*id, outcome.as_ref()))
    }

    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    /// The phase error for a fan-out with at least one failed host.
    pub fn to_error(&self) -> Error {
        let failed: Vec<i64> = self.failures().map(|(id, _)| id).collect();
        let succeeded: Vec<i64> = self
            .iter()
            .filter(|(_, err)| err.is_none())
            .map(|(id, _)| id)
            .collect();
        Error::deploy_remote_failed(
            self.to_string(),
            json!({ "failed": failed, "succeeded": succeeded }),
        )
    }
}

/// `[<server id>]<message>;` for every failed host.
impl fmt::Display for HostOutcomes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (id, err) in self.failures() {
            write!(f, "[{}]{};", id, err.message)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
enum HostStep {
    PrevRelease,
    Release,
    PostRelease,
}

impl<'a> Pipeline<'a> {
    /// Release to every target host and wait for all branches.
    pub(super) async fn remote_release(&mut self) -> Result<()> {
        let servers = self.task.request.servers.clone();
        let limit = match self.services().max_parallel_hosts {
            0 => servers.len().max(1),
            n => n,
        };

        let this = &*self;
        let results: Vec<(i64, Option<Error>)> = stream::iter(servers)
            .map(|server: Server| async move {
                let outcome = this.release_host(&server).await.err();
                (server.id, outcome)
            })
            .buffer_unordered(limit)
            .collect()
            .await;

        for (server_id, outcome) in results {
            if let Some(err) = &outcome {
                tracing::warn!(task_id = self.task.id, server_id, error = %err, "host release failed");
            }
            self.hosts.insert(server_id, outcome);
        }

        if self.hosts.failed_count() == 0 {
            Ok(())
        } else {
            Err(self.hosts.to_error())
        }
    }

    async fn release_host(&self, server: &Server) -> Result<()> {
        for step in [HostStep::PrevRelease, HostStep::Release, HostStep::PostRelease] {
            self.checkpoint()?;
            match step {
                HostStep::PrevRelease => self.prev_release(server).await?,
                HostStep::Release => self.release(server).await?,
                HostStep::PostRelease => self.post_release(server).await?,
            }
        }
        self.prune_releases(server).await;
        tracing::info!(task_id = self.task.id, server_id = server.id, "host released");
        Ok(())
    }

    /// Upload the package, unpack it into the release directory, then run
    /// the project's pre-release commands there.
    async fn prev_release(&self, server: &Server) -> Result<()> {
        let services = self.services();
        let dirs = self.dirs()?;

        let mut upload = Recorder::remote(
            Arc::clone(&services.store),
            services.executors.as_ref(),
            server,
            &self.envs,
            self.record(
                Stage::PrevRelease,
                format!(
                    "upload {} {}:{}",
                    dirs.package.display(),
                    server.address(),
                    dirs.remote_package
                ),
            ),
        );
        let started = Instant::now();
        let copied = services
            .transfer
            .copy(server, &dirs.package, &dirs.remote_package)
            .await;
        let elapsed = started.elapsed().as_millis() as i64;
        match copied {
            Ok(()) => upload.save(STATUS_SUCCESS, "success", elapsed).await,
            Err(err) => {
                upload.save(STATUS_ABNORMAL, err.message.clone(), elapsed).await;
                return Err(err);
            }
        }

        let unpack = services
            .archiver
            .unpack_command(&dirs.remote_package, &dirs.remote_release_dir);
        self.run_remote(server, Stage::PrevRelease, vec![unpack], None)
            .await?;

        let commands = parser::parse_commands(&self.project().prev_release);
        self.run_remote(
            server,
            Stage::PrevRelease,
            commands,
            Some(dirs.remote_release_dir.as_str()),
        )
        .await
    }

    /// Capture the current link target, then swap the link: a temporary
    /// link to the new release is renamed onto the active path.
    async fn release(&self, server: &Server) -> Result<()> {
        let services = self.services();
        let dirs = self.dirs()?;
        let link = shell::quote_path(&dirs.remote_root_link);

        let mut read = Recorder::remote(
            Arc::clone(&services.store),
            services.executors.as_ref(),
            server,
            &self.envs,
            self.record(
                Stage::Release,
                format!("[ -L {link} ] && readlink {link} || echo \"\"", link = link),
            ),
        );
        read.run(&self.task.cancel).await?;
        let previous = read.output().trim().to_string();
        self.task.remember_prev_version(&previous);

        let temp_link = shell::quote_path(&dirs.temp_link(&self.version));
        let swap = vec![
            format!(
                "mkdir -p {} && ln -sfn {} {}",
                shell::quote_path(shell::posix_parent(&dirs.remote_root_link)),
                shell::quote_path(&dirs.remote_release_dir),
                temp_link
            ),
            format!("mv -fT {} {}", temp_link, link),
        ];
        self.run_remote(server, Stage::Release, swap, None).await?;

        self.task.persist_prev_version(&previous);
        Ok(())
    }

    async fn post_release(&self, server: &Server) -> Result<()> {
        let dirs = self.dirs()?;
        let commands = parser::parse_commands(&self.project().post_release);
        self.run_remote(
            server,
            Stage::PostRelease,
            commands,
            Some(dirs.remote_root_link.as_str()),
        )
        .await
    }

    /// Remove release directories beyond the newest `keep_versions`.
    /// Failure is logged and does not fail the host.
    async fn prune_releases(&self, server: &Server) {
        let keep = self.project().keep_versions;
        if keep == 0 {
            return;
        }
        let Ok(dirs) = self.dirs() else {
            return;
        };
        let releases = shell::posix_parent(&dirs.remote_release_dir);
        let command = format!(
            "cd {releases} && ls -1dt -- */ 2>/dev/null | tail -n +{skip} | \
             while IFS= read -r dir; do [ \"${{dir%/}}\" = {current} ] || rm -rf -- \"$dir\"; done",
            releases = shell::quote_path(releases),
            skip = keep + 1,
            current = shell::quote_arg(&self.version),
        );
        if let Err(err) = self
            .run_remote(server, Stage::PostRelease, vec![command], None)
            .await
        {
            tracing::warn!(
                task_id = self.task.id,
                server_id = server.id,
                error = %err,
                "pruning old releases failed"
            );
        }
    }

    async fn run_remote(
        &self,
        server: &Server,
        stage: Stage,
        commands: Vec<String>,
        dir: Option<&str>,
    ) -> Result<()> {
        let services = self.services();
        for command in commands {
            let command = match dir {
                Some(dir) => shell::in_dir(dir, &command),
                None => command,
            };
            let mut recorder = Recorder::remote(
                Arc::clone(&services.store),
                services.executors.as_ref(),
                server,
                &self.envs,
                self.record(stage, command),
            );
            recorder.run(&self.task.cancel).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregate_reports_failures_in_server_order() {
        let mut hosts = HostOutcomes::default();
        hosts.insert(3, None);
        hosts.insert(2, Some(Error::deploy_upload_failed("web-2", "disk full")));
        hosts.insert(1, None);

        assert!(hosts.has_success());
        assert_eq!(hosts.failed_count(), 1);
        assert_eq!(hosts.len(), 3);
        assert_eq!(
            hosts.to_string(),
            format!("[2]{};", Error::deploy_upload_failed("web-2", "disk full").message)
        );

        let err = hosts.to_error();
        assert_eq!(err.code, crate::error::ErrorCode::DeployRemoteFailed);
        assert_eq!(err.details["failed"], json!([2]));
        assert_eq!(err.details["succeeded"], json!([1, 3]));
    }

    #[test]
    fn all_failed_has_no_success() {
        let mut hosts = HostOutcomes::default();
        for id in 1..=3 {
            hosts.insert(id, Some(Error::deploy_stopped()));
        }
        assert!(!hosts.has_success());
        assert_eq!(hosts.failed_count(), 3);
    }
}
