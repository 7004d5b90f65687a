//! Execution records: the audit trail of every command a task runs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::engine::{CommandError, ExecutorFactory, ExitCode};
use crate::envs::EnvSet;
use crate::error::{CommandFailedDetails, Error, Result};
use crate::server::Server;
use crate::store::Store;

pub const STATUS_PENDING: i32 = ExitCode::NOT_RUN;
pub const STATUS_SUCCESS: i32 = 0;
pub const STATUS_ABNORMAL: i32 = ExitCode::ABNORMAL;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Stage {
    PrevDeploy,
    Deploy,
    PostDeploy,
    PrevRelease,
    Release,
    PostRelease,
}

impl Stage {
    pub fn code(&self) -> i32 {
        match self {
            Stage::PrevDeploy => 1,
            Stage::Deploy => 2,
            Stage::PostDeploy => 3,
            Stage::PrevRelease => 4,
            Stage::Release => 5,
            Stage::PostRelease => 6,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            1 => Some(Stage::PrevDeploy),
            2 => Some(Stage::Deploy),
            3 => Some(Stage::PostDeploy),
            4 => Some(Stage::PrevRelease),
            5 => Some(Stage::Release),
            6 => Some(Stage::PostRelease),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::PrevDeploy => "prevDeploy",
            Stage::Deploy => "deploy",
            Stage::PostDeploy => "postDeploy",
            Stage::PrevRelease => "prevRelease",
            Stage::Release => "release",
            Stage::PostRelease => "postRelease",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRecord {
    pub id: i64,
    pub stage: Stage,
    pub task_id: i64,
    /// Target host; `None` means the command ran locally.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_id: Option<i64>,
    pub user_id: i64,
    pub command: String,
    #[serde(default)]
    pub envs: Vec<String>,
    /// Exit status; 0 is success, -1 means the command never ran.
    pub status: i32,
    #[serde(default)]
    pub output: String,
    pub run_time_ms: i64,
    pub created_at: DateTime<Utc>,
}

impl ExecutionRecord {
    pub fn new(stage: Stage, task_id: i64, user_id: i64, command: impl Into<String>) -> Self {
        Self {
            id: 0,
            stage,
            task_id,
            server_id: None,
            user_id,
            command: command.into(),
            envs: Vec::new(),
            status: STATUS_PENDING,
            output: String::new(),
            run_time_ms: 0,
            created_at: Utc::now(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == STATUS_SUCCESS
    }
}

/// Runs one command and persists exactly one record for it.
pub struct Recorder<'a> {
    store: Arc<dyn Store>,
    executors: &'a dyn ExecutorFactory,
    server: Option<&'a Server>,
    envs: &'a EnvSet,
    record: ExecutionRecord,
}

impl<'a> Recorder<'a> {
    pub fn local(
        store: Arc<dyn Store>,
        executors: &'a dyn ExecutorFactory,
        envs: &'a EnvSet,
        record: ExecutionRecord,
    ) -> Self {
        Self {
            store,
            executors,
            server: None,
            envs,
            record,
        }
    }

    pub fn remote(
        store: Arc<dyn Store>,
        executors: &'a dyn ExecutorFactory,
        server: &'a Server,
        envs: &'a EnvSet,
        mut record: ExecutionRecord,
    ) -> Self {
        record.server_id = Some(server.id);
        Self {
            store,
            executors,
            server: Some(server),
            envs,
            record,
        }
    }

    /// Run the command, persist the record whatever the outcome, and hand
    /// the failure back to the caller.
    pub async fn run(&mut self, cancel: &CancellationToken) -> Result<()> {
        self.record.envs = self.envs.to_vec();
        let started = Instant::now();

        let executor = match self.server {
            Some(server) => self.executors.remote(server),
            None => Ok(self.executors.local()),
        };
        let outcome = match executor {
            Ok(executor) => {
                let result = executor.run(&self.record.command, self.envs, cancel).await;
                executor.close().await;
                result.map_err(|err| self.command_error(err))
            }
            Err(err) => Err((ExitCode::Unavailable, err.message.clone(), err)),
        };

        let result = match outcome {
            Ok(output) => {
                self.record.status = STATUS_SUCCESS;
                self.record.output = output;
                Ok(())
            }
            Err((exit, output, err)) => {
                self.record.status = exit.status();
                self.record.output = if output.is_empty() {
                    err.message.clone()
                } else {
                    output
                };
                Err(err)
            }
        };
        self.record.run_time_ms = started.elapsed().as_millis() as i64;
        self.persist().await;

        tracing::debug!(
            task_id = self.record.task_id,
            server_id = ?self.record.server_id,
            stage = %self.record.stage,
            exit_code = self.record.status,
            "command finished"
        );
        result
    }

    /// Record a step whose outcome does not come from a shell exit code.
    pub async fn save(&mut self, status: i32, output: impl Into<String>, duration_ms: i64) {
        self.record.status = status;
        self.record.output = output.into();
        self.record.run_time_ms = duration_ms;
        if self.record.envs.is_empty() {
            self.record.envs = self.envs.to_vec();
        }
        self.persist().await;
    }

    /// Output captured by the last run or save.
    pub fn output(&self) -> &str {
        &self.record.output
    }

    pub fn record(&self) -> &ExecutionRecord {
        &self.record
    }

    fn command_error(&self, err: CommandError) -> (ExitCode, String, Error) {
        let mapped = if err.exit == ExitCode::Stopped {
            Error::deploy_stopped()
        } else {
            Error::command_failed(CommandFailedDetails {
                command: self.record.command.clone(),
                exit_code: err.exit.status(),
                output: err.output.clone(),
                server_id: self.record.server_id,
            })
        };
        (err.exit, err.output, mapped)
    }

    /// Store writes run on the blocking pool.
    async fn persist(&mut self) {
        self.record.created_at = Utc::now();
        let store = Arc::clone(&self.store);
        let record = self.record.clone();
        let inserted = tokio::task::spawn_blocking(move || store.insert_record(&record))
            .await
            .map_err(|e| Error::internal_unexpected(e.to_string()))
            .and_then(|result| result);
        match inserted {
            Ok(id) => self.record.id = id,
            Err(err) => tracing::warn!(
                task_id = self.record.task_id,
                stage = %self.record.stage,
                error = %err,
                "failed to persist execution record"
            ),
        }
    }
}
