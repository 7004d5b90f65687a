// Command execution - one shell command, local or over ssh.
//
// Both variants take the task's variable set and cancellation token on each
// call. A command is refused once the token has fired; a command already
// running is left to finish.
//
// Env injection:
// - local: variables are added to the inherited process environment
// - remote: variables are exported in front of the command text

use async_trait::async_trait;
use std::fmt;
use std::process::ExitStatus;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::envs::EnvSet;
use crate::error::Result;
use crate::server::Server;
use crate::ssh::{execute_local_command, CommandOutput, SshClient, SshSettings};
use crate::utils::shell;

/// How a command ended, normalized across local processes and ssh sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    /// The process exited with this code.
    Exited(i32),
    /// Killed by a signal before exiting.
    Signaled,
    /// The process or session could not be started.
    Unavailable,
    /// Refused because the task was stopped.
    Stopped,
}

impl ExitCode {
    /// Record status for ends that carry no exit code.
    pub const ABNORMAL: i32 = 255;
    /// Record status of a command that never ran.
    pub const NOT_RUN: i32 = -1;

    pub fn from_status(status: ExitStatus) -> Self {
        match status.code() {
            Some(code) => ExitCode::Exited(code),
            None => ExitCode::Signaled,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ExitCode::Exited(0))
    }

    /// The numeric status stored on an execution record.
    pub fn status(&self) -> i32 {
        match self {
            ExitCode::Exited(code) => *code,
            ExitCode::Stopped => Self::NOT_RUN,
            ExitCode::Signaled | ExitCode::Unavailable => Self::ABNORMAL,
        }
    }
}

impl fmt::Display for ExitCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitCode::Exited(code) => write!(f, "exit status {}", code),
            ExitCode::Signaled => write!(f, "terminated by signal"),
            ExitCode::Unavailable => write!(f, "could not start"),
            ExitCode::Stopped => write!(f, "stopped"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CommandError {
    pub exit: ExitCode,
    /// Combined output captured before the failure.
    pub output: String,
    pub message: String,
}

impl CommandError {
    pub fn stopped() -> Self {
        Self {
            exit: ExitCode::Stopped,
            output: String::new(),
            message: "task stopped before the command started".to_string(),
        }
    }

    fn from_output(output: &CommandOutput) -> Self {
        let detail = output.stderr.trim();
        let message = if detail.is_empty() {
            output.exit.to_string()
        } else {
            format!("{}: {}", output.exit, detail)
        };
        Self {
            exit: output.exit,
            output: output.combined(),
            message,
        }
    }
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CommandError {}

pub type CommandResult = std::result::Result<String, CommandError>;

#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Run one shell command. Returns the combined output on exit status 0.
    async fn run(&self, command: &str, envs: &EnvSet, cancel: &CancellationToken) -> CommandResult;

    /// Release the underlying session, if any.
    async fn close(&self) {}
}

/// Produces executors for the engine; a target host selects the remote
/// variant.
pub trait ExecutorFactory: Send + Sync {
    fn local(&self) -> Arc<dyn CommandExecutor>;
    fn remote(&self, server: &Server) -> Result<Arc<dyn CommandExecutor>>;
}

fn finish(output: CommandOutput) -> CommandResult {
    if output.success() {
        Ok(output.combined())
    } else {
        Err(CommandError::from_output(&output))
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LocalExecutor;

#[async_trait]
impl CommandExecutor for LocalExecutor {
    async fn run(&self, command: &str, envs: &EnvSet, cancel: &CancellationToken) -> CommandResult {
        if cancel.is_cancelled() {
            return Err(CommandError::stopped());
        }
        finish(execute_local_command(command, &envs.to_pairs()).await)
    }
}

#[derive(Debug, Clone)]
pub struct RemoteExecutor {
    client: SshClient,
}

impl RemoteExecutor {
    pub fn new(client: SshClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl CommandExecutor for RemoteExecutor {
    async fn run(&self, command: &str, envs: &EnvSet, cancel: &CancellationToken) -> CommandResult {
        if cancel.is_cancelled() {
            return Err(CommandError::stopped());
        }
        let command = shell::with_exports(&envs.to_pairs(), command);
        finish(self.client.execute_until(&command, cancel).await)
    }
}

/// Local processes and the system ssh binary.
#[derive(Debug, Clone, Default)]
pub struct SystemExecutors {
    ssh: SshSettings,
}

impl SystemExecutors {
    pub fn new(ssh: SshSettings) -> Self {
        Self { ssh }
    }
}

impl ExecutorFactory for SystemExecutors {
    fn local(&self) -> Arc<dyn CommandExecutor> {
        Arc::new(LocalExecutor)
    }

    fn remote(&self, server: &Server) -> Result<Arc<dyn CommandExecutor>> {
        let client = SshClient::from_server(server, &self.ssh)?;
        Ok(Arc::new(RemoteExecutor::new(client)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(ExitCode::Exited(0).status(), 0);
        assert_eq!(ExitCode::Exited(3).status(), 3);
        assert_eq!(ExitCode::Signaled.status(), 255);
        assert_eq!(ExitCode::Unavailable.status(), 255);
        assert_eq!(ExitCode::Stopped.status(), -1);
    }

    #[tokio::test]
    async fn local_success_returns_output() {
        let envs = EnvSet::from_pairs([("GREETING", "hello")]);
        let out = LocalExecutor
            .run("echo \"$GREETING\"", &envs, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out.trim(), "hello");
    }

    #[tokio::test]
    async fn local_failure_keeps_exit_code_and_output() {
        let err = LocalExecutor
            .run("echo partial; exit 7", &EnvSet::new(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.exit, ExitCode::Exited(7));
        assert_eq!(err.output.trim(), "partial");
    }

    #[tokio::test]
    async fn cancelled_token_refuses_to_start() {
        let dir = tempfile::TempDir::new().unwrap();
        let marker = dir.path().join("ran");
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = LocalExecutor
            .run(
                &format!("touch {}", shell::quote_path(&marker.to_string_lossy())),
                &EnvSet::new(),
                &cancel,
            )
            .await
            .unwrap_err();
        assert_eq!(err.exit, ExitCode::Stopped);
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn remote_executor_exports_envs_on_localhost() {
        let server = Server {
            id: 1,
            name: "local".to_string(),
            host: "127.0.0.1".to_string(),
            user: "deploy".to_string(),
            port: 22,
            identity_file: None,
            status: Default::default(),
        };
        let executor = SystemExecutors::default().remote(&server).unwrap();
        let envs = EnvSet::from_pairs([("RELEASE_VERSION", "1_2_20240101_000000")]);
        let out = executor
            .run("echo \"$RELEASE_VERSION\"", &envs, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out.trim(), "1_2_20240101_000000");
    }
}
