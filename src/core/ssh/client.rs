use serde::{Deserialize, Serialize};
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::engine::ExitCode;
use crate::error::{Error, Result};
use crate::server::Server;
use crate::utils::shell;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SshSettings {
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_retry_attempts() -> u32 {
    3
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout_secs(),
            retry_attempts: default_retry_attempts(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SshClient {
    pub host: String,
    pub user: String,
    pub port: u16,
    pub identity_file: Option<String>,
    /// When true, all commands run locally instead of over SSH.
    /// Set automatically when the server host is localhost/127.0.0.1/::1.
    pub is_local: bool,
    settings: SshSettings,
}

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit: ExitCode,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit.is_success()
    }

    /// stdout followed by stderr, the text kept on execution records.
    pub fn combined(&self) -> String {
        match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (_, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (false, false) => {
                let mut text = self.stdout.clone();
                if !text.ends_with('\n') {
                    text.push('\n');
                }
                text.push_str(&self.stderr);
                text
            }
        }
    }

    fn unavailable(message: String) -> Self {
        Self {
            stdout: String::new(),
            stderr: message,
            exit: ExitCode::Unavailable,
        }
    }
}

impl SshClient {
    pub fn from_server(server: &Server, settings: &SshSettings) -> Result<Self> {
        let identity_file = match &server.identity_file {
            Some(path) if !path.is_empty() => {
                let expanded = shellexpand::tilde(path).to_string();
                if !Path::new(&expanded).exists() {
                    return Err(Error::ssh_identity_file_not_found(server.id, expanded));
                }
                Some(expanded)
            }
            _ => None,
        };

        let is_local = is_local_host(&server.host);
        if is_local {
            tracing::debug!(server_id = server.id, "localhost server, using local execution");
        }

        Ok(Self {
            host: server.host.clone(),
            user: server.user.clone(),
            port: server.port,
            identity_file,
            is_local,
            settings: settings.clone(),
        })
    }

    fn build_ssh_args(&self, command: &str) -> Vec<String> {
        let mut args = Vec::new();

        if let Some(identity_file) = &self.identity_file {
            args.push("-i".to_string());
            args.push(identity_file.clone());
        }

        if self.port != 22 {
            args.push("-p".to_string());
            args.push(self.port.to_string());
        }

        // Never prompt, and give up on stalled connections.
        args.extend([
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.settings.connect_timeout_secs),
            "-o".to_string(),
            "ServerAliveInterval=15".to_string(),
            "-o".to_string(),
            "ServerAliveCountMax=3".to_string(),
        ]);

        args.push(format!("{}@{}", self.user, self.host));
        args.push(command.to_string());
        args
    }

    pub async fn execute(&self, command: &str) -> CommandOutput {
        self.execute_with_retry(command, None, None).await
    }

    /// Same as [`execute`](Self::execute), but stops waiting between
    /// connection retries once `cancel` fires.
    pub async fn execute_until(&self, command: &str, cancel: &CancellationToken) -> CommandOutput {
        self.execute_with_retry(command, None, Some(cancel)).await
    }

    /// Stream `local_path` into `remote_path`, creating the parent directory.
    pub async fn upload_file(&self, local_path: &Path, remote_path: &str) -> CommandOutput {
        let remote_command = format!(
            "mkdir -p {} && cat > {}",
            shell::quote_path(shell::posix_parent(remote_path)),
            shell::quote_path(remote_path)
        );
        self.execute_with_retry(&remote_command, Some(local_path), None)
            .await
    }

    async fn execute_with_retry(
        &self,
        command: &str,
        stdin_file: Option<&Path>,
        cancel: Option<&CancellationToken>,
    ) -> CommandOutput {
        let max_attempts = self.settings.retry_attempts.max(1);
        let backoff_secs = [0, 2, 5];

        let mut attempt = 0;
        loop {
            let result = self.execute_once(command, stdin_file).await;

            // Only a connection that never opened is retried; a command that
            // ran is never run again. Local runs have no connection at all.
            if self.is_local
                || result.success()
                || attempt + 1 >= max_attempts
                || !is_transient_ssh_error(&result)
            {
                return result;
            }

            let delay = backoff_secs
                .get(attempt as usize + 1)
                .copied()
                .unwrap_or(5);
            tracing::warn!(
                host = %self.host,
                attempt = attempt + 1,
                max_attempts,
                "ssh connection failed, retrying in {}s",
                delay
            );
            if !wait_backoff(Duration::from_secs(delay), cancel).await {
                return result;
            }
            attempt += 1;
        }
    }

    async fn execute_once(&self, command: &str, stdin_file: Option<&Path>) -> CommandOutput {
        if self.is_local {
            return match stdin_file {
                Some(path) => {
                    let local_cmd = format!(
                        "cat {} | {{ {}; }}",
                        shell::quote_path(&path.to_string_lossy()),
                        command
                    );
                    execute_local_command(&local_cmd, &[]).await
                }
                None => execute_local_command(command, &[]).await,
            };
        }

        let mut cmd = Command::new("ssh");
        cmd.args(self.build_ssh_args(command));

        match stdin_file {
            Some(path) => match std::fs::File::open(path) {
                Ok(file) => {
                    cmd.stdin(Stdio::from(file));
                }
                Err(err) => {
                    return CommandOutput::unavailable(format!(
                        "Failed to open stdin file: {}",
                        err
                    ))
                }
            },
            None => {
                cmd.stdin(Stdio::null());
            }
        }

        collect(cmd, "SSH error").await
    }
}

/// Run `command` through `sh -c` on this machine with `env` added to the
/// inherited environment.
pub async fn execute_local_command(command: &str, env: &[(String, String)]) -> CommandOutput {
    #[cfg(windows)]
    let mut cmd = {
        let mut cmd = Command::new("cmd");
        cmd.args(["/C", command]);
        cmd
    };

    #[cfg(not(windows))]
    let mut cmd = {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", command]);
        cmd
    };

    cmd.envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
    cmd.stdin(Stdio::null());

    collect(cmd, "Command error").await
}

async fn collect(mut cmd: Command, spawn_context: &str) -> CommandOutput {
    match cmd.output().await {
        Ok(out) => CommandOutput {
            stdout: String::from_utf8_lossy(&out.stdout).to_string(),
            stderr: String::from_utf8_lossy(&out.stderr).to_string(),
            exit: ExitCode::from_status(out.status),
        },
        Err(e) => CommandOutput::unavailable(format!("{}: {}", spawn_context, e)),
    }
}

/// Check if a host address refers to the local machine.
pub fn is_local_host(host: &str) -> bool {
    matches!(host, "localhost" | "127.0.0.1" | "::1")
}

/// Check if an SSH failure is ssh's own connection error, reported before
/// the remote command could start.
fn is_transient_ssh_error(output: &CommandOutput) -> bool {
    if output.exit != ExitCode::Exited(255) {
        return false;
    }

    let ssh_prefixes = [
        "ssh: connect to host",
        "ssh: could not resolve hostname",
        "kex_exchange_identification:",
        "ssh_exchange_identification:",
    ];

    output
        .stderr
        .lines()
        .map(|line| line.trim().to_lowercase())
        .any(|line| ssh_prefixes.iter().any(|p| line.starts_with(p)))
}

/// Sleep before the next attempt. Returns false when `cancel` fired first.
async fn wait_backoff(delay: Duration, cancel: Option<&CancellationToken>) -> bool {
    match cancel {
        Some(cancel) => tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        },
        None => {
            tokio::time::sleep(delay).await;
            true
        }
    }
}
