use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    ConfigMissingKey,
    ConfigInvalidJson,
    ConfigInvalidValue,

    ValidationInvalidArgument,

    TaskNotFound,
    TaskAlreadyRunning,
    TaskInvalidStatus,
    TaskNoServers,
    ProjectNotFound,
    ProjectDisabled,
    EnvironmentNotFound,
    EnvironmentDisabled,
    ServerNotFound,

    SshIdentityFileNotFound,
    SshConnectFailed,

    CommandFailed,

    DeployRevisionInvalid,
    DeployCheckoutFailed,
    DeployPackageFailed,
    DeployUploadFailed,
    DeployStopped,
    DeployRemoteFailed,

    StoreError,

    InternalIoError,
    InternalJsonError,
    InternalUnexpected,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ConfigMissingKey => "config.missing_key",
            ErrorCode::ConfigInvalidJson => "config.invalid_json",
            ErrorCode::ConfigInvalidValue => "config.invalid_value",

            ErrorCode::ValidationInvalidArgument => "validation.invalid_argument",

            ErrorCode::TaskNotFound => "task.not_found",
            ErrorCode::TaskAlreadyRunning => "task.already_running",
            ErrorCode::TaskInvalidStatus => "task.invalid_status",
            ErrorCode::TaskNoServers => "task.no_servers",
            ErrorCode::ProjectNotFound => "project.not_found",
            ErrorCode::ProjectDisabled => "project.disabled",
            ErrorCode::EnvironmentNotFound => "environment.not_found",
            ErrorCode::EnvironmentDisabled => "environment.disabled",
            ErrorCode::ServerNotFound => "server.not_found",

            ErrorCode::SshIdentityFileNotFound => "ssh.identity_file_not_found",
            ErrorCode::SshConnectFailed => "ssh.connect_failed",

            ErrorCode::CommandFailed => "command.failed",

            ErrorCode::DeployRevisionInvalid => "deploy.revision_invalid",
            ErrorCode::DeployCheckoutFailed => "deploy.checkout_failed",
            ErrorCode::DeployPackageFailed => "deploy.package_failed",
            ErrorCode::DeployUploadFailed => "deploy.upload_failed",
            ErrorCode::DeployStopped => "deploy.stopped",
            ErrorCode::DeployRemoteFailed => "deploy.remote_failed",

            ErrorCode::StoreError => "store.error",

            ErrorCode::InternalIoError => "internal.io_error",
            ErrorCode::InternalJsonError => "internal.json_error",
            ErrorCode::InternalUnexpected => "internal.unexpected",
        }
    }

    /// Precondition failures are reported synchronously by `start` and never
    /// reach the pipeline.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            ErrorCode::TaskInvalidStatus
                | ErrorCode::TaskNoServers
                | ErrorCode::ProjectDisabled
                | ErrorCode::EnvironmentDisabled
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Hint {
    pub message: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigInvalidValueDetails {
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    pub problem: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidArgumentDetails {
    pub field: String,
    pub problem: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NotFoundDetails {
    pub id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidStatusDetails {
    pub task_id: i64,
    pub expected: String,
    pub actual: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandFailedDetails {
    pub command: String,
    pub exit_code: i32,
    pub output: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_id: Option<i64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InternalIoErrorDetails {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Error {
    pub code: ErrorCode,
    pub message: String,
    pub details: Value,
    pub hints: Vec<Hint>,
    pub retryable: Option<bool>,
}

pub type Result<T> = std::result::Result<T, Error>;

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for Error {}

fn to_details<T: Serialize>(details: T) -> Value {
    serde_json::to_value(details).unwrap_or_else(|_| Value::Object(serde_json::Map::new()))
}

impl Error {
    pub fn new(code: ErrorCode, message: impl Into<String>, details: Value) -> Self {
        Self {
            code,
            message: message.into(),
            details,
            hints: Vec::new(),
            retryable: None,
        }
    }

    pub fn validation_invalid_argument(
        field: impl Into<String>,
        problem: impl Into<String>,
        id: Option<String>,
    ) -> Self {
        let problem = problem.into();
        let details = to_details(InvalidArgumentDetails {
            field: field.into(),
            problem: problem.clone(),
            id,
        });
        Self::new(ErrorCode::ValidationInvalidArgument, problem, details)
    }

    pub fn task_not_found(id: i64) -> Self {
        Self::not_found(ErrorCode::TaskNotFound, "Task not found", id.to_string())
            .with_hint("Run 'shipwright task list' to see known tasks")
    }

    pub fn project_not_found(id: i64) -> Self {
        Self::not_found(ErrorCode::ProjectNotFound, "Project not found", id.to_string())
    }

    pub fn environment_not_found(id: i64) -> Self {
        Self::not_found(
            ErrorCode::EnvironmentNotFound,
            "Environment not found",
            id.to_string(),
        )
    }

    pub fn server_not_found(id: i64) -> Self {
        Self::not_found(ErrorCode::ServerNotFound, "Server not found", id.to_string())
    }

    fn not_found(code: ErrorCode, message: &str, id: String) -> Self {
        Self::new(code, message, to_details(NotFoundDetails { id }))
    }

    pub fn task_already_running(task_id: i64) -> Self {
        Self::new(
            ErrorCode::TaskAlreadyRunning,
            format!("Task {} is already being released", task_id),
            serde_json::json!({ "taskId": task_id }),
        )
        .with_hint("Wait for the running release to finish or stop it first")
    }

    pub fn task_invalid_status(task_id: i64, expected: &str, actual: &str) -> Self {
        Self::new(
            ErrorCode::TaskInvalidStatus,
            format!(
                "Task {} is '{}', expected '{}'",
                task_id, actual, expected
            ),
            to_details(InvalidStatusDetails {
                task_id,
                expected: expected.to_string(),
                actual: actual.to_string(),
            }),
        )
    }

    pub fn task_no_servers(task_id: i64, name: &str) -> Self {
        Self::new(
            ErrorCode::TaskNoServers,
            format!("Task [{}] has no target servers", name),
            serde_json::json!({ "taskId": task_id }),
        )
    }

    pub fn project_disabled(name: &str) -> Self {
        Self::new(
            ErrorCode::ProjectDisabled,
            format!("Project [{}] is not accepting releases", name),
            serde_json::json!({ "project": name }),
        )
    }

    pub fn environment_disabled(name: &str) -> Self {
        Self::new(
            ErrorCode::EnvironmentDisabled,
            format!("Environment [{}] is not accepting releases", name),
            serde_json::json!({ "environment": name }),
        )
    }

    pub fn ssh_identity_file_not_found(server_id: i64, identity_file: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::SshIdentityFileNotFound,
            "SSH identity file not found",
            serde_json::json!({
                "serverId": server_id,
                "identityFile": identity_file.into(),
            }),
        )
    }

    pub fn ssh_connect_failed(host: &str, error: impl Into<String>) -> Self {
        let error = error.into();
        Self::new(
            ErrorCode::SshConnectFailed,
            format!("SSH connection to {} failed: {}", host, error),
            serde_json::json!({ "host": host, "error": error }),
        )
        .retryable(true)
    }

    pub fn command_failed(details: CommandFailedDetails) -> Self {
        let message = format!(
            "Command exited with status {}: {}",
            details.exit_code, details.command
        );
        Self::new(ErrorCode::CommandFailed, message, to_details(details))
    }

    pub fn deploy_revision_invalid(task_id: i64) -> Self {
        Self::new(
            ErrorCode::DeployRevisionInvalid,
            "Release revision is invalid: set a tag, or both branch and commit",
            serde_json::json!({ "taskId": task_id }),
        )
    }

    pub fn deploy_checkout_failed(error: impl Into<String>) -> Self {
        let error = error.into();
        Self::new(
            ErrorCode::DeployCheckoutFailed,
            format!("Checkout failed: {}", error),
            serde_json::json!({ "error": error }),
        )
    }

    pub fn deploy_package_failed(error: impl Into<String>) -> Self {
        let error = error.into();
        Self::new(
            ErrorCode::DeployPackageFailed,
            format!("Packaging failed: {}", error),
            serde_json::json!({ "error": error }),
        )
    }

    pub fn deploy_upload_failed(host: &str, error: impl Into<String>) -> Self {
        let error = error.into();
        Self::new(
            ErrorCode::DeployUploadFailed,
            format!("Upload to {} failed: {}", host, error),
            serde_json::json!({ "host": host, "error": error }),
        )
    }

    pub fn deploy_stopped() -> Self {
        Self::new(
            ErrorCode::DeployStopped,
            "Release task stopped",
            Value::Object(serde_json::Map::new()),
        )
    }

    pub fn deploy_remote_failed(summary: impl Into<String>, details: Value) -> Self {
        Self::new(ErrorCode::DeployRemoteFailed, summary, details)
    }

    pub fn store(error: impl Into<String>, context: Option<String>) -> Self {
        let error = error.into();
        let message = match &context {
            Some(ctx) => format!("Store error ({}): {}", ctx, error),
            None => format!("Store error: {}", error),
        };
        Self::new(
            ErrorCode::StoreError,
            message,
            serde_json::json!({ "error": error, "context": context }),
        )
    }

    pub fn config_missing_key(key: impl Into<String>, path: Option<String>) -> Self {
        Self::new(
            ErrorCode::ConfigMissingKey,
            "Missing required configuration key",
            serde_json::json!({ "key": key.into(), "path": path }),
        )
    }

    pub fn config_invalid_json(path: impl Into<String>, err: serde_json::Error) -> Self {
        Self::new(
            ErrorCode::ConfigInvalidJson,
            "Invalid JSON in configuration",
            serde_json::json!({ "path": path.into(), "error": err.to_string() }),
        )
    }

    pub fn config_invalid_value(
        key: impl Into<String>,
        value: Option<String>,
        problem: impl Into<String>,
    ) -> Self {
        let problem = problem.into();
        let details = to_details(ConfigInvalidValueDetails {
            key: key.into(),
            value,
            problem: problem.clone(),
        });
        Self::new(ErrorCode::ConfigInvalidValue, problem, details)
    }

    pub fn internal_io(error: impl Into<String>, context: Option<String>) -> Self {
        let error = error.into();
        let message = match &context {
            Some(ctx) => format!("IO error ({}): {}", ctx, error),
            None => format!("IO error: {}", error),
        };
        Self::new(
            ErrorCode::InternalIoError,
            message,
            to_details(InternalIoErrorDetails { error, context }),
        )
    }

    pub fn internal_json(error: impl Into<String>, context: Option<String>) -> Self {
        Self::new(
            ErrorCode::InternalJsonError,
            "JSON error",
            serde_json::json!({ "error": error.into(), "context": context }),
        )
    }

    pub fn internal_unexpected(error: impl Into<String>) -> Self {
        let error = error.into();
        Self::new(
            ErrorCode::InternalUnexpected,
            format!("Unexpected error: {}", error),
            serde_json::json!({ "error": error }),
        )
    }

    pub fn with_hint(mut self, message: impl Into<String>) -> Self {
        self.hints.push(Hint {
            message: message.into(),
        });
        self
    }

    pub fn retryable(mut self, retryable: bool) -> Self {
        self.retryable = Some(retryable);
        self
    }

    pub fn is_stopped(&self) -> bool {
        self.code == ErrorCode::DeployStopped
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::store(err.to_string(), None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stopped_is_distinguishable_from_failure() {
        let stopped = Error::deploy_stopped();
        assert!(stopped.is_stopped());
        assert_eq!(stopped.code.as_str(), "deploy.stopped");

        let failed = Error::deploy_checkout_failed("no such ref");
        assert!(!failed.is_stopped());
    }

    #[test]
    fn command_failed_carries_exit_code() {
        let err = Error::command_failed(CommandFailedDetails {
            command: "false".to_string(),
            exit_code: 1,
            output: String::new(),
            server_id: Some(7),
        });
        assert_eq!(err.code, ErrorCode::CommandFailed);
        assert_eq!(err.details["exitCode"], 1);
        assert_eq!(err.details["serverId"], 7);
    }

    #[test]
    fn precondition_codes() {
        assert!(ErrorCode::TaskNoServers.is_precondition());
        assert!(ErrorCode::TaskInvalidStatus.is_precondition());
        assert!(!ErrorCode::DeployStopped.is_precondition());
    }

    #[test]
    fn already_running_has_hint() {
        let err = Error::task_already_running(42);
        assert_eq!(err.hints.len(), 1);
        assert!(err.message.contains("42"));
    }
}
