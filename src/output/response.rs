//! CLI response formatting and output.
//!
//! Provides JSON envelope, printing, and exit code mapping.

use serde::Serialize;
use shipwright::error::Hint;
use shipwright::{Error, ErrorCode, Result};

#[derive(Debug, Serialize)]
pub struct CliResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<CliError>,
}

#[derive(Debug, Serialize)]
pub struct CliError {
    pub code: String,
    pub message: String,
    pub details: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hints: Option<Vec<Hint>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retryable: Option<bool>,
}

impl<T: Serialize> CliResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| {
            Error::internal_json(e.to_string(), Some("serialize response".to_string()))
        })
    }
}

impl CliResponse<()> {
    pub fn from_error(err: &Error) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(CliError {
                code: err.code.as_str().to_string(),
                message: err.message.clone(),
                details: err.details.clone(),
                hints: if err.hints.is_empty() {
                    None
                } else {
                    Some(err.hints.clone())
                },
                retryable: err.retryable,
            }),
        }
    }
}

fn print_response<T: Serialize>(response: &CliResponse<T>) {
    use std::io::{self, Write};

    let payload = match response.to_json() {
        Ok(payload) => payload,
        Err(err) => {
            tracing::error!(error = %err, "failed to serialize response");
            return;
        }
    };
    let stdout = io::stdout();
    let mut handle = stdout.lock();
    if let Err(e) = writeln!(handle, "{}", payload) {
        // SIGPIPE from a closed reader is not worth reporting.
        if e.kind() != io::ErrorKind::BrokenPipe {
            tracing::error!(error = %e, "failed to write response");
        }
    }
}

pub fn print_json_result(result: Result<serde_json::Value>) {
    match result {
        Ok(data) => print_response(&CliResponse::success(data)),
        Err(err) => print_response(&CliResponse::<()>::from_error(&err)),
    }
}

pub fn map_cmd_result_to_json<T: Serialize>(
    result: Result<(T, i32)>,
) -> (Result<serde_json::Value>, i32) {
    match result {
        Ok((data, exit_code)) => match serde_json::to_value(data) {
            Ok(value) => (Ok(value), exit_code),
            Err(err) => (
                Err(Error::internal_json(
                    err.to_string(),
                    Some("serialize response".to_string()),
                )),
                1,
            ),
        },
        Err(err) => {
            let exit_code = exit_code_for_error(err.code);
            (Err(err), exit_code)
        }
    }
}

pub fn exit_code_for_error(code: ErrorCode) -> i32 {
    match code {
        ErrorCode::ConfigMissingKey
        | ErrorCode::ConfigInvalidJson
        | ErrorCode::ConfigInvalidValue
        | ErrorCode::ValidationInvalidArgument => 2,

        ErrorCode::TaskInvalidStatus
        | ErrorCode::TaskAlreadyRunning
        | ErrorCode::TaskNoServers
        | ErrorCode::ProjectDisabled
        | ErrorCode::EnvironmentDisabled
        | ErrorCode::DeployRevisionInvalid => 3,

        ErrorCode::TaskNotFound
        | ErrorCode::ProjectNotFound
        | ErrorCode::EnvironmentNotFound
        | ErrorCode::ServerNotFound => 4,

        ErrorCode::SshIdentityFileNotFound | ErrorCode::SshConnectFailed => 10,

        ErrorCode::CommandFailed
        | ErrorCode::DeployCheckoutFailed
        | ErrorCode::DeployPackageFailed
        | ErrorCode::DeployUploadFailed
        | ErrorCode::DeployRemoteFailed => 20,

        ErrorCode::DeployStopped => 130,

        ErrorCode::StoreError
        | ErrorCode::InternalIoError
        | ErrorCode::InternalJsonError
        | ErrorCode::InternalUnexpected => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_envelope_carries_code_and_hints() {
        let err = Error::task_not_found(9).with_hint("Run `shipwright task list`");
        let response = CliResponse::<()>::from_error(&err);
        let value = serde_json::to_value(&response).unwrap();

        assert_eq!(value["success"], false);
        assert_eq!(value["error"]["code"], "task.not_found");
        assert_eq!(value["error"]["hints"][0]["message"], "Run `shipwright task list`");
        assert!(value.get("data").is_none());
    }

    #[test]
    fn failures_map_to_exit_codes() {
        let (result, code) = map_cmd_result_to_json::<()>(Err(Error::deploy_stopped()));
        assert!(result.is_err());
        assert_eq!(code, 130);

        let (_, code) = map_cmd_result_to_json::<()>(Err(Error::task_already_running(1)));
        assert_eq!(code, 3);

        let (result, code) = map_cmd_result_to_json(Ok((serde_json::json!({"id": 1}), 0)));
        assert_eq!(result.unwrap()["id"], 1);
        assert_eq!(code, 0);
    }
}
