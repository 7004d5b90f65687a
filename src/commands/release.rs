use clap::Args;
use serde::Serialize;

use shipwright::deploy::TaskOutcome;
use shipwright::record::ExecutionRecord;
use shipwright::task::TaskStatus;
use shipwright::Error;

use super::{CmdResult, GlobalArgs};

#[derive(Args)]
pub struct ReleaseArgs {
    /// Task ID (must be approved)
    pub task_id: i64,

    /// Acting user ID recorded on every execution record
    #[arg(long, default_value_t = 0)]
    pub user: i64,

    /// Do not echo records to stderr while the task runs
    #[arg(long)]
    pub quiet: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseOutput {
    pub command: &'static str,
    pub records: usize,
    pub outcome: TaskOutcome,
}

pub async fn run(args: ReleaseArgs, global: &GlobalArgs) -> CmdResult<ReleaseOutput> {
    let service = global.service()?;
    let task = service.release(args.task_id, args.user).await?;
    let quiet = args.quiet;

    let follow = service.follow(task.id(), |record| {
        if !quiet {
            print_record(record);
        }
    });
    tokio::pin!(follow);

    let mut stop_requested = false;
    let records = loop {
        tokio::select! {
            result = &mut follow => break result?,
            signal = tokio::signal::ctrl_c(), if !stop_requested => {
                if let Err(err) = signal {
                    tracing::warn!(error = %err, "failed to listen for ctrl-c");
                }
                stop_requested = true;
                crate::tty::status("Stopping release, waiting for running commands to return...");
                service.stop(task.id());
            }
        }
    };

    let outcome = task
        .wait()
        .await
        .ok_or_else(|| Error::internal_unexpected("release finished without an outcome"))?;
    let exit_code = exit_code_for_outcome(&outcome);

    Ok((
        ReleaseOutput {
            command: "release",
            records,
            outcome,
        },
        exit_code,
    ))
}

fn exit_code_for_outcome(outcome: &TaskOutcome) -> i32 {
    if outcome.stopped {
        130
    } else if outcome.status == TaskStatus::Finished {
        0
    } else {
        20
    }
}

fn print_record(record: &ExecutionRecord) {
    let target = match record.server_id {
        Some(id) => format!("server {}", id),
        None => "local".to_string(),
    };
    eprintln!(
        "[{}] {} ({}ms, status {}) $ {}",
        record.stage, target, record.run_time_ms, record.status, record.command
    );
    let output = record.output.trim_end();
    if !output.is_empty() {
        for line in output.lines() {
            eprintln!("    {}", line);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(status: TaskStatus, stopped: bool) -> TaskOutcome {
        TaskOutcome {
            task_id: 1,
            status,
            version: "1_1_20260101_000000".to_string(),
            prev_version: String::new(),
            last_error: String::new(),
            stopped,
            hosts: Vec::new(),
        }
    }

    #[test]
    fn exit_codes_follow_outcome() {
        assert_eq!(exit_code_for_outcome(&outcome(TaskStatus::Finished, false)), 0);
        assert_eq!(exit_code_for_outcome(&outcome(TaskStatus::ReleaseFailed, false)), 20);
        assert_eq!(exit_code_for_outcome(&outcome(TaskStatus::ReleaseFailed, true)), 130);
    }
}
