use clap::{Args, Subcommand};
use serde::Serialize;

use shipwright::task::ReleaseTask;
use shipwright::NewTask;

use super::{CmdResult, GlobalArgs};

#[derive(Args)]
pub struct TaskArgs {
    #[command(subcommand)]
    command: TaskCommand,
}

#[derive(Subcommand)]
enum TaskCommand {
    /// Create a release task for a project
    Create {
        /// Project ID
        project_id: i64,
        /// Task name
        #[arg(long)]
        name: String,
        /// Servers to release to (must belong to the project)
        #[arg(long = "server", value_delimiter = ',', required = true)]
        server_ids: Vec<i64>,
        /// Tag to release (wins over branch/commit)
        #[arg(long, default_value = "")]
        tag: String,
        /// Branch to release, together with --commit
        #[arg(long, default_value = "")]
        branch: String,
        /// Commit on --branch
        #[arg(long = "commit", default_value = "")]
        commit_id: String,
        /// Mark the task as a rollback
        #[arg(long)]
        rollback: bool,
        /// Acting user ID
        #[arg(long, default_value_t = 0)]
        user: i64,
    },
    /// Approve or reject a waiting task
    Audit {
        /// Task ID
        task_id: i64,
        /// Reject instead of approve
        #[arg(long)]
        reject: bool,
        /// Auditing user ID
        #[arg(long, default_value_t = 0)]
        auditor: i64,
    },
    /// Show a task
    Show {
        /// Task ID
        task_id: i64,
    },
    /// List tasks, newest first
    List,
}

#[derive(Serialize)]
#[serde(tag = "command")]
pub enum TaskOutput {
    #[serde(rename = "task.create")]
    Create { task: ReleaseTask },
    #[serde(rename = "task.audit")]
    Audit { task: ReleaseTask },
    #[serde(rename = "task.show")]
    Show { task: ReleaseTask },
    #[serde(rename = "task.list")]
    List { tasks: Vec<ReleaseTask> },
}

pub async fn run(args: TaskArgs, global: &GlobalArgs) -> CmdResult<TaskOutput> {
    let service = global.service()?;

    match args.command {
        TaskCommand::Create {
            project_id,
            name,
            server_ids,
            tag,
            branch,
            commit_id,
            rollback,
            user,
        } => {
            let task = service.create_task(NewTask {
                project_id,
                name,
                user_id: user,
                server_ids,
                tag,
                branch,
                commit_id,
                is_rollback: rollback,
            })?;
            Ok((TaskOutput::Create { task }, 0))
        }
        TaskCommand::Audit {
            task_id,
            reject,
            auditor,
        } => {
            let task = service.audit(task_id, !reject, auditor)?;
            Ok((TaskOutput::Audit { task }, 0))
        }
        TaskCommand::Show { task_id } => {
            let task = service.task(task_id)?;
            Ok((TaskOutput::Show { task }, 0))
        }
        TaskCommand::List => {
            let tasks = service.tasks()?;
            Ok((TaskOutput::List { tasks }, 0))
        }
    }
}
