use clap::Args;
use serde::Serialize;

use shipwright::record::ExecutionRecord;

use super::{CmdResult, GlobalArgs};

#[derive(Args)]
pub struct RecordsArgs {
    /// Task ID
    pub task_id: i64,

    /// Only show failed records
    #[arg(long)]
    pub failed: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordsOutput {
    pub command: &'static str,
    pub task_id: i64,
    pub records: Vec<ExecutionRecord>,
}

pub async fn run(args: RecordsArgs, global: &GlobalArgs) -> CmdResult<RecordsOutput> {
    let service = global.service()?;
    // Surface a missing task instead of an empty list.
    service.task(args.task_id)?;

    let mut records = service.records(args.task_id)?;
    if args.failed {
        records.retain(|record| !record.is_success());
    }

    Ok((
        RecordsOutput {
            command: "records",
            task_id: args.task_id,
            records,
        },
        0,
    ))
}
