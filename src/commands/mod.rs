use std::path::PathBuf;

use shipwright::{config, ReleaseService};

pub type CmdResult<T> = shipwright::Result<(T, i32)>;

pub(crate) struct GlobalArgs {
    pub config: Option<PathBuf>,
}

impl GlobalArgs {
    /// Load and validate settings, then open the store they name.
    pub fn service(&self) -> shipwright::Result<ReleaseService> {
        let settings = config::load(self.config.as_deref())?;
        settings.validate()?;
        ReleaseService::from_settings(settings)
    }
}

pub mod records;
pub mod release;
pub mod task;

/// Dispatch a command to its handler and map result to JSON.
macro_rules! dispatch {
    ($args:expr, $global:expr, $module:ident) => {
        crate::output::map_cmd_result_to_json($module::run($args, $global).await)
    };
}

pub(crate) async fn run_json(
    command: crate::Commands,
    global: &GlobalArgs,
) -> (shipwright::Result<serde_json::Value>, i32) {
    match command {
        crate::Commands::Task(args) => dispatch!(args, global, task),
        crate::Commands::Release(args) => dispatch!(args, global, release),
        crate::Commands::Records(args) => dispatch!(args, global, records),
    }
}
