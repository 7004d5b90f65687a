use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use commands::GlobalArgs;

mod commands;
mod output;
mod tty;

use commands::{records, release, task};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "shipwright")]
#[command(version = VERSION)]
#[command(about = "Release orchestrator: build a revision once, ship it to every server")]
struct Cli {
    /// Settings file (defaults to $SHIPWRIGHT_CONFIG, then ./shipwright.json)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Create, audit and inspect release tasks
    #[command(visible_alias = "tasks")]
    Task(task::TaskArgs),
    /// Run an approved task and stream its execution records
    Release(release::ReleaseArgs),
    /// Show execution records of a task
    Records(records::RecordsArgs),
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("shipwright=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    init_tracing();

    let cli = Cli::parse();
    let global = GlobalArgs { config: cli.config };

    let (json_result, exit_code) = commands::run_json(cli.command, &global).await;
    output::print_json_result(json_result);

    std::process::ExitCode::from(exit_code_to_u8(exit_code))
}

fn exit_code_to_u8(code: i32) -> u8 {
    if code <= 0 {
        0
    } else if code >= 255 {
        255
    } else {
        code as u8
    }
}
