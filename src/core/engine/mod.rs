//! Command execution.
//!
//! - `executor` - the `CommandExecutor` seam with its local and ssh variants,
//!   plus the normalized `ExitCode` every variant reports.

pub mod executor;

pub use executor::*;
