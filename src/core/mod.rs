// Public modules
pub mod archive;
pub mod config;
pub mod console;
pub mod deploy;
pub mod engine;
pub mod envs;
pub mod error;
pub mod project;
pub mod record;
pub mod registry;
pub mod repository;
pub mod server;
pub mod service;
pub mod ssh;
pub mod store;
pub mod task;
pub mod transfer;

// Re-export common types for convenience
pub use error::{Error, ErrorCode, Result};
pub use service::{NewTask, ReleaseService};
