pub mod core;
pub mod utils;

// Re-export everything from core for ergonomic library use
// Users can write `shipwright::config` instead of `shipwright::core::config`
pub use core::*;
pub use utils::*;
