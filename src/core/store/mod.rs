//! Persistence of release tasks and execution records.
//!
//! Every write commits on its own; nothing spans a whole phase.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::error::Result;
use crate::record::ExecutionRecord;
use crate::task::{ReleaseTask, TaskStatus};

pub trait Store: Send + Sync {
    /// Insert a task. An `id` of 0 asks the store to assign one.
    fn insert_task(&self, task: &ReleaseTask) -> Result<i64>;

    fn load_task(&self, id: i64) -> Result<ReleaseTask>;

    /// All tasks, newest first.
    fn list_tasks(&self) -> Result<Vec<ReleaseTask>>;

    /// Move `id` from `expected` to `next` iff its stored status is still
    /// `expected`. `version` is written when given; `auditor` is recorded
    /// as the audit actor when given. Returns whether the row changed.
    fn transition_status(
        &self,
        id: i64,
        expected: TaskStatus,
        next: TaskStatus,
        version: Option<&str>,
        auditor: Option<i64>,
    ) -> Result<bool>;

    fn update_prev_version(&self, id: i64, prev_version: &str) -> Result<()>;

    /// Terminal write: status plus last error text.
    fn finish_task(&self, id: i64, status: TaskStatus, last_error: &str) -> Result<()>;

    fn insert_record(&self, record: &ExecutionRecord) -> Result<i64>;

    /// Records of `task_id` with id greater than `after_id`, ordered by id.
    fn records_after(&self, task_id: i64, after_id: i64) -> Result<Vec<ExecutionRecord>>;
}
