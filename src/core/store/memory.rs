use chrono::Utc;
use parking_lot::Mutex;
use std::collections::BTreeMap;

use super::Store;
use crate::error::{Error, Result};
use crate::record::ExecutionRecord;
use crate::task::{ReleaseTask, TaskStatus};

#[derive(Default)]
struct State {
    tasks: BTreeMap<i64, ReleaseTask>,
    records: Vec<ExecutionRecord>,
    last_task_id: i64,
    last_record_id: i64,
}

/// Process-local store, used by tests and when no database path is configured.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for MemoryStore {
    fn insert_task(&self, task: &ReleaseTask) -> Result<i64> {
        let mut state = self.state.lock();
        let id = if task.id == 0 {
            state.last_task_id + 1
        } else {
            task.id
        };
        if state.tasks.contains_key(&id) {
            return Err(Error::store(
                format!("task {} already exists", id),
                Some("insert task".to_string()),
            ));
        }
        state.last_task_id = state.last_task_id.max(id);

        let mut stored = task.clone();
        stored.id = id;
        state.tasks.insert(id, stored);
        Ok(id)
    }

    fn load_task(&self, id: i64) -> Result<ReleaseTask> {
        self.state
            .lock()
            .tasks
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::task_not_found(id))
    }

    fn list_tasks(&self) -> Result<Vec<ReleaseTask>> {
        Ok(self.state.lock().tasks.values().rev().cloned().collect())
    }

    fn transition_status(
        &self,
        id: i64,
        expected: TaskStatus,
        next: TaskStatus,
        version: Option<&str>,
        auditor: Option<i64>,
    ) -> Result<bool> {
        let mut state = self.state.lock();
        let task = state
            .tasks
            .get_mut(&id)
            .ok_or_else(|| Error::task_not_found(id))?;
        if task.status != expected {
            return Ok(false);
        }
        task.status = next;
        if let Some(version) = version {
            task.version = version.to_string();
        }
        if auditor.is_some() {
            task.audit_user_id = auditor;
        }
        task.updated_at = Utc::now();
        Ok(true)
    }

    fn update_prev_version(&self, id: i64, prev_version: &str) -> Result<()> {
        let mut state = self.state.lock();
        let task = state
            .tasks
            .get_mut(&id)
            .ok_or_else(|| Error::task_not_found(id))?;
        task.prev_version = prev_version.to_string();
        task.updated_at = Utc::now();
        Ok(())
    }

    fn finish_task(&self, id: i64, status: TaskStatus, last_error: &str) -> Result<()> {
        let mut state = self.state.lock();
        let task = state
            .tasks
            .get_mut(&id)
            .ok_or_else(|| Error::task_not_found(id))?;
        task.status = status;
        task.last_error = last_error.to_string();
        task.updated_at = Utc::now();
        Ok(())
    }

    fn insert_record(&self, record: &ExecutionRecord) -> Result<i64> {
        let mut state = self.state.lock();
        state.last_record_id += 1;
        let mut stored = record.clone();
        stored.id = state.last_record_id;
        state.records.push(stored);
        Ok(state.last_record_id)
    }

    fn records_after(&self, task_id: i64, after_id: i64) -> Result<Vec<ExecutionRecord>> {
        Ok(self
            .state
            .lock()
            .records
            .iter()
            .filter(|r| r.task_id == task_id && r.id > after_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Stage;

    fn task(status: TaskStatus) -> ReleaseTask {
        let now = Utc::now();
        ReleaseTask {
            id: 0,
            space_id: 1,
            project_id: 2,
            environment_id: 3,
            name: "ship it".to_string(),
            user_id: 5,
            status,
            version: String::new(),
            prev_version: String::new(),
            server_ids: vec![1, 2],
            tag: "v1.0.0".to_string(),
            branch: String::new(),
            commit_id: String::new(),
            is_rollback: false,
            last_error: String::new(),
            audit_user_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn guarded_transition_only_applies_on_expected_status() {
        let store = MemoryStore::new();
        let id = store.insert_task(&task(TaskStatus::Approved)).unwrap();

        assert!(store
            .transition_status(id, TaskStatus::Approved, TaskStatus::Releasing, Some("2_1_x"), None)
            .unwrap());
        // A second racer sees the status already moved.
        assert!(!store
            .transition_status(id, TaskStatus::Approved, TaskStatus::Releasing, Some("2_1_y"), None)
            .unwrap());

        let stored = store.load_task(id).unwrap();
        assert_eq!(stored.status, TaskStatus::Releasing);
        assert_eq!(stored.version, "2_1_x");
    }

    #[test]
    fn records_after_filters_by_task_and_watermark() {
        let store = MemoryStore::new();
        for task_id in [1, 2, 1] {
            store
                .insert_record(&ExecutionRecord::new(Stage::Deploy, task_id, 1, "true"))
                .unwrap();
        }
        let all = store.records_after(1, 0).unwrap();
        assert_eq!(all.iter().map(|r| r.id).collect::<Vec<_>>(), vec![1, 3]);
        assert_eq!(store.records_after(1, 1).unwrap().len(), 1);
    }

    #[test]
    fn missing_task_is_not_found() {
        let err = MemoryStore::new().load_task(99).unwrap_err();
        assert_eq!(err.code, crate::error::ErrorCode::TaskNotFound);
    }
}
