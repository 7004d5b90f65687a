//! Live tasks by release task id.
//!
//! At most one run per release task: registration and the duplicate check
//! happen under one lock, and a task removes itself once its run ends.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use crate::deploy::{DeployTask, Services};
use crate::error::{Error, Result};
use crate::task::ReleaseRequest;

pub struct TaskRegistry {
    services: Arc<Services>,
    tasks: Mutex<HashMap<i64, Arc<DeployTask>>>,
}

impl TaskRegistry {
    pub fn new(services: Arc<Services>) -> Arc<Self> {
        Arc::new(Self {
            services,
            tasks: Mutex::new(HashMap::new()),
        })
    }

    pub fn services(&self) -> &Arc<Services> {
        &self.services
    }

    /// Register a run of `request.task` on behalf of `actor_id`.
    pub fn create_task(
        self: &Arc<Self>,
        request: ReleaseRequest,
        actor_id: i64,
    ) -> Result<Arc<DeployTask>> {
        let id = request.task.id;
        let mut tasks = self.tasks.lock();
        if tasks.contains_key(&id) {
            return Err(Error::task_already_running(id));
        }
        let task = Arc::new(DeployTask::new(
            request,
            actor_id,
            Arc::clone(&self.services),
            Arc::downgrade(self),
        ));
        tasks.insert(id, Arc::clone(&task));
        tracing::debug!(task_id = id, actor_id, "task registered");
        Ok(task)
    }

    pub fn lookup(&self, id: i64) -> Option<Arc<DeployTask>> {
        self.tasks.lock().get(&id).cloned()
    }

    /// Idempotent.
    pub fn remove_task(&self, id: i64) {
        if self.tasks.lock().remove(&id).is_some() {
            tracing::debug!(task_id = id, "task unregistered");
        }
    }

    /// Signal a stop to a live task. Unknown or finished tasks are ignored.
    pub fn stop(&self, id: i64) -> bool {
        match self.lookup(id) {
            Some(task) => task.stop(),
            None => false,
        }
    }

    pub fn ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.tasks.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.lock().is_empty()
    }
}
