//! Tailing a task's execution records.
//!
//! A live task is polled for records past the high-water mark until its
//! completion signal fires, then drained once more. A task that is not
//! live is replayed in one pass.

use std::time::Duration;

use crate::deploy::DeployTask;
use crate::error::Result;
use crate::record::ExecutionRecord;
use crate::store::Store;

struct Tail<'a, F> {
    store: &'a dyn Store,
    task_id: i64,
    last_id: i64,
    emitted: usize,
    sink: F,
}

impl<F> Tail<'_, F>
where
    F: FnMut(&ExecutionRecord),
{
    fn drain(&mut self) -> Result<()> {
        for record in self.store.records_after(self.task_id, self.last_id)? {
            self.last_id = record.id;
            self.emitted += 1;
            (self.sink)(&record);
        }
        Ok(())
    }
}

/// Feed every record of `task_id` to `sink` in id order. Returns how many
/// records were emitted.
pub async fn follow<F>(
    store: &dyn Store,
    live: Option<&DeployTask>,
    task_id: i64,
    interval: Duration,
    sink: F,
) -> Result<usize>
where
    F: FnMut(&ExecutionRecord),
{
    let mut tail = Tail {
        store,
        task_id,
        last_id: 0,
        emitted: 0,
        sink,
    };

    if let Some(task) = live {
        let mut done = task.finished();
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            if done.borrow_and_update().is_some() {
                break;
            }
            tokio::select! {
                changed = done.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = ticker.tick() => tail.drain()?,
            }
        }
    }

    tail.drain()?;
    Ok(tail.emitted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Stage;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn replays_finished_task_in_order() {
        let store = MemoryStore::new();
        for (stage, command) in [(Stage::Deploy, "checkout"), (Stage::PostDeploy, "pack")] {
            store
                .insert_record(&ExecutionRecord::new(stage, 4, 1, command))
                .unwrap();
        }
        store
            .insert_record(&ExecutionRecord::new(Stage::Deploy, 5, 1, "other task"))
            .unwrap();

        let mut seen = Vec::new();
        let emitted = follow(&store, None, 4, Duration::from_millis(10), |record| {
            seen.push(record.command.clone())
        })
        .await
        .unwrap();

        assert_eq!(emitted, 2);
        assert_eq!(seen, vec!["checkout", "pack"]);
    }
}
