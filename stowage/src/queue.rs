//! Interface to the task system tracking detached merges.

use std::fmt;

use dashmap::DashMap;

use crate::hash::HashView;

/// State of one background task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskStatus {
    /// The merge is running.
    Processing,
    /// The merge finished; whole-file digests are available.
    Succeeded(HashView),
    /// The merge failed.
    Failed(String),
}

/// Accepts status reports for "finalize asynchronously" jobs and
/// answers polls for them.
pub trait TaskQueue: Send + Sync + fmt::Debug + 'static {
    /// Record the current status of `id`.
    fn update(&self, id: &str, status: TaskStatus);

    /// Last reported status of `id`, if the queue knows it.
    fn status(&self, id: &str) -> Option<TaskStatus>;
}

/// In-process queue backed by a concurrent map.
#[derive(Debug, Default)]
pub struct MemoryTaskQueue {
    tasks: DashMap<String, TaskStatus>,
}

impl TaskQueue for MemoryTaskQueue {
    fn update(&self, id: &str, status: TaskStatus) {
        self.tasks.insert(id.to_owned(), status);
    }

    fn status(&self, id: &str) -> Option<TaskStatus> {
        self.tasks.get(id).map(|s| s.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_update_wins() {
        let queue = MemoryTaskQueue::default();

        assert_eq!(queue.status("merge-a"), None);

        queue.update("merge-a", TaskStatus::Processing);
        queue.update("merge-a", TaskStatus::Failed("disk full".into()));

        assert_eq!(
            queue.status("merge-a"),
            Some(TaskStatus::Failed("disk full".into()))
        );
    }
}
