pub mod tasks;

use voxnav_core::types::{LogEntry, Task};
use voxnav_core::Result;

/// Durable sink for task snapshots and their step log.
pub trait TaskRecorder: Send + Sync {
    /// Insert or replace the task row.
    fn record_task(&self, task: &Task) -> Result<()>;

    /// Append one log entry; `seq` is its position in the task's log.
    fn record_log(&self, task_id: &str, seq: usize, entry: &LogEntry) -> Result<()>;
}

pub use tasks::TaskStore;
