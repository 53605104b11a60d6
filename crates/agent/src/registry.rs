use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use voxnav_core::types::{Task, TaskState, TaskSummary};
use voxnav_storage::TaskRecorder;

struct Entry {
    task: Mutex<Task>,
    cancel: CancellationToken,
}

impl Entry {
    fn lock(&self) -> MutexGuard<'_, Task> {
        self.task.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// The single source of truth for task state.
///
/// Each task sits behind its own mutex, so updates to one task never wait on
/// another. All mutation goes through [`TaskRegistry::update`], which refuses
/// to touch a task once it reached a terminal state and persists every change.
pub struct TaskRegistry {
    tasks: RwLock<HashMap<String, Arc<Entry>>>,
    recorder: Option<Arc<dyn TaskRecorder>>,
}

impl TaskRegistry {
    pub fn new(recorder: Option<Arc<dyn TaskRecorder>>) -> Self {
        Self {
            tasks: RwLock::new(HashMap::new()),
            recorder,
        }
    }

    fn entry(&self, id: &str) -> Option<Arc<Entry>> {
        let tasks = self.tasks.read().unwrap_or_else(|e| e.into_inner());
        tasks.get(id).cloned()
    }

    fn persist(&self, task: &Task, first_new_log: usize) {
        let Some(recorder) = &self.recorder else {
            return;
        };
        if let Err(e) = recorder.record_task(task) {
            warn!(task_id = %task.id, error = %e, "Failed to persist task");
        }
        for (seq, entry) in task.log.iter().enumerate().skip(first_new_log) {
            if let Err(e) = recorder.record_log(&task.id, seq, entry) {
                warn!(task_id = %task.id, seq, error = %e, "Failed to persist log entry");
            }
        }
    }

    /// Register a new task and return its cancellation token.
    pub fn insert(&self, task: Task) -> CancellationToken {
        let cancel = CancellationToken::new();
        self.persist(&task, 0);
        let id = task.id.clone();
        let entry = Arc::new(Entry { task: Mutex::new(task), cancel: cancel.clone() });
        self.tasks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, entry);
        cancel
    }

    /// Apply `f` atomically to a live task and return the new snapshot.
    ///
    /// Returns `None` when the task is unknown or already terminal; terminal
    /// tasks are never modified. `completed_at` is stamped on the transition
    /// into a terminal state.
    pub fn update<F>(&self, id: &str, f: F) -> Option<Task>
    where
        F: FnOnce(&mut Task),
    {
        let entry = self.entry(id)?;
        let mut task = entry.lock();
        if task.is_terminal() {
            debug!(task_id = %id, state = %task.state, "Ignoring update to terminal task");
            return None;
        }
        let log_len = task.log.len();
        f(&mut task);
        if task.is_terminal() && task.completed_at.is_none() {
            task.completed_at = Some(Utc::now());
        }
        self.persist(&task, log_len);
        Some(task.clone())
    }

    pub fn get(&self, id: &str) -> Option<Task> {
        self.entry(id).map(|e| e.lock().clone())
    }

    pub fn cancel_token(&self, id: &str) -> Option<CancellationToken> {
        self.entry(id).map(|e| e.cancel.clone())
    }

    /// Snapshots, newest first.
    pub fn list(&self, state: Option<TaskState>) -> Vec<Task> {
        let entries: Vec<Arc<Entry>> = {
            let tasks = self.tasks.read().unwrap_or_else(|e| e.into_inner());
            tasks.values().cloned().collect()
        };
        let mut result: Vec<Task> = entries
            .iter()
            .map(|e| e.lock().clone())
            .filter(|t| state.map_or(true, |s| t.state == s))
            .collect();
        result.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        result
    }

    pub fn summary(&self) -> TaskSummary {
        let mut summary = TaskSummary::default();
        for task in self.list(None) {
            summary.add(task.state, 1);
            if let Some(transcript) = &task.transcript {
                summary.transcripts.record(transcript);
            }
        }
        summary
    }

    /// Cancel every task that has not finished yet.
    pub fn cancel_all(&self) -> usize {
        let tasks = self.tasks.read().unwrap_or_else(|e| e.into_inner());
        let mut cancelled = 0;
        for entry in tasks.values() {
            if !entry.lock().is_terminal() {
                entry.cancel.cancel();
                cancelled += 1;
            }
        }
        cancelled
    }

    /// Forget terminal tasks that finished more than `max_age` ago. They stay
    /// in the persistent store.
    pub fn cleanup_finished(&self, max_age: std::time::Duration) -> usize {
        let cutoff = Utc::now() - chrono::Duration::from_std(max_age).unwrap_or_default();
        let mut tasks = self.tasks.write().unwrap_or_else(|e| e.into_inner());
        let before = tasks.len();
        tasks.retain(|_, entry| {
            let task = entry.lock();
            !task.is_terminal() || task.completed_at.map_or(true, |c| c > cutoff)
        });
        let removed = before - tasks.len();
        if removed > 0 {
            debug!(removed, "Cleaned up finished tasks");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.tasks.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryRecorder;
    use std::time::Duration;
    use voxnav_core::error::FailureKind;
    use voxnav_core::types::{LogEntry, StepOutcome, TaskFailure, TaskSource};

    fn registry() -> (TaskRegistry, Arc<MemoryRecorder>) {
        let recorder = Arc::new(MemoryRecorder::default());
        (TaskRegistry::new(Some(recorder.clone())), recorder)
    }

    #[test]
    fn test_update_persists_snapshot_and_new_log_entries() {
        let (reg, recorder) = registry();
        let task = Task::new(TaskSource::Text);
        let id = task.id.clone();
        reg.insert(task);
        assert!(recorder.task(&id).is_some());

        reg.update(&id, |t| {
            t.state = TaskState::Executing;
            t.log.push(LogEntry::now(0, StepOutcome::Success { attempts: 1, url: None, verified: false }));
        })
        .unwrap();
        reg.update(&id, |t| {
            t.log.push(LogEntry::now(1, StepOutcome::Cancelled));
        })
        .unwrap();

        assert_eq!(recorder.task(&id).unwrap().log.len(), 2);
        assert_eq!(recorder.log_seqs(&id), vec![0, 1]);
    }

    #[test]
    fn test_terminal_state_is_immutable() {
        let (reg, _) = registry();
        let task = Task::new(TaskSource::Voice);
        let id = task.id.clone();
        reg.insert(task);

        let done = reg
            .update(&id, |t| {
                t.state = TaskState::Failed;
                t.failure = Some(TaskFailure::new(FailureKind::Unintelligible, "noise"));
            })
            .unwrap();
        assert!(done.completed_at.is_some());

        assert!(reg.update(&id, |t| t.state = TaskState::Succeeded).is_none());
        assert_eq!(reg.get(&id).unwrap().state, TaskState::Failed);
        assert!(reg.update("unknown", |_| {}).is_none());
    }

    #[test]
    fn test_list_filter_and_summary() {
        let (reg, _) = registry();
        for _ in 0..3 {
            reg.insert(Task::new(TaskSource::Text));
        }
        let first = reg.list(None).last().unwrap().id.clone();
        reg.update(&first, |t| t.state = TaskState::Aborted).unwrap();

        assert_eq!(reg.list(None).len(), 3);
        assert_eq!(reg.list(Some(TaskState::Idle)).len(), 2);
        let summary = reg.summary();
        assert_eq!(summary.total, 3);
        assert_eq!(summary.aborted, 1);
        assert_eq!(summary.idle, 2);
    }

    #[test]
    fn test_cancel_all_only_touches_live_tasks() {
        let (reg, _) = registry();
        let live = Task::new(TaskSource::Text);
        let done = Task::new(TaskSource::Text);
        let (live_id, done_id) = (live.id.clone(), done.id.clone());
        let live_token = reg.insert(live);
        let done_token = reg.insert(done);
        reg.update(&done_id, |t| t.state = TaskState::Succeeded).unwrap();

        assert_eq!(reg.cancel_all(), 1);
        assert!(live_token.is_cancelled());
        assert!(!done_token.is_cancelled());
        assert!(reg.cancel_token(&live_id).unwrap().is_cancelled());
    }

    #[test]
    fn test_cleanup_finished() {
        let (reg, recorder) = registry();
        let old = Task::new(TaskSource::Text);
        let old_id = old.id.clone();
        reg.insert(old);
        reg.insert(Task::new(TaskSource::Text));
        reg.update(&old_id, |t| {
            t.state = TaskState::Succeeded;
            t.completed_at = Some(Utc::now() - chrono::Duration::hours(2));
        })
        .unwrap();

        assert_eq!(reg.cleanup_finished(Duration::from_secs(3600)), 1);
        assert_eq!(reg.len(), 1);
        assert!(reg.get(&old_id).is_none());
        assert!(recorder.task(&old_id).is_some());
    }
}
