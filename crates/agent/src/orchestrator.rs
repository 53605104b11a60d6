//! Task lifecycle: utterance -> transcript -> plan -> queued execution.
//!
//! A single pipeline task transcribes and parses commands strictly in arrival
//! order, then hands each planned task to a bounded FIFO drained by a fixed
//! pool of executor workers. The pool size bounds how many tasks execute at
//! once. Every state change goes through the [`TaskRegistry`].

use async_trait::async_trait;
use chrono::Utc;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::{Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use voxnav_audio::{UtteranceArchive, UtteranceQueue};
use voxnav_core::config::AutomationConfig;
use voxnav_core::error::{FailureKind, OrchestrationError};
use voxnav_core::types::{
    LogEntry, PageState, Task, TaskFailure, TaskSource, TaskStage, TaskState, TaskSummary, Transcript, Utterance,
};

use crate::executor::{ExecutionJournal, ExecutionOutcome, Executor};
use crate::parser::IntentParser;
use crate::registry::TaskRegistry;
use crate::transcription::TranscriptionAdapter;

enum Input {
    Utterance(Utterance),
    Text(String),
}

struct Job {
    task_id: String,
    input: Input,
    /// Wait for room in the execution queue instead of failing `queue_full`.
    wait_for_room: bool,
}

/// Appends executor log entries to the task record as they happen.
struct RegistryJournal<'a> {
    registry: &'a TaskRegistry,
    task_id: &'a str,
}

#[async_trait]
impl<'a> ExecutionJournal for RegistryJournal<'a> {
    async fn record(&self, entry: LogEntry) {
        self.registry.update(self.task_id, |t| t.log.push(entry));
    }
}

struct Shared {
    registry: Arc<TaskRegistry>,
    transcription: Option<TranscriptionAdapter>,
    archive: Option<UtteranceArchive>,
    parser: IntentParser,
    executor: Executor,
    last_page: Mutex<PageState>,
    finished: Notify,
    shutdown: CancellationToken,
    queue_capacity: usize,
}

impl Shared {
    fn last_page(&self) -> PageState {
        self.last_page.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Move a task into a terminal state and wake anyone waiting on it.
    fn finish<F>(&self, task_id: &str, f: F) -> Option<Task>
    where
        F: FnOnce(&mut Task),
    {
        let task = self.registry.update(task_id, |t| {
            t.stage = TaskStage::Done;
            f(t);
        });
        self.finished.notify_waiters();
        task
    }

    fn fail(&self, task_id: &str, failure: TaskFailure) {
        warn!(task_id, kind = %failure.kind, reason = %failure.reason, "Task failed");
        self.finish(task_id, |t| {
            t.state = TaskState::Failed;
            t.failure = Some(failure);
        });
    }

    fn abort(&self, task_id: &str, reason: &str) {
        info!(task_id, reason, "Task aborted");
        self.finish(task_id, |t| {
            t.state = TaskState::Aborted;
            t.failure = Some(TaskFailure::new(FailureKind::Cancelled, reason));
        });
    }

    fn archive_utterance(&self, task_id: &str, utterance: &Utterance) {
        let Some(archive) = &self.archive else {
            return;
        };
        match archive.save(utterance) {
            Ok(path) => {
                let path = path.display().to_string();
                self.registry.update(task_id, |t| t.audio_path = Some(path));
            }
            Err(e) => warn!(task_id, error = %e, "Could not archive utterance"),
        }
    }

    /// Transcribe and parse one job, then queue it for execution.
    async fn prepare(&self, job: Job, exec_tx: &mpsc::Sender<String>) {
        let Job { task_id, input, wait_for_room } = job;
        let Some(cancel) = self.registry.cancel_token(&task_id) else {
            return;
        };
        if cancel.is_cancelled() {
            self.abort(&task_id, "cancelled before transcription");
            return;
        }

        let transcript = match input {
            Input::Text(text) => Transcript::typed(&text),
            Input::Utterance(utterance) => {
                self.archive_utterance(&task_id, &utterance);
                let Some(adapter) = &self.transcription else {
                    self.fail(
                        &task_id,
                        TaskFailure::new(FailureKind::Unreachable, "no transcription backend is configured"),
                    );
                    return;
                };
                let heard = tokio::select! {
                    () = cancel.cancelled() => {
                        self.abort(&task_id, "cancelled during transcription");
                        return;
                    }
                    heard = adapter.transcribe(&utterance) => heard,
                };
                match heard {
                    Ok(transcript) => transcript,
                    Err(e) => {
                        self.fail(&task_id, TaskFailure::new(e.kind(), e.to_string()));
                        return;
                    }
                }
            }
        };
        info!(task_id = %task_id, text = %transcript.text, confidence = transcript.confidence, "Command heard");

        let recorded = self.registry.update(&task_id, |t| {
            t.transcript = Some(transcript.clone());
            t.stage = TaskStage::Parsing;
        });
        if recorded.is_none() {
            return;
        }

        let page = self.last_page();
        let parsed = tokio::select! {
            () = cancel.cancelled() => {
                self.abort(&task_id, "cancelled during parsing");
                return;
            }
            parsed = self.parser.parse(&transcript, &page) => parsed,
        };
        let plan = match parsed {
            Ok(plan) => plan,
            Err(e) => {
                self.fail(&task_id, TaskFailure::new(e.kind(), e.to_string()));
                return;
            }
        };
        debug!(task_id = %task_id, steps = plan.len(), origin = ?plan.origin, "Plan ready");

        let queued = self.registry.update(&task_id, |t| {
            t.plan = Some(plan);
            t.stage = TaskStage::Queued;
        });
        if queued.is_none() {
            return;
        }

        if wait_for_room {
            tokio::select! {
                () = cancel.cancelled() => self.abort(&task_id, "cancelled while waiting for the execution queue"),
                sent = exec_tx.send(task_id.clone()) => match sent {
                    Ok(()) => debug!(task_id = %task_id, "Task queued for execution"),
                    Err(_) => self.abort(&task_id, "orchestrator is shutting down"),
                },
            }
            return;
        }
        match exec_tx.try_send(task_id.clone()) {
            Ok(()) => debug!(task_id = %task_id, "Task queued for execution"),
            Err(TrySendError::Full(_)) => {
                let e = OrchestrationError::QueueFull(self.queue_capacity);
                self.fail(&task_id, TaskFailure::new(e.kind(), e.to_string()));
            }
            Err(TrySendError::Closed(_)) => self.abort(&task_id, "orchestrator is shutting down"),
        }
    }

    async fn run_task(&self, task_id: &str) {
        let Some(cancel) = self.registry.cancel_token(task_id) else {
            return;
        };
        let started = self.registry.update(task_id, |t| {
            t.state = TaskState::Executing;
            t.stage = TaskStage::Executing;
            t.started_at = Some(Utc::now());
        });
        let Some(task) = started else {
            debug!(task_id, "Task ended while queued, skipping");
            return;
        };
        let Some(plan) = task.plan else {
            self.fail(task_id, TaskFailure::new(FailureKind::Unsupported, "task has no plan"));
            return;
        };

        let journal = RegistryJournal { registry: &self.registry, task_id };
        let report = self.executor.execute(task_id, &plan, &cancel, &journal).await;

        if let Some(page) = report.page {
            *self.last_page.lock().unwrap_or_else(|e| e.into_inner()) = page;
        }
        self.finish(task_id, |t| match report.outcome {
            ExecutionOutcome::Succeeded(result) => {
                t.state = TaskState::Succeeded;
                t.result = Some(result);
            }
            ExecutionOutcome::Failed(failure) => {
                t.state = TaskState::Failed;
                t.failure = Some(failure);
            }
            ExecutionOutcome::Aborted(failure) => {
                t.state = TaskState::Aborted;
                t.failure = Some(failure);
            }
        });
    }
}

async fn pipeline_loop(shared: Arc<Shared>, mut intake: mpsc::Receiver<Job>, exec_tx: mpsc::Sender<String>) {
    loop {
        let job = tokio::select! {
            biased;
            () = shared.shutdown.cancelled() => break,
            job = intake.recv() => job,
        };
        let Some(job) = job else {
            break;
        };
        shared.prepare(job, &exec_tx).await;
    }
    debug!("Command pipeline stopped");
}

async fn worker_loop(shared: Arc<Shared>, queue: Arc<AsyncMutex<mpsc::Receiver<String>>>, worker: usize) {
    loop {
        let next = {
            let mut queue = queue.lock().await;
            tokio::select! {
                biased;
                () = shared.shutdown.cancelled() => None,
                next = queue.recv() => next,
            }
        };
        let Some(task_id) = next else {
            break;
        };
        debug!(worker, task_id = %task_id, "Worker picked up task");
        shared.run_task(&task_id).await;
    }
    debug!(worker, "Executor worker stopped");
}

/// Owns every task from submission to its terminal state.
pub struct Orchestrator {
    shared: Arc<Shared>,
    intake: mpsc::Sender<Job>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Orchestrator {
    /// Spawn the pipeline and the worker pool. Must be called from within a
    /// tokio runtime. With an `archive`, every utterance is saved before it
    /// is transcribed.
    pub fn start(
        registry: Arc<TaskRegistry>,
        transcription: Option<TranscriptionAdapter>,
        archive: Option<UtteranceArchive>,
        parser: IntentParser,
        executor: Executor,
        automation: &AutomationConfig,
    ) -> Self {
        let capacity = automation.task_queue_capacity.max(1);
        let workers = automation.max_concurrent_tasks.max(1);
        let (intake_tx, intake_rx) = mpsc::channel(capacity);
        let (exec_tx, exec_rx) = mpsc::channel(capacity);

        let shared = Arc::new(Shared {
            registry,
            transcription,
            archive,
            parser,
            executor,
            last_page: Mutex::new(PageState::default()),
            finished: Notify::new(),
            shutdown: CancellationToken::new(),
            queue_capacity: capacity,
        });

        let mut handles = Vec::with_capacity(workers + 1);
        handles.push(tokio::spawn(pipeline_loop(shared.clone(), intake_rx, exec_tx)));
        let exec_rx = Arc::new(AsyncMutex::new(exec_rx));
        for worker in 0..workers {
            handles.push(tokio::spawn(worker_loop(shared.clone(), exec_rx.clone(), worker)));
        }
        info!(workers, queue_capacity = capacity, "Orchestrator started");

        Self {
            shared,
            intake: intake_tx,
            handles: Mutex::new(handles),
        }
    }

    fn register(&self, source: TaskSource) -> String {
        let task = Task::new(source);
        let task_id = task.id.clone();
        self.shared.registry.insert(task);
        debug!(task_id = %task_id, source = source.as_str(), "Task submitted");
        task_id
    }

    fn submit(&self, source: TaskSource, input: Input) -> String {
        let task_id = self.register(source);
        match self.intake.try_send(Job { task_id: task_id.clone(), input, wait_for_room: false }) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                let e = OrchestrationError::QueueFull(self.shared.queue_capacity);
                self.shared.fail(&task_id, TaskFailure::new(e.kind(), e.to_string()));
            }
            Err(TrySendError::Closed(_)) => self.shared.abort(&task_id, "orchestrator is shutting down"),
        }
        task_id
    }

    /// Accept a spoken command. Returns the new task's id.
    pub fn submit_utterance(&self, utterance: Utterance) -> String {
        self.submit(TaskSource::Voice, Input::Utterance(utterance))
    }

    /// Accept a spoken command from a finite recording. Instead of failing
    /// with `queue_full`, this waits for room in the intake queue and the
    /// task's execution slot waits the same way, so replaying a long file
    /// never drops a command.
    pub async fn submit_utterance_waiting(&self, utterance: Utterance) -> String {
        let task_id = self.register(TaskSource::Voice);
        let job = Job { task_id: task_id.clone(), input: Input::Utterance(utterance), wait_for_room: true };
        let sent = tokio::select! {
            biased;
            () = self.shared.shutdown.cancelled() => false,
            sent = self.intake.send(job) => sent.is_ok(),
        };
        if !sent {
            self.shared.abort(&task_id, "orchestrator is shutting down");
        }
        task_id
    }

    /// Accept a typed command; it skips transcription.
    pub fn submit_text(&self, text: &str) -> String {
        self.submit(TaskSource::Text, Input::Text(text.to_string()))
    }

    /// Request cancellation. A task that has not started executing is aborted
    /// immediately; an executing one stops at its next step boundary.
    /// Returns false when the task is unknown or already finished.
    pub fn cancel(&self, task_id: &str) -> bool {
        let Some(token) = self.shared.registry.cancel_token(task_id) else {
            return false;
        };
        token.cancel();
        let updated = self.shared.registry.update(task_id, |t| {
            if t.state == TaskState::Idle {
                t.state = TaskState::Aborted;
                t.stage = TaskStage::Done;
                t.failure = Some(TaskFailure::new(FailureKind::Cancelled, "cancelled by request"));
            }
        });
        match updated {
            Some(task) => {
                info!(task_id, state = %task.state, "Cancellation requested");
                if task.is_terminal() {
                    self.shared.finished.notify_waiters();
                }
                true
            }
            None => false,
        }
    }

    pub fn get(&self, task_id: &str) -> Option<Task> {
        self.shared.registry.get(task_id)
    }

    pub fn list(&self, state: Option<TaskState>) -> Vec<Task> {
        self.shared.registry.list(state)
    }

    pub fn summary(&self) -> TaskSummary {
        self.shared.registry.summary()
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.shared.registry
    }

    /// Page observed at the end of the most recent execution.
    pub fn last_page(&self) -> PageState {
        self.shared.last_page()
    }

    /// Wait until the task is terminal or `timeout` elapses, returning its
    /// latest snapshot either way.
    pub async fn wait_for(&self, task_id: &str, timeout: Duration) -> Option<Task> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.shared.finished.notified();
            let task = self.get(task_id)?;
            if task.is_terminal() {
                return Some(task);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.get(task_id);
            }
        }
    }

    /// Feed segmented utterances into the pipeline until the queue closes or
    /// the orchestrator shuts down. Returns how many were submitted.
    pub async fn run_pipeline(&self, queue: &UtteranceQueue) -> u64 {
        let mut submitted = 0u64;
        loop {
            let next = tokio::select! {
                biased;
                () = self.shared.shutdown.cancelled() => None,
                next = queue.pop() => next,
            };
            let Some(utterance) = next else {
                break;
            };
            let utterance_id = utterance.id.clone();
            let task_id = self.submit_utterance(utterance);
            debug!(utterance_id = %utterance_id, task_id = %task_id, "Utterance submitted");
            submitted += 1;
        }
        info!(submitted, "Utterance intake ended");
        submitted
    }

    pub fn cleanup_finished(&self, max_age: Duration) -> usize {
        self.shared.registry.cleanup_finished(max_age)
    }

    /// Cancel all live tasks, stop the pipeline and workers, and abort
    /// whatever never got to run.
    pub async fn shutdown(&self, grace: Duration) {
        let cancelled = self.shared.registry.cancel_all();
        self.shared.shutdown.cancel();

        let handles: Vec<JoinHandle<()>> =
            std::mem::take(&mut *self.handles.lock().unwrap_or_else(|e| e.into_inner()));
        for handle in handles {
            if tokio::time::timeout(grace, handle).await.is_err() {
                warn!(grace_ms = grace.as_millis() as u64, "Orchestrator task did not stop in time");
            }
        }
        for task in self.list(None).into_iter().filter(|t| !t.is_terminal()) {
            self.shared.abort(&task.id, "orchestrator shut down");
        }
        info!(cancelled, "Orchestrator stopped");
    }
}
