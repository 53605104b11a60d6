//! Scripted collaborators shared by the agent's tests.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use voxnav_browser::{BrowserDriver, BrowserSession, StepFailure, StepObservation};
use voxnav_core::error::{ExecutionError, TranscriptionError};
use voxnav_core::types::{ActionStep, LogEntry, PageState, Postcondition, Task};
use voxnav_providers::{Reasoner, ReasoningError, ReasoningRequest, Recognition, Transcriber};
use voxnav_storage::TaskRecorder;

use crate::executor::ExecutionJournal;

pub struct MockTranscriber {
    script: Mutex<VecDeque<Result<Recognition, TranscriptionError>>>,
    hang: bool,
    calls: AtomicUsize,
    last_wav: Mutex<Vec<u8>>,
}

impl MockTranscriber {
    pub fn new(script: Vec<Result<Recognition, TranscriptionError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            hang: false,
            calls: AtomicUsize::new(0),
            last_wav: Mutex::new(Vec::new()),
        }
    }

    /// Answers each call with the next transcript at the given confidence.
    pub fn saying(lines: &[(&str, f32)]) -> Self {
        Self::new(
            lines
                .iter()
                .map(|(text, confidence)| Ok(Recognition { text: text.to_string(), confidence: *confidence, language: None }))
                .collect(),
        )
    }

    pub fn hanging() -> Self {
        Self { hang: true, ..Self::new(vec![]) }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_wav(&self) -> Vec<u8> {
        self.last_wav.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transcriber for MockTranscriber {
    async fn transcribe(&self, wav: &[u8], _sample_rate: u32) -> Result<Recognition, TranscriptionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_wav.lock().unwrap() = wav.to_vec();
        if self.hang {
            std::future::pending::<()>().await;
        }
        let next = self.script.lock().unwrap().pop_front();
        next.unwrap_or_else(|| Err(TranscriptionError::Unreachable("script exhausted".into())))
    }

    fn name(&self) -> &str {
        "mock"
    }
}

pub struct MockReasoner {
    script: Mutex<VecDeque<Result<Vec<ActionStep>, ReasoningError>>>,
    calls: AtomicUsize,
    last_request: Mutex<Option<ReasoningRequest>>,
}

impl MockReasoner {
    pub fn new(script: Vec<Result<Vec<ActionStep>, ReasoningError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            calls: AtomicUsize::new(0),
            last_request: Mutex::new(None),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_request(&self) -> Option<ReasoningRequest> {
        self.last_request.lock().unwrap().clone()
    }
}

#[async_trait]
impl Reasoner for MockReasoner {
    async fn plan(&self, request: &ReasoningRequest) -> Result<Vec<ActionStep>, ReasoningError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_request.lock().unwrap() = Some(request.clone());
        let next = self.script.lock().unwrap().pop_front();
        next.unwrap_or_else(|| Err(ReasoningError::Unreachable("script exhausted".into())))
    }

    fn name(&self) -> &str {
        "mock"
    }
}

#[derive(Default)]
struct Counters {
    opens: AtomicUsize,
    closes: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
    performed: Mutex<Vec<(String, ActionStep)>>,
    flaky: Mutex<HashMap<String, u32>>,
}

/// In-memory browser. Every selector is present unless scripted otherwise.
#[derive(Default)]
pub struct MockDriver {
    counters: Arc<Counters>,
    missing: HashSet<String>,
    crash: HashSet<String>,
    uncertain: HashMap<String, Option<String>>,
    step_delay: Duration,
    fail_open: bool,
}

impl MockDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// The selector never appears: every attempt times out.
    pub fn missing(mut self, selector: &str) -> Self {
        self.missing.insert(selector.to_string());
        self
    }

    /// The selector is not found `times` times, then works.
    pub fn flaky(self, selector: &str, times: u32) -> Self {
        self.counters.flaky.lock().unwrap().insert(selector.to_string(), times);
        self
    }

    /// Acting on the selector fails after the effect happened; the page then
    /// shows `url_after` when given.
    pub fn uncertain(mut self, selector: &str, url_after: Option<&str>) -> Self {
        self.uncertain.insert(selector.to_string(), url_after.map(str::to_string));
        self
    }

    /// The browser dies when this selector is used.
    pub fn crash_on(mut self, selector: &str) -> Self {
        self.crash.insert(selector.to_string());
        self
    }

    pub fn step_delay(mut self, delay: Duration) -> Self {
        self.step_delay = delay;
        self
    }

    pub fn failing_open(mut self) -> Self {
        self.fail_open = true;
        self
    }

    pub fn opens(&self) -> usize {
        self.counters.opens.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.counters.closes.load(Ordering::SeqCst)
    }

    pub fn max_active(&self) -> usize {
        self.counters.max_active.load(Ordering::SeqCst)
    }

    /// `(task_id, step)` in the order steps were attempted.
    pub fn performed(&self) -> Vec<(String, ActionStep)> {
        self.counters.performed.lock().unwrap().clone()
    }
}

#[async_trait]
impl BrowserDriver for MockDriver {
    async fn open(&self, task_id: &str) -> Result<Box<dyn BrowserSession>, ExecutionError> {
        if self.fail_open {
            return Err(ExecutionError::SessionLost("browser binary not found".into()));
        }
        self.counters.opens.fetch_add(1, Ordering::SeqCst);
        let active = self.counters.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.max_active.fetch_max(active, Ordering::SeqCst);
        Ok(Box::new(MockSession {
            task_id: task_id.to_string(),
            counters: self.counters.clone(),
            missing: self.missing.clone(),
            crash: self.crash.clone(),
            uncertain: self.uncertain.clone(),
            step_delay: self.step_delay,
            url: None,
            closed: false,
        }))
    }

    fn name(&self) -> &str {
        "mock"
    }
}

struct MockSession {
    task_id: String,
    counters: Arc<Counters>,
    missing: HashSet<String>,
    crash: HashSet<String>,
    uncertain: HashMap<String, Option<String>>,
    step_delay: Duration,
    url: Option<String>,
    closed: bool,
}

impl MockSession {
    fn page(&self) -> PageState {
        PageState { url: self.url.clone(), title: Some("Mock".into()), labels: vec![] }
    }
}

#[async_trait]
impl BrowserSession for MockSession {
    async fn perform(&mut self, step: &ActionStep, _timeout: Duration) -> Result<StepObservation, StepFailure> {
        assert!(!self.closed, "step performed on a closed session");
        self.counters.performed.lock().unwrap().push((self.task_id.clone(), step.clone()));
        if !self.step_delay.is_zero() {
            tokio::time::sleep(self.step_delay).await;
        }

        if let ActionStep::Navigate { url } = step {
            self.url = Some(url.clone());
            return Ok(StepObservation { page: self.page(), extracted: None });
        }

        let selector = step.selector().unwrap_or_default().to_string();
        if self.crash.contains(&selector) {
            return Err(StepFailure::clean(ExecutionError::SessionLost("browser crashed".into())));
        }
        if self.missing.contains(&selector) {
            return Err(StepFailure::clean(ExecutionError::StepTimeout(format!("element '{}' did not appear", selector))));
        }
        {
            let mut flaky = self.counters.flaky.lock().unwrap();
            if let Some(left) = flaky.get_mut(&selector) {
                if *left > 0 {
                    *left -= 1;
                    return Err(StepFailure::clean(ExecutionError::StepNotFound(selector)));
                }
            }
        }
        if let Some(url_after) = self.uncertain.get(&selector) {
            if let Some(url) = url_after {
                self.url = Some(url.clone());
            }
            return Err(StepFailure::uncertain(ExecutionError::StepTimeout("no acknowledgement".into())));
        }

        let extracted = match step {
            ActionStep::Extract { selector } => Some(format!("value of {}", selector)),
            _ => None,
        };
        Ok(StepObservation { page: self.page(), extracted })
    }

    async fn verify(&mut self, condition: &Postcondition) -> Result<bool, ExecutionError> {
        Ok(match condition {
            Postcondition::UrlContains(fragment) => self.url.as_deref().is_some_and(|u| u.contains(fragment.as_str())),
            Postcondition::TextVisible(_) => false,
        })
    }

    async fn page_state(&mut self) -> Result<PageState, ExecutionError> {
        Ok(self.page())
    }

    async fn close(&mut self) {
        assert!(!self.closed, "session closed twice");
        self.closed = true;
        self.counters.closes.fetch_add(1, Ordering::SeqCst);
        self.counters.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Collects log entries; optionally trips a cancel token after `n` of them.
#[derive(Default)]
pub struct VecJournal {
    entries: Mutex<Vec<LogEntry>>,
    cancel_after: Option<(usize, CancellationToken)>,
}

impl VecJournal {
    pub fn cancelling_after(n: usize, token: CancellationToken) -> Self {
        Self { entries: Mutex::new(Vec::new()), cancel_after: Some((n, token)) }
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries.lock().unwrap().clone()
    }
}

#[async_trait]
impl ExecutionJournal for VecJournal {
    async fn record(&self, entry: LogEntry) {
        let count = {
            let mut entries = self.entries.lock().unwrap();
            entries.push(entry);
            entries.len()
        };
        if let Some((n, token)) = &self.cancel_after {
            if count >= *n {
                token.cancel();
            }
        }
    }
}

#[derive(Default)]
pub struct MemoryRecorder {
    tasks: Mutex<HashMap<String, Task>>,
    logs: Mutex<Vec<(String, usize, LogEntry)>>,
}

impl MemoryRecorder {
    pub fn task(&self, id: &str) -> Option<Task> {
        self.tasks.lock().unwrap().get(id).cloned()
    }

    pub fn log_seqs(&self, id: &str) -> Vec<usize> {
        self.logs
            .lock()
            .unwrap()
            .iter()
            .filter(|(task_id, _, _)| task_id == id)
            .map(|(_, seq, _)| *seq)
            .collect()
    }
}

impl TaskRecorder for MemoryRecorder {
    fn record_task(&self, task: &Task) -> voxnav_core::Result<()> {
        self.tasks.lock().unwrap().insert(task.id.clone(), task.clone());
        Ok(())
    }

    fn record_log(&self, task_id: &str, seq: usize, entry: &LogEntry) -> voxnav_core::Result<()> {
        self.logs.lock().unwrap().push((task_id.to_string(), seq, entry.clone()));
        Ok(())
    }
}
