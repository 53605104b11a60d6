use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::FailureKind;

/// One segmented span of captured speech (mono PCM16).
#[derive(Debug, Clone, PartialEq)]
pub struct Utterance {
    pub id: String,
    pub samples: Vec<i16>,
    pub sample_rate: u32,
    /// Offset of the first sample, in ms since the stream started.
    pub start_ms: u64,
    pub end_ms: u64,
}

impl Utterance {
    pub fn new(samples: Vec<i16>, sample_rate: u32, start_ms: u64) -> Self {
        let end_ms = start_ms + samples_to_ms(samples.len(), sample_rate);
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            samples,
            sample_rate,
            start_ms,
            end_ms,
        }
    }

    pub fn duration_ms(&self) -> u64 {
        self.end_ms.saturating_sub(self.start_ms)
    }
}

pub fn samples_to_ms(samples: usize, sample_rate: u32) -> u64 {
    if sample_rate == 0 {
        return 0;
    }
    samples as u64 * 1000 / sample_rate as u64
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transcript {
    pub text: String,
    /// Always in [0, 1]. Failures are reported as errors, never as a zero score.
    pub confidence: f32,
    pub utterance_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

impl Transcript {
    pub fn word_count(&self) -> usize {
        self.text.split_whitespace().count()
    }

    /// A typed command; there is no audio and nothing to be unsure about.
    pub fn typed(text: &str) -> Self {
        Self {
            text: text.trim().to_string(),
            confidence: 1.0,
            utterance_id: None,
            language: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum WaitCondition {
    /// An element matching the selector is present.
    Selector(String),
    /// The visible page text contains this string (case-insensitive).
    Text(String),
    UrlContains(String),
    /// Sleep for the step's whole timeout.
    Delay,
}

/// Observable state that proves a click/type took effect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Postcondition {
    UrlContains(String),
    TextVisible(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ActionStep {
    Navigate {
        url: String,
    },
    Click {
        selector: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expect: Option<Postcondition>,
    },
    Type {
        selector: String,
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expect: Option<Postcondition>,
    },
    Wait {
        condition: WaitCondition,
        timeout_ms: u64,
    },
    Extract {
        selector: String,
    },
}

impl ActionStep {
    pub fn navigate(url: &str) -> Self {
        ActionStep::Navigate { url: url.to_string() }
    }

    pub fn click(selector: &str) -> Self {
        ActionStep::Click { selector: selector.to_string(), expect: None }
    }

    pub fn type_text(selector: &str, text: &str) -> Self {
        ActionStep::Type {
            selector: selector.to_string(),
            text: text.to_string(),
            expect: None,
        }
    }

    pub fn extract(selector: &str) -> Self {
        ActionStep::Extract { selector: selector.to_string() }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ActionStep::Navigate { .. } => "navigate",
            ActionStep::Click { .. } => "click",
            ActionStep::Type { .. } => "type",
            ActionStep::Wait { .. } => "wait",
            ActionStep::Extract { .. } => "extract",
        }
    }

    /// Steps whose repetition could duplicate a side effect on the page.
    pub fn mutates_page(&self) -> bool {
        matches!(self, ActionStep::Click { .. } | ActionStep::Type { .. })
    }

    pub fn postcondition(&self) -> Option<&Postcondition> {
        match self {
            ActionStep::Click { expect, .. } | ActionStep::Type { expect, .. } => expect.as_ref(),
            _ => None,
        }
    }

    pub fn selector(&self) -> Option<&str> {
        match self {
            ActionStep::Click { selector, .. }
            | ActionStep::Type { selector, .. }
            | ActionStep::Extract { selector } => Some(selector),
            ActionStep::Wait { condition: WaitCondition::Selector(selector), .. } => Some(selector),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanOrigin {
    Grammar,
    Reasoning,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionPlan {
    pub steps: Vec<ActionStep>,
    pub origin: PlanOrigin,
}

impl ActionPlan {
    pub fn new(steps: Vec<ActionStep>, origin: PlanOrigin) -> Self {
        Self { steps, origin }
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// What the agent can currently see of the page.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageState {
    pub url: Option<String>,
    pub title: Option<String>,
    /// Visible interactive labels (buttons, links, field placeholders).
    #[serde(default)]
    pub labels: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Accepted, not yet executing.
    Idle,
    Executing,
    Succeeded,
    Failed,
    Aborted,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Succeeded | TaskState::Failed | TaskState::Aborted)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Idle => "idle",
            TaskState::Executing => "executing",
            TaskState::Succeeded => "succeeded",
            TaskState::Failed => "failed",
            TaskState::Aborted => "aborted",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "idle" => Some(TaskState::Idle),
            "executing" => Some(TaskState::Executing),
            "succeeded" => Some(TaskState::Succeeded),
            "failed" => Some(TaskState::Failed),
            "aborted" => Some(TaskState::Aborted),
            _ => None,
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStage {
    Transcribing,
    Parsing,
    Queued,
    Executing,
    Done,
}

impl TaskStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStage::Transcribing => "transcribing",
            TaskStage::Parsing => "parsing",
            TaskStage::Queued => "queued",
            TaskStage::Executing => "executing",
            TaskStage::Done => "done",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "transcribing" => Some(TaskStage::Transcribing),
            "parsing" => Some(TaskStage::Parsing),
            "queued" => Some(TaskStage::Queued),
            "executing" => Some(TaskStage::Executing),
            "done" => Some(TaskStage::Done),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StepOutcome {
    Success {
        attempts: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        url: Option<String>,
        /// The step's effect was confirmed through its post-condition rather
        /// than a clean driver response.
        #[serde(default)]
        verified: bool,
    },
    Retrying {
        attempt: u32,
        kind: FailureKind,
        reason: String,
    },
    Failed {
        attempts: u32,
        kind: FailureKind,
        reason: String,
    },
    Cancelled,
}

impl StepOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, StepOutcome::Success { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub step_index: usize,
    pub outcome: StepOutcome,
    pub at: DateTime<Utc>,
}

impl LogEntry {
    pub fn now(step_index: usize, outcome: StepOutcome) -> Self {
        Self { step_index, outcome, at: Utc::now() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extraction {
    pub step_index: usize,
    pub selector: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskResult {
    #[serde(default)]
    pub extracted: Vec<Extraction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub kind: FailureKind,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_index: Option<usize>,
}

impl TaskFailure {
    pub fn new(kind: FailureKind, reason: impl Into<String>) -> Self {
        Self { kind, reason: reason.into(), step_index: None }
    }

    pub fn at_step(mut self, step_index: usize) -> Self {
        self.step_index = Some(step_index);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskSource {
    Voice,
    Text,
}

impl TaskSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskSource::Voice => "voice",
            TaskSource::Text => "text",
        }
    }
}

/// The unit of work tracking one command from capture to a terminal outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub source: TaskSource,
    pub state: TaskState,
    pub stage: TaskStage,
    pub transcript: Option<Transcript>,
    pub plan: Option<ActionPlan>,
    #[serde(default)]
    pub log: Vec<LogEntry>,
    pub result: Option<TaskResult>,
    pub failure: Option<TaskFailure>,
    /// Where the utterance was archived, when `audio.saveUtterances` is on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_path: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(source: TaskSource) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            source,
            state: TaskState::Idle,
            stage: match source {
                TaskSource::Voice => TaskStage::Transcribing,
                TaskSource::Text => TaskStage::Parsing,
            },
            transcript: None,
            plan: None,
            log: Vec::new(),
            result: None,
            failure: None,
            audio_path: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

/// Word and confidence totals over every transcript heard.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TranscriptStats {
    pub transcribed: usize,
    pub words: usize,
    /// Mean transcript confidence; 0.0 while nothing has been transcribed.
    pub average_confidence: f32,
}

impl TranscriptStats {
    pub fn record(&mut self, transcript: &Transcript) {
        let seen = self.transcribed as f32;
        self.average_confidence = (self.average_confidence * seen + transcript.confidence) / (seen + 1.0);
        self.transcribed += 1;
        self.words += transcript.word_count();
    }
}

/// Task counts per state, plus transcript statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskSummary {
    pub total: usize,
    pub idle: usize,
    pub executing: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub aborted: usize,
    #[serde(default)]
    pub transcripts: TranscriptStats,
}

/// Live view of the audio capture loop.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CaptureStatus {
    pub active: bool,
    pub speaking: bool,
    /// RMS level of the latest frame in dBFS; absent while capture is idle.
    pub level_db: Option<f32>,
    pub utterances: u64,
    /// Utterances the hand-off queue discarded because it was full.
    pub dropped: u64,
}

impl TaskSummary {
    pub fn add(&mut self, state: TaskState, count: usize) {
        self.total += count;
        match state {
            TaskState::Idle => self.idle += count,
            TaskState::Executing => self.executing += count,
            TaskState::Succeeded => self.succeeded += count,
            TaskState::Failed => self.failed += count,
            TaskState::Aborted => self.aborted += count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_counts() {
        let mut summary = TaskSummary::default();
        summary.add(TaskState::Failed, 2);
        summary.add(TaskState::Succeeded, 1);
        assert_eq!(summary.total, 3);
        assert_eq!(summary.failed, 2);
        assert_eq!(summary.executing, 0);
    }

    #[test]
    fn test_transcript_stats() {
        let mut stats = TranscriptStats::default();
        assert_eq!(stats.average_confidence, 0.0);
        stats.record(&Transcript { text: "go to example.com".into(), confidence: 0.9, utterance_id: None, language: None });
        stats.record(&Transcript::typed("  click   submit "));
        assert_eq!(stats.transcribed, 2);
        assert_eq!(stats.words, 5);
        assert!((stats.average_confidence - 0.95).abs() < 1e-6);
    }

    #[test]
    fn test_utterance_duration() {
        let u = Utterance::new(vec![0; 8000], 16000, 1000);
        assert_eq!(u.duration_ms(), 500);
        assert_eq!(u.end_ms, 1500);
        assert_eq!(samples_to_ms(160, 0), 0);
    }

    #[test]
    fn test_action_step_wire_format() {
        let step = ActionStep::navigate("https://example.com");
        let json = serde_json::to_value(&step).unwrap();
        assert_eq!(json, serde_json::json!({"action": "navigate", "url": "https://example.com"}));

        let raw = r##"{"action": "click", "selector": "#submit"}"##;
        let step: ActionStep = serde_json::from_str(raw).unwrap();
        assert_eq!(step, ActionStep::click("#submit"));
        assert!(step.mutates_page());
        assert_eq!(step.postcondition(), None);

        let raw = r#"{"action": "wait", "condition": {"type": "text", "value": "Welcome"}, "timeout_ms": 3000}"#;
        let step: ActionStep = serde_json::from_str(raw).unwrap();
        assert_eq!(
            step,
            ActionStep::Wait { condition: WaitCondition::Text("Welcome".into()), timeout_ms: 3000 }
        );
        assert!(!step.mutates_page());
    }

    #[test]
    fn test_terminal_states() {
        assert!(!TaskState::Idle.is_terminal());
        assert!(!TaskState::Executing.is_terminal());
        assert!(TaskState::Succeeded.is_terminal());
        assert!(TaskState::Failed.is_terminal());
        assert!(TaskState::Aborted.is_terminal());
        assert_eq!(TaskState::from_str("aborted"), Some(TaskState::Aborted));
    }

    #[test]
    fn test_new_task_stage_follows_source() {
        assert_eq!(Task::new(TaskSource::Voice).stage, TaskStage::Transcribing);
        assert_eq!(Task::new(TaskSource::Text).stage, TaskStage::Parsing);
        let t = Transcript::typed("  go to example.com ");
        assert_eq!(t.text, "go to example.com");
        assert_eq!(t.confidence, 1.0);
    }
}
