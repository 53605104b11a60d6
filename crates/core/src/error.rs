use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Browser error: {0}")]
    Browser(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error(transparent)]
    Transcription(#[from] TranscriptionError),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Execution(#[from] ExecutionError),

    #[error(transparent)]
    Orchestration(#[from] OrchestrationError),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Machine-readable failure kind attached to a failed or aborted task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Timeout,
    Unreachable,
    Unintelligible,
    Ambiguous,
    Unsupported,
    ReasoningUnavailable,
    StepTimeout,
    StepNotFound,
    PostconditionFailed,
    SessionLost,
    QueueFull,
    Cancelled,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Timeout => "timeout",
            FailureKind::Unreachable => "unreachable",
            FailureKind::Unintelligible => "unintelligible",
            FailureKind::Ambiguous => "ambiguous",
            FailureKind::Unsupported => "unsupported",
            FailureKind::ReasoningUnavailable => "reasoning_unavailable",
            FailureKind::StepTimeout => "step_timeout",
            FailureKind::StepNotFound => "step_not_found",
            FailureKind::PostconditionFailed => "postcondition_failed",
            FailureKind::SessionLost => "session_lost",
            FailureKind::QueueFull => "queue_full",
            FailureKind::Cancelled => "cancelled",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "timeout" => Some(FailureKind::Timeout),
            "unreachable" => Some(FailureKind::Unreachable),
            "unintelligible" => Some(FailureKind::Unintelligible),
            "ambiguous" => Some(FailureKind::Ambiguous),
            "unsupported" => Some(FailureKind::Unsupported),
            "reasoning_unavailable" => Some(FailureKind::ReasoningUnavailable),
            "step_timeout" => Some(FailureKind::StepTimeout),
            "step_not_found" => Some(FailureKind::StepNotFound),
            "postcondition_failed" => Some(FailureKind::PostconditionFailed),
            "session_lost" => Some(FailureKind::SessionLost),
            "queue_full" => Some(FailureKind::QueueFull),
            "cancelled" => Some(FailureKind::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TranscriptionError {
    #[error("transcription timed out: {0}")]
    Timeout(String),

    #[error("transcription service unreachable: {0}")]
    Unreachable(String),

    #[error("speech could not be understood: {0}")]
    Unintelligible(String),
}

impl TranscriptionError {
    pub fn kind(&self) -> FailureKind {
        match self {
            TranscriptionError::Timeout(_) => FailureKind::Timeout,
            TranscriptionError::Unreachable(_) => FailureKind::Unreachable,
            TranscriptionError::Unintelligible(_) => FailureKind::Unintelligible,
        }
    }

    /// `unintelligible` is a confident answer from the engine and is never retried.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, TranscriptionError::Unintelligible(_))
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("command is ambiguous: {0}")]
    Ambiguous(String),

    #[error("command is not supported: {0}")]
    Unsupported(String),

    #[error("reasoning backend unavailable: {0}")]
    ReasoningUnavailable(String),
}

impl ParseError {
    pub fn kind(&self) -> FailureKind {
        match self {
            ParseError::Ambiguous(_) => FailureKind::Ambiguous,
            ParseError::Unsupported(_) => FailureKind::Unsupported,
            ParseError::ReasoningUnavailable(_) => FailureKind::ReasoningUnavailable,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutionError {
    #[error("step timed out: {0}")]
    StepTimeout(String),

    #[error("element not found: {0}")]
    StepNotFound(String),

    #[error("post-condition failed: {0}")]
    PostconditionFailed(String),

    #[error("browser session lost: {0}")]
    SessionLost(String),
}

impl ExecutionError {
    pub fn kind(&self) -> FailureKind {
        match self {
            ExecutionError::StepTimeout(_) => FailureKind::StepTimeout,
            ExecutionError::StepNotFound(_) => FailureKind::StepNotFound,
            ExecutionError::PostconditionFailed(_) => FailureKind::PostconditionFailed,
            ExecutionError::SessionLost(_) => FailureKind::SessionLost,
        }
    }

    /// Element not yet present or page still loading.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ExecutionError::StepTimeout(_) | ExecutionError::StepNotFound(_)
        )
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OrchestrationError {
    #[error("execution queue is full ({0} tasks waiting)")]
    QueueFull(usize),

    #[error("task was cancelled")]
    Cancelled,
}

impl OrchestrationError {
    pub fn kind(&self) -> FailureKind {
        match self {
            OrchestrationError::QueueFull(_) => FailureKind::QueueFull,
            OrchestrationError::Cancelled => FailureKind::Cancelled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_kind_round_trip_names() {
        for kind in [
            FailureKind::Timeout,
            FailureKind::Unintelligible,
            FailureKind::ReasoningUnavailable,
            FailureKind::StepTimeout,
            FailureKind::PostconditionFailed,
            FailureKind::QueueFull,
        ] {
            assert_eq!(FailureKind::from_str(kind.as_str()), Some(kind));
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind.as_str()));
        }
        assert_eq!(FailureKind::from_str("nope"), None);
    }

    #[test]
    fn test_retry_classification() {
        assert!(TranscriptionError::Timeout("t".into()).is_retryable());
        assert!(TranscriptionError::Unreachable("u".into()).is_retryable());
        assert!(!TranscriptionError::Unintelligible("x".into()).is_retryable());

        assert!(ExecutionError::StepNotFound("#a".into()).is_transient());
        assert!(ExecutionError::StepTimeout("#a".into()).is_transient());
        assert!(!ExecutionError::SessionLost("gone".into()).is_transient());
        assert!(!ExecutionError::PostconditionFailed("p".into()).is_transient());
    }

    #[test]
    fn test_domain_errors_convert() {
        let err: Error = ParseError::Ambiguous("click it".into()).into();
        assert!(matches!(err, Error::Parse(ParseError::Ambiguous(_))));
        assert_eq!(err.to_string(), "command is ambiguous: click it");
    }
}
