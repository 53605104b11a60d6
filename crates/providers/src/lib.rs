//! External collaborators of the agent: the speech-to-text endpoint and the
//! reasoning endpoint that turns free-form commands into action steps.

pub mod client;
pub mod factory;
pub mod openai;
pub mod whisper;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use voxnav_core::error::TranscriptionError;
use voxnav_core::types::{ActionStep, PageState};

/// Raw answer of a speech-to-text engine.
#[derive(Debug, Clone, PartialEq)]
pub struct Recognition {
    pub text: String,
    pub confidence: f32,
    pub language: Option<String>,
}

#[async_trait]
pub trait Transcriber: Send + Sync {
    /// Transcribe one WAV-encoded utterance.
    async fn transcribe(&self, wav: &[u8], sample_rate: u32) -> Result<Recognition, TranscriptionError>;

    fn name(&self) -> &str;
}

/// Context handed to the reasoning collaborator.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReasoningRequest {
    pub transcript: String,
    pub page: PageState,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReasoningError {
    #[error("reasoning call timed out: {0}")]
    Timeout(String),

    #[error("reasoning service unreachable: {0}")]
    Unreachable(String),

    /// The service answered, but not with a usable plan.
    #[error("reasoning reply is not a valid plan: {0}")]
    Malformed(String),
}

impl ReasoningError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ReasoningError::Malformed(_))
    }
}

#[async_trait]
pub trait Reasoner: Send + Sync {
    async fn plan(&self, request: &ReasoningRequest) -> Result<Vec<ActionStep>, ReasoningError>;

    fn name(&self) -> &str;
}

pub use factory::{create_reasoner, create_transcriber};
pub use openai::ChatReasoner;
pub use whisper::WhisperTranscriber;
