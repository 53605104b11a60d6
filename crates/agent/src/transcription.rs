use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use voxnav_core::config::TranscriptionConfig;
use voxnav_core::error::TranscriptionError;
use voxnav_core::types::{Transcript, Utterance};
use voxnav_core::RetryPolicy;
use voxnav_providers::Transcriber;

/// Turns an utterance into a transcript, owning the timeout, retry and
/// confidence-floor policy around the speech-to-text collaborator.
pub struct TranscriptionAdapter {
    transcriber: Arc<dyn Transcriber>,
    timeout: Duration,
    retry: RetryPolicy,
    confidence_floor: f32,
}

impl TranscriptionAdapter {
    pub fn new(
        transcriber: Arc<dyn Transcriber>,
        timeout: Duration,
        retry: RetryPolicy,
        confidence_floor: f32,
    ) -> Self {
        Self {
            transcriber,
            timeout,
            retry,
            confidence_floor: confidence_floor.clamp(0.0, 1.0),
        }
    }

    pub fn from_config(transcriber: Arc<dyn Transcriber>, config: &TranscriptionConfig) -> Self {
        Self::new(
            transcriber,
            Duration::from_millis(config.timeout_ms),
            config.retry_policy(),
            config.confidence_floor,
        )
    }

    pub fn backend(&self) -> &str {
        self.transcriber.name()
    }

    pub async fn transcribe(&self, utterance: &Utterance) -> Result<Transcript, TranscriptionError> {
        let wav = voxnav_audio::wav::encode_wav(&utterance.samples, utterance.sample_rate)
            .map_err(|e| TranscriptionError::Unintelligible(format!("audio could not be encoded: {}", e)))?;

        let recognition = self
            .retry
            .run(
                "transcription",
                |attempt| {
                    let wav = &wav;
                    async move {
                        debug!(utterance_id = %utterance.id, attempt, bytes = wav.len(), "Transcribing utterance");
                        match tokio::time::timeout(
                            self.timeout,
                            self.transcriber.transcribe(wav, utterance.sample_rate),
                        )
                        .await
                        {
                            Ok(result) => result,
                            Err(_) => Err(TranscriptionError::Timeout(format!(
                                "no answer within {}ms",
                                self.timeout.as_millis()
                            ))),
                        }
                    }
                },
                TranscriptionError::is_retryable,
            )
            .await?;

        let text = recognition.text.trim();
        if text.is_empty() {
            return Err(TranscriptionError::Unintelligible("empty transcript".to_string()));
        }
        let confidence = recognition.confidence.clamp(0.0, 1.0);
        if confidence < self.confidence_floor {
            return Err(TranscriptionError::Unintelligible(format!(
                "confidence {:.2} below floor {:.2}",
                confidence, self.confidence_floor
            )));
        }

        info!(
            utterance_id = %utterance.id,
            confidence,
            duration_ms = utterance.duration_ms(),
            "Utterance transcribed"
        );
        Ok(Transcript {
            text: text.to_string(),
            confidence,
            utterance_id: Some(utterance.id.clone()),
            language: recognition.language,
        })
    }
}
