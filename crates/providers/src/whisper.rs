use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info, warn};
use voxnav_core::error::TranscriptionError;

use crate::client::build_http_client;
use crate::{Recognition, Transcriber};

/// OpenAI-compatible `/audio/transcriptions` client.
pub struct WhisperTranscriber {
    client: Client,
    api_key: String,
    api_base: String,
    model: String,
    language: Option<String>,
}

impl WhisperTranscriber {
    pub fn new(
        api_key: &str,
        api_base: &str,
        model: &str,
        language: Option<&str>,
        timeout: Duration,
        proxy: Option<&str>,
        no_proxy: &[String],
    ) -> Self {
        let api_base = api_base.trim_end_matches('/').to_string();
        let client = build_http_client(proxy, no_proxy, &api_base, timeout);
        Self {
            client,
            api_key: api_key.to_string(),
            api_base,
            model: model.to_string(),
            language: language.map(str::to_string),
        }
    }
}

#[derive(Debug, Deserialize)]
struct VerboseTranscription {
    #[serde(default)]
    text: String,
    #[serde(default)]
    language: Option<String>,
    #[serde(default)]
    segments: Vec<Segment>,
}

#[derive(Debug, Deserialize)]
struct Segment {
    #[serde(default)]
    start: f64,
    #[serde(default)]
    end: f64,
    #[serde(default)]
    avg_logprob: f64,
    #[serde(default)]
    no_speech_prob: f64,
}

/// Duration-weighted mean of `exp(avg_logprob) * (1 - no_speech_prob)`.
fn confidence_from_segments(segments: &[Segment]) -> Option<f32> {
    if segments.is_empty() {
        return None;
    }
    let mut weighted = 0.0;
    let mut total = 0.0;
    for s in segments {
        let weight = (s.end - s.start).max(0.01);
        let score = s.avg_logprob.exp() * (1.0 - s.no_speech_prob.clamp(0.0, 1.0));
        weighted += score.clamp(0.0, 1.0) * weight;
        total += weight;
    }
    Some((weighted / total).clamp(0.0, 1.0) as f32)
}

fn map_send_error(e: reqwest::Error) -> TranscriptionError {
    if e.is_timeout() {
        TranscriptionError::Timeout(e.to_string())
    } else {
        TranscriptionError::Unreachable(e.to_string())
    }
}

fn map_status(status: StatusCode, body: &str) -> TranscriptionError {
    let snippet: String = body.chars().take(300).collect();
    match status {
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => {
            TranscriptionError::Timeout(format!("{}: {}", status, snippet))
        }
        // The engine looked at the audio and refused it.
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
            TranscriptionError::Unintelligible(format!("{}: {}", status, snippet))
        }
        _ => TranscriptionError::Unreachable(format!("{}: {}", status, snippet)),
    }
}

fn parse_reply(body: &str) -> Result<Recognition, TranscriptionError> {
    let reply: VerboseTranscription = serde_json::from_str(body)
        .map_err(|e| TranscriptionError::Unreachable(format!("invalid transcription reply: {}", e)))?;
    let text = reply.text.trim().to_string();
    let confidence = confidence_from_segments(&reply.segments)
        .unwrap_or(if text.is_empty() { 0.0 } else { 1.0 });
    Ok(Recognition {
        text,
        confidence,
        language: reply.language,
    })
}

#[async_trait]
impl Transcriber for WhisperTranscriber {
    async fn transcribe(&self, wav: &[u8], sample_rate: u32) -> Result<Recognition, TranscriptionError> {
        let url = format!("{}/audio/transcriptions", self.api_base);
        let mut form = reqwest::multipart::Form::new()
            .text("model", self.model.clone())
            .text("response_format", "verbose_json");
        if let Some(lang) = &self.language {
            form = form.text("language", lang.clone());
        }
        let part = reqwest::multipart::Part::bytes(wav.to_vec())
            .file_name("utterance.wav")
            .mime_str("audio/wav")
            .map_err(|e| TranscriptionError::Unreachable(format!("failed to build request: {}", e)))?;
        form = form.part("file", part);

        debug!(url = %url, bytes = wav.len(), sample_rate, model = %self.model, "Calling transcription API");
        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .multipart(form)
            .send()
            .await
            .map_err(map_send_error)?;

        let status = response.status();
        let body = response.text().await.map_err(map_send_error)?;
        if !status.is_success() {
            warn!(status = %status, "Transcription API error");
            return Err(map_status(status, &body));
        }

        let recognition = parse_reply(&body)?;
        info!(chars = recognition.text.len(), confidence = recognition.confidence, "Transcription received");
        Ok(recognition)
    }

    fn name(&self) -> &str {
        "whisper"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{http::StatusCode as AxumStatus, routing::post, Json, Router};

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn transcriber(base: &str) -> WhisperTranscriber {
        WhisperTranscriber::new("sk-test", base, "whisper-1", Some("en"), Duration::from_secs(5), None, &[])
    }

    #[test]
    fn test_confidence_from_segments() {
        assert_eq!(confidence_from_segments(&[]), None);
        let segs = vec![
            Segment { start: 0.0, end: 1.0, avg_logprob: 0.0, no_speech_prob: 0.0 },
            Segment { start: 1.0, end: 2.0, avg_logprob: 0.0, no_speech_prob: 1.0 },
        ];
        let c = confidence_from_segments(&segs).unwrap();
        assert!((c - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_parse_reply_without_segments() {
        let r = parse_reply(r#"{"text": " go to example.com "}"#).unwrap();
        assert_eq!(r.text, "go to example.com");
        assert_eq!(r.confidence, 1.0);
        let r = parse_reply(r#"{"text": ""}"#).unwrap();
        assert_eq!(r.confidence, 0.0);
        assert!(matches!(parse_reply("<html>"), Err(TranscriptionError::Unreachable(_))));
    }

    #[test]
    fn test_status_mapping() {
        assert!(matches!(map_status(StatusCode::GATEWAY_TIMEOUT, ""), TranscriptionError::Timeout(_)));
        assert!(matches!(map_status(StatusCode::BAD_REQUEST, ""), TranscriptionError::Unintelligible(_)));
        assert!(matches!(map_status(StatusCode::SERVICE_UNAVAILABLE, ""), TranscriptionError::Unreachable(_)));
    }

    #[tokio::test]
    async fn test_transcribe_against_mock_endpoint() {
        let router = Router::new().route(
            "/v1/audio/transcriptions",
            post(|_body: axum::body::Bytes| async {
                Json(serde_json::json!({
                    "text": "click sign in",
                    "language": "english",
                    "segments": [{"start": 0.0, "end": 1.2, "avg_logprob": -0.1, "no_speech_prob": 0.01}]
                }))
            }),
        );
        let base = serve(router).await;
        let t = transcriber(&format!("{}/v1", base));
        let r = t.transcribe(b"RIFF....WAVE", 16000).await.unwrap();
        assert_eq!(r.text, "click sign in");
        assert!(r.confidence > 0.85 && r.confidence < 0.95);
        assert_eq!(r.language.as_deref(), Some("english"));
    }

    #[tokio::test]
    async fn test_server_error_is_unreachable() {
        let router = Router::new().route(
            "/audio/transcriptions",
            post(|_body: axum::body::Bytes| async { (AxumStatus::INTERNAL_SERVER_ERROR, "boom") }),
        );
        let base = serve(router).await;
        let err = transcriber(&base).transcribe(b"x", 16000).await.unwrap_err();
        assert!(matches!(err, TranscriptionError::Unreachable(_)));
        assert!(err.is_retryable());
    }
}
