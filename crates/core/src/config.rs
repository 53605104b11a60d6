use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{Error, Result};
use crate::paths::Paths;
use crate::retry::RetryPolicy;

pub const API_KEY_ENV: &str = "OPENAI_API_KEY";

/// Upper bounds on the configurable retry counts.
pub const MAX_TRANSCRIPTION_RETRIES: u32 = 2;
pub const MAX_STEP_RETRIES: u32 = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioConfig {
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    #[serde(default = "default_channels")]
    pub channels: u16,
    #[serde(default = "default_frame_ms")]
    pub frame_ms: u32,
    /// Frames louder than this (dBFS) count as voice.
    #[serde(default = "default_threshold_db")]
    pub threshold_db: f32,
    #[serde(default = "default_start_frames")]
    pub start_frames: u32,
    #[serde(default = "default_end_frames")]
    pub end_frames: u32,
    #[serde(default = "default_min_utterance_ms")]
    pub min_utterance_ms: u64,
    #[serde(default = "default_max_utterance_ms")]
    pub max_utterance_ms: u64,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Archive every spoken command as a WAV file.
    #[serde(default)]
    pub save_utterances: bool,
    /// Archive directory; `~/.voxnav/recordings` when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recordings_dir: Option<String>,
}

fn default_sample_rate() -> u32 {
    16000
}

fn default_channels() -> u16 {
    1
}

fn default_frame_ms() -> u32 {
    20
}

fn default_threshold_db() -> f32 {
    -40.0
}

fn default_start_frames() -> u32 {
    3
}

fn default_end_frames() -> u32 {
    25
}

fn default_min_utterance_ms() -> u64 {
    400
}

fn default_max_utterance_ms() -> u64 {
    15000
}

fn default_queue_capacity() -> usize {
    8
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: default_sample_rate(),
            channels: default_channels(),
            frame_ms: default_frame_ms(),
            threshold_db: default_threshold_db(),
            start_frames: default_start_frames(),
            end_frames: default_end_frames(),
            min_utterance_ms: default_min_utterance_ms(),
            max_utterance_ms: default_max_utterance_ms(),
            queue_capacity: default_queue_capacity(),
            save_utterances: false,
            recordings_dir: None,
        }
    }
}

impl AudioConfig {
    pub fn frame_samples(&self) -> usize {
        (self.sample_rate as usize * self.frame_ms as usize) / 1000
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptionConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_openai_base")]
    pub api_base: String,
    #[serde(default = "default_transcription_model")]
    pub model: String,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default = "default_transcription_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_transcription_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_confidence_floor")]
    pub confidence_floor: f32,
}

fn default_openai_base() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_transcription_model() -> String {
    "whisper-1".to_string()
}

fn default_transcription_timeout_ms() -> u64 {
    10000
}

fn default_transcription_max_retries() -> u32 {
    2
}

fn default_retry_delay_ms() -> u64 {
    500
}

fn default_confidence_floor() -> f32 {
    0.4
}

impl Default for TranscriptionConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            api_base: default_openai_base(),
            model: default_transcription_model(),
            language: None,
            timeout_ms: default_transcription_timeout_ms(),
            max_retries: default_transcription_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            confidence_floor: default_confidence_floor(),
        }
    }
}

impl TranscriptionConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(self.max_retries, self.retry_delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReasoningConfig {
    /// Without a reasoning backend, commands outside the grammar are `unsupported`.
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_openai_base")]
    pub api_base: String,
    #[serde(default = "default_reasoning_model")]
    pub model: String,
    #[serde(default = "default_reasoning_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

fn default_true() -> bool {
    true
}

fn default_reasoning_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_reasoning_timeout_ms() -> u64 {
    15000
}

fn default_temperature() -> f32 {
    0.0
}

impl Default for ReasoningConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            api_key: String::new(),
            api_base: default_openai_base(),
            model: default_reasoning_model(),
            timeout_ms: default_reasoning_timeout_ms(),
            temperature: default_temperature(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutomationConfig {
    #[serde(default = "default_step_timeout_ms")]
    pub step_timeout_ms: u64,
    #[serde(default = "default_step_max_retries")]
    pub step_max_retries: u32,
    #[serde(default = "default_step_retry_delay_ms")]
    pub step_retry_delay_ms: u64,
    /// Upper bound accepted for a `wait` step.
    #[serde(default = "default_max_wait_ms")]
    pub max_wait_ms: u64,
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,
    #[serde(default = "default_task_queue_capacity")]
    pub task_queue_capacity: usize,
    #[serde(default = "default_true")]
    pub headless: bool,
    /// chrome | edge | chromium; auto-detected when unset.
    #[serde(default)]
    pub browser: Option<String>,
    #[serde(default)]
    pub browser_path: Option<String>,
}

fn default_step_timeout_ms() -> u64 {
    10000
}

fn default_step_max_retries() -> u32 {
    3
}

fn default_step_retry_delay_ms() -> u64 {
    500
}

fn default_max_wait_ms() -> u64 {
    60000
}

fn default_max_concurrent_tasks() -> usize {
    1
}

fn default_task_queue_capacity() -> usize {
    32
}

impl Default for AutomationConfig {
    fn default() -> Self {
        Self {
            step_timeout_ms: default_step_timeout_ms(),
            step_max_retries: default_step_max_retries(),
            step_retry_delay_ms: default_step_retry_delay_ms(),
            max_wait_ms: default_max_wait_ms(),
            max_concurrent_tasks: default_max_concurrent_tasks(),
            task_queue_capacity: default_task_queue_capacity(),
            headless: true,
            browser: None,
            browser_path: None,
        }
    }
}

impl AutomationConfig {
    pub fn step_retry_policy(&self) -> RetryPolicy {
        RetryPolicy::linear(self.step_max_retries, self.step_retry_delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    18890
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct NetworkConfig {
    /// Applied to every outbound HTTP call; falls back to HTTPS_PROXY / ALL_PROXY.
    #[serde(default)]
    pub proxy: Option<String>,
    #[serde(default)]
    pub no_proxy: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub audio: AudioConfig,
    #[serde(default)]
    pub transcription: TranscriptionConfig,
    #[serde(default)]
    pub reasoning: ReasoningConfig,
    #[serde(default)]
    pub automation: AutomationConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub network: NetworkConfig,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_or_default(paths: &Paths) -> Result<Self> {
        let config_path = paths.config_file();
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let a = &self.audio;
        if a.sample_rate == 0 || a.frame_ms == 0 || a.frame_samples() == 0 {
            return Err(Error::Config("audio.sampleRate and audio.frameMs must be positive".into()));
        }
        if a.channels != 1 {
            return Err(Error::Config(format!(
                "audio.channels must be 1 (mono), got {}",
                a.channels
            )));
        }
        if a.start_frames == 0 || a.end_frames == 0 {
            return Err(Error::Config("audio.startFrames and audio.endFrames must be at least 1".into()));
        }
        if a.max_utterance_ms <= a.min_utterance_ms {
            return Err(Error::Config("audio.maxUtteranceMs must exceed audio.minUtteranceMs".into()));
        }
        if a.queue_capacity == 0 {
            return Err(Error::Config("audio.queueCapacity must be at least 1".into()));
        }
        if !(0.0..=1.0).contains(&self.transcription.confidence_floor) {
            return Err(Error::Config("transcription.confidenceFloor must be within [0, 1]".into()));
        }
        if self.transcription.max_retries > MAX_TRANSCRIPTION_RETRIES {
            return Err(Error::Config(format!(
                "transcription.maxRetries must be at most {}",
                MAX_TRANSCRIPTION_RETRIES
            )));
        }
        if self.automation.step_max_retries > MAX_STEP_RETRIES {
            return Err(Error::Config(format!("automation.stepMaxRetries must be at most {}", MAX_STEP_RETRIES)));
        }
        if self.transcription.timeout_ms == 0 || self.reasoning.timeout_ms == 0 {
            return Err(Error::Config("timeouts must be positive".into()));
        }
        let auto = &self.automation;
        if auto.step_timeout_ms == 0 || auto.max_wait_ms == 0 {
            return Err(Error::Config("automation timeouts must be positive".into()));
        }
        if auto.max_concurrent_tasks == 0 || auto.task_queue_capacity == 0 {
            return Err(Error::Config(
                "automation.maxConcurrentTasks and automation.taskQueueCapacity must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Transcription key, falling back to `OPENAI_API_KEY`.
    pub fn transcription_api_key(&self) -> Option<String> {
        non_empty(&self.transcription.api_key).or_else(env_api_key)
    }

    /// Reasoning key, falling back to the transcription key and then `OPENAI_API_KEY`.
    pub fn reasoning_api_key(&self) -> Option<String> {
        non_empty(&self.reasoning.api_key)
            .or_else(|| non_empty(&self.transcription.api_key))
            .or_else(env_api_key)
    }
}

fn non_empty(s: &str) -> Option<String> {
    let s = s.trim();
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}

fn env_api_key() -> Option<String> {
    std::env::var(API_KEY_ENV).ok().and_then(|k| non_empty(&k))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.audio.sample_rate, 16000);
        assert_eq!(cfg.audio.frame_samples(), 320);
        assert_eq!(cfg.audio.start_frames, 3);
        assert_eq!(cfg.audio.end_frames, 25);
        assert_eq!(cfg.transcription.max_retries, 2);
        assert_eq!(cfg.automation.step_max_retries, 3);
        assert_eq!(cfg.automation.max_concurrent_tasks, 1);
        assert_eq!(cfg.automation.task_queue_capacity, 32);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let raw = r#"{
  "audio": { "endFrames": 10 },
  "transcription": { "apiKey": "sk-test", "language": "en" },
  "automation": { "maxConcurrentTasks": 2 }
}"#;
        let cfg: Config = serde_json::from_str(raw).unwrap();
        assert_eq!(cfg.audio.end_frames, 10);
        assert_eq!(cfg.audio.min_utterance_ms, 400);
        assert!(!cfg.audio.save_utterances);
        assert!(cfg.audio.recordings_dir.is_none());
        assert_eq!(cfg.transcription.language.as_deref(), Some("en"));
        assert_eq!(cfg.transcription_api_key().as_deref(), Some("sk-test"));
        assert_eq!(cfg.reasoning_api_key().as_deref(), Some("sk-test"));
        assert_eq!(cfg.automation.max_concurrent_tasks, 2);
        assert!(cfg.reasoning.enabled);
    }

    #[test]
    fn test_save_utterances_option() {
        let raw = r#"{ "audio": { "saveUtterances": true, "recordingsDir": "/tmp/voxnav-audio" } }"#;
        let cfg: Config = serde_json::from_str(raw).unwrap();
        assert!(cfg.audio.save_utterances);
        assert_eq!(cfg.audio.recordings_dir.as_deref(), Some("/tmp/voxnav-audio"));
        assert_eq!(cfg.audio.queue_capacity, 8);
    }

    #[test]
    fn test_validate_rejects_nonsense() {
        let mut cfg = Config::default();
        cfg.transcription.confidence_floor = 1.5;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.automation.max_concurrent_tasks = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.audio.channels = 2;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.transcription.max_retries = 3;
        assert!(cfg.validate().is_err());
        cfg.transcription.max_retries = 0;
        cfg.automation.step_max_retries = 4;
        assert!(cfg.validate().is_err());
        cfg.automation.step_max_retries = 1;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::with_base(dir.path().to_path_buf());
        let mut cfg = Config::default();
        cfg.gateway.port = 9999;
        cfg.save(&paths.config_file()).unwrap();

        let loaded = Config::load_or_default(&paths).unwrap();
        assert_eq!(loaded.gateway.port, 9999);
    }
}
