use tracing::debug;
use voxnav_core::config::AudioConfig;
use voxnav_core::types::{samples_to_ms, Utterance};

use crate::level::{rms_dbfs, SILENCE_FLOOR_DB};
use crate::vad::{EnergyVad, VoiceActivity};

#[derive(Debug, Clone)]
pub struct SegmenterConfig {
    pub sample_rate: u32,
    /// Consecutive active frames that open an utterance.
    pub start_frames: u32,
    /// Consecutive silent frames that close it.
    pub end_frames: u32,
    pub min_utterance_ms: u64,
    pub max_utterance_ms: u64,
}

impl From<&AudioConfig> for SegmenterConfig {
    fn from(cfg: &AudioConfig) -> Self {
        Self {
            sample_rate: cfg.sample_rate,
            start_frames: cfg.start_frames.max(1),
            end_frames: cfg.end_frames.max(1),
            min_utterance_ms: cfg.min_utterance_ms,
            max_utterance_ms: cfg.max_utterance_ms,
        }
    }
}

enum State {
    Silent {
        /// The current run of active frames that has not yet opened an utterance.
        onset: Vec<i16>,
        run: u32,
    },
    Speaking {
        samples: Vec<i16>,
        start_sample: u64,
        silent_run: u32,
        /// Length of `samples` at the end of the last active frame.
        voiced_len: usize,
    },
}

impl State {
    fn silent() -> Self {
        State::Silent { onset: Vec::new(), run: 0 }
    }
}

/// Turns a stream of fixed-size PCM frames into utterances.
///
/// `push` never blocks and never allocates more than the longest allowed
/// utterance; emitted utterances are at least `min_utterance_ms` long.
pub struct Segmenter<V: VoiceActivity = EnergyVad> {
    config: SegmenterConfig,
    vad: V,
    state: State,
    /// Samples consumed since the last reset.
    clock: u64,
    level_db: f32,
}

impl Segmenter<EnergyVad> {
    pub fn from_audio_config(cfg: &AudioConfig) -> Self {
        Self::new(SegmenterConfig::from(cfg), EnergyVad::new(cfg.threshold_db))
    }
}

impl<V: VoiceActivity> Segmenter<V> {
    pub fn new(config: SegmenterConfig, vad: V) -> Self {
        Self {
            config,
            vad,
            state: State::silent(),
            clock: 0,
            level_db: SILENCE_FLOOR_DB,
        }
    }

    /// RMS level of the most recent frame, in dBFS.
    pub fn audio_level(&self) -> f32 {
        self.level_db
    }

    pub fn is_speaking(&self) -> bool {
        matches!(self.state, State::Speaking { .. })
    }

    pub fn elapsed_ms(&self) -> u64 {
        samples_to_ms(self.clock as usize, self.config.sample_rate)
    }

    pub fn push(&mut self, frame: &[i16]) -> Option<Utterance> {
        if frame.is_empty() {
            return None;
        }
        self.level_db = rms_dbfs(frame);
        let active = self.vad.is_active(frame);
        let frame_start = self.clock;
        self.clock += frame.len() as u64;

        match &mut self.state {
            State::Silent { onset, run } => {
                if !active {
                    onset.clear();
                    *run = 0;
                    return None;
                }
                onset.extend_from_slice(frame);
                *run += 1;
                if *run < self.config.start_frames {
                    return None;
                }
                let samples = std::mem::take(onset);
                let start_sample = frame_start + frame.len() as u64 - samples.len() as u64;
                debug!(start_ms = samples_to_ms(start_sample as usize, self.config.sample_rate), "Speech started");
                let voiced_len = samples.len();
                self.state = State::Speaking {
                    samples,
                    start_sample,
                    silent_run: 0,
                    voiced_len,
                };
                self.close_if_too_long()
            }
            State::Speaking { samples, silent_run, voiced_len, .. } => {
                samples.extend_from_slice(frame);
                if active {
                    *silent_run = 0;
                    *voiced_len = samples.len();
                } else {
                    *silent_run += 1;
                }
                if *silent_run >= self.config.end_frames {
                    return self.finish();
                }
                self.close_if_too_long()
            }
        }
    }

    /// Close any in-progress utterance, e.g. at end of stream.
    pub fn flush(&mut self) -> Option<Utterance> {
        if self.is_speaking() {
            self.finish()
        } else {
            self.state = State::silent();
            None
        }
    }

    /// Drop all buffered audio and restart the clock.
    pub fn reset(&mut self) {
        self.state = State::silent();
        self.clock = 0;
        self.level_db = SILENCE_FLOOR_DB;
    }

    fn close_if_too_long(&mut self) -> Option<Utterance> {
        if let State::Speaking { samples, .. } = &self.state {
            let ms = samples_to_ms(samples.len(), self.config.sample_rate);
            if ms >= self.config.max_utterance_ms {
                debug!(duration_ms = ms, "Utterance reached maximum length");
                return self.finish();
            }
        }
        None
    }

    fn finish(&mut self) -> Option<Utterance> {
        let State::Speaking { mut samples, start_sample, voiced_len, .. } =
            std::mem::replace(&mut self.state, State::silent())
        else {
            return None;
        };
        samples.truncate(voiced_len);
        let duration_ms = samples_to_ms(samples.len(), self.config.sample_rate);
        if duration_ms < self.config.min_utterance_ms {
            debug!(duration_ms, min_ms = self.config.min_utterance_ms, "Discarding short utterance");
            return None;
        }
        let start_ms = samples_to_ms(start_sample as usize, self.config.sample_rate);
        Some(Utterance::new(samples, self.config.sample_rate, start_ms))
    }
}
