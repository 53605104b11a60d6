//! Audio capture side of the agent: frame sources, voice activity detection
//! and segmentation of a continuous PCM stream into discrete utterances.

pub mod archive;
pub mod level;
pub mod monitor;
pub mod queue;
pub mod segmenter;
pub mod source;
pub mod vad;
pub mod wav;

pub use archive::UtteranceArchive;
pub use level::{rms, rms_dbfs, SILENCE_FLOOR_DB};
pub use monitor::CaptureMonitor;
pub use queue::UtteranceQueue;
pub use segmenter::{Segmenter, SegmenterConfig};
pub use source::{run_capture, PcmFrameReader};
pub use vad::{EnergyVad, VoiceActivity};
