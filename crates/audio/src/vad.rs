use crate::level::rms_dbfs;

/// Per-frame voice activity decision.
///
/// The segmenter only needs a yes/no signal per frame; hysteresis lives in
/// the segmenter so detectors stay stateless where they can.
pub trait VoiceActivity: Send {
    fn is_active(&mut self, frame: &[i16]) -> bool;
}

/// Frames whose RMS level reaches `threshold_db` count as voice.
#[derive(Debug, Clone, Copy)]
pub struct EnergyVad {
    threshold_db: f32,
}

impl EnergyVad {
    pub fn new(threshold_db: f32) -> Self {
        Self { threshold_db }
    }

    pub fn threshold_db(&self) -> f32 {
        self.threshold_db
    }
}

impl VoiceActivity for EnergyVad {
    fn is_active(&mut self, frame: &[i16]) -> bool {
        rms_dbfs(frame) >= self.threshold_db
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_threshold() {
        let mut vad = EnergyVad::new(-40.0);
        assert!(!vad.is_active(&[0; 320]));
        assert!(!vad.is_active(&[10; 320]));
        assert!(vad.is_active(&[8000; 320]));
    }
}
