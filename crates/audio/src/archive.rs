use chrono::Utc;
use std::path::{Path, PathBuf};
use tracing::debug;
use voxnav_core::types::Utterance;
use voxnav_core::Result;

use crate::wav::write_wav;

/// Directory of saved utterances, one WAV file each.
#[derive(Debug, Clone)]
pub struct UtteranceArchive {
    dir: PathBuf,
}

impl UtteranceArchive {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write `utterance_<utc timestamp>_<id prefix>.wav` and return its path.
    pub fn save(&self, utterance: &Utterance) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.dir)?;
        let short_id: String = utterance.id.chars().take(8).collect();
        let name = format!("utterance_{}_{}.wav", Utc::now().format("%Y%m%d_%H%M%S%3f"), short_id);
        let path = self.dir.join(name);
        write_wav(&path, &utterance.samples, utterance.sample_rate)?;
        debug!(path = %path.display(), duration_ms = utterance.duration_ms(), "Utterance archived");
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wav::read_wav;

    #[test]
    fn test_save_creates_dir_and_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let archive = UtteranceArchive::new(dir.path().join("recordings"));
        let utterance = Utterance::new(vec![100, -100, 2000, -2000], 16000, 0);

        let path = archive.save(&utterance).unwrap();
        assert!(path.starts_with(archive.dir()));
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("utterance_") && name.ends_with(".wav"));
        assert!(name.contains(&utterance.id[..8]));

        let (samples, rate) = read_wav(&path).unwrap();
        assert_eq!(rate, 16000);
        assert_eq!(samples, utterance.samples);
    }
}
