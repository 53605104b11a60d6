use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct Paths {
    pub base: PathBuf,
}

impl Paths {
    pub fn new() -> Self {
        let base = dirs::home_dir()
            .map(|h| h.join(".voxnav"))
            .unwrap_or_else(|| PathBuf::from(".voxnav"));
        Self { base }
    }

    pub fn with_base(base: PathBuf) -> Self {
        Self { base }
    }

    pub fn config_file(&self) -> PathBuf {
        self.base.join("config.json")
    }

    pub fn db_file(&self) -> PathBuf {
        self.base.join("voxnav.db")
    }

    /// Scratch profiles for launched browsers, one per task.
    pub fn browser_dir(&self) -> PathBuf {
        self.base.join("browser")
    }

    /// Default archive for saved utterance audio.
    pub fn recordings_dir(&self) -> PathBuf {
        self.base.join("recordings")
    }

    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.base)?;
        std::fs::create_dir_all(self.browser_dir())?;
        Ok(())
    }
}

impl Default for Paths {
    fn default() -> Self {
        Self::new()
    }
}
