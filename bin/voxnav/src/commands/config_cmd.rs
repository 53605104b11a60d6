use voxnav_core::{Config, Paths};

/// Show the effective configuration as pretty-printed JSON. API keys are masked.
pub fn show(paths: &Paths) -> anyhow::Result<()> {
    let config = Config::load_or_default(paths)?;
    let mut json = serde_json::to_value(&config)?;
    for section in ["transcription", "reasoning"] {
        if let Some(key) = json.pointer_mut(&format!("/{}/apiKey", section)) {
            if let Some(raw) = key.as_str() {
                *key = serde_json::Value::String(mask(raw));
            }
        }
    }

    println!();
    println!("📋 Current Configuration");
    println!("  File: {}", paths.config_file().display());
    if !paths.config_file().exists() {
        println!("  (not created yet, showing defaults; run `voxnav config init`)");
    }
    println!();
    println!("{}", serde_json::to_string_pretty(&json)?);
    Ok(())
}

/// Write a default config file.
pub fn init(paths: &Paths, force: bool) -> anyhow::Result<()> {
    let path = paths.config_file();
    if path.exists() && !force {
        println!("Config already exists at {}", path.display());
        println!("Use --force to overwrite it with defaults.");
        return Ok(());
    }
    Config::default().save(&path)?;
    paths.ensure_dirs()?;
    println!("✓ Wrote default configuration to {}", path.display());
    println!("  Set transcription.apiKey (or {}) before using voice input.", voxnav_core::config::API_KEY_ENV);
    Ok(())
}

fn mask(key: &str) -> String {
    if key.is_empty() {
        return String::new();
    }
    let visible: String = key.chars().take(4).collect();
    format!("{}…", visible)
}
