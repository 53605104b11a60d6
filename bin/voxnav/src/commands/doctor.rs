use voxnav_browser::{list_available_browsers, BrowserEngine};
use voxnav_core::{Config, Paths};

#[derive(Default)]
struct Report {
    passed: u32,
    warnings: u32,
    errors: u32,
}

impl Report {
    fn ok(&mut self, label: &str, detail: &str) {
        self.passed += 1;
        if detail.is_empty() {
            println!("  ✅ {}", label);
        } else {
            println!("  ✅ {} - {}", label, detail);
        }
    }

    fn warn(&mut self, label: &str, hint: &str) {
        self.warnings += 1;
        if hint.is_empty() {
            println!("  ⚠️  {}", label);
        } else {
            println!("  ⚠️  {} - {}", label, hint);
        }
    }

    fn err(&mut self, label: &str, hint: &str) {
        self.errors += 1;
        if hint.is_empty() {
            println!("  ❌ {}", label);
        } else {
            println!("  ❌ {} - {}", label, hint);
        }
    }
}

/// Run environment diagnostics.
pub fn run(paths: &Paths) -> anyhow::Result<()> {
    println!();
    println!("🩺 voxnav doctor - Environment Diagnostics");
    println!("================================");
    println!();

    let mut report = Report::default();

    // --- 1. Config ---
    println!("📋 Configuration");
    let config_file = paths.config_file();
    if config_file.exists() {
        report.ok("Config file exists", &config_file.display().to_string());
    } else {
        report.warn("Config file not found", "Using defaults; run `voxnav config init` to create one");
    }
    let config = match Config::load_or_default(paths) {
        Ok(config) => {
            report.ok("Config is valid", "");
            config
        }
        Err(e) => {
            report.err("Config cannot be loaded", &e.to_string());
            Config::default()
        }
    };
    println!();

    // --- 2. Speech and reasoning ---
    println!("🎙️  Providers");
    if config.transcription_api_key().is_some() {
        report.ok("Transcription API key configured", &config.transcription.model);
    } else {
        report.err(
            "No transcription API key",
            &format!("Set transcription.apiKey or {}", voxnav_core::config::API_KEY_ENV),
        );
    }
    if !config.reasoning.enabled {
        report.warn("Reasoning fallback disabled", "Only built-in command phrases will be understood");
    } else if config.reasoning_api_key().is_some() {
        report.ok("Reasoning API key configured", &config.reasoning.model);
    } else {
        report.warn("No reasoning API key", "Commands outside the built-in grammar will be unsupported");
    }
    println!();

    // --- 3. Browser ---
    println!("🌐 Browser");
    let available = list_available_browsers();
    if let Some(path) = &config.automation.browser_path {
        if std::path::Path::new(path).exists() {
            report.ok("Configured browser binary", path);
        } else {
            report.err("Configured browser binary missing", path);
        }
    } else if let Some(name) = &config.automation.browser {
        match BrowserEngine::from_str(name) {
            Some(engine) => match available.iter().find(|(e, _)| *e == engine) {
                Some((_, path)) => report.ok(engine.name(), &path.display().to_string()),
                None => report.err(&format!("{} not installed", engine.name()), "Install it or unset automation.browser"),
            },
            None => report.err(&format!("Unknown browser '{}'", name), "Use chrome, edge or chromium"),
        }
    } else if available.is_empty() {
        report.err("No Chrome, Chromium or Edge installation found", "Install one of them to execute commands");
    } else {
        for (engine, path) in &available {
            report.ok(engine.name(), &path.display().to_string());
        }
    }
    println!(
        "  Headless: {}, step timeout {} ms, {} concurrent task(s)",
        config.automation.headless, config.automation.step_timeout_ms, config.automation.max_concurrent_tasks
    );
    println!();

    // --- 4. Storage ---
    println!("💾 Storage");
    let db = paths.db_file();
    if db.exists() {
        let size = std::fs::metadata(&db).map(|m| m.len()).unwrap_or(0);
        report.ok("Task database", &format!("{} ({} KB)", db.display(), size / 1024));
    } else {
        report.warn("Task database not created yet", "Will be created on first run");
    }
    if config.audio.save_utterances {
        let dir = config
            .audio
            .recordings_dir
            .as_ref()
            .map(std::path::PathBuf::from)
            .unwrap_or_else(|| paths.recordings_dir());
        report.ok("Utterances are archived", &dir.display().to_string());
    }
    println!();

    // --- 5. Gateway ---
    println!("🔌 Gateway");
    println!("  Bind address: {}:{}", config.gateway.host, config.gateway.port);
    if config.gateway.host != "127.0.0.1" && config.gateway.host != "localhost" {
        report.warn("Gateway is exposed beyond localhost", "The task API has no authentication");
    }
    println!();

    // --- Summary ---
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("  ✅ {} passed  ⚠️  {} warnings  ❌ {} errors", report.passed, report.warnings, report.errors);
    println!();
    if report.errors > 0 {
        println!("  {} error(s) must be fixed before normal use.", report.errors);
    } else if report.warnings > 0 {
        println!("  Core features OK. Some optional features not ready.");
    } else {
        println!("  🎉 All good!");
    }
    println!();

    Ok(())
}
