use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use voxnav_core::Config;

use crate::{ChatReasoner, Reasoner, Transcriber, WhisperTranscriber};

/// Build the speech-to-text collaborator from config.
pub fn create_transcriber(config: &Config) -> anyhow::Result<Arc<dyn Transcriber>> {
    let cfg = &config.transcription;
    let api_key = config.transcription_api_key().ok_or_else(|| {
        anyhow::anyhow!(
            "No transcription API key. Set transcription.apiKey in config.json or the {} environment variable.",
            voxnav_core::config::API_KEY_ENV
        )
    })?;
    info!(api_base = %cfg.api_base, model = %cfg.model, "Using transcription endpoint");
    Ok(Arc::new(WhisperTranscriber::new(
        &api_key,
        &cfg.api_base,
        &cfg.model,
        cfg.language.as_deref(),
        Duration::from_millis(cfg.timeout_ms),
        config.network.proxy.as_deref(),
        &config.network.no_proxy,
    )))
}

/// Build the reasoning collaborator, or `None` when it is disabled or has no key.
pub fn create_reasoner(config: &Config) -> Option<Arc<dyn Reasoner>> {
    let cfg = &config.reasoning;
    if !cfg.enabled {
        info!("Reasoning fallback disabled");
        return None;
    }
    let Some(api_key) = config.reasoning_api_key() else {
        warn!("No reasoning API key configured, commands outside the grammar will be unsupported");
        return None;
    };
    info!(api_base = %cfg.api_base, model = %cfg.model, "Using reasoning endpoint");
    Some(Arc::new(ChatReasoner::new(
        &api_key,
        &cfg.api_base,
        &cfg.model,
        cfg.temperature,
        Duration::from_millis(cfg.timeout_ms),
        config.network.proxy.as_deref(),
        &config.network.no_proxy,
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_reasoner() {
        let mut config = Config::default();
        config.reasoning.enabled = false;
        config.reasoning.api_key = "sk-test".into();
        assert!(create_reasoner(&config).is_none());
    }

    #[test]
    fn test_configured_collaborators() {
        let mut config = Config::default();
        config.transcription.api_key = "sk-test".into();
        let t = create_transcriber(&config).unwrap();
        assert_eq!(t.name(), "whisper");
        let r = create_reasoner(&config).unwrap();
        assert_eq!(r.name(), "openai-chat");
    }
}
