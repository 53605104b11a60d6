use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use voxnav_agent::{Executor, IntentParser, Orchestrator, TaskRegistry, TranscriptionAdapter};
use voxnav_audio::UtteranceArchive;
use voxnav_browser::{ChromeDriver, DriverConfig};
use voxnav_core::{Config, Paths};
use voxnav_providers::factory::{create_reasoner, create_transcriber};
use voxnav_storage::{TaskRecorder, TaskStore};

/// Grace period for in-flight tasks when the process stops.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(15);

/// Everything a running agent needs, wired from config.
pub struct App {
    pub config: Config,
    pub store: Arc<TaskStore>,
    pub orchestrator: Arc<Orchestrator>,
}

/// How the process relates to the shared task history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Long-running agent; on start it owns the history and closes out tasks
    /// a previous agent left unfinished.
    Service,
    /// `run` / `say`: may share the database with a live service, so it never
    /// touches rows it did not create.
    OneShot,
}

/// Build the agent. With `needs_voice` a missing transcription backend is an
/// error; otherwise voice input is simply disabled.
pub fn build(paths: &Paths, role: Role, needs_voice: bool) -> anyhow::Result<App> {
    let config = Config::load_or_default(paths)?;
    paths.ensure_dirs()?;

    let store = Arc::new(TaskStore::open(&paths.db_file())?);
    if role == Role::Service {
        let interrupted = store.abort_interrupted()?;
        if interrupted > 0 {
            warn!(interrupted, "Tasks from a previous run were marked aborted");
        }
    }

    let transcription = match create_transcriber(&config) {
        Ok(transcriber) => Some(TranscriptionAdapter::from_config(transcriber, &config.transcription)),
        Err(e) if needs_voice => return Err(e),
        Err(e) => {
            warn!(error = %e, "Voice commands disabled");
            None
        }
    };
    let archive = config.audio.save_utterances.then(|| {
        let dir = config.audio.recordings_dir.as_ref().map(PathBuf::from).unwrap_or_else(|| paths.recordings_dir());
        info!(dir = %dir.display(), "Saving utterances");
        UtteranceArchive::new(dir)
    });
    let parser = IntentParser::standard(create_reasoner(&config), &config.reasoning, &config.automation);
    let driver = Arc::new(ChromeDriver::new(DriverConfig::from_automation(
        &config.automation,
        paths.browser_dir(),
    )));
    let executor = Executor::from_config(driver, &config.automation);

    let recorder: Arc<dyn TaskRecorder> = store.clone();
    let registry = Arc::new(TaskRegistry::new(Some(recorder)));
    info!(sources = ?parser.source_names(), db = %paths.db_file().display(), "Agent ready");
    let orchestrator = Arc::new(Orchestrator::start(
        registry,
        transcription,
        archive,
        parser,
        executor,
        &config.automation,
    ));

    Ok(App { config, store, orchestrator })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use voxnav_core::types::{Task, TaskSource, TaskStage, TaskState};

    #[tokio::test]
    async fn test_one_shot_leaves_other_process_tasks_alone() {
        let dir = TempDir::new().unwrap();
        let paths = Paths::with_base(dir.path().to_path_buf());
        paths.ensure_dirs().unwrap();

        // A running service holds its own connection to the same file.
        let service_store = TaskStore::open(&paths.db_file()).unwrap();
        let mut live = Task::new(TaskSource::Voice);
        live.state = TaskState::Executing;
        live.stage = TaskStage::Executing;
        service_store.save_task(&live).unwrap();

        let one_shot = build(&paths, Role::OneShot, false).unwrap();
        let seen = one_shot.store.get_task(&live.id).unwrap().unwrap();
        assert_eq!(seen.state, TaskState::Executing);
        assert_eq!(service_store.get_task(&live.id).unwrap().unwrap().state, TaskState::Executing);
        one_shot.orchestrator.shutdown(Duration::from_secs(1)).await;

        let service = build(&paths, Role::Service, false).unwrap();
        assert_eq!(service_store.get_task(&live.id).unwrap().unwrap().state, TaskState::Aborted);
        service.orchestrator.shutdown(Duration::from_secs(1)).await;
    }
}
