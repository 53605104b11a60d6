use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};
use voxnav_audio::{PcmFrameReader, Segmenter};
use voxnav_core::types::TaskState;
use voxnav_core::Paths;

use super::app::{self, App, Role, SHUTDOWN_GRACE};
use super::tasks_cmd::print_task;

/// Upper bound on how long a one-shot command may take end to end.
const TASK_DEADLINE: Duration = Duration::from_secs(600);

async fn finish(app: &App, ids: &[String]) -> anyhow::Result<()> {
    let mut failed = 0;
    for id in ids {
        let Some(task) = app.orchestrator.wait_for(id, TASK_DEADLINE).await else {
            continue;
        };
        print_task(&task);
        if task.state != TaskState::Succeeded {
            failed += 1;
        }
    }
    app.orchestrator.shutdown(SHUTDOWN_GRACE).await;
    if failed > 0 {
        anyhow::bail!("{} of {} task(s) did not succeed", failed, ids.len());
    }
    Ok(())
}

/// Segment a WAV file and run every utterance in it, in order.
pub async fn wav(paths: &Paths, path: &Path) -> anyhow::Result<()> {
    let app = app::build(paths, Role::OneShot, true)?;
    let audio = &app.config.audio;
    let (mut reader, rate) = PcmFrameReader::from_wav(path, audio.frame_samples())?;
    if rate != audio.sample_rate {
        anyhow::bail!(
            "{} is sampled at {} Hz but audio.sampleRate is {} Hz",
            path.display(),
            rate,
            audio.sample_rate
        );
    }

    let mut segmenter = Segmenter::from_audio_config(audio);
    let mut ids = Vec::new();
    while let Some(frame) = reader.next_frame().await? {
        if let Some(utterance) = segmenter.push(&frame) {
            ids.push(app.orchestrator.submit_utterance_waiting(utterance).await);
        }
    }
    if let Some(utterance) = segmenter.flush() {
        ids.push(app.orchestrator.submit_utterance_waiting(utterance).await);
    }

    if ids.is_empty() {
        warn!(path = %path.display(), "No speech found in recording");
        app.orchestrator.shutdown(SHUTDOWN_GRACE).await;
        return Ok(());
    }
    info!(utterances = ids.len(), "Recording segmented");
    finish(&app, &ids).await
}

/// Run one typed command.
pub async fn say(paths: &Paths, text: &str) -> anyhow::Result<()> {
    let app = app::build(paths, Role::OneShot, false)?;
    let id = app.orchestrator.submit_text(text);
    finish(&app, &[id]).await
}
