use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncRead;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use voxnav_audio::{run_capture, CaptureMonitor, PcmFrameReader, Segmenter, UtteranceQueue};
use voxnav_core::config::AudioConfig;
use voxnav_core::Paths;

use super::app::{self, Role, SHUTDOWN_GRACE};
use super::gateway::{router, GatewayState};

const CLEANUP_INTERVAL: Duration = Duration::from_secs(600);
const FINISHED_TASK_TTL: Duration = Duration::from_secs(3600);

fn spawn_capture<R>(
    reader: R,
    audio: &AudioConfig,
    queue: Arc<UtteranceQueue>,
    monitor: Arc<CaptureMonitor>,
    cancel: CancellationToken,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let reader = PcmFrameReader::new(reader, audio.frame_samples());
    let mut segmenter = Segmenter::from_audio_config(audio);
    tokio::spawn(async move {
        match run_capture(reader, &mut segmenter, &queue, &monitor, &cancel).await {
            Ok(produced) => info!(produced, dropped = queue.dropped(), "Audio capture finished"),
            Err(e) => error!(error = %e, "Audio capture failed"),
        }
    })
}

/// Run the agent until Ctrl-C.
pub async fn run(paths: &Paths, input: Option<String>, host: Option<String>, port: Option<u16>) -> anyhow::Result<()> {
    let app = app::build(paths, Role::Service, input.is_some())?;
    let orchestrator = app.orchestrator.clone();
    let cancel = CancellationToken::new();
    let mut background = Vec::new();
    let mut capture_monitor = None;

    if let Some(input) = input {
        let audio = &app.config.audio;
        let queue = Arc::new(UtteranceQueue::new(audio.queue_capacity));
        let monitor = Arc::new(CaptureMonitor::new());
        capture_monitor = Some(monitor.clone());
        let capture = if input == "-" {
            info!(sample_rate = audio.sample_rate, frame_ms = audio.frame_ms, "Listening on stdin");
            spawn_capture(tokio::io::stdin(), audio, queue.clone(), monitor, cancel.clone())
        } else {
            let file = tokio::fs::File::open(&input)
                .await
                .map_err(|e| anyhow::anyhow!("Cannot open audio input '{}': {}", input, e))?;
            info!(path = %input, sample_rate = audio.sample_rate, "Reading audio from file");
            spawn_capture(file, audio, queue.clone(), monitor, cancel.clone())
        };
        background.push(capture);

        let orch = orchestrator.clone();
        background.push(tokio::spawn(async move {
            orch.run_pipeline(&queue).await;
        }));
    }

    let orch = orchestrator.clone();
    let cleanup_cancel = cancel.clone();
    background.push(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(CLEANUP_INTERVAL);
        ticker.tick().await;
        loop {
            tokio::select! {
                () = cleanup_cancel.cancelled() => break,
                _ = ticker.tick() => {
                    orch.cleanup_finished(FINISHED_TASK_TTL);
                }
            }
        }
    }));

    let host = host.unwrap_or_else(|| app.config.gateway.host.clone());
    let port = port.unwrap_or(app.config.gateway.port);
    let bind_addr = format!("{}:{}", host, port);
    let state = GatewayState {
        orchestrator: orchestrator.clone(),
        store: app.store.clone(),
        capture: capture_monitor,
        started: Instant::now(),
    };
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(addr = %bind_addr, "Task gateway listening");

    let server_cancel = cancel.clone();
    let server = tokio::spawn(async move {
        axum::serve(listener, router(state))
            .with_graceful_shutdown(async move { server_cancel.cancelled().await })
            .await
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, draining tasks...");
    cancel.cancel();
    orchestrator.shutdown(SHUTDOWN_GRACE).await;

    for handle in background {
        if tokio::time::timeout(SHUTDOWN_GRACE, handle).await.is_err() {
            warn!("Background task did not stop in time");
        }
    }
    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "Gateway stopped with an error"),
        Err(e) => warn!(error = %e, "Gateway task panicked"),
    }
    info!("voxnav stopped");
    Ok(())
}
