use std::io::Cursor;
use std::path::Path;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use voxnav_core::error::Result;

use crate::monitor::CaptureMonitor;
use crate::queue::UtteranceQueue;
use crate::segmenter::Segmenter;
use crate::vad::VoiceActivity;

/// Reads raw little-endian PCM16 mono audio in fixed-size frames.
pub struct PcmFrameReader<R> {
    reader: R,
    frame_samples: usize,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> PcmFrameReader<R> {
    pub fn new(reader: R, frame_samples: usize) -> Self {
        let frame_samples = frame_samples.max(1);
        Self {
            reader,
            frame_samples,
            buf: vec![0; frame_samples * 2],
        }
    }

    /// Next frame, or `None` at end of stream. The final frame may be short.
    pub async fn next_frame(&mut self) -> Result<Option<Vec<i16>>> {
        let mut filled = 0;
        while filled < self.buf.len() {
            let n = self.reader.read(&mut self.buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        let usable = filled - filled % 2;
        if usable == 0 {
            return Ok(None);
        }
        let frame = self.buf[..usable]
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect();
        Ok(Some(frame))
    }

    pub fn frame_samples(&self) -> usize {
        self.frame_samples
    }
}

impl PcmFrameReader<Cursor<Vec<u8>>> {
    pub fn from_samples(samples: &[i16], frame_samples: usize) -> Self {
        let bytes = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
        Self::new(Cursor::new(bytes), frame_samples)
    }

    /// Frames of a WAV file, together with the file's sample rate.
    pub fn from_wav(path: &Path, frame_samples: usize) -> Result<(Self, u32)> {
        let (samples, rate) = crate::wav::read_wav(path)?;
        Ok((Self::from_samples(&samples, frame_samples), rate))
    }
}

/// Pump frames through the segmenter into the queue until the source ends or
/// `cancel` fires. The queue is closed on exit and `monitor` tracks the live
/// level and counts. Returns the number of utterances produced.
pub async fn run_capture<R, V>(
    mut reader: PcmFrameReader<R>,
    segmenter: &mut Segmenter<V>,
    queue: &UtteranceQueue,
    monitor: &CaptureMonitor,
    cancel: &CancellationToken,
) -> Result<u64>
where
    R: AsyncRead + Unpin,
    V: VoiceActivity,
{
    let mut produced = 0u64;
    monitor.started();
    let outcome = loop {
        let frame = tokio::select! {
            () = cancel.cancelled() => break Ok(()),
            frame = reader.next_frame() => frame,
        };
        match frame {
            Ok(Some(frame)) => {
                let utterance = segmenter.push(&frame);
                monitor.frame(segmenter.audio_level(), segmenter.is_speaking());
                if let Some(u) = utterance {
                    info!(utterance_id = %u.id, start_ms = u.start_ms, duration_ms = u.duration_ms(), "Utterance captured");
                    queue.push(u);
                    monitor.utterance(queue.dropped());
                    produced += 1;
                }
            }
            Ok(None) => {
                if let Some(u) = segmenter.flush() {
                    info!(utterance_id = %u.id, duration_ms = u.duration_ms(), "Utterance captured at end of stream");
                    queue.push(u);
                    monitor.utterance(queue.dropped());
                    produced += 1;
                }
                debug!(elapsed_ms = segmenter.elapsed_ms(), "Audio source ended");
                break Ok(());
            }
            Err(e) => break Err(e),
        }
    };
    queue.close();
    monitor.stopped(queue.dropped());
    outcome.map(|_| produced)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segmenter::SegmenterConfig;
    use crate::vad::EnergyVad;

    fn speech_then_silence() -> Vec<i16> {
        let mut samples = vec![0i16; 320 * 5];
        samples.extend((0..320 * 40).map(|i| if i % 2 == 0 { 9000i16 } else { -9000 }));
        samples.extend(vec![0i16; 320 * 30]);
        samples
    }

    #[tokio::test]
    async fn test_reader_frames_and_short_tail() {
        let mut reader = PcmFrameReader::from_samples(&[1, 2, 3, 4, 5], 2);
        assert_eq!(reader.next_frame().await.unwrap(), Some(vec![1, 2]));
        assert_eq!(reader.next_frame().await.unwrap(), Some(vec![3, 4]));
        assert_eq!(reader.next_frame().await.unwrap(), Some(vec![5]));
        assert_eq!(reader.next_frame().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_run_capture_fills_queue_and_closes() {
        let reader = PcmFrameReader::from_samples(&speech_then_silence(), 320);
        let mut seg = Segmenter::new(
            SegmenterConfig {
                sample_rate: 16000,
                start_frames: 3,
                end_frames: 25,
                min_utterance_ms: 400,
                max_utterance_ms: 15000,
            },
            EnergyVad::new(-40.0),
        );
        let queue = UtteranceQueue::new(8);
        let monitor = CaptureMonitor::new();
        let n = run_capture(reader, &mut seg, &queue, &monitor, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(n, 1);
        let status = monitor.status();
        assert!(!status.active);
        assert_eq!(status.utterances, 1);
        assert_eq!(status.dropped, 0);
        let u = queue.pop().await.unwrap();
        assert_eq!(u.start_ms, 100);
        assert_eq!(u.duration_ms(), 800);
        assert!(queue.pop().await.is_none());
    }

    #[tokio::test]
    async fn test_wav_source() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cmd.wav");
        crate::wav::write_wav(&path, &speech_then_silence(), 16000).unwrap();
        let (mut reader, rate) = PcmFrameReader::from_wav(&path, 320).unwrap();
        assert_eq!(rate, 16000);
        let mut frames = 0;
        while reader.next_frame().await.unwrap().is_some() {
            frames += 1;
        }
        assert_eq!(frames, 75);
    }
}
