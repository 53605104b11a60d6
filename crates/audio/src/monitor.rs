use std::sync::{Mutex, MutexGuard};
use voxnav_core::types::CaptureStatus;

/// Shared view of a running capture loop, updated per frame by
/// [`run_capture`](crate::run_capture) and read by status endpoints.
#[derive(Default)]
pub struct CaptureMonitor {
    status: Mutex<CaptureStatus>,
}

impl CaptureMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, CaptureStatus> {
        self.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn status(&self) -> CaptureStatus {
        self.lock().clone()
    }

    pub(crate) fn started(&self) {
        let mut status = self.lock();
        status.active = true;
        status.speaking = false;
        status.level_db = None;
    }

    pub(crate) fn frame(&self, level_db: f32, speaking: bool) {
        let mut status = self.lock();
        status.level_db = Some(level_db);
        status.speaking = speaking;
    }

    pub(crate) fn utterance(&self, dropped: u64) {
        let mut status = self.lock();
        status.utterances += 1;
        status.dropped = dropped;
    }

    pub(crate) fn stopped(&self, dropped: u64) {
        let mut status = self.lock();
        status.active = false;
        status.speaking = false;
        status.level_db = None;
        status.dropped = dropped;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idle_until_started() {
        let monitor = CaptureMonitor::new();
        assert_eq!(monitor.status(), CaptureStatus::default());

        monitor.started();
        monitor.frame(-12.5, true);
        monitor.utterance(0);
        let live = monitor.status();
        assert!(live.active && live.speaking);
        assert_eq!(live.level_db, Some(-12.5));
        assert_eq!(live.utterances, 1);

        monitor.stopped(2);
        let done = monitor.status();
        assert!(!done.active);
        assert_eq!(done.level_db, None);
        assert_eq!(done.utterances, 1);
        assert_eq!(done.dropped, 2);
    }
}
