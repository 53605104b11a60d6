use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::Notify;
use tracing::warn;
use voxnav_core::types::Utterance;

struct Inner {
    items: VecDeque<Utterance>,
    closed: bool,
    dropped: u64,
}

/// Bounded hand-off between the segmenter and the transcription stage.
///
/// The producer never waits: when the queue is full the oldest pending
/// utterance is discarded so the freshest speech is always kept.
pub struct UtteranceQueue {
    inner: Mutex<Inner>,
    notify: Notify,
    capacity: usize,
}

impl UtteranceQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::with_capacity(capacity.max(1)),
                closed: false,
                dropped: 0,
            }),
            notify: Notify::new(),
            capacity: capacity.max(1),
        }
    }

    /// Enqueue an utterance, returning the one evicted to make room, if any.
    pub fn push(&self, utterance: Utterance) -> Option<Utterance> {
        let evicted = {
            let mut inner = self.lock();
            if inner.closed {
                return Some(utterance);
            }
            let evicted = if inner.items.len() >= self.capacity {
                inner.dropped += 1;
                inner.items.pop_front()
            } else {
                None
            };
            inner.items.push_back(utterance);
            evicted
        };
        if let Some(old) = &evicted {
            warn!(
                utterance_id = %old.id,
                capacity = self.capacity,
                "Utterance queue full, dropping oldest pending utterance"
            );
        }
        self.notify.notify_one();
        evicted
    }

    /// Wait for the next utterance; `None` once closed and drained.
    pub async fn pop(&self) -> Option<Utterance> {
        loop {
            {
                let mut inner = self.lock();
                if let Some(u) = inner.items.pop_front() {
                    return Some(u);
                }
                if inner.closed {
                    // Pass the wake-up on to any other waiter.
                    self.notify.notify_one();
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    pub fn try_pop(&self) -> Option<Utterance> {
        self.lock().items.pop_front()
    }

    pub fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dropped(&self) -> u64 {
        self.lock().dropped
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A panic while holding the lock cannot leave the deque inconsistent.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
