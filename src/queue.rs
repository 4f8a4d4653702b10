use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::Notify;
use tracing::debug;

/// Items that travel through a bridge queue. Audio frames may be dropped under pressure,
/// everything else is always delivered.
pub trait Frame {
    fn is_audio(&self) -> bool;
}

struct Inner<T> {
    items: VecDeque<T>,
    audio_len: usize,
    dropped: u64,
    closed: bool,
}

/// Bounded single-consumer queue sitting between a leg and its pump.
///
/// `push` never blocks: once `capacity` audio frames are waiting, the oldest queued audio
/// frame is discarded to make room. Control items do not count toward the bound and are
/// never discarded.
pub struct FrameQueue<T> {
    inner: Mutex<Inner<T>>,
    notify: Notify,
    capacity: usize,
}

impl<T: Frame> FrameQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::new(),
                audio_len: 0,
                dropped: 0,
                closed: false,
            }),
            notify: Notify::new(),
            capacity: capacity.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Returns `false` when the queue has been closed and the item was not accepted.
    pub fn push(&self, item: T) -> bool {
        let mut inner = self.lock();
        if inner.closed {
            return false;
        }
        if item.is_audio() {
            if inner.audio_len >= self.capacity {
                if let Some(oldest) = inner.items.iter().position(Frame::is_audio) {
                    inner.items.remove(oldest);
                    inner.audio_len -= 1;
                    inner.dropped += 1;
                    debug!(dropped = inner.dropped, "audio queue full, dropped oldest frame");
                }
            }
            inner.audio_len += 1;
        }
        inner.items.push_back(item);
        drop(inner);
        self.notify.notify_one();
        true
    }

    /// Next item in FIFO order; `None` once the queue is closed and drained.
    pub async fn pop(&self) -> Option<T> {
        loop {
            {
                let mut inner = self.lock();
                if let Some(item) = inner.items.pop_front() {
                    if item.is_audio() {
                        inner.audio_len -= 1;
                    }
                    return Some(item);
                }
                if inner.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Stop accepting items. Already queued items can still be popped.
    pub fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_one();
    }

    /// Drop every queued audio frame, keeping control items in order.
    pub fn discard_audio(&self) -> usize {
        let mut inner = self.lock();
        let before = inner.items.len();
        inner.items.retain(|item| !item.is_audio());
        inner.audio_len = 0;
        before - inner.items.len()
    }

    pub fn dropped(&self) -> u64 {
        self.lock().dropped
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    #[cfg(test)]
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}
