//! Drop-oldest hand-off between the buffer path and the display
//!
//! The preview path is allowed to lose frames but never to stall the
//! encode path. Frames land in a small ring that overwrites the oldest
//! entry when the display lags, and the newest frame is always available
//! through a lock-free latest slot.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use bytes::Bytes;
use crossbeam::utils::CachePadded;
use ringbuf::traits::{Consumer, Observer, RingBuffer};
use ringbuf::HeapRb;

use crate::buffers::MediaBuffer;

/// Where a preview frame's pixels come from.
///
/// `Shared` is the low-latency shortcut: the display reads the live buffer
/// that has already been handed back to the remote, so a redraw racing a
/// refill can show a torn frame. That trade is deliberate; `Copied` is the
/// strict variant that snapshots before the buffer moves on.
#[derive(Clone)]
pub enum PreviewPayload {
    Copied(Bytes),
    Shared { buffer: Arc<MediaBuffer>, length: usize },
}

impl PreviewPayload {
    /// Materialize the pixels. For `Shared` this reads whatever is in the
    /// buffer right now.
    pub fn bytes(&self) -> Bytes {
        match self {
            PreviewPayload::Copied(bytes) => bytes.clone(),
            PreviewPayload::Shared { buffer, length } => {
                let data = buffer.data();
                let end = (*length).min(data.bytes.len());
                Bytes::copy_from_slice(&data.bytes[..end])
            }
        }
    }

    pub fn len(&self) -> usize {
        match self {
            PreviewPayload::Copied(bytes) => bytes.len(),
            PreviewPayload::Shared { length, .. } => *length,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One frame offered to the display.
#[derive(Clone)]
pub struct PreviewFrame {
    pub sequence: u64,
    pub pts: i64,
    pub payload: PreviewPayload,
}

#[derive(Default)]
struct PreviewStats {
    queued: AtomicU64,
    dropped: AtomicU64,
}

/// Ring of pending preview frames plus the always-current latest slot.
pub struct PreviewQueue {
    ring: HeapRb<PreviewFrame>,
    latest: ArcSwapOption<PreviewFrame>,
    stats: CachePadded<PreviewStats>,
}

impl PreviewQueue {
    pub fn new(capacity: usize) -> Self {
        PreviewQueue {
            ring: HeapRb::new(capacity.max(1)),
            latest: ArcSwapOption::empty(),
            stats: CachePadded::new(PreviewStats::default()),
        }
    }

    /// Producer: queue a frame, dropping the oldest when full.
    pub fn push(&mut self, frame: PreviewFrame) {
        if self.ring.is_full() {
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("vclink_preview_dropped").increment(1);
        }
        self.latest.store(Some(Arc::new(frame.clone())));
        self.ring.push_overwrite(frame);
        self.stats.queued.fetch_add(1, Ordering::Relaxed);
    }

    /// Consumer: oldest still-queued frame.
    pub fn pop(&mut self) -> Option<PreviewFrame> {
        self.ring.try_pop()
    }

    /// Lock-free view of the newest frame, independent of the ring.
    pub fn latest(&self) -> Option<Arc<PreviewFrame>> {
        self.latest.load_full()
    }

    pub fn len(&self) -> usize {
        self.ring.occupied_len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    /// (queued, dropped) counters.
    pub fn stats(&self) -> (u64, u64) {
        (
            self.stats.queued.load(Ordering::Relaxed),
            self.stats.dropped.load(Ordering::Relaxed),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(sequence: u64) -> PreviewFrame {
        PreviewFrame {
            sequence,
            pts: sequence as i64 * 33_000,
            payload: PreviewPayload::Copied(Bytes::from(vec![sequence as u8; 16])),
        }
    }

    #[test]
    fn overflow_drops_the_oldest() {
        let mut queue = PreviewQueue::new(2);
        for seq in 0..5 {
            queue.push(frame(seq));
        }
        let (queued, dropped) = queue.stats();
        assert_eq!(queued, 5);
        assert_eq!(dropped, 3);
        assert_eq!(queue.pop().unwrap().sequence, 3);
        assert_eq!(queue.pop().unwrap().sequence, 4);
        assert!(queue.pop().is_none());
    }

    #[test]
    fn latest_tracks_the_newest_frame() {
        let mut queue = PreviewQueue::new(2);
        assert!(queue.latest().is_none());
        for seq in 0..4 {
            queue.push(frame(seq));
        }
        assert_eq!(queue.latest().unwrap().sequence, 3);
    }
}
