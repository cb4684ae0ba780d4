//! Bounded frame queues with a drop-oldest overflow policy
//!
//! Live voice prefers freshness over completeness: when a queue is full the
//! oldest frame is evicted to make room, and the playback side waits only a
//! short bounded interval before falling through to silence.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::constants::POP_TIMEOUT_MS;

/// One block of mono S16LE PCM at the device rate
#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub samples: Vec<i16>,
    /// Sender-assigned sequence number
    pub sequence: u32,
    /// Acquisition time on the local steady clock
    pub timestamp: Instant,
}

impl AudioFrame {
    pub fn new(samples: Vec<i16>, sequence: u32) -> Self {
        Self {
            samples,
            sequence,
            timestamp: Instant::now(),
        }
    }

    /// Frame duration at the given sample rate
    pub fn duration(&self, sample_rate: u32) -> Duration {
        Duration::from_micros(self.samples.len() as u64 * 1_000_000 / sample_rate as u64)
    }
}

struct Inner<T> {
    queue: std::collections::VecDeque<T>,
    pushed: u64,
    popped: u64,
    dropped: u64,
}

/// Bounded FIFO shared between one producer and one consumer thread
///
/// `push` never blocks; `pop_timeout` blocks at most the configured wait so
/// the consuming loop can fall through instead of stalling.
pub struct FrameBuffer<T> {
    inner: Mutex<Inner<T>>,
    available: Condvar,
    capacity: usize,
}

impl<T> FrameBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "capacity must be non-zero");
        Self {
            inner: Mutex::new(Inner {
                queue: std::collections::VecDeque::with_capacity(capacity),
                pushed: 0,
                popped: 0,
                dropped: 0,
            }),
            available: Condvar::new(),
            capacity,
        }
    }

    /// Enqueue an item, evicting the oldest one when full
    ///
    /// Returns true unconditionally; drops are observable via [`dropped`].
    ///
    /// [`dropped`]: FrameBuffer::dropped
    pub fn push(&self, item: T) -> bool {
        let mut inner = self.inner.lock();
        if inner.queue.len() >= self.capacity {
            inner.queue.pop_front();
            inner.dropped += 1;
        }
        inner.queue.push_back(item);
        inner.pushed += 1;
        drop(inner);
        self.available.notify_one();
        true
    }

    /// Dequeue immediately; `None` when empty
    pub fn pop(&self) -> Option<T> {
        let mut inner = self.inner.lock();
        let item = inner.queue.pop_front();
        if item.is_some() {
            inner.popped += 1;
        }
        item
    }

    /// Dequeue, waiting up to `timeout` for an item to arrive
    pub fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        // Re-check after every wakeup: a spurious wakeup must not cut the
        // wait short while time remains.
        while inner.queue.is_empty() {
            if self.available.wait_until(&mut inner, deadline).timed_out() {
                break;
            }
        }
        let item = inner.queue.pop_front();
        if item.is_some() {
            inner.popped += 1;
        }
        item
    }

    /// Dequeue with the default bounded wait
    pub fn pop_wait(&self) -> Option<T> {
        self.pop_timeout(Duration::from_millis(POP_TIMEOUT_MS))
    }

    pub fn len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().queue.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Frames evicted by the drop-oldest policy
    pub fn dropped(&self) -> u64 {
        self.inner.lock().dropped
    }

    /// Total frames ever enqueued
    pub fn pushed(&self) -> u64 {
        self.inner.lock().pushed
    }

    /// Total frames ever dequeued
    pub fn popped(&self) -> u64 {
        self.inner.lock().popped
    }

    /// Discard all queued items
    pub fn clear(&self) {
        self.inner.lock().queue.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;

    #[test]
    fn fifo_order() {
        let buffer = FrameBuffer::new(4);
        buffer.push(AudioFrame::new(vec![0; 480], 0));
        buffer.push(AudioFrame::new(vec![1; 480], 1));
        assert_eq!(buffer.len(), 2);

        assert_eq!(buffer.pop().unwrap().sequence, 0);
        assert_eq!(buffer.pop().unwrap().sequence, 1);
        assert!(buffer.is_empty());
        assert!(buffer.pop().is_none());
    }

    #[test]
    fn drop_oldest_under_burst() {
        // Capacity 4, ten pushes, no pops: the four newest survive.
        let buffer = FrameBuffer::new(4);
        for seq in 0..10u32 {
            buffer.push(AudioFrame::new(Vec::new(), seq));
        }
        assert_eq!(buffer.len(), 4);
        assert_eq!(buffer.dropped(), 6);
        for expected in [6, 7, 8, 9] {
            assert_eq!(buffer.pop().unwrap().sequence, expected);
        }
    }

    #[test]
    fn size_bound_and_accounting_hold() {
        let buffer = FrameBuffer::new(3);
        for seq in 0..20u32 {
            buffer.push(AudioFrame::new(Vec::new(), seq));
            assert!(buffer.len() <= 3);
            if seq % 3 == 0 {
                buffer.pop();
            }
            let balance = buffer.pushed() - buffer.popped() - buffer.dropped();
            assert_eq!(balance as usize, buffer.len());
        }
    }

    #[test]
    fn pop_timeout_returns_none_when_starved() {
        let buffer: FrameBuffer<AudioFrame> = FrameBuffer::new(4);
        let start = Instant::now();
        assert!(buffer.pop_timeout(Duration::from_millis(10)).is_none());
        let waited = start.elapsed();
        assert!(waited >= Duration::from_millis(10));
        assert!(waited < Duration::from_millis(200));
    }

    #[test]
    fn pop_timeout_wakes_on_push() {
        let buffer = Arc::new(FrameBuffer::new(4));
        let producer = buffer.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(5));
            producer.push(AudioFrame::new(vec![7; 4], 42));
        });
        let frame = buffer.pop_timeout(Duration::from_millis(500));
        handle.join().unwrap();
        assert_eq!(frame.unwrap().sequence, 42);
    }

    #[test]
    fn frame_duration() {
        let frame = AudioFrame::new(vec![0; 960], 0);
        assert_eq!(frame.duration(48_000), Duration::from_millis(20));
    }

    #[test]
    fn clear_discards_everything() {
        let buffer = FrameBuffer::new(4);
        buffer.push(AudioFrame::new(Vec::new(), 0));
        buffer.push(AudioFrame::new(Vec::new(), 1));
        buffer.clear();
        assert!(buffer.is_empty());
    }
}
