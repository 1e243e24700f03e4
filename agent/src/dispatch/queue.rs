//! Bounded per-session outbound queues.
//!
//! Every session writes its frames here and a drain task forwards them to
//! the channel, so a slow wire never blocks a session worker beyond its
//! own queue. The overflow policy is kind-dependent: interactive video
//! keeps only the freshest frames, everything else applies backpressure.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use sentinel_core::frames::Frame;
use tokio::sync::Notify;

/// What happens when a `push` finds the queue full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Wait for the drain task to make room (terminal, file browser).
    Block,
    /// Discard the oldest queued frame; latest frame wins (remote desktop).
    DropOldest,
}

/// The queue was closed; the frame was not accepted.
#[derive(Debug, thiserror::Error)]
#[error("session outbound queue closed")]
pub struct QueueClosed;

struct QueueState {
    buf: VecDeque<Frame>,
    closed: bool,
}

struct Inner {
    capacity: usize,
    policy: OverflowPolicy,
    state: Mutex<QueueState>,
    readable: Notify,
    writable: Notify,
}

/// A bounded MPSC frame queue with a pluggable overflow policy.
#[derive(Clone)]
pub struct FrameQueue {
    inner: Arc<Inner>,
}

impl FrameQueue {
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        assert!(capacity > 0);
        Self {
            inner: Arc::new(Inner {
                capacity,
                policy,
                state: Mutex::new(QueueState {
                    buf: VecDeque::with_capacity(capacity),
                    closed: false,
                }),
                readable: Notify::new(),
                writable: Notify::new(),
            }),
        }
    }

    /// Enqueue a frame according to the overflow policy.
    pub async fn push(&self, frame: Frame) -> Result<(), QueueClosed> {
        let mut frame = Some(frame);
        loop {
            {
                let mut state = self.inner.state.lock().expect("queue lock poisoned");
                if state.closed {
                    return Err(QueueClosed);
                }
                if state.buf.len() < self.inner.capacity {
                    state.buf.push_back(frame.take().expect("frame consumed twice"));
                    self.inner.readable.notify_one();
                    return Ok(());
                }
                if self.inner.policy == OverflowPolicy::DropOldest {
                    state.buf.pop_front();
                    state.buf.push_back(frame.take().expect("frame consumed twice"));
                    self.inner.readable.notify_one();
                    return Ok(());
                }
            }
            self.inner.writable.notified().await;
        }
    }

    /// Dequeue the next frame. After `close`, remaining frames are still
    /// delivered; `None` only once the queue is closed **and** empty.
    pub async fn pop(&self) -> Option<Frame> {
        loop {
            {
                let mut state = self.inner.state.lock().expect("queue lock poisoned");
                if let Some(frame) = state.buf.pop_front() {
                    self.inner.writable.notify_one();
                    return Some(frame);
                }
                if state.closed {
                    return None;
                }
            }
            self.inner.readable.notified().await;
        }
    }

    /// Close the queue. Pending frames remain poppable; further pushes fail.
    pub fn close(&self) {
        let mut state = self.inner.state.lock().expect("queue lock poisoned");
        state.closed = true;
        // notify_waiters wakes parked tasks; the extra notify_one stores a
        // permit for a task that checked state but has not parked yet.
        self.inner.readable.notify_waiters();
        self.inner.readable.notify_one();
        self.inner.writable.notify_waiters();
        self.inner.writable.notify_one();
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.inner.state.lock().unwrap().buf.len()
    }
}
