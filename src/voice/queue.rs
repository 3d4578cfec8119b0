//! Bounded frame queue between the capture thread and the control loop
//!
//! Pushing never blocks: when the queue is full the oldest frame is dropped
//! and counted, keeping the detector fed with the most recent audio.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;

use super::frame::AudioFrame;
use crate::{Error, Result};

struct Inner {
    frames: VecDeque<AudioFrame>,
    fault: Option<String>,
    closed: bool,
}

struct Shared {
    inner: Mutex<Inner>,
    notify: Notify,
    capacity: usize,
    senders: AtomicUsize,
    dropped: Arc<AtomicU64>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Producer side, owned by the frame source
pub struct FrameSender {
    shared: Arc<Shared>,
}

/// Consumer side, owned by the control loop
pub struct FrameReceiver {
    shared: Arc<Shared>,
}

/// Create a bounded frame queue
///
/// Dropped frames are added to `dropped`, which outlives individual queues so
/// the count survives capture restarts.
#[must_use]
pub fn frame_queue(capacity: usize, dropped: Arc<AtomicU64>) -> (FrameSender, FrameReceiver) {
    let capacity = capacity.max(1);
    let shared = Arc::new(Shared {
        inner: Mutex::new(Inner {
            frames: VecDeque::with_capacity(capacity),
            fault: None,
            closed: false,
        }),
        notify: Notify::new(),
        capacity,
        senders: AtomicUsize::new(1),
        dropped,
    });

    (
        FrameSender {
            shared: Arc::clone(&shared),
        },
        FrameReceiver { shared },
    )
}

impl FrameSender {
    /// Push a frame, evicting the oldest one if the queue is full
    ///
    /// Returns `false` if a frame had to be dropped. Safe to call from an
    /// audio callback.
    pub fn push(&self, frame: AudioFrame) -> bool {
        let evicted = {
            let mut inner = self.shared.lock();
            let evicted = if inner.frames.len() >= self.shared.capacity {
                inner.frames.pop_front().is_some()
            } else {
                false
            };
            inner.frames.push_back(frame);
            evicted
        };

        if evicted {
            self.shared.dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.shared.notify.notify_one();
        !evicted
    }

    /// Report a device failure to the consumer
    pub fn fault(&self, message: impl Into<String>) {
        let message = message.into();
        {
            let mut inner = self.shared.lock();
            if inner.fault.is_none() {
                inner.fault = Some(message);
            }
        }
        self.shared.notify.notify_one();
    }
}

impl Clone for FrameSender {
    fn clone(&self) -> Self {
        self.shared.senders.fetch_add(1, Ordering::AcqRel);
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl Drop for FrameSender {
    fn drop(&mut self) {
        if self.shared.senders.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.shared.lock().closed = true;
            self.shared.notify.notify_one();
        }
    }
}

impl FrameReceiver {
    /// Wait for the next frame
    ///
    /// Queued frames are delivered before a fault or close is reported.
    ///
    /// # Errors
    ///
    /// Returns `Error::DeviceUnavailable` once the source has faulted or all
    /// senders are gone
    pub async fn recv(&self) -> Result<AudioFrame> {
        loop {
            let notified = self.shared.notify.notified();
            {
                let mut inner = self.shared.lock();
                if let Some(frame) = inner.frames.pop_front() {
                    return Ok(frame);
                }
                if let Some(fault) = &inner.fault {
                    return Err(Error::DeviceUnavailable(fault.clone()));
                }
                if inner.closed {
                    return Err(Error::DeviceUnavailable(
                        "audio capture stopped".to_string(),
                    ));
                }
            }
            notified.await;
        }
    }

    /// Frames currently waiting
    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.lock().frames.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total frames dropped on overflow
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }
}
