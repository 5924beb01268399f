//! Per-connection inbound message queue
//!
//! Pushes come from the channel's receive context and never block. Pops come
//! from client tasks and may wait for data, for the connection to fail, or
//! for an interrupt.

use crate::error::{OffloadError, Result};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::futures::Notified;
use tokio::sync::Notify;

/// Interrupt line shared by a connection's blocking calls.
///
/// Every raise bumps a counter, so a call that captured [`Interrupt::epoch`]
/// when it started still sees a raise that landed before it began waiting.
#[derive(Debug, Default)]
pub struct Interrupt {
    raised: AtomicU64,
    notify: Notify,
}

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    /// Interrupt every call started before now
    pub fn raise(&self) {
        self.raised.fetch_add(1, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn epoch(&self) -> u64 {
        self.raised.load(Ordering::SeqCst)
    }

    /// Whether a raise happened after `epoch` was captured
    pub fn raised_since(&self, epoch: u64) -> bool {
        self.epoch() != epoch
    }

    /// Wakeup for the next raise; enable it before checking `raised_since`
    pub fn notified(&self) -> Notified<'_> {
        self.notify.notified()
    }
}

#[derive(Debug, Default)]
struct QueueState {
    messages: VecDeque<Vec<u8>>,
    failed: bool,
}

/// Blocking delivery queue
#[derive(Debug, Default)]
pub struct DeliveryQueue {
    state: Mutex<QueueState>,
    readable: Notify,
}

impl DeliveryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append a message and wake readers
    pub fn push(&self, message: Vec<u8>) {
        self.lock().messages.push_back(message);
        self.readable.notify_waiters();
    }

    /// Mark the owning connection failed and wake every reader
    pub fn fail(&self) {
        self.lock().failed = true;
        self.readable.notify_waiters();
    }

    /// Dequeue without waiting
    pub fn try_pop(&self) -> Option<Vec<u8>> {
        self.lock().messages.pop_front()
    }

    /// Dequeue one message.
    ///
    /// Queued messages are handed out first. An empty queue fails with
    /// `WouldBlock` when `blocking` is false, otherwise waits until a message
    /// arrives (`Ok`), the connection fails (`ConnectionFailed`) or
    /// `interrupt` is raised past `epoch` (`Interrupted`, nothing consumed).
    pub async fn pop(
        &self,
        blocking: bool,
        interrupt: &Interrupt,
        epoch: u64,
    ) -> Result<Vec<u8>> {
        loop {
            let readable = self.readable.notified();
            let interrupted = interrupt.notified();
            tokio::pin!(readable, interrupted);
            readable.as_mut().enable();
            interrupted.as_mut().enable();

            {
                let mut state = self.lock();
                if let Some(message) = state.messages.pop_front() {
                    return Ok(message);
                }
                if state.failed {
                    return Err(OffloadError::ConnectionFailed);
                }
            }

            if !blocking {
                return Err(OffloadError::WouldBlock);
            }
            if interrupt.raised_since(epoch) {
                return Err(OffloadError::Interrupted);
            }

            tokio::select! {
                _ = &mut readable => continue,
                _ = &mut interrupted => return Err(OffloadError::Interrupted),
            }
        }
    }

    pub fn len(&self) -> usize {
        self.lock().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().messages.is_empty()
    }

    pub fn is_failed(&self) -> bool {
        self.lock().failed
    }
}
