//! Session Outbox
//!
//! Bounded frame queue between a room actor and one session's transport
//! writer. Transient frames (cursor, typing, chat) may be evicted when the
//! queue is full; a critical frame that cannot be queued is the signal to
//! close that session. The queue is FIFO, so broadcasts reach each peer in
//! the order the actor produced them.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::protocol::{ErrorKind, FrameClass, ServerFrame};

/// Result of offering a frame to the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// Queued after evicting a transient frame, or the transient frame
    /// itself was dropped; either way the drop counter advanced
    EvictedTransient,
    /// Critical frame and the queue holds only critical frames
    RejectedFull,
}

/// What the writer receives next
#[derive(Debug)]
pub enum Popped {
    Frame(ServerFrame),
    /// Queue drained and closed; an error kind means the close is fatal
    /// and the writer should deliver it before hanging up
    Closed(Option<ErrorKind>),
}

#[derive(Debug, Default)]
struct Queue {
    frames: VecDeque<ServerFrame>,
    dropped: u64,
    closed: bool,
    close_reason: Option<ErrorKind>,
}

#[derive(Debug)]
struct Shared {
    queue: Mutex<Queue>,
    notify: Notify,
    capacity: usize,
}

/// Bounded per-session outbound frame queue
#[derive(Debug, Clone)]
pub struct Outbox {
    shared: Arc<Shared>,
}

impl Outbox {
    pub fn new(capacity: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                queue: Mutex::new(Queue::default()),
                notify: Notify::new(),
                capacity: capacity.max(1),
            }),
        }
    }

    /// Offer a frame. Never blocks: full queues shed transient frames,
    /// oldest first, and report `RejectedFull` when nothing sheddable
    /// remains for a critical frame.
    pub fn push(&self, frame: ServerFrame) -> PushOutcome {
        let outcome = {
            let mut queue = self.shared.queue.lock();
            if queue.closed {
                // writer is gone; drop silently
                return PushOutcome::Queued;
            }
            if queue.frames.len() < self.shared.capacity {
                queue.frames.push_back(frame);
                PushOutcome::Queued
            } else if let Some(evictable) = queue
                .frames
                .iter()
                .position(|f| f.class() == FrameClass::Transient)
            {
                queue.frames.remove(evictable);
                queue.dropped += 1;
                queue.frames.push_back(frame);
                PushOutcome::EvictedTransient
            } else if frame.class() == FrameClass::Transient {
                queue.dropped += 1;
                PushOutcome::EvictedTransient
            } else {
                PushOutcome::RejectedFull
            }
        };
        if outcome != PushOutcome::RejectedFull {
            self.shared.notify.notify_one();
        }
        outcome
    }

    /// Await the next frame; resolves to `Closed` once the queue is both
    /// drained and closed.
    pub async fn pop(&self) -> Popped {
        loop {
            {
                let mut queue = self.shared.queue.lock();
                if let Some(frame) = queue.frames.pop_front() {
                    return Popped::Frame(frame);
                }
                if queue.closed {
                    return Popped::Closed(queue.close_reason);
                }
            }
            self.shared.notify.notified().await;
        }
    }

    /// Close the queue. Frames already queued are still delivered; the
    /// first close reason wins and later calls are no-ops.
    pub fn close(&self, reason: Option<ErrorKind>) {
        {
            let mut queue = self.shared.queue.lock();
            if queue.closed {
                return;
            }
            queue.closed = true;
            queue.close_reason = reason;
        }
        self.shared.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.queue.lock().closed
    }

    /// Drain the dropped-transient counter.
    pub fn take_dropped(&self) -> u64 {
        let mut queue = self.shared.queue.lock();
        std::mem::take(&mut queue.dropped)
    }

    pub fn len(&self) -> usize {
        self.shared.queue.lock().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
