// Bounded FIFO queue for frames composed while the connection is down.

use std::collections::VecDeque;

use tandem_common::protocol::Envelope;

pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

/// Holds outbound frames until the connection reopens. Order is
/// preserved; a full queue rejects the frame instead of evicting.
#[derive(Debug)]
pub struct SendQueue {
    frames: VecDeque<Envelope>,
    capacity: usize,
}

impl SendQueue {
    pub fn new(capacity: usize) -> Self {
        Self { frames: VecDeque::new(), capacity }
    }

    /// Appends a frame, or returns it back to the caller when the queue
    /// is at capacity.
    pub fn enqueue(&mut self, frame: Envelope) -> Result<(), Envelope> {
        if self.frames.len() >= self.capacity {
            return Err(frame);
        }
        self.frames.push_back(frame);
        Ok(())
    }

    /// Removes and returns every queued frame in FIFO order.
    pub fn drain(&mut self) -> Vec<Envelope> {
        self.frames.drain(..).collect()
    }

    /// Puts drained frames back at the head, preserving their order.
    /// Used when a flush is interrupted mid-way; bypasses the capacity
    /// check so an interrupted flush never loses frames.
    pub fn requeue_front(&mut self, frames: Vec<Envelope>) {
        for frame in frames.into_iter().rev() {
            self.frames.push_front(frame);
        }
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for SendQueue {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

// ── Tests ───────────────────────────────────────────────────────────
