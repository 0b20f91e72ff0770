//! Single-slot handoff between the delivery thread and the processing loop.
//!
//! The slot holds at most one not-yet-processed frame. A newly published
//! frame replaces an unread one rather than queueing behind it; the displaced
//! buffer is handed back to the caller for immediate recycling. This is the
//! drop-oldest policy that keeps the consumer on the most recent frame with
//! bounded memory.
//!
//! All access is serialized by one mutex/condvar pair. `publish` never blocks
//! on the consumer; `take_blocking` is the only suspension point in the
//! pipeline.

use std::sync::{Condvar, Mutex};

use crate::pool::FrameBuffer;

struct SlotState {
    pending: Option<FrameBuffer>,
    active: bool,
}

/// Mailbox holding the latest pending frame.
pub struct PendingSlot {
    state: Mutex<SlotState>,
    available: Condvar,
}

impl PendingSlot {
    /// Creates an inactive slot. `set_active(true)` arms it for a session.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SlotState {
                pending: None,
                active: false,
            }),
            available: Condvar::new(),
        }
    }

    /// Marks the slot active or inactive and wakes any blocked taker.
    /// Deactivation is the termination signal for the processing loop.
    pub fn set_active(&self, active: bool) {
        if let Ok(mut state) = self.state.lock() {
            state.active = active;
        }
        self.available.notify_all();
    }

    /// Stores `buffer` as the pending frame, returning the unread frame it
    /// displaces, if any. The caller must recycle the displaced buffer; it
    /// will never reach the processing loop.
    ///
    /// Non-blocking and O(1); safe to call from the capture delivery thread
    /// regardless of what the consumer is doing.
    pub fn publish(&self, buffer: FrameBuffer) -> Option<FrameBuffer> {
        let Ok(mut state) = self.state.lock() else {
            // A poisoned slot means the session is tearing down; hand the
            // frame back so it is not leaked.
            return Some(buffer);
        };
        let displaced = state.pending.replace(buffer);
        self.available.notify_all();
        displaced
    }

    /// Blocks until a frame is pending or the slot is deactivated.
    ///
    /// Returns `None` once the slot has been signaled inactive, even if a
    /// frame arrived in the meantime; shutdown wins over a late frame. A
    /// poisoned lock during the wait is likewise treated as termination.
    pub fn take_blocking(&self) -> Option<FrameBuffer> {
        let mut state = self.state.lock().ok()?;
        while state.active && state.pending.is_none() {
            state = self.available.wait(state).ok()?;
        }
        if !state.active {
            return None;
        }
        state.pending.take()
    }

    /// Removes and returns the pending frame without blocking. Used when
    /// draining the slot after the processing loop has exited.
    pub fn clear(&self) -> Option<FrameBuffer> {
        self.state.lock().ok()?.pending.take()
    }
}

impl Default for PendingSlot {
    fn default() -> Self {
        Self::new()
    }
}
