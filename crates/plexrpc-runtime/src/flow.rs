//! Per-stream credit accounting.
//!
//! Each direction of a call has its own window. Only MESSAGE frames are
//! charged, at their full encoded length. The receiver hands credit back
//! as the application consumes messages, in CREDIT frames.

use plexrpc_core::Status;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FlowControlError {
    #[error("frame of {cost} bytes exceeds window ({outstanding} of {window} outstanding)")]
    WindowExceeded { cost: u32, outstanding: u32, window: u32 },

    #[error("credit of {increment} bytes exceeds the {outstanding} bytes outstanding")]
    ExcessCredit { increment: u32, outstanding: u32 },
}

impl From<FlowControlError> for Status {
    fn from(err: FlowControlError) -> Self {
        Status::flow_control_violation(err.to_string())
    }
}

/// Sender side: bytes emitted that the peer has not acknowledged yet.
#[derive(Debug, Clone)]
pub struct SendWindow {
    window: u32,
    outstanding: u32,
}

impl SendWindow {
    pub fn new(window: u32) -> Self {
        Self {
            window,
            outstanding: 0,
        }
    }

    pub fn outstanding(&self) -> u32 {
        self.outstanding
    }

    pub fn available(&self) -> u32 {
        self.window - self.outstanding
    }

    pub fn can_send(&self, cost: u32) -> bool {
        u64::from(self.outstanding) + u64::from(cost) <= u64::from(self.window)
    }

    /// Charges a frame about to be written.
    pub fn consume(&mut self, cost: u32) -> Result<(), FlowControlError> {
        if !self.can_send(cost) {
            return Err(FlowControlError::WindowExceeded {
                cost,
                outstanding: self.outstanding,
                window: self.window,
            });
        }
        self.outstanding += cost;
        Ok(())
    }

    /// Applies a CREDIT increment from the peer.
    pub fn release(&mut self, increment: u32) -> Result<(), FlowControlError> {
        if increment > self.outstanding {
            return Err(FlowControlError::ExcessCredit {
                increment,
                outstanding: self.outstanding,
            });
        }
        self.outstanding -= increment;
        Ok(())
    }
}

/// Receiver side: bytes received and not yet returned as credit.
#[derive(Debug, Clone)]
pub struct RecvWindow {
    window: u32,
    threshold: u32,
    unacked: u32,
    consumed: u32,
}

impl RecvWindow {
    pub fn new(window: u32) -> Self {
        Self {
            window,
            // half the window, but never zero so a tiny window still acks
            threshold: (window / 2).max(1),
            unacked: 0,
            consumed: 0,
        }
    }

    /// Bytes the peer may still send before it must wait.
    pub fn available(&self) -> u32 {
        self.window - self.unacked
    }

    /// Charges an arriving MESSAGE frame against the window.
    pub fn receive(&mut self, cost: u32) -> Result<(), FlowControlError> {
        if u64::from(self.unacked) + u64::from(cost) > u64::from(self.window) {
            return Err(FlowControlError::WindowExceeded {
                cost,
                outstanding: self.unacked,
                window: self.window,
            });
        }
        self.unacked += cost;
        Ok(())
    }

    /// Records that the application took a message off the queue.
    ///
    /// Returns the credit to send back, if one is due: once consumed bytes
    /// reach half the window, or whenever the queue has drained.
    pub fn consume(&mut self, cost: u32, queue_empty: bool) -> Option<u32> {
        self.consumed = (self.consumed + cost).min(self.unacked);
        if self.consumed == 0 || (self.consumed < self.threshold && !queue_empty) {
            return None;
        }
        let increment = self.consumed;
        self.unacked -= increment;
        self.consumed = 0;
        Some(increment)
    }
}
