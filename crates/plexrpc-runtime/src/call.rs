//! Per-call lifecycle state machine.
//!
//! [`CallState`] is pure bookkeeping owned by the connection coordinator. It
//! tracks which headers and half-closes have happened in each direction and
//! how many messages crossed, and rejects transitions that the call pattern
//! or the current phase forbid. Every transition validates before it
//! mutates, so a rejected operation leaves the state untouched.

use std::fmt;

use plexrpc_core::{CallPattern, Status};

use crate::error::CallError;

/// Which end of a call this state belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Client,
    Server,
}

impl Side {
    /// First stream id this side allocates; clients use odd ids, servers even.
    pub(crate) fn first_stream_id(self) -> u32 {
        match self {
            Self::Client => 1,
            Self::Server => 2,
        }
    }

    /// Whether `id` was allocated by this side.
    pub(crate) fn owns(self, id: u32) -> bool {
        id != 0 && (id % 2 == 1) == (self == Self::Client)
    }

    pub fn peer(self) -> Self {
        match self {
            Self::Client => Self::Server,
            Self::Server => Self::Client,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Client => "client",
            Self::Server => "server",
        })
    }
}

/// Message direction relative to the local end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outbound,
    Inbound,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Outbound => "outbound",
            Self::Inbound => "inbound",
        })
    }
}

/// Observable phase of a call. Phases only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallPhase {
    Created,
    HeadersSent,
    Open,
    HalfClosedLocal,
    HalfClosedRemote,
    Closed,
    Cancelled,
}

impl CallPhase {
    fn rank(self) -> u8 {
        match self {
            Self::Created => 0,
            Self::HeadersSent => 1,
            Self::Open => 2,
            Self::HalfClosedLocal | Self::HalfClosedRemote => 3,
            Self::Closed | Self::Cancelled => 4,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Cancelled)
    }
}

#[derive(Debug, Clone)]
pub struct CallState {
    side: Side,
    pattern: CallPattern,
    local_header: bool,
    remote_header: bool,
    local_closed: bool,
    remote_closed: bool,
    cancelled: bool,
    sent: usize,
    received: usize,
    phase: CallPhase,
}

impl CallState {
    /// State of a call this end initiates.
    pub fn client(pattern: CallPattern) -> Self {
        Self::new(Side::Client, pattern)
    }

    /// State of a call created by the peer's HEADER.
    pub fn server(pattern: CallPattern) -> Self {
        let mut state = Self::new(Side::Server, pattern);
        state.remote_header = true;
        state.advance();
        state
    }

    fn new(side: Side, pattern: CallPattern) -> Self {
        Self {
            side,
            pattern,
            local_header: false,
            remote_header: false,
            local_closed: false,
            remote_closed: false,
            cancelled: false,
            sent: 0,
            received: 0,
            phase: CallPhase::Created,
        }
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn pattern(&self) -> CallPattern {
        self.pattern
    }

    pub fn phase(&self) -> CallPhase {
        self.phase
    }

    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }

    pub fn local_header_sent(&self) -> bool {
        self.local_header
    }

    pub fn is_local_closed(&self) -> bool {
        self.local_closed
    }

    pub fn messages_sent(&self) -> usize {
        self.sent
    }

    pub fn messages_received(&self) -> usize {
        self.received
    }

    /// Outbound direction carries exactly one message.
    fn single_outbound(&self) -> bool {
        match self.side {
            Side::Client => !self.pattern.client_streaming(),
            Side::Server => !self.pattern.server_streaming(),
        }
    }

    /// Inbound direction carries exactly one message.
    fn single_inbound(&self) -> bool {
        match self.side {
            Side::Client => !self.pattern.server_streaming(),
            Side::Server => !self.pattern.client_streaming(),
        }
    }

    fn derive_phase(&self) -> CallPhase {
        if self.cancelled {
            CallPhase::Cancelled
        } else if self.local_closed && self.remote_closed {
            CallPhase::Closed
        } else if self.local_closed {
            CallPhase::HalfClosedLocal
        } else if self.remote_closed {
            CallPhase::HalfClosedRemote
        } else if self.local_header && self.remote_header {
            CallPhase::Open
        } else if self.local_header || self.remote_header {
            CallPhase::HeadersSent
        } else {
            CallPhase::Created
        }
    }

    fn advance(&mut self) {
        let next = self.derive_phase();
        debug_assert!(
            next.rank() >= self.phase.rank(),
            "call phase regressed from {:?} to {next:?}",
            self.phase
        );
        self.phase = next;
    }

    fn check_live(&self) -> Result<(), CallError> {
        if self.is_terminal() {
            return Err(CallError::Terminated);
        }
        Ok(())
    }

    pub fn send_header(&mut self) -> Result<(), CallError> {
        self.check_live()?;
        if self.local_header {
            return Err(CallError::HeaderAlreadySent);
        }
        self.local_header = true;
        self.advance();
        Ok(())
    }

    pub fn recv_header(&mut self) -> Result<(), CallError> {
        self.check_live()?;
        if self.remote_header {
            return Err(CallError::HeaderAlreadySent);
        }
        self.remote_header = true;
        self.advance();
        Ok(())
    }

    pub fn send_message(&mut self) -> Result<(), CallError> {
        self.check_live()?;
        if self.local_closed {
            return Err(CallError::AlreadyClosed(Direction::Outbound));
        }
        if !self.local_header {
            return Err(CallError::HeaderNotSent(Direction::Outbound));
        }
        if self.single_outbound() && self.sent == 1 {
            return Err(CallError::TooManyMessages {
                pattern: self.pattern,
                direction: Direction::Outbound,
            });
        }
        self.sent += 1;
        Ok(())
    }

    pub fn recv_message(&mut self) -> Result<(), CallError> {
        self.check_live()?;
        if self.remote_closed {
            return Err(CallError::AlreadyClosed(Direction::Inbound));
        }
        if !self.remote_header {
            return Err(CallError::HeaderNotSent(Direction::Inbound));
        }
        if self.single_inbound() && self.received == 1 {
            return Err(CallError::TooManyMessages {
                pattern: self.pattern,
                direction: Direction::Inbound,
            });
        }
        self.received += 1;
        Ok(())
    }

    /// Half-closes the outbound direction without a status (client side).
    pub fn close_send(&mut self) -> Result<(), CallError> {
        self.check_live()?;
        if self.local_closed {
            return Err(CallError::AlreadyClosed(Direction::Outbound));
        }
        if self.single_outbound() && self.sent == 0 {
            return Err(CallError::MissingMessage {
                pattern: self.pattern,
                direction: Direction::Outbound,
            });
        }
        self.local_closed = true;
        self.advance();
        Ok(())
    }

    /// Peer half-closed its direction without a status.
    pub fn recv_close(&mut self) -> Result<(), CallError> {
        self.check_live()?;
        if self.remote_closed {
            return Err(CallError::AlreadyClosed(Direction::Inbound));
        }
        if self.single_inbound() && self.received == 0 {
            return Err(CallError::MissingMessage {
                pattern: self.pattern,
                direction: Direction::Inbound,
            });
        }
        self.remote_closed = true;
        self.advance();
        Ok(())
    }

    /// Ends the call from this end with a final status (server side).
    ///
    /// An OK status requires the pattern's outbound message; an error
    /// status may close a call that sent nothing. Finishing abandons any
    /// inbound messages still in flight.
    pub fn finish(&mut self, status: &Status) -> Result<(), CallError> {
        self.check_live()?;
        if self.local_closed {
            return Err(CallError::AlreadyClosed(Direction::Outbound));
        }
        if status.is_ok() && self.single_outbound() && self.sent == 0 {
            return Err(CallError::MissingMessage {
                pattern: self.pattern,
                direction: Direction::Outbound,
            });
        }
        self.local_closed = true;
        self.remote_closed = true;
        self.advance();
        Ok(())
    }

    /// The peer ended the call with a final status (client side).
    ///
    /// Closes the local direction as well if it was still open.
    pub fn recv_finish(&mut self, status: &Status) -> Result<(), CallError> {
        self.check_live()?;
        if status.is_ok() && self.single_inbound() && self.received == 0 {
            return Err(CallError::MissingMessage {
                pattern: self.pattern,
                direction: Direction::Inbound,
            });
        }
        self.local_closed = true;
        self.remote_closed = true;
        self.advance();
        Ok(())
    }

    /// Moves to `Cancelled`. Returns false if the call already ended.
    pub fn cancel(&mut self) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.cancelled = true;
        self.advance();
        true
    }
}
