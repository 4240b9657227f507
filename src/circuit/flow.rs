//! SENDME flow control
//!
//! Circuit- and stream-level windows that bound how many DATA cells may be
//! in flight. Windows count down as data moves and are refilled by SENDME
//! cells; a sender that keeps going past an empty window is violating the
//! protocol.
//!
//! Window values:
//! - circuit: initial 1000, refilled in increments of 100
//! - stream: initial 500, refilled in increments of 50

use crate::error::{RelayError, Result};

/// Circuit-level windows.
#[derive(Debug, Clone)]
pub struct CircuitWindows {
    /// Cells we may still originate before a SENDME arrives
    pub package: u16,

    /// Cells the peer may still deliver to us
    pub deliver: u16,
}

impl CircuitWindows {
    pub const INITIAL: u16 = 1000;
    pub const INCREMENT: u16 = 100;

    pub fn new() -> Self {
        Self {
            package: Self::INITIAL,
            deliver: Self::INITIAL,
        }
    }

    /// Account for a DATA cell we originate.
    pub fn on_package(&mut self) -> Result<()> {
        if self.package == 0 {
            return Err(RelayError::WindowViolation);
        }
        self.package -= 1;
        Ok(())
    }

    /// Account for a circuit-level SENDME from the peer.
    ///
    /// A refill past the initial window means the peer acknowledged cells we
    /// never sent.
    pub fn on_sendme(&mut self) -> Result<()> {
        let refilled = self.package + Self::INCREMENT;
        if refilled > Self::INITIAL {
            return Err(RelayError::WindowViolation);
        }
        self.package = refilled;
        log::debug!("circuit package window refilled to {}", self.package);
        Ok(())
    }

    /// Account for a delivered DATA cell.
    ///
    /// Returns true when a circuit-level SENDME should go back to the sender.
    pub fn on_deliver(&mut self) -> Result<bool> {
        if self.deliver == 0 {
            return Err(RelayError::WindowViolation);
        }
        self.deliver -= 1;
        if self.deliver <= Self::INITIAL - Self::INCREMENT {
            self.deliver += Self::INCREMENT;
            return Ok(true);
        }
        Ok(false)
    }
}

impl Default for CircuitWindows {
    fn default() -> Self {
        Self::new()
    }
}

/// Stream-level windows.
#[derive(Debug, Clone)]
pub struct StreamWindows {
    pub stream_id: u16,
    pub package: u16,
    pub deliver: u16,
}

impl StreamWindows {
    pub const INITIAL: u16 = 500;
    pub const INCREMENT: u16 = 50;

    pub fn new(stream_id: u16) -> Self {
        Self {
            stream_id,
            package: Self::INITIAL,
            deliver: Self::INITIAL,
        }
    }

    pub fn on_package(&mut self) -> Result<()> {
        if self.package == 0 {
            return Err(RelayError::StreamWindow(self.stream_id));
        }
        self.package -= 1;
        Ok(())
    }

    pub fn on_sendme(&mut self) -> Result<()> {
        let refilled = self.package + Self::INCREMENT;
        if refilled > Self::INITIAL {
            return Err(RelayError::StreamWindow(self.stream_id));
        }
        self.package = refilled;
        Ok(())
    }

    /// Returns true when a stream-level SENDME should go back.
    pub fn on_deliver(&mut self) -> Result<bool> {
        if self.deliver == 0 {
            return Err(RelayError::StreamWindow(self.stream_id));
        }
        self.deliver -= 1;
        if self.deliver <= Self::INITIAL - Self::INCREMENT {
            self.deliver += Self::INCREMENT;
            return Ok(true);
        }
        Ok(false)
    }
}
