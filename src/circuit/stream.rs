//! Streams multiplexed inside a circuit
//!
//! Stream bookkeeping for the exit-side relay commands. The default exit
//! policy refuses every connection, so streams here live just long enough to
//! be answered with END; the table, states and windows are nonetheless
//! complete so a permissive policy only has to swap the endpoint.

use crate::circuit::flow::StreamWindows;
use crate::error::{RelayError, Result};
use std::collections::HashMap;

/// Reason codes carried in END cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    Misc,
    ResolveFailed,
    ConnectRefused,
    ExitPolicy,
    Destroy,
    Done,
    Timeout,
    NoRoute,
    Hibernating,
    Internal,
    ResourceLimit,
    ConnReset,
    TorProtocol,
    NotDirectory,
}

impl EndReason {
    pub fn to_u8(self) -> u8 {
        match self {
            EndReason::Misc => 1,
            EndReason::ResolveFailed => 2,
            EndReason::ConnectRefused => 3,
            EndReason::ExitPolicy => 4,
            EndReason::Destroy => 5,
            EndReason::Done => 6,
            EndReason::Timeout => 7,
            EndReason::NoRoute => 8,
            EndReason::Hibernating => 9,
            EndReason::Internal => 10,
            EndReason::ResourceLimit => 11,
            EndReason::ConnReset => 12,
            EndReason::TorProtocol => 13,
            EndReason::NotDirectory => 14,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Opening,
    Open,
    Closed,
}

/// One stream's bookkeeping.
#[derive(Debug)]
pub struct Stream {
    pub id: u16,
    pub state: StreamState,
    pub windows: StreamWindows,
}

/// Target named by a BEGIN cell: "host:port\0" followed by optional flags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BeginTarget {
    pub host: String,
    pub port: u16,
    pub flags: u32,
}

impl BeginTarget {
    pub fn decode(data: &[u8]) -> Result<Self> {
        let nul = data
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| RelayError::BadBegin("missing NUL terminator".into()))?;
        let addrport = std::str::from_utf8(&data[..nul])
            .map_err(|_| RelayError::BadBegin("target is not UTF-8".into()))?;

        let (host, port) = addrport
            .rsplit_once(':')
            .ok_or_else(|| RelayError::BadBegin("missing port".into()))?;
        if host.is_empty() {
            return Err(RelayError::BadBegin("empty host".into()));
        }
        let port: u16 = port
            .parse()
            .map_err(|_| RelayError::BadBegin(format!("bad port {:?}", port)))?;

        let rest = &data[nul + 1..];
        let flags = if rest.len() >= 4 {
            u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]])
        } else {
            0
        };

        Ok(Self {
            host: host.to_string(),
            port,
            flags,
        })
    }
}

/// Streams of one circuit.
#[derive(Debug, Default)]
pub struct StreamTable {
    streams: HashMap<u16, Stream>,
}

impl StreamTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a stream named by a BEGIN cell.
    pub fn begin(&mut self, id: u16) -> Result<()> {
        if id == 0 {
            return Err(RelayError::BadBegin("stream id 0".into()));
        }
        if self.streams.contains_key(&id) {
            return Err(RelayError::BadBegin(format!("stream {} already open", id)));
        }
        self.streams.insert(
            id,
            Stream {
                id,
                state: StreamState::Opening,
                windows: StreamWindows::new(id),
            },
        );
        Ok(())
    }

    pub fn get_mut(&mut self, id: u16) -> Option<&mut Stream> {
        self.streams.get_mut(&id)
    }

    /// Drop a stream (after END in either direction).
    pub fn close(&mut self, id: u16) -> Option<Stream> {
        self.streams.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_begin_target_parsing() {
        let target = BeginTarget::decode(b"example.com:443\0").unwrap();
        assert_eq!(target.host, "example.com");
        assert_eq!(target.port, 443);
        assert_eq!(target.flags, 0);

        let target = BeginTarget::decode(b"10.0.0.1:80\0\x00\x00\x00\x01").unwrap();
        assert_eq!(target.host, "10.0.0.1");
        assert_eq!(target.flags, 1);

        // IPv6 targets keep their colons; the port is after the last one.
        let target = BeginTarget::decode(b"[2001:db8::1]:443\0").unwrap();
        assert_eq!(target.host, "[2001:db8::1]");
        assert_eq!(target.port, 443);
    }

    #[test]
    fn test_begin_target_malformed() {
        assert!(BeginTarget::decode(b"no-terminator:80").is_err());
        assert!(BeginTarget::decode(b"noport\0").is_err());
        assert!(BeginTarget::decode(b":80\0").is_err());
        assert!(BeginTarget::decode(b"host:http\0").is_err());
    }

    #[test]
    fn test_stream_table_lifecycle() {
        let mut table = StreamTable::new();
        assert!(table.begin(0).is_err());

        table.begin(5).unwrap();
        assert_eq!(table.get_mut(5).unwrap().state, StreamState::Opening);
        assert!(table.begin(5).is_err());

        assert!(table.get_mut(5).is_some());
        assert!(table.close(5).is_some());
        assert!(table.close(5).is_none());
        assert!(table.is_empty());
    }
}
