//! Cell framing
//!
//! Implements the two cell wire formats of the link protocol: 2-byte circuit
//! ids under link versions <= 3 and 4-byte ids under >= 4. Cells are the basic
//! unit of everything that crosses a link; the codec here is the only place
//! that knows about on-wire layout.

use crate::error::{RelayError, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Circuit identifier. Stored as 4 bytes; truncated to 2 on the wire for
/// link versions <= 3.
pub type CircId = u32;

/// Negotiated link protocol version.
pub type LinkVersion = u16;

/// Payload size of a fixed-length cell.
pub const CELL_BODY_LEN: usize = 509;

/// Relay cell header: command(1) + recognized(2) + stream(2) + digest(4) + length(2).
pub const RELAY_HEADER_LEN: usize = 11;

/// Maximum data bytes carried by one relay cell.
pub const RELAY_DATA_LEN: usize = CELL_BODY_LEN - RELAY_HEADER_LEN;

/// Byte range of the digest field within a relay cell payload.
pub const RELAY_DIGEST_RANGE: std::ops::Range<usize> = 5..9;

/// Cell command types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellCommand {
    /// PADDING - link padding, dropped on receipt
    Padding,
    /// CREATE - TAP circuit creation (not supported)
    Create,
    /// CREATED - TAP reply (not supported)
    Created,
    /// RELAY - onion-encrypted relay cell
    Relay,
    /// DESTROY - tear down a circuit
    Destroy,
    /// CREATE_FAST - unauthenticated creation (not supported)
    CreateFast,
    /// CREATED_FAST - reply (not supported)
    CreatedFast,
    /// VERSIONS - link version negotiation
    Versions,
    /// NETINFO - address and clock exchange
    Netinfo,
    /// RELAY_EARLY - relay cell permitted to carry EXTEND2
    RelayEarly,
    /// CREATE2 - circuit creation (ntor)
    Create2,
    /// CREATED2 - creation reply
    Created2,
    /// PADDING_NEGOTIATE - padding control, dropped on receipt
    PaddingNegotiate,
    /// VPADDING - variable-length padding
    Vpadding,
    /// CERTS - certificate chains
    Certs,
    /// AUTH_CHALLENGE - link authentication challenge
    AuthChallenge,
    /// AUTHENTICATE - link authentication response
    Authenticate,
    /// AUTHORIZE - reserved
    Authorize,
    /// Anything else: framed and dropped by upper layers
    Unknown(u8),
}

impl CellCommand {
    pub fn from_u8(cmd: u8) -> Self {
        match cmd {
            0 => CellCommand::Padding,
            1 => CellCommand::Create,
            2 => CellCommand::Created,
            3 => CellCommand::Relay,
            4 => CellCommand::Destroy,
            5 => CellCommand::CreateFast,
            6 => CellCommand::CreatedFast,
            7 => CellCommand::Versions,
            8 => CellCommand::Netinfo,
            9 => CellCommand::RelayEarly,
            10 => CellCommand::Create2,
            11 => CellCommand::Created2,
            12 => CellCommand::PaddingNegotiate,
            128 => CellCommand::Vpadding,
            129 => CellCommand::Certs,
            130 => CellCommand::AuthChallenge,
            131 => CellCommand::Authenticate,
            132 => CellCommand::Authorize,
            other => CellCommand::Unknown(other),
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            CellCommand::Padding => 0,
            CellCommand::Create => 1,
            CellCommand::Created => 2,
            CellCommand::Relay => 3,
            CellCommand::Destroy => 4,
            CellCommand::CreateFast => 5,
            CellCommand::CreatedFast => 6,
            CellCommand::Versions => 7,
            CellCommand::Netinfo => 8,
            CellCommand::RelayEarly => 9,
            CellCommand::Create2 => 10,
            CellCommand::Created2 => 11,
            CellCommand::PaddingNegotiate => 12,
            CellCommand::Vpadding => 128,
            CellCommand::Certs => 129,
            CellCommand::AuthChallenge => 130,
            CellCommand::Authenticate => 131,
            CellCommand::Authorize => 132,
            CellCommand::Unknown(other) => other,
        }
    }

    /// Whether cells with this command carry an explicit 2-byte length.
    pub fn is_variable_length(self) -> bool {
        matches!(
            self,
            CellCommand::Versions
                | CellCommand::Vpadding
                | CellCommand::Certs
                | CellCommand::AuthChallenge
                | CellCommand::Authenticate
                | CellCommand::Authorize
        )
    }
}

/// Reason codes carried in DESTROY cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestroyReason {
    None,
    Protocol,
    Internal,
    Requested,
    Hibernating,
    ResourceLimit,
    ConnectFailed,
    OrIdentity,
    ChannelClosed,
    Finished,
    Timeout,
    Destroyed,
    NoSuchService,
}

impl DestroyReason {
    pub fn from_u8(code: u8) -> Self {
        match code {
            1 => DestroyReason::Protocol,
            2 => DestroyReason::Internal,
            3 => DestroyReason::Requested,
            4 => DestroyReason::Hibernating,
            5 => DestroyReason::ResourceLimit,
            6 => DestroyReason::ConnectFailed,
            7 => DestroyReason::OrIdentity,
            8 => DestroyReason::ChannelClosed,
            9 => DestroyReason::Finished,
            10 => DestroyReason::Timeout,
            11 => DestroyReason::Destroyed,
            12 => DestroyReason::NoSuchService,
            _ => DestroyReason::None,
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            DestroyReason::None => 0,
            DestroyReason::Protocol => 1,
            DestroyReason::Internal => 2,
            DestroyReason::Requested => 3,
            DestroyReason::Hibernating => 4,
            DestroyReason::ResourceLimit => 5,
            DestroyReason::ConnectFailed => 6,
            DestroyReason::OrIdentity => 7,
            DestroyReason::ChannelClosed => 8,
            DestroyReason::Finished => 9,
            DestroyReason::Timeout => 10,
            DestroyReason::Destroyed => 11,
            DestroyReason::NoSuchService => 12,
        }
    }
}

/// A link cell
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cell {
    /// Circuit id; 0 for connection-scoped cells
    pub circ_id: CircId,

    /// Command
    pub command: CellCommand,

    /// Payload; padded to [`CELL_BODY_LEN`] on encode for fixed-length commands
    pub payload: Vec<u8>,
}

/// Width in bytes of the circuit-id field under `version`.
pub fn circ_id_len(version: LinkVersion) -> usize {
    if version <= 3 {
        2
    } else {
        4
    }
}

impl Cell {
    pub fn new(circ_id: CircId, command: CellCommand, payload: Vec<u8>) -> Self {
        Self {
            circ_id,
            command,
            payload,
        }
    }

    /// Build a VERSIONS cell listing the versions we speak.
    pub fn versions(versions: &[LinkVersion]) -> Self {
        let mut payload = Vec::with_capacity(versions.len() * 2);
        for v in versions {
            payload.extend_from_slice(&v.to_be_bytes());
        }
        Self::new(0, CellCommand::Versions, payload)
    }

    /// Build a DESTROY cell for `circ_id`.
    pub fn destroy(circ_id: CircId, reason: DestroyReason) -> Self {
        Self::new(circ_id, CellCommand::Destroy, vec![reason.to_u8()])
    }

    /// Parse a VERSIONS payload into the version list.
    pub fn parse_versions(payload: &[u8]) -> Result<Vec<LinkVersion>> {
        if payload.len() < 2 || payload.len() % 2 != 0 {
            return Err(RelayError::BadVersionsPayload(payload.len()));
        }
        Ok(payload
            .chunks_exact(2)
            .map(|c| u16::from_be_bytes([c[0], c[1]]))
            .collect())
    }

    /// Wire length of this cell under `version`.
    pub fn encoded_len(&self, version: LinkVersion) -> usize {
        let id_len = if self.command == CellCommand::Versions {
            2
        } else {
            circ_id_len(version)
        };
        if self.command.is_variable_length() {
            id_len + 1 + 2 + self.payload.len()
        } else {
            id_len + 1 + CELL_BODY_LEN
        }
    }

    /// Serialize to wire bytes.
    ///
    /// VERSIONS cells always use the 2-byte circuit-id format: they are
    /// exchanged before any version has been negotiated.
    pub fn encode(&self, version: LinkVersion) -> Result<Vec<u8>> {
        let id_len = if self.command == CellCommand::Versions {
            2
        } else {
            circ_id_len(version)
        };

        let mut buf = Vec::with_capacity(self.encoded_len(version));
        if id_len == 2 {
            buf.extend_from_slice(&(self.circ_id as u16).to_be_bytes());
        } else {
            buf.extend_from_slice(&self.circ_id.to_be_bytes());
        }
        buf.push(self.command.to_u8());

        if self.command.is_variable_length() {
            if self.payload.len() > u16::MAX as usize {
                return Err(RelayError::OversizedCell(self.payload.len()));
            }
            buf.extend_from_slice(&(self.payload.len() as u16).to_be_bytes());
            buf.extend_from_slice(&self.payload);
        } else {
            if self.payload.len() > CELL_BODY_LEN {
                return Err(RelayError::OversizedCell(self.payload.len()));
            }
            buf.extend_from_slice(&self.payload);
            buf.resize(buf.len() + CELL_BODY_LEN - self.payload.len(), 0);
        }

        Ok(buf)
    }
}

/// Read one cell off `reader` using the framing of `version`.
///
/// Callers pass version 3 until negotiation completes, which also gives
/// VERSIONS cells their fixed 2-byte circuit-id field.
pub async fn read_cell<R>(reader: &mut R, version: LinkVersion) -> Result<Cell>
where
    R: AsyncRead + Unpin,
{
    let mut id_buf = [0u8; 4];
    let id_len = circ_id_len(version);
    read_exact_or(reader, &mut id_buf[..id_len], "circuit id").await?;
    let circ_id = if id_len == 2 {
        u16::from_be_bytes([id_buf[0], id_buf[1]]) as u32
    } else {
        u32::from_be_bytes(id_buf)
    };

    let mut cmd_buf = [0u8; 1];
    read_exact_or(reader, &mut cmd_buf, "command").await?;
    let command = CellCommand::from_u8(cmd_buf[0]);

    let payload = if command.is_variable_length() {
        let mut len_buf = [0u8; 2];
        read_exact_or(reader, &mut len_buf, "length").await?;
        let len = u16::from_be_bytes(len_buf) as usize;
        let mut payload = vec![0u8; len];
        read_exact_or(reader, &mut payload, "variable payload").await?;
        payload
    } else {
        let mut payload = vec![0u8; CELL_BODY_LEN];
        read_exact_or(reader, &mut payload, "fixed payload").await?;
        payload
    };

    Ok(Cell {
        circ_id,
        command,
        payload,
    })
}

/// Write one cell to `writer` using the framing of `version`.
pub async fn write_cell<W>(writer: &mut W, cell: &Cell, version: LinkVersion) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let bytes = cell.encode(version)?;
    writer.write_all(&bytes).await?;
    Ok(())
}

async fn read_exact_or<R>(reader: &mut R, buf: &mut [u8], what: &str) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    reader
        .read_exact(buf)
        .await
        .map_err(|_| RelayError::TruncatedCell(what.into()))?;
    Ok(())
}

/// Relay command types (the inner command of a decrypted relay cell)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayCommand {
    /// BEGIN - open a stream
    Begin,
    /// DATA - stream payload
    Data,
    /// END - close a stream
    End,
    /// CONNECTED - stream open confirmation
    Connected,
    /// SENDME - flow-control window refill
    Sendme,
    /// TRUNCATE - drop the rest of the circuit
    Truncate,
    /// TRUNCATED - truncation confirmation
    Truncated,
    /// DROP - long-range padding, ignored
    Drop,
    /// RESOLVE - DNS lookup (answered with END under the default policy)
    Resolve,
    /// RESOLVED - DNS reply
    Resolved,
    /// BEGIN_DIR - directory stream (not served)
    BeginDir,
    /// EXTEND2 - extend the circuit one hop
    Extend2,
    /// EXTENDED2 - extension confirmation
    Extended2,
    /// Unrecognized relay command
    Unknown(u8),
}

impl RelayCommand {
    pub fn from_u8(cmd: u8) -> Self {
        match cmd {
            1 => RelayCommand::Begin,
            2 => RelayCommand::Data,
            3 => RelayCommand::End,
            4 => RelayCommand::Connected,
            5 => RelayCommand::Sendme,
            8 => RelayCommand::Truncate,
            9 => RelayCommand::Truncated,
            10 => RelayCommand::Drop,
            11 => RelayCommand::Resolve,
            12 => RelayCommand::Resolved,
            13 => RelayCommand::BeginDir,
            14 => RelayCommand::Extend2,
            15 => RelayCommand::Extended2,
            other => RelayCommand::Unknown(other),
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            RelayCommand::Begin => 1,
            RelayCommand::Data => 2,
            RelayCommand::End => 3,
            RelayCommand::Connected => 4,
            RelayCommand::Sendme => 5,
            RelayCommand::Truncate => 8,
            RelayCommand::Truncated => 9,
            RelayCommand::Drop => 10,
            RelayCommand::Resolve => 11,
            RelayCommand::Resolved => 12,
            RelayCommand::BeginDir => 13,
            RelayCommand::Extend2 => 14,
            RelayCommand::Extended2 => 15,
            RelayCommand::Unknown(other) => other,
        }
    }
}

/// Decrypted inner structure of a RELAY / RELAY_EARLY payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayCell {
    /// Relay command
    pub command: RelayCommand,

    /// Zero on every cell we originate; nonzero marks a transit cell
    pub recognized: u16,

    /// Stream id; 0 for circuit-scoped commands
    pub stream_id: u16,

    /// Running-digest snapshot (filled in by the crypto layer)
    pub digest: [u8; 4],

    /// Data (up to [`RELAY_DATA_LEN`] bytes)
    pub data: Vec<u8>,
}

impl RelayCell {
    pub fn new(command: RelayCommand, stream_id: u16, data: Vec<u8>) -> Self {
        debug_assert!(data.len() <= RELAY_DATA_LEN);
        Self {
            command,
            recognized: 0,
            stream_id,
            digest: [0; 4],
            data,
        }
    }

    /// Serialize into a full 509-byte relay payload, zero-padded.
    pub fn encode(&self) -> Result<[u8; CELL_BODY_LEN]> {
        if self.data.len() > RELAY_DATA_LEN {
            return Err(RelayError::BadRelayCell(format!(
                "data too long: {} bytes",
                self.data.len()
            )));
        }
        let mut buf = [0u8; CELL_BODY_LEN];
        buf[0] = self.command.to_u8();
        buf[1..3].copy_from_slice(&self.recognized.to_be_bytes());
        buf[3..5].copy_from_slice(&self.stream_id.to_be_bytes());
        buf[RELAY_DIGEST_RANGE].copy_from_slice(&self.digest);
        buf[9..11].copy_from_slice(&(self.data.len() as u16).to_be_bytes());
        buf[RELAY_HEADER_LEN..RELAY_HEADER_LEN + self.data.len()].copy_from_slice(&self.data);
        Ok(buf)
    }

    /// Parse a decrypted 509-byte relay payload.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        if payload.len() < RELAY_HEADER_LEN {
            return Err(RelayError::BadRelayCell(format!(
                "payload too short: {} bytes",
                payload.len()
            )));
        }
        let command = RelayCommand::from_u8(payload[0]);
        let recognized = u16::from_be_bytes([payload[1], payload[2]]);
        let stream_id = u16::from_be_bytes([payload[3], payload[4]]);
        let digest = [payload[5], payload[6], payload[7], payload[8]];
        let length = u16::from_be_bytes([payload[9], payload[10]]) as usize;

        if RELAY_HEADER_LEN + length > payload.len() {
            return Err(RelayError::BadRelayCell(format!(
                "data length {} exceeds payload",
                length
            )));
        }

        Ok(Self {
            command,
            recognized,
            stream_id,
            digest,
            data: payload[RELAY_HEADER_LEN..RELAY_HEADER_LEN + length].to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn roundtrip(cell: &Cell, version: LinkVersion) -> Cell {
        let mut buf = std::io::Cursor::new(Vec::new());
        write_cell(&mut buf, cell, version).await.unwrap();
        let bytes = buf.into_inner();
        read_cell(&mut bytes.as_slice(), version).await.unwrap()
    }

    #[tokio::test]
    async fn test_fixed_cell_roundtrip_both_formats() {
        let cell = Cell::new(0x80001234, CellCommand::Create2, vec![1, 2, 3, 4]);

        let wire = cell.encode(4).unwrap();
        assert_eq!(wire.len(), 514);
        let back = read_cell(&mut wire.as_slice(), 4).await.unwrap();
        assert_eq!(back.circ_id, 0x80001234);
        assert_eq!(back.command, CellCommand::Create2);
        assert_eq!(&back.payload[..4], &[1, 2, 3, 4]);
        assert_eq!(back.payload.len(), CELL_BODY_LEN);

        let cell = Cell::new(0x8001, CellCommand::Create2, vec![9; CELL_BODY_LEN]);
        let wire = cell.encode(3).unwrap();
        assert_eq!(wire.len(), 512);
        let back = roundtrip(&cell, 3).await;
        assert_eq!(back, cell);
    }

    #[tokio::test]
    async fn test_variable_cell_roundtrip() {
        let cell = Cell::new(0, CellCommand::Certs, vec![7; 300]);
        let wire = cell.encode(4).unwrap();
        assert_eq!(wire.len(), 4 + 1 + 2 + 300);
        let back = roundtrip(&cell, 4).await;
        assert_eq!(back, cell);
    }

    #[tokio::test]
    async fn test_versions_cell_always_short_circ_id() {
        let cell = Cell::versions(&[3, 4, 5]);
        // Even under a 4-byte-id link, VERSIONS keeps the 2-byte field.
        let wire = cell.encode(4).unwrap();
        assert_eq!(wire.len(), 2 + 1 + 2 + 6);
        assert_eq!(wire[2], 7);
    }

    #[test]
    fn test_parse_versions_validation() {
        assert_eq!(Cell::parse_versions(&[0, 3, 0, 4]).unwrap(), vec![3, 4]);
        assert!(Cell::parse_versions(&[]).is_err());
        assert!(Cell::parse_versions(&[0]).is_err());
        assert!(Cell::parse_versions(&[0, 3, 0]).is_err());
    }

    #[tokio::test]
    async fn test_unknown_command_is_framed() {
        let cell = Cell::new(5, CellCommand::Unknown(99), vec![1; 10]);
        let back = roundtrip(&cell, 4).await;
        assert_eq!(back.command, CellCommand::Unknown(99));
        assert_eq!(back.payload.len(), CELL_BODY_LEN);
    }

    #[tokio::test]
    async fn test_truncated_cell_errors() {
        let cell = Cell::new(1, CellCommand::Relay, vec![0; CELL_BODY_LEN]);
        let wire = cell.encode(4).unwrap();
        let err = read_cell(&mut &wire[..100], 4).await.unwrap_err();
        assert!(matches!(err, RelayError::TruncatedCell(_)));
    }

    #[test]
    fn test_relay_cell_roundtrip() {
        let rc = RelayCell::new(RelayCommand::Begin, 42, b"example.com:80\0".to_vec());
        let payload = rc.encode().unwrap();
        assert_eq!(payload.len(), CELL_BODY_LEN);

        let back = RelayCell::decode(&payload).unwrap();
        assert_eq!(back.command, RelayCommand::Begin);
        assert_eq!(back.stream_id, 42);
        assert_eq!(back.data, b"example.com:80\0");
    }

    #[test]
    fn test_relay_cell_length_bounds() {
        let rc = RelayCell::new(RelayCommand::Data, 1, vec![0; RELAY_DATA_LEN]);
        assert!(rc.encode().is_ok());

        let mut bad = [0u8; CELL_BODY_LEN];
        bad[0] = RelayCommand::Data.to_u8();
        bad[9..11].copy_from_slice(&600u16.to_be_bytes());
        assert!(RelayCell::decode(&bad).is_err());
    }

    #[test]
    fn test_destroy_reason_codes() {
        assert_eq!(DestroyReason::from_u8(1), DestroyReason::Protocol);
        assert_eq!(DestroyReason::from_u8(8), DestroyReason::ChannelClosed);
        assert_eq!(DestroyReason::from_u8(200), DestroyReason::None);
        assert_eq!(DestroyReason::Timeout.to_u8(), 10);
    }
}
