//! Error types for the relay core
//!
//! This module provides the error taxonomy for the link, circuit and stream
//! layers, with:
//! - Detailed error variants for the different failure modes
//! - Scope classification (connection-fatal vs circuit-fatal vs stream-local)
//! - Exit-code mapping for the process front end

use thiserror::Error;

pub type Result<T> = std::result::Result<T, RelayError>;

/// Main error type for the relay core.
///
/// Variants are grouped by the protocol scope they belong to. The scope
/// determines propagation: a stream error closes one stream, a circuit error
/// destroys one circuit, and a connection error tears down the link together
/// with every circuit on it.
#[derive(Error, Debug)]
pub enum RelayError {
    // ===== Framing (fatal for the connection) =====
    #[error("truncated cell: {0}")]
    TruncatedCell(String),

    #[error("oversized variable-length cell: {0} bytes")]
    OversizedCell(usize),

    #[error("malformed VERSIONS payload ({0} bytes)")]
    BadVersionsPayload(usize),

    #[error("cell {command} not allowed in link state {state}")]
    NegotiationViolation { command: String, state: String },

    // ===== Link handshake (fatal for the connection) =====
    #[error("no common link protocol version")]
    VersionMismatch,

    #[error("certificate validation failed: {0}")]
    CertInvalid(String),

    #[error("link authentication failed: {0}")]
    AuthFailed(String),

    #[error("peer closed before NETINFO")]
    NetinfoMissing,

    #[error("link handshake timed out")]
    HandshakeTimeout,

    // ===== Circuit (fatal for one circuit) =====
    #[error("unknown circuit id {0}")]
    UnknownCircuit(u32),

    #[error("unsupported circuit handshake type {0}")]
    BadHandshakeType(u16),

    #[error("ntor handshake rejected: {0}")]
    HandshakeFailed(String),

    #[error("relay cell recognized by no hop")]
    RecognitionFailed,

    #[error("circuit flow-control window violated")]
    WindowViolation,

    #[error("circuit handshake timed out")]
    CircuitTimeout,

    #[error("malformed relay cell: {0}")]
    BadRelayCell(String),

    #[error("malformed link specifier: {0}")]
    BadLinkSpec(String),

    #[error("circuit extension failed: {0}")]
    ExtendFailed(String),

    // ===== Stream (closes one stream) =====
    #[error("malformed BEGIN payload: {0}")]
    BadBegin(String),

    #[error("stream {0} flow-control window underflow")]
    StreamWindow(u16),

    // ===== Resource (fatal for one circuit) =====
    #[error("could not allocate a circuit id")]
    CircuitIdExhausted,

    #[error("outbound queue overflowed")]
    QueueOverflow,

    // ===== Crypto =====
    #[error("crypto failure: {0}")]
    Crypto(String),

    // ===== Keys and configuration =====
    #[error("key store error: {0}")]
    KeyStore(String),

    #[error("configuration error: {0}")]
    Config(String),

    // ===== Transport (fatal for the connection) =====
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    Tls(String),

    // ===== Internal =====
    #[error("internal error: {0}")]
    Internal(String),
}

impl RelayError {
    /// Whether this error must tear down the whole connection.
    ///
    /// Connection-fatal errors cascade a DESTROY to every circuit on the
    /// link; the DESTROY cells themselves are not written since the link is
    /// already considered dead.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            RelayError::TruncatedCell(_)
                | RelayError::OversizedCell(_)
                | RelayError::BadVersionsPayload(_)
                | RelayError::NegotiationViolation { .. }
                | RelayError::VersionMismatch
                | RelayError::CertInvalid(_)
                | RelayError::AuthFailed(_)
                | RelayError::NetinfoMissing
                | RelayError::HandshakeTimeout
                | RelayError::Io(_)
                | RelayError::Tls(_)
        )
    }

    /// Whether this error destroys exactly one circuit.
    ///
    /// Circuit-fatal errors send DESTROY with a reason code and remove the
    /// circuit from its table; the connection keeps running.
    pub fn is_circuit_fatal(&self) -> bool {
        matches!(
            self,
            RelayError::BadHandshakeType(_)
                | RelayError::HandshakeFailed(_)
                | RelayError::RecognitionFailed
                | RelayError::WindowViolation
                | RelayError::CircuitTimeout
                | RelayError::BadRelayCell(_)
                | RelayError::BadLinkSpec(_)
                | RelayError::ExtendFailed(_)
                | RelayError::CircuitIdExhausted
                | RelayError::QueueOverflow
                | RelayError::Crypto(_)
        )
    }

    /// Whether this error closes one stream and nothing else.
    pub fn is_stream_local(&self) -> bool {
        matches!(
            self,
            RelayError::BadBegin(_) | RelayError::StreamWindow(_)
        )
    }

    /// Process exit code for the `serve` collaborator.
    ///
    /// 0 is reserved for a normal shutdown; configuration problems exit 1 and
    /// everything else that escapes `serve` exits 2.
    pub fn exit_code(&self) -> i32 {
        match self {
            RelayError::Config(_) => 1,
            _ => 2,
        }
    }
}
