//! Link protocol implementation
//!
//! Everything that touches the wire formats of the OR protocol:
//! - Cell framing for both circuit-id widths
//! - The link handshake (VERSIONS / CERTS / AUTH_CHALLENGE / AUTHENTICATE /
//!   NETINFO) and its certificate chains
//! - The ntor circuit handshake
//! - Per-hop relay crypto and onion layering
//! - EXTEND2 link specifiers

pub mod cell;
pub mod certs;
pub mod crypto;
pub mod extend;
pub mod handshake;
pub mod netinfo;
pub mod ntor;

pub use cell::{Cell, CellCommand, CircId, DestroyReason, LinkVersion, RelayCell, RelayCommand};
pub use certs::{CertsCell, Ed25519Cert, ValidatedPeer};
pub use crypto::{CryptoState, HopCrypto, KeyMaterial, OriginCrypto};
pub use extend::{Extend2, LinkSpec};
pub use handshake::{
    AuthChallenge, Authenticate, LinkEstablished, LinkHandshake, LinkSecrets, LinkState,
    PeerIdentity,
};
pub use netinfo::Netinfo;
pub use ntor::{ClientHandshake, ServerHandshake};
