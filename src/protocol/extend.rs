//! EXTEND2 payloads and link specifiers
//!
//! A link specifier tells a relay how to reach the next hop: an address and
//! port, or an identity the new link must present. EXTEND2 carries a list of
//! them followed by the CREATE2 handshake block, which this relay forwards
//! verbatim.

use crate::error::{RelayError, Result};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// Link specifier type bytes.
pub const LS_TLS_TCP_IPV4: u8 = 0;
pub const LS_TLS_TCP_IPV6: u8 = 1;
pub const LS_LEGACY_IDENTITY: u8 = 2;
pub const LS_ED25519_IDENTITY: u8 = 3;

/// One way of reaching or identifying the next relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkSpec {
    /// TLS over TCP: address and OR port
    OrPort(SocketAddr),

    /// SHA-1 digest of the relay's RSA identity key
    LegacyId([u8; 20]),

    /// Ed25519 identity key
    Ed25519Id([u8; 32]),

    /// Unrecognized specifier, carried opaquely
    Unknown { spec_type: u8, body: Vec<u8> },
}

impl LinkSpec {
    /// Build a TLS-TCP specifier for an address.
    pub fn tcp(addr: IpAddr, port: u16) -> Self {
        LinkSpec::OrPort(SocketAddr::new(addr, port))
    }

    /// Reassemble a specifier from its wire type and body, validating the
    /// body length for known types.
    pub fn from_parts(spec_type: u8, body: Vec<u8>) -> Result<Self> {
        match spec_type {
            LS_TLS_TCP_IPV4 => {
                if body.len() != 6 {
                    return Err(RelayError::BadLinkSpec(format!(
                        "IPv4 specifier must be 6 bytes, got {}",
                        body.len()
                    )));
                }
                let ip = Ipv4Addr::new(body[0], body[1], body[2], body[3]);
                let port = u16::from_be_bytes([body[4], body[5]]);
                Ok(LinkSpec::OrPort(SocketAddr::new(IpAddr::V4(ip), port)))
            }
            LS_TLS_TCP_IPV6 => {
                if body.len() != 18 {
                    return Err(RelayError::BadLinkSpec(format!(
                        "IPv6 specifier must be 18 bytes, got {}",
                        body.len()
                    )));
                }
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&body[..16]);
                let port = u16::from_be_bytes([body[16], body[17]]);
                Ok(LinkSpec::OrPort(SocketAddr::new(
                    IpAddr::V6(Ipv6Addr::from(octets)),
                    port,
                )))
            }
            LS_LEGACY_IDENTITY => {
                let id: [u8; 20] = body.as_slice().try_into().map_err(|_| {
                    RelayError::BadLinkSpec(format!(
                        "legacy identity must be 20 bytes, got {}",
                        body.len()
                    ))
                })?;
                Ok(LinkSpec::LegacyId(id))
            }
            LS_ED25519_IDENTITY => {
                let id: [u8; 32] = body.as_slice().try_into().map_err(|_| {
                    RelayError::BadLinkSpec(format!(
                        "ed25519 identity must be 32 bytes, got {}",
                        body.len()
                    ))
                })?;
                Ok(LinkSpec::Ed25519Id(id))
            }
            other => Ok(LinkSpec::Unknown {
                spec_type: other,
                body,
            }),
        }
    }

    pub fn type_byte(&self) -> u8 {
        match self {
            LinkSpec::OrPort(SocketAddr::V4(_)) => LS_TLS_TCP_IPV4,
            LinkSpec::OrPort(SocketAddr::V6(_)) => LS_TLS_TCP_IPV6,
            LinkSpec::LegacyId(_) => LS_LEGACY_IDENTITY,
            LinkSpec::Ed25519Id(_) => LS_ED25519_IDENTITY,
            LinkSpec::Unknown { spec_type, .. } => *spec_type,
        }
    }

    /// Wire body of the specifier.
    pub fn body(&self) -> Vec<u8> {
        match self {
            LinkSpec::OrPort(SocketAddr::V4(sa)) => {
                let mut body = Vec::with_capacity(6);
                body.extend_from_slice(&sa.ip().octets());
                body.extend_from_slice(&sa.port().to_be_bytes());
                body
            }
            LinkSpec::OrPort(SocketAddr::V6(sa)) => {
                let mut body = Vec::with_capacity(18);
                body.extend_from_slice(&sa.ip().octets());
                body.extend_from_slice(&sa.port().to_be_bytes());
                body
            }
            LinkSpec::LegacyId(id) => id.to_vec(),
            LinkSpec::Ed25519Id(id) => id.to_vec(),
            LinkSpec::Unknown { body, .. } => body.clone(),
        }
    }

    /// The socket address, when this specifier carries one.
    pub fn address(&self) -> Option<SocketAddr> {
        match self {
            LinkSpec::OrPort(sa) => Some(*sa),
            _ => None,
        }
    }
}

/// Parsed body of an EXTEND2 relay cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extend2 {
    /// How to reach and identify the next hop
    pub link_specs: Vec<LinkSpec>,

    /// Handshake block: HTYPE(2) | HLEN(2) | HDATA, kept in wire form
    /// because it is forwarded verbatim as the CREATE2 payload.
    pub handshake: Vec<u8>,
}

impl Extend2 {
    pub fn new(link_specs: Vec<LinkSpec>, handshake_type: u16, handshake_data: &[u8]) -> Self {
        let mut handshake = Vec::with_capacity(4 + handshake_data.len());
        handshake.extend_from_slice(&handshake_type.to_be_bytes());
        handshake.extend_from_slice(&(handshake_data.len() as u16).to_be_bytes());
        handshake.extend_from_slice(handshake_data);
        Self {
            link_specs,
            handshake,
        }
    }

    /// Parse an EXTEND2 body: NSPEC, the specifiers, then the handshake block.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.is_empty() {
            return Err(RelayError::BadRelayCell("empty EXTEND2".into()));
        }
        let nspec = data[0] as usize;
        let mut offset = 1;
        let mut link_specs = Vec::with_capacity(nspec);

        for _ in 0..nspec {
            if offset + 2 > data.len() {
                return Err(RelayError::BadRelayCell("truncated link specifier".into()));
            }
            let spec_type = data[offset];
            let len = data[offset + 1] as usize;
            offset += 2;
            if offset + len > data.len() {
                return Err(RelayError::BadRelayCell("truncated link specifier".into()));
            }
            link_specs.push(LinkSpec::from_parts(
                spec_type,
                data[offset..offset + len].to_vec(),
            )?);
            offset += len;
        }

        let tail = &data[offset..];
        if tail.len() < 4 {
            return Err(RelayError::BadRelayCell("missing handshake block".into()));
        }
        let hlen = u16::from_be_bytes([tail[2], tail[3]]) as usize;
        if 4 + hlen > tail.len() {
            return Err(RelayError::BadRelayCell(format!(
                "handshake length {} exceeds payload",
                hlen
            )));
        }

        Ok(Self {
            link_specs,
            handshake: tail[..4 + hlen].to_vec(),
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + self.handshake.len());
        out.push(self.link_specs.len() as u8);
        for spec in &self.link_specs {
            let body = spec.body();
            out.push(spec.type_byte());
            out.push(body.len() as u8);
            out.extend_from_slice(&body);
        }
        out.extend_from_slice(&self.handshake);
        out
    }

    pub fn handshake_type(&self) -> u16 {
        u16::from_be_bytes([self.handshake[0], self.handshake[1]])
    }

    /// Handshake data past the HTYPE/HLEN header.
    pub fn handshake_data(&self) -> &[u8] {
        &self.handshake[4..]
    }

    /// First address-bearing specifier, if any.
    pub fn target_addr(&self) -> Option<SocketAddr> {
        self.link_specs.iter().find_map(|s| s.address())
    }

    /// Legacy identity digest, if present.
    pub fn legacy_id(&self) -> Option<[u8; 20]> {
        self.link_specs.iter().find_map(|s| match s {
            LinkSpec::LegacyId(id) => Some(*id),
            _ => None,
        })
    }
}
