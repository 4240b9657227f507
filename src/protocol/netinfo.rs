//! NETINFO cells
//!
//! The final cell of the link handshake: each side tells the other what
//! address it believes the peer has, lists its own addresses, and stamps a
//! timestamp for clock-skew detection.

use crate::error::{RelayError, Result};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::{SystemTime, UNIX_EPOCH};

/// Address type bytes used inside NETINFO.
const ADDR_IPV4: u8 = 4;
const ADDR_IPV6: u8 = 6;

/// Parsed NETINFO payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Netinfo {
    /// Sender's clock, seconds since the epoch
    pub timestamp: u32,

    /// The sender's view of our address
    pub other_addr: Option<IpAddr>,

    /// Addresses the sender claims for itself
    pub my_addrs: Vec<IpAddr>,
}

impl Netinfo {
    /// Build a NETINFO describing this link, timestamped now.
    pub fn for_link(peer: IpAddr, local: &[IpAddr]) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as u32;
        Self {
            timestamp,
            other_addr: Some(peer),
            my_addrs: local.to_vec(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + 18 + 1 + self.my_addrs.len() * 18);
        out.extend_from_slice(&self.timestamp.to_be_bytes());
        match self.other_addr {
            Some(addr) => encode_addr(&mut out, addr),
            // An absent address is encoded as a zero-length entry.
            None => {
                out.push(0);
                out.push(0);
            }
        }
        out.push(self.my_addrs.len() as u8);
        for addr in &self.my_addrs {
            encode_addr(&mut out, *addr);
        }
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < 4 {
            return Err(RelayError::BadRelayCell("NETINFO too short".into()));
        }
        let timestamp = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
        let mut offset = 4;

        let other_addr = decode_addr(data, &mut offset)?;

        if offset >= data.len() {
            return Err(RelayError::BadRelayCell("NETINFO missing address count".into()));
        }
        let n_addrs = data[offset] as usize;
        offset += 1;

        let mut my_addrs = Vec::with_capacity(n_addrs);
        for _ in 0..n_addrs {
            if let Some(addr) = decode_addr(data, &mut offset)? {
                my_addrs.push(addr);
            }
        }

        Ok(Self {
            timestamp,
            other_addr,
            my_addrs,
        })
    }
}

fn encode_addr(out: &mut Vec<u8>, addr: IpAddr) {
    match addr {
        IpAddr::V4(v4) => {
            out.push(ADDR_IPV4);
            out.push(4);
            out.extend_from_slice(&v4.octets());
        }
        IpAddr::V6(v6) => {
            out.push(ADDR_IPV6);
            out.push(16);
            out.extend_from_slice(&v6.octets());
        }
    }
}

/// Decode one type/len/value address entry, skipping unknown types.
fn decode_addr(data: &[u8], offset: &mut usize) -> Result<Option<IpAddr>> {
    if *offset + 2 > data.len() {
        return Err(RelayError::BadRelayCell("NETINFO address truncated".into()));
    }
    let addr_type = data[*offset];
    let len = data[*offset + 1] as usize;
    *offset += 2;
    if *offset + len > data.len() {
        return Err(RelayError::BadRelayCell("NETINFO address truncated".into()));
    }
    let value = &data[*offset..*offset + len];
    *offset += len;

    let addr = match (addr_type, len) {
        (ADDR_IPV4, 4) => {
            let octets: [u8; 4] = value.try_into().expect("length checked");
            Some(IpAddr::V4(Ipv4Addr::from(octets)))
        }
        (ADDR_IPV6, 16) => {
            let octets: [u8; 16] = value.try_into().expect("length checked");
            Some(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        _ => None,
    };
    Ok(addr)
}
