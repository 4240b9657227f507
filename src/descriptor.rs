//! Relay descriptor
//!
//! The self-description a relay hands to the publication component: identity
//! fingerprint, onion keys, address and the operator-supplied metadata.
//! Contents are immutable between restarts unless keys rotate; publication
//! itself (the POST to a directory authority) is external.

use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use std::net::IpAddr;

/// Default advertised bandwidth, bytes per second.
pub const DEFAULT_BANDWIDTH: u64 = 1 << 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Descriptor {
    pub nickname: String,
    pub address: IpAddr,
    pub or_port: u16,

    /// SHA-1 fingerprint of the RSA identity key
    pub fingerprint: [u8; 20],

    /// Curve25519 ntor onion key
    pub ntor_onion_key: [u8; 32],

    /// Ed25519 master identity key
    pub ed25519_identity: [u8; 32],

    pub bandwidth: u64,
    pub platform: String,
    pub contact: Option<String>,
}

impl Descriptor {
    /// Fingerprint in the directory format: uppercase hex in groups of four.
    pub fn fingerprint_string(&self) -> String {
        hex::encode_upper(self.fingerprint)
            .as_bytes()
            .chunks(4)
            .map(|c| std::str::from_utf8(c).expect("hex is ASCII"))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Server-descriptor-style document body.
    pub fn render(&self) -> String {
        let mut doc = String::new();
        doc.push_str(&format!(
            "router {} {} {} 0 0\n",
            self.nickname, self.address, self.or_port
        ));
        doc.push_str(&format!("platform {}\n", self.platform));
        doc.push_str(&format!("fingerprint {}\n", self.fingerprint_string()));
        doc.push_str(&format!(
            "bandwidth {} {} {}\n",
            self.bandwidth, self.bandwidth, self.bandwidth
        ));
        doc.push_str(&format!(
            "ntor-onion-key {}\n",
            STANDARD_NO_PAD.encode(self.ntor_onion_key)
        ));
        doc.push_str(&format!(
            "master-key-ed25519 {}\n",
            STANDARD_NO_PAD.encode(self.ed25519_identity)
        ));
        if let Some(contact) = &self.contact {
            doc.push_str(&format!("contact {}\n", contact));
        }
        doc.push_str("reject *:*\n");
        doc
    }
}
