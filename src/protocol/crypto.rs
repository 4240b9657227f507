//! Circuit-hop cryptography
//!
//! Implements the per-hop relay crypto:
//! - AES-128-CTR onion layers, one cipher per direction with a running counter
//! - SHA-1 running digests for relay-cell recognition
//! - HKDF-SHA256 expansion of the ntor KEY_SEED
//!
//! A hop's cipher and digest state advance monotonically over every relay
//! payload that crosses it in one direction; nothing here is ever reset or
//! rekeyed once a circuit is open.
//!
//! Security: key material is zeroized on drop.

use crate::error::{RelayError, Result};
use crate::protocol::cell::{CELL_BODY_LEN, RELAY_DIGEST_RANGE};
use aes::Aes128;
use ctr::cipher::{KeyIvInit, StreamCipher};
use ctr::Ctr128BE;
use hkdf::Hkdf;
use sha1::{Digest, Sha1};
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// AES-128-CTR cipher type
type Aes128Ctr = Ctr128BE<Aes128>;

/// HKDF info string for ntor key expansion.
const M_EXPAND: &[u8] = b"ntor-curve25519-sha256-1:key_expand";

/// Total key material drawn from the KDF: Df | Db | Kf | Kb | KH.
pub const KEY_MATERIAL_LEN: usize = 20 + 20 + 16 + 16 + 20;

/// Expanded key material for one circuit hop.
///
/// Layout follows the ntor KDF output order:
/// forward digest seed, backward digest seed, forward key, backward key,
/// and the KH handshake-derived secret.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct KeyMaterial {
    /// Forward digest seed (Df)
    pub forward_digest: [u8; 20],

    /// Backward digest seed (Db)
    pub backward_digest: [u8; 20],

    /// Forward AES-128 key (Kf)
    pub forward_key: [u8; 16],

    /// Backward AES-128 key (Kb)
    pub backward_key: [u8; 16],

    /// Handshake secret (KH)
    pub kh: [u8; 20],
}

impl KeyMaterial {
    /// Expand the ntor KEY_SEED into hop key material.
    ///
    /// KEY_SEED is already the output of HMAC-SHA256, so it is used directly
    /// as the HKDF pseudorandom key and only the Expand step runs.
    pub fn derive(key_seed: &[u8; 32]) -> Result<Self> {
        let hkdf = Hkdf::<Sha256>::from_prk(key_seed)
            .map_err(|_| RelayError::Crypto("invalid KDF input length".into()))?;

        let mut okm = [0u8; KEY_MATERIAL_LEN];
        hkdf.expand(M_EXPAND, &mut okm)
            .map_err(|_| RelayError::Crypto("key expansion failed".into()))?;

        let mut material = KeyMaterial {
            forward_digest: [0; 20],
            backward_digest: [0; 20],
            forward_key: [0; 16],
            backward_key: [0; 16],
            kh: [0; 20],
        };
        material.forward_digest.copy_from_slice(&okm[0..20]);
        material.backward_digest.copy_from_slice(&okm[20..40]);
        material.forward_key.copy_from_slice(&okm[40..56]);
        material.backward_key.copy_from_slice(&okm[56..72]);
        material.kh.copy_from_slice(&okm[72..92]);
        okm.zeroize();

        Ok(material)
    }
}

/// One direction of a hop's relay crypto: a running AES-CTR cipher plus the
/// running SHA-1 recognition digest.
pub struct CryptoState {
    cipher: Aes128Ctr,
    digest: Sha1,
}

impl CryptoState {
    /// Build from an AES key and a digest seed; the CTR counter starts at zero.
    pub fn new(key: &[u8; 16], digest_seed: &[u8; 20]) -> Self {
        let iv = [0u8; 16];
        let mut digest = Sha1::new();
        digest.update(digest_seed);
        Self {
            cipher: Aes128Ctr::new(key.into(), &iv.into()),
            digest,
        }
    }

    /// Apply one cipher layer in place. CTR mode makes this both the encrypt
    /// and the decrypt operation.
    pub fn apply(&mut self, payload: &mut [u8]) {
        self.cipher.apply_keystream(payload);
    }

    /// Stamp an outbound relay payload: advance the running digest over the
    /// payload (digest field zeroed) and write the 4-byte snapshot back.
    pub fn seal(&mut self, payload: &mut [u8; CELL_BODY_LEN]) {
        payload[RELAY_DIGEST_RANGE].fill(0);
        self.digest.update(&payload[..]);
        let snapshot = self.digest.clone().finalize();
        payload[RELAY_DIGEST_RANGE].copy_from_slice(&snapshot[..4]);
    }

    /// Check whether a decrypted relay payload is addressed to this hop.
    ///
    /// The digest state only advances when the cell is recognized; an
    /// unrecognized (transit) cell leaves it untouched so later cells for
    /// this hop still verify.
    pub fn recognize(&mut self, payload: &[u8; CELL_BODY_LEN]) -> bool {
        if payload[1] != 0 || payload[2] != 0 {
            return false;
        }

        let mut scratch = *payload;
        scratch[RELAY_DIGEST_RANGE].fill(0);

        let mut advanced = self.digest.clone();
        advanced.update(&scratch[..]);
        let snapshot = advanced.clone().finalize();

        if snapshot[..4] == payload[RELAY_DIGEST_RANGE] {
            self.digest = advanced;
            true
        } else {
            false
        }
    }
}

/// Both directions of one hop's relay crypto.
pub struct HopCrypto {
    /// Originator -> exit direction
    pub forward: CryptoState,

    /// Exit -> originator direction
    pub backward: CryptoState,

    /// KH handshake secret retained from the KDF
    pub kh: [u8; 20],
}

impl HopCrypto {
    pub fn from_material(material: &KeyMaterial) -> Self {
        Self {
            forward: CryptoState::new(&material.forward_key, &material.forward_digest),
            backward: CryptoState::new(&material.backward_key, &material.backward_digest),
            kh: material.kh,
        }
    }

    /// Relay side, forward direction: peel our layer and test recognition.
    /// Returns true when the cell is addressed to this hop.
    pub fn decrypt_forward(&mut self, payload: &mut [u8; CELL_BODY_LEN]) -> bool {
        self.forward.apply(payload);
        self.forward.recognize(payload)
    }

    /// Relay side, backward direction: add our layer to a transit cell.
    pub fn encrypt_backward(&mut self, payload: &mut [u8; CELL_BODY_LEN]) {
        self.backward.apply(payload);
    }

    /// Relay side: originate a backward cell at this hop (digest stamp, then
    /// our backward layer).
    pub fn seal_backward(&mut self, payload: &mut [u8; CELL_BODY_LEN]) {
        self.backward.seal(payload);
        self.backward.apply(payload);
    }
}

/// Originator-side onion crypto over every hop of a circuit, in traversal
/// order (entry first).
pub struct OriginCrypto {
    hops: Vec<HopCrypto>,
}

impl OriginCrypto {
    pub fn new(hops: Vec<HopCrypto>) -> Self {
        Self { hops }
    }

    pub fn hop_count(&self) -> usize {
        self.hops.len()
    }

    /// Append a newly negotiated hop (after EXTENDED2).
    pub fn push_hop(&mut self, hop: HopCrypto) {
        self.hops.push(hop);
    }

    /// Encrypt a forward relay payload addressed to `target`.
    ///
    /// The payload is stamped with the target hop's forward digest, then
    /// wrapped with each hop's forward key from the target outward.
    pub fn encrypt_forward(&mut self, target: usize, payload: &mut [u8; CELL_BODY_LEN]) {
        self.hops[target].forward.seal(payload);
        for hop in self.hops[..=target].iter_mut().rev() {
            hop.forward.apply(payload);
        }
    }

    /// Peel a backward relay payload one hop at a time.
    ///
    /// Returns the index of the hop that originated the cell, or `None` when
    /// no hop recognizes it.
    pub fn decrypt_backward(&mut self, payload: &mut [u8; CELL_BODY_LEN]) -> Option<usize> {
        for (index, hop) in self.hops.iter_mut().enumerate() {
            hop.backward.apply(payload);
            if hop.backward.recognize(payload) {
                return Some(index);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::cell::{RelayCell, RelayCommand};

    fn material(tag: u8) -> KeyMaterial {
        KeyMaterial::derive(&[tag; 32]).unwrap()
    }

    /// A mirrored (originator, relay) pair sharing one hop's keys.
    fn hop_pair(tag: u8) -> (HopCrypto, HopCrypto) {
        let m = material(tag);
        (HopCrypto::from_material(&m), HopCrypto::from_material(&m))
    }

    fn payload_for(command: RelayCommand, stream_id: u16, data: &[u8]) -> [u8; CELL_BODY_LEN] {
        RelayCell::new(command, stream_id, data.to_vec())
            .encode()
            .unwrap()
    }

    #[test]
    fn test_kdf_layout_and_determinism() {
        let a = material(1);
        let b = material(1);
        assert_eq!(a.forward_key, b.forward_key);
        assert_eq!(a.kh, b.kh);

        // The five output segments are pairwise distinct.
        assert_ne!(a.forward_key, a.backward_key);
        assert_ne!(a.forward_digest, a.backward_digest);
        assert_ne!(&a.forward_digest[..16], &a.forward_key[..]);
    }

    #[test]
    fn test_seal_then_recognize_single_hop() {
        let (mut origin, mut relay) = hop_pair(7);

        let mut payload = payload_for(RelayCommand::Data, 3, b"hello");
        origin.forward.seal(&mut payload);
        origin.forward.apply(&mut payload);

        assert!(relay.decrypt_forward(&mut payload));
        let cell = RelayCell::decode(&payload).unwrap();
        assert_eq!(cell.command, RelayCommand::Data);
        assert_eq!(cell.data, b"hello");
    }

    #[test]
    fn test_recognized_at_intended_hop_only() {
        let (o0, mut r0) = hop_pair(10);
        let (o1, mut r1) = hop_pair(11);
        let (o2, mut r2) = hop_pair(12);
        let mut origin = OriginCrypto::new(vec![o0, o1, o2]);

        let mut payload = payload_for(RelayCommand::Begin, 1, b"example.com:443\0");
        origin.encrypt_forward(2, &mut payload);

        assert!(!r0.decrypt_forward(&mut payload));
        assert!(!r1.decrypt_forward(&mut payload));
        assert!(r2.decrypt_forward(&mut payload));
    }

    #[test]
    fn test_onion_symmetry_backward() {
        let (o0, mut r0) = hop_pair(20);
        let (o1, mut r1) = hop_pair(21);
        let (o2, mut r2) = hop_pair(22);
        let mut origin = OriginCrypto::new(vec![o0, o1, o2]);

        // The exit originates a backward cell; each hop inward adds a layer.
        let mut payload = payload_for(RelayCommand::Connected, 1, &[]);
        let expected = RelayCell::decode(&payload).unwrap();
        r2.seal_backward(&mut payload);
        r1.encrypt_backward(&mut payload);
        r0.encrypt_backward(&mut payload);

        let hop = origin.decrypt_backward(&mut payload);
        assert_eq!(hop, Some(2));
        let mut cell = RelayCell::decode(&payload).unwrap();
        cell.digest = [0; 4];
        assert_eq!(cell, expected);
    }

    #[test]
    fn test_running_digest_orders_cells() {
        let (mut origin, mut relay) = hop_pair(30);

        let mut first = payload_for(RelayCommand::Data, 1, b"one");
        let mut second = payload_for(RelayCommand::Data, 1, b"two");
        origin.forward.seal(&mut first);
        origin.forward.seal(&mut second);

        // Delivered in order, both recognize.
        assert!(relay.forward.recognize(&first));
        assert!(relay.forward.recognize(&second));

        // A replay of the first cell no longer matches the advanced digest.
        assert!(!relay.forward.recognize(&first));
    }

    #[test]
    fn test_transit_cell_leaves_digest_untouched() {
        let (mut origin, mut relay) = hop_pair(40);

        // A cell for a later hop: encrypted but not stamped for this one.
        let mut transit = payload_for(RelayCommand::Data, 9, b"not for you");
        transit[1] = 0xde; // nonzero recognized field after decryption
        assert!(!relay.forward.recognize(&transit));

        // A real cell still verifies afterwards.
        let mut own = payload_for(RelayCommand::Data, 1, b"mine");
        origin.forward.seal(&mut own);
        assert!(relay.forward.recognize(&own));
    }
}
