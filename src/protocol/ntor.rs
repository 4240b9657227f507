//! ntor handshake implementation
//!
//! Implements both roles of the ntor (ntor1) key exchange used for circuit
//! creation: the server side answers CREATE2 cells, the client side builds
//! the CREATE2 payload a relay forwards while extending a circuit.
//!
//! Security: AUTH verification uses a constant-time comparison, and weak
//! Diffie-Hellman outputs are rejected.

use crate::error::{RelayError, Result};
use crate::protocol::crypto::KeyMaterial;
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use subtle::ConstantTimeEq;
use x25519_dalek::{PublicKey, SharedSecret, StaticSecret};
use zeroize::Zeroizing;

type HmacSha256 = Hmac<sha2::Sha256>;

const PROTOID: &[u8] = b"ntor-curve25519-sha256-1";
const T_KEY: &[u8] = b"ntor-curve25519-sha256-1:key_extract";
const T_VERIFY: &[u8] = b"ntor-curve25519-sha256-1:verify";
const T_MAC: &[u8] = b"ntor-curve25519-sha256-1:mac";
const SERVER: &[u8] = b"Server";

/// CREATE2 handshake-type value for ntor.
pub const NTOR_HANDSHAKE_TYPE: u16 = 2;

/// Client handshake data: ID(20) | B(32) | X(32).
pub const CLIENT_HANDSHAKE_LEN: usize = 84;

/// Server reply data: Y(32) | AUTH(32).
pub const SERVER_REPLY_LEN: usize = 64;

fn hmac_over(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

fn checked_dh(secret: &StaticSecret, public: &PublicKey) -> Result<SharedSecret> {
    let shared = secret.diffie_hellman(public);
    if !shared.was_contributory() {
        return Err(RelayError::Crypto("weak ntor peer key".into()));
    }
    Ok(shared)
}

/// KEY_SEED and AUTH from the shared secret inputs.
///
/// secret_input = EXP1 | EXP2 | ID | B | X | Y | PROTOID
/// auth_input   = verify | ID | B | Y | X | PROTOID | "Server"
fn seed_and_auth(
    exp1: &SharedSecret,
    exp2: &SharedSecret,
    id: &[u8; 20],
    b: &PublicKey,
    x: &PublicKey,
    y: &PublicKey,
) -> ([u8; 32], [u8; 32]) {
    let mut secret_input = Zeroizing::new(Vec::with_capacity(32 * 4 + 20 + PROTOID.len()));
    secret_input.extend_from_slice(exp1.as_bytes());
    secret_input.extend_from_slice(exp2.as_bytes());
    secret_input.extend_from_slice(id);
    secret_input.extend_from_slice(b.as_bytes());
    secret_input.extend_from_slice(x.as_bytes());
    secret_input.extend_from_slice(y.as_bytes());
    secret_input.extend_from_slice(PROTOID);

    let key_seed = hmac_over(T_KEY, &secret_input);
    let verify = hmac_over(T_VERIFY, &secret_input);

    let mut auth_input = Vec::with_capacity(32 * 4 + 20 + PROTOID.len() + SERVER.len());
    auth_input.extend_from_slice(&verify);
    auth_input.extend_from_slice(id);
    auth_input.extend_from_slice(b.as_bytes());
    auth_input.extend_from_slice(y.as_bytes());
    auth_input.extend_from_slice(x.as_bytes());
    auth_input.extend_from_slice(PROTOID);
    auth_input.extend_from_slice(SERVER);

    let auth = hmac_over(T_MAC, &auth_input);
    (key_seed, auth)
}

/// Client role: originates a CREATE2 toward a known relay.
pub struct ClientHandshake {
    secret: StaticSecret,
    public: PublicKey,
    server_id: [u8; 20],
    server_onion_key: PublicKey,
}

impl ClientHandshake {
    /// Start a handshake toward the relay with the given identity digest and
    /// ntor onion key. A fresh ephemeral X is drawn.
    pub fn new(server_id: [u8; 20], server_onion_key: PublicKey) -> Self {
        Self::with_secret(StaticSecret::random_from_rng(OsRng), server_id, server_onion_key)
    }

    /// Start with a caller-supplied ephemeral secret.
    pub fn with_secret(
        secret: StaticSecret,
        server_id: [u8; 20],
        server_onion_key: PublicKey,
    ) -> Self {
        let public = PublicKey::from(&secret);
        Self {
            secret,
            public,
            server_id,
            server_onion_key,
        }
    }

    /// CREATE2 handshake data: ID | B | X.
    pub fn handshake_data(&self) -> [u8; CLIENT_HANDSHAKE_LEN] {
        let mut data = [0u8; CLIENT_HANDSHAKE_LEN];
        data[0..20].copy_from_slice(&self.server_id);
        data[20..52].copy_from_slice(self.server_onion_key.as_bytes());
        data[52..84].copy_from_slice(self.public.as_bytes());
        data
    }

    /// Process the CREATED2 reply (Y | AUTH) and derive the hop keys.
    pub fn complete(self, reply: &[u8]) -> Result<KeyMaterial> {
        if reply.len() < SERVER_REPLY_LEN {
            return Err(RelayError::HandshakeFailed(format!(
                "CREATED2 data too short: {} bytes",
                reply.len()
            )));
        }

        let mut y_bytes = [0u8; 32];
        y_bytes.copy_from_slice(&reply[0..32]);
        let server_public = PublicKey::from(y_bytes);

        let exp_yx = checked_dh(&self.secret, &server_public)?;
        let exp_bx = checked_dh(&self.secret, &self.server_onion_key)?;
        let (key_seed, auth) = seed_and_auth(
            &exp_yx,
            &exp_bx,
            &self.server_id,
            &self.server_onion_key,
            &self.public,
            &server_public,
        );

        let auth_valid: bool = auth.ct_eq(&reply[32..64]).into();
        if !auth_valid {
            return Err(RelayError::HandshakeFailed(
                "server AUTH verification failed".into(),
            ));
        }

        KeyMaterial::derive(&key_seed)
    }
}

/// Server role: answers CREATE2 cells addressed to this relay.
pub struct ServerHandshake<'a> {
    onion_secret: &'a StaticSecret,
    onion_public: PublicKey,
    identity_digest: [u8; 20],
}

impl<'a> ServerHandshake<'a> {
    pub fn new(onion_secret: &'a StaticSecret, identity_digest: [u8; 20]) -> Self {
        Self {
            onion_secret,
            onion_public: PublicKey::from(onion_secret),
            identity_digest,
        }
    }

    /// Answer a CREATE2 handshake with a fresh ephemeral Y.
    pub fn respond(&self, client_data: &[u8]) -> Result<([u8; SERVER_REPLY_LEN], KeyMaterial)> {
        self.respond_with(StaticSecret::random_from_rng(OsRng), client_data)
    }

    /// Answer with a caller-supplied ephemeral secret.
    pub fn respond_with(
        &self,
        ephemeral: StaticSecret,
        client_data: &[u8],
    ) -> Result<([u8; SERVER_REPLY_LEN], KeyMaterial)> {
        if client_data.len() < CLIENT_HANDSHAKE_LEN {
            return Err(RelayError::HandshakeFailed(format!(
                "CREATE2 data too short: {} bytes",
                client_data.len()
            )));
        }

        // The client names the relay it thinks it is talking to; a mismatch
        // means the cell was misrouted or the client is working from a stale
        // descriptor.
        if client_data[0..20] != self.identity_digest {
            return Err(RelayError::HandshakeFailed(
                "CREATE2 names a different relay identity".into(),
            ));
        }
        if client_data[20..52] != self.onion_public.as_bytes()[..] {
            return Err(RelayError::HandshakeFailed(
                "CREATE2 names an unknown onion key".into(),
            ));
        }

        let mut x_bytes = [0u8; 32];
        x_bytes.copy_from_slice(&client_data[52..84]);
        let client_public = PublicKey::from(x_bytes);

        let server_public = PublicKey::from(&ephemeral);
        let exp_xy = checked_dh(&ephemeral, &client_public)?;
        let exp_xb = checked_dh(self.onion_secret, &client_public)?;
        let (key_seed, auth) = seed_and_auth(
            &exp_xy,
            &exp_xb,
            &self.identity_digest,
            &self.onion_public,
            &client_public,
            &server_public,
        );

        let mut reply = [0u8; SERVER_REPLY_LEN];
        reply[0..32].copy_from_slice(server_public.as_bytes());
        reply[32..64].copy_from_slice(&auth);

        Ok((reply, KeyMaterial::derive(&key_seed)?))
    }
}
