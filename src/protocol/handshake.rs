//! Link handshake state machine
//!
//! Drives the in-protocol (v3+) link handshake over a fresh TLS connection:
//! VERSIONS negotiation, CERTS exchange and validation, the AUTH_CHALLENGE /
//! AUTHENTICATE round, and the closing NETINFO. The responder side accepts
//! both authenticated relays and unauthenticated clients; the initiator side
//! always authenticates.
//!
//! Any cell arriving out of sequence, and any validation failure, is fatal
//! for the connection: no partial state survives.

use crate::error::{RelayError, Result};
use crate::keys::RelayKeys;
use crate::protocol::cell::{read_cell, write_cell, Cell, CellCommand, LinkVersion};
use crate::protocol::certs::{validate_certs, CertsCell, ValidatedPeer};
use crate::protocol::netinfo::Netinfo;
use ed25519_dalek::{Signature, Signer, Verifier, VerifyingKey};
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::net::SocketAddr;
use std::time::SystemTime;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

/// Link protocol versions this relay speaks.
pub const SUPPORTED_VERSIONS: &[LinkVersion] = &[3, 4, 5];

/// RSA-SHA256-TLSSecret link authentication.
pub const AUTH_METHOD_RSA_TLS_SECRET: u16 = 1;

/// Ed25519-SHA256-RFC5705 link authentication.
pub const AUTH_METHOD_ED25519_RFC5705: u16 = 3;

/// Fixed-size prefix of an AUTHENTICATE body, before the signature:
/// TYPE(8) + CID(32) + SID(32) + SLOG(32) + CLOG(32) + SCERT(32) +
/// TLSSECRETS(32) + RAND(8) + NONCE(24).
const AUTH_BODY_LEN: usize = 8 + 32 * 6 + 8 + 24;

/// Handshake states, shared by both roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    ExpectVersions,
    ExpectCerts,
    ExpectAuthChallenge,
    ExpectAuthenticate,
    ExpectNetinfo,
    Established,
}

impl std::fmt::Display for LinkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            LinkState::ExpectVersions => "ExpectVersions",
            LinkState::ExpectCerts => "ExpectCerts",
            LinkState::ExpectAuthChallenge => "ExpectAuthChallenge",
            LinkState::ExpectAuthenticate => "ExpectAuthenticate",
            LinkState::ExpectNetinfo => "ExpectNetinfo",
            LinkState::Established => "Established",
        };
        f.write_str(name)
    }
}

/// Who the peer turned out to be once the handshake finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerIdentity {
    /// Did not authenticate: treated as a client.
    Client,

    /// Authenticated relay.
    Relay {
        rsa_identity_digest: [u8; 20],
        ed25519_identity: Option<[u8; 32]>,
    },
}

/// TLS session material the handshake binds its authentication to.
///
/// The TLS layer fills this in; tests inject fixed values. `exporter` is the
/// RFC5705 keying material used by method 3. `master_secret_binding` is the
/// master-secret HMAC that method 1 signs over; a TLS stack that cannot
/// expose it (TLS 1.3) leaves it `None` and method 1 is not offered.
#[derive(Debug, Clone)]
pub struct LinkSecrets {
    pub exporter: [u8; 32],
    pub master_secret_binding: Option<[u8; 32]>,
    pub local_cert_der: Vec<u8>,
    pub peer_cert_der: Option<Vec<u8>>,
}

impl LinkSecrets {
    fn tls_secrets(&self, method: u16) -> Result<[u8; 32]> {
        match method {
            AUTH_METHOD_ED25519_RFC5705 => Ok(self.exporter),
            AUTH_METHOD_RSA_TLS_SECRET => self.master_secret_binding.ok_or_else(|| {
                RelayError::AuthFailed("TLS stack exposes no master secret for method 1".into())
            }),
            other => Err(RelayError::AuthFailed(format!(
                "unknown auth method {}",
                other
            ))),
        }
    }
}

/// Result of a completed link handshake.
#[derive(Debug, Clone)]
pub struct LinkEstablished {
    pub version: LinkVersion,
    pub peer: PeerIdentity,

    /// Peer clock from its NETINFO.
    pub peer_timestamp: u32,
}

/// AUTH_CHALLENGE cell body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthChallenge {
    pub challenge: [u8; 32],
    pub methods: Vec<u16>,
}

impl AuthChallenge {
    /// Build a challenge for the given methods with fresh randomness.
    pub fn new(methods: Vec<u16>) -> Self {
        let mut challenge = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut challenge);
        Self { challenge, methods }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(34 + 2 * self.methods.len());
        out.extend_from_slice(&self.challenge);
        out.extend_from_slice(&(self.methods.len() as u16).to_be_bytes());
        for method in &self.methods {
            out.extend_from_slice(&method.to_be_bytes());
        }
        out
    }

    /// Parse a challenge. Bytes past the advertised method list are ignored,
    /// as tor-spec instructs initiators to do.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < 34 {
            return Err(RelayError::AuthFailed("AUTH_CHALLENGE too short".into()));
        }
        let mut challenge = [0u8; 32];
        challenge.copy_from_slice(&data[..32]);
        let n_methods = u16::from_be_bytes([data[32], data[33]]) as usize;
        if data.len() < 34 + 2 * n_methods {
            return Err(RelayError::AuthFailed(
                "AUTH_CHALLENGE method list truncated".into(),
            ));
        }
        let methods = data[34..34 + 2 * n_methods]
            .chunks_exact(2)
            .map(|c| u16::from_be_bytes([c[0], c[1]]))
            .collect();
        Ok(Self { challenge, methods })
    }
}

/// AUTHENTICATE cell body: auth-type, auth-len, authenticator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authenticate {
    pub method: u16,
    pub authenticator: Vec<u8>,
}

impl Authenticate {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + self.authenticator.len());
        out.extend_from_slice(&self.method.to_be_bytes());
        out.extend_from_slice(&(self.authenticator.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.authenticator);
        out
    }

    /// Parse an AUTHENTICATE cell. Trailing bytes are tolerated and ignored.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < 4 {
            return Err(RelayError::AuthFailed("AUTHENTICATE too short".into()));
        }
        let method = u16::from_be_bytes([data[0], data[1]]);
        let auth_len = u16::from_be_bytes([data[2], data[3]]) as usize;
        if data.len() < 4 + auth_len {
            return Err(RelayError::AuthFailed(
                "inconsistent AUTHENTICATE length".into(),
            ));
        }
        Ok(Self {
            method,
            authenticator: data[4..4 + auth_len].to_vec(),
        })
    }
}

/// The pieces both sides can compute and must agree on inside an
/// authenticator body.
struct AuthMaterial {
    method: u16,
    /// SHA-256 of the initiator's RSA identity key
    cid: [u8; 32],
    /// SHA-256 of the responder's RSA identity key
    sid: [u8; 32],
    /// SHA-256 of the CERTS cell the responder sent
    slog: [u8; 32],
    /// SHA-256 of the CERTS cell the initiator sent
    clog: [u8; 32],
    /// SHA-256 of the responder's TLS link certificate
    scert: [u8; 32],
    /// TLS session binding for the chosen method
    tls_secrets: [u8; 32],
}

impl AuthMaterial {
    fn type_tag(&self) -> [u8; 8] {
        let tag = format!("AUTH{:04}", self.method);
        tag.as_bytes().try_into().expect("tag is 8 bytes")
    }

    /// Unsigned body prefix with fresh randomness appended.
    fn body(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(AUTH_BODY_LEN);
        out.extend_from_slice(&self.type_tag());
        out.extend_from_slice(&self.cid);
        out.extend_from_slice(&self.sid);
        out.extend_from_slice(&self.slog);
        out.extend_from_slice(&self.clog);
        out.extend_from_slice(&self.scert);
        out.extend_from_slice(&self.tls_secrets);
        let mut rand_tail = [0u8; 8 + 24];
        rand::rngs::OsRng.fill_bytes(&mut rand_tail);
        out.extend_from_slice(&rand_tail);
        out
    }

    /// Build and sign the full authenticator.
    fn sign(&self, keys: &RelayKeys) -> Result<Vec<u8>> {
        let mut body = self.body();
        let signature = match self.method {
            AUTH_METHOD_ED25519_RFC5705 => keys.ed_signing_key().sign(&body).to_bytes().to_vec(),
            AUTH_METHOD_RSA_TLS_SECRET => keys.sign_rsa_sha256(&body)?,
            other => {
                return Err(RelayError::AuthFailed(format!(
                    "cannot sign auth method {}",
                    other
                )))
            }
        };
        body.extend_from_slice(&signature);
        Ok(body)
    }

    /// Check a received authenticator against the expected fields and verify
    /// its signature under the peer's keys.
    fn verify(&self, authenticator: &[u8], peer: &ValidatedPeer) -> Result<()> {
        if authenticator.len() <= AUTH_BODY_LEN {
            return Err(RelayError::AuthFailed("authenticator too short".into()));
        }
        let (prefix, signature) = authenticator.split_at(AUTH_BODY_LEN);

        let checks: [(&[u8], &[u8], &str); 7] = [
            (&prefix[0..8], &self.type_tag(), "type tag"),
            (&prefix[8..40], &self.cid, "client identity"),
            (&prefix[40..72], &self.sid, "server identity"),
            (&prefix[72..104], &self.slog, "server cert log"),
            (&prefix[104..136], &self.clog, "client cert log"),
            (&prefix[136..168], &self.scert, "link certificate"),
            (&prefix[168..200], &self.tls_secrets, "TLS binding"),
        ];
        for (got, want, what) in checks {
            if got != want {
                return Err(RelayError::AuthFailed(format!("{} mismatch", what)));
            }
        }

        match self.method {
            AUTH_METHOD_ED25519_RFC5705 => {
                let key_bytes = peer.ed25519_signing.ok_or_else(|| {
                    RelayError::AuthFailed("peer offered no ed25519 signing key".into())
                })?;
                let key = VerifyingKey::from_bytes(&key_bytes)
                    .map_err(|e| RelayError::AuthFailed(format!("bad signing key: {}", e)))?;
                let signature: [u8; 64] = signature
                    .try_into()
                    .map_err(|_| RelayError::AuthFailed("bad ed25519 signature length".into()))?;
                key.verify(prefix, &Signature::from_bytes(&signature))
                    .map_err(|e| RelayError::AuthFailed(format!("signature invalid: {}", e)))
            }
            AUTH_METHOD_RSA_TLS_SECRET => {
                let verifier =
                    rsa::pkcs1v15::VerifyingKey::<Sha256>::new(peer.rsa_identity.clone());
                let signature = rsa::pkcs1v15::Signature::try_from(signature)
                    .map_err(|e| RelayError::AuthFailed(format!("bad RSA signature: {}", e)))?;
                verifier
                    .verify(prefix, &signature)
                    .map_err(|e| RelayError::AuthFailed(format!("signature invalid: {}", e)))
            }
            other => Err(RelayError::AuthFailed(format!(
                "unsupported auth method {}",
                other
            ))),
        }
    }
}

/// Select `max(common)` of two version lists.
pub fn negotiate_version(ours: &[LinkVersion], theirs: &[LinkVersion]) -> Result<LinkVersion> {
    theirs
        .iter()
        .filter(|v| ours.contains(v))
        .max()
        .copied()
        .ok_or(RelayError::VersionMismatch)
}

/// One link handshake, either role.
pub struct LinkHandshake<'a> {
    keys: &'a RelayKeys,
    secrets: LinkSecrets,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
}

impl<'a> LinkHandshake<'a> {
    pub fn new(
        keys: &'a RelayKeys,
        secrets: LinkSecrets,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
    ) -> Self {
        Self {
            keys,
            secrets,
            local_addr,
            peer_addr,
        }
    }

    /// Read one cell and require it to carry `expected`.
    async fn expect<S>(&self, stream: &mut S, version: LinkVersion, state: LinkState) -> Result<Cell>
    where
        S: AsyncRead + Unpin,
    {
        let cell = read_cell(stream, version).await?;
        let ok = matches!(
            (state, cell.command),
            (LinkState::ExpectVersions, CellCommand::Versions)
                | (LinkState::ExpectCerts, CellCommand::Certs)
                | (LinkState::ExpectAuthChallenge, CellCommand::AuthChallenge)
                | (LinkState::ExpectAuthenticate, CellCommand::Authenticate)
                | (LinkState::ExpectNetinfo, CellCommand::Netinfo)
        );
        if !ok {
            return Err(RelayError::NegotiationViolation {
                command: format!("{:?}", cell.command),
                state: state.to_string(),
            });
        }
        Ok(cell)
    }

    fn our_netinfo(&self) -> Cell {
        let netinfo = Netinfo::for_link(self.peer_addr.ip(), &[self.local_addr.ip()]);
        Cell::new(0, CellCommand::Netinfo, netinfo.encode())
    }

    /// Responder side: we accepted the TLS connection.
    pub async fn respond<S>(&self, stream: &mut S) -> Result<LinkEstablished>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        write_cell(stream, &Cell::versions(SUPPORTED_VERSIONS), 3).await?;
        stream.flush().await?;

        let cell = self.expect(stream, 3, LinkState::ExpectVersions).await?;
        let peer_versions = Cell::parse_versions(&cell.payload)?;
        let version = negotiate_version(SUPPORTED_VERSIONS, &peer_versions)?;
        log::debug!("link to {}: negotiated version {}", self.peer_addr, version);

        // CERTS, AUTH_CHALLENGE and NETINFO go out back to back.
        let certs_cell = Cell::new(0, CellCommand::Certs, self.keys.certs_cell().encode());
        let slog: [u8; 32] = Sha256::digest(certs_cell.encode(version)?).into();
        write_cell(stream, &certs_cell, version).await?;

        let mut methods = vec![AUTH_METHOD_ED25519_RFC5705];
        if self.secrets.master_secret_binding.is_some() {
            methods.insert(0, AUTH_METHOD_RSA_TLS_SECRET);
        }
        let challenge = AuthChallenge::new(methods.clone());
        write_cell(
            stream,
            &Cell::new(0, CellCommand::AuthChallenge, challenge.encode()),
            version,
        )
        .await?;
        write_cell(stream, &self.our_netinfo(), version).await?;
        stream.flush().await?;

        // The peer now either authenticates (CERTS + AUTHENTICATE + NETINFO)
        // or closes with a bare NETINFO like a client.
        let cell = read_cell(stream, version).await?;
        match cell.command {
            CellCommand::Netinfo => {
                let netinfo = Netinfo::decode(&cell.payload)?;
                log::info!("link from {}: unauthenticated client", self.peer_addr);
                Ok(LinkEstablished {
                    version,
                    peer: PeerIdentity::Client,
                    peer_timestamp: netinfo.timestamp,
                })
            }
            CellCommand::Certs => {
                let peer_certs = CertsCell::decode(&cell.payload)?;
                let clog: [u8; 32] = Sha256::digest(cell.encode(version)?).into();
                let validated = validate_certs(
                    &peer_certs,
                    self.secrets.peer_cert_der.as_deref(),
                    SystemTime::now(),
                )?;

                let cell = self
                    .expect(stream, version, LinkState::ExpectAuthenticate)
                    .await?;
                let auth = Authenticate::decode(&cell.payload)?;
                if !methods.contains(&auth.method) {
                    return Err(RelayError::AuthFailed(format!(
                        "method {} was not offered",
                        auth.method
                    )));
                }
                let material = AuthMaterial {
                    method: auth.method,
                    cid: validated.rsa_identity_sha256,
                    sid: self.keys.rsa_identity_sha256(),
                    slog,
                    clog,
                    scert: Sha256::digest(&self.secrets.local_cert_der).into(),
                    tls_secrets: self.secrets.tls_secrets(auth.method)?,
                };
                material.verify(&auth.authenticator, &validated)?;

                let cell = self
                    .expect(stream, version, LinkState::ExpectNetinfo)
                    .await?;
                let netinfo = Netinfo::decode(&cell.payload)?;
                log::info!(
                    "link from {}: authenticated relay {}",
                    self.peer_addr,
                    hex::encode(validated.rsa_identity_digest)
                );
                Ok(LinkEstablished {
                    version,
                    peer: PeerIdentity::Relay {
                        rsa_identity_digest: validated.rsa_identity_digest,
                        ed25519_identity: validated.ed25519_identity,
                    },
                    peer_timestamp: netinfo.timestamp,
                })
            }
            other => Err(RelayError::NegotiationViolation {
                command: format!("{:?}", other),
                state: LinkState::ExpectCerts.to_string(),
            }),
        }
    }

    /// Initiator side: we dialed the TLS connection and always authenticate.
    pub async fn initiate<S>(&self, stream: &mut S) -> Result<LinkEstablished>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        write_cell(stream, &Cell::versions(SUPPORTED_VERSIONS), 3).await?;
        stream.flush().await?;

        let cell = self.expect(stream, 3, LinkState::ExpectVersions).await?;
        let peer_versions = Cell::parse_versions(&cell.payload)?;
        let version = negotiate_version(SUPPORTED_VERSIONS, &peer_versions)?;

        let cell = self.expect(stream, version, LinkState::ExpectCerts).await?;
        let peer_certs = CertsCell::decode(&cell.payload)?;
        let slog: [u8; 32] = Sha256::digest(cell.encode(version)?).into();
        let validated = validate_certs(
            &peer_certs,
            self.secrets.peer_cert_der.as_deref(),
            SystemTime::now(),
        )?;

        let cell = self
            .expect(stream, version, LinkState::ExpectAuthChallenge)
            .await?;
        let challenge = AuthChallenge::decode(&cell.payload)?;

        let cell = self
            .expect(stream, version, LinkState::ExpectNetinfo)
            .await?;
        let netinfo = Netinfo::decode(&cell.payload)?;

        // Pick the strongest offered method we can produce.
        let method = if challenge.methods.contains(&AUTH_METHOD_ED25519_RFC5705) {
            AUTH_METHOD_ED25519_RFC5705
        } else if challenge.methods.contains(&AUTH_METHOD_RSA_TLS_SECRET)
            && self.secrets.master_secret_binding.is_some()
        {
            AUTH_METHOD_RSA_TLS_SECRET
        } else {
            return Err(RelayError::AuthFailed(format!(
                "no usable auth method in {:?}",
                challenge.methods
            )));
        };

        let certs_cell = Cell::new(0, CellCommand::Certs, self.keys.certs_cell().encode());
        let clog: [u8; 32] = Sha256::digest(certs_cell.encode(version)?).into();
        write_cell(stream, &certs_cell, version).await?;

        // The responder's link certificate: prefer the TLS certificate we
        // actually saw, falling back to the one from its CERTS cell.
        let scert_input = match self.secrets.peer_cert_der.as_deref() {
            Some(der) => der.to_vec(),
            None => {
                peer_certs
                    .get(crate::protocol::certs::CERT_LINK_X509)
                    .ok_or_else(|| RelayError::CertInvalid("missing link certificate".into()))?
                    .body
                    .clone()
            }
        };

        let material = AuthMaterial {
            method,
            cid: self.keys.rsa_identity_sha256(),
            sid: validated.rsa_identity_sha256,
            slog,
            clog,
            scert: Sha256::digest(&scert_input).into(),
            tls_secrets: self.secrets.tls_secrets(method)?,
        };
        let authenticate = Authenticate {
            method,
            authenticator: material.sign(self.keys)?,
        };
        write_cell(
            stream,
            &Cell::new(0, CellCommand::Authenticate, authenticate.encode()),
            version,
        )
        .await?;
        write_cell(stream, &self.our_netinfo(), version).await?;
        stream.flush().await?;

        log::info!(
            "link to {}: established, relay {}",
            self.peer_addr,
            hex::encode(validated.rsa_identity_digest)
        );
        Ok(LinkEstablished {
            version,
            peer: PeerIdentity::Relay {
                rsa_identity_digest: validated.rsa_identity_digest,
                ed25519_identity: validated.ed25519_identity,
            },
            peer_timestamp: netinfo.timestamp,
        })
    }
}
