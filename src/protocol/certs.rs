//! Certificate chains for the link handshake
//!
//! This module implements parsing, construction and verification of the
//! certificate material exchanged in CERTS cells: X.509 certificates for the
//! RSA identity and link keys, Ed25519 certificates in Tor's own format, and
//! the RSA-to-Ed25519 cross-certificate. Without this validation an attacker
//! could impersonate any relay.

use crate::error::{RelayError, Result};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rsa::pkcs1::EncodeRsaPublicKey;
use rsa::pkcs8::DecodePublicKey;
use rsa::signature::{SignatureEncoding, Signer as RsaSigner};
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha1::{Digest, Sha1};
use sha2::Sha256;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use x509_cert::der::{Decode, Encode};

/// Certificate types carried in a CERTS cell.
pub const CERT_LINK_X509: u8 = 1;
pub const CERT_ID_X509: u8 = 2;
pub const CERT_AUTH_X509: u8 = 3;
pub const CERT_SIGNING_BY_ED_ID: u8 = 4;
pub const CERT_TLS_LINK_BY_SIGNING: u8 = 5;
pub const CERT_AUTH_BY_SIGNING: u8 = 6;
pub const CERT_RSA_ED_CROSSCERT: u8 = 7;

/// Certified-key types inside an Ed25519 certificate.
pub const KEY_TYPE_ED25519: u8 = 1;
pub const KEY_TYPE_SHA256_X509: u8 = 3;

/// Extension type naming the key that signed the certificate.
const EXT_SIGNED_WITH_ED_KEY: u8 = 4;

/// One entry of a CERTS cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertEntry {
    pub cert_type: u8,
    pub body: Vec<u8>,
}

/// A parsed (or assembled) CERTS cell payload.
#[derive(Debug, Clone, Default)]
pub struct CertsCell {
    pub certs: Vec<CertEntry>,
}

impl CertsCell {
    pub fn new(certs: Vec<CertEntry>) -> Self {
        Self { certs }
    }

    /// Parse a CERTS cell payload: N(1), then N x (type(1), len(2), body).
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.is_empty() {
            return Err(RelayError::CertInvalid("empty CERTS cell".into()));
        }

        let n_certs = data[0] as usize;
        let mut offset = 1;
        let mut certs = Vec::with_capacity(n_certs);

        for i in 0..n_certs {
            if offset + 3 > data.len() {
                return Err(RelayError::CertInvalid(format!(
                    "CERTS cell truncated at certificate {}",
                    i
                )));
            }
            let cert_type = data[offset];
            let len = u16::from_be_bytes([data[offset + 1], data[offset + 2]]) as usize;
            offset += 3;
            if offset + len > data.len() {
                return Err(RelayError::CertInvalid(format!(
                    "certificate {} body truncated",
                    i
                )));
            }
            certs.push(CertEntry {
                cert_type,
                body: data[offset..offset + len].to_vec(),
            });
            offset += len;
        }

        Ok(Self { certs })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.push(self.certs.len() as u8);
        for cert in &self.certs {
            out.push(cert.cert_type);
            out.extend_from_slice(&(cert.body.len() as u16).to_be_bytes());
            out.extend_from_slice(&cert.body);
        }
        out
    }

    pub fn get(&self, cert_type: u8) -> Option<&CertEntry> {
        self.certs.iter().find(|c| c.cert_type == cert_type)
    }
}

/// An Ed25519 certificate in Tor's certificate format.
///
/// Wire layout:
/// VERSION(1)=0x01 | CERT_TYPE(1) | EXPIRATION(4, hours since epoch) |
/// CERT_KEY_TYPE(1) | CERTIFIED_KEY(32) | N_EXTENSIONS(1) | extensions |
/// SIGNATURE(64)
#[derive(Debug, Clone)]
pub struct Ed25519Cert {
    pub cert_type: u8,
    pub expiration_hours: u32,
    pub key_type: u8,
    pub certified_key: [u8; 32],
    /// Signing key, when the signed-with extension is present
    pub signed_with: Option<[u8; 32]>,
    /// Body covered by the signature
    signed_body: Vec<u8>,
    signature: [u8; 64],
}

impl Ed25519Cert {
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < 104 {
            return Err(RelayError::CertInvalid(format!(
                "ed25519 certificate too short: {} bytes",
                data.len()
            )));
        }
        if data[0] != 0x01 {
            return Err(RelayError::CertInvalid(format!(
                "unknown ed25519 certificate version {}",
                data[0]
            )));
        }

        let cert_type = data[1];
        let expiration_hours = u32::from_be_bytes([data[2], data[3], data[4], data[5]]);
        let key_type = data[6];
        let mut certified_key = [0u8; 32];
        certified_key.copy_from_slice(&data[7..39]);

        let n_extensions = data[39];
        let mut offset = 40;
        let mut signed_with = None;

        for _ in 0..n_extensions {
            if offset + 4 > data.len() {
                return Err(RelayError::CertInvalid("extension header truncated".into()));
            }
            let ext_len = u16::from_be_bytes([data[offset], data[offset + 1]]) as usize;
            let ext_type = data[offset + 2];
            offset += 4;
            if offset + ext_len > data.len() {
                return Err(RelayError::CertInvalid("extension body truncated".into()));
            }
            if ext_type == EXT_SIGNED_WITH_ED_KEY && ext_len == 32 {
                let mut key = [0u8; 32];
                key.copy_from_slice(&data[offset..offset + 32]);
                signed_with = Some(key);
            }
            offset += ext_len;
        }

        if data.len() != offset + 64 {
            return Err(RelayError::CertInvalid(format!(
                "expected 64-byte signature at offset {}, cert is {} bytes",
                offset,
                data.len()
            )));
        }

        let mut signature = [0u8; 64];
        signature.copy_from_slice(&data[offset..]);

        Ok(Self {
            cert_type,
            expiration_hours,
            key_type,
            certified_key,
            signed_with,
            signed_body: data[..offset].to_vec(),
            signature,
        })
    }

    /// Build and sign a certificate.
    pub fn build(
        cert_type: u8,
        expiration_hours: u32,
        key_type: u8,
        certified_key: &[u8; 32],
        signer: &SigningKey,
    ) -> Vec<u8> {
        let mut body = Vec::with_capacity(104 + 36);
        body.push(0x01);
        body.push(cert_type);
        body.extend_from_slice(&expiration_hours.to_be_bytes());
        body.push(key_type);
        body.extend_from_slice(certified_key);
        // One extension: the key this certificate is signed with.
        body.push(1);
        body.extend_from_slice(&32u16.to_be_bytes());
        body.push(EXT_SIGNED_WITH_ED_KEY);
        body.push(0); // flags
        body.extend_from_slice(signer.verifying_key().as_bytes());

        let signature = signer.sign(&body);
        body.extend_from_slice(&signature.to_bytes());
        body
    }

    /// Verify the signature under `signing_key` and check expiration.
    pub fn check(&self, signing_key: &[u8; 32], now: SystemTime) -> Result<()> {
        let key = VerifyingKey::from_bytes(signing_key)
            .map_err(|e| RelayError::CertInvalid(format!("bad ed25519 signing key: {}", e)))?;
        key.verify(&self.signed_body, &Signature::from_bytes(&self.signature))
            .map_err(|e| RelayError::CertInvalid(format!("ed25519 signature invalid: {}", e)))?;

        if (self.expiration_hours as u64) < hours_since_epoch(now) {
            return Err(RelayError::CertInvalid(
                "ed25519 certificate expired".into(),
            ));
        }
        Ok(())
    }
}

/// RSA-to-Ed25519 cross-certificate (CERTS type 7).
///
/// Wire layout: ED25519-KEY(32) | EXPIRATION(4, hours) | SIGLEN(1) | SIG.
#[derive(Debug, Clone)]
pub struct RsaCrossCert {
    pub ed_identity: [u8; 32],
    pub expiration_hours: u32,
    signature: Vec<u8>,
}

/// Domain separator for the cross-certificate signature.
const CROSSCERT_PREFIX: &[u8] = b"Tor TLS RSA/Ed25519 cross-certificate";

impl RsaCrossCert {
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < 37 {
            return Err(RelayError::CertInvalid("cross-certificate too short".into()));
        }
        let mut ed_identity = [0u8; 32];
        ed_identity.copy_from_slice(&data[0..32]);
        let expiration_hours = u32::from_be_bytes([data[32], data[33], data[34], data[35]]);
        let sig_len = data[36] as usize;
        if data.len() < 37 + sig_len {
            return Err(RelayError::CertInvalid(
                "cross-certificate signature truncated".into(),
            ));
        }
        Ok(Self {
            ed_identity,
            expiration_hours,
            signature: data[37..37 + sig_len].to_vec(),
        })
    }

    pub fn build(
        ed_identity: &[u8; 32],
        expiration_hours: u32,
        rsa_identity: &RsaPrivateKey,
    ) -> Result<Vec<u8>> {
        let mut body = Vec::with_capacity(36);
        body.extend_from_slice(ed_identity);
        body.extend_from_slice(&expiration_hours.to_be_bytes());

        let signer = rsa::pkcs1v15::SigningKey::<Sha256>::new(rsa_identity.clone());
        let signature = RsaSigner::sign(&signer, &[CROSSCERT_PREFIX, &body].concat()).to_vec();

        let mut out = body;
        out.push(signature.len() as u8);
        out.extend_from_slice(&signature);
        Ok(out)
    }

    pub fn check(&self, rsa_identity: &RsaPublicKey, now: SystemTime) -> Result<()> {
        let mut body = Vec::with_capacity(36);
        body.extend_from_slice(&self.ed_identity);
        body.extend_from_slice(&self.expiration_hours.to_be_bytes());

        let verifier = rsa::pkcs1v15::VerifyingKey::<Sha256>::new(rsa_identity.clone());
        let signature = rsa::pkcs1v15::Signature::try_from(self.signature.as_slice())
            .map_err(|e| RelayError::CertInvalid(format!("bad cross-cert signature: {}", e)))?;
        verifier
            .verify(&[CROSSCERT_PREFIX, &body].concat(), &signature)
            .map_err(|e| RelayError::CertInvalid(format!("cross-cert signature invalid: {}", e)))?;

        if (self.expiration_hours as u64) < hours_since_epoch(now) {
            return Err(RelayError::CertInvalid("cross-certificate expired".into()));
        }
        Ok(())
    }
}

/// Identity information extracted from a validated CERTS cell.
#[derive(Debug, Clone)]
pub struct ValidatedPeer {
    /// SHA-1 of the peer's RSA identity key (PKCS#1 DER): the legacy
    /// identity digest used in EXTEND2 and the descriptor fingerprint.
    pub rsa_identity_digest: [u8; 20],

    /// SHA-256 of the same key, used in AUTHENTICATE bodies.
    pub rsa_identity_sha256: [u8; 32],

    /// The peer's RSA identity key.
    pub rsa_identity: RsaPublicKey,

    /// Ed25519 identity, when the peer presented the Ed25519 chain.
    pub ed25519_identity: Option<[u8; 32]>,

    /// Ed25519 signing key certified by the identity, when present.
    pub ed25519_signing: Option<[u8; 32]>,
}

/// Validate a peer's CERTS cell.
///
/// Checks the RSA identity self-signature, the link certificate binding to
/// the TLS session, and the Ed25519 chain when one is offered. Returns the
/// peer's identity material.
pub fn validate_certs(
    cell: &CertsCell,
    tls_peer_cert_der: Option<&[u8]>,
    now: SystemTime,
) -> Result<ValidatedPeer> {
    let id_cert = cell
        .get(CERT_ID_X509)
        .ok_or_else(|| RelayError::CertInvalid("missing RSA identity certificate".into()))?;
    let rsa_identity = x509_rsa_public_key(&id_cert.body)?;
    verify_x509_rsa(&id_cert.body, &rsa_identity, now)?;

    let link_cert = cell
        .get(CERT_LINK_X509)
        .ok_or_else(|| RelayError::CertInvalid("missing link certificate".into()))?;
    verify_x509_rsa(&link_cert.body, &rsa_identity, now)?;

    // The key the peer proved possession of during TLS must be the one its
    // identity vouched for.
    if let Some(tls_der) = tls_peer_cert_der {
        let link_spki = x509_spki_der(&link_cert.body)?;
        let tls_spki = x509_spki_der(tls_der)?;
        if link_spki != tls_spki {
            return Err(RelayError::CertInvalid(
                "link certificate key does not match the TLS certificate".into(),
            ));
        }
    }

    let pkcs1 = rsa_identity
        .to_pkcs1_der()
        .map_err(|e| RelayError::CertInvalid(format!("unencodable RSA key: {}", e)))?;
    let rsa_identity_digest: [u8; 20] = Sha1::digest(pkcs1.as_bytes()).into();
    let rsa_identity_sha256: [u8; 32] = Sha256::digest(pkcs1.as_bytes()).into();

    let mut ed25519_identity = None;
    let mut ed25519_signing = None;

    if let Some(signing_entry) = cell.get(CERT_SIGNING_BY_ED_ID) {
        let cross_entry = cell.get(CERT_RSA_ED_CROSSCERT).ok_or_else(|| {
            RelayError::CertInvalid("ed25519 chain offered without cross-certificate".into())
        })?;
        let cross = RsaCrossCert::decode(&cross_entry.body)?;
        cross.check(&rsa_identity, now)?;

        let signing_cert = Ed25519Cert::decode(&signing_entry.body)?;
        signing_cert.check(&cross.ed_identity, now)?;
        if signing_cert.cert_type != CERT_SIGNING_BY_ED_ID
            || signing_cert.key_type != KEY_TYPE_ED25519
        {
            return Err(RelayError::CertInvalid(
                "malformed ed25519 signing certificate".into(),
            ));
        }

        if let Some(link_entry) = cell.get(CERT_TLS_LINK_BY_SIGNING) {
            let tls_cert = Ed25519Cert::decode(&link_entry.body)?;
            tls_cert.check(&signing_cert.certified_key, now)?;
            if tls_cert.key_type != KEY_TYPE_SHA256_X509 {
                return Err(RelayError::CertInvalid(
                    "TLS link certificate certifies the wrong key type".into(),
                ));
            }
            if let Some(tls_der) = tls_peer_cert_der {
                let digest: [u8; 32] = Sha256::digest(tls_der).into();
                if digest != tls_cert.certified_key {
                    return Err(RelayError::CertInvalid(
                        "ed25519 chain certifies a different TLS certificate".into(),
                    ));
                }
            }
        }

        ed25519_identity = Some(cross.ed_identity);
        ed25519_signing = Some(signing_cert.certified_key);
    }

    Ok(ValidatedPeer {
        rsa_identity_digest,
        rsa_identity_sha256,
        rsa_identity,
        ed25519_identity,
        ed25519_signing,
    })
}

/// DER of the SubjectPublicKeyInfo inside an X.509 certificate.
pub fn x509_spki_der(cert_der: &[u8]) -> Result<Vec<u8>> {
    let cert = x509_cert::Certificate::from_der(cert_der)
        .map_err(|e| RelayError::CertInvalid(format!("unparseable certificate: {}", e)))?;
    cert.tbs_certificate
        .subject_public_key_info
        .to_der()
        .map_err(|e| RelayError::CertInvalid(format!("unencodable SPKI: {}", e)))
}

/// RSA public key of an X.509 certificate.
pub fn x509_rsa_public_key(cert_der: &[u8]) -> Result<RsaPublicKey> {
    let spki = x509_spki_der(cert_der)?;
    RsaPublicKey::from_public_key_der(&spki)
        .map_err(|e| RelayError::CertInvalid(format!("certificate key is not RSA: {}", e)))
}

/// Verify an X.509 certificate's RSA-SHA256 signature and validity window.
pub fn verify_x509_rsa(cert_der: &[u8], issuer: &RsaPublicKey, now: SystemTime) -> Result<()> {
    let cert = x509_cert::Certificate::from_der(cert_der)
        .map_err(|e| RelayError::CertInvalid(format!("unparseable certificate: {}", e)))?;

    let tbs = cert
        .tbs_certificate
        .to_der()
        .map_err(|e| RelayError::CertInvalid(format!("unencodable tbs: {}", e)))?;
    let sig_bytes = cert
        .signature
        .as_bytes()
        .ok_or_else(|| RelayError::CertInvalid("certificate signature not byte-aligned".into()))?;

    let verifier = rsa::pkcs1v15::VerifyingKey::<Sha256>::new(issuer.clone());
    let signature = rsa::pkcs1v15::Signature::try_from(sig_bytes)
        .map_err(|e| RelayError::CertInvalid(format!("bad certificate signature: {}", e)))?;
    verifier
        .verify(&tbs, &signature)
        .map_err(|e| RelayError::CertInvalid(format!("certificate signature invalid: {}", e)))?;

    let not_after = cert
        .tbs_certificate
        .validity
        .not_after
        .to_system_time();
    if not_after < now {
        return Err(RelayError::CertInvalid("certificate expired".into()));
    }
    let not_before = cert
        .tbs_certificate
        .validity
        .not_before
        .to_system_time();
    if not_before > now + Duration::from_secs(24 * 3600) {
        return Err(RelayError::CertInvalid("certificate not yet valid".into()));
    }

    Ok(())
}

fn hours_since_epoch(now: SystemTime) -> u64 {
    now.duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
        / 3600
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    fn far_future_hours() -> u32 {
        hours_since_epoch(SystemTime::now()) as u32 + 24 * 365
    }

    #[test]
    fn test_certs_cell_roundtrip() {
        let cell = CertsCell::new(vec![
            CertEntry {
                cert_type: CERT_LINK_X509,
                body: vec![1, 2, 3],
            },
            CertEntry {
                cert_type: CERT_ID_X509,
                body: vec![4, 5],
            },
        ]);
        let wire = cell.encode();
        let back = CertsCell::decode(&wire).unwrap();
        assert_eq!(back.certs, cell.certs);
        assert_eq!(back.get(CERT_ID_X509).unwrap().body, vec![4, 5]);
        assert!(back.get(CERT_RSA_ED_CROSSCERT).is_none());
    }

    #[test]
    fn test_certs_cell_malformed() {
        assert!(CertsCell::decode(&[]).is_err());
        assert!(CertsCell::decode(&[0]).unwrap().certs.is_empty());
        // Claims one cert but the header is cut off.
        assert!(CertsCell::decode(&[1, 1]).is_err());
        // Body length exceeds the payload.
        assert!(CertsCell::decode(&[1, 1, 0, 10, 0xff]).is_err());
    }

    #[test]
    fn test_ed25519_cert_roundtrip_and_verify() {
        let identity = SigningKey::generate(&mut OsRng);
        let signing = SigningKey::generate(&mut OsRng);

        let wire = Ed25519Cert::build(
            CERT_SIGNING_BY_ED_ID,
            far_future_hours(),
            KEY_TYPE_ED25519,
            signing.verifying_key().as_bytes(),
            &identity,
        );
        let cert = Ed25519Cert::decode(&wire).unwrap();
        assert_eq!(cert.cert_type, CERT_SIGNING_BY_ED_ID);
        assert_eq!(&cert.certified_key, signing.verifying_key().as_bytes());
        assert_eq!(
            cert.signed_with,
            Some(*identity.verifying_key().as_bytes())
        );

        cert.check(identity.verifying_key().as_bytes(), SystemTime::now())
            .unwrap();

        // The wrong issuer must not verify.
        let other = SigningKey::generate(&mut OsRng);
        assert!(cert
            .check(other.verifying_key().as_bytes(), SystemTime::now())
            .is_err());
    }

    #[test]
    fn test_ed25519_cert_expiry() {
        let identity = SigningKey::generate(&mut OsRng);
        let wire = Ed25519Cert::build(
            CERT_SIGNING_BY_ED_ID,
            1, // expired long ago
            KEY_TYPE_ED25519,
            &[0x55; 32],
            &identity,
        );
        let cert = Ed25519Cert::decode(&wire).unwrap();
        assert!(cert
            .check(identity.verifying_key().as_bytes(), SystemTime::now())
            .is_err());
    }

    #[test]
    fn test_ed25519_cert_truncated() {
        assert!(Ed25519Cert::decode(&[0x01; 50]).is_err());
        let identity = SigningKey::generate(&mut OsRng);
        let wire = Ed25519Cert::build(4, 1, 1, &[0; 32], &identity);
        assert!(Ed25519Cert::decode(&wire[..wire.len() - 1]).is_err());
    }

    #[test]
    fn test_cross_cert_roundtrip_and_verify() {
        let rsa = RsaPrivateKey::new(&mut OsRng, 1024).unwrap();
        let ed_identity = [0x77u8; 32];

        let wire = RsaCrossCert::build(&ed_identity, far_future_hours(), &rsa).unwrap();
        let cert = RsaCrossCert::decode(&wire).unwrap();
        assert_eq!(cert.ed_identity, ed_identity);

        cert.check(&rsa.to_public_key(), SystemTime::now()).unwrap();

        let other = RsaPrivateKey::new(&mut OsRng, 1024).unwrap();
        assert!(cert
            .check(&other.to_public_key(), SystemTime::now())
            .is_err());
    }
}
