//! Long-term key material
//!
//! Loads (or creates on first start) the relay's long-term keys under the
//! data directory, and derives everything the link layer serves from them:
//! the X.509 identity and link certificates, the Ed25519 certificate chain,
//! and the TLS identity for the listener.
//!
//! On-disk layout, all round-tripping across restarts:
//! - `identity_key.pem`     RSA-1024 identity, PKCS#8 PEM
//! - `onion_key`            x25519 ntor onion key, raw 32 bytes
//! - `ed25519_master_key`   Ed25519 identity, raw 32 bytes
//!
//! The link key and Ed25519 signing key are medium-term and regenerated at
//! every start.

use crate::error::{RelayError, Result};
use crate::protocol::certs::{
    CertEntry, CertsCell, Ed25519Cert, RsaCrossCert, CERT_ID_X509, CERT_LINK_X509,
    CERT_RSA_ED_CROSSCERT, CERT_SIGNING_BY_ED_ID, CERT_TLS_LINK_BY_SIGNING, KEY_TYPE_ED25519,
    KEY_TYPE_SHA256_X509,
};
use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use rand::RngCore;
use rsa::pkcs1::EncodeRsaPublicKey;
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::signature::{SignatureEncoding, Signer};
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha1::{Digest, Sha1};
use sha2::Sha256;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use x25519_dalek::{PublicKey, StaticSecret};
use x509_cert::builder::{Builder, CertificateBuilder, Profile};
use x509_cert::der::{Decode, Encode};
use x509_cert::ext::pkix::{KeyUsage, KeyUsages};
use x509_cert::name::Name;
use x509_cert::serial_number::SerialNumber;
use x509_cert::spki::SubjectPublicKeyInfoOwned;
use x509_cert::time::Validity;
use zeroize::Zeroizing;

const IDENTITY_KEY_FILE: &str = "identity_key.pem";
const ONION_KEY_FILE: &str = "onion_key";
const ED25519_MASTER_FILE: &str = "ed25519_master_key";

/// Long-term identity keys use this modulus size.
const RSA_KEY_BITS: usize = 1024;

/// Lifetime of the generated certificates.
const CERT_LIFETIME: Duration = Duration::from_secs(365 * 24 * 3600);

/// The relay's key material and everything derived from it.
pub struct RelayKeys {
    rsa_identity: RsaPrivateKey,
    rsa_link: RsaPrivateKey,
    ntor_secret: Arc<StaticSecret>,
    ed_identity: SigningKey,
    ed_signing: SigningKey,

    identity_cert_der: Vec<u8>,
    link_cert_der: Vec<u8>,
    ed_signing_cert: Vec<u8>,
    ed_link_cert: Vec<u8>,
    cross_cert: Vec<u8>,

    identity_digest: [u8; 20],
    identity_sha256: [u8; 32],
}

impl RelayKeys {
    /// Load the long-term keys from `data_dir`, creating any that are
    /// missing, and derive the certificate material.
    pub fn load_or_create(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)
            .map_err(|e| RelayError::KeyStore(format!("cannot create {:?}: {}", data_dir, e)))?;

        let rsa_identity = load_or_create_rsa(&data_dir.join(IDENTITY_KEY_FILE))?;
        let ntor_secret = StaticSecret::from(load_or_create_seed(&data_dir.join(ONION_KEY_FILE))?);
        let ed_identity =
            SigningKey::from_bytes(&load_or_create_seed(&data_dir.join(ED25519_MASTER_FILE))?);

        Self::assemble(rsa_identity, ntor_secret, ed_identity)
    }

    /// Derive the medium-term keys and certificate chain.
    fn assemble(
        rsa_identity: RsaPrivateKey,
        ntor_secret: StaticSecret,
        ed_identity: SigningKey,
    ) -> Result<Self> {
        let rsa_link = RsaPrivateKey::new(&mut OsRng, RSA_KEY_BITS)
            .map_err(|e| RelayError::KeyStore(format!("link key generation failed: {}", e)))?;
        let ed_signing = SigningKey::generate(&mut OsRng);

        // The identity and link certificates must not share a subject.
        let identity_cn = random_hostname("net");
        let link_cn = random_hostname("com");

        let identity_cert_der = build_x509(
            &identity_cn,
            None,
            &rsa_identity.to_public_key(),
            &rsa_identity,
        )?;
        let link_cert_der = build_x509(
            &link_cn,
            Some(&identity_cn),
            &rsa_link.to_public_key(),
            &rsa_identity,
        )?;

        let expiration_hours = (SystemTime::now() + CERT_LIFETIME)
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as u32
            / 3600;

        let ed_signing_cert = Ed25519Cert::build(
            CERT_SIGNING_BY_ED_ID,
            expiration_hours,
            KEY_TYPE_ED25519,
            ed_signing.verifying_key().as_bytes(),
            &ed_identity,
        );
        let link_digest: [u8; 32] = Sha256::digest(&link_cert_der).into();
        let ed_link_cert = Ed25519Cert::build(
            CERT_TLS_LINK_BY_SIGNING,
            expiration_hours,
            KEY_TYPE_SHA256_X509,
            &link_digest,
            &ed_signing,
        );
        let cross_cert = RsaCrossCert::build(
            ed_identity.verifying_key().as_bytes(),
            expiration_hours,
            &rsa_identity,
        )?;

        let pkcs1 = rsa_identity
            .to_public_key()
            .to_pkcs1_der()
            .map_err(|e| RelayError::KeyStore(format!("unencodable identity key: {}", e)))?;
        let identity_digest: [u8; 20] = Sha1::digest(pkcs1.as_bytes()).into();
        let identity_sha256: [u8; 32] = Sha256::digest(pkcs1.as_bytes()).into();

        Ok(Self {
            rsa_identity,
            rsa_link,
            ntor_secret: Arc::new(ntor_secret),
            ed_identity,
            ed_signing,
            identity_cert_der,
            link_cert_der,
            ed_signing_cert,
            ed_link_cert,
            cross_cert,
            identity_digest,
            identity_sha256,
        })
    }

    /// SHA-1 fingerprint of the RSA identity key.
    pub fn rsa_identity_digest(&self) -> [u8; 20] {
        self.identity_digest
    }

    /// SHA-256 of the RSA identity key, used in AUTHENTICATE bodies.
    pub fn rsa_identity_sha256(&self) -> [u8; 32] {
        self.identity_sha256
    }

    pub fn ntor_secret_shared(&self) -> Arc<StaticSecret> {
        Arc::clone(&self.ntor_secret)
    }

    pub fn ntor_public(&self) -> PublicKey {
        PublicKey::from(self.ntor_secret.as_ref())
    }

    pub fn ed_identity_public(&self) -> [u8; 32] {
        *self.ed_identity.verifying_key().as_bytes()
    }

    pub fn ed_signing_key(&self) -> &SigningKey {
        &self.ed_signing
    }

    /// Sign with the RSA identity key (RSASSA-PKCS1-v1.5 over SHA-256).
    pub fn sign_rsa_sha256(&self, message: &[u8]) -> Result<Vec<u8>> {
        let signer = rsa::pkcs1v15::SigningKey::<Sha256>::new(self.rsa_identity.clone());
        Ok(signer.sign(message).to_vec())
    }

    /// The CERTS cell this relay presents.
    pub fn certs_cell(&self) -> CertsCell {
        CertsCell::new(vec![
            CertEntry {
                cert_type: CERT_LINK_X509,
                body: self.link_cert_der.clone(),
            },
            CertEntry {
                cert_type: CERT_ID_X509,
                body: self.identity_cert_der.clone(),
            },
            CertEntry {
                cert_type: CERT_SIGNING_BY_ED_ID,
                body: self.ed_signing_cert.clone(),
            },
            CertEntry {
                cert_type: CERT_TLS_LINK_BY_SIGNING,
                body: self.ed_link_cert.clone(),
            },
            CertEntry {
                cert_type: CERT_RSA_ED_CROSSCERT,
                body: self.cross_cert.clone(),
            },
        ])
    }

    pub fn link_cert_der(&self) -> &[u8] {
        &self.link_cert_der
    }

    /// TLS identity for the listener and for outbound dials: the link
    /// certificate plus its private key in PKCS#8 DER.
    pub fn tls_identity(&self) -> Result<(Vec<u8>, Zeroizing<Vec<u8>>)> {
        let key = self
            .rsa_link
            .to_pkcs8_der()
            .map_err(|e| RelayError::KeyStore(format!("unencodable link key: {}", e)))?;
        Ok((self.link_cert_der.clone(), key.to_bytes()))
    }

    pub fn rsa_identity_public(&self) -> RsaPublicKey {
        self.rsa_identity.to_public_key()
    }
}

fn load_or_create_rsa(path: &Path) -> Result<RsaPrivateKey> {
    if path.exists() {
        let pem = Zeroizing::new(
            std::fs::read_to_string(path)
                .map_err(|e| RelayError::KeyStore(format!("cannot read {:?}: {}", path, e)))?,
        );
        return RsaPrivateKey::from_pkcs8_pem(&pem)
            .map_err(|e| RelayError::KeyStore(format!("cannot parse {:?}: {}", path, e)));
    }

    log::info!("generating new RSA identity key at {:?}", path);
    let key = RsaPrivateKey::new(&mut OsRng, RSA_KEY_BITS)
        .map_err(|e| RelayError::KeyStore(format!("RSA generation failed: {}", e)))?;
    let pem = key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| RelayError::KeyStore(format!("cannot encode key: {}", e)))?;
    std::fs::write(path, pem.as_bytes())
        .map_err(|e| RelayError::KeyStore(format!("cannot write {:?}: {}", path, e)))?;
    Ok(key)
}

fn load_or_create_seed(path: &Path) -> Result<[u8; 32]> {
    if path.exists() {
        let bytes = Zeroizing::new(
            std::fs::read(path)
                .map_err(|e| RelayError::KeyStore(format!("cannot read {:?}: {}", path, e)))?,
        );
        let seed: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
            RelayError::KeyStore(format!("{:?} must hold exactly 32 bytes", path))
        })?;
        return Ok(seed);
    }

    log::info!("generating new key at {:?}", path);
    let mut seed = [0u8; 32];
    OsRng.fill_bytes(&mut seed);
    std::fs::write(path, seed)
        .map_err(|e| RelayError::KeyStore(format!("cannot write {:?}: {}", path, e)))?;
    Ok(seed)
}

fn random_hostname(tld: &str) -> String {
    let mut bytes = [0u8; 4];
    OsRng.fill_bytes(&mut bytes);
    format!("www.{}.{}", hex::encode(bytes), tld)
}

/// Build a DER X.509 certificate for `subject_key`, signed by `signer_key`.
/// `issuer_cn` of `None` makes it self-signed.
fn build_x509(
    subject_cn: &str,
    issuer_cn: Option<&str>,
    subject_key: &RsaPublicKey,
    signer_key: &RsaPrivateKey,
) -> Result<Vec<u8>> {
    let cert_err = |e: String| RelayError::KeyStore(format!("certificate build failed: {}", e));

    let profile = Profile::Manual {
        issuer: match issuer_cn {
            Some(cn) => Some(
                format!("CN={}", cn)
                    .parse::<Name>()
                    .map_err(|e| cert_err(e.to_string()))?,
            ),
            None => None,
        },
    };

    let mut serial_bytes = [0u8; 16];
    OsRng.fill_bytes(&mut serial_bytes);
    serial_bytes[0] &= 0x7f;
    serial_bytes[0] |= 0x01;
    let serial = SerialNumber::new(&serial_bytes).map_err(|e| cert_err(e.to_string()))?;

    let validity = Validity::from_now(CERT_LIFETIME).map_err(|e| cert_err(e.to_string()))?;
    let subject = format!("CN={}", subject_cn)
        .parse::<Name>()
        .map_err(|e| cert_err(e.to_string()))?;

    let spki_der = subject_key
        .to_public_key_der()
        .map_err(|e| cert_err(e.to_string()))?;
    let spki =
        SubjectPublicKeyInfoOwned::from_der(spki_der.as_bytes()).map_err(|e| cert_err(e.to_string()))?;

    let signer = rsa::pkcs1v15::SigningKey::<Sha256>::new(signer_key.clone());
    let mut builder = CertificateBuilder::new(profile, serial, validity, subject, spki, &signer)
        .map_err(|e| cert_err(e.to_string()))?;
    // An extension forces a v3 certificate.
    builder
        .add_extension(&KeyUsage(
            KeyUsages::KeyCertSign | KeyUsages::DigitalSignature,
        ))
        .map_err(|e| cert_err(e.to_string()))?;

    let cert: x509_cert::Certificate = builder
        .build::<rsa::pkcs1v15::Signature>()
        .map_err(|e| cert_err(e.to_string()))?;
    cert.to_der().map_err(|e| cert_err(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::certs::validate_certs;

    #[test]
    fn test_keys_roundtrip_across_restarts() {
        let dir = tempfile::tempdir().unwrap();
        let first = RelayKeys::load_or_create(dir.path()).unwrap();
        let second = RelayKeys::load_or_create(dir.path()).unwrap();

        assert_eq!(first.rsa_identity_digest(), second.rsa_identity_digest());
        assert_eq!(first.ntor_public(), second.ntor_public());
        assert_eq!(first.ed_identity_public(), second.ed_identity_public());
    }

    #[test]
    fn test_own_certs_cell_validates() {
        let dir = tempfile::tempdir().unwrap();
        let keys = RelayKeys::load_or_create(dir.path()).unwrap();

        let cell = keys.certs_cell();
        let peer =
            validate_certs(&cell, Some(keys.link_cert_der()), SystemTime::now()).unwrap();
        assert_eq!(peer.rsa_identity_digest, keys.rsa_identity_digest());
        assert_eq!(peer.rsa_identity_sha256, keys.rsa_identity_sha256());
        assert_eq!(peer.ed25519_identity, Some(keys.ed_identity_public()));
        assert_eq!(
            peer.ed25519_signing,
            Some(*keys.ed_signing_key().verifying_key().as_bytes())
        );
    }

    #[test]
    fn test_certs_cell_rejects_wrong_tls_cert() {
        let dir = tempfile::tempdir().unwrap();
        let keys = RelayKeys::load_or_create(dir.path()).unwrap();

        // Another relay's TLS certificate must not validate against this
        // relay's chain.
        let other_dir = tempfile::tempdir().unwrap();
        let other = RelayKeys::load_or_create(other_dir.path()).unwrap();

        let cell = keys.certs_cell();
        assert!(validate_certs(&cell, Some(other.link_cert_der()), SystemTime::now()).is_err());
    }

    #[test]
    fn test_corrupt_seed_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(ONION_KEY_FILE), b"short").unwrap();
        assert!(RelayKeys::load_or_create(dir.path()).is_err());
    }
}
