//! TLS link setup
//!
//! Server and client rustls configurations for OR links. The listener serves
//! the self-signed link certificate; outbound dials accept any server
//! certificate at the TLS layer, because a link's real authentication
//! happens in-protocol through the CERTS cell and the AUTHENTICATE binding.
//!
//! This module is also where the handshake's [`LinkSecrets`] come from: the
//! RFC5705 exporter and the session's certificates are read off the rustls
//! connection once the TLS handshake finishes.

use crate::error::{RelayError, Result};
use crate::keys::RelayKeys;
use crate::protocol::handshake::LinkSecrets;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, ServerConfig, SignatureScheme};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::{client, server, TlsAcceptor, TlsConnector};

/// RFC5705 exporter label for link authentication.
const EXPORTER_LABEL: &[u8] = b"EXPORTER FOR TOR TLS CLIENT BINDING AUTH0003";

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Acceptor serving this relay's link certificate.
pub fn make_acceptor(keys: &RelayKeys) -> Result<TlsAcceptor> {
    let (cert_der, key_der) = keys.tls_identity()?;
    let cert = CertificateDer::from(cert_der);
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_der.to_vec()));

    let config = ServerConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| RelayError::Tls(e.to_string()))?
        .with_no_client_auth()
        .with_single_cert(vec![cert], key)
        .map_err(|e| RelayError::Tls(e.to_string()))?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Connector for outbound links. Certificate validation is deferred to the
/// CERTS cell, so the TLS layer accepts whatever the peer presents.
pub fn make_connector() -> Result<TlsConnector> {
    let provider = provider();
    let verifier = Arc::new(AcceptAnyServerCert {
        provider: provider.clone(),
    });
    let config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| RelayError::Tls(e.to_string()))?
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_no_client_auth();
    Ok(TlsConnector::from(Arc::new(config)))
}

/// Server name for dialing a bare OR address.
pub fn server_name(addr: std::net::IpAddr) -> ServerName<'static> {
    ServerName::from(addr)
}

/// Session secrets from an accepted connection.
pub fn secrets_for_server(
    stream: &server::TlsStream<TcpStream>,
    keys: &RelayKeys,
) -> Result<LinkSecrets> {
    let (_, conn) = stream.get_ref();
    let exporter = export(conn)?;
    let peer_cert_der = conn
        .peer_certificates()
        .and_then(|certs| certs.first())
        .map(|c| c.as_ref().to_vec());
    Ok(LinkSecrets {
        exporter,
        // rustls speaks TLS 1.2/1.3 without master-secret access, so the
        // legacy method-1 binding is unavailable.
        master_secret_binding: None,
        local_cert_der: keys.link_cert_der().to_vec(),
        peer_cert_der,
    })
}

/// Session secrets from a dialed connection.
pub fn secrets_for_client(
    stream: &client::TlsStream<TcpStream>,
    keys: &RelayKeys,
) -> Result<LinkSecrets> {
    let (_, conn) = stream.get_ref();
    let exporter = {
        let mut out = [0u8; 32];
        conn.export_keying_material(&mut out[..], EXPORTER_LABEL, None)
            .map_err(|e| RelayError::Tls(format!("keying material export failed: {}", e)))?;
        out
    };
    let peer_cert_der = conn
        .peer_certificates()
        .and_then(|certs| certs.first())
        .map(|c| c.as_ref().to_vec());
    Ok(LinkSecrets {
        exporter,
        master_secret_binding: None,
        local_cert_der: keys.link_cert_der().to_vec(),
        peer_cert_der,
    })
}

fn export(conn: &rustls::ServerConnection) -> Result<[u8; 32]> {
    let mut out = [0u8; 32];
    conn.export_keying_material(&mut out[..], EXPORTER_LABEL, None)
        .map_err(|e| RelayError::Tls(format!("keying material export failed: {}", e)))?;
    Ok(out)
}

/// Accepts any server certificate; identity is proven in-protocol.
#[derive(Debug)]
struct AcceptAnyServerCert {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
