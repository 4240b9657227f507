//! The relay itself
//!
//! A [`Router`] owns the key material, the TLS acceptor, and the registry of
//! outbound links. It accepts OR connections on the configured port, spawning
//! one [`Connection`] per socket, and doubles as the [`Dialer`] circuits use
//! to extend toward other relays, reusing an existing link when one is
//! already open to the target.

use crate::config::RelayConfig;
use crate::connection::{ConnContext, Connection, Dialer, LinkHandle};
use crate::descriptor::{Descriptor, DEFAULT_BANDWIDTH};
use crate::error::{RelayError, Result};
use crate::keys::RelayKeys;
use crate::protocol::extend::LinkSpec;
use crate::protocol::handshake::PeerIdentity;
use crate::tls;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::{TlsAcceptor, TlsConnector};

pub struct Router {
    config: RelayConfig,
    keys: Arc<RelayKeys>,
    acceptor: TlsAcceptor,
    connector: TlsConnector,
    links: Mutex<HashMap<SocketAddr, LinkHandle>>,
    bound_addr: Mutex<Option<SocketAddr>>,
}

impl Router {
    /// Load keys and build the TLS machinery. Fails on configuration or key
    /// store problems; nothing touches the network yet.
    pub fn new(config: RelayConfig) -> Result<Arc<Self>> {
        config.validate()?;
        let keys = Arc::new(RelayKeys::load_or_create(&config.data_dir)?);
        let acceptor = tls::make_acceptor(&keys)?;
        let connector = tls::make_connector()?;

        log::info!(
            "relay {} identity {}",
            config.nickname,
            hex::encode(keys.rsa_identity_digest())
        );

        Ok(Arc::new(Self {
            config,
            keys,
            acceptor,
            connector,
            links: Mutex::new(HashMap::new()),
            bound_addr: Mutex::new(None),
        }))
    }

    /// The descriptor the publication component ships to an authority.
    pub fn descriptor(&self) -> Descriptor {
        let bound = self.bound_addr.lock().expect("router poisoned");
        let address = bound
            .map(|a| a.ip())
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        Descriptor {
            nickname: self.config.nickname.clone(),
            address,
            or_port: self.config.or_port,
            fingerprint: self.keys.rsa_identity_digest(),
            ntor_onion_key: *self.keys.ntor_public().as_bytes(),
            ed25519_identity: self.keys.ed_identity_public(),
            bandwidth: DEFAULT_BANDWIDTH,
            platform: self.config.platform.clone(),
            contact: self.config.contact.clone(),
        }
    }

    /// Bind the OR port.
    pub async fn bind(&self) -> Result<TcpListener> {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), self.config.or_port);
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        *self.bound_addr.lock().expect("router poisoned") = Some(local);
        log::info!("listening on {}", local);
        Ok(listener)
    }

    /// Accept OR connections forever.
    pub async fn serve(self: Arc<Self>) -> Result<()> {
        let listener = self.bind().await?;
        self.accept_loop(listener).await
    }

    /// Accept loop over an already-bound listener.
    pub async fn accept_loop(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        *self.bound_addr.lock().expect("router poisoned") = Some(listener.local_addr()?);
        loop {
            let (tcp, peer_addr) = listener.accept().await?;
            let router = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = router.handle_incoming(tcp, peer_addr).await {
                    log::info!("connection from {} failed: {}", peer_addr, e);
                }
            });
        }
    }

    async fn handle_incoming(self: Arc<Self>, tcp: TcpStream, peer_addr: SocketAddr) -> Result<()> {
        let local_addr = tcp.local_addr()?;
        let stream = self
            .acceptor
            .accept(tcp)
            .await
            .map_err(|e| RelayError::Tls(e.to_string()))?;
        let secrets = tls::secrets_for_server(&stream, &self.keys)?;

        let ctx = ConnContext {
            keys: Arc::clone(&self.keys),
            dialer: self.clone(),
            local_addr,
        };
        Connection::run_responder(stream, secrets, peer_addr, ctx).await
    }

    /// Dial a relay and run the initiator handshake.
    async fn dial(self: Arc<Self>, addr: SocketAddr) -> Result<LinkHandle> {
        let tcp = TcpStream::connect(addr).await?;
        let local_addr = tcp.local_addr()?;
        let stream = self
            .connector
            .connect(tls::server_name(addr.ip()), tcp)
            .await
            .map_err(|e| RelayError::Tls(e.to_string()))?;
        let secrets = tls::secrets_for_client(&stream, &self.keys)?;

        let ctx = ConnContext {
            keys: Arc::clone(&self.keys),
            dialer: self.clone() as Arc<dyn Dialer>,
            local_addr,
        };
        Connection::run_initiator(stream, secrets, addr, ctx).await
    }
}

#[async_trait::async_trait]
impl Dialer for Router {
    async fn open_link(self: Arc<Self>, specs: &[LinkSpec]) -> Result<LinkHandle> {
        let addr = specs.iter().find_map(|s| s.address()).ok_or_else(|| {
            RelayError::BadLinkSpec("no address-bearing link specifier".into())
        })?;

        if let Some(link) = self.links.lock().expect("router poisoned").get(&addr) {
            log::debug!("reusing link to {}", addr);
            return Ok(link.clone());
        }

        let link = Arc::clone(&self).dial(addr).await?;

        // The link's proven identity must match what EXTEND2 asked for.
        let expected_rsa = specs.iter().find_map(|s| match s {
            LinkSpec::LegacyId(id) => Some(*id),
            _ => None,
        });
        let expected_ed = specs.iter().find_map(|s| match s {
            LinkSpec::Ed25519Id(id) => Some(*id),
            _ => None,
        });
        match link.peer() {
            PeerIdentity::Relay {
                rsa_identity_digest,
                ed25519_identity,
            } => {
                if let Some(expected) = expected_rsa {
                    if expected != *rsa_identity_digest {
                        return Err(RelayError::ExtendFailed(
                            "peer identity does not match link specifier".into(),
                        ));
                    }
                }
                if let (Some(expected), Some(actual)) = (expected_ed, ed25519_identity) {
                    if expected != *actual {
                        return Err(RelayError::ExtendFailed(
                            "peer ed25519 identity does not match link specifier".into(),
                        ));
                    }
                }
            }
            PeerIdentity::Client => {
                return Err(RelayError::ExtendFailed(
                    "dialed peer did not authenticate as a relay".into(),
                ));
            }
        }

        self.links
            .lock()
            .expect("router poisoned")
            .insert(addr, link.clone());
        Ok(link)
    }
}

/// Run a relay until it fails. The entry point the process front end calls;
/// exit-code mapping lives on [`RelayError::exit_code`].
pub async fn serve(config: RelayConfig) -> Result<()> {
    let router = Router::new(config)?;
    router.serve().await
}
