//! # tor-relay
//!
//! The cell-oriented core of a Tor relay: terminates TLS links from clients
//! and other relays, negotiates the in-protocol link handshake, and
//! multiplexes circuits and streams over those links. Circuits are created
//! with the ntor CREATE2 handshake, relay cells are peeled or wrapped one
//! onion layer per hop, and EXTEND2 splices circuits onward to the next
//! relay.
//!
//! ## Architecture
//!
//! ```text
//! serve(config)
//!   -> Router            owns keys, TLS acceptor, link registry
//!     -> Connection      one per TLS link: reader + writer tasks
//!       -> LinkHandshake versions/certs/auth/netinfo state machine
//!       -> Circuit       one reactor task per circuit
//!         -> HopCrypto   AES-CTR onion layers + running digests
//!         -> streams     BEGIN/DATA/END inside the circuit
//! ```
//!
//! The process front end, descriptor publication and log sink configuration
//! live outside this crate; [`serve`] and [`Router::descriptor`] are their
//! interfaces in.

pub mod circuit;
pub mod config;
pub mod connection;
pub mod descriptor;
pub mod error;
pub mod keys;
pub mod protocol;
pub mod router;
pub mod tls;

pub use config::RelayConfig;
pub use connection::{ConnContext, Connection, Dialer, LinkHandle};
pub use descriptor::Descriptor;
pub use error::{RelayError, Result};
pub use keys::RelayKeys;
pub use router::{serve, Router};
