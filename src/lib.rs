//! Client-side XMPP transport core (RFC 6120).
//!
//! What lives here is the plumbing under an XMPP client: the layered
//! connection lifecycle (SRV resolution → TCP → TLS → SASL → resource
//! binding), the stanza exchange engine with blocking and callback IQ
//! correlation, and the XEP-0065 SOCKS5 bytestream subsystem for binary
//! transfers — direct, peer-to-peer with NAT detection, or mediated
//! through a proxy.
//!
//! IM-level extensions (rosters, avatars, service discovery beyond proxy
//! lookup, stream initiation itself) belong to layers above; they drive
//! this crate through [`client::XmppClient`]'s stanza API and events.
//!
//! ```no_run
//! use xmpp_transport::client::XmppClient;
//! use xmpp_transport::config::ClientConfig;
//!
//! # async fn run() -> Result<(), xmpp_transport::error::Error> {
//! let config = ClientConfig::for_domain("example.net")
//!     .with_credentials("alice", "s3cret");
//! let client = XmppClient::new(config);
//! client.on_message(|message| println!("got {:?}", message.payload));
//! client.connect().await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod dns;
pub mod error;
pub mod features;
pub mod jid;
pub mod ns;
pub mod retry;
pub mod sasl;
pub mod socks5;
pub mod stanza;
pub mod wire;
pub mod xml;

pub use client::XmppClient;
pub use config::{ClientConfig, TlsMode};
pub use error::Error;
pub use jid::Jid;
pub use stanza::{Iq, IqType, Message, Presence, Stanza};
