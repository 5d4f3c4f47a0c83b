//! SASL authentication state machines.
//!
//! Each mechanism is a small state machine fed raw (already
//! base64-decoded) challenge bytes and producing raw response bytes; the
//! client drives it against `<challenge/>` / `<success/>` elements. The
//! mechanism table is per session — selection happens against the
//! server-advertised list at handshake time.

use crate::error::{Error, Result};
use std::fmt;

pub mod digest_md5;
pub mod plain;
pub mod scram;

pub use digest_md5::DigestMd5;
pub use plain::Plain;
pub use scram::ScramSha1;

/// Client-side SASL mechanism.
pub trait Mechanism: Send {
    fn name(&self) -> &'static str;

    /// Whether the mechanism sends data in the `<auth/>` element.
    fn has_initial_response(&self) -> bool;

    /// The initial response, for mechanisms that have one.
    fn initial(&mut self) -> Result<Vec<u8>> {
        Ok(Vec::new())
    }

    /// Answers a server challenge.
    fn response(&mut self, challenge: &[u8]) -> Result<Vec<u8>>;

    /// Consumes the `<success/>` payload (server-final data for SCRAM and
    /// some DIGEST-MD5 servers). Must leave the mechanism completed.
    fn success(&mut self, data: &[u8]) -> Result<()>;

    /// Whether the exchange has run to a verified end. A mechanism that is
    /// not completed after `<success/>` is a protocol error.
    fn is_completed(&self) -> bool;
}

impl fmt::Debug for dyn Mechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mechanism").field("name", &self.name()).finish()
    }
}

/// Mechanisms in preference order, strongest first.
const PREFERENCE: [&str; 3] = ["SCRAM-SHA-1", "DIGEST-MD5", "PLAIN"];

/// Picks the best mutually supported mechanism, ignoring case on the
/// advertised names. Server ordering does not matter.
pub fn select_mechanism(
    advertised: &[String],
    username: &str,
    password: &str,
) -> Result<Box<dyn Mechanism>> {
    for preferred in PREFERENCE {
        if advertised
            .iter()
            .any(|name| name.eq_ignore_ascii_case(preferred))
        {
            return Ok(match preferred {
                "SCRAM-SHA-1" => Box::new(ScramSha1::new(username, password)),
                "DIGEST-MD5" => Box::new(DigestMd5::new(username, password)),
                _ => Box::new(Plain::new(username, password)),
            });
        }
    }

    Err(Error::AuthenticationFailed(format!(
        "no supported SASL mechanism (server offers: {})",
        advertised.join(", ")
    )))
}
