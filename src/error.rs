use thiserror::Error;

/// Errors surfaced by the transport core.
///
/// `Disconnected`, `XmlMalformed` and `ProtocolViolation` are fatal for the
/// session. `AuthenticationFailed` and `Timeout` are recoverable by the
/// caller (retry with other credentials, retry the request). `Socks5` and
/// `TransferAborted` only abort the file transfer they belong to.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    /// The transport is dead: EOF, an I/O failure, or the peer closed the
    /// stream. The session is unusable afterwards.
    #[error("connection lost")]
    Disconnected,

    #[error("malformed XML: {0}")]
    XmlMalformed(String),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// The peer terminated the stream with a `<stream:error>`; carries the
    /// defined condition (e.g. `conflict`, `system-shutdown`).
    #[error("stream error: {0}")]
    Stream(String),

    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// A blocking IQ request ran out of time. The session stays usable.
    #[error("request timed out")]
    Timeout,

    /// Timeouts are milliseconds, with -1 meaning "wait forever". Any other
    /// negative value is a caller bug.
    #[error("invalid timeout: {0} ms")]
    InvalidTimeout(i64),

    #[error("DNS resolution failed: {0}")]
    Dns(String),

    #[error("invalid JID: {0}")]
    InvalidJid(String),

    /// SOCKS5 negotiation failed; aborts the current transfer only.
    #[error("SOCKS5 error: {0}")]
    Socks5(String),

    /// A bytestream transfer ended before `size` bytes moved.
    #[error("transfer aborted")]
    TransferAborted,
}

impl Error {
    /// Whether this error leaves the session unusable.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Disconnected
                | Error::XmlMalformed(_)
                | Error::ProtocolViolation(_)
                | Error::Stream(_)
        )
    }

    /// Collapses reader-side failures into the condition reported to the
    /// error event: I/O and parser errors all mean the stream is gone.
    pub(crate) fn into_disconnect_condition(self) -> Error {
        match self {
            Error::XmlMalformed(_) | Error::Disconnected => Error::Disconnected,
            other => other,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(_: std::io::Error) -> Self {
        Error::Disconnected
    }
}

impl From<quick_xml::Error> for Error {
    fn from(err: quick_xml::Error) -> Self {
        Error::XmlMalformed(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
