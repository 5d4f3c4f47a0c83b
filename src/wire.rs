//! Byte transport under the XML stream.
//!
//! The connection starts as TCP and is wrapped in TLS either immediately
//! (`TlsMode::TlsSocket`) or on STARTTLS (`TlsMode::StartTls`); both halves
//! travel as one boxed stream so the reader/writer split survives the
//! upgrade. All stanza writes go through [`StanzaWriter`], whose mutex is
//! the single write critical section — concurrent senders can never
//! interleave bytes.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_native_tls::TlsConnector;
use tracing::debug;

use crate::error::{Error, Result};
use crate::ns;
use crate::xml::Element;

/// Object-safe alias for the evolving transport (TCP, then maybe TLS).
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

pub type BoxStream = Box<dyn AsyncStream>;

/// Caller-supplied predicate over the peer's DER-encoded certificate.
/// When present it replaces the built-in chain verification entirely.
pub type CertValidator = Arc<dyn Fn(&[u8]) -> bool + Send + Sync>;

#[derive(Clone, Default)]
pub struct TlsPolicy {
    /// `false` accepts invalid chains (self-signed dev servers).
    /// Ignored when `validator` is set.
    pub accept_invalid: bool,
    pub validator: Option<CertValidator>,
}

impl TlsPolicy {
    pub fn verifying(tls_verify: bool) -> Self {
        Self {
            accept_invalid: !tls_verify,
            validator: None,
        }
    }
}

pub async fn connect_tcp(host: &str, port: u16) -> Result<BoxStream> {
    let stream = TcpStream::connect((host, port)).await?;
    Ok(Box::new(stream))
}

/// Wraps the transport in TLS against `domain`.
///
/// With a custom validator the built-in verification is disabled and the
/// predicate decides on the peer certificate after the handshake; without
/// one the default is strict verification.
pub async fn secure(stream: BoxStream, domain: &str, policy: &TlsPolicy) -> Result<BoxStream> {
    let mut builder = native_tls::TlsConnector::builder();
    if policy.validator.is_some() {
        builder
            .danger_accept_invalid_certs(true)
            .danger_accept_invalid_hostnames(true);
    } else if policy.accept_invalid {
        builder.danger_accept_invalid_certs(true);
    }
    let connector = builder
        .build()
        .map_err(|e| Error::AuthenticationFailed(format!("TLS setup failed: {e}")))?;
    let connector = TlsConnector::from(connector);

    let tls_stream = connector
        .connect(domain, stream)
        .await
        .map_err(|e| Error::AuthenticationFailed(format!("TLS handshake failed: {e}")))?;

    if let Some(ref validator) = policy.validator {
        let peer_cert = tls_stream
            .get_ref()
            .peer_certificate()
            .ok()
            .flatten()
            .and_then(|cert| cert.to_der().ok());
        let accepted = peer_cert.as_deref().map(|der| validator(der));
        if accepted != Some(true) {
            return Err(Error::AuthenticationFailed(
                "peer certificate rejected by validator".into(),
            ));
        }
    }

    debug!("TLS established with {domain}");
    Ok(Box::new(tls_stream))
}

/// The serialized write side of a connected session.
pub struct StanzaWriter {
    writer: Mutex<WriteHalf<BoxStream>>,
    debug_stanzas: bool,
}

impl StanzaWriter {
    pub fn new(writer: WriteHalf<BoxStream>, debug_stanzas: bool) -> Self {
        Self {
            writer: Mutex::new(writer),
            debug_stanzas,
        }
    }

    /// Writes one pre-serialized unit (stanza or stream tag) atomically.
    pub async fn send_raw(&self, xml: &str) -> Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(xml.as_bytes()).await?;
        writer.flush().await?;
        if self.debug_stanzas {
            debug!("SEND {xml}");
        }
        Ok(())
    }

    /// Serializes under the `jabber:client` default namespace and writes.
    pub async fn send_element(&self, element: &Element) -> Result<()> {
        self.send_raw(&element.serialize(Some(ns::CLIENT))).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_concurrent_writes_do_not_interleave() {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let boxed: BoxStream = Box::new(client);
        let (read_half, write_half) = tokio::io::split(boxed);
        let writer = Arc::new(StanzaWriter::new(write_half, false));

        let mut tasks = Vec::new();
        for i in 0..8 {
            let writer = writer.clone();
            tasks.push(tokio::spawn(async move {
                let unit = format!("<presence id='{i}'>{}</presence>", "x".repeat(4096));
                for _ in 0..4 {
                    writer.send_raw(&unit).await.unwrap();
                }
            }));
        }

        let collector = tokio::spawn(async move {
            let mut reader = server;
            let mut all = Vec::new();
            let mut buf = vec![0u8; 8192];
            loop {
                match reader.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => all.extend_from_slice(&buf[..n]),
                }
            }
            String::from_utf8(all).unwrap()
        });

        for task in tasks {
            task.await.unwrap();
        }
        // EOF for the collector: both halves of the client side must go.
        drop(writer);
        drop(read_half);
        let output = collector.await.unwrap();

        // Every unit must appear whole: scanning the concatenation tag by
        // tag never hits a torn one.
        let mut rest = output.as_str();
        let mut count = 0;
        while !rest.is_empty() {
            assert!(rest.starts_with("<presence id='"));
            let end = rest.find("</presence>").expect("complete unit") + "</presence>".len();
            rest = &rest[end..];
            count += 1;
        }
        assert_eq!(count, 32);
    }
}
