//! Pull-style parser for one XML stream.
//!
//! Wraps a `quick-xml` async reader and yields the direct children of the
//! outer `<stream:stream>` document one at a time, as owned [`Element`]
//! trees. The document itself is never materialized. A fresh instance is
//! created for every stream (re)start; `into_inner` hands the transport
//! back for the restart.

use std::collections::HashMap;

use quick_xml::events::Event;
use quick_xml::Reader;
use tokio::io::{AsyncRead, BufReader};

use crate::error::{Error, Result};
use crate::xml::Element;

pub const NS_STREAMS: &str = "http://etherx.jabber.org/streams";

/// Attributes of the peer's `<stream:stream>` opening tag.
#[derive(Debug, Clone)]
pub struct StreamHeader {
    pub id: Option<String>,
    pub from: Option<String>,
    /// The stream's default `xml:lang`, `en` when the peer sent none.
    pub language: String,
}

pub struct StreamReader<R: AsyncRead + Unpin> {
    reader: Reader<BufReader<R>>,
    buf: Vec<u8>,
    /// One namespace scope per open element, the stream root included.
    scopes: Vec<HashMap<Option<String>, String>>,
    stack: Vec<Element>,
}

impl<R: AsyncRead + Unpin> StreamReader<R> {
    pub fn new(inner: R) -> Self {
        let mut reader = Reader::from_reader(BufReader::new(inner));
        // Self-closing tags become Start+End pairs, so the builder below
        // only deals with two shapes of event.
        reader.config_mut().expand_empty_elements = true;

        Self {
            reader,
            buf: Vec::with_capacity(4096),
            scopes: Vec::new(),
            stack: Vec::new(),
        }
    }

    /// Consumes the parser and returns the transport for a stream restart.
    /// Any partially parsed state is discarded.
    pub fn into_inner(self) -> R {
        self.reader.into_inner().into_inner()
    }

    /// Reads up to and including the peer's `<stream:stream>` opening tag.
    pub async fn read_stream_header(&mut self) -> Result<StreamHeader> {
        loop {
            self.buf.clear();
            match self.reader.read_event_into_async(&mut self.buf).await? {
                Event::Decl(_) | Event::Comment(_) | Event::PI(_) | Event::Text(_) => continue,
                Event::Start(start) => {
                    let (prefix, local) = split_qname(start.name().as_ref())?;
                    let bindings = namespace_bindings(&start)?;
                    self.scopes.push(bindings);

                    let namespace = resolve_ns(&self.scopes, prefix.as_deref());
                    if local != "stream" || namespace.as_deref() != Some(NS_STREAMS) {
                        return Err(Error::ProtocolViolation(format!(
                            "expected stream header, got <{local}>"
                        )));
                    }

                    let mut id = None;
                    let mut from = None;
                    let mut language = None;
                    for attr in start.attributes() {
                        let attr = attr.map_err(|e| Error::XmlMalformed(e.to_string()))?;
                        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
                        let value = attr.unescape_value()?.into_owned();
                        match key.as_str() {
                            "id" => id = Some(value),
                            "from" => from = Some(value),
                            "xml:lang" => language = Some(value),
                            _ => {}
                        }
                    }

                    return Ok(StreamHeader {
                        id,
                        from,
                        language: language.unwrap_or_else(|| "en".to_string()),
                    });
                }
                Event::Eof => return Err(Error::Disconnected),
                other => {
                    return Err(Error::ProtocolViolation(format!(
                        "unexpected {other:?} before stream header"
                    )))
                }
            }
        }
    }

    /// Blocks until the next direct child of the stream closes and returns
    /// it. With a non-empty `allowed` list, any other element name is a
    /// protocol error. The stream closing (EOF or `</stream:stream>`)
    /// surfaces as [`Error::Disconnected`].
    pub async fn next_element(&mut self, allowed: &[&str]) -> Result<Element> {
        loop {
            self.buf.clear();
            match self.reader.read_event_into_async(&mut self.buf).await? {
                Event::Start(start) => {
                    let (prefix, local) = split_qname(start.name().as_ref())?;
                    let bindings = namespace_bindings(&start)?;
                    self.scopes.push(bindings);

                    if self.stack.is_empty()
                        && !allowed.is_empty()
                        && !allowed.contains(&local.as_str())
                    {
                        return Err(Error::ProtocolViolation(format!(
                            "unexpected <{local}> on stream"
                        )));
                    }

                    let mut element = Element::new(&local);
                    element.set_namespace(resolve_ns(&self.scopes, prefix.as_deref()));
                    for attr in start.attributes() {
                        let attr = attr.map_err(|e| Error::XmlMalformed(e.to_string()))?;
                        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
                        if key == "xmlns" || key.starts_with("xmlns:") {
                            continue;
                        }
                        element.set_attr(&key, &attr.unescape_value()?);
                    }
                    self.stack.push(element);
                }
                Event::End(_) => {
                    self.scopes.pop();
                    match self.stack.pop() {
                        // `</stream:stream>`: the peer is closing the stream.
                        None => return Err(Error::Disconnected),
                        Some(element) => match self.stack.last_mut() {
                            Some(parent) => parent.add_child(element),
                            None => return Ok(element),
                        },
                    }
                }
                Event::Text(text) => {
                    if let Some(open) = self.stack.last_mut() {
                        open.add_text(&text.unescape()?);
                    }
                    // Inter-stanza character data (whitespace keep-alives)
                    // is dropped.
                }
                Event::CData(data) => {
                    if let Some(open) = self.stack.last_mut() {
                        open.add_text(&String::from_utf8_lossy(&data.into_inner()));
                    }
                }
                Event::Decl(_) | Event::Comment(_) | Event::PI(_) | Event::DocType(_) => {}
                Event::Eof => return Err(Error::Disconnected),
                Event::Empty(_) => unreachable!("expand_empty_elements is set"),
            }
        }
    }
}

/// Innermost binding for `prefix` (None = the default namespace).
fn resolve_ns(
    scopes: &[HashMap<Option<String>, String>],
    prefix: Option<&str>,
) -> Option<String> {
    let key = prefix.map(str::to_string);
    for scope in scopes.iter().rev() {
        if let Some(uri) = scope.get(&key) {
            return Some(uri.clone());
        }
    }
    None
}

/// Splits a qualified name into (prefix, local part).
fn split_qname(raw: &[u8]) -> Result<(Option<String>, String)> {
    let name = std::str::from_utf8(raw)
        .map_err(|_| Error::XmlMalformed("tag name is not UTF-8".into()))?;
    Ok(match name.split_once(':') {
        Some((prefix, local)) => (Some(prefix.to_string()), local.to_string()),
        None => (None, name.to_string()),
    })
}

/// Collects the `xmlns` / `xmlns:prefix` declarations of an opening tag.
fn namespace_bindings(
    start: &quick_xml::events::BytesStart<'_>,
) -> Result<HashMap<Option<String>, String>> {
    let mut bindings = HashMap::new();
    for attr in start.attributes() {
        let attr = attr.map_err(|e| Error::XmlMalformed(e.to_string()))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr.unescape_value()?.into_owned();
        if key == "xmlns" {
            bindings.insert(None, value);
        } else if let Some(prefix) = key.strip_prefix("xmlns:") {
            bindings.insert(Some(prefix.to_string()), value);
        }
    }
    Ok(bindings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    const HEADER: &str = "<?xml version='1.0'?>\
        <stream:stream xmlns='jabber:client' \
        xmlns:stream='http://etherx.jabber.org/streams' \
        id='c2s-42' from='example.net' xml:lang='de' version='1.0'>";

    async fn reader_for(script: &str) -> StreamReader<tokio::io::DuplexStream> {
        let (client, mut server) = tokio::io::duplex(16 * 1024);
        server.write_all(script.as_bytes()).await.unwrap();
        drop(server);
        StreamReader::new(client)
    }

    #[tokio::test]
    async fn test_stream_header_fields() {
        let mut reader = reader_for(HEADER).await;
        let header = reader.read_stream_header().await.unwrap();
        assert_eq!(header.id.as_deref(), Some("c2s-42"));
        assert_eq!(header.from.as_deref(), Some("example.net"));
        assert_eq!(header.language, "de");
    }

    #[tokio::test]
    async fn test_stream_language_defaults_to_en() {
        let mut reader =
            reader_for("<stream:stream xmlns:stream='http://etherx.jabber.org/streams'>").await;
        let header = reader.read_stream_header().await.unwrap();
        assert_eq!(header.language, "en");
    }

    #[tokio::test]
    async fn test_prefixed_top_level_child() {
        let script = format!(
            "{HEADER}<stream:features>\
             <starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'><required/></starttls>\
             </stream:features>"
        );
        let mut reader = reader_for(&script).await;
        reader.read_stream_header().await.unwrap();

        let features = reader.next_element(&["features"]).await.unwrap();
        assert_eq!(features.name(), "features");
        assert_eq!(features.namespace(), Some(NS_STREAMS));
        let starttls = features
            .find_child_ns("starttls", "urn:ietf:params:xml:ns:xmpp-tls")
            .unwrap();
        assert!(starttls.find_child("required").is_some());
    }

    #[tokio::test]
    async fn test_child_namespaces_and_text() {
        let script = format!(
            "{HEADER}<message from='bob@example.net/pda' xml:lang='en'>\
             <body>ws &amp; text</body></message>"
        );
        let mut reader = reader_for(&script).await;
        reader.read_stream_header().await.unwrap();

        let message = reader.next_element(&[]).await.unwrap();
        assert_eq!(message.namespace(), Some("jabber:client"));
        assert_eq!(message.attribute("from"), Some("bob@example.net/pda"));
        let body = message.find_child("body").unwrap();
        assert_eq!(body.namespace(), Some("jabber:client"));
        assert_eq!(body.content(), "ws & text");
    }

    #[tokio::test]
    async fn test_whitespace_between_stanzas_tolerated() {
        let script = format!("{HEADER}\n  <presence/> \n\t<presence type='unavailable'/>");
        let mut reader = reader_for(&script).await;
        reader.read_stream_header().await.unwrap();

        let first = reader.next_element(&["presence"]).await.unwrap();
        assert!(!first.has_children());
        let second = reader.next_element(&["presence"]).await.unwrap();
        assert_eq!(second.attribute("type"), Some("unavailable"));
    }

    #[tokio::test]
    async fn test_disallowed_element_is_protocol_error() {
        let script = format!("{HEADER}<handshake/>");
        let mut reader = reader_for(&script).await;
        reader.read_stream_header().await.unwrap();

        let err = reader
            .next_element(&["iq", "message", "presence"])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ProtocolViolation(_)));
    }

    #[tokio::test]
    async fn test_eof_is_disconnected() {
        let script = format!("{HEADER}<iq type='get' id='1'");
        let mut reader = reader_for(&script).await;
        reader.read_stream_header().await.unwrap();

        let err = reader.next_element(&[]).await.unwrap_err();
        assert!(matches!(err, Error::Disconnected | Error::XmlMalformed(_)));
    }

    #[tokio::test]
    async fn test_stream_close_tag_is_disconnected() {
        let script = format!("{HEADER}</stream:stream>");
        let mut reader = reader_for(&script).await;
        reader.read_stream_header().await.unwrap();

        assert_eq!(reader.next_element(&[]).await.unwrap_err(), Error::Disconnected);
    }

    #[tokio::test]
    async fn test_mismatched_end_tag_is_malformed() {
        let script = format!("{HEADER}<iq type='get' id='1'></message>");
        let mut reader = reader_for(&script).await;
        reader.read_stream_header().await.unwrap();

        let err = reader.next_element(&[]).await.unwrap_err();
        assert!(matches!(err, Error::XmlMalformed(_)));
    }
}
