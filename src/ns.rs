//! XML namespace URIs used on the wire.

pub const STREAMS: &str = "http://etherx.jabber.org/streams";
pub const CLIENT: &str = "jabber:client";
pub const TLS: &str = "urn:ietf:params:xml:ns:xmpp-tls";
pub const SASL: &str = "urn:ietf:params:xml:ns:xmpp-sasl";
pub const BIND: &str = "urn:ietf:params:xml:ns:xmpp-bind";
pub const STANZAS: &str = "urn:ietf:params:xml:ns:xmpp-stanzas";
pub const XMPP_STREAMS: &str = "urn:ietf:params:xml:ns:xmpp-streams";
pub const PING: &str = "urn:xmpp:ping";
pub const BYTESTREAMS: &str = "http://jabber.org/protocol/bytestreams";
pub const DISCO_ITEMS: &str = "http://jabber.org/protocol/disco#items";
pub const DISCO_INFO: &str = "http://jabber.org/protocol/disco#info";
