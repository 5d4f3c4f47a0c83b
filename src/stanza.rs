//! The three stanza kinds exchanged on an XMPP stream.
//!
//! Stanzas convert to and from [`Element`] trees; the element form is what
//! the wire writer serializes and what the stream reader produces. Payload
//! children stay opaque `Element`s — the transport core routes them, the
//! layers above interpret them.

use std::fmt;
use std::str::FromStr;

use crate::error::Error;
use crate::jid::Jid;
use crate::ns;
use crate::xml::Element;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IqType {
    Get,
    Set,
    Result,
    Error,
}

impl IqType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IqType::Get => "get",
            IqType::Set => "set",
            IqType::Result => "result",
            IqType::Error => "error",
        }
    }
}

impl FromStr for IqType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "get" => Ok(IqType::Get),
            "set" => Ok(IqType::Set),
            "result" => Ok(IqType::Result),
            "error" => Ok(IqType::Error),
            other => Err(Error::ProtocolViolation(format!("bad iq type '{other}'"))),
        }
    }
}

impl fmt::Display for IqType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct Message {
    pub to: Option<Jid>,
    pub from: Option<Jid>,
    pub id: Option<String>,
    pub language: Option<String>,
    /// Opaque content, e.g. `<body>` plus extension elements.
    pub payload: Vec<Element>,
}

impl Message {
    pub fn to(to: Jid) -> Self {
        Self {
            to: Some(to),
            from: None,
            id: None,
            language: None,
            payload: Vec::new(),
        }
    }

    pub fn with_payload(mut self, payload: Element) -> Self {
        self.payload.push(payload);
        self
    }

    /// Convenience for a chat body child.
    pub fn with_body(self, body: &str) -> Self {
        self.with_payload(Element::new("body").text(body))
    }

    pub fn into_element(self) -> Element {
        let mut element = Element::with_namespace("message", ns::CLIENT);
        write_address_attrs(&mut element, &self.to, &self.from, &self.id, &self.language);
        for child in self.payload {
            element.add_child(child);
        }
        element
    }

    pub fn from_element(element: &Element) -> Result<Self, Error> {
        Ok(Self {
            to: parse_jid_attr(element, "to")?,
            from: parse_jid_attr(element, "from")?,
            id: element.attribute("id").map(str::to_string),
            language: element.attribute("xml:lang").map(str::to_string),
            payload: element.children().cloned().collect(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct Presence {
    pub to: Option<Jid>,
    pub from: Option<Jid>,
    pub id: Option<String>,
    pub language: Option<String>,
    /// `type` attribute (subscribe, unavailable, ...); absent = available.
    pub presence_type: Option<String>,
    pub payload: Vec<Element>,
}

impl Presence {
    /// Broadcast availability (`<presence/>`).
    pub fn available() -> Self {
        Self {
            to: None,
            from: None,
            id: None,
            language: None,
            presence_type: None,
            payload: Vec::new(),
        }
    }

    pub fn into_element(self) -> Element {
        let mut element = Element::with_namespace("presence", ns::CLIENT);
        write_address_attrs(&mut element, &self.to, &self.from, &self.id, &self.language);
        if let Some(ref kind) = self.presence_type {
            element.set_attr("type", kind);
        }
        for child in self.payload {
            element.add_child(child);
        }
        element
    }

    pub fn from_element(element: &Element) -> Result<Self, Error> {
        Ok(Self {
            to: parse_jid_attr(element, "to")?,
            from: parse_jid_attr(element, "from")?,
            id: element.attribute("id").map(str::to_string),
            language: element.attribute("xml:lang").map(str::to_string),
            presence_type: element.attribute("type").map(str::to_string),
            payload: element.children().cloned().collect(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct Iq {
    pub iq_type: IqType,
    /// Required and server-unique within the session; responses echo the
    /// id of the request they answer.
    pub id: String,
    pub to: Option<Jid>,
    pub from: Option<Jid>,
    pub language: Option<String>,
    pub payload: Option<Element>,
}

impl Iq {
    pub fn get(payload: Element) -> Self {
        Self::request(IqType::Get, payload)
    }

    pub fn set(payload: Element) -> Self {
        Self::request(IqType::Set, payload)
    }

    fn request(iq_type: IqType, payload: Element) -> Self {
        Self {
            iq_type,
            id: String::new(), // assigned when sent
            to: None,
            from: None,
            language: None,
            payload: Some(payload),
        }
    }

    pub fn with_to(mut self, to: Jid) -> Self {
        self.to = Some(to);
        self
    }

    pub fn is_request(&self) -> bool {
        matches!(self.iq_type, IqType::Get | IqType::Set)
    }

    pub fn is_response(&self) -> bool {
        !self.is_request()
    }

    /// An empty `result` answering `request`.
    pub fn result_for(request: &Iq) -> Self {
        Self {
            iq_type: IqType::Result,
            id: request.id.clone(),
            to: request.from.clone(),
            from: None,
            language: None,
            payload: None,
        }
    }

    pub fn with_payload(mut self, payload: Element) -> Self {
        self.payload = Some(payload);
        self
    }

    /// An `error` answering `request`, carrying an RFC 6120 defined
    /// condition and echoing the offending payload.
    pub fn error_for(request: &Iq, condition: ErrorCondition) -> Self {
        let error = Element::new("error")
            .attr("type", condition.error_type())
            .child(Element::with_namespace(condition.tag(), ns::STANZAS));

        Self {
            iq_type: IqType::Error,
            id: request.id.clone(),
            to: request.from.clone(),
            from: None,
            language: None,
            payload: Some(error),
        }
    }

    pub fn into_element(self) -> Element {
        let mut element = Element::with_namespace("iq", ns::CLIENT);
        element.set_attr("type", self.iq_type.as_str());
        if !self.id.is_empty() {
            element.set_attr("id", &self.id);
        }
        write_address_attrs(&mut element, &self.to, &self.from, &None, &self.language);
        if let Some(payload) = self.payload {
            element.add_child(payload);
        }
        element
    }

    pub fn from_element(element: &Element) -> Result<Self, Error> {
        let iq_type: IqType = element
            .attribute("type")
            .ok_or_else(|| Error::ProtocolViolation("iq without type".into()))?
            .parse()?;
        let id = element
            .attribute("id")
            .ok_or_else(|| Error::ProtocolViolation("iq without id".into()))?
            .to_string();

        Ok(Self {
            iq_type,
            id,
            to: parse_jid_attr(element, "to")?,
            from: parse_jid_attr(element, "from")?,
            language: element.attribute("xml:lang").map(str::to_string),
            payload: element.first_child().cloned(),
        })
    }
}

/// Stanza error conditions the transport core itself produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCondition {
    FeatureNotImplemented,
    ItemNotFound,
    NotAcceptable,
    ServiceUnavailable,
}

impl ErrorCondition {
    pub fn tag(&self) -> &'static str {
        match self {
            ErrorCondition::FeatureNotImplemented => "feature-not-implemented",
            ErrorCondition::ItemNotFound => "item-not-found",
            ErrorCondition::NotAcceptable => "not-acceptable",
            ErrorCondition::ServiceUnavailable => "service-unavailable",
        }
    }

    pub fn error_type(&self) -> &'static str {
        match self {
            ErrorCondition::NotAcceptable => "modify",
            _ => "cancel",
        }
    }
}

/// A top-level stream child, dispatched by element name.
#[derive(Debug, Clone)]
pub enum Stanza {
    Message(Message),
    Presence(Presence),
    Iq(Iq),
}

impl Stanza {
    pub fn from_element(element: &Element) -> Result<Self, Error> {
        match element.name() {
            "message" => Ok(Stanza::Message(Message::from_element(element)?)),
            "presence" => Ok(Stanza::Presence(Presence::from_element(element)?)),
            "iq" => Ok(Stanza::Iq(Iq::from_element(element)?)),
            other => Err(Error::ProtocolViolation(format!(
                "<{other}> is not a stanza"
            ))),
        }
    }
}

fn write_address_attrs(
    element: &mut Element,
    to: &Option<Jid>,
    from: &Option<Jid>,
    id: &Option<String>,
    language: &Option<String>,
) {
    if let Some(jid) = to {
        element.set_attr("to", &jid.to_string());
    }
    if let Some(jid) = from {
        element.set_attr("from", &jid.to_string());
    }
    if let Some(id) = id {
        element.set_attr("id", id);
    }
    if let Some(language) = language {
        element.set_attr("xml:lang", language);
    }
}

fn parse_jid_attr(element: &Element, name: &str) -> Result<Option<Jid>, Error> {
    element.attribute(name).map(str::parse).transpose()
}
