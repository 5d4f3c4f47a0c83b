//! Minimal owned XML tree for stanza payloads.
//!
//! Stanzas are small, so an owned tree beats streaming here. Serialization
//! escapes text and attribute values; the `xmlns` attribute is emitted only
//! when an element's namespace differs from the inherited default, which
//! keeps the wire form idiomatic (`<message>` under `jabber:client` carries
//! no xmlns, its `<ping xmlns='urn:xmpp:ping'/>` payload does).

use std::fmt::Write as _;

use quick_xml::escape::escape;

pub mod reader;

#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Element(Element),
    Text(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Element {
    name: String,
    namespace: Option<String>,
    attributes: Vec<(String, String)>,
    children: Vec<Node>,
}

impl Element {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            namespace: None,
            attributes: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn with_namespace(name: &str, namespace: &str) -> Self {
        let mut element = Self::new(name);
        element.namespace = Some(namespace.to_string());
        element
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    pub(crate) fn set_namespace(&mut self, namespace: Option<String>) {
        self.namespace = namespace;
    }

    /// Chained attribute setter; replaces an existing value for the name.
    pub fn attr(mut self, name: &str, value: &str) -> Self {
        self.set_attr(name, value);
        self
    }

    pub fn set_attr(&mut self, name: &str, value: &str) {
        if let Some(slot) = self.attributes.iter_mut().find(|(n, _)| n == name) {
            slot.1 = value.to_string();
        } else {
            self.attributes.push((name.to_string(), value.to_string()));
        }
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Chained child appender.
    pub fn child(mut self, child: Element) -> Self {
        self.children.push(Node::Element(child));
        self
    }

    pub fn add_child(&mut self, child: Element) {
        self.children.push(Node::Element(child));
    }

    /// Chained text appender.
    pub fn text(mut self, text: &str) -> Self {
        self.add_text(text);
        self
    }

    pub fn add_text(&mut self, text: &str) {
        self.children.push(Node::Text(text.to_string()));
    }

    pub fn children(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(|node| match node {
            Node::Element(element) => Some(element),
            Node::Text(_) => None,
        })
    }

    /// First element child, if any. Messages and IQs carry exactly one
    /// payload child, so this is the common accessor.
    pub fn first_child(&self) -> Option<&Element> {
        self.children().next()
    }

    pub fn find_child(&self, name: &str) -> Option<&Element> {
        self.children().find(|child| child.name == name)
    }

    pub fn find_child_ns(&self, name: &str, namespace: &str) -> Option<&Element> {
        self.children()
            .find(|child| child.name == name && child.namespace.as_deref() == Some(namespace))
    }

    /// Concatenated character data of this element (direct text children).
    pub fn content(&self) -> String {
        let mut text = String::new();
        for child in &self.children {
            if let Node::Text(s) = child {
                text.push_str(s);
            }
        }
        text
    }

    pub fn has_children(&self) -> bool {
        !self.children.is_empty()
    }

    /// Serializes the element, emitting `xmlns` where the namespace departs
    /// from `inherited`.
    pub fn serialize(&self, inherited: Option<&str>) -> String {
        let mut out = String::new();
        self.write_into(&mut out, inherited);
        out
    }

    fn write_into(&self, out: &mut String, inherited: Option<&str>) {
        let _ = write!(out, "<{}", self.name);
        if self.namespace.is_some() && self.namespace.as_deref() != inherited {
            let _ = write!(
                out,
                " xmlns='{}'",
                escape(self.namespace.as_deref().unwrap_or_default())
            );
        }
        for (name, value) in &self.attributes {
            let _ = write!(out, " {}='{}'", name, escape(value.as_str()));
        }

        if self.children.is_empty() {
            out.push_str("/>");
            return;
        }

        out.push('>');
        // Children inherit this element's namespace as their default.
        let default_ns = self.namespace.as_deref().or(inherited);
        for child in &self.children {
            match child {
                Node::Element(element) => element.write_into(out, default_ns),
                Node::Text(text) => out.push_str(&escape(text.as_str())),
            }
        }
        let _ = write!(out, "</{}>", self.name);
    }
}
