//! Jabber IDs (`node@domain/resource`).
//!
//! `node` and `resource` are optional; `domain` is not. Comparison is
//! case-insensitive on node and domain but case-sensitive on the resource,
//! per RFC 6120 addressing rules.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use crate::error::Error;

#[derive(Debug, Clone)]
pub struct Jid {
    node: Option<String>,
    domain: String,
    resource: Option<String>,
}

impl Jid {
    pub fn new(node: Option<&str>, domain: &str, resource: Option<&str>) -> Result<Self, Error> {
        if domain.is_empty() {
            return Err(Error::InvalidJid("empty domain".into()));
        }
        if node.is_some_and(str::is_empty) {
            return Err(Error::InvalidJid("empty node".into()));
        }
        if resource.is_some_and(str::is_empty) {
            return Err(Error::InvalidJid("empty resource".into()));
        }

        Ok(Self {
            node: node.map(str::to_string),
            domain: domain.to_string(),
            resource: resource.map(str::to_string),
        })
    }

    /// A JID consisting of only a domain, e.g. a server or proxy address.
    pub fn domain_jid(domain: &str) -> Result<Self, Error> {
        Self::new(None, domain, None)
    }

    pub fn node(&self) -> Option<&str> {
        self.node.as_deref()
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn resource(&self) -> Option<&str> {
        self.resource.as_deref()
    }

    /// The JID without its resource part.
    pub fn bare(&self) -> Jid {
        Jid {
            node: self.node.clone(),
            domain: self.domain.clone(),
            resource: None,
        }
    }

    pub fn is_bare(&self) -> bool {
        self.resource.is_none()
    }

    /// True for pure domain JIDs like `example.net`.
    pub fn is_domain(&self) -> bool {
        self.node.is_none() && self.resource.is_none()
    }

    /// Replaces the resource part, e.g. after resource binding.
    pub fn with_resource(&self, resource: &str) -> Result<Jid, Error> {
        Self::new(self.node(), &self.domain, Some(resource))
    }
}

impl FromStr for Jid {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        if s.is_empty() {
            return Err(Error::InvalidJid("empty JID".into()));
        }

        // The resource starts at the first '/'; everything after it is
        // opaque and may itself contain '/' or '@'.
        let (bare, resource) = match s.find('/') {
            Some(pos) => (&s[..pos], Some(&s[pos + 1..])),
            None => (s, None),
        };

        let (node, domain) = match bare.find('@') {
            Some(pos) => (Some(&bare[..pos]), &bare[pos + 1..]),
            None => (None, bare),
        };

        Self::new(node, domain, resource)
    }
}

impl fmt::Display for Jid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ref node) = self.node {
            write!(f, "{node}@")?;
        }
        write!(f, "{}", self.domain)?;
        if let Some(ref resource) = self.resource {
            write!(f, "/{resource}")?;
        }
        Ok(())
    }
}

impl PartialEq for Jid {
    fn eq(&self, other: &Self) -> bool {
        let node_eq = match (&self.node, &other.node) {
            (Some(a), Some(b)) => a.eq_ignore_ascii_case(b),
            (None, None) => true,
            _ => false,
        };
        node_eq && self.domain.eq_ignore_ascii_case(&other.domain) && self.resource == other.resource
    }
}

impl Eq for Jid {}

impl Hash for Jid {
    fn hash<H: Hasher>(&self, state: &mut H) {
        if let Some(ref node) = self.node {
            node.to_ascii_lowercase().hash(state);
        }
        self.domain.to_ascii_lowercase().hash(state);
        self.resource.hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_jid() {
        let jid: Jid = "alice@example.net/orchard".parse().unwrap();
        assert_eq!(jid.node(), Some("alice"));
        assert_eq!(jid.domain(), "example.net");
        assert_eq!(jid.resource(), Some("orchard"));
    }

    #[test]
    fn test_parse_bare_and_domain_jids() {
        let bare: Jid = "alice@example.net".parse().unwrap();
        assert!(bare.is_bare());
        assert!(!bare.is_domain());

        let domain: Jid = "example.net".parse().unwrap();
        assert!(domain.is_domain());
        assert_eq!(domain.node(), None);
    }

    #[test]
    fn test_resource_may_contain_slash_and_at() {
        let jid: Jid = "alice@example.net/foo/bar@baz".parse().unwrap();
        assert_eq!(jid.resource(), Some("foo/bar@baz"));
    }

    #[test]
    fn test_display_round_trip() {
        for s in ["alice@example.net/orchard", "alice@example.net", "example.net"] {
            let jid: Jid = s.parse().unwrap();
            assert_eq!(jid.to_string(), s);
            let again: Jid = jid.to_string().parse().unwrap();
            assert_eq!(jid, again);
        }
    }

    #[test]
    fn test_equality_case_rules() {
        let a: Jid = "Alice@Example.Net/Home".parse().unwrap();
        let b: Jid = "alice@example.net/Home".parse().unwrap();
        let c: Jid = "alice@example.net/home".parse().unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c); // resource is case-sensitive
    }

    #[test]
    fn test_invalid_jids_rejected() {
        assert!("".parse::<Jid>().is_err());
        assert!("@example.net".parse::<Jid>().is_err());
        assert!("alice@".parse::<Jid>().is_err());
        assert!("alice@example.net/".parse::<Jid>().is_err());
    }

    #[test]
    fn test_bare_and_with_resource() {
        let jid: Jid = "alice@example.net/orchard".parse().unwrap();
        assert_eq!(jid.bare().to_string(), "alice@example.net");
        let rebound = jid.bare().with_resource("attic").unwrap();
        assert_eq!(rebound.to_string(), "alice@example.net/attic");
    }
}
