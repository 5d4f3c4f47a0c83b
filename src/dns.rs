//! SRV resolution for `_xmpp-client._tcp.<domain>`.
//!
//! The resolver is a replaceable collaborator behind [`SrvResolve`]; the
//! default implementation uses hickory with the system DNS configuration.
//! Resolved targets are sorted by (priority asc, weight asc) and walked
//! through [`HostCursor`] so that successive connect attempts move on to
//! the next host. Reconnect policy itself stays with the caller.

use async_trait::async_trait;
use hickory_resolver::TokioAsyncResolver;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// One SRV answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrvTarget {
    pub host: String,
    pub port: u16,
    pub priority: u16,
    pub weight: u16,
}

#[async_trait]
pub trait SrvResolve: Send + Sync {
    /// Returns the SRV records for `name`, unsorted. An empty list means
    /// "no records"; transport failures are errors.
    async fn resolve_srv(&self, name: &str) -> Result<Vec<SrvTarget>>;
}

/// System-configured hickory resolver.
pub struct SystemResolver;

#[async_trait]
impl SrvResolve for SystemResolver {
    async fn resolve_srv(&self, name: &str) -> Result<Vec<SrvTarget>> {
        let resolver = TokioAsyncResolver::tokio_from_system_conf()
            .map_err(|e| Error::Dns(e.to_string()))?;

        let lookup = match resolver.srv_lookup(name).await {
            Ok(lookup) => lookup,
            Err(e) => {
                // "No records" is a normal answer for domains without SRV.
                debug!("SRV lookup for {name} returned nothing: {e}");
                return Ok(Vec::new());
            }
        };

        Ok(lookup
            .iter()
            .filter_map(|srv| {
                let target = srv.target().to_utf8();
                // A root target means "service explicitly not offered".
                if target == "." || target.is_empty() {
                    return None;
                }
                Some(SrvTarget {
                    host: target.trim_end_matches('.').to_string(),
                    port: srv.port(),
                    priority: srv.priority(),
                    weight: srv.weight(),
                })
            })
            .collect())
    }
}

/// Sorted SRV targets plus a cursor over them.
///
/// `next()` yields targets in order and falls back to the literal
/// (host, port) pair once — or immediately when no records exist.
#[derive(Debug)]
pub struct HostCursor {
    targets: Vec<SrvTarget>,
    position: usize,
}

impl HostCursor {
    pub fn new(mut targets: Vec<SrvTarget>, fallback_host: &str, fallback_port: u16) -> Self {
        targets.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then(a.weight.cmp(&b.weight))
        });
        if targets.is_empty() {
            targets.push(SrvTarget {
                host: fallback_host.to_string(),
                port: fallback_port,
                priority: 0,
                weight: 0,
            });
        }

        Self {
            targets,
            position: 0,
        }
    }

    /// Resolves `_xmpp-client._tcp.<domain>` and builds the cursor.
    pub async fn resolve(
        resolver: &dyn SrvResolve,
        domain: &str,
        fallback_port: u16,
    ) -> Self {
        let name = format!("_xmpp-client._tcp.{domain}");
        let targets = match resolver.resolve_srv(&name).await {
            Ok(targets) => {
                debug!("{} SRV record(s) for {name}", targets.len());
                targets
            }
            Err(e) => {
                warn!("SRV resolution failed for {name}: {e}, using literal host");
                Vec::new()
            }
        };

        Self::new(targets, domain, fallback_port)
    }

    /// The next target to try, advancing the cursor. `None` once every
    /// target has been handed out.
    pub fn next(&mut self) -> Option<&SrvTarget> {
        let target = self.targets.get(self.position);
        if target.is_some() {
            self.position += 1;
        }
        target
    }

    /// Remaining targets, the next one first.
    pub fn remaining(&self) -> &[SrvTarget] {
        &self.targets[self.position.min(self.targets.len())..]
    }

    pub fn is_exhausted(&self) -> bool {
        self.position >= self.targets.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(host: &str, priority: u16, weight: u16) -> SrvTarget {
        SrvTarget {
            host: host.to_string(),
            port: 5222,
            priority,
            weight,
        }
    }

    #[test]
    fn test_sort_priority_then_weight_ascending() {
        let mut cursor = HostCursor::new(
            vec![
                target("c", 20, 5),
                target("b", 10, 7),
                target("a", 10, 3),
            ],
            "example.net",
            5222,
        );

        assert_eq!(cursor.next().unwrap().host, "a");
        assert_eq!(cursor.next().unwrap().host, "b");
        assert_eq!(cursor.next().unwrap().host, "c");
        assert!(cursor.next().is_none());
        assert!(cursor.is_exhausted());
    }

    #[test]
    fn test_no_records_falls_back_to_literal() {
        let mut cursor = HostCursor::new(Vec::new(), "example.net", 5299);
        let only = cursor.next().unwrap();
        assert_eq!(only.host, "example.net");
        assert_eq!(only.port, 5299);
        assert!(cursor.next().is_none());
    }

    #[test]
    fn test_remaining_view() {
        let mut cursor = HostCursor::new(
            vec![target("a", 1, 1), target("b", 2, 1)],
            "example.net",
            5222,
        );
        assert_eq!(cursor.remaining().len(), 2);
        cursor.next();
        assert_eq!(cursor.remaining().len(), 1);
        assert_eq!(cursor.remaining()[0].host, "b");
    }

    struct FixedResolver(Vec<SrvTarget>);

    #[async_trait]
    impl SrvResolve for FixedResolver {
        async fn resolve_srv(&self, _name: &str) -> Result<Vec<SrvTarget>> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn test_resolve_uses_collaborator() {
        let resolver = FixedResolver(vec![target("xmpp1.example.net", 5, 0)]);
        let mut cursor = HostCursor::resolve(&resolver, "example.net", 5222).await;
        assert_eq!(cursor.next().unwrap().host, "xmpp1.example.net");
    }
}
