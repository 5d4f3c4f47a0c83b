//! External address probing and proxy discovery.
//!
//! Actual probes (server IP-check extensions, STUN, UPnP) live outside
//! the transport core; they plug in through [`AddressProbe`]. What lives
//! here is the view of our own addressing the NAT check needs — the
//! routing-derived local IPv4 — and the service-discovery walk that turns
//! a server's item list into usable bytestream proxies.

use std::net::{IpAddr, UdpSocket};

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::client::XmppClient;
use crate::error::Result;
use crate::jid::Jid;
use crate::ns;
use crate::stanza::Iq;
use crate::xml::Element;

use super::Streamhost;

/// Timeout for each discovery IQ; proxies that do not answer promptly
/// are not worth advertising.
const DISCOVERY_TIMEOUT_MS: i64 = 10_000;

/// A source of addresses the outside world may reach us on.
#[async_trait]
pub trait AddressProbe: Send + Sync {
    /// Candidate external addresses; an empty list means "don't know".
    async fn external_addresses(&self) -> Vec<IpAddr>;
}

/// The IPv4 address the default route sends our packets from. No traffic
/// is generated; connecting a UDP socket only selects a source address.
pub fn local_ipv4() -> Option<IpAddr> {
    let socket = UdpSocket::bind(("0.0.0.0", 0)).ok()?;
    socket.connect(("192.0.2.1", 9)).ok()?;
    let addr = socket.local_addr().ok()?.ip();
    if addr.is_unspecified() || addr.is_loopback() {
        None
    } else {
        Some(addr)
    }
}

/// Finds bytestream proxies through the server's service discovery:
/// items of the own domain, filtered to identities with
/// `category="proxy"` and `type="bytestreams"`, each then asked for its
/// streamhost address. Unreachable candidates are skipped, not fatal.
pub async fn discover_proxies(client: &XmppClient) -> Result<Vec<Streamhost>> {
    let domain = Jid::domain_jid(&client.domain())?;

    let items_query = Iq::get(Element::with_namespace("query", ns::DISCO_ITEMS))
        .with_to(domain.clone());
    let items = client.iq_request(items_query, Some(DISCOVERY_TIMEOUT_MS)).await?;
    let item_jids = parse_disco_items(&items);
    debug!("{} disco item(s) under {domain}", item_jids.len());

    let mut proxies = Vec::new();
    for jid in item_jids {
        match probe_proxy(client, &jid).await {
            Ok(Some(streamhost)) => proxies.push(streamhost),
            Ok(None) => {}
            Err(err) => warn!("discovery of {jid} failed: {err}"),
        }
    }
    Ok(proxies)
}

/// Checks one disco item and resolves it to a streamhost when it
/// identifies as a bytestreams proxy.
async fn probe_proxy(client: &XmppClient, jid: &Jid) -> Result<Option<Streamhost>> {
    let info_query =
        Iq::get(Element::with_namespace("query", ns::DISCO_INFO)).with_to(jid.clone());
    let info = client.iq_request(info_query, Some(DISCOVERY_TIMEOUT_MS)).await?;
    if !has_proxy_identity(&info) {
        return Ok(None);
    }

    let address_query =
        Iq::get(Element::with_namespace("query", ns::BYTESTREAMS)).with_to(jid.clone());
    let address = client
        .iq_request(address_query, Some(DISCOVERY_TIMEOUT_MS))
        .await?;
    let streamhost = address
        .payload
        .as_ref()
        .filter(|query| query.namespace() == Some(ns::BYTESTREAMS))
        .and_then(|query| query.find_child("streamhost"))
        .map(Streamhost::from_element)
        .transpose()?;
    Ok(streamhost)
}

fn parse_disco_items(response: &Iq) -> Vec<Jid> {
    response
        .payload
        .as_ref()
        .filter(|query| query.namespace() == Some(ns::DISCO_ITEMS))
        .map(|query| {
            query
                .children()
                .filter(|child| child.name() == "item")
                .filter_map(|item| item.attribute("jid"))
                .filter_map(|jid| jid.parse().ok())
                .collect()
        })
        .unwrap_or_default()
}

fn has_proxy_identity(response: &Iq) -> bool {
    response
        .payload
        .as_ref()
        .filter(|query| query.namespace() == Some(ns::DISCO_INFO))
        .map(|query| {
            query
                .children()
                .filter(|child| child.name() == "identity")
                .any(|identity| {
                    identity.attribute("category") == Some("proxy")
                        && identity.attribute("type") == Some("bytestreams")
                })
        })
        .unwrap_or(false)
}

/// Discards external candidates that are in fact assigned locally; what
/// remains is the set of addresses that only exist on the far side of a
/// NAT. The transfer must be mediated when *every* candidate is.
pub fn behind_nat(external: &[IpAddr], local: Option<IpAddr>) -> bool {
    external.iter().all(|addr| Some(*addr) != local)
}
