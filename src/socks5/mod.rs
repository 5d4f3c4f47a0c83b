//! XEP-0065 SOCKS5 bytestreams, TCP mode.
//!
//! Outgoing transfers pick between two shapes: **direct**, where we bind
//! a listener, advertise ourselves as the streamhost and serve the SOCKS5
//! handshake, and **mediated**, where both sides meet at a proxy and we
//! activate the relayed stream. Incoming transfers walk the initiator's
//! advertised streamhosts and connect as a SOCKS5 client. In either
//! shape the CONNECT destination is not an address but the hex SHA-1 of
//! `sid ‖ initiator ‖ target`.

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use dashmap::DashMap;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::XmppClient;
use crate::config::BytestreamConfig;
use crate::error::{Error, Result};
use crate::jid::Jid;
use crate::ns;
use crate::stanza::{ErrorCondition, Iq, IqType};
use crate::wire::AsyncStream;
use crate::xml::Element;

pub mod discovery;
pub mod proto;

pub use discovery::AddressProbe;

/// How long a direct listener waits for the peer before giving up.
const ACCEPT_TIMEOUT: Duration = Duration::from_secs(180);
const CHUNK: usize = 8192;

/// The CONNECT destination of a bytestream: lowercase hex SHA-1 over the
/// sid and both full JIDs.
pub fn sid_hash(sid: &str, initiator: &Jid, target: &Jid) -> String {
    let mut hasher = Sha1::new();
    hasher.update(sid.as_bytes());
    hasher.update(initiator.to_string().as_bytes());
    hasher.update(target.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

/// A SOCKS5 endpoint advertised in a bytestreams query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Streamhost {
    pub jid: Jid,
    pub host: String,
    pub port: u16,
}

impl Streamhost {
    pub fn to_element(&self) -> Element {
        Element::new("streamhost")
            .attr("jid", &self.jid.to_string())
            .attr("host", &self.host)
            .attr("port", &self.port.to_string())
    }

    pub fn from_element(element: &Element) -> Result<Self> {
        let jid = element
            .attribute("jid")
            .ok_or_else(|| Error::ProtocolViolation("streamhost without jid".into()))?
            .parse()?;
        let host = element
            .attribute("host")
            .ok_or_else(|| Error::ProtocolViolation("streamhost without host".into()))?
            .to_string();
        let port = element
            .attribute("port")
            .and_then(|port| port.parse().ok())
            .ok_or_else(|| Error::ProtocolViolation("streamhost without usable port".into()))?;
        Ok(Self { jid, host, port })
    }
}

/// A stream-initiation session as this subsystem sees it: agreed sid,
/// both full JIDs, the payload size and the byte sink/source owned by
/// the file-transfer layer above.
pub struct SiSession {
    sid: String,
    initiator: Jid,
    target: Jid,
    size: u64,
    count: AtomicU64,
    stream: Mutex<Option<Box<dyn AsyncStream>>>,
    valid: AtomicBool,
    cancel: CancellationToken,
}

impl SiSession {
    pub fn new(
        sid: &str,
        initiator: Jid,
        target: Jid,
        size: u64,
        stream: Box<dyn AsyncStream>,
    ) -> Arc<Self> {
        Arc::new(Self {
            sid: sid.to_string(),
            initiator,
            target,
            size,
            count: AtomicU64::new(0),
            stream: Mutex::new(Some(stream)),
            valid: AtomicBool::new(true),
            cancel: CancellationToken::new(),
        })
    }

    pub fn sid(&self) -> &str {
        &self.sid
    }

    pub fn initiator(&self) -> &Jid {
        &self.initiator
    }

    pub fn target(&self) -> &Jid {
        &self.target
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Bytes moved so far; monotone, never beyond `size`.
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::SeqCst)
    }

    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::SeqCst)
    }

    /// Invalidates the session; a running transfer loop observes the
    /// cancellation and exits through its aborted path.
    pub fn invalidate(&self) {
        self.valid.store(false, Ordering::SeqCst);
        self.cancel.cancel();
    }

    fn hash(&self) -> String {
        sid_hash(&self.sid, &self.initiator, &self.target)
    }

    fn add_transferred(&self, bytes: u64) {
        self.count.fetch_add(bytes, Ordering::SeqCst);
    }

    fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn take_stream(&self) -> Result<Box<dyn AsyncStream>> {
        self.stream
            .lock()
            .expect("session stream lock")
            .take()
            .filter(|_| self.is_valid())
            .ok_or(Error::TransferAborted)
    }
}

type TransferHandler = Box<dyn Fn(&SiSession) + Send + Sync>;

#[derive(Default)]
struct TransferHandlers {
    bytes_transferred: RwLock<Option<TransferHandler>>,
    transfer_aborted: RwLock<Option<TransferHandler>>,
}

/// The bytestream subsystem of one client session.
///
/// Holds a non-owning handle back to the client (the client does not know
/// about its extensions, extensions must not keep it alive).
pub struct Socks5Bytestreams {
    client: Weak<XmppClient>,
    config: BytestreamConfig,
    sessions: DashMap<String, Arc<SiSession>>,
    probes: Vec<Arc<dyn AddressProbe>>,
    handlers: TransferHandlers,
}

impl Socks5Bytestreams {
    pub fn new(client: &Arc<XmppClient>, config: BytestreamConfig) -> Self {
        Self {
            client: Arc::downgrade(client),
            config,
            sessions: DashMap::new(),
            probes: Vec::new(),
            handlers: TransferHandlers::default(),
        }
    }

    /// Registers an external address source (server IP-check, STUN, UPnP
    /// — all of them collaborators living outside this crate).
    pub fn add_address_probe(&mut self, probe: Arc<dyn AddressProbe>) {
        self.probes.push(probe);
    }

    pub fn on_bytes_transferred(&self, handler: impl Fn(&SiSession) + Send + Sync + 'static) {
        *self
            .handlers
            .bytes_transferred
            .write()
            .expect("handler lock") = Some(Box::new(handler));
    }

    pub fn on_transfer_aborted(&self, handler: impl Fn(&SiSession) + Send + Sync + 'static) {
        *self
            .handlers
            .transfer_aborted
            .write()
            .expect("handler lock") = Some(Box::new(handler));
    }

    /// Makes an SI session visible to the incoming-query handler.
    pub fn register_session(&self, session: Arc<SiSession>) {
        self.sessions.insert(session.sid().to_string(), session);
    }

    pub fn session(&self, sid: &str) -> Option<Arc<SiSession>> {
        self.sessions.get(sid).map(|entry| entry.value().clone())
    }

    /// Invalidates the session immediately; the running transfer loop
    /// exits through its aborted fast path.
    pub fn cancel_transfer(&self, session: &SiSession) {
        session.invalidate();
        self.sessions.remove(session.sid());
    }

    // ── Outgoing (initiator side) ────────────────────────────────

    /// Runs one outgoing transfer to completion. Any failure aborts the
    /// session: it is invalidated, the aborted event fires, and nothing
    /// is retried.
    pub async fn send(&self, session: &Arc<SiSession>) -> Result<()> {
        self.register_session(session.clone());
        let outcome = self.run_outgoing(session).await;
        self.sessions.remove(session.sid());

        if let Err(ref err) = outcome {
            warn!("transfer {} aborted: {err}", session.sid());
            session.invalidate();
            self.emit_aborted(session);
        }
        outcome
    }

    async fn run_outgoing(&self, session: &Arc<SiSession>) -> Result<()> {
        let client = self.client()?;

        let mut external = Vec::new();
        let mut proxies = Vec::new();
        if self.config.proxy_allowed {
            external = self.external_addresses().await;
            if discovery::behind_nat(&external, discovery::local_ipv4()) {
                proxies = self.configured_proxies();
                if proxies.is_empty() {
                    proxies = discovery::discover_proxies(&client)
                        .await
                        .unwrap_or_default();
                }
            }
        }

        if proxies.is_empty() {
            self.send_direct(&client, session, &external).await
        } else {
            self.send_mediated(&client, session, proxies).await
        }
    }

    async fn send_direct(
        &self,
        client: &XmppClient,
        session: &Arc<SiSession>,
        external: &[IpAddr],
    ) -> Result<()> {
        let listener = bind_in_range(self.config.port_from, self.config.port_to).await?;
        let port = listener.local_addr().map_err(Error::from)?.port();

        let mut streamhosts = Vec::new();
        let advertise = |host: String| Streamhost {
            jid: session.initiator().clone(),
            host,
            port,
        };
        if let Some(local) = discovery::local_ipv4() {
            streamhosts.push(advertise(local.to_string()));
        }
        for addr in external {
            let candidate = advertise(addr.to_string());
            if !streamhosts.contains(&candidate) {
                streamhosts.push(candidate);
            }
        }
        if streamhosts.is_empty() {
            streamhosts.push(advertise("127.0.0.1".to_string()));
        }

        // The peer may connect before it answers the offer, so the
        // listener must already be serving while the IQ is in flight.
        let accept_task = tokio::spawn(accept_direct(
            listener,
            session.hash(),
            session.cancel_token(),
        ));

        let mut query = bytestreams_query(session.sid());
        for streamhost in &streamhosts {
            query.add_child(streamhost.to_element());
        }
        let offer = Iq::set(query).with_to(session.target().clone());

        let response = match client.iq_request(offer, None).await {
            Ok(response) => response,
            Err(err) => {
                accept_task.abort();
                return Err(err);
            }
        };
        let used = match streamhost_used(&response) {
            Ok(used) => used,
            Err(err) => {
                accept_task.abort();
                return Err(err);
            }
        };
        if used != *session.initiator() {
            accept_task.abort();
            return Err(Error::Socks5(format!(
                "peer selected foreign streamhost {used}"
            )));
        }

        let socket = accept_task
            .await
            .map_err(|_| Error::Socks5("listener task failed".into()))??;
        info!("direct bytestream {} established", session.sid());
        self.stream_payload_out(socket, session).await
    }

    async fn send_mediated(
        &self,
        client: &XmppClient,
        session: &Arc<SiSession>,
        proxies: Vec<Streamhost>,
    ) -> Result<()> {
        let mut query = bytestreams_query(session.sid());
        for proxy in &proxies {
            query.add_child(proxy.to_element());
        }
        let offer = Iq::set(query).with_to(session.target().clone());
        let response = client.iq_request(offer, None).await?;
        let used = streamhost_used(&response)?;
        let proxy = proxies
            .into_iter()
            .find(|proxy| proxy.jid == used)
            .ok_or_else(|| Error::Socks5(format!("peer selected unknown proxy {used}")))?;
        info!("peer selected proxy {} for {}", proxy.jid, session.sid());

        let mut socket = TcpStream::connect((proxy.host.as_str(), proxy.port))
            .await
            .map_err(|e| Error::Socks5(format!("cannot reach proxy {}: {e}", proxy.jid)))?;
        proto::connect(&mut socket, &session.hash(), 0).await?;

        let activate = bytestreams_query(session.sid())
            .child(Element::new("activate").text(&session.target().to_string()));
        let activation = client
            .iq_request(Iq::set(activate).with_to(proxy.jid.clone()), None)
            .await?;
        if activation.iq_type == IqType::Error {
            return Err(Error::Socks5(format!(
                "proxy {} refused activation",
                proxy.jid
            )));
        }

        self.stream_payload_out(socket, session).await
    }

    // ── Incoming (target side) ───────────────────────────────────

    /// Handles a `<query xmlns='…bytestreams'/>` IQ set from a peer
    /// initiating a transfer towards us.
    pub async fn handle_query(&self, request: Iq) -> Result<()> {
        let client = self.client()?;
        let query = request
            .payload
            .as_ref()
            .filter(|payload| {
                payload.name() == "query" && payload.namespace() == Some(ns::BYTESTREAMS)
            })
            .ok_or_else(|| Error::ProtocolViolation("not a bytestreams query".into()))?;
        let sid = query.attribute("sid").unwrap_or_default().to_string();

        let session = self.session(&sid).filter(|session| {
            session.is_valid() && request.from.as_ref() == Some(session.initiator())
        });
        let Some(session) = session else {
            client
                .iq_response(Iq::error_for(&request, ErrorCondition::NotAcceptable))
                .await?;
            return Err(Error::Socks5(format!("no open session for sid '{sid}'")));
        };

        if query.attribute("mode") == Some("udp") {
            client
                .iq_response(Iq::error_for(&request, ErrorCondition::FeatureNotImplemented))
                .await?;
            return Err(Error::Socks5("udp mode is not supported".into()));
        }

        let streamhosts: Vec<Streamhost> = query
            .children()
            .filter(|child| child.name() == "streamhost")
            .filter_map(|child| Streamhost::from_element(child).ok())
            .collect();

        let hash = session.hash();
        for streamhost in &streamhosts {
            let mut socket = match try_streamhost(streamhost, &hash).await {
                Ok(socket) => socket,
                Err(err) => {
                    debug!("streamhost {} unreachable: {err}", streamhost.jid);
                    continue;
                }
            };

            let used = bytestreams_query(&sid).child(
                Element::new("streamhost-used").attr("jid", &streamhost.jid.to_string()),
            );
            client
                .iq_response(Iq::result_for(&request).with_payload(used))
                .await?;
            info!("receiving {sid} via {}", streamhost.jid);

            let outcome = self.stream_payload_in(&mut socket, &session).await;
            self.sessions.remove(&sid);
            if outcome.is_err() {
                session.invalidate();
                self.emit_aborted(&session);
            }
            return outcome;
        }

        client
            .iq_response(Iq::error_for(&request, ErrorCondition::ItemNotFound))
            .await?;
        Err(Error::Socks5("no advertised streamhost reachable".into()))
    }

    // ── Payload pumps ────────────────────────────────────────────

    async fn stream_payload_out<S>(&self, mut socket: S, session: &Arc<SiSession>) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut source = session.take_stream()?;
        let cancel = session.cancel_token();
        let mut buf = [0u8; CHUNK];

        while session.count() < session.size() {
            let want = CHUNK.min((session.size() - session.count()) as usize);
            let read = tokio::select! {
                _ = cancel.cancelled() => return Err(Error::TransferAborted),
                read = source.read(&mut buf[..want]) => {
                    read.map_err(|_| Error::TransferAborted)?
                }
            };
            if read == 0 {
                break; // source ran dry before `size`
            }
            socket
                .write_all(&buf[..read])
                .await
                .map_err(|_| Error::TransferAborted)?;
            session.add_transferred(read as u64);
            self.emit_bytes(session);
        }
        socket.flush().await.map_err(|_| Error::TransferAborted)?;

        if session.count() < session.size() {
            return Err(Error::TransferAborted);
        }
        info!(
            "transfer {} complete, {} bytes sent",
            session.sid(),
            session.count()
        );
        Ok(())
    }

    async fn stream_payload_in<S>(&self, socket: &mut S, session: &Arc<SiSession>) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut sink = session.take_stream()?;
        let cancel = session.cancel_token();
        let mut buf = [0u8; CHUNK];

        while session.count() < session.size() {
            let want = CHUNK.min((session.size() - session.count()) as usize);
            let read = tokio::select! {
                _ = cancel.cancelled() => return Err(Error::TransferAborted),
                read = socket.read(&mut buf[..want]) => {
                    read.map_err(|_| Error::TransferAborted)?
                }
            };
            if read == 0 {
                break; // peer hung up short
            }
            sink.write_all(&buf[..read])
                .await
                .map_err(|_| Error::TransferAborted)?;
            session.add_transferred(read as u64);
            self.emit_bytes(session);
        }
        sink.flush().await.map_err(|_| Error::TransferAborted)?;

        if session.count() < session.size() {
            return Err(Error::TransferAborted);
        }
        info!(
            "transfer {} complete, {} bytes received",
            session.sid(),
            session.count()
        );
        Ok(())
    }

    // ── Internals ────────────────────────────────────────────────

    fn client(&self) -> Result<Arc<XmppClient>> {
        self.client.upgrade().ok_or(Error::Disconnected)
    }

    async fn external_addresses(&self) -> Vec<IpAddr> {
        let mut addresses = Vec::new();
        for probe in &self.probes {
            for addr in probe.external_addresses().await {
                if !addresses.contains(&addr) {
                    addresses.push(addr);
                }
            }
        }
        addresses
    }

    fn configured_proxies(&self) -> Vec<Streamhost> {
        self.config
            .proxies
            .iter()
            .filter_map(|proxy| match proxy.jid.parse() {
                Ok(jid) => Some(Streamhost {
                    jid,
                    host: proxy.host.clone(),
                    port: proxy.port,
                }),
                Err(_) => {
                    warn!("ignoring configured proxy with bad jid '{}'", proxy.jid);
                    None
                }
            })
            .collect()
    }

    fn emit_bytes(&self, session: &SiSession) {
        if let Some(handler) = self
            .handlers
            .bytes_transferred
            .read()
            .expect("handler lock")
            .as_ref()
        {
            handler(session);
        }
    }

    fn emit_aborted(&self, session: &SiSession) {
        if let Some(handler) = self
            .handlers
            .transfer_aborted
            .read()
            .expect("handler lock")
            .as_ref()
        {
            handler(session);
        }
    }
}

async fn accept_direct(
    listener: TcpListener,
    expected_hash: String,
    cancel: CancellationToken,
) -> Result<TcpStream> {
    let negotiate = async {
        let (mut socket, peer) = listener.accept().await.map_err(Error::from)?;
        debug!("bytestream peer connected from {peer}");
        proto::accept(&mut socket, &expected_hash).await?;
        Ok::<TcpStream, Error>(socket)
    };

    tokio::select! {
        _ = cancel.cancelled() => Err(Error::TransferAborted),
        outcome = tokio::time::timeout(ACCEPT_TIMEOUT, negotiate) => {
            outcome.map_err(|_| Error::Socks5("no connection within the accept window".into()))?
        }
    }
}

async fn try_streamhost(streamhost: &Streamhost, hash: &str) -> Result<TcpStream> {
    let mut socket = TcpStream::connect((streamhost.host.as_str(), streamhost.port))
        .await
        .map_err(|e| Error::Socks5(e.to_string()))?;
    proto::connect(&mut socket, hash, 0).await?;
    Ok(socket)
}

/// First free listener port in the configured inclusive range.
async fn bind_in_range(from: u16, to: u16) -> Result<TcpListener> {
    for port in from..=to {
        if let Ok(listener) = TcpListener::bind(("0.0.0.0", port)).await {
            return Ok(listener);
        }
    }
    Err(Error::Socks5(format!("no free port in {from}..={to}")))
}

fn bytestreams_query(sid: &str) -> Element {
    Element::with_namespace("query", ns::BYTESTREAMS).attr("sid", sid)
}

/// Extracts `<streamhost-used jid='…'/>` from the peer's answer.
fn streamhost_used(response: &Iq) -> Result<Jid> {
    if response.iq_type == IqType::Error {
        return Err(Error::Socks5("peer refused the streamhost offer".into()));
    }
    response
        .payload
        .as_ref()
        .filter(|query| query.namespace() == Some(ns::BYTESTREAMS))
        .and_then(|query| query.find_child("streamhost-used"))
        .and_then(|used| used.attribute("jid"))
        .ok_or_else(|| Error::ProtocolViolation("answer without streamhost-used".into()))?
        .parse()
}
