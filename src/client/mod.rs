//! The XMPP session core.
//!
//! [`XmppClient`] owns the wire, runs the layered handshake (SRV → TCP →
//! TLS → SASL → resource binding) and then keeps two long-running tasks
//! per session: the reader, which turns inbound elements into stanzas and
//! routes IQ responses straight to their waiters, and the dispatcher,
//! which feeds everything else to the registered handlers in arrival
//! order.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ClientConfig, TlsMode};
use crate::dns::{HostCursor, SrvResolve, SrvTarget, SystemResolver};
use crate::error::{Error, Result};
use crate::features::StreamFeatures;
use crate::jid::Jid;
use crate::ns;
use crate::sasl;
use crate::stanza::{Iq, Message, Presence, Stanza};
use crate::wire::{self, BoxStream, CertValidator, StanzaWriter, TlsPolicy};
use crate::xml::reader::StreamReader;
use crate::xml::Element;

mod events;
mod pending;

use events::Handlers;
use pending::{IdGenerator, PendingTable};

/// Per-element ceiling during the handshake, where the peer must answer
/// promptly or the connect attempt is hopeless.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// High-water mark of the inbound stanza queue. A full queue blocks the
/// reader rather than growing without bound behind a slow dispatcher.
const STANZA_QUEUE_CAPACITY: usize = 128;

pub struct XmppClient {
    config: RwLock<ClientConfig>,
    resolver: Box<dyn SrvResolve>,
    cert_validator: Option<CertValidator>,
    handlers: Arc<Handlers>,
    pending: Arc<PendingTable>,
    ids: IdGenerator,
    session: Mutex<Option<Session>>,
    connected: Arc<AtomicBool>,
    cursor: Mutex<Option<HostCursor>>,
}

struct Session {
    writer: Arc<StanzaWriter>,
    jid: Option<Jid>,
    peer_language: String,
    waiter_cancel: CancellationToken,
    dispatcher_cancel: CancellationToken,
    closing: Arc<AtomicBool>,
    reader_task: JoinHandle<()>,
    dispatcher_task: JoinHandle<()>,
}

impl XmppClient {
    pub fn new(config: ClientConfig) -> Self {
        Self::with_resolver(config, Box::new(SystemResolver))
    }

    /// Swaps the SRV collaborator, e.g. for tests or custom resolution.
    pub fn with_resolver(config: ClientConfig, resolver: Box<dyn SrvResolve>) -> Self {
        Self {
            config: RwLock::new(config),
            resolver,
            cert_validator: None,
            handlers: Arc::new(Handlers::default()),
            pending: Arc::new(PendingTable::default()),
            ids: IdGenerator::new(),
            session: Mutex::new(None),
            connected: Arc::new(AtomicBool::new(false)),
            cursor: Mutex::new(None),
        }
    }

    /// Replaces built-in TLS verification with a predicate over the
    /// peer's DER certificate. Without this, verification is strict
    /// unless `tls_verify = false` opts out.
    pub fn with_certificate_validator(mut self, validator: CertValidator) -> Self {
        self.cert_validator = Some(validator);
        self
    }

    // ── Event registration ───────────────────────────────────────

    pub fn on_message(&self, handler: impl Fn(Message) + Send + Sync + 'static) {
        self.handlers.set_message(Box::new(handler));
    }

    pub fn on_presence(&self, handler: impl Fn(Presence) + Send + Sync + 'static) {
        self.handlers.set_presence(Box::new(handler));
    }

    /// Handler for inbound IQ *requests*; responses never reach it, they
    /// wake their waiters directly.
    pub fn on_iq(&self, handler: impl Fn(Iq) + Send + Sync + 'static) {
        self.handlers.set_iq(Box::new(handler));
    }

    pub fn on_error(&self, handler: impl Fn(Error) + Send + Sync + 'static) {
        self.handlers.set_error(Box::new(handler));
    }

    // ── Lifecycle ────────────────────────────────────────────────

    /// Connects and runs the full handshake. Each call consumes the next
    /// SRV target; the list is re-resolved once exhausted. Any existing
    /// session is torn down first.
    pub async fn connect(&self) -> Result<()> {
        self.close().await?;

        let config = self.config.read().expect("config lock").clone();
        let policy = TlsPolicy {
            accept_invalid: !config.tls_verify,
            validator: self.cert_validator.clone(),
        };

        let target = self.next_target(&config).await?;
        info!("connecting to {}:{} for {}", target.host, target.port, config.hostname);

        let negotiated = negotiate(&config, &policy, &target.host, target.port).await?;

        let writer = Arc::new(StanzaWriter::new(negotiated.writer, config.debug_stanzas));
        let waiter_cancel = CancellationToken::new();
        let dispatcher_cancel = CancellationToken::new();
        let closing = Arc::new(AtomicBool::new(false));
        let (queue_tx, queue_rx) = mpsc::channel(STANZA_QUEUE_CAPACITY);

        let dispatcher_task = tokio::spawn(dispatcher_loop(
            queue_rx,
            self.handlers.clone(),
            dispatcher_cancel.clone(),
        ));
        let reader_task = tokio::spawn(reader_loop(
            negotiated.reader,
            ReaderContext {
                pending: self.pending.clone(),
                queue: queue_tx,
                handlers: self.handlers.clone(),
                connected: self.connected.clone(),
                waiter_cancel: waiter_cancel.clone(),
                dispatcher_cancel: dispatcher_cancel.clone(),
                closing: closing.clone(),
                debug_stanzas: config.debug_stanzas,
            },
        ));

        self.ids.regenerate();
        self.connected.store(true, Ordering::SeqCst);
        match &negotiated.jid {
            Some(jid) => info!("session established as {jid}"),
            None => info!("session established (pre-authentication)"),
        }

        *self.session.lock().await = Some(Session {
            writer,
            jid: negotiated.jid,
            peer_language: negotiated.peer_language,
            waiter_cancel,
            dispatcher_cancel,
            closing,
            reader_task,
            dispatcher_task,
        });

        Ok(())
    }

    /// Tears down the current session and reconnects with new credentials.
    pub async fn authenticate(&self, username: &str, password: &str) -> Result<()> {
        self.close().await?;
        {
            let mut config = self.config.write().expect("config lock");
            config.username = Some(username.to_string());
            config.password = Some(password.to_string());
        }
        self.connect().await
    }

    /// Closes the stream and stops both loops: waiters are woken first,
    /// the dispatcher second.
    pub async fn close(&self) -> Result<()> {
        let Some(session) = self.session.lock().await.take() else {
            return Ok(());
        };

        session.closing.store(true, Ordering::SeqCst);
        // Best effort; the wire may already be gone.
        let _ = session.writer.send_raw("</stream:stream>").await;

        session.waiter_cancel.cancel();
        session.dispatcher_cancel.cancel();
        session.reader_task.abort();

        self.pending.clear();
        self.connected.store(false, Ordering::SeqCst);
        let _ = session.dispatcher_task.await;
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// The full JID assigned at resource binding.
    pub async fn jid(&self) -> Option<Jid> {
        self.session.lock().await.as_ref().and_then(|s| s.jid.clone())
    }

    /// The peer's stream default language.
    pub async fn peer_language(&self) -> Option<String> {
        self.session
            .lock()
            .await
            .as_ref()
            .map(|s| s.peer_language.clone())
    }

    pub fn domain(&self) -> String {
        self.config.read().expect("config lock").hostname.clone()
    }

    /// SRV targets not yet consumed by connect attempts.
    pub async fn remaining_hosts(&self) -> Vec<SrvTarget> {
        self.cursor
            .lock()
            .await
            .as_ref()
            .map(|cursor| cursor.remaining().to_vec())
            .unwrap_or_default()
    }

    async fn next_target(&self, config: &ClientConfig) -> Result<SrvTarget> {
        let mut cursor = self.cursor.lock().await;
        if cursor.as_ref().map_or(true, HostCursor::is_exhausted) {
            *cursor = Some(
                HostCursor::resolve(self.resolver.as_ref(), &config.hostname, config.port).await,
            );
        }
        cursor
            .as_mut()
            .and_then(|c| c.next().cloned())
            .ok_or_else(|| Error::Dns(format!("no host to connect for {}", config.hostname)))
    }

    // ── Stanza sending ───────────────────────────────────────────

    pub async fn send_message(&self, message: Message) -> Result<()> {
        self.writer().await?.send_element(&message.into_element()).await
    }

    pub async fn send_presence(&self, presence: Presence) -> Result<()> {
        self.writer().await?.send_element(&presence.into_element()).await
    }

    /// Sends a `get`/`set` and blocks until the response, a timeout, or
    /// the death of the connection. `timeout_ms` falls back to the
    /// configured default; -1 waits forever.
    pub async fn iq_request(&self, mut request: Iq, timeout_ms: Option<i64>) -> Result<Iq> {
        if !request.is_request() {
            return Err(Error::ProtocolViolation(
                "iq_request takes type get or set".into(),
            ));
        }
        let timeout = self.resolve_timeout(timeout_ms)?;
        let (writer, waiter_cancel) = {
            let guard = self.session.lock().await;
            let session = guard.as_ref().ok_or(Error::Disconnected)?;
            (session.writer.clone(), session.waiter_cancel.clone())
        };

        if request.id.is_empty() {
            request.id = self.ids.next();
        }
        let id = request.id.clone();
        let server_ping = self.is_server_ping(&request);

        let response_rx = self.pending.insert_waiter(&id);
        if let Err(err) = writer.send_element(&request.into_element()).await {
            self.pending.remove(&id);
            return Err(err);
        }

        let expiry = async {
            match timeout {
                Some(duration) => tokio::time::sleep(duration).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            response = response_rx => match response {
                Ok(iq) => Ok(iq),
                Err(_) => Err(Error::Disconnected),
            },
            _ = waiter_cancel.cancelled() => {
                self.pending.remove(&id);
                Err(Error::Disconnected)
            }
            _ = expiry => {
                self.pending.remove(&id);
                if server_ping {
                    // An unanswered ping to our own server means the
                    // connection is gone, whatever TCP still believes.
                    warn!("server ping {id} timed out, session presumed dead");
                    self.teardown_after_fatal(Error::Disconnected).await;
                    Err(Error::Disconnected)
                } else {
                    Err(Error::Timeout)
                }
            }
        }
    }

    /// Sends a `get`/`set` and registers `callback(id, response)` for the
    /// answer. Returns the assigned id immediately.
    pub async fn iq_request_with_callback(
        &self,
        mut request: Iq,
        callback: impl FnOnce(String, Iq) + Send + Sync + 'static,
    ) -> Result<String> {
        if !request.is_request() {
            return Err(Error::ProtocolViolation(
                "iq_request takes type get or set".into(),
            ));
        }
        let writer = self.writer().await?;

        if request.id.is_empty() {
            request.id = self.ids.next();
        }
        let id = request.id.clone();

        self.pending.insert_callback(&id, Box::new(callback));
        if let Err(err) = writer.send_element(&request.into_element()).await {
            self.pending.remove(&id);
            return Err(err);
        }
        Ok(id)
    }

    /// Answers a previously received IQ request.
    pub async fn iq_response(&self, response: Iq) -> Result<()> {
        if !response.is_response() {
            return Err(Error::ProtocolViolation(
                "iq_response takes type result or error".into(),
            ));
        }
        self.writer().await?.send_element(&response.into_element()).await
    }

    /// XEP-0199 ping; defaults to the session's own server.
    pub async fn ping(&self, to: Option<Jid>, timeout_ms: Option<i64>) -> Result<()> {
        let to = match to {
            Some(jid) => jid,
            None => Jid::domain_jid(&self.domain())?,
        };
        let request = Iq::get(Element::with_namespace("ping", ns::PING)).with_to(to);
        self.iq_request(request, timeout_ms).await.map(|_| ())
    }

    async fn writer(&self) -> Result<Arc<StanzaWriter>> {
        let guard = self.session.lock().await;
        guard
            .as_ref()
            .map(|session| session.writer.clone())
            .ok_or(Error::Disconnected)
    }

    fn resolve_timeout(&self, timeout_ms: Option<i64>) -> Result<Option<Duration>> {
        let ms = timeout_ms
            .unwrap_or_else(|| self.config.read().expect("config lock").default_iq_timeout_ms);
        match ms {
            -1 => Ok(None),
            ms if ms < 0 => Err(Error::InvalidTimeout(ms)),
            ms => Ok(Some(Duration::from_millis(ms as u64))),
        }
    }

    /// The timeout heuristic trigger: a ping addressed to the bare server
    /// domain of this session.
    fn is_server_ping(&self, request: &Iq) -> bool {
        let domain = self.domain();
        let to_own_domain = request
            .to
            .as_ref()
            .is_some_and(|to| to.is_domain() && to.domain().eq_ignore_ascii_case(&domain));
        to_own_domain
            && request
                .payload
                .as_ref()
                .is_some_and(|p| p.name() == "ping" && p.namespace() == Some(ns::PING))
    }

    async fn teardown_after_fatal(&self, condition: Error) {
        if let Some(session) = self.session.lock().await.take() {
            session.closing.store(true, Ordering::SeqCst);
            session.waiter_cancel.cancel();
            session.dispatcher_cancel.cancel();
            session.reader_task.abort();
        }
        self.pending.clear();
        self.connected.store(false, Ordering::SeqCst);
        self.handlers.emit_error(condition);
    }
}

// ── Handshake ────────────────────────────────────────────────────

struct Negotiated {
    reader: StreamReader<ReadHalf<BoxStream>>,
    writer: WriteHalf<BoxStream>,
    jid: Option<Jid>,
    peer_language: String,
}

async fn negotiate(
    config: &ClientConfig,
    policy: &TlsPolicy,
    host: &str,
    port: u16,
) -> Result<Negotiated> {
    let mut stream = wire::connect_tcp(host, port).await?;
    let mut secured = false;
    if config.tls == TlsMode::TlsSocket {
        stream = wire::secure(stream, &config.hostname, policy).await?;
        secured = true;
    }

    let mut authenticated = false;
    loop {
        let (mut reader, mut writer, header) = open_stream(stream, config).await?;
        let features_el = handshake_step(reader.next_element(&["features"])).await?;
        let features = StreamFeatures::from_element(&features_el);

        if let Some(starttls) = features.starttls {
            if !secured {
                match config.tls {
                    TlsMode::StartTls => {
                        writer
                            .write_all(b"<starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>")
                            .await?;
                        let answer =
                            handshake_step(reader.next_element(&["proceed", "failure"])).await?;
                        if answer.name() != "proceed" {
                            return Err(Error::AuthenticationFailed(
                                "server refused STARTTLS".into(),
                            ));
                        }
                        let raw = reader.into_inner().unsplit(writer);
                        stream = wire::secure(raw, &config.hostname, policy).await?;
                        secured = true;
                        continue;
                    }
                    TlsMode::None if starttls.required => {
                        return Err(Error::AuthenticationFailed("server requires TLS".into()));
                    }
                    TlsMode::None | TlsMode::TlsSocket => {}
                }
            }
        }

        // Without a username the handshake stops here (deferred auth).
        let Some(username) = config.username.clone() else {
            return Ok(Negotiated {
                reader,
                writer,
                jid: None,
                peer_language: header.language,
            });
        };

        if !authenticated {
            let password = config.password.clone().unwrap_or_default();
            run_sasl(&mut reader, &mut writer, &features, &username, &password).await?;
            authenticated = true;
            // SASL success restarts the stream.
            stream = reader.into_inner().unsplit(writer);
            continue;
        }

        let jid = if features.bind {
            Some(bind_resource(&mut reader, &mut writer, config.resource.as_deref()).await?)
        } else {
            None
        };

        return Ok(Negotiated {
            reader,
            writer,
            jid,
            peer_language: header.language,
        });
    }
}

/// Splits the transport, writes our stream header and reads the peer's.
async fn open_stream(
    stream: BoxStream,
    config: &ClientConfig,
) -> Result<(
    StreamReader<ReadHalf<BoxStream>>,
    WriteHalf<BoxStream>,
    crate::xml::reader::StreamHeader,
)> {
    let (read_half, mut write_half) = tokio::io::split(stream);

    let header = format!(
        "<?xml version='1.0'?>\
         <stream:stream to='{}' version='1.0' xml:lang='{}' \
         xmlns='{}' xmlns:stream='{}'>",
        config.hostname,
        config.language,
        ns::CLIENT,
        ns::STREAMS,
    );
    write_half.write_all(header.as_bytes()).await?;

    let mut reader = StreamReader::new(read_half);
    let peer_header = handshake_step(reader.read_stream_header()).await?;
    Ok((reader, write_half, peer_header))
}

async fn handshake_step<T>(step: impl std::future::Future<Output = Result<T>>) -> Result<T> {
    tokio::time::timeout(HANDSHAKE_TIMEOUT, step)
        .await
        .map_err(|_| Error::Timeout)?
}

async fn run_sasl(
    reader: &mut StreamReader<ReadHalf<BoxStream>>,
    writer: &mut WriteHalf<BoxStream>,
    features: &StreamFeatures,
    username: &str,
    password: &str,
) -> Result<()> {
    let mut mechanism = sasl::select_mechanism(&features.mechanisms, username, password)?;
    debug!("authenticating via {}", mechanism.name());

    let mut auth = Element::with_namespace("auth", ns::SASL).attr("mechanism", mechanism.name());
    if mechanism.has_initial_response() {
        auth = auth.text(&B64.encode(mechanism.initial()?));
    }
    writer
        .write_all(auth.serialize(Some(ns::CLIENT)).as_bytes())
        .await?;

    loop {
        let element =
            handshake_step(reader.next_element(&["challenge", "success", "failure"])).await?;
        match element.name() {
            "challenge" => {
                let challenge = decode_sasl_payload(&element)?;
                let response = mechanism.response(&challenge)?;
                let response_el =
                    Element::with_namespace("response", ns::SASL).text(&B64.encode(response));
                writer
                    .write_all(response_el.serialize(Some(ns::CLIENT)).as_bytes())
                    .await?;
            }
            "success" => {
                let data = decode_sasl_payload(&element)?;
                mechanism.success(&data)?;
                if !mechanism.is_completed() {
                    return Err(Error::ProtocolViolation(
                        "mechanism incomplete on SASL success".into(),
                    ));
                }
                info!("SASL authentication successful ({})", mechanism.name());
                return Ok(());
            }
            _failure => {
                let condition = element
                    .first_child()
                    .map(|child| child.name().to_string())
                    .unwrap_or_else(|| "not-authorized".to_string());
                return Err(Error::AuthenticationFailed(condition));
            }
        }
    }
}

fn decode_sasl_payload(element: &Element) -> Result<Vec<u8>> {
    let text = element.content();
    let trimmed = text.trim();
    if trimmed.is_empty() || trimmed == "=" {
        return Ok(Vec::new());
    }
    B64.decode(trimmed)
        .map_err(|_| Error::AuthenticationFailed("bad base64 in SASL element".into()))
}

async fn bind_resource(
    reader: &mut StreamReader<ReadHalf<BoxStream>>,
    writer: &mut WriteHalf<BoxStream>,
    resource: Option<&str>,
) -> Result<Jid> {
    let mut bind = Element::with_namespace("bind", ns::BIND);
    if let Some(resource) = resource {
        bind.add_child(Element::new("resource").text(resource));
    }
    let request = Element::with_namespace("iq", ns::CLIENT)
        .attr("type", "set")
        .attr("id", "bind-0")
        .child(bind);
    writer
        .write_all(request.serialize(Some(ns::CLIENT)).as_bytes())
        .await?;

    let element = handshake_step(reader.next_element(&["iq"])).await?;
    let response = Iq::from_element(&element)?;
    if response.id != "bind-0" || response.iq_type != crate::stanza::IqType::Result {
        return Err(Error::ProtocolViolation(format!(
            "unexpected bind response (id={}, type={})",
            response.id, response.iq_type
        )));
    }

    let jid_text = response
        .payload
        .as_ref()
        .and_then(|bind| bind.find_child("jid"))
        .map(Element::content)
        .ok_or_else(|| Error::ProtocolViolation("bind response without jid".into()))?;
    let jid: Jid = jid_text.trim().parse()?;
    info!("bound as {jid}");
    Ok(jid)
}

// ── Long-running loops ───────────────────────────────────────────

struct ReaderContext {
    pending: Arc<PendingTable>,
    queue: mpsc::Sender<Stanza>,
    handlers: Arc<Handlers>,
    connected: Arc<AtomicBool>,
    waiter_cancel: CancellationToken,
    dispatcher_cancel: CancellationToken,
    closing: Arc<AtomicBool>,
    debug_stanzas: bool,
}

async fn reader_loop(mut reader: StreamReader<ReadHalf<BoxStream>>, ctx: ReaderContext) {
    let fatal = loop {
        let element = match reader
            .next_element(&["iq", "message", "presence", "error"])
            .await
        {
            Ok(element) => element,
            Err(err) => break err,
        };
        if ctx.debug_stanzas {
            debug!("RECV {}", element.serialize(Some(ns::CLIENT)));
        }

        if element.name() == "error" && element.namespace() == Some(ns::STREAMS) {
            break Error::Stream(stream_error_condition(&element));
        }

        match Stanza::from_element(&element) {
            Err(err) => warn!("dropping unparseable stanza: {err}"),
            Ok(Stanza::Iq(iq)) if iq.is_response() => {
                let id = iq.id.clone();
                if !ctx.pending.resolve(iq) {
                    warn!("orphan IQ response with id {id}");
                }
            }
            Ok(stanza) => {
                // Blocks at the queue's high-water mark; backpressure on
                // the socket instead of unbounded memory.
                if ctx.queue.send(stanza).await.is_err() {
                    break Error::Disconnected;
                }
            }
        }
    };

    if ctx.closing.load(Ordering::SeqCst) {
        return; // graceful close already ran the teardown
    }

    let condition = fatal.into_disconnect_condition();
    warn!("reader loop terminated: {condition}");
    ctx.connected.store(false, Ordering::SeqCst);
    // Waiters first, dispatcher second.
    ctx.waiter_cancel.cancel();
    ctx.dispatcher_cancel.cancel();
    ctx.pending.clear();
    ctx.handlers.emit_error(condition);
}

fn stream_error_condition(element: &Element) -> String {
    element
        .children()
        .find(|child| child.namespace() == Some(ns::XMPP_STREAMS))
        .or_else(|| element.first_child())
        .map(|child| child.name().to_string())
        .unwrap_or_else(|| "undefined-condition".to_string())
}

async fn dispatcher_loop(
    mut queue: mpsc::Receiver<Stanza>,
    handlers: Arc<Handlers>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            // Cancellation wins over a ready stanza: nothing is handed to
            // handlers after the signal fires.
            biased;
            _ = cancel.cancelled() => break,
            stanza = queue.recv() => match stanza {
                Some(stanza) => handlers.dispatch(stanza),
                None => break,
            }
        }
    }
    debug!("dispatcher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::SrvResolve;
    use async_trait::async_trait;
    use tokio::io::AsyncReadExt;
    use tokio::net::{TcpListener, TcpStream};

    /// Receives one event pushed by a handler, without blocking the
    /// runtime the dispatcher runs on.
    async fn next_event<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("no event within deadline")
            .expect("event channel closed")
    }

    struct NoSrv;

    #[async_trait]
    impl SrvResolve for NoSrv {
        async fn resolve_srv(&self, _name: &str) -> Result<Vec<SrvTarget>> {
            Ok(Vec::new())
        }
    }

    const SERVER_HEADER: &str = "<?xml version='1.0'?>\
        <stream:stream xmlns='jabber:client' \
        xmlns:stream='http://etherx.jabber.org/streams' \
        id='srv-1' from='127.0.0.1' version='1.0'>";

    const HEADER_MARKER: &str = "http://etherx.jabber.org/streams'>";

    /// Reads until `marker` shows up in the accumulated data.
    async fn read_until(stream: &mut TcpStream, marker: &str) -> String {
        let mut buf = vec![0u8; 8192];
        let mut accumulated = String::new();
        loop {
            let n = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf))
                .await
                .expect("peer fell silent")
                .expect("peer read failed");
            assert!(n > 0, "peer closed while waiting for {marker}");
            accumulated.push_str(&String::from_utf8_lossy(&buf[..n]));
            if accumulated.contains(marker) {
                return accumulated;
            }
        }
    }

    fn attr_value(xml: &str, name: &str) -> Option<String> {
        let start = xml.find(&format!("{name}='"))? + name.len() + 2;
        let end = xml[start..].find('\'')?;
        Some(xml[start..start + end].to_string())
    }

    async fn write_all(stream: &mut TcpStream, data: &str) {
        stream.write_all(data.as_bytes()).await.unwrap();
    }

    /// Serves the plaintext handshake of an anonymous session (no SASL,
    /// no bind) and hands back the socket for the test's own script.
    async fn accept_anonymous(listener: TcpListener) -> TcpStream {
        let (mut stream, _) = listener.accept().await.unwrap();
        read_until(&mut stream, HEADER_MARKER).await;
        write_all(&mut stream, SERVER_HEADER).await;
        write_all(&mut stream, "<stream:features/>").await;
        stream
    }

    fn anonymous_config(port: u16) -> ClientConfig {
        let mut config = ClientConfig::for_domain("127.0.0.1").with_tls(TlsMode::None);
        config.port = port;
        config
    }

    /// RUST_LOG=debug shows the full exchange when a test goes sideways.
    fn init_logging() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .try_init();
    }

    #[tokio::test]
    async fn test_plain_handshake_binds_resource() {
        init_logging();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            read_until(&mut stream, HEADER_MARKER).await;
            write_all(&mut stream, SERVER_HEADER).await;
            write_all(
                &mut stream,
                "<stream:features>\
                 <mechanisms xmlns='urn:ietf:params:xml:ns:xmpp-sasl'>\
                 <mechanism>PLAIN</mechanism></mechanisms>\
                 </stream:features>",
            )
            .await;

            let auth = read_until(&mut stream, "</auth>").await;
            assert!(auth.contains("mechanism='PLAIN'"));
            let payload_start = auth.find('>').unwrap() + 1;
            let payload_end = auth.find("</auth>").unwrap();
            let decoded = B64.decode(&auth[payload_start..payload_end]).unwrap();
            assert_eq!(decoded, b"\0alice\0s3cret");
            write_all(
                &mut stream,
                "<success xmlns='urn:ietf:params:xml:ns:xmpp-sasl'/>",
            )
            .await;

            // Stream restart after SASL.
            read_until(&mut stream, HEADER_MARKER).await;
            write_all(&mut stream, SERVER_HEADER).await;
            write_all(
                &mut stream,
                "<stream:features><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'/></stream:features>",
            )
            .await;

            let bind = read_until(&mut stream, "</iq>").await;
            assert_eq!(attr_value(&bind, "id").as_deref(), Some("bind-0"));
            assert!(bind.contains("<resource>orchard</resource>"));
            write_all(
                &mut stream,
                "<iq type='result' id='bind-0'>\
                 <bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'>\
                 <jid>alice@127.0.0.1/abcd</jid></bind></iq>",
            )
            .await;

            // Stay alive until the client hangs up.
            let mut buf = [0u8; 1024];
            loop {
                match stream.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        });

        let mut config = anonymous_config(port).with_credentials("alice", "s3cret");
        config.resource = Some("orchard".to_string());
        let client = XmppClient::with_resolver(config, Box::new(NoSrv));

        client.connect().await.unwrap();
        assert!(client.is_connected());
        assert_eq!(
            client.jid().await.unwrap().to_string(),
            "alice@127.0.0.1/abcd"
        );

        client.close().await.unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_starttls_required_but_disabled_fails() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            read_until(&mut stream, HEADER_MARKER).await;
            write_all(&mut stream, SERVER_HEADER).await;
            write_all(
                &mut stream,
                "<stream:features>\
                 <starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'><required/></starttls>\
                 </stream:features>",
            )
            .await;

            // The client must give up without another byte.
            let mut buf = [0u8; 256];
            match stream.read(&mut buf).await {
                Ok(n) => assert_eq!(n, 0, "client kept talking after TLS refusal"),
                Err(_) => {}
            }
        });

        let config = anonymous_config(port).with_credentials("alice", "s3cret");
        let client = XmppClient::with_resolver(config, Box::new(NoSrv));

        let err = client.connect().await.unwrap_err();
        assert_eq!(
            err,
            Error::AuthenticationFailed("server requires TLS".into())
        );
        assert!(!client.is_connected());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_blocking_iq_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let mut stream = accept_anonymous(listener).await;
            let request = read_until(&mut stream, "</iq>").await;
            let id = attr_value(&request, "id").unwrap();
            write_all(
                &mut stream,
                &format!("<iq type='result' id='{id}'><query xmlns='jabber:iq:version'/></iq>"),
            )
            .await;
            let mut buf = [0u8; 1024];
            while matches!(stream.read(&mut buf).await, Ok(n) if n > 0) {}
        });

        let client = XmppClient::with_resolver(anonymous_config(port), Box::new(NoSrv));
        client.connect().await.unwrap();

        let request = Iq::get(Element::with_namespace("query", "jabber:iq:version"))
            .with_to("bob@127.0.0.1/pda".parse().unwrap());
        let response = client.iq_request(request, Some(5000)).await.unwrap();
        assert_eq!(response.payload.unwrap().name(), "query");
        assert_eq!(client.pending.len(), 0);
        assert!(client.is_connected());

        client.close().await.unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_iq_callback_fires_with_id() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let mut stream = accept_anonymous(listener).await;
            let request = read_until(&mut stream, "</iq>").await;
            let id = attr_value(&request, "id").unwrap();
            write_all(&mut stream, &format!("<iq type='result' id='{id}'/>")).await;
            let mut buf = [0u8; 1024];
            while matches!(stream.read(&mut buf).await, Ok(n) if n > 0) {}
        });

        let client = XmppClient::with_resolver(anonymous_config(port), Box::new(NoSrv));
        client.connect().await.unwrap();

        let (tx, rx) = tokio::sync::oneshot::channel();
        let request = Iq::get(Element::with_namespace("ping", ns::PING))
            .with_to("bob@127.0.0.1".parse().unwrap());
        let assigned = client
            .iq_request_with_callback(request, move |id, response| {
                let _ = tx.send((id, response.id));
            })
            .await
            .unwrap();

        let (callback_id, response_id) = rx.await.unwrap();
        assert_eq!(callback_id, assigned);
        assert_eq!(response_id, assigned);

        client.close().await.unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_iq_timeout_keeps_session_alive() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let mut stream = accept_anonymous(listener).await;
            // Never answer anything.
            let mut buf = [0u8; 1024];
            while matches!(stream.read(&mut buf).await, Ok(n) if n > 0) {}
        });

        let client = XmppClient::with_resolver(anonymous_config(port), Box::new(NoSrv));
        client.connect().await.unwrap();

        let request = Iq::get(Element::with_namespace("query", "jabber:iq:version"))
            .with_to("bob@127.0.0.1/pda".parse().unwrap());
        let err = client.iq_request(request, Some(200)).await.unwrap_err();
        assert_eq!(err, Error::Timeout);
        assert!(client.is_connected());
        assert_eq!(client.pending.len(), 0);

        client.close().await.unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_server_ping_timeout_disconnects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let mut stream = accept_anonymous(listener).await;
            let mut buf = [0u8; 1024];
            while matches!(stream.read(&mut buf).await, Ok(n) if n > 0) {}
        });

        let client = XmppClient::with_resolver(anonymous_config(port), Box::new(NoSrv));
        let (error_tx, mut error_rx) = mpsc::unbounded_channel();
        client.on_error(move |condition| {
            let _ = error_tx.send(condition);
        });
        client.connect().await.unwrap();

        let err = client.ping(None, Some(200)).await.unwrap_err();
        assert_eq!(err, Error::Disconnected);
        assert!(!client.is_connected());
        assert_eq!(error_rx.try_recv().unwrap(), Error::Disconnected);

        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_negative_timeout_rejected() {
        let client =
            XmppClient::with_resolver(anonymous_config(1), Box::new(NoSrv));
        let request = Iq::get(Element::with_namespace("ping", ns::PING));
        let err = client.iq_request(request, Some(-2)).await.unwrap_err();
        assert_eq!(err, Error::InvalidTimeout(-2));
    }

    #[tokio::test]
    async fn test_stanza_events_and_orphan_responses() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let mut stream = accept_anonymous(listener).await;
            // An orphan response first, then real stanza traffic.
            write_all(&mut stream, "<iq type='result' id='never-asked'/>").await;
            write_all(
                &mut stream,
                "<message from='bob@example.net/pda'><body>hi there</body></message>",
            )
            .await;
            write_all(&mut stream, "<presence from='bob@example.net/pda'/>").await;
            write_all(
                &mut stream,
                "<iq type='get' id='srv-q' from='bob@example.net/pda'>\
                 <ping xmlns='urn:xmpp:ping'/></iq>",
            )
            .await;

            // Outbound direction: one message, one presence.
            let outbound = read_until(&mut stream, "<presence/>").await;
            assert!(outbound.contains("<message to='bob@example.net/pda'>"));
            assert!(outbound.contains("<body>right back at you</body>"));

            let mut buf = [0u8; 1024];
            while matches!(stream.read(&mut buf).await, Ok(n) if n > 0) {}
        });

        let client = XmppClient::with_resolver(anonymous_config(port), Box::new(NoSrv));
        let (message_tx, mut message_rx) = mpsc::unbounded_channel();
        let (presence_tx, mut presence_rx) = mpsc::unbounded_channel();
        let (iq_tx, mut iq_rx) = mpsc::unbounded_channel();
        client.on_message(move |message| {
            let _ = message_tx.send(message);
        });
        client.on_presence(move |presence| {
            let _ = presence_tx.send(presence);
        });
        client.on_iq(move |iq| {
            let _ = iq_tx.send(iq);
        });
        client.connect().await.unwrap();

        let message = next_event(&mut message_rx).await;
        assert_eq!(message.payload[0].content(), "hi there");
        let presence = next_event(&mut presence_rx).await;
        assert_eq!(
            presence.from.unwrap().to_string(),
            "bob@example.net/pda"
        );
        let iq = next_event(&mut iq_rx).await;
        assert_eq!(iq.id, "srv-q");
        assert!(iq.is_request());

        let reply = Message::to("bob@example.net/pda".parse().unwrap())
            .with_body("right back at you");
        client.send_message(reply).await.unwrap();
        client.send_presence(Presence::available()).await.unwrap();

        client.close().await.unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_stream_error_surfaces_condition() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let mut stream = accept_anonymous(listener).await;
            write_all(
                &mut stream,
                "<stream:error>\
                 <conflict xmlns='urn:ietf:params:xml:ns:xmpp-streams'/>\
                 </stream:error></stream:stream>",
            )
            .await;
        });

        let client = XmppClient::with_resolver(anonymous_config(port), Box::new(NoSrv));
        let (error_tx, mut error_rx) = mpsc::unbounded_channel();
        client.on_error(move |condition| {
            let _ = error_tx.send(condition);
        });
        client.connect().await.unwrap();

        let condition = next_event(&mut error_rx).await;
        assert_eq!(condition, Error::Stream("conflict".into()));
        assert!(!client.is_connected());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_reader_death_wakes_blocking_waiters() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let mut stream = accept_anonymous(listener).await;
            // One request arrives, then the server dies.
            read_until(&mut stream, "</iq>").await;
            drop(stream);
        });

        let client = XmppClient::with_resolver(anonymous_config(port), Box::new(NoSrv));
        client.connect().await.unwrap();

        let request = Iq::get(Element::with_namespace("query", "jabber:iq:version"))
            .with_to("bob@127.0.0.1/pda".parse().unwrap());
        let err = client.iq_request(request, None).await.unwrap_err();
        assert_eq!(err, Error::Disconnected);
        assert!(!client.is_connected());
        assert_eq!(client.pending.len(), 0);
        server.await.unwrap();
    }
}
