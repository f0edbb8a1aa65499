use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::{SinkExt, Stream, StreamExt};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;
use uuid::Uuid;

use super::BackoffConfig;
use crate::broker::protocol::{ClientFrame, ServerFrame, AUTH_VIOLATION};
use crate::error::{LatticeError, Result};
use crate::subjects;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Session = (WsStream, mpsc::UnboundedReceiver<ClientFrame>);

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Health of the mesh connection, published through a watch channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// `close()` was called or reconnect attempts ran out.
    Closed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Connection name reported to the broker.
    pub name: String,
    pub backoff: BackoffConfig,
    /// Keepalive interval. A missed pong drops the connection.
    pub ping_interval: Duration,
}

impl ConnectOptions {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            backoff: BackoffConfig::default(),
            ping_interval: Duration::from_secs(10),
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }
}

/// A message delivered to a subscription.
#[derive(Debug, Clone)]
pub struct Message {
    pub subject: String,
    pub reply: Option<String>,
    pub payload: Value,
}

impl Message {
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

/// Parsed broker URL.
#[derive(Debug, Clone)]
struct Endpoint {
    ws_url: String,
    token: Option<String>,
}

/// Accepts `ws://`, `wss://` and the `lattice://`/`nats://` aliases. The token
/// may be given as the URL username or password; the path defaults to `/ws`.
fn parse_endpoint(raw: &str) -> Result<Endpoint> {
    let trimmed = raw.trim();
    let normalized = match trimmed
        .strip_prefix("lattice://")
        .or_else(|| trimmed.strip_prefix("nats://"))
    {
        Some(rest) => format!("ws://{}", rest),
        None if !trimmed.contains("://") => format!("ws://{}", trimmed),
        None => trimmed.to_string(),
    };

    let invalid = |message: String| LatticeError::Connect {
        url: raw.to_string(),
        message,
    };

    let mut url = Url::parse(&normalized).map_err(|e| invalid(e.to_string()))?;
    if !matches!(url.scheme(), "ws" | "wss") {
        return Err(invalid(format!("unsupported scheme '{}'", url.scheme())));
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(invalid("missing host".to_string()));
    }

    let token = match (url.username(), url.password()) {
        (_, Some(password)) if !password.is_empty() => Some(password.to_string()),
        (username, _) if !username.is_empty() => Some(username.to_string()),
        _ => None,
    };
    let _ = url.set_username("");
    let _ = url.set_password(None);
    if url.path().is_empty() || url.path() == "/" {
        url.set_path("/ws");
    }

    Ok(Endpoint {
        ws_url: url.to_string(),
        token,
    })
}

struct SubRecord {
    subject: String,
    queue: Option<String>,
    tx: mpsc::UnboundedSender<Message>,
}

struct Inner {
    endpoint: Endpoint,
    options: ConnectOptions,
    state: watch::Sender<ConnectionState>,
    /// Writer of the current session; `None` while disconnected.
    outbound: Mutex<Option<mpsc::UnboundedSender<ClientFrame>>>,
    subs: Mutex<HashMap<u64, SubRecord>>,
    next_sid: AtomicU64,
    shutdown: CancellationToken,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl Inner {
    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    fn send(&self, frame: ClientFrame) -> Result<()> {
        let outbound = self.outbound.lock();
        match outbound.as_ref() {
            Some(tx) => tx.send(frame).map_err(|_| LatticeError::NotConnected),
            None => Err(LatticeError::NotConnected),
        }
    }

    fn deliver(&self, sid: u64, subject: String, reply: Option<String>, payload: Value) {
        let subs = self.subs.lock();
        if let Some(sub) = subs.get(&sid) {
            let _ = sub.tx.send(Message {
                subject,
                reply,
                payload,
            });
        }
    }

    fn unsubscribe(&self, sid: u64) {
        let mut subs = self.subs.lock();
        if subs.remove(&sid).is_some() {
            if let Some(tx) = self.outbound.lock().as_ref() {
                let _ = tx.send(ClientFrame::Unsub { sid });
            }
        }
    }
}

/// The station's single connection to the broker.
///
/// Cloning is cheap; all clones share the same underlying session and
/// background reconnect driver.
#[derive(Clone)]
pub struct MeshConnection {
    inner: Arc<Inner>,
}

impl MeshConnection {
    /// Connect, blocking on the first attempt.
    ///
    /// # Errors
    ///
    /// `LatticeError::Connect` if the broker is unreachable and
    /// `LatticeError::Auth` if it rejects the credentials. Once this returns
    /// `Ok`, later disconnects are retried in the background.
    pub async fn connect(url: &str, options: ConnectOptions) -> Result<Self> {
        let endpoint = parse_endpoint(url)?;
        let conn = Self::new(endpoint, options);
        conn.inner.set_state(ConnectionState::Connecting);
        match establish(&conn.inner.endpoint, &conn.inner.options.name).await {
            Ok(ws) => {
                let outbound = attach(&conn.inner);
                conn.spawn_driver(Some((ws, outbound)));
                Ok(conn)
            }
            Err(e) => {
                conn.inner.set_state(ConnectionState::Closed);
                Err(e)
            }
        }
    }

    /// Return immediately and keep connecting in the background.
    pub fn connect_lazy(url: &str, options: ConnectOptions) -> Result<Self> {
        let endpoint = parse_endpoint(url)?;
        let conn = Self::new(endpoint, options);
        conn.spawn_driver(None);
        Ok(conn)
    }

    fn new(endpoint: Endpoint, options: ConnectOptions) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                endpoint,
                options,
                state,
                outbound: Mutex::new(None),
                subs: Mutex::new(HashMap::new()),
                next_sid: AtomicU64::new(1),
                shutdown: CancellationToken::new(),
                driver: Mutex::new(None),
            }),
        }
    }

    fn spawn_driver(&self, session: Option<Session>) {
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(drive(inner, session));
        *self.inner.driver.lock() = Some(handle);
    }

    /// Broker URL with credentials removed.
    pub fn url(&self) -> &str {
        &self.inner.endpoint.ws_url
    }

    pub fn name(&self) -> &str {
        &self.inner.options.name
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Fire-and-forget publish.
    ///
    /// # Errors
    ///
    /// `LatticeError::NotConnected` when no session is established. Nothing is
    /// buffered for later delivery.
    pub fn publish<T: Serialize>(&self, subject: &str, payload: &T) -> Result<()> {
        self.publish_with_reply(subject, None, payload)
    }

    pub fn publish_with_reply<T: Serialize>(
        &self,
        subject: &str,
        reply: Option<&str>,
        payload: &T,
    ) -> Result<()> {
        if !subjects::is_valid_subject(subject) {
            return Err(LatticeError::InvalidRequest(format!(
                "invalid subject '{}'",
                subject
            )));
        }
        let payload = serde_json::to_value(payload)?;
        self.inner.send(ClientFrame::Pub {
            subject: subject.to_string(),
            reply: reply.map(str::to_string),
            payload,
        })
    }

    /// Subscribe to a subject pattern. The subscription survives reconnects
    /// and is removed when the returned stream is dropped.
    pub fn subscribe(&self, pattern: &str) -> Result<Subscription> {
        self.add_subscription(pattern, None)
    }

    /// Subscribe as a member of a queue group; each message goes to one member.
    pub fn queue_subscribe(&self, pattern: &str, group: &str) -> Result<Subscription> {
        self.add_subscription(pattern, Some(group.to_string()))
    }

    fn add_subscription(&self, pattern: &str, queue: Option<String>) -> Result<Subscription> {
        if self.inner.shutdown.is_cancelled() {
            return Err(LatticeError::Closed);
        }
        if !subjects::is_valid_pattern(pattern) {
            return Err(LatticeError::InvalidRequest(format!(
                "invalid subject pattern '{}'",
                pattern
            )));
        }

        let sid = self.inner.next_sid.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();

        let mut subs = self.inner.subs.lock();
        subs.insert(
            sid,
            SubRecord {
                subject: pattern.to_string(),
                queue: queue.clone(),
                tx,
            },
        );
        if let Some(out) = self.inner.outbound.lock().as_ref() {
            let _ = out.send(ClientFrame::Sub {
                sid,
                subject: pattern.to_string(),
                queue,
            });
        }
        drop(subs);

        Ok(Subscription {
            sid,
            subject: pattern.to_string(),
            rx,
            inner: Arc::clone(&self.inner),
        })
    }

    /// Request/reply through a private inbox.
    ///
    /// # Errors
    ///
    /// `LatticeError::Timeout` if no reply arrives within `timeout`.
    pub async fn request<T: Serialize>(
        &self,
        subject: &str,
        payload: &T,
        timeout: Duration,
    ) -> Result<Message> {
        let inbox = subjects::inbox(&Uuid::new_v4().simple().to_string());
        let mut sub = self.subscribe(&inbox)?;
        self.publish_with_reply(subject, Some(&inbox), payload)?;

        match tokio::time::timeout(timeout, sub.next()).await {
            Ok(Some(msg)) => Ok(msg),
            Ok(None) => Err(LatticeError::Closed),
            Err(_) => Err(LatticeError::Timeout(timeout)),
        }
    }

    /// Wait until the broker has processed every frame sent so far on this
    /// connection, including pending subscriptions.
    pub async fn flush(&self, timeout: Duration) -> Result<()> {
        let inbox = subjects::inbox(&Uuid::new_v4().simple().to_string());
        let mut sub = self.subscribe(&inbox)?;
        self.publish(&inbox, &Value::Null)?;

        match tokio::time::timeout(timeout, sub.next()).await {
            Ok(Some(_)) => Ok(()),
            Ok(None) => Err(LatticeError::Closed),
            Err(_) => Err(LatticeError::Timeout(timeout)),
        }
    }

    /// Tear down the session and stop reconnecting. Open subscriptions end.
    pub async fn close(&self) {
        self.inner.shutdown.cancel();
        let driver = self.inner.driver.lock().take();
        if let Some(driver) = driver {
            let _ = driver.await;
        }
        self.inner.subs.lock().clear();
        self.inner.set_state(ConnectionState::Closed);
    }
}

/// Stream of messages for one subscription.
pub struct Subscription {
    sid: u64,
    subject: String,
    rx: mpsc::UnboundedReceiver<Message>,
    inner: Arc<Inner>,
}

impl Subscription {
    pub fn subject(&self) -> &str {
        &self.subject
    }
}

impl Stream for Subscription {
    type Item = Message;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.inner.unsubscribe(self.sid);
    }
}

async fn establish(endpoint: &Endpoint, name: &str) -> Result<WsStream> {
    let connect_error = |message: String| LatticeError::Connect {
        url: endpoint.ws_url.clone(),
        message,
    };

    let (mut ws, _) = tokio::time::timeout(HANDSHAKE_TIMEOUT, connect_async(endpoint.ws_url.as_str()))
        .await
        .map_err(|_| connect_error("connection timed out".to_string()))?
        .map_err(|e| connect_error(e.to_string()))?;

    let hello = serde_json::to_string(&ClientFrame::Connect {
        token: endpoint.token.clone(),
        name: name.to_string(),
    })?;
    ws.send(WsMessage::Text(hello))
        .await
        .map_err(|e| connect_error(e.to_string()))?;

    let reply = tokio::time::timeout(HANDSHAKE_TIMEOUT, ws.next())
        .await
        .map_err(|_| connect_error("handshake timed out".to_string()))?;
    match reply {
        Some(Ok(WsMessage::Text(text))) => match serde_json::from_str::<ServerFrame>(&text)? {
            ServerFrame::Ok => Ok(ws),
            ServerFrame::Err { message } if message == AUTH_VIOLATION => {
                Err(LatticeError::Auth(message))
            }
            ServerFrame::Err { message } => Err(connect_error(message)),
            other => Err(LatticeError::Protocol(format!(
                "unexpected handshake frame: {:?}",
                other
            ))),
        },
        Some(Ok(other)) => Err(LatticeError::Protocol(format!(
            "unexpected handshake message: {:?}",
            other
        ))),
        Some(Err(e)) => Err(connect_error(e.to_string())),
        None => Err(connect_error("connection closed during handshake".to_string())),
    }
}

/// Background state machine: run the session, reconnect with backoff on loss.
async fn drive(inner: Arc<Inner>, mut session: Option<Session>) {
    let mut failures: u32 = 0;

    loop {
        if inner.shutdown.is_cancelled() {
            break;
        }

        let (ws, outbound) = match session.take() {
            Some(session) => session,
            None => {
                inner.set_state(ConnectionState::Connecting);
                match establish(&inner.endpoint, &inner.options.name).await {
                    Ok(ws) => (ws, attach(&inner)),
                    Err(e) => {
                        failures += 1;
                        if !e.is_transient() {
                            error!(
                                "Lattice broker {} refused this station: {}",
                                inner.endpoint.ws_url, e
                            );
                            break;
                        }
                        if !inner.options.backoff.allows(failures) {
                            error!(
                                "Giving up on lattice broker {} after {} attempts: {}",
                                inner.endpoint.ws_url, failures, e
                            );
                            break;
                        }
                        let delay = inner.options.backoff.delay_for(failures - 1);
                        warn!(
                            "Lattice connection to {} failed: {}. Retrying in {}ms (attempt {})",
                            inner.endpoint.ws_url,
                            e,
                            delay.as_millis(),
                            failures
                        );
                        inner.set_state(ConnectionState::Disconnected);
                        tokio::select! {
                            _ = inner.shutdown.cancelled() => break,
                            _ = tokio::time::sleep(delay) => continue,
                        }
                    }
                }
            }
        };

        failures = 0;
        run_session(&inner, ws, outbound).await;

        if inner.shutdown.is_cancelled() {
            break;
        }
        inner.set_state(ConnectionState::Disconnected);
        warn!(
            "Lattice connection to {} lost, reconnecting",
            inner.endpoint.ws_url
        );
    }

    *inner.outbound.lock() = None;
    inner.set_state(ConnectionState::Closed);
    debug!("Lattice connection driver for '{}' stopped", inner.options.name);
}

/// Install a fresh outbound queue for a new session, replaying every live
/// subscription first, and mark the connection as connected.
fn attach(inner: &Inner) -> mpsc::UnboundedReceiver<ClientFrame> {
    let (tx, rx) = mpsc::unbounded_channel::<ClientFrame>();
    {
        let subs = inner.subs.lock();
        for (sid, sub) in subs.iter() {
            let _ = tx.send(ClientFrame::Sub {
                sid: *sid,
                subject: sub.subject.clone(),
                queue: sub.queue.clone(),
            });
        }
        *inner.outbound.lock() = Some(tx);
    }
    inner.set_state(ConnectionState::Connected);
    info!(
        "Connected to lattice broker {} as '{}'",
        inner.endpoint.ws_url, inner.options.name
    );
    rx
}

async fn run_session(
    inner: &Arc<Inner>,
    ws: WsStream,
    mut rx: mpsc::UnboundedReceiver<ClientFrame>,
) {
    let (mut write, mut read) = ws.split();

    let mut keepalive = tokio::time::interval(inner.options.ping_interval);
    keepalive.tick().await;
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => {
                let _ = write.close().await;
                break;
            }
            frame = rx.recv() => {
                let Some(frame) = frame else { break };
                let text = match serde_json::to_string(&frame) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!("Dropping unserializable frame: {}", e);
                        continue;
                    }
                };
                if let Err(e) = write.send(WsMessage::Text(text)).await {
                    debug!("Lattice write failed: {}", e);
                    break;
                }
            }
            msg = read.next() => match msg {
                Some(Ok(WsMessage::Text(text))) => match serde_json::from_str::<ServerFrame>(&text) {
                    Ok(ServerFrame::Msg { sid, subject, reply, payload }) => {
                        inner.deliver(sid, subject, reply, payload);
                    }
                    Ok(ServerFrame::Pong) => awaiting_pong = false,
                    Ok(ServerFrame::Ok) => {}
                    Ok(ServerFrame::Err { message }) => {
                        warn!("Lattice broker reported an error: {}", message);
                    }
                    Err(e) => warn!("Ignoring malformed broker frame: {}", e),
                },
                Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
            _ = keepalive.tick() => {
                if awaiting_pong {
                    warn!("Lattice broker {} stopped answering pings", inner.endpoint.ws_url);
                    break;
                }
                awaiting_pong = true;
                let ping = serde_json::to_string(&ClientFrame::Ping).unwrap_or_default();
                if write.send(WsMessage::Text(ping)).await.is_err() {
                    break;
                }
            }
        }
    }

    *inner.outbound.lock() = None;
}
