//! Embedded publish/subscribe broker (orchestrator mode).
//!
//! The broker listens for mesh connections on `ws://<host>:<port>/ws` and
//! serves monitoring routes on a separate port. Clients authenticate with the
//! first frame they send; after that they subscribe and publish by subject.

pub mod protocol;

mod monitor;
mod router;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::config::BrokerConfig;
use crate::error::{LatticeError, Result};
use crate::subjects;

use protocol::{ClientFrame, ServerFrame, AUTH_VIOLATION};
use router::{ConnId, Router as SubjectRouter};

pub use router::{BrokerStats, ConnectionInfo};

/// How long a new connection has to send its `connect` frame.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Owns the lifecycle of the in-process broker.
///
/// `start` is idempotent: while the broker runs, further calls return the
/// existing handle.
pub struct EmbeddedBroker {
    config: BrokerConfig,
    handle: Mutex<Option<BrokerHandle>>,
}

impl EmbeddedBroker {
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            config,
            handle: Mutex::new(None),
        }
    }

    /// Bind the client and monitor ports and start serving.
    ///
    /// # Errors
    ///
    /// Returns `LatticeError::Bind` if either port is already in use.
    pub async fn start(&self) -> Result<BrokerHandle> {
        let mut slot = self.handle.lock().await;
        if let Some(handle) = slot.as_ref() {
            if handle.is_running() {
                return Ok(handle.clone());
            }
        }
        let handle = BrokerHandle::bind(&self.config).await?;
        *slot = Some(handle.clone());
        Ok(handle)
    }

    /// Stop the broker if it is running. Ports are released on return.
    pub async fn stop(&self) {
        let handle = self.handle.lock().await.take();
        if let Some(handle) = handle {
            handle.stop().await;
        }
    }

    pub async fn handle(&self) -> Option<BrokerHandle> {
        self.handle.lock().await.clone()
    }
}

struct BrokerState {
    router: Arc<SubjectRouter>,
    token: Option<String>,
    shutdown: CancellationToken,
}

struct HandleInner {
    client_addr: SocketAddr,
    monitor_addr: SocketAddr,
    router: Arc<SubjectRouter>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// A running broker.
#[derive(Clone)]
pub struct BrokerHandle {
    inner: Arc<HandleInner>,
}

impl BrokerHandle {
    async fn bind(config: &BrokerConfig) -> Result<Self> {
        let client_listener = TcpListener::bind((config.host.as_str(), config.port))
            .await
            .map_err(|source| LatticeError::Bind {
                port: config.port,
                source,
            })?;
        let monitor_listener = TcpListener::bind((config.host.as_str(), config.monitor_port))
            .await
            .map_err(|source| LatticeError::Bind {
                port: config.monitor_port,
                source,
            })?;

        let client_addr = local_addr(&client_listener, config.port)?;
        let monitor_addr = local_addr(&monitor_listener, config.monitor_port)?;

        let router = Arc::new(SubjectRouter::new());
        let shutdown = CancellationToken::new();

        let state = Arc::new(BrokerState {
            router: Arc::clone(&router),
            token: config.token.clone(),
            shutdown: shutdown.clone(),
        });

        let client_app = Router::new()
            .route("/ws", get(ws_upgrade))
            .layer(TraceLayer::new_for_http())
            .with_state(state);
        let monitor_app = monitor::routes(Arc::clone(&router));

        let client_task = spawn_server(client_listener, client_app, shutdown.clone(), "client");
        let monitor_task = spawn_server(monitor_listener, monitor_app, shutdown.clone(), "monitor");

        info!(
            "Lattice broker listening on ws://{}/ws (monitor http://{})",
            client_addr, monitor_addr
        );

        Ok(Self {
            inner: Arc::new(HandleInner {
                client_addr,
                monitor_addr,
                router,
                shutdown,
                tasks: Mutex::new(vec![client_task, monitor_task]),
            }),
        })
    }

    pub fn client_addr(&self) -> SocketAddr {
        self.inner.client_addr
    }

    pub fn monitor_addr(&self) -> SocketAddr {
        self.inner.monitor_addr
    }

    /// URL a mesh connection should use to reach this broker.
    pub fn client_url(&self, token: Option<&str>) -> String {
        let addr = self.inner.client_addr;
        let host = if addr.ip().is_unspecified() {
            "127.0.0.1".to_string()
        } else {
            addr.ip().to_string()
        };
        match token {
            Some(token) => format!("ws://{}@{}:{}/ws", token, host, addr.port()),
            None => format!("ws://{}:{}/ws", host, addr.port()),
        }
    }

    pub fn stats(&self) -> BrokerStats {
        self.inner.router.stats()
    }

    pub fn is_running(&self) -> bool {
        !self.inner.shutdown.is_cancelled()
    }

    /// Close every connection and wait until both listeners are released.
    pub async fn stop(&self) {
        self.inner.shutdown.cancel();
        self.inner.router.close_all();

        let tasks: Vec<JoinHandle<()>> = self.inner.tasks.lock().await.drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        info!("Lattice broker on {} stopped", self.inner.client_addr);
    }
}

fn local_addr(listener: &TcpListener, port: u16) -> Result<SocketAddr> {
    listener
        .local_addr()
        .map_err(|source| LatticeError::Bind { port, source })
}

fn spawn_server(
    listener: TcpListener,
    app: Router,
    shutdown: CancellationToken,
    label: &'static str,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await;
        if let Err(e) = result {
            warn!("Broker {} server exited with error: {}", label, e);
        }
    })
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<Arc<BrokerState>>) -> Response {
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

async fn handle_connection(socket: WebSocket, state: Arc<BrokerState>) {
    let (mut sender, mut receiver) = socket.split();

    let name = match read_connect(&mut receiver).await {
        Ok((name, token)) => {
            if state.token.is_some() && token != state.token {
                warn!("Rejected lattice connection '{}': bad credentials", name);
                let _ = send_frame(
                    &mut sender,
                    &ServerFrame::Err {
                        message: AUTH_VIOLATION.to_string(),
                    },
                )
                .await;
                let _ = sender.close().await;
                return;
            }
            name
        }
        Err(message) => {
            debug!("Dropping lattice connection before handshake: {}", message);
            let _ = send_frame(&mut sender, &ServerFrame::Err { message }).await;
            let _ = sender.close().await;
            return;
        }
    };

    if send_frame(&mut sender, &ServerFrame::Ok).await.is_err() {
        return;
    }

    let (tx, mut rx) = mpsc::unbounded_channel::<ServerFrame>();
    let replies = tx.clone();
    let conn = state.router.register(name.clone(), tx);
    debug!("Lattice connection {} ('{}') established", conn, name);

    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if send_frame(&mut sender, &frame).await.is_err() {
                break;
            }
        }
        let _ = sender.close().await;
    });

    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => break,
            msg = receiver.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    handle_frame(&state, conn, &replies, &text);
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            }
        }
    }

    state.router.remove(conn);
    drop(replies);
    let _ = writer.await;
    debug!("Lattice connection {} ('{}') closed", conn, name);
}

async fn read_connect(
    receiver: &mut futures::stream::SplitStream<WebSocket>,
) -> std::result::Result<(String, Option<String>), String> {
    let first = tokio::time::timeout(HANDSHAKE_TIMEOUT, receiver.next())
        .await
        .map_err(|_| "handshake timed out".to_string())?;
    match first {
        Some(Ok(Message::Text(text))) => match serde_json::from_str::<ClientFrame>(&text) {
            Ok(ClientFrame::Connect { token, name }) => Ok((name, token)),
            Ok(_) => Err("expected connect frame".to_string()),
            Err(e) => Err(format!("malformed frame: {}", e)),
        },
        Some(Ok(_)) => Err("expected text frame".to_string()),
        Some(Err(e)) => Err(e.to_string()),
        None => Err("connection closed".to_string()),
    }
}

fn handle_frame(
    state: &BrokerState,
    conn: ConnId,
    replies: &mpsc::UnboundedSender<ServerFrame>,
    text: &str,
) {
    let frame = match serde_json::from_str::<ClientFrame>(text) {
        Ok(frame) => frame,
        Err(e) => {
            let _ = replies.send(ServerFrame::Err {
                message: format!("malformed frame: {}", e),
            });
            return;
        }
    };

    match frame {
        ClientFrame::Sub { sid, subject, queue } => {
            if subjects::is_valid_pattern(&subject) {
                state.router.subscribe(conn, sid, subject, queue);
            } else {
                let _ = replies.send(ServerFrame::Err {
                    message: format!("invalid subject pattern '{}'", subject),
                });
            }
        }
        ClientFrame::Unsub { sid } => state.router.unsubscribe(conn, sid),
        ClientFrame::Pub {
            subject,
            reply,
            payload,
        } => {
            if subjects::is_valid_subject(&subject) {
                state.router.publish(&subject, reply.as_deref(), &payload);
            } else {
                let _ = replies.send(ServerFrame::Err {
                    message: format!("invalid subject '{}'", subject),
                });
            }
        }
        ClientFrame::Ping => {
            let _ = replies.send(ServerFrame::Pong);
        }
        ClientFrame::Connect { .. } => {
            let _ = replies.send(ServerFrame::Err {
                message: "already connected".to_string(),
            });
        }
    }
}

async fn send_frame(
    sender: &mut futures::stream::SplitSink<WebSocket, Message>,
    frame: &ServerFrame,
) -> std::result::Result<(), axum::Error> {
    let text = serde_json::to_string(frame).map_err(axum::Error::new)?;
    sender.send(Message::Text(text)).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ephemeral() -> BrokerConfig {
        BrokerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            monitor_port: 0,
            token: None,
        }
    }

    #[tokio::test]
    async fn start_is_idempotent() {
        let broker = EmbeddedBroker::new(ephemeral());
        let first = broker.start().await.unwrap();
        let second = broker.start().await.unwrap();
        assert_eq!(first.client_addr(), second.client_addr());
        assert!(first.is_running());
        broker.stop().await;
        assert!(!first.is_running());
        assert!(broker.handle().await.is_none());
    }

    #[tokio::test]
    async fn bind_conflict_is_reported() {
        let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = occupied.local_addr().unwrap().port();

        let broker = EmbeddedBroker::new(BrokerConfig {
            port,
            ..ephemeral()
        });
        let err = broker.start().await.err().unwrap();
        assert!(matches!(err, LatticeError::Bind { port: p, .. } if p == port));
    }

    #[tokio::test]
    async fn stop_releases_ports() {
        let broker = EmbeddedBroker::new(ephemeral());
        let handle = broker.start().await.unwrap();
        let addr = handle.client_addr();
        broker.stop().await;

        let rebound = std::net::TcpListener::bind(addr);
        assert!(rebound.is_ok(), "port {} still held after stop", addr.port());
    }

    #[test]
    fn client_url_embeds_token() {
        let addr: SocketAddr = "0.0.0.0:4222".parse().unwrap();
        let handle = BrokerHandle {
            inner: Arc::new(HandleInner {
                client_addr: addr,
                monitor_addr: "0.0.0.0:8222".parse().unwrap(),
                router: Arc::new(SubjectRouter::new()),
                shutdown: CancellationToken::new(),
                tasks: Mutex::new(Vec::new()),
            }),
        };
        assert_eq!(handle.client_url(None), "ws://127.0.0.1:4222/ws");
        assert_eq!(handle.client_url(Some("s3cret")), "ws://s3cret@127.0.0.1:4222/ws");
    }
}
