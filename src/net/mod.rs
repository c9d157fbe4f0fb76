//! Server façade: listener, upgrade handshake, and connection wiring.
//!
//! The upgrade path reads the identity headers (`x-client-id`,
//! `x-device-id`, optional `x-session-token`), resolves a session in the
//! store, and answers with the resolved token in `x-session-token`. Each
//! accepted socket gets a reader task feeding the session's serialized unit
//! and a writer task draining the connection queue.

pub(crate) mod conn;

use anyhow::{Context, Result};
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_hdr_async_with_config;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, info, warn};

use crate::core::config::Config;
use crate::core::time::SystemClock;
use crate::dispatch::{
    FnHandler, Handler, HandlerResult, MethodEntry, Middleware, Pipeline, RpcContext, RpcRequest,
};
use crate::sched::{RetryScheduler, TimerTask};
use crate::session::index::FieldIndex;
use crate::session::store::{Resolved, SessionStore};
use crate::session::{Qos, Session, SessionCtx, UndeliveredHook};
use crate::wire::frame::Frame;
use crate::wire::protocol::{SimpleTextProtocol, WireProtocol};
use conn::{run_writer, Connection, CLOSE_PROTOCOL_ERROR};

/// Interval between TTL sweep ticks.
const SWEEP_INTERVAL: Duration = Duration::from_millis(250);

/// Identity extracted from the HTTP upgrade request.
#[derive(Debug, Clone)]
pub struct HandshakeIdentity {
    pub client_id: String,
    pub device_id: String,
    pub session_token: Option<String>,
}

/// Pluggable upgrade inspection. The default reads the `x-client-id`,
/// `x-device-id`, and `x-session-token` headers (case-insensitive).
pub trait HandshakeInspector: Send + Sync + 'static {
    /// Produce the client identity, or reject the upgrade with a reason
    /// surfaced to the peer as an HTTP 400.
    fn extract(&self, request: &Request) -> Result<HandshakeIdentity, String>;
}

#[derive(Debug, Default)]
pub struct DefaultInspector;

impl HandshakeInspector for DefaultInspector {
    fn extract(&self, request: &Request) -> Result<HandshakeIdentity, String> {
        let header = |name: &str| {
            request
                .headers()
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(ToString::to_string)
        };
        let client_id =
            header("x-client-id").ok_or_else(|| "missing x-client-id header".to_string())?;
        let device_id =
            header("x-device-id").ok_or_else(|| "missing x-device-id header".to_string())?;
        Ok(HandshakeIdentity {
            client_id,
            device_id,
            session_token: header("x-session-token"),
        })
    }
}

/// Builder-style server. Register methods and middleware, then `bind` (for
/// embedding and tests) or `run` (binds and serves until ctrl-c).
pub struct Server {
    config: Config,
    protocol: Arc<dyn WireProtocol>,
    inspector: Arc<dyn HandshakeInspector>,
    middlewares: Vec<Arc<dyn Middleware>>,
    methods: HashMap<String, MethodEntry>,
    undelivered: Option<UndeliveredHook>,
}

impl Server {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            protocol: Arc::new(SimpleTextProtocol),
            inspector: Arc::new(DefaultInspector),
            middlewares: Vec::new(),
            methods: HashMap::new(),
            undelivered: None,
        }
    }

    /// Swap the active payload scheme. One protocol per server instance.
    pub fn with_protocol(mut self, protocol: Arc<dyn WireProtocol>) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn with_inspector(mut self, inspector: Arc<dyn HandshakeInspector>) -> Self {
        self.inspector = inspector;
        self
    }

    /// Append a middleware; execution order is registration order.
    pub fn middleware(&mut self, middleware: impl Middleware + 'static) -> &mut Self {
        self.middlewares.push(Arc::new(middleware));
        self
    }

    /// Register a method handler at an explicit QoS.
    pub fn register(&mut self, method: &str, qos: Qos, handler: impl Handler + 'static) -> &mut Self {
        self.methods.insert(
            method.to_string(),
            MethodEntry {
                handler: Arc::new(handler),
                qos,
            },
        );
        self
    }

    /// Register a method handler at the configured `qos_default`.
    pub fn register_default(&mut self, method: &str, handler: impl Handler + 'static) -> &mut Self {
        let qos = self.config.reliability.qos_default.as_qos();
        self.register(method, qos, handler)
    }

    /// Register a plain async closure as a handler.
    pub fn register_fn<F, Fut>(&mut self, method: &str, qos: Qos, f: F) -> &mut Self
    where
        F: Fn(RpcRequest, RpcContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.register(method, qos, FnHandler::new(f))
    }

    /// Observe QoS1/QoS2 deliveries that exhausted their retries.
    pub fn on_undelivered(&mut self, hook: UndeliveredHook) -> &mut Self {
        self.undelivered = Some(hook);
        self
    }

    /// Bind the listener and start every background task. Returns a handle
    /// exposing the bound address and the session store.
    pub async fn bind(self) -> Result<ServerHandle> {
        self.config.validate()?;
        let pipeline = Arc::new(Pipeline::new(self.middlewares, self.methods));
        let (scheduler, timer_rx) = RetryScheduler::new();
        let index = Arc::new(FieldIndex::new());
        let session_ctx = Arc::new(SessionCtx {
            config: self.config.reliability.clone(),
            protocol: self.protocol.clone(),
            pipeline,
            scheduler: scheduler.clone(),
            index,
            undelivered: self.undelivered,
        });
        let store = SessionStore::new(session_ctx, self.config.server.max_sessions);

        let listener = TcpListener::bind(&self.config.server.listen_addr)
            .await
            .with_context(|| {
                format!(
                    "failed to bind listener on {}",
                    self.config.server.listen_addr
                )
            })?;
        let local_addr = listener.local_addr().context("listener has no local addr")?;
        info!("listening on {}", local_addr);

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(scheduler.clone().run(SystemClock)));
        tasks.push(tokio::spawn(dispatch_timers(
            timer_rx,
            store.clone(),
            scheduler.clone(),
        )));
        scheduler.schedule(SWEEP_INTERVAL, TimerTask::Sweep);

        let accept_ctx = AcceptCtx {
            store: store.clone(),
            inspector: self.inspector,
            accepts_text: self.protocol.accepts_text(),
            strict_frames: self.config.server.strict_frames,
            max_frame_bytes: self.config.server.max_frame_bytes,
            send_queue_depth: self.config.server.send_queue_depth,
        };
        tasks.push(tokio::spawn(accept_loop(listener, accept_ctx)));

        Ok(ServerHandle {
            local_addr,
            store,
            tasks,
        })
    }

    /// Bind and serve until the process is signalled.
    pub async fn run(self) -> Result<()> {
        let handle = self.bind().await?;
        tokio::signal::ctrl_c()
            .await
            .context("failed to listen for shutdown signal")?;
        info!("shutdown signal received");
        handle.shutdown();
        Ok(())
    }
}

/// Running server: bound address, session store access, task lifetimes.
pub struct ServerHandle {
    local_addr: SocketAddr,
    store: Arc<SessionStore>,
    tasks: Vec<JoinHandle<()>>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    /// Stop every background task. Open connections are dropped.
    pub fn shutdown(self) {
        for task in self.tasks {
            task.abort();
        }
    }
}

/// Shared state cloned into each accepted connection's task.
#[derive(Clone)]
struct AcceptCtx {
    store: Arc<SessionStore>,
    inspector: Arc<dyn HandshakeInspector>,
    accepts_text: bool,
    strict_frames: bool,
    max_frame_bytes: usize,
    send_queue_depth: usize,
}

/// Forward scheduler fires into the owning session's serialized unit, and
/// run the TTL sweep on its tick.
async fn dispatch_timers(
    mut timer_rx: mpsc::UnboundedReceiver<TimerTask>,
    store: Arc<SessionStore>,
    scheduler: Arc<RetryScheduler>,
) {
    while let Some(task) = timer_rx.recv().await {
        match &task {
            TimerTask::Sweep => {
                for session in store.reap(Instant::now()) {
                    session.evict().await;
                }
                scheduler.schedule(SWEEP_INTERVAL, TimerTask::Sweep);
            }
            TimerTask::Qos1Retry { token, .. }
            | TimerTask::Qos2OutboundRetry { token, .. }
            | TimerTask::Qos2InboundRetry { token, .. } => {
                // Re-enter the owning session's serialized unit without
                // letting one busy session stall every other retry.
                if let Some(session) = store.get(token) {
                    let task = task.clone();
                    tokio::spawn(async move {
                        session.on_timer(task).await;
                    });
                }
            }
        }
    }
}

async fn accept_loop(listener: TcpListener, ctx: AcceptCtx) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(err) => {
                warn!("tcp accept error: {err:?}");
                continue;
            }
        };
        let ctx = ctx.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_connection(stream, peer, ctx).await {
                debug!("connection {peer} ended: {err:?}");
            }
        });
    }
}

fn reject(status: u16, reason: String) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason));
    *response.status_mut() =
        StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_REQUEST);
    response
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, ctx: AcceptCtx) -> Result<()> {
    let slot: Arc<Mutex<Option<Resolved>>> = Arc::new(Mutex::new(None));
    let callback = {
        let store = ctx.store.clone();
        let inspector = ctx.inspector.clone();
        let slot = slot.clone();
        move |request: &Request, mut response: Response| -> Result<Response, ErrorResponse> {
            let identity = inspector
                .extract(request)
                .map_err(|reason| reject(400, reason))?;
            let resolved = store
                .resolve(
                    &identity.client_id,
                    &identity.device_id,
                    identity.session_token.as_deref(),
                )
                .map_err(|err| reject(503, err.to_string()))?;
            let token = HeaderValue::from_str(resolved.session.token().as_str())
                .map_err(|_| reject(500, "unrepresentable session token".to_string()))?;
            response.headers_mut().insert("x-session-token", token);
            *slot.lock() = Some(resolved);
            Ok(response)
        }
    };
    let ws_config = WebSocketConfig {
        max_message_size: Some(ctx.max_frame_bytes),
        ..WebSocketConfig::default()
    };
    let websocket = accept_hdr_async_with_config(stream, callback, Some(ws_config))
        .await
        .context("websocket upgrade failed")?;
    let Some(resolved) = slot.lock().take() else {
        return Ok(());
    };
    for stale in resolved.expired {
        stale.evict().await;
    }
    let session = resolved.session;
    info!(
        peer = %peer,
        session = %session.token(),
        resumed = !resolved.is_new,
        "connection established"
    );

    let (sink, reader) = websocket.split();
    let (connection, command_rx, force_close) = Connection::channel(ctx.send_queue_depth);
    tokio::spawn(run_writer(sink, command_rx, force_close));
    session.attach(connection.clone()).await;

    read_loop(reader, &session, &connection, ctx.strict_frames, ctx.accepts_text).await;

    session.detach(connection.id()).await;
    Ok(())
}

async fn read_loop<S>(
    mut reader: S,
    session: &Arc<Session>,
    connection: &Connection,
    strict: bool,
    accepts_text: bool,
) where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
{
    while let Some(message) = reader.next().await {
        match message {
            Ok(Message::Binary(raw)) => match Frame::decode(Bytes::from(raw), strict) {
                Ok(frame) => session.on_frame(frame).await,
                Err(err) => {
                    warn!(session = %session.token(), "closing connection on frame error: {err}");
                    connection.close(CLOSE_PROTOCOL_ERROR, "malformed frame");
                    break;
                }
            },
            Ok(Message::Text(text)) => {
                if accepts_text {
                    // Compatibility mode: a text message is a DATA frame
                    // with id 0 and the message body as payload.
                    session
                        .on_frame(Frame::data(0, Bytes::from(text.into_bytes())))
                        .await;
                } else {
                    debug!(session = %session.token(), "ignoring text message on binary protocol");
                }
            }
            Ok(Message::Close(_)) => break,
            Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => {}
            Err(err) => {
                debug!(session = %session.token(), "socket error: {err}");
                break;
            }
        }
    }
}
