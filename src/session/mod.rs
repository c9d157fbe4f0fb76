//! Per-client session state and the QoS delivery machinery.
//!
//! A session outlives the connections that carry it: it owns the QoS1
//! outbox, both QoS2 transaction tables, the inbound-dedup set, the
//! monotonic frame-id counter, and the user-declared key/value state. All
//! frame processing, outbound emission, and retry callbacks for one session
//! are serialized through its async mutex; no two tasks mutate the same
//! session concurrently.

pub mod dedup;
pub mod index;
pub mod outbox;
pub mod qos2;
pub mod store;

use bytes::Bytes;
use parking_lot::{Mutex as SyncMutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::core::config::ReliabilityConfig;
use crate::dispatch::{ErrorCode, HandlerResult, Pipeline, RpcContext};
use crate::net::conn::{Connection, CLOSE_NORMAL};
use crate::sched::{RetryScheduler, TimerTask};
use crate::wire::frame::{Frame, FrameType, FRAME_HEADER_LEN};
use crate::wire::protocol::{ParsedRequest, WireProtocol};

use dedup::DedupFilter;
use index::FieldIndex;
use outbox::{Outbox, OutboxEntry};
use qos2::{InboundStage, OutboundStage, Qos2Inbound, Qos2Outbound, Qos2Tables};

/// Delivery guarantee for one outbound payload or registered method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Qos {
    /// QoS0: fire and forget.
    AtMostOnce,
    /// QoS1: ACK-tracked with retransmission.
    AtLeastOnce,
    /// QoS2: four-phase exactly-once handshake.
    ExactlyOnce,
}

/// Opaque 128-bit session token, rendered as `S<hex>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionToken(Arc<str>);

impl SessionToken {
    pub(crate) fn generate() -> Self {
        Self(Arc::from(format!("S{}", Uuid::new_v4().simple())))
    }

    /// Reconstruct a token from its printable form (e.g. the value carried
    /// in the `x-session-token` header).
    pub fn parse(raw: &str) -> Self {
        Self(Arc::from(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Stable client identity carried in the upgrade headers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientIdentity {
    pub client_id: String,
    pub device_id: String,
}

/// Callback invoked when QoS1/QoS2 delivery exhausts its retries.
pub type UndeliveredHook = Arc<dyn Fn(&SessionToken, u64, &Bytes) + Send + Sync>;

/// Process-wide collaborators shared by every session.
pub(crate) struct SessionCtx {
    pub config: ReliabilityConfig,
    pub protocol: Arc<dyn WireProtocol>,
    pub pipeline: Arc<Pipeline>,
    pub scheduler: Arc<RetryScheduler>,
    pub index: Arc<FieldIndex>,
    pub undelivered: Option<UndeliveredHook>,
}

#[derive(Debug, Clone)]
struct FieldValue {
    value: String,
    indexed: bool,
}

/// State guarded by the session's serialization mutex.
pub(crate) struct SessionInner {
    conn: Option<Connection>,
    next_id: u64,
    outbox: Outbox,
    qos2: Qos2Tables,
    dedup: DedupFilter,
}

pub struct Session {
    token: SessionToken,
    identity: ClientIdentity,
    created_at: Instant,
    attached: AtomicBool,
    expire_at: SyncMutex<Option<Instant>>,
    last_activity: SyncMutex<Instant>,
    fields: RwLock<HashMap<String, FieldValue>>,
    cancel_tx: watch::Sender<bool>,
    inner: Mutex<SessionInner>,
    ctx: Arc<SessionCtx>,
}

fn emit(conn: &Option<Connection>, frame: Frame) {
    if let Some(conn) = conn {
        conn.send_frame(frame.encode());
    }
}

impl Session {
    pub(crate) fn new(
        token: SessionToken,
        identity: ClientIdentity,
        ctx: Arc<SessionCtx>,
    ) -> Arc<Self> {
        let now = Instant::now();
        let (cancel_tx, _) = watch::channel(false);
        Arc::new(Self {
            token,
            identity,
            created_at: now,
            attached: AtomicBool::new(false),
            // Armed from birth so a session whose handshake never completes
            // still ages out.
            expire_at: SyncMutex::new(Some(now + ctx.config.idle_ttl())),
            last_activity: SyncMutex::new(now),
            fields: RwLock::new(HashMap::new()),
            cancel_tx,
            inner: Mutex::new(SessionInner {
                conn: None,
                next_id: 1,
                outbox: Outbox::new(ctx.config.max_outbox_per_session),
                qos2: Qos2Tables::default(),
                dedup: DedupFilter::new(ctx.config.dedup_window()),
            }),
            ctx,
        })
    }

    pub fn token(&self) -> &SessionToken {
        &self.token
    }

    pub fn identity(&self) -> &ClientIdentity {
        &self.identity
    }

    pub fn client_id(&self) -> &str {
        &self.identity.client_id
    }

    pub fn device_id(&self) -> &str {
        &self.identity.device_id
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_activity(&self) -> Instant {
        *self.last_activity.lock()
    }

    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::Acquire)
    }

    /// TTL rule: no attached connection and past the idle deadline.
    pub(crate) fn is_evictable(&self, now: Instant) -> bool {
        if self.attached.load(Ordering::Acquire) {
            return false;
        }
        self.expire_at.lock().is_some_and(|deadline| deadline <= now)
    }

    pub(crate) fn cancel_receiver(&self) -> watch::Receiver<bool> {
        self.cancel_tx.subscribe()
    }

    fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    // ------------------------------------------------------------------
    // User state
    // ------------------------------------------------------------------

    pub fn get_field(&self, key: &str) -> Option<String> {
        self.fields.read().get(key).map(|f| f.value.clone())
    }

    /// Store a key/value pair; indexed keys become visible to
    /// `SessionStore::find_by` immediately.
    pub fn set_field(&self, key: &str, value: &str, indexed: bool) {
        let prior = {
            let mut fields = self.fields.write();
            fields.insert(
                key.to_string(),
                FieldValue {
                    value: value.to_string(),
                    indexed,
                },
            )
        };
        if indexed {
            self.ctx.index.add(&self.token, key, value);
        } else if prior.is_some_and(|p| p.indexed) {
            self.ctx.index.remove(&self.token, key);
        }
    }

    pub fn delete_field(&self, key: &str) {
        let prior = self.fields.write().remove(key);
        if prior.is_some_and(|p| p.indexed) {
            self.ctx.index.remove(&self.token, key);
        }
    }

    // ------------------------------------------------------------------
    // Attach / detach / evict
    // ------------------------------------------------------------------

    /// Bind a transport connection, closing any previous one first, then
    /// replay all pending deliveries with reset retry schedules.
    pub(crate) async fn attach(&self, conn: Connection) {
        let mut inner = self.inner.lock().await;
        if let Some(old) = inner.conn.take() {
            info!(
                session = %self.token,
                old_conn = old.id(),
                new_conn = conn.id(),
                "replacing attached connection"
            );
            old.close(CLOSE_NORMAL, "connection replaced by new client");
        }
        *self.expire_at.lock() = None;
        self.attached.store(true, Ordering::Release);
        self.touch();
        inner.dedup.prune(Instant::now());
        inner.conn = Some(conn);
        self.replay(&mut inner);
    }

    /// Unbind the transport if `conn_id` is still the attached connection.
    /// Pending QoS state stays put; the idle-TTL deadline starts now.
    pub(crate) async fn detach(&self, conn_id: u64) {
        let mut inner = self.inner.lock().await;
        match &inner.conn {
            Some(current) if current.id() == conn_id => {}
            _ => return,
        }
        inner.conn = None;
        self.attached.store(false, Ordering::Release);
        self.touch();
        *self.expire_at.lock() = Some(Instant::now() + self.ctx.config.idle_ttl());
        debug!(session = %self.token, conn = conn_id, "connection detached, TTL armed");
    }

    /// Drop whatever connection is attached, closing it, and arm the TTL.
    /// Pending QoS state stays put for a later resume.
    pub(crate) async fn detach_current(&self) {
        let mut inner = self.inner.lock().await;
        if let Some(conn) = inner.conn.take() {
            conn.close(CLOSE_NORMAL, "detached");
        }
        self.attached.store(false, Ordering::Release);
        self.touch();
        *self.expire_at.lock() = Some(Instant::now() + self.ctx.config.idle_ttl());
    }

    /// Destroy all in-flight state. Handlers observe the cancellation signal
    /// at their next suspension point.
    pub(crate) async fn evict(&self) {
        let _ = self.cancel_tx.send(true);
        let mut inner = self.inner.lock().await;
        for timer in inner.outbox.drain_timers() {
            self.ctx.scheduler.cancel(timer);
        }
        for timer in inner.qos2.drain_timers() {
            self.ctx.scheduler.cancel(timer);
        }
        inner.dedup.clear();
        if let Some(conn) = inner.conn.take() {
            conn.close(CLOSE_NORMAL, "session evicted");
        }
        self.attached.store(false, Ordering::Release);
        self.fields.write().clear();
        debug!(session = %self.token, "session state destroyed");
    }

    fn replay(&self, inner: &mut SessionInner) {
        let Some(conn) = inner.conn.clone() else {
            return;
        };
        if !inner.outbox.is_empty() || !inner.qos2.is_empty() {
            info!(
                session = %self.token,
                outbox = inner.outbox.len(),
                "replaying pending deliveries on attach"
            );
        }
        let base = self.ctx.config.base_retry();
        for id in inner.outbox.ids_in_order() {
            if let Some(entry) = inner.outbox.get_mut(id) {
                conn.send_frame(entry.frame.clone());
                entry.attempts = 0;
                self.ctx.scheduler.cancel(entry.timer);
                entry.timer = self.ctx.scheduler.schedule(
                    base,
                    TimerTask::Qos1Retry {
                        token: self.token.clone(),
                        frame_id: id,
                    },
                );
            }
        }
        for id in inner.qos2.outbound_ids_in_order() {
            if let Some(txn) = inner.qos2.outbound.get_mut(&id) {
                conn.send_frame(txn.stage_frame(id).encode());
                txn.attempts_in_stage = 0;
                self.ctx.scheduler.cancel(txn.timer);
                txn.timer = self.ctx.scheduler.schedule(
                    base,
                    TimerTask::Qos2OutboundRetry {
                        token: self.token.clone(),
                        frame_id: id,
                    },
                );
            }
        }
        let inbound_ids: Vec<u64> = inner.qos2.inbound.keys().copied().collect();
        for id in inbound_ids {
            if let Some(txn) = inner.qos2.inbound.get_mut(&id) {
                conn.send_frame(txn.stage_frame(id).encode());
                txn.attempts_in_stage = 0;
                self.ctx.scheduler.cancel(txn.timer);
                txn.timer = self.ctx.scheduler.schedule(
                    base,
                    TimerTask::Qos2InboundRetry {
                        token: self.token.clone(),
                        frame_id: id,
                    },
                );
            }
        }
    }

    // ------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------

    /// Server-initiated delivery to this session. QoS1/QoS2 payloads are
    /// queued even while detached and replayed on re-attach; QoS0 payloads
    /// are dropped when no connection is bound.
    ///
    /// Must not be awaited from inside a handler; use
    /// [`RpcContext::push`](crate::dispatch::RpcContext::push) there.
    pub async fn send(&self, payload: impl Into<Bytes>, qos: Qos) {
        let mut inner = self.inner.lock().await;
        self.send_with_inner(&mut inner, payload.into(), qos);
    }

    fn send_with_inner(&self, inner: &mut SessionInner, payload: Bytes, qos: Qos) {
        match qos {
            Qos::AtMostOnce => {
                if inner.conn.is_some() {
                    let id = Self::alloc_id(inner);
                    let conn = inner.conn.clone();
                    emit(&conn, Frame::data(id, payload));
                } else {
                    debug!(session = %self.token, "QoS0 send with no connection dropped");
                }
            }
            Qos::AtLeastOnce => self.send_qos1(inner, payload, None),
            Qos::ExactlyOnce => self.send_qos2(inner, payload),
        }
    }

    /// Track a DATA frame in the outbox and emit it. `response_id` echoes a
    /// non-zero inbound id; otherwise a fresh id is assigned.
    fn send_qos1(&self, inner: &mut SessionInner, payload: Bytes, response_id: Option<u64>) {
        let id = response_id.unwrap_or_else(|| Self::alloc_id(inner));
        if inner.outbox.is_full() {
            warn!(session = %self.token, frame_id = id, "outbox full, dropping QoS1 payload");
            self.notify_undelivered(id, &payload);
            return;
        }
        let frame = Frame::data(id, payload).encode();
        let timer = self.ctx.scheduler.schedule(
            self.ctx.config.base_retry(),
            TimerTask::Qos1Retry {
                token: self.token.clone(),
                frame_id: id,
            },
        );
        inner.outbox.insert(
            id,
            OutboxEntry {
                frame: frame.clone(),
                attempts: 0,
                timer,
                created_at: Instant::now(),
            },
        );
        let conn = inner.conn.clone();
        emit_raw(&conn, frame);
    }

    fn send_qos2(&self, inner: &mut SessionInner, payload: Bytes) {
        let id = Self::alloc_id(inner);
        let timer = self.ctx.scheduler.schedule(
            self.ctx.config.base_retry(),
            TimerTask::Qos2OutboundRetry {
                token: self.token.clone(),
                frame_id: id,
            },
        );
        inner.qos2.insert_outbound(
            id,
            Qos2Outbound {
                payload,
                stage: OutboundStage::Preparing,
                attempts_in_stage: 0,
                timer,
            },
        );
        let conn = inner.conn.clone();
        emit(&conn, Frame::prepare(id));
    }

    fn alloc_id(inner: &mut SessionInner) -> u64 {
        let id = inner.next_id;
        inner.next_id = inner.next_id.wrapping_add(1);
        if inner.next_id == 0 {
            // 0 is the "assign one for me" sentinel on inbound frames.
            inner.next_id = 1;
        }
        id
    }

    fn notify_undelivered(&self, frame_id: u64, payload: &Bytes) {
        if let Some(hook) = &self.ctx.undelivered {
            hook(&self.token, frame_id, payload);
        }
    }

    // ------------------------------------------------------------------
    // Inbound frames
    // ------------------------------------------------------------------

    /// Process one inbound frame. Frames for a session are handed to this
    /// method in receive order by the connection's reader task.
    pub(crate) async fn on_frame(self: &Arc<Self>, frame: Frame) {
        self.touch();
        let mut inner = self.inner.lock().await;
        match frame.frame_type {
            FrameType::Data => self.on_data(&mut inner, frame.id, frame.payload).await,
            FrameType::Ack => self.on_ack(&mut inner, frame.id),
            FrameType::PrepareAck => self.on_prepare_ack(&mut inner, frame.id).await,
            FrameType::Complete => self.on_complete(&mut inner, frame.id),
            FrameType::Prepare | FrameType::Commit => {
                debug!(session = %self.token, frame_type = %frame.frame_type, "ignoring server-role frame from peer");
            }
            FrameType::Unknown(byte) => {
                debug!(session = %self.token, byte, "ignoring unknown frame type");
            }
        }
    }

    async fn on_data(self: &Arc<Self>, inner: &mut SessionInner, id: u64, payload: Bytes) {
        if id != 0 && !inner.dedup.insert(id, Instant::now()) {
            debug!(session = %self.token, frame_id = id, "duplicate DATA dropped");
            return;
        }
        let request = match self.ctx.protocol.parse(&payload) {
            Ok(request) => request,
            Err(err) => {
                debug!(session = %self.token, "unparseable DATA payload: {err}");
                self.emit_error(inner, id, ErrorCode::NoRoute.as_u32(), "malformed request payload");
                return;
            }
        };
        let Some(qos) = self.ctx.pipeline.method_qos(&request.method) else {
            self.emit_error(
                inner,
                id,
                ErrorCode::NoRoute.as_u32(),
                &format!("unknown method: {}", request.method),
            );
            return;
        };
        match qos {
            Qos::AtMostOnce => {
                let (outcome, pushes) = self.dispatch_request(request).await;
                let conn = inner.conn.clone();
                match outcome {
                    Ok(Some(body)) => {
                        let response_id = if id != 0 { id } else { Self::alloc_id(inner) };
                        emit(&conn, Frame::data(response_id, body));
                    }
                    Ok(None) => {}
                    Err(failure) => self.emit_error(inner, id, failure.code, &failure.message),
                }
                self.flush_pushes(inner, pushes);
            }
            Qos::AtLeastOnce => {
                // ACK the request as received; the response rides the outbox.
                if id != 0 {
                    let conn = inner.conn.clone();
                    emit(&conn, Frame::ack(id));
                }
                let (outcome, pushes) = self.dispatch_request(request).await;
                let response = match outcome {
                    Ok(Some(body)) => Some(body),
                    Ok(None) => None,
                    Err(failure) => Some(
                        self.ctx
                            .protocol
                            .serialize_error(failure.code, &failure.message),
                    ),
                };
                if let Some(body) = response {
                    let response_id = if id != 0 { Some(id) } else { None };
                    self.send_qos1(inner, body, response_id);
                }
                self.flush_pushes(inner, pushes);
            }
            Qos::ExactlyOnce => {
                let txn_id = if id != 0 { id } else { Self::alloc_id(inner) };
                let conn = inner.conn.clone();
                if let Some(txn) = inner.qos2.inbound.get(&txn_id) {
                    emit(&conn, txn.stage_frame(txn_id));
                    return;
                }
                let timer = self.ctx.scheduler.schedule(
                    self.ctx.config.base_retry(),
                    TimerTask::Qos2InboundRetry {
                        token: self.token.clone(),
                        frame_id: txn_id,
                    },
                );
                inner.qos2.inbound.insert(
                    txn_id,
                    Qos2Inbound {
                        request,
                        stage: InboundStage::AwaitPrepareAck,
                        result: None,
                        attempts_in_stage: 0,
                        timer,
                    },
                );
                emit(&conn, Frame::prepare(txn_id));
            }
        }
    }

    fn on_ack(&self, inner: &mut SessionInner, id: u64) {
        if let Some(entry) = inner.outbox.remove(id) {
            self.ctx.scheduler.cancel(entry.timer);
            debug!(session = %self.token, frame_id = id, "QoS1 delivery acknowledged");
            return;
        }
        let delivering = matches!(
            inner.qos2.outbound.get(&id),
            Some(txn) if txn.stage == OutboundStage::Delivering
        );
        if delivering {
            if let Some(txn) = inner.qos2.remove_outbound(id) {
                self.ctx.scheduler.cancel(txn.timer);
                debug!(session = %self.token, frame_id = id, "QoS2 delivery complete");
            }
        } else {
            debug!(session = %self.token, frame_id = id, "ACK for unknown frame id");
        }
    }

    async fn on_prepare_ack(self: &Arc<Self>, inner: &mut SessionInner, id: u64) {
        enum Action {
            RunHandler(ParsedRequest),
            Resend(Frame),
            Outbound,
        }
        let action = match inner.qos2.inbound.get(&id) {
            Some(txn) => match txn.stage {
                InboundStage::AwaitPrepareAck => Action::RunHandler(txn.request.clone()),
                // Duplicate PREPARE_ACK after the handler ran: re-announce
                // the current stage, never re-run the handler.
                InboundStage::AwaitComplete => Action::Resend(txn.stage_frame(id)),
            },
            None => Action::Outbound,
        };
        match action {
            Action::RunHandler(request) => {
                let (outcome, pushes) = self.dispatch_request(request).await;
                let response = match outcome {
                    Ok(Some(body)) => body,
                    Ok(None) => Bytes::new(),
                    Err(failure) => self
                        .ctx
                        .protocol
                        .serialize_error(failure.code, &failure.message),
                };
                let conn = inner.conn.clone();
                if let Some(txn) = inner.qos2.inbound.get_mut(&id) {
                    txn.result = Some(response);
                    txn.stage = InboundStage::AwaitComplete;
                    txn.attempts_in_stage = 0;
                    self.ctx.scheduler.cancel(txn.timer);
                    txn.timer = self.ctx.scheduler.schedule(
                        self.ctx.config.base_retry(),
                        TimerTask::Qos2InboundRetry {
                            token: self.token.clone(),
                            frame_id: id,
                        },
                    );
                    emit(&conn, Frame::commit(id));
                }
                self.flush_pushes(inner, pushes);
            }
            Action::Resend(frame) => {
                let conn = inner.conn.clone();
                emit(&conn, frame);
            }
            Action::Outbound => {
                let conn = inner.conn.clone();
                match inner.qos2.outbound.get_mut(&id) {
                    Some(txn) if txn.stage == OutboundStage::Preparing => {
                        txn.stage = OutboundStage::Committing;
                        txn.attempts_in_stage = 0;
                        self.ctx.scheduler.cancel(txn.timer);
                        txn.timer = self.ctx.scheduler.schedule(
                            self.ctx.config.base_retry(),
                            TimerTask::Qos2OutboundRetry {
                                token: self.token.clone(),
                                frame_id: id,
                            },
                        );
                        emit(&conn, Frame::commit(id));
                    }
                    Some(txn) => emit(&conn, txn.stage_frame(id)),
                    None => {
                        debug!(session = %self.token, frame_id = id, "PREPARE_ACK for unknown transaction");
                    }
                }
            }
        }
    }

    fn on_complete(&self, inner: &mut SessionInner, id: u64) {
        let conn = inner.conn.clone();
        let inbound_stage = inner.qos2.inbound.get(&id).map(|txn| txn.stage);
        match inbound_stage {
            Some(InboundStage::AwaitComplete) => {
                if let Some(txn) = inner.qos2.inbound.remove(&id) {
                    self.ctx.scheduler.cancel(txn.timer);
                    let body = txn.result.unwrap_or_default();
                    emit(&conn, Frame::data(id, body));
                }
                return;
            }
            Some(InboundStage::AwaitPrepareAck) => {
                debug!(session = %self.token, frame_id = id, "COMPLETE before PREPARE_ACK ignored");
                return;
            }
            None => {}
        }
        match inner.qos2.outbound.get_mut(&id) {
            Some(txn) if txn.stage == OutboundStage::Committing => {
                txn.stage = OutboundStage::Delivering;
                txn.attempts_in_stage = 0;
                self.ctx.scheduler.cancel(txn.timer);
                txn.timer = self.ctx.scheduler.schedule(
                    self.ctx.config.base_retry(),
                    TimerTask::Qos2OutboundRetry {
                        token: self.token.clone(),
                        frame_id: id,
                    },
                );
                let frame = txn.stage_frame(id);
                emit(&conn, frame);
            }
            Some(txn) => emit(&conn, txn.stage_frame(id)),
            None => {
                debug!(session = %self.token, frame_id = id, "COMPLETE for unknown transaction");
            }
        }
    }

    fn emit_error(&self, inner: &mut SessionInner, inbound_id: u64, code: u32, message: &str) {
        let body = self.ctx.protocol.serialize_error(code, message);
        let response_id = if inbound_id != 0 {
            inbound_id
        } else {
            Self::alloc_id(inner)
        };
        let conn = inner.conn.clone();
        emit(&conn, Frame::data(response_id, body));
    }

    async fn dispatch_request(
        self: &Arc<Self>,
        request: ParsedRequest,
    ) -> (HandlerResult, Vec<(Bytes, Qos)>) {
        let rpc_ctx = RpcContext::new(Arc::clone(self), self.cancel_tx.subscribe());
        let outcome = self.ctx.pipeline.dispatch(request, &rpc_ctx).await;
        let pushes = rpc_ctx.take_pushes();
        (outcome, pushes)
    }

    fn flush_pushes(&self, inner: &mut SessionInner, pushes: Vec<(Bytes, Qos)>) {
        for (payload, qos) in pushes {
            self.send_with_inner(inner, payload, qos);
        }
    }

    // ------------------------------------------------------------------
    // Retry timers
    // ------------------------------------------------------------------

    /// Entry point for scheduler fires; runs inside the serialized unit.
    pub(crate) async fn on_timer(self: &Arc<Self>, task: TimerTask) {
        let mut inner = self.inner.lock().await;
        match task {
            TimerTask::Qos1Retry { frame_id, .. } => self.retry_qos1(&mut inner, frame_id),
            TimerTask::Qos2OutboundRetry { frame_id, .. } => {
                self.retry_qos2_outbound(&mut inner, frame_id);
            }
            TimerTask::Qos2InboundRetry { frame_id, .. } => {
                self.retry_qos2_inbound(&mut inner, frame_id);
            }
            TimerTask::Sweep => {}
        }
    }

    fn retry_qos1(&self, inner: &mut SessionInner, frame_id: u64) {
        let conn = inner.conn.clone();
        let max_retries = self.ctx.config.max_retries;
        if inner.outbox.get_mut(frame_id).is_none() {
            return; // ACKed or purged before the timer fired
        }
        if conn.is_none() {
            // No transport; hold the entry without burning attempts.
            if let Some(entry) = inner.outbox.get_mut(frame_id) {
                entry.timer = self.ctx.scheduler.schedule(
                    self.ctx.config.base_retry(),
                    TimerTask::Qos1Retry {
                        token: self.token.clone(),
                        frame_id,
                    },
                );
            }
            return;
        }
        let exhausted = inner
            .outbox
            .get_mut(frame_id)
            .is_some_and(|entry| entry.attempts >= max_retries);
        if exhausted {
            if let Some(entry) = inner.outbox.remove(frame_id) {
                warn!(
                    session = %self.token,
                    frame_id,
                    attempts = entry.attempts,
                    age_ms = entry.created_at.elapsed().as_millis() as u64,
                    "QoS1 delivery abandoned after max retries"
                );
                self.notify_undelivered(frame_id, &entry.frame.slice(FRAME_HEADER_LEN..));
            }
            return;
        }
        if let Some(entry) = inner.outbox.get_mut(frame_id) {
            entry.attempts += 1;
            if let Some(conn) = &conn {
                conn.send_frame(entry.frame.clone());
            }
            entry.timer = self.ctx.scheduler.schedule(
                self.ctx.config.backoff_delay(entry.attempts),
                TimerTask::Qos1Retry {
                    token: self.token.clone(),
                    frame_id,
                },
            );
        }
    }

    fn retry_qos2_outbound(&self, inner: &mut SessionInner, frame_id: u64) {
        let conn = inner.conn.clone();
        let max_retries = self.ctx.config.max_retries;
        if inner.qos2.outbound.get(&frame_id).is_none() {
            return;
        }
        if conn.is_none() {
            if let Some(txn) = inner.qos2.outbound.get_mut(&frame_id) {
                txn.timer = self.ctx.scheduler.schedule(
                    self.ctx.config.base_retry(),
                    TimerTask::Qos2OutboundRetry {
                        token: self.token.clone(),
                        frame_id,
                    },
                );
            }
            return;
        }
        let exhausted = inner
            .qos2
            .outbound
            .get(&frame_id)
            .is_some_and(|txn| txn.attempts_in_stage >= max_retries);
        if exhausted {
            if let Some(txn) = inner.qos2.remove_outbound(frame_id) {
                warn!(
                    session = %self.token,
                    frame_id,
                    stage = ?txn.stage,
                    "QoS2 delivery abandoned after max retries in stage"
                );
                self.notify_undelivered(frame_id, &txn.payload);
            }
            return;
        }
        if let Some(txn) = inner.qos2.outbound.get_mut(&frame_id) {
            txn.attempts_in_stage += 1;
            let frame = txn.stage_frame(frame_id);
            if let Some(conn) = &conn {
                conn.send_frame(frame.encode());
            }
            txn.timer = self.ctx.scheduler.schedule(
                self.ctx.config.backoff_delay(txn.attempts_in_stage),
                TimerTask::Qos2OutboundRetry {
                    token: self.token.clone(),
                    frame_id,
                },
            );
        }
    }

    fn retry_qos2_inbound(&self, inner: &mut SessionInner, frame_id: u64) {
        let conn = inner.conn.clone();
        let max_retries = self.ctx.config.max_retries;
        if inner.qos2.inbound.get(&frame_id).is_none() {
            return;
        }
        if conn.is_none() {
            if let Some(txn) = inner.qos2.inbound.get_mut(&frame_id) {
                txn.timer = self.ctx.scheduler.schedule(
                    self.ctx.config.base_retry(),
                    TimerTask::Qos2InboundRetry {
                        token: self.token.clone(),
                        frame_id,
                    },
                );
            }
            return;
        }
        let exhausted = inner
            .qos2
            .inbound
            .get(&frame_id)
            .is_some_and(|txn| txn.attempts_in_stage >= max_retries);
        if exhausted {
            if let Some(txn) = inner.qos2.inbound.remove(&frame_id) {
                warn!(
                    session = %self.token,
                    frame_id,
                    stage = ?txn.stage,
                    "inbound QoS2 handshake abandoned after max retries"
                );
            }
            return;
        }
        if let Some(txn) = inner.qos2.inbound.get_mut(&frame_id) {
            txn.attempts_in_stage += 1;
            let frame = txn.stage_frame(frame_id);
            if let Some(conn) = &conn {
                conn.send_frame(frame.encode());
            }
            txn.timer = self.ctx.scheduler.schedule(
                self.ctx.config.backoff_delay(txn.attempts_in_stage),
                TimerTask::Qos2InboundRetry {
                    token: self.token.clone(),
                    frame_id,
                },
            );
        }
    }
}

fn emit_raw(conn: &Option<Connection>, frame: Bytes) {
    if let Some(conn) = conn {
        conn.send_frame(frame);
    }
}
