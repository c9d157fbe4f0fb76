//! Middleware pipeline and method handler registry.
//!
//! Dispatch is a fixed ordered list of middleware built at startup, followed
//! by the handler registered for the method. A middleware may rewrite the
//! request, short-circuit with a response, or fail; the handler produces
//! either an optional response payload or a coded failure that the session
//! renders as an `error:<code>:<message>` reply.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;

use crate::session::{Qos, Session, SessionToken};

pub use crate::wire::protocol::ParsedRequest as RpcRequest;

/// Builtin error codes carried in `error:<code>:<message>` replies.
///
/// Code 3 covers both unparseable payloads and unknown methods; handler
/// failures may use any code, with 99 as the internal default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ErrorCode {
    MiddlewareDenied = 2,
    NoRoute = 3,
    Auth = 4,
    RateLimited = 5,
    Internal = 99,
}

impl ErrorCode {
    pub fn as_u32(self) -> u32 {
        self as u32
    }
}

/// A coded dispatch failure surfaced to the peer as a structured reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcFailure {
    pub code: u32,
    pub message: String,
}

impl RpcFailure {
    pub fn new(code: u32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn coded(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::new(code.as_u32(), message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::coded(ErrorCode::Internal, message)
    }
}

impl std::fmt::Display for RpcFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "rpc failure {}: {}", self.code, self.message)
    }
}

/// `Ok(Some(bytes))` responds, `Ok(None)` stays silent, `Err` replies with
/// a structured error.
pub type HandlerResult = Result<Option<Bytes>, RpcFailure>;

/// Per-dispatch capability set handed to middleware and handlers.
///
/// Outbound messages queued with [`RpcContext::push`] are flushed by the
/// session after the dispatch completes; handlers must not call
/// [`Session::send`] directly, because the session's serialized unit is held
/// for the duration of the dispatch.
#[derive(Clone)]
pub struct RpcContext {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    session: Arc<Session>,
    cancelled: watch::Receiver<bool>,
    pushes: Mutex<Vec<(Bytes, Qos)>>,
}

impl RpcContext {
    pub(crate) fn new(session: Arc<Session>, cancelled: watch::Receiver<bool>) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                session,
                cancelled,
                pushes: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.inner.session
    }

    pub fn token(&self) -> &SessionToken {
        self.inner.session.token()
    }

    /// Queue a server-initiated message for this session. Delivery (and QoS
    /// bookkeeping) happens when the current dispatch finishes.
    pub fn push(&self, payload: impl Into<Bytes>, qos: Qos) {
        self.inner.pushes.lock().push((payload.into(), qos));
    }

    /// True once the session has been evicted; well-behaved handlers check
    /// this at suspension points and abandon work.
    pub fn is_cancelled(&self) -> bool {
        *self.inner.cancelled.borrow()
    }

    /// Resolves when the session is evicted mid-invocation.
    pub async fn cancelled(&self) {
        let mut receiver = self.inner.cancelled.clone();
        loop {
            if *receiver.borrow() {
                return;
            }
            if receiver.changed().await.is_err() {
                return;
            }
        }
    }

    pub(crate) fn take_pushes(&self) -> Vec<(Bytes, Qos)> {
        std::mem::take(&mut self.inner.pushes.lock())
    }
}

/// What a middleware decided about the request.
#[derive(Debug)]
pub enum MiddlewareVerdict {
    /// Pass through to the next stage.
    Next,
    /// Short-circuit with this response payload.
    Respond(Bytes),
    /// Short-circuit with a structured error.
    Fail(RpcFailure),
}

#[async_trait]
pub trait Middleware: Send + Sync {
    async fn handle(&self, request: &mut RpcRequest, ctx: &RpcContext) -> MiddlewareVerdict;
}

#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, request: RpcRequest, ctx: &RpcContext) -> HandlerResult;
}

/// Adapter so plain async closures register as handlers.
pub struct FnHandler<F>(F);

impl<F> FnHandler<F> {
    pub fn new<Fut>(f: F) -> Self
    where
        F: Fn(RpcRequest, RpcContext) -> Fut + Send + Sync,
        Fut: Future<Output = HandlerResult> + Send,
    {
        Self(f)
    }
}

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(RpcRequest, RpcContext) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send,
{
    async fn handle(&self, request: RpcRequest, ctx: &RpcContext) -> HandlerResult {
        (self.0)(request, ctx.clone()).await
    }
}

pub(crate) struct MethodEntry {
    pub handler: Arc<dyn Handler>,
    pub qos: Qos,
}

/// The frozen dispatch pipeline: middleware in registration order, then the
/// method table.
pub struct Pipeline {
    middlewares: Vec<Arc<dyn Middleware>>,
    methods: HashMap<String, MethodEntry>,
}

impl Pipeline {
    pub(crate) fn new(
        middlewares: Vec<Arc<dyn Middleware>>,
        methods: HashMap<String, MethodEntry>,
    ) -> Self {
        Self {
            middlewares,
            methods,
        }
    }

    /// QoS of a registered method, or None when unknown.
    pub(crate) fn method_qos(&self, method: &str) -> Option<Qos> {
        self.methods.get(method).map(|entry| entry.qos)
    }

    pub(crate) async fn dispatch(&self, mut request: RpcRequest, ctx: &RpcContext) -> HandlerResult {
        for middleware in &self.middlewares {
            match middleware.handle(&mut request, ctx).await {
                MiddlewareVerdict::Next => {}
                MiddlewareVerdict::Respond(payload) => return Ok(Some(payload)),
                MiddlewareVerdict::Fail(failure) => return Err(failure),
            }
        }
        match self.methods.get(&request.method) {
            Some(entry) => entry.handler.handle(request, ctx).await,
            None => Err(RpcFailure::coded(
                ErrorCode::NoRoute,
                format!("unknown method: {}", request.method),
            )),
        }
    }
}
