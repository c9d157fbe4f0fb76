#![warn(clippy::all, clippy::pedantic)]
// Module naming: common pattern in domain-driven code
#![allow(clippy::module_name_repetitions)]
// Function complexity: some functions are inherently complex
#![allow(clippy::too_many_lines)]
// Documentation style: many terms don't need backticks
#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
// API ergonomics: prefer simplicity over must_use annotations
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
// Format strings: allow non-inlined for readability
#![allow(clippy::uninlined_format_args)]
// Numeric casts: intentional in protocol code
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
// Passing style
#![allow(clippy::needless_pass_by_value)]

//! Framewire - reliable binary RPC over a WebSocket transport.
//!
//! # Module Organization
//!
//! ## Core
//! - `core::config` - Configuration parsing and validation
//! - `core::time` - Deterministic time utilities
//!
//! ## Wire
//! - `wire::frame` - On-wire frame codec (type + id + payload)
//! - `wire::protocol` - DATA payload schemes (default `method:body` text)
//!
//! ## Sessions
//! - `session` - Per-client session state, QoS1 outbox, QoS2 transactions
//! - `session::store` - Token/identity resolution and TTL eviction
//! - `session::index` - Secondary index over user-declared session fields
//!
//! ## Scheduling
//! - `sched` - Process-global retry scheduler and TTL sweep
//!
//! ## Dispatch
//! - `dispatch` - Middleware pipeline and method handler registry
//!
//! ## Networking
//! - `net` - Server façade, upgrade handshake, connection adapter
//!
//! ## Operations
//! - `telemetry` - Tracing subscriber setup
//!
//! ## CLI
//! - `cli` - Command-line entrypoints

// Core infrastructure
pub mod core;

// Wire protocol
pub mod wire;

// Sessions
pub mod session;

// Scheduling
pub mod sched;

// Dispatch
pub mod dispatch;

// Networking
pub mod net;

// Operations
pub mod telemetry;

// CLI
pub mod cli;

// Re-exports for convenience
pub use self::core::{config, time};
pub use config::Config;
pub use dispatch::{
    ErrorCode, FnHandler, Handler, HandlerResult, Middleware, MiddlewareVerdict, RpcContext,
    RpcFailure, RpcRequest,
};
pub use net::{DefaultInspector, HandshakeIdentity, HandshakeInspector, Server, ServerHandle};
pub use session::store::{SessionStore, StoreError};
pub use session::{ClientIdentity, Qos, Session, SessionToken, UndeliveredHook};
pub use wire::frame::{Frame, FrameType};
pub use wire::protocol::{ParsedRequest, SimpleTextProtocol, WireProtocol};
