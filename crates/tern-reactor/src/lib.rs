//! # Tern Reactor
//!
//! Connection reactor for request/response market-data sessions.
//!
//! This crate provides:
//! - [`Reactor`]: owns sessions, a worker thread and the event queue
//! - Per-channel session state machine with automatic login, directory and
//!   dictionary handshakes ([`Role`])
//! - Ping-based liveness detection and bounded exponential reconnect
//! - Bounded, multi-thread-safe [`Reactor::dispatch`] of lifecycle and
//!   message events to role callbacks
//! - Per-channel send buffer accounting ([`Buffer`])
//!
//! ## Example
//!
//! ```no_run
//! use tern_reactor::{
//!     CallbackReturn, ConnectOptions, ConsumerRole, DispatchOptions, Reactor, ReactorConfig, Role,
//! };
//! use tern_codec::{DirectoryRequest, LoginRequest};
//! use std::time::Duration;
//!
//! let reactor = Reactor::new(ReactorConfig::default())?;
//! let role = Role::consumer(
//!     ConsumerRole::default()
//!         .with_login_request(LoginRequest::new(1, "user"))
//!         .with_directory_request(DirectoryRequest::new(2)),
//! )
//! .on_default_msg(|_, ev| {
//!     println!("{:?}", ev.msg);
//!     CallbackReturn::Success
//! })
//! .on_channel_event(|_, ev| {
//!     println!("{:?}", ev.kind);
//!     CallbackReturn::Success
//! });
//!
//! let channel = reactor.connect(&ConnectOptions::new("localhost", "14002"), role)?;
//! loop {
//!     if reactor.wait(Duration::from_secs(1)) {
//!         reactor.dispatch(&DispatchOptions::default())?;
//!     }
//! #   break;
//! }
//! reactor.close_channel(channel)?;
//! reactor.destroy()?;
//! # Ok::<(), tern_reactor::ReactorError>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod buffer_pool;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod event;
mod handshake;
pub mod notifier;
pub mod options;
pub mod reactor;
pub mod role;
pub mod session;
pub mod worker;

pub use buffer_pool::Buffer;
pub use config::ReactorConfig;
pub use dispatch::{DEFAULT_MAX_MESSAGES, DispatchOptions, DispatchStatus};
pub use error::{DisconnectReason, ErrorKind, ReactorError, Result};
pub use event::{ChannelEvent, ChannelEventKind, Event, MsgEvent, RdmMsgEvent};
pub use notifier::Notifier;
pub use options::{AcceptOptions, ConnectOptions, ReconnectPolicy, UserSpec};
pub use reactor::Reactor;
pub use role::{
    CallbackReturn, ChannelEventCallback, ConsumerRole, DefaultMsgCallback,
    DictionaryDownloadMode, DictionaryMsgCallback, DirectoryMsgCallback, LoginMsgCallback,
    NiProviderRole, ProviderRole, Role, RoleHandlers, RoleKind,
};
pub use session::{ChannelId, ChannelSnapshot, HandshakeStage, SessionState};
pub use worker::{LIVENESS_WINDOW_FACTOR, PING_SEND_DIVISOR, WorkerStats};
