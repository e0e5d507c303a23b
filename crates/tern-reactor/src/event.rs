//! Events delivered through `dispatch`.

use crate::error::DisconnectReason;
use crate::options::UserSpec;
use crate::session::ChannelId;
use std::sync::Arc;
use tern_codec::{Msg, RdmMsg};
use tern_transport::SocketId;

/// Lifecycle transition of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelEventKind {
    /// Transport connected
    Up,
    /// Automatic handshakes complete
    Ready,
    /// Connection lost; a reconnect is scheduled
    DownReconnecting,
    /// Connection lost; no further reconnects
    Down,
}

/// Lifecycle event
#[derive(Clone)]
pub struct ChannelEvent {
    /// Transition
    pub kind: ChannelEventKind,
    /// Channel the transition happened on
    pub channel: ChannelId,
    /// Socket descriptor of the connection the event is about
    pub socket_id: Option<SocketId>,
    /// Opaque value supplied with the connect or accept options
    pub user_spec: Option<UserSpec>,
    /// Cause of a down transition
    pub reason: Option<DisconnectReason>,
}

/// Message received on a channel
#[derive(Clone)]
pub struct MsgEvent {
    /// Channel the message arrived on
    pub channel: ChannelId,
    /// Decoded envelope
    pub msg: Msg,
    /// Encoded bytes as received
    pub buffer: Arc<[u8]>,
    /// Opaque value supplied with the connect or accept options
    pub user_spec: Option<UserSpec>,
}

/// Message from an administrative domain, with its typed form
#[derive(Clone)]
pub struct RdmMsgEvent<T> {
    /// Generic view of the message
    pub base: MsgEvent,
    /// Typed view of the message
    pub rdm: T,
}

/// Queued event
#[derive(Clone)]
pub enum Event {
    /// Lifecycle transition
    Channel(ChannelEvent),
    /// Inbound message
    Msg {
        /// Message event
        event: MsgEvent,
        /// Typed form, for administrative domains
        rdm: Option<RdmMsg>,
    },
    /// All queued output of a channel reached the socket
    FlushComplete(ChannelId),
}

impl Event {
    /// Channel the event concerns
    #[must_use]
    pub fn channel(&self) -> ChannelId {
        match self {
            Event::Channel(e) => e.channel,
            Event::Msg { event, .. } => event.channel,
            Event::FlushComplete(id) => *id,
        }
    }
}

impl std::fmt::Debug for ChannelEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelEvent")
            .field("kind", &self.kind)
            .field("channel", &self.channel)
            .field("socket_id", &self.socket_id)
            .field("reason", &self.reason)
            .finish_non_exhaustive()
    }
}

impl std::fmt::Debug for MsgEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MsgEvent")
            .field("channel", &self.channel)
            .field("msg", &self.msg)
            .field("len", &self.buffer.len())
            .finish_non_exhaustive()
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for RdmMsgEvent<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RdmMsgEvent")
            .field("channel", &self.base.channel)
            .field("rdm", &self.rdm)
            .finish()
    }
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Event::Channel(e) => e.fmt(f),
            Event::Msg { event, .. } => event.fmt(f),
            Event::FlushComplete(id) => write!(f, "FlushComplete({id})"),
        }
    }
}
