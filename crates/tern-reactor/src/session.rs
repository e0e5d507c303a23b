//! Per-channel session state machine.
//!
//! A Session wraps one logical connection: the transport channel (when one
//! exists), the Role, handshake progress and reconnect bookkeeping. Every
//! lifecycle event a channel ever produces is queued from here, which is
//! what guarantees the ordering and deduplication the application observes.
//!
//! ```text
//! Connecting ─► Initializing ─► Up ─► Handshake(Login ─► Directory ─► Dictionary) ─► Ready ─► Active
//!     ▲                                                                                 │
//!     └──────────────── DownReconnecting ◄── (any failure while live) ──────────────────┘
//!                                            (limit exhausted) ─► Down ─► Closed
//! ```

use crate::error::{DisconnectReason, ReactorError, Result};
use crate::event::{ChannelEvent, ChannelEventKind, Event};
use crate::options::{AcceptOptions, ConnectOptions, ReconnectPolicy, UserSpec};
use crate::role::{Role, RoleKind};
use crate::buffer_pool::BufferPool;
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::time::{Duration, Instant};
use tern_codec::{Codec, CodecError, Msg};
use tern_transport::{Channel, ConnectInfo, SocketId, TransportError};

/// Identity of a channel within one reactor.
///
/// Ids increase monotonically and are never reused, so a stale id from a
/// closed channel can never alias a newer one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(u64);

impl ChannelId {
    /// Wrap a raw id
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Raw id
    #[must_use]
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Automatic handshake stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HandshakeStage {
    /// Awaiting the login response
    Login,
    /// Awaiting the source directory
    Directory,
    /// Awaiting dictionary refreshes
    Dictionary,
}

/// Session state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Waiting to (re)connect
    Connecting,
    /// Transport connecting or negotiating
    Initializing,
    /// Transport active; Up queued
    Up,
    /// Automatic handshake in progress
    Handshake(HandshakeStage),
    /// Ready queued, not yet dispatched
    Ready,
    /// Ready dispatched to the application
    Active,
    /// Down, with a reconnect scheduled
    DownReconnecting,
    /// Down for good
    Down,
    /// Closed by the application
    Closed,
}

impl SessionState {
    /// Whether a transition to `next` is allowed
    #[must_use]
    pub fn can_transition(self, next: SessionState) -> bool {
        use SessionState::*;

        if next == Closed {
            return self != Closed;
        }
        match (self, next) {
            (Connecting, Initializing) => true,
            (Initializing, Up) => true,
            (Up, Handshake(_) | Ready) => true,
            (Handshake(a), Handshake(b)) => b > a,
            (Handshake(_), Ready) => true,
            (Ready, Active) => true,
            (DownReconnecting, Connecting) => true,
            (from, DownReconnecting | Down) => from.is_live(),
            _ => false,
        }
    }

    /// Transport active and not failed
    #[must_use]
    pub fn is_connected(self) -> bool {
        matches!(
            self,
            SessionState::Up | SessionState::Handshake(_) | SessionState::Ready | SessionState::Active
        )
    }

    /// Connecting or connected; a failure in this state is a new disconnection
    #[must_use]
    pub fn is_live(self) -> bool {
        matches!(self, SessionState::Connecting | SessionState::Initializing) || self.is_connected()
    }
}

/// How the session came to exist
#[derive(Clone)]
pub(crate) enum Origin {
    Outbound(ConnectOptions),
    Inbound(AcceptOptions),
}

/// Why a send did not complete
#[derive(Debug)]
pub(crate) enum SendError {
    NotConnected,
    Codec(CodecError),
    Transport(TransportError),
}

impl From<SendError> for DisconnectReason {
    fn from(err: SendError) -> Self {
        match err {
            SendError::NotConnected => DisconnectReason::Io("channel not connected".into()),
            SendError::Codec(e) => e.into(),
            SendError::Transport(e) => e.into(),
        }
    }
}

/// Point-in-time view of a channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSnapshot {
    /// Session state
    pub state: SessionState,
    /// Reconnect attempts since the last Ready
    pub attempts_made: u32,
    /// Socket descriptor of the current connection
    pub socket_id: Option<SocketId>,
    /// Negotiated ping timeout, while connected
    pub ping_timeout: Option<Duration>,
    /// Negotiated fragment size, while connected
    pub max_fragment_size: Option<usize>,
    /// Message bytes written
    pub bytes_sent: u64,
    /// Message bytes received
    pub bytes_received: u64,
    /// Connect target, for outbound channels
    pub connect_info: Option<ConnectInfo>,
    /// Application buffers currently held
    pub outstanding_buffers: usize,
}

pub(crate) struct Session {
    pub(crate) id: ChannelId,
    pub(crate) state: SessionState,
    pub(crate) role: Role,
    pub(crate) origin: Origin,
    pub(crate) channel: Option<Box<dyn Channel>>,
    pub(crate) attempts_made: u32,
    pub(crate) last_delay: Option<Duration>,
    pub(crate) retry_at: Instant,
    pub(crate) attempt_started: Instant,
    pub(crate) last_activity: Instant,
    pub(crate) last_ping_sent: Instant,
    pub(crate) flush_pending: bool,
    pub(crate) dictionary_streams: Vec<i32>,
    pub(crate) outstanding_dictionaries: HashSet<i32>,
    pub(crate) last_socket_id: Option<SocketId>,
    pub(crate) bytes_sent: u64,
    pub(crate) bytes_received: u64,
}

impl Session {
    pub(crate) fn outbound(id: ChannelId, opts: ConnectOptions, role: Role, now: Instant) -> Self {
        Self::new(id, SessionState::Connecting, Origin::Outbound(opts), role, None, now)
    }

    pub(crate) fn inbound(
        id: ChannelId,
        channel: Box<dyn Channel>,
        opts: AcceptOptions,
        role: Role,
        now: Instant,
    ) -> Self {
        let mut session = Self::new(
            id,
            SessionState::Initializing,
            Origin::Inbound(opts),
            role,
            None,
            now,
        );
        session.last_socket_id = Some(channel.socket_id());
        session.channel = Some(channel);
        session
    }

    fn new(
        id: ChannelId,
        state: SessionState,
        origin: Origin,
        role: Role,
        channel: Option<Box<dyn Channel>>,
        now: Instant,
    ) -> Self {
        Self {
            id,
            state,
            role,
            origin,
            channel,
            attempts_made: 0,
            last_delay: None,
            retry_at: now,
            attempt_started: now,
            last_activity: now,
            last_ping_sent: now,
            flush_pending: false,
            dictionary_streams: Vec::new(),
            outstanding_dictionaries: HashSet::new(),
            last_socket_id: None,
            bytes_sent: 0,
            bytes_received: 0,
        }
    }

    /// Transition to a new state
    pub(crate) fn transition_to(&mut self, new_state: SessionState) -> Result<()> {
        if !self.state.can_transition(new_state) {
            return Err(ReactorError::Fatal(
                format!(
                    "channel {}: invalid transition {:?} -> {:?}",
                    self.id, self.state, new_state
                )
                .into(),
            ));
        }

        tracing::debug!(
            "Session {} state transition: {:?} -> {:?}",
            self.id,
            self.state,
            new_state
        );
        self.state = new_state;
        Ok(())
    }

    /// Transition, logging instead of failing on an invalid move
    pub(crate) fn transition(&mut self, new_state: SessionState) {
        if let Err(e) = self.transition_to(new_state) {
            tracing::error!("{}", e);
        }
    }

    pub(crate) fn user_spec(&self) -> Option<UserSpec> {
        match &self.origin {
            Origin::Outbound(o) => o.user_spec.clone(),
            Origin::Inbound(o) => o.user_spec.clone(),
        }
    }

    pub(crate) fn initialization_timeout(&self) -> Duration {
        match &self.origin {
            Origin::Outbound(o) => o.initialization_timeout,
            Origin::Inbound(o) => o.initialization_timeout,
        }
    }

    pub(crate) fn guaranteed_output_buffers(&self) -> usize {
        match &self.origin {
            Origin::Outbound(o) => o.guaranteed_output_buffers,
            Origin::Inbound(o) => o.guaranteed_output_buffers,
        }
    }

    pub(crate) fn reconnect_policy(&self) -> ReconnectPolicy {
        match &self.origin {
            Origin::Outbound(o) => o.reconnect_policy(),
            Origin::Inbound(_) => ReconnectPolicy::NEVER,
        }
    }

    pub(crate) fn max_fragment_size(&self) -> Option<usize> {
        self.channel.as_ref().map(|c| c.info().max_fragment_size)
    }

    /// Stream id of the login handshake, if the role performs one
    pub(crate) fn login_stream(&self) -> Option<i32> {
        match &self.role.kind {
            RoleKind::Consumer(c) => c.login_request.as_ref().map(|r| r.stream_id),
            RoleKind::NonInteractiveProvider(n) => n.login_request.as_ref().map(|r| r.stream_id),
            RoleKind::Provider(_) => None,
        }
    }

    /// Stream id of the directory handshake, if the role performs one
    pub(crate) fn directory_stream(&self) -> Option<i32> {
        match &self.role.kind {
            RoleKind::Consumer(c) => c.directory_request.as_ref().map(|r| r.stream_id),
            _ => None,
        }
    }

    pub(crate) fn channel_event(
        &self,
        kind: ChannelEventKind,
        socket_id: Option<SocketId>,
        reason: Option<DisconnectReason>,
    ) -> Event {
        Event::Channel(ChannelEvent {
            kind,
            channel: self.id,
            socket_id,
            user_spec: self.user_spec(),
            reason,
        })
    }

    /// Record a disconnection.
    ///
    /// Only the first failure signal for a live session produces an event;
    /// later signals for the same disconnection are dropped until the session
    /// is live again.
    pub(crate) fn fail(&mut self, reason: DisconnectReason, now: Instant, queue: &mut VecDeque<Event>) {
        if !self.state.is_live() {
            tracing::warn!(
                "Session {} already {:?}; suppressing duplicate failure: {}",
                self.id,
                self.state,
                reason
            );
            return;
        }

        let socket_id = self
            .channel
            .as_ref()
            .map(|c| c.socket_id())
            .or(self.last_socket_id);
        if let Some(mut channel) = self.channel.take() {
            channel.close();
        }
        self.flush_pending = false;
        self.dictionary_streams.clear();
        self.outstanding_dictionaries.clear();

        let policy = self.reconnect_policy();
        let kind = if policy.allows(self.attempts_made) {
            self.attempts_made += 1;
            let delay = policy.next_delay(self.last_delay);
            self.last_delay = Some(delay);
            self.retry_at = now + delay;
            self.transition(SessionState::DownReconnecting);
            tracing::info!(
                "Channel {} down ({}); reconnect {} in {:?}",
                self.id,
                reason,
                self.attempts_made,
                delay
            );
            ChannelEventKind::DownReconnecting
        } else {
            self.transition(SessionState::Down);
            tracing::info!("Channel {} down ({}); not reconnecting", self.id, reason);
            ChannelEventKind::Down
        };

        queue.push_back(self.channel_event(kind, socket_id, Some(reason)));
    }

    /// Queue Up and reset liveness clocks
    pub(crate) fn mark_up(&mut self, now: Instant, queue: &mut VecDeque<Event>) {
        self.transition(SessionState::Up);
        self.last_activity = now;
        self.last_ping_sent = now;
        let socket_id = self.channel.as_ref().map(|c| c.socket_id());
        if socket_id.is_some() {
            self.last_socket_id = socket_id;
        }
        tracing::info!("Channel {} up", self.id);
        queue.push_back(self.channel_event(ChannelEventKind::Up, socket_id, None));
    }

    /// Queue Ready and reset reconnect bookkeeping
    pub(crate) fn mark_ready(&mut self, queue: &mut VecDeque<Event>) {
        self.transition(SessionState::Ready);
        self.attempts_made = 0;
        self.last_delay = None;
        tracing::info!("Channel {} ready", self.id);
        queue.push_back(self.channel_event(
            ChannelEventKind::Ready,
            self.last_socket_id,
            None,
        ));
    }

    /// Encode and write a message, growing the buffer if needed
    pub(crate) fn send(
        &mut self,
        codec: &dyn Codec,
        pool: &mut BufferPool,
        msg: &Msg,
        now: Instant,
    ) -> std::result::Result<usize, SendError> {
        if !self.state.is_connected() {
            return Err(SendError::NotConnected);
        }
        let info = match self.channel.as_ref() {
            Some(channel) => channel.info(),
            None => return Err(SendError::NotConnected),
        };

        let data = pool
            .encode(codec, msg, info.version, info.max_fragment_size)
            .map_err(SendError::Codec)?;
        let result = self.write(&data, now);
        pool.recycle(data);
        result
    }

    /// Write already-encoded bytes
    pub(crate) fn write(&mut self, bytes: &[u8], now: Instant) -> std::result::Result<usize, SendError> {
        if !self.state.is_connected() {
            return Err(SendError::NotConnected);
        }
        let channel = self.channel.as_mut().ok_or(SendError::NotConnected)?;
        let out = channel.write(bytes).map_err(SendError::Transport)?;

        self.bytes_sent += out.bytes as u64;
        self.last_ping_sent = now;
        if out.pending > 0 {
            self.flush_pending = true;
        }
        Ok(out.bytes)
    }

    /// Close on application request
    pub(crate) fn close(&mut self) {
        if let Some(mut channel) = self.channel.take() {
            channel.close();
        }
        self.transition(SessionState::Closed);
    }

    pub(crate) fn snapshot(&self, outstanding_buffers: usize) -> ChannelSnapshot {
        let info = self.channel.as_ref().map(|c| c.info());
        let connected = self.state.is_connected();
        ChannelSnapshot {
            state: self.state,
            attempts_made: self.attempts_made,
            socket_id: self.channel.as_ref().map(|c| c.socket_id()),
            ping_timeout: info
                .as_ref()
                .filter(|_| connected)
                .map(|i| i.ping_timeout),
            max_fragment_size: info
                .as_ref()
                .filter(|_| connected)
                .map(|i| i.max_fragment_size),
            bytes_sent: self.bytes_sent,
            bytes_received: self.bytes_received,
            connect_info: match &self.origin {
                Origin::Outbound(o) => Some(o.connect_info.clone()),
                Origin::Inbound(_) => None,
            },
            outstanding_buffers,
        }
    }
}
