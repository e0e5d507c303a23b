//! Error types for the reactor.
//!
//! Errors returned from reactor calls are local and synchronous: invalid
//! arguments, unknown channels, exhausted buffers. Failures of a connection
//! itself never come back as a return value; they arrive once, as a
//! `DownReconnecting` or `Down` channel event carrying a [`DisconnectReason`].
//!
//! Both types map onto one [`ErrorKind`] taxonomy:
//!
//! - **InvalidArgument**: contract violation, rejected with no side effects
//! - **WouldBlock**: no work available now; not a failure
//! - **Timeout**: initialization or ping timeout
//! - **ProtocolFailure**: malformed or refused handshake traffic
//! - **IoFailure**: transport-level failure
//! - **Fatal**: the reactor itself cannot continue

use crate::session::ChannelId;
use std::borrow::Cow;
use tern_codec::CodecError;
use tern_transport::TransportError;
use thiserror::Error;

/// Error category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Role or options contract violation
    InvalidArgument,
    /// Nothing to do right now
    WouldBlock,
    /// Initialization or ping timeout
    Timeout,
    /// Malformed handshake or message
    ProtocolFailure,
    /// Transport failure
    IoFailure,
    /// Reactor-internal failure
    Fatal,
}

/// Errors returned by reactor calls
#[derive(Debug, Error)]
pub enum ReactorError {
    /// Role or options rejected before any I/O
    #[error("Invalid argument: {0}")]
    InvalidArgument(Cow<'static, str>),

    /// The channel id does not name an open channel
    #[error("Unknown channel {0}")]
    UnknownChannel(ChannelId),

    /// The channel is not connected
    #[error("Channel {0} is down")]
    ChannelDown(ChannelId),

    /// The channel's guaranteed output buffers are all in use
    #[error("No buffers available on channel {0}")]
    NoBuffers(ChannelId),

    /// `accept` found no pending inbound connection
    #[error("No pending connection to accept")]
    NoPendingConnection,

    /// `destroy` called while channels remain open
    #[error("{0} channel(s) still open")]
    ChannelsOpen(usize),

    /// The reactor has been destroyed
    #[error("Reactor is shut down")]
    Shutdown,

    /// Transport error outside any channel's lifecycle
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Encoding error for a caller-supplied message
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// Reactor-internal failure
    #[error("Fatal reactor error: {0}")]
    Fatal(Cow<'static, str>),
}

impl ReactorError {
    /// Category of this error
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidArgument(_) | Self::UnknownChannel(_) | Self::ChannelsOpen(_) => {
                ErrorKind::InvalidArgument
            }
            Self::NoBuffers(_) | Self::NoPendingConnection => ErrorKind::WouldBlock,
            Self::ChannelDown(_) => ErrorKind::IoFailure,
            Self::Transport(TransportError::Protocol(_)) => ErrorKind::ProtocolFailure,
            Self::Transport(_) => ErrorKind::IoFailure,
            Self::Codec(CodecError::BufferTooSmall { .. }) => ErrorKind::InvalidArgument,
            Self::Codec(_) => ErrorKind::ProtocolFailure,
            Self::Shutdown | Self::Fatal(_) => ErrorKind::Fatal,
        }
    }

    /// False only for errors after which the reactor is unusable
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        self.kind() != ErrorKind::Fatal
    }

    /// Shorthand for an `InvalidArgument` error
    pub fn invalid(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::InvalidArgument(msg.into())
    }
}

/// Why a channel went down
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The transport did not become active within the initialization timeout
    InitializationTimeout,
    /// Nothing was received within the ping timeout
    PingTimeout,
    /// The peer closed the connection
    ClosedByPeer,
    /// Transport failure
    Io(String),
    /// Peer sent something the session could not accept
    Protocol(String),
}

impl DisconnectReason {
    /// Category of this disconnection
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InitializationTimeout | Self::PingTimeout => ErrorKind::Timeout,
            Self::ClosedByPeer | Self::Io(_) => ErrorKind::IoFailure,
            Self::Protocol(_) => ErrorKind::ProtocolFailure,
        }
    }
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InitializationTimeout => write!(f, "initialization timeout"),
            Self::PingTimeout => write!(f, "ping timeout"),
            Self::ClosedByPeer => write!(f, "closed by peer"),
            Self::Io(msg) => write!(f, "I/O failure: {msg}"),
            Self::Protocol(msg) => write!(f, "protocol failure: {msg}"),
        }
    }
}

impl From<TransportError> for DisconnectReason {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Closed => Self::ClosedByPeer,
            TransportError::Protocol(msg) => Self::Protocol(msg),
            other => Self::Io(other.to_string()),
        }
    }
}

impl From<CodecError> for DisconnectReason {
    fn from(err: CodecError) -> Self {
        Self::Protocol(err.to_string())
    }
}

/// Result type for reactor operations
pub type Result<T> = std::result::Result<T, ReactorError>;
