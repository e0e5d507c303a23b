//! Channel trait abstraction for the reactor's transport boundary.
//!
//! A [`Channel`] is one physical, non-blocking, framed connection. The
//! reactor drives it through `init` until it is active, then moves whole
//! messages with `read`/`write` and keeps it alive with `ping`. Nothing in
//! this trait blocks.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tern_codec::ProtocolVersion;

/// Transport layer errors
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// I/O error from the underlying socket
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Peer closed the channel
    #[error("Channel closed by peer")]
    Closed,

    /// Host or service could not be resolved
    #[error("Failed to resolve {0}")]
    Resolve(String),

    /// Connection failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Peer violated the framing or handshake protocol
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Operation requires an active channel
    #[error("Channel is not active")]
    NotActive,

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Raw socket descriptor, for registration with external multiplexers
pub type SocketId = i64;

/// Low-level channel state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Connection or transport handshake in progress
    Initializing,
    /// Ready for data
    Active,
    /// Failed or closed; unusable
    Failed,
}

/// Progress of [`Channel::init`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitProgress {
    /// Call again later
    InProgress,
    /// The channel is active
    Active,
}

/// Result of [`Channel::read`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    /// One complete message
    Data(Vec<u8>),
    /// A keepalive from the peer
    Ping,
    /// Nothing complete is available
    WouldBlock,
}

/// Result of [`Channel::write`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteOutcome {
    /// Message bytes accepted
    pub bytes: usize,
    /// Bytes still queued for the socket after this write
    pub pending: usize,
}

/// Negotiated channel parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelInfo {
    /// Ping timeout agreed with the peer
    pub ping_timeout: Duration,
    /// Largest message to send in one frame
    pub max_fragment_size: usize,
    /// Protocol version agreed with the peer
    pub version: ProtocolVersion,
    /// Remote address, once connected
    pub peer_addr: Option<SocketAddr>,
}

/// A non-blocking, framed connection.
///
/// Implementations must be `Send` so the reactor's worker thread can own them.
pub trait Channel: Send {
    /// Current low-level state
    fn state(&self) -> ChannelState;

    /// Advance connection establishment.
    ///
    /// # Errors
    ///
    /// Returns `TransportError` if the connection or transport handshake
    /// fails; the channel is `Failed` afterwards.
    fn init(&mut self) -> TransportResult<InitProgress>;

    /// Read one message or keepalive.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Closed`] when the peer closes the channel.
    fn read(&mut self) -> TransportResult<ReadOutcome>;

    /// Queue one message and write as much as the socket accepts.
    ///
    /// # Errors
    ///
    /// Returns `TransportError` if the channel is not active or the socket fails.
    fn write(&mut self, msg: &[u8]) -> TransportResult<WriteOutcome>;

    /// Write queued bytes, returning how many remain queued.
    ///
    /// # Errors
    ///
    /// Returns `TransportError` if the socket fails.
    fn flush(&mut self) -> TransportResult<usize>;

    /// Send a keepalive.
    ///
    /// # Errors
    ///
    /// Returns `TransportError` if the channel is not active or the socket fails.
    fn ping(&mut self) -> TransportResult<()>;

    /// Negotiated parameters
    fn info(&self) -> ChannelInfo;

    /// Raw socket descriptor
    fn socket_id(&self) -> SocketId;

    /// Close the channel, telling the peer if possible
    fn close(&mut self);

    /// Traffic counters
    fn stats(&self) -> TransportStats {
        TransportStats::default()
    }
}

/// Transport statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportStats {
    /// Total bytes sent
    pub bytes_sent: u64,
    /// Total bytes received
    pub bytes_received: u64,
    /// Data frames sent
    pub frames_sent: u64,
    /// Data frames received
    pub frames_received: u64,
    /// Pings sent
    pub pings_sent: u64,
    /// Pings received
    pub pings_received: u64,
}

impl TransportStats {
    /// Create new empty statistics
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record bytes handed to the socket
    pub fn record_send(&mut self, bytes: usize) {
        self.bytes_sent += bytes as u64;
    }

    /// Record bytes read from the socket
    pub fn record_recv(&mut self, bytes: usize) {
        self.bytes_received += bytes as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_stats() {
        let mut stats = TransportStats::new();
        assert_eq!(stats.bytes_sent, 0);

        stats.record_send(100);
        stats.record_send(50);
        assert_eq!(stats.bytes_sent, 150);

        stats.record_recv(200);
        assert_eq!(stats.bytes_received, 200);
    }

    #[test]
    fn test_transport_error_display() {
        assert_eq!(TransportError::Closed.to_string(), "Channel closed by peer");
        let err = TransportError::Resolve("nowhere:1".into());
        assert_eq!(err.to_string(), "Failed to resolve nowhere:1");
    }
}
