//! # Tern Transport
//!
//! Transport layer underneath the Tern reactor.
//!
//! This crate provides:
//! - The [`Channel`] trait: the non-blocking boundary the reactor drives
//! - Length-prefixed wire framing with a connect/ack handshake ([`frame`])
//! - A TCP implementation ([`TcpChannel`]) and listening [`Server`]

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod frame;
pub mod tcp;
pub mod transport;

pub use tcp::{BindOptions, ChannelOptions, ConnectInfo, Server, TcpChannel};
pub use transport::{
    Channel, ChannelInfo, ChannelState, InitProgress, ReadOutcome, SocketId, TransportError,
    TransportResult, TransportStats, WriteOutcome,
};
