//! Wire framing for Tern channels.
//!
//! Every frame is length-prefixed:
//!
//! ```text
//! ┌────────────────┬──────────┬───────────────────────┐
//! │ len: u32 (BE)  │ kind: u8 │ body: len - 1 bytes   │
//! └────────────────┴──────────┴───────────────────────┘
//! ```
//!
//! `len` counts the kind byte plus the body. The connection handshake
//! (`ConnectRequest`/`ConnectAck`) negotiates the protocol version, ping
//! timeout and maximum fragment size before any `Data` frame flows.

use crate::transport::{TransportError, TransportResult};
use std::time::Duration;
use tern_codec::ProtocolVersion;

/// Bytes of length prefix plus kind byte
pub const HEADER_LEN: usize = 5;

/// Frame kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// Initiator's connection parameters
    ConnectRequest = 0x01,
    /// Acceptor's negotiated parameters
    ConnectAck = 0x02,
    /// Application data (one encoded message)
    Data = 0x03,
    /// Keepalive
    Ping = 0x04,
    /// Orderly close
    Close = 0x05,
}

impl TryFrom<u8> for FrameKind {
    type Error = TransportError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::ConnectRequest),
            0x02 => Ok(Self::ConnectAck),
            0x03 => Ok(Self::Data),
            0x04 => Ok(Self::Ping),
            0x05 => Ok(Self::Close),
            other => Err(TransportError::Protocol(format!(
                "unknown frame kind 0x{other:02x}"
            ))),
        }
    }
}

/// One decoded frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame kind
    pub kind: FrameKind,
    /// Frame body
    pub body: Vec<u8>,
}

/// Append an encoded frame to `out`
pub fn encode_frame(kind: FrameKind, body: &[u8], out: &mut Vec<u8>) -> TransportResult<()> {
    let len = u32::try_from(body.len() + 1)
        .map_err(|_| TransportError::Protocol(format!("frame body too large: {}", body.len())))?;
    out.reserve(HEADER_LEN + body.len());
    out.extend_from_slice(&len.to_be_bytes());
    out.push(kind as u8);
    out.extend_from_slice(body);
    Ok(())
}

/// Incremental frame decoder over a byte stream
#[derive(Debug)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    max_frame_len: usize,
}

impl FrameDecoder {
    /// Create a decoder rejecting frames longer than `max_frame_len`
    #[must_use]
    pub fn new(max_frame_len: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_frame_len,
        }
    }

    /// Feed received bytes
    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes buffered but not yet decoded
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Next complete frame, if one is buffered
    pub fn next_frame(&mut self) -> TransportResult<Option<Frame>> {
        if self.buf.len() < HEADER_LEN {
            return Ok(None);
        }

        let len = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        if len == 0 {
            return Err(TransportError::Protocol("zero-length frame".into()));
        }
        if len > self.max_frame_len + 1 {
            return Err(TransportError::Protocol(format!(
                "frame of {len} bytes exceeds limit of {}",
                self.max_frame_len
            )));
        }
        if self.buf.len() < 4 + len {
            return Ok(None);
        }

        let kind = FrameKind::try_from(self.buf[4])?;
        let body = self.buf[HEADER_LEN..4 + len].to_vec();
        self.buf.drain(..4 + len);
        Ok(Some(Frame { kind, body }))
    }
}

/// Body of a `ConnectRequest` frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectRequest {
    /// Initiator's protocol version
    pub version: ProtocolVersion,
    /// Ping timeout the initiator asks for
    pub ping_timeout: Duration,
}

impl ConnectRequest {
    const LEN: usize = 6;

    /// Encode the body
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::LEN);
        out.push(self.version.major);
        out.push(self.version.minor);
        out.extend_from_slice(&duration_ms(self.ping_timeout).to_be_bytes());
        out
    }

    /// Decode the body
    pub fn from_bytes(body: &[u8]) -> TransportResult<Self> {
        if body.len() != Self::LEN {
            return Err(TransportError::Protocol(format!(
                "connect request of {} bytes",
                body.len()
            )));
        }
        Ok(Self {
            version: ProtocolVersion::new(body[0], body[1]),
            ping_timeout: Duration::from_millis(u64::from(read_u32(&body[2..6]))),
        })
    }
}

/// Body of a `ConnectAck` frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectAck {
    /// Acceptor's protocol version
    pub version: ProtocolVersion,
    /// Negotiated ping timeout
    pub ping_timeout: Duration,
    /// Largest message either side should send in one frame
    pub max_fragment_size: usize,
}

impl ConnectAck {
    const LEN: usize = 10;

    /// Encode the body
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::LEN);
        out.push(self.version.major);
        out.push(self.version.minor);
        out.extend_from_slice(&duration_ms(self.ping_timeout).to_be_bytes());
        let frag = u32::try_from(self.max_fragment_size).unwrap_or(u32::MAX);
        out.extend_from_slice(&frag.to_be_bytes());
        out
    }

    /// Decode the body
    pub fn from_bytes(body: &[u8]) -> TransportResult<Self> {
        if body.len() != Self::LEN {
            return Err(TransportError::Protocol(format!(
                "connect ack of {} bytes",
                body.len()
            )));
        }
        Ok(Self {
            version: ProtocolVersion::new(body[0], body[1]),
            ping_timeout: Duration::from_millis(u64::from(read_u32(&body[2..6]))),
            max_fragment_size: read_u32(&body[6..10]) as usize,
        })
    }
}

/// Ping timeout an acceptor grants for a requested value
#[must_use]
pub fn negotiate_ping_timeout(requested: Duration, server: Duration, minimum: Duration) -> Duration {
    requested.min(server).max(minimum)
}

fn duration_ms(d: Duration) -> u32 {
    u32::try_from(d.as_millis()).unwrap_or(u32::MAX)
}

fn read_u32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_kind_conversion() {
        assert_eq!(FrameKind::try_from(0x03).unwrap(), FrameKind::Data);
        assert_eq!(FrameKind::try_from(0x05).unwrap(), FrameKind::Close);
        assert!(FrameKind::try_from(0x00).is_err());
        assert!(FrameKind::try_from(0xFF).is_err());
    }

    #[test]
    fn test_decoder_handles_split_input() {
        let mut wire = Vec::new();
        encode_frame(FrameKind::Data, b"hello", &mut wire).unwrap();
        encode_frame(FrameKind::Ping, &[], &mut wire).unwrap();

        let mut decoder = FrameDecoder::new(1024);
        decoder.push(&wire[..3]);
        assert_eq!(decoder.next_frame().unwrap(), None);

        decoder.push(&wire[3..8]);
        assert_eq!(decoder.next_frame().unwrap(), None);

        decoder.push(&wire[8..]);
        let first = decoder.next_frame().unwrap().unwrap();
        assert_eq!(first.kind, FrameKind::Data);
        assert_eq!(first.body, b"hello");

        let second = decoder.next_frame().unwrap().unwrap();
        assert_eq!(second.kind, FrameKind::Ping);
        assert!(second.body.is_empty());
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_decoder_rejects_oversized_frame() {
        let mut wire = Vec::new();
        encode_frame(FrameKind::Data, &[0u8; 64], &mut wire).unwrap();

        let mut decoder = FrameDecoder::new(16);
        decoder.push(&wire);
        assert!(matches!(
            decoder.next_frame(),
            Err(TransportError::Protocol(_))
        ));
    }

    #[test]
    fn test_decoder_rejects_zero_length() {
        let mut decoder = FrameDecoder::new(16);
        decoder.push(&[0, 0, 0, 0, 3]);
        assert!(decoder.next_frame().is_err());
    }

    #[test]
    fn test_connect_bodies() {
        let req = ConnectRequest {
            version: ProtocolVersion::CURRENT,
            ping_timeout: Duration::from_secs(30),
        };
        assert_eq!(ConnectRequest::from_bytes(&req.to_bytes()).unwrap(), req);

        let ack = ConnectAck {
            version: ProtocolVersion::CURRENT,
            ping_timeout: Duration::from_millis(1500),
            max_fragment_size: 6144,
        };
        assert_eq!(ConnectAck::from_bytes(&ack.to_bytes()).unwrap(), ack);
        assert!(ConnectAck::from_bytes(&[0u8; 3]).is_err());
    }

    #[test]
    fn test_negotiate_ping_timeout() {
        let s = Duration::from_secs;
        assert_eq!(negotiate_ping_timeout(s(30), s(60), s(1)), s(30));
        assert_eq!(negotiate_ping_timeout(s(90), s(60), s(1)), s(60));
        assert_eq!(
            negotiate_ping_timeout(Duration::from_millis(100), s(60), s(1)),
            s(1)
        );
    }
}
