//! Codec boundary between messages and channel buffers.

use crate::error::CodecError;
use crate::msg::Msg;
use std::fmt;

/// Bytes of version prefix written before every encoded message
pub const VERSION_PREFIX_LEN: usize = 2;

/// Wire protocol version negotiated per channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProtocolVersion {
    /// Major version; must match for two sides to interoperate
    pub major: u8,
    /// Minor version; informational
    pub minor: u8,
}

impl ProtocolVersion {
    /// Version spoken by this build
    pub const CURRENT: Self = Self { major: 14, minor: 1 };

    /// Create a version
    #[must_use]
    pub const fn new(major: u8, minor: u8) -> Self {
        Self { major, minor }
    }

    /// Whether a peer speaking `other` can interoperate
    #[must_use]
    pub fn is_compatible(self, other: Self) -> bool {
        self.major == other.major
    }
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        Self::CURRENT
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Result of a successful decode
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// A complete message
    Msg(Msg),
    /// An empty buffer; nothing to deliver
    Blank,
}

/// Encoder/decoder used by the reactor for every message it sends or receives.
///
/// Implementations must be stateless with respect to channels: the reactor
/// shares one codec across all of its sessions and worker thread.
pub trait Codec: Send + Sync {
    /// Encode `msg` into `buf`, returning the number of bytes written.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::BufferTooSmall`] carrying the required size when
    /// `buf` is too short; the caller may retry with a larger buffer.
    fn encode(&self, msg: &Msg, version: ProtocolVersion, buf: &mut [u8])
    -> Result<usize, CodecError>;

    /// Decode one message from `buf`.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Incomplete`] for truncated input,
    /// [`CodecError::VersionMismatch`] for an incompatible major version and
    /// [`CodecError::Malformed`] otherwise.
    fn decode(&self, buf: &[u8], version: ProtocolVersion) -> Result<Decoded, CodecError>;

    /// Number of bytes `encode` needs for `msg`.
    ///
    /// # Errors
    ///
    /// Returns an error if the message cannot be encoded at all.
    fn encoded_len(&self, msg: &Msg, version: ProtocolVersion) -> Result<usize, CodecError>;
}

/// Default codec: version prefix followed by the bincode-serialized envelope
#[derive(Debug, Clone, Copy, Default)]
pub struct BincodeCodec;

impl Codec for BincodeCodec {
    fn encode(
        &self,
        msg: &Msg,
        version: ProtocolVersion,
        buf: &mut [u8],
    ) -> Result<usize, CodecError> {
        let needed = self.encoded_len(msg, version)?;
        if buf.len() < needed {
            return Err(CodecError::BufferTooSmall {
                needed,
                available: buf.len(),
            });
        }

        buf[0] = version.major;
        buf[1] = version.minor;
        bincode::serialize_into(&mut buf[VERSION_PREFIX_LEN..needed], msg)?;
        Ok(needed)
    }

    fn decode(&self, buf: &[u8], version: ProtocolVersion) -> Result<Decoded, CodecError> {
        if buf.is_empty() {
            return Ok(Decoded::Blank);
        }
        if buf.len() < VERSION_PREFIX_LEN {
            return Err(CodecError::Incomplete);
        }
        if buf[0] != version.major {
            return Err(CodecError::VersionMismatch {
                expected: version.major,
                actual: buf[0],
            });
        }

        let msg: Msg = bincode::deserialize(&buf[VERSION_PREFIX_LEN..])?;
        Ok(Decoded::Msg(msg))
    }

    fn encoded_len(&self, msg: &Msg, _version: ProtocolVersion) -> Result<usize, CodecError> {
        let body = bincode::serialized_size(msg)?;
        let body = usize::try_from(body)
            .map_err(|_| CodecError::Malformed("message size exceeds address space".into()))?;
        Ok(VERSION_PREFIX_LEN + body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msg::{Domain, MsgClass, MsgKey, StreamStatus};

    fn sample() -> Msg {
        Msg::new(MsgClass::Refresh, Domain::MarketPrice, 5)
            .with_key(MsgKey::named("TRI.N").with_service(1))
            .with_status(StreamStatus::open_ok("ok"))
            .with_payload(vec![0xAB; 32])
    }

    #[test]
    fn test_encode_decode() {
        let codec = BincodeCodec;
        let msg = sample();
        let mut buf = vec![0u8; 256];

        let len = codec.encode(&msg, ProtocolVersion::CURRENT, &mut buf).unwrap();
        assert_eq!(buf[0], ProtocolVersion::CURRENT.major);

        let decoded = codec.decode(&buf[..len], ProtocolVersion::CURRENT).unwrap();
        assert_eq!(decoded, Decoded::Msg(msg));
    }

    #[test]
    fn test_buffer_too_small_reports_needed() {
        let codec = BincodeCodec;
        let msg = sample();
        let needed = codec.encoded_len(&msg, ProtocolVersion::CURRENT).unwrap();
        let mut buf = vec![0u8; 8];

        let err = codec
            .encode(&msg, ProtocolVersion::CURRENT, &mut buf)
            .unwrap_err();
        assert_eq!(
            err,
            CodecError::BufferTooSmall {
                needed,
                available: 8
            }
        );

        let mut big = vec![0u8; needed];
        assert_eq!(
            codec.encode(&msg, ProtocolVersion::CURRENT, &mut big).unwrap(),
            needed
        );
    }

    #[test]
    fn test_blank_and_incomplete() {
        let codec = BincodeCodec;
        assert_eq!(
            codec.decode(&[], ProtocolVersion::CURRENT).unwrap(),
            Decoded::Blank
        );
        assert_eq!(
            codec.decode(&[14], ProtocolVersion::CURRENT),
            Err(CodecError::Incomplete)
        );

        let mut buf = vec![0u8; 256];
        let len = codec
            .encode(&sample(), ProtocolVersion::CURRENT, &mut buf)
            .unwrap();
        assert_eq!(
            codec.decode(&buf[..len - 4], ProtocolVersion::CURRENT),
            Err(CodecError::Incomplete)
        );
    }

    #[test]
    fn test_version_mismatch() {
        let codec = BincodeCodec;
        let mut buf = vec![0u8; 256];
        let len = codec
            .encode(&sample(), ProtocolVersion::new(13, 0), &mut buf)
            .unwrap();

        assert_eq!(
            codec.decode(&buf[..len], ProtocolVersion::CURRENT),
            Err(CodecError::VersionMismatch {
                expected: 14,
                actual: 13
            })
        );
    }

    #[test]
    fn test_minor_version_ignored() {
        let codec = BincodeCodec;
        let mut buf = vec![0u8; 256];
        let len = codec
            .encode(&sample(), ProtocolVersion::new(14, 0), &mut buf)
            .unwrap();
        assert!(codec.decode(&buf[..len], ProtocolVersion::CURRENT).is_ok());
        assert!(ProtocolVersion::new(14, 0).is_compatible(ProtocolVersion::CURRENT));
        assert_eq!(ProtocolVersion::CURRENT.to_string(), "14.1");
    }
}
