//! Error types for the Tern codec.

use crate::msg::{Domain, MsgClass};
use thiserror::Error;

/// Codec errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// The caller's buffer cannot hold the encoded message
    #[error("buffer too small: need {needed} bytes, have {available}")]
    BufferTooSmall {
        /// Bytes required to encode the message
        needed: usize,
        /// Bytes the caller provided
        available: usize,
    },

    /// The input ends before a complete message could be decoded
    #[error("incomplete message")]
    Incomplete,

    /// The encoded major version differs from the channel's
    #[error("protocol version mismatch: expected major {expected}, got {actual}")]
    VersionMismatch {
        /// Major version negotiated on the channel
        expected: u8,
        /// Major version found in the buffer
        actual: u8,
    },

    /// The message body could not be interpreted
    #[error("malformed message: {0}")]
    Malformed(String),

    /// A typed conversion was attempted on a message from a domain it does not cover
    #[error("no typed form for {0:?} domain messages")]
    WrongDomain(Domain),

    /// The message class has no typed representation in its domain
    #[error("unsupported {class:?} message in {domain:?} domain")]
    UnsupportedClass {
        /// Domain of the message
        domain: Domain,
        /// Class of the message
        class: MsgClass,
    },
}

impl From<bincode::Error> for CodecError {
    fn from(err: bincode::Error) -> Self {
        match *err {
            bincode::ErrorKind::Io(ref io) if io.kind() == std::io::ErrorKind::UnexpectedEof => {
                CodecError::Incomplete
            }
            other => CodecError::Malformed(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unexpected_eof_maps_to_incomplete() {
        let io = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "short");
        let err: CodecError = Box::new(bincode::ErrorKind::Io(io)).into();
        assert_eq!(err, CodecError::Incomplete);
    }

    #[test]
    fn test_error_display() {
        let err = CodecError::BufferTooSmall {
            needed: 10,
            available: 4,
        };
        assert_eq!(err.to_string(), "buffer too small: need 10 bytes, have 4");
    }
}
