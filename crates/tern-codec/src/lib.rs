//! # Tern Codec
//!
//! Message model and wire codec for the Tern connection reactor.
//!
//! This crate provides:
//! - The generic [`Msg`] carried on every channel (class, domain, stream, key, status, payload)
//! - Typed administrative messages ([`RdmMsg`]) for the login, directory and dictionary domains
//! - The [`Codec`] boundary used by the reactor, with a bincode-backed default implementation
//!
//! ## Layering
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         RdmMsg                                   │
//! │   (typed login / directory / dictionary messages)               │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                          Msg                                     │
//! │   (generic class/domain/stream envelope, opaque payload)        │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                         Codec                                    │
//! │   (version prefix + serialized envelope in a caller buffer)     │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod error;
pub mod msg;
pub mod rdm;

pub use codec::{BincodeCodec, Codec, Decoded, ProtocolVersion};
pub use error::CodecError;
pub use msg::{DataState, Domain, Msg, MsgClass, MsgKey, StreamState, StreamStatus};
pub use rdm::{
    DictionaryMsg, DictionaryRefresh, DictionaryRequest, DictionaryStatus, DictionaryType,
    DirectoryMsg, DirectoryRefresh, DirectoryRequest, DirectoryStatus, DirectoryUpdate, LoginMsg,
    LoginRefresh, LoginRequest, LoginRole, LoginStatus, RdmMsg, Service, ServiceInfo,
    ServiceState,
};

/// Name of the field-definitions dictionary most providers publish
pub const FIELD_DICTIONARY_NAME: &str = "RWFFld";

/// Name of the enumerated-types dictionary most providers publish
pub const ENUM_DICTIONARY_NAME: &str = "RWFEnum";
