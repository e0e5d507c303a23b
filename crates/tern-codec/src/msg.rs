//! Generic message envelope.
//!
//! Every frame on a Tern channel carries exactly one [`Msg`]. The envelope
//! identifies the message class and domain, the stream it belongs to, and
//! optionally a key and stream status. The payload is opaque at this layer;
//! the typed administrative domains in [`crate::rdm`] store their bodies in it.

use serde::{Deserialize, Serialize};

/// Message class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MsgClass {
    /// Open or reissue a stream
    Request,
    /// Full image of a stream
    Refresh,
    /// State change without data
    Status,
    /// Incremental change
    Update,
    /// Close a stream
    Close,
    /// Bidirectional message outside the request/response model
    Generic,
    /// Contribution toward a provider
    Post,
    /// Acknowledgement of a post
    Ack,
}

/// Message domain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Domain {
    /// Login (administrative)
    Login,
    /// Source directory (administrative)
    Source,
    /// Dictionary download (administrative)
    Dictionary,
    /// Level 1 market price
    MarketPrice,
    /// Order book
    MarketByOrder,
    /// Any other domain, by number
    Other(u8),
}

impl Domain {
    /// Numeric domain identifier
    #[must_use]
    pub fn as_u8(self) -> u8 {
        match self {
            Domain::Login => 1,
            Domain::Source => 4,
            Domain::Dictionary => 5,
            Domain::MarketPrice => 6,
            Domain::MarketByOrder => 7,
            Domain::Other(n) => n,
        }
    }

    /// Domain from its numeric identifier
    #[must_use]
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => Domain::Login,
            4 => Domain::Source,
            5 => Domain::Dictionary,
            6 => Domain::MarketPrice,
            7 => Domain::MarketByOrder,
            n => Domain::Other(n),
        }
    }

    /// Whether the domain is one the reactor may handle on the
    /// application's behalf
    #[must_use]
    pub fn is_administrative(self) -> bool {
        matches!(self, Domain::Login | Domain::Source | Domain::Dictionary)
    }
}

/// Stream state carried in a [`StreamStatus`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamState {
    /// Stream is open and will receive updates
    Open,
    /// Stream delivered a snapshot and will not update
    NonStreaming,
    /// Stream closed; a new request may succeed
    ClosedRecover,
    /// Stream closed permanently
    Closed,
    /// Stream moved to another key
    Redirected,
}

/// Data state carried in a [`StreamStatus`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataState {
    /// Data state unchanged
    NoChange,
    /// Data is current
    Ok,
    /// Data may be stale
    Suspect,
}

/// Stream and data state with explanatory text
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamStatus {
    /// Stream state
    pub stream: StreamState,
    /// Data state
    pub data: DataState,
    /// Free-form status text
    pub text: String,
}

impl StreamStatus {
    /// Open stream with good data
    #[must_use]
    pub fn open_ok(text: impl Into<String>) -> Self {
        Self {
            stream: StreamState::Open,
            data: DataState::Ok,
            text: text.into(),
        }
    }

    /// Open stream with suspect data
    #[must_use]
    pub fn open_suspect(text: impl Into<String>) -> Self {
        Self {
            stream: StreamState::Open,
            data: DataState::Suspect,
            text: text.into(),
        }
    }

    /// Permanently closed stream
    #[must_use]
    pub fn closed(text: impl Into<String>) -> Self {
        Self {
            stream: StreamState::Closed,
            data: DataState::Suspect,
            text: text.into(),
        }
    }

    /// True for `Closed` and `ClosedRecover`
    #[must_use]
    pub fn is_closed(&self) -> bool {
        matches!(self.stream, StreamState::Closed | StreamState::ClosedRecover)
    }
}

/// Message key
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgKey {
    /// Item or user name
    pub name: Option<String>,
    /// Service the item belongs to
    pub service_id: Option<u16>,
    /// Filter bitmap (directory filters, dictionary verbosity)
    pub filter: u32,
}

impl MsgKey {
    /// Key with only a name
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    /// Set the service id
    #[must_use]
    pub fn with_service(mut self, service_id: u16) -> Self {
        self.service_id = Some(service_id);
        self
    }

    /// Set the filter bitmap
    #[must_use]
    pub fn with_filter(mut self, filter: u32) -> Self {
        self.filter = filter;
        self
    }
}

/// Generic message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Msg {
    /// Message class
    pub class: MsgClass,
    /// Message domain
    pub domain: Domain,
    /// Stream the message belongs to
    pub stream_id: i32,
    /// Optional key
    pub key: Option<MsgKey>,
    /// Optional stream status
    pub status: Option<StreamStatus>,
    /// Final part of a multi-part refresh
    pub complete: bool,
    /// Opaque body
    pub payload: Vec<u8>,
}

impl Msg {
    /// Create an empty, complete message
    #[must_use]
    pub fn new(class: MsgClass, domain: Domain, stream_id: i32) -> Self {
        Self {
            class,
            domain,
            stream_id,
            key: None,
            status: None,
            complete: true,
            payload: Vec::new(),
        }
    }

    /// Close message for a stream
    #[must_use]
    pub fn close(domain: Domain, stream_id: i32) -> Self {
        Self::new(MsgClass::Close, domain, stream_id)
    }

    /// Attach a key
    #[must_use]
    pub fn with_key(mut self, key: MsgKey) -> Self {
        self.key = Some(key);
        self
    }

    /// Attach a stream status
    #[must_use]
    pub fn with_status(mut self, status: StreamStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Attach a payload
    #[must_use]
    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    /// Mark as a non-final part
    #[must_use]
    pub fn partial(mut self) -> Self {
        self.complete = false;
        self
    }

    /// Key name, if any
    #[must_use]
    pub fn key_name(&self) -> Option<&str> {
        self.key.as_ref().and_then(|k| k.name.as_deref())
    }
}
