//! Typed administrative domain messages.
//!
//! The login, source directory and dictionary domains have typed forms the
//! reactor uses to drive connection handshakes. Each typed message converts
//! to a generic [`Msg`] (its body serialized into the payload, its key and
//! status mirrored in the envelope) and back.

use crate::error::CodecError;
use crate::msg::{Domain, Msg, MsgClass, MsgKey, StreamStatus};
use crate::{ENUM_DICTIONARY_NAME, FIELD_DICTIONARY_NAME};
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;

/// Source directory filter flags
pub mod directory_filter {
    /// Service info (name, capabilities, dictionaries)
    pub const INFO: u32 = 0x01;
    /// Service state (up, accepting requests)
    pub const STATE: u32 = 0x02;
    /// Service groups
    pub const GROUP: u32 = 0x04;
    /// Load information
    pub const LOAD: u32 = 0x08;
    /// Every filter above
    pub const ALL: u32 = INFO | STATE | GROUP | LOAD;
}

/// Dictionary request verbosity
pub mod verbosity {
    /// Version information only
    pub const INFO: u32 = 0x00;
    /// Minimal content
    pub const MINIMAL: u32 = 0x03;
    /// Content without descriptions
    pub const NORMAL: u32 = 0x07;
    /// Full content
    pub const VERBOSE: u32 = 0x0F;
}

fn body<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    Ok(bincode::serialize(value)?)
}

fn parse<T: DeserializeOwned>(msg: &Msg) -> Result<T, CodecError> {
    if msg.payload.is_empty() {
        return Err(CodecError::Malformed(format!(
            "{:?} {:?} message has no body",
            msg.domain, msg.class
        )));
    }
    Ok(bincode::deserialize(&msg.payload)?)
}

fn unsupported(msg: &Msg) -> CodecError {
    CodecError::UnsupportedClass {
        domain: msg.domain,
        class: msg.class,
    }
}

// ============================================================================
// Login
// ============================================================================

/// Which side of the connection a login request comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoginRole {
    /// Consuming application
    Consumer,
    /// Publishing application
    Provider,
}

/// Login request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginRequest {
    /// Stream id of the login stream
    pub stream_id: i32,
    /// User name presented to the provider
    pub user_name: String,
    /// Application id
    pub application_id: String,
    /// Application name
    pub application_name: String,
    /// DACS position (`host/net`)
    pub position: String,
    /// Requesting role
    pub role: LoginRole,
}

impl LoginRequest {
    /// Consumer login request with stock application fields
    #[must_use]
    pub fn new(stream_id: i32, user_name: impl Into<String>) -> Self {
        Self {
            stream_id,
            user_name: user_name.into(),
            application_id: "256".to_string(),
            application_name: "tern".to_string(),
            position: "127.0.0.1/net".to_string(),
            role: LoginRole::Consumer,
        }
    }

    /// Set the requesting role
    #[must_use]
    pub fn with_role(mut self, role: LoginRole) -> Self {
        self.role = role;
        self
    }
}

/// Login refresh (accept)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginRefresh {
    /// Stream id of the login stream
    pub stream_id: i32,
    /// Accepted user name
    pub user_name: String,
    /// Stream status
    pub status: StreamStatus,
    /// Whether the refresh answers a request
    pub solicited: bool,
    /// Provider application name
    pub application_name: String,
}

impl LoginRefresh {
    /// Refresh accepting a login request
    #[must_use]
    pub fn accepting(request: &LoginRequest) -> Self {
        Self {
            stream_id: request.stream_id,
            user_name: request.user_name.clone(),
            status: StreamStatus::open_ok("Login accepted"),
            solicited: true,
            application_name: "tern".to_string(),
        }
    }
}

/// Login status
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginStatus {
    /// Stream id of the login stream
    pub stream_id: i32,
    /// New stream status
    pub status: Option<StreamStatus>,
    /// User name the status applies to
    pub user_name: Option<String>,
}

/// Login domain message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginMsg {
    /// Request
    Request(LoginRequest),
    /// Refresh
    Refresh(LoginRefresh),
    /// Status
    Status(LoginStatus),
    /// Close of the login stream
    Close {
        /// Stream being closed
        stream_id: i32,
    },
}

impl LoginMsg {
    /// Stream id
    #[must_use]
    pub fn stream_id(&self) -> i32 {
        match self {
            LoginMsg::Request(m) => m.stream_id,
            LoginMsg::Refresh(m) => m.stream_id,
            LoginMsg::Status(m) => m.stream_id,
            LoginMsg::Close { stream_id } => *stream_id,
        }
    }

    /// Stream status, if the message carries one
    #[must_use]
    pub fn status(&self) -> Option<&StreamStatus> {
        match self {
            LoginMsg::Refresh(m) => Some(&m.status),
            LoginMsg::Status(m) => m.status.as_ref(),
            _ => None,
        }
    }

    /// Convert to a generic message
    pub fn to_msg(&self) -> Result<Msg, CodecError> {
        let msg = match self {
            LoginMsg::Request(m) => Msg::new(MsgClass::Request, Domain::Login, m.stream_id)
                .with_key(MsgKey::named(&m.user_name))
                .with_payload(body(m)?),
            LoginMsg::Refresh(m) => Msg::new(MsgClass::Refresh, Domain::Login, m.stream_id)
                .with_key(MsgKey::named(&m.user_name))
                .with_status(m.status.clone())
                .with_payload(body(m)?),
            LoginMsg::Status(m) => {
                let mut msg =
                    Msg::new(MsgClass::Status, Domain::Login, m.stream_id).with_payload(body(m)?);
                msg.status = m.status.clone();
                msg
            }
            LoginMsg::Close { stream_id } => Msg::close(Domain::Login, *stream_id),
        };
        Ok(msg)
    }

    /// Convert from a generic login-domain message
    pub fn from_msg(msg: &Msg) -> Result<Self, CodecError> {
        if msg.domain != Domain::Login {
            return Err(CodecError::WrongDomain(msg.domain));
        }
        let typed = match msg.class {
            MsgClass::Request => {
                let mut m: LoginRequest = parse(msg)?;
                m.stream_id = msg.stream_id;
                LoginMsg::Request(m)
            }
            MsgClass::Refresh => {
                let mut m: LoginRefresh = parse(msg)?;
                m.stream_id = msg.stream_id;
                LoginMsg::Refresh(m)
            }
            MsgClass::Status => {
                let mut m: LoginStatus = parse(msg)?;
                m.stream_id = msg.stream_id;
                LoginMsg::Status(m)
            }
            MsgClass::Close => LoginMsg::Close {
                stream_id: msg.stream_id,
            },
            _ => return Err(unsupported(msg)),
        };
        Ok(typed)
    }
}

// ============================================================================
// Source directory
// ============================================================================

/// Source directory request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryRequest {
    /// Stream id of the directory stream
    pub stream_id: i32,
    /// Requested filters ([`directory_filter`])
    pub filter: u32,
    /// Restrict to one service
    pub service_id: Option<u16>,
    /// Keep the stream open for updates
    pub streaming: bool,
}

impl DirectoryRequest {
    /// Streaming request for info and state of every service
    #[must_use]
    pub fn new(stream_id: i32) -> Self {
        Self {
            stream_id,
            filter: directory_filter::INFO | directory_filter::STATE | directory_filter::GROUP,
            service_id: None,
            streaming: true,
        }
    }
}

/// Service info filter
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInfo {
    /// Service name
    pub service_name: String,
    /// Vendor name
    pub vendor: String,
    /// Domains the service supports
    pub capabilities: Vec<Domain>,
    /// Dictionaries downloadable from this service
    pub dictionaries_provided: Vec<String>,
    /// Dictionaries needed to decode this service's data
    pub dictionaries_used: Vec<String>,
}

/// Service state filter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceState {
    /// Service is up
    pub service_up: bool,
    /// Service takes new requests
    pub accepting_requests: bool,
}

/// One entry of a source directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    /// Service id
    pub service_id: u16,
    /// Info filter
    pub info: Option<ServiceInfo>,
    /// State filter
    pub state: Option<ServiceState>,
}

impl Service {
    /// Up, accepting service providing both stock dictionaries
    #[must_use]
    pub fn new(service_id: u16, service_name: impl Into<String>) -> Self {
        Self {
            service_id,
            info: Some(ServiceInfo {
                service_name: service_name.into(),
                vendor: "tern".to_string(),
                capabilities: vec![Domain::Dictionary, Domain::MarketPrice],
                dictionaries_provided: vec![
                    FIELD_DICTIONARY_NAME.to_string(),
                    ENUM_DICTIONARY_NAME.to_string(),
                ],
                dictionaries_used: vec![
                    FIELD_DICTIONARY_NAME.to_string(),
                    ENUM_DICTIONARY_NAME.to_string(),
                ],
            }),
            state: Some(ServiceState {
                service_up: true,
                accepting_requests: true,
            }),
        }
    }

    /// Service name from the info filter
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.info.as_ref().map(|i| i.service_name.as_str())
    }

    /// Dictionaries provided, empty when the info filter is absent
    #[must_use]
    pub fn dictionaries_provided(&self) -> &[String] {
        self.info
            .as_ref()
            .map_or(&[], |i| i.dictionaries_provided.as_slice())
    }
}

/// Source directory refresh
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryRefresh {
    /// Stream id of the directory stream
    pub stream_id: i32,
    /// Filters present
    pub filter: u32,
    /// Stream status
    pub status: StreamStatus,
    /// Whether the refresh answers a request
    pub solicited: bool,
    /// Services
    pub services: Vec<Service>,
}

impl DirectoryRefresh {
    /// Refresh answering a request
    #[must_use]
    pub fn answering(request: &DirectoryRequest, services: Vec<Service>) -> Self {
        Self {
            stream_id: request.stream_id,
            filter: request.filter,
            status: StreamStatus::open_ok("Source directory complete"),
            solicited: true,
            services,
        }
    }

    /// Unsolicited refresh published by a non-interactive provider
    #[must_use]
    pub fn publishing(stream_id: i32, services: Vec<Service>) -> Self {
        Self {
            stream_id,
            filter: directory_filter::INFO | directory_filter::STATE,
            status: StreamStatus::open_ok("Source directory"),
            solicited: false,
            services,
        }
    }

    /// First service listing at least one downloadable dictionary
    #[must_use]
    pub fn first_service_with_dictionaries(&self) -> Option<&Service> {
        self.services
            .iter()
            .find(|s| !s.dictionaries_provided().is_empty())
    }
}

/// Source directory update
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryUpdate {
    /// Stream id of the directory stream
    pub stream_id: i32,
    /// Filters present
    pub filter: u32,
    /// Changed services
    pub services: Vec<Service>,
}

/// Source directory status
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryStatus {
    /// Stream id of the directory stream
    pub stream_id: i32,
    /// New stream status
    pub status: Option<StreamStatus>,
}

/// Source directory domain message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectoryMsg {
    /// Request
    Request(DirectoryRequest),
    /// Refresh
    Refresh(DirectoryRefresh),
    /// Update
    Update(DirectoryUpdate),
    /// Status
    Status(DirectoryStatus),
    /// Close of the directory stream
    Close {
        /// Stream being closed
        stream_id: i32,
    },
}

impl DirectoryMsg {
    /// Stream id
    #[must_use]
    pub fn stream_id(&self) -> i32 {
        match self {
            DirectoryMsg::Request(m) => m.stream_id,
            DirectoryMsg::Refresh(m) => m.stream_id,
            DirectoryMsg::Update(m) => m.stream_id,
            DirectoryMsg::Status(m) => m.stream_id,
            DirectoryMsg::Close { stream_id } => *stream_id,
        }
    }

    /// Stream status, if the message carries one
    #[must_use]
    pub fn status(&self) -> Option<&StreamStatus> {
        match self {
            DirectoryMsg::Refresh(m) => Some(&m.status),
            DirectoryMsg::Status(m) => m.status.as_ref(),
            _ => None,
        }
    }

    /// Convert to a generic message
    pub fn to_msg(&self) -> Result<Msg, CodecError> {
        let msg = match self {
            DirectoryMsg::Request(m) => {
                let mut key = MsgKey::default().with_filter(m.filter);
                key.service_id = m.service_id;
                Msg::new(MsgClass::Request, Domain::Source, m.stream_id)
                    .with_key(key)
                    .with_payload(body(m)?)
            }
            DirectoryMsg::Refresh(m) => Msg::new(MsgClass::Refresh, Domain::Source, m.stream_id)
                .with_key(MsgKey::default().with_filter(m.filter))
                .with_status(m.status.clone())
                .with_payload(body(m)?),
            DirectoryMsg::Update(m) => Msg::new(MsgClass::Update, Domain::Source, m.stream_id)
                .with_key(MsgKey::default().with_filter(m.filter))
                .with_payload(body(m)?),
            DirectoryMsg::Status(m) => {
                let mut msg =
                    Msg::new(MsgClass::Status, Domain::Source, m.stream_id).with_payload(body(m)?);
                msg.status = m.status.clone();
                msg
            }
            DirectoryMsg::Close { stream_id } => Msg::close(Domain::Source, *stream_id),
        };
        Ok(msg)
    }

    /// Convert from a generic source-directory message
    pub fn from_msg(msg: &Msg) -> Result<Self, CodecError> {
        if msg.domain != Domain::Source {
            return Err(CodecError::WrongDomain(msg.domain));
        }
        let typed = match msg.class {
            MsgClass::Request => {
                let mut m: DirectoryRequest = parse(msg)?;
                m.stream_id = msg.stream_id;
                DirectoryMsg::Request(m)
            }
            MsgClass::Refresh => {
                let mut m: DirectoryRefresh = parse(msg)?;
                m.stream_id = msg.stream_id;
                DirectoryMsg::Refresh(m)
            }
            MsgClass::Update => {
                let mut m: DirectoryUpdate = parse(msg)?;
                m.stream_id = msg.stream_id;
                DirectoryMsg::Update(m)
            }
            MsgClass::Status => {
                let mut m: DirectoryStatus = parse(msg)?;
                m.stream_id = msg.stream_id;
                DirectoryMsg::Status(m)
            }
            MsgClass::Close => DirectoryMsg::Close {
                stream_id: msg.stream_id,
            },
            _ => return Err(unsupported(msg)),
        };
        Ok(typed)
    }
}

// ============================================================================
// Dictionary
// ============================================================================

/// Kind of dictionary content
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DictionaryType {
    /// Field definitions
    FieldDefinitions,
    /// Enumerated type tables
    EnumTables,
}

impl DictionaryType {
    /// Dictionary type for one of the stock dictionary names
    #[must_use]
    pub fn for_name(name: &str) -> Option<Self> {
        match name {
            FIELD_DICTIONARY_NAME => Some(DictionaryType::FieldDefinitions),
            ENUM_DICTIONARY_NAME => Some(DictionaryType::EnumTables),
            _ => None,
        }
    }
}

/// Dictionary request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DictionaryRequest {
    /// Stream id of the dictionary stream
    pub stream_id: i32,
    /// Service the dictionary is downloaded from
    pub service_id: u16,
    /// Dictionary name
    pub dictionary_name: String,
    /// Requested verbosity ([`verbosity`])
    pub verbosity: u32,
    /// Keep the stream open for updates
    pub streaming: bool,
}

impl DictionaryRequest {
    /// Normal-verbosity streaming request
    #[must_use]
    pub fn new(stream_id: i32, service_id: u16, dictionary_name: impl Into<String>) -> Self {
        Self {
            stream_id,
            service_id,
            dictionary_name: dictionary_name.into(),
            verbosity: verbosity::NORMAL,
            streaming: true,
        }
    }
}

/// Dictionary refresh (one part of the content)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DictionaryRefresh {
    /// Stream id of the dictionary stream
    pub stream_id: i32,
    /// Service the dictionary comes from
    pub service_id: u16,
    /// Dictionary name
    pub dictionary_name: String,
    /// Content kind
    pub dictionary_type: DictionaryType,
    /// Stream status
    pub status: StreamStatus,
    /// Whether the refresh answers a request
    pub solicited: bool,
    /// Final part of the content
    pub complete: bool,
    /// Encoded dictionary content
    pub content: Vec<u8>,
}

impl DictionaryRefresh {
    /// Complete single-part refresh answering a request
    #[must_use]
    pub fn answering(
        request: &DictionaryRequest,
        dictionary_type: DictionaryType,
        content: Vec<u8>,
    ) -> Self {
        Self {
            stream_id: request.stream_id,
            service_id: request.service_id,
            dictionary_name: request.dictionary_name.clone(),
            dictionary_type,
            status: StreamStatus::open_ok("Dictionary complete"),
            solicited: true,
            complete: true,
            content,
        }
    }
}

/// Dictionary status
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DictionaryStatus {
    /// Stream id of the dictionary stream
    pub stream_id: i32,
    /// New stream status
    pub status: Option<StreamStatus>,
}

/// Dictionary domain message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DictionaryMsg {
    /// Request
    Request(DictionaryRequest),
    /// Refresh
    Refresh(DictionaryRefresh),
    /// Status
    Status(DictionaryStatus),
    /// Close of a dictionary stream
    Close {
        /// Stream being closed
        stream_id: i32,
    },
}

impl DictionaryMsg {
    /// Stream id
    #[must_use]
    pub fn stream_id(&self) -> i32 {
        match self {
            DictionaryMsg::Request(m) => m.stream_id,
            DictionaryMsg::Refresh(m) => m.stream_id,
            DictionaryMsg::Status(m) => m.stream_id,
            DictionaryMsg::Close { stream_id } => *stream_id,
        }
    }

    /// Convert to a generic message
    pub fn to_msg(&self) -> Result<Msg, CodecError> {
        let msg = match self {
            DictionaryMsg::Request(m) => {
                Msg::new(MsgClass::Request, Domain::Dictionary, m.stream_id)
                    .with_key(
                        MsgKey::named(&m.dictionary_name)
                            .with_service(m.service_id)
                            .with_filter(m.verbosity),
                    )
                    .with_payload(body(m)?)
            }
            DictionaryMsg::Refresh(m) => {
                let mut msg = Msg::new(MsgClass::Refresh, Domain::Dictionary, m.stream_id)
                    .with_key(MsgKey::named(&m.dictionary_name).with_service(m.service_id))
                    .with_status(m.status.clone())
                    .with_payload(body(m)?);
                msg.complete = m.complete;
                msg
            }
            DictionaryMsg::Status(m) => {
                let mut msg = Msg::new(MsgClass::Status, Domain::Dictionary, m.stream_id)
                    .with_payload(body(m)?);
                msg.status = m.status.clone();
                msg
            }
            DictionaryMsg::Close { stream_id } => Msg::close(Domain::Dictionary, *stream_id),
        };
        Ok(msg)
    }

    /// Convert from a generic dictionary-domain message
    pub fn from_msg(msg: &Msg) -> Result<Self, CodecError> {
        if msg.domain != Domain::Dictionary {
            return Err(CodecError::WrongDomain(msg.domain));
        }
        let typed = match msg.class {
            MsgClass::Request => {
                let mut m: DictionaryRequest = parse(msg)?;
                m.stream_id = msg.stream_id;
                DictionaryMsg::Request(m)
            }
            MsgClass::Refresh => {
                let mut m: DictionaryRefresh = parse(msg)?;
                m.stream_id = msg.stream_id;
                DictionaryMsg::Refresh(m)
            }
            MsgClass::Status => {
                let mut m: DictionaryStatus = parse(msg)?;
                m.stream_id = msg.stream_id;
                DictionaryMsg::Status(m)
            }
            MsgClass::Close => DictionaryMsg::Close {
                stream_id: msg.stream_id,
            },
            _ => return Err(unsupported(msg)),
        };
        Ok(typed)
    }
}

// ============================================================================
// Any administrative domain
// ============================================================================

/// Typed message from one of the administrative domains
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RdmMsg {
    /// Login domain
    Login(LoginMsg),
    /// Source directory domain
    Directory(DirectoryMsg),
    /// Dictionary domain
    Dictionary(DictionaryMsg),
}

impl RdmMsg {
    /// Stream id
    #[must_use]
    pub fn stream_id(&self) -> i32 {
        match self {
            RdmMsg::Login(m) => m.stream_id(),
            RdmMsg::Directory(m) => m.stream_id(),
            RdmMsg::Dictionary(m) => m.stream_id(),
        }
    }

    /// Domain of the message
    #[must_use]
    pub fn domain(&self) -> Domain {
        match self {
            RdmMsg::Login(_) => Domain::Login,
            RdmMsg::Directory(_) => Domain::Source,
            RdmMsg::Dictionary(_) => Domain::Dictionary,
        }
    }

    /// Convert to a generic message
    pub fn to_msg(&self) -> Result<Msg, CodecError> {
        match self {
            RdmMsg::Login(m) => m.to_msg(),
            RdmMsg::Directory(m) => m.to_msg(),
            RdmMsg::Dictionary(m) => m.to_msg(),
        }
    }

    /// Convert from a generic message of any administrative domain
    pub fn from_msg(msg: &Msg) -> Result<Self, CodecError> {
        match msg.domain {
            Domain::Login => LoginMsg::from_msg(msg).map(RdmMsg::Login),
            Domain::Source => DirectoryMsg::from_msg(msg).map(RdmMsg::Directory),
            Domain::Dictionary => DictionaryMsg::from_msg(msg).map(RdmMsg::Dictionary),
            other => Err(CodecError::WrongDomain(other)),
        }
    }
}

impl From<LoginMsg> for RdmMsg {
    fn from(msg: LoginMsg) -> Self {
        RdmMsg::Login(msg)
    }
}

impl From<DirectoryMsg> for RdmMsg {
    fn from(msg: DirectoryMsg) -> Self {
        RdmMsg::Directory(msg)
    }
}

impl From<DictionaryMsg> for RdmMsg {
    fn from(msg: DictionaryMsg) -> Self {
        RdmMsg::Dictionary(msg)
    }
}
