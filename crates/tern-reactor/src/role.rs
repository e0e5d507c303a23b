//! Per-connection roles.
//!
//! A [`Role`] declares which automatic handshakes the reactor performs on a
//! channel and which callbacks receive which events. Every role needs a
//! default message callback and a channel event callback; the typed
//! callbacks are optional, and a message with no typed callback (or whose
//! typed callback returns [`CallbackReturn::Raise`]) goes to the default one.
//!
//! | kind | connects | accepts | automatic handshake |
//! |------|----------|---------|---------------------|
//! | consumer | yes | no | login, directory, dictionary download |
//! | provider | no | yes | none |
//! | non-interactive provider | yes | no | login, directory publish |

use crate::error::{ReactorError, Result};
use crate::event::{ChannelEvent, MsgEvent, RdmMsgEvent};
use crate::reactor::Reactor;
use std::sync::Arc;
use tern_codec::{DictionaryMsg, DirectoryMsg, DirectoryRefresh, DirectoryRequest, LoginMsg, LoginRequest};

/// What a callback did with an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackReturn {
    /// Handled
    Success,
    /// Not handled here; deliver to the default message callback
    Raise,
}

/// Receives lifecycle events
pub type ChannelEventCallback =
    Arc<dyn Fn(&Reactor, &ChannelEvent) -> CallbackReturn + Send + Sync>;
/// Receives messages no typed callback took
pub type DefaultMsgCallback = Arc<dyn Fn(&Reactor, &MsgEvent) -> CallbackReturn + Send + Sync>;
/// Receives login-domain messages
pub type LoginMsgCallback =
    Arc<dyn Fn(&Reactor, &RdmMsgEvent<LoginMsg>) -> CallbackReturn + Send + Sync>;
/// Receives source-directory messages
pub type DirectoryMsgCallback =
    Arc<dyn Fn(&Reactor, &RdmMsgEvent<DirectoryMsg>) -> CallbackReturn + Send + Sync>;
/// Receives dictionary-domain messages
pub type DictionaryMsgCallback =
    Arc<dyn Fn(&Reactor, &RdmMsgEvent<DictionaryMsg>) -> CallbackReturn + Send + Sync>;

/// Which dictionaries a consumer downloads during its handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DictionaryDownloadMode {
    /// No download
    #[default]
    None,
    /// Every dictionary of the first service that lists any
    FirstAvailable,
}

/// Typed callback slots of a role kind
pub trait RoleHandlers {
    /// Login-domain callback
    fn login_callback(&self) -> Option<&LoginMsgCallback> {
        None
    }

    /// Source-directory callback
    fn directory_callback(&self) -> Option<&DirectoryMsgCallback> {
        None
    }

    /// Dictionary-domain callback
    fn dictionary_callback(&self) -> Option<&DictionaryMsgCallback> {
        None
    }
}

/// Consumer role
#[derive(Clone, Default)]
pub struct ConsumerRole {
    /// Login request sent when the channel comes up
    pub login_request: Option<LoginRequest>,
    /// Directory request sent after login; requires `login_request`
    pub directory_request: Option<DirectoryRequest>,
    /// Dictionary download after the directory; `FirstAvailable` requires both requests
    pub dictionary_download_mode: DictionaryDownloadMode,
    /// Login-domain callback
    pub login_callback: Option<LoginMsgCallback>,
    /// Source-directory callback
    pub directory_callback: Option<DirectoryMsgCallback>,
    /// Dictionary-domain callback
    pub dictionary_callback: Option<DictionaryMsgCallback>,
}

impl ConsumerRole {
    /// Send `request` when the channel comes up
    #[must_use]
    pub fn with_login_request(mut self, request: LoginRequest) -> Self {
        self.login_request = Some(request);
        self
    }

    /// Send `request` after login completes
    #[must_use]
    pub fn with_directory_request(mut self, request: DirectoryRequest) -> Self {
        self.directory_request = Some(request);
        self
    }

    /// Download dictionaries after the directory arrives
    #[must_use]
    pub fn with_dictionary_download(mut self, mode: DictionaryDownloadMode) -> Self {
        self.dictionary_download_mode = mode;
        self
    }

    /// Register a login-domain callback
    #[must_use]
    pub fn on_login<F>(mut self, f: F) -> Self
    where
        F: Fn(&Reactor, &RdmMsgEvent<LoginMsg>) -> CallbackReturn + Send + Sync + 'static,
    {
        self.login_callback = Some(Arc::new(f));
        self
    }

    /// Register a source-directory callback
    #[must_use]
    pub fn on_directory<F>(mut self, f: F) -> Self
    where
        F: Fn(&Reactor, &RdmMsgEvent<DirectoryMsg>) -> CallbackReturn + Send + Sync + 'static,
    {
        self.directory_callback = Some(Arc::new(f));
        self
    }

    /// Register a dictionary-domain callback
    #[must_use]
    pub fn on_dictionary<F>(mut self, f: F) -> Self
    where
        F: Fn(&Reactor, &RdmMsgEvent<DictionaryMsg>) -> CallbackReturn + Send + Sync + 'static,
    {
        self.dictionary_callback = Some(Arc::new(f));
        self
    }

    fn validate(&self) -> Result<()> {
        if self.directory_request.is_some() && self.login_request.is_none() {
            return Err(ReactorError::invalid(
                "directory request requires a login request",
            ));
        }
        if self.dictionary_download_mode == DictionaryDownloadMode::FirstAvailable
            && (self.login_request.is_none() || self.directory_request.is_none())
        {
            return Err(ReactorError::invalid(
                "dictionary download requires login and directory requests",
            ));
        }

        let login = self.login_request.as_ref().map(|r| r.stream_id);
        let directory = self.directory_request.as_ref().map(|r| r.stream_id);
        check_stream_ids(login, directory)
    }
}

impl RoleHandlers for ConsumerRole {
    fn login_callback(&self) -> Option<&LoginMsgCallback> {
        self.login_callback.as_ref()
    }

    fn directory_callback(&self) -> Option<&DirectoryMsgCallback> {
        self.directory_callback.as_ref()
    }

    fn dictionary_callback(&self) -> Option<&DictionaryMsgCallback> {
        self.dictionary_callback.as_ref()
    }
}

/// Interactive provider role
#[derive(Clone, Default)]
pub struct ProviderRole {
    /// Login-domain callback
    pub login_callback: Option<LoginMsgCallback>,
    /// Source-directory callback
    pub directory_callback: Option<DirectoryMsgCallback>,
    /// Dictionary-domain callback
    pub dictionary_callback: Option<DictionaryMsgCallback>,
}

impl ProviderRole {
    /// Register a login-domain callback
    #[must_use]
    pub fn on_login<F>(mut self, f: F) -> Self
    where
        F: Fn(&Reactor, &RdmMsgEvent<LoginMsg>) -> CallbackReturn + Send + Sync + 'static,
    {
        self.login_callback = Some(Arc::new(f));
        self
    }

    /// Register a source-directory callback
    #[must_use]
    pub fn on_directory<F>(mut self, f: F) -> Self
    where
        F: Fn(&Reactor, &RdmMsgEvent<DirectoryMsg>) -> CallbackReturn + Send + Sync + 'static,
    {
        self.directory_callback = Some(Arc::new(f));
        self
    }

    /// Register a dictionary-domain callback
    #[must_use]
    pub fn on_dictionary<F>(mut self, f: F) -> Self
    where
        F: Fn(&Reactor, &RdmMsgEvent<DictionaryMsg>) -> CallbackReturn + Send + Sync + 'static,
    {
        self.dictionary_callback = Some(Arc::new(f));
        self
    }
}

impl RoleHandlers for ProviderRole {
    fn login_callback(&self) -> Option<&LoginMsgCallback> {
        self.login_callback.as_ref()
    }

    fn directory_callback(&self) -> Option<&DirectoryMsgCallback> {
        self.directory_callback.as_ref()
    }

    fn dictionary_callback(&self) -> Option<&DictionaryMsgCallback> {
        self.dictionary_callback.as_ref()
    }
}

/// Non-interactive provider role
#[derive(Clone, Default)]
pub struct NiProviderRole {
    /// Login request sent when the channel comes up
    pub login_request: Option<LoginRequest>,
    /// Directory published after login; requires `login_request`
    pub directory_refresh: Option<DirectoryRefresh>,
    /// Login-domain callback
    pub login_callback: Option<LoginMsgCallback>,
}

impl NiProviderRole {
    /// Send `request` when the channel comes up
    #[must_use]
    pub fn with_login_request(mut self, request: LoginRequest) -> Self {
        self.login_request = Some(request);
        self
    }

    /// Publish `refresh` after login completes
    #[must_use]
    pub fn with_directory_refresh(mut self, refresh: DirectoryRefresh) -> Self {
        self.directory_refresh = Some(refresh);
        self
    }

    /// Register a login-domain callback
    #[must_use]
    pub fn on_login<F>(mut self, f: F) -> Self
    where
        F: Fn(&Reactor, &RdmMsgEvent<LoginMsg>) -> CallbackReturn + Send + Sync + 'static,
    {
        self.login_callback = Some(Arc::new(f));
        self
    }

    fn validate(&self) -> Result<()> {
        if self.directory_refresh.is_some() && self.login_request.is_none() {
            return Err(ReactorError::invalid(
                "directory refresh requires a login request",
            ));
        }

        // Published streams conventionally use negative ids.
        let login = self.login_request.as_ref().map(|r| r.stream_id);
        let directory = self.directory_refresh.as_ref().map(|r| r.stream_id);
        if directory == Some(0) {
            return Err(ReactorError::invalid("directory stream id must be non-zero"));
        }
        check_stream_ids(login, directory.filter(|id| *id > 0))
    }
}

impl RoleHandlers for NiProviderRole {
    fn login_callback(&self) -> Option<&LoginMsgCallback> {
        self.login_callback.as_ref()
    }
}

/// Role kind with its kind-specific settings
#[derive(Clone)]
pub enum RoleKind {
    /// Consumer
    Consumer(ConsumerRole),
    /// Interactive provider
    Provider(ProviderRole),
    /// Non-interactive provider
    NonInteractiveProvider(NiProviderRole),
}

/// Configuration of one connection's handshakes and callbacks
#[derive(Clone)]
pub struct Role {
    /// Receives messages no typed callback took; required
    pub default_msg_callback: Option<DefaultMsgCallback>,
    /// Receives lifecycle events; required
    pub channel_event_callback: Option<ChannelEventCallback>,
    /// Kind-specific settings
    pub kind: RoleKind,
}

impl Role {
    /// Consumer role without callbacks
    #[must_use]
    pub fn consumer(role: ConsumerRole) -> Self {
        Self::with_kind(RoleKind::Consumer(role))
    }

    /// Provider role without callbacks
    #[must_use]
    pub fn provider(role: ProviderRole) -> Self {
        Self::with_kind(RoleKind::Provider(role))
    }

    /// Non-interactive provider role without callbacks
    #[must_use]
    pub fn ni_provider(role: NiProviderRole) -> Self {
        Self::with_kind(RoleKind::NonInteractiveProvider(role))
    }

    fn with_kind(kind: RoleKind) -> Self {
        Self {
            default_msg_callback: None,
            channel_event_callback: None,
            kind,
        }
    }

    /// Register the default message callback
    #[must_use]
    pub fn on_default_msg<F>(mut self, f: F) -> Self
    where
        F: Fn(&Reactor, &MsgEvent) -> CallbackReturn + Send + Sync + 'static,
    {
        self.default_msg_callback = Some(Arc::new(f));
        self
    }

    /// Register the channel event callback
    #[must_use]
    pub fn on_channel_event<F>(mut self, f: F) -> Self
    where
        F: Fn(&Reactor, &ChannelEvent) -> CallbackReturn + Send + Sync + 'static,
    {
        self.channel_event_callback = Some(Arc::new(f));
        self
    }

    /// Typed callback slots
    #[must_use]
    pub fn handlers(&self) -> &dyn RoleHandlers {
        match &self.kind {
            RoleKind::Consumer(r) => r,
            RoleKind::Provider(r) => r,
            RoleKind::NonInteractiveProvider(r) => r,
        }
    }

    /// Human-readable kind name
    #[must_use]
    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            RoleKind::Consumer(_) => "consumer",
            RoleKind::Provider(_) => "provider",
            RoleKind::NonInteractiveProvider(_) => "non-interactive provider",
        }
    }

    /// Check the role's invariants
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if a required callback is missing or a
    /// handshake depends on one the role does not configure.
    pub fn validate(&self) -> Result<()> {
        if self.default_msg_callback.is_none() {
            return Err(ReactorError::invalid("default message callback is required"));
        }
        if self.channel_event_callback.is_none() {
            return Err(ReactorError::invalid("channel event callback is required"));
        }
        match &self.kind {
            RoleKind::Consumer(r) => r.validate(),
            RoleKind::Provider(_) => Ok(()),
            RoleKind::NonInteractiveProvider(r) => r.validate(),
        }
    }

    /// Check the role can initiate a connection
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for provider roles or an invalid role.
    pub fn validate_for_connect(&self) -> Result<()> {
        if matches!(self.kind, RoleKind::Provider(_)) {
            return Err(ReactorError::invalid("a provider role cannot connect"));
        }
        self.validate()
    }

    /// Check the role can accept a connection
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for non-provider roles or an invalid role.
    pub fn validate_for_accept(&self) -> Result<()> {
        if !matches!(self.kind, RoleKind::Provider(_)) {
            return Err(ReactorError::invalid(format!(
                "a {} role cannot accept",
                self.kind_name()
            )));
        }
        self.validate()
    }
}

fn check_stream_ids(login: Option<i32>, directory: Option<i32>) -> Result<()> {
    if login.is_some_and(|id| id <= 0) || directory.is_some_and(|id| id <= 0) {
        return Err(ReactorError::invalid(
            "handshake stream ids must be positive",
        ));
    }
    if login.is_some() && login == directory {
        return Err(ReactorError::invalid(
            "login and directory streams must differ",
        ));
    }
    Ok(())
}
