//! Connect and accept options.
//!
//! The reactor clones the options it is given, so the caller may reuse or
//! drop its copy as soon as `connect`/`accept` returns. Strings are copied;
//! the `user_spec` handle is shared, so events hand back the caller's own
//! object.

use crate::error::{ReactorError, Result};
use std::any::Any;
use std::sync::Arc;
use std::time::Duration;
use tern_codec::ProtocolVersion;
use tern_transport::ConnectInfo;

/// Opaque application value attached to a channel
pub type UserSpec = Arc<dyn Any + Send + Sync>;

/// Outbound connection options
#[derive(Clone)]
pub struct ConnectOptions {
    /// Where to connect
    pub connect_info: ConnectInfo,
    /// Disable Nagle's algorithm
    pub tcp_nodelay: bool,
    /// Ping timeout to request from the server
    pub ping_timeout: Duration,
    /// Protocol version to offer
    pub protocol_version: ProtocolVersion,
    /// Send buffers the application may hold at once
    pub guaranteed_output_buffers: usize,
    /// Opaque value returned with every event of this channel
    pub user_spec: Option<UserSpec>,
    /// Time allowed for the transport to become active
    pub initialization_timeout: Duration,
    /// Reconnect attempts after a failure; -1 retries forever
    pub reconnect_attempt_limit: i32,
    /// Delay before the first reconnect
    pub reconnect_min_delay: Duration,
    /// Upper bound on the delay between reconnects
    pub reconnect_max_delay: Duration,
}

impl ConnectOptions {
    /// Options for `host:service` with stock timeouts and no reconnect
    #[must_use]
    pub fn new(host: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            connect_info: ConnectInfo::new(host, service),
            tcp_nodelay: true,
            ping_timeout: Duration::from_secs(60),
            protocol_version: ProtocolVersion::CURRENT,
            guaranteed_output_buffers: 50,
            user_spec: None,
            initialization_timeout: Duration::from_secs(60),
            reconnect_attempt_limit: 0,
            reconnect_min_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(5),
        }
    }

    /// Validate before any I/O
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` naming the first bad field.
    pub fn validate(&self) -> Result<()> {
        if self.connect_info.host.is_empty() {
            return Err(ReactorError::invalid("host must not be empty"));
        }
        if self.connect_info.service.is_empty() {
            return Err(ReactorError::invalid("service must not be empty"));
        }
        if self.ping_timeout.is_zero() {
            return Err(ReactorError::invalid("ping_timeout must be positive"));
        }
        if self.initialization_timeout.is_zero() {
            return Err(ReactorError::invalid(
                "initialization_timeout must be positive",
            ));
        }
        if self.guaranteed_output_buffers == 0 {
            return Err(ReactorError::invalid(
                "guaranteed_output_buffers must be positive",
            ));
        }
        if self.reconnect_attempt_limit < -1 {
            return Err(ReactorError::invalid(
                "reconnect_attempt_limit must be -1, 0 or positive",
            ));
        }
        if self.reconnect_min_delay.is_zero() {
            return Err(ReactorError::invalid(
                "reconnect_min_delay must be positive",
            ));
        }
        if self.reconnect_min_delay > self.reconnect_max_delay {
            return Err(ReactorError::invalid(
                "reconnect_min_delay exceeds reconnect_max_delay",
            ));
        }
        Ok(())
    }

    /// Reconnect policy described by these options
    #[must_use]
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            attempt_limit: self.reconnect_attempt_limit,
            min_delay: self.reconnect_min_delay,
            max_delay: self.reconnect_max_delay,
        }
    }
}

impl std::fmt::Debug for ConnectOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectOptions")
            .field("connect_info", &self.connect_info)
            .field("ping_timeout", &self.ping_timeout)
            .field("initialization_timeout", &self.initialization_timeout)
            .field("reconnect_attempt_limit", &self.reconnect_attempt_limit)
            .field("reconnect_min_delay", &self.reconnect_min_delay)
            .field("reconnect_max_delay", &self.reconnect_max_delay)
            .finish_non_exhaustive()
    }
}

/// Inbound connection options
#[derive(Clone)]
pub struct AcceptOptions {
    /// Time allowed for the transport to become active
    pub initialization_timeout: Duration,
    /// Send buffers the application may hold at once
    pub guaranteed_output_buffers: usize,
    /// Opaque value returned with every event of this channel
    pub user_spec: Option<UserSpec>,
}

impl Default for AcceptOptions {
    fn default() -> Self {
        Self {
            initialization_timeout: Duration::from_secs(60),
            guaranteed_output_buffers: 50,
            user_spec: None,
        }
    }
}

impl AcceptOptions {
    /// Validate before any I/O
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` naming the first bad field.
    pub fn validate(&self) -> Result<()> {
        if self.initialization_timeout.is_zero() {
            return Err(ReactorError::invalid(
                "initialization_timeout must be positive",
            ));
        }
        if self.guaranteed_output_buffers == 0 {
            return Err(ReactorError::invalid(
                "guaranteed_output_buffers must be positive",
            ));
        }
        Ok(())
    }
}

impl std::fmt::Debug for AcceptOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcceptOptions")
            .field("initialization_timeout", &self.initialization_timeout)
            .field("guaranteed_output_buffers", &self.guaranteed_output_buffers)
            .finish_non_exhaustive()
    }
}

/// When and how often a failed outbound channel is retried.
///
/// The first retry waits `min_delay`; each further retry doubles the
/// previous delay, clamped to `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Attempts allowed; -1 is unlimited, 0 never retries
    pub attempt_limit: i32,
    /// First delay
    pub min_delay: Duration,
    /// Largest delay
    pub max_delay: Duration,
}

impl ReconnectPolicy {
    /// Policy that never retries
    pub const NEVER: Self = Self {
        attempt_limit: 0,
        min_delay: Duration::ZERO,
        max_delay: Duration::ZERO,
    };

    /// Whether another attempt is allowed after `attempts_made`
    #[must_use]
    pub fn allows(&self, attempts_made: u32) -> bool {
        match u32::try_from(self.attempt_limit) {
            Ok(limit) => attempts_made < limit,
            Err(_) => self.attempt_limit == -1,
        }
    }

    /// Delay before the next attempt, given the previous one
    #[must_use]
    pub fn next_delay(&self, last: Option<Duration>) -> Duration {
        match last {
            None => self.min_delay,
            Some(d) => d.saturating_mul(2).clamp(self.min_delay, self.max_delay),
        }
    }
}
