//! The reactor handle.
//!
//! A [`Reactor`] owns every session it creates, a worker thread that drives
//! their transports, and the event queue the application drains with
//! [`Reactor::dispatch`]. The handle is cheap to clone and may be used from
//! any thread, including from inside callbacks.

use crate::buffer_pool::{Buffer, BufferPool};
use crate::config::ReactorConfig;
use crate::error::{ReactorError, Result};
use crate::event::Event;
use crate::notifier::Notifier;
use crate::options::{AcceptOptions, ConnectOptions};
use crate::role::Role;
use crate::session::{ChannelId, ChannelSnapshot, SendError, Session};
use crate::worker::{self, WorkerCommand, WorkerStats, COMMAND_QUEUE_CAPACITY};
use crossbeam_channel::{bounded, Sender, TrySendError};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tern_codec::{BincodeCodec, Codec, Msg, RdmMsg};
use tern_transport::{Server, SocketId};
use tracing::{debug, info, warn};

pub(crate) struct ReactorState {
    pub(crate) sessions: HashMap<ChannelId, Session>,
    pub(crate) queue: VecDeque<Event>,
    pub(crate) pool: BufferPool,
    /// Channels with a callback running; their events wait
    pub(crate) delivering: HashSet<ChannelId>,
    pub(crate) shut_down: bool,
    next_id: u64,
}

impl ReactorState {
    fn allocate_id(&mut self) -> ChannelId {
        self.next_id += 1;
        ChannelId::new(self.next_id)
    }

    fn session_mut(&mut self, channel: ChannelId) -> Result<&mut Session> {
        self.sessions
            .get_mut(&channel)
            .ok_or(ReactorError::UnknownChannel(channel))
    }
}

pub(crate) struct Inner {
    state: Mutex<ReactorState>,
    pub(crate) notifier: Notifier,
    pub(crate) config: ReactorConfig,
    pub(crate) codec: Arc<dyn Codec>,
    pub(crate) stats: WorkerStats,
    commands: Sender<WorkerCommand>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Inner {
    pub(crate) fn lock_state(&self) -> MutexGuard<'_, ReactorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wake(&self) {
        match self.commands.try_send(WorkerCommand::Wake) {
            Ok(()) | Err(TrySendError::Full(_)) => {}
            Err(TrySendError::Disconnected(_)) => debug!("Reactor worker already stopped"),
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let _ = self.commands.try_send(WorkerCommand::Shutdown);
    }
}

/// Handle to a reactor
#[derive(Clone)]
pub struct Reactor {
    pub(crate) inner: Arc<Inner>,
}

impl Reactor {
    /// Create a reactor with the stock codec and start its worker
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for a bad configuration or `Fatal` if the
    /// notifier or worker thread cannot be created.
    pub fn new(config: ReactorConfig) -> Result<Self> {
        Self::with_codec(config, Arc::new(BincodeCodec))
    }

    /// Create a reactor with a custom codec and start its worker
    ///
    /// # Errors
    ///
    /// Same as [`Reactor::new`].
    pub fn with_codec(config: ReactorConfig, codec: Arc<dyn Codec>) -> Result<Self> {
        config.validate()?;
        let notifier = Notifier::new()
            .map_err(|e| ReactorError::Fatal(format!("notifier: {e}").into()))?;
        let tick = config.worker_tick();
        let (commands, receiver) = bounded(COMMAND_QUEUE_CAPACITY);

        let inner = Arc::new(Inner {
            state: Mutex::new(ReactorState {
                sessions: HashMap::new(),
                queue: VecDeque::new(),
                pool: BufferPool::new(config.buffer_pool_capacity),
                delivering: HashSet::new(),
                shut_down: false,
                next_id: 0,
            }),
            notifier,
            config,
            codec,
            stats: WorkerStats::default(),
            commands,
            worker: Mutex::new(None),
        });

        let handle = worker::spawn(Arc::downgrade(&inner), receiver, tick)
            .map_err(|e| ReactorError::Fatal(format!("worker thread: {e}").into()))?;
        *inner.worker.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);

        info!("Reactor started (worker tick {:?})", tick);
        Ok(Self { inner })
    }

    /// Start an outbound channel.
    ///
    /// Returns as soon as the session exists; connection progress, the
    /// handshake and any failure arrive as channel events.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if the role cannot connect or the options are
    /// invalid; `Shutdown` after [`Reactor::destroy`].
    pub fn connect(&self, opts: &ConnectOptions, role: Role) -> Result<ChannelId> {
        role.validate_for_connect()?;
        opts.validate()?;

        let id = {
            let mut state = self.inner.lock_state();
            if state.shut_down {
                return Err(ReactorError::Shutdown);
            }
            let id = state.allocate_id();
            let session = Session::outbound(id, opts.clone(), role, Instant::now());
            state.sessions.insert(id, session);
            id
        };

        info!(
            "Channel {} created for {}:{}",
            id, opts.connect_info.host, opts.connect_info.service
        );
        self.inner.wake();
        Ok(id)
    }

    /// Accept one pending connection on `server`.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if the role cannot accept or the options are
    /// invalid; `NoPendingConnection` if nothing is waiting; `Transport` if
    /// the listener fails; `Shutdown` after [`Reactor::destroy`].
    pub fn accept(&self, server: &Server, opts: &AcceptOptions, role: Role) -> Result<ChannelId> {
        role.validate_for_accept()?;
        opts.validate()?;

        let id = {
            let mut state = self.inner.lock_state();
            if state.shut_down {
                return Err(ReactorError::Shutdown);
            }
            let channel = server.accept()?.ok_or(ReactorError::NoPendingConnection)?;
            let id = state.allocate_id();
            let session = Session::inbound(
                id,
                Box::new(channel),
                opts.clone(),
                role,
                Instant::now(),
            );
            state.sessions.insert(id, session);
            id
        };

        info!("Channel {} accepted", id);
        self.inner.wake();
        Ok(id)
    }

    /// Close a channel and discard its undelivered events.
    ///
    /// Events for the channel still queued when this returns are dropped;
    /// only an event another thread already popped can still reach its
    /// callback.
    ///
    /// # Errors
    ///
    /// `UnknownChannel` if the id is not open; `Shutdown` after destroy.
    pub fn close_channel(&self, channel: ChannelId) -> Result<()> {
        let mut state = self.inner.lock_state();
        if state.shut_down {
            return Err(ReactorError::Shutdown);
        }
        let mut session = state
            .sessions
            .remove(&channel)
            .ok_or(ReactorError::UnknownChannel(channel))?;
        session.close();

        state.queue.retain(|e| e.channel() != channel);
        state.pool.forget(channel);
        if state.queue.is_empty() {
            self.inner.notifier.clear();
        }

        info!("Channel {} closed", channel);
        Ok(())
    }

    /// Encode and send a message.
    ///
    /// # Errors
    ///
    /// `UnknownChannel`, `ChannelDown` if the channel is not connected or the
    /// write fails (the failure is also reported once as a channel event),
    /// `Codec` if the message cannot be encoded.
    pub fn submit_msg(&self, channel: ChannelId, msg: &Msg) -> Result<usize> {
        let now = Instant::now();
        let mut guard = self.inner.lock_state();
        if guard.shut_down {
            return Err(ReactorError::Shutdown);
        }
        let ReactorState {
            sessions,
            queue,
            pool,
            ..
        } = &mut *guard;
        let session = sessions
            .get_mut(&channel)
            .ok_or(ReactorError::UnknownChannel(channel))?;

        let result = session.send(self.inner.codec.as_ref(), pool, msg, now);
        self.finish_send(session, queue, result, now)
    }

    /// Encode and send an administrative message
    ///
    /// # Errors
    ///
    /// Same as [`Reactor::submit_msg`].
    pub fn submit_rdm(&self, channel: ChannelId, rdm: &RdmMsg) -> Result<usize> {
        let msg = rdm.to_msg()?;
        self.submit_msg(channel, &msg)
    }

    /// Obtain a send buffer of `size` bytes.
    ///
    /// Buffers larger than the channel's negotiated fragment size must be
    /// requested with `is_large`.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for a zero or oversized request; `ChannelDown` if
    /// the channel is not connected; `NoBuffers` when the channel already
    /// holds its guaranteed output buffers.
    pub fn get_buffer(&self, channel: ChannelId, size: usize, is_large: bool) -> Result<Buffer> {
        if size == 0 {
            return Err(ReactorError::invalid("buffer size must be positive"));
        }
        if size > self.inner.config.max_message_size {
            return Err(ReactorError::invalid(format!(
                "buffer size {size} exceeds max_message_size {}",
                self.inner.config.max_message_size
            )));
        }

        let mut state = self.inner.lock_state();
        if state.shut_down {
            return Err(ReactorError::Shutdown);
        }
        let session = state.session_mut(channel)?;
        if !session.state.is_connected() {
            return Err(ReactorError::ChannelDown(channel));
        }
        let max_fragment_size = session
            .max_fragment_size()
            .ok_or(ReactorError::ChannelDown(channel))?;
        if size > max_fragment_size && !is_large {
            return Err(ReactorError::invalid(format!(
                "buffer size {size} exceeds fragment size {max_fragment_size}; request a large buffer"
            )));
        }
        let limit = session.guaranteed_output_buffers();

        state.pool.acquire(channel, size, is_large, limit)
    }

    /// Send a buffer's contents, consuming it.
    ///
    /// # Errors
    ///
    /// Same as [`Reactor::submit_msg`]; the buffer is released either way.
    pub fn submit_buffer(&self, buffer: Buffer) -> Result<usize> {
        let now = Instant::now();
        let (channel, data, len) = buffer.into_parts();

        let mut guard = self.inner.lock_state();
        let ReactorState {
            sessions,
            queue,
            pool,
            shut_down,
            ..
        } = &mut *guard;

        let result = if *shut_down {
            Err(ReactorError::Shutdown)
        } else {
            match sessions.get_mut(&channel) {
                Some(session) => {
                    let sent = session.write(&data[..len], now);
                    self.finish_send(session, queue, sent, now)
                }
                None => Err(ReactorError::UnknownChannel(channel)),
            }
        };
        pool.release(channel, data);
        result
    }

    /// Return an unsent buffer
    pub fn release_buffer(&self, buffer: Buffer) {
        let (channel, data, _) = buffer.into_parts();
        self.inner.lock_state().pool.release(channel, data);
    }

    fn finish_send(
        &self,
        session: &mut Session,
        queue: &mut VecDeque<Event>,
        result: std::result::Result<usize, SendError>,
        now: Instant,
    ) -> Result<usize> {
        match result {
            Ok(n) => {
                if session.flush_pending {
                    self.inner.wake();
                }
                Ok(n)
            }
            Err(SendError::NotConnected) => Err(ReactorError::ChannelDown(session.id)),
            Err(SendError::Codec(e)) => Err(ReactorError::Codec(e)),
            Err(SendError::Transport(e)) => {
                warn!("Channel {} write failed: {}", session.id, e);
                session.fail(e.into(), now, queue);
                self.inner.notifier.signal();
                self.inner.wake();
                Err(ReactorError::ChannelDown(session.id))
            }
        }
    }

    /// Snapshot of a channel's state and negotiated parameters
    ///
    /// # Errors
    ///
    /// `UnknownChannel` if the id is not open.
    pub fn channel_info(&self, channel: ChannelId) -> Result<ChannelSnapshot> {
        let state = self.inner.lock_state();
        let session = state
            .sessions
            .get(&channel)
            .ok_or(ReactorError::UnknownChannel(channel))?;
        Ok(session.snapshot(state.pool.outstanding(channel)))
    }

    /// Ids of every open channel
    #[must_use]
    pub fn channels(&self) -> Vec<ChannelId> {
        let mut ids: Vec<_> = self.inner.lock_state().sessions.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Events waiting for dispatch
    #[must_use]
    pub fn pending_events(&self) -> usize {
        self.inner.lock_state().queue.len()
    }

    /// Block until events are available or `timeout` elapses
    #[must_use]
    pub fn wait(&self, timeout: Duration) -> bool {
        self.inner.notifier.wait(timeout)
    }

    /// Descriptor that is readable while events are available
    #[must_use]
    pub fn notifier_fd(&self) -> Option<SocketId> {
        self.inner.notifier.fd()
    }

    /// Worker thread statistics
    #[must_use]
    pub fn stats(&self) -> &WorkerStats {
        &self.inner.stats
    }

    /// Reactor configuration
    #[must_use]
    pub fn config(&self) -> &ReactorConfig {
        &self.inner.config
    }

    /// Codec used for every message
    #[must_use]
    pub fn codec(&self) -> &dyn Codec {
        self.inner.codec.as_ref()
    }

    /// Stop the worker and release the reactor.
    ///
    /// Every channel must be closed first. Any call on any handle after a
    /// successful destroy returns `Shutdown`.
    ///
    /// # Errors
    ///
    /// `ChannelsOpen` while channels remain; `Shutdown` if already destroyed;
    /// `Fatal` if the worker thread panicked.
    pub fn destroy(&self) -> Result<()> {
        {
            let mut state = self.inner.lock_state();
            if state.shut_down {
                return Err(ReactorError::Shutdown);
            }
            if !state.sessions.is_empty() {
                return Err(ReactorError::ChannelsOpen(state.sessions.len()));
            }
            state.shut_down = true;
            state.queue.clear();
        }
        self.inner.notifier.clear();
        let _ = self.inner.commands.try_send(WorkerCommand::Shutdown);

        let handle = self
            .inner
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() {
                handle
                    .join()
                    .map_err(|_| ReactorError::Fatal("reactor worker panicked".into()))?;
            }
        }

        info!("Reactor destroyed");
        Ok(())
    }
}

impl std::fmt::Debug for Reactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reactor")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::role::{CallbackReturn, ConsumerRole, ProviderRole};
    use crate::session::SessionState;
    use std::net::SocketAddr;
    use tern_transport::BindOptions;

    fn consumer() -> Role {
        Role::consumer(ConsumerRole::default())
            .on_default_msg(|_, _| CallbackReturn::Success)
            .on_channel_event(|_, _| CallbackReturn::Success)
    }

    fn provider() -> Role {
        Role::provider(ProviderRole::default())
            .on_default_msg(|_, _| CallbackReturn::Success)
            .on_channel_event(|_, _| CallbackReturn::Success)
    }

    fn loopback_server() -> Server {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        Server::bind(&BindOptions::new(addr)).unwrap()
    }

    #[test]
    fn test_create_and_destroy() {
        let reactor = Reactor::new(ReactorConfig::default()).unwrap();
        assert!(reactor.channels().is_empty());
        reactor.destroy().unwrap();

        assert!(matches!(reactor.destroy(), Err(ReactorError::Shutdown)));
        let opts = ConnectOptions::new("localhost", "14002");
        assert!(matches!(
            reactor.connect(&opts, consumer()),
            Err(ReactorError::Shutdown)
        ));
    }

    #[test]
    fn test_rejects_bad_config() {
        let config = ReactorConfig {
            worker_tick_ms: 0,
            ..ReactorConfig::default()
        };
        assert!(Reactor::new(config).is_err());
    }

    #[test]
    fn test_connect_validates_role() {
        let reactor = Reactor::new(ReactorConfig::default()).unwrap();
        let opts = ConnectOptions::new("localhost", "14002");

        let err = reactor.connect(&opts, provider()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);

        let err = reactor
            .connect(&opts, Role::consumer(ConsumerRole::default()))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert!(reactor.channels().is_empty());

        reactor.destroy().unwrap();
    }

    #[test]
    fn test_accept_without_pending_connection() {
        let reactor = Reactor::new(ReactorConfig::default()).unwrap();
        let server = loopback_server();

        assert!(matches!(
            reactor.accept(&server, &AcceptOptions::default(), provider()),
            Err(ReactorError::NoPendingConnection)
        ));
        assert_eq!(
            reactor
                .accept(&server, &AcceptOptions::default(), consumer())
                .unwrap_err()
                .kind(),
            ErrorKind::InvalidArgument
        );

        reactor.destroy().unwrap();
    }

    #[test]
    fn test_destroy_requires_closed_channels() {
        let reactor = Reactor::new(ReactorConfig::default()).unwrap();
        let id = reactor
            .connect(&ConnectOptions::new("127.0.0.1", "1"), consumer())
            .unwrap();

        assert!(matches!(
            reactor.destroy(),
            Err(ReactorError::ChannelsOpen(1))
        ));
        reactor.close_channel(id).unwrap();
        assert!(matches!(
            reactor.close_channel(id),
            Err(ReactorError::UnknownChannel(_))
        ));
        reactor.destroy().unwrap();
    }

    #[test]
    fn test_calls_on_unknown_channel() {
        let reactor = Reactor::new(ReactorConfig::default()).unwrap();
        let ghost = ChannelId::new(99);
        let msg = Msg::new(tern_codec::MsgClass::Request, tern_codec::Domain::MarketPrice, 5);

        assert!(matches!(
            reactor.submit_msg(ghost, &msg),
            Err(ReactorError::UnknownChannel(_))
        ));
        assert!(matches!(
            reactor.get_buffer(ghost, 16, false),
            Err(ReactorError::UnknownChannel(_))
        ));
        assert!(reactor.channel_info(ghost).is_err());

        reactor.destroy().unwrap();
    }

    #[test]
    fn test_submit_before_connected() {
        let reactor = Reactor::new(ReactorConfig::default()).unwrap();
        let id = reactor
            .connect(&ConnectOptions::new("127.0.0.1", "1"), consumer())
            .unwrap();
        let msg = Msg::new(tern_codec::MsgClass::Request, tern_codec::Domain::MarketPrice, 5);

        match reactor.submit_msg(id, &msg) {
            Err(ReactorError::ChannelDown(ch)) => assert_eq!(ch, id),
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            reactor.get_buffer(id, 16, false),
            Err(ReactorError::ChannelDown(_))
        ));

        reactor.close_channel(id).unwrap();
        reactor.destroy().unwrap();
    }

    #[test]
    fn test_get_buffer_size_checks() {
        let config = ReactorConfig {
            max_message_size: 1024,
            ..ReactorConfig::default()
        };
        let reactor = Reactor::new(config).unwrap();
        let id = reactor
            .connect(&ConnectOptions::new("127.0.0.1", "1"), consumer())
            .unwrap();

        assert_eq!(
            reactor.get_buffer(id, 0, false).unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );
        assert_eq!(
            reactor.get_buffer(id, 4096, true).unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );

        reactor.close_channel(id).unwrap();
        reactor.destroy().unwrap();
    }

    #[test]
    fn test_ids_are_unique() {
        let reactor = Reactor::new(ReactorConfig::default()).unwrap();
        let opts = ConnectOptions::new("127.0.0.1", "1");
        let a = reactor.connect(&opts, consumer()).unwrap();
        let b = reactor.connect(&opts, consumer()).unwrap();
        reactor.close_channel(a).unwrap();
        let c = reactor.connect(&opts, consumer()).unwrap();

        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_ne!(b, c);
        assert_eq!(reactor.channels(), vec![b, c]);

        for id in reactor.channels() {
            reactor.close_channel(id).unwrap();
        }
        reactor.destroy().unwrap();
    }

    #[test]
    fn test_new_channel_starts_connecting() {
        let reactor = Reactor::new(ReactorConfig::default()).unwrap();
        let id = reactor
            .connect(&ConnectOptions::new("127.0.0.1", "1"), consumer())
            .unwrap();
        let info = reactor.channel_info(id).unwrap();
        assert!(matches!(
            info.state,
            SessionState::Connecting
                | SessionState::Initializing
                | SessionState::Down
                | SessionState::DownReconnecting
        ));
        assert_eq!(info.outstanding_buffers, 0);

        reactor.close_channel(id).unwrap();
        reactor.destroy().unwrap();
    }
}
