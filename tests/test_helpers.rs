//! Loopback fixtures for reactor integration tests
//!
//! Provides a recording role harness, dispatch helpers, and in-process peers
//! (an answering provider and a silent acceptor) bound to 127.0.0.1.

use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tern_codec::{
    DictionaryMsg, DictionaryRefresh, DictionaryRequest, DictionaryStatus, DictionaryType,
    DirectoryMsg, DirectoryRefresh, DirectoryRequest, LoginMsg, LoginRefresh, LoginRequest,
    RdmMsg, Service, StreamStatus,
};
use tern_reactor::{
    AcceptOptions, CallbackReturn, ChannelEvent, ChannelEventKind, ChannelId, ConnectOptions,
    ConsumerRole, DictionaryDownloadMode, DispatchOptions, DispatchStatus, MsgEvent,
    ProviderRole, Reactor, ReactorConfig, ReactorError, Role,
};
use tern_transport::{BindOptions, Channel, InitProgress, Server};

/// Stream id used for the login handshake in tests
pub const LOGIN_STREAM: i32 = 1;

/// Stream id used for the directory handshake in tests
pub const DIRECTORY_STREAM: i32 = 2;

/// Upper bound for anything a test waits on
pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Collects every event delivered to the generic callbacks of a role
#[derive(Clone, Default)]
pub struct Recorder {
    channel_events: Arc<Mutex<Vec<ChannelEvent>>>,
    msgs: Arc<Mutex<Vec<MsgEvent>>>,
}

impl Recorder {
    /// Create an empty recorder
    pub fn new() -> Self {
        Self::default()
    }

    /// Install recording default-message and channel-event callbacks
    pub fn attach(&self, role: Role) -> Role {
        let events = Arc::clone(&self.channel_events);
        let msgs = Arc::clone(&self.msgs);
        role.on_default_msg(move |_, event| {
            lock(&msgs).push(event.clone());
            CallbackReturn::Success
        })
        .on_channel_event(move |_, event| {
            lock(&events).push(event.clone());
            CallbackReturn::Success
        })
    }

    /// Channel events seen so far
    pub fn events(&self) -> Vec<ChannelEvent> {
        lock(&self.channel_events).clone()
    }

    /// Kinds of the channel events seen so far, in order
    pub fn kinds(&self) -> Vec<ChannelEventKind> {
        lock(&self.channel_events).iter().map(|e| e.kind).collect()
    }

    /// Kinds seen for one channel
    pub fn kinds_for(&self, channel: ChannelId) -> Vec<ChannelEventKind> {
        lock(&self.channel_events)
            .iter()
            .filter(|e| e.channel == channel)
            .map(|e| e.kind)
            .collect()
    }

    /// Number of channel events of `kind`
    pub fn count(&self, kind: ChannelEventKind) -> usize {
        lock(&self.channel_events)
            .iter()
            .filter(|e| e.kind == kind)
            .count()
    }

    /// Messages that reached the default callback
    pub fn msgs(&self) -> Vec<MsgEvent> {
        lock(&self.msgs).clone()
    }
}

/// Consumer with login and directory requests on the test stream ids
pub fn consumer(download_dictionaries: bool) -> ConsumerRole {
    let role = ConsumerRole::default()
        .with_login_request(LoginRequest::new(LOGIN_STREAM, "tester"))
        .with_directory_request(DirectoryRequest::new(DIRECTORY_STREAM));
    if download_dictionaries {
        role.with_dictionary_download(DictionaryDownloadMode::FirstAvailable)
    } else {
        role
    }
}

/// Reactor with a short worker tick
pub fn reactor() -> Reactor {
    let config = ReactorConfig {
        worker_tick_ms: 2,
        ..ReactorConfig::default()
    };
    Reactor::new(config).expect("Failed to create reactor")
}

/// Wait for and dispatch events until `done` holds or the timeout passes
pub fn pump_until(reactor: &Reactor, timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    let opts = DispatchOptions::default();
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        if reactor.wait(Duration::from_millis(10)) {
            reactor.dispatch(&opts).expect("dispatch failed");
        }
    }
    done()
}

/// Wait up to `timeout` for one event and dispatch it
pub fn dispatch_event(reactor: &Reactor, timeout: Duration) -> DispatchStatus {
    let opts = DispatchOptions::default().with_max_messages(1);
    let deadline = Instant::now() + timeout;
    loop {
        let status = reactor.dispatch(&opts).expect("dispatch failed");
        if status.processed() > 0 || Instant::now() >= deadline {
            return status;
        }
        let _ = reactor.wait(Duration::from_millis(10));
    }
}

/// Close every channel, then destroy the reactor
pub fn shutdown(reactor: &Reactor) {
    for channel in reactor.channels() {
        match reactor.close_channel(channel) {
            Ok(()) | Err(ReactorError::UnknownChannel(_)) => {}
            Err(e) => panic!("close_channel({channel}) failed: {e}"),
        }
    }
    reactor.destroy().expect("destroy failed");
}

/// A localhost port with nothing listening on it
pub fn unused_port() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").expect("Failed to bind port listener");
    let port = listener.local_addr().expect("local_addr").port();
    drop(listener);
    port.to_string()
}

/// `n` numbered services, each offering the stock dictionaries
pub fn services(n: u16) -> Vec<Service> {
    (1..=n).map(|id| Service::new(id, format!("SVC_{id}"))).collect()
}

/// Behavior of a [`LoopbackProvider`]
#[derive(Debug, Clone)]
pub struct ProviderOptions {
    /// Services listed in directory refreshes
    pub services: Vec<Service>,
    /// Answer login requests; when false logins stay pending forever
    pub answer_login: bool,
    /// Largest ping timeout granted
    pub ping_timeout: Duration,
    /// Smallest ping timeout granted
    pub min_ping_timeout: Duration,
}

impl Default for ProviderOptions {
    fn default() -> Self {
        Self {
            services: services(1),
            answer_login: true,
            ping_timeout: Duration::from_secs(60),
            min_ping_timeout: Duration::from_millis(100),
        }
    }
}

/// What a [`LoopbackProvider`] has seen
#[derive(Debug, Default)]
pub struct ProviderCounters {
    /// Channels accepted
    pub accepted: AtomicUsize,
    /// Login requests
    pub logins: AtomicUsize,
    /// Directory requests
    pub directory_requests: AtomicUsize,
    /// Dictionary requests
    pub dictionary_requests: AtomicUsize,
    /// Dictionary stream closes
    pub dictionary_closes: AtomicUsize,
    /// Non-administrative messages
    pub other_msgs: AtomicUsize,
}

impl ProviderCounters {
    /// Read one counter
    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::Acquire)
    }
}

fn bump(counter: &AtomicUsize) {
    counter.fetch_add(1, Ordering::AcqRel);
}

fn reply(reactor: &Reactor, channel: ChannelId, msg: RdmMsg) {
    if let Err(e) = reactor.submit_rdm(channel, &msg) {
        tracing::warn!("Loopback provider failed to answer on {}: {}", channel, e);
    }
}

fn provider_role(opts: &ProviderOptions, counters: &Arc<ProviderCounters>) -> Role {
    let answer_login = opts.answer_login;
    let services = Arc::new(opts.services.clone());
    let (c_login, c_dir, c_dict, c_other) = (
        Arc::clone(counters),
        Arc::clone(counters),
        Arc::clone(counters),
        Arc::clone(counters),
    );

    let provider = ProviderRole::default()
        .on_login(move |reactor, event| {
            if let LoginMsg::Request(request) = &event.rdm {
                bump(&c_login.logins);
                if answer_login {
                    let refresh = LoginRefresh::accepting(request);
                    reply(reactor, event.base.channel, LoginMsg::Refresh(refresh).into());
                }
            }
            CallbackReturn::Success
        })
        .on_directory(move |reactor, event| {
            if let DirectoryMsg::Request(request) = &event.rdm {
                bump(&c_dir.directory_requests);
                let refresh = DirectoryRefresh::answering(request, services.as_ref().clone());
                reply(reactor, event.base.channel, DirectoryMsg::Refresh(refresh).into());
            }
            CallbackReturn::Success
        })
        .on_dictionary(move |reactor, event| {
            match &event.rdm {
                DictionaryMsg::Request(request) => {
                    bump(&c_dict.dictionary_requests);
                    reply(reactor, event.base.channel, answer_dictionary(request).into());
                }
                DictionaryMsg::Close { .. } => bump(&c_dict.dictionary_closes),
                _ => {}
            }
            CallbackReturn::Success
        });

    Role::provider(provider)
        .on_default_msg(move |_, _| {
            bump(&c_other.other_msgs);
            CallbackReturn::Success
        })
        .on_channel_event(|reactor, event| {
            if event.kind == ChannelEventKind::Down {
                let _ = reactor.close_channel(event.channel);
            }
            CallbackReturn::Success
        })
}

fn answer_dictionary(request: &DictionaryRequest) -> DictionaryMsg {
    match DictionaryType::for_name(&request.dictionary_name) {
        Some(kind) => DictionaryMsg::Refresh(DictionaryRefresh::answering(
            request,
            kind,
            request.dictionary_name.as_bytes().to_vec(),
        )),
        None => DictionaryMsg::Status(DictionaryStatus {
            stream_id: request.stream_id,
            status: Some(StreamStatus::closed("unknown dictionary")),
        }),
    }
}

/// Interactive provider running its own reactor on a background thread
pub struct LoopbackProvider {
    addr: SocketAddr,
    counters: Arc<ProviderCounters>,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl LoopbackProvider {
    /// Provider with default behavior
    pub fn start() -> Self {
        Self::with_options(ProviderOptions::default())
    }

    /// Provider with the given behavior
    pub fn with_options(opts: ProviderOptions) -> Self {
        let mut bind = BindOptions::new("127.0.0.1:0".parse().expect("loopback address"));
        bind.ping_timeout = opts.ping_timeout;
        bind.min_ping_timeout = opts.min_ping_timeout;
        let server = Server::bind(&bind).expect("Failed to bind loopback provider");
        let addr = server.local_addr().expect("local_addr");

        let counters = Arc::new(ProviderCounters::default());
        let stop = Arc::new(AtomicBool::new(false));
        let role = provider_role(&opts, &counters);

        let handle = {
            let counters = Arc::clone(&counters);
            let stop = Arc::clone(&stop);
            thread::Builder::new()
                .name("loopback-provider".to_string())
                .spawn(move || serve(&server, &role, &counters, &stop))
                .expect("Failed to spawn provider thread")
        };

        Self {
            addr,
            counters,
            stop,
            handle: Some(handle),
        }
    }

    /// Listening address
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Connect options pointing at this provider
    pub fn connect_options(&self) -> ConnectOptions {
        ConnectOptions::new("127.0.0.1", self.addr.port().to_string())
    }

    /// Counters of what the provider has seen
    pub fn counters(&self) -> &ProviderCounters {
        &self.counters
    }
}

impl Drop for LoopbackProvider {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn serve(server: &Server, role: &Role, counters: &ProviderCounters, stop: &AtomicBool) {
    let reactor = reactor();
    let accept = AcceptOptions::default();
    let opts = DispatchOptions::default();

    while !stop.load(Ordering::Acquire) {
        loop {
            match reactor.accept(server, &accept, role.clone()) {
                Ok(_) => bump(&counters.accepted),
                Err(ReactorError::NoPendingConnection) => break,
                Err(e) => panic!("loopback accept failed: {e}"),
            }
        }
        if reactor.wait(Duration::from_millis(5)) {
            reactor.dispatch(&opts).expect("provider dispatch failed");
        }
    }

    shutdown(&reactor);
}

/// Acceptor that completes the transport handshake and then never reads
/// or writes again
pub struct SilentPeer {
    addr: SocketAddr,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl SilentPeer {
    /// Listen on loopback, granting ping timeouts down to `min_ping_timeout`
    pub fn start(min_ping_timeout: Duration) -> Self {
        let mut bind = BindOptions::new("127.0.0.1:0".parse().expect("loopback address"));
        bind.min_ping_timeout = min_ping_timeout;
        let server = Server::bind(&bind).expect("Failed to bind silent peer");
        let addr = server.local_addr().expect("local_addr");
        let stop = Arc::new(AtomicBool::new(false));

        let handle = {
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                let mut accepted = Vec::new();
                while !stop.load(Ordering::Acquire) {
                    if let Ok(Some(channel)) = server.accept() {
                        accepted.push(channel);
                    }
                    // Once active, init() no longer touches the socket
                    for channel in &mut accepted {
                        let _ = channel.init();
                    }
                    thread::sleep(Duration::from_millis(5));
                }
            })
        };

        Self {
            addr,
            stop,
            handle: Some(handle),
        }
    }

    /// Connect options pointing at this peer
    pub fn connect_options(&self) -> ConnectOptions {
        ConnectOptions::new("127.0.0.1", self.addr.port().to_string())
    }
}

impl Drop for SilentPeer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Acceptor that brings each connection up, holds it briefly, then closes it
pub struct DroppingPeer {
    addr: SocketAddr,
    closed: Arc<AtomicUsize>,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl DroppingPeer {
    /// Listen on loopback and close every connection `hold` after it is active
    pub fn start(hold: Duration) -> Self {
        let bind = BindOptions::new("127.0.0.1:0".parse().expect("loopback address"));
        let server = Server::bind(&bind).expect("Failed to bind dropping peer");
        let addr = server.local_addr().expect("local_addr");
        let closed = Arc::new(AtomicUsize::new(0));
        let stop = Arc::new(AtomicBool::new(false));

        let handle = {
            let closed = Arc::clone(&closed);
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                let mut live: Vec<(_, Option<Instant>)> = Vec::new();
                while !stop.load(Ordering::Acquire) {
                    if let Ok(Some(channel)) = server.accept() {
                        live.push((channel, None));
                    }
                    let now = Instant::now();
                    live.retain_mut(|(channel, active_since)| {
                        match *active_since {
                            None => {
                                if let Ok(InitProgress::Active) = channel.init() {
                                    *active_since = Some(now);
                                }
                                true
                            }
                            Some(since) if now.duration_since(since) >= hold => {
                                channel.close();
                                bump(&closed);
                                false
                            }
                            Some(_) => true,
                        }
                    });
                    thread::sleep(Duration::from_millis(2));
                }
            })
        };

        Self {
            addr,
            closed,
            stop,
            handle: Some(handle),
        }
    }

    /// Connect options pointing at this peer
    pub fn connect_options(&self) -> ConnectOptions {
        ConnectOptions::new("127.0.0.1", self.addr.port().to_string())
    }

    /// Connections closed so far
    pub fn closed(&self) -> usize {
        ProviderCounters::get(&self.closed)
    }
}

impl Drop for DroppingPeer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
