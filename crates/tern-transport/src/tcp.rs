//! TCP channel and listening server.
//!
//! Features:
//! - Synchronous name resolution, non-blocking connect
//! - Length-prefixed framing with a connect/ack handshake
//! - Ping timeout negotiation on the accepting side
//! - Outbound queue drained by `flush` when the socket applies backpressure

use crate::frame::{
    ConnectAck, ConnectRequest, Frame, FrameDecoder, FrameKind, encode_frame,
    negotiate_ping_timeout,
};
use crate::transport::{
    Channel, ChannelInfo, ChannelState, InitProgress, ReadOutcome, SocketId, TransportError,
    TransportResult, TransportStats, WriteOutcome,
};
use socket2::{Domain, Protocol, Socket, Type};
use std::io::{self, Read, Write};
use std::net::{IpAddr, Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::time::Duration;
use tern_codec::ProtocolVersion;

/// Largest message size offered by a server unless configured otherwise
pub const DEFAULT_MAX_FRAGMENT_SIZE: usize = 6144;

/// Largest frame accepted from a peer
pub const MAX_FRAME_LEN: usize = 32 * 1024 * 1024;

const READ_CHUNK: usize = 64 * 1024;

/// Where to connect
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectInfo {
    /// Host name or address
    pub host: String,
    /// Port number, as text
    pub service: String,
    /// Local address to bind before connecting
    pub interface_name: Option<String>,
}

impl ConnectInfo {
    /// Connect to `host:service` from any local interface
    #[must_use]
    pub fn new(host: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            service: service.into(),
            interface_name: None,
        }
    }

    fn resolve(&self) -> TransportResult<SocketAddr> {
        let port: u16 = self
            .service
            .parse()
            .map_err(|_| TransportError::Resolve(format!("service '{}'", self.service)))?;

        (self.host.as_str(), port)
            .to_socket_addrs()
            .map_err(|e| TransportError::Resolve(format!("{}:{}: {e}", self.host, self.service)))?
            .next()
            .ok_or_else(|| TransportError::Resolve(format!("{}:{}", self.host, self.service)))
    }
}

/// Per-connection transport options for the initiating side
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelOptions {
    /// Ping timeout to request
    pub ping_timeout: Duration,
    /// Protocol version to offer
    pub version: ProtocolVersion,
    /// Disable Nagle's algorithm
    pub tcp_nodelay: bool,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            ping_timeout: Duration::from_secs(60),
            version: ProtocolVersion::CURRENT,
            tcp_nodelay: true,
        }
    }
}

/// Listening server parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindOptions {
    /// Address to listen on
    pub addr: SocketAddr,
    /// Largest ping timeout granted to clients
    pub ping_timeout: Duration,
    /// Smallest ping timeout granted to clients
    pub min_ping_timeout: Duration,
    /// Largest message size offered to clients
    pub max_fragment_size: usize,
    /// Protocol version spoken
    pub version: ProtocolVersion,
    /// Disable Nagle's algorithm on accepted channels
    pub tcp_nodelay: bool,
    /// Listen backlog
    pub backlog: i32,
}

impl BindOptions {
    /// Default parameters on `addr`
    #[must_use]
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            ping_timeout: Duration::from_secs(60),
            min_ping_timeout: Duration::from_secs(1),
            max_fragment_size: DEFAULT_MAX_FRAGMENT_SIZE,
            version: ProtocolVersion::CURRENT,
            tcp_nodelay: true,
            backlog: 128,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Connecting,
    AwaitAck,
    AwaitRequest,
    Active,
    Failed,
}

#[derive(Debug, Clone)]
struct AcceptParams {
    ping_timeout: Duration,
    min_ping_timeout: Duration,
    max_fragment_size: usize,
}

/// Framed TCP channel
pub struct TcpChannel {
    stream: TcpStream,
    phase: Phase,
    decoder: FrameDecoder,
    out: Vec<u8>,
    scratch: Vec<u8>,
    info: ChannelInfo,
    accept_params: Option<AcceptParams>,
    stats: TransportStats,
}

impl TcpChannel {
    /// Start connecting to `info`.
    ///
    /// Name resolution happens here and fails immediately for unknown hosts;
    /// the TCP connect itself completes through [`Channel::init`].
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Resolve`] for unresolvable targets and
    /// [`TransportError::ConnectionFailed`] when the connect is refused outright.
    pub fn connect(info: &ConnectInfo, opts: &ChannelOptions) -> TransportResult<Self> {
        let addr = info.resolve()?;

        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_nonblocking(true)?;

        if let Some(iface) = &info.interface_name {
            let ip: IpAddr = iface.parse().map_err(|_| {
                TransportError::InvalidConfig(format!("interface '{iface}' is not an address"))
            })?;
            socket.bind(&SocketAddr::new(ip, 0).into())?;
        }

        match socket.connect(&addr.into()) {
            Ok(()) => {}
            Err(e) if connect_in_progress(&e) => {}
            Err(e) => return Err(TransportError::ConnectionFailed(format!("{addr}: {e}"))),
        }

        let stream: TcpStream = socket.into();
        stream.set_nodelay(opts.tcp_nodelay)?;

        tracing::debug!("Connecting to {} ({})", addr, info.host);

        Ok(Self::with_stream(
            stream,
            Phase::Connecting,
            ChannelInfo {
                ping_timeout: opts.ping_timeout,
                max_fragment_size: DEFAULT_MAX_FRAGMENT_SIZE,
                version: opts.version,
                peer_addr: None,
            },
            None,
        ))
    }

    fn accepted(stream: TcpStream, peer: SocketAddr, opts: &BindOptions) -> TransportResult<Self> {
        stream.set_nonblocking(true)?;
        stream.set_nodelay(opts.tcp_nodelay)?;

        Ok(Self::with_stream(
            stream,
            Phase::AwaitRequest,
            ChannelInfo {
                ping_timeout: opts.ping_timeout,
                max_fragment_size: opts.max_fragment_size,
                version: opts.version,
                peer_addr: Some(peer),
            },
            Some(AcceptParams {
                ping_timeout: opts.ping_timeout,
                min_ping_timeout: opts.min_ping_timeout,
                max_fragment_size: opts.max_fragment_size,
            }),
        ))
    }

    fn with_stream(
        stream: TcpStream,
        phase: Phase,
        info: ChannelInfo,
        accept_params: Option<AcceptParams>,
    ) -> Self {
        Self {
            stream,
            phase,
            decoder: FrameDecoder::new(MAX_FRAME_LEN),
            out: Vec::new(),
            scratch: vec![0u8; READ_CHUNK],
            info,
            accept_params,
            stats: TransportStats::new(),
        }
    }

    /// Bytes queued but not yet written to the socket
    #[must_use]
    pub fn pending(&self) -> usize {
        self.out.len()
    }

    fn queue(&mut self, kind: FrameKind, body: &[u8]) -> TransportResult<()> {
        encode_frame(kind, body, &mut self.out)
    }

    fn flush_out(&mut self) -> TransportResult<usize> {
        while !self.out.is_empty() {
            match self.stream.write(&self.out) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero).into()),
                Ok(n) => {
                    self.out.drain(..n);
                    self.stats.record_send(n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(self.out.len())
    }

    /// Read once from the socket; `false` when nothing was available.
    fn fill(&mut self) -> TransportResult<bool> {
        match self.stream.read(&mut self.scratch) {
            Ok(0) => Err(TransportError::Closed),
            Ok(n) => {
                self.decoder.push(&self.scratch[..n]);
                self.stats.record_recv(n);
                Ok(true)
            }
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::Interrupted =>
            {
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn next_frame(&mut self) -> TransportResult<Option<Frame>> {
        if let Some(frame) = self.decoder.next_frame()? {
            return Ok(Some(frame));
        }
        if !self.fill()? {
            return Ok(None);
        }
        self.decoder.next_frame()
    }

    fn init_step(&mut self) -> TransportResult<InitProgress> {
        match self.phase {
            Phase::Connecting => {
                if let Some(err) = self.stream.take_error()? {
                    return Err(TransportError::ConnectionFailed(err.to_string()));
                }
                match self.stream.peer_addr() {
                    Ok(addr) => {
                        self.info.peer_addr = Some(addr);
                        let request = ConnectRequest {
                            version: self.info.version,
                            ping_timeout: self.info.ping_timeout,
                        };
                        self.queue(FrameKind::ConnectRequest, &request.to_bytes())?;
                        self.flush_out()?;
                        self.phase = Phase::AwaitAck;
                        tracing::trace!("TCP connected to {}, awaiting ack", addr);
                        Ok(InitProgress::InProgress)
                    }
                    Err(e) if e.kind() == io::ErrorKind::NotConnected => {
                        Ok(InitProgress::InProgress)
                    }
                    Err(e) => Err(TransportError::ConnectionFailed(e.to_string())),
                }
            }
            Phase::AwaitAck => {
                self.flush_out()?;
                match self.next_frame()? {
                    None => Ok(InitProgress::InProgress),
                    Some(Frame {
                        kind: FrameKind::ConnectAck,
                        body,
                    }) => {
                        let ack = ConnectAck::from_bytes(&body)?;
                        if !ack.version.is_compatible(self.info.version) {
                            return Err(TransportError::Protocol(format!(
                                "server speaks version {}, we speak {}",
                                ack.version, self.info.version
                            )));
                        }
                        self.info.ping_timeout = ack.ping_timeout;
                        self.info.max_fragment_size = ack.max_fragment_size;
                        self.info.version = ack.version;
                        self.phase = Phase::Active;
                        Ok(InitProgress::Active)
                    }
                    Some(Frame {
                        kind: FrameKind::Close,
                        ..
                    }) => Err(TransportError::Closed),
                    Some(frame) => Err(TransportError::Protocol(format!(
                        "expected connect ack, got {:?}",
                        frame.kind
                    ))),
                }
            }
            Phase::AwaitRequest => match self.next_frame()? {
                None => Ok(InitProgress::InProgress),
                Some(Frame {
                    kind: FrameKind::ConnectRequest,
                    body,
                }) => {
                    let request = ConnectRequest::from_bytes(&body)?;
                    if !request.version.is_compatible(self.info.version) {
                        return Err(TransportError::Protocol(format!(
                            "client speaks version {}, we speak {}",
                            request.version, self.info.version
                        )));
                    }
                    let params = self.accept_params.clone().ok_or_else(|| {
                        TransportError::Protocol("connect request on initiating side".into())
                    })?;
                    let ack = ConnectAck {
                        version: self.info.version,
                        ping_timeout: negotiate_ping_timeout(
                            request.ping_timeout,
                            params.ping_timeout,
                            params.min_ping_timeout,
                        ),
                        max_fragment_size: params.max_fragment_size,
                    };
                    self.queue(FrameKind::ConnectAck, &ack.to_bytes())?;
                    self.flush_out()?;
                    self.info.ping_timeout = ack.ping_timeout;
                    self.phase = Phase::Active;
                    Ok(InitProgress::Active)
                }
                Some(frame) => Err(TransportError::Protocol(format!(
                    "expected connect request, got {:?}",
                    frame.kind
                ))),
            },
            Phase::Active => Ok(InitProgress::Active),
            Phase::Failed => Err(TransportError::NotActive),
        }
    }

    fn read_step(&mut self) -> TransportResult<ReadOutcome> {
        match self.next_frame()? {
            None => Ok(ReadOutcome::WouldBlock),
            Some(frame) => match frame.kind {
                FrameKind::Data => {
                    self.stats.frames_received += 1;
                    Ok(ReadOutcome::Data(frame.body))
                }
                FrameKind::Ping => {
                    self.stats.pings_received += 1;
                    Ok(ReadOutcome::Ping)
                }
                FrameKind::Close => Err(TransportError::Closed),
                kind => Err(TransportError::Protocol(format!(
                    "unexpected {kind:?} frame on active channel"
                ))),
            },
        }
    }

    fn ensure_active(&self) -> TransportResult<()> {
        if self.phase == Phase::Active {
            Ok(())
        } else {
            Err(TransportError::NotActive)
        }
    }

    fn failed<T>(&mut self, result: TransportResult<T>) -> TransportResult<T> {
        if result.is_err() {
            self.phase = Phase::Failed;
        }
        result
    }
}

impl Channel for TcpChannel {
    fn state(&self) -> ChannelState {
        match self.phase {
            Phase::Connecting | Phase::AwaitAck | Phase::AwaitRequest => ChannelState::Initializing,
            Phase::Active => ChannelState::Active,
            Phase::Failed => ChannelState::Failed,
        }
    }

    fn init(&mut self) -> TransportResult<InitProgress> {
        let result = self.init_step();
        self.failed(result)
    }

    fn read(&mut self) -> TransportResult<ReadOutcome> {
        self.ensure_active()?;
        let result = self.read_step();
        self.failed(result)
    }

    fn write(&mut self, msg: &[u8]) -> TransportResult<WriteOutcome> {
        self.ensure_active()?;
        self.queue(FrameKind::Data, msg)?;
        self.stats.frames_sent += 1;
        let result = self.flush_out();
        let pending = self.failed(result)?;
        Ok(WriteOutcome {
            bytes: msg.len(),
            pending,
        })
    }

    fn flush(&mut self) -> TransportResult<usize> {
        let result = self.flush_out();
        self.failed(result)
    }

    fn ping(&mut self) -> TransportResult<()> {
        self.ensure_active()?;
        self.queue(FrameKind::Ping, &[])?;
        self.stats.pings_sent += 1;
        let result = self.flush_out().map(|_| ());
        self.failed(result)
    }

    fn info(&self) -> ChannelInfo {
        self.info.clone()
    }

    fn socket_id(&self) -> SocketId {
        raw_socket_id(&self.stream)
    }

    fn close(&mut self) {
        if self.phase == Phase::Active && self.queue(FrameKind::Close, &[]).is_ok() {
            let _ = self.flush_out();
        }
        let _ = self.stream.shutdown(Shutdown::Both);
        self.phase = Phase::Failed;
    }

    fn stats(&self) -> TransportStats {
        self.stats.clone()
    }
}

impl std::fmt::Debug for TcpChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpChannel")
            .field("phase", &self.phase)
            .field("peer", &self.info.peer_addr)
            .field("pending", &self.out.len())
            .finish()
    }
}

/// Listening TCP server
#[derive(Debug)]
pub struct Server {
    listener: TcpListener,
    opts: BindOptions,
}

impl Server {
    /// Bind and listen.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Io` if the address cannot be bound.
    pub fn bind(opts: &BindOptions) -> TransportResult<Self> {
        if opts.min_ping_timeout > opts.ping_timeout {
            return Err(TransportError::InvalidConfig(
                "min_ping_timeout exceeds ping_timeout".into(),
            ));
        }

        let socket = Socket::new(
            Domain::for_address(opts.addr),
            Type::STREAM,
            Some(Protocol::TCP),
        )?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&opts.addr.into())?;
        socket.listen(opts.backlog)?;

        let listener: TcpListener = socket.into();
        tracing::info!("Listening on {}", listener.local_addr()?);

        Ok(Self {
            listener,
            opts: opts.clone(),
        })
    }

    /// Take one pending connection, if any.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Io` if the listener fails.
    pub fn accept(&self) -> TransportResult<Option<TcpChannel>> {
        match self.listener.accept() {
            Ok((stream, peer)) => {
                tracing::debug!("Accepted connection from {}", peer);
                TcpChannel::accepted(stream, peer, &self.opts).map(Some)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Bound address
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Io` if the address cannot be read.
    pub fn local_addr(&self) -> TransportResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Listening socket descriptor
    #[must_use]
    pub fn socket_id(&self) -> SocketId {
        raw_socket_id(&self.listener)
    }

    /// Options the server was bound with
    #[must_use]
    pub fn options(&self) -> &BindOptions {
        &self.opts
    }
}

fn connect_in_progress(e: &io::Error) -> bool {
    #[cfg(unix)]
    let in_progress = e.raw_os_error() == Some(libc::EINPROGRESS);
    #[cfg(not(unix))]
    let in_progress = false;
    in_progress || e.kind() == io::ErrorKind::WouldBlock
}

#[cfg(unix)]
fn raw_socket_id<S: std::os::fd::AsRawFd>(s: &S) -> SocketId {
    SocketId::from(s.as_raw_fd())
}

#[cfg(windows)]
fn raw_socket_id<S: std::os::windows::io::AsRawSocket>(s: &S) -> SocketId {
    s.as_raw_socket() as SocketId
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    fn loopback_server() -> Server {
        let mut opts = BindOptions::new("127.0.0.1:0".parse().unwrap());
        opts.ping_timeout = Duration::from_secs(30);
        opts.min_ping_timeout = Duration::from_millis(100);
        opts.max_fragment_size = 4096;
        Server::bind(&opts).unwrap()
    }

    fn establish(server: &Server, opts: &ChannelOptions) -> (TcpChannel, TcpChannel) {
        let port = server.local_addr().unwrap().port().to_string();
        let mut client = TcpChannel::connect(&ConnectInfo::new("127.0.0.1", port), opts).unwrap();
        let mut accepted: Option<TcpChannel> = None;
        let deadline = Instant::now() + Duration::from_secs(5);

        loop {
            if accepted.is_none() {
                accepted = server.accept().unwrap();
            }
            let c = client.init().unwrap();
            let s = match accepted.as_mut() {
                Some(ch) => ch.init().unwrap(),
                None => InitProgress::InProgress,
            };
            if c == InitProgress::Active && s == InitProgress::Active {
                break;
            }
            assert!(Instant::now() < deadline, "handshake did not complete");
            thread::sleep(Duration::from_millis(1));
        }

        (client, accepted.unwrap())
    }

    fn read_blocking(ch: &mut TcpChannel) -> TransportResult<ReadOutcome> {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            match ch.read()? {
                ReadOutcome::WouldBlock => {
                    assert!(Instant::now() < deadline, "nothing to read");
                    thread::sleep(Duration::from_millis(1));
                }
                other => return Ok(other),
            }
        }
    }

    #[test]
    fn test_handshake_negotiates_parameters() {
        let server = loopback_server();
        let opts = ChannelOptions {
            ping_timeout: Duration::from_secs(90),
            ..ChannelOptions::default()
        };
        let (client, accepted) = establish(&server, &opts);

        assert_eq!(client.state(), ChannelState::Active);
        assert_eq!(accepted.state(), ChannelState::Active);
        assert_eq!(client.info().ping_timeout, Duration::from_secs(30));
        assert_eq!(accepted.info().ping_timeout, Duration::from_secs(30));
        assert_eq!(client.info().max_fragment_size, 4096);
        assert!(client.info().peer_addr.is_some());
    }

    #[test]
    fn test_data_and_ping_exchange() {
        let server = loopback_server();
        let (mut client, mut accepted) = establish(&server, &ChannelOptions::default());

        let out = client.write(b"market data").unwrap();
        assert_eq!(out.bytes, 11);
        client.ping().unwrap();

        assert_eq!(
            read_blocking(&mut accepted).unwrap(),
            ReadOutcome::Data(b"market data".to_vec())
        );
        assert_eq!(read_blocking(&mut accepted).unwrap(), ReadOutcome::Ping);
        assert_eq!(accepted.read().unwrap(), ReadOutcome::WouldBlock);

        let stats = client.stats();
        assert_eq!(stats.frames_sent, 1);
        assert_eq!(stats.pings_sent, 1);
        assert_eq!(accepted.stats().pings_received, 1);
    }

    #[test]
    fn test_close_reaches_peer() {
        let server = loopback_server();
        let (mut client, mut accepted) = establish(&server, &ChannelOptions::default());

        client.close();
        assert_eq!(client.state(), ChannelState::Failed);
        assert!(matches!(
            read_blocking(&mut accepted),
            Err(TransportError::Closed)
        ));
        assert_eq!(accepted.state(), ChannelState::Failed);
    }

    #[test]
    fn test_write_requires_active() {
        let server = loopback_server();
        let port = server.local_addr().unwrap().port().to_string();
        let mut client =
            TcpChannel::connect(&ConnectInfo::new("127.0.0.1", port), &ChannelOptions::default())
                .unwrap();

        assert_eq!(client.state(), ChannelState::Initializing);
        assert!(matches!(
            client.write(b"early"),
            Err(TransportError::NotActive)
        ));
    }

    #[test]
    fn test_unresolvable_host_fails_immediately() {
        let info = ConnectInfo::new("no.such.host.invalid", "14002");
        assert!(matches!(
            TcpChannel::connect(&info, &ChannelOptions::default()),
            Err(TransportError::Resolve(_))
        ));

        let info = ConnectInfo::new("127.0.0.1", "not-a-port");
        assert!(matches!(
            TcpChannel::connect(&info, &ChannelOptions::default()),
            Err(TransportError::Resolve(_))
        ));
    }

    #[test]
    fn test_refused_connection_fails() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let info = ConnectInfo::new("127.0.0.1", port.to_string());

        let mut ch = match TcpChannel::connect(&info, &ChannelOptions::default()) {
            Ok(ch) => ch,
            Err(_) => return,
        };
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            match ch.init() {
                Err(_) => break,
                Ok(InitProgress::InProgress) => {
                    assert!(Instant::now() < deadline, "refused connect never failed");
                    thread::sleep(Duration::from_millis(1));
                }
                Ok(InitProgress::Active) => panic!("connected to a closed port"),
            }
        }
        assert_eq!(ch.state(), ChannelState::Failed);
    }

    #[test]
    fn test_accept_without_pending_connection() {
        let server = loopback_server();
        assert!(server.accept().unwrap().is_none());
    }

    #[test]
    fn test_bind_rejects_inverted_ping_bounds() {
        let mut opts = BindOptions::new("127.0.0.1:0".parse().unwrap());
        opts.min_ping_timeout = Duration::from_secs(120);
        assert!(matches!(
            Server::bind(&opts),
            Err(TransportError::InvalidConfig(_))
        ));
    }
}
