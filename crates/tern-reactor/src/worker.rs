//! Reactor worker thread.
//!
//! The worker owns all transport-level progress so the application thread
//! only ever dispatches:
//! - Connection establishment and reconnect scheduling (resolved and
//!   connected with the state lock released)
//! - Transport initialization with timeout enforcement
//! - Inbound reads, decode and automatic handshakes
//! - Ping send/receive liveness
//! - Flushing queued output
//!
//! It runs a fixed tick, woken early by commands from the reactor handle,
//! and holds only a weak reference to the reactor so dropping every handle
//! stops it.

use crate::buffer_pool::BufferPool;
use crate::error::DisconnectReason;
use crate::event::Event;
use crate::handshake;
use crate::reactor::{Inner, ReactorState};
use crate::session::{ChannelId, Origin, Session, SessionState};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::Weak;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tern_codec::Codec;
use tern_transport::{
    Channel, ChannelOptions, ConnectInfo, InitProgress, ReadOutcome, TcpChannel, TransportResult,
};
use tracing::{debug, trace, warn};

/// A ping is sent after this fraction of the ping timeout without output.
pub const PING_SEND_DIVISOR: u32 = 3;

/// A channel with no input for this many ping timeouts is down.
pub const LIVENESS_WINDOW_FACTOR: u32 = 1;

/// Capacity of the command queue to the worker
pub(crate) const COMMAND_QUEUE_CAPACITY: usize = 1024;

/// Command from the reactor handle to its worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WorkerCommand {
    /// Run a tick now
    Wake,
    /// Exit the loop
    Shutdown,
}

/// Worker thread statistics
#[derive(Debug, Default)]
pub struct WorkerStats {
    /// Ticks run
    pub ticks: AtomicU64,
    /// Outbound connection attempts
    pub connect_attempts: AtomicU64,
    /// Pings sent
    pub pings_sent: AtomicU64,
    /// Messages read from channels
    pub messages_received: AtomicU64,
    /// Events queued for dispatch
    pub events_queued: AtomicU64,
    /// Events popped by dispatch
    pub events_dispatched: AtomicU64,
}

/// Per-tick view of shared reactor state
pub(crate) struct Tick<'a> {
    pub(crate) codec: &'a dyn Codec,
    pub(crate) pool: &'a mut BufferPool,
    pub(crate) queue: &'a mut VecDeque<Event>,
    pub(crate) now: Instant,
    pub(crate) max_reads: usize,
}

/// Start the worker thread
pub(crate) fn spawn(
    inner: Weak<Inner>,
    commands: Receiver<WorkerCommand>,
    tick: Duration,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("tern-reactor-worker".to_string())
        .spawn(move || run(&inner, &commands, tick))
}

fn run(inner: &Weak<Inner>, commands: &Receiver<WorkerCommand>, tick: Duration) {
    debug!("Reactor worker started (tick {:?})", tick);

    loop {
        match commands.recv_timeout(tick) {
            Ok(WorkerCommand::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
            Ok(WorkerCommand::Wake) | Err(RecvTimeoutError::Timeout) => {}
        }

        let Some(inner) = inner.upgrade() else {
            break;
        };
        if !run_tick(&inner, Instant::now()) {
            break;
        }
    }

    debug!("Reactor worker stopped");
}

/// Outbound attempt picked under the state lock and connected outside it
pub(crate) struct PendingConnect {
    pub(crate) id: ChannelId,
    info: ConnectInfo,
    opts: ChannelOptions,
}

/// Service every session once; false once the reactor is shut down
pub(crate) fn run_tick(inner: &Inner, now: Instant) -> bool {
    let pending = {
        let mut state = inner.lock_state();
        if state.shut_down {
            return false;
        }
        due_connects(&mut state.sessions, now)
    };

    // Name resolution blocks, so no lock is held here.
    let attempts: Vec<_> = pending
        .into_iter()
        .map(|p| {
            inner.stats.connect_attempts.fetch_add(1, Ordering::Relaxed);
            (p.id, TcpChannel::connect(&p.info, &p.opts))
        })
        .collect();

    let mut guard = inner.lock_state();
    if guard.shut_down {
        return false;
    }

    let ReactorState {
        sessions,
        queue,
        pool,
        ..
    } = &mut *guard;
    let before = queue.len();
    {
        let mut cx = Tick {
            codec: inner.codec.as_ref(),
            pool,
            queue,
            now,
            max_reads: inner.config.max_reads_per_tick,
        };
        finish_connects(sessions, &mut cx, attempts);
        for session in sessions.values_mut() {
            service(session, &mut cx, &inner.stats);
        }
    }

    let queued = queue.len().saturating_sub(before);
    if queued > 0 {
        inner
            .stats
            .events_queued
            .fetch_add(queued as u64, Ordering::Relaxed);
    }
    if !queue.is_empty() {
        inner.notifier.signal();
    }
    inner.stats.ticks.fetch_add(1, Ordering::Relaxed);
    true
}

/// Move due sessions to Connecting and collect what they connect to
pub(crate) fn due_connects(
    sessions: &mut HashMap<ChannelId, Session>,
    now: Instant,
) -> Vec<PendingConnect> {
    let mut pending = Vec::new();
    for session in sessions.values_mut() {
        let due = matches!(
            session.state,
            SessionState::Connecting | SessionState::DownReconnecting
        ) && now >= session.retry_at;
        if !due {
            continue;
        }
        let Origin::Outbound(o) = &session.origin else {
            continue;
        };
        let attempt = PendingConnect {
            id: session.id,
            info: o.connect_info.clone(),
            opts: ChannelOptions {
                ping_timeout: o.ping_timeout,
                version: o.protocol_version,
                tcp_nodelay: o.tcp_nodelay,
            },
        };

        if session.state == SessionState::DownReconnecting {
            session.transition(SessionState::Connecting);
        }
        debug!(
            "Channel {} connecting to {}:{} (attempt {})",
            session.id,
            attempt.info.host,
            attempt.info.service,
            session.attempts_made + 1
        );
        pending.push(attempt);
    }
    pending
}

/// Install connect results; attempts for sessions closed meanwhile are dropped
pub(crate) fn finish_connects(
    sessions: &mut HashMap<ChannelId, Session>,
    cx: &mut Tick<'_>,
    attempts: Vec<(ChannelId, TransportResult<TcpChannel>)>,
) {
    for (id, result) in attempts {
        let Some(session) = sessions
            .get_mut(&id)
            .filter(|s| s.state == SessionState::Connecting)
        else {
            debug!("Channel {} closed while connecting", id);
            if let Ok(mut channel) = result {
                channel.close();
            }
            continue;
        };

        match result {
            Ok(channel) => {
                session.last_socket_id = Some(channel.socket_id());
                session.channel = Some(Box::new(channel));
                session.attempt_started = cx.now;
                session.transition(SessionState::Initializing);
            }
            Err(e) => {
                warn!("Channel {} connect failed: {}", session.id, e);
                session.fail(e.into(), cx.now, cx.queue);
            }
        }
    }
}

fn service(session: &mut Session, cx: &mut Tick<'_>, stats: &WorkerStats) {
    match session.state {
        SessionState::Initializing => initialize(session, cx),
        state if state.is_connected() => pump(session, cx, stats),
        _ => {}
    }
}

fn initialize(session: &mut Session, cx: &mut Tick<'_>) {
    if cx.now.duration_since(session.attempt_started) > session.initialization_timeout() {
        session.fail(DisconnectReason::InitializationTimeout, cx.now, cx.queue);
        return;
    }

    let Some(channel) = session.channel.as_mut() else {
        session.fail(
            DisconnectReason::Io("no transport while initializing".into()),
            cx.now,
            cx.queue,
        );
        return;
    };

    match channel.init() {
        Ok(InitProgress::Active) => handshake::channel_up(session, cx),
        Ok(InitProgress::InProgress) => {}
        Err(e) => session.fail(e.into(), cx.now, cx.queue),
    }
}

fn pump(session: &mut Session, cx: &mut Tick<'_>, stats: &WorkerStats) {
    for _ in 0..cx.max_reads {
        let Some(channel) = session.channel.as_mut() else {
            return;
        };
        match channel.read() {
            Ok(ReadOutcome::Data(bytes)) => {
                session.last_activity = cx.now;
                session.bytes_received += bytes.len() as u64;
                stats.messages_received.fetch_add(1, Ordering::Relaxed);
                handshake::on_message(session, cx, bytes);
                if !session.state.is_connected() {
                    return;
                }
            }
            Ok(ReadOutcome::Ping) => {
                trace!("Channel {} ping received", session.id);
                session.last_activity = cx.now;
            }
            Ok(ReadOutcome::WouldBlock) => break,
            Err(e) => {
                session.fail(e.into(), cx.now, cx.queue);
                return;
            }
        }
    }

    let Some(channel) = session.channel.as_mut() else {
        return;
    };
    let ping_timeout = channel.info().ping_timeout;

    if cx.now.duration_since(session.last_activity) > ping_timeout * LIVENESS_WINDOW_FACTOR {
        session.fail(DisconnectReason::PingTimeout, cx.now, cx.queue);
        return;
    }

    if cx.now.duration_since(session.last_ping_sent) >= ping_timeout / PING_SEND_DIVISOR {
        if let Err(e) = channel.ping() {
            session.fail(e.into(), cx.now, cx.queue);
            return;
        }
        session.last_ping_sent = cx.now;
        stats.pings_sent.fetch_add(1, Ordering::Relaxed);
    }

    if session.flush_pending {
        let Some(channel) = session.channel.as_mut() else {
            return;
        };
        match channel.flush() {
            Ok(0) => {
                session.flush_pending = false;
                cx.queue.push_back(Event::FlushComplete(session.id));
            }
            Ok(_) => {}
            Err(e) => session.fail(e.into(), cx.now, cx.queue),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::ConnectOptions;
    use crate::role::{CallbackReturn, ConsumerRole, Role};
    use std::net::TcpListener;
    use tern_codec::BincodeCodec;
    use tern_transport::TransportError;

    fn outbound(id: u64, port: u16, now: Instant) -> Session {
        let role = Role::consumer(ConsumerRole::default())
            .on_default_msg(|_, _| CallbackReturn::Success)
            .on_channel_event(|_, _| CallbackReturn::Success);
        let opts = ConnectOptions::new("127.0.0.1", port.to_string());
        Session::outbound(ChannelId::new(id), opts, role, now)
    }

    fn sessions(list: Vec<Session>) -> HashMap<ChannelId, Session> {
        list.into_iter().map(|s| (s.id, s)).collect()
    }

    #[test]
    fn test_due_connects_waits_for_retry_time() {
        let now = Instant::now();
        let mut session = outbound(1, 1, now);
        session.state = SessionState::DownReconnecting;
        session.retry_at = now + Duration::from_secs(1);
        let mut map = sessions(vec![session]);

        assert!(due_connects(&mut map, now).is_empty());
        assert_eq!(map[&ChannelId::new(1)].state, SessionState::DownReconnecting);

        let pending = due_connects(&mut map, now + Duration::from_secs(2));
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, ChannelId::new(1));
        assert_eq!(map[&ChannelId::new(1)].state, SessionState::Connecting);
    }

    #[test]
    fn test_due_connects_skips_connected_sessions() {
        let now = Instant::now();
        let mut up = outbound(1, 1, now);
        up.state = SessionState::Up;
        let mut map = sessions(vec![up, outbound(2, 1, now)]);

        let pending = due_connects(&mut map, now);
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, ChannelId::new(2));
    }

    #[test]
    fn test_finish_connects_installs_and_discards() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let now = Instant::now();
        let mut map = sessions(vec![outbound(1, port, now), outbound(2, port, now)]);

        let attempts: Vec<_> = due_connects(&mut map, now)
            .into_iter()
            .map(|p| (p.id, TcpChannel::connect(&p.info, &p.opts)))
            .collect();
        assert_eq!(attempts.len(), 2);

        // Channel 2 is closed while its connect is in flight.
        map.remove(&ChannelId::new(2));

        let mut pool = BufferPool::new(4);
        let mut queue = VecDeque::new();
        let mut cx = Tick {
            codec: &BincodeCodec,
            pool: &mut pool,
            queue: &mut queue,
            now,
            max_reads: 1,
        };
        finish_connects(&mut map, &mut cx, attempts);

        assert_eq!(map.len(), 1);
        let session = &map[&ChannelId::new(1)];
        assert_eq!(session.state, SessionState::Initializing);
        assert!(session.channel.is_some());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_finish_connects_reports_failure() {
        let now = Instant::now();
        let mut map = sessions(vec![outbound(1, 1, now)]);
        let pending = due_connects(&mut map, now);
        let attempts = vec![(
            pending[0].id,
            Err(TransportError::Resolve("nowhere.invalid".into())),
        )];

        let mut pool = BufferPool::new(4);
        let mut queue = VecDeque::new();
        let mut cx = Tick {
            codec: &BincodeCodec,
            pool: &mut pool,
            queue: &mut queue,
            now,
            max_reads: 1,
        };
        finish_connects(&mut map, &mut cx, attempts);

        assert_eq!(map[&ChannelId::new(1)].state, SessionState::Down);
        assert_eq!(queue.len(), 1);
    }
}
