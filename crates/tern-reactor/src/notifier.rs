//! Level-triggered readiness notification.
//!
//! The reactor signals the notifier while its event queue is non-empty and
//! clears it when the queue drains. Applications either block on
//! [`Notifier::wait`] or register [`Notifier::fd`] with their own poller;
//! the descriptor stays readable exactly while the notifier is signaled.

use std::io;
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::Duration;
use tern_transport::SocketId;

#[cfg(unix)]
use std::io::{Read, Write};
#[cfg(unix)]
use std::os::unix::net::UnixStream;

/// Readiness notifier
#[derive(Debug)]
pub struct Notifier {
    signaled: Mutex<bool>,
    cond: Condvar,
    #[cfg(unix)]
    pipe: (UnixStream, UnixStream),
}

impl Notifier {
    /// Create an unsignaled notifier
    ///
    /// # Errors
    ///
    /// Returns an error if the descriptor pair cannot be created.
    pub fn new() -> io::Result<Self> {
        #[cfg(unix)]
        let pipe = {
            let (reader, writer) = UnixStream::pair()?;
            reader.set_nonblocking(true)?;
            writer.set_nonblocking(true)?;
            (reader, writer)
        };

        Ok(Self {
            signaled: Mutex::new(false),
            cond: Condvar::new(),
            #[cfg(unix)]
            pipe,
        })
    }

    /// Mark events as available
    pub fn signal(&self) {
        let mut signaled = self.signaled.lock().unwrap_or_else(PoisonError::into_inner);
        if !*signaled {
            *signaled = true;
            self.raise_fd();
        }
        self.cond.notify_all();
    }

    /// Mark events as drained
    pub fn clear(&self) {
        let mut signaled = self.signaled.lock().unwrap_or_else(PoisonError::into_inner);
        if *signaled {
            *signaled = false;
            self.drain_fd();
        }
    }

    /// Whether events are available
    #[must_use]
    pub fn is_signaled(&self) -> bool {
        *self.signaled.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block until signaled or `timeout` elapses; true if signaled
    pub fn wait(&self, timeout: Duration) -> bool {
        let guard = self.signaled.lock().unwrap_or_else(PoisonError::into_inner);
        let (guard, _) = self
            .cond
            .wait_timeout_while(guard, timeout, |signaled| !*signaled)
            .unwrap_or_else(PoisonError::into_inner);
        *guard
    }

    /// Descriptor readable while signaled, for external multiplexers
    #[cfg(unix)]
    #[must_use]
    pub fn fd(&self) -> Option<SocketId> {
        use std::os::fd::AsRawFd;
        Some(SocketId::from(self.pipe.0.as_raw_fd()))
    }

    /// Descriptor readable while signaled, for external multiplexers
    #[cfg(not(unix))]
    #[must_use]
    pub fn fd(&self) -> Option<SocketId> {
        None
    }

    #[cfg(unix)]
    fn raise_fd(&self) {
        if let Err(e) = (&self.pipe.1).write(&[1]) {
            tracing::error!("Failed to signal notifier descriptor: {}", e);
        }
    }

    #[cfg(not(unix))]
    fn raise_fd(&self) {}

    #[cfg(unix)]
    fn drain_fd(&self) {
        let mut sink = [0u8; 16];
        while let Ok(n) = (&self.pipe.0).read(&mut sink) {
            if n == 0 {
                break;
            }
        }
    }

    #[cfg(not(unix))]
    fn drain_fd(&self) {}
}
