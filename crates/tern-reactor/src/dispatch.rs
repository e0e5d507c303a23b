//! Event delivery.
//!
//! [`Reactor::dispatch`] pops queued events one at a time under the state
//! lock, then releases the lock before running the callback, so callbacks may
//! call back into the reactor (submit, close, connect, dispatch) and may
//! block without stalling the worker. Any number of threads may dispatch
//! concurrently. Each event is delivered exactly once, and while one of a
//! channel's callbacks runs that channel's later events stay queued, so a
//! channel never sees its events out of order or overlapping.

use crate::error::{ReactorError, Result};
use crate::event::{ChannelEvent, ChannelEventKind, Event, MsgEvent, RdmMsgEvent};
use crate::reactor::{Reactor, ReactorState};
use crate::role::{
    CallbackReturn, ChannelEventCallback, DefaultMsgCallback, DictionaryMsgCallback,
    DirectoryMsgCallback, LoginMsgCallback,
};
use crate::session::{ChannelId, SessionState};
use std::sync::atomic::Ordering;
use tern_codec::{DictionaryMsg, DirectoryMsg, LoginMsg, RdmMsg};

/// Default number of events a single dispatch call delivers
pub const DEFAULT_MAX_MESSAGES: usize = 100;

/// Dispatch limits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchOptions {
    /// Most events to deliver; must be positive
    pub max_messages: usize,
    /// Deliver only this channel's events
    pub channel: Option<ChannelId>,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            max_messages: DEFAULT_MAX_MESSAGES,
            channel: None,
        }
    }
}

impl DispatchOptions {
    /// Deliver only `channel`'s events
    #[must_use]
    pub fn for_channel(channel: ChannelId) -> Self {
        Self {
            channel: Some(channel),
            ..Self::default()
        }
    }

    /// Deliver at most `max_messages` events
    #[must_use]
    pub fn with_max_messages(mut self, max_messages: usize) -> Self {
        self.max_messages = max_messages;
        self
    }
}

/// Outcome of a dispatch call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchStatus {
    /// Nothing was queued
    WouldBlock,
    /// Some events were processed
    Processed {
        /// Events processed in this call
        processed: usize,
        /// Matching events still queued
        remaining: usize,
    },
}

impl DispatchStatus {
    /// Events processed
    #[must_use]
    pub fn processed(&self) -> usize {
        match self {
            DispatchStatus::WouldBlock => 0,
            DispatchStatus::Processed { processed, .. } => *processed,
        }
    }

    /// Whether matching events remain queued
    #[must_use]
    pub fn has_more(&self) -> bool {
        matches!(self, DispatchStatus::Processed { remaining, .. } if *remaining > 0)
    }
}

enum Typed {
    Login(LoginMsgCallback, LoginMsg),
    Directory(DirectoryMsgCallback, DirectoryMsg),
    Dictionary(DictionaryMsgCallback, DictionaryMsg),
}

enum Delivery {
    Channel(Option<ChannelEventCallback>, ChannelEvent),
    Msg {
        default: Option<DefaultMsgCallback>,
        typed: Option<Typed>,
        event: MsgEvent,
    },
}

impl ReactorState {
    /// Oldest matching event whose channel has no callback running
    fn pop_event(&mut self, channel: Option<ChannelId>) -> Option<Event> {
        let pos = self.queue.iter().position(|e| {
            let id = e.channel();
            channel.is_none_or(|c| c == id) && !self.delivering.contains(&id)
        })?;
        self.queue.remove(pos)
    }

    fn has_deliverable(&self) -> bool {
        self.queue
            .iter()
            .any(|e| !self.delivering.contains(&e.channel()))
    }

    fn pending_for(&self, channel: Option<ChannelId>) -> usize {
        match channel {
            None => self.queue.len(),
            Some(id) => self.queue.iter().filter(|e| e.channel() == id).count(),
        }
    }

    /// Resolve callbacks for an event; None if nothing is delivered
    fn prepare(&mut self, event: Event) -> Option<Delivery> {
        let session = self.sessions.get_mut(&event.channel())?;
        let role = &session.role;

        match event {
            Event::Channel(ev) => {
                let callback = role.channel_event_callback.clone();
                if ev.kind == ChannelEventKind::Ready && session.state == SessionState::Ready {
                    session.transition(SessionState::Active);
                }
                Some(Delivery::Channel(callback, ev))
            }
            Event::Msg { event, rdm } => {
                let handlers = role.handlers();
                let typed = match rdm {
                    Some(RdmMsg::Login(m)) => handlers
                        .login_callback()
                        .map(|cb| Typed::Login(cb.clone(), m)),
                    Some(RdmMsg::Directory(m)) => handlers
                        .directory_callback()
                        .map(|cb| Typed::Directory(cb.clone(), m)),
                    Some(RdmMsg::Dictionary(m)) => handlers
                        .dictionary_callback()
                        .map(|cb| Typed::Dictionary(cb.clone(), m)),
                    None => None,
                };
                Some(Delivery::Msg {
                    default: role.default_msg_callback.clone(),
                    typed,
                    event,
                })
            }
            Event::FlushComplete(id) => {
                tracing::trace!("Channel {} flush complete", id);
                None
            }
        }
    }
}

/// Releases a channel for delivery once its callback returns or unwinds
struct Delivering<'a> {
    reactor: &'a Reactor,
    channel: ChannelId,
}

impl Drop for Delivering<'_> {
    fn drop(&mut self) {
        let mut state = self.reactor.inner.lock_state();
        state.delivering.remove(&self.channel);
        if state.queue.iter().any(|e| e.channel() == self.channel) {
            self.reactor.inner.notifier.signal();
        }
    }
}

impl Reactor {
    /// Deliver queued events to their channels' callbacks.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if `max_messages` is zero; `UnknownChannel` if the
    /// dispatch is scoped to a channel that is not open; `Shutdown` after
    /// destroy.
    pub fn dispatch(&self, opts: &DispatchOptions) -> Result<DispatchStatus> {
        if opts.max_messages == 0 {
            return Err(ReactorError::invalid("max_messages must be positive"));
        }

        let mut processed = 0;
        while processed < opts.max_messages {
            let (channel, delivery) = {
                let mut state = self.inner.lock_state();
                if state.shut_down {
                    return Err(ReactorError::Shutdown);
                }
                if let Some(id) = opts.channel {
                    if !state.sessions.contains_key(&id) {
                        // Closed by one of this call's own callbacks.
                        if processed > 0 {
                            break;
                        }
                        return Err(ReactorError::UnknownChannel(id));
                    }
                }
                let Some(event) = state.pop_event(opts.channel) else {
                    // Events held back by running callbacks are re-signaled
                    // when those callbacks return.
                    if !state.has_deliverable() {
                        self.inner.notifier.clear();
                    }
                    break;
                };
                if state.queue.is_empty() {
                    self.inner.notifier.clear();
                }
                let channel = event.channel();
                let delivery = state.prepare(event);
                if delivery.is_some() {
                    state.delivering.insert(channel);
                }
                (channel, delivery)
            };

            processed += 1;
            if let Some(delivery) = delivery {
                let _delivering = Delivering {
                    reactor: self,
                    channel,
                };
                self.deliver(delivery);
            }
        }

        if processed == 0 {
            return Ok(DispatchStatus::WouldBlock);
        }
        self.inner
            .stats
            .events_dispatched
            .fetch_add(processed as u64, Ordering::Relaxed);

        let remaining = self.inner.lock_state().pending_for(opts.channel);
        Ok(DispatchStatus::Processed {
            processed,
            remaining,
        })
    }

    fn deliver(&self, delivery: Delivery) {
        match delivery {
            Delivery::Channel(callback, event) => {
                if let Some(callback) = callback {
                    callback(self, &event);
                }
            }
            Delivery::Msg {
                default,
                typed,
                event,
            } => {
                let (ret, event) = match typed {
                    None => (CallbackReturn::Raise, event),
                    Some(Typed::Login(callback, rdm)) => {
                        let ev = RdmMsgEvent { base: event, rdm };
                        (callback(self, &ev), ev.base)
                    }
                    Some(Typed::Directory(callback, rdm)) => {
                        let ev = RdmMsgEvent { base: event, rdm };
                        (callback(self, &ev), ev.base)
                    }
                    Some(Typed::Dictionary(callback, rdm)) => {
                        let ev = RdmMsgEvent { base: event, rdm };
                        (callback(self, &ev), ev.base)
                    }
                };

                if ret == CallbackReturn::Raise {
                    if let Some(callback) = default {
                        if callback(self, &event) == CallbackReturn::Raise {
                            tracing::debug!(
                                "Channel {}: default callback raised {:?}; dropping",
                                event.channel,
                                event.msg.domain
                            );
                        }
                    }
                }
            }
        }
    }
}
