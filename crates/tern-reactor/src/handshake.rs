//! Automatic administrative handshakes.
//!
//! Once a channel's transport is active the reactor drives the role's
//! handshake on the worker thread:
//!
//! - **Consumer**: login request, then (optionally) directory request, then
//!   (optionally) one dictionary request per dictionary of the first service
//!   that lists any. Each step waits for a refresh on the stream it opened.
//! - **Non-interactive provider**: login request, then (optionally) an
//!   unsolicited directory refresh.
//! - **Provider**: nothing; ready as soon as the transport is up.
//!
//! Every inbound message is queued for the application before the handshake
//! reacts to it, so the application sees a login refresh before the Ready
//! event it triggered.

use crate::error::DisconnectReason;
use crate::event::{Event, MsgEvent};
use crate::role::{DictionaryDownloadMode, RoleKind};
use crate::session::{HandshakeStage, Session, SessionState};
use crate::worker::Tick;
use tern_codec::{
    Decoded, DictionaryMsg, DictionaryRequest, DirectoryMsg, LoginMsg, RdmMsg,
};

/// What an inbound administrative message means for the handshake
#[derive(Debug, PartialEq, Eq)]
enum Step {
    Ignore,
    Fail(DisconnectReason),
    LoginAccepted,
    DirectoryReceived(Option<(u16, Vec<String>)>),
    DictionaryComplete(i32),
}

/// Transport became active: queue Up and begin the role's handshake
pub(crate) fn channel_up(session: &mut Session, cx: &mut Tick<'_>) {
    session.mark_up(cx.now, cx.queue);

    let login = match &session.role.kind {
        RoleKind::Consumer(c) => c.login_request.clone(),
        RoleKind::NonInteractiveProvider(n) => n.login_request.clone(),
        RoleKind::Provider(_) => None,
    };

    match login {
        Some(request) => {
            tracing::debug!("Channel {} sending login request", session.id);
            if let Err(reason) = send(session, cx, LoginMsg::Request(request).into()) {
                session.fail(reason, cx.now, cx.queue);
                return;
            }
            session.transition(SessionState::Handshake(HandshakeStage::Login));
        }
        None => session.mark_ready(cx.queue),
    }
}

/// Decode, queue and react to one inbound message
pub(crate) fn on_message(session: &mut Session, cx: &mut Tick<'_>, bytes: Vec<u8>) {
    let Some(version) = session.channel.as_ref().map(|c| c.info().version) else {
        return;
    };

    let msg = match cx.codec.decode(&bytes, version) {
        Ok(Decoded::Msg(msg)) => msg,
        Ok(Decoded::Blank) => return,
        Err(e) => {
            session.fail(
                DisconnectReason::Protocol(format!("undecodable message: {e}")),
                cx.now,
                cx.queue,
            );
            return;
        }
    };

    let rdm = if msg.domain.is_administrative() {
        match RdmMsg::from_msg(&msg) {
            Ok(rdm) => Some(rdm),
            Err(e) => {
                tracing::debug!(
                    "Channel {}: {:?} message not decodable as admin message: {}",
                    session.id,
                    msg.domain,
                    e
                );
                None
            }
        }
    } else {
        None
    };

    let step = match &rdm {
        Some(rdm) => classify(session, rdm),
        None => Step::Ignore,
    };

    let event = MsgEvent {
        channel: session.id,
        msg,
        buffer: bytes.into(),
        user_spec: session.user_spec(),
    };
    cx.queue.push_back(Event::Msg { event, rdm });

    if let Err(reason) = advance(session, cx, step) {
        session.fail(reason, cx.now, cx.queue);
    }
}

fn closed_stream(status: Option<&tern_codec::StreamStatus>, what: &str) -> Option<Step> {
    status.filter(|s| s.is_closed()).map(|s| {
        Step::Fail(DisconnectReason::Protocol(format!(
            "{what} stream closed: {}",
            s.text
        )))
    })
}

fn classify(session: &Session, rdm: &RdmMsg) -> Step {
    let stream = rdm.stream_id();
    match (session.state, rdm) {
        (SessionState::Handshake(HandshakeStage::Login), RdmMsg::Login(m))
            if session.login_stream() == Some(stream) =>
        {
            if let Some(step) = closed_stream(m.status(), "login") {
                return step;
            }
            match m {
                LoginMsg::Refresh(_) => Step::LoginAccepted,
                LoginMsg::Close { .. } => Step::Fail(DisconnectReason::Protocol(
                    "login stream closed by provider".into(),
                )),
                _ => Step::Ignore,
            }
        }
        (SessionState::Handshake(HandshakeStage::Directory), RdmMsg::Directory(m))
            if session.directory_stream() == Some(stream) =>
        {
            if let Some(step) = closed_stream(m.status(), "directory") {
                return step;
            }
            match m {
                DirectoryMsg::Refresh(refresh) => {
                    let download = matches!(
                        &session.role.kind,
                        RoleKind::Consumer(c)
                            if c.dictionary_download_mode == DictionaryDownloadMode::FirstAvailable
                    );
                    let selection = download
                        .then(|| refresh.first_service_with_dictionaries())
                        .flatten()
                        .map(|s| (s.service_id, s.dictionaries_provided().to_vec()));
                    if download && selection.is_none() {
                        tracing::warn!(
                            "Channel {}: no service in the directory provides dictionaries",
                            session.id
                        );
                    }
                    Step::DirectoryReceived(selection)
                }
                _ => Step::Ignore,
            }
        }
        (SessionState::Handshake(HandshakeStage::Dictionary), RdmMsg::Dictionary(m))
            if session.outstanding_dictionaries.contains(&stream) =>
        {
            match m {
                DictionaryMsg::Refresh(r) if r.status.is_closed() => {
                    closed_stream(Some(&r.status), "dictionary").unwrap_or(Step::Ignore)
                }
                DictionaryMsg::Refresh(r) if r.complete => Step::DictionaryComplete(stream),
                DictionaryMsg::Status(s) => {
                    closed_stream(s.status.as_ref(), "dictionary").unwrap_or(Step::Ignore)
                }
                _ => Step::Ignore,
            }
        }
        _ => Step::Ignore,
    }
}

fn advance(session: &mut Session, cx: &mut Tick<'_>, step: Step) -> Result<(), DisconnectReason> {
    match step {
        Step::Ignore => Ok(()),
        Step::Fail(reason) => Err(reason),
        Step::LoginAccepted => login_accepted(session, cx),
        Step::DirectoryReceived(None) => {
            session.mark_ready(cx.queue);
            Ok(())
        }
        Step::DirectoryReceived(Some((service_id, names))) => {
            request_dictionaries(session, cx, service_id, &names)
        }
        Step::DictionaryComplete(stream) => {
            session.outstanding_dictionaries.remove(&stream);
            tracing::debug!("Channel {} dictionary stream {} complete", session.id, stream);
            if session.outstanding_dictionaries.is_empty() {
                let streams = std::mem::take(&mut session.dictionary_streams);
                for stream_id in streams {
                    send(session, cx, DictionaryMsg::Close { stream_id }.into())?;
                }
                session.mark_ready(cx.queue);
            }
            Ok(())
        }
    }
}

fn login_accepted(session: &mut Session, cx: &mut Tick<'_>) -> Result<(), DisconnectReason> {
    tracing::debug!("Channel {} login accepted", session.id);
    match &session.role.kind {
        RoleKind::Consumer(c) => match c.directory_request.clone() {
            Some(request) => {
                send(session, cx, DirectoryMsg::Request(request).into())?;
                session.transition(SessionState::Handshake(HandshakeStage::Directory));
            }
            None => session.mark_ready(cx.queue),
        },
        RoleKind::NonInteractiveProvider(n) => {
            if let Some(refresh) = n.directory_refresh.clone() {
                send(session, cx, DirectoryMsg::Refresh(refresh).into())?;
            }
            session.mark_ready(cx.queue);
        }
        RoleKind::Provider(_) => session.mark_ready(cx.queue),
    }
    Ok(())
}

fn request_dictionaries(
    session: &mut Session,
    cx: &mut Tick<'_>,
    service_id: u16,
    names: &[String],
) -> Result<(), DisconnectReason> {
    let base = session
        .login_stream()
        .max(session.directory_stream())
        .unwrap_or(0)
        + 1;

    session.transition(SessionState::Handshake(HandshakeStage::Dictionary));
    for (stream_id, name) in (base..).zip(names) {
        tracing::debug!(
            "Channel {} requesting dictionary {} from service {} on stream {}",
            session.id,
            name,
            service_id,
            stream_id
        );
        session.dictionary_streams.push(stream_id);
        session.outstanding_dictionaries.insert(stream_id);
        let request = DictionaryRequest::new(stream_id, service_id, name.clone());
        send(session, cx, DictionaryMsg::Request(request).into())?;
    }
    Ok(())
}

fn send(session: &mut Session, cx: &mut Tick<'_>, rdm: RdmMsg) -> Result<(), DisconnectReason> {
    let msg = rdm.to_msg()?;
    session
        .send(cx.codec, cx.pool, &msg, cx.now)
        .map(|_| ())
        .map_err(DisconnectReason::from)
}
