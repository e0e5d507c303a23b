//! JSON-line rendering of reactor events.

use serde_json::{Value, json};
use tern_codec::{DictionaryMsg, DirectoryMsg, LoginMsg, Msg, RdmMsg};
use tern_reactor::{ChannelEvent, MsgEvent};

/// Render a lifecycle event
#[must_use]
pub fn channel_event(event: &ChannelEvent) -> Value {
    json!({
        "type": "channel",
        "channel": event.channel.as_u64(),
        "kind": format!("{:?}", event.kind),
        "socket_id": event.socket_id,
        "reason": event.reason.as_ref().map(ToString::to_string),
    })
}

/// Render a message, with a summary of its typed form when it has one
#[must_use]
pub fn msg_event(event: &MsgEvent, rdm: Option<&RdmMsg>) -> Value {
    let mut value = json!({
        "type": "msg",
        "channel": event.channel.as_u64(),
        "domain": format!("{:?}", event.msg.domain),
        "class": format!("{:?}", event.msg.class),
        "stream_id": event.msg.stream_id,
        "name": event.msg.key_name(),
        "status": status(&event.msg),
        "payload": hex::encode(&event.msg.payload),
    });
    if let Some(rdm) = rdm {
        value["rdm"] = summarize(rdm);
    }
    value
}

fn status(msg: &Msg) -> Value {
    match &msg.status {
        Some(s) => json!({
            "stream": format!("{:?}", s.stream),
            "data": format!("{:?}", s.data),
            "text": s.text,
        }),
        None => Value::Null,
    }
}

fn summarize(rdm: &RdmMsg) -> Value {
    match rdm {
        RdmMsg::Login(LoginMsg::Refresh(r)) => json!({
            "login": "refresh",
            "user": r.user_name,
            "application": r.application_name,
        }),
        RdmMsg::Login(m) => json!({ "login": kind_name(m) }),
        RdmMsg::Directory(DirectoryMsg::Refresh(r)) => json!({
            "directory": "refresh",
            "services": r
                .services
                .iter()
                .map(|s| json!({
                    "id": s.service_id,
                    "name": s.name(),
                    "dictionaries": s.dictionaries_provided(),
                }))
                .collect::<Vec<_>>(),
        }),
        RdmMsg::Directory(m) => json!({ "directory": kind_name(m) }),
        RdmMsg::Dictionary(DictionaryMsg::Refresh(r)) => json!({
            "dictionary": "refresh",
            "name": r.dictionary_name,
            "complete": r.complete,
            "bytes": r.content.len(),
        }),
        RdmMsg::Dictionary(m) => json!({ "dictionary": kind_name(m) }),
    }
}

fn kind_name<T: std::fmt::Debug>(msg: &T) -> String {
    let debug = format!("{msg:?}");
    debug
        .split(['(', ' ', '{'])
        .next()
        .unwrap_or_default()
        .to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tern_codec::{Domain, LoginRefresh, LoginRequest, MsgClass};
    use tern_reactor::{ChannelEventKind, ChannelId, DisconnectReason};

    #[test]
    fn test_channel_event_json() {
        let event = ChannelEvent {
            kind: ChannelEventKind::Down,
            channel: ChannelId::new(3),
            socket_id: Some(9),
            user_spec: None,
            reason: Some(DisconnectReason::PingTimeout),
        };
        let value = channel_event(&event);
        assert_eq!(value["channel"], 3);
        assert_eq!(value["kind"], "Down");
        assert_eq!(value["reason"], "ping timeout");
    }

    #[test]
    fn test_msg_event_json() {
        let msg = Msg::new(MsgClass::Update, Domain::MarketPrice, 5).with_payload(vec![0xde, 0xad]);
        let event = MsgEvent {
            channel: ChannelId::new(1),
            msg,
            buffer: Arc::from(Vec::new()),
            user_spec: None,
        };
        let value = msg_event(&event, None);
        assert_eq!(value["payload"], "dead");
        assert_eq!(value["class"], "Update");
        assert!(value.get("rdm").is_none());
    }

    #[test]
    fn test_rdm_summary() {
        let refresh = LoginRefresh::accepting(&LoginRequest::new(1, "alice"));
        let rdm = RdmMsg::Login(LoginMsg::Refresh(refresh));
        let value = summarize(&rdm);
        assert_eq!(value["login"], "refresh");
        assert_eq!(value["user"], "alice");

        let close = RdmMsg::Dictionary(DictionaryMsg::Close { stream_id: 3 });
        assert_eq!(summarize(&close)["dictionary"], "close");
    }
}
