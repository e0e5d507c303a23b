//! Interactive provider that answers administrative requests.
//!
//! Every login request is accepted, directory requests are answered with the
//! configured services, and dictionary requests with a small synthetic
//! field or enum table.

use serde_json::json;
use std::sync::Arc;
use tern_codec::{
    DictionaryMsg, DictionaryRefresh, DictionaryRequest, DictionaryType, DirectoryMsg,
    DirectoryRefresh, LoginMsg, LoginRefresh, RdmMsg, Service,
};
use tern_reactor::{
    CallbackReturn, ChannelEventKind, ProviderRole, Reactor, RdmMsgEvent, Role,
};

/// Services offered, ids assigned from 1 in order
#[must_use]
pub fn services(names: &[String]) -> Vec<Service> {
    (1u16..)
        .zip(names)
        .map(|(id, name)| Service::new(id, name.clone()))
        .collect()
}

/// Synthetic dictionary body
#[must_use]
pub fn dictionary_content(kind: DictionaryType) -> Vec<u8> {
    let table = match kind {
        DictionaryType::FieldDefinitions => json!([
            { "fid": 22, "acronym": "BID", "type": "REAL" },
            { "fid": 25, "acronym": "ASK", "type": "REAL" },
            { "fid": 6, "acronym": "TRDPRC_1", "type": "REAL" },
            { "fid": 15, "acronym": "CURRENCY", "type": "ENUM" },
        ]),
        DictionaryType::EnumTables => json!({
            "CURRENCY": { "840": "USD", "978": "EUR", "826": "GBP" },
        }),
    };
    serde_json::to_vec(&table).unwrap_or_default()
}

fn answer_dictionary(request: &DictionaryRequest) -> DictionaryMsg {
    match DictionaryType::for_name(&request.dictionary_name) {
        Some(kind) => {
            DictionaryMsg::Refresh(DictionaryRefresh::answering(request, kind, dictionary_content(kind)))
        }
        None => DictionaryMsg::Status(tern_codec::DictionaryStatus {
            stream_id: request.stream_id,
            status: Some(tern_codec::StreamStatus::closed(format!(
                "Unknown dictionary {}",
                request.dictionary_name
            ))),
        }),
    }
}

fn reply(reactor: &Reactor, event: &RdmMsgEvent<impl std::fmt::Debug>, msg: RdmMsg) {
    if let Err(e) = reactor.submit_rdm(event.base.channel, &msg) {
        tracing::warn!(
            "Channel {}: could not answer {:?}: {}",
            event.base.channel,
            event.rdm,
            e
        );
    }
}

/// Provider role answering every administrative request
#[must_use]
pub fn role(services: Vec<Service>) -> Role {
    let services = Arc::new(services);

    let provider = ProviderRole::default()
        .on_login(|reactor, event| {
            match &event.rdm {
                LoginMsg::Request(request) => {
                    tracing::info!(
                        "Channel {}: login from {}",
                        event.base.channel,
                        request.user_name
                    );
                    let refresh = LoginRefresh::accepting(request);
                    reply(reactor, event, LoginMsg::Refresh(refresh).into());
                }
                LoginMsg::Close { .. } => {
                    tracing::info!("Channel {}: login closed", event.base.channel);
                }
                other => tracing::debug!("Channel {}: {:?}", event.base.channel, other),
            }
            CallbackReturn::Success
        })
        .on_directory(move |reactor, event| match &event.rdm {
            DirectoryMsg::Request(request) => {
                let refresh = DirectoryRefresh::answering(request, services.as_ref().clone());
                reply(reactor, event, DirectoryMsg::Refresh(refresh).into());
                CallbackReturn::Success
            }
            _ => CallbackReturn::Raise,
        })
        .on_dictionary(|reactor, event| match &event.rdm {
            DictionaryMsg::Request(request) => {
                reply(reactor, event, answer_dictionary(request).into());
                CallbackReturn::Success
            }
            DictionaryMsg::Close { stream_id } => {
                tracing::info!(
                    "Channel {}: dictionary stream {} closed",
                    event.base.channel,
                    stream_id
                );
                CallbackReturn::Success
            }
            _ => CallbackReturn::Raise,
        });

    Role::provider(provider)
        .on_default_msg(|_, event| {
            println!("{}", crate::output::msg_event(event, None));
            CallbackReturn::Success
        })
        .on_channel_event(|reactor, event| {
            println!("{}", crate::output::channel_event(event));
            if event.kind == ChannelEventKind::Down {
                if let Err(e) = reactor.close_channel(event.channel) {
                    tracing::debug!("Channel {} already closed: {}", event.channel, e);
                }
            }
            CallbackReturn::Success
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_services_numbered_from_one() {
        let services = services(&["A".to_string(), "B".to_string()]);
        assert_eq!(services[0].service_id, 1);
        assert_eq!(services[1].service_id, 2);
        assert_eq!(services[1].name(), Some("B"));
    }

    #[test]
    fn test_dictionary_answers() {
        let request = DictionaryRequest::new(3, 1, tern_codec::FIELD_DICTIONARY_NAME);
        match answer_dictionary(&request) {
            DictionaryMsg::Refresh(r) => {
                assert_eq!(r.stream_id, 3);
                assert!(r.complete);
                assert!(!r.content.is_empty());
            }
            other => panic!("unexpected {other:?}"),
        }

        let request = DictionaryRequest::new(4, 1, "NoSuchDictionary");
        assert!(matches!(answer_dictionary(&request), DictionaryMsg::Status(_)));
    }

    #[test]
    fn test_role_validates_for_accept() {
        assert!(role(Vec::new()).validate_for_accept().is_ok());
    }

    #[test]
    fn test_disconnected_consumer_is_closed() {
        use std::time::{Duration, Instant};
        use tern_reactor::{
            AcceptOptions, ConnectOptions, ConsumerRole, DispatchOptions, ReactorConfig,
            ReactorError,
        };
        use tern_transport::{BindOptions, Server};

        let server = Server::bind(&BindOptions::new("127.0.0.1:0".parse().unwrap())).unwrap();
        let port = server.local_addr().unwrap().port();
        let provider = Reactor::new(ReactorConfig::default()).unwrap();
        let consumer = Reactor::new(ReactorConfig::default()).unwrap();

        let consumer_role = Role::consumer(ConsumerRole::default())
            .on_default_msg(|_, _| CallbackReturn::Success)
            .on_channel_event(|_, _| CallbackReturn::Success);
        let id = consumer
            .connect(&ConnectOptions::new("127.0.0.1", port.to_string()), consumer_role)
            .unwrap();

        let provider_role = role(services(&["A".to_string()]));
        let opts = DispatchOptions::default();
        let deadline = Instant::now() + Duration::from_secs(10);
        let mut accepted = false;
        while Instant::now() < deadline {
            if !accepted {
                match provider.accept(&server, &AcceptOptions::default(), provider_role.clone()) {
                    Ok(_) => accepted = true,
                    Err(ReactorError::NoPendingConnection) => {}
                    Err(e) => panic!("accept failed: {e}"),
                }
            }
            provider.dispatch(&opts).unwrap();
            consumer.dispatch(&opts).unwrap();
            if accepted && consumer.channel_info(id).unwrap().state.is_connected() {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(provider.channels().len(), 1);

        consumer.close_channel(id).unwrap();
        consumer.destroy().unwrap();

        while !provider.channels().is_empty() && Instant::now() < deadline {
            provider.dispatch(&opts).unwrap();
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(provider.channels().is_empty());
        provider.destroy().unwrap();
    }
}
