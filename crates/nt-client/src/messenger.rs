//! Correlates publish/setProperties calls with server replies and rebuilds
//! server-side state on reconnect (§4.2).

use crate::config::ClientConfig;
use crate::socket::{Socket, SocketEvent};
use nt_protocol::{
    AnnounceParams, ControlMessage, PropertiesAckParams, PublishParams, SetPropertiesParams,
    SubscribeOptions, SubscribeParams, UnannounceParams, UnpublishParams, UnsubscribeParams,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum MessengerError {
    #[error("pubuid already published")]
    AlreadyPublished,
    #[error("no announce arrived within the publish timeout")]
    NotAnnouncedTimeout,
    #[error("no acknowledging properties message arrived within the timeout")]
    NotAcknowledgedTimeout,
}

/// Inbound events the Messenger hands off to whatever drives the registry.
/// Binary value frames bypass correlation entirely and are forwarded as-is.
#[derive(Debug)]
pub enum InboundEvent {
    Announce(AnnounceParams),
    Unannounce(UnannounceParams),
    PropertiesAck(PropertiesAckParams),
    Value(nt_protocol::BinaryFrame),
}

struct PendingPublish {
    request: PublishParams,
    slot: Arc<Mutex<Option<oneshot::Sender<AnnounceParams>>>>,
}

pub struct Messenger {
    socket: Socket,
    next_pubuid: AtomicI64,
    next_subuid: AtomicI64,
    publications: Mutex<HashMap<i64, PublishParams>>,
    subscriptions: Mutex<HashMap<i64, SubscribeParams>>,
    pending_publishes: Mutex<HashMap<i64, PendingPublish>>,
    pending_set_properties: Mutex<HashMap<String, oneshot::Sender<PropertiesAckParams>>>,
    publish_timeout: Duration,
    set_properties_timeout: Duration,
    optimistic_resolve_delay: Duration,
}

impl Messenger {
    /// Build a Messenger around an already-connecting socket and start its
    /// driver task, which replays state on open and forwards inbound
    /// announce/unannounce/properties/value events downstream. Timeouts are
    /// read from `config` so tests can override them.
    pub fn new(
        socket: Socket,
        config: &ClientConfig,
    ) -> (Arc<Messenger>, mpsc::UnboundedReceiver<InboundEvent>) {
        let messenger = Arc::new(Messenger {
            socket: socket.clone(),
            next_pubuid: AtomicI64::new(0),
            next_subuid: AtomicI64::new(0),
            publications: Mutex::new(HashMap::new()),
            subscriptions: Mutex::new(HashMap::new()),
            pending_publishes: Mutex::new(HashMap::new()),
            pending_set_properties: Mutex::new(HashMap::new()),
            publish_timeout: config.publish_timeout,
            set_properties_timeout: config.set_properties_timeout,
            optimistic_resolve_delay: config.optimistic_resolve_delay,
        });

        let (registry_tx, registry_rx) = mpsc::unbounded_channel();
        let driver = messenger.clone();
        tokio::spawn(async move {
            let mut events = socket.take_events().await;
            while let Some(event) = events.recv().await {
                match event {
                    SocketEvent::Open => driver.replay(),
                    SocketEvent::Close => {}
                    SocketEvent::Text(values) => {
                        for value in values {
                            match serde_json::from_value::<ControlMessage>(value) {
                                Ok(msg) => driver.handle_inbound_control(msg, &registry_tx),
                                Err(e) => {
                                    tracing::warn!(error = %e, "malformed control message, skipping")
                                }
                            }
                        }
                    }
                    SocketEvent::Binary(frames) => {
                        for frame in frames {
                            if registry_tx.send(InboundEvent::Value(frame)).is_err() {
                                return;
                            }
                        }
                    }
                }
            }
        });

        (messenger, registry_rx)
    }

    pub fn next_pubuid(&self) -> i64 {
        self.next_pubuid.fetch_add(1, Ordering::SeqCst)
    }

    pub fn next_subuid(&self) -> i64 {
        self.next_subuid.fetch_add(1, Ordering::SeqCst)
    }

    fn handle_inbound_control(
        &self,
        msg: ControlMessage,
        registry_tx: &mpsc::UnboundedSender<InboundEvent>,
    ) {
        match msg {
            ControlMessage::Announce(params) => {
                if let Some(pubuid) = params.pubuid {
                    if let Some(pending) = self.pending_publishes.lock().unwrap().get(&pubuid) {
                        if let Some(tx) = pending.slot.lock().unwrap().take() {
                            let _ = tx.send(params.clone());
                        }
                    }
                }
                let _ = registry_tx.send(InboundEvent::Announce(params));
            }
            ControlMessage::Unannounce(params) => {
                let _ = registry_tx.send(InboundEvent::Unannounce(params));
            }
            ControlMessage::Properties(params) => {
                if params.ack {
                    if let Some(tx) = self
                        .pending_set_properties
                        .lock()
                        .unwrap()
                        .remove(&params.name)
                    {
                        let _ = tx.send(params.clone());
                    }
                }
                let _ = registry_tx.send(InboundEvent::PropertiesAck(params));
            }
            other => tracing::warn!(?other, "unexpected inbound control method, ignoring"),
        }
    }

    /// Re-send every stored subscription, then every stored publication,
    /// fire-and-forget (no per-topic timeout on reconnect replay).
    fn replay(&self) {
        let subs: Vec<_> = self.subscriptions.lock().unwrap().values().cloned().collect();
        for s in subs {
            self.socket.send_text(&ControlMessage::Subscribe(s));
        }
        let pubs: Vec<_> = self.publications.lock().unwrap().values().cloned().collect();
        for p in pubs {
            self.socket.send_text(&ControlMessage::Publish(p));
        }
    }

    /// Publish `params`, returning the resolved (or synthesized) announce.
    ///
    /// Sends `publish` followed by a `topicsonly` hotfix subscribe for the
    /// same name. If no exact, non-prefix subscription for this name already
    /// exists, also arms a 200 ms optimistic resolver that synthesizes
    /// `id: 0` so the topic becomes usable even if the server stays silent.
    pub async fn publish(
        &self,
        params: PublishParams,
        force: bool,
    ) -> Result<AnnounceParams, MessengerError> {
        let pubuid = params.pubuid;
        if self.publications.lock().unwrap().contains_key(&pubuid) && !force {
            return Err(MessengerError::AlreadyPublished);
        }

        let exact_subscription_exists = self
            .subscriptions
            .lock()
            .unwrap()
            .values()
            .any(|s| !s.options.is_prefix() && s.topics == [params.name.clone()]);

        self.publications
            .lock()
            .unwrap()
            .insert(pubuid, params.clone());
        self.socket.send_text(&ControlMessage::Publish(params.clone()));

        let hotfix_subuid = self.next_subuid();
        let hotfix = SubscribeParams {
            topics: vec![params.name.clone()],
            subuid: hotfix_subuid,
            options: SubscribeOptions {
                topicsonly: Some(true),
                ..Default::default()
            },
        };
        self.subscriptions
            .lock()
            .unwrap()
            .insert(hotfix_subuid, hotfix.clone());
        self.socket.send_text(&ControlMessage::Subscribe(hotfix));

        let (tx, rx) = oneshot::channel();
        let slot = Arc::new(Mutex::new(Some(tx)));
        self.pending_publishes.lock().unwrap().insert(
            pubuid,
            PendingPublish {
                request: params.clone(),
                slot: slot.clone(),
            },
        );

        if !exact_subscription_exists {
            let slot = slot.clone();
            let request = params.clone();
            let optimistic_resolve_delay = self.optimistic_resolve_delay;
            tokio::spawn(async move {
                tokio::time::sleep(optimistic_resolve_delay).await;
                if let Some(tx) = slot.lock().unwrap().take() {
                    let synthesized = AnnounceParams {
                        name: request.name,
                        id: 0,
                        type_name: request.type_name,
                        properties: request.properties,
                        pubuid: Some(pubuid),
                    };
                    let _ = tx.send(synthesized);
                }
            });
        }

        let result = tokio::select! {
            biased;
            announce = rx => announce.map_err(|_| MessengerError::NotAnnouncedTimeout),
            _ = tokio::time::sleep(self.publish_timeout) => {
                Err(MessengerError::NotAnnouncedTimeout)
            }
        };
        self.pending_publishes.lock().unwrap().remove(&pubuid);
        result
    }

    pub fn unpublish(&self, pubuid: i64) {
        if self.publications.lock().unwrap().remove(&pubuid).is_some() {
            self.socket
                .send_text(&ControlMessage::Unpublish(UnpublishParams { pubuid }));
        }
    }

    pub fn subscribe(&self, params: SubscribeParams, force: bool) {
        let mut subs = self.subscriptions.lock().unwrap();
        if subs.contains_key(&params.subuid) && !force {
            return;
        }
        subs.insert(params.subuid, params.clone());
        drop(subs);
        self.socket.send_text(&ControlMessage::Subscribe(params));
    }

    pub fn unsubscribe(&self, subuid: i64) {
        if self.subscriptions.lock().unwrap().remove(&subuid).is_some() {
            self.socket
                .send_text(&ControlMessage::Unsubscribe(UnsubscribeParams { subuid }));
        }
    }

    pub async fn set_properties(
        &self,
        params: SetPropertiesParams,
    ) -> Result<PropertiesAckParams, MessengerError> {
        let (tx, rx) = oneshot::channel();
        self.pending_set_properties
            .lock()
            .unwrap()
            .insert(params.name.clone(), tx);
        self.socket
            .send_text(&ControlMessage::SetProperties(params.clone()));

        let result = tokio::select! {
            biased;
            ack = rx => ack.map_err(|_| MessengerError::NotAcknowledgedTimeout),
            _ = tokio::time::sleep(self.set_properties_timeout) => {
                Err(MessengerError::NotAcknowledgedTimeout)
            }
        };
        self.pending_set_properties.lock().unwrap().remove(&params.name);
        result
    }

    /// Low-level value send: the caller (a Topic) is responsible for
    /// checking publisher/pubuid/announced-id state before calling this.
    pub fn send_value(&self, server_id: i64, value: &nt_protocol::Value, type_info: &nt_protocol::TypeInfo) -> i64 {
        self.socket.send_value_to_topic(server_id, value, type_info)
    }

    pub fn reinstantiate(&self, url: impl Into<String>) {
        self.socket.reinstantiate(url);
    }

    pub fn socket(&self) -> &Socket {
        &self.socket
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use nt_protocol::TopicProperties;

    fn test_publish_params(name: &str, pubuid: i64) -> PublishParams {
        PublishParams {
            name: name.to_owned(),
            pubuid,
            type_name: "double".to_owned(),
            properties: TopicProperties::default(),
        }
    }

    #[tokio::test]
    async fn publish_rejects_duplicate_pubuid_without_force() {
        let config = ClientConfig::with_exact_url("ws://127.0.0.1:1/nt/x");
        let socket = Socket::connect(config.clone());
        let (messenger, _rx) = Messenger::new(socket, &config);
        messenger
            .publications
            .lock()
            .unwrap()
            .insert(5, test_publish_params("/t", 5));
        let err = messenger
            .publish(test_publish_params("/t", 5), false)
            .await
            .unwrap_err();
        assert_eq!(err, MessengerError::AlreadyPublished);
    }

    #[test]
    fn pubuid_and_subuid_counters_are_independent_and_start_at_zero() {
        let config = ClientConfig::with_exact_url("ws://127.0.0.1:1/nt/x");
        let socket = Socket::connect(config.clone());
        let (messenger, _rx) = Messenger::new(socket, &config);
        assert_eq!(messenger.next_pubuid(), 0);
        assert_eq!(messenger.next_subuid(), 0);
        assert_eq!(messenger.next_pubuid(), 1);
        assert_eq!(messenger.next_subuid(), 1);
    }
}
