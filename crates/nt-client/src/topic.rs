//! Regular (exact-name) topic state machine (§4.4).

use crate::inflight::{InFlightError, InFlightMap};
use crate::messenger::{Messenger, MessengerError};
use nt_protocol::{
    AnnounceParams, PropertiesAckParams, PropertiesUpdate, PublishParams, SetPropertiesParams,
    SubscribeOptions, SubscribeParams, TopicProperties, TypeInfo, Value,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug, thiserror::Error)]
pub enum TopicError {
    #[error("setValue/unpublish called while not a publisher of this topic")]
    NotPublisher,
    #[error("topic already registered with a different type")]
    TypeMismatch,
    #[error(transparent)]
    Messenger(#[from] MessengerError),
    #[error("operation rejected: client is cleaning up")]
    CleaningUp,
}

impl From<InFlightError> for TopicError {
    fn from(_: InFlightError) -> Self {
        TopicError::CleaningUp
    }
}

pub type SubscriberCallback = Arc<dyn Fn(&Value, &AnnounceParams) + Send + Sync>;

struct Subscriber {
    callback: SubscriberCallback,
    options: SubscribeOptions,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PublisherState {
    Inactive,
    PublishPending { pubuid: i64 },
    Publisher { pubuid: i64 },
}

struct State {
    value: Option<Value>,
    last_changed: u64,
    id: Option<i64>,
    last_announce: Option<AnnounceParams>,
    publisher: PublisherState,
    desired_properties: TopicProperties,
    pending_outbound: Option<Value>,
    subscribers: HashMap<i64, Subscriber>,
}

/// A named, typed topic. Cheap to clone (an `Arc` handle over shared state).
pub struct Topic {
    name: String,
    type_info: TypeInfo,
    messenger: Arc<Messenger>,
    cleaning_up: Arc<AtomicBool>,
    state: Mutex<State>,
    publish_inflight: InFlightMap<Result<AnnounceParams, MessengerError>>,
}

impl Topic {
    pub(crate) fn new(
        name: String,
        type_info: TypeInfo,
        default: Option<Value>,
        messenger: Arc<Messenger>,
        cleaning_up: Arc<AtomicBool>,
    ) -> Arc<Topic> {
        Arc::new(Topic {
            name,
            type_info,
            messenger,
            cleaning_up,
            state: Mutex::new(State {
                value: default,
                last_changed: 0,
                id: None,
                last_announce: None,
                publisher: PublisherState::Inactive,
                desired_properties: TopicProperties::default(),
                pending_outbound: None,
                subscribers: HashMap::new(),
            }),
            publish_inflight: InFlightMap::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn type_info(&self) -> &TypeInfo {
        &self.type_info
    }

    pub fn id(&self) -> Option<i64> {
        self.state.lock().unwrap().id
    }

    pub fn is_publisher(&self) -> bool {
        matches!(
            self.state.lock().unwrap().publisher,
            PublisherState::Publisher { .. }
        )
    }

    pub fn get_value(&self) -> Option<Value> {
        self.state.lock().unwrap().value.clone()
    }

    pub fn last_changed_time(&self) -> u64 {
        self.state.lock().unwrap().last_changed
    }

    /// Build the announce params passed to subscriber callbacks when a topic
    /// hasn't been announced yet: id -1, our own name and registered type.
    fn pre_announce_sentinel(&self) -> AnnounceParams {
        AnnounceParams {
            name: self.name.clone(),
            id: -1,
            type_name: self.type_info.name.clone(),
            properties: TopicProperties::default(),
            pubuid: None,
        }
    }

    fn notify(state: &State, name: &str, sentinel: &AnnounceParams, value: &Value) {
        let params = state.last_announce.as_ref().unwrap_or(sentinel);
        for subscriber in state.subscribers.values() {
            if subscriber.options.is_topics_only() {
                continue;
            }
            let callback = subscriber.callback.clone();
            let value = value.clone();
            let params = params.clone();
            let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                callback(&value, &params);
            }));
            if outcome.is_err() {
                tracing::warn!(topic = %name, "subscriber callback panicked, isolating");
            }
        }
    }

    /// Outbound: requires Publisher state. Stores locally, notifies
    /// subscribers, and forwards to the server if a topic id is already
    /// known; otherwise queues the latest value for the flush on announce.
    pub fn set_value(&self, value: Value) -> Result<i64, TopicError> {
        let sentinel = self.pre_announce_sentinel();
        let mut state = self.state.lock().unwrap();
        let pubuid = match state.publisher {
            PublisherState::Publisher { pubuid } => pubuid,
            _ => return Err(TopicError::NotPublisher),
        };

        state.value = Some(value.clone());
        Self::notify(&state, &self.name, &sentinel, &value);

        let timestamp = match state.id {
            Some(id) => {
                let ts = self.messenger.send_value(id, &value, &self.type_info);
                if ts >= 0 {
                    state.last_changed = ts as u64;
                }
                ts
            }
            None => {
                state.pending_outbound = Some(value);
                -1
            }
        };
        let _ = pubuid;
        Ok(timestamp)
    }

    /// Inbound: store, bump last-changed, notify subscribers.
    pub fn update_value(&self, value: Value, server_time: u64) {
        let sentinel = self.pre_announce_sentinel();
        let mut state = self.state.lock().unwrap();
        state.value = Some(value.clone());
        state.last_changed = server_time;
        Self::notify(&state, &self.name, &sentinel, &value);
    }

    /// Mark Announced(id); if it matches our pending pubuid, transition to
    /// Publisher and flush any value queued before the id arrived.
    pub(crate) fn announce(&self, params: AnnounceParams) {
        let mut state = self.state.lock().unwrap();
        state.id = Some(params.id);
        if let PublisherState::PublishPending { pubuid } = state.publisher {
            if params.pubuid == Some(pubuid) {
                state.publisher = PublisherState::Publisher { pubuid };
            }
        }
        state.last_announce = Some(params.clone());

        if let Some(value) = state.pending_outbound.take() {
            let ts = self.messenger.send_value(params.id, &value, &self.type_info);
            if ts >= 0 {
                state.last_changed = ts as u64;
            }
        }
    }

    pub(crate) fn unannounce(&self) {
        let mut state = self.state.lock().unwrap();
        state.id = None;
        state.last_announce = None;
    }

    /// Register a value subscription. When `id` is `Some`, this overwrites
    /// the local callback entry without re-issuing a `subscribe` to the
    /// server (the server already knows this subuid).
    pub fn subscribe(
        &self,
        callback: SubscriberCallback,
        options: SubscribeOptions,
        id: Option<i64>,
        save: bool,
    ) -> i64 {
        let subuid = id.unwrap_or_else(|| self.messenger.next_subuid());
        if id.is_none() {
            let params = SubscribeParams {
                topics: vec![self.name.clone()],
                subuid,
                options: options.clone(),
            };
            self.messenger.subscribe(params, false);
        }
        if save {
            self.state
                .lock()
                .unwrap()
                .subscribers
                .insert(subuid, Subscriber { callback, options });
        }
        subuid
    }

    pub fn unsubscribe(&self, subuid: i64, remove_callback: bool) {
        self.messenger.unsubscribe(subuid);
        if remove_callback {
            self.state.lock().unwrap().subscribers.remove(&subuid);
        }
    }

    /// Unsubscribe every currently recorded subscriber, used by `cleanup`.
    pub fn unsubscribe_all(&self) {
        let subuids: Vec<i64> = self.state.lock().unwrap().subscribers.keys().copied().collect();
        for subuid in subuids {
            self.unsubscribe(subuid, true);
        }
    }

    /// Publish this topic with `properties`, optionally reusing a specific
    /// pubuid (used by `republish`). Deduplicated per-topic so concurrent
    /// callers share one in-flight request.
    pub async fn publish(
        &self,
        properties: TopicProperties,
        id: Option<i64>,
    ) -> Result<AnnounceParams, TopicError> {
        if self.cleaning_up.load(Ordering::SeqCst) {
            return Err(TopicError::CleaningUp);
        }
        {
            let state = self.state.lock().unwrap();
            if let PublisherState::Publisher { .. } = state.publisher {
                if let Some(announce) = state.last_announce.clone() {
                    return Ok(announce);
                }
            }
        }

        let key = format!("publish:{}", self.name);
        let pubuid = id.unwrap_or_else(|| self.messenger.next_pubuid());
        {
            let mut state = self.state.lock().unwrap();
            state.publisher = PublisherState::PublishPending { pubuid };
            state.desired_properties = properties.clone();
        }

        let messenger = self.messenger.clone();
        let name = self.name.clone();
        let type_name = self.type_info.name.clone();
        let result = self
            .publish_inflight
            .get_or_create(&key, move || async move {
                messenger
                    .publish(
                        PublishParams {
                            name,
                            pubuid,
                            type_name,
                            properties,
                        },
                        false,
                    )
                    .await
            })
            .await?;
        Ok(result?)
    }

    pub fn unpublish(&self) -> Result<(), TopicError> {
        let pubuid = match self.state.lock().unwrap().publisher {
            PublisherState::Publisher { pubuid } | PublisherState::PublishPending { pubuid } => {
                pubuid
            }
            PublisherState::Inactive => return Err(TopicError::NotPublisher),
        };
        self.messenger.unpublish(pubuid);
        self.state.lock().unwrap().publisher = PublisherState::Inactive;
        Ok(())
    }

    /// Used on `reinstantiate`: clear publisher state and re-run publish
    /// with the previously stored properties and pubuid.
    pub async fn republish(&self) -> Result<AnnounceParams, TopicError> {
        let (properties, pubuid) = {
            let mut state = self.state.lock().unwrap();
            let pubuid = match state.publisher {
                PublisherState::Publisher { pubuid } | PublisherState::PublishPending { pubuid } => {
                    Some(pubuid)
                }
                PublisherState::Inactive => None,
            };
            state.publisher = PublisherState::Inactive;
            (state.desired_properties.clone(), pubuid)
        };
        self.publish(properties, pubuid).await
    }

    /// Re-send `subscribe` for every currently recorded subscriber, used on
    /// `reinstantiate`.
    pub fn resubscribe_all(&self) {
        let entries: Vec<(i64, SubscribeOptions)> = self
            .state
            .lock()
            .unwrap()
            .subscribers
            .iter()
            .map(|(subuid, sub)| (*subuid, sub.options.clone()))
            .collect();
        for (subuid, options) in entries {
            self.messenger.subscribe(
                SubscribeParams {
                    topics: vec![self.name.clone()],
                    subuid,
                    options,
                },
                true,
            );
        }
    }

    pub async fn set_properties(
        &self,
        persistent: Option<bool>,
        retained: Option<bool>,
    ) -> Result<PropertiesAckParams, MessengerError> {
        self.messenger
            .set_properties(SetPropertiesParams {
                name: self.name.clone(),
                update: PropertiesUpdate {
                    persistent,
                    retained,
                },
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use crate::socket::Socket;
    use std::sync::atomic::AtomicUsize;

    fn test_topic(name: &str, type_info: TypeInfo) -> Arc<Topic> {
        let config = ClientConfig::with_exact_url("ws://127.0.0.1:1/nt/x");
        let socket = Socket::connect(config.clone());
        let (messenger, _rx) = Messenger::new(socket, &config);
        Topic::new(
            name.to_owned(),
            type_info,
            None,
            messenger,
            Arc::new(AtomicBool::new(false)),
        )
    }

    #[test]
    fn set_value_without_publisher_fails() {
        let topic = test_topic("/t", TypeInfo::double());
        let err = topic.set_value(Value::Double(1.0)).unwrap_err();
        assert!(matches!(err, TopicError::NotPublisher));
    }

    #[test]
    fn set_value_before_announce_queues_latest_only() {
        let topic = test_topic("/t", TypeInfo::double());
        topic.state.lock().unwrap().publisher = PublisherState::Publisher { pubuid: 0 };
        assert_eq!(topic.set_value(Value::Double(1.0)).unwrap(), -1);
        assert_eq!(topic.set_value(Value::Double(2.0)).unwrap(), -1);
        assert_eq!(
            topic.state.lock().unwrap().pending_outbound,
            Some(Value::Double(2.0))
        );
    }

    #[test]
    fn subscriber_callbacks_are_isolated_from_one_another() {
        let topic = test_topic("/t", TypeInfo::double());
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        topic.subscribe(
            Arc::new(|_v, _p| panic!("boom")),
            SubscribeOptions::default(),
            Some(1),
            true,
        );
        topic.subscribe(
            Arc::new(move |_v, _p| {
                calls2.fetch_add(1, Ordering::SeqCst);
            }),
            SubscribeOptions::default(),
            Some(2),
            true,
        );
        topic.update_value(Value::Double(3.0), 100);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn pre_announce_notifications_carry_sentinel_id_negative_one() {
        let topic = test_topic("/t", TypeInfo::double());
        let seen = Arc::new(Mutex::new(None));
        let seen2 = seen.clone();
        topic.subscribe(
            Arc::new(move |_v, p| *seen2.lock().unwrap() = Some(p.id)),
            SubscribeOptions::default(),
            Some(7),
            true,
        );
        topic.update_value(Value::Double(1.0), 5);
        assert_eq!(*seen.lock().unwrap(), Some(-1));
    }
}
