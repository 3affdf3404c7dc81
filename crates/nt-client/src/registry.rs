//! Maps topic names/prefixes/server ids to live state and dispatches inbound
//! announce/unannounce/value/properties events (§4.3).

use crate::messenger::{InboundEvent, Messenger};
use crate::prefix_topic::PrefixTopic;
use crate::topic::Topic;
use nt_protocol::{AnnounceParams, TypeInfo, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("topic or prefix '{0}' already registered")]
    DuplicateTopic(String),
    #[error("topic '{0}' already registered with a different type")]
    TypeMismatch(String),
}

struct Maps {
    topics: HashMap<String, Arc<Topic>>,
    prefixes: HashMap<String, Arc<PrefixTopic>>,
    known_params: HashMap<i64, AnnounceParams>,
}

pub struct Registry {
    messenger: Arc<Messenger>,
    maps: RwLock<Maps>,
    cleaning_up: Arc<AtomicBool>,
}

impl Registry {
    /// Build a Registry around `messenger` and start its driver task, which
    /// consumes inbound events from the Messenger and dispatches them.
    pub fn new(
        messenger: Arc<Messenger>,
        inbound_rx: mpsc::UnboundedReceiver<InboundEvent>,
    ) -> Arc<Registry> {
        let registry = Arc::new(Registry {
            messenger,
            maps: RwLock::new(Maps {
                topics: HashMap::new(),
                prefixes: HashMap::new(),
                known_params: HashMap::new(),
            }),
            cleaning_up: Arc::new(AtomicBool::new(false)),
        });

        let driver = registry.clone();
        tokio::spawn(async move {
            let mut rx = inbound_rx;
            while let Some(event) = rx.recv().await {
                match event {
                    InboundEvent::Announce(params) => driver.on_topic_announce(params),
                    InboundEvent::Unannounce(params) => driver.on_topic_unannounce(params),
                    InboundEvent::PropertiesAck(params) => driver.on_properties_ack(params),
                    InboundEvent::Value(frame) => driver.on_topic_update(frame),
                }
            }
        });

        registry
    }

    pub fn cleaning_up_flag(&self) -> Arc<AtomicBool> {
        self.cleaning_up.clone()
    }

    pub fn messenger(&self) -> &Arc<Messenger> {
        &self.messenger
    }

    /// Get the existing topic for `name` if its type matches, create one if
    /// absent, or fail with `TypeMismatch` if it exists under a different
    /// type.
    pub fn topic(
        &self,
        name: &str,
        type_info: TypeInfo,
        default: Option<Value>,
    ) -> Result<Arc<Topic>, RegistryError> {
        let mut maps = self.maps.write().unwrap();
        if let Some(existing) = maps.topics.get(name) {
            return if *existing.type_info() == type_info {
                Ok(existing.clone())
            } else {
                Err(RegistryError::TypeMismatch(name.to_owned()))
            };
        }
        let topic = Topic::new(
            name.to_owned(),
            type_info,
            default,
            self.messenger.clone(),
            self.cleaning_up.clone(),
        );
        maps.topics.insert(name.to_owned(), topic.clone());
        Ok(topic)
    }

    pub fn prefix_topic(&self, prefix: &str) -> Arc<PrefixTopic> {
        let mut maps = self.maps.write().unwrap();
        if let Some(existing) = maps.prefixes.get(prefix) {
            return existing.clone();
        }
        let prefix_topic = PrefixTopic::new(prefix.to_owned(), self.messenger.clone());
        maps.prefixes
            .insert(prefix.to_owned(), prefix_topic.clone());
        prefix_topic
    }

    /// Insert-only primitive used when a caller needs to register a topic it
    /// already built by hand (e.g. the protobuf layer's raw schema topic).
    pub fn register_topic(&self, topic: Arc<Topic>) -> Result<(), RegistryError> {
        let mut maps = self.maps.write().unwrap();
        if maps.topics.contains_key(topic.name()) {
            return Err(RegistryError::DuplicateTopic(topic.name().to_owned()));
        }
        maps.topics.insert(topic.name().to_owned(), topic);
        Ok(())
    }

    pub fn get_topic_by_name(&self, name: &str) -> Option<Arc<Topic>> {
        self.maps.read().unwrap().topics.get(name).cloned()
    }

    pub fn get_prefix_by_name(&self, prefix: &str) -> Option<Arc<PrefixTopic>> {
        self.maps.read().unwrap().prefixes.get(prefix).cloned()
    }

    pub fn get_known_params(&self, id: i64) -> Option<AnnounceParams> {
        self.maps.read().unwrap().known_params.get(&id).cloned()
    }

    fn on_topic_announce(&self, params: AnnounceParams) {
        let maps = self.maps.read().unwrap();
        let topic = maps.topics.get(&params.name).cloned();
        let matching_prefixes: Vec<_> = maps
            .prefixes
            .values()
            .filter(|p| p.matches(&params.name))
            .cloned()
            .collect();
        drop(maps);

        self.maps
            .write()
            .unwrap()
            .known_params
            .insert(params.id, params.clone());

        if let Some(topic) = topic {
            topic.announce(params.clone());
        }
        for prefix in matching_prefixes {
            prefix.announce(&params);
        }
    }

    fn on_topic_unannounce(&self, params: nt_protocol::UnannounceParams) {
        self.maps.write().unwrap().known_params.remove(&params.id);
        let topic = self.maps.read().unwrap().topics.get(&params.name).cloned();
        match topic {
            Some(topic) => topic.unannounce(),
            None => tracing::warn!(name = %params.name, id = params.id, "unannounce for unknown topic"),
        }
    }

    fn on_topic_update(&self, frame: nt_protocol::BinaryFrame) {
        let known = self.get_known_params(frame.topic_id);
        let Some(known) = known else {
            tracing::warn!(topic_id = frame.topic_id, "value update for unannounced topic id");
            return;
        };

        let type_info = TypeInfo::by_name(&known.type_name).unwrap_or(TypeInfo {
            number: frame.type_num,
            name: known.type_name.clone(),
        });

        let value = match Value::decode(&type_info, &frame.value) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(topic = %known.name, error = %e, "invalid inbound value, dropping");
                return;
            }
        };

        if let Some(topic) = self.get_topic_by_name(&known.name) {
            topic.update_value(value.clone(), frame.server_time);
        }

        let matching_prefixes: Vec<_> = self
            .maps
            .read()
            .unwrap()
            .prefixes
            .values()
            .filter(|p| p.matches(&known.name))
            .cloned()
            .collect();
        for prefix in matching_prefixes {
            prefix.update_value(&known, &value, frame.server_time);
        }
    }

    fn on_properties_ack(&self, params: nt_protocol::PropertiesAckParams) {
        if self.get_topic_by_name(&params.name).is_none() {
            tracing::debug!(name = %params.name, "properties ack for unknown topic");
        }
    }

    /// Re-point at a new URL: reconnect the socket, then re-arm every known
    /// topic's subscriptions and publications.
    pub async fn reinstantiate(&self, url: impl Into<String>) {
        self.messenger.reinstantiate(url);
        let (topics, prefixes): (Vec<_>, Vec<_>) = {
            let maps = self.maps.read().unwrap();
            (
                maps.topics.values().cloned().collect(),
                maps.prefixes.values().cloned().collect(),
            )
        };
        for topic in &topics {
            topic.resubscribe_all();
        }
        for prefix in &prefixes {
            prefix.resubscribe_all();
        }
        for topic in &topics {
            if topic.is_publisher() {
                let _ = topic.republish().await;
            }
        }
    }

    /// Unsubscribe and unpublish everything, close the socket, and refuse
    /// any new in-flight operations from now on.
    pub fn cleanup(&self) {
        self.cleaning_up.store(true, Ordering::SeqCst);
        let maps = self.maps.read().unwrap();
        for topic in maps.topics.values() {
            topic.unsubscribe_all();
            if topic.is_publisher() {
                let _ = topic.unpublish();
            }
        }
        for prefix in maps.prefixes.values() {
            prefix.unsubscribe_all();
        }
        self.messenger.socket().close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use crate::socket::Socket;

    fn test_registry() -> Arc<Registry> {
        let config = ClientConfig::with_exact_url("ws://127.0.0.1:1/nt/x");
        let socket = Socket::connect(config.clone());
        let (messenger, rx) = Messenger::new(socket, &config);
        Registry::new(messenger, rx)
    }

    #[test]
    fn topic_constructor_returns_existing_handle_for_matching_type() {
        let registry = test_registry();
        let a = registry.topic("/t", TypeInfo::double(), None).unwrap();
        let b = registry.topic("/t", TypeInfo::double(), None).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn topic_constructor_rejects_type_mismatch() {
        let registry = test_registry();
        registry.topic("/t", TypeInfo::double(), None).unwrap();
        let err = registry.topic("/t", TypeInfo::string(), None).unwrap_err();
        assert_eq!(err, RegistryError::TypeMismatch("/t".to_owned()));
    }

    #[test]
    fn register_topic_rejects_duplicate_name() {
        let registry = test_registry();
        let topic = Topic::new(
            "/t".to_owned(),
            TypeInfo::double(),
            None,
            registry.messenger.clone(),
            registry.cleaning_up_flag(),
        );
        registry.register_topic(topic.clone()).unwrap();
        let err = registry.register_topic(topic).unwrap_err();
        assert_eq!(err, RegistryError::DuplicateTopic("/t".to_owned()));
    }

    #[test]
    fn prefix_topic_constructor_returns_existing_instance() {
        let registry = test_registry();
        let a = registry.prefix_topic("/a/");
        let b = registry.prefix_topic("/a/");
        assert!(Arc::ptr_eq(&a, &b));
    }
}
