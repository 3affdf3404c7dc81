//! The top-level facade: owns one Socket, one Messenger, one Registry.

use crate::config::ClientConfig;
use crate::messenger::Messenger;
use crate::prefix_topic::PrefixTopic;
use crate::registry::Registry;
use crate::socket::{ListenerHandle, Socket};
use crate::topic::{SubscriberCallback, Topic, TopicError};
use nt_protocol::{TypeInfo, Value};
use std::sync::Arc;

/// A connected NT4 client instance: one socket, one messenger, one registry.
///
/// Cheap to clone; clones share the same underlying connection.
#[derive(Clone)]
pub struct Client {
    registry: Arc<Registry>,
}

impl Client {
    /// Connect to `base_url` (e.g. `ws://roborio-4918-frc.local:5810`). The
    /// `/nt/<client-id>` suffix and subprotocol negotiation are handled
    /// internally.
    pub fn connect(base_url: impl AsRef<str>) -> Client {
        Self::connect_with_config(ClientConfig::new(base_url))
    }

    pub fn connect_with_config(config: ClientConfig) -> Client {
        let socket = Socket::connect(config.clone());
        let (messenger, inbound_rx) = Messenger::new(socket, &config);
        let registry = Registry::new(messenger, inbound_rx);
        Client { registry }
    }

    pub fn connected(&self) -> bool {
        self.registry.messenger().socket().connected()
    }

    pub async fn wait_for_connection(&self) {
        self.registry.messenger().socket().wait_for_connection().await;
    }

    pub fn add_connection_listener(
        &self,
        immediate: bool,
        callback: impl FnMut(bool) + Send + 'static,
    ) -> ListenerHandle {
        self.registry
            .messenger()
            .socket()
            .add_connection_listener(immediate, callback)
    }

    /// Get or create a regular topic; fails with `TypeMismatch` if `name` is
    /// already registered under a different type.
    pub fn topic(
        &self,
        name: impl Into<String>,
        type_info: TypeInfo,
        default: Option<Value>,
    ) -> Result<Arc<Topic>, crate::registry::RegistryError> {
        self.registry.topic(&name.into(), type_info, default)
    }

    /// Get or create a prefix subscription aggregator for `prefix`.
    pub fn prefix_topic(&self, prefix: impl Into<String>) -> Arc<PrefixTopic> {
        self.registry.prefix_topic(&prefix.into())
    }

    /// Subscribe to an exact topic name, creating it if it does not exist.
    pub fn subscribe(
        &self,
        name: impl Into<String>,
        type_info: TypeInfo,
        options: nt_protocol::SubscribeOptions,
        callback: SubscriberCallback,
    ) -> Result<i64, crate::registry::RegistryError> {
        let topic = self.registry.topic(&name.into(), type_info, None)?;
        Ok(topic.subscribe(callback, options, None, true))
    }

    /// Subscribe to every topic whose name begins with `prefix`.
    pub fn subscribe_prefix(
        &self,
        prefix: impl Into<String>,
        options: nt_protocol::SubscribeOptions,
        callback: SubscriberCallback,
    ) -> i64 {
        let prefix_topic = self.registry.prefix_topic(&prefix.into());
        prefix_topic.subscribe(callback, options, None, true)
    }

    /// Publish `name` with `type_info` and the given topic properties.
    pub async fn publish(
        &self,
        name: impl Into<String>,
        type_info: TypeInfo,
        properties: nt_protocol::TopicProperties,
    ) -> Result<Arc<Topic>, TopicError> {
        let topic = self
            .registry
            .topic(&name.into(), type_info, None)
            .map_err(|_| TopicError::TypeMismatch)?;
        topic.publish(properties, None).await?;
        Ok(topic)
    }

    /// Point the client at a new URL, closing and reopening the socket and
    /// re-arming every subscription and publication.
    pub async fn reinstantiate(&self, url: impl Into<String>) {
        self.registry.reinstantiate(url).await;
    }

    /// Unsubscribe and unpublish everything, close the socket, and refuse
    /// further publish/schema operations.
    pub fn cleanup(&self) {
        self.registry.cleanup();
    }

    /// Alias for [`Client::cleanup`].
    pub fn shutdown(&self) {
        self.cleanup();
    }

    #[cfg(feature = "protobuf")]
    pub fn protobuf(&self) -> crate::protobuf::ProtobufLayer {
        crate::protobuf::ProtobufLayer::new(self.registry.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connect_builds_a_client_not_yet_open() {
        let client = Client::connect_with_config(ClientConfig::with_exact_url(
            "ws://127.0.0.1:0/nt/test",
        ));
        assert!(!client.connected());
    }
}
