//! nt-client: a NetworkTables 4.0 pub/sub client over a single WebSocket.
//!
//! Maintains one connection, tracks topic lifecycle (publish/subscribe/
//! announce/unannounce/properties), ships binary value updates keyed by
//! server-synchronized timestamps, and replays subscriptions/publications
//! across reconnects.

pub mod client;
pub mod config;
pub mod error;
pub mod inflight;
pub mod messenger;
pub mod prefix_topic;
pub mod registry;
pub mod socket;
pub mod topic;

#[cfg(feature = "protobuf")]
pub mod protobuf;

pub use client::Client;
pub use config::ClientConfig;
pub use error::Error;
pub use prefix_topic::PrefixTopic;
pub use registry::RegistryError;
pub use socket::{ListenerHandle, SocketError};
pub use topic::{SubscriberCallback, Topic, TopicError};

pub use nt_protocol::{
    AnnounceParams, ControlMessage, PropertiesAckParams, PropertiesUpdate, PublishParams,
    SubscribeOptions, SubscribeParams, TopicProperties, TypeInfo, UnannounceParams,
    UnpublishParams, UnsubscribeParams, Value, ValueError,
};
