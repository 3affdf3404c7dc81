//! Text control frames: a JSON array of `{method, params}` objects (§6).

use serde::{Deserialize, Serialize};

/// Recognized topic properties. All fields are optional per §3.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicProperties {
    /// When true, the server retains the value across restarts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent: Option<bool>,
    /// When true, the server does not delete the topic when the last
    /// publisher leaves.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retained: Option<bool>,
}

impl TopicProperties {
    pub fn retained() -> Self {
        TopicProperties {
            persistent: None,
            retained: Some(true),
        }
    }
}

/// A partial update to a topic's properties, as sent in `setproperties`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertiesUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retained: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub periodic: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub all: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topicsonly: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<bool>,
}

impl SubscribeOptions {
    pub fn is_prefix(&self) -> bool {
        self.prefix.unwrap_or(false)
    }
    pub fn is_topics_only(&self) -> bool {
        self.topicsonly.unwrap_or(false)
    }
}

// ---------------------------------------------------------------------------
// Client -> server params
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishParams {
    pub name: String,
    pub pubuid: i64,
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default)]
    pub properties: TopicProperties,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnpublishParams {
    pub pubuid: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetPropertiesParams {
    pub name: String,
    pub update: PropertiesUpdate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeParams {
    pub topics: Vec<String>,
    pub subuid: i64,
    #[serde(default)]
    pub options: SubscribeOptions,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsubscribeParams {
    pub subuid: i64,
}

// ---------------------------------------------------------------------------
// Server -> client params
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnnounceParams {
    pub name: String,
    pub id: i64,
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default)]
    pub properties: TopicProperties,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pubuid: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnannounceParams {
    pub name: String,
    pub id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertiesAckParams {
    pub name: String,
    pub ack: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update: Option<PropertiesUpdate>,
}

/// A single discriminated control message, tagged by the `method` field.
///
/// The wire shape is `{"method": "...", "params": {...}}`; a single text
/// frame carries a JSON array of zero or more of these.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "lowercase")]
pub enum ControlMessage {
    Publish(PublishParams),
    Unpublish(UnpublishParams),
    #[serde(rename = "setproperties")]
    SetProperties(SetPropertiesParams),
    Subscribe(SubscribeParams),
    Unsubscribe(UnsubscribeParams),
    Announce(AnnounceParams),
    Unannounce(UnannounceParams),
    Properties(PropertiesAckParams),
}

/// Serialize a single control message as its own one-element JSON array —
/// the unit a text frame is sent or replayed as.
pub fn encode_single(msg: &ControlMessage) -> serde_json::Result<String> {
    serde_json::to_string(std::slice::from_ref(msg))
}

/// Serialize a batch of control messages as one JSON array text frame.
pub fn encode_batch(msgs: &[ControlMessage]) -> serde_json::Result<String> {
    serde_json::to_string(msgs)
}

/// Parse an incoming text frame: a JSON array of control messages. Elements
/// that fail to parse against the schema are reported individually so the
/// caller can warn-and-skip rather than fail the whole frame (§4.1).
pub fn decode_frame(text: &str) -> serde_json::Result<Vec<serde_json::Value>> {
    serde_json::from_str(text)
}
