//! Client-wide configuration (§4/§5 constants, overridable for tests).

use std::time::Duration;

/// Subprotocol NT4 negotiates over the WebSocket handshake.
pub const SUBPROTOCOL: &str = "networktables.first.wpi.edu";

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// `ws://host:port/nt/<client-id>` (or `wss://`).
    pub url: String,
    pub auto_reconnect: bool,
    pub heartbeat_period: Duration,
    pub reconnect_delay: Duration,
    pub publish_timeout: Duration,
    pub set_properties_timeout: Duration,
    pub optimistic_resolve_delay: Duration,
}

impl ClientConfig {
    /// A config pointed at `base_url` with a generated `ntcore-rs-<random>`
    /// client id appended to the NT4 path, per §6.
    pub fn new(base_url: impl AsRef<str>) -> Self {
        let client_id = format!("ntcore-rs-{:08x}", rand::random::<u32>());
        let base = base_url.as_ref().trim_end_matches('/');
        ClientConfig {
            url: format!("{base}/nt/{client_id}"),
            auto_reconnect: true,
            heartbeat_period: Duration::from_secs(1),
            reconnect_delay: Duration::from_secs(1),
            publish_timeout: Duration::from_millis(3000),
            set_properties_timeout: Duration::from_millis(3000),
            optimistic_resolve_delay: Duration::from_millis(200),
        }
    }

    /// Use an already-complete URL verbatim (e.g. one a mock server test
    /// already assembled), skipping the `/nt/<client-id>` suffixing.
    pub fn with_exact_url(url: impl Into<String>) -> Self {
        ClientConfig {
            url: url.into(),
            auto_reconnect: true,
            heartbeat_period: Duration::from_secs(1),
            reconnect_delay: Duration::from_secs(1),
            publish_timeout: Duration::from_millis(3000),
            set_properties_timeout: Duration::from_millis(3000),
            optimistic_resolve_delay: Duration::from_millis(200),
        }
    }
}
