//! Runtime configuration for participant nodes and the signaling relay.

use std::path::PathBuf;
use std::time::Duration;

use tavern_core::Viewport;

use crate::signaling::SignalingConfig;

/// Public signaling relays tried when none are configured.
pub const DEFAULT_SIGNALING: &[&str] = &[
    "wss://signaling.yjs.dev",
    "wss://y-webrtc-signaling-eu.herokuapp.com",
    "wss://y-webrtc-signaling-us.herokuapp.com",
];

/// Participant node configuration.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Display name
    pub name: String,
    /// Address the peer transport listens on
    pub listen_addr: String,
    /// Address announced to other peers (default: the bound address)
    pub advertised_addr: Option<String>,
    /// Signaling relay URLs
    pub signaling_endpoints: Vec<String>,
    /// Local data directory (None = in-memory backpack)
    pub data_dir: Option<PathBuf>,
    /// Local viewport in pixels
    pub viewport: Viewport,
    /// Minimum spacing between cursor broadcasts
    pub cursor_interval: Duration,
    /// How often to re-announce on each signaling relay
    pub announce_interval: Duration,
    /// First signaling retry delay
    pub retry_min: Duration,
    /// Retry delay ceiling
    pub retry_max: Duration,
    /// Keepalive ping interval on peer links
    pub keepalive_interval: Duration,
    /// Capacity of the update queue
    pub queue_capacity: usize,
    /// Capacity of the transport and discovery event channels
    pub event_capacity: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: "guest".to_string(),
            listen_addr: "127.0.0.1:0".to_string(),
            advertised_addr: None,
            signaling_endpoints: DEFAULT_SIGNALING.iter().map(|s| s.to_string()).collect(),
            data_dir: None,
            viewport: Viewport::default(),
            cursor_interval: Duration::from_millis(33),
            announce_interval: Duration::from_secs(5),
            retry_min: Duration::from_millis(500),
            retry_max: Duration::from_secs(30),
            keepalive_interval: Duration::from_secs(15),
            queue_capacity: 256,
            event_capacity: 1024,
        }
    }
}

impl NodeConfig {
    /// Local-only settings: loopback, one relay, short intervals.
    pub fn for_testing(name: impl Into<String>, signal_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            signaling_endpoints: vec![signal_url.into()],
            announce_interval: Duration::from_millis(200),
            retry_min: Duration::from_millis(50),
            retry_max: Duration::from_millis(500),
            keepalive_interval: Duration::from_secs(1),
            ..Self::default()
        }
    }

    /// Settings for a [`SignalingClient`](crate::signaling::SignalingClient).
    pub fn signaling(&self) -> SignalingConfig {
        SignalingConfig {
            endpoints: self.signaling_endpoints.clone(),
            announce_interval: self.announce_interval,
            retry_min: self.retry_min,
            retry_max: self.retry_max,
            capacity: self.event_capacity,
        }
    }
}

/// Signaling relay configuration.
#[derive(Debug, Clone)]
pub struct SignalServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Broadcast channel capacity per topic
    pub broadcast_capacity: usize,
    /// Maximum subscribers per topic
    pub max_subscribers_per_topic: usize,
}

impl Default for SignalServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:4444".to_string(),
            broadcast_capacity: 256,
            max_subscribers_per_topic: 100,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_testing_config_uses_one_relay() {
        let config = NodeConfig::for_testing("ann", "ws://127.0.0.1:9");
        assert_eq!(config.signaling_endpoints, vec!["ws://127.0.0.1:9".to_string()]);
        let signaling = config.signaling();
        assert_eq!(signaling.endpoints, config.signaling_endpoints);
        assert_eq!(signaling.announce_interval, Duration::from_millis(200));
    }

    #[test]
    fn test_defaults() {
        let config = NodeConfig::default();
        assert_eq!(config.signaling_endpoints.len(), DEFAULT_SIGNALING.len());
        assert!(config.data_dir.is_none());
        assert_eq!(SignalServerConfig::default().bind_addr, "127.0.0.1:4444");
    }
}
