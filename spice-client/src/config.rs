use crate::protocol::MouseMode;
use crate::transport::{TransportConfig, TrustAnchor};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunables for one session. Every field has a default, so hosts only set
/// what they need.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Bound on `connect` until the main channel is ready.
    pub connect_timeout: Duration,
    /// Bound on each channel's link and authentication exchange.
    pub link_timeout: Duration,
    /// Per-channel in-session read deadline. `None` blocks indefinitely.
    pub read_timeout: Option<Duration>,
    /// How long channels may drain after the server announces disconnect.
    pub drain_timeout: Duration,
    /// How long writer queues may flush on local disconnect.
    pub writer_drain_timeout: Duration,
    /// How long a frame may wait for the consumer before it is dropped.
    pub callback_deadline: Duration,
    /// How long a primary surface may stay unmarked before the display
    /// channel fails.
    pub mark_timeout: Duration,
    /// Shortest gap between two frames of one display channel; updates in
    /// between are merged into the next frame. Zero disables the cap.
    pub min_frame_interval: Duration,
    /// How long coalesced pointer motion may wait for a presented frame or
    /// a motion ack before it is sent anyway.
    pub pointer_flush_interval: Duration,
    pub outbound_queue_capacity: usize,
    pub input_queue_capacity: usize,
    pub frame_queue_capacity: usize,
    /// Largest inbound message body accepted.
    pub max_message_size: u32,
    /// Combined byte budget for surfaces and the pixmap cache of one
    /// display channel. Announced to the server in `DISPLAY_INIT`.
    pub display_cache_bytes: u64,
    /// Requested from the server after `INIT` when supported.
    pub preferred_mouse_mode: Option<MouseMode>,
    /// Use TLS even when the endpoint does not ask for it.
    pub force_tls: bool,
    /// Link uninterpreted channel kinds as passive channels that only keep
    /// ACK accounting alive.
    pub open_unsupported_channels: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(15),
            link_timeout: Duration::from_secs(10),
            read_timeout: None,
            drain_timeout: Duration::from_secs(2),
            writer_drain_timeout: Duration::from_millis(500),
            callback_deadline: Duration::from_millis(100),
            mark_timeout: Duration::from_secs(10),
            min_frame_interval: Duration::from_micros(16_667),
            pointer_flush_interval: Duration::from_millis(33),
            outbound_queue_capacity: 256,
            input_queue_capacity: 256,
            frame_queue_capacity: 4,
            max_message_size: 64 * 1024 * 1024,
            display_cache_bytes: 256 * 1024 * 1024,
            preferred_mouse_mode: None,
            force_tls: false,
            open_unsupported_channels: false,
        }
    }
}

impl ClientConfig {
    pub(crate) fn transport_config(&self, trust: &TrustAnchor) -> TransportConfig {
        TransportConfig {
            trust: trust.clone(),
            force_tls: self.force_tls,
            connect_timeout: self.connect_timeout,
            read_timeout: self.read_timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.connect_timeout, Duration::from_secs(15));
        assert_eq!(config.drain_timeout, Duration::from_secs(2));
        assert_eq!(config.writer_drain_timeout, Duration::from_millis(500));
        assert_eq!(config.outbound_queue_capacity, 256);
        assert_eq!(config.min_frame_interval, Duration::from_micros(16_667));
        assert_eq!(config.pointer_flush_interval, Duration::from_millis(33));
    }

    #[test]
    fn test_partial_deserialize_keeps_defaults() {
        let config: ClientConfig = from_entries();
        assert_eq!(config.input_queue_capacity, 8);
        assert_eq!(config.outbound_queue_capacity, 256);
    }

    fn from_entries() -> ClientConfig {
        use serde::de::value::{Error, MapDeserializer};
        let entries = vec![("input_queue_capacity", 8usize)];
        let de = MapDeserializer::<_, Error>::new(entries.into_iter());
        ClientConfig::deserialize(de).unwrap()
    }
}
