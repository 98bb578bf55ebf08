//! Outbound publish/subscribe channel.
//!
//! The bridge publishes JSON bodies to named destinations and consumes
//! frames from the destinations it subscribed to. [`StompBroker`] speaks
//! STOMP over a websocket; [`MemoryBroker`] records everything in-process.

mod memory;
pub mod stomp;
mod websocket;

use std::time::Duration;

use async_trait::async_trait;
use secrecy::SecretString;
use tokio::sync::broadcast;
use url::Url;

use crate::error::Error;

pub use memory::{MemoryBroker, Published};
pub use websocket::StompBroker;

/// A frame received on a subscribed destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub destination: String,
    pub body: String,
}

#[async_trait]
pub trait Broker: Send + Sync {
    /// Queue `body` for delivery to `destination`. Never waits on the network.
    fn publish(&self, destination: &str, body: String) -> Result<(), Error>;

    /// A receiver for frames arriving on subscribed destinations.
    fn subscribe(&self) -> broadcast::Receiver<InboundMessage>;

    /// Whether the link to the broker is currently up.
    fn is_connected(&self) -> bool;

    /// Stop the broker link.
    async fn shutdown(&self);
}

// ── Configuration ────────────────────────────────────────────────────

/// Exponential backoff configuration for broker reconnection.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first reconnection attempt. Default: 1s.
    pub initial_delay: Duration,

    /// Upper bound on backoff delay. Default: 30s.
    pub max_delay: Duration,

    /// Maximum reconnection attempts before giving up.
    /// `None` means retry forever.
    pub max_retries: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_retries: None,
        }
    }
}

/// How to reach the STOMP broker.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Websocket endpoint, e.g. `ws://localhost:61614/stomp`.
    pub url: Url,
    /// STOMP virtual host. Defaults to the URL host.
    pub host: Option<String>,
    pub login: Option<String>,
    pub passcode: Option<SecretString>,
    /// Destinations to subscribe to after every (re)connect.
    pub subscriptions: Vec<String>,
    pub reconnect: ReconnectConfig,
}

/// Exponential backoff with jitter.
///
/// `delay = min(initial * 2^attempt, max) + jitter`
///
/// Jitter is +-25% to spread out reconnection storms from multiple bridges.
pub(crate) fn calculate_backoff(attempt: u32, config: &ReconnectConfig) -> Duration {
    let exponent = i32::try_from(attempt.min(30)).unwrap_or(30);
    let base = config.initial_delay.as_secs_f64() * 2.0_f64.powi(exponent);
    let capped = base.min(config.max_delay.as_secs_f64());

    // Deterministic "jitter" seeded from the attempt number.
    let jitter_factor = 1.0 + 0.25 * (f64::from(attempt) * 7.3).sin();
    let with_jitter = (capped * jitter_factor).max(0.0);

    Duration::from_secs_f64(with_jitter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_reconnect_config() {
        let config = ReconnectConfig::default();
        assert_eq!(config.initial_delay, Duration::from_secs(1));
        assert_eq!(config.max_delay, Duration::from_secs(30));
        assert!(config.max_retries.is_none());
    }

    #[test]
    fn backoff_increases_exponentially() {
        let config = ReconnectConfig::default();

        let d0 = calculate_backoff(0, &config);
        let d1 = calculate_backoff(1, &config);
        let d2 = calculate_backoff(2, &config);

        assert!(d1 > d0, "d1 ({d1:?}) should be greater than d0 ({d0:?})");
        assert!(d2 > d1, "d2 ({d2:?}) should be greater than d1 ({d1:?})");
    }

    #[test]
    fn backoff_caps_at_max_delay() {
        let config = ReconnectConfig {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            max_retries: None,
        };

        // Jitter tops out at 1.25x.
        let d10 = calculate_backoff(10, &config);
        assert!(d10 <= Duration::from_secs(13), "{d10:?} should be capped near max_delay");

        let huge = calculate_backoff(u32::MAX, &config);
        assert!(huge <= Duration::from_secs(13));
    }
}
