//! Relay configuration
//!
//! [`RelayConfig`] is the user-facing, serde-friendly configuration (TOML
//! files, CLI overrides). [`RelayConfig::resolve`] turns it into a
//! [`SessionConfig`] with a concrete peer id, channel and connection URL.

use core::time::Duration;
use std::path::Path;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::errors::{RelayError, RelayResult};
use crate::scheduler::DEFAULT_THROTTLE_INTERVAL;
use crate::types::PeerId;

/// Public relay endpoint
pub const DEFAULT_RELAY_URL: &str = "wss://widgets-relay.wotstat.info";

/// Default period of the forced full resync
pub const DEFAULT_FULL_SYNC_INTERVAL: Duration = Duration::from_millis(10_000);

/// Query parameter carrying the channel in a page URL
pub const CHANNEL_QUERY_KEY: &str = "channel-key";

// ----------------------------------------------------------------------------
// Relay Configuration
// ----------------------------------------------------------------------------

/// Configuration for a relay session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Relay endpoint URL (without the `uuid`/`channel` query)
    pub url: String,
    /// Explicit local peer id (None = generate random)
    pub peer_id: Option<PeerId>,
    /// Explicit channel (None = query parameter, then the local peer id)
    pub channel: Option<String>,
    /// Whether to reconnect after the link closes
    pub reconnect: bool,
    /// Period of the forced full resync in milliseconds
    pub full_sync_interval_ms: u64,
    /// Per-state throttle window in milliseconds
    pub throttle_interval_ms: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_RELAY_URL.to_string(),
            peer_id: None,
            channel: None,
            reconnect: true,
            full_sync_interval_ms: DEFAULT_FULL_SYNC_INTERVAL.as_millis() as u64,
            throttle_interval_ms: DEFAULT_THROTTLE_INTERVAL.as_millis() as u64,
        }
    }
}

impl RelayConfig {
    /// Load configuration from a TOML file; missing fields take defaults
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> RelayResult<Self> {
        let text = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            RelayError::configuration(format!(
                "Failed to read {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        Self::from_toml_str(&text)
    }

    /// Parse configuration from TOML text
    pub fn from_toml_str(text: &str) -> RelayResult<Self> {
        let config: Self = toml::from_str(text)
            .map_err(|e| RelayError::configuration(format!("Invalid TOML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check intervals and the endpoint URL
    pub fn validate(&self) -> RelayResult<()> {
        if self.full_sync_interval_ms == 0 {
            return Err(RelayError::configuration(
                "full_sync_interval_ms must be greater than zero",
            ));
        }
        if self.throttle_interval_ms == 0 {
            return Err(RelayError::configuration(
                "throttle_interval_ms must be greater than zero",
            ));
        }
        Url::parse(&self.url)?;
        Ok(())
    }

    /// Take the channel from a URL-style query string unless one is set
    ///
    /// Accepts `?channel-key=abc&x=1` as well as a bare `channel-key=abc`.
    pub fn with_query(mut self, query: &str) -> Self {
        if self.channel.is_none() {
            self.channel = channel_from_query(query);
        }
        self
    }

    pub fn full_sync_interval(&self) -> Duration {
        Duration::from_millis(self.full_sync_interval_ms)
    }

    pub fn throttle_interval(&self) -> Duration {
        Duration::from_millis(self.throttle_interval_ms)
    }

    /// Fix peer id and channel and build the connection URL
    pub fn resolve(&self) -> RelayResult<SessionConfig> {
        self.validate()?;
        let peer_id = self.peer_id.clone().unwrap_or_else(PeerId::random);
        let channel = self
            .channel
            .clone()
            .unwrap_or_else(|| peer_id.as_str().to_string());
        let connect_url = connection_url(&self.url, &peer_id, &channel)?;

        Ok(SessionConfig {
            peer_id,
            channel,
            connect_url,
            reconnect: self.reconnect,
            full_sync_interval: self.full_sync_interval(),
            throttle_interval: self.throttle_interval(),
        })
    }
}

/// Extract the `channel-key` parameter from a query string
pub fn channel_from_query(query: &str) -> Option<String> {
    let query = query.trim_start_matches('?');
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == CHANNEL_QUERY_KEY)
        .map(|(_, value)| value.into_owned())
        .filter(|value| !value.is_empty())
}

/// Append the peer id and channel to the endpoint URL
pub fn connection_url(endpoint: &str, peer_id: &PeerId, channel: &str) -> RelayResult<Url> {
    let mut url = Url::parse(endpoint)?;
    url.query_pairs_mut()
        .append_pair("uuid", peer_id.as_str())
        .append_pair("channel", channel);
    Ok(url)
}

// ----------------------------------------------------------------------------
// Session Configuration
// ----------------------------------------------------------------------------

/// Resolved configuration consumed by the session and the connection manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub peer_id: PeerId,
    pub channel: String,
    pub connect_url: Url,
    pub reconnect: bool,
    pub full_sync_interval: Duration,
    pub throttle_interval: Duration,
}

impl SessionConfig {
    /// Default configuration for a given peer on its private channel
    pub fn for_peer(peer_id: PeerId) -> RelayResult<Self> {
        RelayConfig {
            peer_id: Some(peer_id),
            ..RelayConfig::default()
        }
        .resolve()
    }
}

// ----------------------------------------------------------------------------
// Reconnect Backoff
// ----------------------------------------------------------------------------

/// Delay before the next connection attempt
///
/// `attempt` counts consecutive attempts since the last successful open,
/// starting at 1.
pub fn reconnect_delay(attempt: u32) -> Duration {
    let millis = match attempt {
        a if a > 1000 => 10_000,
        a if a > 50 => 1_000,
        a if a > 10 => 500,
        _ => 100,
    };
    Duration::from_millis(millis)
}
