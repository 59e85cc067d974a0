use std::time::Duration;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

fn default_connection_ack_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_grace_close_period() -> Duration {
    Duration::from_secs(5)
}

/// Tunables for a client-side connection.
///
/// By default, the client waits 30 seconds for `connection_ack` after
/// sending `connection_init`, and attempts the initial dial exactly once
/// (no reconnection).
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ClientConfig {
    /// The `ws://` or `wss://` URL to dial.
    pub url: String,

    /// How long to wait for `connection_ack` after sending `connection_init`
    /// before closing with a fatal error.
    ///
    /// You can override this setting by setting the
    /// `WS_CONNECTION_ACK_TIMEOUT` environment variable, e.g. `30s`.
    #[serde(default = "default_connection_ack_timeout", with = "humantime_serde")]
    #[schemars(with = "String")]
    pub connection_ack_timeout: Duration,

    /// How long a closing socket waits after writing the close frame before
    /// tearing down the underlying transport.
    #[serde(default = "default_grace_close_period", with = "humantime_serde")]
    #[schemars(with = "String")]
    pub grace_close_period: Duration,

    /// Additional dial attempts after the first failure. Zero means a single
    /// attempt with no retry.
    #[serde(default)]
    pub reconnect_attempts: u32,
}

impl ClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            connection_ack_timeout: default_connection_ack_timeout(),
            grace_close_period: default_grace_close_period(),
            reconnect_attempts: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_applies_documented_defaults() {
        let cfg = ClientConfig::new("ws://localhost/graphql");
        assert_eq!(cfg.connection_ack_timeout, Duration::from_secs(30));
        assert_eq!(cfg.grace_close_period, Duration::from_secs(5));
        assert_eq!(cfg.reconnect_attempts, 0);
    }
}
