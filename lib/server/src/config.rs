use std::time::Duration;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Lower bound enforced on the close-frame write deadline, regardless of the
/// configured [`ServerConfig::grace_close_period`]. The post-close sleep
/// still uses the configured value unmodified.
pub const MIN_CLOSE_WRITE_DEADLINE: Duration = Duration::from_secs(2);

fn default_connection_init_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_grace_close_period() -> Duration {
    Duration::from_secs(5)
}

/// Tunables for a server-side socket.
///
/// By default, a socket allows 30 seconds for the client to send
/// `connection_init` before closing with code 4408, and gives a closing peer
/// 5 seconds to observe the close frame's reason before the socket is torn
/// down.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// How long to wait for `connection_init` after the WebSocket upgrade
    /// completes before closing with code 4408.
    ///
    /// You can override this setting by setting the `WS_CONNECTION_INIT_TIMEOUT`
    /// environment variable, e.g. `30s`.
    #[serde(
        default = "default_connection_init_timeout",
        with = "humantime_serde"
    )]
    #[schemars(with = "String")]
    pub connection_init_timeout: Duration,

    /// How long a closing socket waits after writing the close frame before
    /// tearing down the underlying transport, giving the peer time to observe
    /// the close reason.
    ///
    /// Internally lower-bounded to 2 seconds for the write deadline only; the
    /// sleep itself honors the configured value unmodified.
    #[serde(default = "default_grace_close_period", with = "humantime_serde")]
    #[schemars(with = "String")]
    pub grace_close_period: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            connection_init_timeout: default_connection_init_timeout(),
            grace_close_period: default_grace_close_period(),
        }
    }
}

impl ServerConfig {
    /// The deadline applied to the close-frame write itself: the configured
    /// grace period, floored at [`MIN_CLOSE_WRITE_DEADLINE`].
    pub fn close_write_deadline(&self) -> Duration {
        self.grace_close_period.max(MIN_CLOSE_WRITE_DEADLINE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.connection_init_timeout, Duration::from_secs(30));
        assert_eq!(cfg.grace_close_period, Duration::from_secs(5));
    }

    #[test]
    fn close_write_deadline_floors_short_grace_periods() {
        let mut cfg = ServerConfig::default();
        cfg.grace_close_period = Duration::from_millis(200);
        assert_eq!(cfg.close_write_deadline(), MIN_CLOSE_WRITE_DEADLINE);
    }

    #[test]
    fn close_write_deadline_passes_through_long_grace_periods() {
        let mut cfg = ServerConfig::default();
        cfg.grace_close_period = Duration::from_secs(10);
        assert_eq!(cfg.close_write_deadline(), Duration::from_secs(10));
    }
}
