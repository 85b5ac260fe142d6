use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use wirecall_common::{Result, RpcError};

pub const MAX_IDLE_TIME_KEY: &str = "ipc.client.connection.maxidletime";
pub const MAX_RETRIES_KEY: &str = "ipc.client.connect.max.retries";
pub const MAX_RETRIES_ON_TIMEOUTS_KEY: &str = "ipc.client.connect.max.retries.on.timeouts";
pub const CONNECT_TIMEOUT_KEY: &str = "ipc.client.connect.timeout";
pub const RETRY_INTERVAL_KEY: &str = "ipc.client.connect.retry.interval";
pub const TCP_NO_DELAY_KEY: &str = "ipc.client.tcpnodelay";
pub const PING_INTERVAL_KEY: &str = "ipc.ping.interval";

/// Client configuration.
///
/// Controls connection setup, retry budgets, liveness pings and idle culling
/// for every connection a [`Client`](crate::Client) opens.
///
/// # Default Configuration
///
/// - `max_idle_time_ms`: 10000 (10 seconds)
/// - `max_retries`: 0
/// - `max_retries_on_timeouts`: 45
/// - `connect_timeout_ms`: 20000 (20 seconds)
/// - `retry_interval_ms`: 1000 (1 second)
/// - `tcp_no_delay`: false
/// - `ping_interval_ms`: 60000 (1 minute)
///
/// # Example
///
/// ```rust
/// use wirecall_client::ClientConfig;
///
/// let config = ClientConfig::default()
///     .with_max_retries(3)
///     .with_ping_interval_ms(5000);
/// assert_eq!(config.max_retries, 3);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Idle connections with no outstanding calls are closed after this long
    pub max_idle_time_ms: u64,
    /// Connect attempts allowed after non-timeout failures
    pub max_retries: u32,
    /// Connect attempts allowed after connect timeouts
    pub max_retries_on_timeouts: u32,
    /// Timeout for a single connect attempt
    pub connect_timeout_ms: u64,
    /// Sleep between connect attempts
    pub retry_interval_ms: u64,
    /// Disable Nagle's algorithm on client sockets
    pub tcp_no_delay: bool,
    /// Reads wait this long before the connection sends a ping
    pub ping_interval_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_idle_time_ms: 10_000,
            max_retries: 0,
            max_retries_on_timeouts: 45,
            connect_timeout_ms: 20_000,
            retry_interval_ms: 1_000,
            tcp_no_delay: false,
            ping_interval_ms: 60_000,
        }
    }
}

impl ClientConfig {
    pub fn with_max_idle_time_ms(mut self, ms: u64) -> Self {
        self.max_idle_time_ms = ms;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_max_retries_on_timeouts(mut self, retries: u32) -> Self {
        self.max_retries_on_timeouts = retries;
        self
    }

    pub fn with_connect_timeout_ms(mut self, ms: u64) -> Self {
        self.connect_timeout_ms = ms;
        self
    }

    pub fn with_retry_interval_ms(mut self, ms: u64) -> Self {
        self.retry_interval_ms = ms;
        self
    }

    pub fn with_tcp_no_delay(mut self, enabled: bool) -> Self {
        self.tcp_no_delay = enabled;
        self
    }

    pub fn with_ping_interval_ms(mut self, ms: u64) -> Self {
        self.ping_interval_ms = ms;
        self
    }

    pub fn max_idle_time(&self) -> Duration {
        Duration::from_millis(self.max_idle_time_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    /// Builds a config from `ipc.*` properties, falling back to the defaults
    /// for missing keys.
    ///
    /// # Errors
    ///
    /// Returns `RpcError::InvalidArgument` if a present key does not parse.
    pub fn from_properties(props: &HashMap<String, String>) -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            max_idle_time_ms: property(props, MAX_IDLE_TIME_KEY, defaults.max_idle_time_ms)?,
            max_retries: property(props, MAX_RETRIES_KEY, defaults.max_retries)?,
            max_retries_on_timeouts: property(
                props,
                MAX_RETRIES_ON_TIMEOUTS_KEY,
                defaults.max_retries_on_timeouts,
            )?,
            connect_timeout_ms: property(props, CONNECT_TIMEOUT_KEY, defaults.connect_timeout_ms)?,
            retry_interval_ms: property(props, RETRY_INTERVAL_KEY, defaults.retry_interval_ms)?,
            tcp_no_delay: property(props, TCP_NO_DELAY_KEY, defaults.tcp_no_delay)?,
            ping_interval_ms: property(props, PING_INTERVAL_KEY, defaults.ping_interval_ms)?,
        })
    }
}

fn property<T: FromStr>(props: &HashMap<String, String>, key: &str, default: T) -> Result<T> {
    match props.get(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|_| {
            RpcError::InvalidArgument(format!("invalid value '{raw}' for {key}"))
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = ClientConfig::default();
        assert_eq!(config.max_idle_time(), Duration::from_secs(10));
        assert_eq!(config.max_retries, 0);
        assert_eq!(config.max_retries_on_timeouts, 45);
        assert_eq!(config.connect_timeout(), Duration::from_secs(20));
        assert_eq!(config.retry_interval(), Duration::from_secs(1));
        assert!(!config.tcp_no_delay);
        assert_eq!(config.ping_interval(), Duration::from_secs(60));
    }

    #[test]
    fn test_from_properties() {
        let props: HashMap<String, String> = [
            (MAX_IDLE_TIME_KEY, "2500"),
            (MAX_RETRIES_KEY, "4"),
            (TCP_NO_DELAY_KEY, "true"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let config = ClientConfig::from_properties(&props).unwrap();
        assert_eq!(config.max_idle_time_ms, 2500);
        assert_eq!(config.max_retries, 4);
        assert!(config.tcp_no_delay);
        assert_eq!(config.ping_interval_ms, 60_000);
    }

    #[test]
    fn test_from_properties_invalid_value() {
        let mut props = HashMap::new();
        props.insert(PING_INTERVAL_KEY.to_string(), "soon".to_string());
        let err = ClientConfig::from_properties(&props).unwrap_err();
        assert!(matches!(err, RpcError::InvalidArgument(_)));
    }

    #[test]
    fn test_deserialize_partial_json() {
        let config: ClientConfig =
            serde_json::from_str(r#"{"max_retries": 2, "ping_interval_ms": 100}"#).unwrap();
        assert_eq!(config.max_retries, 2);
        assert_eq!(config.ping_interval_ms, 100);
        assert_eq!(config.connect_timeout_ms, 20_000);
    }
}
