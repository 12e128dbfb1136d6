//! Client configuration types.

use std::path::PathBuf;
use std::time::Duration;

use mqlink_core::{QoS, Will};

/// Reconnection backoff configuration.
///
/// The delay before attempt `n` (counting consecutive failures from zero)
/// is `min(min_interval * 2^n, max_interval)`. The failure count resets on
/// the first accepted CONNACK.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Delay before the first retry.
    pub min_interval: Duration,
    /// Upper bound for the delay between retries.
    pub max_interval: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(30),
        }
    }
}

impl BackoffConfig {
    /// Compute the delay after `failures` consecutive failed attempts.
    pub fn delay(&self, failures: u32) -> Duration {
        let scaled = self
            .min_interval
            .saturating_mul(2u32.saturating_pow(failures.min(31)));
        scaled.min(self.max_interval)
    }
}

/// TLS transport options.
#[derive(Debug, Clone, Default)]
pub struct TlsOptions {
    /// PEM file with additional trusted CA certificates. When unset, the
    /// webpki system roots are used.
    pub ca_cert: Option<PathBuf>,
    /// PEM file with the client certificate chain, for mutual TLS.
    pub client_cert: Option<PathBuf>,
    /// PEM file with the client private key, for mutual TLS.
    pub client_key: Option<PathBuf>,
    /// Server name for SNI and certificate verification. Defaults to the
    /// host part of the address.
    pub server_name: Option<String>,
    /// Skip certificate verification. Only for testing with self-signed
    /// certificates.
    pub accept_invalid_certs: bool,
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Remote broker address (host:port).
    pub address: String,
    /// Client identifier. Required, non-empty.
    pub client_id: String,
    /// Username for authentication.
    pub username: Option<String>,
    /// Password for authentication.
    pub password: Option<Vec<u8>>,
    /// Keep-alive interval in seconds (0 = disabled).
    pub keep_alive: u16,
    /// Clean session flag for the first CONNECT.
    pub clean_session: bool,
    /// Send `clean_session=1` on every reconnect instead of resuming the
    /// session. Local session state is wiped before each attempt.
    pub always_clean_session: bool,
    /// Last Will and Testament message.
    pub will: Option<Will>,
    /// Subscriptions established right after every accepted CONNACK.
    pub subscriptions: Vec<(String, QoS)>,
    /// Reconnection backoff configuration.
    pub backoff: BackoffConfig,
    /// Delay before the very first connect attempt (startup staggering).
    pub first_connect_delay: Duration,
    /// TCP/TLS connect timeout.
    pub connect_timeout: Duration,
    /// How long to wait for the CONNACK after sending CONNECT.
    pub connack_timeout: Duration,
    /// Maximum allowed inbound packet size (0 = no limit).
    pub max_packet_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            address: "localhost:1883".to_string(),
            client_id: String::new(),
            username: None,
            password: None,
            keep_alive: 60,
            clean_session: true,
            always_clean_session: false,
            will: None,
            subscriptions: Vec::new(),
            backoff: BackoffConfig::default(),
            first_connect_delay: Duration::ZERO,
            connect_timeout: Duration::from_secs(10),
            connack_timeout: Duration::from_secs(60),
            max_packet_size: 0,
        }
    }
}

impl ClientConfig {
    /// Create a new config with the given address.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ..Default::default()
        }
    }

    /// Set the client ID.
    pub fn client_id(mut self, id: impl Into<String>) -> Self {
        self.client_id = id.into();
        self
    }

    /// Set username and password.
    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<Vec<u8>>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Set keep-alive interval in seconds.
    pub fn keep_alive(mut self, seconds: u16) -> Self {
        self.keep_alive = seconds;
        self
    }

    /// Set the clean session flag for the first CONNECT.
    pub fn clean_session(mut self, clean: bool) -> Self {
        self.clean_session = clean;
        self
    }

    /// Request a clean session on every connect, not just the first.
    pub fn always_clean_session(mut self, always: bool) -> Self {
        self.always_clean_session = always;
        self
    }

    /// Set the Last Will and Testament message.
    pub fn will(mut self, will: Will) -> Self {
        self.will = Some(will);
        self
    }

    /// Subscribe to the given filters after every accepted CONNACK.
    pub fn subscriptions(mut self, filters: impl IntoIterator<Item = (String, QoS)>) -> Self {
        self.subscriptions = filters.into_iter().collect();
        self
    }

    /// Set reconnection backoff bounds.
    pub fn backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Delay the very first connect attempt.
    pub fn first_connect_delay(mut self, delay: Duration) -> Self {
        self.first_connect_delay = delay;
        self
    }

    /// Set the TCP/TLS connect timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set how long to wait for a CONNACK before tearing the socket down.
    pub fn connack_timeout(mut self, timeout: Duration) -> Self {
        self.connack_timeout = timeout;
        self
    }

    /// Set the maximum allowed inbound packet size (0 = no limit).
    pub fn max_packet_size(mut self, max: usize) -> Self {
        self.max_packet_size = max;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_schedule() {
        let backoff = BackoffConfig {
            min_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(30),
        };

        assert_eq!(backoff.delay(0), Duration::from_millis(100));
        assert_eq!(backoff.delay(1), Duration::from_millis(200));
        assert_eq!(backoff.delay(2), Duration::from_millis(400));
        assert_eq!(backoff.delay(8), Duration::from_millis(25_600));
        // Clamped at max_interval from here on
        assert_eq!(backoff.delay(9), Duration::from_secs(30));
        assert_eq!(backoff.delay(100), Duration::from_secs(30));
    }

    #[test]
    fn test_backoff_does_not_overflow() {
        let backoff = BackoffConfig {
            min_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(60),
        };
        assert_eq!(backoff.delay(u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn test_builder() {
        let config = ClientConfig::new("broker:1883")
            .client_id("c1")
            .keep_alive(30)
            .clean_session(false)
            .credentials("user", "pass");

        assert_eq!(config.address, "broker:1883");
        assert_eq!(config.client_id, "c1");
        assert_eq!(config.keep_alive, 30);
        assert!(!config.clean_session);
        assert_eq!(config.username.as_deref(), Some("user"));
        assert_eq!(config.password.as_deref(), Some(b"pass".as_slice()));
    }
}
