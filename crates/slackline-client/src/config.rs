use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

pub const DEFAULT_HANDSHAKE_URL: &str = "https://slack.com/api/rtm.connect";
pub const DEFAULT_DNS_SERVER: IpAddr = IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8));
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(200);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const RESOLVER_CACHE_TTL: Duration = Duration::from_secs(60);
const MAX_HANDSHAKE_BODY: usize = 1024 * 1024;

/// Client configuration. Every field has a usable default.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Handshake endpoint; the access token is appended as `?token=`.
    pub handshake_url: String,
    /// Nameserver queried by the default resolver.
    pub dns_server: IpAddr,
    /// How often the scheduler reports outstanding work while running.
    pub tick_interval: Duration,
    /// TCP connect timeout for the handshake HTTP client.
    pub connect_timeout: Duration,
    /// Upper bound for the HTTP handshake. `None` waits indefinitely.
    pub handshake_timeout: Option<Duration>,
    /// Upper bound for the socket upgrade. `None` waits indefinitely.
    pub session_timeout: Option<Duration>,
    pub resolver_cache_ttl: Duration,
    /// Largest handshake body accepted before it is treated as malformed.
    pub max_handshake_body: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            handshake_url: DEFAULT_HANDSHAKE_URL.to_string(),
            dns_server: DEFAULT_DNS_SERVER,
            tick_interval: DEFAULT_TICK_INTERVAL,
            connect_timeout: CONNECT_TIMEOUT,
            handshake_timeout: None,
            session_timeout: None,
            resolver_cache_ttl: RESOLVER_CACHE_TTL,
            max_handshake_body: MAX_HANDSHAKE_BODY,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.handshake_url, "https://slack.com/api/rtm.connect");
        assert_eq!(config.dns_server.to_string(), "8.8.8.8");
        assert_eq!(config.tick_interval, Duration::from_millis(200));
        assert_eq!(config.connect_timeout, Duration::from_secs(30));
        assert!(config.handshake_timeout.is_none());
        assert!(config.session_timeout.is_none());
        assert_eq!(config.max_handshake_body, 1_048_576);
    }
}
