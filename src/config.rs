use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;
use std::time::Duration;

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the server to
    pub bind_address: IpAddr,
    /// Port to listen on
    pub port: u16,
    /// Highest session id handed out; also the connection cap
    pub max_session_id: u32,
    /// Concurrent connections allowed from one source address
    pub max_connections_per_ip: usize,
    /// Per-client outbound queue depth before eviction
    pub outbound_queue_capacity: usize,
    /// Period of population and party pushes
    pub announce_interval: Duration,
    /// Game this server instance serves
    pub game_name: String,
    pub metrics_port: u16,
    /// Take the source address from `X-Forwarded-For` (behind a proxy)
    pub trust_forwarded_for: bool,
    /// Poll interval while waiting on a ranking recompute
    pub ranking_poll: Duration,
    /// Path to TLS certificate file
    pub tls_cert_path: Option<String>,
    /// Path to TLS key file
    pub tls_key_path: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)),
            port: 4433,
            max_session_id: 1024,
            max_connections_per_ip: 3,
            outbound_queue_capacity: 256,
            announce_interval: Duration::from_secs(5),
            game_name: "2kki".to_string(),
            metrics_port: 9090,
            trust_forwarded_for: false,
            ranking_poll: Duration::from_millis(100),
            tls_cert_path: None,
            tls_key_path: None,
        }
    }
}

/// Parse `name` into `slot` if set and accepted by `check`; warn otherwise
fn env_parse<T: FromStr>(name: &str, slot: &mut T, check: impl Fn(&T) -> bool, rule: &str) {
    let Ok(raw) = std::env::var(name) else {
        return;
    };
    match raw.parse::<T>() {
        Ok(parsed) if check(&parsed) => *slot = parsed,
        Ok(_) => tracing::warn!("{} must be {}, using default", name, rule),
        Err(_) => tracing::warn!("Invalid {} '{}', using default", name, raw),
    }
}

impl ServerConfig {
    /// Load config from environment or use defaults
    pub fn load_or_default() -> Self {
        let mut config = Self::default();

        env_parse("BIND_ADDRESS", &mut config.bind_address, |_| true, "an IP address");
        env_parse("PORT", &mut config.port, |p| *p > 0, "> 0");
        env_parse(
            "MAX_SESSION_ID",
            &mut config.max_session_id,
            |n| (1..=65535).contains(n),
            "1-65535",
        );
        env_parse(
            "MAX_CONNECTIONS_PER_IP",
            &mut config.max_connections_per_ip,
            |n| *n > 0,
            "> 0",
        );
        env_parse(
            "OUTBOUND_QUEUE_CAPACITY",
            &mut config.outbound_queue_capacity,
            |n| (2..=65536).contains(n),
            "2-65536",
        );

        let mut announce_secs = config.announce_interval.as_secs();
        env_parse("ANNOUNCE_INTERVAL_SECS", &mut announce_secs, |s| *s > 0, "> 0");
        config.announce_interval = Duration::from_secs(announce_secs);

        if let Ok(game) = std::env::var("GAME_NAME") {
            if game.is_empty() {
                tracing::warn!("GAME_NAME is empty, using default");
            } else {
                config.game_name = game;
            }
        }

        env_parse("METRICS_PORT", &mut config.metrics_port, |p| *p > 0, "> 0");

        if let Ok(trust) = std::env::var("TRUST_FORWARDED_FOR") {
            config.trust_forwarded_for = matches!(trust.as_str(), "1" | "true" | "yes");
        }

        let mut poll_ms = config.ranking_poll.as_millis() as u64;
        env_parse("RANKING_POLL_MS", &mut poll_ms, |ms| *ms > 0, "> 0");
        config.ranking_poll = Duration::from_millis(poll_ms);

        if let Ok(cert_path) = std::env::var("TLS_CERT_PATH") {
            config.tls_cert_path = Some(cert_path);
        }

        if let Ok(key_path) = std::env::var("TLS_KEY_PATH") {
            config.tls_key_path = Some(key_path);
        }

        config
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), String> {
        if self.port == 0 {
            return Err("Port cannot be 0".to_string());
        }
        if self.port == self.metrics_port {
            return Err("METRICS_PORT must differ from PORT".to_string());
        }
        if self.max_session_id == 0 {
            return Err("max_session_id must be at least 1".to_string());
        }
        if self.max_connections_per_ip == 0 {
            return Err("max_connections_per_ip must be at least 1".to_string());
        }
        // Room for the greeting plus at least one message
        if self.outbound_queue_capacity < 2 {
            return Err("outbound_queue_capacity must be at least 2".to_string());
        }
        if self.announce_interval.is_zero() {
            return Err("announce_interval cannot be zero".to_string());
        }
        if self.tls_cert_path.is_some() != self.tls_key_path.is_some() {
            return Err("TLS_CERT_PATH and TLS_KEY_PATH must be set together".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 4433);
        assert_eq!(config.max_connections_per_ip, 3);
        assert_eq!(config.announce_interval, Duration::from_secs(5));
        assert!(!config.trust_forwarded_for);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_or_default() {
        let config = ServerConfig::load_or_default();
        assert!(config.port > 0);
    }

    #[test]
    fn test_env_parse_rejects_out_of_range() {
        std::env::set_var("PRESENCE_TEST_QUEUE", "1");
        let mut slot = 256usize;
        env_parse("PRESENCE_TEST_QUEUE", &mut slot, |n| *n >= 2, ">= 2");
        assert_eq!(slot, 256);

        std::env::set_var("PRESENCE_TEST_QUEUE", "nope");
        env_parse("PRESENCE_TEST_QUEUE", &mut slot, |n| *n >= 2, ">= 2");
        assert_eq!(slot, 256);

        std::env::set_var("PRESENCE_TEST_QUEUE", "64");
        env_parse("PRESENCE_TEST_QUEUE", &mut slot, |n| *n >= 2, ">= 2");
        assert_eq!(slot, 64);
        std::env::remove_var("PRESENCE_TEST_QUEUE");
    }

    #[test]
    fn test_validate_tls_pair() {
        let config = ServerConfig {
            tls_cert_path: Some("cert.pem".to_string()),
            ..ServerConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_port_clash() {
        let config = ServerConfig {
            metrics_port: 4433,
            ..ServerConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
