//! Centralized configuration for the editor registry.
//!
//! `RegistryConfig` holds compile-time defaults; `RegistrySettings` is the
//! runtime view the daemon builds from flags and environment variables.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Registry defaults and protocol limits.
pub struct RegistryConfig;

impl RegistryConfig {
    pub const DAEMON_BINARY: &'static str = "editor-registryd";

    // Endpoint
    pub const DEFAULT_PORT: u16 = 57394;
    pub const BIND_ADDR: Ipv4Addr = Ipv4Addr::LOCALHOST;
    pub const PORT_ENV_VAR: &'static str = "EDITOR_REGISTRY_PORT";

    // Reservation protocol
    pub const RESERVATION_TTL: Duration = Duration::from_secs(15);
    pub const CLAIM_POLL_INTERVAL: Duration = Duration::from_millis(500);

    // Liveness
    pub const STARTUP_GRACE: Duration = Duration::from_secs(30);
    pub const PROBE_TIMEOUT: Duration = Duration::from_secs(3);
    pub const SWEEP_INTERVAL: Duration = Duration::from_secs(5);

    // IPC limits
    pub const MAX_IPC_MESSAGE_SIZE: usize = 1024 * 1024;
    pub const MAX_IPC_CONNECTIONS: usize = 256;
    pub const IPC_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
    pub const IPC_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
    pub const IPC_IDLE_TIMEOUT: Duration = Duration::from_secs(10);

    // Daemon auto-start
    pub const DAEMON_START_TIMEOUT: Duration = Duration::from_secs(5);
    pub const DAEMON_START_POLL: Duration = Duration::from_millis(100);
}

/// Runtime settings shared by the store, the prober and the endpoint.
#[derive(Debug, Clone)]
pub struct RegistrySettings {
    /// Port on 127.0.0.1 the endpoint listens on (0 = OS-assigned).
    pub port: u16,
    /// How long a granted reservation stays valid without promotion.
    pub reservation_ttl: Duration,
    /// How long a never-reachable Active instance is tolerated.
    pub startup_grace: Duration,
    /// Upper bound for a single liveness probe.
    pub probe_timeout: Duration,
    /// Period of the background sweep.
    pub sweep_interval: Duration,
    /// Probe an Active instance before handing its address to a query.
    pub probe_on_query: bool,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            port: RegistryConfig::DEFAULT_PORT,
            reservation_ttl: RegistryConfig::RESERVATION_TTL,
            startup_grace: RegistryConfig::STARTUP_GRACE,
            probe_timeout: RegistryConfig::PROBE_TIMEOUT,
            sweep_interval: RegistryConfig::SWEEP_INTERVAL,
            probe_on_query: true,
        }
    }
}

impl RegistrySettings {
    /// Socket address of the endpoint for these settings.
    pub fn endpoint(&self) -> SocketAddr {
        SocketAddr::from((RegistryConfig::BIND_ADDR, self.port))
    }
}

/// Resolve the endpoint port from `EDITOR_REGISTRY_PORT`, falling back to the default.
///
/// An unparsable value is ignored rather than treated as fatal.
pub fn port_from_env() -> u16 {
    parse_port(std::env::var(RegistryConfig::PORT_ENV_VAR).ok().as_deref())
}

fn parse_port(value: Option<&str>) -> u16 {
    value
        .and_then(|v| v.trim().parse::<u16>().ok())
        .unwrap_or(RegistryConfig::DEFAULT_PORT)
}

/// Default endpoint address, honouring the port override.
pub fn default_endpoint() -> SocketAddr {
    SocketAddr::from((RegistryConfig::BIND_ADDR, port_from_env()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_port_fallbacks() {
        assert_eq!(parse_port(None), RegistryConfig::DEFAULT_PORT);
        assert_eq!(parse_port(Some("not-a-port")), RegistryConfig::DEFAULT_PORT);
        assert_eq!(parse_port(Some(" 6000 ")), 6000);
    }

    #[test]
    fn test_endpoint_is_loopback() {
        let settings = RegistrySettings {
            port: 4242,
            ..Default::default()
        };
        let addr = settings.endpoint();
        assert!(addr.ip().is_loopback());
        assert_eq!(addr.port(), 4242);
    }

    #[test]
    fn test_timeouts_are_reasonable() {
        assert!(RegistryConfig::RESERVATION_TTL > RegistryConfig::CLAIM_POLL_INTERVAL);
        assert!(RegistryConfig::PROBE_TIMEOUT < RegistryConfig::RESERVATION_TTL);
    }
}
