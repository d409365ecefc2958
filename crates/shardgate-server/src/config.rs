//! Gateway runtime configuration.

use std::time::Duration;

use shardgate_settings::ServerSettings;

/// Configuration for the gateway server.
#[derive(Clone, Debug)]
pub struct GatewayConfig {
    /// Host to bind.
    pub host: String,
    /// Port to bind (`0` for auto-assign).
    pub port: u16,
    /// Maximum concurrent WebSocket connections, handshaking ones included.
    pub max_connections: usize,
    /// Bound on the AUTHENTICATING state.
    pub handshake_timeout: Duration,
    /// Ping cadence.
    pub heartbeat_interval: Duration,
    /// Disconnect after this long without a pong or any frame.
    pub heartbeat_timeout: Duration,
    /// Max inbound WebSocket message size in bytes.
    pub max_message_size: usize,
    /// Per-connection outbound queue.
    pub send_queue_capacity: usize,
    /// Deadline for a routed command's RESPONSE.
    pub command_timeout: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            max_connections: 1000,
            handshake_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(60),
            max_message_size: 1024 * 1024, // 1 MiB
            send_queue_capacity: 256,
            command_timeout: Duration::from_secs(60),
        }
    }
}

impl From<&ServerSettings> for GatewayConfig {
    fn from(s: &ServerSettings) -> Self {
        Self {
            host: s.host.clone(),
            port: s.port,
            max_connections: s.max_connections,
            handshake_timeout: s.handshake_timeout(),
            heartbeat_interval: s.heartbeat_interval(),
            heartbeat_timeout: s.heartbeat_timeout(),
            max_message_size: s.max_message_size,
            send_queue_capacity: s.send_queue_capacity,
            command_timeout: s.command_timeout(),
        }
    }
}

impl GatewayConfig {
    /// `host:port` for binding.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_binds_ephemeral_localhost() {
        let cfg = GatewayConfig::default();
        assert_eq!(cfg.bind_addr(), "127.0.0.1:0");
    }

    #[test]
    fn from_settings_converts_units() {
        let settings = ServerSettings {
            handshake_timeout_ms: 1500,
            heartbeat_interval_secs: 5,
            command_timeout_ms: 250,
            ..ServerSettings::default()
        };
        let cfg = GatewayConfig::from(&settings);
        assert_eq!(cfg.handshake_timeout, Duration::from_millis(1500));
        assert_eq!(cfg.heartbeat_interval, Duration::from_secs(5));
        assert_eq!(cfg.command_timeout, Duration::from_millis(250));
        assert_eq!(cfg.port, settings.port);
    }
}
