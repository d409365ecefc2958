//! Settings structs.
//!
//! Every struct is `#[serde(default)]` so a partial JSON file only needs the
//! keys it changes. Field names are camelCase on disk.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use shardgate_core::ClientType;
use shardgate_core::backoff::BackoffConfig;

use crate::errors::{Result, SettingsError};

/// Root settings object.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GatewaySettings {
    /// HTTP / WebSocket listener.
    pub server: ServerSettings,
    /// Broker adapter.
    pub broker: BrokerSettings,
    /// Correlation registry.
    pub correlation: CorrelationSettings,
    /// Shard admission.
    pub shards: ShardSettings,
    /// Optional Redis backing for durable context and capacity counters.
    pub redis: RedisSettings,
    /// Subscriber setup.
    pub logging: LoggingSettings,
    /// Development token table.
    pub auth: AuthSettings,
}

impl GatewaySettings {
    /// Reject out-of-range values.
    pub fn validate(&self) -> Result<()> {
        let s = &self.server;
        if s.host.trim().is_empty() {
            return Err(invalid("server.host must not be empty"));
        }
        positive("server.maxConnections", s.max_connections as u64)?;
        positive("server.handshakeTimeoutMs", s.handshake_timeout_ms)?;
        positive("server.heartbeatIntervalSecs", s.heartbeat_interval_secs)?;
        positive("server.heartbeatTimeoutSecs", s.heartbeat_timeout_secs)?;
        if s.heartbeat_timeout_secs < s.heartbeat_interval_secs {
            return Err(invalid(
                "server.heartbeatTimeoutSecs must be at least server.heartbeatIntervalSecs",
            ));
        }
        positive("server.maxMessageSize", s.max_message_size as u64)?;
        positive("server.sendQueueCapacity", s.send_queue_capacity as u64)?;
        positive("server.commandTimeoutMs", s.command_timeout_ms)?;

        positive("broker.rpcTimeoutMs", self.broker.rpc_timeout_ms)?;
        let r = &self.broker.reconnect;
        positive("broker.reconnect.baseDelayMs", r.base_delay_ms)?;
        if r.max_delay_ms < r.base_delay_ms {
            return Err(invalid("broker.reconnect.maxDelayMs must be at least baseDelayMs"));
        }
        if !(0.0..=1.0).contains(&r.jitter_factor) {
            return Err(invalid("broker.reconnect.jitterFactor must be within [0, 1]"));
        }

        positive("correlation.contextTtlSecs", self.correlation.context_ttl_secs)?;
        positive(
            "shards.inactivityThresholdHours",
            self.shards.inactivity_threshold_hours,
        )?;
        for seed in &self.shards.seed {
            if seed.shard_id.trim().is_empty() {
                return Err(invalid("shards.seed entries need a shardId"));
            }
        }

        if self.redis.url.as_deref().is_some_and(|u| u.trim().is_empty()) {
            return Err(invalid("redis.url must not be empty when set"));
        }
        if self.broker.url.as_deref().is_some_and(|u| u.trim().is_empty()) {
            return Err(invalid("broker.url must not be empty when set"));
        }
        Ok(())
    }

    /// `host:port` for the listener.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

fn invalid(msg: &str) -> SettingsError {
    SettingsError::InvalidValue(msg.to_owned())
}

fn positive(key: &str, value: u64) -> Result<()> {
    if value == 0 {
        return Err(SettingsError::InvalidValue(format!("{key} must be greater than zero")));
    }
    Ok(())
}

/// HTTP / WebSocket listener settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Bind port; `0` picks an ephemeral port.
    pub port: u16,
    /// Maximum concurrent WebSocket sessions.
    pub max_connections: usize,
    /// Bound on the AUTHENTICATING state.
    pub handshake_timeout_ms: u64,
    /// Ping cadence.
    pub heartbeat_interval_secs: u64,
    /// Disconnect after this long without pong or inbound traffic.
    pub heartbeat_timeout_secs: u64,
    /// Inbound frame size limit in bytes.
    pub max_message_size: usize,
    /// Per-connection outbound queue length.
    pub send_queue_capacity: usize,
    /// Deadline for a pending client command.
    pub command_timeout_ms: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
            max_connections: 1000,
            handshake_timeout_ms: 10_000,
            heartbeat_interval_secs: 30,
            heartbeat_timeout_secs: 60,
            max_message_size: 1024 * 1024,
            send_queue_capacity: 256,
            command_timeout_ms: 60_000,
        }
    }
}

impl ServerSettings {
    /// Handshake bound as a `Duration`.
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// Ping interval as a `Duration`.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    /// Liveness cut-off as a `Duration`.
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    /// Command deadline as a `Duration`.
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

/// Broker adapter settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BrokerSettings {
    /// `amqp://` URL; unset runs the in-process broker.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Default `call_rpc` timeout.
    pub rpc_timeout_ms: u64,
    /// Consume-loop reconnect backoff.
    pub reconnect: BackoffConfig,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            url: None,
            rpc_timeout_ms: 5_000,
            reconnect: BackoffConfig::default(),
        }
    }
}

impl BrokerSettings {
    /// RPC timeout as a `Duration`.
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }
}

/// Correlation registry settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CorrelationSettings {
    /// TTL of durable pending-request context.
    pub context_ttl_secs: u64,
}

impl Default for CorrelationSettings {
    fn default() -> Self {
        Self {
            context_ttl_secs: 300,
        }
    }
}

impl CorrelationSettings {
    /// Context TTL as a `Duration`.
    pub fn context_ttl(&self) -> Duration {
        Duration::from_secs(self.context_ttl_secs)
    }
}

/// Shard admission settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ShardSettings {
    /// Bindings idle longer than this are evictable.
    pub inactivity_threshold_hours: u64,
    /// Shards registered at startup.
    pub seed: Vec<ShardSeed>,
}

impl Default for ShardSettings {
    fn default() -> Self {
        Self {
            inactivity_threshold_hours: 24,
            seed: Vec::new(),
        }
    }
}

impl ShardSettings {
    /// Inactivity threshold as a `Duration`.
    pub fn inactivity_threshold(&self) -> Duration {
        Duration::from_secs(self.inactivity_threshold_hours.saturating_mul(3600))
    }
}

/// Shard definition in the settings file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShardSeed {
    /// Stable shard id.
    pub shard_id: String,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Hard capacity ceiling.
    pub max_players: u32,
    /// Whether the shard accepts assignments.
    #[serde(default = "default_true")]
    pub is_active: bool,
}

fn default_true() -> bool {
    true
}

/// Redis connection settings.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RedisSettings {
    /// `redis://` URL; unset keeps everything in memory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// Logging settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of the compact format.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Development authentication settings.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AuthSettings {
    /// Token → identity table answered by the in-process validator. Empty
    /// disables it so an external auth worker can serve the queue.
    pub static_tokens: BTreeMap<String, StaticToken>,
}

/// Identity granted to a static token.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StaticToken {
    /// Client id bound on success.
    pub client_id: String,
    /// Client type the token is valid for.
    pub client_type: ClientType,
}
