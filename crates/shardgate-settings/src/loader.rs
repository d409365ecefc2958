//! Settings loading.
//!
//! Loading flow:
//! 1. Start with compiled [`GatewaySettings::default()`]
//! 2. If the config file exists, merge its values over the defaults
//! 3. Apply `SHARDGATE_*` environment overrides
//! 4. Validate
//!
//! Figment merges objects per key and replaces arrays and scalars, so a
//! partial file only overrides what it names.

use std::path::Path;

use figment::Figment;
use figment::providers::{Format, Json, Serialized};
use tracing::{debug, warn};

use crate::errors::Result;
use crate::types::GatewaySettings;

/// Load settings from an optional JSON file, then env, then validate.
///
/// A missing file is not an error; defaults are used.
pub fn load_settings(path: Option<&Path>) -> Result<GatewaySettings> {
    let mut figment = Figment::from(Serialized::defaults(GatewaySettings::default()));

    if let Some(path) = path {
        if path.exists() {
            debug!(?path, "loading settings from file");
            let content = std::fs::read_to_string(path)?;
            figment = figment.merge(Json::string(&content));
        } else {
            debug!(?path, "settings file not found, using defaults");
        }
    }

    let mut settings: GatewaySettings = figment.extract()?;
    apply_env_overrides(&mut settings);
    settings.validate()?;
    Ok(settings)
}

/// Apply overrides from the process environment.
pub fn apply_env_overrides(settings: &mut GatewaySettings) {
    apply_env_overrides_from(settings, |name| std::env::var(name).ok());
}

/// Apply overrides read through `lookup`.
///
/// Invalid values are logged and ignored, leaving the file/default value.
pub fn apply_env_overrides_from<F>(settings: &mut GatewaySettings, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let env = EnvReader { lookup };

    // ── Server ──────────────────────────────────────────────────────
    if let Some(v) = env.string("SHARDGATE_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = env.number::<u16>("SHARDGATE_PORT", 0, u64::from(u16::MAX)) {
        settings.server.port = v;
    }
    if let Some(v) = env.number::<usize>("SHARDGATE_MAX_CONNECTIONS", 1, 1_000_000) {
        settings.server.max_connections = v;
    }
    if let Some(v) = env.number::<u64>("SHARDGATE_HANDSHAKE_TIMEOUT_MS", 100, 600_000) {
        settings.server.handshake_timeout_ms = v;
    }
    if let Some(v) = env.number::<u64>("SHARDGATE_HEARTBEAT_INTERVAL_SECS", 1, 3600) {
        settings.server.heartbeat_interval_secs = v;
    }
    if let Some(v) = env.number::<u64>("SHARDGATE_HEARTBEAT_TIMEOUT_SECS", 1, 7200) {
        settings.server.heartbeat_timeout_secs = v;
    }
    if let Some(v) = env.number::<u64>("SHARDGATE_COMMAND_TIMEOUT_MS", 100, 3_600_000) {
        settings.server.command_timeout_ms = v;
    }

    // ── Broker / correlation ────────────────────────────────────────
    if let Some(v) = env.string("SHARDGATE_BROKER_URL") {
        settings.broker.url = Some(v);
    }
    if let Some(v) = env.number::<u64>("SHARDGATE_RPC_TIMEOUT_MS", 100, 600_000) {
        settings.broker.rpc_timeout_ms = v;
    }
    if let Some(v) = env.number::<u64>("SHARDGATE_CONTEXT_TTL_SECS", 1, 86_400) {
        settings.correlation.context_ttl_secs = v;
    }

    // ── Shards ──────────────────────────────────────────────────────
    if let Some(v) = env.number::<u64>("SHARDGATE_INACTIVITY_THRESHOLD_HOURS", 1, 24 * 365) {
        settings.shards.inactivity_threshold_hours = v;
    }

    // ── Redis / logging ─────────────────────────────────────────────
    if let Some(v) = env.string("SHARDGATE_REDIS_URL") {
        settings.redis.url = Some(v);
    }
    if let Some(v) = env.string("SHARDGATE_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = env.boolean("SHARDGATE_LOG_JSON") {
        settings.logging.json = v;
    }
}

/// Parse a boolean env value.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

struct EnvReader<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> EnvReader<F> {
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.is_empty())
    }

    fn boolean(&self, name: &str) -> Option<bool> {
        let val = (self.lookup)(name)?;
        let result = parse_bool(&val);
        if result.is_none() {
            warn!(key = name, value = %val, "invalid boolean env var, ignoring");
        }
        result
    }

    fn number<T>(&self, name: &str, min: u64, max: u64) -> Option<T>
    where
        T: TryFrom<u64>,
    {
        let val = (self.lookup)(name)?;
        let result = val
            .trim()
            .parse::<u64>()
            .ok()
            .filter(|n| (min..=max).contains(n))
            .and_then(|n| T::try_from(n).ok());
        if result.is_none() {
            warn!(key = name, value = %val, min, max, "invalid numeric env var, ignoring");
        }
        result
    }
}
