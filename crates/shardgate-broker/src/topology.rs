//! Broker topology declared at connect time.

use std::collections::BTreeMap;

use shardgate_core::routing::{COMMANDS_EXCHANGE, EVENTS_EXCHANGE};
use shardgate_core::{GatewayError, Result};

/// Auth token validation RPC queue.
pub const AUTH_VALIDATE_TOKEN_RPC: &str = "auth_validate_token_rpc";
/// Bot token issuance RPC queue.
pub const AUTH_ISSUE_BOT_TOKEN_RPC: &str = "auth_issue_bot_token_rpc";
/// Auth worker command queue.
pub const AUTH_COMMANDS: &str = "auth_commands";
/// Coordinator worker command queue.
pub const COORDINATOR_COMMANDS: &str = "coordinator_commands";
/// System, shard and discord command queue.
pub const SYSTEM_COMMANDS: &str = "system_commands";
/// Responses for the gateway's outbound dispatcher.
pub const GATEWAY_RESPONSES: &str = "gateway_responses";
/// Events for the gateway's broadcaster.
pub const GATEWAY_EVENTS: &str = "gateway_events";
/// System notifications for the gateway.
pub const GATEWAY_NOTIFICATIONS: &str = "gateway_notifications";

/// Exchange routing style.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExchangeKind {
    /// Pattern bindings with `*` / `#`.
    Topic,
    /// Exact routing-key bindings.
    Direct,
}

/// Exchange declaration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExchangeDecl {
    /// Exchange name.
    pub name: String,
    /// Routing style.
    pub kind: ExchangeKind,
}

/// Queue declaration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueDecl {
    /// Queue name.
    pub name: String,
}

/// Queue bound to an exchange by pattern.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BindingDecl {
    /// Bound queue.
    pub queue: String,
    /// Source exchange.
    pub exchange: String,
    /// Binding key or topic pattern.
    pub pattern: String,
}

/// Full set of declarations.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Topology {
    /// Exchanges.
    pub exchanges: Vec<ExchangeDecl>,
    /// Queues.
    pub queues: Vec<QueueDecl>,
    /// Bindings.
    pub bindings: Vec<BindingDecl>,
}

impl Topology {
    /// Empty topology.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an exchange.
    #[must_use]
    pub fn exchange(mut self, name: &str, kind: ExchangeKind) -> Self {
        self.exchanges.push(ExchangeDecl {
            name: name.to_owned(),
            kind,
        });
        self
    }

    /// Add a queue.
    #[must_use]
    pub fn queue(mut self, name: &str) -> Self {
        self.queues.push(QueueDecl {
            name: name.to_owned(),
        });
        self
    }

    /// Bind `queue` to `exchange` with `pattern`.
    #[must_use]
    pub fn bind(mut self, queue: &str, exchange: &str, pattern: &str) -> Self {
        self.bindings.push(BindingDecl {
            queue: queue.to_owned(),
            exchange: exchange.to_owned(),
            pattern: pattern.to_owned(),
        });
        self
    }

    /// The gateway's standard topology.
    pub fn gateway() -> Self {
        Self::new()
            .exchange(COMMANDS_EXCHANGE, ExchangeKind::Topic)
            .exchange(EVENTS_EXCHANGE, ExchangeKind::Topic)
            .queue(AUTH_VALIDATE_TOKEN_RPC)
            .queue(AUTH_ISSUE_BOT_TOKEN_RPC)
            .queue(AUTH_COMMANDS)
            .queue(COORDINATOR_COMMANDS)
            .queue(SYSTEM_COMMANDS)
            .queue(GATEWAY_RESPONSES)
            .queue(GATEWAY_EVENTS)
            .queue(GATEWAY_NOTIFICATIONS)
            .bind(AUTH_COMMANDS, COMMANDS_EXCHANGE, "command.auth.#")
            .bind(COORDINATOR_COMMANDS, COMMANDS_EXCHANGE, "command.coordinator.#")
            .bind(SYSTEM_COMMANDS, COMMANDS_EXCHANGE, "command.system.#")
            .bind(SYSTEM_COMMANDS, COMMANDS_EXCHANGE, "command.shard.#")
            .bind(SYSTEM_COMMANDS, COMMANDS_EXCHANGE, "command.discord.#")
            .bind(GATEWAY_RESPONSES, EVENTS_EXCHANGE, "response.#")
            .bind(GATEWAY_EVENTS, EVENTS_EXCHANGE, "event.#")
            .bind(GATEWAY_NOTIFICATIONS, EVENTS_EXCHANGE, "system.notification.#")
    }

    /// Check that every binding names a declared queue and exchange.
    pub fn validate(&self) -> Result<()> {
        for b in &self.bindings {
            if !self.queues.iter().any(|q| q.name == b.queue) {
                return Err(GatewayError::invalid_params(format!(
                    "binding '{}' references undeclared queue '{}'",
                    b.pattern, b.queue
                )));
            }
            if !self.exchanges.iter().any(|e| e.name == b.exchange) {
                return Err(GatewayError::invalid_params(format!(
                    "binding '{}' references undeclared exchange '{}'",
                    b.pattern, b.exchange
                )));
            }
        }
        Ok(())
    }

    /// Command domains served by a queue, from `command.<domain>.#`
    /// bindings on the commands exchange.
    pub fn command_domains(&self) -> BTreeMap<String, String> {
        self.bindings
            .iter()
            .filter(|b| b.exchange == COMMANDS_EXCHANGE)
            .filter_map(|b| {
                let mut words = b.pattern.split('.');
                match (words.next(), words.next(), words.next(), words.next()) {
                    (Some("command"), Some(domain), Some("#"), None)
                        if !domain.contains(['*', '#']) =>
                    {
                        Some((domain.to_owned(), b.queue.clone()))
                    }
                    _ => None,
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gateway_topology_is_consistent() {
        let topo = Topology::gateway();
        topo.validate().unwrap();
        assert_eq!(topo.exchanges.len(), 2);
        assert_eq!(topo.queues.len(), 8);
    }

    #[test]
    fn command_domains_from_bindings() {
        let domains = Topology::gateway().command_domains();
        assert_eq!(
            domains.keys().map(String::as_str).collect::<Vec<_>>(),
            ["auth", "coordinator", "discord", "shard", "system"]
        );
        assert_eq!(domains["shard"], SYSTEM_COMMANDS);
        assert_eq!(domains["auth"], AUTH_COMMANDS);
    }

    #[test]
    fn wildcard_domain_bindings_are_not_domains() {
        let topo = Topology::new()
            .exchange(COMMANDS_EXCHANGE, ExchangeKind::Topic)
            .queue("all")
            .bind("all", COMMANDS_EXCHANGE, "command.*.#")
            .bind("all", COMMANDS_EXCHANGE, "command.#");
        assert!(topo.command_domains().is_empty());
    }

    #[test]
    fn undeclared_queue_is_rejected() {
        let topo = Topology::new()
            .exchange(EVENTS_EXCHANGE, ExchangeKind::Topic)
            .bind("ghost", EVENTS_EXCHANGE, "event.#");
        assert!(topo.validate().is_err());
    }
}
